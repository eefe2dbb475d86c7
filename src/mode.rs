use clap::ValueEnum;

/// Where raw readings come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CollectorMode {
    Nvml,
    Fixture,
}
