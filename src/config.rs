use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::collectors::{Collector, FixtureCollector, NvmlCollector};
use crate::mode::CollectorMode;

#[derive(Parser, Debug)]
#[command(name = "GPUScope Agent")]
#[command(about = "Serves point-in-time GPU and GPU process status over HTTP", long_about = None)]
pub struct Cli {
    /// IP address to bind (v4 or v6)
    #[arg(long, env = "GPUSCOPE_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "GPUSCOPE_PORT", default_value_t = 81)]
    pub port: u16,

    /// Source of GPU readings
    #[arg(long, value_enum, env = "GPUSCOPE_COLLECTOR", default_value_t = CollectorMode::Nvml)]
    pub collector: CollectorMode,

    /// JSON collection replayed by the fixture collector
    #[arg(long, env = "GPUSCOPE_FIXTURE")]
    pub fixture: Option<PathBuf>,
}

impl Cli {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn build_collector(&self) -> Result<Arc<dyn Collector>> {
        match self.collector {
            CollectorMode::Nvml => {
                let collector = NvmlCollector::init().context("NVML collector unavailable")?;
                Ok(Arc::new(collector))
            }
            CollectorMode::Fixture => {
                let Some(path) = &self.fixture else {
                    bail!("--fixture is required with --collector fixture");
                };
                Ok(Arc::new(FixtureCollector::new(path)))
            }
        }
    }
}
