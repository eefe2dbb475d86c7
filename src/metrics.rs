use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

pub type Pid = u32;
pub type GPUIndex = u32;

/// Raw output of one collector pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collection {
    /// Devices keyed by collector-chosen key, in listing order.
    pub gpus: IndexMap<String, DeviceReading>,
    #[serde(default)]
    pub errors: Vec<ErrorInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReading {
    pub index: GPUIndex,
    pub name: String,
    /// Percent. NaN when the device has no readable fan.
    #[serde(deserialize_with = "nan_if_null")]
    pub fan_speed: f64,
    pub temperature_gpu: u32,
    /// Watts. NaN when unreadable.
    #[serde(deserialize_with = "nan_if_null")]
    pub power_draw: f64,
    /// Watts. NaN when unreadable.
    #[serde(deserialize_with = "nan_if_null")]
    pub power_limit: f64,
    /// MiB.
    pub memory_used: u64,
    /// MiB.
    pub memory_total: u64,
    pub utilization_gpu: u32,
    pub pcie_width_current: u32,
    pub pcie_gen_current: u32,
    pub driver_version: String,
    pub cuda_version: String,
    #[serde(default)]
    pub processes: IndexMap<Pid, ProcessReading>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReading {
    pub gpu_index: GPUIndex,
    pub container_name: Option<String>,
    pub proc_start_time: String,
    /// Seconds.
    pub proc_running_time: u64,
    pub pid: Pid,
    pub pid_in_container: Option<Pid>,
    pub process_name: String,
    /// MiB.
    pub gpu_memory_used: u64,
    /// MiB, resident set.
    pub main_memory_used: u64,
    pub command: String,
}

/// A partial failure reported by a collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub gpu_index: Option<GPUIndex>,
    pub source: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(gpu_index: Option<GPUIndex>, source: &str, message: impl ToString) -> Self {
        Self {
            gpu_index,
            source: source.to_string(),
            message: message.to_string(),
        }
    }
}

/// A version reconciled across devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum VersionField {
    Single(String),
    Mixed(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub datetime_str: String,
    pub driver_version: VersionField,
    pub cuda_version: VersionField,
    pub gpu_info_list: Vec<GpuEntry>,
    pub proc_info_list: Vec<ProcEntry>,
    pub err_infos: Vec<ErrorInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuEntry {
    pub index: GPUIndex,
    pub name: String,
    pub fan_speed: Option<f64>,
    pub temperature_gpu: u32,
    pub power_draw: f64,
    pub power_limit: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub utilization_gpu: u32,
    pub pcie_width_current: u32,
    pub pcie_gen_current: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcEntry {
    pub global_index: usize,
    pub gpu_index: GPUIndex,
    pub container_name: Option<String>,
    pub proc_start_time: String,
    pub proc_running_time: u64,
    pub pid: Pid,
    pub pid_in_container: Option<Pid>,
    pub process_name: String,
    pub gpu_memory_used: u64,
    pub main_memory_used: u64,
    pub command: String,
}

// serde_json writes NaN as `null`; read it back as NaN.
fn nan_if_null<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}
