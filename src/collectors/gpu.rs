use indexmap::IndexMap;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};
use tracing::{debug, info, warn};

use super::Collector;
use super::process::{self, GpuProcess};
use crate::error::CollectError;
use crate::metrics::{Collection, DeviceReading, ErrorInfo, GPUIndex};

pub(crate) const MIB: u64 = 1024 * 1024;
pub(crate) const NOT_AVAILABLE: &str = "N/A";

/// Reads devices and their processes through NVML.
pub struct NvmlCollector {
    nvml: Nvml,
}

impl NvmlCollector {
    pub fn init() -> Result<Self, CollectError> {
        let nvml = Nvml::init().map_err(CollectError::Init)?;
        info!("NVML initialized");
        Ok(Self { nvml })
    }
}

impl Collector for NvmlCollector {
    fn collect(&self) -> Result<Collection, CollectError> {
        let device_count = self.nvml.device_count().map_err(CollectError::Query)?;
        let mut errors = Vec::new();

        let driver_version = match self.nvml.sys_driver_version() {
            Ok(version) => version,
            Err(e) => {
                warn!("Failed to read driver version: {}", e);
                errors.push(ErrorInfo::new(None, "driver", e));
                NOT_AVAILABLE.to_string()
            }
        };
        let cuda_version = match self.nvml.sys_cuda_driver_version() {
            Ok(version) => format_cuda_version(version),
            Err(e) => {
                warn!("Failed to read CUDA version: {}", e);
                errors.push(ErrorInfo::new(None, "cuda", e));
                NOT_AVAILABLE.to_string()
            }
        };

        let mut gpus = IndexMap::new();
        let mut gpu_processes: Vec<(String, Vec<GpuProcess>)> = Vec::new();

        for index in 0..device_count {
            let device = match self.nvml.device_by_index(index) {
                Ok(dev) => dev,
                Err(e) => {
                    warn!(gpu = index, "Failed to open device: {}", e);
                    errors.push(ErrorInfo::new(Some(index), "gpu", e));
                    continue;
                }
            };

            let reading = match read_device(&device, index, &driver_version, &cuda_version) {
                Ok(reading) => reading,
                Err(e) => {
                    warn!(gpu = index, "Dropping unreadable device: {}", e);
                    errors.push(ErrorInfo::new(Some(index), "gpu", e));
                    continue;
                }
            };

            let key = index.to_string();
            match process::running_processes(&device) {
                Ok(procs) => gpu_processes.push((key.clone(), procs)),
                Err(e) => {
                    warn!(gpu = index, "Failed to list processes: {}", e);
                    errors.push(ErrorInfo::new(Some(index), "process", e));
                }
            }
            gpus.insert(key, reading);
        }

        let pids: Vec<u32> = gpu_processes
            .iter()
            .flat_map(|(_, procs)| procs.iter().map(|p| p.pid))
            .collect();

        let system = process::host_processes(&pids);

        for (key, procs) in gpu_processes {
            if let Some(reading) = gpus.get_mut(&key) {
                for gpu_proc in procs {
                    let described = process::describe(&system, reading.index, &gpu_proc);
                    reading.processes.insert(gpu_proc.pid, described);
                }
            }
        }

        debug!(
            devices = gpus.len(),
            processes = pids.len(),
            errors = errors.len(),
            "NVML collection finished"
        );
        Ok(Collection { gpus, errors })
    }
}

fn read_device(
    device: &Device,
    index: GPUIndex,
    driver_version: &str,
    cuda_version: &str,
) -> Result<DeviceReading, NvmlError> {
    let name = device.name()?;
    let memory = device.memory_info()?;
    let utilization = device.utilization_rates()?;
    let temperature_gpu = device.temperature(TemperatureSensor::Gpu)?;

    // Passively cooled boards report no fan.
    let fan_speed = device.fan_speed(0).map(f64::from).unwrap_or(f64::NAN);

    Ok(DeviceReading {
        index,
        name,
        fan_speed,
        temperature_gpu,
        power_draw: device
            .power_usage()
            .map(milliwatts_to_watts)
            .unwrap_or(f64::NAN),
        power_limit: device
            .enforced_power_limit()
            .map(milliwatts_to_watts)
            .unwrap_or(f64::NAN),
        memory_used: memory.used / MIB,
        memory_total: memory.total / MIB,
        utilization_gpu: utilization.gpu,
        pcie_width_current: device.current_pcie_link_width().unwrap_or(0),
        pcie_gen_current: device.current_pcie_link_gen().unwrap_or(0),
        driver_version: driver_version.to_string(),
        cuda_version: cuda_version.to_string(),
        processes: IndexMap::new(),
    })
}

fn milliwatts_to_watts(milliwatts: u32) -> f64 {
    f64::from(milliwatts) / 1000.0
}

/// NVML encodes the CUDA driver version as `major * 1000 + minor * 10`.
fn format_cuda_version(version: i32) -> String {
    format!("{}.{}", version / 1000, (version % 1000) / 10)
}
