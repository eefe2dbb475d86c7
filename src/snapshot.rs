use std::collections::HashMap;
use std::fmt::Display;

use chrono::{DateTime, TimeZone};
use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use crate::error::{IngestError, SnapshotError};
use crate::metrics::{
    Collection, DeviceReading, GPUIndex, GpuEntry, ProcEntry, ProcessReading, Snapshot,
    VersionField,
};

/// `Mon Jan 08 14:03:22 2024`
pub const TIMESTAMP_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

pub fn format_timestamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Builds a snapshot stamped with the local wall clock.
pub fn build_snapshot(collection: Collection) -> Result<Snapshot, SnapshotError> {
    build_snapshot_at(collection, &chrono::Local::now())
}

/// Turns one collector pass into a snapshot taken at `at`.
///
/// Fails with [`SnapshotError::NoDevicesFound`] when the collection holds no
/// devices, whatever errors it carries: an empty fleet is never reported as
/// healthy. Collector errors are passed through untouched.
pub fn build_snapshot_at<Tz>(
    collection: Collection,
    at: &DateTime<Tz>,
) -> Result<Snapshot, SnapshotError>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let Collection { gpus, errors } = collection;
    if gpus.is_empty() {
        return Err(SnapshotError::NoDevicesFound);
    }
    validate(&gpus)?;

    let datetime_str = format_timestamp(at);
    let devices: Vec<DeviceReading> = gpus.into_values().collect();

    let driver_version = reconcile(devices.iter().map(|d| d.driver_version.as_str()));
    let cuda_version = reconcile(devices.iter().map(|d| d.cuda_version.as_str()));

    let proc_info_list: Vec<ProcEntry> = devices
        .iter()
        .flat_map(|d| d.processes.values())
        .enumerate()
        .map(|(global_index, proc)| proc_entry(global_index, proc))
        .collect();

    let gpu_info_list: Vec<GpuEntry> = devices.iter().map(gpu_entry).collect();

    debug!(
        gpus = gpu_info_list.len(),
        processes = proc_info_list.len(),
        errors = errors.len(),
        "built snapshot"
    );

    Ok(Snapshot {
        datetime_str,
        driver_version,
        cuda_version,
        gpu_info_list,
        proc_info_list,
        err_infos: errors,
    })
}

fn validate(gpus: &IndexMap<String, DeviceReading>) -> Result<(), IngestError> {
    let mut seen: HashMap<GPUIndex, &str> = HashMap::with_capacity(gpus.len());
    for (key, device) in gpus {
        if let Some(first) = seen.insert(device.index, key.as_str()) {
            return Err(IngestError::DuplicateDeviceIndex {
                index: device.index,
                first: first.to_string(),
                second: key.clone(),
            });
        }
        if let Some(proc) = device
            .processes
            .values()
            .find(|p| p.gpu_index != device.index)
        {
            return Err(IngestError::ProcessDeviceMismatch {
                pid: proc.pid,
                device: device.index,
                claimed: proc.gpu_index,
            });
        }
    }
    Ok(())
}

// Distinct values in first-seen order. Callers guarantee at least one value.
fn reconcile<'a>(values: impl Iterator<Item = &'a str>) -> VersionField {
    let distinct: IndexSet<&str> = values.collect();
    if distinct.len() == 1 {
        VersionField::Single(distinct[0].to_string())
    } else {
        VersionField::Mixed(distinct.into_iter().map(str::to_string).collect())
    }
}

/// NaN becomes `None` so the serialized form carries an explicit null.
pub fn nan_to_none(value: f64) -> Option<f64> {
    if value.is_nan() { None } else { Some(value) }
}

fn gpu_entry(device: &DeviceReading) -> GpuEntry {
    GpuEntry {
        index: device.index,
        name: device.name.clone(),
        fan_speed: nan_to_none(device.fan_speed),
        temperature_gpu: device.temperature_gpu,
        power_draw: device.power_draw,
        power_limit: device.power_limit,
        memory_used: device.memory_used,
        memory_total: device.memory_total,
        utilization_gpu: device.utilization_gpu,
        pcie_width_current: device.pcie_width_current,
        pcie_gen_current: device.pcie_gen_current,
    }
}

fn proc_entry(global_index: usize, proc: &ProcessReading) -> ProcEntry {
    ProcEntry {
        global_index,
        gpu_index: proc.gpu_index,
        container_name: proc.container_name.clone(),
        proc_start_time: proc.proc_start_time.clone(),
        proc_running_time: proc.proc_running_time,
        pid: proc.pid,
        pid_in_container: proc.pid_in_container,
        process_name: proc.process_name.clone(),
        gpu_memory_used: proc.gpu_memory_used,
        main_memory_used: proc.main_memory_used,
        command: proc.command.clone(),
    }
}
