use std::fs;

use chrono::{DateTime, Local};
use indexmap::IndexMap;
use nvml_wrapper::Device;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use super::gpu::{MIB, NOT_AVAILABLE};
use crate::metrics::{GPUIndex, Pid, ProcessReading};
use crate::snapshot::format_timestamp;

/// A process holding memory on one device, as NVML reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuProcess {
    pub pid: Pid,
    pub used_bytes: u64,
}

/// Lists compute and graphics processes on `device`, one entry per pid.
///
/// A pid present in both lists has its memory summed; order is first seen,
/// compute processes first.
pub fn running_processes(device: &Device) -> Result<Vec<GpuProcess>, NvmlError> {
    let mut by_pid: IndexMap<Pid, u64> = IndexMap::new();

    let compute = device.running_compute_processes()?;
    let graphics = device.running_graphics_processes()?;

    for proc_info in compute.iter().chain(graphics.iter()) {
        let memory = match proc_info.used_gpu_memory {
            UsedGpuMemory::Used(bytes) => bytes,
            UsedGpuMemory::Unavailable => 0,
        };
        *by_pid.entry(proc_info.pid).or_insert(0) += memory;
    }

    Ok(by_pid
        .into_iter()
        .map(|(pid, used_bytes)| GpuProcess { pid, used_bytes })
        .collect())
}

/// Host process table holding only the given pids.
///
/// Built fresh per collection so processes that left the GPU are not kept
/// around. Name, start time and run time come with every refresh.
pub fn host_processes(pids: &[Pid]) -> System {
    let targets: Vec<sysinfo::Pid> = pids.iter().map(|&p| sysinfo::Pid::from_u32(p)).collect();
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&targets),
        true,
        ProcessRefreshKind::nothing()
            .with_memory()
            .with_cmd(UpdateKind::OnlyIfNotSet)
            .with_exe(UpdateKind::OnlyIfNotSet),
    );
    system
}

/// Joins NVML's view of a process with what the host knows about it.
///
/// Processes outside our pid namespace are invisible to the host table and
/// keep empty names and zero host memory.
pub fn describe(system: &System, gpu_index: GPUIndex, gpu_proc: &GpuProcess) -> ProcessReading {
    let pid = gpu_proc.pid;
    let host = system.process(sysinfo::Pid::from_u32(pid));

    let process_name = host
        .map(|p| p.name().to_string_lossy().into_owned())
        .unwrap_or_default();
    let command = host
        .map(|p| {
            p.cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    let proc_start_time = host
        .map(|p| p.start_time())
        .and_then(format_start_time)
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());

    ProcessReading {
        gpu_index,
        container_name: read_container_id(pid),
        proc_start_time,
        proc_running_time: host.map(|p| p.run_time()).unwrap_or(0),
        pid,
        pid_in_container: read_pid_in_container(pid),
        process_name,
        gpu_memory_used: gpu_proc.used_bytes / MIB,
        main_memory_used: host.map(|p| p.memory() / MIB).unwrap_or(0),
        command,
    }
}

fn format_start_time(epoch_secs: u64) -> Option<String> {
    if epoch_secs == 0 {
        return None;
    }
    let started = DateTime::from_timestamp(i64::try_from(epoch_secs).ok()?, 0)?;
    Some(format_timestamp(&started.with_timezone(&Local)))
}

fn read_container_id(pid: Pid) -> Option<String> {
    let cgroup = fs::read_to_string(format!("/proc/{}/cgroup", pid)).ok()?;
    container_id_from_cgroup(&cgroup)
}

fn read_pid_in_container(pid: Pid) -> Option<Pid> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    pid_in_container_from_status(&status)
}

const CONTAINER_PREFIXES: [&str; 4] = ["docker-", "cri-containerd-", "crio-", "libpod-"];

/// Short (12 char) id of the container owning a process, if any.
///
/// Handles cgroup v1 (`12:memory:/docker/<id>`) and v2 systemd scopes
/// (`0::/system.slice/docker-<id>.scope`), including kubepods nesting.
fn container_id_from_cgroup(cgroup: &str) -> Option<String> {
    for line in cgroup.lines() {
        // hierarchy:controllers:path
        let Some(path) = line.splitn(3, ':').nth(2) else {
            continue;
        };
        for segment in path.rsplit('/') {
            let segment = segment.strip_suffix(".scope").unwrap_or(segment);
            let id = CONTAINER_PREFIXES
                .iter()
                .find_map(|prefix| segment.strip_prefix(prefix))
                .unwrap_or(segment);
            if id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit()) {
                return Some(id[..12].to_string());
            }
        }
    }
    None
}

/// Innermost pid from the `NSpid` line, when the process lives in a nested
/// pid namespace.
fn pid_in_container_from_status(status: &str) -> Option<Pid> {
    let rest = status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))?;
    let pids: Vec<Pid> = rest
        .split_whitespace()
        .filter_map(|p| p.parse().ok())
        .collect();
    if pids.len() > 1 { pids.last().copied() } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKER_ID: &str = "3f4e1a2b9c0d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c8d9e0f";

    #[test]
    fn detects_docker_on_cgroup_v1() {
        let cgroup = format!(
            "12:pids:/docker/{id}\n11:memory:/docker/{id}\n0::/system.slice/containerd.service\n",
            id = DOCKER_ID
        );
        assert_eq!(container_id_from_cgroup(&cgroup).as_deref(), Some("3f4e1a2b9c0d"));
    }

    #[test]
    fn detects_systemd_scopes_on_cgroup_v2() {
        let docker = format!("0::/system.slice/docker-{}.scope\n", DOCKER_ID);
        assert_eq!(container_id_from_cgroup(&docker).as_deref(), Some("3f4e1a2b9c0d"));

        let kube = format!(
            "0::/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod1234.slice/cri-containerd-{}.scope\n",
            DOCKER_ID
        );
        assert_eq!(container_id_from_cgroup(&kube).as_deref(), Some("3f4e1a2b9c0d"));
    }

    #[test]
    fn host_processes_have_no_container() {
        let cgroup = "0::/user.slice/user-1000.slice/session-2.scope\n";
        assert_eq!(container_id_from_cgroup(cgroup), None);
        assert_eq!(container_id_from_cgroup(""), None);
    }

    #[test]
    fn nested_namespace_yields_inner_pid() {
        let status = "Name:\tpython\nTgid:\t4242\nPid:\t4242\nNSpid:\t4242\t17\n";
        assert_eq!(pid_in_container_from_status(status), Some(17));
    }

    #[test]
    fn host_namespace_has_no_inner_pid() {
        let status = "Name:\tpython\nNSpid:\t4242\n";
        assert_eq!(pid_in_container_from_status(status), None);
        assert_eq!(pid_in_container_from_status("Name:\tpython\n"), None);
    }

    #[test]
    fn unknown_start_time_is_skipped() {
        assert_eq!(format_start_time(0), None);
        assert!(format_start_time(1_704_722_602).is_some());
    }

    #[test]
    fn host_table_holds_only_requested_pids() {
        let own = std::process::id();
        let system = host_processes(&[own]);

        assert_eq!(system.processes().len(), 1);
        let reading = describe(&system, 0, &GpuProcess { pid: own, used_bytes: 0 });
        assert!(!reading.process_name.is_empty());
        assert_ne!(reading.proc_start_time, NOT_AVAILABLE);

        assert!(host_processes(&[]).processes().is_empty());
    }

    #[test]
    fn invisible_process_keeps_defaults() {
        let system = System::new();
        let gpu_proc = GpuProcess {
            pid: u32::MAX - 1,
            used_bytes: 3 * MIB,
        };
        let reading = describe(&system, 2, &gpu_proc);

        assert_eq!(reading.gpu_index, 2);
        assert_eq!(reading.pid, u32::MAX - 1);
        assert_eq!(reading.gpu_memory_used, 3);
        assert_eq!(reading.main_memory_used, 0);
        assert_eq!(reading.proc_start_time, NOT_AVAILABLE);
        assert!(reading.process_name.is_empty());
        assert!(reading.command.is_empty());
        assert_eq!(reading.container_name, None);
    }
}
