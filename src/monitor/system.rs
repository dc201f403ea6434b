//! Host-level probes backing the metrics loop.
//!
//! A single cached `sysinfo::System` is refreshed selectively — creating
//! one is expensive, refreshing only what a probe needs is not.

use sysinfo::{Disks, Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Raw host sample: memory, CPU, and disk occupancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSample {
    pub total_memory_mb: f64,
    pub used_memory_mb: f64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub disk_usage_percent: f64,
}

pub fn sample_host(system: &mut System, disk_path: &str) -> HostSample {
    system.refresh_memory();
    system.refresh_cpu_usage();

    let total = system.total_memory() as f64;
    let used = system.used_memory() as f64;
    let memory_percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };

    HostSample {
        total_memory_mb: total / (1024.0 * 1024.0),
        used_memory_mb: used / (1024.0 * 1024.0),
        memory_percent,
        cpu_percent: system.global_cpu_usage() as f64,
        disk_usage_percent: disk_usage_percent(disk_path),
    }
}

/// Usage of the disk backing `preferred_path`, longest mount-point match
/// winning; zero when nothing matches (containerized hosts).
fn disk_usage_percent(preferred_path: &str) -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, f64)> = None;

    for disk in disks.list() {
        let mount = disk.mount_point().to_string_lossy();
        if !preferred_path.starts_with(mount.as_ref()) {
            continue;
        }
        let total = disk.total_space() as f64;
        if total <= 0.0 {
            continue;
        }
        let used_pct = (total - disk.available_space() as f64) / total * 100.0;
        match best {
            Some((len, _)) if mount.len() <= len => {}
            _ => best = Some((mount.len(), used_pct)),
        }
    }

    best.map(|(_, pct)| pct).unwrap_or(0.0)
}

/// Resident memory (MB) and CPU share of the current process.
pub fn process_usage(system: &mut System) -> (f64, f64) {
    let pid = Pid::from_u32(std::process::id());
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory().with_cpu(),
    );
    match system.process(pid) {
        Some(process) => (
            process.memory() as f64 / (1024.0 * 1024.0),
            process.cpu_usage() as f64,
        ),
        None => (0.0, 0.0),
    }
}

/// Number of open inet sockets, from /proc. Zero where /proc is absent —
/// the gauge degrades, nothing else does.
pub fn connection_count() -> usize {
    ["/proc/net/tcp", "/proc/net/tcp6", "/proc/net/udp"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|table| table.lines().count().saturating_sub(1))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_sample_is_plausible() {
        let mut system = System::new();
        let sample = sample_host(&mut system, "/");
        assert!(sample.total_memory_mb > 0.0);
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert!((0.0..=100.0).contains(&sample.disk_usage_percent));
    }

    #[test]
    fn process_usage_sees_our_own_process() {
        let mut system = System::new();
        let (memory_mb, _cpu) = process_usage(&mut system);
        assert!(memory_mb > 0.0);
    }
}
