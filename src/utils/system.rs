// src/utils/system.rs: System functions

use std::time::Duration;

use anyhow::Result;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Samples the machine once: physical cores and global CPU usage.
/// Used for reporting only; the plan's thread counts never depend on it.
///
/// # Returns
///
/// Result<(usize, f32)> physical cores, current cpu usage
pub async fn detect_cores_and_load() -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_cpu_usage());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_usage();
    sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_millis(100))).await;
    system.refresh_cpu_usage();

    let physical_cores = System::physical_core_count().unwrap_or(1).max(1);
    Ok((physical_cores, system.global_cpu_usage()))
}


/// Message for a thread request larger than the machine, if any.
///
/// # Arguments
///
/// * `threads` - Threads for QC and trimming.
/// * `align_threads` - Threads for alignment.
/// * `cores` - Physical cores from detect_cores_and_load.
pub fn oversubscription_warning(threads: usize, align_threads: usize, cores: usize) -> Option<String> {
    let requested = threads.max(align_threads);
    if requested > cores {
        Some(format!(
            "Requested {} threads but only {} physical cores are available; tools will oversubscribe",
            requested, cores
        ))
    } else {
        None
    }
}
