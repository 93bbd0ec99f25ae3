//! Host resource probing and download affordability
//!
//! Snapshots are computed fresh at preflight time and never persisted: disk
//! fills up and memory pressure changes between runs, so a stale reading is
//! worse than none.

use std::path::Path;
use std::process::Command;

/// Default headroom multiplier applied to the requested byte budget
pub const DEFAULT_BUFFER_RATIO: f64 = 1.2;

/// Point-in-time view of the host's capacity
#[derive(Debug, Clone, Default)]
pub struct SystemResources {
    /// Available memory in bytes
    pub available_memory: u64,
    /// Free disk space in bytes on the filesystem holding the cache dir
    pub free_disk: u64,
    /// Number of GPUs visible to this process
    pub gpu_count: usize,
}

impl SystemResources {
    /// Probe the current host
    ///
    /// Free disk is read from the mounted filesystem with the longest
    /// mount-point prefix of `cache_dir`.
    pub fn snapshot(cache_dir: &Path) -> Self {
        let sys = sysinfo::System::new_all();
        let available_memory = sys.available_memory();
        let free_disk = free_disk_for(cache_dir);
        let gpu_count = detect_gpu_count();

        tracing::debug!(
            available_memory = available_memory,
            free_disk = free_disk,
            gpu_count = gpu_count,
            cache_dir = ?cache_dir,
            "Resource snapshot"
        );

        Self {
            available_memory,
            free_disk,
            gpu_count,
        }
    }

    /// Whether a batch of downloads totalling `required_bytes` fits on disk
    /// once padded by `buffer_ratio`
    pub fn can_afford(&self, required_bytes: u64, buffer_ratio: f64) -> bool {
        self.free_disk >= padded_bytes(required_bytes, buffer_ratio)
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_count > 0
    }
}

/// Required bytes padded by the buffer ratio, saturating on overflow
pub fn padded_bytes(required_bytes: u64, buffer_ratio: f64) -> u64 {
    let padded = required_bytes as f64 * buffer_ratio.max(1.0);
    if padded >= u64::MAX as f64 {
        u64::MAX
    } else {
        padded.ceil() as u64
    }
}

/// Free space on the filesystem that holds `path`
fn free_disk_for(path: &Path) -> u64 {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let mut best_len = 0;
    let mut best_space = 0;
    for disk in &disks {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let len = mount.as_os_str().len();
            if len >= best_len {
                best_len = len;
                best_space = disk.available_space();
            }
        }
    }

    if best_len == 0 {
        // Cache dir not under any known mount; fall back to the largest free
        // region so preflight degrades to permissive rather than blocking.
        best_space = disks.iter().map(|d| d.available_space()).max().unwrap_or(0);
        tracing::warn!(
            path = ?path,
            "No mount point matches cache dir, using largest free disk"
        );
    }

    best_space
}

/// Count GPUs visible to this process using nvidia-smi
///
/// In multi-tenant environments this returns only the GPUs allocated to this
/// container, not all GPUs on the host. Probe failure means zero GPUs.
fn detect_gpu_count() -> usize {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            stdout
                .lines()
                .filter(|line| line.trim().parse::<u32>().is_ok())
                .count()
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(stderr = %stderr, "nvidia-smi failed, assuming no GPUs");
            0
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to run nvidia-smi, assuming no GPUs");
            0
        }
    }
}
