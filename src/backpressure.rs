//! Storage backpressure policy.
//!
//! Two thresholds on free space of the volume that hosts the buffer:
//!
//! - below `low_water_bytes` the collector stops appending new samples;
//! - below `urgent_bytes` (stricter, lower) the pruner runs immediately.
//!
//! With `urgent_bytes <= low_water_bytes`, sent rows are reclaimed before
//! ingestion stops, and ingestion stops before the disk fills up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while reading storage capacity.
#[derive(Debug, Error)]
pub enum CapacityError {
    /// Free space could not be determined
    #[error("storage capacity unknown for {path}: {reason}")]
    Unknown { path: String, reason: String },
}

/// Free-space thresholds in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Stop collecting below this many free bytes
    pub low_water_bytes: u64,

    /// Prune immediately below this many free bytes
    pub urgent_bytes: u64,
}

impl Thresholds {
    /// Build thresholds, rejecting an urgent mark above the low-water mark.
    pub fn new(low_water_bytes: u64, urgent_bytes: u64) -> Option<Self> {
        if urgent_bytes > low_water_bytes {
            return None;
        }
        Some(Self {
            low_water_bytes,
            urgent_bytes,
        })
    }

    /// Build thresholds from megabyte values.
    pub fn from_mb(low_water_mb: u64, urgent_mb: u64) -> Option<Self> {
        Self::new(
            low_water_mb.saturating_mul(1024 * 1024),
            urgent_mb.saturating_mul(1024 * 1024),
        )
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_water_bytes: 512 * 1024 * 1024,
            urgent_bytes: 128 * 1024 * 1024,
        }
    }
}

/// Whether the collector may append another sample.
pub fn should_collect(free_bytes: u64, thresholds: &Thresholds) -> bool {
    free_bytes >= thresholds.low_water_bytes
}

/// Whether the pruner should run now instead of waiting for its cadence.
pub fn should_prune_urgently(free_bytes: u64, thresholds: &Thresholds) -> bool {
    free_bytes < thresholds.urgent_bytes
}

/// Source of free-space figures for the buffer volume.
pub trait CapacityGauge: Send + Sync {
    /// Available bytes on the volume hosting the buffer.
    fn free_bytes(&self) -> Result<u64, CapacityError>;
}

/// Gauge reporting the free space of the filesystem that holds the buffer.
///
/// On unix the buffer directory itself is queried with `statvfs`, so the
/// figure always belongs to the volume the database lives on (tmpfs and
/// bind mounts included). Elsewhere the mounted disk whose mount point is
/// the longest prefix of the directory is used.
#[derive(Debug, Clone)]
pub struct DiskCapacity {
    dir: PathBuf,
}

impl DiskCapacity {
    /// Measure the volume that holds `db_path`.
    pub fn for_database(db_path: impl AsRef<Path>) -> Self {
        let dir = match db_path.as_ref().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self { dir }
    }

    /// Directory being measured.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn unknown(&self, reason: impl Into<String>) -> CapacityError {
        CapacityError::Unknown {
            path: self.dir.display().to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(unix)]
impl CapacityGauge for DiskCapacity {
    fn free_bytes(&self) -> Result<u64, CapacityError> {
        let stat = nix::sys::statvfs::statvfs(&self.dir)
            .map_err(|e| self.unknown(e.to_string()))?;

        // Blocks available to unprivileged users, in fragment-size units
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }
}

#[cfg(not(unix))]
impl CapacityGauge for DiskCapacity {
    fn free_bytes(&self) -> Result<u64, CapacityError> {
        let dir = self
            .dir
            .canonicalize()
            .map_err(|e| self.unknown(e.to_string()))?;

        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space())
            .ok_or_else(|| self.unknown("no mounted disk contains the buffer directory"))
    }
}

/// Result of a single backpressure assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pressure {
    /// Free bytes, if the gauge could read them
    pub free_bytes: Option<u64>,

    /// Collector may append this tick
    pub collect: bool,

    /// Pruner should run now
    pub prune_urgently: bool,
}

/// Combines a capacity gauge with thresholds.
#[derive(Clone)]
pub struct BackpressureGuard {
    gauge: Arc<dyn CapacityGauge>,
    thresholds: Thresholds,
}

impl BackpressureGuard {
    pub fn new(gauge: Arc<dyn CapacityGauge>, thresholds: Thresholds) -> Self {
        Self { gauge, thresholds }
    }

    /// Current free space of the buffer volume.
    pub fn free_space(&self) -> Result<u64, CapacityError> {
        self.gauge.free_bytes()
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Read capacity and apply both thresholds.
    ///
    /// An unreadable capacity is treated as low: collection is suppressed and
    /// pruning is requested.
    pub fn assess(&self) -> Pressure {
        match self.free_space() {
            Ok(free) => {
                let pressure = Pressure {
                    free_bytes: Some(free),
                    collect: should_collect(free, &self.thresholds),
                    prune_urgently: should_prune_urgently(free, &self.thresholds),
                };
                debug!(
                    free_bytes = free,
                    collect = pressure.collect,
                    prune_urgently = pressure.prune_urgently,
                    "Backpressure assessed"
                );
                pressure
            }
            Err(e) => {
                warn!(error = %e, "Capacity unknown, assuming low free space");
                Pressure {
                    free_bytes: None,
                    collect: false,
                    prune_urgently: true,
                }
            }
        }
    }
}

impl std::fmt::Debug for BackpressureGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureGuard")
            .field("thresholds", &self.thresholds)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixedCapacity;
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds::new(1_000, 100).unwrap()
    }

    #[test]
    fn test_thresholds_reject_inverted_marks() {
        assert!(Thresholds::new(100, 1_000).is_none());
        assert!(Thresholds::new(100, 100).is_some());
    }

    #[test]
    fn test_thresholds_from_mb() {
        let t = Thresholds::from_mb(512, 128).unwrap();
        assert_eq!(t.low_water_bytes, 512 * 1024 * 1024);
        assert_eq!(t.urgent_bytes, 128 * 1024 * 1024);
        assert_eq!(t, Thresholds::default());
    }

    #[test]
    fn test_should_collect() {
        let t = thresholds();
        assert!(should_collect(5_000, &t));
        assert!(should_collect(1_000, &t));
        assert!(!should_collect(999, &t));
        assert!(!should_collect(0, &t));
    }

    #[test]
    fn test_should_prune_urgently() {
        let t = thresholds();
        assert!(!should_prune_urgently(5_000, &t));
        assert!(!should_prune_urgently(100, &t));
        assert!(should_prune_urgently(99, &t));
    }

    #[test]
    fn test_soft_stop_before_hard_prune() {
        // Between the marks: stop collecting but do not force pruning
        let t = thresholds();
        assert!(!should_collect(500, &t));
        assert!(!should_prune_urgently(500, &t));
    }

    #[test]
    fn test_assess_plenty_of_space() {
        let guard = BackpressureGuard::new(FixedCapacity::new(10_000), thresholds());
        let pressure = guard.assess();
        assert_eq!(pressure.free_bytes, Some(10_000));
        assert!(pressure.collect);
        assert!(!pressure.prune_urgently);
    }

    #[test]
    fn test_assess_critical_space() {
        let guard = BackpressureGuard::new(FixedCapacity::new(10), thresholds());
        let pressure = guard.assess();
        assert!(!pressure.collect);
        assert!(pressure.prune_urgently);
    }

    #[test]
    fn test_assess_unknown_capacity_is_conservative() {
        let guard =
            BackpressureGuard::new(FixedCapacity::new(FixedCapacity::UNKNOWN), thresholds());
        assert!(guard.free_space().is_err());

        let pressure = guard.assess();
        assert_eq!(pressure.free_bytes, None);
        assert!(!pressure.collect);
        assert!(pressure.prune_urgently);
    }

    #[test]
    fn test_disk_capacity_dir_resolution() {
        let gauge = DiskCapacity::for_database("/var/lib/edge/buffer.db");
        assert_eq!(gauge.dir(), Path::new("/var/lib/edge"));

        let gauge = DiskCapacity::for_database("buffer.db");
        assert_eq!(gauge.dir(), Path::new("."));
    }

    #[test]
    fn test_disk_capacity_reads_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let gauge = DiskCapacity::for_database(dir.path().join("buffer.db"));
        assert!(gauge.free_bytes().is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_disk_capacity_uses_the_buffer_volume() {
        // /dev/shm is its own tmpfs, smaller than the root volume
        let shm = Path::new("/dev/shm");
        let Ok(dir) = tempfile::tempdir_in(shm) else {
            return;
        };
        let shm_stat = nix::sys::statvfs::statvfs(shm).unwrap();
        let shm_total = (shm_stat.blocks() as u64) * (shm_stat.fragment_size() as u64);

        let gauge = DiskCapacity::for_database(dir.path().join("buffer.db"));
        let free = gauge.free_bytes().unwrap();
        assert!(free <= shm_total, "free {} exceeds tmpfs size {}", free, shm_total);
    }

    #[test]
    fn test_disk_capacity_missing_directory_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let gauge = DiskCapacity::for_database(dir.path().join("missing").join("buffer.db"));
        assert!(matches!(
            gauge.free_bytes(),
            Err(CapacityError::Unknown { .. })
        ));
    }
}
