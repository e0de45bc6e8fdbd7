//! Disk-space probe port.
//!
//! Admission control asks how full a filesystem would be after the
//! download lands; a probe trait keeps that testable without filling a
//! real disk.

use std::path::Path;

use crate::errors::{EngineError, EngineResult};

/// Free/total bytes of the filesystem holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl DiskSpace {
    /// Free percentage after deducting `reserve` more bytes.
    #[must_use]
    pub fn free_pct_after(&self, reserve: u64) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let free = self.free_bytes.saturating_sub(reserve);
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
        {
            ((free as f64 / self.total_bytes as f64) * 100.0).floor() as u8
        }
    }
}

/// Filesystem space query.
pub trait DiskProbe: Send + Sync {
    /// Space on the filesystem holding `path`.
    fn space(&self, path: &Path) -> EngineResult<DiskSpace>;
}

/// Probe backed by the OS (statvfs and friends).
#[derive(Debug, Clone, Copy, Default)]
pub struct RealDisk;

impl DiskProbe for RealDisk {
    fn space(&self, path: &Path) -> EngineResult<DiskSpace> {
        let free_bytes = fs2::available_space(path).map_err(|e| EngineError::from_io(&e))?;
        let total_bytes = fs2::total_space(path).map_err(|e| EngineError::from_io(&e))?;
        Ok(DiskSpace {
            free_bytes,
            total_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_pct_after_deduction() {
        let space = DiskSpace {
            free_bytes: 30,
            total_bytes: 100,
        };
        assert_eq!(space.free_pct_after(0), 30);
        assert_eq!(space.free_pct_after(27), 3);
        // Reserving more than is free floors at zero.
        assert_eq!(space.free_pct_after(1000), 0);
    }

    #[test]
    fn zero_total_is_zero_pct() {
        let space = DiskSpace {
            free_bytes: 0,
            total_bytes: 0,
        };
        assert_eq!(space.free_pct_after(0), 0);
    }

    #[test]
    fn real_disk_probes_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let space = RealDisk.space(dir.path()).unwrap();
        assert!(space.total_bytes > 0);
    }
}
