// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem usage statistics for mounted volumes.

use std::ffi::CString;
use std::mem::MaybeUninit;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Usage of one mounted filesystem, in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub filesystem: String,
    pub blocks: u64,
    pub used: u64,
    pub available: u64,
    pub percent: u32,
    pub mount_point: String,
}

fn statvfs_for(mount_point: &str) -> Result<libc::statvfs> {
    let mount_point_c = CString::new(mount_point)
        .with_context(|| format!("mount point contains NUL byte: {mount_point:?}"))?;

    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(mount_point_c.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs failed for mount point {mount_point:?}"));
    }

    Ok(unsafe { stat.assume_init() })
}

fn fragment_size(stat: &libc::statvfs) -> u64 {
    if stat.f_frsize > 0 {
        stat.f_frsize
    } else {
        stat.f_bsize
    }
}

pub fn usage_for_mount_point(mount_point: &str, filesystem: Option<&str>) -> Result<Usage> {
    let stat = statvfs_for(mount_point)?;
    let frsize = fragment_size(&stat);

    let total = stat.f_blocks.saturating_mul(frsize);
    let free = stat.f_bfree.saturating_mul(frsize);
    let available = stat.f_bavail.saturating_mul(frsize);
    let used = total.saturating_sub(free);
    let percent = if total == 0 {
        0
    } else {
        ((used.saturating_mul(100)) / total).min(100) as u32
    };

    Ok(Usage {
        filesystem: filesystem.unwrap_or_default().to_string(),
        blocks: total,
        used,
        available,
        percent,
        mount_point: mount_point.to_string(),
    })
}

/// Free bytes reported by the filesystem mounted at `mount_point`.
/// Failure usually just means the caller lacks permission to look at the
/// mount point; treat it as "unknown" rather than an error worth
/// surfacing.
pub fn free_bytes_for_mount_point(mount_point: &str) -> Result<u64> {
    let stat = statvfs_for(mount_point)?;
    Ok(stat.f_bfree.saturating_mul(fragment_size(&stat)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_usage_is_consistent() {
        let usage = usage_for_mount_point("/", Some("rootfs")).unwrap();

        assert_eq!(usage.mount_point, "/");
        assert_eq!(usage.filesystem, "rootfs");
        assert!(usage.used <= usage.blocks);
        assert!(usage.percent <= 100);
    }

    #[test]
    fn missing_mount_point_is_an_error() {
        assert!(usage_for_mount_point("/definitely/not/a/mount", None).is_err());
    }
}
