// SPDX-License-Identifier: GPL-3.0-only

//! Liveness probing over the containment closure.

use zbus::zvariant::OwnedObjectPath;

use crate::backend::StorageOps;
use crate::closure::contained_objects;

/// Outcome of probing one object's containment closure.
#[derive(Debug, Clone, Default)]
pub struct InUseProbe {
    /// Mounted filesystem that must be unmounted next, if any.
    pub filesystem_to_unmount: Option<OwnedObjectPath>,

    /// Unlocked encrypted container that must be locked next, if any.
    pub encrypted_to_lock: Option<OwnedObjectPath>,

    /// Whether the recorded finding is believed to be the last live
    /// resource in the closure. Only meaningful when the probe was asked
    /// to determine it.
    pub last: bool,
}

impl InUseProbe {
    pub fn in_use(&self) -> bool {
        self.filesystem_to_unmount.is_some() || self.encrypted_to_lock.is_some()
    }
}

/// Probe `object`'s containment closure for live resources.
///
/// The closure is scanned in reverse, cleartext before its container and
/// partitions before the main block device, so the recorded finding is
/// always safe to deactivate first. With `want_last` the scan continues
/// past the first finding just far enough to tell whether a second,
/// independent live resource exists; without it the scan stops at the
/// first finding.
pub async fn is_in_use_full(
    ops: &dyn StorageOps,
    object: &OwnedObjectPath,
    want_last: bool,
) -> InUseProbe {
    let objects_to_check = contained_objects(ops, object).await;

    let mut probe = InUseProbe {
        last: true,
        ..Default::default()
    };
    let mut found = false;

    for object_iter in objects_to_check.iter().rev() {
        if !ops.mount_points(object_iter).await.is_empty() {
            if found {
                probe.last = false;
                break;
            }
            probe.filesystem_to_unmount = Some(object_iter.clone());
            found = true;
        }

        if ops.is_encrypted(object_iter).await
            && ops.cleartext_block(object_iter).await.is_some()
        {
            if found {
                probe.last = false;
                break;
            }
            probe.encrypted_to_lock = Some(object_iter.clone());
            found = true;
        }

        if found && !want_last {
            break;
        }
    }

    probe
}

/// Whether anything in `object`'s containment closure is live.
pub async fn is_in_use(ops: &dyn StorageOps, object: &OwnedObjectPath) -> bool {
    is_in_use_full(ops, object, false).await.in_use()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeStorage, path};

    fn partitioned_disk(storage: &FakeStorage) {
        storage.add_block("/t/block_devices/sda", 1000);
        storage.add_partition("/t/block_devices/sda", "/t/block_devices/sda1", 1, 0, 300);
        storage.add_partition("/t/block_devices/sda", "/t/block_devices/sda2", 2, 500, 200);
    }

    #[tokio::test]
    async fn quiet_closure_reports_nothing() {
        let storage = FakeStorage::new();
        partitioned_disk(&storage);

        assert!(!is_in_use(&storage, &path("/t/block_devices/sda")).await);
    }

    #[tokio::test]
    async fn innermost_mount_is_found_first() {
        let storage = FakeStorage::new();
        partitioned_disk(&storage);
        storage.mount("/t/block_devices/sda1", "/mnt/a");
        storage.mount("/t/block_devices/sda2", "/mnt/b");

        let probe = is_in_use_full(&storage, &path("/t/block_devices/sda"), false).await;

        assert_eq!(
            probe.filesystem_to_unmount,
            Some(path("/t/block_devices/sda2")),
            "the partition deepest in the closure must be handled first"
        );
    }

    #[tokio::test]
    async fn cleartext_mount_shadows_its_container() {
        let storage = FakeStorage::new();
        partitioned_disk(&storage);
        storage.add_unlocked_container("/t/block_devices/sda2", "/t/block_devices/dm_0");
        storage.mount("/t/block_devices/dm_0", "/mnt/secret");

        let probe = is_in_use_full(&storage, &path("/t/block_devices/sda"), false).await;

        assert_eq!(
            probe.filesystem_to_unmount,
            Some(path("/t/block_devices/dm_0"))
        );
        assert_eq!(probe.encrypted_to_lock, None);
    }

    #[tokio::test]
    async fn unlocked_container_is_reported_for_locking() {
        let storage = FakeStorage::new();
        partitioned_disk(&storage);
        storage.add_unlocked_container("/t/block_devices/sda2", "/t/block_devices/dm_0");

        let probe = is_in_use_full(&storage, &path("/t/block_devices/sda"), false).await;

        assert_eq!(probe.filesystem_to_unmount, None);
        assert_eq!(
            probe.encrypted_to_lock,
            Some(path("/t/block_devices/sda2"))
        );
    }

    #[tokio::test]
    async fn last_is_true_for_a_single_live_resource() {
        let storage = FakeStorage::new();
        partitioned_disk(&storage);
        storage.mount("/t/block_devices/sda1", "/mnt/a");

        let probe = is_in_use_full(&storage, &path("/t/block_devices/sda"), true).await;

        assert!(probe.in_use());
        assert!(probe.last);
    }

    #[tokio::test]
    async fn second_live_resource_clears_last() {
        let storage = FakeStorage::new();
        partitioned_disk(&storage);
        storage.mount("/t/block_devices/sda1", "/mnt/a");
        storage.mount("/t/block_devices/sda2", "/mnt/b");

        let probe = is_in_use_full(&storage, &path("/t/block_devices/sda"), true).await;

        assert!(probe.in_use());
        assert!(!probe.last);
    }
}
