// SPDX-License-Identifier: GPL-3.0-only

//! The asynchronous seam between the resolver and the storage daemon.
//!
//! Objects are identified by their D-Bus object path. Facets (block,
//! partition table, filesystem, encrypted container, loop device) are
//! probed dynamically; an absent facet reads as `None` or an empty
//! collection, never as an error, so a facet vanishing between query and
//! action degrades to "nothing to do there anymore".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zbus::zvariant::OwnedObjectPath;

use crate::error::ServiceError;

/// Snapshot of one partition, taken from the daemon's partition facet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    /// Object path of the partition's block device.
    pub object: OwnedObjectPath,

    /// Partition number (1-based).
    pub number: u32,

    /// Offset from the start of the disk in bytes.
    pub offset: u64,

    /// Size in bytes.
    pub size: u64,

    /// DOS extended/container partition.
    pub is_container: bool,

    /// Logical partition nested inside a container.
    pub is_contained: bool,
}

impl PartitionSnapshot {
    /// End offset, exclusive.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Snapshot of a partition table together with the device that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTableSnapshot {
    /// Total size of the partitioned block device in bytes.
    pub device_size: u64,

    /// Partitions in table order.
    pub partitions: Vec<PartitionSnapshot>,
}

/// A loop device backing a block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopDevice {
    pub object: OwnedObjectPath,

    /// Whether the device deletes itself when its last consumer detaches.
    pub autoclear: bool,
}

/// Queries and mutations the resolver needs from the storage daemon.
///
/// Queries are snapshots: the daemon may change the graph at any await
/// point, so callers re-query instead of holding results across
/// mutations. Mutators are issued with empty option dictionaries and at
/// most one is in flight per resolution pass.
#[async_trait]
pub trait StorageOps: Send + Sync {
    /// Block object for `object`: the object itself when it carries a
    /// block facet, the associated non-physical block device when it is
    /// a drive, `None` otherwise.
    async fn resolve_block_object(&self, object: &OwnedObjectPath) -> Option<OwnedObjectPath>;

    /// Whether `object` itself carries a block facet. No drive
    /// resolution.
    async fn is_block(&self, object: &OwnedObjectPath) -> bool;

    /// Partition table on `block`, children in table order.
    async fn partition_table(&self, block: &OwnedObjectPath) -> Option<PartitionTableSnapshot>;

    /// Cleartext block whose encrypted backing device is `block`, when
    /// currently unlocked.
    async fn cleartext_block(&self, block: &OwnedObjectPath) -> Option<OwnedObjectPath>;

    /// Whether `object` carries an encrypted facet, locked or not.
    async fn is_encrypted(&self, object: &OwnedObjectPath) -> bool;

    /// Current mount points of `object`; empty when unmounted or when it
    /// has no filesystem facet.
    async fn mount_points(&self, object: &OwnedObjectPath) -> Vec<String>;

    /// Loop device backing `block`, if any. Covers the case where
    /// `block` is a partition of a loop device.
    async fn loop_for_block(&self, block: &OwnedObjectPath) -> Option<LoopDevice>;

    async fn unmount(&self, object: &OwnedObjectPath) -> Result<(), ServiceError>;

    async fn lock(&self, object: &OwnedObjectPath) -> Result<(), ServiceError>;

    async fn set_loop_autoclear(
        &self,
        loop_object: &OwnedObjectPath,
        value: bool,
    ) -> Result<(), ServiceError>;

    /// Give the daemon's change notifications a chance to land. Bounded:
    /// returns after one notification or a short tick, whichever comes
    /// first.
    async fn settle(&self);
}
