// SPDX-License-Identifier: GPL-3.0-only

//! In-memory daemon double for resolver tests.
//!
//! Records every mutator call and lets tests inject failures, lagging
//! property updates, and vanished facets.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use zbus::zvariant::OwnedObjectPath;

use crate::backend::{LoopDevice, PartitionSnapshot, PartitionTableSnapshot, StorageOps};
use crate::error::ServiceError;

pub(crate) fn path(s: &str) -> OwnedObjectPath {
    OwnedObjectPath::try_from(s).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Unmount(OwnedObjectPath),
    Lock(OwnedObjectPath),
    SetAutoclear(OwnedObjectPath, bool),
}

#[derive(Debug, Default, Clone)]
struct FakeObject {
    is_block: bool,
    drive_block: Option<OwnedObjectPath>,
    device_size: u64,
    table_children: Vec<OwnedObjectPath>,
    number: u32,
    offset: u64,
    size: u64,
    is_container: bool,
    is_contained: bool,
    mount_points: Vec<String>,
    encrypted: bool,
    cleartext: Option<OwnedObjectPath>,
    backing_loop: Option<OwnedObjectPath>,
    autoclear: bool,
}

#[derive(Default)]
pub(crate) struct FakeStorage {
    objects: Mutex<HashMap<OwnedObjectPath, FakeObject>>,
    calls: Mutex<Vec<Call>>,
    unmount_errors: Mutex<HashMap<OwnedObjectPath, ServiceError>>,
    lock_errors: Mutex<HashMap<OwnedObjectPath, ServiceError>>,
    vanish_on_unmount: Mutex<HashSet<OwnedObjectPath>>,
    unmount_lag: Mutex<HashMap<OwnedObjectPath, u32>>,
    settle_count: Mutex<usize>,
}

impl FakeStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with_object(&self, object: &str, f: impl FnOnce(&mut FakeObject)) {
        let mut objects = self.objects.lock().unwrap();
        f(objects.entry(path(object)).or_default());
    }

    pub(crate) fn add_block(&self, object: &str, device_size: u64) {
        self.with_object(object, |o| {
            o.is_block = true;
            o.device_size = device_size;
        });
    }

    pub(crate) fn add_drive(&self, drive: &str, block: &str) {
        let block = path(block);
        self.with_object(drive, |o| o.drive_block = Some(block));
    }

    pub(crate) fn add_partition(
        &self,
        table_block: &str,
        object: &str,
        number: u32,
        offset: u64,
        size: u64,
    ) {
        self.with_object(object, |o| {
            o.is_block = true;
            o.number = number;
            o.offset = offset;
            o.size = size;
        });
        let child = path(object);
        self.with_object(table_block, |o| o.table_children.push(child));
    }

    pub(crate) fn add_unlocked_container(&self, block: &str, cleartext: &str) {
        self.add_block(cleartext, 0);
        let cleartext = path(cleartext);
        self.with_object(block, |o| {
            o.is_block = true;
            o.encrypted = true;
            o.cleartext = Some(cleartext);
        });
    }

    pub(crate) fn mount(&self, object: &str, mount_point: &str) {
        self.with_object(object, |o| o.mount_points.push(mount_point.to_string()));
    }

    pub(crate) fn set_backing_loop(&self, block: &str, loop_object: &str, autoclear: bool) {
        let loop_path = path(loop_object);
        self.with_object(loop_object, |o| o.autoclear = autoclear);
        self.with_object(block, |o| o.backing_loop = Some(loop_path));
    }

    pub(crate) fn fail_unmount(&self, object: &str, message: &str) {
        self.unmount_errors
            .lock()
            .unwrap()
            .insert(path(object), ServiceError::Failed(message.to_string()));
    }

    pub(crate) fn fail_lock(&self, object: &str, message: &str) {
        self.lock_errors
            .lock()
            .unwrap()
            .insert(path(object), ServiceError::Failed(message.to_string()));
    }

    /// The next unmount of `object` reports the facet as gone while the
    /// mount also disappears, mimicking a teardown that raced us.
    pub(crate) fn vanish_on_unmount(&self, object: &str) {
        self.vanish_on_unmount.lock().unwrap().insert(path(object));
    }

    /// Delay the mount-point property update until `settles` calls to
    /// [`StorageOps::settle`] have run.
    pub(crate) fn set_unmount_lag(&self, object: &str, settles: u32) {
        self.unmount_lag.lock().unwrap().insert(path(object), settles);
    }

    pub(crate) fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub(crate) fn settle_count(&self) -> usize {
        *self.settle_count.lock().unwrap()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl StorageOps for FakeStorage {
    async fn resolve_block_object(&self, object: &OwnedObjectPath) -> Option<OwnedObjectPath> {
        let objects = self.objects.lock().unwrap();
        let entry = objects.get(object)?;
        if entry.is_block {
            Some(object.clone())
        } else {
            entry.drive_block.clone()
        }
    }

    async fn is_block(&self, object: &OwnedObjectPath) -> bool {
        self.objects
            .lock()
            .unwrap()
            .get(object)
            .is_some_and(|o| o.is_block)
    }

    async fn partition_table(&self, block: &OwnedObjectPath) -> Option<PartitionTableSnapshot> {
        let objects = self.objects.lock().unwrap();
        let entry = objects.get(block)?;
        if entry.table_children.is_empty() {
            return None;
        }
        let partitions = entry
            .table_children
            .iter()
            .filter_map(|child| {
                let p = objects.get(child)?;
                Some(PartitionSnapshot {
                    object: child.clone(),
                    number: p.number,
                    offset: p.offset,
                    size: p.size,
                    is_container: p.is_container,
                    is_contained: p.is_contained,
                })
            })
            .collect();
        Some(PartitionTableSnapshot {
            device_size: entry.device_size,
            partitions,
        })
    }

    async fn cleartext_block(&self, block: &OwnedObjectPath) -> Option<OwnedObjectPath> {
        self.objects
            .lock()
            .unwrap()
            .get(block)
            .and_then(|o| o.cleartext.clone())
    }

    async fn is_encrypted(&self, object: &OwnedObjectPath) -> bool {
        self.objects
            .lock()
            .unwrap()
            .get(object)
            .is_some_and(|o| o.encrypted)
    }

    async fn mount_points(&self, object: &OwnedObjectPath) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .get(object)
            .map(|o| o.mount_points.clone())
            .unwrap_or_default()
    }

    async fn loop_for_block(&self, block: &OwnedObjectPath) -> Option<LoopDevice> {
        let objects = self.objects.lock().unwrap();
        let loop_path = objects.get(block)?.backing_loop.clone()?;
        let autoclear = objects.get(&loop_path)?.autoclear;
        Some(LoopDevice {
            object: loop_path,
            autoclear,
        })
    }

    async fn unmount(&self, object: &OwnedObjectPath) -> Result<(), ServiceError> {
        self.record(Call::Unmount(object.clone()));

        if self.vanish_on_unmount.lock().unwrap().remove(object) {
            let mut objects = self.objects.lock().unwrap();
            if let Some(o) = objects.get_mut(object) {
                o.mount_points.clear();
            }
            return Err(ServiceError::NotFound(object.to_string()));
        }

        if let Some(err) = self.unmount_errors.lock().unwrap().remove(object) {
            return Err(err);
        }

        if self.unmount_lag.lock().unwrap().contains_key(object) {
            // Property update arrives later, via settle().
            return Ok(());
        }

        let mut objects = self.objects.lock().unwrap();
        if let Some(o) = objects.get_mut(object) {
            o.mount_points.clear();
        }
        Ok(())
    }

    async fn lock(&self, object: &OwnedObjectPath) -> Result<(), ServiceError> {
        self.record(Call::Lock(object.clone()));

        if let Some(err) = self.lock_errors.lock().unwrap().remove(object) {
            return Err(err);
        }

        let mut objects = self.objects.lock().unwrap();
        if let Some(o) = objects.get_mut(object) {
            o.cleartext = None;
        }
        Ok(())
    }

    async fn set_loop_autoclear(
        &self,
        loop_object: &OwnedObjectPath,
        value: bool,
    ) -> Result<(), ServiceError> {
        self.record(Call::SetAutoclear(loop_object.clone(), value));

        let mut objects = self.objects.lock().unwrap();
        if let Some(o) = objects.get_mut(loop_object) {
            o.autoclear = value;
        }
        Ok(())
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;

        *self.settle_count.lock().unwrap() += 1;

        let mut due = Vec::new();
        {
            let mut lags = self.unmount_lag.lock().unwrap();
            lags.retain(|object, remaining| {
                if *remaining <= 1 {
                    due.push(object.clone());
                    false
                } else {
                    *remaining -= 1;
                    true
                }
            });
        }

        let mut objects = self.objects.lock().unwrap();
        for object in due {
            if let Some(o) = objects.get_mut(&object) {
                o.mount_points.clear();
            }
        }
    }
}
