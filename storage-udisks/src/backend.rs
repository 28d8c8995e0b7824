// SPDX-License-Identifier: GPL-3.0-only

//! `StorageOps` over the UDisks2 D-Bus API.
//!
//! Facets are probed by reading a property of the interface in question;
//! a failed read means the object does not carry that facet (or no
//! longer exists), which the resolver treats as nothing-to-do.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use udisks2::{
    block::BlockProxy, drive::DriveProxy, encrypted::EncryptedProxy,
    filesystem::FilesystemProxy, partition::PartitionProxy,
    partitiontable::PartitionTableProxy,
};
use zbus::{Connection, zvariant::OwnedObjectPath};

use storage_quiesce::{
    LoopDevice, PartitionSnapshot, PartitionTableSnapshot, ServiceError, StorageOps,
};

use crate::bytestring as bs;
use crate::events::{DeviceEvent, spawn_device_events};
use crate::proxies::{UDisks2LoopProxy, UDisks2ManagerProxy};

/// How long `settle` waits for a change notification before ticking.
const SETTLE_TICK: Duration = Duration::from_millis(100);

pub struct UdisksBackend {
    connection: Connection,
    events: Mutex<mpsc::Receiver<DeviceEvent>>,
}

impl UdisksBackend {
    /// Connect to the system bus and subscribe to UDisks2 change
    /// notifications.
    pub async fn new() -> Result<Self> {
        let connection = Connection::system().await?;
        Self::with_connection(connection).await
    }

    pub async fn with_connection(connection: Connection) -> Result<Self> {
        let events = spawn_device_events(&connection).await?;
        Ok(Self {
            connection,
            events: Mutex::new(events),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    async fn partition_snapshot(&self, path: OwnedObjectPath) -> Option<PartitionSnapshot> {
        let proxy = PartitionProxy::builder(&self.connection)
            .path(&path)
            .ok()?
            .build()
            .await
            .ok()?;
        Some(PartitionSnapshot {
            number: proxy.number().await.ok()?,
            offset: proxy.offset().await.ok()?,
            size: proxy.size().await.ok()?,
            is_container: proxy.is_container().await.ok()?,
            is_contained: proxy.is_contained().await.ok()?,
            object: path,
        })
    }

    async fn loop_autoclear(&self, object: &OwnedObjectPath) -> Option<bool> {
        let proxy = UDisks2LoopProxy::builder(&self.connection)
            .path(object)
            .ok()?
            .build()
            .await
            .ok()?;
        proxy.autoclear().await.ok()
    }

    async fn is_drive(&self, object: &OwnedObjectPath) -> bool {
        let Ok(builder) = DriveProxy::builder(&self.connection).path(object) else {
            return false;
        };
        match builder.build().await {
            Ok(proxy) => proxy.id().await.is_ok(),
            Err(_) => false,
        }
    }
}

fn classify_method_error(name: &str, msg: Option<&str>, object: &OwnedObjectPath) -> ServiceError {
    match name {
        "org.freedesktop.DBus.Error.UnknownObject"
        | "org.freedesktop.DBus.Error.UnknownInterface"
        | "org.freedesktop.DBus.Error.UnknownMethod" => {
            ServiceError::NotFound(object.to_string())
        }
        _ => {
            let msg = msg.unwrap_or("");
            ServiceError::Failed(if msg.is_empty() {
                name.to_string()
            } else {
                format!("{name}: {msg}")
            })
        }
    }
}

fn map_call_error(err: zbus::Error, object: &OwnedObjectPath) -> ServiceError {
    if let zbus::Error::MethodError(name, msg, _info) = &err {
        return classify_method_error(name.as_str(), msg.as_deref(), object);
    }
    ServiceError::Zbus(err)
}

fn map_udisks_error(err: udisks2::Error, object: &OwnedObjectPath) -> ServiceError {
    match err {
        udisks2::Error::Zbus(zbus_err) => map_call_error(zbus_err, object),
        other => ServiceError::Failed(other.to_string()),
    }
}

#[async_trait]
impl StorageOps for UdisksBackend {
    async fn resolve_block_object(&self, object: &OwnedObjectPath) -> Option<OwnedObjectPath> {
        if self.is_block(object).await {
            return Some(object.clone());
        }
        if !self.is_drive(object).await {
            return None;
        }

        // Drives carry no block facet themselves; scan for the
        // whole-disk block device that points back at the drive.
        let manager = UDisks2ManagerProxy::new(&self.connection).await.ok()?;
        let block_paths = manager.get_block_devices(HashMap::new()).await.ok()?;
        for path in block_paths {
            let is_partition = match PartitionProxy::builder(&self.connection).path(&path) {
                Ok(builder) => match builder.build().await {
                    Ok(proxy) => proxy.table().await.is_ok(),
                    Err(_) => false,
                },
                Err(_) => continue,
            };
            if is_partition {
                continue;
            }
            let block = match BlockProxy::builder(&self.connection).path(&path) {
                Ok(builder) => match builder.build().await {
                    Ok(proxy) => proxy,
                    Err(_) => continue,
                },
                Err(_) => continue,
            };
            if let Ok(drive) = block.drive().await
                && drive.as_str() == object.as_str()
            {
                return Some(path);
            }
        }
        None
    }

    async fn is_block(&self, object: &OwnedObjectPath) -> bool {
        let Ok(builder) = BlockProxy::builder(&self.connection).path(object) else {
            return false;
        };
        match builder.build().await {
            Ok(proxy) => proxy.size().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn partition_table(&self, block: &OwnedObjectPath) -> Option<PartitionTableSnapshot> {
        let table_proxy = PartitionTableProxy::builder(&self.connection)
            .path(block)
            .ok()?
            .build()
            .await
            .ok()?;
        let partition_paths = table_proxy.partitions().await.ok()?;

        let block_proxy = BlockProxy::builder(&self.connection)
            .path(block)
            .ok()?
            .build()
            .await
            .ok()?;
        let device_size = block_proxy.size().await.ok()?;

        let mut partitions = Vec::with_capacity(partition_paths.len());
        for path in partition_paths {
            // A partition that vanished mid-scan simply drops out.
            if let Some(snapshot) = self.partition_snapshot(path).await {
                partitions.push(snapshot);
            }
        }

        Some(PartitionTableSnapshot {
            device_size,
            partitions,
        })
    }

    async fn cleartext_block(&self, block: &OwnedObjectPath) -> Option<OwnedObjectPath> {
        let proxy = EncryptedProxy::builder(&self.connection)
            .path(block)
            .ok()?
            .build()
            .await
            .ok()?;
        let cleartext = proxy.cleartext_device().await.ok()?;
        // "/" is UDisks2 for "locked".
        if cleartext.as_str() == "/" {
            None
        } else {
            Some(cleartext)
        }
    }

    async fn is_encrypted(&self, object: &OwnedObjectPath) -> bool {
        let Ok(builder) = EncryptedProxy::builder(&self.connection).path(object) else {
            return false;
        };
        match builder.build().await {
            Ok(proxy) => proxy.cleartext_device().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn mount_points(&self, object: &OwnedObjectPath) -> Vec<String> {
        let Ok(builder) = FilesystemProxy::builder(&self.connection).path(object) else {
            return Vec::new();
        };
        match builder.build().await {
            Ok(proxy) => match proxy.mount_points().await {
                Ok(raw) => bs::decode_mount_points(raw),
                Err(_) => Vec::new(),
            },
            Err(_) => Vec::new(),
        }
    }

    async fn loop_for_block(&self, block: &OwnedObjectPath) -> Option<LoopDevice> {
        if let Some(autoclear) = self.loop_autoclear(block).await {
            return Some(LoopDevice {
                object: block.clone(),
                autoclear,
            });
        }

        // A partition of a loop device: the loop facet sits on the
        // table's block object.
        let partition = PartitionProxy::builder(&self.connection)
            .path(block)
            .ok()?
            .build()
            .await
            .ok()?;
        let table = partition.table().await.ok()?;
        let autoclear = self.loop_autoclear(&table).await?;
        Some(LoopDevice {
            object: table,
            autoclear,
        })
    }

    async fn unmount(&self, object: &OwnedObjectPath) -> Result<(), ServiceError> {
        let proxy = FilesystemProxy::builder(&self.connection)
            .path(object)?
            .build()
            .await?;
        proxy
            .unmount(HashMap::new())
            .await
            .map_err(|err| map_udisks_error(err, object))
    }

    async fn lock(&self, object: &OwnedObjectPath) -> Result<(), ServiceError> {
        let proxy = EncryptedProxy::builder(&self.connection)
            .path(object)?
            .build()
            .await?;
        proxy
            .lock(HashMap::new())
            .await
            .map_err(|err| map_udisks_error(err, object))
    }

    async fn set_loop_autoclear(
        &self,
        loop_object: &OwnedObjectPath,
        value: bool,
    ) -> Result<(), ServiceError> {
        let proxy = UDisks2LoopProxy::builder(&self.connection)
            .path(loop_object)?
            .build()
            .await?;
        proxy
            .set_autoclear(value, HashMap::new())
            .await
            .map_err(|err| map_call_error(err, loop_object))
    }

    async fn settle(&self) {
        let mut events = self.events.lock().await;
        let _ = tokio::time::timeout(SETTLE_TICK, events.recv()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> OwnedObjectPath {
        OwnedObjectPath::try_from("/org/freedesktop/UDisks2/block_devices/sda1").unwrap()
    }

    #[test]
    fn unknown_object_maps_to_not_found() {
        let mapped =
            classify_method_error("org.freedesktop.DBus.Error.UnknownObject", None, &object());
        assert!(matches!(mapped, ServiceError::NotFound(_)));
    }

    #[test]
    fn daemon_failures_keep_their_message() {
        let mapped = classify_method_error(
            "org.freedesktop.UDisks2.Error.DeviceBusy",
            Some("target is busy"),
            &object(),
        );
        match mapped {
            ServiceError::Failed(msg) => assert!(msg.contains("target is busy")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
