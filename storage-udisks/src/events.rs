// SPDX-License-Identifier: GPL-3.0-only

//! Block device change notifications.

use anyhow::Result;
use futures::StreamExt;
use futures::stream::Stream;
use futures::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::warn;
use zbus::Connection;

use crate::proxies::UDisks2ObjectManagerProxy;

const BLOCK_IFACE: &str = "org.freedesktop.UDisks2.Block";

#[derive(Debug, PartialEq)]
pub enum DeviceEvent {
    Added(String),
    Removed(String),
}

/// Signal-based event stream for block device add/remove.
///
/// Uses `org.freedesktop.DBus.ObjectManager` on the UDisks2 root object
/// and filters to events affecting the Block interface.
pub struct DeviceEventStream {
    receiver: mpsc::Receiver<DeviceEvent>,
}

impl DeviceEventStream {
    pub async fn new(connection: &Connection) -> Result<Self> {
        Ok(Self {
            receiver: spawn_device_events(connection).await?,
        })
    }
}

impl Stream for DeviceEventStream {
    type Item = DeviceEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Spawn the ObjectManager listener and hand back its channel.
pub(crate) async fn spawn_device_events(
    connection: &Connection,
) -> Result<mpsc::Receiver<DeviceEvent>> {
    let (sender, receiver) = mpsc::channel(32);

    let object_manager = UDisks2ObjectManagerProxy::new(connection).await?;
    let mut added_stream = object_manager.receive_interfaces_added().await?;
    let mut removed_stream = object_manager.receive_interfaces_removed().await?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_added = added_stream.next() => {
                    let Some(signal) = maybe_added else {
                        break;
                    };

                    match signal.args() {
                        Ok(args) => {
                            if args.interfaces_and_properties.contains_key(BLOCK_IFACE)
                                && let Err(e) = sender.send(DeviceEvent::Added(args.object_path.to_string())).await {
                                    warn!("Device event receiver dropped: {e}");
                                    break;
                                }
                        }
                        Err(e) => {
                            warn!("Failed to parse InterfacesAdded signal args: {e}");
                        }
                    }
                }
                maybe_removed = removed_stream.next() => {
                    let Some(signal) = maybe_removed else {
                        break;
                    };

                    match signal.args() {
                        Ok(args) => {
                            if args.interfaces.iter().any(|i| i == BLOCK_IFACE)
                                && let Err(e) = sender.send(DeviceEvent::Removed(args.object_path.to_string())).await {
                                    warn!("Device event receiver dropped: {e}");
                                    break;
                                }
                        }
                        Err(e) => {
                            warn!("Failed to parse InterfacesRemoved signal args: {e}");
                        }
                    }
                }
            }
        }
    });

    Ok(receiver)
}
