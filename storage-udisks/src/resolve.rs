// SPDX-License-Identifier: GPL-3.0-only

//! Device path to UDisks2 object path resolution.

use std::collections::HashMap;

use anyhow::Result;
use udisks2::block::BlockProxy;
use zbus::{Connection, zvariant::OwnedObjectPath};

use crate::bytestring as bs;
use crate::proxies::UDisks2ManagerProxy;

/// Resolve a device path (e.g. "/dev/loop0") to the UDisks2 block
/// object path, matching either the kernel device name or the preferred
/// device name.
pub async fn block_object_path_for_device(
    connection: &Connection,
    device: &str,
) -> Result<OwnedObjectPath> {
    let manager = UDisks2ManagerProxy::new(connection).await?;
    let block_paths = manager.get_block_devices(HashMap::new()).await?;

    for path in block_paths {
        let block = match BlockProxy::builder(connection).path(&path)?.build().await {
            Ok(b) => b,
            Err(_) => continue,
        };

        if let Ok(raw) = block.device().await
            && bs::decode_c_string_bytes(&raw) == device
        {
            return Ok(path);
        }
        if let Ok(raw) = block.preferred_device().await
            && bs::decode_c_string_bytes(&raw) == device
        {
            return Ok(path);
        }
    }

    anyhow::bail!("No UDisks2 block object found for device: {}", device)
}
