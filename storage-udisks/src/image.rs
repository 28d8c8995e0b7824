// SPDX-License-Identifier: GPL-3.0-only

//! Disk image loop device attachment.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zbus::{
    Connection,
    zvariant::{OwnedFd as ZOwnedFd, OwnedObjectPath, Value},
};

use crate::call::call_udisks_raw;
use crate::proxies::UDisks2LoopProxy;

fn file_type_for_display(file_type: &std::fs::FileType) -> &'static str {
    if file_type.is_file() {
        "regular file"
    } else if file_type.is_dir() {
        "directory"
    } else if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_block_device() {
        "block device"
    } else if file_type.is_char_device() {
        "character device"
    } else if file_type.is_fifo() {
        "fifo"
    } else if file_type.is_socket() {
        "socket"
    } else {
        "unknown file type"
    }
}

async fn open_image_fd(image_path: &Path, writable: bool) -> Result<OwnedFd> {
    let path: PathBuf = image_path.to_path_buf();

    // Opening the file can block on slow or remote filesystems.
    tokio::task::spawn_blocking(move || -> Result<OwnedFd> {
        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("Failed to stat image path {}", path.display()))?;

        let file_type = metadata.file_type();
        if !file_type.is_file() {
            anyhow::bail!(
                "Image path {} is a {}; expected a regular file",
                path.display(),
                file_type_for_display(&file_type)
            );
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .with_context(|| format!("Failed to open image file {}", path.display()))?;

        Ok(file.into())
    })
    .await
    .context("Image file open task panicked or was cancelled")?
}

/// Set up a loop device for an image file. Read-only unless `writable`;
/// mounting whatever appears inside the image is left to the desktop
/// automounter.
pub async fn loop_setup(
    connection: &Connection,
    image_path: &Path,
    writable: bool,
) -> Result<OwnedObjectPath> {
    let manager_path: OwnedObjectPath = "/org/freedesktop/UDisks2/Manager".try_into()?;

    // UDisks2 expects a Unix FD handle for LoopSetup: (h a{sv}).
    // Passing a path string fails with InvalidArgs.
    let fd: OwnedFd = open_image_fd(image_path, writable).await?;
    let fd: ZOwnedFd = fd.into();

    let mut options: HashMap<&str, Value<'_>> = HashMap::new();
    if !writable {
        options.insert("read-only", Value::from(true));
    }

    call_udisks_raw(
        connection,
        &manager_path,
        "org.freedesktop.UDisks2.Manager",
        "LoopSetup",
        &(fd, options),
    )
    .await
}

/// Delete a loop device. Callers quiesce the device first so the daemon
/// never tears down a stack that is still in use.
pub async fn loop_delete(connection: &Connection, loop_object: &OwnedObjectPath) -> Result<()> {
    let proxy = UDisks2LoopProxy::builder(connection)
        .path(loop_object)?
        .build()
        .await?;
    proxy
        .delete(HashMap::new())
        .await
        .with_context(|| format!("Failed to delete loop device {}", loop_object))
}
