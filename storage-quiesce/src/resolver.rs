// SPDX-License-Identifier: GPL-3.0-only

//! The sequential deactivation pipeline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zbus::zvariant::OwnedObjectPath;

use crate::backend::StorageOps;
use crate::error::{QuiesceError, ServiceError};
use crate::usage::is_in_use_full;

/// How long to wait for the daemon to reflect an unmount in the
/// mount-point list before proceeding anyway.
const UNMOUNT_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ensure no object in `objects` has a mounted filesystem or an unlocked
/// encrypted container anywhere in its containment closure.
///
/// Layers are deactivated one at a time, innermost first, with never
/// more than one daemon call in flight, so the daemon never sees two
/// competing teardown requests for related objects. The first failure
/// aborts the whole call and later objects are not touched; objects
/// already deactivated stay deactivated. Cancelling the token aborts at
/// the next suspension point with [`QuiesceError::Cancelled`].
///
/// Calling this on an already quiet set of objects performs no mutations
/// and succeeds immediately. Concurrent calls over overlapping closures
/// are not synchronized; callers must not issue them.
pub async fn ensure_unused_list(
    ops: &dyn StorageOps,
    objects: &[OwnedObjectPath],
    cancel: &CancellationToken,
) -> Result<(), QuiesceError> {
    debug_assert!(!objects.is_empty());

    for object in objects {
        quiesce_object(ops, object, cancel).await?;
    }
    Ok(())
}

/// [`ensure_unused_list`] for a single object.
pub async fn ensure_unused(
    ops: &dyn StorageOps,
    object: &OwnedObjectPath,
    cancel: &CancellationToken,
) -> Result<(), QuiesceError> {
    ensure_unused_list(ops, std::slice::from_ref(object), cancel).await
}

async fn quiesce_object(
    ops: &dyn StorageOps,
    object: &OwnedObjectPath,
    cancel: &CancellationToken,
) -> Result<(), QuiesceError> {
    loop {
        if cancel.is_cancelled() {
            return Err(QuiesceError::Cancelled);
        }

        let probe = is_in_use_full(ops, object, false).await;
        if !probe.in_use() {
            return Ok(());
        }

        // Unmounting the last consumer of an autoclearing loop device
        // makes the daemon delete the device out from under us; pin it
        // first so it stays addressable.
        if ops.is_block(object).await
            && let Some(loop_device) = ops.loop_for_block(object).await
            && loop_device.autoclear
        {
            let loop_probe = is_in_use_full(ops, &loop_device.object, true).await;
            if loop_probe.last {
                match run_cancellable(
                    cancel,
                    ops.set_loop_autoclear(&loop_device.object, false),
                )
                .await
                {
                    Ok(()) | Err(ServiceError::NotFound(_)) => {}
                    Err(source) => return Err(QuiesceError::SetAutoclear { source }),
                }
                continue;
            }
        }

        if let Some(filesystem) = probe.filesystem_to_unmount {
            let mount_points_before = ops.mount_points(&filesystem).await.len();
            match run_cancellable(cancel, ops.unmount(&filesystem)).await {
                Ok(()) => wait_for_unmount(ops, &filesystem, mount_points_before).await,
                Err(ServiceError::NotFound(_)) => {}
                Err(source) => return Err(QuiesceError::Unmount { source }),
            }
        } else if let Some(encrypted) = probe.encrypted_to_lock {
            match run_cancellable(cancel, ops.lock(&encrypted)).await {
                Ok(()) | Err(ServiceError::NotFound(_)) => {}
                Err(source) => return Err(QuiesceError::Lock { source }),
            }
        }
        // The same object may have further layers to unwind; probe again.
    }
}

async fn run_cancellable<F>(cancel: &CancellationToken, call: F) -> Result<(), ServiceError>
where
    F: Future<Output = Result<(), ServiceError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        result = call => result,
    }
}

/// UDisks2 occasionally completes an unmount before the matching
/// property update lands; poll until the mount-point list changes,
/// yielding to the daemon's change notifications between reads, for at
/// most [`UNMOUNT_SETTLE_TIMEOUT`]. Expiry is harmless: the property
/// catches up eventually and a stale read beats blocking forever.
async fn wait_for_unmount(
    ops: &dyn StorageOps,
    filesystem: &OwnedObjectPath,
    previous_len: usize,
) {
    let deadline = Instant::now() + UNMOUNT_SETTLE_TIMEOUT;
    while ops.mount_points(filesystem).await.len() == previous_len {
        if Instant::now() >= deadline {
            tracing::warn!(
                object = %filesystem,
                "mount point list did not settle after unmount; continuing"
            );
            return;
        }
        ops.settle().await;
    }
}
