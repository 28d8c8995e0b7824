// SPDX-License-Identifier: GPL-3.0-only

//! UDisks2 client layer
//!
//! Implements the [`storage_quiesce::StorageOps`] daemon interface over
//! the UDisks2 D-Bus API, and carries the loop-device and usage helpers
//! the disk-image tooling needs.

mod backend;
mod bytestring;
mod call;
mod events;
mod image;
mod proxies;
mod resolve;
mod usage;

pub use backend::UdisksBackend;
pub use events::{DeviceEvent, DeviceEventStream};
pub use image::{loop_delete, loop_setup};
pub use resolve::block_object_path_for_device;
pub use usage::{Usage, free_bytes_for_mount_point, usage_for_mount_point};
