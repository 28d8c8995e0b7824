// SPDX-License-Identifier: GPL-3.0-only

//! Containment enumeration over the daemon's object graph.

use zbus::zvariant::OwnedObjectPath;

use crate::backend::StorageOps;

/// Every object that must be considered when deciding whether `object`,
/// or anything layered on top of it, is in use.
///
/// Outermost first: the resolved block device, then its partitions in
/// table order, then the cleartext device of every collected object that
/// is an unlocked encrypted container. Discovered cleartext devices are
/// themselves subject to the cleartext check (a partition can hold a
/// further container), so the expansion runs over the growing list until
/// it reaches a fixed point.
///
/// Never fails: absent facets contribute nothing, and the result is
/// empty only when no block facet is resolvable for `object` at all.
pub async fn contained_objects(
    ops: &dyn StorageOps,
    object: &OwnedObjectPath,
) -> Vec<OwnedObjectPath> {
    let mut objects_to_check = Vec::new();

    if let Some(block_object) = ops.resolve_block_object(object).await {
        objects_to_check.push(block_object.clone());
        if let Some(table) = ops.partition_table(&block_object).await {
            objects_to_check.extend(table.partitions.into_iter().map(|p| p.object));
        }
    }

    let mut i = 0;
    while i < objects_to_check.len() {
        let candidate = objects_to_check[i].clone();
        if let Some(cleartext) = ops.cleartext_block(&candidate).await
            && !objects_to_check.contains(&cleartext)
        {
            objects_to_check.push(cleartext);
        }
        i += 1;
    }

    objects_to_check
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeStorage, path};

    #[tokio::test]
    async fn block_comes_first_then_partitions_in_table_order() {
        let storage = FakeStorage::new();
        storage.add_block("/t/block_devices/sda", 1000);
        storage.add_partition("/t/block_devices/sda", "/t/block_devices/sda1", 1, 0, 300);
        storage.add_partition("/t/block_devices/sda", "/t/block_devices/sda2", 2, 500, 200);

        let objects = contained_objects(&storage, &path("/t/block_devices/sda")).await;

        assert_eq!(
            objects,
            vec![
                path("/t/block_devices/sda"),
                path("/t/block_devices/sda1"),
                path("/t/block_devices/sda2"),
            ]
        );
    }

    #[tokio::test]
    async fn cleartext_of_a_partition_is_discovered_by_fixed_point_expansion() {
        let storage = FakeStorage::new();
        storage.add_block("/t/block_devices/sda", 1000);
        storage.add_partition("/t/block_devices/sda", "/t/block_devices/sda1", 1, 0, 300);
        storage.add_partition("/t/block_devices/sda", "/t/block_devices/sda2", 2, 500, 200);
        storage.add_unlocked_container("/t/block_devices/sda2", "/t/block_devices/dm_0");

        let objects = contained_objects(&storage, &path("/t/block_devices/sda")).await;

        assert_eq!(
            objects.last(),
            Some(&path("/t/block_devices/dm_0")),
            "cleartext block must be appended even though its container was \
             only discovered during the partition pass"
        );
    }

    #[tokio::test]
    async fn nested_containers_expand_until_quiet() {
        let storage = FakeStorage::new();
        storage.add_block("/t/block_devices/sdb", 1000);
        storage.add_unlocked_container("/t/block_devices/sdb", "/t/block_devices/dm_0");
        storage.add_unlocked_container("/t/block_devices/dm_0", "/t/block_devices/dm_1");

        let objects = contained_objects(&storage, &path("/t/block_devices/sdb")).await;

        assert_eq!(
            objects,
            vec![
                path("/t/block_devices/sdb"),
                path("/t/block_devices/dm_0"),
                path("/t/block_devices/dm_1"),
            ]
        );
    }

    #[tokio::test]
    async fn drives_resolve_to_their_block_device() {
        let storage = FakeStorage::new();
        storage.add_block("/t/block_devices/sdc", 1000);
        storage.add_drive("/t/drives/usb_stick", "/t/block_devices/sdc");

        let objects = contained_objects(&storage, &path("/t/drives/usb_stick")).await;

        assert_eq!(objects, vec![path("/t/block_devices/sdc")]);
    }

    #[tokio::test]
    async fn object_without_block_facet_yields_nothing() {
        let storage = FakeStorage::new();

        let objects = contained_objects(&storage, &path("/t/jobs/1")).await;

        assert!(objects.is_empty());
    }
}
