// SPDX-License-Identifier: GPL-3.0-only

//! Free-space accounting over partition table snapshots.
//!
//! Pure functions over one consistent snapshot; callers re-query the
//! daemon rather than reusing a snapshot across mutations.

use crate::backend::{PartitionSnapshot, PartitionTableSnapshot};

/// Number of bytes `partition` could occupy without overlapping the next
/// partition, or the end of the device when nothing follows it.
pub fn calc_space_to_grow(table: &PartitionTableSnapshot, partition: &PartitionSnapshot) -> u64 {
    let current_end = partition.end();
    let mut next_pos = table.device_size;

    for sibling in &table.partitions {
        if sibling.number == partition.number {
            continue;
        }
        let start = sibling.offset;
        let end = sibling.end();
        if end > current_end && end < next_pos {
            next_pos = end;
        }
        if start >= current_end && start < next_pos {
            next_pos = start;
        }
    }

    next_pos - partition.offset
}

/// Minimum byte length of a DOS container partition such that no
/// contained logical partition is truncated.
pub fn calc_space_to_shrink_extended(
    table: &PartitionTableSnapshot,
    container: &PartitionSnapshot,
) -> u64 {
    debug_assert!(container.is_container);

    let mut minimum = container.offset + 1;
    let maximum = minimum + container.size;

    for sibling in &table.partitions {
        if sibling.number == container.number {
            continue;
        }
        let end = sibling.end();
        if end > minimum && end <= maximum {
            minimum = end;
        }
    }

    minimum - container.offset
}

/// Whether `offset` falls inside a DOS extended partition.
pub fn is_inside_dos_extended(table: &PartitionTableSnapshot, offset: u64) -> bool {
    table
        .partitions
        .iter()
        .any(|p| p.is_container && offset >= p.offset && offset < p.end())
}

/// Partitions not nested inside a container. DOS tables allow at most
/// four of these.
pub fn count_primary_dos_partitions(table: &PartitionTableSnapshot) -> u32 {
    table.partitions.iter().filter(|p| !p.is_contained).count() as u32
}

/// Whether the table holds a DOS extended partition.
pub fn have_dos_extended(table: &PartitionTableSnapshot) -> bool {
    table.partitions.iter().any(|p| p.is_container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::zvariant::OwnedObjectPath;

    fn partition(number: u32, offset: u64, size: u64) -> PartitionSnapshot {
        PartitionSnapshot {
            object: OwnedObjectPath::try_from(format!("/t/block_devices/sda{number}")).unwrap(),
            number,
            offset,
            size,
            is_container: false,
            is_contained: false,
        }
    }

    fn table(device_size: u64, partitions: Vec<PartitionSnapshot>) -> PartitionTableSnapshot {
        PartitionTableSnapshot {
            device_size,
            partitions,
        }
    }

    #[test]
    fn grow_stops_at_the_next_partition_boundary() {
        let p1 = partition(1, 0, 300);
        let p2 = partition(2, 500, 200);
        let t = table(1000, vec![p1.clone(), p2.clone()]);

        assert_eq!(calc_space_to_grow(&t, &p1), 500);
    }

    #[test]
    fn grow_of_the_last_partition_reaches_the_end_of_the_device() {
        let p1 = partition(1, 0, 300);
        let p2 = partition(2, 500, 200);
        let t = table(1000, vec![p1.clone(), p2.clone()]);

        assert_eq!(calc_space_to_grow(&t, &p2), 500);
    }

    #[test]
    fn grow_on_a_single_partition_table_spans_the_device() {
        let p1 = partition(1, 100, 50);
        let t = table(1000, vec![p1.clone()]);

        assert_eq!(calc_space_to_grow(&t, &p1), 900);
    }

    #[test]
    fn shrink_cannot_truncate_a_contained_logical_partition() {
        let mut extended = partition(1, 0, 1000);
        extended.is_container = true;
        let mut logical = partition(5, 100, 300);
        logical.is_contained = true;
        let t = table(1000, vec![extended.clone(), logical]);

        assert_eq!(calc_space_to_shrink_extended(&t, &extended), 400);
    }

    #[test]
    fn shrink_of_an_empty_container_collapses_to_its_start() {
        let mut extended = partition(1, 200, 600);
        extended.is_container = true;
        let t = table(1000, vec![extended.clone()]);

        assert_eq!(calc_space_to_shrink_extended(&t, &extended), 1);
    }

    #[test]
    fn offsets_inside_the_extended_partition_are_detected() {
        let mut extended = partition(1, 200, 400);
        extended.is_container = true;
        let t = table(1000, vec![extended, partition(2, 700, 100)]);

        assert!(is_inside_dos_extended(&t, 200));
        assert!(is_inside_dos_extended(&t, 599));
        assert!(!is_inside_dos_extended(&t, 600));
        assert!(!is_inside_dos_extended(&t, 750));
    }

    #[test]
    fn logical_partitions_do_not_count_as_primary() {
        let mut extended = partition(4, 600, 400);
        extended.is_container = true;
        let mut logical = partition(5, 650, 100);
        logical.is_contained = true;
        let t = table(
            1000,
            vec![
                partition(1, 0, 200),
                partition(2, 200, 200),
                extended,
                logical,
            ],
        );

        assert_eq!(count_primary_dos_partitions(&t), 3);
    }

    #[test]
    fn extended_partition_presence_is_reported() {
        let plain = table(1000, vec![partition(1, 0, 200)]);
        assert!(!have_dos_extended(&plain));

        let mut extended = partition(2, 200, 400);
        extended.is_container = true;
        let with_extended = table(1000, vec![partition(1, 0, 200), extended]);
        assert!(have_dos_extended(&with_extended));
    }

    #[test]
    fn empty_table_reports_identity_values() {
        let t = table(1000, vec![]);

        assert!(!is_inside_dos_extended(&t, 500));
        assert_eq!(count_primary_dos_partitions(&t), 0);
        assert!(!have_dos_extended(&t));
    }
}
