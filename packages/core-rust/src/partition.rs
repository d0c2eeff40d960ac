//! Partition identifiers and thread ownership.
//!
//! Operations target either a concrete partition (`Some(id)`) or no partition
//! at all (`None`, the "generic" case). On the wire the generic case is encoded
//! as [`GENERIC_PARTITION_ID`] so that a packet header stays fixed-width.

/// Default number of partitions.
pub const DEFAULT_PARTITION_COUNT: u32 = 271;

/// Wire encoding of "no partition" (generic operation).
pub const GENERIC_PARTITION_ID: i32 = -1;

/// Index of the partition thread that owns `partition_id` when the partitions
/// are spread over `thread_count` threads.
///
/// The mapping is a plain modulo and therefore stable for the lifetime of a
/// fixed thread count.
///
/// # Panics
///
/// Panics if `thread_count` is zero.
#[must_use]
pub fn partition_thread_index(partition_id: u32, thread_count: usize) -> usize {
    assert!(thread_count > 0, "thread_count must be positive");
    partition_id as usize % thread_count
}

/// Decodes a wire partition id: negative values mean "generic".
#[must_use]
pub fn from_wire(raw: i32) -> Option<u32> {
    u32::try_from(raw).ok()
}

/// Encodes a partition id for the wire.
///
/// Partition counts are validated to fit in `i32` when an executor starts, so
/// truncation cannot occur for ids produced inside this system.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn to_wire(partition_id: Option<u32>) -> i32 {
    partition_id.map_or(GENERIC_PARTITION_ID, |id| id as i32)
}
