//! xxHash-based value hashing for partition routing.
//!
//! Partition-column values are hashed to a deterministic 64-bit value and
//! reduced modulo the partition count. The encoding is stable across processes so
//! that every site routes the same key to the same partition.

use xxhash_rust::xxh64;

use crate::value::Value;

/// Fixed seed for deterministic hashing.
const SEED: u64 = 0x517cc1b727220a95;

/// Identifier of a partition (one single-threaded site).
pub type PartitionId = u32;

/// Compute a 64-bit xxHash of a single value.
pub fn hash_value(value: &Value) -> u64 {
    let mut buf = Vec::with_capacity(16);
    encode_value(value, &mut buf);
    xxh64::xxh64(&buf, SEED)
}

/// Route a partition-column value to a partition.
pub fn partition_for(value: &Value, partition_count: u32) -> PartitionId {
    debug_assert!(partition_count > 0);
    (hash_value(value) % u64::from(partition_count)) as PartitionId
}

fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.extend_from_slice(b"\x00NULL\x00"),
        Value::Boolean(v) => {
            buf.push(b'b');
            buf.push(u8::from(*v));
        }
        // Integral doubles hash like the equal integer so that routing does
        // not depend on which numeric type a caller used.
        Value::BigInt(v) => {
            buf.push(b'i');
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Double(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => {
            buf.push(b'i');
            buf.extend_from_slice(&(*v as i64).to_le_bytes());
        }
        Value::Double(v) => {
            buf.push(b'd');
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Value::Text(v) => {
            buf.push(b't');
            buf.extend_from_slice(v.as_bytes());
        }
    }
}
