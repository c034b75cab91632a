//! On-disk layout of the lookup map
//!
//! ```text
//! +-------------------+  0
//! | MapHeader         |
//! +-------------------+  HEADER_SIZE
//! | u32 buckets[n]    |  entry index per bucket, 0 = empty
//! +-------------------+  entry_base_offset
//! | MapEntry[0]       |  reserved "no entry"
//! | MapEntry[1..]     |
//! +-------------------+  string_base_offset
//! | key/value bytes   |
//! +-------------------+  map_size
//! ```
//!
//! All integers are native-endian; offsets are relative to the start of the
//! file so the image can be mapped anywhere.

use core::mem::size_of;

pub use plexrpc_core::constants::LOOKUP_MAP_VERSION;

/// `remap_flag` while the mapping is current
pub const REMAP_VALID: u8 = b'n';
/// `remap_flag` once a newer map has been renamed over this one
pub const REMAP_STALE: u8 = b'Y';

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapHeader {
    pub version: u32,
    pub remap_flag: u8,
    pub hash_table_size: u32,
    pub maximum_entry_index: u32,
    pub map_size: u32,
    pub entry_base_offset: u32,
    pub string_base_offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapEntry {
    pub key_offset: i32,
    pub key_length: i32,
    pub value_offset: i32,
    pub value_length: i32,
    /// Next entry in the bucket chain, 0 ends it
    pub next_index: i32,
}

pub const HEADER_SIZE: usize = size_of::<MapHeader>();
pub const ENTRY_SIZE: usize = size_of::<MapEntry>();
pub const BUCKET_SIZE: usize = size_of::<u32>();

// Field offsets within the header
pub mod offsets {
    use super::{MapEntry, MapHeader};
    use core::mem::offset_of;

    pub const VERSION: usize = offset_of!(MapHeader, version);
    pub const REMAP_FLAG: usize = offset_of!(MapHeader, remap_flag);
    pub const HASH_TABLE_SIZE: usize = offset_of!(MapHeader, hash_table_size);
    pub const MAXIMUM_ENTRY_INDEX: usize = offset_of!(MapHeader, maximum_entry_index);
    pub const MAP_SIZE: usize = offset_of!(MapHeader, map_size);
    pub const ENTRY_BASE: usize = offset_of!(MapHeader, entry_base_offset);
    pub const STRING_BASE: usize = offset_of!(MapHeader, string_base_offset);

    pub const ENTRY_KEY_OFFSET: usize = offset_of!(MapEntry, key_offset);
    pub const ENTRY_KEY_LENGTH: usize = offset_of!(MapEntry, key_length);
    pub const ENTRY_VALUE_OFFSET: usize = offset_of!(MapEntry, value_offset);
    pub const ENTRY_VALUE_LENGTH: usize = offset_of!(MapEntry, value_length);
    pub const ENTRY_NEXT: usize = offset_of!(MapEntry, next_index);
}

/// Bucket hash: `h += h << 5; h ^= byte`, wrapping
#[inline]
pub fn hash_key(key: &[u8]) -> u32 {
    key.iter().fold(0u32, |h, &b| {
        let h = h.wrapping_add(h << 5);
        h ^ u32::from(b)
    })
}

/// Bucket count for `entries` keys: double plus seven, always odd
#[inline]
pub fn bucket_count(entries: usize) -> u32 {
    (entries as u32).wrapping_mul(2).wrapping_add(7)
}

impl MapHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut put = |at: usize, v: u32| out[at..at + 4].copy_from_slice(&v.to_ne_bytes());
        put(offsets::VERSION, self.version);
        put(offsets::HASH_TABLE_SIZE, self.hash_table_size);
        put(offsets::MAXIMUM_ENTRY_INDEX, self.maximum_entry_index);
        put(offsets::MAP_SIZE, self.map_size);
        put(offsets::ENTRY_BASE, self.entry_base_offset);
        put(offsets::STRING_BASE, self.string_base_offset);
        out[offsets::REMAP_FLAG] = self.remap_flag;
        out
    }
}

impl MapEntry {
    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        let fields = [
            (offsets::ENTRY_KEY_OFFSET, self.key_offset),
            (offsets::ENTRY_KEY_LENGTH, self.key_length),
            (offsets::ENTRY_VALUE_OFFSET, self.value_offset),
            (offsets::ENTRY_VALUE_LENGTH, self.value_length),
            (offsets::ENTRY_NEXT, self.next_index),
        ];
        for (at, v) in fields {
            out[at..at + 4].copy_from_slice(&v.to_ne_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(offsets::VERSION, 0);
        assert_eq!(offsets::REMAP_FLAG, 4);
        assert_eq!(offsets::HASH_TABLE_SIZE, 8);
        assert_eq!(offsets::STRING_BASE, 24);
        assert_eq!(HEADER_SIZE, 28);
        assert_eq!(ENTRY_SIZE, 20);
    }

    #[test]
    fn test_hash_known_values() {
        assert_eq!(hash_key(b""), 0);
        assert_eq!(hash_key(b"a"), 97);
        // (97 * 33) ^ 98
        assert_eq!(hash_key(b"ab"), (97 * 33) ^ 98);
        // Long keys wrap instead of overflowing
        let _ = hash_key(&[0xff; 4096]);
    }

    #[test]
    fn test_bucket_count_is_odd() {
        for n in [0, 1, 2, 100, 4097] {
            assert_eq!(bucket_count(n) % 2, 1);
        }
    }

    #[test]
    fn test_header_bytes() {
        let h = MapHeader {
            version: LOOKUP_MAP_VERSION,
            remap_flag: REMAP_VALID,
            hash_table_size: 9,
            ..Default::default()
        };
        let bytes = h.to_bytes();
        assert_eq!(&bytes[0..4], &1001u32.to_ne_bytes());
        assert_eq!(bytes[4], b'n');
        assert_eq!(&bytes[8..12], &9u32.to_ne_bytes());
    }
}
