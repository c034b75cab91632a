//! Build and publish the lookup map
//!
//! The publisher builds a complete image in memory, writes it beside the
//! target as `<path>.tmp`, and renames it into place. Readers of the image
//! being replaced see its remap flag flip to `'Y'` and map the new file on
//! their next lookup.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use plexrpc_core::{kdebug, kinfo, Fault, FaultCode, FaultResult};

use crate::layout::{
    bucket_count, hash_key, MapEntry, MapHeader, BUCKET_SIZE, ENTRY_SIZE, HEADER_SIZE,
    LOOKUP_MAP_VERSION, REMAP_STALE, REMAP_VALID,
};
use crate::mapping::MapRegion;

/// Map files are read-only for everyone; the publisher only ever replaces them
const MAP_FILE_MODE: u32 = 0o444;

fn publish_fault(op: &str, err: &io::Error) -> Fault {
    Fault::from_io(FaultCode::MapInitializationFailed, op, err)
}

// ── Image assembly ──

/// In-memory image: typed header, buckets and entries plus the string heap
struct ImageBuilder {
    header: MapHeader,
    buckets: Vec<u32>,
    entries: Vec<MapEntry>,
    strings: Vec<u8>,
}

impl ImageBuilder {
    fn new(count: usize) -> Self {
        let buckets = bucket_count(count);
        Self {
            header: MapHeader {
                version: LOOKUP_MAP_VERSION,
                remap_flag: REMAP_VALID,
                hash_table_size: buckets,
                maximum_entry_index: count as u32 + 1,
                ..Default::default()
            },
            buckets: vec![0; buckets as usize],
            // Index 0 is the empty-chain sentinel
            entries: vec![MapEntry::default()],
            strings: Vec::new(),
        }
    }

    fn push_string(&mut self, s: &str) -> (i32, i32) {
        let offset = self.strings.len() as i32;
        self.strings.extend_from_slice(s.as_bytes());
        (offset, s.len() as i32)
    }

    /// Insert at the head of the key's bucket chain
    fn insert(&mut self, key: &str, value: &str) {
        let index = self.entries.len() as u32;
        let (key_offset, key_length) = self.push_string(key);
        let (value_offset, value_length) = self.push_string(value);
        let bucket = (hash_key(key.as_bytes()) % self.header.hash_table_size) as usize;

        self.entries.push(MapEntry {
            key_offset,
            key_length,
            value_offset,
            value_length,
            next_index: self.buckets[bucket] as i32,
        });
        self.buckets[bucket] = index;
    }

    fn into_bytes(mut self) -> Vec<u8> {
        let entry_base = HEADER_SIZE + self.buckets.len() * BUCKET_SIZE;
        let string_base = entry_base + self.entries.len() * ENTRY_SIZE;
        let map_size = string_base + self.strings.len();

        self.header.entry_base_offset = entry_base as u32;
        self.header.string_base_offset = string_base as u32;
        self.header.map_size = map_size as u32;

        let mut out = Vec::with_capacity(map_size);
        out.extend_from_slice(&self.header.to_bytes());
        for bucket in &self.buckets {
            out.extend_from_slice(&bucket.to_ne_bytes());
        }
        for entry in &self.entries {
            out.extend_from_slice(&entry.to_bytes());
        }
        out.extend_from_slice(&self.strings);
        out
    }
}

/// Serialize `entries` into a complete map image
pub fn build_image<'a, I>(entries: I) -> Vec<u8>
where
    I: ExactSizeIterator<Item = (&'a str, &'a str)>,
{
    let mut image = ImageBuilder::new(entries.len());
    for (key, value) in entries {
        image.insert(key, value);
    }
    image.into_bytes()
}

// ── Publisher ──

/// Publishes lookup maps to one path, keeping its latest image mapped so the
/// next publish can flag it stale.
pub struct LookupWriter {
    path: PathBuf,
    current: Option<MapRegion>,
}

impl LookupWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build a map from search key to connect path and publish it
    pub fn build_map(&mut self, entries: &BTreeMap<String, String>) -> FaultResult<usize> {
        let image = build_image(entries.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        self.publish(&image)
    }

    /// Same as `build_map` from any pair list; later duplicates win
    pub fn build_from_pairs<I, K, V>(&mut self, pairs: I) -> FaultResult<usize>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries: BTreeMap<String, String> =
            pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.build_map(&entries)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Write, map, and rename `image` over the target. Returns the image size.
    pub fn publish(&mut self, image: &[u8]) -> FaultResult<usize> {
        let temp = self.temp_path();

        match fs::remove_file(&temp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(publish_fault("unlink of previous .tmp", &e)),
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(MAP_FILE_MODE)
            .open(&temp)
            .map_err(|e| publish_fault("open O_CREAT", &e))?;
        file.write_all(image).map_err(|e| publish_fault("write of image", &e))?;

        let region = MapRegion::map(&file, image.len(), true).map_err(|e| publish_fault("mmap", &e))?;
        drop(file);

        // Published through the mapping before the rename makes it visible
        region
            .set_remap_flag(REMAP_VALID)
            .map_err(|e| publish_fault("remap flag", &e))?;

        fs::rename(&temp, &self.path).map_err(|e| publish_fault("rename()", &e))?;

        if let Some(old) = self.current.replace(region) {
            if let Err(e) = old.set_remap_flag(REMAP_STALE) {
                kdebug!("lookup: could not flag previous map stale: {}", e);
            }
        }

        kinfo!("lookup: published {} ({} bytes)", self.path.display(), image.len());
        Ok(image.len())
    }
}

impl std::fmt::Debug for LookupWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupWriter")
            .field("path", &self.path)
            .field("published", &self.current.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::offsets;
    use crate::testutil::scratch_path;

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_image_geometry() {
        let image = build_image([("a.r.1", "/x"), ("b.r.1", "/yy")].into_iter());
        assert_eq!(read_u32(&image, offsets::VERSION), LOOKUP_MAP_VERSION);
        assert_eq!(image[offsets::REMAP_FLAG], REMAP_VALID);
        assert_eq!(read_u32(&image, offsets::HASH_TABLE_SIZE), 11);
        assert_eq!(read_u32(&image, offsets::MAXIMUM_ENTRY_INDEX), 3);

        let entry_base = read_u32(&image, offsets::ENTRY_BASE) as usize;
        let string_base = read_u32(&image, offsets::STRING_BASE) as usize;
        assert_eq!(entry_base, HEADER_SIZE + 11 * BUCKET_SIZE);
        assert_eq!(string_base, entry_base + 3 * ENTRY_SIZE);
        assert_eq!(read_u32(&image, offsets::MAP_SIZE) as usize, image.len());
        assert_eq!(&image[string_base..], b"a.r.1/xb.r.1/yy");
    }

    #[test]
    fn test_colliding_keys_chain_at_head() {
        let mut builder = ImageBuilder::new(40);
        // Find two keys sharing a bucket
        let buckets = builder.header.hash_table_size;
        let first = "k0".to_string();
        let target = hash_key(first.as_bytes()) % buckets;
        let second = (1..10_000)
            .map(|i| format!("k{}", i))
            .find(|k| hash_key(k.as_bytes()) % buckets == target)
            .unwrap();

        builder.insert(&first, "1");
        builder.insert(&second, "2");
        assert_eq!(builder.buckets[target as usize], 2);
        assert_eq!(builder.entries[2].next_index, 1);
        assert_eq!(builder.entries[1].next_index, 0);
    }

    #[test]
    fn test_publish_replaces_tmp_and_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let path = scratch_path("publish");
        let mut writer = LookupWriter::new(&path);
        std::fs::write(writer.temp_path(), b"stale").unwrap();

        let size = writer.build_from_pairs([("s.r.1", "/tmp/s.sock")]).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, size);
        assert_eq!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o444);
        assert!(!writer.temp_path().exists());

        drop(writer);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_publish_into_missing_directory_fails() {
        let mut writer = LookupWriter::new("/nonexistent-plexrpc-dir/lookup.map");
        let err = writer.build_from_pairs([("a.r.1", "/x")]).unwrap_err();
        assert_eq!(err.code(), FaultCode::MapInitializationFailed);
        assert!(err.text().starts_with("open O_CREAT failed"));
    }
}
