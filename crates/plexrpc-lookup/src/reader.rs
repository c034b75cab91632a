//! Read side of the lookup map
//!
//! A `LookupReader` belongs to one thread. It maps the file once and keeps
//! using that image until the publisher flags it stale, at which point the
//! next lookup remaps from the same path.

use std::fs::File;
use std::path::{Path, PathBuf};

use plexrpc_core::{kdebug, kwarn, Fault, FaultCode, FaultResult};

use crate::layout::{hash_key, offsets, BUCKET_SIZE, ENTRY_SIZE, HEADER_SIZE, LOOKUP_MAP_VERSION, REMAP_VALID};
use crate::mapping::MapRegion;

/// Extra remaps tolerated for a single lookup before giving up
const MAX_REMAPS: usize = 2;

/// One decoded entry, as stored in the map
#[derive(Debug, Clone, Copy)]
struct EntryView {
    key_offset: i32,
    key_length: i32,
    value_offset: i32,
    value_length: i32,
    next_index: i32,
}

pub struct LookupReader {
    path: PathBuf,
    map: Option<MapRegion>,
    remaps: u64,
}

impl LookupReader {
    /// Reader for `path`; nothing is mapped until `map_reader`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            map: None,
            remaps: 0,
        }
    }

    /// Create and map in one step
    pub fn open(path: impl Into<PathBuf>) -> FaultResult<Self> {
        let mut reader = Self::new(path);
        reader.map_reader()?;
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Number of times a stale image was replaced
    pub fn remap_count(&self) -> u64 {
        self.remaps
    }

    /// (Re)map the file. Any previous mapping is released first, so a failure
    /// leaves the reader unmapped.
    pub fn map_reader(&mut self) -> FaultResult<usize> {
        self.map = None;

        let file = File::open(&self.path)
            .map_err(|e| Fault::from_io(FaultCode::OpenForMmapFailed, "open", &e))?;
        let size = file
            .metadata()
            .map_err(|e| Fault::from_io(FaultCode::ShmFstatFailed, "fstat", &e))?
            .len() as usize;
        if size < HEADER_SIZE {
            return Err(Fault::new(
                FaultCode::ShmImpossiblySmall,
                format!("{} is {} bytes, smaller than the map header", self.path.display(), size),
            ));
        }

        let region = MapRegion::map(&file, size, false)
            .map_err(|e| Fault::from_io(FaultCode::ShmMmapFailed, "mmap", &e))?;

        let version = region.read_u32(offsets::VERSION).unwrap_or(0);
        if version != LOOKUP_MAP_VERSION {
            return Err(Fault::new(
                FaultCode::ShmVersionMisMatch,
                format!("map version {} but expected {}", version, LOOKUP_MAP_VERSION),
            ));
        }

        kdebug!("lookup: mapped {} ({} bytes)", self.path.display(), size);
        self.map = Some(region);
        Ok(size)
    }

    /// Remap while the current image is flagged stale
    fn ensure_current(&mut self) -> FaultResult<()> {
        for _ in 0..MAX_REMAPS {
            match &self.map {
                Some(map) if map.remap_flag() == REMAP_VALID => return Ok(()),
                Some(_) => {
                    self.remaps += 1;
                    self.map_reader()?;
                }
                None => return Err(Fault::from_code(FaultCode::LookupButNoMap)),
            }
        }
        match &self.map {
            Some(map) if map.remap_flag() == REMAP_VALID => Ok(()),
            _ => {
                kwarn!("lookup: {} still flagged stale after {} remaps", self.path.display(), MAX_REMAPS);
                Err(Fault::from_code(FaultCode::PersistentRemapFlag))
            }
        }
    }

    /// Resolve a search key to its connect path.
    ///
    /// An exact match wins; otherwise trailing `.segment`s are dropped one at
    /// a time until a shorter key matches or nothing is left.
    pub fn find_service(&mut self, search_key: &str) -> FaultResult<String> {
        if self.map.is_none() {
            return Err(Fault::from_code(FaultCode::LookupButNoMap));
        }
        self.ensure_current()?;
        let map = self.map.as_ref().ok_or_else(|| Fault::from_code(FaultCode::LookupButNoMap))?;
        let image = Image::new(map)?;

        let mut key = search_key.as_bytes();
        while !key.is_empty() {
            if let Some(value) = image.lookup(key) {
                return Ok(String::from_utf8_lossy(value).into_owned());
            }
            key = match key.iter().rposition(|&b| b == b'.') {
                Some(dot) => &key[..dot],
                None => &[],
            };
        }

        Err(Fault::new(
            FaultCode::ServiceNotFound,
            format!("no lookup entry for {}", search_key),
        ))
    }

    /// Every `(key, value)` pair in bucket order
    pub fn entries(&self) -> FaultResult<Vec<(String, String)>> {
        let map = self.map.as_ref().ok_or_else(|| Fault::from_code(FaultCode::LookupButNoMap))?;
        let image = Image::new(map)?;
        let mut out = Vec::new();
        for bucket in 0..image.buckets {
            let mut index = image.bucket(bucket);
            let mut hops = 0;
            while let Some(entry) = image.entry(index) {
                if let (Some(k), Some(v)) = (
                    image.string(entry.key_offset, entry.key_length),
                    image.string(entry.value_offset, entry.value_length),
                ) {
                    out.push((
                        String::from_utf8_lossy(k).into_owned(),
                        String::from_utf8_lossy(v).into_owned(),
                    ));
                }
                index = entry.next_index;
                hops += 1;
                if hops > image.max_entry {
                    break;
                }
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for LookupReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupReader")
            .field("path", &self.path)
            .field("mapped", &self.map.is_some())
            .field("remaps", &self.remaps)
            .finish()
    }
}

// ── Image access ──

/// Header fields of a mapped image, validated against the mapping size
struct Image<'a> {
    map: &'a MapRegion,
    buckets: u32,
    max_entry: u32,
    entry_base: usize,
    string_base: usize,
}

impl<'a> Image<'a> {
    fn new(map: &'a MapRegion) -> FaultResult<Self> {
        let read = |at| map.read_u32(at).ok_or_else(|| Fault::from_code(FaultCode::ShmImpossiblySmall));
        let buckets = read(offsets::HASH_TABLE_SIZE)?;
        if buckets == 0 {
            return Err(Fault::new(FaultCode::MapInitializationFailed, "map has no hash buckets"));
        }
        Ok(Self {
            map,
            buckets,
            max_entry: read(offsets::MAXIMUM_ENTRY_INDEX)?,
            entry_base: read(offsets::ENTRY_BASE)? as usize,
            string_base: read(offsets::STRING_BASE)? as usize,
        })
    }

    fn bucket(&self, bucket: u32) -> i32 {
        self.map
            .read_u32(HEADER_SIZE + bucket as usize * BUCKET_SIZE)
            .map(|v| v as i32)
            .unwrap_or(0)
    }

    /// Entry at `index`; 0 and anything out of range end a chain
    fn entry(&self, index: i32) -> Option<EntryView> {
        if index <= 0 || index as u32 >= self.max_entry {
            return None;
        }
        let at = self.entry_base.checked_add(index as usize * ENTRY_SIZE)?;
        let field = |off: usize| self.map.read_i32(at + off);
        Some(EntryView {
            key_offset: field(offsets::ENTRY_KEY_OFFSET)?,
            key_length: field(offsets::ENTRY_KEY_LENGTH)?,
            value_offset: field(offsets::ENTRY_VALUE_OFFSET)?,
            value_length: field(offsets::ENTRY_VALUE_LENGTH)?,
            next_index: field(offsets::ENTRY_NEXT)?,
        })
    }

    fn string(&self, offset: i32, length: i32) -> Option<&'a [u8]> {
        if offset < 0 || length < 0 {
            return None;
        }
        self.map
            .bytes(self.string_base.checked_add(offset as usize)?, length as usize)
    }

    fn lookup(&self, key: &[u8]) -> Option<&'a [u8]> {
        let mut index = self.bucket(hash_key(key) % self.buckets);
        // A corrupt chain could loop; no chain is longer than the entry count
        let mut hops = 0;
        while let Some(entry) = self.entry(index) {
            if entry.key_length as usize == key.len()
                && self.string(entry.key_offset, entry.key_length) == Some(key)
            {
                return self.string(entry.value_offset, entry.value_length);
            }
            index = entry.next_index;
            hops += 1;
            if hops > self.max_entry {
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_path;
    use crate::writer::LookupWriter;

    #[test]
    fn test_open_missing_file() {
        let path = scratch_path("missing");
        let err = LookupReader::open(&path).unwrap_err();
        assert_eq!(err.code(), FaultCode::OpenForMmapFailed);
        assert!(err.text().starts_with("open failed"));
    }

    #[test]
    fn test_small_and_wrong_version() {
        let path = scratch_path("small");
        std::fs::write(&path, b"tiny").unwrap();
        assert_eq!(LookupReader::open(&path).unwrap_err().code(), FaultCode::ShmImpossiblySmall);

        std::fs::write(&path, vec![0u8; 64]).unwrap();
        let mut reader = LookupReader::new(&path);
        assert_eq!(reader.map_reader().unwrap_err().code(), FaultCode::ShmVersionMisMatch);
        assert!(!reader.is_mapped());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_lookup_without_map() {
        let mut reader = LookupReader::new("/nonexistent/plexrpc.map");
        assert_eq!(
            reader.find_service("app.r.1.fn").unwrap_err().code(),
            FaultCode::LookupButNoMap
        );
        assert_eq!(reader.entries().unwrap_err().code(), FaultCode::LookupButNoMap);
    }

    #[test]
    fn test_exact_and_truncated_match() {
        let path = scratch_path("match");
        let mut writer = LookupWriter::new(&path);
        writer
            .build_from_pairs([
                ("echo.r.1", "/tmp/echo-any.sock"),
                ("echo.r.1.ping", "/tmp/echo-ping.sock"),
                ("echo.j.1", "/tmp/echo-json.sock"),
            ])
            .unwrap();

        let mut reader = LookupReader::open(&path).unwrap();
        assert_eq!(reader.find_service("echo.r.1.ping").unwrap(), "/tmp/echo-ping.sock");
        assert_eq!(reader.find_service("echo.r.1.pong").unwrap(), "/tmp/echo-any.sock");
        assert_eq!(reader.find_service("echo.j.1.ping").unwrap(), "/tmp/echo-json.sock");
        assert_eq!(
            reader.find_service("echo.x.1.ping").unwrap_err().code(),
            FaultCode::ServiceNotFound
        );
        assert_eq!(reader.find_service("").unwrap_err().code(), FaultCode::ServiceNotFound);

        let mut all = reader.entries().unwrap();
        all.sort();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], ("echo.j.1".to_string(), "/tmp/echo-json.sock".to_string()));
        drop(writer);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_no_prefix_match_on_partial_segment() {
        let path = scratch_path("segment");
        let mut writer = LookupWriter::new(&path);
        writer.build_from_pairs([("app.r.1.A", "/tmp/a.sock")]).unwrap();

        let mut reader = LookupReader::open(&path).unwrap();
        assert_eq!(reader.find_service("app.r.1.A").unwrap(), "/tmp/a.sock");
        assert_eq!(
            reader.find_service("app.r.1.B").unwrap_err().code(),
            FaultCode::ServiceNotFound
        );
        assert_eq!(
            reader.find_service("app.r.1.AB").unwrap_err().code(),
            FaultCode::ServiceNotFound
        );
        drop(writer);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_live_rebuild_is_remapped() {
        let path = scratch_path("rebuild");
        let mut writer = LookupWriter::new(&path);
        writer.build_from_pairs([("svc.r.1", "/tmp/old.sock")]).unwrap();

        let mut reader = LookupReader::open(&path).unwrap();
        assert_eq!(reader.find_service("svc.r.1.f").unwrap(), "/tmp/old.sock");
        assert_eq!(reader.remap_count(), 0);

        writer
            .build_from_pairs([("svc.r.1", "/tmp/new.sock"), ("other.r.2", "/tmp/other.sock")])
            .unwrap();
        assert_eq!(reader.find_service("svc.r.1.f").unwrap(), "/tmp/new.sock");
        assert_eq!(reader.remap_count(), 1);
        assert_eq!(reader.find_service("other.r.2").unwrap(), "/tmp/other.sock");
        assert_eq!(reader.remap_count(), 1);

        drop(writer);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_empty_map_finds_nothing() {
        let path = scratch_path("empty");
        let mut writer = LookupWriter::new(&path);
        writer.build_from_pairs(std::iter::empty::<(&str, &str)>()).unwrap();
        let mut reader = LookupReader::open(&path).unwrap();
        assert_eq!(reader.find_service("a.r.1").unwrap_err().code(), FaultCode::ServiceNotFound);
        assert!(reader.entries().unwrap().is_empty());
        drop(writer);
        std::fs::remove_file(&path).unwrap();
    }
}
