//! # plexrpc-lookup
//!
//! Shared-memory table mapping service search keys to connect paths.
//!
//! The map is a single file holding a versioned header, a hash bucket
//! array, an entry array and a string heap, all addressed by offsets so
//! every process can map it anywhere. A publisher (`LookupWriter`) rebuilds
//! the whole file and renames it into place; readers (`LookupReader`) notice
//! the old image's remap flag and follow.

pub mod layout;
pub mod mapping;
pub mod reader;
pub mod writer;

use std::path::{Path, PathBuf};

use plexrpc_core::constants::{DEFAULT_LOOKUP_MAP_PATH, LOOKUP_MAP_ENV};

pub use layout::{hash_key, LOOKUP_MAP_VERSION};
pub use reader::LookupReader;
pub use writer::{build_image, LookupWriter};

/// Map path from an explicit argument, else the environment, else the
/// built-in default
pub fn resolve_map_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    plexrpc_core::env_get_path(LOOKUP_MAP_ENV).unwrap_or_else(|| PathBuf::from(DEFAULT_LOOKUP_MAP_PATH))
}
