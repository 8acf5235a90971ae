//! Non-volatile hash maps
//!
//! String-keyed maps of string fields backing the displacement registry,
//! chunk metadata and the query-result cache. Two implementations:
//!
//! - **MemoryHashMap**: process-local, lost on exit
//! - **FileHashMap**: append log plus periodically compacted snapshot

mod file;
mod memory;
mod metadata;
mod registry;

pub use file::FileHashMap;
pub use memory::MemoryHashMap;
pub use metadata::{ChunkMetadata, BIRTH_FIELD, LAST_WRITE_FIELD};
pub use registry::DisplacementRegistry;

use crate::Result;
use std::collections::HashMap;

/// Hash-of-hashes store shared by the orchestrator and the workers
pub trait NonVolatileHashMap: Send + Sync {
    /// Merge field/value pairs into the hash at `key`, creating it if needed
    fn set(&self, key: &str, pairs: &[(String, String)]) -> Result<()>;

    /// Field names held at `key`; empty if the key does not exist
    fn get_fields(&self, key: &str) -> Result<Vec<String>>;

    /// Values for the requested fields; missing fields are omitted
    fn get_field_values(&self, key: &str, fields: &[String]) -> Result<HashMap<String, String>>;

    /// Move the hash at `key` to `new_key`, replacing whatever was there
    fn rename(&self, key: &str, new_key: &str) -> Result<()>;

    /// Delete keys, returning how many existed
    fn del(&self, keys: &[String]) -> Result<usize>;

    /// Delete fields of the hash at `key`, returning how many existed
    ///
    /// A hash left without fields is removed.
    fn del_fields(&self, key: &str, fields: &[String]) -> Result<usize>;

    /// Set a field only if it is not present yet
    fn set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let existing = self.get_field_values(key, &[field.to_string()])?;
        if existing.contains_key(field) {
            return Ok(false);
        }
        self.set(key, &[(field.to_string(), value.to_string())])?;
        Ok(true)
    }

    /// Every field with its value
    fn get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let fields = self.get_fields(key)?;
        self.get_field_values(key, &fields)
    }
}
