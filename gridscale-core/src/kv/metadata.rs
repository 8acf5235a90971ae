//! Chunk metadata: birth and last-write stamps per connection path

use super::NonVolatileHashMap;
use crate::{ConnectionPath, Result, Timestamp};
use std::sync::Arc;

/// Field stamped when a chunk path first receives data
pub const BIRTH_FIELD: &str = "birth";

/// Field updated on every write to a chunk path
pub const LAST_WRITE_FIELD: &str = "lastWrite";

const KEY_PREFIX: &str = "meta:";

/// View over a `NonVolatileHashMap` holding per-path timestamps
///
/// A path may carry several birth stamps: `birth` is stamped once by the
/// orchestrator, `birth:<signature>` is refreshed by every write acquisition
/// of a worker handle. Any of them keeps the path alive.
#[derive(Clone)]
pub struct ChunkMetadata {
    map: Arc<dyn NonVolatileHashMap>,
}

impl ChunkMetadata {
    pub fn new(map: Arc<dyn NonVolatileHashMap>) -> Self {
        Self { map }
    }

    fn key(path: &ConnectionPath) -> String {
        format!("{}{}", KEY_PREFIX, path)
    }

    fn birth_field(signature: Option<&str>) -> String {
        match signature {
            Some(sig) => format!("{}:{}", BIRTH_FIELD, sig),
            None => BIRTH_FIELD.to_string(),
        }
    }

    /// Stamp a birth field unless one with the same name exists
    pub fn stamp_birth(
        &self,
        path: &ConnectionPath,
        signature: Option<&str>,
        now: Timestamp,
    ) -> Result<bool> {
        let field = Self::birth_field(signature);
        self.map.set_if_absent(&Self::key(path), &field, &now.to_string())
    }

    /// Overwrite the `birth:<signature>` field with `now`
    pub fn refresh_birth(
        &self,
        path: &ConnectionPath,
        signature: &str,
        now: Timestamp,
    ) -> Result<()> {
        let field = Self::birth_field(Some(signature));
        self.map.set(&Self::key(path), &[(field, now.to_string())])
    }

    /// Record a write: birth if missing, last write always
    pub fn touch_write(&self, path: &ConnectionPath, now: Timestamp) -> Result<()> {
        self.stamp_birth(path, None, now)?;
        self.map.set(
            &Self::key(path),
            &[(LAST_WRITE_FIELD.to_string(), now.to_string())],
        )
    }

    /// Every birth stamp recorded for a path
    pub fn births(&self, path: &ConnectionPath) -> Result<Vec<Timestamp>> {
        let key = Self::key(path);
        let fields: Vec<String> = self
            .map
            .get_fields(&key)?
            .into_iter()
            .filter(|f| f.starts_with(BIRTH_FIELD))
            .collect();
        let values = self.map.get_field_values(&key, &fields)?;
        Ok(values.values().filter_map(|v| v.parse().ok()).collect())
    }

    /// Newest birth stamp of a path
    pub fn latest_birth(&self, path: &ConnectionPath) -> Result<Option<Timestamp>> {
        Ok(self.births(path)?.into_iter().max())
    }

    /// Last write stamp of a path, if it was ever written
    pub fn last_write(&self, path: &ConnectionPath) -> Result<Option<Timestamp>> {
        let values = self
            .map
            .get_field_values(&Self::key(path), &[LAST_WRITE_FIELD.to_string()])?;
        Ok(values.get(LAST_WRITE_FIELD).and_then(|v| v.parse().ok()))
    }

    /// Most recent write across a set of paths; 0 when none was written
    pub fn latest_write<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a ConnectionPath>,
    ) -> Result<Timestamp> {
        let mut latest = 0;
        for path in paths {
            if let Some(ts) = self.last_write(path)? {
                latest = latest.max(ts);
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryHashMap;

    #[test]
    fn test_birth_is_stamped_once() {
        let meta = ChunkMetadata::new(Arc::new(MemoryHashMap::new()));
        let path = ConnectionPath::from("root/d0/D-0-0");

        meta.touch_write(&path, 100).unwrap();
        meta.touch_write(&path, 200).unwrap();
        meta.stamp_birth(&path, Some("worker-1"), 150).unwrap();

        let mut births = meta.births(&path).unwrap();
        births.sort();
        assert_eq!(births, vec![100, 150]);
        assert_eq!(meta.last_write(&path).unwrap(), Some(200));
    }

    #[test]
    fn test_refresh_moves_signed_birth_forward() {
        let meta = ChunkMetadata::new(Arc::new(MemoryHashMap::new()));
        let path = ConnectionPath::from("root/d0/D-0-0");
        assert_eq!(meta.latest_birth(&path).unwrap(), None);

        meta.touch_write(&path, 100).unwrap();
        meta.refresh_birth(&path, "worker-0", 120).unwrap();
        meta.refresh_birth(&path, "worker-0", 300).unwrap();

        let mut births = meta.births(&path).unwrap();
        births.sort();
        assert_eq!(births, vec![100, 300]);
        assert_eq!(meta.latest_birth(&path).unwrap(), Some(300));
    }

    #[test]
    fn test_latest_write() {
        let meta = ChunkMetadata::new(Arc::new(MemoryHashMap::new()));
        let a = ConnectionPath::from("a");
        let b = ConnectionPath::from("b");
        let c = ConnectionPath::from("c");
        meta.touch_write(&a, 10).unwrap();
        meta.touch_write(&b, 30).unwrap();

        assert_eq!(meta.latest_write([&a, &b, &c]).unwrap(), 30);
        assert_eq!(meta.latest_write([&c]).unwrap(), 0);
    }
}
