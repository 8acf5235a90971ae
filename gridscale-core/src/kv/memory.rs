//! In-memory hash map

use super::NonVolatileHashMap;
use crate::{GridError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

pub(crate) type Hashes = HashMap<String, BTreeMap<String, String>>;

/// Process-local `NonVolatileHashMap`
#[derive(Debug, Default)]
pub struct MemoryHashMap {
    hashes: RwLock<Hashes>,
}

impl MemoryHashMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_hashes(hashes: Hashes) -> Self {
        Self {
            hashes: RwLock::new(hashes),
        }
    }

    pub(crate) fn snapshot(&self) -> Hashes {
        self.hashes.read().clone()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.hashes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NonVolatileHashMap for MemoryHashMap {
    fn set(&self, key: &str, pairs: &[(String, String)]) -> Result<()> {
        let mut hashes = self.hashes.write();
        let hash = hashes.entry(key.to_string()).or_default();
        for (field, value) in pairs {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    fn get_fields(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .hashes
            .read()
            .get(key)
            .map(|hash| hash.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn get_field_values(&self, key: &str, fields: &[String]) -> Result<HashMap<String, String>> {
        let hashes = self.hashes.read();
        let Some(hash) = hashes.get(key) else {
            return Ok(HashMap::new());
        };
        Ok(fields
            .iter()
            .filter_map(|f| hash.get(f).map(|v| (f.clone(), v.clone())))
            .collect())
    }

    fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        let mut hashes = self.hashes.write();
        let hash = hashes
            .remove(key)
            .ok_or_else(|| GridError::Internal(format!("rename of missing key {}", key)))?;
        hashes.insert(new_key.to_string(), hash);
        Ok(())
    }

    fn del(&self, keys: &[String]) -> Result<usize> {
        let mut hashes = self.hashes.write();
        Ok(keys.iter().filter(|k| hashes.remove(*k).is_some()).count())
    }

    fn del_fields(&self, key: &str, fields: &[String]) -> Result<usize> {
        let mut hashes = self.hashes.write();
        let Some(hash) = hashes.get_mut(key) else {
            return Ok(0);
        };
        let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
        if hash.is_empty() {
            hashes.remove(key);
        }
        Ok(removed)
    }

    fn set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut hashes = self.hashes.write();
        let hash = hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }
}
