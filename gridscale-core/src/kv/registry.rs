//! Displacement registry
//!
//! Maps a logical chunk id (bucketed by record time) to the chunk ids
//! (bucketed by insert time) that actually hold rows for it. Each field is a
//! displaced chunk id; its value is the insert-time bucket it was written in.

use super::NonVolatileHashMap;
use crate::{Displacement, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const KEY_PREFIX: &str = "displacement:";

/// View over a `NonVolatileHashMap` holding chunk displacement links
#[derive(Clone)]
pub struct DisplacementRegistry {
    map: Arc<dyn NonVolatileHashMap>,
}

impl DisplacementRegistry {
    pub fn new(map: Arc<dyn NonVolatileHashMap>) -> Self {
        Self { map }
    }

    fn key(chunk_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, chunk_id)
    }

    /// Persist every displacement of an upsert plan, returning the link count
    pub fn record(&self, displacements: &BTreeMap<String, Displacement>) -> Result<usize> {
        let mut links = 0;
        for (record_chunk, displacement) in displacements {
            let bucket = displacement.insert_time_bucket.to_string();
            let pairs: Vec<(String, String)> = displacement
                .targets
                .iter()
                .map(|target| (target.clone(), bucket.clone()))
                .collect();
            links += pairs.len();
            self.map.set(&Self::key(record_chunk), &pairs)?;
            debug!(
                "Registered displacement {} -> {:?}",
                record_chunk, displacement.targets
            );
        }
        Ok(links)
    }

    /// Chunk ids holding rows that logically belong to `chunk_id`
    pub fn displaced(&self, chunk_id: &str) -> Result<Vec<String>> {
        self.map.get_fields(&Self::key(chunk_id))
    }
}
