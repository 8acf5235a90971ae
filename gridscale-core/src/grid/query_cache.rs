//! Per-plan query-result cache
//!
//! Layout in the hash map:
//! - `qcache:index:<crc32 of signature>` holds `signature` and `target`
//! - `qcache:data:<uuid>` holds `cachedTime`, `pageCount` and `page:<n>`
//! - `qcache:entries` maps every index key to its `cachedTime`
//!
//! New results are written under `qcache:tmp:<uuid>`, renamed to a data key
//! and only then does the index entry move to it, so a reader never sees a
//! partially written result. Storing beyond `capacity` entries evicts the
//! oldest ones.
//!
//! An entry is served only while its `cachedTime` is newer than the last write
//! of every source chunk; a write stamped in the same millisecond counts as
//! newer. With a chunk TTL, an entry is also stale once a source expired
//! after the entry was cached.

use crate::kv::{ChunkMetadata, NonVolatileHashMap};
use crate::{now_millis, ConnectionPath, GridError, IterationPlan, Result, Row, Timestamp};
use std::sync::Arc;
use tracing::debug;

const INDEX_PREFIX: &str = "qcache:index:";
const DATA_PREFIX: &str = "qcache:data:";
const TMP_PREFIX: &str = "qcache:tmp:";
const ENTRIES_KEY: &str = "qcache:entries";

const SIGNATURE_FIELD: &str = "signature";
const TARGET_FIELD: &str = "target";
const CACHED_TIME_FIELD: &str = "cachedTime";
const PAGE_COUNT_FIELD: &str = "pageCount";

/// Canonical description of one unit of read work
pub fn plan_signature(
    plans: &[IterationPlan],
    page_size: usize,
    aggregate: Option<&str>,
) -> String {
    let mut parts: Vec<String> = plans
        .iter()
        .map(|plan| {
            let paths: Vec<&str> = plan.paths.iter().map(|p| p.as_str()).collect();
            let tags: Vec<&str> = plan.tags.iter().map(|t| t.as_str()).collect();
            format!("{}|{}|{}", paths.join(","), tags.join(","), plan.range)
        })
        .collect();
    parts.sort();
    format!("{}#{}#{}", parts.join(";"), page_size, aggregate.unwrap_or(""))
}

/// Query-result cache over a `NonVolatileHashMap`
#[derive(Clone)]
pub struct QueryCache {
    map: Arc<dyn NonVolatileHashMap>,
    metadata: ChunkMetadata,
    ttl: Option<i64>,
    capacity: usize,
}

impl QueryCache {
    pub fn new(map: Arc<dyn NonVolatileHashMap>, metadata: ChunkMetadata) -> Self {
        Self {
            map,
            metadata,
            ttl: None,
            capacity: crate::defaults::QUERY_CACHE_ENTRIES,
        }
    }

    /// Chunk time-to-live the freshness check accounts for
    pub fn with_ttl(mut self, ttl: Option<i64>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Maximum number of cached results
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    fn index_key(signature: &str) -> String {
        format!("{}{:08x}", INDEX_PREFIX, crc32fast::hash(signature.as_bytes()))
    }

    fn page_field(n: usize) -> String {
        format!("page:{}", n)
    }

    /// Data key the index points at, if the index entry is for `signature`
    fn target(&self, signature: &str) -> Result<Option<String>> {
        let index = self.map.get_field_values(
            &Self::index_key(signature),
            &[SIGNATURE_FIELD.to_string(), TARGET_FIELD.to_string()],
        )?;
        if index.get(SIGNATURE_FIELD).map(String::as_str) != Some(signature) {
            return Ok(None);
        }
        Ok(index.get(TARGET_FIELD).cloned())
    }

    /// Cached pages for `signature`, if fresh with respect to `sources`
    pub fn lookup(
        &self,
        signature: &str,
        sources: &[&ConnectionPath],
    ) -> Result<Option<Vec<Vec<Row>>>> {
        self.lookup_at(signature, sources, now_millis())
    }

    /// `lookup` as seen at `now`
    pub fn lookup_at(
        &self,
        signature: &str,
        sources: &[&ConnectionPath],
        now: Timestamp,
    ) -> Result<Option<Vec<Vec<Row>>>> {
        let Some(target) = self.target(signature)? else {
            return Ok(None);
        };

        let header = self.map.get_field_values(
            &target,
            &[CACHED_TIME_FIELD.to_string(), PAGE_COUNT_FIELD.to_string()],
        )?;
        let cached_time: Option<Timestamp> =
            header.get(CACHED_TIME_FIELD).and_then(|v| v.parse().ok());
        let page_count: Option<usize> =
            header.get(PAGE_COUNT_FIELD).and_then(|v| v.parse().ok());
        let (Some(cached_time), Some(page_count)) = (cached_time, page_count) else {
            return Ok(None);
        };

        if !self.is_fresh(&target, cached_time, sources, now)? {
            return Ok(None);
        }

        let fields: Vec<String> = (0..page_count).map(Self::page_field).collect();
        let mut stored = self.map.get_field_values(&target, &fields)?;
        let mut pages = Vec::with_capacity(page_count);
        for field in &fields {
            let encoded = stored
                .remove(field)
                .ok_or_else(|| GridError::Corruption(format!("{} lacks {}", target, field)))?;
            pages.push(serde_json::from_str(&encoded)?);
        }
        Ok(Some(pages))
    }

    fn is_fresh(
        &self,
        target: &str,
        cached_time: Timestamp,
        sources: &[&ConnectionPath],
        now: Timestamp,
    ) -> Result<bool> {
        let latest_write = self.metadata.latest_write(sources.iter().copied())?;
        if cached_time <= latest_write {
            debug!("Cached result {} is stale ({} <= {})", target, cached_time, latest_write);
            return Ok(false);
        }

        let Some(ttl) = self.ttl else {
            return Ok(true);
        };
        for source in sources {
            let Some(birth) = self.metadata.latest_birth(source)? else {
                continue;
            };
            let expiry = birth.saturating_add(ttl);
            if cached_time <= expiry && expiry < now {
                debug!("Cached result {} is stale, {} expired at {}", target, source, expiry);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Number of cached results
    pub fn entries(&self) -> Result<usize> {
        Ok(self.map.get_fields(ENTRIES_KEY)?.len())
    }

    /// Drop the oldest entries beyond capacity, returning how many went
    fn evict_overflow(&self) -> Result<usize> {
        let entries = self.map.get_all(ENTRIES_KEY)?;
        if entries.len() <= self.capacity {
            return Ok(0);
        }

        let mut by_age: Vec<(Timestamp, String)> = entries
            .into_iter()
            .map(|(index, cached)| (cached.parse().unwrap_or(Timestamp::MIN), index))
            .collect();
        by_age.sort();
        let excess = by_age.len() - self.capacity;

        let mut keys = Vec::with_capacity(excess * 2);
        let mut fields = Vec::with_capacity(excess);
        for (_, index) in by_age.into_iter().take(excess) {
            let target = self.map.get_field_values(&index, &[TARGET_FIELD.to_string()])?;
            keys.extend(target.into_values());
            keys.push(index.clone());
            fields.push(index);
        }
        self.map.del(&keys)?;
        self.map.del_fields(ENTRIES_KEY, &fields)?;
        debug!("Evicted {} cached results", excess);
        Ok(excess)
    }

    /// Persist pages computed from data as of `cached_time`
    pub fn store(&self, signature: &str, pages: &[Vec<Row>], cached_time: Timestamp) -> Result<()> {
        let id = uuid::Uuid::new_v4();
        let tmp_key = format!("{}{}", TMP_PREFIX, id);
        let data_key = format!("{}{}", DATA_PREFIX, id);

        let mut fields = Vec::with_capacity(pages.len() + 2);
        fields.push((CACHED_TIME_FIELD.to_string(), cached_time.to_string()));
        fields.push((PAGE_COUNT_FIELD.to_string(), pages.len().to_string()));
        for (n, page) in pages.iter().enumerate() {
            fields.push((Self::page_field(n), serde_json::to_string(page)?));
        }

        self.map.set(&tmp_key, &fields)?;
        self.map.rename(&tmp_key, &data_key)?;

        // the index may point at another signature's data on a crc collision
        let index_key = Self::index_key(signature);
        let previous = self
            .map
            .get_field_values(&index_key, &[TARGET_FIELD.to_string()])?
            .remove(TARGET_FIELD);
        self.map.set(
            &index_key,
            &[
                (SIGNATURE_FIELD.to_string(), signature.to_string()),
                (TARGET_FIELD.to_string(), data_key.clone()),
            ],
        )?;
        if let Some(previous) = previous.filter(|p| *p != data_key) {
            self.map.del(&[previous])?;
        }
        self.map.set(ENTRIES_KEY, &[(index_key, cached_time.to_string())])?;

        debug!("Cached {} pages under {}", pages.len(), data_key);
        self.evict_overflow()?;
        Ok(())
    }
}
