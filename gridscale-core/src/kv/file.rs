//! File-persisted hash map
//!
//! The working set lives in a [`MemoryHashMap`]. Every mutation is appended
//! to a log beside the snapshot (`<path>.log`). Once the log holds
//! `compact_after` records, the whole map is written to a sibling temp file,
//! renamed over the snapshot and the log starts over. Opening loads the
//! snapshot and replays the log records newer than it; a torn or corrupt tail
//! ends the replay.
//!
//! Snapshot format:
//! - 4 bytes: magic `GSKV`
//! - 8 bytes: sequence of the last mutation it contains
//! - 4 bytes: payload length
//! - N bytes: bincode-encoded hashes
//! - 4 bytes: CRC32 of everything before it
//!
//! Log record format:
//! - 4 bytes: length of the rest of the record
//! - 8 bytes: sequence
//! - N bytes: bincode-encoded mutation
//! - 4 bytes: CRC32 of sequence and mutation

use super::memory::{Hashes, MemoryHashMap};
use super::NonVolatileHashMap;
use crate::{GridError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"GSKV";

const SNAPSHOT_HEADER: usize = 16;

/// Sequence plus checksum around a mutation
const RECORD_OVERHEAD: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Mutation {
    Set { key: String, pairs: Vec<(String, String)> },
    Rename { key: String, new_key: String },
    Del { keys: Vec<String> },
    DelFields { key: String, fields: Vec<String> },
}

impl Mutation {
    fn apply(self, map: &MemoryHashMap) -> Result<()> {
        match self {
            Mutation::Set { key, pairs } => map.set(&key, &pairs),
            Mutation::Rename { key, new_key } => map.rename(&key, &new_key),
            Mutation::Del { keys } => map.del(&keys).map(drop),
            Mutation::DelFields { key, fields } => map.del_fields(&key, &fields).map(drop),
        }
    }
}

struct LogWriter {
    file: BufWriter<File>,
    /// Sequence of the last mutation applied
    sequence: u64,
    /// Records in the log since the last compaction
    records: usize,
}

/// `NonVolatileHashMap` backed by a snapshot and an append log
pub struct FileHashMap {
    path: PathBuf,
    log_path: PathBuf,
    inner: MemoryHashMap,
    log: Mutex<LogWriter>,
    sync: bool,
    compact_after: usize,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl FileHashMap {
    /// Open a map with default compaction and no fsync per mutation
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(path, false, crate::defaults::KV_COMPACT_AFTER)
    }

    /// Open a map, loading the snapshot and replaying the log at `path`
    ///
    /// With `sync` every log append is fsynced before the mutation returns.
    pub fn open_with(path: impl Into<PathBuf>, sync: bool, compact_after: usize) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (hashes, mut sequence) = if path.exists() {
            let (hashes, sequence) = Self::decode_snapshot(&fs::read(&path)?)?;
            info!("Loaded {} keys from {:?} at sequence {}", hashes.len(), path, sequence);
            (hashes, sequence)
        } else {
            (Hashes::new(), 0)
        };
        let inner = MemoryHashMap::from_hashes(hashes);

        let log_path = sibling(&path, ".log");
        let mut pending_log = false;
        if log_path.exists() {
            let data = fs::read(&log_path)?;
            pending_log = !data.is_empty();
            let mut replayed = 0;
            let mut offset = 0;
            while offset < data.len() {
                match Self::decode_record(&data[offset..]) {
                    Ok((record_sequence, mutation, used)) => {
                        offset += used;
                        if record_sequence <= sequence {
                            continue;
                        }
                        mutation.apply(&inner)?;
                        sequence = record_sequence;
                        replayed += 1;
                    }
                    Err(e) => {
                        warn!(
                            "Discarding {} bytes of {:?} after offset {}: {}",
                            data.len() - offset,
                            log_path,
                            offset,
                            e
                        );
                        break;
                    }
                }
            }
            if replayed > 0 {
                info!("Replayed {} mutations from {:?}", replayed, log_path);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let map = Self {
            path,
            log_path,
            inner,
            log: Mutex::new(LogWriter {
                file: BufWriter::new(file),
                sequence,
                records: 0,
            }),
            sync,
            compact_after: compact_after.max(1),
        };

        // folding the replayed log into the snapshot also drops a torn tail
        if pending_log {
            map.compact(&mut map.log.lock())?;
        }
        Ok(map)
    }

    /// Append a mutation that was already applied in memory
    fn append(&self, log: &mut LogWriter, mutation: &Mutation) -> Result<()> {
        log.sequence += 1;
        let record = Self::encode_record(log.sequence, mutation)?;
        log.file.write_all(&record)?;
        log.file.flush()?;
        if self.sync {
            log.file.get_ref().sync_all()?;
        }
        log.records += 1;

        if log.records >= self.compact_after {
            self.compact(log)?;
        }
        Ok(())
    }

    /// Write the whole map as a new snapshot and truncate the log
    fn compact(&self, log: &mut LogWriter) -> Result<()> {
        log.file.flush()?;
        let encoded = Self::encode_snapshot(&self.inner.snapshot(), log.sequence)?;

        let tmp = sibling(&self.path, ".tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let file = File::create(&self.log_path)?;
        file.sync_all()?;
        log.file = BufWriter::new(file);
        debug!(
            "Compacted {} log records into {:?} at sequence {}",
            log.records, self.path, log.sequence
        );
        log.records = 0;
        Ok(())
    }

    fn encode_snapshot(hashes: &Hashes, sequence: u64) -> Result<Bytes> {
        let payload = bincode::serialize(hashes)?;
        let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER + payload.len() + 4);
        buf.put_slice(MAGIC);
        buf.put_u64_le(sequence);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        Ok(buf.freeze())
    }

    fn decode_snapshot(data: &[u8]) -> Result<(Hashes, u64)> {
        if data.len() < SNAPSHOT_HEADER + 4 || &data[..4] != MAGIC {
            return Err(GridError::InvalidFormat("Invalid hash map snapshot".into()));
        }

        let mut cursor = &data[4..SNAPSHOT_HEADER];
        let sequence = cursor.get_u64_le();
        let len = cursor.get_u32_le() as usize;
        if data.len() != SNAPSHOT_HEADER + len + 4 {
            return Err(GridError::InvalidFormat("Truncated hash map snapshot".into()));
        }

        let body = SNAPSHOT_HEADER + len;
        let expected = (&data[body..]).get_u32_le();
        let actual = crc32fast::hash(&data[..body]);
        if expected != actual {
            return Err(GridError::ChecksumMismatch { expected, actual });
        }

        Ok((bincode::deserialize(&data[SNAPSHOT_HEADER..body])?, sequence))
    }

    fn encode_record(sequence: u64, mutation: &Mutation) -> Result<Bytes> {
        let payload = bincode::serialize(mutation)?;
        let mut body = BytesMut::with_capacity(payload.len() + RECORD_OVERHEAD);
        body.put_u64_le(sequence);
        body.put_slice(&payload);
        let checksum = crc32fast::hash(&body);
        body.put_u32_le(checksum);

        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode the record at the front of `data`: sequence, mutation, bytes used
    fn decode_record(data: &[u8]) -> Result<(u64, Mutation, usize)> {
        if data.len() < 4 {
            return Err(GridError::InvalidFormat("Truncated log record header".into()));
        }
        let len = (&data[..4]).get_u32_le() as usize;
        if len < RECORD_OVERHEAD || data.len() < 4 + len {
            return Err(GridError::InvalidFormat("Truncated log record".into()));
        }

        let body = &data[4..4 + len];
        let expected = (&body[len - 4..]).get_u32_le();
        let actual = crc32fast::hash(&body[..len - 4]);
        if expected != actual {
            return Err(GridError::ChecksumMismatch { expected, actual });
        }

        let sequence = (&body[..8]).get_u64_le();
        let mutation = bincode::deserialize(&body[8..len - 4])?;
        Ok((sequence, mutation, 4 + len))
    }
}

impl NonVolatileHashMap for FileHashMap {
    fn set(&self, key: &str, pairs: &[(String, String)]) -> Result<()> {
        let mut log = self.log.lock();
        self.inner.set(key, pairs)?;
        let mutation = Mutation::Set {
            key: key.to_string(),
            pairs: pairs.to_vec(),
        };
        self.append(&mut log, &mutation)
    }

    fn get_fields(&self, key: &str) -> Result<Vec<String>> {
        self.inner.get_fields(key)
    }

    fn get_field_values(&self, key: &str, fields: &[String]) -> Result<HashMap<String, String>> {
        self.inner.get_field_values(key, fields)
    }

    fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        let mut log = self.log.lock();
        self.inner.rename(key, new_key)?;
        let mutation = Mutation::Rename {
            key: key.to_string(),
            new_key: new_key.to_string(),
        };
        self.append(&mut log, &mutation)
    }

    fn del(&self, keys: &[String]) -> Result<usize> {
        let mut log = self.log.lock();
        let removed = self.inner.del(keys)?;
        if removed > 0 {
            let mutation = Mutation::Del { keys: keys.to_vec() };
            self.append(&mut log, &mutation)?;
        }
        Ok(removed)
    }

    fn del_fields(&self, key: &str, fields: &[String]) -> Result<usize> {
        let mut log = self.log.lock();
        let removed = self.inner.del_fields(key, fields)?;
        if removed > 0 {
            let mutation = Mutation::DelFields {
                key: key.to_string(),
                fields: fields.to_vec(),
            };
            self.append(&mut log, &mutation)?;
        }
        Ok(removed)
    }

    fn set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut log = self.log.lock();
        let inserted = self.inner.set_if_absent(key, field, value)?;
        if inserted {
            let mutation = Mutation::Set {
                key: key.to_string(),
                pairs: vec![(field.to_string(), value.to_string())],
            };
            self.append(&mut log, &mutation)?;
        }
        Ok(inserted)
    }
}
