//! Block-file chunk back-end
//!
//! A chunk is a directory. Each write handle appends blocks to its own file
//! named `<uuid>.gsc`; read handles scan every file matching that pattern,
//! so several writers (one per worker or process) never contend on a file.
//! Duplicate `(tag, sample_time)` rows across files are resolved by insert
//! time when the cursor is built.

use super::block::{decode_blocks, encode_block};
use super::{upsert_latest, Chunk, ChunkBackend, HandleState};
use crate::merge::RowCursor;
use crate::{AccessMode, ConnectionPath, GridError, Result, Row, Sample, TimeRange};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

const FILE_EXTENSION: &str = "gsc";

/// Chunk back-end storing rows in checksummed block files
#[derive(Clone)]
pub struct FileBackend {
    file_pattern: Regex,
    sync_writes: bool,
}

impl FileBackend {
    /// Create a back-end; `sync_writes` fsyncs after every bulk write
    pub fn new(sync_writes: bool) -> Result<Self> {
        let file_pattern =
            Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\.gsc$")
                .map_err(|e| GridError::Internal(e.to_string()))?;
        Ok(Self {
            file_pattern,
            sync_writes,
        })
    }
}

impl ChunkBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open(&self, path: &ConnectionPath, mode: AccessMode) -> Result<Arc<dyn Chunk>> {
        let dir = path.as_path().to_path_buf();
        match mode {
            AccessMode::Read if !dir.is_dir() => {
                return Err(GridError::ChunkNotFound(path.to_string()));
            }
            AccessMode::Read => {}
            AccessMode::Write => fs::create_dir_all(&dir)?,
        }

        Ok(Arc::new(FileChunk {
            path: path.clone(),
            dir,
            mode,
            file_pattern: self.file_pattern.clone(),
            sync_writes: self.sync_writes,
            writer: Mutex::new(None),
            state: HandleState::default(),
        }))
    }
}

struct FileChunk {
    path: ConnectionPath,
    dir: PathBuf,
    mode: AccessMode,
    file_pattern: Regex,
    sync_writes: bool,
    writer: Mutex<Option<File>>,
    state: HandleState,
}

impl FileChunk {
    fn data_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| self.file_pattern.is_match(n));
            if matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Chunk for FileChunk {
    fn bulk_set(&self, rows: &BTreeMap<String, Vec<Sample>>) -> Result<usize> {
        if self.mode == AccessMode::Read {
            return Err(GridError::ReadOnlyChunk(self.path.to_string()));
        }
        let _write = self.state.begin_write();

        let block: Vec<Row> = rows
            .iter()
            .flat_map(|(tag, samples)| {
                samples.iter().map(move |s| Row::from_sample(tag.as_str(), s))
            })
            .collect();
        if block.is_empty() {
            return Ok(0);
        }
        let encoded = encode_block(&block)?;

        let mut writer = self.writer.lock();
        if writer.is_none() {
            let name = format!("{}.{}", uuid::Uuid::new_v4(), FILE_EXTENSION);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(&name))?;
            debug!("Opened chunk file {} in {}", name, self.path);
            *writer = Some(file);
        }
        if let Some(file) = writer.as_mut() {
            file.write_all(&encoded)?;
            if self.sync_writes {
                file.sync_data()?;
            }
        }

        Ok(block.len())
    }

    fn bulk_iterator(&self, tags: &BTreeSet<String>, range: TimeRange) -> Result<RowCursor> {
        let mut latest: BTreeMap<(String, i64), Row> = BTreeMap::new();
        let mut failures: Vec<Result<Row>> = Vec::new();

        for file in self.data_files()? {
            let data = fs::read(&file)?;
            let scan = decode_blocks(&data);
            if let Some(e) = scan.error {
                warn!("Chunk file {:?} is damaged after {} rows: {}", file, scan.rows.len(), e);
                failures.push(Err(e));
            }
            for row in scan.rows {
                if range.contains(row.sample_time) && tags.contains(&row.tag) {
                    upsert_latest(&mut latest, row);
                }
            }
        }

        let rows = failures.into_iter().chain(latest.into_values().map(Ok));
        Ok(self.state.cursor(rows))
    }

    fn can_be_disposed(&self) -> bool {
        self.state.is_idle()
    }

    fn dispose(&self) -> Result<()> {
        if let Some(file) = self.writer.lock().take() {
            file.sync_all()?;
        }
        Ok(())
    }
}
