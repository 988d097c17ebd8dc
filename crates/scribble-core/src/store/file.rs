//! File-backed event log: one JSON-lines file per board.
//!
//! ```text
//! <data_dir>/boards/<encoded board id>.jsonl
//! ```
//!
//! Each line is one [`DrawEvent`]. An in-memory index of line offsets is built
//! the first time a board is touched, so replay pages seek straight to their
//! first record. A torn final line (no trailing newline) is ignored and cut off
//! before the next append.
//!
//! Reads of a board that has no file yet do not open anything. At most
//! `max_open_logs` boards stay open; idle ones are closed to make room.

use super::{EventStore, StoreError};
use crate::event::{BoardId, DrawEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default cap on boards kept open at once.
pub const DEFAULT_MAX_OPEN_LOGS: usize = 1_024;

/// Encode a board id into a safe file stem.
fn file_stem(board: &str) -> String {
    let mut stem = String::with_capacity(board.len());
    for b in board.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            stem.push(b as char);
        } else {
            stem.push_str(&format!("%{:02X}", b));
        }
    }
    stem
}

/// Open log state for one board.
struct BoardLog {
    path: PathBuf,
    /// Byte offset of every complete record.
    index: Option<Vec<u64>>,
    /// Byte length of the complete records.
    end: u64,
    writer: Option<File>,
}

impl BoardLog {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            index: None,
            end: 0,
            writer: None,
        }
    }

    async fn load_index(&mut self) -> Result<&[u64], StoreError> {
        if self.index.is_none() {
            let data = match fs::read(&self.path).await {
                Ok(data) => data,
                Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };

            let mut index = Vec::new();
            let mut start = 0u64;
            for (i, byte) in data.iter().enumerate() {
                if *byte == b'\n' {
                    index.push(start);
                    start = i as u64 + 1;
                }
            }
            if start < data.len() as u64 {
                warn!(
                    path = %self.path.display(),
                    bytes = data.len() as u64 - start,
                    "Ignoring torn record at end of log"
                );
            }

            debug!(path = %self.path.display(), records = index.len(), "Loaded log index");
            self.end = start;
            self.index = Some(index);
        }
        Ok(self.index.as_deref().unwrap_or_default())
    }

    async fn append(&mut self, event: &DrawEvent, fsync: bool) -> Result<(), StoreError> {
        self.load_index().await?;

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let result = self.write_line(&line, fsync).await;
        match result {
            Ok(()) => {
                let offset = self.end;
                self.end += line.len() as u64;
                if let Some(index) = self.index.as_mut() {
                    index.push(offset);
                }
                Ok(())
            }
            Err(e) => {
                // Force a reload so a partial write gets truncated.
                self.writer = None;
                self.index = None;
                Err(e)
            }
        }
    }

    async fn write_line(&mut self, line: &[u8], fsync: bool) -> Result<(), StoreError> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&self.path)
                .await?;
            file.set_len(self.end).await?;
            file.seek(SeekFrom::Start(self.end)).await?;
            self.writer = Some(file);
        }

        if let Some(file) = self.writer.as_mut() {
            file.write_all(line).await?;
            // tokio completes writes in the background until flushed.
            file.flush().await?;
            if fsync {
                file.sync_data().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, start: u64, limit: usize) -> Result<Vec<DrawEvent>, StoreError> {
        let end_of_log = {
            self.load_index().await?;
            self.end
        };
        let index = self.index.as_deref().unwrap_or_default();

        let first = start as usize;
        if first >= index.len() || limit == 0 {
            return Ok(Vec::new());
        }
        let last = first.saturating_add(limit).min(index.len());
        let from = index[first];
        let to = index.get(last).copied().unwrap_or(end_of_log);

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(from)).await?;
        let mut buf = vec![0u8; (to - from) as usize];
        file.read_exact(&mut buf).await?;

        buf.split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).map_err(StoreError::from))
            .collect()
    }
}

/// Event log persisted as JSON-lines files.
pub struct FileEventStore {
    root: PathBuf,
    fsync: bool,
    max_open_logs: usize,
    boards: DashMap<BoardId, Arc<Mutex<BoardLog>>>,
}

impl FileEventStore {
    /// Create a store rooted at `data_dir`.
    ///
    /// With `fsync` set, every append is synced to disk before it returns.
    #[must_use]
    pub fn new(data_dir: impl AsRef<Path>, fsync: bool) -> Self {
        let root = data_dir.as_ref().join("boards");
        info!(path = %root.display(), fsync, "Opening file event store");
        Self {
            root,
            fsync,
            max_open_logs: DEFAULT_MAX_OPEN_LOGS,
            boards: DashMap::new(),
        }
    }

    /// Keep at most `max` boards open.
    #[must_use]
    pub fn with_max_open_logs(mut self, max: usize) -> Self {
        self.max_open_logs = max.max(1);
        self
    }

    /// Number of boards currently held open.
    #[must_use]
    pub fn open_logs(&self) -> usize {
        self.boards.len()
    }

    fn path(&self, board: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", file_stem(board)))
    }

    fn board(&self, board: &str) -> Arc<Mutex<BoardLog>> {
        if let Some(log) = self.boards.get(board) {
            return log.value().clone();
        }
        if self.boards.len() >= self.max_open_logs {
            self.close_idle();
        }
        self.boards
            .entry(board.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BoardLog::new(self.path(board)))))
            .value()
            .clone()
    }

    /// Open log state for reads, or `None` if the board has never been written.
    async fn existing(&self, board: &str) -> Result<Option<Arc<Mutex<BoardLog>>>, StoreError> {
        if let Some(log) = self.boards.get(board) {
            return Ok(Some(log.value().clone()));
        }
        if !fs::try_exists(self.path(board)).await? {
            return Ok(None);
        }
        Ok(Some(self.board(board)))
    }

    /// Close every board nobody is using. Appends are already flushed, so
    /// the next access reloads the same state from disk.
    fn close_idle(&self) {
        let before = self.boards.len();
        self.boards.retain(|_, log| Arc::strong_count(log) > 1);
        debug!(closed = before - self.boards.len(), "Closed idle board logs");
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append(&self, board: &str, event: &DrawEvent) -> Result<(), StoreError> {
        let log = self.board(board);
        let mut log = log.lock().await;
        log.append(event, self.fsync).await
    }

    async fn read_from(
        &self,
        board: &str,
        start: u64,
        limit: usize,
    ) -> Result<Vec<DrawEvent>, StoreError> {
        let Some(log) = self.existing(board).await? else {
            return Ok(Vec::new());
        };
        let mut log = log.lock().await;
        log.read(start, limit).await
    }

    async fn len(&self, board: &str) -> Result<u64, StoreError> {
        let Some(log) = self.existing(board).await? else {
            return Ok(0);
        };
        let mut log = log.lock().await;
        Ok(log.load_index().await?.len() as u64)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let logs: Vec<_> = self.boards.iter().map(|e| e.value().clone()).collect();
        for log in logs {
            let mut log = log.lock().await;
            if let Some(file) = log.writer.as_mut() {
                file.sync_all().await?;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
