//! Continuous tailing of the APT history log.
//!
//! The engine resumes from the persisted position, scans complete blocks
//! into JSON records, then sleeps on the change watcher until new bytes
//! or a rotation arrive. The read offset only ever advances at block
//! boundaries, so an unclean stop re-reads at most one partial block.

mod position;
mod watcher;

pub use position::{Position, PositionStore, file_inode};
pub use watcher::ChangeWatcher;

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Stdout, Write, stdout};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::logs::{BlockFramer, MAX_CHUNK_BYTES, parse_block, split_event};

/// Settings for one continuous tailing run.
#[derive(Debug, Clone)]
pub struct TailConfig {
    pub log_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub dry_run: bool,
}

/// Where emitted records go: stdout, or an append-mode file.
enum OutputSink {
    Stdout(Stdout),
    File(File),
}

impl OutputSink {
    fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::Stdout(stdout())),
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open output file {}", path.display()))?;
                Ok(Self::File(file))
            }
        }
    }

    /// Write one record as a line. Output failures are fatal: losing
    /// records silently would defeat the point of tailing.
    fn write_record(&mut self, json: &str) -> Result<()> {
        match self {
            Self::Stdout(out) => {
                let mut lock = out.lock();
                writeln!(lock, "{json}")?;
                lock.flush()?;
            }
            Self::File(file) => {
                writeln!(file, "{json}")?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

pub struct TailEngine {
    config: TailConfig,
    store: PositionStore,
}

impl TailEngine {
    pub fn new(config: TailConfig) -> Self {
        let store = PositionStore::new(&config.state_dir);
        Self { config, store }
    }

    /// Run until `shutdown` is cancelled or an unrecoverable error occurs.
    ///
    /// On cancellation the in-flight block finishes, the position is
    /// durably saved, and the run ends cleanly. A fatal error propagates
    /// without a final save; the next start resumes from the last block
    /// boundary that was persisted.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let watcher = ChangeWatcher::spawn(&self.config.log_path)?;
        self.run_with_watcher(watcher, shutdown).await
    }

    async fn run_with_watcher(
        &self,
        mut watcher: ChangeWatcher,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut position = self.store.load(&self.config.log_path)?;
        let mut reader = open_at(&self.config.log_path, position.offset)?;
        let mut sink = OutputSink::open(self.config.output_path.as_deref())?;

        info!(
            path = %self.config.log_path.display(),
            offset = position.offset,
            "tailing history log"
        );

        if self.config.dry_run {
            info!("dry run: startup checks passed, exiting before processing");
            return Ok(());
        }

        let mut framer = BlockFramer::new();
        // Bytes consumed from the reader since the last committed block
        // boundary; carried across wakeups while a block is open.
        let mut pending: u64 = 0;
        loop {
            position = self.scan(
                &mut reader,
                &mut framer,
                position,
                &mut pending,
                &mut sink,
                &shutdown,
            )?;
            if shutdown.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                rotated = watcher.rotated.recv() => {
                    rotated.context("file change watcher stopped unexpectedly")?;

                    // A rename-then-create rotation can signal twice; only
                    // reopen when the path really holds a new file.
                    let inode = file_inode(&self.config.log_path)?;
                    if inode == position.inode {
                        debug!("already following the file at this path");
                        continue;
                    }

                    info!(path = %self.config.log_path.display(), "reopening rotated log file");
                    reader = open_at(&self.config.log_path, 0)?;
                    framer = BlockFramer::new();
                    pending = 0;
                    position = Position { inode, offset: 0 };
                    if let Err(e) = self.store.save(position) {
                        warn!("failed to persist read position: {e:#}");
                    }
                }

                changed = watcher.changed.recv() => {
                    changed.context("file change watcher stopped unexpectedly")?;
                }
            }
        }

        if framer.has_open_block() {
            debug!("leaving an unterminated block for the next run");
        }
        self.store
            .save(position)
            .context("failed to persist read position during shutdown")?;
        info!(offset = position.offset, "shut down cleanly");
        Ok(())
    }

    /// Read every available line, emitting each completed block and
    /// committing the offset at its boundary. Returns on EOF, or early
    /// when shutdown was requested at a boundary.
    fn scan(
        &self,
        reader: &mut BufReader<File>,
        framer: &mut BlockFramer,
        mut position: Position,
        pending: &mut u64,
        sink: &mut OutputSink,
        shutdown: &CancellationToken,
    ) -> Result<Position> {
        let mut line = String::new();

        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .context("failed reading from log file")?;
            if n == 0 {
                return Ok(position);
            }

            if !line.ends_with('\n') {
                // Half-written final line. Put it back and wait for the
                // rest; the framer must only ever see whole lines.
                reader
                    .seek_relative(-(n as i64))
                    .context("failed rewinding over partial line")?;
                return Ok(position);
            }

            *pending += n as u64;

            let Some(block) = framer.feed(line.trim_end_matches(['\n', '\r'])) else {
                continue;
            };

            self.emit_block(&block, sink)?;

            position.offset += *pending;
            *pending = 0;
            if let Err(e) = self.store.save(position) {
                warn!("failed to persist read position: {e:#}");
            }
            debug!(offset = position.offset, "committed block boundary");

            if shutdown.is_cancelled() {
                return Ok(position);
            }
        }
    }

    /// Parse one block and write its record(s). Malformed blocks are
    /// skipped with a warning; the stream keeps going.
    fn emit_block(&self, block: &str, sink: &mut OutputSink) -> Result<()> {
        let event = match parse_block(block) {
            Ok(event) => event,
            Err(e) => {
                warn!("skipping unparseable history block: {e}");
                return Ok(());
            }
        };

        let chunks = match split_event(&event, MAX_CHUNK_BYTES) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(event_id = %event.event_id, "skipping event that failed to serialize: {e}");
                return Ok(());
            }
        };

        for chunk in &chunks {
            match serde_json::to_string(chunk) {
                Ok(json) => sink.write_record(&json)?,
                Err(e) => warn!("skipping record that failed to serialize: {e}"),
            }
        }
        Ok(())
    }
}

fn open_at(path: &Path, offset: u64) -> Result<BufReader<File>> {
    let file =
        File::open(path).with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(offset))
        .with_context(|| format!("failed to seek to offset {offset}"))?;
    Ok(reader)
}
