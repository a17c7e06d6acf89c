use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

const STATE_FILE_NAME: &str = "log.state";

/// Where continuous reading last stopped: the log file's identity plus a
/// byte offset that is only ever advanced at block boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub inode: u64,
    pub offset: u64,
}

/// Single-slot durable store for [`Position`].
///
/// The on-disk format is one line, `"<inode> <offset>"`. Anything else in
/// the file means a prior version or corruption; the store heals itself
/// by discarding the content rather than failing startup.
pub struct PositionStore {
    state_path: PathBuf,
}

impl PositionStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_path: state_dir.join(STATE_FILE_NAME),
        }
    }

    /// Resolve the position to resume from for `log_path`.
    ///
    /// Stale state is never fatal: a missing or malformed slot, or an
    /// inode that no longer matches (the log rotated while we were
    /// stopped), resolves to offset 0 at the file's current identity.
    /// An offset beyond the file's current size is clamped to its size.
    pub fn load(&self, log_path: &Path) -> Result<Position> {
        let meta = fs::metadata(log_path)
            .with_context(|| format!("unable to stat log file {}", log_path.display()))?;
        let fresh = Position {
            inode: meta.ino(),
            offset: 0,
        };

        let content = match fs::read_to_string(&self.state_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(fresh),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read state file {}", self.state_path.display())
                });
            }
        };

        if content.trim().is_empty() {
            return Ok(fresh);
        }

        let Some(stored) = parse_state(&content) else {
            warn!(
                path = %self.state_path.display(),
                "invalid state file content, restarting from beginning of log"
            );
            // Clear the bad slot so the next load starts clean.
            if let Err(e) = fs::write(&self.state_path, "") {
                warn!("failed to reset state file: {e}");
            }
            return Ok(fresh);
        };

        if stored.inode != fresh.inode {
            debug!(
                stored = stored.inode,
                current = fresh.inode,
                "log file identity changed while stopped, restarting from offset 0"
            );
            return Ok(fresh);
        }

        let size = meta.len();
        if stored.offset > size {
            debug!(
                offset = stored.offset,
                size, "stored offset is beyond end of file, clamping"
            );
            return Ok(Position {
                inode: stored.inode,
                offset: size,
            });
        }

        Ok(stored)
    }

    /// Overwrite the slot with `position`, creating the state directory
    /// if needed.
    pub fn save(&self, position: Position) -> Result<()> {
        if let Some(dir) = self.state_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("unable to create state directory {}", dir.display()))?;
        }

        fs::write(
            &self.state_path,
            format!("{} {}", position.inode, position.offset),
        )
        .with_context(|| {
            format!(
                "failed to write position to state file {}",
                self.state_path.display()
            )
        })
    }
}

fn parse_state(content: &str) -> Option<Position> {
    let mut fields = content.split_whitespace();
    let inode = fields.next()?.parse().ok()?;
    let offset = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(Position { inode, offset })
}

/// Stable identity of the file currently at `path`.
pub fn file_inode(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path)
        .with_context(|| format!("unable to stat log file {}", path.display()))?;
    Ok(meta.ino())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, PositionStore) {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("history.log");
        let mut log = fs::File::create(&log_path).unwrap();
        log.write_all(b"Start-Date: 2025-06-01  10:00:00\n").unwrap();
        let store = PositionStore::new(&dir.path().join("state"));
        (dir, log_path, store)
    }

    #[test]
    fn load_without_prior_state_starts_at_zero() {
        let (_dir, log_path, store) = setup();
        let pos = store.load(&log_path).unwrap();
        assert_eq!(pos.offset, 0);
        assert_eq!(pos.inode, file_inode(&log_path).unwrap());
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, log_path, store) = setup();
        let saved = Position {
            inode: file_inode(&log_path).unwrap(),
            offset: 10,
        };
        store.save(saved).unwrap();
        assert_eq!(store.load(&log_path).unwrap(), saved);
    }

    #[test]
    fn identity_mismatch_resets_offset() {
        let (_dir, log_path, store) = setup();
        let inode = file_inode(&log_path).unwrap();
        store
            .save(Position {
                inode: inode + 1,
                offset: 10,
            })
            .unwrap();

        let pos = store.load(&log_path).unwrap();
        assert_eq!(pos, Position { inode, offset: 0 });
    }

    #[test]
    fn offset_beyond_file_size_is_clamped() {
        let (_dir, log_path, store) = setup();
        let inode = file_inode(&log_path).unwrap();
        store
            .save(Position {
                inode,
                offset: 999_999_999,
            })
            .unwrap();

        let pos = store.load(&log_path).unwrap();
        assert_eq!(pos.offset, fs::metadata(&log_path).unwrap().len());
        assert_eq!(pos.inode, inode);
    }

    #[test]
    fn malformed_state_is_discarded_and_reset() {
        let (_dir, log_path, store) = setup();
        fs::create_dir_all(store.state_path.parent().unwrap()).unwrap();
        fs::write(&store.state_path, "bad data").unwrap();

        let pos = store.load(&log_path).unwrap();
        assert_eq!(pos.offset, 0);
        assert_eq!(pos.inode, file_inode(&log_path).unwrap());

        // The bad slot was cleared, so the next load is clean too.
        assert_eq!(fs::read_to_string(&store.state_path).unwrap(), "");
        assert_eq!(store.load(&log_path).unwrap(), pos);
    }

    #[test]
    fn extra_fields_count_as_malformed() {
        let (_dir, log_path, store) = setup();
        fs::create_dir_all(store.state_path.parent().unwrap()).unwrap();
        fs::write(&store.state_path, "1 2 3").unwrap();

        assert_eq!(store.load(&log_path).unwrap().offset, 0);
    }

    #[test]
    fn empty_state_file_is_treated_as_absent() {
        let (_dir, log_path, store) = setup();
        fs::create_dir_all(store.state_path.parent().unwrap()).unwrap();
        fs::write(&store.state_path, "  \n").unwrap();

        assert_eq!(store.load(&log_path).unwrap().offset, 0);
    }

    #[test]
    fn load_fails_when_log_file_is_missing() {
        let dir = TempDir::new().unwrap();
        let store = PositionStore::new(dir.path());
        assert!(store.load(&dir.path().join("absent.log")).is_err());
    }
}
