//! Offline search over history logs.
//!
//! The input may be a single log (plain or gzip-compressed) or a
//! directory of rotated logs. Every block is parsed, matched against the
//! compiled criteria, and the survivors are printed as one time-sorted
//! JSON report.

mod filter;

pub use filter::{SearchFilter, SearchOptions};

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::DateTime;
use clap::ValueEnum;
use flate2::read::MultiGzDecoder;
use tracing::{debug, warn};

use crate::logs::{BlockFramer, parse_block};
use crate::types::{HistoryEvent, SearchReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TimeOrder {
    Asc,
    Desc,
}

/// Run one search and print the report to stdout.
pub fn run(log_path: &Path, order: TimeOrder, options: &SearchOptions) -> Result<()> {
    let filter = SearchFilter::compile(options)?;

    let mut results = Vec::new();
    for file in resolve_input_files(log_path)? {
        debug!(path = %file.display(), "searching log file");
        results.extend(scan_file(&file, &filter)?);
    }

    if results.is_empty() {
        println!("Search returned no results");
        return Ok(());
    }

    sort_by_start_timestamp(&mut results, order);

    let report = SearchReport {
        total_results: results.len(),
        results,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// A file input is searched as-is; a directory input expands to every
/// regular file directly inside it.
fn resolve_input_files(input: &Path) -> Result<Vec<PathBuf>> {
    let meta = fs::metadata(input)
        .with_context(|| format!("unable to access search input {}", input.display()))?;

    if meta.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }

    let entries = fs::read_dir(input)
        .with_context(|| format!("failed to read log directory {}", input.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Frame and parse every block in one log file, collecting the events
/// the filter accepts. Blocks that fail to parse are skipped.
fn scan_file(path: &Path, filter: &SearchFilter) -> Result<Vec<HistoryEvent>> {
    let file =
        File::open(path).with_context(|| format!("failed to open log file {}", path.display()))?;

    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut framer = BlockFramer::new();
    let mut matches = Vec::new();

    for line in BufReader::new(reader).lines() {
        let line = line.with_context(|| format!("failed reading {}", path.display()))?;
        let Some(block) = framer.feed(&line) else {
            continue;
        };

        let event = match parse_block(&block) {
            Ok(event) => event,
            Err(e) => {
                warn!(path = %path.display(), "skipping unparseable history block: {e}");
                continue;
            }
        };

        if let Some(projected) = filter.matches(&event) {
            matches.push(projected);
        }
    }

    Ok(matches)
}

/// Order results by start timestamp, falling back to a plain string
/// comparison for any timestamp that fails to parse.
fn sort_by_start_timestamp(results: &mut [HistoryEvent], order: TimeOrder) {
    results.sort_by(|a, b| {
        let parsed_a = DateTime::parse_from_rfc3339(&a.start_timestamp);
        let parsed_b = DateTime::parse_from_rfc3339(&b.start_timestamp);

        let ordering = match (parsed_a, parsed_b) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => a.start_timestamp.cmp(&b.start_timestamp),
        };

        match order {
            TimeOrder::Asc => ordering,
            TimeOrder::Desc => ordering.reverse(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    fn block(command: &str, day: u32) -> String {
        format!(
            "Start-Date: 2025-06-{day:02}  10:00:00\n\
             Commandline: {command}\n\
             Install: jq:amd64 (1.6-2.1)\n\
             End-Date: 2025-06-{day:02}  10:00:05\n"
        )
    }

    fn wide_filter() -> SearchFilter {
        SearchFilter::compile(&SearchOptions {
            start_timestamp: Some("2025-01-01T00:00:00".into()),
            end_timestamp: Some("2026-01-01T00:00:00".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn scans_plain_log_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.log");
        fs::write(&path, format!("{}{}", block("apt install jq", 1), block("apt upgrade", 2)))
            .unwrap();

        let events = scan_file(&path, &wide_filter()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].command_line, "apt install jq");
    }

    #[test]
    fn scans_gzip_compressed_log_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.log.1.gz");

        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(block("apt purge nano", 3).as_bytes()).unwrap();
        encoder.finish().unwrap();

        let events = scan_file(&path, &wide_filter()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command_line, "apt purge nano");
    }

    #[test]
    fn malformed_blocks_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.log");
        let broken = "Start-Date: 2025-06-01  10:00:00\n\
                      Frobnicate: yes\n\
                      End-Date: 2025-06-01  10:00:01\n";
        fs::write(&path, format!("{broken}{}", block("apt upgrade", 2))).unwrap();

        let events = scan_file(&path, &wide_filter()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command_line, "apt upgrade");
    }

    #[test]
    fn directory_input_expands_to_regular_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("history.log"), block("a", 1)).unwrap();
        fs::write(dir.path().join("history.log.1"), block("b", 2)).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let files = resolve_input_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.is_file()));
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(resolve_input_files(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn sorts_ascending_and_descending() {
        let mut events: Vec<HistoryEvent> = [3, 1, 2]
            .iter()
            .map(|day| parse_block(&block("apt upgrade", *day)).unwrap())
            .collect();

        sort_by_start_timestamp(&mut events, TimeOrder::Asc);
        let days: Vec<&str> = events.iter().map(|e| &e.start_timestamp[8..10]).collect();
        assert_eq!(days, vec!["01", "02", "03"]);

        sort_by_start_timestamp(&mut events, TimeOrder::Desc);
        let days: Vec<&str> = events.iter().map(|e| &e.start_timestamp[8..10]).collect();
        assert_eq!(days, vec!["03", "02", "01"]);
    }
}
