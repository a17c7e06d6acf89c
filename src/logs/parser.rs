use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{HistoryEvent, PackageInfo};

/// Timestamp layout used inside history.log (note the double space).
const BLOCK_TIMESTAMP_FORMAT: &str = "%Y-%m-%d  %H:%M:%S";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unable to parse event field: unexpected value '{0}'")]
    MalformedField(String),

    #[error("unknown prefix '{prefix}' with value '{value}'")]
    UnknownPrefix { prefix: String, value: String },

    #[error("failed parsing timestamp '{value}': {source}")]
    Timestamp {
        value: String,
        source: chrono::ParseError,
    },

    #[error("invalid requester value '{0}'")]
    Requester(String),

    #[error("could not extract package fields from '{0}'")]
    Package(String),
}

/// Parse one framed history block into a structured event.
///
/// Each line carries a `Prefix: value` pair. Unknown prefixes are an
/// error so grammar drift in a new APT release is noticed instead of
/// silently dropped.
pub fn parse_block(block: &str) -> Result<HistoryEvent, ParseError> {
    let mut event = HistoryEvent::default();

    for line in block.lines() {
        if line.is_empty() {
            continue;
        }

        let (prefix, value) = line
            .split_once(": ")
            .ok_or_else(|| ParseError::MalformedField(line.to_string()))?;

        match prefix {
            "Start-Date" => event.start_timestamp = parse_timestamp(value)?,
            "End-Date" => event.end_timestamp = parse_timestamp(value)?,
            "Commandline" => event.command_line = value.to_string(),
            "Requested-By" => {
                (event.requested_by, event.requested_by_uid) = parse_requester(value)?;
            }
            "Error" => event.error = value.to_string(),
            "Install" => event.install = parse_packages(value)?,
            "Reinstall" => event.reinstall = parse_packages(value)?,
            "Upgrade" => event.upgrade = parse_packages(value)?,
            "Remove" => event.remove = parse_packages(value)?,
            "Purge" => event.purge = parse_packages(value)?,
            _ => {
                return Err(ParseError::UnknownPrefix {
                    prefix: prefix.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    event.install_operation = !event.install.is_empty();
    event.reinstall_operation = !event.reinstall.is_empty();
    event.upgrade_operation = !event.upgrade.is_empty();
    event.remove_operation = !event.remove.is_empty();
    event.purge_operation = !event.purge.is_empty();

    event.total_packages = event.install.len()
        + event.reinstall.len()
        + event.upgrade.len()
        + event.remove.len()
        + event.purge.len();

    event.elapsed_seconds = elapsed_seconds(&event.start_timestamp, &event.end_timestamp)?;

    // Derive a stable ID from the parsed content so the same block always
    // maps to the same event, across restarts and re-reads.
    event.event_id = event_id(&event);

    Ok(event)
}

/// Convert a block timestamp (local time) to RFC 3339.
fn parse_timestamp(raw: &str) -> Result<String, ParseError> {
    let naive =
        NaiveDateTime::parse_from_str(raw, BLOCK_TIMESTAMP_FORMAT).map_err(|source| {
            ParseError::Timestamp {
                value: raw.to_string(),
                source,
            }
        })?;

    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| Local.from_utc_datetime(&naive));

    Ok(local.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn elapsed_seconds(start: &str, end: &str) -> Result<i64, ParseError> {
    let parse = |value: &str| {
        DateTime::parse_from_rfc3339(value).map_err(|source| ParseError::Timestamp {
            value: value.to_string(),
            source,
        })
    };

    let start = parse(start)?;
    let end = parse(end)?;
    Ok((end - start).num_seconds())
}

/// `Requested-By` carries `name (uid)`; the uid may be absent.
fn parse_requester(raw: &str) -> Result<(String, u32), ParseError> {
    let mut parts = raw.split_whitespace();
    let name = parts.next().unwrap_or_default().to_string();

    let uid = match parts.next() {
        Some(uid) => uid
            .trim_start_matches('(')
            .trim_end_matches(')')
            .parse::<u32>()
            .map_err(|_| ParseError::Requester(raw.to_string()))?,
        None => 0,
    };

    Ok((name, uid))
}

/// Parse a package list like
/// `libgomp1:amd64 (12.2.0-14, 12.2.0-14+deb12u1), jq:amd64 (1.6-2.1)`.
///
/// Entries are separated by `"), "`; within one entry the fields are
/// name, architecture, then either `version`, `oldversion version`, or
/// `version automatic`.
fn parse_packages(raw: &str) -> Result<Vec<PackageInfo>, ParseError> {
    let mut packages = Vec::new();

    for entry in raw.split("), ") {
        let entry = entry.strip_suffix(')').unwrap_or(entry);
        let entry = entry
            .replacen('(', "", 1)
            .replacen(',', "", 1)
            .replacen(':', " ", 1);

        let fields: Vec<&str> = entry.split_whitespace().collect();
        if fields.len() < 2 {
            return Err(ParseError::Package(raw.to_string()));
        }

        let mut pkg = PackageInfo {
            name: fields[0].to_string(),
            arch: fields[1].to_string(),
            ..Default::default()
        };

        match fields.len() {
            4 if fields[3] == "automatic" => pkg.version = fields[2].to_string(),
            4 => {
                pkg.old_version = fields[2].to_string();
                pkg.version = fields[3].to_string();
            }
            3 => pkg.version = fields[2].to_string(),
            _ => {}
        }

        packages.push(pkg);
    }

    Ok(packages)
}

/// First 16 bytes of a SHA-256 over the event content, UUID-formatted.
fn event_id(event: &HistoryEvent) -> String {
    let digest = Sha256::digest(format!("{event:?}").as_bytes());
    let hex = format!("{digest:x}");

    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_automatic_install_list() {
        let got = parse_packages(
            "libc-ares2:amd64 (1.18.1-3, automatic), linux-image-6.1.0-37-amd64:amd64 (6.1.140-1, automatic)",
        )
        .unwrap();

        assert_eq!(
            got,
            vec![
                PackageInfo {
                    name: "libc-ares2".into(),
                    arch: "amd64".into(),
                    version: "1.18.1-3".into(),
                    ..Default::default()
                },
                PackageInfo {
                    name: "linux-image-6.1.0-37-amd64".into(),
                    arch: "amd64".into(),
                    version: "6.1.140-1".into(),
                    ..Default::default()
                },
            ]
        );
    }

    #[test]
    fn parses_upgrade_list_with_old_versions() {
        let got = parse_packages(
            "libperl5.36:amd64 (5.36.0-7+deb12u1, 5.36.0-7+deb12u2), libgomp1:amd64 (12.2.0-14, 12.2.0-14+deb12u1)",
        )
        .unwrap();

        assert_eq!(got[0].old_version, "5.36.0-7+deb12u1");
        assert_eq!(got[0].version, "5.36.0-7+deb12u2");
        assert_eq!(got[1].old_version, "12.2.0-14");
        assert_eq!(got[1].version, "12.2.0-14+deb12u1");
    }

    #[test]
    fn parses_plain_install_list() {
        let got = parse_packages(
            "libxt6:amd64 (1:1.2.1-1.1), libluajit2-5.1-common:amd64 (2.1-20230119-1)",
        )
        .unwrap();

        assert_eq!(got[0].name, "libxt6");
        assert_eq!(got[0].version, "1:1.2.1-1.1");
        assert_eq!(got[1].name, "libluajit2-5.1-common");
        assert_eq!(got[1].version, "2.1-20230119-1");
    }

    #[test]
    fn rejects_entry_with_too_few_fields() {
        assert!(parse_packages("pkgnover ()").is_err());
        assert!(parse_packages("").is_err());
    }

    #[test]
    fn parses_full_block() {
        let block = "Start-Date: 2025-06-01  10:00:00\n\
                     Commandline: apt install jq\n\
                     Requested-By: admin (1000)\n\
                     Install: jq:amd64 (1.6-2.1)\n\
                     End-Date: 2025-06-01  10:00:07\n";

        let event = parse_block(block).unwrap();
        assert_eq!(event.command_line, "apt install jq");
        assert_eq!(event.requested_by, "admin");
        assert_eq!(event.requested_by_uid, 1000);
        assert_eq!(event.elapsed_seconds, 7);
        assert_eq!(event.total_packages, 1);
        assert!(event.install_operation);
        assert!(!event.upgrade_operation);
        assert!(event.start_timestamp.starts_with("2025-06-01T10:00:00"));
        assert!(!event.event_id.is_empty());
    }

    #[test]
    fn same_block_yields_same_event_id() {
        let block = "Start-Date: 2025-06-01  10:00:00\n\
                     Commandline: apt upgrade\n\
                     End-Date: 2025-06-01  10:02:00\n";

        let a = parse_block(block).unwrap();
        let b = parse_block(block).unwrap();
        assert_eq!(a.event_id, b.event_id);
    }

    #[test]
    fn unknown_prefix_is_an_error() {
        let block = "Start-Date: 2025-06-01  10:00:00\n\
                     Frobnicate: yes\n\
                     End-Date: 2025-06-01  10:00:01\n";

        assert!(matches!(
            parse_block(block),
            Err(ParseError::UnknownPrefix { .. })
        ));
    }

    #[test]
    fn command_line_may_contain_separator() {
        let block = "Start-Date: 2025-06-01  10:00:00\n\
                     Commandline: apt-get -o APT::Get::Retries: 3 upgrade\n\
                     End-Date: 2025-06-01  10:00:01\n";

        let event = parse_block(block).unwrap();
        assert_eq!(event.command_line, "apt-get -o APT::Get::Retries: 3 upgrade");
    }
}
