//! Shared record types for aptjournal
//!
//! These mirror the JSON wire format emitted for every parsed history
//! event, so serde attributes here define the output schema.

use serde::{Deserialize, Serialize};

/// One package affected by an APT operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    #[serde(rename = "package")]
    pub name: String,

    #[serde(rename = "architecture")]
    pub arch: String,

    #[serde(rename = "oldversion", default, skip_serializing_if = "String::is_empty")]
    pub old_version: String,

    #[serde(rename = "version")]
    pub version: String,
}

/// One fully parsed APT history event.
///
/// Empty lists and zero-valued scalars are omitted from serialization so
/// a record only carries the operations that actually happened.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryEvent {
    #[serde(rename = "EventID")]
    pub event_id: String,

    pub command_line: String,
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub elapsed_seconds: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requested_by: String,

    #[serde(rename = "RequestedByUID", default, skip_serializing_if = "is_zero_u32")]
    pub requested_by_uid: u32,

    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub total_packages: usize,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install: Vec<PackageInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reinstall: Vec<PackageInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upgrade: Vec<PackageInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<PackageInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub purge: Vec<PackageInfo>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub install_operation: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub reinstall_operation: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub upgrade_operation: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub remove_operation: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub purge_operation: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Search-mode output envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchReport {
    #[serde(rename = "totalresults")]
    pub total_results: usize,

    #[serde(rename = "results")]
    pub results: Vec<HistoryEvent>,
}

fn is_zero_u32(n: &u32) -> bool {
    *n == 0
}

fn is_zero_usize(n: &usize) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_omitted() {
        let event = HistoryEvent {
            event_id: "abc".into(),
            command_line: "apt upgrade".into(),
            start_timestamp: "2025-01-01T00:00:00+00:00".into(),
            end_timestamp: "2025-01-01T00:00:05+00:00".into(),
            elapsed_seconds: 5,
            ..Default::default()
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"EventID\":\"abc\""));
        assert!(json.contains("\"ElapsedSeconds\":5"));
        assert!(!json.contains("Install"));
        assert!(!json.contains("RequestedBy"));
        assert!(!json.contains("Error"));
    }

    #[test]
    fn package_info_round_trips() {
        let pkg = PackageInfo {
            name: "libgomp1".into(),
            arch: "amd64".into(),
            old_version: "12.2.0-14".into(),
            version: "12.2.0-14+deb12u1".into(),
        };

        let json = serde_json::to_string(&pkg).unwrap();
        assert!(json.contains("\"package\":\"libgomp1\""));
        let back: PackageInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pkg);
    }
}
