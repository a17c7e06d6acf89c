use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use tracing::warn;

use crate::types::{HistoryEvent, PackageInfo};

/// Timestamp layout accepted on the command line for the search window.
const WINDOW_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Raw, uncompiled search criteria as given on the command line.
#[derive(Debug, Default, Clone)]
pub struct SearchOptions {
    pub event_id: Option<String>,
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
    pub command_line: Option<String>,
    pub package_name: Option<String>,
    pub package_version: Option<String>,
    pub operation: Option<String>,
    pub user_name: Option<String>,
    pub user_uid: Option<u32>,
}

/// Validated and compiled search criteria.
///
/// The window always exists: it defaults to the last week ending now.
/// Text criteria are regexes; an absent criterion matches everything.
pub struct SearchFilter {
    event_id: Option<String>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    command_line: Option<Regex>,
    package_name: Option<Regex>,
    package_version: Option<Regex>,
    operation: Option<Regex>,
    user_name: Option<Regex>,
    user_uid: Option<u32>,
}

/// The five operations a record can carry, with accessors so filtering
/// and projection treat them uniformly.
const OPERATIONS: [(
    &str,
    fn(&HistoryEvent) -> bool,
    fn(&mut HistoryEvent) -> &mut Vec<PackageInfo>,
    fn(&mut HistoryEvent, bool),
); 5] = [
    ("install", |e| e.install_operation, |e| &mut e.install, |e, v| e.install_operation = v),
    ("reinstall", |e| e.reinstall_operation, |e| &mut e.reinstall, |e, v| e.reinstall_operation = v),
    ("upgrade", |e| e.upgrade_operation, |e| &mut e.upgrade, |e, v| e.upgrade_operation = v),
    ("remove", |e| e.remove_operation, |e| &mut e.remove, |e, v| e.remove_operation = v),
    ("purge", |e| e.purge_operation, |e| &mut e.purge, |e, v| e.purge_operation = v),
];

impl SearchFilter {
    pub fn compile(options: &SearchOptions) -> Result<Self> {
        let window_start = match &options.start_timestamp {
            Some(raw) => parse_window_timestamp(raw)
                .with_context(|| format!("invalid start timestamp '{raw}'"))?,
            None => Utc::now() - Duration::days(7),
        };
        let window_end = match &options.end_timestamp {
            Some(raw) => parse_window_timestamp(raw)
                .with_context(|| format!("invalid end timestamp '{raw}'"))?,
            None => Utc::now(),
        };

        let operation = match &options.operation {
            Some(raw) => Some(compile_operation(raw)?),
            None => None,
        };

        let compile = |field: &str, value: &Option<String>| -> Result<Option<Regex>> {
            value
                .as_deref()
                .map(Regex::new)
                .transpose()
                .with_context(|| format!("invalid {field} pattern"))
        };

        Ok(Self {
            event_id: options.event_id.clone(),
            window_start,
            window_end,
            command_line: compile("command line", &options.command_line)?,
            package_name: compile("package name", &options.package_name)?,
            package_version: compile("package version", &options.package_version)?,
            operation,
            user_name: compile("user name", &options.user_name)?,
            user_uid: options.user_uid,
        })
    }

    /// Test `event` against every criterion. A match returns a projected
    /// copy: when operation or package criteria are set, only the
    /// operations and packages that matched are retained.
    pub fn matches(&self, event: &HistoryEvent) -> Option<HistoryEvent> {
        if let Some(wanted) = &self.event_id
            && *wanted != event.event_id
        {
            return None;
        }

        if !self.within_window(event) {
            return None;
        }

        if let Some(re) = &self.command_line
            && !re.is_match(&event.command_line)
        {
            return None;
        }
        if let Some(re) = &self.user_name
            && !re.is_match(&event.requested_by)
        {
            return None;
        }
        if let Some(uid) = self.user_uid
            && uid != event.requested_by_uid
        {
            return None;
        }

        let mut projected = event.clone();

        if let Some(op_re) = &self.operation {
            let mut any_kept = false;
            for (name, present, list, set_flag) in OPERATIONS {
                if present(event) && op_re.is_match(name) {
                    any_kept = true;
                } else {
                    list(&mut projected).clear();
                    set_flag(&mut projected, false);
                }
            }
            if !any_kept {
                return None;
            }
        }

        if self.package_name.is_some() || self.package_version.is_some() {
            let mut any_package = false;
            for (_, _, list, _) in OPERATIONS {
                let packages = list(&mut projected);
                packages.retain(|pkg| self.package_matches(pkg));
                any_package |= !packages.is_empty();
            }
            if !any_package {
                return None;
            }
        }

        Some(projected)
    }

    fn package_matches(&self, pkg: &PackageInfo) -> bool {
        if let Some(re) = &self.package_name
            && re.is_match(&pkg.name)
        {
            return true;
        }
        if let Some(re) = &self.package_version
            && re.is_match(&pkg.version)
        {
            return true;
        }
        false
    }

    fn within_window(&self, event: &HistoryEvent) -> bool {
        let parse = |value: &str| match DateTime::parse_from_rfc3339(value) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(timestamp = value, "record has unparseable timestamp: {e}");
                None
            }
        };

        let Some(start) = parse(&event.start_timestamp) else {
            return false;
        };
        let Some(end) = parse(&event.end_timestamp) else {
            return false;
        };

        start >= self.window_start && end <= self.window_end
    }
}

/// Window timestamps are given in local time without an offset.
fn parse_window_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, WINDOW_TIMESTAMP_FORMAT)?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| Local.from_utc_datetime(&naive));
    Ok(local.with_timezone(&Utc))
}

/// The operation criterion is restricted to the five known operation
/// names, optionally alternated with `|`.
fn compile_operation(raw: &str) -> Result<Regex> {
    let lowered = raw.to_lowercase();
    let allowed = Regex::new(r"^(install|reinstall|upgrade|remove|purge)(\|(install|reinstall|upgrade|remove|purge))*$")
        .context("invalid operation validation pattern")?;
    if !allowed.is_match(&lowered) {
        bail!(
            "invalid operation '{raw}': must be install, reinstall, upgrade, remove, or purge, optionally separated by '|'"
        );
    }
    Regex::new(&lowered).context("failed to compile operation pattern")
}
