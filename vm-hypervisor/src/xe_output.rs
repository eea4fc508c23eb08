//! Parsers for `xe` command output.
//!
//! `xe <class>-list params=all` prints one record per object, records
//! separated by blank lines, each line shaped like
//!
//! ```text
//! name-label ( RW)    : PRD-web
//! other-config (MRW)  : mtu: 1500; ethtool-gso: off
//! ```
//!
//! `--minimal` output is a single comma-separated line.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

static FIELD_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z0-9_.\-]+)\s*(?:\(\s*[A-Z]{2,3}\s*\))?\s*:\s?(.*)$")
        .expect("xe field pattern is valid")
});

/// Field name to value, in output order.
pub type XeRecord = IndexMap<String, String>;

/// Split `params=all` output into records.
pub fn parse_records(output: &str) -> Vec<XeRecord> {
    let mut records = Vec::new();
    let mut current = XeRecord::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(caps) = FIELD_LINE.captures(line) {
            current.insert(caps[1].to_string(), caps[2].trim_end().to_string());
        }
    }
    if !current.is_empty() {
        records.push(current);
    }

    records
}

/// Split `--minimal` output into values.
pub fn parse_minimal(output: &str) -> Vec<String> {
    output
        .trim()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Field lookup that treats a missing field as empty.
pub fn field<'a>(record: &'a XeRecord, name: &str) -> &'a str {
    record.get(name).map(String::as_str).unwrap_or("")
}
