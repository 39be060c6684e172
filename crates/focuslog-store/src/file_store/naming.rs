// ABOUTME: File naming for per-record artifacts: <timestamp>_<label>_<id fragment>.json.
// ABOUTME: Names sort by time and carry enough to pick recent files without opening them.

use chrono::{DateTime, NaiveDateTime, Utc};
use focuslog_core::Record;
use ulid::Ulid;

const TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3fZ";
const MAX_LABEL_LEN: usize = 32;
const FRAGMENT_LEN: usize = 8;
pub(crate) const EXTENSION: &str = ".json";

/// Pieces recovered from a record file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedName {
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub fragment: String,
}

pub(crate) fn file_name_for(record: &Record) -> String {
    format!(
        "{}_{}_{}{}",
        record.timestamp().format(TIME_FORMAT),
        sanitize_label(&record.label()),
        id_fragment(record.id()),
        EXTENSION
    )
}

/// Lowercase, `[a-z0-9-]` only, no leading/trailing or doubled dashes.
pub(crate) fn sanitize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len().min(MAX_LABEL_LEN));
    let mut last_dash = true;
    for ch in label.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= MAX_LABEL_LEN {
            break;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Last characters of the ULID, which carry its random component.
pub(crate) fn id_fragment(id: Ulid) -> String {
    let text = id.to_string();
    text[text.len() - FRAGMENT_LEN..].to_ascii_lowercase()
}

pub(crate) fn is_record_file(name: &str) -> bool {
    name.ends_with(EXTENSION) && !name.starts_with('.')
}

pub(crate) fn parse_file_name(name: &str) -> Option<ParsedName> {
    let stem = name.strip_suffix(EXTENSION)?;
    let (time_part, rest) = stem.split_once('_')?;
    let (label, fragment) = rest.rsplit_once('_')?;
    let naive = NaiveDateTime::parse_from_str(time_part, TIME_FORMAT).ok()?;
    Some(ParsedName {
        timestamp: naive.and_utc(),
        label: label.to_string(),
        fragment: fragment.to_string(),
    })
}
