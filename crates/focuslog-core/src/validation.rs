// ABOUTME: Validation issues and the shared checks used on append, on read, and before migration.
// ABOUTME: Issues are plain data describing an integrity problem; they are never raised as errors.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// How far ahead of the local clock a record may be stamped before it is
/// treated as clock-skew corruption.
pub const FUTURE_TOLERANCE_SECS: i64 = 60 * 60;

/// 2001-01-01T00:00:00Z. Anything older comes from a zeroed or reset clock.
pub const EARLIEST_PLAUSIBLE_SECS: i64 = 978_307_200;

/// The class of integrity problem an issue describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingData,
    CorruptedData,
    DuplicateData,
    TimestampInconsistency,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::MissingData => "missing_data",
            IssueKind::CorruptedData => "corrupted_data",
            IssueKind::DuplicateData => "duplicate_data",
            IssueKind::TimestampInconsistency => "timestamp_inconsistency",
        }
    }
}

/// A structured description of a data-integrity problem, optionally pointing
/// at the record that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub description: String,
    pub record_id: Option<Ulid>,
}

impl ValidationIssue {
    pub fn new(kind: IssueKind, description: impl Into<String>, record_id: Option<Ulid>) -> Self {
        Self {
            kind,
            description: description.into(),
            record_id,
        }
    }

    pub fn missing(description: impl Into<String>, record_id: Option<Ulid>) -> Self {
        Self::new(IssueKind::MissingData, description, record_id)
    }

    pub fn corrupted(description: impl Into<String>, record_id: Option<Ulid>) -> Self {
        Self::new(IssueKind::CorruptedData, description, record_id)
    }

    pub fn duplicate(description: impl Into<String>, record_id: Option<Ulid>) -> Self {
        Self::new(IssueKind::DuplicateData, description, record_id)
    }

    pub fn timestamp(description: impl Into<String>, record_id: Option<Ulid>) -> Self {
        Self::new(IssueKind::TimestampInconsistency, description, record_id)
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.description)?;
        if let Some(id) = self.record_id {
            write!(f, " (record {})", id)?;
        }
        Ok(())
    }
}

/// Reject timestamps that sit too far in the future or before any plausible
/// recording date.
pub(crate) fn check_timestamp(
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
    id: Ulid,
) -> Result<(), ValidationIssue> {
    if timestamp > now + Duration::seconds(FUTURE_TOLERANCE_SECS) {
        return Err(ValidationIssue::timestamp(
            format!(
                "timestamp {} is more than {}s ahead of {}",
                timestamp.to_rfc3339(),
                FUTURE_TOLERANCE_SECS,
                now.to_rfc3339()
            ),
            Some(id),
        ));
    }
    if timestamp.timestamp() < EARLIEST_PLAUSIBLE_SECS {
        return Err(ValidationIssue::timestamp(
            format!("timestamp {} predates 2001", timestamp.to_rfc3339()),
            Some(id),
        ));
    }
    Ok(())
}

/// Reject present-but-blank text fields.
pub(crate) fn check_not_blank(value: &str, field: &str, id: Ulid) -> Result<(), ValidationIssue> {
    if value.trim().is_empty() {
        return Err(ValidationIssue::corrupted(
            format!("{} is empty", field),
            Some(id),
        ));
    }
    Ok(())
}

/// Report every identifier that appears more than once. Each repeated
/// occurrence after the first yields one issue.
pub fn find_duplicates(ids: impl IntoIterator<Item = Ulid>) -> Vec<ValidationIssue> {
    let mut seen = HashSet::new();
    let mut issues = Vec::new();
    for id in ids {
        if !seen.insert(id) {
            issues.push(ValidationIssue::duplicate(
                format!("identifier {} appears more than once", id),
                Some(id),
            ));
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn future_timestamp_beyond_tolerance_is_flagged() {
        let now = Utc::now();
        let id = Ulid::new();

        assert!(check_timestamp(now + Duration::minutes(59), now, id).is_ok());

        let issue = check_timestamp(now + Duration::minutes(61), now, id).unwrap_err();
        assert_eq!(issue.kind, IssueKind::TimestampInconsistency);
        assert_eq!(issue.record_id, Some(id));
    }

    #[test]
    fn pre_2001_timestamp_is_flagged() {
        let ancient = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        let issue = check_timestamp(ancient, Utc::now(), Ulid::new()).unwrap_err();
        assert_eq!(issue.kind, IssueKind::TimestampInconsistency);
    }

    #[test]
    fn duplicates_are_reported_once_per_repeat() {
        let a = Ulid::new();
        let b = Ulid::new();
        let issues = find_duplicates([a, b, a, a]);
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.kind == IssueKind::DuplicateData));
        assert!(issues.iter().all(|i| i.record_id == Some(a)));
    }

    #[test]
    fn display_includes_kind_and_record() {
        let id = Ulid::new();
        let issue = ValidationIssue::corrupted("app_name is empty", Some(id));
        let text = issue.to_string();
        assert!(text.starts_with("[corrupted_data] app_name is empty"));
        assert!(text.contains(&id.to_string()));
    }
}
