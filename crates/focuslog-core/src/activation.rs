// ABOUTME: Activation event record: an application (or browser tab) came to the foreground.
// ABOUTME: Carries optional session linkage and an in-memory-only icon decoration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::category::Category;
use crate::validation::{ValidationIssue, check_not_blank, check_timestamp};

/// Browser tab metadata captured when the activated app is a browser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Presentation-only data attached after load (for example a cached app
/// icon). Never serialized and never written to any backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoration {
    pub icon_png: Vec<u8>,
}

/// A single "this app became active" fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationEvent {
    pub id: Ulid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub bundle_id: Option<String>,
    #[serde(default)]
    pub tab: Option<TabInfo>,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub session_id: Option<Ulid>,
    #[serde(default)]
    pub session_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_session_start: bool,
    #[serde(default)]
    pub is_session_end: bool,
    #[serde(default)]
    pub switch_count: u32,
    #[serde(skip)]
    pub decoration: Option<Decoration>,
}

impl ActivationEvent {
    /// Create an activation for `app_name` stamped now with a fresh id.
    pub fn new(app_name: impl Into<String>, category: Category) -> Self {
        Self {
            id: Ulid::new(),
            timestamp: Utc::now(),
            app_name: Some(app_name.into()),
            bundle_id: None,
            tab: None,
            category,
            session_id: None,
            session_start: None,
            session_end: None,
            is_session_start: false,
            is_session_end: false,
            switch_count: 0,
            decoration: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }

    pub fn with_tab(mut self, tab: TabInfo) -> Self {
        self.tab = Some(tab);
        self
    }

    /// Mark this activation as the first one of `session_id`.
    pub fn starting_session(mut self, session_id: Ulid) -> Self {
        self.session_id = Some(session_id);
        self.session_start = Some(self.timestamp);
        self.is_session_start = true;
        self
    }

    /// Mark this activation as closing `session_id`, which began at `started`.
    pub fn ending_session(mut self, session_id: Ulid, started: DateTime<Utc>, switches: u32) -> Self {
        self.session_id = Some(session_id);
        self.session_start = Some(started);
        self.session_end = Some(self.timestamp);
        self.is_session_end = true;
        self.switch_count = switches;
        self
    }

    /// Check the event's invariants against the clock reading `now`.
    /// Returns the first problem found.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationIssue> {
        if let Some(name) = &self.app_name {
            check_not_blank(name, "app_name", self.id)?;
        }
        if (self.is_session_start || self.is_session_end) && self.session_id.is_none() {
            return Err(ValidationIssue::missing(
                "session boundary flag set without a session_id",
                Some(self.id),
            ));
        }
        check_timestamp(self.timestamp, now, self.id)?;
        if let (Some(start), Some(end)) = (self.session_start, self.session_end)
            && end < start
        {
            return Err(ValidationIssue::timestamp(
                format!(
                    "session ends at {} before it starts at {}",
                    end.to_rfc3339(),
                    start.to_rfc3339()
                ),
                Some(self.id),
            ));
        }
        Ok(())
    }

    /// Names of persisted fields that differ from `other`. The decoration is
    /// not persisted and is ignored.
    pub fn diff_fields(&self, other: &ActivationEvent) -> Vec<&'static str> {
        let mut diffs = Vec::new();
        if self.id != other.id {
            diffs.push("id");
        }
        if self.timestamp != other.timestamp {
            diffs.push("timestamp");
        }
        if self.app_name != other.app_name {
            diffs.push("app_name");
        }
        if self.bundle_id != other.bundle_id {
            diffs.push("bundle_id");
        }
        if self.tab != other.tab {
            diffs.push("tab");
        }
        if self.category != other.category {
            diffs.push("category");
        }
        if self.session_id != other.session_id {
            diffs.push("session_id");
        }
        if self.session_start != other.session_start {
            diffs.push("session_start");
        }
        if self.session_end != other.session_end {
            diffs.push("session_end");
        }
        if self.is_session_start != other.is_session_start {
            diffs.push("is_session_start");
        }
        if self.is_session_end != other.is_session_end {
            diffs.push("is_session_end");
        }
        if self.switch_count != other.switch_count {
            diffs.push("switch_count");
        }
        diffs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::IssueKind;
    use chrono::Duration;

    #[test]
    fn valid_event_passes() {
        let event = ActivationEvent::new("Xcode", Category::Development).starting_session(Ulid::new());
        assert!(event.validate(Utc::now()).is_ok());
    }

    #[test]
    fn blank_app_name_is_corrupted() {
        let event = ActivationEvent::new("", Category::Productivity);
        let issue = event.validate(Utc::now()).unwrap_err();
        assert_eq!(issue.kind, IssueKind::CorruptedData);
        assert_eq!(issue.record_id, Some(event.id));
    }

    #[test]
    fn absent_app_name_is_allowed() {
        let mut event = ActivationEvent::new("Safari", Category::Browsing);
        event.app_name = None;
        assert!(event.validate(Utc::now()).is_ok());
    }

    #[test]
    fn session_flag_without_id_is_missing_data() {
        let mut event = ActivationEvent::new("Mail", Category::Communication);
        event.is_session_end = true;
        let issue = event.validate(Utc::now()).unwrap_err();
        assert_eq!(issue.kind, IssueKind::MissingData);
    }

    #[test]
    fn session_ending_before_start_is_inconsistent() {
        let now = Utc::now();
        let event = ActivationEvent::new("Notes", Category::Productivity)
            .at(now - Duration::hours(2))
            .ending_session(Ulid::new(), now - Duration::hours(1), 3);
        let issue = event.validate(now).unwrap_err();
        assert_eq!(issue.kind, IssueKind::TimestampInconsistency);
    }

    #[test]
    fn decoration_is_not_serialized() {
        let mut event = ActivationEvent::new("Slack", Category::Communication);
        event.decoration = Some(Decoration { icon_png: vec![1, 2, 3] });

        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("decoration"));

        let back: ActivationEvent = serde_json::from_str(&json).unwrap();
        assert!(back.decoration.is_none());
        assert!(back.diff_fields(&event).is_empty());
    }

    #[test]
    fn diff_fields_names_changed_fields() {
        let a = ActivationEvent::new("Figma", Category::Productivity);
        let mut b = a.clone();
        b.category = Category::Entertainment;
        b.switch_count = 9;
        assert_eq!(a.diff_fields(&b), vec!["category", "switch_count"]);
    }
}
