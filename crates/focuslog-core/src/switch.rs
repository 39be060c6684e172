// ABOUTME: Context-switch metric: focus moved from one app to another after some time spent.
// ABOUTME: The switch type is derived from time spent and recomputed on every deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::category::Category;
use crate::validation::{ValidationIssue, check_not_blank, check_timestamp};

/// Switches shorter than this are brief.
pub const BRIEF_SWITCH_SECS: f64 = 10.0;

/// Switches at least this long are sustained.
pub const SUSTAINED_SWITCH_SECS: f64 = 300.0;

/// Classification of a switch by how long the user stayed in the app they left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchType {
    Brief,
    Typical,
    Sustained,
}

impl SwitchType {
    pub fn classify(time_spent: f64) -> Self {
        if time_spent < BRIEF_SWITCH_SECS {
            SwitchType::Brief
        } else if time_spent < SUSTAINED_SWITCH_SECS {
            SwitchType::Typical
        } else {
            SwitchType::Sustained
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchType::Brief => "brief",
            SwitchType::Typical => "typical",
            SwitchType::Sustained => "sustained",
        }
    }
}

/// A transition between two applications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredSwitch")]
pub struct ContextSwitch {
    pub id: Ulid,
    pub from_app: String,
    pub from_bundle_id: Option<String>,
    pub to_app: String,
    pub to_bundle_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Seconds spent in `from_app` before switching away.
    pub time_spent: f64,
    pub switch_type: SwitchType,
    pub from_category: Category,
    pub to_category: Category,
    pub session_id: Option<Ulid>,
}

/// On-disk shape of a switch. Any stored `switch_type` is ignored.
#[derive(Deserialize)]
struct StoredSwitch {
    id: Ulid,
    from_app: String,
    #[serde(default)]
    from_bundle_id: Option<String>,
    to_app: String,
    #[serde(default)]
    to_bundle_id: Option<String>,
    timestamp: DateTime<Utc>,
    time_spent: f64,
    #[serde(default)]
    from_category: Category,
    #[serde(default)]
    to_category: Category,
    #[serde(default)]
    session_id: Option<Ulid>,
}

impl From<StoredSwitch> for ContextSwitch {
    fn from(s: StoredSwitch) -> Self {
        Self {
            id: s.id,
            from_app: s.from_app,
            from_bundle_id: s.from_bundle_id,
            to_app: s.to_app,
            to_bundle_id: s.to_bundle_id,
            timestamp: s.timestamp,
            time_spent: s.time_spent,
            switch_type: SwitchType::classify(s.time_spent),
            from_category: s.from_category,
            to_category: s.to_category,
            session_id: s.session_id,
        }
    }
}

impl ContextSwitch {
    pub fn new(from_app: impl Into<String>, to_app: impl Into<String>, time_spent: f64) -> Self {
        Self {
            id: Ulid::new(),
            from_app: from_app.into(),
            from_bundle_id: None,
            to_app: to_app.into(),
            to_bundle_id: None,
            timestamp: Utc::now(),
            time_spent,
            switch_type: SwitchType::classify(time_spent),
            from_category: Category::Uncategorized,
            to_category: Category::Uncategorized,
            session_id: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_categories(mut self, from: Category, to: Category) -> Self {
        self.from_category = from;
        self.to_category = to;
        self
    }

    pub fn in_session(mut self, session_id: Ulid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Recompute the derived switch type from `time_spent`.
    pub fn normalized(mut self) -> Self {
        self.switch_type = SwitchType::classify(self.time_spent);
        self
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationIssue> {
        check_not_blank(&self.from_app, "from_app", self.id)?;
        check_not_blank(&self.to_app, "to_app", self.id)?;
        if !self.time_spent.is_finite() || self.time_spent < 0.0 {
            return Err(ValidationIssue::corrupted(
                format!("time_spent {} is not a non-negative duration", self.time_spent),
                Some(self.id),
            ));
        }
        check_timestamp(self.timestamp, now, self.id)
    }

    /// Names of persisted fields that differ from `other`.
    pub fn diff_fields(&self, other: &ContextSwitch) -> Vec<&'static str> {
        let mut diffs = Vec::new();
        if self.id != other.id {
            diffs.push("id");
        }
        if self.from_app != other.from_app {
            diffs.push("from_app");
        }
        if self.from_bundle_id != other.from_bundle_id {
            diffs.push("from_bundle_id");
        }
        if self.to_app != other.to_app {
            diffs.push("to_app");
        }
        if self.to_bundle_id != other.to_bundle_id {
            diffs.push("to_bundle_id");
        }
        if self.timestamp != other.timestamp {
            diffs.push("timestamp");
        }
        if self.time_spent.to_bits() != other.time_spent.to_bits() {
            diffs.push("time_spent");
        }
        if self.switch_type != other.switch_type {
            diffs.push("switch_type");
        }
        if self.from_category != other.from_category {
            diffs.push("from_category");
        }
        if self.to_category != other.to_category {
            diffs.push("to_category");
        }
        if self.session_id != other.session_id {
            diffs.push("session_id");
        }
        diffs
    }
}
