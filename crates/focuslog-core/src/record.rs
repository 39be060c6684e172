// ABOUTME: The Record enum unifying activation events and context switches.
// ABOUTME: Serialized with a `kind` tag; exposes the accessors every backend needs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::activation::ActivationEvent;
use crate::category::Category;
use crate::error::ModelError;
use crate::switch::ContextSwitch;
use crate::validation::ValidationIssue;

/// The two record types a backend stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Activation,
    Switch,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Activation, RecordKind::Switch];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Activation => "activation",
            RecordKind::Switch => "switch",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activation" => Ok(RecordKind::Activation),
            "switch" => Ok(RecordKind::Switch),
            other => Err(ModelError::UnknownKind(other.to_string())),
        }
    }
}

/// Either record type, as handed to and returned from a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Activation(ActivationEvent),
    Switch(ContextSwitch),
}

impl From<ActivationEvent> for Record {
    fn from(event: ActivationEvent) -> Self {
        Record::Activation(event)
    }
}

impl From<ContextSwitch> for Record {
    fn from(switch: ContextSwitch) -> Self {
        Record::Switch(switch)
    }
}

impl Record {
    pub fn id(&self) -> Ulid {
        match self {
            Record::Activation(e) => e.id,
            Record::Switch(s) => s.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Activation(e) => e.timestamp,
            Record::Switch(s) => s.timestamp,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Activation(_) => RecordKind::Activation,
            Record::Switch(_) => RecordKind::Switch,
        }
    }

    /// Human-oriented label used to name the record's artifact.
    pub fn label(&self) -> String {
        match self {
            Record::Activation(e) => e
                .app_name
                .clone()
                .or_else(|| e.tab.as_ref().and_then(|t| t.domain.clone()))
                .unwrap_or_else(|| "unknown".to_string()),
            Record::Switch(s) => format!("{}-to-{}", s.from_app, s.to_app),
        }
    }

    /// Whether the record mentions `app_name` (either side of a switch).
    pub fn involves_app(&self, app_name: &str) -> bool {
        match self {
            Record::Activation(e) => e.app_name.as_deref() == Some(app_name),
            Record::Switch(s) => s.from_app == app_name || s.to_app == app_name,
        }
    }

    /// Whether the record carries `category` (either side of a switch).
    pub fn involves_category(&self, category: Category) -> bool {
        match self {
            Record::Activation(e) => e.category == category,
            Record::Switch(s) => s.from_category == category || s.to_category == category,
        }
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationIssue> {
        match self {
            Record::Activation(e) => e.validate(now),
            Record::Switch(s) => s.validate(now),
        }
    }

    /// Recompute derived fields and drop in-memory decoration, yielding
    /// exactly what a backend will persist.
    pub fn normalized(self) -> Self {
        match self {
            Record::Activation(mut e) => {
                e.decoration = None;
                Record::Activation(e)
            }
            Record::Switch(s) => Record::Switch(s.normalized()),
        }
    }

    /// Names of persisted fields that differ from `other`.
    pub fn diff_fields(&self, other: &Record) -> Vec<&'static str> {
        match (self, other) {
            (Record::Activation(a), Record::Activation(b)) => a.diff_fields(b),
            (Record::Switch(a), Record::Switch(b)) => a.diff_fields(b),
            _ => vec!["kind"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::TabInfo;
    use crate::switch::SwitchType;

    #[test]
    fn record_json_carries_kind_tag() {
        let record: Record = ActivationEvent::new("Finder", Category::Utilities).into();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["kind"], "activation");
        assert_eq!(value["app_name"], "Finder");

        let back: Record = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn switch_record_recomputes_type_through_tag() {
        let record: Record = ContextSwitch::new("Mail", "Notes", 400.0).into();
        let mut value = serde_json::to_value(&record).unwrap();
        value["switch_type"] = serde_json::json!("brief");

        let back: Record = serde_json::from_value(value).unwrap();
        match back {
            Record::Switch(s) => assert_eq!(s.switch_type, SwitchType::Sustained),
            other => panic!("expected switch, got {:?}", other),
        }
    }

    #[test]
    fn label_falls_back_to_tab_domain() {
        let mut event = ActivationEvent::new("x", Category::Browsing).with_tab(TabInfo {
            title: Some("Docs".to_string()),
            url: Some("https://docs.rs/".to_string()),
            domain: Some("docs.rs".to_string()),
        });
        event.app_name = None;
        assert_eq!(Record::from(event).label(), "docs.rs");
    }

    #[test]
    fn switch_involves_both_sides() {
        let record: Record = ContextSwitch::new("Mail", "Notes", 3.0)
            .with_categories(Category::Communication, Category::Productivity)
            .into();
        assert!(record.involves_app("Mail"));
        assert!(record.involves_app("Notes"));
        assert!(!record.involves_app("Slack"));
        assert!(record.involves_category(Category::Productivity));
        assert!(!record.involves_category(Category::Social));
    }

    #[test]
    fn kinds_differ_in_diff() {
        let a: Record = ActivationEvent::new("A", Category::Social).into();
        let b: Record = ContextSwitch::new("A", "B", 1.0).into();
        assert_eq!(a.diff_fields(&b), vec!["kind"]);
    }
}
