// ABOUTME: Core library for focuslog, containing the record model and its validation rules.
// ABOUTME: Defines activation events, context switches, queries, usage stats and backend identity.

pub mod activation;
pub mod backend;
pub mod category;
pub mod error;
pub mod query;
pub mod record;
pub mod switch;
pub mod usage;
pub mod validation;

pub use activation::{ActivationEvent, Decoration, TabInfo};
pub use backend::BackendKind;
pub use category::Category;
pub use error::ModelError;
pub use query::{RecordQuery, TimeRange, newest_first, sort_newest_first};
pub use record::{Record, RecordKind};
pub use switch::{ContextSwitch, SwitchType};
pub use usage::{RecordCounts, UsageAccumulator, UsageStat, aggregate_usage};
pub use validation::{IssueKind, ValidationIssue, find_duplicates};
