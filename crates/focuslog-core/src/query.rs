// ABOUTME: Time ranges and structured record queries shared by every backend.
// ABOUTME: A query is a predicate that can run in memory or be pushed down to SQL.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::category::Category;
use crate::record::{Record, RecordKind};

/// 9999-12-31T23:59:59Z, the open end of an unbounded range.
const FAR_FUTURE_SECS: i64 = 253_402_300_799;

/// An inclusive `[start, end]` time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Every timestamp a stored record can plausibly carry.
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::UNIX_EPOCH,
            end: DateTime::from_timestamp(FAR_FUTURE_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// The window ending now and reaching `span` into the past.
    pub fn last(span: Duration) -> Self {
        let end = Utc::now();
        Self {
            start: end - span,
            end,
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

/// Which records to return. Every filter is optional except the range.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub range: TimeRange,
    pub kind: Option<RecordKind>,
    pub app_name: Option<String>,
    pub category: Option<Category>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn in_range(range: TimeRange) -> Self {
        Self {
            range,
            kind: None,
            app_name: None,
            category: None,
            limit: None,
        }
    }

    pub fn all() -> Self {
        Self::in_range(TimeRange::all())
    }

    pub fn of_kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn for_app(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn in_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate every filter except the limit.
    pub fn matches(&self, record: &Record) -> bool {
        if !self.range.contains(record.timestamp()) {
            return false;
        }
        if let Some(kind) = self.kind
            && record.kind() != kind
        {
            return false;
        }
        if let Some(app) = &self.app_name
            && !record.involves_app(app)
        {
            return false;
        }
        if let Some(category) = self.category
            && !record.involves_category(category)
        {
            return false;
        }
        true
    }
}

/// Newest first; equal timestamps fall back to descending id so both
/// backends return identical orderings.
pub fn newest_first(a: &Record, b: &Record) -> Ordering {
    b.timestamp()
        .cmp(&a.timestamp())
        .then_with(|| b.id().cmp(&a.id()))
}

pub fn sort_newest_first(records: &mut [Record]) {
    records.sort_by(newest_first);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationEvent;
    use crate::switch::ContextSwitch;

    #[test]
    fn range_is_inclusive() {
        let now = Utc::now();
        let range = TimeRange::new(now - Duration::hours(1), now);
        assert!(range.contains(now));
        assert!(range.contains(now - Duration::hours(1)));
        assert!(!range.contains(now + Duration::seconds(1)));
    }

    #[test]
    fn filters_combine() {
        let now = Utc::now();
        let event: Record = ActivationEvent::new("Code", Category::Development)
            .at(now - Duration::minutes(5))
            .into();
        let switch: Record = ContextSwitch::new("Code", "Slack", 30.0)
            .at(now - Duration::minutes(4))
            .into();

        let q = RecordQuery::in_range(TimeRange::last(Duration::hours(1)));
        assert!(q.matches(&event));
        assert!(q.matches(&switch));

        let q = q.of_kind(RecordKind::Switch).for_app("Slack");
        assert!(!q.matches(&event));
        assert!(q.matches(&switch));

        let q = RecordQuery::all().in_category(Category::Development);
        assert!(q.matches(&event));
        assert!(!q.matches(&switch));
    }

    #[test]
    fn sorting_is_newest_first() {
        let now = Utc::now();
        let older: Record = ActivationEvent::new("A", Category::Social)
            .at(now - Duration::minutes(10))
            .into();
        let newer: Record = ActivationEvent::new("B", Category::Social).at(now).into();
        let mut records = vec![older.clone(), newer.clone()];
        sort_newest_first(&mut records);
        assert_eq!(records[0].id(), newer.id());
        assert_eq!(records[1].id(), older.id());
    }
}
