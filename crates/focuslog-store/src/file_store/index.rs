// ABOUTME: In-memory index of loaded records ordered by (timestamp, id).
// ABOUTME: Lookups by id go through a side table so upserts replace the old position.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use focuslog_core::{Record, RecordCounts, RecordQuery, TimeRange};
use ulid::Ulid;

#[derive(Debug, Default)]
pub(crate) struct RecordIndex {
    by_time: BTreeMap<(DateTime<Utc>, Ulid), Record>,
    by_id: HashMap<Ulid, DateTime<Utc>>,
}

impl RecordIndex {
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn contains(&self, id: Ulid) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn get(&self, id: Ulid) -> Option<&Record> {
        let ts = self.by_id.get(&id)?;
        self.by_time.get(&(*ts, id))
    }

    /// Insert or replace by id, returning the previous record.
    pub fn upsert(&mut self, record: Record) -> Option<Record> {
        let id = record.id();
        let previous = self.remove(id);
        self.by_id.insert(id, record.timestamp());
        self.by_time.insert((record.timestamp(), id), record);
        previous
    }

    /// Insert only if the id is unknown. Returns whether it was inserted.
    pub fn insert_if_absent(&mut self, record: Record) -> bool {
        if self.contains(record.id()) {
            return false;
        }
        self.upsert(record);
        true
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Record> {
        let ts = self.by_id.remove(&id)?;
        self.by_time.remove(&(ts, id))
    }

    pub fn clear(&mut self) {
        self.by_time.clear();
        self.by_id.clear();
    }

    /// Records inside `range`, newest first.
    pub fn in_range(&self, range: TimeRange) -> impl Iterator<Item = &Record> {
        let bounds = (range.start <= range.end)
            .then(|| ((range.start, Ulid::nil()), (range.end, Ulid::from(u128::MAX))));
        bounds
            .into_iter()
            .flat_map(move |(lo, hi)| self.by_time.range(lo..=hi).rev().map(|(_, r)| r))
    }

    pub fn query(&self, query: &RecordQuery) -> Vec<Record> {
        self.in_range(query.range)
            .filter(|r| query.matches(r))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Every record, newest first.
    pub fn records(&self) -> Vec<Record> {
        self.by_time.values().rev().cloned().collect()
    }

    pub fn counts(&self) -> RecordCounts {
        RecordCounts::from_records(self.by_time.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use focuslog_core::{ActivationEvent, Category, ContextSwitch, RecordKind};

    fn event_at(app: &str, minutes_ago: i64) -> Record {
        ActivationEvent::new(app, Category::Productivity)
            .at(Utc::now() - Duration::minutes(minutes_ago))
            .into()
    }

    #[test]
    fn upsert_moves_record_to_new_timestamp() {
        let mut index = RecordIndex::default();
        let record = event_at("A", 10);
        let id = record.id();
        index.upsert(record.clone());

        let Record::Activation(mut moved) = record else {
            unreachable!()
        };
        moved.timestamp = Utc::now();
        let previous = index.upsert(moved.into());

        assert!(previous.is_some());
        assert_eq!(index.len(), 1);
        assert_eq!(index.records().len(), 1);
        assert!(index.get(id).is_some());
    }

    #[test]
    fn insert_if_absent_keeps_existing() {
        let mut index = RecordIndex::default();
        let record = event_at("A", 1);
        assert!(index.insert_if_absent(record.clone()));
        assert!(!index.insert_if_absent(record));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn query_is_newest_first_and_limited() {
        let mut index = RecordIndex::default();
        for minutes in [30, 10, 20] {
            index.upsert(event_at("A", minutes));
        }
        index.upsert(ContextSwitch::new("A", "B", 3.0).into());

        let all = index.query(&RecordQuery::all());
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].timestamp() >= w[1].timestamp()));

        let limited = index.query(&RecordQuery::all().of_kind(RecordKind::Activation).with_limit(2));
        assert_eq!(limited.len(), 2);
        assert!(limited.iter().all(|r| r.kind() == RecordKind::Activation));
    }

    #[test]
    fn inverted_range_is_empty() {
        let mut index = RecordIndex::default();
        index.upsert(event_at("A", 1));
        let now = Utc::now();
        let range = TimeRange::new(now, now - Duration::hours(1));
        assert_eq!(index.in_range(range).count(), 0);
    }

    #[test]
    fn remove_and_counts() {
        let mut index = RecordIndex::default();
        let record = event_at("A", 1);
        let id = record.id();
        index.upsert(record);
        index.upsert(ContextSwitch::new("A", "B", 1.0).into());
        assert_eq!(index.counts().total(), 2);
        assert!(index.remove(id).is_some());
        assert!(index.remove(id).is_none());
        assert_eq!(index.counts().activations, 0);
    }
}
