// ABOUTME: Per-application usage aggregation and per-kind record counts.
// ABOUTME: The accumulator is shared by the in-memory and SQL backends so results agree.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::category::Category;
use crate::record::{Record, RecordKind};

/// Usage of one application (within one category) over a time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStat {
    pub app_name: String,
    pub category: Category,
    /// Sum of `time_spent` over switches that left this app.
    pub focus_seconds: f64,
    /// Number of activation events for this app.
    pub activations: u64,
    /// Number of switches that left this app.
    pub switches_away: u64,
}

/// Builds a usage table from activations and switch totals.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    stats: HashMap<(String, Category), UsageStat>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, app_name: &str, category: Category) -> &mut UsageStat {
        self.stats
            .entry((app_name.to_string(), category))
            .or_insert_with(|| UsageStat {
                app_name: app_name.to_string(),
                category,
                focus_seconds: 0.0,
                activations: 0,
                switches_away: 0,
            })
    }

    pub fn add_activations(&mut self, app_name: &str, category: Category, count: u64) {
        self.entry(app_name, category).activations += count;
    }

    pub fn add_focus(&mut self, app_name: &str, category: Category, seconds: f64, switches: u64) {
        let stat = self.entry(app_name, category);
        stat.focus_seconds += seconds;
        stat.switches_away += switches;
    }

    /// Fold a single record in. Activations without an app name carry no
    /// usage and are ignored.
    pub fn add_record(&mut self, record: &Record) {
        match record {
            Record::Activation(e) => {
                if let Some(app) = &e.app_name {
                    self.add_activations(app, e.category, 1);
                }
            }
            Record::Switch(s) => self.add_focus(&s.from_app, s.from_category, s.time_spent, 1),
        }
    }

    /// Highest focus time first, then most activations, then by name.
    pub fn finish(self) -> Vec<UsageStat> {
        let mut stats: Vec<UsageStat> = self.stats.into_values().collect();
        stats.sort_by(|a, b| {
            b.focus_seconds
                .total_cmp(&a.focus_seconds)
                .then_with(|| b.activations.cmp(&a.activations))
                .then_with(|| a.app_name.cmp(&b.app_name))
                .then_with(|| a.category.cmp(&b.category))
        });
        stats
    }
}

pub fn aggregate_usage<'a>(records: impl IntoIterator<Item = &'a Record>) -> Vec<UsageStat> {
    let mut acc = UsageAccumulator::new();
    for record in records {
        acc.add_record(record);
    }
    acc.finish()
}

/// Number of stored records of each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub activations: usize,
    pub switches: usize,
}

impl RecordCounts {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut counts = Self::default();
        for record in records {
            counts.add(record.kind());
        }
        counts
    }

    pub fn add(&mut self, kind: RecordKind) {
        match kind {
            RecordKind::Activation => self.activations += 1,
            RecordKind::Switch => self.switches += 1,
        }
    }

    pub fn get(&self, kind: RecordKind) -> usize {
        match kind {
            RecordKind::Activation => self.activations,
            RecordKind::Switch => self.switches,
        }
    }

    pub fn total(&self) -> usize {
        self.activations + self.switches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationEvent;
    use crate::switch::ContextSwitch;

    #[test]
    fn usage_groups_by_app_and_category() {
        let records: Vec<Record> = vec![
            ActivationEvent::new("Code", Category::Development).into(),
            ActivationEvent::new("Code", Category::Development).into(),
            ActivationEvent::new("Slack", Category::Communication).into(),
            ContextSwitch::new("Code", "Slack", 120.0)
                .with_categories(Category::Development, Category::Communication)
                .into(),
            ContextSwitch::new("Code", "Slack", 30.0)
                .with_categories(Category::Development, Category::Communication)
                .into(),
            ContextSwitch::new("Slack", "Code", 15.0)
                .with_categories(Category::Communication, Category::Development)
                .into(),
        ];

        let stats = aggregate_usage(&records);
        assert_eq!(stats.len(), 2);

        assert_eq!(stats[0].app_name, "Code");
        assert_eq!(stats[0].activations, 2);
        assert_eq!(stats[0].switches_away, 2);
        assert!((stats[0].focus_seconds - 150.0).abs() < 1e-9);

        assert_eq!(stats[1].app_name, "Slack");
        assert_eq!(stats[1].activations, 1);
        assert_eq!(stats[1].switches_away, 1);
    }

    #[test]
    fn counts_by_kind() {
        let records: Vec<Record> = vec![
            ActivationEvent::new("A", Category::Social).into(),
            ContextSwitch::new("A", "B", 1.0).into(),
            ContextSwitch::new("B", "A", 1.0).into(),
        ];
        let counts = RecordCounts::from_records(&records);
        assert_eq!(counts.get(RecordKind::Activation), 1);
        assert_eq!(counts.get(RecordKind::Switch), 2);
        assert_eq!(counts.total(), 3);
    }
}
