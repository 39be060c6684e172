// ABOUTME: Category tags attached to applications in activation events and context switches.
// ABOUTME: Stored as snake_case labels in record files and database columns.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// The fixed set of category tags an application can carry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Productivity,
    Development,
    Communication,
    Browsing,
    Entertainment,
    Social,
    Utilities,
    #[default]
    Uncategorized,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Productivity,
        Category::Development,
        Category::Communication,
        Category::Browsing,
        Category::Entertainment,
        Category::Social,
        Category::Utilities,
        Category::Uncategorized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Productivity => "productivity",
            Category::Development => "development",
            Category::Communication => "communication",
            Category::Browsing => "browsing",
            Category::Entertainment => "entertainment",
            Category::Social => "social",
            Category::Utilities => "utilities",
            Category::Uncategorized => "uncategorized",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ModelError::UnknownCategory(s.to_string()))
    }
}
