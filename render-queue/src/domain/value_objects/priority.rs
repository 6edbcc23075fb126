//! Priority value object.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Dispatch tier of a render job.
///
/// Every waiting job of a higher tier is dispatched before any job of a
/// lower tier; within a tier jobs leave in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Interactive requests a user is actively waiting on.
    Urgent,
    High,
    #[default]
    Normal,
    /// Batch work that may wait behind everything else.
    Low,
}

impl Priority {
    /// Tiers in the order the dispatcher scans them.
    pub const DISPATCH_ORDER: [Priority; 4] = [Self::Urgent, Self::High, Self::Normal, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Parse a tier name, ignoring case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "urgent" => Some(Self::Urgent),
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Get numeric value for sorting (higher = more important).
    pub fn numeric_value(&self) -> i32 {
        match self {
            Self::Urgent => 4,
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
        }
    }

    /// Position of this tier in [`Self::DISPATCH_ORDER`].
    pub fn index(&self) -> usize {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    pub fn is_higher_than(&self, other: &Self) -> bool {
        self.numeric_value() > other.numeric_value()
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numeric_value().cmp(&other.numeric_value())
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid priority: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Urgent.is_higher_than(&Priority::Low));
    }

    #[test]
    fn test_dispatch_order_matches_index() {
        for (i, priority) in Priority::DISPATCH_ORDER.iter().enumerate() {
            assert_eq!(priority.index(), i);
        }
        let mut sorted = Priority::DISPATCH_ORDER;
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(sorted, Priority::DISPATCH_ORDER);
    }

    #[test]
    fn test_priority_default() {
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!(Priority::parse("URGENT"), Some(Priority::Urgent));
        assert_eq!(Priority::parse("high"), Some(Priority::High));
        assert_eq!("Normal".parse::<Priority>(), Ok(Priority::Normal));
        assert_eq!(Priority::parse("low"), Some(Priority::Low));
        assert!("critical".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_serialization() {
        let json = serde_json::to_string(&Priority::Urgent).unwrap();
        assert_eq!(json, "\"urgent\"");

        let parsed: Priority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, Priority::Low);
    }
}
