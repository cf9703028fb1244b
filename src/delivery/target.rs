//! Target database naming.
//!
//! The active database is a pure function of wall-clock time and a strftime
//! pattern, so every process with the same pattern agrees on it.

use crate::clock::WallTimestamp;
use chrono::format::{Item, StrftimeItems};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    EmptyPattern,
    InvalidPattern(String),
}

impl std::fmt::Display for TargetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetError::EmptyPattern => write!(f, "target pattern is empty"),
            TargetError::InvalidPattern(p) => write!(f, "invalid target pattern: {:?}", p),
        }
    }
}

impl std::error::Error for TargetError {}

/// Validated strftime pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetNamer {
    pattern: String,
}

impl TargetNamer {
    pub fn new(pattern: impl Into<String>) -> Result<Self, TargetError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(TargetError::EmptyPattern);
        }
        if StrftimeItems::new(&pattern).any(|item| matches!(item, Item::Error)) {
            return Err(TargetError::InvalidPattern(pattern));
        }
        Ok(TargetNamer { pattern })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Target name at `now`, in UTC.
    pub fn name_at(&self, now: WallTimestamp) -> String {
        now.to_datetime().format(&self.pattern).to_string()
    }
}
