//! Task variants and run modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The manipulation task a run trains or tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskVariant {
    /// Build a vertical stack in goal color order.
    Stack,
    /// Build a horizontal row of blocks.
    Row,
    /// Take an existing stack apart one block at a time.
    Unstack,
    /// Push and grasp everything off the table; no placing.
    Clearing,
}

impl TaskVariant {
    /// Whether the task uses the place primitive.
    pub const fn places(self) -> bool {
        !matches!(self, Self::Clearing)
    }

    /// Whether trial progress is measured as a structure height.
    pub const fn measures_structure(self) -> bool {
        !matches!(self, Self::Clearing)
    }

    /// Progress height at the start of a trial.
    ///
    /// Construction tasks begin with the base block already counted.
    pub const fn baseline_height(self) -> usize {
        match self {
            Self::Stack | Self::Row | Self::Unstack => 1,
            Self::Clearing => 0,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stack => "stack",
            Self::Row => "row",
            Self::Unstack => "unstack",
            Self::Clearing => "clearing",
        }
    }
}

impl fmt::Display for TaskVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stack" => Ok(Self::Stack),
            "row" => Ok(Self::Row),
            "unstack" => Ok(Self::Unstack),
            "clearing" | "clear" => Ok(Self::Clearing),
            other => Err(format!("unknown task variant: {other}")),
        }
    }
}

/// Training learns from every action; testing evaluates a fixed snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Training,
    Testing,
}

impl RunMode {
    pub const fn is_testing(self) -> bool {
        matches!(self, Self::Testing)
    }
}

/// How a measured structure is compared with the goal prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    /// Height at least the prefix length counts as a match.
    #[default]
    AtLeast,
    /// Height must equal the prefix length.
    Exact,
}

impl MatchRule {
    pub const fn matches(self, height: usize, required: usize) -> bool {
        match self {
            Self::AtLeast => height >= required,
            Self::Exact => height == required,
        }
    }
}
