//! Executed-action records and replay samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::goal::BlockColor;
use super::observation::Frame;
use super::primitive::{ActionIndex, Primitive, SuccessFlags};

/// One row of the append-only transition log, written once per executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub iteration: u64,
    pub trial: u64,
    pub primitive: Primitive,
    pub index: ActionIndex,
    pub success: SuccessFlags,
    pub change_detected: bool,
    pub predicted_value: f64,
    pub reward_value: f64,
    pub label_value: f64,
    pub progress_height: usize,
    /// Goal target the action was scored against.
    #[serde(default)]
    pub goal_target: Option<BlockColor>,
    pub recorded_at: DateTime<Utc>,
}

impl TransitionRecord {
    /// Outcome used to stratify replay for this record's primitive.
    pub const fn outcome(&self) -> bool {
        self.success.outcome_for(self.primitive, self.change_detected)
    }

    /// Absolute prediction error against the recorded label.
    pub fn surprise(&self, predicted: f64) -> f64 {
        (predicted - self.label_value).abs()
    }
}

/// A replay choice: which iteration was replayed and how surprising it was.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplaySample {
    pub iteration: u64,
    pub primitive: Primitive,
    pub surprise: f64,
}

/// Input to one model update.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub frame: Arc<Frame>,
    pub primitive: Primitive,
    pub index: ActionIndex,
    pub label: f64,
}
