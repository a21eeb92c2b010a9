//! Scorer port - the perception/affordance model.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    ActionIndex, Frame, GoalCondition, Primitive, ScoreMaps, TrainingSample,
};

/// Pluggable scoring function and its training hook.
///
/// Implementations use interior mutability: the action task and the
/// replay loop share one instance.
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Produce value maps for every primitive, conditioned on the current
    /// goal target and mask.
    async fn score(&self, frame: &Frame, condition: GoalCondition<'_>) -> DomainResult<ScoreMaps>;

    /// Hand-designed fallback location used to escape repeated no-op actions.
    fn heuristic(&self, primitive: Primitive, frame: &Frame) -> Option<ActionIndex>;

    /// One opaque model update.
    async fn update(&self, sample: &TrainingSample) -> DomainResult<()>;
}
