//! Persistence ports - transition log, control-state snapshots, model snapshots.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{ControlSnapshot, TransitionRecord};

/// Append-only log of executed actions.
#[async_trait]
pub trait TransitionLog: Send + Sync {
    /// Append one record. Records are never rewritten.
    async fn append(&self, record: &TransitionRecord) -> DomainResult<()>;

    /// Every record in iteration order.
    async fn records(&self) -> DomainResult<Vec<TransitionRecord>>;

    /// Make appended records durable.
    async fn flush(&self) -> DomainResult<()>;
}

/// Crash-resume store for [`ControlSnapshot`]s.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_state(&self, snapshot: &ControlSnapshot) -> DomainResult<()>;

    /// The snapshot with the highest iteration, if any was saved.
    async fn load_latest_state(&self) -> DomainResult<Option<ControlSnapshot>>;
}

/// Named snapshots of model weights.
#[async_trait]
pub trait ModelSnapshots: Send + Sync {
    async fn save_snapshot(&self, tag: &str) -> DomainResult<()>;

    /// Returns `false` when no snapshot with `tag` exists.
    async fn load_snapshot(&self, tag: &str) -> DomainResult<bool>;
}
