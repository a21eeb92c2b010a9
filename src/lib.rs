//! Stackbot - trial and action control loop for learned block stacking
//!
//! Stackbot drives a real or simulated robot arm through long-running
//! trials of push, grasp and place actions. One task perceives, labels and
//! trains; another executes actions. Between them sit goal-progress
//! evaluation, failure recovery, pause handling and experience replay.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and the robot, scorer and
//!   persistence ports
//! - **Application Layer** (`application`): the coordinator, action executor,
//!   progress evaluation, watchdogs and replay
//! - **Adapters** (`adapters`): block-world simulator, heightmap scorer,
//!   file-backed run store
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use stackbot::application::{PauseControl, RunCoordinator, RunPorts};
//!
//! let pause = Arc::new(PauseControl::new(&config.pause));
//! let summary = RunCoordinator::new(config, ports, pause).run().await?;
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use application::{PauseControl, RunCoordinator, RunPorts, RunSummary, StopReason};
pub use domain::errors::{DomainError, DomainResult, RunError};
pub use domain::models::{Config, Primitive, TaskVariant};
pub use domain::ports::{ModelSnapshots, RobotInterface, Scorer, StateStore, TransitionLog};
pub use infrastructure::config::{ConfigError, ConfigLoader};
