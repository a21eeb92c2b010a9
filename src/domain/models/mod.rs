//! Domain models for the stacking control loop.

pub mod config;
pub mod control;
pub mod goal;
pub mod observation;
pub mod primitive;
pub mod task;
pub mod transition;

pub use config::{
    Config, LoggingConfig, PauseConfig, PolicyConfig, ProgressConfig, ReplayConfig, RunConfig,
    StorageConfig, WatchdogConfig,
};
pub use control::{
    ActionReport, ActionRequest, ActionStats, ControlSnapshot, FailureKind, NoChangeCounters,
    SharedControlState,
};
pub use goal::{BlockColor, GoalSequence};
pub use observation::{
    ColorMap, DepthMap, Frame, GoalCondition, GoalMask, ObjectState, SceneState, ScoreMaps, StructureMeasurement,
    StructureQuery, ValueMap,
};
pub use primitive::{ActionIndex, Pose, Primitive, PrimitiveFamily, SuccessFlags};
pub use task::{MatchRule, RunMode, TaskVariant};
pub use transition::{ReplaySample, TrainingSample, TransitionRecord};
