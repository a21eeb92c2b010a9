pub mod action_executor;
pub mod coordinator;
pub mod pause_control;
pub mod progress;
pub mod replay_sampler;
pub mod reward;
pub mod trial_lifecycle;
pub mod watchdog;

pub use action_executor::{ActionExecutor, ActionPhase, ActionSettings};
pub use coordinator::{RunCoordinator, RunPorts, RunSummary, StopReason};
pub use pause_control::{PauseControl, RunState};
pub use progress::{ProgressInput, ProgressPolicy, ProgressVerdict};
pub use replay_sampler::{ExperienceReplay, ReplayBuffer, ReplayPick};
pub use reward::{ChangeDetection, Label, RewardModel};
pub use trial_lifecycle::{ResumePoint, TrialLifecycle, TrialSummary};
pub use watchdog::{QualityMonitor, QualityVerdict, SimTimeoutLadder, Watchdog, WorkspaceVerdict};
