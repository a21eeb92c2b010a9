//! Robot port - interface to a physical robot or a simulator.

use async_trait::async_trait;
use std::path::Path;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    ActionIndex, Frame, Pose, Primitive, SceneState, StructureMeasurement, StructureQuery,
};

/// Trait for robot and simulator drivers.
///
/// Every call may block on hardware for seconds. The control loop treats
/// errors from these calls as failed actions rather than fatal conditions.
#[async_trait]
pub trait RobotInterface: Send + Sync {
    /// Driver name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this driver is a simulator (enables simulator-only recovery).
    fn is_simulation(&self) -> bool;

    /// Capture the workspace as a depth and color pair.
    async fn capture(&self) -> DomainResult<Frame>;

    /// Convert a discretized action location into a workspace pose.
    fn pose_for(&self, primitive: Primitive, index: ActionIndex, frame: &Frame) -> Pose;

    /// Execute a primitive at `pose`. `intended` is the pose a place should
    /// land on when it differs from the scored location.
    async fn execute(
        &self,
        primitive: Primitive,
        pose: Pose,
        intended: Option<Pose>,
    ) -> DomainResult<bool>;

    /// Positions, orientations and colors of tracked objects.
    async fn get_object_state(&self) -> DomainResult<SceneState>;

    /// Measure the structure the task is building.
    async fn measure_structure(&self, query: &StructureQuery) -> DomainResult<StructureMeasurement>;

    /// Scatter objects back over the workspace. Returns `false` when the
    /// scene could not be brought back to a usable state.
    async fn reposition_objects(&self) -> DomainResult<bool>;

    /// Restart the simulator or re-initialize the robot connection.
    async fn restart(&self) -> DomainResult<()>;

    /// Add the task's objects to a freshly restarted scene.
    async fn populate_objects(&self) -> DomainResult<()>;

    /// Whether the simulator or robot is responsive and the scene is sane.
    async fn check_alive(&self) -> DomainResult<bool>;

    /// Non-blocking check that the arm is at its home pose.
    async fn is_home(&self) -> DomainResult<bool>;

    /// Move the arm home. Returns whether it arrived.
    async fn go_home(&self) -> DomainResult<bool>;

    /// Load a preset scene from disk (testing mode).
    async fn load_preset_case(&self, path: &Path) -> DomainResult<()>;

    /// Release hardware or stop the simulator.
    async fn shutdown(&self) -> DomainResult<()>;
}
