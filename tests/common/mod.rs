//! Common test utilities for integration tests
//!
//! Scripted ports for driving the control loop without a simulator, plus
//! small builders for states, requests and configs.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use stackbot::domain::errors::{DomainError, DomainResult};
use stackbot::domain::models::{
    ActionIndex, ActionRequest, BlockColor, ColorMap, Config, ControlSnapshot, DepthMap, Frame,
    GoalCondition, GoalSequence, NoChangeCounters, ObjectState, Pose, Primitive, SceneState, ScoreMaps,
    SharedControlState, StructureMeasurement, StructureQuery, TaskVariant, TrainingSample,
    TransitionRecord, ValueMap,
};
use stackbot::domain::ports::{ModelSnapshots, RobotInterface, Scorer, StateStore, TransitionLog};

pub const FRAME_PX: usize = 32;

/// Setup test logging
///
/// Call this at the beginning of tests that need logging.
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A frame with one 20x20 px block, enough to read as an occupied table.
pub fn occupied_frame() -> Frame {
    let mut depth = DepthMap::zeros(FRAME_PX, FRAME_PX);
    for row in 0..20 {
        for col in 0..20 {
            depth.set(row, col, 0.05);
        }
    }
    Frame {
        depth,
        color: ColorMap::filled(FRAME_PX, FRAME_PX, [90, 90, 90]),
    }
}

pub fn empty_frame() -> Frame {
    Frame {
        depth: DepthMap::zeros(FRAME_PX, FRAME_PX),
        color: ColorMap::filled(FRAME_PX, FRAME_PX, [90, 90, 90]),
    }
}

/// Uniform value maps over a 4x4 grid with one rotation.
pub fn flat_scores(push: f64, grasp: f64, place: f64) -> ScoreMaps {
    ScoreMaps {
        push: ValueMap::filled(1, 4, 4, push),
        grasp: ValueMap::filled(1, 4, 4, grasp),
        place: ValueMap::filled(1, 4, 4, place),
    }
}

pub fn request(iteration: u64, scores: ScoreMaps) -> ActionRequest {
    ActionRequest {
        iteration,
        frame: Arc::new(occupied_frame()),
        scores: Arc::new(scores),
        explore_prob: 0.0,
        no_change: NoChangeCounters::default(),
    }
}

pub fn rbgy() -> Vec<BlockColor> {
    vec![
        BlockColor::Red,
        BlockColor::Blue,
        BlockColor::Green,
        BlockColor::Yellow,
    ]
}

/// Stack state whose goal has been advanced to `progress_index`, with the
/// structure already that tall.
pub fn stack_state(progress_index: usize) -> Arc<RwLock<SharedControlState>> {
    let mut state = SharedControlState::new(TaskVariant::Stack, GoalSequence::new(rbgy(), 4, 0));
    state.goal.advance_to(progress_index);
    state.progress_height = progress_index;
    state.previous_progress_height = progress_index;
    Arc::new(RwLock::new(state))
}

/// Defaults with the goal held fixed between trials.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.run.goal_conditioned = false;
    config
}

/// Robot that replays scripted measurements and execute results.
///
/// When a script runs out the last measurement is repeated and actions
/// use the default result. Repopulating restores an occupied frame.
pub struct ScriptedRobot {
    measurements: Mutex<VecDeque<StructureMeasurement>>,
    last_measurement: Mutex<StructureMeasurement>,
    results: Mutex<VecDeque<bool>>,
    default_result: bool,
    frame: Mutex<Frame>,
    objects: usize,
    simulation: bool,
    panic_on_execute: bool,
    alive: AtomicBool,
    reposition_ok: AtomicBool,
    away_checks: AtomicU32,
    pub executed: Mutex<Vec<Primitive>>,
    pub repositions: AtomicU32,
    pub restarts: AtomicU32,
    pub home_checks: AtomicU32,
    pub go_home_calls: AtomicU32,
}

impl ScriptedRobot {
    pub fn new(objects: usize) -> Self {
        Self {
            measurements: Mutex::new(VecDeque::new()),
            last_measurement: Mutex::new(StructureMeasurement::height_only(1)),
            results: Mutex::new(VecDeque::new()),
            default_result: true,
            frame: Mutex::new(occupied_frame()),
            objects,
            simulation: true,
            panic_on_execute: false,
            alive: AtomicBool::new(true),
            reposition_ok: AtomicBool::new(true),
            away_checks: AtomicU32::new(0),
            executed: Mutex::new(Vec::new()),
            repositions: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
            home_checks: AtomicU32::new(0),
            go_home_calls: AtomicU32::new(0),
        }
    }

    /// Result of every execute call past the scripted ones.
    pub fn with_default_result(mut self, result: bool) -> Self {
        self.default_result = result;
        self
    }

    /// A physical arm that reports away from home for the first `checks` checks.
    pub fn physical(mut self, checks: u32) -> Self {
        self.simulation = false;
        self.away_checks = AtomicU32::new(checks);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_execute = true;
        self
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn set_reposition_ok(&self, ok: bool) {
        self.reposition_ok.store(ok, Ordering::SeqCst);
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn home_checks(&self) -> u32 {
        self.home_checks.load(Ordering::SeqCst)
    }

    pub fn go_home_calls(&self) -> u32 {
        self.go_home_calls.load(Ordering::SeqCst)
    }

    pub fn with_measurements(self, measurements: impl IntoIterator<Item = StructureMeasurement>) -> Self {
        self.measurements.lock().unwrap().extend(measurements);
        self
    }

    pub fn with_results(self, results: impl IntoIterator<Item = bool>) -> Self {
        self.results.lock().unwrap().extend(results);
        self
    }

    pub fn set_frame(&self, frame: Frame) {
        *self.frame.lock().unwrap() = frame;
    }

    pub fn executed(&self) -> Vec<Primitive> {
        self.executed.lock().unwrap().clone()
    }

    pub fn repositions(&self) -> u32 {
        self.repositions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RobotInterface for ScriptedRobot {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn is_simulation(&self) -> bool {
        self.simulation
    }

    async fn capture(&self) -> DomainResult<Frame> {
        Ok(self.frame.lock().unwrap().clone())
    }

    fn pose_for(&self, _primitive: Primitive, index: ActionIndex, _frame: &Frame) -> Pose {
        Pose {
            position: [index.col as f64 * 0.01, index.row as f64 * 0.01, 0.0],
            rotation_angle: 0.0,
        }
    }

    async fn execute(
        &self,
        primitive: Primitive,
        _pose: Pose,
        _intended: Option<Pose>,
    ) -> DomainResult<bool> {
        assert!(!self.panic_on_execute, "scripted execute failure");
        self.executed.lock().unwrap().push(primitive);
        Ok(self.results.lock().unwrap().pop_front().unwrap_or(self.default_result))
    }

    async fn get_object_state(&self) -> DomainResult<SceneState> {
        let objects = rbgy()
            .into_iter()
            .cycle()
            .take(self.objects)
            .enumerate()
            .map(|(i, color)| ObjectState {
                color,
                position: [i as f64 * 0.05, 0.0, 0.0],
                orientation: [0.0; 3],
            })
            .collect();
        Ok(SceneState { objects })
    }

    async fn measure_structure(&self, _query: &StructureQuery) -> DomainResult<StructureMeasurement> {
        let mut last = self.last_measurement.lock().unwrap();
        if let Some(next) = self.measurements.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }

    async fn reposition_objects(&self) -> DomainResult<bool> {
        self.repositions.fetch_add(1, Ordering::SeqCst);
        Ok(self.reposition_ok.load(Ordering::SeqCst))
    }

    async fn restart(&self) -> DomainResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn populate_objects(&self) -> DomainResult<()> {
        self.set_frame(occupied_frame());
        Ok(())
    }

    async fn check_alive(&self) -> DomainResult<bool> {
        Ok(self.alive.load(Ordering::SeqCst))
    }

    async fn is_home(&self) -> DomainResult<bool> {
        self.home_checks.fetch_add(1, Ordering::SeqCst);
        let away = self
            .away_checks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(!away)
    }

    async fn go_home(&self) -> DomainResult<bool> {
        self.go_home_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn load_preset_case(&self, _path: &Path) -> DomainResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> DomainResult<()> {
        Ok(())
    }
}

/// Scorer returning the same maps for every frame.
pub struct FixedScorer {
    scores: ScoreMaps,
    targets: Mutex<Vec<Option<BlockColor>>>,
    pub updates: AtomicU64,
}

impl FixedScorer {
    pub fn new(scores: ScoreMaps) -> Self {
        Self {
            scores,
            targets: Mutex::new(Vec::new()),
            updates: AtomicU64::new(0),
        }
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    /// Goal target passed with every scoring call, in call order.
    pub fn targets(&self) -> Vec<Option<BlockColor>> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scorer for FixedScorer {
    async fn score(&self, _frame: &Frame, condition: GoalCondition<'_>) -> DomainResult<ScoreMaps> {
        self.targets.lock().unwrap().push(condition.target);
        let mut scores = self.scores.clone();
        if let Some(mask) = condition.mask {
            scores.apply_mask(mask);
        }
        Ok(scores)
    }

    fn heuristic(&self, _primitive: Primitive, _frame: &Frame) -> Option<ActionIndex> {
        None
    }

    async fn update(&self, _sample: &TrainingSample) -> DomainResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory transition log, state store and model snapshots.
///
/// Appends and saves can be made to fail to exercise error handling.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<TransitionRecord>>,
    states: Mutex<Vec<ControlSnapshot>>,
    saved: Mutex<Vec<String>>,
    failing_appends: AtomicU32,
    failing_writes: AtomicBool,
    pub flushes: AtomicU32,
}

impl MemoryStore {
    pub fn with_records(records: Vec<TransitionRecord>) -> Self {
        let store = Self::default();
        *store.records.lock().unwrap() = records;
        store
    }

    /// Fail the next `count` appends.
    pub fn fail_appends(self, count: u32) -> Self {
        self.failing_appends.store(count, Ordering::SeqCst);
        self
    }

    /// Fail every flush, state save and snapshot save or load.
    pub fn fail_writes(self) -> Self {
        self.failing_writes.store(true, Ordering::SeqCst);
        self
    }

    fn write_error(&self) -> DomainResult<()> {
        if self.failing_writes.load(Ordering::SeqCst) {
            Err(DomainError::Persistence("disk full".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn record_list(&self) -> Vec<TransitionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn saved_tags(&self) -> Vec<String> {
        self.saved.lock().unwrap().clone()
    }

    pub fn state_count(&self) -> usize {
        self.states.lock().unwrap().len()
    }
}

#[async_trait]
impl TransitionLog for MemoryStore {
    async fn append(&self, record: &TransitionRecord) -> DomainResult<()> {
        let failing = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DomainError::Persistence("transition log unavailable".to_string()));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn records(&self) -> DomainResult<Vec<TransitionRecord>> {
        Ok(self.record_list())
    }

    async fn flush(&self) -> DomainResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.write_error()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_state(&self, snapshot: &ControlSnapshot) -> DomainResult<()> {
        self.write_error()?;
        self.states.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    async fn load_latest_state(&self) -> DomainResult<Option<ControlSnapshot>> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .iter()
            .max_by_key(|s| s.iteration)
            .cloned())
    }
}

#[async_trait]
impl ModelSnapshots for MemoryStore {
    async fn save_snapshot(&self, tag: &str) -> DomainResult<()> {
        self.write_error()?;
        self.saved.lock().unwrap().push(tag.to_string());
        Ok(())
    }

    async fn load_snapshot(&self, tag: &str) -> DomainResult<bool> {
        self.write_error()?;
        Ok(self.saved.lock().unwrap().iter().any(|t| t == tag))
    }
}
