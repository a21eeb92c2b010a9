//! BlockWorldSim - deterministic simulator behind the robot port.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::world::{push_direction, BlockWorld, Cell, PIXEL_SIZE_M};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ActionIndex, BlockColor, Config, Frame, Pose, Primitive, SceneState, StructureMeasurement,
    StructureQuery, TaskVariant,
};
use crate::domain::ports::RobotInterface;

/// Simulator settings.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub variant: TaskVariant,
    pub num_objects: usize,
    pub num_rotations: usize,
    pub grasp_success_prob: f64,
    pub place_success_prob: f64,
    pub seed: u64,
}

impl SimOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            variant: config.run.task,
            num_objects: config.run.num_objects,
            num_rotations: config.run.num_rotations.max(1),
            grasp_success_prob: 0.9,
            place_success_prob: 0.95,
            seed: config.run.seed,
        }
    }

    /// Every grasp and place lands.
    #[must_use]
    pub fn reliable(mut self) -> Self {
        self.grasp_success_prob = 1.0;
        self.place_success_prob = 1.0;
        self
    }
}

/// One block of a preset case file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetBlock {
    pub color: BlockColor,
    pub row: usize,
    pub col: usize,
}

/// Scene loaded from a preset case file. Blocks sharing a cell stack in
/// file order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresetCase {
    pub blocks: Vec<PresetBlock>,
}

#[derive(Debug, Default)]
struct SimFaults {
    invalid_pose: bool,
    failing_captures: u32,
    stalled: bool,
}

/// Grid-world simulator.
pub struct BlockWorldSim {
    options: SimOptions,
    world: Arc<RwLock<BlockWorld>>,
    faults: Arc<RwLock<SimFaults>>,
    rng: Mutex<ChaCha8Rng>,
}

impl BlockWorldSim {
    /// Create a simulator with the task's objects already placed.
    pub fn new(options: SimOptions) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
        let mut world = BlockWorld::new();
        populate(&mut world, &options, &mut rng);
        Self {
            options,
            world: Arc::new(RwLock::new(world)),
            faults: Arc::new(RwLock::new(SimFaults::default())),
            rng: Mutex::new(rng),
        }
    }

    /// Copy of the current world.
    pub async fn world(&self) -> BlockWorld {
        self.world.read().await.clone()
    }

    /// Replace the world, e.g. to stage a scenario.
    pub async fn set_world(&self, world: BlockWorld) {
        *self.world.write().await = world;
    }

    /// Report a NaN pose from the object-state query until the scene is reset.
    pub async fn inject_invalid_pose(&self) {
        self.faults.write().await.invalid_pose = true;
    }

    /// Fail the next `count` captures.
    pub async fn fail_captures(&self, count: u32) {
        self.faults.write().await.failing_captures = count;
    }

    /// Report the simulator as unresponsive until restarted.
    pub async fn stall(&self) {
        self.faults.write().await.stalled = true;
    }

    fn draw(&self) -> f64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen::<f64>()
    }
}

fn palette(count: usize) -> Vec<BlockColor> {
    BlockColor::PALETTE.iter().copied().take(count).collect()
}

fn populate<R: Rng + ?Sized>(world: &mut BlockWorld, options: &SimOptions, rng: &mut R) {
    let colors = palette(options.num_objects);
    if options.variant == TaskVariant::Unstack {
        let free = world.free_cells();
        if let Some(cell) = free.get(rng.gen_range(0..free.len().max(1))) {
            for color in colors {
                world.drop_at(*cell, color);
            }
        }
    } else if !world.scatter(&colors, rng) {
        warn!(objects = colors.len(), "Not enough free cells for every object");
    }
}

#[async_trait]
impl RobotInterface for BlockWorldSim {
    fn name(&self) -> &'static str {
        "block_world_sim"
    }

    fn is_simulation(&self) -> bool {
        true
    }

    async fn capture(&self) -> DomainResult<Frame> {
        {
            let mut faults = self.faults.write().await;
            if faults.stalled {
                return Err(DomainError::robot("capture", "simulator is not responding"));
            }
            if faults.failing_captures > 0 {
                faults.failing_captures -= 1;
                return Err(DomainError::robot("capture", "camera returned no data"));
            }
        }
        Ok(self.world.read().await.render())
    }

    fn pose_for(&self, primitive: Primitive, index: ActionIndex, frame: &Frame) -> Pose {
        let z = frame
            .depth
            .get(index.row, index.col)
            .map_or(f64::NAN, f64::from);
        let rotation_angle = if primitive == Primitive::Push {
            index.rotation as f64 * TAU / self.options.num_rotations as f64
        } else {
            0.0
        };
        Pose {
            position: [
                index.col as f64 * PIXEL_SIZE_M,
                index.row as f64 * PIXEL_SIZE_M,
                z,
            ],
            rotation_angle,
        }
    }

    async fn execute(
        &self,
        primitive: Primitive,
        pose: Pose,
        intended: Option<Pose>,
    ) -> DomainResult<bool> {
        if self.faults.read().await.stalled {
            return Err(DomainError::robot("execute", "simulator is not responding"));
        }
        let Some(cell) = Cell::from_position(pose.position) else {
            debug!(primitive = %primitive, ?pose, "Pose outside the workspace");
            return Ok(false);
        };

        let mut world = self.world.write().await;
        let success = match primitive {
            Primitive::Push => world.push(cell, push_direction(pose.rotation_angle)),
            Primitive::Grasp => {
                if let Some(stray) = world.held() {
                    world.set_held(None);
                    let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                    world.scatter(&[stray], &mut *rng);
                }
                if world.stack_at(cell).is_empty() || self.draw() >= self.options.grasp_success_prob {
                    false
                } else {
                    let picked = world.pick(cell);
                    if self.options.variant != TaskVariant::Clearing {
                        world.set_held(picked);
                    }
                    true
                }
            }
            Primitive::Place => match world.held() {
                None => false,
                Some(color) => {
                    world.set_held(None);
                    let target = intended
                        .and_then(|p| Cell::from_position(p.position))
                        .unwrap_or(cell);
                    if self.draw() < self.options.place_success_prob {
                        world.drop_at(target, color);
                        true
                    } else {
                        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                        world.scatter(&[color], &mut *rng);
                        false
                    }
                }
            },
        };
        debug!(primitive = %primitive, row = cell.row, col = cell.col, success, "Simulated action");
        Ok(success)
    }

    async fn get_object_state(&self) -> DomainResult<SceneState> {
        let mut objects = self.world.read().await.objects();
        if self.faults.read().await.invalid_pose {
            if let Some(first) = objects.first_mut() {
                first.position[2] = f64::NAN;
            }
        }
        Ok(SceneState { objects })
    }

    async fn measure_structure(&self, query: &StructureQuery) -> DomainResult<StructureMeasurement> {
        let world = self.world.read().await;
        let measurement = match query.variant {
            TaskVariant::Stack => match world.tallest(query.goal_prefix.first().copied()) {
                Some((_, stack)) => StructureMeasurement {
                    height: stack.len(),
                    order: Some(stack.to_vec()),
                },
                None => StructureMeasurement::height_only(0),
            },
            TaskVariant::Row => {
                let row = world.longest_row();
                StructureMeasurement {
                    height: row.len(),
                    order: Some(row),
                }
            }
            TaskVariant::Unstack => {
                let tallest = world.tallest(None).map_or(0, |(_, s)| s.len());
                let count = world.object_count();
                StructureMeasurement::height_only(if count == 0 { 0 } else { count - tallest + 1 })
            }
            TaskVariant::Clearing => StructureMeasurement::height_only(world.table_count()),
        };
        Ok(measurement)
    }

    async fn reposition_objects(&self) -> DomainResult<bool> {
        let placed = {
            let mut world = self.world.write().await;
            let colors = world.colors();
            world.clear();
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            if self.options.variant == TaskVariant::Unstack {
                populate(&mut world, &self.options, &mut *rng);
                true
            } else {
                world.scatter(&colors, &mut *rng)
            }
        };
        self.faults.write().await.invalid_pose = false;
        info!(placed, "Repositioned objects");
        Ok(placed)
    }

    async fn restart(&self) -> DomainResult<()> {
        self.world.write().await.clear();
        *self.faults.write().await = SimFaults::default();
        info!("Simulator restarted");
        Ok(())
    }

    async fn populate_objects(&self) -> DomainResult<()> {
        let mut world = self.world.write().await;
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        populate(&mut world, &self.options, &mut *rng);
        Ok(())
    }

    async fn check_alive(&self) -> DomainResult<bool> {
        let faults = self.faults.read().await;
        Ok(!faults.stalled && !faults.invalid_pose)
    }

    async fn is_home(&self) -> DomainResult<bool> {
        Ok(true)
    }

    async fn go_home(&self) -> DomainResult<bool> {
        Ok(true)
    }

    async fn load_preset_case(&self, path: &Path) -> DomainResult<()> {
        let text = tokio::fs::read_to_string(path).await?;
        let case: PresetCase = serde_json::from_str(&text)?;
        let mut world = self.world.write().await;
        world.clear();
        for block in &case.blocks {
            let cell = Cell::new(block.row, block.col);
            if cell.offset(0, 0).is_none() {
                return Err(DomainError::ValidationFailed(format!(
                    "preset block at ({}, {}) is outside the grid",
                    block.row, block.col
                )));
            }
            world.drop_at(cell, block.color);
        }
        info!(path = %path.display(), blocks = case.blocks.len(), "Loaded preset case");
        Ok(())
    }

    async fn shutdown(&self) -> DomainResult<()> {
        info!("Simulator shut down");
        Ok(())
    }
}
