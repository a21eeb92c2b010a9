//! HeightmapScorer - linear affordance model over heightmap features.
//!
//! Each pixel gets two features from the depth image: how much of the
//! 13x13 px neighborhood around it is occupied, and the normalized height
//! at the pixel. Push favors half-covered pixels (block edges); grasp and
//! place favor fully covered ones. Values are the same for every rotation
//! except push, which decays slightly with rotation index. When a goal
//! target is given, grasp values off pixels of the target's color are
//! lowered.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::errors::DomainResult;
use crate::domain::models::observation::OCCUPIED_DEPTH_THRESHOLD;
use crate::domain::models::{
    ActionIndex, BlockColor, ColorMap, DepthMap, Frame, GoalCondition, Primitive, ScoreMaps,
    TrainingSample, ValueMap,
};
use crate::domain::ports::{ModelSnapshots, Scorer};

const WINDOW_RADIUS: usize = 6;
const HEIGHT_SCALE_M: f32 = 0.1;
const PUSH_ROTATION_DECAY: f64 = 0.001;
const WEIGHT_LIMIT: f64 = 10.0;
const OFF_TARGET_PENALTY: f64 = 0.5;

/// Linear weights for one primitive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveWeights {
    pub bias: f64,
    pub coverage: f64,
    pub height: f64,
}

impl PrimitiveWeights {
    fn value(&self, features: [f64; 2]) -> f64 {
        self.bias + self.coverage * features[0] + self.height * features[1]
    }

    fn step(&mut self, features: [f64; 2], error: f64, rate: f64) {
        let clamp = |w: f64| w.clamp(-WEIGHT_LIMIT, WEIGHT_LIMIT);
        self.bias = clamp(self.bias + rate * error);
        self.coverage = clamp(self.coverage + rate * error * features[0]);
        self.height = clamp(self.height + rate * error * features[1]);
    }
}

/// All model weights; this is what snapshots persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerWeights {
    pub push: PrimitiveWeights,
    pub grasp: PrimitiveWeights,
    pub place: PrimitiveWeights,
    pub updates: u64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            push: PrimitiveWeights {
                bias: 0.0,
                coverage: 0.4,
                height: 0.0,
            },
            grasp: PrimitiveWeights {
                bias: 0.0,
                coverage: 1.0,
                height: -0.5,
            },
            place: PrimitiveWeights {
                bias: 0.0,
                coverage: 0.5,
                height: 1.0,
            },
            updates: 0,
        }
    }
}

impl ScorerWeights {
    fn get_mut(&mut self, primitive: Primitive) -> &mut PrimitiveWeights {
        match primitive {
            Primitive::Push => &mut self.push,
            Primitive::Grasp => &mut self.grasp,
            Primitive::Place => &mut self.place,
        }
    }
}

/// Per-pixel features for one depth image.
struct FeatureMap {
    width: usize,
    coverage: Vec<f64>,
    height: Vec<f64>,
}

impl FeatureMap {
    fn from_depth(depth: &DepthMap) -> Self {
        let (width, rows) = (depth.width(), depth.height());
        // Summed-area table of occupancy, padded by one row and column.
        let mut table = vec![0u32; (width + 1) * (rows + 1)];
        for row in 0..rows {
            for col in 0..width {
                let occupied = u32::from(depth.get(row, col).unwrap_or(0.0) > OCCUPIED_DEPTH_THRESHOLD);
                table[(row + 1) * (width + 1) + col + 1] = occupied
                    + table[row * (width + 1) + col + 1]
                    + table[(row + 1) * (width + 1) + col]
                    - table[row * (width + 1) + col];
            }
        }

        let mut coverage = vec![0.0; width * rows];
        let mut height = vec![0.0; width * rows];
        for row in 0..rows {
            let (r0, r1) = (row.saturating_sub(WINDOW_RADIUS), (row + WINDOW_RADIUS + 1).min(rows));
            for col in 0..width {
                let (c0, c1) = (col.saturating_sub(WINDOW_RADIUS), (col + WINDOW_RADIUS + 1).min(width));
                let sum = table[r1 * (width + 1) + c1] + table[r0 * (width + 1) + c0]
                    - table[r0 * (width + 1) + c1]
                    - table[r1 * (width + 1) + c0];
                let area = ((r1 - r0) * (c1 - c0)) as f64;
                coverage[row * width + col] = f64::from(sum) / area;
                let h = depth.get(row, col).unwrap_or(0.0).max(0.0) / HEIGHT_SCALE_M;
                height[row * width + col] = f64::from(h.min(1.0));
            }
        }
        Self {
            width,
            coverage,
            height,
        }
    }

    fn features(&self, primitive: Primitive, row: usize, col: usize) -> [f64; 2] {
        let i = row * self.width + col;
        let coverage = self.coverage[i];
        let coverage = if primitive == Primitive::Push {
            4.0 * coverage * (1.0 - coverage)
        } else {
            coverage
        };
        [coverage, self.height[i]]
    }
}

/// Reference scorer with JSON weight snapshots.
pub struct HeightmapScorer {
    weights: RwLock<ScorerWeights>,
    num_rotations: usize,
    learning_rate: f64,
    snapshot_dir: PathBuf,
}

impl HeightmapScorer {
    pub fn new(num_rotations: usize, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            weights: RwLock::new(ScorerWeights::default()),
            num_rotations: num_rotations.max(1),
            learning_rate: 0.05,
            snapshot_dir: snapshot_dir.into(),
        }
    }

    #[must_use]
    pub const fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub async fn weights(&self) -> ScorerWeights {
        self.weights.read().await.clone()
    }

    fn snapshot_path(&self, tag: &str) -> PathBuf {
        self.snapshot_dir.join(format!("model_{tag}.json"))
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    fn value_map(
        &self,
        weights: &PrimitiveWeights,
        features: &FeatureMap,
        primitive: Primitive,
        rows: usize,
    ) -> ValueMap {
        let mut map = ValueMap::filled(self.num_rotations, rows, features.width, 0.0);
        for rotation in 0..self.num_rotations {
            let decay = if primitive == Primitive::Push {
                PUSH_ROTATION_DECAY * rotation as f64
            } else {
                0.0
            };
            for row in 0..rows {
                for col in 0..features.width {
                    let value = weights.value(features.features(primitive, row, col)) - decay;
                    map.set(ActionIndex::new(rotation, row, col), value);
                }
            }
        }
        map
    }

    fn prefer_target(&self, map: &mut ValueMap, color: &ColorMap, target: BlockColor, rows: usize, cols: usize) {
        let rgb = target.rgb();
        for row in 0..rows {
            for col in 0..cols {
                if color.get(row, col) == Some(rgb) {
                    continue;
                }
                for rotation in 0..self.num_rotations {
                    let index = ActionIndex::new(rotation, row, col);
                    if let Some(value) = map.get(index) {
                        map.set(index, value - OFF_TARGET_PENALTY);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Scorer for HeightmapScorer {
    async fn score(&self, frame: &Frame, condition: GoalCondition<'_>) -> DomainResult<ScoreMaps> {
        let features = FeatureMap::from_depth(&frame.depth);
        let rows = frame.depth.height();
        let weights = self.weights.read().await.clone();
        let mut maps = ScoreMaps {
            push: self.value_map(&weights.push, &features, Primitive::Push, rows),
            grasp: self.value_map(&weights.grasp, &features, Primitive::Grasp, rows),
            place: self.value_map(&weights.place, &features, Primitive::Place, rows),
        };
        if let Some(target) = condition.target {
            self.prefer_target(&mut maps.grasp, &frame.color, target, rows, features.width);
        }
        if let Some(mask) = condition.mask {
            maps.apply_mask(mask);
        }
        Ok(maps)
    }

    fn heuristic(&self, primitive: Primitive, frame: &Frame) -> Option<ActionIndex> {
        if primitive == Primitive::Place {
            return None;
        }
        // First pixel of the highest block.
        let depth = &frame.depth;
        let (offset, value) = depth
            .as_slice()
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((i, v)),
            })?;
        if value <= OCCUPIED_DEPTH_THRESHOLD {
            return None;
        }
        let (row, col) = (offset / depth.width(), offset % depth.width());
        // Push from the block's corner; grasp a little inside it.
        if primitive == Primitive::Push {
            return Some(ActionIndex::new(0, row, col));
        }
        let row = (row + WINDOW_RADIUS).min(depth.height() - 1);
        let col = (col + WINDOW_RADIUS).min(depth.width() - 1);
        Some(ActionIndex::new(0, row, col))
    }

    async fn update(&self, sample: &TrainingSample) -> DomainResult<()> {
        let depth = &sample.frame.depth;
        if sample.index.row >= depth.height() || sample.index.col >= depth.width() {
            return Ok(());
        }
        let features = FeatureMap::from_depth(depth).features(sample.primitive, sample.index.row, sample.index.col);
        let mut weights = self.weights.write().await;
        let target = weights.get_mut(sample.primitive);
        let error = sample.label - target.value(features);
        target.step(features, error, self.learning_rate);
        weights.updates += 1;
        debug!(primitive = %sample.primitive, label = sample.label, error, "Model updated");
        Ok(())
    }
}

#[async_trait]
impl ModelSnapshots for HeightmapScorer {
    async fn save_snapshot(&self, tag: &str) -> DomainResult<()> {
        let json = serde_json::to_string_pretty(&*self.weights.read().await)?;
        tokio::fs::create_dir_all(&self.snapshot_dir).await?;
        let path = self.snapshot_path(tag);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(tag, path = %path.display(), "Saved model snapshot");
        Ok(())
    }

    async fn load_snapshot(&self, tag: &str) -> DomainResult<bool> {
        let path = self.snapshot_path(tag);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let loaded: ScorerWeights = serde_json::from_str(&text)?;
        *self.weights.write().await = loaded;
        info!(tag, path = %path.display(), "Loaded model snapshot");
        Ok(true)
    }
}
