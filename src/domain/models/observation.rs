//! Observations and score maps exchanged with the robot and scorer ports.
//!
//! - `DepthMap` / `ColorMap`: the image pair captured after each action
//! - `ValueMap` / `ScoreMaps`: per-location action values, NaN marks masked cells
//! - `SceneState` / `StructureMeasurement`: what the robot reports about the scene

use serde::{Deserialize, Serialize};

use super::goal::BlockColor;
use crate::domain::errors::{DomainError, DomainResult};
use super::primitive::{ActionIndex, Primitive};
use super::task::TaskVariant;

/// Height above the table (meters) above which a pixel counts as occupied.
pub const OCCUPIED_DEPTH_THRESHOLD: f32 = 0.02;

/// Absolute depth change band (meters) that counts as a changed pixel.
pub const CHANGE_DEPTH_MIN: f32 = 0.01;
pub const CHANGE_DEPTH_MAX: f32 = 0.3;

/// Row-major heightmap in meters above the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthMap {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl DepthMap {
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    /// Wrap raw data; `None` when the length does not match the dimensions.
    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Option<Self> {
        (data.len() == width * height).then_some(Self { width, height, data })
    }

    pub const fn width(&self) -> usize {
        self.width
    }

    pub const fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        (row < self.height && col < self.width).then(|| self.data[row * self.width + col])
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        if row < self.height && col < self.width {
            self.data[row * self.width + col] = value;
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Number of pixels holding something taller than `threshold`.
    pub fn count_above(&self, threshold: f32) -> usize {
        self.data.iter().filter(|d| **d > threshold).count()
    }

    /// Number of pixels whose depth moved by an amount within `[min, max]`.
    ///
    /// Maps of different shape are treated as entirely changed.
    pub fn count_changed(&self, other: &Self, min: f32, max: f32) -> usize {
        if self.width != other.width || self.height != other.height {
            return self.data.len().max(other.data.len());
        }
        self.data
            .iter()
            .zip(&other.data)
            .filter(|(a, b)| {
                let diff = (*a - *b).abs();
                diff >= min && diff <= max
            })
            .count()
    }
}

/// Row-major RGB image aligned with the depth map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorMap {
    width: usize,
    height: usize,
    data: Vec<[u8; 3]>,
}

impl ColorMap {
    pub fn filled(width: usize, height: usize, rgb: [u8; 3]) -> Self {
        Self {
            width,
            height,
            data: vec![rgb; width * height],
        }
    }

    pub fn get(&self, row: usize, col: usize) -> Option<[u8; 3]> {
        (row < self.height && col < self.width).then(|| self.data[row * self.width + col])
    }

    pub fn set(&mut self, row: usize, col: usize, rgb: [u8; 3]) {
        if row < self.height && col < self.width {
            self.data[row * self.width + col] = rgb;
        }
    }
}

/// One capture: depth and color of the workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub depth: DepthMap,
    pub color: ColorMap,
}

/// Opaque per-pixel weighting from the language-conditioning subsystem.
///
/// Weights multiply the value of every rotation at a pixel; a weight at or
/// below zero masks the pixel out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalMask {
    pub rows: usize,
    pub cols: usize,
    pub weights: Vec<f64>,
}

impl GoalMask {
    pub fn new(rows: usize, cols: usize, weights: Vec<f64>) -> DomainResult<Self> {
        let mask = Self { rows, cols, weights };
        mask.validate()?;
        Ok(mask)
    }

    /// Check that there is exactly one weight per pixel.
    pub fn validate(&self) -> DomainResult<()> {
        if self.weights.len() == self.rows * self.cols {
            Ok(())
        } else {
            Err(DomainError::ValidationFailed(format!(
                "goal mask has {} weights for a {}x{} grid",
                self.weights.len(),
                self.rows,
                self.cols
            )))
        }
    }

    fn fits(&self, rows: usize, cols: usize) -> bool {
        self.rows == rows && self.cols == cols && self.weights.len() == rows * cols
    }
}

/// What one scoring pass is conditioned on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GoalCondition<'a> {
    /// Block the next placement should deliver.
    pub target: Option<BlockColor>,
    pub mask: Option<&'a GoalMask>,
}

impl<'a> GoalCondition<'a> {
    pub const fn new(target: Option<BlockColor>, mask: Option<&'a GoalMask>) -> Self {
        Self { target, mask }
    }

    /// One-hot encoding of the target over the block palette.
    pub fn one_hot(&self) -> [f64; BlockColor::PALETTE.len()] {
        let mut encoded = [0.0; BlockColor::PALETTE.len()];
        if let Some(slot) = self
            .target
            .and_then(|t| BlockColor::PALETTE.iter().position(|c| *c == t))
        {
            encoded[slot] = 1.0;
        }
        encoded
    }
}

/// Action values for one primitive over (rotation, row, col).
#[derive(Debug, Clone, PartialEq)]
pub struct ValueMap {
    rotations: usize,
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl ValueMap {
    pub fn filled(rotations: usize, rows: usize, cols: usize, value: f64) -> Self {
        Self {
            rotations,
            rows,
            cols,
            data: vec![value; rotations * rows * cols],
        }
    }

    pub const fn shape(&self) -> (usize, usize, usize) {
        (self.rotations, self.rows, self.cols)
    }

    const fn offset(&self, index: ActionIndex) -> Option<usize> {
        if index.rotation < self.rotations && index.row < self.rows && index.col < self.cols {
            Some((index.rotation * self.rows + index.row) * self.cols + index.col)
        } else {
            None
        }
    }

    const fn index_of(&self, offset: usize) -> ActionIndex {
        let per_rotation = self.rows * self.cols;
        ActionIndex {
            rotation: offset / per_rotation,
            row: (offset % per_rotation) / self.cols,
            col: offset % self.cols,
        }
    }

    pub fn get(&self, index: ActionIndex) -> Option<f64> {
        self.offset(index).map(|o| self.data[o])
    }

    pub fn set(&mut self, index: ActionIndex, value: f64) {
        if let Some(o) = self.offset(index) {
            self.data[o] = value;
        }
    }

    /// First maximum in rotation/row/col order, ignoring masked cells.
    pub fn argmax(&self) -> Option<(ActionIndex, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (offset, value) in self.data.iter().copied().enumerate() {
            if value.is_nan() {
                continue;
            }
            if best.is_none_or(|(_, b)| value > b) {
                best = Some((offset, value));
            }
        }
        best.map(|(offset, value)| (self.index_of(offset), value))
    }

    pub fn max_value(&self) -> Option<f64> {
        self.argmax().map(|(_, v)| v)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    /// The `n`-th unmasked location in rotation/row/col order.
    pub fn nth_valid(&self, n: usize) -> Option<ActionIndex> {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .nth(n)
            .map(|(offset, _)| self.index_of(offset))
    }

    /// Apply a goal mask; shape mismatches leave the map untouched.
    pub fn apply_mask(&mut self, mask: &GoalMask) {
        if !mask.fits(self.rows, self.cols) {
            return;
        }
        let per_rotation = self.rows * self.cols;
        for (offset, value) in self.data.iter_mut().enumerate() {
            let weight = mask.weights[offset % per_rotation];
            *value = if weight > 0.0 { *value * weight } else { f64::NAN };
        }
    }
}

/// Value maps for every primitive from one scoring pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMaps {
    pub push: ValueMap,
    pub grasp: ValueMap,
    pub place: ValueMap,
}

impl ScoreMaps {
    pub const fn get(&self, primitive: Primitive) -> &ValueMap {
        match primitive {
            Primitive::Push => &self.push,
            Primitive::Grasp => &self.grasp,
            Primitive::Place => &self.place,
        }
    }

    pub fn best_value(&self, primitive: Primitive) -> f64 {
        self.get(primitive).max_value().unwrap_or(0.0)
    }

    /// Best value over the primitives the task can use.
    pub fn overall_best(&self, include_place: bool) -> f64 {
        let mut best = self.best_value(Primitive::Push).max(self.best_value(Primitive::Grasp));
        if include_place {
            best = best.max(self.best_value(Primitive::Place));
        }
        best
    }

    pub fn apply_mask(&mut self, mask: &GoalMask) {
        self.push.apply_mask(mask);
        self.grasp.apply_mask(mask);
        self.place.apply_mask(mask);
    }
}

/// Reported state of one object in the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub color: BlockColor,
    pub position: [f64; 3],
    pub orientation: [f64; 3],
}

/// Positions, orientations and colors of every tracked object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneState {
    pub objects: Vec<ObjectState>,
}

impl SceneState {
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// True when any object reports a NaN or infinite coordinate.
    pub fn has_invalid_pose(&self) -> bool {
        self.objects.iter().any(|o| {
            o.position
                .iter()
                .chain(o.orientation.iter())
                .any(|v| !v.is_finite())
        })
    }
}

/// Request for the robot to measure the structure under construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureQuery {
    pub variant: TaskVariant,
    pub goal_prefix: Vec<BlockColor>,
}

/// Measured height (or row length, or removed count) of the structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureMeasurement {
    pub height: usize,
    /// Colors bottom to top (or left to right) when the robot can report them.
    pub order: Option<Vec<BlockColor>>,
}

impl StructureMeasurement {
    pub const fn height_only(height: usize) -> Self {
        Self { height, order: None }
    }
}
