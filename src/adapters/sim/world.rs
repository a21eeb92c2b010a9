//! Grid world behind the block simulator.
//!
//! The 224x224 px workspace is split into an 8x8 grid of 28 px cells. Each
//! cell holds a stack of blocks (bottom first); a block renders as a 20x20 px
//! patch centered in its cell, 0.025 m tall per layer.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::models::{BlockColor, ColorMap, DepthMap, Frame, ObjectState};

pub const WORKSPACE_PX: usize = 224;
pub const CELL_PX: usize = 28;
pub const BLOCK_PX: usize = 20;
pub const GRID: usize = WORKSPACE_PX / CELL_PX;
pub const BLOCK_HEIGHT_M: f32 = 0.025;
pub const PIXEL_SIZE_M: f64 = 0.002;

const BACKGROUND_RGB: [u8; 3] = [96, 96, 96];

/// A grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub row: usize,
    pub col: usize,
}

impl Cell {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    pub const fn from_pixel(row: usize, col: usize) -> Option<Self> {
        if row < WORKSPACE_PX && col < WORKSPACE_PX {
            Some(Self::new(row / CELL_PX, col / CELL_PX))
        } else {
            None
        }
    }

    /// Cell under a workspace position in meters (x along columns).
    pub fn from_position(position: [f64; 3]) -> Option<Self> {
        let [x, y, _] = position;
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
            return None;
        }
        Self::from_pixel((y / PIXEL_SIZE_M) as usize, (x / PIXEL_SIZE_M) as usize)
    }

    pub fn offset(self, d_row: isize, d_col: isize) -> Option<Self> {
        let row = self.row.checked_add_signed(d_row)?;
        let col = self.col.checked_add_signed(d_col)?;
        (row < GRID && col < GRID).then_some(Self::new(row, col))
    }

    /// Center of the cell in meters.
    pub fn center(self) -> [f64; 2] {
        let half = CELL_PX as f64 / 2.0;
        [
            (self.col * CELL_PX) as f64 * PIXEL_SIZE_M + half * PIXEL_SIZE_M,
            (self.row * CELL_PX) as f64 * PIXEL_SIZE_M + half * PIXEL_SIZE_M,
        ]
    }

    fn all() -> impl Iterator<Item = Self> {
        (0..GRID).flat_map(|row| (0..GRID).map(move |col| Self::new(row, col)))
    }
}

/// Unit grid direction for a push at `angle` radians.
pub fn push_direction(angle: f64) -> (isize, isize) {
    let d_col = angle.cos().round() as isize;
    let d_row = angle.sin().round() as isize;
    if d_row == 0 && d_col == 0 {
        (0, 1)
    } else {
        (d_row, d_col)
    }
}

/// Stacks of blocks on the grid plus the block in the gripper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockWorld {
    stacks: BTreeMap<Cell, Vec<BlockColor>>,
    held: Option<BlockColor>,
}

impl BlockWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.stacks.clear();
        self.held = None;
    }

    pub fn stack_at(&self, cell: Cell) -> &[BlockColor] {
        self.stacks.get(&cell).map_or(&[], Vec::as_slice)
    }

    pub const fn held(&self) -> Option<BlockColor> {
        self.held
    }

    pub fn set_held(&mut self, color: Option<BlockColor>) {
        self.held = color;
    }

    /// Blocks on the table.
    pub fn table_count(&self) -> usize {
        self.stacks.values().map(Vec::len).sum()
    }

    /// Blocks on the table plus any held block.
    pub fn object_count(&self) -> usize {
        self.table_count() + usize::from(self.held.is_some())
    }

    /// Every block color in the scene, held block last.
    pub fn colors(&self) -> Vec<BlockColor> {
        self.stacks
            .values()
            .flatten()
            .copied()
            .chain(self.held)
            .collect()
    }

    pub fn free_cells(&self) -> Vec<Cell> {
        Cell::all()
            .filter(|c| self.stack_at(*c).is_empty())
            .collect()
    }

    /// Drop a block onto `cell`, on top of anything already there.
    pub fn drop_at(&mut self, cell: Cell, color: BlockColor) {
        self.stacks.entry(cell).or_default().push(color);
    }

    /// Take the top block off `cell`.
    pub fn pick(&mut self, cell: Cell) -> Option<BlockColor> {
        let stack = self.stacks.get_mut(&cell)?;
        let color = stack.pop();
        if stack.is_empty() {
            self.stacks.remove(&cell);
        }
        color
    }

    /// Put each color on its own random free cell. Returns false when the
    /// grid ran out of room.
    pub fn scatter<R: Rng + ?Sized>(&mut self, colors: &[BlockColor], rng: &mut R) -> bool {
        let mut free = self.free_cells();
        free.shuffle(rng);
        if free.len() < colors.len() {
            return false;
        }
        for (color, cell) in colors.iter().zip(free) {
            self.drop_at(cell, *color);
        }
        true
    }

    /// Push whatever stands in `cell` one cell along `direction`.
    ///
    /// A lone block slides if the target is free. A taller stack topples:
    /// its upper blocks land on the free cells beyond it.
    pub fn push(&mut self, cell: Cell, direction: (isize, isize)) -> bool {
        let height = self.stack_at(cell).len();
        if height == 0 {
            return false;
        }
        let (d_row, d_col) = direction;
        if height == 1 {
            let Some(target) = cell.offset(d_row, d_col) else {
                return false;
            };
            if !self.stack_at(target).is_empty() {
                return false;
            }
            if let Some(color) = self.pick(cell) {
                self.drop_at(target, color);
            }
            return true;
        }

        let mut step: isize = 1;
        while self.stack_at(cell).len() > 1 {
            let Some(color) = self.pick(cell) else { break };
            let landing = (step..)
                .map_while(|k| cell.offset(d_row * k, d_col * k))
                .find(|c| self.stack_at(*c).is_empty())
                .or_else(|| self.free_cells().into_iter().next())
                .unwrap_or(cell);
            self.drop_at(landing, color);
            step += 1;
        }
        true
    }

    /// Tallest stack, preferring one whose base is `preferred_base` on ties.
    pub fn tallest(&self, preferred_base: Option<BlockColor>) -> Option<(Cell, &[BlockColor])> {
        self.stacks
            .iter()
            .max_by_key(|(cell, stack)| {
                (
                    stack.len(),
                    preferred_base.is_some_and(|base| stack.first() == Some(&base)),
                    std::cmp::Reverse(**cell),
                )
            })
            .map(|(cell, stack)| (*cell, stack.as_slice()))
    }

    /// Top colors of the longest run of occupied cells along a grid row.
    pub fn longest_row(&self) -> Vec<BlockColor> {
        let mut best = Vec::new();
        for row in 0..GRID {
            let mut run = Vec::new();
            for col in 0..GRID {
                match self.stack_at(Cell::new(row, col)).last() {
                    Some(top) => run.push(*top),
                    None => run.clear(),
                }
                if run.len() > best.len() {
                    best.clone_from(&run);
                }
            }
        }
        best
    }

    /// Tracked objects with their centers in meters.
    pub fn objects(&self) -> Vec<ObjectState> {
        self.stacks
            .iter()
            .flat_map(|(cell, stack)| {
                let [x, y] = cell.center();
                stack.iter().enumerate().map(move |(layer, color)| ObjectState {
                    color: *color,
                    position: [x, y, (layer as f64 + 0.5) * f64::from(BLOCK_HEIGHT_M)],
                    orientation: [0.0; 3],
                })
            })
            .collect()
    }

    /// Orthographic heightmap and top-down color image.
    pub fn render(&self) -> Frame {
        let mut depth = DepthMap::zeros(WORKSPACE_PX, WORKSPACE_PX);
        let mut color = ColorMap::filled(WORKSPACE_PX, WORKSPACE_PX, BACKGROUND_RGB);
        let margin = (CELL_PX - BLOCK_PX) / 2;
        for (cell, stack) in &self.stacks {
            let Some(top) = stack.last() else { continue };
            let height = stack.len() as f32 * BLOCK_HEIGHT_M;
            let row0 = cell.row * CELL_PX + margin;
            let col0 = cell.col * CELL_PX + margin;
            for row in row0..row0 + BLOCK_PX {
                for col in col0..col0 + BLOCK_PX {
                    depth.set(row, col, height);
                    color.set(row, col, top.rgb());
                }
            }
        }
        Frame { depth, color }
    }
}
