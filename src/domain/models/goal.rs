//! Goal sequence tracking for a single trial.
//!
//! A `GoalSequence` is the ordered list of block colors the current trial
//! should assemble, plus a cursor marking how far construction has got.
//! `current_progress()` includes the one-ahead target, so after
//! `reset_sequence()` followed by `next()` the prefix holds the base block and
//! the first block to place on it.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block colors the robot can tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockColor {
    Red,
    Blue,
    Green,
    Yellow,
    Brown,
    Orange,
    Gray,
    Purple,
    Cyan,
    Pink,
}

impl BlockColor {
    pub const PALETTE: [Self; 10] = [
        Self::Red,
        Self::Blue,
        Self::Green,
        Self::Yellow,
        Self::Brown,
        Self::Orange,
        Self::Gray,
        Self::Purple,
        Self::Cyan,
        Self::Pink,
    ];

    pub const fn rgb(self) -> [u8; 3] {
        match self {
            Self::Red => [255, 0, 0],
            Self::Blue => [0, 0, 255],
            Self::Green => [0, 255, 0],
            Self::Yellow => [255, 255, 0],
            Self::Brown => [165, 42, 42],
            Self::Orange => [255, 165, 0],
            Self::Gray => [128, 128, 128],
            Self::Purple => [128, 0, 128],
            Self::Cyan => [0, 255, 255],
            Self::Pink => [255, 192, 203],
        }
    }
}

impl fmt::Display for BlockColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Red => "red",
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Brown => "brown",
            Self::Orange => "orange",
            Self::Gray => "gray",
            Self::Purple => "purple",
            Self::Cyan => "cyan",
            Self::Pink => "pink",
        };
        f.write_str(name)
    }
}

/// Ordered goal for the current trial and the cursor into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalSequence {
    sequence: Vec<BlockColor>,
    progress_index: usize,
    goal_size: usize,
    start_offset: usize,
    trial: u64,
}

impl GoalSequence {
    /// Create a goal over `sequence`, clamping `goal_size` to its length.
    pub fn new(sequence: Vec<BlockColor>, goal_size: usize, start_offset: usize) -> Self {
        let goal_size = goal_size.min(sequence.len());
        let start_offset = start_offset.min(goal_size);
        Self {
            sequence,
            progress_index: start_offset,
            goal_size,
            start_offset,
            trial: 0,
        }
    }

    /// Goal using the first `object_count` palette colors in palette order.
    pub fn with_palette(object_count: usize, goal_size: usize) -> Self {
        let colors = BlockColor::PALETTE.iter().copied().take(object_count).collect();
        Self::new(colors, goal_size, 0)
    }

    /// Advance the cursor by one. A no-op once the goal size is reached.
    pub fn next(&mut self) {
        if self.progress_index < self.goal_size {
            self.progress_index += 1;
        }
    }

    /// Advance until the cursor covers `height` blocks or the goal is reached.
    pub fn advance_to(&mut self, height: usize) {
        while self.progress_index < height && self.progress_index < self.goal_size {
            self.next();
        }
    }

    /// Return the cursor to the starting offset.
    pub fn reset_sequence(&mut self) {
        self.progress_index = self.start_offset;
    }

    /// Reset, then count the pre-placed base block.
    pub fn restart(&mut self) {
        self.reset_sequence();
        self.next();
    }

    /// Shuffle the goal order for a new goal-conditioned trial and reset.
    pub fn reshuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.sequence.shuffle(rng);
        self.reset_sequence();
    }

    /// Prefix up to and including the one-ahead target.
    pub fn current_progress(&self) -> &[BlockColor] {
        let end = (self.progress_index + 1).min(self.sequence.len());
        &self.sequence[..end]
    }

    /// The block the next placement should deliver, if any remain.
    pub fn current_target(&self) -> Option<BlockColor> {
        if self.progress_index < self.goal_size {
            self.sequence.get(self.progress_index).copied()
        } else {
            None
        }
    }

    pub fn sequence(&self) -> &[BlockColor] {
        &self.sequence
    }

    pub const fn progress_index(&self) -> usize {
        self.progress_index
    }

    pub const fn goal_size(&self) -> usize {
        self.goal_size
    }

    pub const fn start_offset(&self) -> usize {
        self.start_offset
    }

    pub const fn trial(&self) -> u64 {
        self.trial
    }

    /// Trial counter. Written only by the trial lifecycle.
    pub fn set_trial(&mut self, trial: u64) {
        self.trial = trial;
    }
}
