//! Experience replay - background training on surprising past transitions.
//!
//! Candidates are the past actions of one primitive whose outcome matches a
//! requested value. They are ranked by surprise (|predicted - label|) and a
//! rank is drawn from a power-law distribution, so high-surprise samples are
//! favored without becoming deterministic.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    Frame, GoalCondition, Primitive, ReplayConfig, ReplaySample, TrainingSample, TransitionRecord,
};
use crate::domain::ports::Scorer;

/// Map a uniform draw to a rank in `0..n` with density `p * x^(p - 1)`.
///
/// Candidates are sorted by ascending surprise, so higher exponents push the
/// draw toward the most surprising end.
pub fn power_rank(uniform: f64, exponent: f64, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let x = uniform.clamp(0.0, 1.0).powf(1.0 / exponent);
    let rank = (x * (n - 1) as f64).round() as usize;
    rank.min(n - 1)
}

/// In-memory mirror of the transition log plus the frames replay needs.
#[derive(Debug)]
pub struct ReplayBuffer {
    records: Vec<TransitionRecord>,
    frames: HashMap<u64, Arc<Frame>>,
    frame_order: VecDeque<u64>,
    refreshed: HashMap<u64, f64>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            frames: HashMap::new(),
            frame_order: VecDeque::new(),
            refreshed: HashMap::new(),
            capacity,
        }
    }

    /// Seed from a resumed log. Frames are not persisted, so old records
    /// only serve as fallback history until fresh frames arrive.
    pub fn with_records(records: Vec<TransitionRecord>, capacity: usize) -> Self {
        Self {
            records,
            ..Self::new(capacity)
        }
    }

    /// Add a record and the frame its action was chosen from.
    pub fn push(&mut self, record: TransitionRecord, frame: Arc<Frame>) {
        if self.capacity > 0 {
            while self.frame_order.len() >= self.capacity {
                if let Some(old) = self.frame_order.pop_front() {
                    self.frames.remove(&old);
                }
            }
            self.frame_order.push_back(record.iteration);
            self.frames.insert(record.iteration, frame);
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TransitionRecord] {
        &self.records
    }

    pub fn frame(&self, iteration: u64) -> Option<Arc<Frame>> {
        self.frames.get(&iteration).cloned()
    }

    /// Current prediction for a record: refreshed by replay, else as logged.
    pub fn prediction(&self, record: &TransitionRecord) -> f64 {
        self.refreshed
            .get(&record.iteration)
            .copied()
            .unwrap_or(record.predicted_value)
    }

    fn surprise(&self, position: usize) -> f64 {
        let record = &self.records[position];
        record.surprise(self.prediction(record))
    }
}

/// One draw from the buffer, before training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayPick {
    pub position: usize,
    pub surprise: f64,
    /// No stratified candidate existed; drawn uniformly from all history.
    pub fallback: bool,
}

/// Surprise-weighted replay trainer.
pub struct ExperienceReplay {
    scorer: Arc<dyn Scorer>,
    buffer: ReplayBuffer,
    exponent: f64,
    all_history_prob: f64,
    rng: ChaCha8Rng,
}

impl ExperienceReplay {
    pub fn new(scorer: Arc<dyn Scorer>, buffer: ReplayBuffer, config: &ReplayConfig, seed: u64) -> Self {
        Self {
            scorer,
            buffer,
            exponent: config.power_law_exponent,
            all_history_prob: config.all_history_prob,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub const fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    pub fn push(&mut self, record: TransitionRecord, frame: Arc<Frame>) {
        self.buffer.push(record, frame);
    }

    /// Choose a record to replay without training on it.
    pub fn sample(&mut self, primitive: Primitive, desired_outcome: bool) -> Option<ReplayPick> {
        let replayable: Vec<usize> = (0..self.buffer.records.len())
            .filter(|&i| self.buffer.frames.contains_key(&self.buffer.records[i].iteration))
            .collect();
        if replayable.is_empty() {
            return None;
        }

        let whole_history = self.rng.gen::<f64>() < self.all_history_prob;
        let mut candidates: Vec<usize> = if whole_history {
            replayable.clone()
        } else {
            replayable
                .iter()
                .copied()
                .filter(|&i| {
                    let r = &self.buffer.records[i];
                    r.primitive == primitive && r.outcome() == desired_outcome
                })
                .collect()
        };

        if candidates.is_empty() {
            let position = replayable[self.rng.gen_range(0..replayable.len())];
            return Some(ReplayPick {
                position,
                surprise: self.buffer.surprise(position),
                fallback: true,
            });
        }

        candidates.sort_by(|&a, &b| self.buffer.surprise(a).total_cmp(&self.buffer.surprise(b)));
        let rank = power_rank(self.rng.gen::<f64>(), self.exponent, candidates.len());
        let position = candidates[rank];
        Some(ReplayPick {
            position,
            surprise: self.buffer.surprise(position),
            fallback: false,
        })
    }

    /// Replay one past transition through the scorer and train on it.
    pub async fn sample_and_train(
        &mut self,
        primitive: Primitive,
        desired_outcome: bool,
    ) -> DomainResult<Option<ReplaySample>> {
        let Some(pick) = self.sample(primitive, desired_outcome) else {
            return Ok(None);
        };
        let record = self.buffer.records[pick.position].clone();
        let Some(frame) = self.buffer.frame(record.iteration) else {
            return Ok(None);
        };

        let maps = self
            .scorer
            .score(&frame, GoalCondition::new(record.goal_target, None))
            .await?;
        let refreshed = maps.best_value(record.primitive);
        self.scorer
            .update(&TrainingSample {
                frame,
                primitive: record.primitive,
                index: record.index,
                label: record.label_value,
            })
            .await?;
        self.buffer.refreshed.insert(record.iteration, refreshed);

        debug!(
            iteration = record.iteration,
            primitive = %record.primitive,
            surprise = pick.surprise,
            fallback = pick.fallback,
            "Replayed transition"
        );
        Ok(Some(ReplaySample {
            iteration: record.iteration,
            primitive: record.primitive,
            surprise: pick.surprise,
        }))
    }
}
