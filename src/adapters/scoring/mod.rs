//! Reference scoring model.

pub mod heightmap;

pub use heightmap::{HeightmapScorer, PrimitiveWeights, ScorerWeights};
