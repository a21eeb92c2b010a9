//! Reference block-world simulator.

pub mod robot;
pub mod world;

pub use robot::{BlockWorldSim, PresetBlock, PresetCase, SimOptions};
pub use world::{BlockWorld, Cell};
