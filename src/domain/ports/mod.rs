//! Port traits the control loop drives.

pub mod persistence;
pub mod robot;
pub mod scorer;

pub use persistence::{ModelSnapshots, StateStore, TransitionLog};
pub use robot::RobotInterface;
pub use scorer::Scorer;
