//! Motion primitives, discretized action locations and per-action outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A motion primitive the robot can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    Push,
    Grasp,
    Place,
}

impl Primitive {
    /// All primitives in score-map order.
    pub const ALL: [Self; 3] = [Self::Push, Self::Grasp, Self::Place];

    /// Stable string form used in logs and persisted records.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Grasp => "grasp",
            Self::Place => "place",
        }
    }

    /// The no-change counter family this primitive reports into.
    pub const fn family(self) -> PrimitiveFamily {
        match self {
            Self::Push => PrimitiveFamily::Push,
            Self::Grasp | Self::Place => PrimitiveFamily::Grasp,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stagnation counters are kept per family: pushes, and grasps with their places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveFamily {
    Push,
    Grasp,
}

/// A 3-D discretized action location: rotation bin, heightmap row and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionIndex {
    pub rotation: usize,
    pub row: usize,
    pub col: usize,
}

impl ActionIndex {
    pub const fn new(rotation: usize, row: usize, col: usize) -> Self {
        Self { rotation, row, col }
    }
}

impl fmt::Display for ActionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.rotation, self.row, self.col)
    }
}

/// A robot pose in workspace coordinates (meters, radians).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f64; 3],
    pub rotation_angle: f64,
}

impl Pose {
    /// True when any coordinate is NaN or infinite.
    pub fn is_invalid(&self) -> bool {
        self.position.iter().any(|v| !v.is_finite()) || !self.rotation_angle.is_finite()
    }
}

/// Success flags of the most recent action, one per outcome the loop tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessFlags {
    pub push: bool,
    pub grasp: bool,
    pub place: bool,
    pub partial_stack: bool,
}

impl SuccessFlags {
    pub const fn all_true() -> Self {
        Self {
            push: true,
            grasp: true,
            place: true,
            partial_stack: true,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// The outcome the replay sampler stratifies on for `primitive`.
    ///
    /// Push is judged by whether the scene changed, so callers pass the
    /// change-detected flag separately.
    pub const fn outcome_for(&self, primitive: Primitive, change_detected: bool) -> bool {
        match primitive {
            Primitive::Push => change_detected,
            Primitive::Grasp => self.grasp,
            Primitive::Place => self.partial_stack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_families() {
        assert_eq!(Primitive::Push.family(), PrimitiveFamily::Push);
        assert_eq!(Primitive::Grasp.family(), PrimitiveFamily::Grasp);
        assert_eq!(Primitive::Place.family(), PrimitiveFamily::Grasp);
    }

    #[test]
    fn test_primitive_serde_snake_case() {
        let json = serde_json::to_string(&Primitive::Grasp).unwrap();
        assert_eq!(json, "\"grasp\"");
        let back: Primitive = serde_json::from_str("\"place\"").unwrap();
        assert_eq!(back, Primitive::Place);
    }

    #[test]
    fn test_pose_invalid() {
        let ok = Pose { position: [0.1, 0.2, 0.0], rotation_angle: 0.0 };
        assert!(!ok.is_invalid());
        let bad = Pose { position: [f64::NAN, 0.2, 0.0], rotation_angle: 0.0 };
        assert!(bad.is_invalid());
    }

    #[test]
    fn test_outcome_for() {
        let mut flags = SuccessFlags { grasp: true, ..Default::default() };
        assert!(flags.outcome_for(Primitive::Grasp, false));
        assert!(!flags.outcome_for(Primitive::Place, true));
        assert!(flags.outcome_for(Primitive::Push, true));
        flags.clear();
        assert_eq!(flags, SuccessFlags::default());
    }
}
