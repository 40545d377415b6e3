// src/motion/mod.rs - Movement plans and their execution
pub mod sequencer;

pub use sequencer::MotionSequencer;

use crate::hardware::link::LinkError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MotionError {
    #[error("Movement aborted")]
    Aborted,
    #[error("Firmware link failure: {0}")]
    Link(#[from] LinkError),
    #[error("Position mismatch: expected {expected:.2} mm, reported {actual:.2} mm")]
    PositionMismatch { expected: f64, actual: f64 },
    #[error("Motion sequencer is already executing a plan")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Absolute,
    Relative,
}

/// One step of a movement plan. Distances in mm, speeds in mm/min.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MovementStep {
    Move { kind: MoveKind, distance: f64, speed: f64 },
    Delay(Duration),
}

/// Ordered, all-or-nothing list of movement steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MovementPlan {
    steps: Vec<MovementStep>,
}

impl MovementPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absolute(mut self, z: f64, speed: f64) -> Self {
        self.steps.push(MovementStep::Move {
            kind: MoveKind::Absolute,
            distance: z,
            speed,
        });
        self
    }

    pub fn relative(mut self, delta: f64, speed: f64) -> Self {
        self.steps.push(MovementStep::Move {
            kind: MoveKind::Relative,
            distance: delta,
            speed,
        });
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(MovementStep::Delay(duration));
        self
    }

    pub fn steps(&self) -> &[MovementStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of all relative moves.
    pub fn net_relative_distance(&self) -> f64 {
        self.steps
            .iter()
            .map(|step| match step {
                MovementStep::Move { kind: MoveKind::Relative, distance, .. } => *distance,
                _ => 0.0,
            })
            .sum()
    }

    /// Total time spent in delay steps.
    pub fn total_delay(&self) -> Duration {
        self.steps
            .iter()
            .map(|step| match step {
                MovementStep::Delay(d) => *d,
                _ => Duration::ZERO,
            })
            .sum()
    }
}
