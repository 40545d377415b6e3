// src/motion/sequencer.rs - Executes movement plans against the firmware link
use super::{MotionError, MoveKind, MovementPlan, MovementStep};
use crate::hardware::command::ComplexCommandKind;
use crate::hardware::link::FirmwareLink;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

/// Runs one [`MovementPlan`] at a time. Clones share the same sequencer.
#[derive(Clone)]
pub struct MotionSequencer {
    inner: Arc<Inner>,
}

struct Inner {
    link: FirmwareLink,
    position_feedback: bool,
    tolerance: f64,
    active: AtomicBool,
    abort_generation: watch::Sender<u64>,
}

/// Clears the active flag however `execute` exits.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MotionSequencer {
    pub fn new(link: FirmwareLink, position_feedback: bool, tolerance: f64) -> Self {
        let (abort_generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                link,
                position_feedback,
                tolerance,
                active: AtomicBool::new(false),
                abort_generation,
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Stop the active plan and reset the link. Returns `false` when idle.
    pub fn abort(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        tracing::info!("Aborting movement plan");
        self.inner.abort_generation.send_modify(|g| *g += 1);
        self.inner.link.request_reset();
        true
    }

    pub async fn execute(&self, plan: MovementPlan) -> Result<(), MotionError> {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            debug_assert!(false, "MotionSequencer::execute called while a plan is active");
            return Err(MotionError::Busy);
        }
        let _guard = ActiveGuard(&self.inner.active);
        let mut abort = self.inner.abort_generation.subscribe();

        tracing::debug!("Executing movement plan with {} steps", plan.len());
        for (index, step) in plan.steps().iter().enumerate() {
            let outcome = tokio::select! {
                biased;
                _ = abort.changed() => Err(MotionError::Aborted),
                result = self.run_step(*step) => result,
            };
            if let Err(e) = outcome {
                tracing::warn!("Movement step {} of {} failed: {}", index + 1, plan.len(), e);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run_step(&self, step: MovementStep) -> Result<(), MotionError> {
        match step {
            MovementStep::Delay(duration) => {
                sleep_until(Instant::now() + duration).await;
                Ok(())
            }
            MovementStep::Move { kind, distance, speed } => self.run_move(kind, distance, speed).await,
        }
    }

    async fn run_move(&self, kind: MoveKind, distance: f64, speed: f64) -> Result<(), MotionError> {
        let link = &self.inner.link;
        link.wait_online().await?;

        let expected = match kind {
            MoveKind::Absolute => Some(distance),
            MoveKind::Relative => link.status().position.map(|p| p.z + distance),
        };
        let command = match kind {
            MoveKind::Absolute => ComplexCommandKind::MoveAbsolute,
            MoveKind::Relative => ComplexCommandKind::MoveRelative,
        };
        tracing::debug!("Move {:?} {:.2} mm at {:.2} mm/min", kind, distance, speed);
        link.enqueue(command, &[distance, speed]).await?.wait().await?;

        if !self.inner.position_feedback {
            return Ok(());
        }
        match (expected, link.status().position) {
            (Some(expected), Some(reported)) if (reported.z - expected).abs() > self.inner.tolerance + f64::EPSILON => {
                Err(MotionError::PositionMismatch {
                    expected,
                    actual: reported.z,
                })
            }
            _ => Ok(()),
        }
    }
}
