// src/projector.rs - UV projector power control through an external helper
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("Failed to launch power helper: {0}")]
    Launch(#[from] std::io::Error),
    #[error("Power helper exited with status {0:?}")]
    Exit(Option<i32>),
    #[error("Power helper timed out after {0:?}")]
    Timeout(Duration),
}

/// Sets the projector's raw power level; `0` switches it off.
#[async_trait]
pub trait ProjectorPower: Send + Sync {
    async fn set_power(&self, level: u32) -> Result<(), PowerError>;

    /// Switch the projector off without waiting for the outcome.
    fn force_off(&self);
}

/// Convert a percentage into the helper's raw level. Any non-zero percentage stays lit.
pub fn percent_to_raw(percent: f64, max_level: u32) -> u32 {
    if percent <= 0.0 {
        return 0;
    }
    let raw = (percent * max_level as f64 / 100.0).round() as u32;
    raw.clamp(1, max_level.max(1))
}

/// Runs `<power-command> <level>` once per call.
pub struct PowerCommandRunner {
    command: String,
    timeout: Duration,
}

impl PowerCommandRunner {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ProjectorPower for PowerCommandRunner {
    async fn set_power(&self, level: u32) -> Result<(), PowerError> {
        tracing::debug!("Running '{} {}'", self.command, level);
        let mut child = Command::new(&self.command)
            .arg(level.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(PowerError::Timeout(self.timeout));
            }
        };
        if status.success() {
            Ok(())
        } else {
            Err(PowerError::Exit(status.code()))
        }
    }

    fn force_off(&self) {
        match Command::new(&self.command).arg("0").stdin(Stdio::null()).stdout(Stdio::null()).spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    if let Err(e) = child.wait().await {
                        tracing::warn!("Power-off helper failed: {}", e);
                    }
                });
            }
            Err(e) => tracing::warn!("Failed to launch power-off helper: {}", e),
        }
    }
}

/// Records requested levels instead of driving hardware.
#[derive(Debug, Clone, Default)]
pub struct SimulatedProjector {
    levels: Arc<Mutex<Vec<u32>>>,
    forced_off: Arc<Mutex<usize>>,
    fail: bool,
}

impl SimulatedProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A projector whose helper always exits non-zero.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn levels(&self) -> Vec<u32> {
        self.levels.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn forced_off_count(&self) -> usize {
        self.forced_off.lock().map(|c| *c).unwrap_or_default()
    }
}

#[async_trait]
impl ProjectorPower for SimulatedProjector {
    async fn set_power(&self, level: u32) -> Result<(), PowerError> {
        tracing::info!("Simulated projector power: {}", level);
        if let Ok(mut levels) = self.levels.lock() {
            levels.push(level);
        }
        if self.fail { Err(PowerError::Exit(Some(1))) } else { Ok(()) }
    }

    fn force_off(&self) {
        tracing::info!("Simulated projector forced off");
        if let Ok(mut count) = self.forced_off.lock() {
            *count += 1;
        }
    }
}
