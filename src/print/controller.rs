// src/print/controller.rs - Task that drives one print sequence against the hardware
use super::sequence::{PrintEffect, PrintInput, PrintSequence};
use super::{PrintError, PrintEvent, PrintStatus};
use crate::config::{Config, MotionConfig, TimingConfig};
use crate::display::LayerDisplay;
use crate::hardware::link::FirmwareLink;
use crate::motion::{MotionError, MotionSequencer};
use crate::print_job::PrintJob;
use crate::projector::{PowerError, ProjectorPower};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::future::pending;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep, sleep_until};
use uuid::Uuid;

type Reply<T> = oneshot::Sender<Result<T, PrintError>>;

/// Requests sent from a [`PrintHandle`] to the controller task.
#[derive(Debug)]
enum PrintRequest {
    Print { job: Box<PrintJob>, respond_to: Reply<Uuid> },
    SolutionDispensed { respond_to: Reply<()> },
    Pause { respond_to: Reply<()> },
    Resume { respond_to: Reply<()> },
    Abort { respond_to: Reply<()> },
    Terminate { respond_to: Reply<()> },
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub motion: MotionConfig,
    pub timing: TimingConfig,
    pub max_power_level: u32,
    pub image_root: Option<PathBuf>,
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        Self {
            motion: config.motion.clone(),
            timing: config.timing.clone(),
            max_power_level: config.projector.max_power_level,
            image_root: config.display.image_root.clone(),
        }
    }
}

struct ActiveJob {
    id: Uuid,
    started_at: DateTime<Utc>,
    sequence: PrintSequence,
}

impl ActiveJob {
    fn status(&self) -> PrintStatus {
        let seq = &self.sequence;
        PrintStatus {
            job_id: Some(self.id),
            step: seq.step(),
            step_code: seq.step().code(),
            current_layer: seq.current_layer(),
            total_layers: seq.total_layers(),
            paused: seq.is_paused(),
            pause_pending: seq.pause_pending(),
            lamp_on: seq.lamp_on(),
            result: seq.result(),
            started_at: Some(self.started_at),
        }
    }
}

/// Owns the motion, power and timer resources of the active print job.
pub struct PrintController {
    link: FirmwareLink,
    motion: MotionSequencer,
    projector: Arc<dyn ProjectorPower>,
    display: Arc<dyn LayerDisplay>,
    settings: ControllerSettings,
    events: broadcast::Sender<PrintEvent>,
    status: watch::Sender<PrintStatus>,
    job: Option<ActiveJob>,
    motion_task: Option<BoxFuture<'static, Result<(), MotionError>>>,
    power_task: Option<BoxFuture<'static, Result<(), PowerError>>>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl PrintController {
    /// Start the controller task and return its handle.
    pub fn spawn(
        link: FirmwareLink,
        motion: MotionSequencer,
        projector: Arc<dyn ProjectorPower>,
        display: Arc<dyn LayerDisplay>,
        settings: ControllerSettings,
    ) -> PrintHandle {
        let (requests_tx, requests_rx) = mpsc::channel(32);
        let (events_tx, _) = broadcast::channel(256);
        let (status_tx, status_rx) = watch::channel(PrintStatus::idle());

        let controller = Self {
            link,
            motion,
            projector,
            display,
            settings,
            events: events_tx.clone(),
            status: status_tx,
            job: None,
            motion_task: None,
            power_task: None,
            timer: None,
        };
        tokio::spawn(controller.run(requests_rx));

        PrintHandle {
            requests: requests_tx,
            events: events_tx,
            status: status_rx,
        }
    }

    async fn run(mut self, mut requests: mpsc::Receiver<PrintRequest>) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break,
                },
                result = run_slot(&mut self.motion_task) => {
                    self.motion_task = None;
                    if let Some(position) = self.link.status().position {
                        self.feed(PrintInput::PositionReport(position.z));
                    }
                    self.feed(PrintInput::MotionDone(result));
                }
                result = run_slot(&mut self.power_task) => {
                    self.power_task = None;
                    self.feed(PrintInput::PowerDone(result));
                }
                _ = timer_elapsed(&mut self.timer) => {
                    self.timer = None;
                    self.feed(PrintInput::TimerElapsed);
                }
            }
            self.publish();
        }
        self.terminate();
        tracing::info!("Print controller terminated");
    }

    fn on_request(&mut self, request: PrintRequest) {
        match request {
            PrintRequest::Print { job, respond_to } => {
                let _ = respond_to.send(self.start_job(*job));
            }
            PrintRequest::SolutionDispensed { respond_to } => {
                let _ = respond_to.send(self.dispatch(PrintInput::SolutionDispensed));
            }
            PrintRequest::Pause { respond_to } => {
                let _ = respond_to.send(self.dispatch(PrintInput::Pause));
            }
            PrintRequest::Resume { respond_to } => {
                let _ = respond_to.send(self.dispatch(PrintInput::Resume));
            }
            PrintRequest::Abort { respond_to } => {
                let _ = respond_to.send(self.dispatch(PrintInput::Abort));
            }
            PrintRequest::Terminate { respond_to } => {
                self.terminate();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    fn start_job(&mut self, job: PrintJob) -> Result<Uuid, PrintError> {
        if self.job.is_some() {
            return Err(PrintError::Busy);
        }
        job.validate()?;

        let id = Uuid::new_v4();
        tracing::info!("Accepted print job {} ({} layers)", id, job.total_layer_count());
        let settings = &self.settings;
        let sequence = PrintSequence::new(
            job,
            settings.motion.clone(),
            settings.timing.clone(),
            settings.max_power_level,
        );
        self.job = Some(ActiveJob {
            id,
            started_at: Utc::now(),
            sequence,
        });
        if let Some(position) = self.link.status().position {
            self.feed(PrintInput::PositionReport(position.z));
        }
        self.dispatch(PrintInput::Start)?;
        Ok(id)
    }

    /// Hand a request to the sequence, returning its rejection to the caller.
    fn dispatch(&mut self, input: PrintInput) -> Result<(), PrintError> {
        let job = self.job.as_mut().ok_or(PrintError::NoJob)?;
        let effects = job.sequence.handle(input)?;
        self.run_effects(effects);
        Ok(())
    }

    /// Hand a completion to the sequence. Rejections are only logged.
    fn feed(&mut self, input: PrintInput) {
        let Some(job) = self.job.as_mut() else {
            tracing::debug!("Dropping {:?}: no active job", input);
            return;
        };
        match job.sequence.handle(input) {
            Ok(effects) => self.run_effects(effects),
            Err(e) => tracing::warn!("Print sequence rejected completion: {}", e),
        }
    }

    fn run_effects(&mut self, effects: Vec<PrintEffect>) {
        let mut pending: VecDeque<PrintEffect> = effects.into();
        while let Some(effect) = pending.pop_front() {
            let Some(input) = self.apply(effect) else {
                continue;
            };
            let Some(job) = self.job.as_mut() else {
                break;
            };
            match job.sequence.handle(input) {
                Ok(more) => pending.extend(more),
                Err(e) => tracing::warn!("Print sequence rejected completion: {}", e),
            }
        }
    }

    /// Execute one effect. Synchronous effects return their completion directly.
    fn apply(&mut self, effect: PrintEffect) -> Option<PrintInput> {
        match effect {
            PrintEffect::ExecutePlan(plan) => {
                if self.motion_task.is_some() {
                    tracing::warn!("Replacing an unfinished movement plan");
                }
                let motion = self.motion.clone();
                self.motion_task = Some(async move { motion.execute(plan).await }.boxed());
            }
            PrintEffect::AbortMotion => {
                self.motion.abort();
            }
            PrintEffect::SetPower(level) => {
                let projector = self.projector.clone();
                self.power_task = Some(async move { projector.set_power(level).await }.boxed());
            }
            PrintEffect::ForcePowerOff => self.projector.force_off(),
            PrintEffect::StartTimer(duration) => {
                tracing::debug!("Timer started: {:?}", duration);
                self.timer = Some(Box::pin(sleep_until(Instant::now() + duration)));
            }
            PrintEffect::CancelTimer => self.timer = None,
            PrintEffect::ShowImage(index) => {
                let Some(path) = self.layer_path(index) else {
                    return Some(PrintInput::ImageFailed(format!("layer {} is not in the job", index)));
                };
                return Some(match self.display.show(&path) {
                    Ok(()) => PrintInput::ImageShown,
                    Err(e) => PrintInput::ImageFailed(e.to_string()),
                });
            }
            PrintEffect::ClearImage => self.display.clear(),
            PrintEffect::Emit(event) => {
                tracing::info!("Print event: {:?}", event);
                let _ = self.events.send(event);
            }
            PrintEffect::Finish(result) => {
                if let Some(job) = self.job.take() {
                    tracing::info!("Print job {} finished: {:?}", job.id, result);
                    self.status.send_replace(job.status());
                }
                self.motion_task = None;
                self.power_task = None;
                self.timer = None;
            }
        }
        None
    }

    fn layer_path(&self, index: usize) -> Option<PathBuf> {
        let path = self.job.as_ref()?.sequence.job().layer_path(index)?;
        match &self.settings.image_root {
            Some(root) if path.is_relative() => Some(root.join(path)),
            _ => Some(path),
        }
    }

    /// Drop all in-flight work without raising the platform.
    fn terminate(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        tracing::warn!("Terminating print job {} during {}", job.id, job.sequence.step().code());
        self.motion.abort();
        self.motion_task = None;
        self.power_task = None;
        self.timer = None;
        self.projector.force_off();
        self.display.clear();
        self.status.send_replace(PrintStatus::idle());
    }

    fn publish(&self) {
        if let Some(job) = &self.job {
            self.status.send_replace(job.status());
        }
    }
}

async fn run_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(task) => task.await,
        None => pending().await,
    }
}

async fn timer_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

/// Cloneable handle used by the web API and binaries to drive print jobs.
#[derive(Clone)]
pub struct PrintHandle {
    requests: mpsc::Sender<PrintRequest>,
    events: broadcast::Sender<PrintEvent>,
    status: watch::Receiver<PrintStatus>,
}

impl PrintHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> PrintRequest) -> Result<T, PrintError> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(build(respond_to))
            .await
            .map_err(|e| PrintError::ChannelSend(e.to_string()))?;
        response
            .await
            .map_err(|_| PrintError::ChannelSend("print controller dropped the request".to_string()))?
    }

    /// Validate and start a job. Returns the new job id.
    pub async fn print(&self, job: PrintJob) -> Result<Uuid, PrintError> {
        self.request(|respond_to| PrintRequest::Print {
            job: Box::new(job),
            respond_to,
        })
        .await
    }

    /// Confirm that resin was dispensed after `RequestDispensePrintSolution`.
    pub async fn solution_dispensed(&self) -> Result<(), PrintError> {
        self.request(|respond_to| PrintRequest::SolutionDispensed { respond_to }).await
    }

    pub async fn pause(&self) -> Result<(), PrintError> {
        self.request(|respond_to| PrintRequest::Pause { respond_to }).await
    }

    pub async fn resume(&self) -> Result<(), PrintError> {
        self.request(|respond_to| PrintRequest::Resume { respond_to }).await
    }

    pub async fn abort(&self) -> Result<(), PrintError> {
        self.request(|respond_to| PrintRequest::Abort { respond_to }).await
    }

    pub async fn terminate(&self) -> Result<(), PrintError> {
        self.request(|respond_to| PrintRequest::Terminate { respond_to }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrintEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> PrintStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<PrintStatus> {
        self.status.clone()
    }
}
