// src/print/sequence.rs - Per-job print state machine
//
// Pure transition logic: every input returns the effects the controller must
// carry out. Completions of those effects come back as further inputs.

use super::{PrintError, PrintEvent, PrintResult};
use crate::config::{MotionConfig, TimingConfig};
use crate::motion::{MotionError, MovementPlan};
use crate::print_job::{Phase, PrintJob, PrintParameters};
use crate::projector::{PowerError, percent_to_raw};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PumpStage {
    /// Settle delay before the pump maneuver.
    PreLift,
    Maneuver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SettleStage {
    /// Delay before the platform rises one layer. Pause checkpoint.
    PreProjection,
    Rise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrintStep {
    Idle,
    RaisingHome,
    AwaitingSolutionDispense,
    LoweringToFirstLayer,
    /// Loading the layer image and powering the projector. Pause checkpoint.
    Projecting(Phase),
    Exposing(Phase),
    NextTile(Phase),
    Retracting(Phase),
    Pumping(Phase, PumpStage),
    Settling(Phase, SettleStage),
    RaisingFinal,
    PauseRaising,
    Paused,
    ResumeLowering,
    Terminal(PrintResult),
}

impl PrintStep {
    /// Short step label used in logs and the status API.
    pub fn code(self) -> &'static str {
        use PrintStep::*;
        match self {
            Idle => "idle",
            RaisingHome => "A1",
            AwaitingSolutionDispense => "A2",
            LoweringToFirstLayer => "A3",
            Projecting(Phase::Base) => "B1",
            Exposing(Phase::Base) => "B2",
            NextTile(Phase::Base) => "B2a",
            Retracting(Phase::Base) => "B3",
            Pumping(Phase::Base, PumpStage::PreLift) => "B4a1",
            Pumping(Phase::Base, PumpStage::Maneuver) => "B4a2",
            Settling(Phase::Base, SettleStage::PreProjection) => "B4b1",
            Settling(Phase::Base, SettleStage::Rise) => "B4b2",
            Projecting(Phase::Body) => "C1",
            Exposing(Phase::Body) => "C2",
            NextTile(Phase::Body) => "C2a",
            Retracting(Phase::Body) => "C3",
            Pumping(Phase::Body, PumpStage::PreLift) => "C4a1",
            Pumping(Phase::Body, PumpStage::Maneuver) => "C4a2",
            Settling(Phase::Body, SettleStage::PreProjection) => "C4b1",
            Settling(Phase::Body, SettleStage::Rise) => "C4b2",
            RaisingFinal => "D1",
            PauseRaising => "E1",
            Paused => "paused",
            ResumeLowering => "E2",
            Terminal(_) => "done",
        }
    }
}

#[derive(Debug)]
pub enum PrintInput {
    Start,
    SolutionDispensed,
    MotionDone(Result<(), MotionError>),
    PowerDone(Result<(), PowerError>),
    TimerElapsed,
    ImageShown,
    ImageFailed(String),
    Pause,
    Resume,
    Abort,
    PositionReport(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrintEffect {
    ExecutePlan(MovementPlan),
    AbortMotion,
    SetPower(u32),
    /// Switch the projector off without waiting for the helper.
    ForcePowerOff,
    StartTimer(Duration),
    CancelTimer,
    ShowImage(usize),
    ClearImage,
    Emit(PrintEvent),
    Finish(PrintResult),
}

pub struct PrintSequence {
    job: PrintJob,
    motion: MotionConfig,
    timing: TimingConfig,
    max_power_level: u32,
    step: PrintStep,
    result: PrintResult,
    current_layer: usize,
    position: f64,
    lamp_on: bool,
    pause_requested: bool,
    resume_requested: bool,
    paused_step: Option<PrintStep>,
    paused_position: f64,
    motion_active: bool,
    power_active: bool,
    timer_active: bool,
    final_started: bool,
    out: Vec<PrintEffect>,
}

impl PrintSequence {
    pub fn new(job: PrintJob, motion: MotionConfig, timing: TimingConfig, max_power_level: u32) -> Self {
        Self {
            job,
            motion,
            timing,
            max_power_level,
            step: PrintStep::Idle,
            result: PrintResult::None,
            current_layer: 0,
            position: 0.0,
            lamp_on: false,
            pause_requested: false,
            resume_requested: false,
            paused_step: None,
            paused_position: 0.0,
            motion_active: false,
            power_active: false,
            timer_active: false,
            final_started: false,
            out: Vec::new(),
        }
    }

    pub fn job(&self) -> &PrintJob {
        &self.job
    }

    pub fn step(&self) -> PrintStep {
        self.step
    }

    pub fn result(&self) -> PrintResult {
        self.result
    }

    pub fn current_layer(&self) -> usize {
        self.current_layer
    }

    pub fn total_layers(&self) -> usize {
        self.job.total_layer_count()
    }

    pub fn is_paused(&self) -> bool {
        self.step == PrintStep::Paused
    }

    pub fn pause_pending(&self) -> bool {
        self.pause_requested
    }

    pub fn lamp_on(&self) -> bool {
        self.lamp_on
    }

    /// The step a pause was taken at, while paused.
    pub fn paused_step(&self) -> Option<PrintStep> {
        self.paused_step
    }

    pub fn handle(&mut self, input: PrintInput) -> Result<Vec<PrintEffect>, PrintError> {
        match input {
            PrintInput::Start => self.start()?,
            PrintInput::SolutionDispensed => self.solution_dispensed()?,
            PrintInput::MotionDone(result) => self.on_motion_done(result),
            PrintInput::PowerDone(result) => self.on_power_done(result),
            PrintInput::TimerElapsed => self.on_timer(),
            PrintInput::ImageShown => self.on_image_shown(),
            PrintInput::ImageFailed(reason) => self.on_image_failed(&reason),
            PrintInput::Pause => self.pause()?,
            PrintInput::Resume => self.resume()?,
            PrintInput::Abort => self.abort()?,
            PrintInput::PositionReport(z) => self.position = z,
        }
        Ok(std::mem::take(&mut self.out))
    }

    fn enter(&mut self, step: PrintStep) {
        tracing::info!("Print step {} -> {} (layer {}/{})", self.step.code(), step.code(), self.current_layer, self.total_layers());
        self.step = step;
    }

    fn emit(&mut self, event: PrintEvent) {
        self.out.push(PrintEffect::Emit(event));
    }

    fn execute(&mut self, plan: MovementPlan) {
        debug_assert!(!self.motion_active, "movement plan started while another is active");
        self.motion_active = true;
        self.out.push(PrintEffect::ExecutePlan(plan));
    }

    fn set_power(&mut self, level: u32) {
        self.power_active = true;
        self.out.push(PrintEffect::SetPower(level));
    }

    fn start_timer(&mut self, duration: Duration) {
        self.timer_active = true;
        self.out.push(PrintEffect::StartTimer(duration));
    }

    fn cancel_timer(&mut self) {
        if self.timer_active {
            self.timer_active = false;
            self.out.push(PrintEffect::CancelTimer);
        }
    }

    fn current_phase(&self) -> Phase {
        self.job.phase_of(self.current_layer)
    }

    fn params(&self, phase: Phase) -> &PrintParameters {
        self.job.parameters(phase)
    }

    /// Thickness in mm of the layer about to be printed.
    fn current_thickness_mm(&self) -> f64 {
        self.job.layer_thickness_mm_at(self.current_layer).unwrap_or(0.0)
    }

    /// Raise to the slow-speed threshold, then to the top at high speed.
    fn raise_plan(&self) -> MovementPlan {
        let params = self.params(self.current_phase());
        MovementPlan::new()
            .absolute(self.motion.threshold_for(self.position), params.no_pump_up_velocity)
            .absolute(self.motion.maximum_z, self.motion.default_high_speed)
    }

    // Section A: homing and the first layer.

    fn start(&mut self) -> Result<(), PrintError> {
        if self.step != PrintStep::Idle {
            return Err(PrintError::InvalidTransition(format!("cannot start from {}", self.step.code())));
        }
        tracing::info!(
            "Starting print: {} base and {} body entries",
            self.job.base_layer_count(),
            self.job.body.len()
        );
        self.emit(PrintEvent::PrintStarting);
        self.out.push(PrintEffect::ClearImage);
        self.enter(PrintStep::RaisingHome);
        self.execute(MovementPlan::new().absolute(self.motion.raise_to_maximum_z, self.motion.default_high_speed));
        Ok(())
    }

    fn solution_dispensed(&mut self) -> Result<(), PrintError> {
        if self.step != PrintStep::AwaitingSolutionDispense {
            return Err(PrintError::InvalidTransition(format!(
                "solution dispense confirmed during {}",
                self.step.code()
            )));
        }
        let first_layer_height = self.job.build_platform_offset_um() as f64 / 1000.0;
        let plan = MovementPlan::new()
            .absolute(self.motion.high_speed_threshold_z, self.motion.default_high_speed)
            .absolute(first_layer_height, self.params(self.current_phase()).no_pump_down_velocity)
            .delay(self.timing.pause_after_solution_dispensed());
        self.enter(PrintStep::LoweringToFirstLayer);
        self.execute(plan);
        Ok(())
    }

    // Sections B and C: the per-layer loop.

    fn enter_projecting(&mut self, phase: Phase) {
        if self.result.is_bad() {
            self.enter_final();
        } else if self.pause_requested {
            self.pause_printing(PrintStep::Projecting(phase));
        } else {
            self.project(phase);
        }
    }

    fn project(&mut self, phase: Phase) {
        self.enter(PrintStep::Projecting(phase));
        self.out.push(PrintEffect::ShowImage(self.current_layer));
    }

    fn on_image_shown(&mut self) {
        match self.step {
            PrintStep::Projecting(phase) => {
                let level = percent_to_raw(self.params(phase).power_level, self.max_power_level);
                self.set_power(level);
                self.emit(PrintEvent::StartingLayer(self.current_layer));
            }
            PrintStep::NextTile(phase) => {
                self.enter(PrintStep::Exposing(phase));
                self.start_timer(self.job.exposure_for(self.current_layer));
            }
            step => tracing::warn!("Image shown during {}", step.code()),
        }
    }

    fn on_image_failed(&mut self, reason: &str) {
        tracing::error!("Failed to show layer {}: {}", self.current_layer, reason);
        self.result.latch(PrintResult::Abort);
        self.enter_final();
    }

    fn on_power_done(&mut self, result: Result<(), PowerError>) {
        if !self.power_active {
            tracing::warn!("Unexpected power completion during {}", self.step.code());
            return;
        }
        self.power_active = false;
        let failed = match result {
            Ok(()) => false,
            Err(e) => {
                tracing::warn!("Projector power helper failed: {}", e);
                true
            }
        };

        match self.step {
            PrintStep::Projecting(phase) => {
                if self.result.is_bad() {
                    self.enter_final();
                    return;
                }
                self.lamp_on = true;
                self.emit(PrintEvent::LampStatusChange(true));
                self.enter(PrintStep::Exposing(phase));
                self.start_timer(self.job.exposure_for(self.current_layer));
            }
            PrintStep::Retracting(phase) => {
                if failed {
                    self.out.push(PrintEffect::ForcePowerOff);
                }
                self.lamp_on = false;
                self.emit(PrintEvent::LampStatusChange(false));
                if self.result.is_bad() {
                    self.enter_final();
                } else if self.params(phase).pumping_enabled {
                    self.enter(PrintStep::Pumping(phase, PumpStage::PreLift));
                    self.start_timer(self.timing.pause_before_lift());
                } else {
                    self.enter_settling(phase);
                }
            }
            step => tracing::warn!("Power completion ignored during {}", step.code()),
        }
    }

    fn on_timer(&mut self) {
        if !self.timer_active {
            tracing::warn!("Unexpected timer during {}", self.step.code());
            return;
        }
        self.timer_active = false;

        match self.step {
            PrintStep::Exposing(phase) => {
                if self.job.has_more_elements(self.current_layer) {
                    self.current_layer += 1;
                    self.enter(PrintStep::NextTile(self.current_phase()));
                    self.out.push(PrintEffect::ClearImage);
                    self.emit(PrintEvent::StartingLayer(self.current_layer));
                    self.out.push(PrintEffect::ShowImage(self.current_layer));
                } else {
                    self.enter(PrintStep::Retracting(phase));
                    self.out.push(PrintEffect::ClearImage);
                    self.set_power(0);
                }
            }
            PrintStep::Pumping(phase, PumpStage::PreLift) => {
                if self.advance_layer() {
                    return;
                }
                let params = self.params(phase);
                let plan = MovementPlan::new()
                    .relative(params.pump_up_distance, params.pump_up_velocity)
                    .delay(params.pump_up_pause())
                    .relative(-(params.pump_down_distance() - self.current_thickness_mm()), params.pump_down_velocity)
                    .delay(params.pump_down_pause());
                self.enter(PrintStep::Pumping(phase, PumpStage::Maneuver));
                self.execute(plan);
            }
            PrintStep::Settling(phase, SettleStage::PreProjection) => {
                let plan = MovementPlan::new().relative(self.current_thickness_mm(), self.motion.default_low_speed);
                self.enter(PrintStep::Settling(phase, SettleStage::Rise));
                self.execute(plan);
            }
            step => tracing::warn!("Timer ignored during {}", step.code()),
        }
    }

    fn enter_settling(&mut self, phase: Phase) {
        if self.pause_requested {
            self.pause_printing(PrintStep::Settling(phase, SettleStage::PreProjection));
        } else {
            self.settle(phase);
        }
    }

    fn settle(&mut self, phase: Phase) {
        self.enter(PrintStep::Settling(phase, SettleStage::PreProjection));
        if self.advance_layer() {
            return;
        }
        self.start_timer(self.timing.pause_before_project());
    }

    /// Move to the next entry. Returns `true` once every layer is printed.
    fn advance_layer(&mut self) -> bool {
        self.current_layer += 1;
        if self.current_layer >= self.total_layers() {
            tracing::info!("All {} layers printed", self.total_layers());
            self.result.latch(PrintResult::Success);
            self.enter_final();
            return true;
        }
        false
    }

    fn on_motion_done(&mut self, result: Result<(), MotionError>) {
        if !self.motion_active {
            tracing::warn!("Unexpected motion completion during {}", self.step.code());
            return;
        }
        self.motion_active = false;

        if self.step == PrintStep::RaisingFinal {
            if let Err(e) = result {
                tracing::warn!("Final raise did not complete: {}", e);
            }
            self.finish();
            return;
        }
        match result {
            Ok(()) => {}
            Err(MotionError::Aborted) => self.result.latch(PrintResult::Abort),
            Err(e) => {
                tracing::error!("Movement failed during {}: {}", self.step.code(), e);
                self.result.latch(PrintResult::Failure);
            }
        }
        if self.result.is_bad() {
            self.enter_final();
            return;
        }

        match self.step {
            PrintStep::RaisingHome => {
                self.enter(PrintStep::AwaitingSolutionDispense);
                self.emit(PrintEvent::RequestDispensePrintSolution);
            }
            PrintStep::LoweringToFirstLayer => {
                self.emit(PrintEvent::PrintPausable(true));
                self.enter_projecting(self.current_phase());
            }
            PrintStep::Pumping(_, PumpStage::Maneuver) | PrintStep::Settling(_, SettleStage::Rise) => {
                self.enter_projecting(self.current_phase());
            }
            PrintStep::PauseRaising => {
                self.enter(PrintStep::Paused);
                self.emit(PrintEvent::PrintPaused);
                if std::mem::take(&mut self.resume_requested) {
                    self.start_resume_lowering();
                }
            }
            PrintStep::ResumeLowering => {
                self.emit(PrintEvent::PrintResumed);
                match self.paused_step.take() {
                    Some(PrintStep::Settling(phase, SettleStage::PreProjection)) => self.settle(phase),
                    Some(PrintStep::Projecting(phase)) => self.project(phase),
                    other => {
                        tracing::warn!("Resumed without a checkpoint ({:?})", other);
                        self.project(self.current_phase());
                    }
                }
            }
            step => tracing::warn!("Motion completion ignored during {}", step.code()),
        }
    }

    // Section E: pause and resume.

    fn pause(&mut self) -> Result<(), PrintError> {
        match self.step {
            PrintStep::Idle | PrintStep::Terminal(_) => {
                Err(PrintError::InvalidTransition("no print in progress".to_string()))
            }
            PrintStep::PauseRaising | PrintStep::Paused => {
                Err(PrintError::InvalidTransition("print is already paused".to_string()))
            }
            _ if self.final_started => Err(PrintError::InvalidTransition("print is finishing".to_string())),
            _ => {
                tracing::info!("Pause requested during {}", self.step.code());
                self.pause_requested = true;
                Ok(())
            }
        }
    }

    fn pause_printing(&mut self, checkpoint: PrintStep) {
        self.pause_requested = false;
        self.paused_step = Some(checkpoint);
        self.paused_position = self.position;
        tracing::info!("Pausing at {} (z = {:.2})", checkpoint.code(), self.position);
        let plan = self.raise_plan();
        self.enter(PrintStep::PauseRaising);
        self.execute(plan);
    }

    fn resume(&mut self) -> Result<(), PrintError> {
        match self.step {
            PrintStep::Paused => {
                self.start_resume_lowering();
                Ok(())
            }
            PrintStep::PauseRaising => {
                self.resume_requested = true;
                Ok(())
            }
            _ if self.pause_requested => {
                tracing::info!("Pending pause cancelled");
                self.pause_requested = false;
                Ok(())
            }
            step => Err(PrintError::InvalidTransition(format!("cannot resume during {}", step.code()))),
        }
    }

    fn start_resume_lowering(&mut self) {
        let params = self.params(self.current_phase());
        let plan = MovementPlan::new()
            .absolute(self.motion.threshold_for(self.paused_position), self.motion.default_high_speed)
            .absolute(self.paused_position, params.no_pump_down_velocity);
        self.enter(PrintStep::ResumeLowering);
        self.execute(plan);
    }

    // Section D: abort and the final raise.

    fn abort(&mut self) -> Result<(), PrintError> {
        if matches!(self.step, PrintStep::Idle | PrintStep::Terminal(_)) {
            return Err(PrintError::InvalidTransition("no print in progress".to_string()));
        }
        tracing::info!("Abort requested during {}", self.step.code());
        self.result.latch(PrintResult::Abort);

        if self.final_started {
            return Ok(());
        }
        if self.step == PrintStep::Paused {
            self.paused_step = None;
            self.emit(PrintEvent::PrintResumed);
            self.enter_final();
        } else if self.motion_active {
            self.out.push(PrintEffect::AbortMotion);
        } else if !self.power_active {
            // With the power helper running, its completion starts the final raise.
            self.enter_final();
        }
        Ok(())
    }

    fn enter_final(&mut self) {
        if self.final_started {
            return;
        }
        self.final_started = true;
        self.pause_requested = false;
        self.resume_requested = false;

        self.emit(PrintEvent::PrintPausable(false));
        self.cancel_timer();
        self.out.push(PrintEffect::ForcePowerOff);
        if self.lamp_on {
            self.lamp_on = false;
            self.emit(PrintEvent::LampStatusChange(false));
        }
        self.out.push(PrintEffect::ClearImage);
        let plan = self.raise_plan();
        self.enter(PrintStep::RaisingFinal);
        self.execute(plan);
    }

    fn finish(&mut self) {
        if self.result == PrintResult::None {
            self.result = PrintResult::Success;
        }
        match self.result {
            PrintResult::Abort => self.emit(PrintEvent::PrintAborted),
            result => self.emit(PrintEvent::PrintComplete(result == PrintResult::Success)),
        }
        self.enter(PrintStep::Terminal(self.result));
        self.out.push(PrintEffect::Finish(self.result));
    }
}
