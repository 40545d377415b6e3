//! Print state machine driven with synthetic completions.

use std::collections::VecDeque;
use std::time::Duration;
use vatprint_rs::config::{MotionConfig, TimingConfig};
use vatprint_rs::motion::{MotionError, MoveKind, MovementPlan, MovementStep};
use vatprint_rs::print::sequence::{PumpStage, SettleStage};
use vatprint_rs::print::{PrintEffect, PrintError, PrintEvent, PrintInput, PrintResult, PrintSequence, PrintStep};
use vatprint_rs::print_job::{LayerEntry, LayerManifest, Phase, PrintJob, PrintParameters};
use vatprint_rs::projector::PowerError;

/// Plays the controller's part: records effects and completes them on demand.
struct Driver {
    seq: PrintSequence,
    z: f64,
    events: Vec<PrintEvent>,
    plans: Vec<(PrintStep, MovementPlan)>,
    motion: Option<MovementPlan>,
    motion_aborted: bool,
    power: Option<u32>,
    power_levels: Vec<u32>,
    timer: Option<Duration>,
    images: Vec<usize>,
    forced_off: usize,
    finished: Option<PrintResult>,
    fail_power: bool,
    fail_next_motion: bool,
    fail_image: Option<usize>,
    /// Platform height when the pause raise was issued.
    pause_z: Option<f64>,
    inputs: VecDeque<PrintInput>,
}

impl Driver {
    fn new(job: PrintJob) -> Self {
        Self {
            seq: PrintSequence::new(job, MotionConfig::default(), TimingConfig::default(), 100),
            z: 0.0,
            events: Vec::new(),
            plans: Vec::new(),
            motion: None,
            motion_aborted: false,
            power: None,
            power_levels: Vec::new(),
            timer: None,
            images: Vec::new(),
            forced_off: 0,
            finished: None,
            fail_power: false,
            fail_next_motion: false,
            fail_image: None,
            pause_z: None,
            inputs: VecDeque::new(),
        }
    }

    fn send(&mut self, input: PrintInput) -> Result<(), PrintError> {
        let effects = self.seq.handle(input)?;
        self.apply(effects);
        while let Some(input) = self.inputs.pop_front() {
            let effects = self.seq.handle(input).unwrap();
            self.apply(effects);
        }
        Ok(())
    }

    fn apply(&mut self, effects: Vec<PrintEffect>) {
        for effect in effects {
            match effect {
                PrintEffect::ExecutePlan(plan) => {
                    if self.seq.step() == PrintStep::PauseRaising {
                        self.pause_z = Some(self.z);
                    }
                    self.plans.push((self.seq.step(), plan.clone()));
                    self.motion = Some(plan);
                }
                PrintEffect::AbortMotion => self.motion_aborted = true,
                PrintEffect::SetPower(level) => {
                    self.power_levels.push(level);
                    self.power = Some(level);
                }
                PrintEffect::ForcePowerOff => self.forced_off += 1,
                PrintEffect::StartTimer(duration) => self.timer = Some(duration),
                PrintEffect::CancelTimer => self.timer = None,
                PrintEffect::ShowImage(index) => {
                    self.images.push(index);
                    let input = if self.fail_image == Some(index) {
                        PrintInput::ImageFailed("missing".to_string())
                    } else {
                        PrintInput::ImageShown
                    };
                    self.inputs.push_back(input);
                }
                PrintEffect::ClearImage => {}
                PrintEffect::Emit(event) => self.events.push(event),
                PrintEffect::Finish(result) => self.finished = Some(result),
            }
        }
    }

    fn complete_motion(&mut self, plan: MovementPlan) {
        for step in plan.steps() {
            match step {
                MovementStep::Move { kind: MoveKind::Absolute, distance, .. } => self.z = *distance,
                MovementStep::Move { kind: MoveKind::Relative, distance, .. } => self.z += *distance,
                MovementStep::Delay(_) => {}
            }
        }
        self.send(PrintInput::PositionReport(self.z)).unwrap();
        let result = if std::mem::take(&mut self.motion_aborted) {
            Err(MotionError::Aborted)
        } else if std::mem::take(&mut self.fail_next_motion) {
            Err(MotionError::PositionMismatch { expected: 1.0, actual: 0.0 })
        } else {
            Ok(())
        };
        self.send(PrintInput::MotionDone(result)).unwrap();
    }

    /// Complete the one outstanding operation. Returns `false` when nothing is pending.
    fn step(&mut self) -> bool {
        if self.power.take().is_some() {
            let result = if self.fail_power { Err(PowerError::Exit(Some(1))) } else { Ok(()) };
            self.send(PrintInput::PowerDone(result)).unwrap();
        } else if let Some(plan) = self.motion.take() {
            self.complete_motion(plan);
        } else if self.timer.take().is_some() {
            self.send(PrintInput::TimerElapsed).unwrap();
        } else if self.seq.step() == PrintStep::AwaitingSolutionDispense {
            self.send(PrintInput::SolutionDispensed).unwrap();
        } else {
            return false;
        }
        true
    }

    fn run_until(&mut self, done: impl Fn(&Driver) -> bool) {
        while !done(self) && self.step() {}
    }

    fn run_to_end(&mut self) {
        self.run_until(|d| d.finished.is_some());
    }

    fn starting_layers(&self) -> Vec<usize> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PrintEvent::StartingLayer(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    fn count(&self, event: &PrintEvent) -> usize {
        self.events.iter().filter(|e| *e == event).count()
    }

    fn final_raises(&self) -> usize {
        self.plans.iter().filter(|(step, _)| *step == PrintStep::RaisingFinal).count()
    }
}

fn last_target(plan: &MovementPlan) -> f64 {
    match plan.steps().last() {
        Some(MovementStep::Move { kind: MoveKind::Absolute, distance, .. }) => *distance,
        other => panic!("plan must end with an absolute move, got {:?}", other),
    }
}

fn manifest(dir: &str, layers: usize, tiles: usize, thickness_um: u32) -> LayerManifest {
    LayerManifest {
        directory: dir.into(),
        entries: (0..layers * tiles)
            .map(|i| LayerEntry {
                file_name: format!("{:04}.png", i),
                thickness_um,
                exposure_time_s: None,
            })
            .collect(),
        elements_per_layer: tiles,
    }
}

fn job(base: usize, body: usize, tiles: usize) -> PrintJob {
    let base = (base > 0).then(|| manifest("/jobs/base", base, tiles, 100));
    PrintJob::new(base, manifest("/jobs/body", body, tiles, 50))
}

fn pumping_job(base: usize, body: usize, params: PrintParameters) -> PrintJob {
    let mut job = job(base, body, 1);
    job.base_parameters = params.clone();
    job.body_parameters = params;
    job
}

#[test]
fn test_layer_sequence_covers_every_entry() {
    for (base, body, tiles) in [(2, 3, 1), (0, 4, 1), (1, 2, 2), (2, 2, 3)] {
        let mut driver = Driver::new(job(base, body, tiles));
        driver.send(PrintInput::Start).unwrap();
        driver.run_to_end();

        let total = (base + body) * tiles;
        assert_eq!(driver.starting_layers(), (0..total).collect::<Vec<_>>(), "{base}/{body}x{tiles}");
        assert_eq!(driver.images, (0..total).collect::<Vec<_>>());
        // One lamp cycle per physical layer, tiles share it.
        assert_eq!(driver.count(&PrintEvent::LampStatusChange(true)), base + body);
        assert_eq!(driver.count(&PrintEvent::LampStatusChange(false)), base + body);
        assert_eq!(driver.events.last(), Some(&PrintEvent::PrintComplete(true)));
        assert_eq!(driver.finished, Some(PrintResult::Success));
        assert_eq!(driver.final_raises(), 1);
    }
}

#[test]
fn test_events_follow_setup_order() {
    let mut driver = Driver::new(job(0, 1, 1));
    driver.send(PrintInput::Start).unwrap();
    driver.run_to_end();
    assert_eq!(
        driver.events,
        vec![
            PrintEvent::PrintStarting,
            PrintEvent::RequestDispensePrintSolution,
            PrintEvent::PrintPausable(true),
            PrintEvent::StartingLayer(0),
            PrintEvent::LampStatusChange(true),
            PrintEvent::LampStatusChange(false),
            PrintEvent::PrintPausable(false),
            PrintEvent::PrintComplete(true),
        ]
    );
    assert_eq!(driver.power_levels, vec![50, 0]);
}

#[test]
fn test_first_layer_lowering_uses_build_platform_offset() {
    let mut job = job(0, 2, 1);
    job.build_platform_offset_um = 400;
    let mut driver = Driver::new(job);
    driver.send(PrintInput::Start).unwrap();
    driver.run_until(|d| d.seq.step() == PrintStep::LoweringToFirstLayer);

    let (_, plan) = driver.plans.last().unwrap();
    let motion = MotionConfig::default();
    assert_eq!(
        plan.steps(),
        &[
            MovementStep::Move { kind: MoveKind::Absolute, distance: motion.high_speed_threshold_z, speed: motion.default_high_speed },
            MovementStep::Move { kind: MoveKind::Absolute, distance: 0.45, speed: 50.0 },
            MovementStep::Delay(Duration::from_millis(4000)),
        ]
    );
}

#[test]
fn test_pump_cycle_nets_one_layer() {
    let cases = [(2.0, 50.0), (5.5, 120.0), (0.8, 30.0)];
    for (distance, velocity) in cases {
        let params = PrintParameters {
            pumping_enabled: true,
            pump_up_distance: distance,
            pump_up_velocity: velocity,
            pump_down_velocity: velocity / 2.0,
            ..PrintParameters::default()
        };
        let mut driver = Driver::new(pumping_job(2, 3, params));
        driver.send(PrintInput::Start).unwrap();
        driver.run_to_end();
        assert_eq!(driver.finished, Some(PrintResult::Success));

        let pumps: Vec<&MovementPlan> = driver
            .plans
            .iter()
            .filter(|(step, _)| matches!(step, PrintStep::Pumping(_, PumpStage::Maneuver)))
            .map(|(_, plan)| plan)
            .collect();
        // Four layer changes, the first into base layer 1 and the rest into the body.
        assert_eq!(pumps.len(), 4);
        for (i, plan) in pumps.iter().enumerate() {
            let next_thickness = if i == 0 { 0.1 } else { 0.05 };
            assert_eq!(plan.len(), 4);
            assert!(
                (plan.net_relative_distance() - next_thickness).abs() < 1e-9,
                "pump distance {distance}: net {}",
                plan.net_relative_distance()
            );
        }
    }
}

#[test]
fn test_settle_rise_is_one_layer() {
    let mut driver = Driver::new(job(1, 2, 1));
    driver.send(PrintInput::Start).unwrap();
    driver.run_to_end();
    let rises: Vec<f64> = driver
        .plans
        .iter()
        .filter(|(step, _)| matches!(step, PrintStep::Settling(_, SettleStage::Rise)))
        .map(|(_, plan)| plan.net_relative_distance())
        .collect();
    assert_eq!(rises, vec![0.05, 0.05]);
}

#[test]
fn test_abort_while_paused_skips_projection() {
    let mut driver = Driver::new(job(2, 3, 1));
    driver.send(PrintInput::Start).unwrap();
    driver.run_until(|d| d.starting_layers().contains(&2));
    driver.send(PrintInput::Pause).unwrap();
    driver.run_until(|d| d.seq.is_paused());
    assert!(driver.seq.is_paused());
    assert_eq!(driver.count(&PrintEvent::PrintPaused), 1);

    let before = driver.events.len();
    driver.send(PrintInput::Abort).unwrap();
    driver.run_to_end();

    let after = &driver.events[before..];
    assert_eq!(after.first(), Some(&PrintEvent::PrintResumed));
    assert!(!after.iter().any(|e| matches!(e, PrintEvent::StartingLayer(_))));
    assert_eq!(after.last(), Some(&PrintEvent::PrintAborted));
    assert_eq!(driver.finished, Some(PrintResult::Abort));
    assert_eq!(driver.final_raises(), 1);
}

#[test]
fn test_resume_at_base_checkpoint() {
    let mut driver = Driver::new(job(2, 2, 1));
    driver.send(PrintInput::Start).unwrap();
    driver.run_until(|d| d.starting_layers().contains(&0));
    let layer_z = driver.z;
    driver.send(PrintInput::Pause).unwrap();
    driver.run_until(|d| d.seq.is_paused());

    assert_eq!(
        driver.seq.paused_step(),
        Some(PrintStep::Settling(Phase::Base, SettleStage::PreProjection))
    );
    assert_eq!(driver.seq.current_layer(), 0);
    assert_eq!(driver.pause_z, Some(layer_z));
    assert_eq!(driver.z, MotionConfig::default().maximum_z);

    driver.send(PrintInput::Resume).unwrap();
    driver.run_until(|d| d.starting_layers().len() == 2);
    let (_, lower) = driver.plans.iter().rev().find(|(s, _)| *s == PrintStep::ResumeLowering).unwrap();
    assert_eq!(last_target(lower), layer_z);
    assert_eq!(driver.count(&PrintEvent::PrintResumed), 1);
    assert_eq!(driver.starting_layers(), vec![0, 1]);

    driver.run_to_end();
    assert_eq!(driver.starting_layers(), vec![0, 1, 2, 3]);
    assert_eq!(driver.finished, Some(PrintResult::Success));
}

#[test]
fn test_resume_at_body_checkpoint_returns_to_saved_height() {
    let params = PrintParameters {
        pumping_enabled: true,
        ..PrintParameters::default()
    };
    let mut driver = Driver::new(pumping_job(1, 3, params));
    driver.send(PrintInput::Start).unwrap();
    driver.run_until(|d| matches!(d.seq.step(), PrintStep::Pumping(Phase::Body, PumpStage::Maneuver)));
    driver.send(PrintInput::Pause).unwrap();
    driver.run_until(|d| d.seq.is_paused());

    // The pump maneuver finished, so the pause lands before projecting body layer 2.
    assert_eq!(driver.seq.paused_step(), Some(PrintStep::Projecting(Phase::Body)));
    assert_eq!(driver.seq.current_layer(), 2);
    assert_eq!(driver.starting_layers(), vec![0, 1]);
    let saved_z = driver.pause_z.unwrap();

    driver.send(PrintInput::Resume).unwrap();
    driver.run_until(|d| d.starting_layers().len() == 3);
    let (_, lower) = driver.plans.iter().rev().find(|(s, _)| *s == PrintStep::ResumeLowering).unwrap();
    assert_eq!(last_target(lower), saved_z);
    assert!((driver.z - saved_z).abs() < 1e-9);
    assert_eq!(driver.starting_layers().last(), Some(&2));

    driver.run_to_end();
    assert_eq!(driver.starting_layers(), vec![0, 1, 2, 3]);
    assert_eq!(driver.finished, Some(PrintResult::Success));
}

#[test]
fn test_resume_during_pause_raise_is_deferred() {
    let mut driver = Driver::new(job(0, 3, 1));
    driver.send(PrintInput::Start).unwrap();
    driver.run_until(|d| d.starting_layers().contains(&0));
    driver.send(PrintInput::Pause).unwrap();
    driver.run_until(|d| d.seq.step() == PrintStep::PauseRaising);

    driver.send(PrintInput::Resume).unwrap();
    assert!(matches!(driver.send(PrintInput::Pause), Err(PrintError::InvalidTransition(_))));
    driver.run_to_end();
    assert_eq!(driver.count(&PrintEvent::PrintPaused), 1);
    assert_eq!(driver.count(&PrintEvent::PrintResumed), 1);
    assert_eq!(driver.starting_layers(), vec![0, 1, 2]);
}

#[test]
fn test_pending_pause_cancelled_by_resume() {
    let mut driver = Driver::new(job(0, 3, 1));
    driver.send(PrintInput::Start).unwrap();
    driver.send(PrintInput::Pause).unwrap();
    driver.send(PrintInput::Resume).unwrap();
    driver.run_to_end();
    assert_eq!(driver.count(&PrintEvent::PrintPaused), 0);
    assert_eq!(driver.finished, Some(PrintResult::Success));
}

#[test]
fn test_invalid_requests_are_rejected() {
    let mut driver = Driver::new(job(0, 2, 1));
    assert!(matches!(driver.send(PrintInput::Pause), Err(PrintError::InvalidTransition(_))));
    assert!(matches!(driver.send(PrintInput::Abort), Err(PrintError::InvalidTransition(_))));
    driver.send(PrintInput::Start).unwrap();
    assert!(matches!(driver.send(PrintInput::Resume), Err(PrintError::InvalidTransition(_))));
    driver.run_to_end();
    assert!(matches!(driver.send(PrintInput::Abort), Err(PrintError::InvalidTransition(_))));
}

#[test]
fn test_motion_failure_forces_power_off_and_single_final_raise() {
    let mut driver = Driver::new(job(2, 3, 1));
    driver.send(PrintInput::Start).unwrap();
    driver.run_until(|d| matches!(d.seq.step(), PrintStep::Settling(_, SettleStage::Rise)) && d.seq.current_layer() == 3);
    driver.fail_next_motion = true;
    driver.run_to_end();

    assert_eq!(driver.finished, Some(PrintResult::Failure));
    assert_eq!(driver.events.last(), Some(&PrintEvent::PrintComplete(false)));
    assert_eq!(driver.starting_layers(), vec![0, 1, 2]);
    // The lamp was already off, yet the final raise still switches power off.
    assert_eq!(driver.forced_off, 1);
    assert_eq!(driver.count(&PrintEvent::LampStatusChange(false)), 3);
    assert_eq!(driver.final_raises(), 1);
}

#[test]
fn test_power_failure_is_not_fatal() {
    let mut driver = Driver::new(job(1, 1, 1));
    driver.fail_power = true;
    driver.send(PrintInput::Start).unwrap();
    driver.run_to_end();
    assert_eq!(driver.finished, Some(PrintResult::Success));
    assert_eq!(driver.starting_layers(), vec![0, 1]);
    // One forced off per failed switch-off, plus the final raise.
    assert_eq!(driver.forced_off, 3);
}

#[test]
fn test_abort_during_exposure_turns_lamp_off() {
    let mut driver = Driver::new(job(0, 3, 1));
    driver.send(PrintInput::Start).unwrap();
    driver.run_until(|d| matches!(d.seq.step(), PrintStep::Exposing(_)));
    assert!(driver.seq.lamp_on());

    driver.send(PrintInput::Abort).unwrap();
    assert!(driver.timer.is_none());
    assert_eq!(driver.seq.step(), PrintStep::RaisingFinal);
    assert!(!driver.seq.lamp_on());
    driver.run_to_end();

    assert_eq!(driver.count(&PrintEvent::LampStatusChange(false)), 1);
    assert_eq!(driver.events.last(), Some(&PrintEvent::PrintAborted));
    assert_eq!(driver.finished, Some(PrintResult::Abort));
}

#[test]
fn test_abort_during_motion_waits_for_completion() {
    let mut driver = Driver::new(job(0, 3, 1));
    driver.send(PrintInput::Start).unwrap();
    assert_eq!(driver.seq.step(), PrintStep::RaisingHome);
    driver.send(PrintInput::Abort).unwrap();
    assert!(driver.motion_aborted);
    assert_eq!(driver.seq.step(), PrintStep::RaisingHome);

    driver.run_to_end();
    assert_eq!(driver.finished, Some(PrintResult::Abort));
    assert_eq!(driver.final_raises(), 1);
    assert!(driver.starting_layers().is_empty());
}

#[test]
fn test_image_failure_aborts() {
    let mut driver = Driver::new(job(0, 3, 1));
    driver.fail_image = Some(1);
    driver.send(PrintInput::Start).unwrap();
    driver.run_to_end();
    assert_eq!(driver.starting_layers(), vec![0]);
    assert_eq!(driver.finished, Some(PrintResult::Abort));
    assert_eq!(driver.events.last(), Some(&PrintEvent::PrintAborted));
    assert_eq!(driver.final_raises(), 1);
}

#[test]
fn test_tile_image_failure_switches_lamp_off() {
    let mut driver = Driver::new(job(0, 2, 2));
    driver.fail_image = Some(1);
    driver.send(PrintInput::Start).unwrap();
    driver.run_to_end();
    assert_eq!(driver.starting_layers(), vec![0, 1]);
    assert_eq!(driver.count(&PrintEvent::LampStatusChange(true)), 1);
    assert_eq!(driver.count(&PrintEvent::LampStatusChange(false)), 1);
    assert_eq!(driver.finished, Some(PrintResult::Abort));
}
