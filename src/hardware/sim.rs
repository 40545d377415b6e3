// src/hardware/sim.rs - In-process simulated printer firmware
//! Answers the same wire protocol as the real controller: boot banner after a
//! reset pulse, `ok` per command, position and temperature reports, and
//! timed moves. Write completions are reported in random chunk sizes.

use crate::config::{PlatformAxis, SimulatorConfig};
use crate::hardware::protocol::LineBuffer;
use crate::hardware::transport::{DeviceChannels, Transport, TransportChannels, TransportError, TransportEvent, TransportRequest};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

const STEPS_PER_MM: f64 = 400.0;
const HOMING_SPEED: f64 = 300.0;

/// Every command line the simulated firmware received, in order.
#[derive(Debug, Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<String>>>);

impl CommandLog {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn count_matching(&self, prefix: &str) -> usize {
        self.lines().iter().filter(|l| l.starts_with(prefix)).count()
    }

    fn push(&self, line: &str) {
        if let Ok(mut lines) = self.0.lock() {
            lines.push(line.to_string());
        }
    }
}

pub struct SimulatedFirmware {
    config: SimulatorConfig,
    axis: PlatformAxis,
    log: CommandLog,
}

impl SimulatedFirmware {
    pub fn new(config: SimulatorConfig, axis: PlatformAxis) -> Self {
        Self {
            config,
            axis,
            log: CommandLog::default(),
        }
    }

    pub fn command_log(&self) -> CommandLog {
        self.log.clone()
    }
}

#[async_trait]
impl Transport for SimulatedFirmware {
    async fn connect(&mut self) -> Result<TransportChannels, TransportError> {
        tracing::info!("Starting simulated firmware");
        let (channels, device) = TransportChannels::pair();
        let machine = SimMachine::new(self.config.clone(), self.axis, self.log.clone());
        tokio::spawn(machine.run(device));
        Ok(channels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Positioning {
    Absolute,
    Relative,
}

struct SimMachine {
    config: SimulatorConfig,
    axis: PlatformAxis,
    log: CommandLog,
    booted: bool,
    halted: bool,
    boot_at: Option<Instant>,
    mode: Positioning,
    z: f64,
    busy_until: Instant,
    bed: f64,
    bed_target: f64,
    auto_report: Option<Duration>,
    next_report: Option<Instant>,
    moves_seen: usize,
    outbox: VecDeque<(Instant, String)>,
    input: LineBuffer,
}

impl SimMachine {
    fn new(config: SimulatorConfig, axis: PlatformAxis, log: CommandLog) -> Self {
        Self {
            config,
            axis,
            log,
            booted: false,
            halted: false,
            boot_at: None,
            mode: Positioning::Absolute,
            z: 0.0,
            busy_until: Instant::now(),
            bed: 20.0,
            bed_target: 0.0,
            auto_report: None,
            next_report: None,
            moves_seen: 0,
            outbox: VecDeque::new(),
            input: LineBuffer::new(),
        }
    }

    async fn run(mut self, mut device: DeviceChannels) {
        loop {
            let due = self.outbox.front().map(|(at, _)| *at);
            tokio::select! {
                request = device.requests.recv() => match request {
                    Some(TransportRequest::SetReset(true)) => self.hold_in_reset(),
                    Some(TransportRequest::SetReset(false)) => {
                        self.boot_at = Some(Instant::now() + Duration::from_millis(self.config.boot_delay_ms));
                    }
                    Some(TransportRequest::Write(bytes)) => {
                        self.report_written(bytes.len(), &device);
                        for line in self.input.push(&bytes) {
                            self.execute(&line);
                        }
                    }
                    None => break,
                },
                _ = at_deadline(self.boot_at) => {
                    self.boot_at = None;
                    self.boot();
                }
                _ = at_deadline(due) => {
                    if let Some((_, line)) = self.outbox.pop_front() {
                        if device.events.send(TransportEvent::Line(line)).is_err() {
                            break;
                        }
                    }
                }
                _ = at_deadline(self.next_report) => {
                    let line = self.temperature_line();
                    self.respond_now(line);
                    self.next_report = self.auto_report.map(|interval| Instant::now() + interval);
                }
            }
        }
        tracing::debug!("Simulated firmware stopped");
    }

    fn hold_in_reset(&mut self) {
        tracing::debug!("Simulated firmware held in reset");
        self.booted = false;
        self.halted = false;
        self.boot_at = None;
        self.outbox.clear();
        self.input = LineBuffer::new();
        self.auto_report = None;
        self.next_report = None;
        self.mode = Positioning::Absolute;
        self.busy_until = Instant::now();
    }

    fn boot(&mut self) {
        self.booted = true;
        self.respond_now("start".to_string());
        let version = format!("echo: Last Updated: 2024-01-01 | Author: {}; simulated", self.config.firmware_author);
        self.respond_now(version);
    }

    fn report_written(&self, total: usize, device: &DeviceChannels) {
        let max_chunk = self.config.max_write_chunk.max(1);
        let mut rng = rand::rng();
        let mut remaining = total;
        while remaining > 0 {
            let chunk = rng.random_range(1..=max_chunk).min(remaining);
            let _ = device.events.send(TransportEvent::Written(chunk));
            remaining -= chunk;
        }
    }

    fn execute(&mut self, line: &str) {
        if !self.booted || self.halted {
            tracing::trace!("Simulated firmware dropped '{}'", line);
            return;
        }
        self.log.push(line);
        let mut words = line.split_whitespace();
        let Some(code) = words.next() else { return };
        let params: Vec<(char, f64)> = words
            .filter_map(|w| {
                let mut chars = w.chars();
                let letter = chars.next()?;
                Some((letter, chars.as_str().parse().unwrap_or(0.0)))
            })
            .collect();
        let param = |letter: char| params.iter().find(|(l, _)| *l == letter).map(|(_, v)| *v);

        match code {
            "G90" => self.mode = Positioning::Absolute,
            "G91" => self.mode = Positioning::Relative,
            "G0" | "G1" => {
                self.moves_seen += 1;
                if self.config.fail_on_move == Some(self.moves_seen) {
                    tracing::warn!("Simulated firmware failing move {}", self.moves_seen);
                    self.halted = true;
                    self.respond_now("Error:Printer halted. kill() called!".to_string());
                    return;
                }
                let target = match (self.mode, param('Z')) {
                    (Positioning::Absolute, Some(z)) => z,
                    (Positioning::Relative, Some(dz)) => self.z + dz,
                    (_, None) => self.z,
                };
                let speed = param('F').filter(|f| *f > 0.0).unwrap_or(HOMING_SPEED);
                self.travel_to(target, speed);
            }
            "G28" => self.travel_to(0.0, HOMING_SPEED),
            "M400" => {
                let at = self.busy_until.max(self.last_scheduled());
                self.respond_at(at, "ok".to_string());
                return;
            }
            "M114" => {
                let line = self.position_line();
                self.respond_now(line);
            }
            "M105" => {
                let line = format!("ok {}", self.temperature_line());
                self.respond_now(line);
                return;
            }
            "M140" => {
                self.bed_target = param('S').unwrap_or(0.0);
                self.bed = self.bed_target.max(self.bed);
            }
            "M155" => {
                let seconds = param('S').unwrap_or(0.0);
                self.auto_report = (seconds > 0.0).then(|| Duration::from_secs_f64(seconds));
                self.next_report = self.auto_report.map(|interval| Instant::now() + interval);
            }
            "M18" => {}
            other => self.respond_now(format!("echo:Unknown command: \"{}\"", other)),
        }
        self.respond_now("ok".to_string());
    }

    fn travel_to(&mut self, target: f64, speed_mm_per_min: f64) {
        let distance = (target - self.z).abs();
        let seconds = distance / (speed_mm_per_min / 60.0) * self.config.move_time_scale.max(0.0);
        let start = self.busy_until.max(Instant::now());
        self.busy_until = start + Duration::from_secs_f64(seconds);
        self.z = target;
    }

    fn position_line(&self) -> String {
        let steps = (self.z * STEPS_PER_MM).round() as i64;
        let (x, y, z) = match self.axis {
            PlatformAxis::X => ((self.z, steps), (0.0, 0), (0.0, 0)),
            PlatformAxis::Y => ((0.0, 0), (self.z, steps), (0.0, 0)),
            PlatformAxis::Z => ((0.0, 0), (0.0, 0), (self.z, steps)),
        };
        format!(
            "X:{:.2} Y:{:.2} Z:{:.2} E:0.00 Count X:{} Y:{} Z:{}",
            x.0, y.0, z.0, x.1, y.1, z.1
        )
    }

    fn temperature_line(&self) -> String {
        let pwm = if self.bed < self.bed_target { 127 } else { 0 };
        format!(
            "T:{:.2} /0.00 B:{:.2} /{:.2} @:0 B@:{}",
            self.bed, self.bed, self.bed_target, pwm
        )
    }

    fn last_scheduled(&self) -> Instant {
        self.outbox.back().map(|(at, _)| *at).unwrap_or_else(Instant::now)
    }

    /// Replies keep wire order: nothing overtakes a reply still waiting on a move.
    fn respond_now(&mut self, line: String) {
        let at = self.last_scheduled().max(Instant::now());
        self.respond_at(at, line);
    }

    fn respond_at(&mut self, at: Instant, line: String) {
        self.outbox.push_back((at, line));
    }
}

async fn at_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
