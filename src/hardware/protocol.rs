//! Parsing of inbound firmware lines.
//!
//! The firmware speaks a newline-terminated text protocol. Acknowledgments start
//! with `ok`, errors with `Error`, and telemetry may arrive either inline after an
//! `ok` or as an unsolicited auto-report.

use crate::config::PlatformAxis;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static POSITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"X:\s*(-?[\d.]+)\s+Y:\s*(-?[\d.]+)\s+Z:\s*(-?[\d.]+)\s+E:\s*(-?[\d.]+)\s+Count\s+X:\s*(-?\d+)\s+Y:\s*(-?\d+)\s+Z:\s*(-?\d+)",
    )
    .expect("position pattern compiles")
});

static TEMPERATURE_BED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"T:\s*(-?[\d.]+)\s*/\s*(-?[\d.]+)\s+B:\s*(-?[\d.]+)\s*/\s*(-?[\d.]+)\s+@:\s*(-?\d+)\s+B@:\s*(-?\d+)",
    )
    .expect("temperature pattern compiles")
});

static TEMPERATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"T:\s*(-?[\d.]+)\s*/\s*(-?[\d.]+)\s+@:\s*(-?\d+)").expect("temperature pattern compiles")
});

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"echo:.*?Author:\s*(.+?)(?:\s|;|$)").expect("version pattern compiles"));

const BOOT_TOKENS: [&str; 3] = ["start", "Grbl", "ok"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionReport {
    pub z: f64,
    pub step_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureReport {
    pub bed: f64,
    pub target: f64,
    pub pwm: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FirmwareLine {
    /// Acknowledgment, optionally carrying an inline temperature report.
    Ok { temperature: Option<TemperatureReport> },
    Position(PositionReport),
    Temperature(TemperatureReport),
    Version(String),
    Error(String),
    Echo(String),
    Other(String),
}

impl FirmwareLine {
    pub fn parse(line: &str, axis: PlatformAxis) -> Self {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("ok") {
            return FirmwareLine::Ok {
                temperature: parse_temperature(rest),
            };
        }
        if line.starts_with("Error") {
            return FirmwareLine::Error(line.to_string());
        }
        if line.starts_with("echo:") {
            return match VERSION_RE.captures(line) {
                Some(caps) => FirmwareLine::Version(caps[1].to_string()),
                None => FirmwareLine::Echo(line.to_string()),
            };
        }
        if let Some(position) = parse_position(line, axis) {
            return FirmwareLine::Position(position);
        }
        if let Some(temperature) = parse_temperature(line) {
            return FirmwareLine::Temperature(temperature);
        }
        FirmwareLine::Other(line.to_string())
    }
}

pub fn is_boot_banner(line: &str) -> bool {
    let line = line.trim_start();
    BOOT_TOKENS.iter().any(|token| line.starts_with(token))
}

pub fn parse_position(line: &str, axis: PlatformAxis) -> Option<PositionReport> {
    let caps = POSITION_RE.captures(line)?;
    let (value, count) = match axis {
        PlatformAxis::X => (1, 5),
        PlatformAxis::Y => (2, 6),
        PlatformAxis::Z => (3, 7),
    };
    Some(PositionReport {
        z: caps[value].parse().ok()?,
        step_count: caps[count].parse().ok()?,
    })
}

/// Accepts both the bed-channel variant and the hotend-only variant.
pub fn parse_temperature(line: &str) -> Option<TemperatureReport> {
    if let Some(caps) = TEMPERATURE_BED_RE.captures(line) {
        return Some(TemperatureReport {
            bed: caps[3].parse().ok()?,
            target: caps[4].parse().ok()?,
            pwm: caps[6].parse().ok()?,
        });
    }
    let caps = TEMPERATURE_RE.captures(line)?;
    Some(TemperatureReport {
        bed: caps[1].parse().ok()?,
        target: caps[2].parse().ok()?,
        pwm: caps[3].parse().ok()?,
    })
}

/// Reassembles newline-terminated lines from arbitrarily chunked reads.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                if !line.is_empty() {
                    lines.push(line);
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }
}
