// src/hardware/command.rs - Firmware commands and their grouping into complex commands
use std::collections::VecDeque;
use std::fmt;

/// A single G-code instruction understood by the printer firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    AbsolutePositioning,
    RelativePositioning,
    LinearMove,
    MoveHome,
    FinishMoves,
    DisableSteppers,
    SetBedTemperature,
    TemperatureAutoReport,
    ReportTemperatures,
    ReportPosition,
}

impl CommandKind {
    /// Number of numeric arguments the command consumes.
    pub fn arity(self) -> usize {
        match self {
            CommandKind::LinearMove => 2,
            CommandKind::SetBedTemperature | CommandKind::TemperatureAutoReport => 1,
            _ => 0,
        }
    }

    /// Render the wire line for this command, without the trailing newline.
    pub fn encode(self, args: &[f64]) -> String {
        let arg = |i: usize| args.get(i).copied().unwrap_or_default();
        match self {
            CommandKind::AbsolutePositioning => "G90".to_string(),
            CommandKind::RelativePositioning => "G91".to_string(),
            CommandKind::LinearMove => format!("G0 Z{:.2} F{:.2}", arg(0), arg(1)),
            CommandKind::MoveHome => "G28 Z".to_string(),
            CommandKind::FinishMoves => "M400".to_string(),
            CommandKind::DisableSteppers => "M18".to_string(),
            CommandKind::SetBedTemperature => format!("M140 S{:.2}", arg(0)),
            CommandKind::TemperatureAutoReport => format!("M155 S{:.2}", arg(0)),
            CommandKind::ReportTemperatures => "M105".to_string(),
            CommandKind::ReportPosition => "M114".to_string(),
        }
    }
}

/// One queued instruction together with its write progress.
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareCommand {
    pub kind: CommandKind,
    pub args: Vec<f64>,
    line: String,
    pub sent: bool,
}

impl FirmwareCommand {
    pub fn new(kind: CommandKind, args: Vec<f64>) -> Self {
        let mut line = kind.encode(&args);
        line.push('\n');
        Self {
            kind,
            args,
            line,
            sent: false,
        }
    }

    /// Wire bytes including the terminating newline.
    pub fn wire_bytes(&self) -> &[u8] {
        self.line.as_bytes()
    }

    pub fn encoded_len(&self) -> usize {
        self.line.len()
    }
}

impl fmt::Display for FirmwareCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.line.trim_end())
    }
}

/// Semantic printer actions, each expanded into an ordered list of firmware commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComplexCommandKind {
    MoveAbsolute,
    MoveRelative,
    MoveHome,
    SetTemperature,
    ReportTemperatures,
    ReportPosition,
    Initialize,
    DisableSteppers,
}

impl ComplexCommandKind {
    pub fn subcommands(self) -> &'static [CommandKind] {
        use CommandKind::*;
        match self {
            ComplexCommandKind::MoveAbsolute => &[AbsolutePositioning, LinearMove, FinishMoves, ReportPosition],
            ComplexCommandKind::MoveRelative => &[RelativePositioning, LinearMove, FinishMoves, ReportPosition],
            ComplexCommandKind::MoveHome => &[MoveHome, FinishMoves, ReportPosition],
            ComplexCommandKind::SetTemperature => &[SetBedTemperature],
            ComplexCommandKind::ReportTemperatures => &[ReportTemperatures],
            ComplexCommandKind::ReportPosition => &[ReportPosition],
            ComplexCommandKind::Initialize => &[TemperatureAutoReport],
            ComplexCommandKind::DisableSteppers => &[DisableSteppers],
        }
    }

    /// Total arguments expected across all sub-commands.
    pub fn arity(self) -> usize {
        self.subcommands().iter().map(|k| k.arity()).sum()
    }
}

/// A complex command in flight: the sub-commands still awaiting acknowledgment, in order.
#[derive(Debug, Clone)]
pub struct ComplexCommand {
    pub kind: ComplexCommandKind,
    remaining: VecDeque<CommandKind>,
}

impl ComplexCommand {
    /// Split `args` across the sub-commands by arity and build the wire commands.
    pub fn build(kind: ComplexCommandKind, args: &[f64]) -> (Self, Vec<FirmwareCommand>) {
        let mut offset = 0;
        let mut commands = Vec::with_capacity(kind.subcommands().len());
        for &sub in kind.subcommands() {
            let end = (offset + sub.arity()).min(args.len());
            commands.push(FirmwareCommand::new(sub, args[offset.min(end)..end].to_vec()));
            offset = end;
        }
        let complex = Self {
            kind,
            remaining: kind.subcommands().iter().copied().collect(),
        };
        (complex, commands)
    }

    pub fn expected(&self) -> Option<CommandKind> {
        self.remaining.front().copied()
    }

    pub fn pop_next_subcommand(&mut self) -> Option<CommandKind> {
        self.remaining.pop_front()
    }

    pub fn is_finished(&self) -> bool {
        self.remaining.is_empty()
    }
}
