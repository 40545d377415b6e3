//! Firmware link: command queueing, acknowledgment matching and reset handling.
//!
//! [`LinkCore`] holds the protocol state and is driven synchronously: it is fed
//! transport events and returns [`LinkAction`]s. [`FirmwareLink`] is the cloneable
//! async handle; a driver task owns the core and executes its actions.

use crate::config::{FirmwareConfig, PlatformAxis};
use crate::hardware::command::{CommandKind, ComplexCommand, ComplexCommandKind, FirmwareCommand};
use crate::hardware::protocol::{FirmwareLine, PositionReport, TemperatureReport, is_boot_banner};
use crate::hardware::transport::{Transport, TransportError, TransportEvent, TransportRequest};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("Firmware link is offline")]
    Offline,
    #[error("Firmware link is closed")]
    Closed,
    #[error("Firmware link was reset before the command completed")]
    Reset,
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<TransportError> for LinkError {
    fn from(e: TransportError) -> Self {
        LinkError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Online,
    Offline,
    PositionReport(PositionReport),
    TemperatureReport(TemperatureReport),
    FirmwareVersion(String),
    ProtocolError(String),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Resetting,
    AwaitingBanner,
    Online,
    Closed,
}

/// Snapshot published to observers after every link event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub online: bool,
    pub closed: bool,
    pub position: Option<PositionReport>,
    pub temperature: Option<TemperatureReport>,
    pub firmware_version: Option<String>,
}

/// Identifies one enqueued complex command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandTicket(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    Transport(TransportRequest),
    /// Hold the reset line asserted, then call [`LinkCore::release_reset`].
    StartResetHold,
    Emit(LinkEvent),
    Complete(CommandTicket, Result<(), LinkError>),
}

/// Shortest reset pulse the controller board reliably reboots on.
pub const MIN_RESET_HOLD: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub reset_hold: Duration,
    pub platform_axis: PlatformAxis,
    pub auto_report_interval_s: u32,
}

impl From<&FirmwareConfig> for LinkSettings {
    fn from(config: &FirmwareConfig) -> Self {
        Self {
            reset_hold: config.reset_hold(),
            platform_axis: config.platform_axis,
            auto_report_interval_s: config.auto_report_interval_s,
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings::from(&FirmwareConfig::default())
    }
}

struct InFlight {
    ticket: CommandTicket,
    command: ComplexCommand,
}

pub struct LinkCore {
    settings: LinkSettings,
    state: LinkState,
    cmd_queue: VecDeque<FirmwareCommand>,
    complex_queue: VecDeque<InFlight>,
    write_count: usize,
    next_ticket: u64,
    position: Option<PositionReport>,
    temperature: Option<TemperatureReport>,
    firmware_version: Option<String>,
}

impl LinkCore {
    pub fn new(settings: LinkSettings) -> Self {
        Self {
            settings,
            state: LinkState::Resetting,
            cmd_queue: VecDeque::new(),
            complex_queue: VecDeque::new(),
            write_count: 0,
            next_ticket: 0,
            position: None,
            temperature: None,
            firmware_version: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn queued_commands(&self) -> usize {
        self.cmd_queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.complex_queue.len()
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.state,
            online: self.state == LinkState::Online,
            closed: self.state == LinkState::Closed,
            position: self.position,
            temperature: self.temperature,
            firmware_version: self.firmware_version.clone(),
        }
    }

    /// Start the boot handshake: assert reset and wait for the hold to elapse.
    pub fn open(&mut self) -> Vec<LinkAction> {
        self.state = LinkState::Resetting;
        vec![
            LinkAction::Transport(TransportRequest::SetReset(true)),
            LinkAction::StartResetHold,
        ]
    }

    pub fn release_reset(&mut self) -> Vec<LinkAction> {
        if self.state != LinkState::Resetting {
            return Vec::new();
        }
        self.state = LinkState::AwaitingBanner;
        tracing::debug!("Reset released, awaiting boot banner");
        vec![LinkAction::Transport(TransportRequest::SetReset(false))]
    }

    pub fn enqueue(
        &mut self,
        kind: ComplexCommandKind,
        args: &[f64],
    ) -> Result<(CommandTicket, Vec<LinkAction>), LinkError> {
        match self.state {
            LinkState::Closed => return Err(LinkError::Closed),
            LinkState::Resetting | LinkState::AwaitingBanner => return Err(LinkError::Offline),
            LinkState::Online => {}
        }
        let ticket = CommandTicket(self.next_ticket);
        self.next_ticket += 1;

        let (complex, commands) = ComplexCommand::build(kind, args);
        let mut bytes = Vec::new();
        for command in commands {
            tracing::debug!("Queueing {} for {:?}", command, kind);
            bytes.extend_from_slice(command.wire_bytes());
            self.cmd_queue.push_back(command);
        }
        self.complex_queue.push_back(InFlight { ticket, command: complex });
        Ok((ticket, vec![LinkAction::Transport(TransportRequest::Write(bytes))]))
    }

    /// Account written bytes against unsent commands in FIFO order.
    pub fn on_written(&mut self, count: usize) {
        if self.state != LinkState::Online {
            return;
        }
        self.write_count += count;
        for command in self.cmd_queue.iter_mut().filter(|c| !c.sent) {
            if self.write_count < command.encoded_len() {
                break;
            }
            self.write_count -= command.encoded_len();
            command.sent = true;
        }
    }

    pub fn on_line(&mut self, line: &str) -> Vec<LinkAction> {
        match self.state {
            LinkState::Closed | LinkState::Resetting => {
                tracing::trace!("Ignoring line while {:?}: {}", self.state, line);
                Vec::new()
            }
            LinkState::AwaitingBanner => {
                if is_boot_banner(line) {
                    self.come_online()
                } else {
                    tracing::debug!("Boot noise: {}", line);
                    Vec::new()
                }
            }
            LinkState::Online => self.on_online_line(line),
        }
    }

    fn come_online(&mut self) -> Vec<LinkAction> {
        tracing::info!("Firmware online");
        self.state = LinkState::Online;
        let mut actions = vec![LinkAction::Emit(LinkEvent::Online)];
        let interval = self.settings.auto_report_interval_s as f64;
        if let Ok((_, init)) = self.enqueue(ComplexCommandKind::Initialize, &[interval]) {
            actions.extend(init);
        }
        actions
    }

    fn on_online_line(&mut self, line: &str) -> Vec<LinkAction> {
        match FirmwareLine::parse(line, self.settings.platform_axis) {
            FirmwareLine::Ok { temperature } => self.acknowledge(temperature),
            FirmwareLine::Error(message) => {
                tracing::error!("Firmware reported error: {}", message);
                self.fault(message)
            }
            FirmwareLine::Position(position) => {
                self.position = Some(position);
                vec![LinkAction::Emit(LinkEvent::PositionReport(position))]
            }
            FirmwareLine::Temperature(temperature) => {
                self.temperature = Some(temperature);
                vec![LinkAction::Emit(LinkEvent::TemperatureReport(temperature))]
            }
            FirmwareLine::Version(version) => {
                tracing::info!("Firmware version: {}", version);
                self.firmware_version = Some(version.clone());
                vec![LinkAction::Emit(LinkEvent::FirmwareVersion(version))]
            }
            FirmwareLine::Echo(text) => {
                tracing::debug!("Firmware echo: {}", text);
                Vec::new()
            }
            FirmwareLine::Other(text) if is_boot_banner(&text) => {
                self.fault(format!("unexpected firmware restart: {}", text))
            }
            FirmwareLine::Other(text) => {
                tracing::debug!("Unrecognized firmware line: {}", text);
                Vec::new()
            }
        }
    }

    fn acknowledge(&mut self, temperature: Option<TemperatureReport>) -> Vec<LinkAction> {
        let Some(head) = self.cmd_queue.front() else {
            tracing::warn!("Spurious acknowledgment with no command queued");
            return Vec::new();
        };
        if !head.sent {
            tracing::warn!("Spurious acknowledgment before '{}' was fully written", head);
            return Vec::new();
        }
        let head_kind = head.kind;

        // M105 must be acknowledged with its report. Other acks may carry telemetry, which is dropped.
        let expects_report = head_kind == CommandKind::ReportTemperatures;
        if expects_report && temperature.is_none() {
            return self.fault(format!("acknowledgment does not match '{}'", head));
        }
        let temperature = temperature.filter(|_| expects_report);
        let expected = self.complex_queue.front().and_then(|f| f.command.expected());
        if expected != Some(head_kind) {
            return self.fault(format!("acknowledged {:?} while {:?} was expected", head_kind, expected));
        }

        let mut actions = Vec::new();
        if let Some(temperature) = temperature {
            self.temperature = Some(temperature);
            actions.push(LinkAction::Emit(LinkEvent::TemperatureReport(temperature)));
        }
        self.cmd_queue.pop_front();
        if let Some(front) = self.complex_queue.front_mut() {
            front.command.pop_next_subcommand();
            if front.command.is_finished() {
                let ticket = front.ticket;
                self.complex_queue.pop_front();
                actions.push(LinkAction::Complete(ticket, Ok(())));
            }
        }
        actions
    }

    fn fault(&mut self, reason: String) -> Vec<LinkAction> {
        tracing::error!("Protocol fault, resetting link: {}", reason);
        let mut actions = vec![LinkAction::Emit(LinkEvent::ProtocolError(reason))];
        actions.extend(self.reset());
        actions
    }

    /// Flush everything and re-run the boot handshake.
    pub fn reset(&mut self) -> Vec<LinkAction> {
        if self.state == LinkState::Closed {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.state == LinkState::Online {
            actions.push(LinkAction::Emit(LinkEvent::Offline));
        }
        actions.extend(self.flush(LinkError::Reset));
        actions.extend(self.open());
        actions
    }

    pub fn close(&mut self) -> Vec<LinkAction> {
        if self.state == LinkState::Closed {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.state == LinkState::Online {
            actions.push(LinkAction::Emit(LinkEvent::Offline));
        }
        actions.extend(self.flush(LinkError::Closed));
        self.state = LinkState::Closed;
        actions.push(LinkAction::Emit(LinkEvent::Closed));
        actions
    }

    fn flush(&mut self, error: LinkError) -> Vec<LinkAction> {
        if !self.cmd_queue.is_empty() {
            tracing::warn!("Discarding {} queued firmware commands", self.cmd_queue.len());
        }
        self.cmd_queue.clear();
        self.write_count = 0;
        self.complex_queue
            .drain(..)
            .map(|f| LinkAction::Complete(f.ticket, Err(error.clone())))
            .collect()
    }
}

/// A command accepted by the link, resolved once all its sub-commands are acknowledged.
#[derive(Debug)]
pub struct PendingCommand {
    pub ticket: CommandTicket,
    completion: oneshot::Receiver<Result<(), LinkError>>,
}

impl PendingCommand {
    pub async fn wait(self) -> Result<(), LinkError> {
        self.completion.await.unwrap_or(Err(LinkError::Closed))
    }
}

enum LinkRequest {
    Enqueue {
        kind: ComplexCommandKind,
        args: Vec<f64>,
        respond_to: oneshot::Sender<Result<PendingCommand, LinkError>>,
    },
    Reset,
    Close,
}

/// Cloneable handle to the link driver task.
#[derive(Clone)]
pub struct FirmwareLink {
    requests: mpsc::UnboundedSender<LinkRequest>,
    events: broadcast::Sender<LinkEvent>,
    status: watch::Receiver<LinkStatus>,
}

impl FirmwareLink {
    /// Connect the transport and start the boot handshake. Failure to open is final.
    pub async fn open<T: Transport + ?Sized>(transport: &mut T, settings: LinkSettings) -> Result<Self, LinkError> {
        let channels = transport.connect().await.map_err(|e| {
            tracing::error!("Failed to open firmware transport: {}", e);
            LinkError::from(e)
        })?;
        let core = LinkCore::new(settings.clone());
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(256);
        let (status_tx, status_rx) = watch::channel(core.status());

        let driver = LinkDriver {
            core,
            outbound: channels.outbound,
            events: events_tx.clone(),
            status: status_tx,
            responders: HashMap::new(),
            reset_deadline: None,
            reset_hold: settings.reset_hold.max(MIN_RESET_HOLD),
        };
        tokio::spawn(driver.run(channels.inbound, requests_rx));

        Ok(Self {
            requests: requests_tx,
            events: events_tx,
            status: status_rx,
        })
    }

    pub async fn enqueue(&self, kind: ComplexCommandKind, args: &[f64]) -> Result<PendingCommand, LinkError> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(LinkRequest::Enqueue {
                kind,
                args: args.to_vec(),
                respond_to,
            })
            .map_err(|_| LinkError::Closed)?;
        response.await.unwrap_or(Err(LinkError::Closed))
    }

    pub fn request_reset(&self) {
        let _ = self.requests.send(LinkRequest::Reset);
    }

    pub fn close(&self) {
        let _ = self.requests.send(LinkRequest::Close);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    pub async fn wait_online(&self) -> Result<(), LinkError> {
        let mut status = self.status.clone();
        let closed = status
            .wait_for(|s| s.online || s.closed)
            .await
            .map_err(|_| LinkError::Closed)?
            .closed;
        if closed { Err(LinkError::Closed) } else { Ok(()) }
    }
}

struct LinkDriver {
    core: LinkCore,
    outbound: mpsc::UnboundedSender<TransportRequest>,
    events: broadcast::Sender<LinkEvent>,
    status: watch::Sender<LinkStatus>,
    responders: HashMap<CommandTicket, oneshot::Sender<Result<(), LinkError>>>,
    reset_deadline: Option<Instant>,
    reset_hold: Duration,
}

impl LinkDriver {
    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
        mut requests: mpsc::UnboundedReceiver<LinkRequest>,
    ) {
        let actions = self.core.open();
        self.apply(actions);
        self.publish();

        loop {
            let deadline = self.reset_deadline;
            tokio::select! {
                _ = reset_hold_elapsed(deadline) => {
                    self.reset_deadline = None;
                    let actions = self.core.release_reset();
                    self.apply(actions);
                }
                request = requests.recv() => match request {
                    Some(LinkRequest::Enqueue { kind, args, respond_to }) => {
                        let result = match self.core.enqueue(kind, &args) {
                            Ok((ticket, actions)) => {
                                let (tx, completion) = oneshot::channel();
                                self.responders.insert(ticket, tx);
                                self.apply(actions);
                                Ok(PendingCommand { ticket, completion })
                            }
                            Err(e) => Err(e),
                        };
                        let _ = respond_to.send(result);
                    }
                    Some(LinkRequest::Reset) => {
                        tracing::info!("Link reset requested");
                        let actions = self.core.reset();
                        self.apply(actions);
                    }
                    Some(LinkRequest::Close) | None => {
                        self.shutdown();
                        break;
                    }
                },
                event = inbound.recv() => match event {
                    Some(TransportEvent::Line(line)) => {
                        let actions = self.core.on_line(&line);
                        self.apply(actions);
                    }
                    Some(TransportEvent::Written(count)) => self.core.on_written(count),
                    Some(TransportEvent::Closed(reason)) => {
                        tracing::error!("Firmware transport closed: {}", reason.as_deref().unwrap_or("end of stream"));
                        self.shutdown();
                        break;
                    }
                    None => {
                        tracing::error!("Firmware transport dropped its event channel");
                        self.shutdown();
                        break;
                    }
                },
            }
            self.publish();
        }
        tracing::info!("Firmware link driver terminated");
    }

    fn apply(&mut self, actions: Vec<LinkAction>) {
        let mut completions = Vec::new();
        for action in actions {
            match action {
                LinkAction::Transport(request) => {
                    if self.outbound.send(request).is_err() {
                        tracing::debug!("Transport gone, dropping request");
                    }
                }
                LinkAction::StartResetHold => {
                    self.reset_deadline = Some(Instant::now() + self.reset_hold);
                }
                LinkAction::Emit(event) => {
                    let _ = self.events.send(event);
                }
                LinkAction::Complete(ticket, result) => completions.push((ticket, result)),
            }
        }
        if completions.is_empty() {
            return;
        }
        // Waiters must observe the state that completed them.
        self.publish();
        for (ticket, result) in completions {
            if let Some(responder) = self.responders.remove(&ticket) {
                let _ = responder.send(result);
            }
        }
    }

    fn shutdown(&mut self) {
        let actions = self.core.close();
        self.apply(actions);
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(self.core.status());
    }
}

async fn reset_hold_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online_core() -> LinkCore {
        let mut core = LinkCore::new(LinkSettings::default());
        core.open();
        core.release_reset();
        let actions = core.on_line("start");
        assert!(actions.contains(&LinkAction::Emit(LinkEvent::Online)));
        // Initialize: M155 written and acknowledged
        core.on_written("M155 S5.00\n".len());
        core.on_line("ok");
        assert_eq!(core.in_flight(), 0);
        core
    }

    #[test]
    fn test_boot_noise_is_ignored_until_banner() {
        let mut core = LinkCore::new(LinkSettings::default());
        core.open();
        assert!(core.on_line("start").is_empty());
        core.release_reset();
        assert!(core.on_line("echo:SD card ok?").is_empty());
        assert_eq!(core.state(), LinkState::AwaitingBanner);
        core.on_line("Grbl 1.1");
        assert_eq!(core.state(), LinkState::Online);
    }

    #[test]
    fn test_enqueue_while_offline() {
        let mut core = LinkCore::new(LinkSettings::default());
        core.open();
        assert_eq!(core.enqueue(ComplexCommandKind::ReportPosition, &[]).unwrap_err(), LinkError::Offline);
        core.close();
        assert_eq!(core.enqueue(ComplexCommandKind::ReportPosition, &[]).unwrap_err(), LinkError::Closed);
    }

    #[test]
    fn test_write_count_accumulates_across_chunks() {
        let mut core = online_core();
        let (ticket, _) = core.enqueue(ComplexCommandKind::ReportPosition, &[]).unwrap();
        // "M114\n" is five bytes
        core.on_written(2);
        assert!(core.on_line("ok").is_empty());
        core.on_written(3);
        assert_eq!(core.on_line("ok"), vec![LinkAction::Complete(ticket, Ok(()))]);
    }

    #[test]
    fn test_unsent_temperature_ack_is_not_telemetry() {
        let mut core = online_core();
        core.enqueue(ComplexCommandKind::ReportTemperatures, &[]).unwrap();
        assert!(core.on_line("ok T:21.00 /0.00 B:55.00 /60.00 @:0 B@:127").is_empty());
        assert_eq!(core.status().temperature, None);
        assert_eq!(core.queued_commands(), 1);
        assert_eq!(core.state(), LinkState::Online);
    }

    #[test]
    fn test_telemetry_on_plain_ack_is_dropped() {
        let mut core = online_core();
        let (ticket, _) = core.enqueue(ComplexCommandKind::ReportPosition, &[]).unwrap();
        core.on_written("M114\n".len());
        let actions = core.on_line("ok T:21.00 /0.00 B:55.00 /60.00 @:0 B@:127");
        assert_eq!(actions, vec![LinkAction::Complete(ticket, Ok(()))]);
        assert_eq!(core.status().temperature, None);
        assert_eq!(core.state(), LinkState::Online);
    }

    #[test]
    fn test_autoreport_leaves_queue_untouched() {
        let mut core = online_core();
        core.enqueue(ComplexCommandKind::ReportPosition, &[]).unwrap();
        let actions = core.on_line("T:21.00 /0.00 B:40.00 /60.00 @:0 B@:90");
        assert!(matches!(actions[..], [LinkAction::Emit(LinkEvent::TemperatureReport(_))]));
        assert_eq!(core.queued_commands(), 1);
        assert_eq!(core.status().temperature.unwrap().bed, 40.0);
    }

    #[test]
    fn test_error_line_resets_and_fails_tickets() {
        let mut core = online_core();
        let (ticket, _) = core.enqueue(ComplexCommandKind::MoveAbsolute, &[5.0, 100.0]).unwrap();
        let actions = core.on_line("Error:Printer halted. kill() called!");
        assert!(actions.contains(&LinkAction::Emit(LinkEvent::Offline)));
        assert!(actions.contains(&LinkAction::Complete(ticket, Err(LinkError::Reset))));
        assert!(actions.contains(&LinkAction::Transport(TransportRequest::SetReset(true))));
        assert_eq!(core.state(), LinkState::Resetting);
        assert_eq!(core.queued_commands(), 0);
    }
}
