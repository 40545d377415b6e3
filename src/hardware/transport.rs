// src/hardware/transport.rs - Byte pipe underneath the firmware link
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] std::io::Error),
    #[error("Transport closed")]
    Closed,
}

/// Requests from the link to the device side.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportRequest {
    Write(Vec<u8>),
    /// Drive the hardware reset line (DTR on serial controllers).
    SetReset(bool),
}

/// Notifications from the device side.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Line(String),
    /// Some bytes of earlier writes reached the wire. Chunk sizes are arbitrary.
    Written(usize),
    Closed(Option<String>),
}

pub struct TransportChannels {
    pub outbound: mpsc::UnboundedSender<TransportRequest>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportChannels {
    /// Both halves of an in-memory transport: the link side and the device side.
    pub fn pair() -> (Self, DeviceChannels) {
        let (outbound, requests) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        (Self { outbound, inbound }, DeviceChannels { requests, events })
    }
}

/// Device-side ends of an in-memory transport.
pub struct DeviceChannels {
    pub requests: mpsc::UnboundedReceiver<TransportRequest>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send {
    /// Open the underlying device and start its I/O tasks.
    async fn connect(&mut self) -> Result<TransportChannels, TransportError>;
}
