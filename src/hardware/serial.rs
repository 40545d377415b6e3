// src/hardware/serial.rs - Serial port transport
use crate::hardware::protocol::LineBuffer;
use crate::hardware::transport::{Transport, TransportChannels, TransportError, TransportEvent, TransportRequest};
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Serial connection to the printer controller, split into a reader and a writer task.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
}

impl SerialTransport {
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> Result<TransportChannels, TransportError> {
        tracing::info!("Opening serial port {} at {} baud", self.port_name, self.baud_rate);
        let port = SerialPort::open(&self.port_name, self.baud_rate)?;
        let read_port = port.try_clone()?;
        let control = port.try_clone()?;
        let (channels, device) = TransportChannels::pair();

        tokio::spawn(pump_reads(read_port, device.events.clone()));
        tokio::spawn(pump_writes(port, device.requests, device.events, move |asserted| {
            control.set_dtr(asserted)
        }));

        Ok(channels)
    }
}

/// Split incoming bytes into lines until the device closes or the link stops listening.
pub(crate) async fn pump_reads<R>(mut reader: R, events: mpsc::UnboundedSender<TransportEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 256];
    let mut lines = LineBuffer::new();
    loop {
        tokio::select! {
            _ = events.closed() => {
                tracing::debug!("Link dropped, closing serial reader");
                break;
            }
            read = reader.read(&mut buffer) => match read {
                Ok(0) => {
                    tracing::info!("Serial connection closed by remote");
                    let _ = events.send(TransportEvent::Closed(None));
                    break;
                }
                Ok(n) => {
                    tracing::trace!("Read {} bytes from serial", n);
                    for line in lines.push(&buffer[..n]) {
                        tracing::debug!("Serial RX: {}", line);
                        if events.send(TransportEvent::Line(line)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Serial read error: {}", e);
                    let _ = events.send(TransportEvent::Closed(Some(e.to_string())));
                    break;
                }
            },
        }
    }
}

/// Execute link requests, reporting every partial write so the link can account bytes.
pub(crate) async fn pump_writes<W, F>(
    mut writer: W,
    mut requests: mpsc::UnboundedReceiver<TransportRequest>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut set_reset: F,
) where
    W: AsyncWrite + Unpin,
    F: FnMut(bool) -> std::io::Result<()>,
{
    while let Some(request) = requests.recv().await {
        match request {
            TransportRequest::Write(bytes) => {
                tracing::debug!("Serial TX: {}", String::from_utf8_lossy(&bytes).trim_end());
                let mut offset = 0;
                while offset < bytes.len() {
                    match writer.write(&bytes[offset..]).await {
                        Ok(0) => {
                            tracing::error!("Serial port accepted no bytes");
                            let _ = events.send(TransportEvent::Closed(Some("write returned zero bytes".to_string())));
                            return;
                        }
                        Ok(n) => {
                            offset += n;
                            let _ = events.send(TransportEvent::Written(n));
                        }
                        Err(e) => {
                            tracing::error!("Serial write error: {}", e);
                            let _ = events.send(TransportEvent::Closed(Some(e.to_string())));
                            return;
                        }
                    }
                }
            }
            TransportRequest::SetReset(asserted) => {
                if let Err(e) = set_reset(asserted) {
                    tracing::warn!("Failed to set DTR to {}: {}", asserted, e);
                }
            }
        }
    }
    tracing::info!("Serial writer task terminated");
}
