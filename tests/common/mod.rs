//! Shared helpers: a transport whose device side is driven by the test.
#![allow(dead_code)]

use async_trait::async_trait;
use std::time::Duration;
use vatprint_rs::hardware::link::{FirmwareLink, LinkSettings};
use vatprint_rs::hardware::transport::{
    DeviceChannels, Transport, TransportChannels, TransportError, TransportEvent, TransportRequest,
};

pub struct ScriptedTransport {
    channels: Option<TransportChannels>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> Result<TransportChannels, TransportError> {
        self.channels.take().ok_or(TransportError::Closed)
    }
}

/// Let every other task run until the runtime is idle (requires a paused clock).
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn open_link() -> (FirmwareLink, DeviceChannels) {
    open_link_with(LinkSettings::default()).await
}

pub async fn open_link_with(settings: LinkSettings) -> (FirmwareLink, DeviceChannels) {
    let (channels, device) = TransportChannels::pair();
    let mut transport = ScriptedTransport { channels: Some(channels) };
    let link = FirmwareLink::open(&mut transport, settings).await.unwrap();
    (link, device)
}

pub fn line(device: &DeviceChannels, text: &str) {
    device.events.send(TransportEvent::Line(text.to_string())).unwrap();
}

pub async fn expect_reset_pulse(device: &mut DeviceChannels) {
    assert_eq!(device.requests.recv().await, Some(TransportRequest::SetReset(true)));
    assert_eq!(device.requests.recv().await, Some(TransportRequest::SetReset(false)));
}

/// Next write from the link, skipping reset-line changes.
pub async fn expect_write(device: &mut DeviceChannels) -> String {
    loop {
        match device.requests.recv().await {
            Some(TransportRequest::Write(bytes)) => return String::from_utf8(bytes).unwrap(),
            Some(TransportRequest::SetReset(_)) => continue,
            None => panic!("link closed the transport"),
        }
    }
}

/// Report the whole write as sent.
pub fn written(device: &DeviceChannels, text: &str) {
    device.events.send(TransportEvent::Written(text.len())).unwrap();
}

/// Walk a fresh link through reset, banner and the initial auto-report setup.
pub async fn boot(link: &FirmwareLink, device: &mut DeviceChannels) {
    expect_reset_pulse(device).await;
    line(device, "start");
    link.wait_online().await.unwrap();
    let init = expect_write(device).await;
    assert_eq!(init, "M155 S5.00\n");
    written(device, &init);
    line(device, "ok");
    settle().await;
}

pub fn position_line(z: f64) -> String {
    format!("X:{:.2} Y:0.00 Z:0.00 E:0.00 Count X:{} Y:0 Z:0", z, (z * 400.0).round() as i64)
}
