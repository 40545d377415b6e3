// src/printer.rs - Builds the control stack from configuration
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::display::{HeadlessDisplay, LayerDisplay};
use crate::hardware::link::{FirmwareLink, LinkError, LinkSettings};
use crate::hardware::serial::SerialTransport;
use crate::hardware::sim::SimulatedFirmware;
use crate::hardware::transport::Transport;
use crate::motion::MotionSequencer;
use crate::print::{ControllerSettings, PrintController, PrintHandle};
use crate::projector::{PowerCommandRunner, ProjectorPower, SimulatedProjector};

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Firmware link error: {0}")]
    Link(#[from] LinkError),
}

pub struct Printer {
    config: Config,
    link: FirmwareLink,
    print: PrintHandle,
}

impl Printer {
    /// Build the printer with the transport and projector selected by `config`.
    pub async fn new(config: Config) -> Result<Self, PrinterError> {
        let projector: Arc<dyn ProjectorPower> = if config.projector.simulate {
            tracing::info!("Using simulated projector");
            Arc::new(SimulatedProjector::new())
        } else {
            Arc::new(PowerCommandRunner::new(
                &config.projector.power_command,
                Duration::from_millis(config.projector.timeout_ms),
            ))
        };
        let display: Arc<dyn LayerDisplay> = Arc::new(HeadlessDisplay::new(config.display.require_images));

        if config.firmware.simulate {
            tracing::info!("Using simulated firmware");
            let mut transport = SimulatedFirmware::new(config.firmware.simulator.clone(), config.firmware.platform_axis);
            Self::with_parts(config, &mut transport, projector, display).await
        } else {
            tracing::info!("Firmware: {} @ {} baud", config.firmware.port, config.firmware.baud);
            let mut transport = SerialTransport::new(&config.firmware.port, config.firmware.baud);
            Self::with_parts(config, &mut transport, projector, display).await
        }
    }

    /// Build the printer around explicitly supplied hardware.
    pub async fn with_parts(
        config: Config,
        transport: &mut dyn Transport,
        projector: Arc<dyn ProjectorPower>,
        display: Arc<dyn LayerDisplay>,
    ) -> Result<Self, PrinterError> {
        config.validate()?;
        let link = FirmwareLink::open(transport, LinkSettings::from(&config.firmware)).await?;
        let motion = MotionSequencer::new(
            link.clone(),
            config.firmware.position_feedback,
            config.motion.position_tolerance,
        );
        let print = PrintController::spawn(link.clone(), motion, projector, display, ControllerSettings::from(&config));
        Ok(Self { config, link, print })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn link(&self) -> &FirmwareLink {
        &self.link
    }

    pub fn print(&self) -> &PrintHandle {
        &self.print
    }

    /// Drop any active job and close the firmware link.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down printer");
        if let Err(e) = self.print.terminate().await {
            tracing::warn!("Failed to terminate print controller: {}", e);
        }
        self.link.close();
    }
}
