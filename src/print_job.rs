// src/print_job.rs - Print job description: layer manifests and per-phase parameters
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Base,
    Body,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    #[error("Body manifest is empty")]
    EmptyBody,
    #[error("{0:?} manifest declares zero elements per layer")]
    ZeroTiling(Phase),
    #[error("{phase:?} manifest has {entries} entries, not a multiple of {elements_per_layer} elements per layer")]
    PartialLayer {
        phase: Phase,
        entries: usize,
        elements_per_layer: usize,
    },
    #[error("{phase:?} manifest entry {index} has zero thickness")]
    ZeroThickness { phase: Phase, index: usize },
    #[error("{phase:?} power level {level} is outside 0..=100")]
    PowerOutOfRange { phase: Phase, level: f64 },
    #[error("Base and body tiling differ ({base} vs {body} elements per layer)")]
    MixedTiling { base: usize, body: usize },
    #[error("{phase:?} exposure of {seconds} s at entry {index} is outside 0..={max} s", max = MAX_EXPOSURE_S)]
    ExposureOutOfRange { phase: Phase, index: usize, seconds: f64 },
}

/// Longest exposure a single layer or tile may request.
pub const MAX_EXPOSURE_S: f64 = 3600.0;

/// One layer image (or one tile of a layer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerEntry {
    pub file_name: String,
    pub thickness_um: u32,
    /// Per-element exposure for tiled jobs, in seconds.
    #[serde(default)]
    pub exposure_time_s: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerManifest {
    pub directory: PathBuf,
    pub entries: Vec<LayerEntry>,
    #[serde(default = "default_elements_per_layer")]
    pub elements_per_layer: usize,
}

fn default_elements_per_layer() -> usize {
    1
}

impl LayerManifest {
    /// Untiled manifest of `count` layers named `000.png`, `001.png`, ...
    pub fn uniform(directory: impl Into<PathBuf>, count: usize, thickness_um: u32) -> Self {
        Self {
            directory: directory.into(),
            entries: (0..count)
                .map(|i| LayerEntry {
                    file_name: format!("{:03}.png", i),
                    thickness_um,
                    exposure_time_s: None,
                })
                .collect(),
            elements_per_layer: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_tiled(&self) -> bool {
        self.elements_per_layer > 1
    }

    pub fn physical_layer_count(&self) -> usize {
        self.entries.len() / self.elements_per_layer.max(1)
    }
}

/// Exposure and platform-motion settings for one phase. Distances in mm, speeds in mm/min.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintParameters {
    /// Projector power in percent.
    pub power_level: f64,
    pub layer_exposure_time_ms: u64,
    pub pumping_enabled: bool,
    pub pump_up_distance: f64,
    pub pump_up_velocity: f64,
    pub pump_up_pause_ms: u64,
    pub pump_down_velocity: f64,
    pub pump_down_pause_ms: u64,
    pub no_pump_up_velocity: f64,
    pub no_pump_down_velocity: f64,
    pub tiling_default_exposure_s: f64,
    pub tiling_exposure_step_s: f64,
}

impl Default for PrintParameters {
    fn default() -> Self {
        Self {
            power_level: 50.0,
            layer_exposure_time_ms: 1000,
            pumping_enabled: false,
            pump_up_distance: 2.0,
            pump_up_velocity: 50.0,
            pump_up_pause_ms: 1000,
            pump_down_velocity: 50.0,
            pump_down_pause_ms: 1000,
            no_pump_up_velocity: 50.0,
            no_pump_down_velocity: 50.0,
            tiling_default_exposure_s: 2.0,
            tiling_exposure_step_s: 1.0,
        }
    }
}

impl PrintParameters {
    /// The descent always mirrors the ascent so a pump cycle nets one layer.
    pub fn pump_down_distance(&self) -> f64 {
        self.pump_up_distance
    }

    pub fn layer_exposure_time(&self) -> Duration {
        Duration::from_millis(self.layer_exposure_time_ms)
    }

    pub fn pump_up_pause(&self) -> Duration {
        Duration::from_millis(self.pump_up_pause_ms)
    }

    pub fn pump_down_pause(&self) -> Duration {
        Duration::from_millis(self.pump_down_pause_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    #[serde(default)]
    pub base: Option<LayerManifest>,
    pub body: LayerManifest,
    #[serde(default)]
    pub base_parameters: PrintParameters,
    #[serde(default)]
    pub body_parameters: PrintParameters,
    #[serde(default)]
    pub build_platform_offset_um: u32,
    #[serde(default)]
    pub disregard_first_layer_height: bool,
    #[serde(default)]
    pub allow_mixed_tiling: bool,
}

impl PrintJob {
    pub fn new(base: Option<LayerManifest>, body: LayerManifest) -> Self {
        Self {
            base,
            body,
            base_parameters: PrintParameters::default(),
            body_parameters: PrintParameters::default(),
            build_platform_offset_um: 0,
            disregard_first_layer_height: false,
            allow_mixed_tiling: false,
        }
    }

    pub fn has_base_layers(&self) -> bool {
        self.base_layer_count() > 0
    }

    /// Base entries, counting every tile.
    pub fn base_layer_count(&self) -> usize {
        self.base.as_ref().map_or(0, |m| m.len())
    }

    pub fn total_layer_count(&self) -> usize {
        self.base_layer_count() + self.body.len()
    }

    /// Global index of the first body entry.
    pub fn body_layer_start(&self) -> usize {
        self.base_layer_count()
    }

    pub fn phase_of(&self, index: usize) -> Phase {
        if index < self.body_layer_start() { Phase::Base } else { Phase::Body }
    }

    pub fn is_base_layer(&self, index: usize) -> bool {
        self.phase_of(index) == Phase::Base
    }

    pub fn manifest(&self, phase: Phase) -> &LayerManifest {
        match (phase, &self.base) {
            (Phase::Base, Some(base)) => base,
            _ => &self.body,
        }
    }

    pub fn parameters(&self, phase: Phase) -> &PrintParameters {
        match phase {
            Phase::Base => &self.base_parameters,
            Phase::Body => &self.body_parameters,
        }
    }

    pub fn elements_per_layer(&self, phase: Phase) -> usize {
        self.manifest(phase).elements_per_layer.max(1)
    }

    pub fn is_tiled(&self) -> bool {
        self.body.is_tiled() || self.base.as_ref().is_some_and(|m| m.is_tiled())
    }

    /// Position of a global index inside its own phase's manifest.
    fn local(&self, index: usize) -> (Phase, usize) {
        let phase = self.phase_of(index);
        match phase {
            Phase::Base => (phase, index),
            Phase::Body => (phase, index - self.body_layer_start()),
        }
    }

    pub fn entry(&self, index: usize) -> Option<&LayerEntry> {
        let (phase, local) = self.local(index);
        self.manifest(phase).entries.get(local)
    }

    /// Thickness in µm of the entry at `index`.
    pub fn layer_thickness_at(&self, index: usize) -> Option<u32> {
        self.entry(index).map(|e| e.thickness_um)
    }

    pub fn layer_thickness_mm_at(&self, index: usize) -> Option<f64> {
        self.layer_thickness_at(index).map(|um| um as f64 / 1000.0)
    }

    /// Thickness of the first entry of a phase.
    pub fn selected_thickness_um(&self, phase: Phase) -> Option<u32> {
        self.manifest(phase).entries.first().map(|e| e.thickness_um)
    }

    pub fn layer_path(&self, index: usize) -> Option<PathBuf> {
        let (phase, local) = self.local(index);
        let manifest = self.manifest(phase);
        manifest.entries.get(local).map(|e| manifest.directory.join(&e.file_name))
    }

    fn element_exposure_s(&self, index: usize) -> f64 {
        let (phase, local) = self.local(index);
        let params = self.parameters(phase);
        let tile = local % self.elements_per_layer(phase);
        self.entry(index)
            .and_then(|e| e.exposure_time_s)
            .unwrap_or(params.tiling_default_exposure_s + params.tiling_exposure_step_s * tile as f64)
    }

    /// Exposure of a tiled element: the manifest's own timing, else the phase's baseline plus step per tile.
    pub fn element_exposure(&self, index: usize) -> Duration {
        let seconds = self.element_exposure_s(index);
        Duration::try_from_secs_f64(seconds).unwrap_or_else(|e| {
            tracing::warn!("Unusable exposure of {} s for element {}: {}", seconds, index, e);
            Duration::ZERO
        })
    }

    pub fn exposure_for(&self, index: usize) -> Duration {
        let phase = self.phase_of(index);
        if self.manifest(phase).is_tiled() {
            self.element_exposure(index)
        } else {
            self.parameters(phase).layer_exposure_time()
        }
    }

    /// Whether the element after `index` belongs to the same physical layer.
    pub fn has_more_elements(&self, index: usize) -> bool {
        if index + 1 >= self.total_layer_count() {
            return false;
        }
        let (phase, local) = self.local(index);
        let k = self.elements_per_layer(phase);
        (local + 1) % k != 0
    }

    /// Platform height of the first layer in µm.
    pub fn build_platform_offset_um(&self) -> u32 {
        let first = if self.disregard_first_layer_height {
            0
        } else {
            self.layer_thickness_at(0).unwrap_or(0)
        };
        self.build_platform_offset_um + first
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.body.is_empty() {
            return Err(JobError::EmptyBody);
        }
        let mut phases = vec![(Phase::Body, &self.body)];
        if let Some(base) = self.base.as_ref().filter(|m| !m.is_empty()) {
            phases.insert(0, (Phase::Base, base));
        }
        for (phase, manifest) in &phases {
            let phase = *phase;
            if manifest.elements_per_layer == 0 {
                return Err(JobError::ZeroTiling(phase));
            }
            if manifest.len() % manifest.elements_per_layer != 0 {
                return Err(JobError::PartialLayer {
                    phase,
                    entries: manifest.len(),
                    elements_per_layer: manifest.elements_per_layer,
                });
            }
            if let Some(index) = manifest.entries.iter().position(|e| e.thickness_um == 0) {
                return Err(JobError::ZeroThickness { phase, index });
            }
            let params = self.parameters(phase);
            let level = params.power_level;
            if !(0.0..=100.0).contains(&level) {
                return Err(JobError::PowerOutOfRange { phase, level });
            }
            let start = match phase {
                Phase::Base => 0,
                Phase::Body => self.body_layer_start(),
            };
            if manifest.is_tiled() {
                for local in 0..manifest.len() {
                    let seconds = self.element_exposure_s(start + local);
                    if !(0.0..=MAX_EXPOSURE_S).contains(&seconds) {
                        return Err(JobError::ExposureOutOfRange { phase, index: local, seconds });
                    }
                }
            } else if params.layer_exposure_time().as_secs_f64() > MAX_EXPOSURE_S {
                return Err(JobError::ExposureOutOfRange {
                    phase,
                    index: 0,
                    seconds: params.layer_exposure_time().as_secs_f64(),
                });
            }
        }
        if let Some(base) = self.base.as_ref().filter(|m| !m.is_empty()) {
            if base.elements_per_layer != self.body.elements_per_layer && !self.allow_mixed_tiling {
                return Err(JobError::MixedTiling {
                    base: base.elements_per_layer,
                    body: self.body.elements_per_layer,
                });
            }
        }
        Ok(())
    }
}
