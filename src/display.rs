// src/display.rs - Layer image presentation on the projector surface
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("Layer image not found: {0}")]
    Missing(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait LayerDisplay: Send + Sync {
    fn show(&self, path: &Path) -> Result<(), DisplayError>;
    fn clear(&self);
}

/// Tracks the current layer image without a framebuffer.
#[derive(Debug, Default)]
pub struct HeadlessDisplay {
    require_images: bool,
    current: Mutex<Option<PathBuf>>,
    shown: Mutex<usize>,
}

impl HeadlessDisplay {
    pub fn new(require_images: bool) -> Self {
        Self {
            require_images,
            ..Self::default()
        }
    }

    pub fn current(&self) -> Option<PathBuf> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    /// Number of images shown since creation.
    pub fn shown_count(&self) -> usize {
        self.shown.lock().map(|n| *n).unwrap_or_default()
    }
}

impl LayerDisplay for HeadlessDisplay {
    fn show(&self, path: &Path) -> Result<(), DisplayError> {
        if self.require_images {
            let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DisplayError::Missing(path.to_path_buf()),
                _ => DisplayError::Io(e),
            })?;
            if !metadata.is_file() {
                return Err(DisplayError::Missing(path.to_path_buf()));
            }
        }
        tracing::debug!("Showing layer image {}", path.display());
        if let Ok(mut current) = self.current.lock() {
            *current = Some(path.to_path_buf());
        }
        if let Ok(mut shown) = self.shown.lock() {
            *shown += 1;
        }
        Ok(())
    }

    fn clear(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
    }
}
