//! Events: labelled time spans within a recording.

use serde::{Deserialize, Serialize};

use super::DerivationKey;

/// An event whose bounds are not a valid span.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("event {id}: end ({end}) must be finite and after begin ({begin})")]
pub struct InvalidEvent {
    pub id: String,
    pub begin: f64,
    pub end: f64,
}

/// A time span to crop out of a recording, in seconds from its start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropWindow {
    pub begin: f64,
    pub end: f64,
}

impl CropWindow {
    pub fn duration(self) -> f64 {
        self.end - self.begin
    }
}

/// A labelled span on one recording.
///
/// Immutable: fields are private so `end > begin` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    id: String,
    file_id: String,
    window: CropWindow,
    label: String,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        file_id: impl Into<String>,
        begin: f64,
        end: f64,
        label: impl Into<String>,
    ) -> Result<Self, InvalidEvent> {
        let id = id.into();
        if !begin.is_finite() || !end.is_finite() || end <= begin {
            return Err(InvalidEvent { id, begin, end });
        }
        Ok(Self {
            id,
            file_id: file_id.into(),
            window: CropWindow { begin, end },
            label: label.into(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn begin(&self) -> f64 {
        self.window.begin
    }

    pub fn end(&self) -> f64 {
        self.window.end
    }

    pub fn window(&self) -> CropWindow {
        self.window
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The key of the artifact derived from this event.
    pub fn key(&self) -> DerivationKey {
        DerivationKey::new(&self.file_id, &self.id)
    }
}
