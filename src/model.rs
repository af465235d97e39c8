//! Core data model for eegpipe.
//!
//! Recordings and events are owned by the index and never mutated here.
//! Derivation keys and derived artifacts belong to the cache.

mod artifact;
mod event;
mod key;
mod recording;

pub use artifact::{ArtifactState, DerivedArtifact};
pub use event::{CropWindow, Event, InvalidEvent};
pub use key::DerivationKey;
pub use recording::{RecordingFormat, SourceRecording, UnknownFormat};
