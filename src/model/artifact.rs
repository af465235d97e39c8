//! Derived artifacts: cached materializations of one derivation key.

use std::path::PathBuf;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use super::DerivationKey;

/// Where a derived artifact stands in its lifecycle.
///
/// `Missing` → `Computing` → `Ready` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactState {
    /// No storage object exists.
    Missing,

    /// A worker is producing it.
    Computing,

    /// Durable and readable.
    Ready,

    /// The compute step raised.
    Failed,
}

/// A materialization of one derivation key on durable storage.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedArtifact {
    pub key: DerivationKey,

    /// Canonical location of the stored object.
    pub location: PathBuf,

    /// Carried over from the event.
    pub label: String,

    pub state: ArtifactState,

    /// When the stored object was published. `None` unless ready.
    pub materialized_at: Option<Timestamp>,
}

impl DerivedArtifact {
    pub fn is_ready(&self) -> bool {
        self.state == ArtifactState::Ready
    }
}
