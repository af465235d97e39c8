//! Derivation keys: the identity of one cacheable artifact.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Selects exactly one derived artifact: one event on one recording.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationKey {
    pub file_id: String,
    pub event_id: String,
}

impl DerivationKey {
    pub fn new(file_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            event_id: event_id.into(),
        }
    }
}

impl fmt::Display for DerivationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_id, self.event_id)
    }
}
