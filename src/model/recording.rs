//! Source recordings: raw files known to the index.

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

/// Storage format of a source recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingFormat {
    /// Continuous multichannel recording (EDF).
    Edf,

    /// Free-text clinical report.
    Txt,
}

impl RecordingFormat {
    /// The tag stored in the index.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Edf => "edf",
            Self::Txt => "txt",
        }
    }
}

impl fmt::Display for RecordingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A format tag outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown recording format: {0}")]
pub struct UnknownFormat(pub String);

impl FromStr for RecordingFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edf" => Ok(Self::Edf),
            "txt" => Ok(Self::Txt),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}

/// A raw recording as indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecording {
    pub id: String,

    /// Location relative to the data root.
    pub path: PathBuf,

    pub format: RecordingFormat,

    /// Acquisition montage tag, e.g. `01_tcp_ar`.
    pub channel_ref: String,

    /// File-level annotation. Empty when the index has none.
    pub label: String,
}
