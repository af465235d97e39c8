//! Query surface over indexed recordings, events and recording metadata.
//!
//! The index itself is built elsewhere. This module only reads it, through
//! the [`IndexStore`] trait, and ships one `SQLite`-backed implementation.

mod sqlite;

use std::collections::BTreeSet;

use crate::model::{Event, RecordingFormat, SourceRecording};

pub use sqlite::SqliteIndex;

/// Montage tags left out of datasets and channel sets unless configured
/// otherwise.
pub const DEFAULT_EXCLUDED_CHANNEL_REFS: &[&str] = &["02_tcp_le", "03_tcp_ar_a"];

/// Errors that can occur while querying the index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt index data: {0}")]
    Corrupt(String),
}

pub type Result<T> = core::result::Result<T, IndexError>;

fn default_exclusions() -> Vec<String> {
    DEFAULT_EXCLUDED_CHANNEL_REFS
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

/// Selects (recording, event) pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    pub format: RecordingFormat,
    pub excluded_channel_refs: Vec<String>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            format: RecordingFormat::Edf,
            excluded_channel_refs: default_exclusions(),
        }
    }
}

/// Selects recordings by format alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingFilter {
    pub format: RecordingFormat,
}

/// Selects the recordings whose channel sets are considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSetFilter {
    pub excluded_channel_refs: Vec<String>,
}

impl Default for ChannelSetFilter {
    fn default() -> Self {
        Self {
            excluded_channel_refs: default_exclusions(),
        }
    }
}

/// Read-only queries a dataset load needs from the index.
pub trait IndexStore {
    /// Every event joined with its recording, for recordings of the
    /// filter's format whose montage is not excluded.
    fn recordings_with_events(&self, filter: &EventFilter) -> Result<Vec<(SourceRecording, Event)>>;

    fn recordings(&self, filter: RecordingFilter) -> Result<Vec<SourceRecording>>;

    /// The distinct channel sets recorded for non-excluded recordings.
    fn distinct_channel_sets(&self, filter: &ChannelSetFilter) -> Result<Vec<BTreeSet<String>>>;

    /// Lowest sampling frequency across all recording metadata.
    fn min_frequency(&self) -> Result<Option<f64>>;

    /// Channels present in every distinct channel set, sorted.
    fn common_channel_set(&self, filter: &ChannelSetFilter) -> Result<Vec<String>> {
        Ok(intersect_channel_sets(&self.distinct_channel_sets(filter)?))
    }

    /// [`min_frequency`](Self::min_frequency), or `0.0` with no metadata.
    fn lowest_frequency(&self) -> Result<f64> {
        Ok(self.min_frequency()?.unwrap_or(0.0))
    }
}

/// Sorted intersection of the given channel sets. No sets, no channels.
pub fn intersect_channel_sets(sets: &[BTreeSet<String>]) -> Vec<String> {
    let Some((first, rest)) = sets.split_first() else {
        return Vec::new();
    };
    first
        .iter()
        .filter(|channel| rest.iter().all(|set| set.contains(*channel)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(channels: &[&str]) -> BTreeSet<String> {
        channels.iter().map(|c| (*c).to_string()).collect()
    }

    #[test]
    fn intersection_keeps_shared_channels_sorted() {
        let sets = [set(&["C", "A", "B"]), set(&["B", "C", "D"]), set(&["C", "B"])];
        assert_eq!(intersect_channel_sets(&sets), vec!["B", "C"]);
    }

    #[test]
    fn intersection_of_nothing_is_empty() {
        assert!(intersect_channel_sets(&[]).is_empty());
    }

    #[test]
    fn disjoint_sets_share_nothing() {
        let sets = [set(&["A"]), set(&["B"])];
        assert!(intersect_channel_sets(&sets).is_empty());
    }

    #[test]
    fn default_filters_exclude_the_default_montages() {
        assert_eq!(
            EventFilter::default().excluded_channel_refs,
            vec!["02_tcp_le", "03_tcp_ar_a"]
        );
        assert_eq!(
            ChannelSetFilter::default().excluded_channel_refs,
            EventFilter::default().excluded_channel_refs
        );
    }

    struct Fixed {
        sets: Vec<BTreeSet<String>>,
        frequency: Option<f64>,
    }

    impl IndexStore for Fixed {
        fn recordings_with_events(&self, _: &EventFilter) -> Result<Vec<(SourceRecording, Event)>> {
            Ok(Vec::new())
        }

        fn recordings(&self, _: RecordingFilter) -> Result<Vec<SourceRecording>> {
            Ok(Vec::new())
        }

        fn distinct_channel_sets(&self, _: &ChannelSetFilter) -> Result<Vec<BTreeSet<String>>> {
            Ok(self.sets.clone())
        }

        fn min_frequency(&self) -> Result<Option<f64>> {
            Ok(self.frequency)
        }
    }

    #[test]
    fn derived_aggregates_use_the_raw_queries() {
        let store = Fixed {
            sets: vec![set(&["A", "B", "C"]), set(&["B", "C", "D"])],
            frequency: Some(200.0),
        };
        let filter = ChannelSetFilter::default();
        assert_eq!(store.common_channel_set(&filter).unwrap(), vec!["B", "C"]);
        assert!((store.lowest_frequency().unwrap() - 200.0).abs() < f64::EPSILON);

        let empty = Fixed {
            sets: Vec::new(),
            frequency: None,
        };
        assert!(empty.common_channel_set(&filter).unwrap().is_empty());
        assert!(empty.lowest_frequency().unwrap().abs() < f64::EPSILON);
    }
}
