//! Per-event EEG segment materialization.
//!
//! Recordings and their labelled events come from an index
//! ([`index::IndexStore`]). Each event is cropped out of its recording once,
//! stored in an on-disk [`cache::ArtifactCache`] keyed by (file, event), and
//! reused on every later run. Batches of events are materialized on a
//! bounded worker pool ([`materialize::ParallelMaterializer`]) and the
//! resulting segments flow through declarative transform pipelines with
//! fan-out/merge joins ([`pipeline::Pipeline`]). [`loader::DatasetLoader`]
//! ties these together.

pub mod cache;
pub mod config;
pub mod index;
pub mod loader;
pub mod materialize;
pub mod model;
pub mod pipeline;

/// Error type for caller-supplied computations and stages.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use cache::{ArtifactCache, CacheError, CacheSettings};
pub use config::{Config, ConfigError};
pub use index::{IndexError, IndexStore, SqliteIndex};
pub use loader::{Cropper, DatasetLoader, LoadError};
pub use materialize::{BatchReport, CancellationToken, ParallelMaterializer, PartialBatchFailure};
pub use model::{ArtifactState, DerivationKey, DerivedArtifact, Event, SourceRecording};
pub use pipeline::{JoinNode, Pipeline, PipelineError};
