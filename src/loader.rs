//! Dataset loading: index queries, parallel materialization, transforms.
//!
//! A [`DatasetLoader`] asks the index for (recording, event) pairs, detaches
//! each pair into a [`MaterializeJob`], and fans the jobs out over a
//! [`ParallelMaterializer`]. Every worker opens its own [`ArtifactCache`] on
//! the shared cache root and crops through the caller's [`Cropper`].

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Instant,
};

use tracing::{info, warn};

use crate::{
    BoxError,
    cache::{ArtifactCache, CacheError},
    config::{Config, ConfigError},
    index::{ChannelSetFilter, EventFilter, IndexError, IndexStore, RecordingFilter, SqliteIndex},
    materialize::{
        BatchReport, CancellationToken, MaterializeJob, ParallelMaterializer, PartialBatchFailure,
    },
    model::{CropWindow, DerivedArtifact, RecordingFormat},
    pipeline::{Pipeline, PipelineError},
};

/// Cuts the samples of one window out of a raw recording.
///
/// Implementations decode the recording format and encode the cropped
/// segment; the returned bytes are what the cache stores.
pub trait Cropper: Sync {
    fn crop(&self, source: &Path, window: CropWindow) -> core::result::Result<Vec<u8>, BoxError>;
}

impl<F> Cropper for F
where
    F: Fn(&Path, CropWindow) -> core::result::Result<Vec<u8>, BoxError> + Sync,
{
    fn crop(&self, source: &Path, window: CropWindow) -> core::result::Result<Vec<u8>, BoxError> {
        self(source, window)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Batch(#[from] PartialBatchFailure),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

pub type Result<T> = core::result::Result<T, LoadError>;

/// A text report: where it lives and its recording label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRecord {
    pub path: PathBuf,
    pub label: String,
}

/// Loads per-event datasets from an index and a cache.
#[derive(Debug)]
pub struct DatasetLoader<I = SqliteIndex> {
    config: Config,
    index: I,
    cancel: Option<CancellationToken>,
}

impl DatasetLoader<SqliteIndex> {
    /// Opens the `SQLite` index named by `config`.
    pub fn open(config: Config) -> Result<Self> {
        let index = SqliteIndex::open(config.index_path())?;
        Ok(Self::with_index(config, index))
    }

    /// Loads `~/.eegpipe/config.toml` and opens its index.
    pub fn from_default_config() -> Result<Self> {
        Self::open(Config::load()?)
    }
}

impl<I: IndexStore> DatasetLoader<I> {
    pub fn with_index(config: Config, index: I) -> Self {
        Self {
            config,
            index,
            cancel: None,
        }
    }

    /// Materialization batches stop starting jobs once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    /// One detached job per indexed EDF event outside the excluded montages.
    pub fn jobs(&self) -> Result<Vec<MaterializeJob>> {
        let filter = EventFilter {
            format: RecordingFormat::Edf,
            excluded_channel_refs: self.config.excluded_channel_refs.clone(),
        };
        let pairs = self.index.recordings_with_events(&filter)?;
        Ok(pairs
            .iter()
            .map(|(recording, event)| {
                MaterializeJob::detach(recording, event, &self.config.data_root)
            })
            .collect())
    }

    /// Materializes every job, reporting each outcome in index order.
    pub fn materialize(&self, cropper: &impl Cropper) -> Result<BatchReport> {
        let jobs = self.jobs()?;
        let settings = self.config.cache_settings();

        let mut materializer =
            ParallelMaterializer::new().with_workers(self.config.worker_count());
        if let Some(token) = &self.cancel {
            materializer = materializer.with_cancellation(token.clone());
        }

        let report = materializer.materialize_all(
            &jobs,
            || ArtifactCache::open(settings.clone()),
            |cache, job| {
                cache.resolve(&job.key, &job.label, |_| {
                    cropper.crop(&job.source, job.window)
                })
            },
        );
        Ok(report)
    }

    /// Every artifact of the dataset, or the keys that failed and why.
    pub fn dataset(&self, cropper: &impl Cropper) -> Result<Vec<DerivedArtifact>> {
        let started = Instant::now();
        let artifacts = self.materialize(cropper)?.into_complete()?;
        info!(
            artifacts = artifacts.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "dataset loaded"
        );
        Ok(artifacts)
    }

    /// The artifacts that could be materialized. Failures are logged and
    /// dropped.
    pub fn dataset_lenient(&self, cropper: &impl Cropper) -> Result<Vec<DerivedArtifact>> {
        let (ready, failures) = self.materialize(cropper)?.into_parts();
        for (key, failure) in &failures {
            warn!(%key, error = %failure, "skipping event");
        }
        info!(
            artifacts = ready.len(),
            skipped = failures.len(),
            "dataset loaded"
        );
        Ok(ready)
    }

    /// Text reports keyed by recording id.
    pub fn text_dataset(&self) -> Result<BTreeMap<String, TextRecord>> {
        let reports = self.index.recordings(RecordingFilter {
            format: RecordingFormat::Txt,
        })?;
        Ok(reports
            .into_iter()
            .map(|r| {
                let record = TextRecord {
                    path: self.config.data_root.join(&r.path),
                    label: r.label,
                };
                (r.id, record)
            })
            .collect())
    }

    /// Channels every non-excluded recording has, sorted.
    pub fn channel_set(&self) -> Result<Vec<String>> {
        let filter = ChannelSetFilter {
            excluded_channel_refs: self.config.excluded_channel_refs.clone(),
        };
        Ok(self.index.common_channel_set(&filter)?)
    }

    /// Lowest sampling frequency in the index, `0.0` if nothing is indexed.
    pub fn lowest_frequency(&self) -> Result<f64> {
        Ok(self.index.lowest_frequency()?)
    }

    /// Loads and validates a ready artifact's payload.
    pub fn read(&self, artifact: &DerivedArtifact) -> Result<Vec<u8>> {
        let cache = ArtifactCache::open(self.config.cache_settings())?;
        Ok(cache.read(artifact)?)
    }

    /// Decodes each artifact and runs it through `pipeline`, in order.
    pub fn transform<V, D>(
        &self,
        artifacts: &[DerivedArtifact],
        pipeline: &Pipeline<V>,
        decode: D,
    ) -> Result<Vec<V>>
    where
        V: Clone + Send + Sync,
        D: Fn(&DerivedArtifact, Vec<u8>) -> V,
    {
        let cache = ArtifactCache::open(self.config.cache_settings())?;
        let mut values = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            values.push(decode(artifact, cache.read(artifact)?));
        }
        Ok(pipeline.run_each(values)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use crate::{
        model::{Event, SourceRecording},
        pipeline::stage_fn,
    };

    /// Renders the window as text instead of reading the source.
    struct FakeCropper {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    impl FakeCropper {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on: None,
            }
        }

        fn failing_on(source_name: &'static str) -> Self {
            Self {
                fail_on: Some(source_name),
                ..Self::new()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Cropper for FakeCropper {
        fn crop(
            &self,
            source: &Path,
            window: CropWindow,
        ) -> core::result::Result<Vec<u8>, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = source.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if self.fail_on == Some(name) {
                return Err(format!("cannot decode {name}").into());
            }
            Ok(format!("{name}@{}-{}", window.begin, window.end).into_bytes())
        }
    }

    fn recording(id: &str, format: RecordingFormat, channel_ref: &str) -> SourceRecording {
        SourceRecording {
            id: id.into(),
            path: PathBuf::from(channel_ref).join(format!("{id}.{format}")),
            format,
            channel_ref: channel_ref.into(),
            label: format!("{id}-label"),
        }
    }

    fn test_loader() -> (TempDir, DatasetLoader) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new(dir.path().join("data"));
        config.cache_root = Some(dir.path().join("cache"));
        config.workers = Some(3);

        let index = SqliteIndex::open_in_memory().unwrap();
        index
            .insert_recording(&recording("a", RecordingFormat::Edf, "01_tcp_ar"))
            .unwrap();
        index
            .insert_recording(&recording("b", RecordingFormat::Edf, "02_tcp_le"))
            .unwrap();
        index
            .insert_recording(&recording("c", RecordingFormat::Edf, "01_tcp_ar"))
            .unwrap();
        index
            .insert_recording(&recording("r", RecordingFormat::Txt, "01_tcp_ar"))
            .unwrap();
        let events = [("e1", "a", 0.0), ("e2", "a", 4.0), ("e1", "b", 1.0), ("e1", "c", 2.0)];
        for (id, file_id, begin) in events {
            let event = Event::new(id, file_id, begin, begin + 2.0, "musc").unwrap();
            index.insert_event(&event).unwrap();
        }
        index.insert_metadata("a", 256.0, &["FP1", "FP2", "CZ"]).unwrap();
        index.insert_metadata("b", 128.0, &["FP1"]).unwrap();
        index.insert_metadata("c", 250.0, &["CZ", "FP1"]).unwrap();

        (dir, DatasetLoader::with_index(config, index))
    }

    #[test]
    fn jobs_are_detached_with_absolute_sources() {
        let (dir, loader) = test_loader();
        let jobs = loader.jobs().unwrap();

        let keys: Vec<String> = jobs.iter().map(|j| j.key.to_string()).collect();
        assert_eq!(keys, vec!["a/e1", "a/e2", "c/e1"]);
        assert_eq!(jobs[1].source, dir.path().join("data/01_tcp_ar/a.edf"));
        assert_eq!(jobs[1].window, CropWindow { begin: 4.0, end: 6.0 });
        assert_eq!(jobs[1].label, "musc");
    }

    #[test]
    fn dataset_materializes_once_and_reads_back() {
        let (_dir, loader) = test_loader();
        let cropper = FakeCropper::new();

        let artifacts = loader.dataset(&cropper).unwrap();
        assert_eq!(artifacts.len(), 3);
        assert!(artifacts.iter().all(DerivedArtifact::is_ready));
        assert_eq!(cropper.calls(), 3);
        assert_eq!(loader.read(&artifacts[1]).unwrap(), b"a.edf@4-6");

        let again = loader.dataset(&cropper).unwrap();
        assert_eq!(cropper.calls(), 3);
        let locations: Vec<_> = again.iter().map(|a| &a.location).collect();
        assert_eq!(locations, artifacts.iter().map(|a| &a.location).collect::<Vec<_>>());
    }

    #[test]
    fn strict_dataset_reports_failed_keys() {
        let (_dir, loader) = test_loader();
        let cropper = FakeCropper::failing_on("c.edf");

        let err = loader.dataset(&cropper).unwrap_err();
        let LoadError::Batch(batch) = err else {
            panic!("expected a batch failure, got {err:?}");
        };
        assert_eq!(batch.succeeded, 2);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0.to_string(), "c/e1");
        assert!(batch.failures[0].1.to_string().contains("cannot decode c.edf"));
    }

    #[test]
    fn lenient_dataset_skips_failures() {
        let (_dir, loader) = test_loader();
        let cropper = FakeCropper::failing_on("c.edf");

        let artifacts = loader.dataset_lenient(&cropper).unwrap();
        let keys: Vec<String> = artifacts.iter().map(|a| a.key.to_string()).collect();
        assert_eq!(keys, vec!["a/e1", "a/e2"]);
    }

    #[test]
    fn closures_are_croppers() {
        let (_dir, loader) = test_loader();
        let cropper = |_: &Path, window: CropWindow| -> core::result::Result<Vec<u8>, BoxError> {
            Ok(window.duration().to_string().into_bytes())
        };

        let artifacts = loader.dataset(&cropper).unwrap();
        assert_eq!(loader.read(&artifacts[0]).unwrap(), b"2");
    }

    #[test]
    fn cancelled_loader_starts_nothing() {
        let (_dir, loader) = test_loader();
        let token = CancellationToken::new();
        token.cancel();
        let loader = loader.with_cancellation(token);
        let cropper = FakeCropper::new();

        let report = loader.materialize(&cropper).unwrap();
        assert_eq!(report.len(), 3);
        assert_eq!(report.ready_count(), 0);
        assert_eq!(cropper.calls(), 0);
    }

    #[test]
    fn text_dataset_maps_ids_to_paths_and_labels() {
        let (dir, loader) = test_loader();
        let texts = loader.text_dataset().unwrap();

        assert_eq!(texts.len(), 1);
        assert_eq!(
            texts["r"],
            TextRecord {
                path: dir.path().join("data/01_tcp_ar/r.txt"),
                label: "r-label".into(),
            }
        );
    }

    #[test]
    fn aggregates_honor_exclusions() {
        let (_dir, loader) = test_loader();
        assert_eq!(loader.channel_set().unwrap(), vec!["CZ", "FP1"]);
        assert!((loader.lowest_frequency().unwrap() - 128.0).abs() < f64::EPSILON);
    }

    #[test]
    fn transform_runs_the_pipeline_per_artifact() {
        let (_dir, loader) = test_loader();
        let artifacts = loader.dataset(&FakeCropper::new()).unwrap();
        let pipeline = Pipeline::builder()
            .stage(stage_fn("upper", |s: String| {
                Ok::<_, std::convert::Infallible>(s.to_uppercase())
            }))
            .build()
            .unwrap();

        let values = loader
            .transform(&artifacts, &pipeline, |artifact, bytes| {
                format!("{}:{}", artifact.key, String::from_utf8_lossy(&bytes))
            })
            .unwrap();
        assert_eq!(values, vec!["A/E1:A.EDF@0-2", "A/E2:A.EDF@4-6", "C/E1:C.EDF@2-4"]);
    }

    #[test]
    fn open_uses_the_configured_index_path() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new(dir.path());
        config.index_path = Some(dir.path().join("idx.sqlite"));

        let loader = DatasetLoader::open(config).unwrap();
        assert!(dir.path().join("idx.sqlite").exists());
        assert!(loader.jobs().unwrap().is_empty());
    }
}
