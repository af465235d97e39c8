//! Parallel materialization of derivation jobs.
//!
//! A batch of jobs is spread over a bounded pool of scoped worker threads.
//! Each worker builds its own state with the caller's `setup` (typically its
//! own [`ArtifactCache`](crate::cache::ArtifactCache)), so live handles never
//! cross the worker boundary: only the plain job data is shared. Results come
//! back in submission order, one outcome per job, and every worker is joined
//! before the call returns.

mod cancel;

use std::{
    any::Any,
    fmt,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Instant,
};

use tracing::{info, warn};

use crate::{
    cache::CacheError,
    model::{CropWindow, DerivationKey, DerivedArtifact, Event, SourceRecording},
};

pub use cancel::CancellationToken;

/// Number of parallel execution units on this host, at least 1.
pub fn available_workers() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// A unit of work identified by the key it materializes.
///
/// Jobs are shared by reference with every worker, so they must be plain
/// data: identifiers, paths, and values.
pub trait Job: Sync {
    fn key(&self) -> &DerivationKey;
}

impl Job for DerivationKey {
    fn key(&self) -> &DerivationKey {
        self
    }
}

/// Everything a worker needs to crop and cache one event.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializeJob {
    pub key: DerivationKey,

    /// Absolute path of the raw recording.
    pub source: PathBuf,

    pub window: CropWindow,

    /// Carried over from the event.
    pub label: String,
}

impl MaterializeJob {
    /// Detaches an indexed recording/event pair from the index.
    ///
    /// The result holds no reference to the index or its connection.
    pub fn detach(recording: &SourceRecording, event: &Event, data_root: &Path) -> Self {
        Self {
            key: event.key(),
            source: data_root.join(&recording.path),
            window: event.window(),
            label: event.label().to_string(),
        }
    }
}

impl Job for MaterializeJob {
    fn key(&self) -> &DerivationKey {
        &self.key
    }
}

/// Why a single job produced no artifact.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("worker setup failed: {0}")]
    Setup(String),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("cancelled before start")]
    Cancelled,
}

/// The result of one job.
#[derive(Debug)]
pub struct JobOutcome {
    pub key: DerivationKey,
    pub result: Result<DerivedArtifact, JobFailure>,
}

/// One or more jobs in a batch failed while the others succeeded.
#[derive(Debug, thiserror::Error)]
#[error(
    "{} of {} materialization jobs failed",
    .failures.len(),
    .failures.len() + .succeeded
)]
pub struct PartialBatchFailure {
    /// Failed keys and why, in submission order.
    pub failures: Vec<(DerivationKey, JobFailure)>,
    pub succeeded: usize,
}

/// Per-job outcomes of a batch, in submission order.
#[derive(Debug)]
pub struct BatchReport {
    outcomes: Vec<JobOutcome>,
}

impl BatchReport {
    pub fn outcomes(&self) -> &[JobOutcome] {
        &self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&DerivationKey, &JobFailure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.key, e)))
    }

    /// Every artifact, or the list of failures if any job failed.
    pub fn into_complete(self) -> Result<Vec<DerivedArtifact>, PartialBatchFailure> {
        let (ready, failures) = self.into_parts();
        if failures.is_empty() {
            Ok(ready)
        } else {
            Err(PartialBatchFailure {
                failures,
                succeeded: ready.len(),
            })
        }
    }

    /// Splits into ready artifacts and failures, each in submission order.
    pub fn into_parts(self) -> (Vec<DerivedArtifact>, Vec<(DerivationKey, JobFailure)>) {
        let mut ready = Vec::new();
        let mut failures = Vec::new();
        for outcome in self.outcomes {
            match outcome.result {
                Ok(artifact) => ready.push(artifact),
                Err(e) => failures.push((outcome.key, e)),
            }
        }
        (ready, failures)
    }
}

/// Runs batches of independent jobs on a bounded worker pool.
#[derive(Debug, Clone, Default)]
pub struct ParallelMaterializer {
    workers: Option<usize>,
    cancel: Option<CancellationToken>,
}

impl ParallelMaterializer {
    /// A materializer sized to the host's available parallelism.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the worker count. Zero is treated as one.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Jobs not yet started when `token` is cancelled are skipped.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Workers used for a batch of `jobs` jobs.
    pub fn worker_count(&self, jobs: usize) -> usize {
        self.workers
            .unwrap_or_else(available_workers)
            .max(1)
            .min(jobs.max(1))
    }

    /// Runs every job and reports each outcome in submission order.
    ///
    /// `setup` runs once on each worker thread to build that worker's private
    /// state; `per_job` then runs for each job the worker picks up. A failing
    /// or panicking job doesn't affect its siblings. If a worker's setup
    /// fails, the remaining workers carry on; jobs no worker could take are
    /// reported as setup failures.
    pub fn materialize_all<J, W, E, S, F>(&self, jobs: &[J], setup: S, per_job: F) -> BatchReport
    where
        J: Job,
        S: Fn() -> Result<W, E> + Sync,
        E: fmt::Display,
        F: Fn(&mut W, &J) -> Result<DerivedArtifact, CacheError> + Sync,
    {
        if jobs.is_empty() {
            return BatchReport {
                outcomes: Vec::new(),
            };
        }

        let workers = self.worker_count(jobs.len());
        let started = Instant::now();
        info!(jobs = jobs.len(), workers, "materializing batch");

        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();
        let setup_errors: Vec<String> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let tx = tx.clone();
                    let (next, setup, per_job) = (&next, &setup, &per_job);
                    let cancel = self.cancel.as_ref();
                    scope.spawn(move || -> Option<String> {
                        let mut state = match setup() {
                            Ok(state) => state,
                            Err(e) => {
                                let message = e.to_string();
                                warn!(worker, error = %message, "worker setup failed");
                                return Some(message);
                            }
                        };
                        loop {
                            if cancel.is_some_and(CancellationToken::is_cancelled) {
                                break;
                            }
                            let index = next.fetch_add(1, Ordering::SeqCst);
                            let Some(job) = jobs.get(index) else {
                                break;
                            };
                            let outcome =
                                panic::catch_unwind(AssertUnwindSafe(|| per_job(&mut state, job)));
                            let result = match outcome {
                                Ok(result) => result.map_err(JobFailure::from),
                                Err(payload) => Err(JobFailure::Panicked(panic_message(&*payload))),
                            };
                            if tx.send((index, result)).is_err() {
                                break;
                            }
                        }
                        None
                    })
                })
                .collect();

            handles
                .into_iter()
                .filter_map(|handle| match handle.join() {
                    Ok(setup_error) => setup_error,
                    Err(payload) => Some(panic_message(&*payload)),
                })
                .collect()
        });
        drop(tx);

        let mut slots: Vec<Option<Result<DerivedArtifact, JobFailure>>> =
            jobs.iter().map(|_| None).collect();
        for (index, result) in rx {
            slots[index] = Some(result);
        }

        let cancelled = self
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled);
        let outcomes: Vec<JobOutcome> = jobs
            .iter()
            .zip(slots)
            .map(|(job, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(match setup_errors.last() {
                        Some(message) if !cancelled => JobFailure::Setup(message.clone()),
                        _ => JobFailure::Cancelled,
                    })
                });
                if let Err(e) = &result {
                    warn!(key = %job.key(), error = %e, "materialization job failed");
                }
                JobOutcome {
                    key: job.key().clone(),
                    result,
                }
            })
            .collect();

        let report = BatchReport { outcomes };
        info!(
            ready = report.ready_count(),
            failed = report.len() - report.ready_count(),
            elapsed_ms = started.elapsed().as_millis(),
            "batch complete"
        );
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        collections::HashSet,
        convert::Infallible,
        sync::Mutex,
        time::Duration,
    };

    use tempfile::TempDir;

    use crate::{
        BoxError,
        cache::{ArtifactCache, CacheSettings},
        model::{ArtifactState, RecordingFormat},
    };

    fn keys(n: usize) -> Vec<DerivationKey> {
        (1..=n)
            .map(|i| DerivationKey::new("f1", format!("e{i}")))
            .collect()
    }

    fn fake_artifact(key: &DerivationKey) -> DerivedArtifact {
        DerivedArtifact {
            key: key.clone(),
            location: PathBuf::from(format!("/cache/{key}.seg")),
            label: key.event_id.clone(),
            state: ArtifactState::Ready,
            materialized_at: None,
        }
    }

    fn no_setup() -> Result<(), Infallible> {
        Ok(())
    }

    #[test]
    fn results_follow_submission_order() {
        let jobs = keys(8);

        // Earlier jobs sleep longer, so completion order is reversed.
        let report = ParallelMaterializer::new().with_workers(4).materialize_all(
            &jobs,
            no_setup,
            |(), key| {
                let delay = 8 - key.event_id[1..].parse::<u64>().unwrap();
                thread::sleep(Duration::from_millis(delay * 15));
                Ok(fake_artifact(key))
            },
        );

        let returned: Vec<_> = report.outcomes().iter().map(|o| o.key.clone()).collect();
        assert_eq!(returned, jobs);
        for outcome in report.outcomes() {
            assert_eq!(outcome.result.as_ref().unwrap().key, outcome.key);
        }
    }

    #[test]
    fn permuted_submission_is_preserved() {
        let mut jobs = keys(6);
        jobs.reverse();
        jobs.swap(1, 4);

        let report = ParallelMaterializer::new()
            .with_workers(3)
            .materialize_all(&jobs, no_setup, |(), key| Ok(fake_artifact(key)));

        let ready = report.into_complete().unwrap();
        let returned: Vec<_> = ready.into_iter().map(|a| a.key).collect();
        assert_eq!(returned, jobs);
    }

    #[test]
    fn one_failing_job_does_not_affect_siblings() {
        let dir = TempDir::new().unwrap();
        let settings = CacheSettings::new(dir.path().join("cache"));
        let jobs = keys(5);

        let report = ParallelMaterializer::new().with_workers(3).materialize_all(
            &jobs,
            || ArtifactCache::open(settings.clone()),
            |cache, key| {
                cache.resolve(key, "eyem", |key| {
                    if key.event_id == "e3" {
                        Err::<Vec<u8>, BoxError>("crop out of range".into())
                    } else {
                        Ok(key.event_id.as_bytes().to_vec())
                    }
                })
            },
        );

        assert_eq!(report.ready_count(), 4);
        let failed: Vec<_> = report.failures().map(|(k, _)| k.clone()).collect();
        assert_eq!(failed, [DerivationKey::new("f1", "e3")]);

        let err = report.into_complete().unwrap_err();
        assert_eq!(err.succeeded, 4);
        assert!(matches!(
            err.failures[0].1,
            JobFailure::Cache(CacheError::ComputeFailed { .. })
        ));
        assert_eq!(err.to_string(), "1 of 5 materialization jobs failed");
    }

    #[test]
    fn partial_results_remain_usable() {
        let jobs = keys(5);
        let report = ParallelMaterializer::new().with_workers(2).materialize_all(
            &jobs,
            no_setup,
            |(), key| {
                if key.event_id == "e3" {
                    Err(CacheError::CorruptArtifact {
                        path: PathBuf::from("/cache/e3.seg"),
                        reason: "test".into(),
                    })
                } else {
                    Ok(fake_artifact(key))
                }
            },
        );

        let (ready, failures) = report.into_parts();
        let ready: Vec<_> = ready.iter().map(|a| a.key.event_id.as_str()).collect();
        assert_eq!(ready, ["e1", "e2", "e4", "e5"]);
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn panicking_job_is_isolated() {
        let jobs = keys(4);
        let report = ParallelMaterializer::new().with_workers(2).materialize_all(
            &jobs,
            no_setup,
            |(), key| {
                assert!(key.event_id != "e2", "codec exploded");
                Ok(fake_artifact(key))
            },
        );

        assert_eq!(report.ready_count(), 3);
        let (key, failure) = report.failures().next().unwrap();
        assert_eq!(key.event_id, "e2");
        assert!(matches!(failure, JobFailure::Panicked(msg) if msg.contains("codec exploded")));
    }

    #[test]
    fn each_worker_builds_its_own_state() {
        let jobs = keys(9);
        let setups = AtomicUsize::new(0);
        let seen_threads = Mutex::new(HashSet::new());

        let report = ParallelMaterializer::new().with_workers(3).materialize_all(
            &jobs,
            || {
                setups.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(thread::current().id())
            },
            |owner, key| {
                assert_eq!(*owner, thread::current().id());
                seen_threads.lock().unwrap().insert(*owner);
                Ok(fake_artifact(key))
            },
        );

        assert_eq!(report.ready_count(), 9);
        assert_eq!(setups.load(Ordering::SeqCst), 3);
        assert!(seen_threads.lock().unwrap().len() <= 3);
    }

    #[test]
    fn setup_failure_is_reported_per_job() {
        let jobs = keys(3);
        let report = ParallelMaterializer::new().with_workers(2).materialize_all(
            &jobs,
            || Err::<(), _>("index unreachable"),
            |(), key| Ok(fake_artifact(key)),
        );

        assert_eq!(report.ready_count(), 0);
        for (_, failure) in report.failures() {
            assert!(matches!(failure, JobFailure::Setup(msg) if msg == "index unreachable"));
        }
    }

    #[test]
    fn cancelled_token_skips_pending_jobs() {
        let jobs = keys(4);
        let token = CancellationToken::new();

        let report = ParallelMaterializer::new()
            .with_workers(1)
            .with_cancellation(token.clone())
            .materialize_all(&jobs, no_setup, |(), key| {
                // The first job cancels the rest of the batch.
                token.cancel();
                Ok(fake_artifact(key))
            });

        assert_eq!(report.len(), 4);
        assert!(report.outcomes()[0].result.is_ok());
        for outcome in &report.outcomes()[1..] {
            assert!(matches!(outcome.result, Err(JobFailure::Cancelled)));
        }
    }

    #[test]
    fn worker_count_is_bounded() {
        let materializer = ParallelMaterializer::new().with_workers(0);
        assert_eq!(materializer.worker_count(10), 1);

        let materializer = ParallelMaterializer::new().with_workers(16);
        assert_eq!(materializer.worker_count(3), 3);
        assert_eq!(materializer.worker_count(0), 1);

        assert!(ParallelMaterializer::new().worker_count(usize::MAX) >= 1);
    }

    #[test]
    fn empty_batch_spawns_nothing() {
        let report = ParallelMaterializer::new().materialize_all(
            &Vec::<DerivationKey>::new(),
            || -> Result<(), &str> { panic!("no worker should start") },
            |(), key| Ok(fake_artifact(key)),
        );
        assert!(report.is_empty());
        assert!(report.into_complete().unwrap().is_empty());
    }

    #[test]
    fn detach_keeps_only_plain_data() {
        let recording = SourceRecording {
            id: "f1".into(),
            path: PathBuf::from("01_tcp_ar/s001/a.edf"),
            format: RecordingFormat::Edf,
            channel_ref: "01_tcp_ar".into(),
            label: String::new(),
        };
        let event = Event::new("e7", "f1", 2.0, 6.5, "chew").unwrap();

        let job = MaterializeJob::detach(&recording, &event, Path::new("/data/tuh"));

        assert_eq!(job.key, DerivationKey::new("f1", "e7"));
        assert_eq!(job.source, PathBuf::from("/data/tuh/01_tcp_ar/s001/a.edf"));
        assert_eq!(job.window, CropWindow { begin: 2.0, end: 6.5 });
        assert_eq!(job.label, "chew");
    }
}
