//! Content-addressed artifact cache.
//!
//! Maps a [`DerivationKey`] to a stored object under the cache root. On a hit
//! the stored object is validated and returned without computing; on a miss
//! the caller's compute step runs under a per-key lock and its result is
//! published atomically (temporary file, fsync, rename), so a reader never
//! observes a partial object at the canonical location.

mod envelope;
mod layout;
mod lock;

use std::{
    collections::HashMap,
    fs, io,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tracing::{debug, warn};

use crate::{
    BoxError,
    model::{ArtifactState, DerivationKey, DerivedArtifact},
};

use envelope::Header;
use lock::KeyLock;

pub use layout::ARTIFACT_EXTENSION;

/// zstd level used when none is configured.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Errors that can occur while resolving or reading artifacts.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid derivation key {key}: {reason}")]
    InvalidKey {
        key: DerivationKey,
        reason: &'static str,
    },

    #[error("computing {key} failed: {source}")]
    ComputeFailed {
        key: DerivationKey,
        #[source]
        source: BoxError,
    },

    #[error("storage unavailable at {}: {source}", path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt artifact at {}: {reason}", path.display())]
    CorruptArtifact { path: PathBuf, reason: String },
}

pub type Result<T> = core::result::Result<T, CacheError>;

/// Everything needed to open a cache. Plain data, safe to hand to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub root: PathBuf,
    pub compression_level: i32,
}

impl CacheSettings {
    /// Settings with default compression.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// On-disk artifact cache rooted at a directory.
#[derive(Debug)]
pub struct ArtifactCache {
    settings: CacheSettings,
    states: Mutex<HashMap<DerivationKey, ArtifactState>>,
    #[cfg(test)]
    fail_before_publish: std::sync::atomic::AtomicBool,
}

impl ArtifactCache {
    /// Opens a cache, creating the root directory if it doesn't exist.
    pub fn open(settings: CacheSettings) -> Result<Self> {
        fs::create_dir_all(&settings.root).map_err(|source| CacheError::StorageUnavailable {
            path: settings.root.clone(),
            source,
        })?;
        Ok(Self {
            settings,
            states: Mutex::new(HashMap::new()),
            #[cfg(test)]
            fail_before_publish: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// The canonical location for `key`.
    pub fn location(&self, key: &DerivationKey) -> Result<PathBuf> {
        layout::canonical_location(&self.settings.root, key)
    }

    /// Returns the artifact for `key`, computing and storing it on a miss.
    ///
    /// `compute` runs at most once per call, and not at all when a valid
    /// object is already stored. A stored object that fails validation is
    /// treated as missing and recomputed. On failure nothing is left at the
    /// canonical location.
    ///
    /// On a hit the label recorded at publish time is returned.
    pub fn resolve<F, E>(
        &self,
        key: &DerivationKey,
        label: &str,
        compute: F,
    ) -> Result<DerivedArtifact>
    where
        F: FnOnce(&DerivationKey) -> core::result::Result<Vec<u8>, E>,
        E: Into<BoxError>,
    {
        let location = self.location(key)?;
        if let Some(artifact) = self.lookup(key, &location)? {
            return Ok(artifact);
        }

        let dir = location.parent().unwrap_or(&self.settings.root);
        fs::create_dir_all(dir).map_err(|source| CacheError::StorageUnavailable {
            path: dir.to_path_buf(),
            source,
        })?;
        let lock_path = layout::lock_path(&location);
        let _lock = KeyLock::acquire(&lock_path).map_err(|source| CacheError::StorageUnavailable {
            path: lock_path,
            source,
        })?;

        // Another worker may have published while we waited for the lock.
        if let Some(artifact) = self.lookup(key, &location)? {
            return Ok(artifact);
        }

        self.set_state(key, ArtifactState::Computing);
        debug!(%key, "computing artifact");
        let payload = match compute(key) {
            Ok(payload) => payload,
            Err(e) => {
                self.set_state(key, ArtifactState::Failed);
                let source = e.into();
                warn!(%key, error = %source, "artifact computation failed");
                return Err(CacheError::ComputeFailed {
                    key: key.clone(),
                    source,
                });
            }
        };

        match self.publish(key, label, &location, &payload) {
            Ok(header) => {
                self.set_state(key, ArtifactState::Ready);
                debug!(%key, bytes = header.length, "artifact published");
                Ok(DerivedArtifact {
                    key: key.clone(),
                    location,
                    label: header.label,
                    state: ArtifactState::Ready,
                    materialized_at: Some(header.materialized_at),
                })
            }
            Err(e) => {
                self.set_state(key, ArtifactState::Failed);
                Err(e)
            }
        }
    }

    /// Reads and validates a stored artifact's payload.
    pub fn read(&self, artifact: &DerivedArtifact) -> Result<Vec<u8>> {
        let bytes =
            fs::read(&artifact.location).map_err(|source| CacheError::StorageUnavailable {
                path: artifact.location.clone(),
                source,
            })?;
        envelope::open(&bytes, &artifact.key)
            .map(|opened| opened.payload)
            .map_err(|reason| CacheError::CorruptArtifact {
                path: artifact.location.clone(),
                reason,
            })
    }

    /// This cache's view of a key's lifecycle.
    ///
    /// Keys this instance hasn't touched are `Ready` if a valid object exists
    /// at their canonical location and `Missing` otherwise.
    pub fn state(&self, key: &DerivationKey) -> ArtifactState {
        if let Some(state) = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return *state;
        }
        if let Ok(location) = self.location(key)
            && let Ok(bytes) = fs::read(location)
            && envelope::open(&bytes, key).is_ok()
        {
            ArtifactState::Ready
        } else {
            ArtifactState::Missing
        }
    }

    /// Returns the stored artifact if a valid one exists.
    fn lookup(&self, key: &DerivationKey, location: &Path) -> Result<Option<DerivedArtifact>> {
        let bytes = match fs::read(location) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::StorageUnavailable {
                    path: location.to_path_buf(),
                    source,
                });
            }
        };
        match envelope::open(&bytes, key) {
            Ok(opened) => {
                debug!(%key, "artifact cache hit");
                self.set_state(key, ArtifactState::Ready);
                Ok(Some(DerivedArtifact {
                    key: key.clone(),
                    location: location.to_path_buf(),
                    label: opened.header.label,
                    state: ArtifactState::Ready,
                    materialized_at: Some(opened.header.materialized_at),
                }))
            }
            Err(reason) => {
                warn!(
                    %key,
                    location = %location.display(),
                    %reason,
                    "corrupt artifact, recomputing"
                );
                self.set_state(key, ArtifactState::Missing);
                Ok(None)
            }
        }
    }

    fn publish(
        &self,
        key: &DerivationKey,
        label: &str,
        location: &Path,
        payload: &[u8],
    ) -> Result<Header> {
        let storage_error = |source| CacheError::StorageUnavailable {
            path: location.to_path_buf(),
            source,
        };
        let (bytes, header) =
            envelope::seal(key, label, payload, self.settings.compression_level)
                .map_err(storage_error)?;

        let tmp = layout::temp_path(location);
        if let Err(e) = self.write_then_rename(&tmp, location, &bytes) {
            if let Err(cleanup) = fs::remove_file(&tmp)
                && cleanup.kind() != io::ErrorKind::NotFound
            {
                warn!(
                    tmp = %tmp.display(),
                    error = %cleanup,
                    "failed to remove temporary artifact"
                );
            }
            return Err(storage_error(e));
        }
        Ok(header)
    }

    fn write_then_rename(&self, tmp: &Path, location: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        #[cfg(test)]
        if self
            .fail_before_publish
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(io::Error::other("injected failure before publish"));
        }

        fs::rename(tmp, location)
    }

    fn set_state(&self, key: &DerivationKey, state: ArtifactState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), state);
    }
}
