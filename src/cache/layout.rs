//! Canonical artifact locations.
//!
//! ```text
//! <root>/<file_id>/<event_id>.seg        # published artifact
//! <root>/<file_id>/<event_id>.seg.lock   # advisory lock while computing
//! <root>/<file_id>/.<event_id>.seg.<uuid>.tmp
//! ```
//!
//! The location depends on nothing but the key, so every worker in every
//! process agrees on it.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::model::DerivationKey;

use super::CacheError;

/// Extension of a published artifact.
pub const ARTIFACT_EXTENSION: &str = "seg";

const LOCK_SUFFIX: &str = ".lock";
const TEMP_SUFFIX: &str = ".tmp";

/// Returns the canonical location for `key` under `root`.
///
/// Both key components must be usable as a single path component, which
/// keeps distinct keys at distinct paths.
pub(crate) fn canonical_location(root: &Path, key: &DerivationKey) -> Result<PathBuf, CacheError> {
    check_component(key, &key.file_id)?;
    check_component(key, &key.event_id)?;
    Ok(root
        .join(&key.file_id)
        .join(format!("{}.{ARTIFACT_EXTENSION}", key.event_id)))
}

/// The advisory lock file guarding `location`.
pub(crate) fn lock_path(location: &Path) -> PathBuf {
    with_suffix(location, LOCK_SUFFIX)
}

/// A fresh temporary path beside `location`, hidden and uniquely named.
pub(crate) fn temp_path(location: &Path) -> PathBuf {
    let name = location
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    location.with_file_name(format!(".{name}.{}{TEMP_SUFFIX}", Uuid::new_v4().simple()))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

fn check_component(key: &DerivationKey, component: &str) -> Result<(), CacheError> {
    let reason = if component.is_empty() {
        "empty identifier"
    } else if component == "." || component == ".." {
        "identifier is a relative path component"
    } else if component.contains(['/', '\\', '\0']) {
        "identifier contains a path separator"
    } else if component.starts_with('.') {
        "identifier starts with a dot"
    } else {
        return Ok(());
    };
    Err(CacheError::InvalidKey {
        key: key.clone(),
        reason,
    })
}
