//! Transform stages.

use std::fmt;

use crate::BoxError;

/// A named, pure transform from one value to the next.
///
/// Stages keep no state between invocations, so a stage may be shared by
/// concurrently running join branches.
pub trait Stage<V>: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, input: V) -> Result<V, BoxError>;
}

/// A stage backed by a closure. Built with [`stage_fn`].
pub struct StageFn<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for StageFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageFn").field("name", &self.name).finish()
    }
}

/// Wraps any fallible closure as a stage.
pub fn stage_fn<V, E, F>(name: impl Into<String>, f: F) -> StageFn<F>
where
    F: Fn(V) -> Result<V, E> + Send + Sync,
    E: Into<BoxError>,
{
    StageFn {
        name: name.into(),
        f,
    }
}

impl<V, E, F> Stage<V> for StageFn<F>
where
    F: Fn(V) -> Result<V, E> + Send + Sync,
    E: Into<BoxError>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, input: V) -> Result<V, BoxError> {
        (self.f)(input).map_err(Into::into)
    }
}
