//! Join nodes: fan a value out into branches and merge what comes back.

use std::{fmt, panic, thread};

use crate::BoxError;

use super::{Pipeline, PipelineError, Result};

/// Branch outputs in declared order, each under its branch name.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchOutputs<V> {
    entries: Vec<(String, V)>,
}

impl<V> BranchOutputs<V> {
    /// The output of the branch called `name`.
    pub fn get(&self, name: &str) -> Option<&V> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The outputs in declared order, without names.
    pub fn into_values(self) -> Vec<V> {
        self.entries.into_iter().map(|(_, v)| v).collect()
    }
}

impl<V> IntoIterator for BranchOutputs<V> {
    type Item = (String, V);
    type IntoIter = std::vec::IntoIter<(String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Combines a join's branch outputs into the value that continues the
/// outer pipeline.
pub trait Merge<V>: Send + Sync {
    fn name(&self) -> &str;

    fn merge(&self, outputs: BranchOutputs<V>) -> core::result::Result<V, BoxError>;
}

/// A merge backed by a closure. Built with [`merge_fn`].
pub struct MergeFn<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for MergeFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeFn").field("name", &self.name).finish()
    }
}

/// Wraps a fallible closure over the branch outputs as a merge stage.
pub fn merge_fn<V, E, F>(name: impl Into<String>, f: F) -> MergeFn<F>
where
    F: Fn(BranchOutputs<V>) -> core::result::Result<V, E> + Send + Sync,
    E: Into<BoxError>,
{
    MergeFn {
        name: name.into(),
        f,
    }
}

impl<V, E, F> Merge<V> for MergeFn<F>
where
    F: Fn(BranchOutputs<V>) -> core::result::Result<V, E> + Send + Sync,
    E: Into<BoxError>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn merge(&self, outputs: BranchOutputs<V>) -> core::result::Result<V, BoxError> {
        (self.f)(outputs).map_err(Into::into)
    }
}

/// Fans its input into independent branch pipelines, then merges.
///
/// Every branch receives its own copy of the join's input. Branches share
/// nothing mutable, so running them one after another or on scoped threads
/// ([`JoinNode::concurrent`]) gives the same result.
pub struct JoinNode<V> {
    pub(super) branches: Vec<(String, Pipeline<V>)>,
    pub(super) merge: Box<dyn Merge<V>>,
    concurrent: bool,
}

impl<V> fmt::Debug for JoinNode<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinNode")
            .field("branches", &self.branches)
            .field("merge", &self.merge.name())
            .field("concurrent", &self.concurrent)
            .finish()
    }
}

impl<V> JoinNode<V> {
    pub fn new(merge: impl Merge<V> + 'static) -> Self {
        Self {
            branches: Vec::new(),
            merge: Box::new(merge),
            concurrent: false,
        }
    }

    /// Appends a branch. Branches run and merge in the order added.
    #[must_use]
    pub fn branch(mut self, name: impl Into<String>, pipeline: Pipeline<V>) -> Self {
        self.branches.push((name.into(), pipeline));
        self
    }

    /// Run branches on scoped threads instead of sequentially.
    #[must_use]
    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn name(&self) -> &str {
        self.merge.name()
    }
}

impl<V: Clone + Send + Sync> JoinNode<V> {
    pub(super) fn run(&self, input: V, path: &str) -> Result<V> {
        let branch_path = |name: &str| format!("{path}/{name}");

        let values = if self.concurrent && self.branches.len() > 1 {
            thread::scope(|scope| {
                let handles: Vec<_> = self
                    .branches
                    .iter()
                    .map(|(name, pipeline)| {
                        let input = input.clone();
                        let prefix = branch_path(name);
                        scope.spawn(move || pipeline.run_at(input, &prefix))
                    })
                    .collect();
                // A branch panic unwinds out of `run`, as it does when sequential.
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|payload| panic::resume_unwind(payload))
                    })
                    .collect::<Result<Vec<V>>>()
            })?
        } else {
            self.branches
                .iter()
                .map(|(name, pipeline)| pipeline.run_at(input.clone(), &branch_path(name)))
                .collect::<Result<Vec<V>>>()?
        };

        let outputs = BranchOutputs {
            entries: self
                .branches
                .iter()
                .map(|(name, _)| name.clone())
                .zip(values)
                .collect(),
        };
        self.merge
            .merge(outputs)
            .map_err(|source| PipelineError::StageFailed {
                stage: path.to_owned(),
                source,
            })
    }
}
