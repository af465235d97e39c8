//! Declarative transform pipelines.
//!
//! A pipeline is an ordered list of elements. Each element is either a
//! [`Stage`] or a [`JoinNode`] that fans the current value out into named
//! branch pipelines and merges their outputs back into one value. The shape
//! is validated when the pipeline is built, so a pipeline that exists is
//! runnable.

mod join;
mod stage;

use std::fmt;

use tracing::debug;

use crate::BoxError;

pub use join::{BranchOutputs, JoinNode, Merge, MergeFn, merge_fn};
pub use stage::{Stage, StageFn, stage_fn};

/// Deepest allowed nesting of joins inside join branches.
pub const MAX_JOIN_DEPTH: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("stage {stage} failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: BoxError,
    },

    #[error("element {index}: {source}")]
    ElementFailed {
        index: usize,
        #[source]
        source: Box<PipelineError>,
    },
}

pub type Result<T> = core::result::Result<T, PipelineError>;

enum Element<V> {
    Stage(Box<dyn Stage<V>>),
    Join(JoinNode<V>),
}

impl<V> Element<V> {
    fn name(&self) -> &str {
        match self {
            Self::Stage(stage) => stage.name(),
            Self::Join(join) => join.name(),
        }
    }
}

/// A validated chain of stages and joins.
pub struct Pipeline<V> {
    elements: Vec<Element<V>>,
}

impl<V> fmt::Debug for Pipeline<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for element in &self.elements {
            match element {
                Element::Stage(stage) => list.entry(&stage.name()),
                Element::Join(join) => list.entry(join),
            };
        }
        list.finish()
    }
}

impl<V> Pipeline<V> {
    pub fn builder() -> PipelineBuilder<V> {
        PipelineBuilder::new()
    }

    /// Number of top-level elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<V: Clone + Send + Sync> Pipeline<V> {
    /// Runs every element in order, threading the value through.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StageFailed`] naming the path of the first
    /// stage (or merge) that fails. Nothing after it runs.
    pub fn run(&self, input: V) -> Result<V> {
        self.run_at(input, "")
    }

    /// Runs the pipeline over each input in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing input and returns
    /// [`PipelineError::ElementFailed`] with its index.
    pub fn run_each<I>(&self, inputs: I) -> Result<Vec<V>>
    where
        I: IntoIterator<Item = V>,
    {
        inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                self.run(input).map_err(|e| PipelineError::ElementFailed {
                    index,
                    source: Box::new(e),
                })
            })
            .collect()
    }

    pub(crate) fn run_at(&self, input: V, prefix: &str) -> Result<V> {
        let mut value = input;
        for element in &self.elements {
            let path = if prefix.is_empty() {
                element.name().to_owned()
            } else {
                format!("{prefix}/{}", element.name())
            };
            debug!(stage = %path, "running");
            value = match element {
                Element::Stage(stage) => stage
                    .apply(value)
                    .map_err(|source| PipelineError::StageFailed {
                        stage: path,
                        source,
                    })?,
                Element::Join(join) => join.run(value, &path)?,
            };
        }
        Ok(value)
    }
}

/// Accumulates elements and validates the shape in [`build`](Self::build).
pub struct PipelineBuilder<V> {
    elements: Vec<Element<V>>,
}

impl<V> Default for PipelineBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for PipelineBuilder<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("elements", &self.elements.len())
            .finish()
    }
}

impl<V> PipelineBuilder<V> {
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
        }
    }

    #[must_use]
    pub fn stage(mut self, stage: impl Stage<V> + 'static) -> Self {
        self.elements.push(Element::Stage(Box::new(stage)));
        self
    }

    #[must_use]
    pub fn join(mut self, join: JoinNode<V>) -> Self {
        self.elements.push(Element::Join(join));
        self
    }

    /// Validates the accumulated shape.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPipeline`] if the pipeline or any branch
    /// is empty, a stage or branch is unnamed, a join has no branches or
    /// repeats a branch name, or joins nest deeper than [`MAX_JOIN_DEPTH`].
    pub fn build(self) -> Result<Pipeline<V>> {
        let pipeline = Pipeline {
            elements: self.elements,
        };
        validate(&pipeline, "pipeline", 0)?;
        Ok(pipeline)
    }
}

fn validate<V>(pipeline: &Pipeline<V>, at: &str, depth: usize) -> Result<()> {
    if pipeline.elements.is_empty() {
        return Err(invalid(format!("{at} has no stages")));
    }

    for (position, element) in pipeline.elements.iter().enumerate() {
        let name = element.name();
        if name.trim().is_empty() {
            return Err(invalid(format!("{at}: element {position} has no name")));
        }

        let Element::Join(join) = element else {
            continue;
        };
        let join_at = format!("{at}/{name}");
        if depth >= MAX_JOIN_DEPTH {
            return Err(invalid(format!(
                "{join_at}: joins nested deeper than {MAX_JOIN_DEPTH}"
            )));
        }
        if join.branches.is_empty() {
            return Err(invalid(format!("{join_at} has no branches")));
        }

        let mut seen = std::collections::HashSet::new();
        for (branch, inner) in &join.branches {
            if branch.trim().is_empty() {
                return Err(invalid(format!("{join_at}: unnamed branch")));
            }
            if !seen.insert(branch.as_str()) {
                return Err(invalid(format!("{join_at}: duplicate branch {branch:?}")));
            }
            validate(inner, &format!("{join_at}/{branch}"), depth + 1)?;
        }
    }
    Ok(())
}

fn invalid(message: String) -> PipelineError {
    PipelineError::InvalidPipeline(message)
}
