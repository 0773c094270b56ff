//! Saga definitions: a named, frozen sequence of steps.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::step::Step;

/// An ordered, immutable sequence of steps.
///
/// Cloning is cheap; clones share the same steps.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    name: Arc<str>,
    steps: Arc<[Step]>,
}

impl SagaDefinition {
    /// Starts building a definition with the given name.
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Looks up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id() == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false for a built definition.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Appends steps, then freezes them into a [`SagaDefinition`].
#[derive(Debug)]
pub struct SagaDefinitionBuilder {
    name: String,
    steps: Vec<Step>,
}

impl SagaDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step after the ones already added.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Freezes the definition.
    ///
    /// Fails if no step was added or two steps share an id.
    pub fn build(self) -> Result<SagaDefinition, ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::EmptyDefinition { saga: self.name });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id().clone()) {
                return Err(ConfigError::DuplicateStep {
                    saga: self.name,
                    step: step.id().clone(),
                });
            }
        }

        Ok(SagaDefinition {
            name: self.name.into(),
            steps: self.steps.into(),
        })
    }
}
