//! Reverse-order unwinding of completed steps.

use std::str::FromStr;

use async_trait::async_trait;
use common::StepId;

use crate::error::Result;
use crate::step::Step;

/// What to do with the rest of the unwind after a compensation gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnwindPolicy {
    /// Keep compensating the remaining steps (best-effort full unwind).
    #[default]
    Continue,
    /// Stop at the first compensation that gives up. The steps left
    /// untouched are reported as not compensated.
    Abort,
}

impl FromStr for UnwindPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(UnwindPolicy::Continue),
            "abort" => Ok(UnwindPolicy::Abort),
            _ => Err("expected 'continue' or 'abort'".to_string()),
        }
    }
}

/// Runs one step's compensation to its final outcome.
///
/// Implemented by the executor, which retries, records and reports each
/// attempt.
#[async_trait]
pub(crate) trait Compensator: Send {
    /// Returns true if the compensation eventually succeeded.
    async fn compensate(&mut self, step: &Step) -> Result<bool>;
}

/// Unwinds the successfully completed steps of a failed execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompensationCoordinator {
    policy: UnwindPolicy,
}

impl CompensationCoordinator {
    pub fn new(policy: UnwindPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> UnwindPolicy {
        self.policy
    }

    /// Compensates `steps`, which must be ordered most-recent-first.
    ///
    /// Returns the steps whose compensation did not succeed; an empty list
    /// means the rollback is complete. Errors only on fatal store conflicts.
    pub(crate) async fn unwind<C: Compensator>(
        &self,
        compensator: &mut C,
        steps: &[Step],
    ) -> Result<Vec<StepId>> {
        let mut failed = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            if compensator.compensate(step).await? {
                continue;
            }

            tracing::warn!(step = %step.id(), "compensation did not complete");
            failed.push(step.id().clone());

            if self.policy == UnwindPolicy::Abort {
                let skipped = &steps[index + 1..];
                if !skipped.is_empty() {
                    tracing::warn!(
                        skipped = skipped.len(),
                        "unwind aborted, remaining compensations not attempted"
                    );
                }
                failed.extend(skipped.iter().map(|s| s.id().clone()));
                break;
            }
        }

        Ok(failed)
    }
}
