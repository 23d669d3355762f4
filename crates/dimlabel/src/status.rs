//! Query status values and the per-phase transition tracker.

use crate::error::{DimLabelError, Result};
use std::fmt;

/// Progress of a query phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    /// Not started.
    #[default]
    Uninitialized,
    /// Started, not yet finished.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl QueryStatus {
    /// Returns true once the phase has finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Upper-case name, matching the storage engine's status strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::InProgress => "INPROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one phase through `Uninitialized -> InProgress -> {Completed | Failed}`.
///
/// A finished phase may only be started again once the label pair it
/// runs against has been re-opened, observed as a new pair generation.
#[derive(Debug, Clone, Default)]
pub(crate) struct PhaseTracker {
    name: &'static str,
    status: QueryStatus,
    generation: u64,
}

impl PhaseTracker {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            status: QueryStatus::Uninitialized,
            generation: 0,
        }
    }

    pub(crate) fn status(&self) -> QueryStatus {
        self.status
    }

    /// Moves the phase to `InProgress`.
    ///
    /// # Errors
    ///
    /// Returns `OrderingViolation` if the phase is already running, or has
    /// finished against the same pair generation.
    pub(crate) fn begin(&mut self, generation: u64) -> Result<()> {
        match self.status {
            QueryStatus::Uninitialized => {}
            QueryStatus::InProgress => {
                return Err(DimLabelError::OrderingViolation(format!(
                    "{} phase is already in progress",
                    self.name
                )));
            }
            QueryStatus::Completed | QueryStatus::Failed => {
                if generation == self.generation {
                    return Err(DimLabelError::OrderingViolation(format!(
                        "{} phase already {}; re-open the label pair to run it again",
                        self.name, self.status
                    )));
                }
            }
        }
        self.status = QueryStatus::InProgress;
        self.generation = generation;
        Ok(())
    }

    /// Records the outcome of a running phase and passes it through.
    pub(crate) fn finish<T>(&mut self, outcome: Result<T>) -> Result<T> {
        self.status = if outcome.is_ok() {
            QueryStatus::Completed
        } else {
            QueryStatus::Failed
        };
        outcome
    }

    /// Marks a running phase as failed without an error value.
    pub(crate) fn fail(&mut self) {
        self.status = QueryStatus::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        let mut phase = PhaseTracker::new("resolve");
        assert_eq!(phase.status(), QueryStatus::Uninitialized);

        phase.begin(1).unwrap();
        assert_eq!(phase.status(), QueryStatus::InProgress);
        assert!(phase.begin(1).is_err());

        let value = phase.finish(Ok::<_, DimLabelError>(7)).unwrap();
        assert_eq!(value, 7);
        assert_eq!(phase.status(), QueryStatus::Completed);
    }

    #[test]
    fn test_finished_phase_requires_new_generation() {
        let mut phase = PhaseTracker::new("data");
        phase.begin(3).unwrap();
        let _ = phase.finish::<()>(Err(DimLabelError::BufferUnset("label".into())));
        assert_eq!(phase.status(), QueryStatus::Failed);

        let err = phase.begin(3).unwrap_err();
        assert!(matches!(err, DimLabelError::OrderingViolation(_)));

        phase.begin(4).unwrap();
        assert_eq!(phase.status(), QueryStatus::InProgress);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(QueryStatus::Completed.to_string(), "COMPLETED");
        assert!(QueryStatus::Failed.is_terminal());
        assert!(!QueryStatus::InProgress.is_terminal());
    }
}
