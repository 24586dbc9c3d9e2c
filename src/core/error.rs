/// Error taxonomy for capture, archive, catalog and restore operations
///
/// Every variant names the snapshot involved so an operator can decide the
/// next action from the message alone.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::restore::{RestoreState, RestoreStep};

#[derive(Debug, Error)]
pub enum BackupError {
    /// Capture-time failure against a live component
    #[error("extraction failed for {snapshot} during the {step} step: {reason}")]
    Extraction {
        snapshot: String,
        step: &'static str,
        reason: String,
    },

    /// Compression or extraction of an archive failed
    #[error("archive operation failed for {snapshot}: {reason}")]
    Archive { snapshot: String, reason: String },

    /// Requested snapshot does not resolve in the backup root
    #[error(
        "snapshot '{requested}' not found in {}; available: {}",
        .root.display(),
        list_or_none(.available)
    )]
    NotFound {
        requested: String,
        root: PathBuf,
        available: Vec<String>,
    },

    /// A restore step failed; the stack was left at `last_completed`
    #[error(
        "restore of {snapshot} failed at step '{failed_step}' (last completed state: {last_completed}): {reason}"
    )]
    Restore {
        snapshot: String,
        last_completed: RestoreState,
        failed_step: RestoreStep,
        reason: String,
        /// States entered before the failure, ending in `Failed`
        history: Vec<RestoreState>,
    },
}

impl BackupError {
    pub fn extraction(snapshot: impl ToString, step: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Extraction {
            snapshot: snapshot.to_string(),
            step,
            reason: format!("{:#}", reason),
        }
    }

    pub fn archive(snapshot: impl ToString, reason: impl std::fmt::Display) -> Self {
        Self::Archive {
            snapshot: snapshot.to_string(),
            reason: format!("{:#}", reason),
        }
    }

    pub fn restore(
        snapshot: impl ToString,
        last_completed: RestoreState,
        failed_step: RestoreStep,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Restore {
            snapshot: snapshot.to_string(),
            last_completed,
            failed_step,
            reason: format!("{:#}", reason),
            history: Vec::new(),
        }
    }

    /// Record the path a failed restore took. Other variants are returned unchanged.
    pub fn with_history(mut self, states: Vec<RestoreState>) -> Self {
        if let Self::Restore { history, .. } = &mut self {
            *history = states;
        }
        self
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_lists_alternatives() {
        let err = BackupError::NotFound {
            requested: "full_20250101_000000".to_string(),
            root: PathBuf::from("/srv/backups"),
            available: vec![
                "full_20250301_120000".to_string(),
                "full_20250302_120000".to_string(),
            ],
        };

        let message = err.to_string();
        assert!(message.contains("full_20250101_000000"));
        assert!(message.contains("full_20250301_120000, full_20250302_120000"));
    }

    #[test]
    fn test_not_found_without_alternatives() {
        let err = BackupError::NotFound {
            requested: "x".to_string(),
            root: PathBuf::from("/tmp"),
            available: vec![],
        };
        assert!(err.to_string().ends_with("available: none"));
    }

    #[test]
    fn test_restore_error_names_state_and_step() {
        let err = BackupError::restore(
            "full_20250301_120000",
            RestoreState::Stopped,
            RestoreStep::ReplayDatabase,
            "psql exited with status 3",
        );

        let message = err.to_string();
        assert!(message.contains("replay database"));
        assert!(message.contains("stopped"));
        assert!(message.contains("full_20250301_120000"));
    }
}
