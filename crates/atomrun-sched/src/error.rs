//! Error handling for the runner, job stores and cleanup tools.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur while claiming, running and recording calculations.
///
/// A lost bid race is not an error: `Bidder::try_claim` reports it as
/// `Ok(false)`. Orphaned jobs are reported by the cleanup tools as
/// [`crate::cleanup::OrphanReport`] values, never raised.
#[derive(Error, Debug)]
pub enum SchedError {
    /// Creating or inspecting a claim marker failed for a reason other than
    /// an existing claim.
    #[error("Claim failed for {path}: {source}")]
    ClaimIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external calculation terminated abnormally or produced an
    /// unusable result.
    #[error("Calculation failed: {0}")]
    CalculationFailure(String),

    /// A job store operation failed in a way that may succeed on retry.
    #[error("Job store temporarily unavailable: {0}")]
    StoreTransient(String),

    /// A job store stayed unavailable for the whole retry budget.
    #[error("Job store unavailable after {attempts} attempts: {last}")]
    StoreUnavailable { attempts: u32, last: String },

    /// A record with that name already exists for the style.
    #[error("Duplicate record: {style}/{name}")]
    DuplicateRecord { style: String, name: String },

    /// No record with that name exists for the style.
    #[error("Record not found: {style}/{name}")]
    RecordNotFound { style: String, name: String },

    /// No archived blob exists for the record.
    #[error("Blob not found: {style}/{name}")]
    BlobNotFound { style: String, name: String },

    /// Invalid record status for the requested transition.
    #[error("Invalid transition: cannot {action} a record that is {found}")]
    InvalidTransition { action: String, found: String },

    /// No calculation is registered for the style.
    #[error("Unknown calculation style: {0}")]
    UnknownCalculation(String),

    /// The database name is not present in the settings.
    #[error("Unknown database: {0}")]
    UnknownDatabase(String),

    /// The run directory name is not present in the settings.
    #[error("Unknown run directory: {0}")]
    UnknownRunDirectory(String),

    /// A pooled worker task panicked or was cancelled.
    #[error("Worker task failed: {0}")]
    TaskFailed(String),

    /// A duration string could not be parsed.
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// A job archive could not be built or unpacked.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// SQLite database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// HTTP error from the remote job store.
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML settings error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml_ng::Error),
}

impl SchedError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedError::StoreTransient(_))
    }

    /// Whether the error is a consistency error of the job store that must
    /// be surfaced instead of retried.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            SchedError::DuplicateRecord { .. }
                | SchedError::RecordNotFound { .. }
                | SchedError::BlobNotFound { .. }
        )
    }

    pub(crate) fn duplicate(style: &str, name: &str) -> Self {
        SchedError::DuplicateRecord {
            style: style.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn not_found(style: &str, name: &str) -> Self {
        SchedError::RecordNotFound {
            style: style.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn blob_not_found(style: &str, name: &str) -> Self {
        SchedError::BlobNotFound {
            style: style.to_string(),
            name: name.to_string(),
        }
    }
}

impl From<rusqlite::Error> for SchedError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                SchedError::StoreTransient(e.to_string())
            }
            _ => SchedError::DatabaseError(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for SchedError {
    fn from(e: reqwest::Error) -> Self {
        let transient = e.is_timeout()
            || e.is_connect()
            || e.is_request()
            || e.status().is_some_and(|s| s.is_server_error());

        if transient {
            SchedError::StoreTransient(e.to_string())
        } else {
            SchedError::Http(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::duplicate("calculation_E_vs_r_scan", "job-123");
        assert_eq!(
            err.to_string(),
            "Duplicate record: calculation_E_vs_r_scan/job-123"
        );

        let err = SchedError::InvalidTransition {
            action: "mark running".to_string(),
            found: "finished".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition: cannot mark running a record that is finished"
        );

        let err = SchedError::StoreUnavailable {
            attempts: 5,
            last: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Job store unavailable after 5 attempts: connection refused"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(SchedError::StoreTransient("timeout".into()).is_transient());
        assert!(!SchedError::not_found("s", "n").is_transient());
        assert!(SchedError::not_found("s", "n").is_logical());
        assert!(SchedError::duplicate("s", "n").is_logical());
        assert!(!SchedError::CalculationFailure("boom".into()).is_logical());
    }
}
