//! Calculation records and their status machine.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SchedError, SchedResult};

/// Status of a calculation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Prepared and waiting for a runner.
    NotCalculated,

    /// Claimed by a runner and executing.
    Running,

    /// Completed with a results payload.
    Finished,

    /// Completed with an error message.
    Error,
}

impl RecordStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RecordStatus; 4] = [
        RecordStatus::NotCalculated,
        RecordStatus::Running,
        RecordStatus::Finished,
        RecordStatus::Error,
    ];

    /// Check if the record is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Finished | RecordStatus::Error)
    }

    /// Get the serialized status name.
    pub fn name(&self) -> &'static str {
        match self {
            RecordStatus::NotCalculated => "not_calculated",
            RecordStatus::Running => "running",
            RecordStatus::Finished => "finished",
            RecordStatus::Error => "error",
        }
    }

    /// Parse a serialized status name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.name() == s)
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The durable counterpart of a job directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationRecord {
    /// Unique record name, equal to the job directory name.
    pub name: String,

    /// Record style; the partition of the job store it lives in.
    pub style: String,

    /// Calculation style that executes the job.
    pub calc_style: String,

    /// Current status.
    pub status: RecordStatus,

    /// Error message, set when the status is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Results payload, set when the status is `finished`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,

    /// Metadata used by query filters.
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl CalculationRecord {
    /// Create a new `not_calculated` record.
    pub fn new(
        name: impl Into<String>,
        style: impl Into<String>,
        calc_style: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            style: style.into(),
            calc_style: calc_style.into(),
            status: RecordStatus::NotCalculated,
            error: None,
            results: None,
            metadata: FxHashMap::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Transition `not_calculated` → `running`.
    pub fn mark_running(&mut self) -> SchedResult<()> {
        if self.status != RecordStatus::NotCalculated {
            return Err(self.invalid("mark running"));
        }
        self.status = RecordStatus::Running;
        self.touch();
        Ok(())
    }

    /// Transition to `finished` with a results payload.
    pub fn mark_finished(&mut self, results: Value) -> SchedResult<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("mark finished"));
        }
        self.status = RecordStatus::Finished;
        self.results = Some(results);
        self.error = None;
        self.touch();
        Ok(())
    }

    /// Transition to `error` with a message.
    pub fn mark_error(&mut self, message: impl Into<String>) -> SchedResult<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("mark error"));
        }
        self.status = RecordStatus::Error;
        self.error = Some(message.into());
        self.results = None;
        self.touch();
        Ok(())
    }

    /// Return an `error` or `running` record to `not_calculated`.
    pub fn reset(&mut self) -> SchedResult<()> {
        if !matches!(self.status, RecordStatus::Error | RecordStatus::Running) {
            return Err(self.invalid("reset"));
        }
        self.status = RecordStatus::NotCalculated;
        self.error = None;
        self.results = None;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn invalid(&self, action: &str) -> SchedError {
        SchedError::InvalidTransition {
            action: action.to_string(),
            found: self.status.name().to_string(),
        }
    }
}

/// Filter for querying records.
///
/// Backends without native query support evaluate [`RecordFilter::matches`]
/// on each record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Allowed statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Vec<RecordStatus>>,

    /// Allowed record names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,

    /// Allowed calculation styles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calc_style: Option<Vec<String>>,

    /// Metadata membership; a single-element list is an equality test.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub metadata: FxHashMap<String, Vec<Value>>,

    /// Maximum number of results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Create a filter matching every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Create a filter for a single status.
    pub fn status(status: RecordStatus) -> Self {
        Self {
            status: Some(vec![status]),
            ..Default::default()
        }
    }

    /// Filter by status membership.
    pub fn with_status(mut self, status: impl IntoIterator<Item = RecordStatus>) -> Self {
        self.status = Some(status.into_iter().collect());
        self
    }

    /// Filter by name membership.
    pub fn with_names(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by calculation style.
    pub fn with_calc_style(mut self, calc_style: impl Into<String>) -> Self {
        self.calc_style
            .get_or_insert_with(Vec::new)
            .push(calc_style.into());
        self
    }

    /// Require a metadata key to equal a value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), vec![value.into()]);
        self
    }

    /// Require a metadata key to take one of several values.
    pub fn with_metadata_in(
        mut self,
        key: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        self.metadata
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Limit results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check if a record matches this filter. The limit is not applied here.
    pub fn matches(&self, record: &CalculationRecord) -> bool {
        if let Some(ref statuses) = self.status {
            if !statuses.contains(&record.status) {
                return false;
            }
        }

        if let Some(ref names) = self.names {
            if !names.iter().any(|n| n == &record.name) {
                return false;
            }
        }

        if let Some(ref styles) = self.calc_style {
            if !styles.iter().any(|s| s == &record.calc_style) {
                return false;
            }
        }

        self.metadata.iter().all(|(key, allowed)| {
            record
                .metadata
                .get(key)
                .is_some_and(|value| allowed.contains(value))
        })
    }

    /// Apply the filter and limit to a sequence of records.
    pub fn apply(&self, records: impl IntoIterator<Item = CalculationRecord>) -> Vec<CalculationRecord> {
        let matching = records.into_iter().filter(|r| self.matches(r));
        match self.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }
}
