use crate::db::models::{CanonicalObservation, NewIngestionRun, ObservationField, Station};
use crate::db::schema::{CountFilter, IndexSpec, SchemaSpec};
use crate::error::{AppError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Outcome class of one submitted record that was not inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DuplicateKey,
    SchemaValidation,
    TransportError,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::DuplicateKey => "duplicate_key",
            FailureKind::SchemaValidation => "schema_validation",
            FailureKind::TransportError => "transport_error",
            FailureKind::Other => "other",
        }
    }

    /// Map a PostgreSQL error onto the failure classes.
    ///
    /// SQLSTATE 23505 is a duplicate; check and not-null violations, invalid
    /// text representation (22P02), numeric out of range (22003) and datetime
    /// errors (22007, 22008) are validation failures; connection-level errors
    /// are transport failures.
    pub fn classify(err: &sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        match err {
            sqlx::Error::Database(db_err) => match db_err.kind() {
                ErrorKind::UniqueViolation => FailureKind::DuplicateKey,
                ErrorKind::CheckViolation | ErrorKind::NotNullViolation => {
                    FailureKind::SchemaValidation
                }
                _ => match db_err.code().as_deref() {
                    Some("22P02") | Some("22003") | Some("22007") | Some("22008") => {
                        FailureKind::SchemaValidation
                    }
                    _ => FailureKind::Other,
                },
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => FailureKind::TransportError,
            _ => FailureKind::Other,
        }
    }

    pub fn from_app_error(err: &AppError) -> Self {
        match err {
            AppError::Database(db_err) => Self::classify(db_err),
            AppError::Io(_) | AppError::Http(_) => FailureKind::TransportError,
            _ => FailureKind::Other,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record of a batch that was neither inserted nor a duplicate.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    /// Position within the submitted slice.
    pub index: usize,
    pub record_hash: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub duplicates: u64,
    pub failures: Vec<ItemFailure>,
}

impl UpsertOutcome {
    /// Count a rejected record; duplicates are tallied, not kept as failures.
    pub fn record_failure(
        &mut self,
        index: usize,
        record: &CanonicalObservation,
        kind: FailureKind,
        message: impl Into<String>,
    ) {
        if kind == FailureKind::DuplicateKey {
            self.duplicates += 1;
            return;
        }
        self.failures.push(ItemFailure {
            index,
            record_hash: record.record_hash.clone(),
            kind,
            message: message.into(),
        });
    }

    pub fn errors_by_type(&self) -> BTreeMap<FailureKind, u64> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Every submitted record ends up in exactly one bucket.
    pub fn accounted(&self) -> u64 {
        self.inserted + self.duplicates + self.failures.len() as u64
    }
}

/// Destination of canonical observations.
///
/// `upsert_many` is first-write-wins on `key`: a record whose key is already
/// stored is a duplicate and leaves the stored row untouched. Per-record
/// rejections are reported in the outcome; `Err` means the whole call failed
/// and none of the records can be assumed stored.
#[allow(async_fn_in_trait)]
pub trait ObservationStore {
    async fn ensure_schema(&self, spec: &SchemaSpec) -> Result<()>;

    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> Result<()>;

    async fn upsert_many(
        &self,
        records: &[CanonicalObservation],
        key: ObservationField,
    ) -> Result<UpsertOutcome>;

    async fn count(&self, filter: &CountFilter) -> Result<u64>;

    /// Row count per distinct value of `field`; nulls are grouped under `"null"`.
    async fn aggregate_group(&self, field: ObservationField) -> Result<BTreeMap<String, u64>>;

    /// Insert reference stations that are not stored yet. Returns the number added.
    async fn seed_stations(&self, stations: &[Station]) -> Result<u64>;

    async fn record_run(&self, run: &NewIngestionRun) -> Result<()>;
}
