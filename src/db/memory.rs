use crate::db::models::{CanonicalObservation, NewIngestionRun, ObservationField, Station};
use crate::db::schema::{CountFilter, IndexSpec, SchemaSpec};
use crate::db::store::{FailureKind, ObservationStore, UpsertOutcome};
use crate::error::{AppError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Process-local store with the same contract as the PostgreSQL repository.
///
/// Backs dry runs and tests. Schema rules registered through `ensure_schema`
/// are checked on every insert.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    schema: Option<SchemaSpec>,
    indexes: Vec<IndexSpec>,
    rows: Vec<CanonicalObservation>,
    /// Stored keys per conflict field.
    keys: HashMap<ObservationField, HashSet<String>>,
    stations: BTreeMap<String, Station>,
    runs: Vec<NewIngestionRun>,
    offline: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connected(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let state = self.lock();
        if state.offline {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory store is offline",
            )));
        }
        Ok(state)
    }

    /// Simulate losing the connection: every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn observations(&self) -> Vec<CanonicalObservation> {
        self.lock().rows.clone()
    }

    pub fn get(&self, record_hash: &str) -> Option<CanonicalObservation> {
        self.lock()
            .rows
            .iter()
            .find(|row| row.record_hash == record_hash)
            .cloned()
    }

    pub fn stations(&self) -> Vec<Station> {
        self.lock().stations.values().cloned().collect()
    }

    pub fn runs(&self) -> Vec<NewIngestionRun> {
        self.lock().runs.clone()
    }

    pub fn indexes(&self) -> Vec<IndexSpec> {
        self.lock().indexes.clone()
    }
}

impl ObservationStore for MemoryStore {
    async fn ensure_schema(&self, spec: &SchemaSpec) -> Result<()> {
        let mut state = self.connected()?;
        if state.schema.is_none() {
            state.schema = Some(spec.clone());
        }
        Ok(())
    }

    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> Result<()> {
        let mut state = self.connected()?;
        for index in indexes {
            if !state.indexes.iter().any(|existing| existing.name == index.name) {
                state.indexes.push(index.clone());
            }
        }
        Ok(())
    }

    async fn upsert_many(
        &self,
        records: &[CanonicalObservation],
        key: ObservationField,
    ) -> Result<UpsertOutcome> {
        let mut guard = self.connected()?;
        let state = &mut *guard;

        if !state.keys.contains_key(&key) {
            let existing = state
                .rows
                .iter()
                .filter_map(|row| row.display_value(key))
                .collect();
            state.keys.insert(key, existing);
        }

        let mut outcome = UpsertOutcome::default();
        for (index, record) in records.iter().enumerate() {
            let Some(key_value) = record.display_value(key) else {
                outcome.record_failure(
                    index,
                    record,
                    FailureKind::SchemaValidation,
                    format!("{} is required", key),
                );
                continue;
            };

            if state.keys.get(&key).is_some_and(|keys| keys.contains(&key_value)) {
                outcome.record_failure(index, record, FailureKind::DuplicateKey, "key exists");
                continue;
            }

            if let Some(schema) = &state.schema {
                if let Err(reason) = schema.check(record) {
                    outcome.record_failure(index, record, FailureKind::SchemaValidation, reason);
                    continue;
                }
            }

            for (field, keys) in state.keys.iter_mut() {
                if let Some(value) = record.display_value(*field) {
                    keys.insert(value);
                }
            }
            state.rows.push(record.clone());
            outcome.inserted += 1;
        }

        debug!(
            "Memory upsert: {} inserted, {} duplicates, {} failed",
            outcome.inserted,
            outcome.duplicates,
            outcome.failures.len()
        );
        Ok(outcome)
    }

    async fn count(&self, filter: &CountFilter) -> Result<u64> {
        let state = self.connected()?;
        Ok(state.rows.iter().filter(|row| filter.matches(row)).count() as u64)
    }

    async fn aggregate_group(&self, field: ObservationField) -> Result<BTreeMap<String, u64>> {
        let state = self.connected()?;
        let mut groups = BTreeMap::new();
        for row in &state.rows {
            let value = row.display_value(field).unwrap_or_else(|| "null".to_string());
            *groups.entry(value).or_insert(0) += 1;
        }
        Ok(groups)
    }

    async fn seed_stations(&self, stations: &[Station]) -> Result<u64> {
        let mut state = self.connected()?;
        let mut added = 0;
        for station in stations {
            if !state.stations.contains_key(&station.station_id) {
                state
                    .stations
                    .insert(station.station_id.clone(), station.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn record_run(&self, run: &NewIngestionRun) -> Result<()> {
        let mut state = self.connected()?;
        state.runs.push(run.clone());
        Ok(())
    }
}
