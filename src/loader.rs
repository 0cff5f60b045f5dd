use crate::config::LoaderConfig;
use crate::db::models::{CanonicalObservation, ObservationField};
use crate::db::schema::{IndexSpec, SchemaSpec};
use crate::db::store::{FailureKind, ItemFailure, ObservationStore, UpsertOutcome};
use crate::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Running totals of everything submitted through a [`BatchLoader`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    pub batches: u64,
    pub submitted: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub errors_by_type: BTreeMap<FailureKind, u64>,
    /// First failures of the run, bounded by `failure_sample_size`.
    pub samples: Vec<ItemFailure>,
}

impl LoadStats {
    pub fn errors(&self) -> u64 {
        self.errors_by_type.values().sum()
    }

    fn absorb(&mut self, outcome: UpsertOutcome, offset: u64, sample_size: usize) {
        self.inserted += outcome.inserted;
        self.duplicates += outcome.duplicates;
        for (kind, count) in outcome.errors_by_type() {
            *self.errors_by_type.entry(kind).or_insert(0) += count;
        }
        for mut failure in outcome.failures {
            if self.samples.len() >= sample_size {
                break;
            }
            failure.index += offset as usize;
            self.samples.push(failure);
        }
    }
}

/// Submits observations to a store in bounded, unordered batches keyed on
/// `record_hash`. Submission never aborts: a failed batch is counted item by
/// item and the next batch goes out regardless.
pub struct BatchLoader<'a, S: ObservationStore> {
    store: &'a S,
    batch_size: usize,
    sample_size: usize,
    key: ObservationField,
    stats: LoadStats,
}

impl<'a, S: ObservationStore> BatchLoader<'a, S> {
    pub fn new(store: &'a S, config: &LoaderConfig) -> Self {
        Self {
            store,
            batch_size: config.batch_size.max(1),
            sample_size: config.failure_sample_size,
            key: ObservationField::RecordHash,
            stats: LoadStats::default(),
        }
    }

    /// Establish table constraints and indexes. Must succeed before loading.
    pub async fn prepare(&self, spec: &SchemaSpec, indexes: &[IndexSpec]) -> Result<()> {
        self.store.ensure_schema(spec).await?;
        self.store.ensure_indexes(indexes).await?;
        info!(
            "Store prepared: table {} with {} indexes",
            spec.table,
            indexes.len()
        );
        Ok(())
    }

    pub async fn submit(&mut self, records: &[CanonicalObservation]) {
        for chunk in records.chunks(self.batch_size) {
            self.submit_batch(chunk).await;
        }
    }

    async fn submit_batch(&mut self, batch: &[CanonicalObservation]) {
        let offset = self.stats.submitted;
        self.stats.batches += 1;
        self.stats.submitted += batch.len() as u64;

        let outcome = match self.store.upsert_many(batch, self.key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let kind = FailureKind::from_app_error(&e);
                warn!(
                    "Batch {} ({} records) failed as a whole, counted as {}: {}",
                    self.stats.batches,
                    batch.len(),
                    kind,
                    e
                );
                let mut outcome = UpsertOutcome::default();
                let message = e.to_string();
                for (index, record) in batch.iter().enumerate() {
                    outcome.record_failure(index, record, kind, message.clone());
                }
                outcome
            }
        };

        debug!(
            "Batch {}: {} submitted, {} inserted, {} duplicates, {} failed",
            self.stats.batches,
            batch.len(),
            outcome.inserted,
            outcome.duplicates,
            outcome.failures.len()
        );

        self.stats.absorb(outcome, offset, self.sample_size);
    }

    pub fn finish(self) -> LoadStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityBounds;
    use crate::db::memory::MemoryStore;
    use crate::db::models::{Measurements, StationProvider};
    use chrono::{Duration, TimeZone, Utc};

    fn observations(n: usize, humidity: f64) -> Vec<CanonicalObservation> {
        let start = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                CanonicalObservation::new(
                    "API_HOURLY_RUN",
                    "07015",
                    StationProvider::HourlyApi,
                    start + Duration::hours(i as i64),
                    Measurements {
                        humidity_pct: Some(humidity),
                        ..Default::default()
                    },
                    Utc::now(),
                    None,
                )
            })
            .collect()
    }

    fn config(batch_size: usize, failure_sample_size: usize) -> LoaderConfig {
        LoaderConfig {
            batch_size,
            failure_sample_size,
            dry_run: true,
        }
    }

    async fn prepared<'a>(store: &'a MemoryStore, config: &LoaderConfig) -> BatchLoader<'a, MemoryStore> {
        let loader = BatchLoader::new(store, config);
        loader
            .prepare(
                &SchemaSpec::observations(&QualityBounds::default()),
                &IndexSpec::observation_defaults(),
            )
            .await
            .unwrap();
        loader
    }

    #[tokio::test]
    async fn test_splits_into_bounded_batches() {
        let store = MemoryStore::new();
        let config = config(4, 10);
        let mut loader = prepared(&store, &config).await;

        loader.submit(&observations(10, 50.0)).await;

        let stats = loader.finish();
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.inserted, 10);
        assert_eq!(stats.errors(), 0);
    }

    #[tokio::test]
    async fn test_replay_counts_duplicates() {
        let store = MemoryStore::new();
        let config = config(500, 10);
        let records = observations(6, 50.0);

        let mut first = prepared(&store, &config).await;
        first.submit(&records).await;
        let first = first.finish();

        let mut second = prepared(&store, &config).await;
        second.submit(&records).await;
        let second = second.finish();

        assert_eq!(first.inserted, 6);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, first.inserted);
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn test_failure_samples_are_bounded_and_indexed_across_batches() {
        let store = MemoryStore::new();
        let config = config(3, 2);
        let mut loader = prepared(&store, &config).await;

        let mut records = observations(3, 50.0);
        records.extend(observations(5, 150.0).into_iter().skip(3));
        loader.submit(&records).await;

        let stats = loader.finish();
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.errors_by_type[&FailureKind::SchemaValidation], 2);
        assert_eq!(stats.samples.len(), 2);
        assert_eq!(stats.samples[0].index, 3);
        assert_eq!(stats.samples[1].index, 4);
    }

    #[tokio::test]
    async fn test_transport_failure_does_not_abort() {
        let store = MemoryStore::new();
        let config = config(2, 10);
        let mut loader = prepared(&store, &config).await;

        store.set_offline(true);
        loader.submit(&observations(2, 50.0)).await;
        store.set_offline(false);
        loader.submit(&observations(4, 50.0)[2..]).await;

        let stats = loader.finish();
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.errors_by_type[&FailureKind::TransportError], 2);
        assert_eq!(stats.inserted, 2);
    }

    #[tokio::test]
    async fn test_transport_failed_records_load_on_replay() {
        let store = MemoryStore::new();
        let config = config(10, 10);
        let records = observations(3, 50.0);

        let mut loader = prepared(&store, &config).await;
        store.set_offline(true);
        loader.submit(&records).await;
        store.set_offline(false);
        loader.submit(&records).await;

        let stats = loader.finish();
        assert_eq!(stats.errors(), 3);
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.duplicates, 0);
    }
}
