use crate::db::models::{
    CanonicalObservation, FieldKind, IngestionRun, NewIngestionRun, ObservationField, Station,
};
use crate::db::schema::{CountFilter, IndexSpec, SchemaSpec, OBSERVATIONS_TABLE};
use crate::db::store::{FailureKind, ObservationStore, UpsertOutcome};
use crate::error::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// PostgreSQL-backed [`ObservationStore`].
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub async fn get_station(&self, station_id: &str) -> Result<Option<Station>> {
        let station = sqlx::query_as::<_, Station>(
            r#"
            SELECT station_id, name, latitude, longitude, elevation_m,
                   city, provider, hardware, software
            FROM stations WHERE station_id = $1
            "#,
        )
        .bind(station_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(station)
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<IngestionRun>> {
        let runs = sqlx::query_as::<_, IngestionRun>(
            r#"
            SELECT id, source_tag, started_at, finished_at, lines_read, json_ok,
                   rejected, documents, inserted, duplicates, errors, status
            FROM ingestion_runs
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    /// Row-by-row replay of a batch the multi-row statement could not apply,
    /// so that each record gets its own outcome.
    async fn upsert_rows(
        &self,
        records: &[CanonicalObservation],
        key: ObservationField,
    ) -> UpsertOutcome {
        let mut outcome = UpsertOutcome::default();

        for (index, record) in records.iter().enumerate() {
            let mut query_builder = insert_statement(std::slice::from_ref(record), key);
            match query_builder
                .build_query_scalar::<String>()
                .fetch_optional(&self.pool)
                .await
            {
                Ok(Some(_)) => outcome.inserted += 1,
                Ok(None) => outcome.duplicates += 1,
                Err(e) => {
                    let kind = FailureKind::classify(&e);
                    debug!("Row {} ({}) rejected as {}: {}", index, record.record_hash, kind, e);
                    outcome.record_failure(index, record, kind, e.to_string());
                }
            }
        }

        outcome
    }
}

/// Multi-row insert of all observation columns, first write wins on `key`.
///
/// Returns the key of every row actually inserted; conflicting rows are
/// skipped silently and show up as missing keys.
fn insert_statement(
    records: &[CanonicalObservation],
    key: ObservationField,
) -> QueryBuilder<'static, Postgres> {
    let columns: Vec<&str> = ObservationField::ALL.iter().map(|f| f.as_str()).collect();

    let mut query_builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        OBSERVATIONS_TABLE,
        columns.join(", ")
    ));

    query_builder.push_values(records, |mut b, obs| {
        for field in ObservationField::ALL {
            match field.kind() {
                FieldKind::Text => {
                    b.push_bind(obs.text(field));
                }
                FieldKind::Number => {
                    b.push_bind(obs.number(field));
                }
                FieldKind::Instant => {
                    b.push_bind(obs.instant(field));
                }
            }
        }
    });

    query_builder.push(format!(
        " ON CONFLICT ({key}) DO NOTHING RETURNING {key}::text",
        key = key.as_str()
    ));

    query_builder
}

impl ObservationStore for Repository {
    async fn ensure_schema(&self, spec: &SchemaSpec) -> Result<()> {
        debug!("Ensuring table {}", spec.table);
        sqlx::query(&spec.create_table_sql())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> Result<()> {
        for index in indexes {
            debug!("Ensuring index {}", index.name);
            sqlx::query(&index.create_sql()).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_many(
        &self,
        records: &[CanonicalObservation],
        key: ObservationField,
    ) -> Result<UpsertOutcome> {
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let mut query_builder = insert_statement(records, key);
        let result = query_builder
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await;

        match result {
            Ok(inserted_keys) => {
                let inserted = inserted_keys.len() as u64;
                Ok(UpsertOutcome {
                    inserted,
                    duplicates: records.len() as u64 - inserted,
                    failures: Vec::new(),
                })
            }
            Err(e) if FailureKind::classify(&e) == FailureKind::TransportError => Err(e.into()),
            Err(e) => {
                warn!(
                    "Batch of {} rejected as a whole ({}), replaying row by row",
                    records.len(),
                    e
                );
                Ok(self.upsert_rows(records, key).await)
            }
        }
    }

    async fn count(&self, filter: &CountFilter) -> Result<u64> {
        let mut query_builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", OBSERVATIONS_TABLE));

        match filter {
            CountFilter::All => {}
            CountFilter::Equals(field, value) => {
                query_builder.push(format!(" WHERE {}::text = ", field.as_str()));
                query_builder.push_bind(value.clone());
            }
            CountFilter::Missing(field) => {
                query_builder.push(format!(" WHERE {} IS NULL", field.as_str()));
            }
        }

        let count = query_builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn aggregate_group(&self, field: ObservationField) -> Result<BTreeMap<String, u64>> {
        let sql = format!(
            "SELECT COALESCE({col}::text, 'null'), COUNT(*) FROM {table} GROUP BY 1 ORDER BY 1",
            col = field.as_str(),
            table = OBSERVATIONS_TABLE
        );
        let rows = sqlx::query_as::<_, (String, i64)>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(value, count)| (value, count as u64))
            .collect())
    }

    /// Stations are immutable once stored: conflicts are skipped, never updated.
    async fn seed_stations(&self, stations: &[Station]) -> Result<u64> {
        if stations.is_empty() {
            return Ok(0);
        }

        let mut query_builder = QueryBuilder::new(
            "INSERT INTO stations (station_id, name, latitude, longitude, elevation_m, \
             city, provider, hardware, software) ",
        );

        query_builder.push_values(stations, |mut b, station| {
            b.push_bind(&station.station_id)
                .push_bind(&station.name)
                .push_bind(station.latitude)
                .push_bind(station.longitude)
                .push_bind(station.elevation_m)
                .push_bind(&station.city)
                .push_bind(&station.provider)
                .push_bind(&station.hardware)
                .push_bind(&station.software);
        });

        query_builder.push(" ON CONFLICT (station_id) DO NOTHING");

        let result = query_builder.build().execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    async fn record_run(&self, run: &NewIngestionRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_runs
                (source_tag, started_at, finished_at, lines_read, json_ok, rejected,
                 documents, inserted, duplicates, errors, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&run.source_tag)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.lines_read)
        .bind(run.json_ok)
        .bind(run.rejected)
        .bind(run.documents)
        .bind(run.inserted)
        .bind(run.duplicates)
        .bind(run.errors)
        .bind(&run.status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
