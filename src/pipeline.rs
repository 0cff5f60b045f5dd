use crate::audit::{QualityAuditor, QualityReport};
use crate::config::Config;
use crate::db::models::{CanonicalObservation, NewIngestionRun, ObservationField};
use crate::db::schema::{CountFilter, IndexSpec, SchemaSpec};
use crate::db::store::ObservationStore;
use crate::error::Result;
use crate::loader::{BatchLoader, LoadStats};
use crate::normalizer::{Normalizer, Rejection};
use crate::source::{RawObject, RawSource};
use crate::stations::StationRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Line-level counters of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub objects: u64,
    pub objects_failed: u64,
    pub lines: u64,
    pub json_ok: u64,
    pub rejected: u64,
    pub rejected_by_reason: BTreeMap<Rejection, u64>,
    /// Bundle rows dropped for an unparseable timestamp.
    pub dropped_rows: u64,
    pub documents: u64,
    /// The observations export hit a write error and was abandoned.
    pub export_failed: bool,
}

/// Resolved parameters echoed into the report.
#[derive(Debug, Clone, Serialize)]
pub struct RunParams {
    pub source_tag: String,
    pub input: String,
    pub batch_size: usize,
    pub dry_run: bool,
    pub registry_path: String,
    pub stations_known: usize,
    pub output_path: String,
    pub observations_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Store contents read back after loading.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub total: u64,
    pub by_provider: BTreeMap<String, u64>,
    pub by_station: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: String,
    pub params: RunParams,
    pub run: RunStats,
    pub load: LoadStats,
    #[serde(flatten)]
    pub quality: QualityReport,
    pub store_summary: Option<StoreSummary>,
}

/// One finite ingestion run: read, normalize, load, audit, report.
pub struct Pipeline<'a, S: ObservationStore, R: RawSource> {
    config: &'a Config,
    store: &'a S,
    source: &'a R,
    registry: &'a StationRegistry,
    normalizer: Normalizer,
}

impl<'a, S: ObservationStore, R: RawSource> Pipeline<'a, S, R> {
    pub fn new(
        config: &'a Config,
        store: &'a S,
        source: &'a R,
        registry: &'a StationRegistry,
    ) -> Self {
        Self {
            config,
            store,
            source,
            registry,
            normalizer: Normalizer::from_config(&config.source),
        }
    }

    /// Execute the run and write the report.
    ///
    /// Store setup, reference seeding and the source listing are fatal; every
    /// later problem is counted in the report instead.
    pub async fn run(&self) -> Result<RunReport> {
        let started_at = Utc::now();
        info!(
            "Starting run '{}' from {} (batch size {}, dry run {})",
            self.config.source.tag,
            self.source.describe(),
            self.config.loader.batch_size,
            self.config.loader.dry_run
        );

        let seeded = self.store.seed_stations(self.registry.stations()).await?;
        info!(
            "Reference stations: {} known, {} newly stored",
            self.registry.len(),
            seeded
        );

        let mut loader = BatchLoader::new(self.store, &self.config.loader);
        loader
            .prepare(
                &SchemaSpec::observations(&self.config.quality.bounds),
                &IndexSpec::observation_defaults(),
            )
            .await?;

        let objects = self.source.list_objects().await?;

        let mut export = match &self.config.report.observations_path {
            Some(path) => Some(open_export(path)?),
            None => None,
        };

        let batch_size = self.config.loader.batch_size.max(1);
        let mut auditor = QualityAuditor::new(&self.config.quality, Some(self.registry));
        let mut stats = RunStats::default();
        let mut buffer: Vec<CanonicalObservation> = Vec::with_capacity(batch_size);

        for object in &objects {
            stats.objects += 1;
            let content = match self.source.read_object(object).await {
                Ok(content) => content,
                Err(e) => {
                    error!("Failed to read {}: {}", object.name, e);
                    stats.objects_failed += 1;
                    continue;
                }
            };

            let start = buffer.len();
            let produced = self.process_object(object, &content, &mut stats, &mut |obs| {
                auditor.observe(&obs);
                buffer.push(obs);
            });
            debug!("{}: {} documents", object.name, produced);

            if let Some(writer) = export.as_mut() {
                if let Err(e) = write_export(writer, &buffer[start..]) {
                    error!("Observations export failed, disabling it: {}", e);
                    stats.export_failed = true;
                }
            }
            if stats.export_failed {
                export = None;
            }

            // Batches go out in source order; a partial batch waits for the next object
            let full = buffer.len() - buffer.len() % batch_size;
            if full > 0 {
                loader.submit(&buffer[..full]).await;
                buffer.drain(..full);
            }
        }

        if !buffer.is_empty() {
            loader.submit(&buffer).await;
            buffer.clear();
        }

        if let Some(mut writer) = export.take() {
            if let Err(e) = writer.flush() {
                error!("Observations export failed on flush: {}", e);
                stats.export_failed = true;
            }
        }

        let load = loader.finish();
        let quality = auditor.finish();

        let store_summary = match summarize(self.store).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Could not read back store summary: {}", e);
                None
            }
        };

        let finished_at = Utc::now();
        let status = if stats.objects_failed == 0 && load.errors() == 0 && !stats.export_failed {
            "completed"
        } else {
            "completed_with_errors"
        };

        let ledger_row = NewIngestionRun {
            source_tag: self.config.source.tag.clone(),
            started_at,
            finished_at,
            lines_read: stats.lines as i64,
            json_ok: stats.json_ok as i64,
            rejected: stats.rejected as i64,
            documents: stats.documents as i64,
            inserted: load.inserted as i64,
            duplicates: load.duplicates as i64,
            errors: load.errors() as i64,
            status: status.to_string(),
        };
        if let Err(e) = self.store.record_run(&ledger_row).await {
            warn!("Could not record run in ledger: {}", e);
        }

        info!(
            "Run finished: {} lines, {} JSON ok, {} rejected, {} documents, {} inserted, {} duplicates, {} errors",
            stats.lines,
            stats.json_ok,
            stats.rejected,
            stats.documents,
            load.inserted,
            load.duplicates,
            load.errors()
        );
        info!(
            "Quality: {} rows, {} duplicate hashes, {} missing station refs, error rate {:.4}",
            quality.rows_total,
            quality.duplicate_hashes,
            quality.fk_missing_station,
            quality.error_rate_estimate
        );

        let report = RunReport {
            status: status.to_string(),
            params: RunParams {
                source_tag: self.config.source.tag.clone(),
                input: self.source.describe(),
                batch_size: self.config.loader.batch_size,
                dry_run: self.config.loader.dry_run,
                registry_path: self.config.stations.registry_path.display().to_string(),
                stations_known: self.registry.len(),
                output_path: self.config.report.output_path.display().to_string(),
                observations_path: self
                    .config
                    .report
                    .observations_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                started_at,
                finished_at,
            },
            run: stats,
            load,
            quality,
            store_summary,
        };

        write_report(&self.config.report.output_path, &report)?;
        info!("Report written to {}", self.config.report.output_path.display());

        Ok(report)
    }

    /// Normalize every line of one object, handing each observation to `emit`.
    fn process_object(
        &self,
        object: &RawObject,
        content: &str,
        stats: &mut RunStats,
        emit: &mut dyn FnMut(CanonicalObservation),
    ) -> u64 {
        let mut produced = 0;

        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            stats.lines += 1;

            match self.normalizer.normalize_line(line, Utc::now()) {
                Ok(normalized) => {
                    stats.json_ok += 1;
                    stats.dropped_rows += normalized.dropped_rows as u64;
                    for obs in normalized.observations {
                        produced += 1;
                        emit(obs);
                    }
                }
                Err(reason) => {
                    if reason != Rejection::InvalidJson {
                        stats.json_ok += 1;
                    }
                    stats.rejected += 1;
                    *stats.rejected_by_reason.entry(reason).or_insert(0) += 1;
                    warn!("{}:{} rejected: {}", object.name, line_no + 1, reason);
                }
            }
        }

        stats.documents += produced;
        produced
    }
}

async fn summarize<S: ObservationStore>(store: &S) -> Result<StoreSummary> {
    Ok(StoreSummary {
        total: store.count(&CountFilter::All).await?,
        by_provider: store
            .aggregate_group(ObservationField::StationProvider)
            .await?,
        by_station: store.aggregate_group(ObservationField::StationId).await?,
    })
}

fn open_export(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Append one JSON document per line and push it through to the file.
fn write_export(writer: &mut BufWriter<File>, observations: &[CanonicalObservation]) -> Result<()> {
    for obs in observations {
        serde_json::to_writer(&mut *writer, obs)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    Ok(())
}
