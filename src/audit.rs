//! Data-quality audit over a set of observation documents.
//!
//! Documents are inspected as JSON objects so the same checks apply to
//! freshly normalized observations and to exported files read back from
//! disk: a required key can be missing, present but null, or hold a value
//! of the wrong type.

use crate::config::{QualityBounds, QualityConfig};
use crate::db::models::{CanonicalObservation, FieldKind, ObservationField};
use crate::error::Result;
use crate::hasher::is_sha256_hex;
use crate::stations::StationRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DateRange {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityReport {
    pub rows_total: u64,
    pub providers: BTreeMap<String, u64>,
    pub stations: BTreeMap<String, u64>,
    /// Required fields whose key is absent or whose text is blank.
    pub missing_fields: BTreeMap<String, u64>,
    /// Required fields present with a null value.
    pub nulls: BTreeMap<String, u64>,
    pub type_mismatches: BTreeMap<String, u64>,
    pub duplicate_hashes: u64,
    pub min: BTreeMap<String, f64>,
    pub max: BTreeMap<String, f64>,
    pub range_violations: BTreeMap<String, u64>,
    pub unknown_station_ids: u64,
    pub fk_missing_station: u64,
    pub fk_check_enabled: bool,
    pub date_range: Option<DateRange>,
    /// Lines of an audited file that were not JSON objects.
    pub invalid_documents: u64,
    pub error_rate_estimate: f64,
}

impl QualityReport {
    pub fn total_missing_required(&self) -> u64 {
        self.missing_fields.values().sum::<u64>() + self.nulls.values().sum::<u64>()
    }

    pub fn total_type_mismatches(&self) -> u64 {
        self.type_mismatches.values().sum()
    }

    pub fn total_range_violations(&self) -> u64 {
        self.range_violations.values().sum()
    }

    fn compute_error_rate(&mut self) {
        let problems = self.duplicate_hashes
            + self.total_missing_required()
            + self.total_type_mismatches()
            + self.total_range_violations()
            + self.unknown_station_ids
            + self.fk_missing_station;
        self.error_rate_estimate = problems as f64 / self.rows_total.max(1) as f64;
    }
}

/// Incremental auditor: feed documents one at a time, then [`finish`](Self::finish).
pub struct QualityAuditor<'a> {
    bounds: QualityBounds,
    unknown_ids: HashSet<String>,
    registry: Option<&'a StationRegistry>,
    seen_hashes: HashSet<String>,
    report: QualityReport,
}

impl<'a> QualityAuditor<'a> {
    pub fn new(quality: &QualityConfig, registry: Option<&'a StationRegistry>) -> Self {
        Self {
            bounds: quality.bounds.clone(),
            unknown_ids: quality.unknown_station_ids.iter().cloned().collect(),
            registry,
            seen_hashes: HashSet::new(),
            report: QualityReport {
                fk_check_enabled: registry.is_some(),
                ..Default::default()
            },
        }
    }

    pub fn observe(&mut self, obs: &CanonicalObservation) {
        match serde_json::to_value(obs) {
            Ok(Value::Object(doc)) => self.observe_document(&doc),
            Ok(_) => self.report.invalid_documents += 1,
            Err(e) => {
                warn!("Could not render observation {} for audit: {}", obs.record_hash, e);
                self.report.invalid_documents += 1;
            }
        }
    }

    pub fn observe_document(&mut self, doc: &Map<String, Value>) {
        let report = &mut self.report;
        report.rows_total += 1;

        *report
            .providers
            .entry(group_key(doc.get(ObservationField::StationProvider.as_str())))
            .or_insert(0) += 1;
        *report
            .stations
            .entry(group_key(doc.get(ObservationField::StationId.as_str())))
            .or_insert(0) += 1;

        for field in ObservationField::ALL {
            let name = field.as_str();
            let value = match doc.get(name) {
                None => {
                    if is_required(field) {
                        *report.missing_fields.entry(name.to_string()).or_insert(0) += 1;
                    }
                    continue;
                }
                Some(Value::Null) => {
                    if is_required(field) {
                        *report.nulls.entry(name.to_string()).or_insert(0) += 1;
                    }
                    continue;
                }
                Some(value) => value,
            };

            match field.kind() {
                FieldKind::Number => match value.as_f64() {
                    Some(number) => {
                        update_extremes(report, name, number);
                        if let Some(bound) = self.bounds.for_field(field) {
                            if !bound.contains(number) {
                                *report.range_violations.entry(name.to_string()).or_insert(0) +=
                                    1;
                            }
                        }
                    }
                    None => {
                        *report.type_mismatches.entry(name.to_string()).or_insert(0) += 1;
                    }
                },
                FieldKind::Text => match value.as_str() {
                    Some(text) if text.trim().is_empty() => {
                        if is_required(field) {
                            *report.missing_fields.entry(name.to_string()).or_insert(0) += 1;
                        }
                    }
                    Some(text) => {
                        if field == ObservationField::RecordHash && !is_sha256_hex(text) {
                            *report.type_mismatches.entry(name.to_string()).or_insert(0) += 1;
                        }
                    }
                    None => {
                        *report.type_mismatches.entry(name.to_string()).or_insert(0) += 1;
                    }
                },
                FieldKind::Instant => match parse_instant(value) {
                    Some(at) => {
                        if field == ObservationField::ObsDatetime {
                            report.date_range = Some(match report.date_range {
                                Some(range) => DateRange {
                                    min: range.min.min(at),
                                    max: range.max.max(at),
                                },
                                None => DateRange { min: at, max: at },
                            });
                        }
                    }
                    None => {
                        *report.type_mismatches.entry(name.to_string()).or_insert(0) += 1;
                    }
                },
            }
        }

        if let Some(hash) = doc
            .get(ObservationField::RecordHash.as_str())
            .and_then(Value::as_str)
        {
            if !self.seen_hashes.insert(hash.to_string()) {
                report.duplicate_hashes += 1;
            }
        }

        if let Some(station_id) = doc
            .get(ObservationField::StationId.as_str())
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
        {
            if self.unknown_ids.contains(station_id) {
                report.unknown_station_ids += 1;
            } else if let Some(registry) = self.registry {
                if !registry.contains(station_id) {
                    report.fk_missing_station += 1;
                }
            }
        }
    }

    pub fn finish(mut self) -> QualityReport {
        self.report.compute_error_rate();
        debug!(
            "Audit finished: {} rows, error rate {:.4}",
            self.report.rows_total, self.report.error_rate_estimate
        );
        self.report
    }
}

/// Audit a slice of observations. Neither input is modified.
pub fn audit(
    observations: &[CanonicalObservation],
    registry: Option<&StationRegistry>,
    quality: &QualityConfig,
) -> QualityReport {
    let mut auditor = QualityAuditor::new(quality, registry);
    for obs in observations {
        auditor.observe(obs);
    }
    auditor.finish()
}

/// Audit an exported JSONL file, one document per line, without a store.
pub fn audit_jsonl(
    path: &Path,
    registry: Option<&StationRegistry>,
    quality: &QualityConfig,
) -> Result<QualityReport> {
    let file = std::fs::File::open(path)?;
    let mut auditor = QualityAuditor::new(quality, registry);

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(doc)) => auditor.observe_document(&doc),
            _ => auditor.report.invalid_documents += 1,
        }
    }

    Ok(auditor.finish())
}

fn is_required(field: ObservationField) -> bool {
    matches!(
        field,
        ObservationField::RecordHash
            | ObservationField::ObsDatetime
            | ObservationField::StationId
            | ObservationField::StationProvider
            | ObservationField::Source
            | ObservationField::IngestionTs
    )
}

fn group_key(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "null".to_string(),
        Some(other) => other.to_string(),
    }
}

fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn update_extremes(report: &mut QualityReport, name: &str, value: f64) {
    report
        .min
        .entry(name.to_string())
        .and_modify(|m| *m = m.min(value))
        .or_insert(value);
    report
        .max
        .entry(name.to_string())
        .and_modify(|m| *m = m.max(value))
        .or_insert(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Measurements, Station, StationProvider};
    use chrono::TimeZone;
    use serde_json::json;
    use std::io::Write;

    fn obs(station_id: &str, hour: u32, measurements: Measurements) -> CanonicalObservation {
        CanonicalObservation::new(
            "API_HOURLY_RUN",
            station_id,
            StationProvider::HourlyApi,
            Utc.with_ymd_and_hms(2024, 10, 1, hour, 0, 0).unwrap(),
            measurements,
            Utc.with_ymd_and_hms(2024, 10, 8, 0, 0, 0).unwrap(),
            None,
        )
    }

    fn registry(ids: &[&str]) -> StationRegistry {
        StationRegistry::from_stations(
            ids.iter()
                .map(|id| Station {
                    station_id: id.to_string(),
                    name: None,
                    latitude: None,
                    longitude: None,
                    elevation_m: None,
                    city: None,
                    provider: None,
                    hardware: None,
                    software: None,
                })
                .collect(),
        )
    }

    #[test]
    fn test_referential_audit() {
        let registry = registry(&["S1"]);
        let set = vec![
            obs("S1", 0, Measurements::default()),
            obs("S2", 0, Measurements::default()),
        ];
        let report = audit(&set, Some(&registry), &QualityConfig::default());
        assert!(report.fk_check_enabled);
        assert_eq!(report.fk_missing_station, 1);
        assert_eq!(report.rows_total, 2);
        assert_eq!(report.error_rate_estimate, 0.5);
    }

    #[test]
    fn test_no_registry_disables_fk_check() {
        let set = vec![obs("S2", 0, Measurements::default())];
        let report = audit(&set, None, &QualityConfig::default());
        assert!(!report.fk_check_enabled);
        assert_eq!(report.fk_missing_station, 0);
    }

    #[test]
    fn test_range_violation_counted_not_dropped() {
        let set = vec![
            obs(
                "S1",
                0,
                Measurements {
                    humidity_pct: Some(150.0),
                    ..Default::default()
                },
            ),
            obs(
                "S1",
                1,
                Measurements {
                    humidity_pct: Some(80.0),
                    ..Default::default()
                },
            ),
        ];
        let report = audit(&set, Some(&registry(&["S1"])), &QualityConfig::default());
        assert_eq!(report.rows_total, 2);
        assert_eq!(report.range_violations["humidity_pct"], 1);
        assert_eq!(report.max["humidity_pct"], 150.0);
        assert_eq!(report.min["humidity_pct"], 80.0);
        assert_eq!(report.error_rate_estimate, 0.5);
    }

    #[test]
    fn test_duplicate_hashes() {
        let one = obs("S1", 0, Measurements::default());
        let set = vec![one.clone(), one.clone(), one];
        let report = audit(&set, None, &QualityConfig::default());
        assert_eq!(report.duplicate_hashes, 2);
        assert_eq!(report.stations["S1"], 3);
        assert_eq!(report.providers["API_HOURLY"], 3);
    }

    #[test]
    fn test_unknown_sentinel_not_double_counted() {
        let set = vec![obs("WU:UNKNOWN", 0, Measurements::default())];
        let report = audit(&set, Some(&registry(&["S1"])), &QualityConfig::default());
        assert_eq!(report.unknown_station_ids, 1);
        assert_eq!(report.fk_missing_station, 0);
    }

    #[test]
    fn test_missing_null_and_mismatch_distinguished() {
        let quality = QualityConfig::default();
        let mut auditor = QualityAuditor::new(&quality, None);
        let doc = json!({
            "record_hash": "0f".repeat(32),
            "obs_datetime": "2024-10-01T00:00:00Z",
            "station_id": null,
            "station_provider": "WU",
            "ingestion_ts": "yesterday",
            "temperature_c": "warm",
            "humidity_pct": 55
        });
        auditor.observe_document(doc.as_object().unwrap());
        let report = auditor.finish();

        assert_eq!(report.missing_fields.get("source"), Some(&1));
        assert_eq!(report.nulls.get("station_id"), Some(&1));
        assert_eq!(report.type_mismatches.get("temperature_c"), Some(&1));
        assert_eq!(report.type_mismatches.get("ingestion_ts"), Some(&1));
        assert_eq!(report.stations.get("null"), Some(&1));
        assert!(!report.missing_fields.contains_key("pressure_hpa"));
        assert_eq!(report.total_missing_required(), 2);
        assert_eq!(report.error_rate_estimate, 4.0);
    }

    #[test]
    fn test_blank_station_counts_as_missing() {
        let set = vec![obs("", 0, Measurements::default()), obs("S1", 1, Measurements::default())];
        let report = audit(&set, Some(&registry(&["S1"])), &QualityConfig::default());

        assert_eq!(report.missing_fields.get("station_id"), Some(&1));
        assert_eq!(report.total_missing_required(), 1);
        assert_eq!(report.fk_missing_station, 0);
        assert_eq!(report.error_rate_estimate, 0.5);
    }

    #[test]
    fn test_malformed_record_hash_is_a_type_mismatch() {
        let quality = QualityConfig::default();
        let mut auditor = QualityAuditor::new(&quality, None);
        let mut doc = serde_json::to_value(obs("S1", 0, Measurements::default())).unwrap();
        doc["record_hash"] = json!("ABC123");
        auditor.observe_document(doc.as_object().unwrap());
        let report = auditor.finish();

        assert_eq!(report.type_mismatches.get("record_hash"), Some(&1));
        assert!(report.missing_fields.is_empty());
    }

    #[test]
    fn test_date_range() {
        let set = vec![
            obs("S1", 5, Measurements::default()),
            obs("S1", 2, Measurements::default()),
            obs("S1", 9, Measurements::default()),
        ];
        let report = audit(&set, None, &QualityConfig::default());
        let range = report.date_range.unwrap();
        assert_eq!(range.min, Utc.with_ymd_and_hms(2024, 10, 1, 2, 0, 0).unwrap());
        assert_eq!(range.max, Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_empty_set() {
        let report = audit(&[], None, &QualityConfig::default());
        assert_eq!(report.rows_total, 0);
        assert_eq!(report.error_rate_estimate, 0.0);
        assert!(report.date_range.is_none());
    }

    #[test]
    fn test_audit_jsonl_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for o in [
            obs("S1", 0, Measurements::default()),
            obs("S2", 1, Measurements::default()),
        ] {
            writeln!(file, "{}", serde_json::to_string(&o).unwrap()).unwrap();
        }
        writeln!(file).unwrap();
        writeln!(file, "not json").unwrap();

        let report =
            audit_jsonl(file.path(), Some(&registry(&["S1"])), &QualityConfig::default()).unwrap();
        assert_eq!(report.rows_total, 2);
        assert_eq!(report.invalid_documents, 1);
        assert_eq!(report.fk_missing_station, 1);
    }
}
