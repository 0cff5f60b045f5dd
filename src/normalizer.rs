//! Maps raw source records onto [`CanonicalObservation`]s.
//!
//! Raw records arrive one JSON document per line, usually wrapped in an
//! extractor envelope (`_airbyte_data`, `_airbyte_extracted_at`,
//! `_airbyte_meta.sync_id`). The payload's shape decides the mapping:
//!
//! - **flat reading**: one station, imperial units, a local time-of-day
//!   fragment completed by the envelope's extraction day;
//! - **hourly bundle**: `hourly` maps station ids to arrays of metric rows;
//! - **hourly row**: one bundle row already flattened by the extractor,
//!   carrying its own `id_station`.

use crate::config::SourceConfig;
use crate::db::models::{CanonicalObservation, Measurements, StationProvider};
use crate::units::{
    compass_to_degrees, fahrenheit_to_celsius, inches_to_mm, inhg_to_hpa, mph_to_kmh,
    parse_lenient_opt,
};
use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

const ENVELOPE_DATA: &str = "_airbyte_data";
const ENVELOPE_EXTRACTED_AT: &str = "_airbyte_extracted_at";
const ENVELOPE_META: &str = "_airbyte_meta";

const BUNDLE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const TIME_OF_DAY_FORMATS: [&str; 4] = ["%H:%M:%S", "%H:%M", "%I:%M %p", "%I:%M:%S %p"];

/// Structural shape of a raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    FlatReading,
    HourlyBundle,
    HourlyRow,
    Unknown,
}

/// Why a raw line produced no observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    InvalidJson,
    NotAnObject,
    UnknownShape,
    MissingExtractionTimestamp,
    MissingStation,
    NoValidRows,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Rejection::InvalidJson => "invalid JSON",
            Rejection::NotAnObject => "payload is not a JSON object",
            Rejection::UnknownShape => "no known record shape",
            Rejection::MissingExtractionTimestamp => "flat reading without extraction timestamp",
            Rejection::MissingStation => "hourly row without a station id",
            Rejection::NoValidRows => "no row with a resolvable timestamp",
        };
        f.write_str(text)
    }
}

/// Observations produced from one raw record.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub observations: Vec<CanonicalObservation>,
    /// Bundle rows skipped for an unparseable timestamp or a blank station key.
    pub dropped_rows: usize,
}

/// Sniff the payload shape from its field names.
pub fn classify(payload: &Map<String, Value>) -> RecordShape {
    if ["Temperature", "Dew Point", "Time"]
        .iter()
        .any(|key| payload.contains_key(*key))
    {
        return RecordShape::FlatReading;
    }
    if payload.get("hourly").is_some_and(Value::is_object) {
        return RecordShape::HourlyBundle;
    }
    if payload.contains_key("id_station") && payload.contains_key("dh_utc") {
        return RecordShape::HourlyRow;
    }
    RecordShape::Unknown
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    source_tag: String,
    station_aliases: HashMap<String, String>,
}

impl Normalizer {
    pub fn new(source_tag: impl Into<String>, station_aliases: HashMap<String, String>) -> Self {
        Self {
            source_tag: source_tag.into(),
            station_aliases,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.tag.clone(), config.station_aliases.clone())
    }

    /// Station a flat reading is attributed to: the alias of the run tag, else the tag.
    pub fn flat_station_id(&self) -> &str {
        self.station_aliases
            .get(&self.source_tag)
            .map(String::as_str)
            .unwrap_or(&self.source_tag)
    }

    pub fn normalize_line(
        &self,
        line: &str,
        ingestion_ts: DateTime<Utc>,
    ) -> std::result::Result<Normalized, Rejection> {
        let record: Value = serde_json::from_str(line).map_err(|_| Rejection::InvalidJson)?;
        self.normalize_record(&record, ingestion_ts)
    }

    pub fn normalize_record(
        &self,
        record: &Value,
        ingestion_ts: DateTime<Utc>,
    ) -> std::result::Result<Normalized, Rejection> {
        let record = record.as_object().ok_or(Rejection::NotAnObject)?;

        let payload = match record.get(ENVELOPE_DATA) {
            Some(data) => data.as_object().ok_or(Rejection::NotAnObject)?,
            None => record,
        };
        let sync_id = record
            .get(ENVELOPE_META)
            .and_then(|meta| meta.get("sync_id"))
            .and_then(value_to_text);

        let normalized = match classify(payload) {
            RecordShape::FlatReading => {
                let extracted_at = record
                    .get(ENVELOPE_EXTRACTED_AT)
                    .and_then(parse_extracted_at)
                    .ok_or(Rejection::MissingExtractionTimestamp)?;
                Normalized {
                    observations: vec![self.map_flat(payload, extracted_at, ingestion_ts, sync_id)],
                    dropped_rows: 0,
                }
            }
            RecordShape::HourlyBundle => self.map_bundle(payload, ingestion_ts, sync_id),
            RecordShape::HourlyRow => {
                let station_id = payload
                    .get("id_station")
                    .and_then(value_to_text)
                    .ok_or(Rejection::MissingStation)?;
                match self.map_bundle_row(&station_id, payload, ingestion_ts, sync_id) {
                    Some(obs) => Normalized {
                        observations: vec![obs],
                        dropped_rows: 0,
                    },
                    None => Normalized {
                        observations: Vec::new(),
                        dropped_rows: 1,
                    },
                }
            }
            RecordShape::Unknown => return Err(Rejection::UnknownShape),
        };

        if normalized.observations.is_empty() {
            return Err(Rejection::NoValidRows);
        }
        Ok(normalized)
    }

    fn map_flat(
        &self,
        data: &Map<String, Value>,
        extracted_at: DateTime<Utc>,
        ingestion_ts: DateTime<Utc>,
        sync_id: Option<String>,
    ) -> CanonicalObservation {
        let obs_datetime = flat_observation_time(extracted_at, data.get("Time"));

        let wind_dir_deg = match data.get("Wind") {
            Some(Value::String(text)) => compass_to_degrees(text),
            other => parse_lenient_opt(other),
        };
        let precip_rate = data.get("Precip. Rate.").or_else(|| data.get("Precip. Rate"));

        let measurements = Measurements {
            temperature_c: parse_lenient_opt(data.get("Temperature")).map(fahrenheit_to_celsius),
            dew_point_c: parse_lenient_opt(data.get("Dew Point")).map(fahrenheit_to_celsius),
            humidity_pct: parse_lenient_opt(data.get("Humidity")),
            pressure_hpa: parse_lenient_opt(data.get("Pressure")).map(inhg_to_hpa),
            wind_speed_kmh: parse_lenient_opt(data.get("Speed")).map(mph_to_kmh),
            wind_gust_kmh: parse_lenient_opt(data.get("Gust")).map(mph_to_kmh),
            wind_dir_deg,
            precip_rate_mm: parse_lenient_opt(precip_rate).map(inches_to_mm),
            precip_accum_mm: parse_lenient_opt(data.get("Precip. Accum.")).map(inches_to_mm),
            uv_index: parse_lenient_opt(data.get("UV")),
            solar_radiation_wm2: parse_lenient_opt(data.get("Solar")),
            ..Default::default()
        };

        CanonicalObservation::new(
            &self.source_tag,
            self.flat_station_id(),
            StationProvider::WeatherUnderground,
            obs_datetime,
            measurements,
            ingestion_ts,
            sync_id,
        )
    }

    fn map_bundle(
        &self,
        data: &Map<String, Value>,
        ingestion_ts: DateTime<Utc>,
        sync_id: Option<String>,
    ) -> Normalized {
        let mut normalized = Normalized::default();
        let Some(hourly) = data.get("hourly").and_then(Value::as_object) else {
            return normalized;
        };

        for (station_id, rows) in hourly {
            // "_params" and friends describe the request, not a station
            if station_id.starts_with('_') {
                continue;
            }
            let Some(rows) = rows.as_array() else {
                continue;
            };
            if station_id.trim().is_empty() {
                normalized.dropped_rows += rows.len();
                continue;
            }

            for row in rows {
                let mapped = row.as_object().and_then(|row| {
                    self.map_bundle_row(station_id, row, ingestion_ts, sync_id.clone())
                });
                match mapped {
                    Some(obs) => normalized.observations.push(obs),
                    None => normalized.dropped_rows += 1,
                }
            }
        }

        normalized
    }

    fn map_bundle_row(
        &self,
        station_id: &str,
        row: &Map<String, Value>,
        ingestion_ts: DateTime<Utc>,
        sync_id: Option<String>,
    ) -> Option<CanonicalObservation> {
        let obs_datetime = row.get("dh_utc").and_then(parse_bundle_timestamp)?;

        let measurements = Measurements {
            temperature_c: parse_lenient_opt(row.get("temperature")),
            dew_point_c: parse_lenient_opt(row.get("point_de_rosee")),
            humidity_pct: parse_lenient_opt(row.get("humidite")),
            pressure_hpa: parse_lenient_opt(row.get("pression")),
            wind_speed_kmh: parse_lenient_opt(row.get("vent_moyen")),
            wind_gust_kmh: parse_lenient_opt(row.get("vent_rafales")),
            wind_dir_deg: parse_lenient_opt(row.get("vent_direction")),
            precip_1h_mm: parse_lenient_opt(row.get("pluie_1h")),
            precip_3h_mm: parse_lenient_opt(row.get("pluie_3h")),
            visibility_m: parse_lenient_opt(row.get("visibilite")),
            cloud_cover_octas: parse_lenient_opt(row.get("nebulosite")),
            snow_depth_cm: parse_lenient_opt(row.get("neige_au_sol")),
            weather_code: row.get("temps_omm").and_then(value_to_text),
            ..Default::default()
        };

        Some(CanonicalObservation::new(
            &self.source_tag,
            station_id.trim(),
            StationProvider::HourlyApi,
            obs_datetime,
            measurements,
            ingestion_ts,
            sync_id,
        ))
    }
}

/// Extraction timestamp as epoch milliseconds (number or digit string) or RFC 3339.
pub fn parse_extracted_at(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(millis) = s.parse::<i64>() {
                return DateTime::from_timestamp_millis(millis);
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}

/// `dh_utc` in one of the two fixed layouts, read as UTC.
pub fn parse_bundle_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?.trim();
    BUNDLE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn parse_time_of_day(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    TIME_OF_DAY_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(text, format).ok())
}

/// Day of `extracted_at` combined with the time-of-day field; the extraction
/// instant itself when the field is absent or unparseable.
pub fn flat_observation_time(extracted_at: DateTime<Utc>, time: Option<&Value>) -> DateTime<Utc> {
    time.and_then(Value::as_str)
        .and_then(parse_time_of_day)
        .map(|t| Utc.from_utc_datetime(&extracted_at.date_naive().and_time(t)))
        .unwrap_or(extracted_at)
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
