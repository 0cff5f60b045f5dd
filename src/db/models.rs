use crate::hasher::{self, IdentityBasis};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Source format an observation was normalized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StationProvider {
    /// Flat per-station reading with imperial units.
    #[serde(rename = "WU")]
    WeatherUnderground,
    /// Multi-station hourly bundle with metric units.
    #[serde(rename = "API_HOURLY")]
    HourlyApi,
}

impl StationProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationProvider::WeatherUnderground => "WU",
            StationProvider::HourlyApi => "API_HOURLY",
        }
    }
}

impl fmt::Display for StationProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional measurements of the canonical schema, all metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub temperature_c: Option<f64>,
    pub dew_point_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub wind_gust_kmh: Option<f64>,
    pub wind_dir_deg: Option<f64>,
    pub precip_rate_mm: Option<f64>,
    pub precip_accum_mm: Option<f64>,
    pub precip_1h_mm: Option<f64>,
    pub precip_3h_mm: Option<f64>,
    pub visibility_m: Option<f64>,
    pub cloud_cover_octas: Option<f64>,
    pub snow_depth_cm: Option<f64>,
    pub weather_code: Option<String>,
    pub uv_index: Option<f64>,
    pub solar_radiation_wm2: Option<f64>,
}

/// One normalized observation. Built once through [`CanonicalObservation::new`],
/// which derives `record_hash`; never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalObservation {
    pub record_hash: String,
    pub obs_datetime: DateTime<Utc>,
    pub station_id: String,
    pub station_provider: StationProvider,
    pub source: String,
    pub ingestion_ts: DateTime<Utc>,
    pub sync_id: Option<String>,
    #[serde(flatten)]
    pub measurements: Measurements,
}

impl CanonicalObservation {
    pub fn new(
        source: &str,
        station_id: &str,
        station_provider: StationProvider,
        obs_datetime: DateTime<Utc>,
        measurements: Measurements,
        ingestion_ts: DateTime<Utc>,
        sync_id: Option<String>,
    ) -> Self {
        let record_hash = hasher::record_hash(&IdentityBasis {
            source,
            station_id,
            obs_datetime,
            temperature_c: measurements.temperature_c,
            humidity_pct: measurements.humidity_pct,
            pressure_hpa: measurements.pressure_hpa,
        });

        Self {
            record_hash,
            obs_datetime,
            station_id: station_id.to_string(),
            station_provider,
            source: source.to_string(),
            ingestion_ts,
            sync_id,
            measurements,
        }
    }

    pub fn text(&self, field: ObservationField) -> Option<String> {
        match field {
            ObservationField::RecordHash => Some(self.record_hash.clone()),
            ObservationField::StationId => Some(self.station_id.clone()),
            ObservationField::StationProvider => Some(self.station_provider.as_str().to_string()),
            ObservationField::Source => Some(self.source.clone()),
            ObservationField::SyncId => self.sync_id.clone(),
            ObservationField::WeatherCode => self.measurements.weather_code.clone(),
            _ => None,
        }
    }

    pub fn number(&self, field: ObservationField) -> Option<f64> {
        let m = &self.measurements;
        match field {
            ObservationField::TemperatureC => m.temperature_c,
            ObservationField::DewPointC => m.dew_point_c,
            ObservationField::HumidityPct => m.humidity_pct,
            ObservationField::PressureHpa => m.pressure_hpa,
            ObservationField::WindSpeedKmh => m.wind_speed_kmh,
            ObservationField::WindGustKmh => m.wind_gust_kmh,
            ObservationField::WindDirDeg => m.wind_dir_deg,
            ObservationField::PrecipRateMm => m.precip_rate_mm,
            ObservationField::PrecipAccumMm => m.precip_accum_mm,
            ObservationField::Precip1hMm => m.precip_1h_mm,
            ObservationField::Precip3hMm => m.precip_3h_mm,
            ObservationField::VisibilityM => m.visibility_m,
            ObservationField::CloudCoverOctas => m.cloud_cover_octas,
            ObservationField::SnowDepthCm => m.snow_depth_cm,
            ObservationField::UvIndex => m.uv_index,
            ObservationField::SolarRadiationWm2 => m.solar_radiation_wm2,
            _ => None,
        }
    }

    pub fn instant(&self, field: ObservationField) -> Option<DateTime<Utc>> {
        match field {
            ObservationField::ObsDatetime => Some(self.obs_datetime),
            ObservationField::IngestionTs => Some(self.ingestion_ts),
            _ => None,
        }
    }

    /// Value of `field` rendered as text, `None` when absent.
    pub fn display_value(&self, field: ObservationField) -> Option<String> {
        match field.kind() {
            FieldKind::Text => self.text(field),
            FieldKind::Number => self.number(field).map(|v| v.to_string()),
            FieldKind::Instant => self.instant(field).map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    Instant,
}

/// Every stored field of an observation. Column order follows [`ObservationField::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObservationField {
    RecordHash,
    ObsDatetime,
    StationId,
    StationProvider,
    Source,
    IngestionTs,
    SyncId,
    TemperatureC,
    DewPointC,
    HumidityPct,
    PressureHpa,
    WindSpeedKmh,
    WindGustKmh,
    WindDirDeg,
    PrecipRateMm,
    PrecipAccumMm,
    Precip1hMm,
    Precip3hMm,
    VisibilityM,
    CloudCoverOctas,
    SnowDepthCm,
    WeatherCode,
    UvIndex,
    SolarRadiationWm2,
}

impl ObservationField {
    pub const ALL: [ObservationField; 24] = [
        ObservationField::RecordHash,
        ObservationField::ObsDatetime,
        ObservationField::StationId,
        ObservationField::StationProvider,
        ObservationField::Source,
        ObservationField::IngestionTs,
        ObservationField::SyncId,
        ObservationField::TemperatureC,
        ObservationField::DewPointC,
        ObservationField::HumidityPct,
        ObservationField::PressureHpa,
        ObservationField::WindSpeedKmh,
        ObservationField::WindGustKmh,
        ObservationField::WindDirDeg,
        ObservationField::PrecipRateMm,
        ObservationField::PrecipAccumMm,
        ObservationField::Precip1hMm,
        ObservationField::Precip3hMm,
        ObservationField::VisibilityM,
        ObservationField::CloudCoverOctas,
        ObservationField::SnowDepthCm,
        ObservationField::WeatherCode,
        ObservationField::UvIndex,
        ObservationField::SolarRadiationWm2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationField::RecordHash => "record_hash",
            ObservationField::ObsDatetime => "obs_datetime",
            ObservationField::StationId => "station_id",
            ObservationField::StationProvider => "station_provider",
            ObservationField::Source => "source",
            ObservationField::IngestionTs => "ingestion_ts",
            ObservationField::SyncId => "sync_id",
            ObservationField::TemperatureC => "temperature_c",
            ObservationField::DewPointC => "dew_point_c",
            ObservationField::HumidityPct => "humidity_pct",
            ObservationField::PressureHpa => "pressure_hpa",
            ObservationField::WindSpeedKmh => "wind_speed_kmh",
            ObservationField::WindGustKmh => "wind_gust_kmh",
            ObservationField::WindDirDeg => "wind_dir_deg",
            ObservationField::PrecipRateMm => "precip_rate_mm",
            ObservationField::PrecipAccumMm => "precip_accum_mm",
            ObservationField::Precip1hMm => "precip_1h_mm",
            ObservationField::Precip3hMm => "precip_3h_mm",
            ObservationField::VisibilityM => "visibility_m",
            ObservationField::CloudCoverOctas => "cloud_cover_octas",
            ObservationField::SnowDepthCm => "snow_depth_cm",
            ObservationField::WeatherCode => "weather_code",
            ObservationField::UvIndex => "uv_index",
            ObservationField::SolarRadiationWm2 => "solar_radiation_wm2",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            ObservationField::RecordHash
            | ObservationField::StationId
            | ObservationField::StationProvider
            | ObservationField::Source
            | ObservationField::SyncId
            | ObservationField::WeatherCode => FieldKind::Text,
            ObservationField::ObsDatetime | ObservationField::IngestionTs => FieldKind::Instant,
            _ => FieldKind::Number,
        }
    }

    pub fn numeric() -> impl Iterator<Item = ObservationField> {
        Self::ALL
            .into_iter()
            .filter(|f| f.kind() == FieldKind::Number)
    }
}

impl fmt::Display for ObservationField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference station, loaded once from the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Station {
    pub station_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "lat")]
    pub latitude: Option<f64>,
    #[serde(default, alias = "lon")]
    pub longitude: Option<f64>,
    #[serde(default, alias = "elevation")]
    pub elevation_m: Option<f64>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub hardware: Option<String>,
    #[serde(default)]
    pub software: Option<String>,
}

/// Row of the `ingestion_runs` ledger.
#[derive(Debug, Clone, FromRow)]
pub struct IngestionRun {
    pub id: i32,
    pub source_tag: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub lines_read: i64,
    pub json_ok: i64,
    pub rejected: i64,
    pub documents: i64,
    pub inserted: i64,
    pub duplicates: i64,
    pub errors: i64,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct NewIngestionRun {
    pub source_tag: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub lines_read: i64,
    pub json_ok: i64,
    pub rejected: i64,
    pub documents: i64,
    pub inserted: i64,
    pub duplicates: i64,
    pub errors: i64,
    pub status: String,
}
