//! Shape constraints of the observations table, declared once and enforced
//! by every store implementation before data is loaded.

use crate::config::{Bound, QualityBounds};
use crate::db::models::{CanonicalObservation, FieldKind, ObservationField};

pub const OBSERVATIONS_TABLE: &str = "observations";

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub field: ObservationField,
    pub required: bool,
    /// Text must not be blank.
    pub non_empty: bool,
    pub bound: Option<Bound>,
}

impl FieldRule {
    fn column_sql(&self) -> String {
        let name = self.field.as_str();
        let sql_type = match self.field.kind() {
            FieldKind::Text => "TEXT",
            FieldKind::Number => "DOUBLE PRECISION",
            FieldKind::Instant => "TIMESTAMPTZ",
        };

        let mut column = format!("{} {}", name, sql_type);
        if self.required {
            column.push_str(" NOT NULL");
        }
        if self.non_empty {
            column.push_str(&format!(" CHECK (btrim({}) <> '')", name));
        }
        if let Some(bound) = self.bound {
            let mut checks = Vec::new();
            if let Some(min) = bound.min {
                checks.push(format!("{} >= {}", name, min));
            }
            if let Some(max) = bound.max {
                checks.push(format!("{} <= {}", name, max));
            }
            if !checks.is_empty() {
                column.push_str(&format!(" CHECK ({})", checks.join(" AND ")));
            }
        }
        column
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaSpec {
    pub table: String,
    pub rules: Vec<FieldRule>,
}

impl SchemaSpec {
    /// Observations schema: identity and provenance fields required, numeric
    /// fields nullable but bounded.
    pub fn observations(bounds: &QualityBounds) -> Self {
        let rules = ObservationField::ALL
            .into_iter()
            .map(|field| {
                let required = is_required(field);
                FieldRule {
                    field,
                    required,
                    non_empty: required && field.kind() == FieldKind::Text,
                    bound: bounds.for_field(field),
                }
            })
            .collect();

        Self {
            table: OBSERVATIONS_TABLE.to_string(),
            rules,
        }
    }

    pub fn required_fields(&self) -> impl Iterator<Item = ObservationField> + '_ {
        self.rules.iter().filter(|r| r.required).map(|r| r.field)
    }

    /// First violated rule, described.
    pub fn check(&self, obs: &CanonicalObservation) -> std::result::Result<(), String> {
        for rule in &self.rules {
            let field = rule.field;
            match field.kind() {
                FieldKind::Text => match obs.text(field) {
                    None if rule.required => return Err(format!("{} is required", field)),
                    Some(text) if rule.non_empty && text.trim().is_empty() => {
                        return Err(format!("{} must not be empty", field))
                    }
                    _ => {}
                },
                FieldKind::Instant => {
                    if rule.required && obs.instant(field).is_none() {
                        return Err(format!("{} is required", field));
                    }
                }
                FieldKind::Number => match obs.number(field) {
                    None if rule.required => return Err(format!("{} is required", field)),
                    Some(value) if !value.is_finite() => {
                        return Err(format!("{} is not a finite number", field))
                    }
                    Some(value) => {
                        if let Some(bound) = rule.bound.filter(|b| !b.contains(value)) {
                            return Err(format!(
                                "{} = {} outside [{}, {}]",
                                field,
                                value,
                                render_limit(bound.min),
                                render_limit(bound.max)
                            ));
                        }
                    }
                    None => {}
                },
            }
        }
        Ok(())
    }

    pub fn create_table_sql(&self) -> String {
        let columns: Vec<String> = self
            .rules
            .iter()
            .map(|rule| format!("    {}", rule.column_sql()))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            self.table,
            columns.join(",\n")
        )
    }
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

fn render_limit(limit: Option<f64>) -> String {
    limit.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub fields: Vec<ObservationField>,
    pub unique: bool,
}

impl IndexSpec {
    /// Unique `record_hash` plus the `(station_id, obs_datetime)` lookup index.
    pub fn observation_defaults() -> Vec<IndexSpec> {
        vec![
            IndexSpec {
                name: "ux_observations_record_hash".to_string(),
                table: OBSERVATIONS_TABLE.to_string(),
                fields: vec![ObservationField::RecordHash],
                unique: true,
            },
            IndexSpec {
                name: "ix_observations_station_datetime".to_string(),
                table: OBSERVATIONS_TABLE.to_string(),
                fields: vec![ObservationField::StationId, ObservationField::ObsDatetime],
                unique: false,
            },
        ]
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<&str> = self.fields.iter().map(|f| f.as_str()).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.table,
            columns.join(", ")
        )
    }
}

/// Row filter for `count`.
#[derive(Debug, Clone, PartialEq)]
pub enum CountFilter {
    All,
    /// Field rendered as text equals the value.
    Equals(ObservationField, String),
    /// Field is null.
    Missing(ObservationField),
}

impl CountFilter {
    pub fn matches(&self, obs: &CanonicalObservation) -> bool {
        match self {
            CountFilter::All => true,
            CountFilter::Equals(field, value) => {
                obs.display_value(*field).as_deref() == Some(value.as_str())
            }
            CountFilter::Missing(field) => obs.display_value(*field).is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Measurements, StationProvider};
    use chrono::{TimeZone, Utc};

    fn obs(station_id: &str, measurements: Measurements) -> CanonicalObservation {
        CanonicalObservation::new(
            "API_HOURLY_RUN",
            station_id,
            StationProvider::HourlyApi,
            Utc.with_ymd_and_hms(2024, 10, 1, 6, 0, 0).unwrap(),
            measurements,
            Utc.with_ymd_and_hms(2024, 10, 8, 0, 0, 0).unwrap(),
            None,
        )
    }

    #[test]
    fn test_required_fields() {
        let spec = SchemaSpec::observations(&QualityBounds::default());
        let required: Vec<_> = spec.required_fields().collect();
        assert_eq!(required.len(), 6);
        assert!(required.contains(&ObservationField::RecordHash));
        assert!(!required.contains(&ObservationField::SyncId));
    }

    #[test]
    fn test_check_accepts_sparse_observation() {
        let spec = SchemaSpec::observations(&QualityBounds::default());
        assert!(spec.check(&obs("07015", Measurements::default())).is_ok());
    }

    #[test]
    fn test_check_rejects_out_of_band_values() {
        let spec = SchemaSpec::observations(&QualityBounds::default());
        let humid = obs(
            "07015",
            Measurements {
                humidity_pct: Some(150.0),
                ..Default::default()
            },
        );
        let err = spec.check(&humid).unwrap_err();
        assert!(err.contains("humidity_pct"), "{}", err);

        let negative_rain = obs(
            "07015",
            Measurements {
                precip_1h_mm: Some(-1.0),
                ..Default::default()
            },
        );
        assert!(spec.check(&negative_rain).is_err());

        let low_pressure = obs(
            "07015",
            Measurements {
                pressure_hpa: Some(850.0),
                ..Default::default()
            },
        );
        assert!(spec.check(&low_pressure).is_err());
    }

    #[test]
    fn test_check_rejects_blank_station() {
        let spec = SchemaSpec::observations(&QualityBounds::default());
        let err = spec.check(&obs("  ", Measurements::default())).unwrap_err();
        assert!(err.contains("station_id"), "{}", err);
    }

    #[test]
    fn test_create_table_sql_carries_constraints() {
        let sql = SchemaSpec::observations(&QualityBounds::default()).create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS observations ("));
        assert!(sql.contains("record_hash TEXT NOT NULL CHECK (btrim(record_hash) <> '')"));
        assert!(sql.contains("obs_datetime TIMESTAMPTZ NOT NULL"));
        assert!(sql.contains("humidity_pct DOUBLE PRECISION CHECK (humidity_pct >= 0 AND humidity_pct <= 100)"));
        assert!(sql.contains("pressure_hpa DOUBLE PRECISION CHECK (pressure_hpa >= 870 AND pressure_hpa <= 1084)"));
        assert!(sql.contains("wind_gust_kmh DOUBLE PRECISION CHECK (wind_gust_kmh >= 0)"));
        assert!(sql.contains("sync_id TEXT,"));
    }

    #[test]
    fn test_index_sql() {
        let indexes = IndexSpec::observation_defaults();
        assert_eq!(
            indexes[0].create_sql(),
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_observations_record_hash ON observations (record_hash)"
        );
        assert_eq!(
            indexes[1].create_sql(),
            "CREATE INDEX IF NOT EXISTS ix_observations_station_datetime ON observations (station_id, obs_datetime)"
        );
    }

    #[test]
    fn test_count_filter_matches() {
        let o = obs("07015", Measurements::default());
        assert!(CountFilter::All.matches(&o));
        assert!(CountFilter::Equals(ObservationField::StationId, "07015".to_string()).matches(&o));
        assert!(CountFilter::Equals(ObservationField::StationProvider, "API_HOURLY".to_string()).matches(&o));
        assert!(CountFilter::Missing(ObservationField::TemperatureC).matches(&o));
        assert!(!CountFilter::Missing(ObservationField::StationId).matches(&o));
    }
}
