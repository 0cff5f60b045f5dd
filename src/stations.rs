use crate::db::models::Station;
use crate::error::{AppError, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Read-only station lookup, loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct StationRegistry {
    stations: Vec<Station>,
    by_id: HashMap<String, usize>,
}

impl StationRegistry {
    /// Load a JSON array of station objects.
    ///
    /// A missing or unreadable file is a hard error: referential checks
    /// without reference data would report every observation as orphaned.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AppError::ReferenceData(format!(
                "Station registry not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::ReferenceData(format!(
                "Failed to read station registry {}: {}",
                path.display(),
                e
            ))
        })?;

        let stations: Vec<Station> = serde_json::from_str(&content).map_err(|e| {
            AppError::ReferenceData(format!(
                "Invalid station registry {}: {}",
                path.display(),
                e
            ))
        })?;

        let registry = Self::from_stations(stations);
        if registry.is_empty() {
            warn!("Station registry {} is empty", path.display());
        }
        info!(
            "Loaded {} stations from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Build from a list; the first entry wins when an id repeats.
    pub fn from_stations(stations: Vec<Station>) -> Self {
        let mut registry = Self::default();
        for mut station in stations {
            let id = station.station_id.trim().to_string();
            if id.is_empty() {
                warn!("Skipping registry entry without station_id");
                continue;
            }
            if registry.by_id.contains_key(&id) {
                warn!("Duplicate station_id {} in registry, keeping the first", id);
                continue;
            }
            station.station_id = id.clone();
            registry.by_id.insert(id, registry.stations.len());
            registry.stations.push(station);
        }
        registry
    }

    pub fn contains(&self, station_id: &str) -> bool {
        self.by_id.contains_key(station_id.trim())
    }

    pub fn get(&self, station_id: &str) -> Option<&Station> {
        self.by_id.get(station_id.trim()).map(|&i| &self.stations[i])
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn station(id: &str, name: &str) -> Station {
        Station {
            station_id: id.to_string(),
            name: Some(name.to_string()),
            latitude: None,
            longitude: None,
            elevation_m: None,
            city: None,
            provider: None,
            hardware: None,
            software: None,
        }
    }

    #[test]
    fn test_first_entry_wins() {
        let registry = StationRegistry::from_stations(vec![
            station("S1", "first"),
            station("S1", "second"),
            station("  ", "blank"),
            station("S2", "other"),
        ]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("S1").unwrap().name.as_deref(), Some("first"));
        assert!(registry.contains("S2"));
        assert!(!registry.contains("S3"));
    }

    #[test]
    fn test_ids_are_trimmed_on_both_sides() {
        let registry = StationRegistry::from_stations(vec![station(" ILAMAD25 ", "padded")]);
        assert!(registry.contains("ILAMAD25"));
        assert!(registry.contains("ILAMAD25\t"));
        assert_eq!(registry.get(" ILAMAD25").unwrap().station_id, "ILAMAD25");
        assert_eq!(registry.stations()[0].station_id, "ILAMAD25");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"station_id": "ILAMAD25", "name": "La Madeleine", "latitude": 50.659, "longitude": 3.07}},
                {{"station_id": "IICHTE19", "name": "WeerstationBS", "city": "Ichtegem"}}]"#
        )
        .unwrap();

        let registry = StationRegistry::load_from_file(file.path()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("IICHTE19").and_then(|s| s.city.as_deref()),
            Some("Ichtegem")
        );
    }

    #[test]
    fn test_missing_file_is_reference_error() {
        let err = StationRegistry::load_from_file(Path::new("/nonexistent/stations.json"))
            .unwrap_err();
        assert!(matches!(err, AppError::ReferenceData(_)));
    }

    #[test]
    fn test_malformed_file_is_reference_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"not\": \"a list\"}}").unwrap();
        let err = StationRegistry::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, AppError::ReferenceData(_)));
    }
}
