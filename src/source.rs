use crate::config::InputConfig;
use crate::error::{AppError, Result};
use crate::fetcher::HttpSource;
use std::path::PathBuf;
use tracing::{debug, info};

/// One raw input file: a name for logs and a path or URL to read it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    pub name: String,
    pub location: String,
}

/// Provider of raw JSONL exports.
#[allow(async_fn_in_trait)]
pub trait RawSource {
    /// Objects of the run, in the order they are processed.
    async fn list_objects(&self) -> Result<Vec<RawObject>>;

    async fn read_object(&self, object: &RawObject) -> Result<String>;

    fn describe(&self) -> String;
}

/// Files matching a glob pattern inside one directory.
pub struct LocalSource {
    dir: PathBuf,
    pattern: String,
}

impl LocalSource {
    pub fn new(dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            pattern: pattern.into(),
        }
    }
}

impl RawSource for LocalSource {
    async fn list_objects(&self) -> Result<Vec<RawObject>> {
        if !self.dir.is_dir() {
            return Err(AppError::Config(format!(
                "Input directory does not exist: {}",
                self.dir.display()
            )));
        }

        let pattern = self.dir.join(&self.pattern);
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern)
            .map_err(|e| AppError::Config(format!("Invalid input pattern '{}': {}", pattern, e)))?;

        let mut objects = Vec::new();
        for entry in paths {
            let path = entry.map_err(|e| AppError::Io(e.into()))?;
            if !path.is_file() {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            objects.push(RawObject {
                name,
                location: path.display().to_string(),
            });
        }

        objects.sort_by(|a, b| a.location.cmp(&b.location));
        info!("Found {} input files in {}", objects.len(), self.dir.display());
        Ok(objects)
    }

    async fn read_object(&self, object: &RawObject) -> Result<String> {
        debug!("Reading {}", object.location);
        Ok(tokio::fs::read_to_string(&object.location).await?)
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.dir.display(), self.pattern)
    }
}

/// Source selected by the `source.input` config section.
pub enum ConfiguredSource {
    Local(LocalSource),
    Http(HttpSource),
}

impl ConfiguredSource {
    pub fn from_config(input: &InputConfig) -> Result<Self> {
        match input {
            InputConfig::Local { dir, pattern } => {
                Ok(ConfiguredSource::Local(LocalSource::new(dir.clone(), pattern.clone())))
            }
            InputConfig::Http {
                base_url,
                request_delay_ms,
            } => Ok(ConfiguredSource::Http(HttpSource::new(
                base_url,
                *request_delay_ms,
            )?)),
        }
    }
}

impl RawSource for ConfiguredSource {
    async fn list_objects(&self) -> Result<Vec<RawObject>> {
        match self {
            ConfiguredSource::Local(source) => source.list_objects().await,
            ConfiguredSource::Http(source) => source.list_objects().await,
        }
    }

    async fn read_object(&self, object: &RawObject) -> Result<String> {
        match self {
            ConfiguredSource::Local(source) => source.read_object(object).await,
            ConfiguredSource::Http(source) => source.read_object(object).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            ConfiguredSource::Local(source) => source.describe(),
            ConfiguredSource::Http(source) => source.describe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_source_lists_matching_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jsonl"), "{}\n").unwrap();
        std::fs::write(dir.path().join("a.jsonl"), "{}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip").unwrap();

        let source = LocalSource::new(dir.path(), "*.jsonl");
        let objects = source.list_objects().await.unwrap();

        let names: Vec<&str> = objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a.jsonl", "b.jsonl"]);
        assert_eq!(source.read_object(&objects[1]).await.unwrap(), "{}\n");
    }

    #[tokio::test]
    async fn test_local_source_missing_dir() {
        let source = LocalSource::new("/nonexistent/raw", "*.jsonl");
        assert!(matches!(
            source.list_objects().await,
            Err(AppError::Config(_))
        ));
    }
}
