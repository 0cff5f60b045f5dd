use crate::error::{AppError, Result};
use crate::source::{RawObject, RawSource};
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const EXPORT_EXTENSIONS: [&str; 2] = [".jsonl", ".json"];

/// Raw exports published behind an HTML directory index.
pub struct HttpSource {
    client: Client,
    base_url: Url,
    request_delay: Duration,
}

impl HttpSource {
    pub fn new(base_url: &str, request_delay_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("weather-ingest/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;

        // Index links are resolved relative to the directory, so keep the trailing slash
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized).map_err(|e| {
            AppError::Config(format!("Invalid source base_url '{}': {}", base_url, e))
        })?;

        Ok(Self {
            client,
            base_url,
            request_delay: Duration::from_millis(request_delay_ms),
        })
    }

    pub async fn download(&self, url: &str) -> Result<String> {
        debug!("Downloading {}", url);

        retry_with_backoff(3, || async {
            let response = self.client.get(url).send().await?.error_for_status()?;
            Ok(response.text().await?)
        })
        .await
    }

    async fn list_objects_impl(&self) -> Result<Vec<RawObject>> {
        debug!("Fetching export listing from {}", self.base_url);

        let response = self
            .client
            .get(self.base_url.clone())
            .send()
            .await?
            .error_for_status()?;
        let html = response.text().await?;

        let objects = parse_index(&html, &self.base_url)?;
        info!("Found {} export files at {}", objects.len(), self.base_url);
        Ok(objects)
    }
}

impl RawSource for HttpSource {
    async fn list_objects(&self) -> Result<Vec<RawObject>> {
        retry_with_backoff(3, || async { self.list_objects_impl().await }).await
    }

    async fn read_object(&self, object: &RawObject) -> Result<String> {
        // Rate limiting: delay between downloads
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        self.download(&object.location).await
    }

    fn describe(&self) -> String {
        self.base_url.to_string()
    }
}

/// Export files linked from a directory index page, deduplicated, in page order.
pub fn parse_index(html: &str, base_url: &Url) -> Result<Vec<RawObject>> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse("a").map_err(|e| AppError::Parse(format!("Selector error: {:?}", e)))?;

    let mut objects: Vec<RawObject> = Vec::new();

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let path = href.split(['?', '#']).next().unwrap_or(href);
        if !EXPORT_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            continue;
        }

        let Ok(url) = base_url.join(href) else {
            warn!("Skipping unresolvable link {}", href);
            continue;
        };
        // Only files below the listed directory
        if !url.as_str().starts_with(base_url.as_str()) {
            continue;
        }

        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or(path)
            .to_string();
        if objects.iter().any(|o| o.location == url.as_str()) {
            continue;
        }
        objects.push(RawObject {
            name,
            location: url.to_string(),
        });
    }

    Ok(objects)
}

/// Retry a future with exponential backoff
async fn retry_with_backoff<F, Fut, T>(max_retries: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                retries += 1;

                if retries > max_retries {
                    return Err(e);
                }

                let should_retry = match &e {
                    AppError::Http(reqwest_err) => {
                        // Retry on connection errors, timeouts, server errors (5xx)
                        reqwest_err.is_timeout()
                            || reqwest_err.is_connect()
                            || reqwest_err
                                .status()
                                .map(|s| s.is_server_error())
                                .unwrap_or(false)
                    }
                    AppError::Io(_) => true,
                    _ => false,
                };

                if !should_retry {
                    return Err(e);
                }

                let delay = Duration::from_secs(2u64.pow(retries.saturating_sub(1)));
                warn!(
                    "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                    retries, max_retries, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://exports.example.com/weather/raw/").unwrap()
    }

    #[test]
    fn test_parse_index_keeps_export_files() {
        let html = r#"
            <html><body>
            <a href="../">Parent Directory</a>
            <a href="wu_ichtegem_2024-10-01.jsonl">wu_ichtegem_2024-10-01.jsonl</a>
            <a href="hourly_2024-10-01.json?download=1">hourly_2024-10-01.json</a>
            <a href="README.txt">README.txt</a>
            <a href="wu_ichtegem_2024-10-01.jsonl">duplicate link</a>
            <a href="https://elsewhere.example.com/other.jsonl">off-site</a>
            </body></html>
        "#;

        let objects = parse_index(html, &base()).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].name, "wu_ichtegem_2024-10-01.jsonl");
        assert_eq!(
            objects[0].location,
            "https://exports.example.com/weather/raw/wu_ichtegem_2024-10-01.jsonl"
        );
        assert_eq!(objects[1].name, "hourly_2024-10-01.json");
    }

    #[test]
    fn test_new_normalizes_trailing_slash() {
        let source = HttpSource::new("https://exports.example.com/weather/raw", 0).unwrap();
        assert_eq!(source.describe(), "https://exports.example.com/weather/raw/");
    }

    #[test]
    fn test_new_rejects_garbage_url() {
        assert!(matches!(
            HttpSource::new("not a url", 0),
            Err(AppError::Config(_))
        ));
    }
}
