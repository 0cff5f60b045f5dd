use weather_ingest::config::Config;
use weather_ingest::db::MemoryStore;
use weather_ingest::error::AppError;
use weather_ingest::fetcher::HttpSource;
use weather_ingest::pipeline::Pipeline;
use weather_ingest::source::{RawObject, RawSource};
use weather_ingest::stations::StationRegistry;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INDEX_HTML: &str = r#"
<html><head><title>Index of /exports/</title></head><body>
<a href="../">../</a>
<a href="wu_ichtegem_2024-10-01.jsonl">wu_ichtegem_2024-10-01.jsonl</a>
<a href="wu_ichtegem_2024-10-02.jsonl">wu_ichtegem_2024-10-02.jsonl</a>
<a href="checksums.sha256">checksums.sha256</a>
</body></html>
"#;

fn flat_line(time: &str) -> String {
    format!(
        r#"{{"_airbyte_data": {{"Time": "{}", "Temperature": "61 °F", "Dew Point": "55 °F", "Humidity": "80 %", "Wind": "SW", "Speed": "4 mph", "Gust": "7 mph", "Pressure": "30.01 in", "Precip. Rate.": "0 in", "Precip. Accum.": "0 in", "UV": "1", "Solar": "120 w/m²"}}, "_airbyte_extracted_at": "2024-10-01T23:59:00Z"}}"#,
        time
    )
}

async fn export_server() -> MockServer {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/exports/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INDEX_HTML))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/exports/wu_ichtegem_2024-10-01.jsonl"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string([flat_line("10:00 AM"), flat_line("10:05 AM")].join("\n")),
        )
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/exports/wu_ichtegem_2024-10-02.jsonl"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string([flat_line("10:05 AM"), "{broken".to_string()].join("\n")),
        )
        .mount(&mock_server)
        .await;

    mock_server
}

/// Test listing only picks export files from the index page
#[tokio::test]
async fn test_http_source_lists_exports() {
    let mock_server = export_server().await;
    let source = HttpSource::new(&format!("{}/exports", mock_server.uri()), 0)
        .expect("Failed to create source");

    let objects = source.list_objects().await.expect("Listing failed");

    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0].name, "wu_ichtegem_2024-10-01.jsonl");
    assert_eq!(
        objects[1].location,
        format!("{}/exports/wu_ichtegem_2024-10-02.jsonl", mock_server.uri())
    );
}

/// Test object download with mock server
#[tokio::test]
async fn test_http_source_reads_object() {
    let mock_server = export_server().await;
    let source = HttpSource::new(&format!("{}/exports/", mock_server.uri()), 0).unwrap();

    let objects = source.list_objects().await.unwrap();
    let content = source
        .read_object(&objects[0])
        .await
        .expect("Download failed");

    assert_eq!(content.lines().count(), 2);
    assert!(content.contains("10:05 AM"));
}

/// Test retry logic with a transient failure
#[tokio::test]
async fn test_http_source_retries_on_server_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/exports/flaky.jsonl"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/exports/flaky.jsonl"))
        .respond_with(ResponseTemplate::new(200).set_body_string("success"))
        .mount(&mock_server)
        .await;

    let source = HttpSource::new(&format!("{}/exports/", mock_server.uri()), 0).unwrap();
    let content = source
        .download(&format!("{}/exports/flaky.jsonl", mock_server.uri()))
        .await
        .expect("Retry should recover from one 503");

    assert_eq!(content, "success");
}

/// Test client errors are returned without retrying
#[tokio::test]
async fn test_http_source_missing_object() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/exports/gone.jsonl"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let source = HttpSource::new(&format!("{}/exports/", mock_server.uri()), 0).unwrap();
    let object = RawObject {
        name: "gone.jsonl".to_string(),
        location: format!("{}/exports/gone.jsonl", mock_server.uri()),
    };

    match source.read_object(&object).await {
        Err(AppError::Http(e)) => assert_eq!(e.status().map(|s| s.as_u16()), Some(404)),
        other => panic!("Expected Http error, got: {:?}", other),
    }
}

/// Test a full dry run over the HTTP source
#[test]
fn test_pipeline_over_http_source() {
    tokio_test::block_on(async {
        let mock_server = export_server().await;
        let dir = tempfile::tempdir().unwrap();

        let registry_path = dir.path().join("stations.json");
        std::fs::write(&registry_path, r#"[{"station_id": "IICHTE19", "name": "Ichtegem"}]"#)
            .unwrap();
        let report_path = dir.path().join("report.json");

        let yaml = format!(
            r#"
database:
  host: localhost
  name: weather
  user: test
  password: test
source:
  tag: WU_ICHTEGEM
  station_aliases:
    WU_ICHTEGEM: IICHTE19
  input:
    kind: local
    dir: {dir}
loader:
  dry_run: true
stations:
  registry_path: {registry}
report:
  output_path: {report}
"#,
            dir = dir.path().display(),
            registry = registry_path.display(),
            report = report_path.display(),
        );
        let config = Config::from_yaml(&yaml).expect("Test config should be valid");
        let registry = StationRegistry::load_from_file(&registry_path).unwrap();
        let source = HttpSource::new(&format!("{}/exports/", mock_server.uri()), 0).unwrap();
        let store = MemoryStore::new();

        let report = Pipeline::new(&config, &store, &source, &registry)
            .run()
            .await
            .expect("Run should complete");

        assert_eq!(report.run.objects, 2);
        assert_eq!(report.run.lines, 4);
        assert_eq!(report.run.rejected, 1);
        assert_eq!(report.load.inserted, 2);
        assert_eq!(report.load.duplicates, 1);
        assert_eq!(report.quality.fk_missing_station, 0);
        assert_eq!(store.len(), 2);
        assert!(report_path.exists());
    });
}
