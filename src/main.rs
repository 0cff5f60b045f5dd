use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use weather_ingest::config::Config;
use weather_ingest::db::{MemoryStore, Repository};
use weather_ingest::pipeline::Pipeline;
use weather_ingest::source::ConfiguredSource;
use weather_ingest::stations::StationRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,weather_ingest=debug,sqlx=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Weather ingestion run starting...");

    let config_path = Config::default_path();
    let config = Config::load(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {}\n\n\
             Make sure:\n\
             1. {} exists (or point WEATHER_INGEST_CONFIG at your config file)\n\
             2. All required environment variables are set (check .env.example)\n\
             3. Create a .env file if needed",
            e,
            config_path.display()
        )
    })?;
    info!("Configuration loaded from {}", config_path.display());

    let registry = StationRegistry::load_from_file(&config.stations.registry_path).map_err(|e| {
        anyhow::anyhow!(
            "{}\n\n\
             The station registry is required reference data. Point \
             stations.registry_path at a JSON list of station objects, \
             e.g. config/stations.json",
            e
        )
    })?;

    let source = ConfiguredSource::from_config(&config.source.input)?;

    if config.loader.dry_run {
        info!("Dry run: loading into the in-memory store");
        let store = MemoryStore::new();
        let report = Pipeline::new(&config, &store, &source, &registry).run().await?;
        info!(
            "Dry run complete: {} documents held in memory, status {}",
            store.len(),
            report.status
        );
        return Ok(());
    }

    let connection_string = config.database.connection_string();
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_seconds))
        .connect(&connection_string)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to database: {}\n\n\
                 Host: {}:{}\n\
                 Database: {}\n\
                 User: {}\n\n\
                 Common fixes:\n\
                 1. Ensure PostgreSQL is running\n\
                 2. Check username/password are correct (DB_USER, DB_PASSWORD)\n\
                 3. Verify database exists: createdb {}\n\
                 4. Check host and port (DB_HOST, DB_PORT)",
                e,
                config.database.host,
                config.database.port,
                config.database.name,
                config.database.user,
                config.database.name
            )
        })?;

    info!(
        "Connected to database: {}@{}:{}/{}",
        config.database.user, config.database.host, config.database.port, config.database.name
    );

    let repository = Repository::new(pool);
    repository.run_migrations().await?;

    let report = Pipeline::new(&config, &repository, &source, &registry)
        .run()
        .await?;

    info!("Weather ingestion run finished with status {}", report.status);
    Ok(())
}
