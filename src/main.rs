//! Forecast Cache - fetch forecast API resources through the request cache

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use forecast_cache::{
    RequestCache,
    cli::{Cli, Command},
    client::{ForecastClient, JsonSource, source_fetcher},
    config::Config,
    keys::compose_key,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {e}");
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Get {
            path,
            query,
            repeat,
            ttl,
            stats,
        } => run_get(&config, path, query, repeat, ttl, stats).await,
        Command::Config => run_config(&config),
    }
}

/// Request a resource `repeat` times through one cache
async fn run_get(
    config: &Config,
    path: String,
    query: Vec<(String, String)>,
    repeat: u32,
    ttl: Option<Duration>,
    stats: bool,
) -> ExitCode {
    let client = match ForecastClient::new(&config.api, &config.retry) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    let source: Arc<dyn JsonSource> = Arc::new(client);
    let cache = RequestCache::with_default_ttl(config.cache.default_ttl);

    let mut parts: Vec<&dyn forecast_cache::keys::KeySegment> = vec![&path];
    for (name, value) in &query {
        parts.push(name);
        parts.push(value);
    }
    let key = compose_key(&parts);
    let fetch = source_fetcher(source, path.clone(), query.clone());

    let mut last = None;
    for attempt in 1..=repeat.max(1) {
        match cache.fetch(&key, &fetch, ttl).await {
            Ok(fetched) => {
                info!(key = %key, attempt, from_cache = fetched.from_cache, "Request served");
                last = Some(fetched.value);
            }
            Err(e) => {
                eprintln!("❌ Error loading {path}: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if let Some(value) = last {
        match serde_json::to_string_pretty(&value) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("❌ Failed to serialize response: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if stats {
        let snapshot = cache.stats();
        eprintln!(
            "cache: {} hit(s), {} miss(es), {} joined, {} fetch(es), {} entr{}",
            snapshot.hits,
            snapshot.misses,
            snapshot.joins,
            snapshot.fetches,
            snapshot.size,
            if snapshot.size == 1 { "y" } else { "ies" }
        );
        for entry in cache.entries() {
            eprintln!(
                "  {} (generation {}, fetched {})",
                entry.key,
                entry.generation,
                entry
                    .fetched_at
                    .map_or_else(|| "never".to_string(), |at| at.to_rfc3339())
            );
        }
    }

    ExitCode::SUCCESS
}

/// Print the resolved configuration as YAML
fn run_config(config: &Config) -> ExitCode {
    match serde_yaml::to_string(config) {
        Ok(yaml) => {
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to serialize config: {e}");
            ExitCode::FAILURE
        }
    }
}
