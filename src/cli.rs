//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde;

/// Fetch forecast API resources through the request cache
#[derive(Parser, Debug)]
#[command(name = "forecast-cache")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "FORECAST_CACHE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "warn",
        env = "FORECAST_CACHE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "FORECAST_CACHE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// GET a resource through the cache
    Get {
        /// Path relative to the API base URL (e.g. `entities/ws1`)
        #[arg(required = true)]
        path: String,

        /// Query parameter as `name=value`; may repeat
        #[arg(short, long = "query", value_parser = parse_query_pair)]
        query: Vec<(String, String)>,

        /// Number of times to request the resource
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,

        /// TTL for the cached response (e.g. `30s`, `5m`)
        #[arg(long, value_parser = parse_duration)]
        ttl: Option<Duration>,

        /// Print cache statistics after the requests
        #[arg(long)]
        stats: bool,
    },

    /// Print the resolved configuration
    Config,
}

fn parse_query_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    match humantime_serde::parse(raw) {
        Ok(d) if !d.is_zero() => Ok(d),
        Ok(_) => Err("TTL must be positive".to_string()),
        Err(e) => Err(format!("invalid duration '{raw}': {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_with_repeated_query() {
        let cli = Cli::try_parse_from([
            "forecast-cache",
            "get",
            "entities/ws1",
            "-q",
            "method=m1",
            "-q",
            "method=m2",
            "--repeat",
            "3",
            "--ttl",
            "2m",
        ])
        .unwrap();

        match cli.command {
            Command::Get {
                path,
                query,
                repeat,
                ttl,
                stats,
            } => {
                assert_eq!(path, "entities/ws1");
                assert_eq!(query.len(), 2);
                assert_eq!(query[1], ("method".to_string(), "m2".to_string()));
                assert_eq!(repeat, 3);
                assert_eq!(ttl, Some(Duration::from_secs(120)));
                assert!(!stats);
            }
            Command::Config => panic!("expected get"),
        }
    }

    #[test]
    fn test_query_pair_requires_equals() {
        assert!(parse_query_pair("method").is_err());
        assert!(parse_query_pair("=x").is_err());
        assert_eq!(
            parse_query_pair("date=2024-01-01T12=00").unwrap(),
            ("date".to_string(), "2024-01-01T12=00".to_string())
        );
    }

    #[test]
    fn test_zero_ttl_rejected() {
        assert!(parse_duration("0s").is_err());
    }
}
