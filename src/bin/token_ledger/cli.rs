use std::path::PathBuf;

use clap::Parser;
use token_ledger::observability::TracingOptions;

const DEFAULT_SQLITE_PATH: &str = "token-ledger.sqlite";

#[derive(Parser, Debug)]
#[command(
    name = "token-ledger",
    version,
    about = "Serves token balances, consumption and purchase confirmation over HTTP."
)]
pub(crate) struct Args {
    /// Ledger config. `.toml` files are read as TOML, anything else as JSON.
    pub config: PathBuf,
    #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:8080")]
    pub listen: String,
    /// SQLite database file. Used when `--redis` is not given.
    #[arg(long, value_name = "PATH", conflicts_with = "redis")]
    pub sqlite: Option<PathBuf>,
    #[arg(long, value_name = "URL")]
    pub redis: Option<String>,
    #[arg(long, value_name = "PREFIX", requires = "redis")]
    pub redis_prefix: Option<String>,
    #[arg(long)]
    pub json_logs: bool,
    /// Export spans over OTLP/HTTP.
    #[arg(long)]
    pub otel: bool,
    #[arg(long, value_name = "URL")]
    pub otel_endpoint: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StoreBackend {
    Sqlite(PathBuf),
    Redis { url: String, prefix: Option<String> },
}

impl Args {
    pub(crate) fn tracing_options(&self) -> TracingOptions {
        TracingOptions {
            json_logs: self.json_logs,
            otel: self.otel || self.otel_endpoint.is_some(),
            otel_endpoint: self.otel_endpoint.clone(),
        }
    }

    pub(crate) fn store_backend(&self) -> StoreBackend {
        match &self.redis {
            Some(url) => StoreBackend::Redis {
                url: url.clone(),
                prefix: self.redis_prefix.clone(),
            },
            None => StoreBackend::Sqlite(
                self.sqlite
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH)),
            ),
        }
    }
}
