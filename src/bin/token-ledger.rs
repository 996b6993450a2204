use std::sync::Arc;

use clap::Parser;
use token_ledger::{LedgerConfig, LedgerHttpState, TokenStore, observability, router};

#[path = "token_ledger/cli.rs"]
mod cli;

use cli::{Args, StoreBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _tracing_guard = observability::init_tracing(&args.tracing_options())?;

    let config = LedgerConfig::load(&args.config)?;
    let verifier = config.verifier_from_env()?;
    let admin_token = config.admin_token_from_env()?;
    let store = open_store(args.store_backend()).await?;

    let mut state = LedgerHttpState::from_config(&config, store, verifier);
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(
        listen = %args.listen,
        users = config.users.len(),
        "token-ledger listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn open_store(
    backend: StoreBackend,
) -> Result<Arc<dyn TokenStore>, Box<dyn std::error::Error>> {
    match backend {
        StoreBackend::Sqlite(path) => open_sqlite(path).await,
        StoreBackend::Redis { url, prefix } => open_redis(url, prefix).await,
    }
}

#[cfg(feature = "store-sqlite")]
async fn open_sqlite(
    path: std::path::PathBuf,
) -> Result<Arc<dyn TokenStore>, Box<dyn std::error::Error>> {
    let store = token_ledger::SqliteStore::new(path);
    store.init().await?;
    tracing::info!(path = %store.path().display(), "using sqlite store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "store-sqlite"))]
async fn open_sqlite(
    _path: std::path::PathBuf,
) -> Result<Arc<dyn TokenStore>, Box<dyn std::error::Error>> {
    Err("sqlite store requires building with `--features store-sqlite`".into())
}

#[cfg(feature = "store-redis")]
async fn open_redis(
    url: String,
    prefix: Option<String>,
) -> Result<Arc<dyn TokenStore>, Box<dyn std::error::Error>> {
    let mut store = token_ledger::RedisStore::new(url)?;
    if let Some(prefix) = prefix {
        store = store.with_prefix(prefix);
    }
    store.ping().await?;
    tracing::info!(prefix = store.prefix(), "using redis store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "store-redis"))]
async fn open_redis(
    _url: String,
    _prefix: Option<String>,
) -> Result<Arc<dyn TokenStore>, Box<dyn std::error::Error>> {
    Err("redis store requires building with `--features store-redis`".into())
}
