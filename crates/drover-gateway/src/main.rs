//! `droverd` — the harness daemon.
//!
//! Configuration precedence: CLI flags > `DROVER_*` env vars > JSON config
//! file > defaults. `.env.local` / `.env` seed the environment first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parking_lot::RwLock;
use tracing_subscriber::EnvFilter;

use drover_domain::config::{expand_home, load_env_file, load_settings, Config};
use drover_gateway::api;
use drover_gateway::engine::{RunEngine, SpecGenerator, TurnEngine};
use drover_gateway::state::AppState;
use drover_kit::OpenAiCompatKit;
use drover_store::Store;

#[derive(Parser)]
#[command(name = "droverd", about = "Drover coding-agent harness daemon")]
struct Cli {
    /// Listen address (host:port).
    #[arg(long, default_value = "")]
    listen: String,
    /// Data directory.
    #[arg(long = "data-dir", default_value = "")]
    data_dir: String,
    /// Static bearer token for API auth.
    #[arg(long = "auth-token", default_value = "")]
    auth_token: String,
    /// Config file path.
    #[arg(long, default_value = "")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    load_env_file(Path::new(".env.local"));
    load_env_file(Path::new(".env"));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,drover_gateway=debug")),
        )
        .init();

    let config = load_config(&cli);
    let data_dir = PathBuf::from(&config.data_dir);

    let settings_path = data_dir.join("settings.json");
    let mut model_policy = config.model_policy.clone();
    match load_settings(&settings_path) {
        Ok((settings, true)) => model_policy = settings.model_policy,
        Ok((_, false)) => {}
        Err(err) => {
            tracing::warn!(path = %settings_path.display(), error = %err, "failed to load settings");
        }
    }

    let store = Arc::new(Store::open(&data_dir).context("opening store")?);
    let kit = Arc::new(OpenAiCompatKit::from_env().context("building model kit")?);
    let policy = Arc::new(RwLock::new(model_policy));

    let turns = Arc::new(TurnEngine::new(store.clone(), kit.clone(), policy.clone()));
    let runs = Arc::new(RunEngine::new(store.clone(), kit.clone(), policy.clone()));
    let specgen = Arc::new(SpecGenerator::new(kit.clone(), policy.clone()));

    let auth_token_hash = if config.auth_token.trim().is_empty() {
        tracing::warn!("no auth token configured; API is open");
        None
    } else {
        Some(Arc::new(api::auth::hash_token(config.auth_token.trim())))
    };

    let state = AppState {
        store,
        kit,
        policy,
        turns,
        runs,
        specgen,
        settings_path,
        auth_token_hash,
    };

    let app = api::router(state);
    let addr = parse_listen_addr(&config.listen_addr);

    tracing::info!(addr = %addr, data_dir = %config.data_dir, "droverd listening");
    if !config.auth_token.trim().is_empty() {
        tracing::info!("auth enabled (bearer)");
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

/// Merge flags > env > file > defaults and expand `~` in `data_dir`.
fn load_config(cli: &Cli) -> Config {
    let mut config = Config::default();

    let config_path = if !cli.config.is_empty() {
        cli.config.clone()
    } else {
        std::env::var("DROVER_CONFIG").unwrap_or_default()
    };
    if !config_path.is_empty() {
        match Config::load_from_file(Path::new(&config_path)) {
            Ok(loaded) => config = loaded,
            Err(err) => {
                tracing::warn!(path = %config_path, error = %err, "failed to load config file");
            }
        }
    }

    if let Ok(listen) = std::env::var("DROVER_LISTEN") {
        if !listen.trim().is_empty() {
            config.listen_addr = listen;
        }
    }
    if let Ok(data_dir) = std::env::var("DROVER_DATA_DIR") {
        if !data_dir.trim().is_empty() {
            config.data_dir = data_dir;
        }
    }
    if let Ok(token) = std::env::var("DROVER_AUTH_TOKEN") {
        if !token.trim().is_empty() {
            config.auth_token = token;
        }
    }

    if !cli.listen.is_empty() {
        config.listen_addr = cli.listen.clone();
    }
    if !cli.data_dir.is_empty() {
        config.data_dir = cli.data_dir.clone();
    }
    if !cli.auth_token.is_empty() {
        config.auth_token = cli.auth_token.clone();
    }

    config.data_dir = expand_home(&config.data_dir);
    config
}

fn parse_listen_addr(addr: &str) -> String {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return "127.0.0.1:8787".to_owned();
    }
    if trimmed.contains(':') {
        trimmed.to_owned()
    } else {
        format!("{trimmed}:8787")
    }
}
