//! feedwatch service entrypoint.
//! Wires config, state, providers and the poll loop, then serves the HTTP API.

use std::sync::Arc;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feedwatch::coordinator::{spawn_poll_loop, CoordinatorSettings, PollCycleCoordinator};
use feedwatch::ingest::providers::HttpJsonProvider;
use feedwatch::matcher::Base58AddressMatcher;
use feedwatch::metrics::Metrics;
use feedwatch::notify::DispatcherMux;
use feedwatch::ratelimit::RateLimitScheduler;
use feedwatch::store::{JsonFileStore, StateStore};
use feedwatch::webhook::WebhookIngest;
use feedwatch::{config, AppState};

/// Install the tracing subscriber. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedwatch=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if res.is_err() {
        // The runtime may already have installed one.
        tracing::debug!("tracing subscriber already installed");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = config::load_default().context("loading feedwatch config")?;

    // A corrupt state file is fatal.
    let store: Arc<dyn StateStore> = Arc::new(
        JsonFileStore::open(&cfg.state_path)
            .await
            .with_context(|| format!("opening state file {}", cfg.state_path.display()))?,
    );

    let scheduler = Arc::new(RateLimitScheduler::from_config(&cfg));
    let dispatcher = Arc::new(DispatcherMux::from_env());
    tracing::info!(sinks = ?dispatcher.sink_names(), "notification sinks configured");

    let mut coordinator = PollCycleCoordinator::new(
        store.clone(),
        scheduler.clone(),
        Arc::new(Base58AddressMatcher),
        dispatcher.clone(),
        CoordinatorSettings::from_config(&cfg),
    );
    for (kind, pcfg) in cfg.providers_by_kind()? {
        let provider = HttpJsonProvider::from_config(kind.as_str(), kind.default_endpoint(), &pcfg);
        tracing::info!(kind = kind.as_str(), url = %pcfg.url, "provider configured");
        coordinator = coordinator.with_provider(kind, Arc::new(provider));
    }
    let coordinator = Arc::new(coordinator);

    // The sender lives as long as the service; dropping it stops the loop.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_poll_loop(coordinator.clone(), cfg.poll_interval(), shutdown_rx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let webhook = Arc::new(WebhookIngest::new(store.clone(), dispatcher));
    let state = AppState::new(coordinator, scheduler, store, webhook)
        .with_webhook_auth(cfg.webhook_auth_token.as_deref());

    let mut router = feedwatch::router(state);
    match Metrics::init() {
        Ok(m) => router = router.merge(m.router()),
        Err(e) => tracing::warn!(error = %e, "metrics disabled"),
    }

    Ok(router.into())
}
