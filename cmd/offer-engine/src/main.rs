//! # Offer Engine Binary
//!
//! Loads configuration, picks a store, wires the services and serves the
//! HTTP API until SIGINT/SIGTERM.

mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use api_adapters::{router, AppState, Metrics, PixelTemplateRenderer};
use configs::{AppConfig, DatabaseConfig, SubstringMatchMode};
use domains::ports::{
    CapCounter, Clock, EventStore, HttpClient, OfferRepository, PixelRepository, SessionStore,
    SystemClock, VerificationCache,
};
use http_adapters::ReqwestHttpClient;
use services::{
    ConversionTracker, EligibilityEngine, EngineOptions, LeadDispatcher, OfferCapTracker,
    OfferService, PixelService, PrePingCoordinator, SessionService, SubstringMatch,
};
use storage_adapters::{InMemoryStore, Seed};
use tokio::signal;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Every persistence port, whichever store backs them.
struct Ports {
    offers: Arc<dyn OfferRepository>,
    caps: Arc<dyn CapCounter>,
    verification: Arc<dyn VerificationCache>,
    pixels: Arc<dyn PixelRepository>,
    sessions: Arc<dyn SessionStore>,
    events: Arc<dyn EventStore>,
}

impl Ports {
    fn from_store<S>(store: Arc<S>) -> Self
    where
        S: OfferRepository
            + CapCounter
            + VerificationCache
            + PixelRepository
            + SessionStore
            + EventStore
            + 'static,
    {
        Self {
            offers: store.clone(),
            caps: store.clone(),
            verification: store.clone(),
            pixels: store.clone(),
            sessions: store.clone(),
            events: store,
        }
    }
}

#[cfg(feature = "db-postgres")]
async fn open_postgres(db: &DatabaseConfig) -> anyhow::Result<Option<Ports>> {
    use secrecy::ExposeSecret;

    let Some(url) = &db.url else {
        return Ok(None);
    };
    let store = storage_adapters::PgStore::connect(url.expose_secret(), db.max_connections).await?;
    store.run_migrations().await?;
    store.health_check().await?;
    info!("using postgres store");
    Ok(Some(Ports::from_store(Arc::new(store))))
}

#[cfg(not(feature = "db-postgres"))]
async fn open_postgres(db: &DatabaseConfig) -> anyhow::Result<Option<Ports>> {
    if db.url.is_some() {
        warn!("database.url ignored: built without db-postgres");
    }
    Ok(None)
}

/// Postgres when a URL is configured, otherwise the in-memory store.
async fn open_store(db: &DatabaseConfig) -> anyhow::Result<Ports> {
    if let Some(ports) = open_postgres(db).await? {
        return Ok(ports);
    }

    let seed = match &db.seed_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading seed file {path}"))?;
            serde_json::from_str::<Seed>(&raw).with_context(|| format!("parsing seed file {path}"))?
        }
        None => Seed::default(),
    };
    info!(seed = db.seed_file.as_deref().unwrap_or("none"), "using in-memory store");
    Ok(Ports::from_store(Arc::new(InMemoryStore::from_seed(seed))))
}

fn substring_match(mode: SubstringMatchMode) -> SubstringMatch {
    match mode {
        SubstringMatchMode::Legacy => SubstringMatch::Legacy,
        SubstringMatchMode::Standard => SubstringMatch::Standard,
    }
}

fn build_state(config: &AppConfig, ports: Ports, http: Arc<dyn HttpClient>) -> AppState {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sessions = Arc::new(SessionService::new(ports.sessions));
    let engine = EligibilityEngine::new(EngineOptions {
        substring_match: substring_match(config.engine.substring_match),
    });

    let offers = OfferService::new(
        ports.offers.clone(),
        ports.verification,
        OfferCapTracker::new(ports.caps),
        PrePingCoordinator::new(http.clone(), config.engine.pre_ping_timeout()),
        engine,
        clock.clone(),
    );
    let leads = LeadDispatcher::new(
        ports.offers.clone(),
        ports.events.clone(),
        http,
        sessions.clone(),
        clock.clone(),
        config.engine.lead_post_timeout(),
    );
    let tracking = ConversionTracker::new(ports.offers, ports.events, sessions.clone(), clock);
    let pixels = PixelService::new(
        ports.pixels,
        Arc::new(PixelTemplateRenderer::new()),
        sessions.clone(),
    );

    AppState {
        offers: Arc::new(offers),
        pixels: Arc::new(pixels),
        leads: Arc::new(leads),
        tracking: Arc::new(tracking),
        sessions,
        metrics: Arc::new(Metrics::new()),
        test_pre_ping_timeout: config.engine.test_pre_ping_timeout(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    logging::init(&config.logging);

    let ports = open_store(&config.database).await?;
    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(CONNECT_TIMEOUT)?);
    let app = router(build_state(&config, ports, http));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "offer engine listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("shutdown complete");
    Ok(())
}
