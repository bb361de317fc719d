mod api;
mod auth;
mod config;
mod cors;
mod db;
mod error;
mod invite;
mod store;
mod validation;
mod ws;

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::jwt::TokenService,
    config::{LogFormat, RelayConfig},
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    invite::InviteRegistry,
    store::ChatStore,
    ws::{authorizer::ConnectionAuthorizer, controller::RoomSessionController, hub::RoomHub},
};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Everything the routers share. One instance per process.
#[derive(Clone)]
pub(crate) struct RelayServices {
    store: ChatStore,
    tokens: Arc<TokenService>,
    invites: Arc<InviteRegistry>,
    rooms: RoomSessionController,
    authorizer: Arc<ConnectionAuthorizer>,
}

impl RelayServices {
    fn new(config: &RelayConfig, store: ChatStore) -> anyhow::Result<Self> {
        let tokens = Arc::new(
            TokenService::new(
                &config.access_token_secret,
                &config.refresh_token_secret,
                store.clone(),
            )
            .context("invalid relay token secrets")?,
        );
        let invites = Arc::new(
            InviteRegistry::new(&config.invite_secret, store.clone())
                .context("invalid relay invite secret")?,
        );
        let rooms =
            RoomSessionController::new(store.clone(), Arc::new(RoomHub::default()), Arc::clone(&invites));
        let authorizer = Arc::new(ConnectionAuthorizer::new(Arc::clone(&tokens), store.clone()));

        Ok(Self { store, tokens, invites, rooms, authorizer })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.uses_dev_secrets() {
        warn!("using development signing secrets; set the MURMUR_RELAY_*_SECRET variables in production");
    }

    let store = open_store(&config).await?;
    let services = RelayServices::new(&config, store.clone())?;
    let _purge_task = store::spawn_credential_purge(store, config.credential_purge_interval);

    let app = build_router(services, cors::cors_layer(config.cors_origins.as_deref()));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting murmur relay");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn open_store(config: &RelayConfig) -> anyhow::Result<ChatStore> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("MURMUR_RELAY_DATABASE_URL is unset; using the in-memory store, data is lost on restart");
        return Ok(ChatStore::memory());
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env())
        .await
        .context("failed to initialize relay PostgreSQL pool")?;
    check_pool_health(&pool).await.context("relay PostgreSQL health check failed")?;
    run_migrations(&pool).await?;

    Ok(ChatStore::Postgres(pool))
}

fn build_router(services: RelayServices, cors: CorsLayer) -> Router {
    let RelayServices { store, tokens, invites, rooms, authorizer } = services;

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(ws::ChatSocketState { authorizer, controller: rooms.clone() }))
            .merge(api::router(api::AuthApiState { store, tokens, invites, rooms }))
            .layer(cors),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

#[cfg(test)]
pub(crate) fn test_services() -> RelayServices {
    let config = RelayConfig::from_env_fn(|_| Err(std::env::VarError::NotPresent));
    RelayServices::new(&config, ChatStore::memory()).expect("test services should initialize")
}
