pub mod auth;
pub mod error;
pub mod handlers;
pub mod models;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::Method,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::engine::Exchange;

#[derive(Clone)]
pub struct AppState {
    pub exchange: Arc<Exchange>,
}

impl AppState {
    pub fn new(exchange: Arc<Exchange>) -> Self {
        Self { exchange }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    let public = Router::new()
        .route("/register", post(handlers::register))
        .route("/instrument", get(handlers::list_instruments))
        .route("/orderbook/:ticker", get(handlers::orderbook))
        .route("/transactions/:ticker", get(handlers::transactions));

    let admin = Router::new()
        .route("/user/:user_id", delete(handlers::delete_user))
        .route("/instrument", post(handlers::add_instrument))
        .route("/instrument/:ticker", delete(handlers::delete_instrument))
        .route("/balance/deposit", post(handlers::deposit))
        .route("/balance/withdraw", post(handlers::withdraw));

    let api = Router::new()
        .nest("/public", public)
        .nest("/admin", admin)
        .route("/balance", get(handlers::balances))
        .route(
            "/order",
            post(handlers::create_order).get(handlers::list_orders),
        )
        .route(
            "/order/:order_id",
            get(handlers::get_order).delete(handlers::cancel_order),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

pub async fn start_server(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = create_router(state);

    info!("Exchange API listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    hyper::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
