use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::scheduler::Context;

#[derive(Clone)]
pub struct DashboardState {
    pub ctx: Arc<Context>,
}

#[derive(Serialize)]
struct HostResponse {
    address: String,
    category: String,
    connected: bool,
    available: bool,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/hosts", get(hosts_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state)).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.ctx.status().latest())
}

async fn hosts_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let hosts: Vec<HostResponse> = state
        .ctx
        .pools()
        .flat_map(|pool| {
            let available = pool.available();
            pool.hosts().into_iter().map(move |host| HostResponse {
                available: available.contains(&host.address),
                address: host.address,
                category: host.category.to_string(),
                connected: host.connected,
            })
        })
        .collect();

    Json(hosts)
}
