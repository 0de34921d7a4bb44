//! Liveness endpoint.

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::error::Result;

async fn status() -> StatusCode {
    StatusCode::OK
}

/// Serve `GET /status -> 200` until the process shuts down.
pub async fn serve(host: &str, port: u16) -> Result<()> {
    let app = Router::new().route("/status", get(status));
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(host, port, "health endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
