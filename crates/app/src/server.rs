use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use pageqa_core::{Pipeline, QueryRequest, Readiness};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

#[derive(Debug, Deserialize)]
struct QueryPayload {
    #[serde(default)]
    url: String,
    #[serde(default)]
    question: String,
}

type JsonReply = (StatusCode, Json<Value>);

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/query", post(query_handler))
        .route("/ping", get(ping))
        .route("/health", get(health))
        // The popup client calls from a browser-extension origin.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { pipeline })
}

pub async fn serve(pipeline: Arc<Pipeline>, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "pageqa listening");

    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn query_handler(
    State(state): State<AppState>,
    payload: Result<Json<QueryPayload>, JsonRejection>,
) -> JsonReply {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return error_reply(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let result = state
        .pipeline
        .run(QueryRequest::new(payload.url, payload.question))
        .await;

    match result.error() {
        None => (
            StatusCode::OK,
            Json(json!({
                "answer": result.answer(),
                "raw": result.raw(),
                "structured": result.structured(),
            })),
        ),
        Some(error) => {
            let status = StatusCode::from_u16(result.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_reply(status, error)
        }
    }
}

async fn ping() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn health(State(state): State<AppState>) -> Json<Readiness> {
    Json(state.pipeline.readiness())
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> JsonReply {
    (status, Json(json!({ "error": message.into() })))
}
