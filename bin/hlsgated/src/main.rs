use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use hlsgate::{GatewayError, StreamConfig, StreamManager};

#[derive(Parser, Debug)]
#[clap(name = "hlsgated", about = "DASH to HLS transmuxing gateway daemon")]
struct Args {
    /// Address to listen on
    #[clap(short, long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Root directory for generated HLS output
    #[clap(short, long, default_value = "output")]
    output_dir: PathBuf,
}

type AppState = Arc<StreamManager>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let manager = Arc::new(StreamManager::new(&args.output_dir)?);

    let app = Router::new()
        .route("/", get(index))
        .route("/streams", get(list_streams).post(add_stream))
        .route("/streams/{id}", get(get_stream).delete(remove_stream))
        .route("/hls/{id}/{*path}", get(serve_hls))
        .with_state(Arc::clone(&manager));

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(listen = %args.listen, output_dir = %args.output_dir.display(), "hlsgated listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;
    Ok(())
}

async fn shutdown_signal(manager: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutting down, stopping all streams");
    manager.shutdown_all().await;
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "service": "hlsgate",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "streams": "/streams",
            "hls": "/hls/{stream_id}/master.m3u8",
        }
    }))
}

async fn list_streams(State(manager): State<AppState>) -> Json<serde_json::Value> {
    let streams = manager.list().await;
    Json(json!({ "streams": streams }))
}

async fn add_stream(
    State(manager): State<AppState>,
    Json(config): Json<StreamConfig>,
) -> Response {
    match manager.create(config).await {
        Ok(snapshot) => (
            StatusCode::CREATED,
            Json(json!({
                "id": snapshot.id,
                "hls_url": snapshot.hls_url,
                "status": snapshot.status,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_stream(State(manager): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match manager.get(id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => not_found(),
    }
}

async fn remove_stream(State(manager): State<AppState>, Path(id): Path<Uuid>) -> Response {
    if manager.remove(id).await {
        Json(json!({ "message": "stream removed" })).into_response()
    } else {
        not_found()
    }
}

/// Serves a stream's playlists and segments, resolving the directory
/// through the manager so per-stream `output_dir` overrides keep working.
async fn serve_hls(
    State(manager): State<AppState>,
    Path((id, file)): Path<(Uuid, String)>,
) -> Response {
    let Some(root) = manager.output_dir(id).await else {
        return (StatusCode::NOT_FOUND, "stream not found").into_response();
    };

    let relative = std::path::Path::new(&file);
    if relative
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)))
    {
        return (StatusCode::NOT_FOUND, "file not found").into_response();
    }

    let target = root.join(relative);
    let bytes = match tokio::fs::read(&target).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::NOT_FOUND, "file not found").into_response(),
    };

    let content_type = match target.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("m4s") | Some("mp4") => "video/mp4",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    };
    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "stream not found" })),
    )
        .into_response()
}

fn error_response(error: GatewayError) -> Response {
    let status = match &error {
        GatewayError::Config(_) | GatewayError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}
