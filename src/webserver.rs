//! HTTP interface: health check, issuance and single-use download

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::configs::ServerConfig;
use crate::error::{ErrorKind, IssuanceError};
use crate::issuer::Issuer;
use crate::protocol::{ErrorResponse, FieldErrors, HealthResponse, IssueRequest, IssueResponse};

/// Failure of a handler, rendered as a JSON [`ErrorResponse`]
enum ApiError {
    Issuance(IssuanceError),
    InvalidFields(FieldErrors),
    MalformedBody(JsonRejection),
}

impl From<IssuanceError> for ApiError {
    fn from(error: IssuanceError) -> Self {
        ApiError::Issuance(error)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Configuration
        | ErrorKind::Generation
        | ErrorKind::Signing
        | ErrorKind::Packaging => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Issuance(error) => {
                let kind = error.kind();
                if kind.is_server_error() {
                    warn!(kind = kind.as_str(), error = %error, "Issuance request failed");
                }
                (status_for(kind), Json(ErrorResponse::from_error(&error))).into_response()
            }
            ApiError::InvalidFields(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse::invalid_fields(errors)),
            )
                .into_response(),
            ApiError::MalformedBody(rejection) => (
                rejection.status(),
                Json(ErrorResponse::malformed_body(rejection.body_text())),
            )
                .into_response(),
        }
    }
}

pub fn router(issuer: Arc<Issuer>, config: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/validate", post(validate))
        .route("/download/{download_id}", get(download))
        .layer(cors_layer(&config.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(issuer)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([header::CONTENT_DISPOSITION]);

    if allowed_origins.iter().any(|origin| origin == "*") {
        return base.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring malformed CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(origins))
}

async fn health(State(issuer): State<Arc<Issuer>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        time: chrono::Utc::now().to_rfc3339(),
        ca_ready: issuer.is_ready(),
    })
}

async fn validate(
    State(issuer): State<Arc<Issuer>>,
    payload: Result<Json<IssueRequest>, JsonRejection>,
) -> Result<Json<IssueResponse>, ApiError> {
    let Json(request) = payload.map_err(ApiError::MalformedBody)?;
    let identity = request.validate().map_err(ApiError::InvalidFields)?;
    let issued = issuer.issue(&identity).await?;
    Ok(Json(IssueResponse::from(issued)))
}

async fn download(
    State(issuer): State<Arc<Issuer>>,
    Path(download_id): Path<String>,
) -> Result<Response, ApiError> {
    // File read and unlink stay off the async workers
    let artifact = tokio::task::spawn_blocking(move || issuer.retrieve(&download_id))
        .await
        .map_err(|e| IssuanceError::packaging(format!("download worker failed: {}", e)))??;
    let disposition = format!("attachment; filename=\"{}\"", artifact.filename);
    let disposition = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(artifact.media_type)),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        artifact.bytes,
    )
        .into_response())
}

/// Bind and serve until Ctrl-C
pub async fn serve(config: &ServerConfig, issuer: Arc<Issuer>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .context(format!("Failed to bind {}:{}", config.host, config.port))?;
    let addr: SocketAddr = listener
        .local_addr()
        .context("Failed to read listen address")?;
    info!(address = %addr, "HTTP server listening");

    axum::serve(listener, router(issuer, config))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
