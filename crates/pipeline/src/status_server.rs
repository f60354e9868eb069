//! Status HTTP server
//!
//! Exposes the queue status and a few control endpoints for operators.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::service::{EncodingService, ServiceError, ServiceStatus};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Wraps a [`ServiceError`] so handlers can use `?`
struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.0.to_string(),
        });
        (error_status(&self.0), body).into_response()
    }
}

/// HTTP status for a service error
fn error_status(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::JobNotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::JobFinished(_) => StatusCode::CONFLICT,
        ServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ServiceError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Initialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler for GET /status
async fn get_status(State(service): State<Arc<EncodingService>>) -> Json<ServiceStatus> {
    Json(service.status())
}

/// Handler for POST /jobs/:id/cancel
///
/// Responds once cancellation has started; process and directory cleanup
/// finishes in the background.
async fn cancel_job(
    State(service): State<Arc<EncodingService>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    service.cancel_job(&id)?;
    Ok(StatusCode::ACCEPTED)
}

async fn pause(State(service): State<Arc<EncodingService>>) -> StatusCode {
    service.pause();
    StatusCode::NO_CONTENT
}

async fn resume(State(service): State<Arc<EncodingService>>) -> StatusCode {
    service.resume();
    StatusCode::NO_CONTENT
}

/// Creates the axum Router with status and control endpoints
pub fn create_status_router(service: Arc<EncodingService>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .with_state(service)
}

/// Runs the status HTTP server until the listener fails
pub async fn run_status_server(
    service: Arc<EncodingService>,
    addr: SocketAddr,
) -> Result<(), ServerError> {
    let app = create_status_router(service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Status server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
