//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::health::{Health, ProcessInfo};
use crate::service::{HealthSnapshot, LookupService};
use crate::version::VersionInfo;

const MISSING_INPUT_MESSAGE: &str = "Input word is required";
const LOOKUP_FAILED_MESSAGE: &str = "Failed to process word";

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
    pub version: VersionInfo,
}

impl From<HealthSnapshot> for HealthCheckResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        Self {
            status: snapshot.state,
            process: snapshot.process,
            version: snapshot.version,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AutocorrectRequest {
    #[serde(default)]
    pub input_word: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AutocorrectResponse {
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AutocorrectResponse {
    fn ok(suggestions: Vec<String>) -> Self {
        Self {
            suggestions,
            error: None,
        }
    }

    fn error(message: &str) -> Self {
        Self {
            suggestions: Vec::new(),
            error: Some(message.to_string()),
        }
    }
}

async fn health_check(State(service): State<Arc<LookupService>>) -> Json<HealthCheckResponse> {
    Json(service.health().into())
}

async fn autocorrect(
    State(service): State<Arc<LookupService>>,
    body: Result<Json<AutocorrectRequest>, JsonRejection>,
) -> (StatusCode, Json<AutocorrectResponse>) {
    let word = match body {
        Ok(Json(request)) => request.input_word.unwrap_or_default(),
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected autocorrect body");
            String::new()
        }
    };

    match service.lookup(&word).await {
        Ok(suggestions) => (StatusCode::OK, Json(AutocorrectResponse::ok(suggestions))),
        Err(e) if e.is_client_error() => (
            StatusCode::BAD_REQUEST,
            Json(AutocorrectResponse::error(MISSING_INPUT_MESSAGE)),
        ),
        Err(e) => {
            // Details stay in the log; clients get a generic message.
            tracing::error!(word = %word, error = %e, "Autocorrect lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AutocorrectResponse::error(LOOKUP_FAILED_MESSAGE)),
            )
        }
    }
}

pub fn routes(service: Arc<LookupService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/api/autocorrect", post(autocorrect))
        .with_state(service)
}
