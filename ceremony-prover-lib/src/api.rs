//! HTTP surface.
//!
//! Every response reflects what actually happened: a stage or prover
//! failure is never reported as success.

use crate::ceremony::ExternalInput;
use crate::context::ServiceContext;
use crate::error::Error;
use crate::types::{CeremonyInstance, CeremonyStatus, CircuitInfo, InstanceId, ProofRequest, ProofResult};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

const RETRY_AFTER_SECS: &str = "30";

/// Error wrapper rendering `{"error": {"code", "message", "retryable"}}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidInput(_) | Error::InvalidPlan(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) | Error::UnknownCircuit(_) => StatusCode::NOT_FOUND,
            Error::CeremonyFailed(_) => StatusCode::CONFLICT,
            Error::MissingInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::ParametersNotReady(_) | Error::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && !self.0.is_retryable() {
            error!(code = self.0.code(), error = %self.0, "Request failed");
        } else {
            warn!(code = self.0.code(), error = %self.0, "Request rejected");
        }
        let body = Json(serde_json::json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
                "retryable": self.0.is_retryable(),
            }
        }));
        let mut response = (status, body).into_response();
        if self.0.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunCeremonyBody {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub external_input: ExternalInput,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCeremonyResponse {
    pub instance_id: InstanceId,
    pub status: CeremonyStatus,
    pub completed_stages: Vec<String>,
}

impl From<&CeremonyInstance> for RunCeremonyResponse {
    fn from(instance: &CeremonyInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            status: instance.status,
            completed_stages: instance.completed_stages(),
        }
    }
}

pub fn router(ctx: ServiceContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ceremony/run", post(run_ceremony))
        .route("/ceremony/{instance_id}", get(get_ceremony))
        .route("/proof/generate", post(generate_proof))
        .route("/circuit/register", post(register_circuit))
        .route("/circuits", get(list_circuits))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn run_ceremony(
    State(ctx): State<ServiceContext>,
    Json(body): Json<RunCeremonyBody>,
) -> Result<Json<RunCeremonyResponse>, ApiError> {
    let instance = ctx
        .run_ceremony(body.instance_id, body.plan, body.external_input)
        .await?;
    Ok(Json(RunCeremonyResponse::from(&instance)))
}

async fn get_ceremony(
    State(ctx): State<ServiceContext>,
    Path(instance_id): Path<InstanceId>,
) -> Result<Json<CeremonyInstance>, ApiError> {
    Ok(Json(ctx.orchestrator().instance(&instance_id)?))
}

async fn generate_proof(
    State(ctx): State<ServiceContext>,
    Json(request): Json<ProofRequest>,
) -> Result<Json<ProofResult>, ApiError> {
    Ok(Json(ctx.proof_service().handle(request).await?))
}

async fn register_circuit(
    State(ctx): State<ServiceContext>,
    Json(info): Json<CircuitInfo>,
) -> Result<(StatusCode, Json<CircuitInfo>), ApiError> {
    ctx.proof_service().register_circuit(&info)?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_circuits(
    State(ctx): State<ServiceContext>,
) -> Result<Json<Vec<CircuitInfo>>, ApiError> {
    Ok(Json(ctx.proof_service().circuits()?))
}
