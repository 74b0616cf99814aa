use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use sealing_api::{
    CollectRequest, EraseReview, EraseReviewRequest, HydrateRequest, MigrateResult, SealingApi,
    API_CONTRACT_VERSION,
};
use sealing_core::{
    ActorRef, AuditEntry, CaseId, DateWindow, EligibilityReport, HydratedRecords,
    LedgerVerification, LinkedRecordIds, SealError, SealRequest,
};
use sealing_store_sqlite::{StoreOptions, DEFAULT_BUSY_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use time::Date;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Debug, Clone)]
struct ServiceState {
    api: SealingApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    kind: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EligibilityQuery {
    #[serde(default)]
    as_of: Option<Date>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RecordsBody {
    #[serde(default)]
    before_eighteen_only: bool,
    #[serde(default)]
    window: Option<DateWindow>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EraseReviewQuery {
    #[serde(default)]
    start: Option<Date>,
    #[serde(default)]
    end: Option<Date>,
    #[serde(default)]
    as_of: Option<Date>,
}

#[derive(Debug, Clone, Deserialize)]
struct TransitionBody {
    reason: String,
    document_number: i64,
    actor_id: String,
    #[serde(default)]
    actor_origin: Option<String>,
    #[serde(default)]
    require_eligibility: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AuditQuery {
    #[serde(default)]
    case_id: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "sealing-service")]
#[command(about = "Local HTTP service for juvenile record sealing")]
struct Args {
    #[arg(long, env = "SEALING_DB", default_value = "./sealing.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "SEALING_BUSY_TIMEOUT_MS", default_value_t = DEFAULT_BUSY_TIMEOUT_MS)]
    busy_timeout_ms: u64,
    #[arg(long, env = "SEALING_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl From<SealError> for ServiceError {
    fn from(err: SealError) -> Self {
        let status = match &err {
            SealError::NotFound(_) => StatusCode::NOT_FOUND,
            SealError::AlreadyErased(_) | SealError::NotErased(_) | SealError::Ineligible { .. } => {
                StatusCode::CONFLICT
            }
            SealError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SealError::ConcurrencyConflict(_) => StatusCode::SERVICE_UNAVAILABLE,
            SealError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: err.to_string(),
            kind: err.kind(),
        }
    }
}

impl ServiceState {
    fn internal(err: &anyhow::Error) -> ServiceError {
        ServiceError::from(SealError::Persistence(format!("{err:#}")))
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run a synchronous store call off the async workers; Seal/Restore may wait on the write lock.
async fn blocking<T, F>(call: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result,
        Err(err) => Err(ServiceError::from(SealError::Persistence(format!(
            "request worker failed: {err}"
        )))),
    }
}

fn case_id_param(raw: &str) -> Result<CaseId, ServiceError> {
    CaseId::parse(raw).map_err(ServiceError::from)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/cases/:case_id/eligibility", get(case_eligibility))
        .route("/v1/cases/:case_id/records", post(case_records))
        .route("/v1/cases/:case_id/erase-review", get(case_erase_review))
        .route("/v1/cases/:case_id/seal", post(case_seal))
        .route("/v1/cases/:case_id/restore", post(case_restore))
        .route("/v1/records/hydrate", post(records_hydrate))
        .route("/v1/audit", get(audit_list))
        .route("/v1/audit/verify", get(audit_verify))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let options = StoreOptions { busy_timeout_ms: args.busy_timeout_ms };
    let state = ServiceState { api: SealingApi::with_options(args.db, options) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %state.api.db_path().display(), "sealing service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = blocking(move || {
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::internal(&err))
    })
    .await?;
    Ok(Json(envelope(result)))
}

async fn case_eligibility(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
    Query(query): Query<EligibilityQuery>,
) -> Result<Json<ServiceEnvelope<EligibilityReport>>, ServiceError> {
    let case_id = case_id_param(&case_id)?;
    let report = blocking(move || {
        state.api.evaluate_eligibility(&case_id, query.as_of).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(report)))
}

async fn case_records(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
    Json(body): Json<RecordsBody>,
) -> Result<Json<ServiceEnvelope<LinkedRecordIds>>, ServiceError> {
    let request = CollectRequest {
        case_id: case_id_param(&case_id)?,
        before_eighteen_only: body.before_eighteen_only,
        window: body.window,
    };
    let linked = blocking(move || {
        state.api.collect_linked_record_ids(&request).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(linked)))
}

async fn case_erase_review(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
    Query(query): Query<EraseReviewQuery>,
) -> Result<Json<ServiceEnvelope<EraseReview>>, ServiceError> {
    let window = match (query.start, query.end) {
        (Some(start), Some(end)) => Some(DateWindow::new(start, end)?),
        (None, None) => None,
        _ => {
            return Err(ServiceError::from(SealError::Validation(
                "window requires both start and end".to_string(),
            )));
        }
    };
    let request =
        EraseReviewRequest { case_id: case_id_param(&case_id)?, window, as_of: query.as_of };
    let review =
        blocking(move || state.api.erase_review(&request).map_err(ServiceError::from)).await?;
    Ok(Json(envelope(review)))
}

fn transition_request(
    raw_case_id: &str,
    headers: &HeaderMap,
    body: TransitionBody,
) -> Result<SealRequest, ServiceError> {
    let origin = body.actor_origin.or_else(|| {
        headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    });
    Ok(SealRequest {
        case_id: case_id_param(raw_case_id)?,
        reason: body.reason,
        document_number: body.document_number,
        actor: ActorRef { actor_id: body.actor_id, origin },
        require_eligibility: body.require_eligibility,
    })
}

async fn case_seal(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<TransitionBody>,
) -> Result<Json<ServiceEnvelope<AuditEntry>>, ServiceError> {
    let request = transition_request(&case_id, &headers, body)?;
    let entry = blocking(move || state.api.seal(&request).map_err(ServiceError::from)).await?;
    Ok(Json(envelope(entry)))
}

async fn case_restore(
    State(state): State<ServiceState>,
    Path(case_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<TransitionBody>,
) -> Result<Json<ServiceEnvelope<AuditEntry>>, ServiceError> {
    let request = transition_request(&case_id, &headers, body)?;
    let entry = blocking(move || state.api.restore(&request).map_err(ServiceError::from)).await?;
    Ok(Json(envelope(entry)))
}

async fn records_hydrate(
    State(state): State<ServiceState>,
    Json(request): Json<HydrateRequest>,
) -> Result<Json<ServiceEnvelope<HydratedRecords>>, ServiceError> {
    let records =
        blocking(move || state.api.hydrate(&request).map_err(ServiceError::from)).await?;
    Ok(Json(envelope(records)))
}

async fn audit_list(
    State(state): State<ServiceState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<ServiceEnvelope<Vec<AuditEntry>>>, ServiceError> {
    let case_id = query.case_id.as_deref().map(case_id_param).transpose()?;
    let entries = blocking(move || {
        state.api.list_audit(case_id.as_ref()).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(entries)))
}

async fn audit_verify(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<LedgerVerification>>, ServiceError> {
    let verification =
        blocking(move || state.api.verify_ledger().map_err(ServiceError::from)).await?;
    Ok(Json(envelope(verification)))
}
