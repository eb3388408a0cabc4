#![forbid(unsafe_code)]

pub mod config;

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use roster_engines::directory::DisplayNameDirectory;
use roster_engines::presence::{summarize, PresenceEvaluator};
use roster_kernel_contracts::identity::{
    resolve_lookup_key, IdentityRecord, IdentityReport, ResolvedKey,
};
use roster_kernel_contracts::presence::{GateDecision, PresenceSummary, PresenceView};
use roster_kernel_contracts::{Clock, UnixTimeMs};
use roster_storage::repo::{AllowGateRepo, IdentityReportRepo};
use roster_storage::snapshot::RegistrySnapshotFile;
use roster_storage::{IdentityRegistry, ReportCommit, StorageError};

/// Ingest payload. Field aliases match what deployed clients already send.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default, alias = "deviceid")]
    pub device_id: Option<String>,
    #[serde(default, alias = "ip")]
    pub address: Option<String>,
    #[serde(default, alias = "server")]
    pub tag: Option<String>,
    #[serde(default, alias = "nickname")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub license_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub generated_at_ms: u64,
    pub window_secs: u64,
    pub summary: PresenceSummary,
    pub identities: Vec<PresenceView>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateQuery {
    pub key: Option<String>,
    #[serde(alias = "deviceid")]
    pub device_id: Option<String>,
    #[serde(alias = "ip")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedUpdate {
    pub key: String,
    pub allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedNameUpdate {
    pub key: String,
    pub verified_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub records: usize,
}

pub struct AdapterRuntime {
    registry: Arc<IdentityRegistry>,
    evaluator: PresenceEvaluator,
    directory: Arc<dyn DisplayNameDirectory>,
    clock: Arc<dyn Clock>,
}

impl AdapterRuntime {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        evaluator: PresenceEvaluator,
        directory: Arc<dyn DisplayNameDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            evaluator,
            directory,
            clock,
        }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub async fn ingest(&self, request: &IngestRequest) -> Result<ReportCommit, StorageError> {
        let report = IdentityReport::from_wire(
            request.device_id.as_deref(),
            request.address.as_deref(),
            request.tag.as_deref(),
            request.display_name.as_deref(),
            request.license_status.as_deref(),
        )?;
        self.registry.report_row(&report, self.clock.now()).await
    }

    pub fn snapshot(&self) -> SnapshotResponse {
        let now = self.clock.now();
        let identities =
            self.evaluator
                .annotate(&self.registry.list_rows(), now, self.directory.as_ref());
        SnapshotResponse {
            generated_at_ms: now.0,
            window_secs: self.evaluator.window().as_millis() / 1_000,
            summary: summarize(&identities),
            identities,
        }
    }

    /// Same resolution rule as ingest; `key` wins when given. Unresolvable input is denied.
    pub fn gate(&self, query: &GateQuery) -> GateDecision {
        let key = match query.key.as_deref().map(str::trim) {
            Some(k) if !k.is_empty() => ResolvedKey::new(k).ok(),
            _ => resolve_lookup_key(query.device_id.as_deref(), query.address.as_deref()),
        };
        GateDecision::from_flag(key.map(|k| self.registry.is_allowed_row(&k)).unwrap_or(false))
    }

    pub async fn set_allowed(&self, update: &AllowedUpdate) -> Result<PresenceView, StorageError> {
        let key = ResolvedKey::new(update.key.trim())?;
        let record = self.registry.set_allowed_row(&key, update.allowed).await?;
        Ok(self.view(record))
    }

    pub async fn set_verified_name(
        &self,
        update: &VerifiedNameUpdate,
    ) -> Result<PresenceView, StorageError> {
        let key = ResolvedKey::new(update.key.trim())?;
        let record = self
            .registry
            .set_verified_name_row(&key, &update.verified_name)
            .await?;
        Ok(self.view(record))
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            records: self.registry.len(),
        }
    }

    fn view(&self, record: IdentityRecord) -> PresenceView {
        self.evaluator
            .view(&record, self.clock.now(), self.directory.as_ref())
    }
}

/// Writes the current registry rows to `file` off the async runtime. `None`
/// means a newer snapshot was already on disk and this one was dropped.
pub async fn flush_snapshot(
    registry: &IdentityRegistry,
    file: &RegistrySnapshotFile,
    now: UnixTimeMs,
) -> Result<Option<usize>, StorageError> {
    let rows = registry.list();
    let count = rows.len();
    let file = file.clone();
    let written = tokio::task::spawn_blocking(move || file.save(&rows, now))
        .await
        .map_err(|e| StorageError::persistence(format!("snapshot flush task: {e}")))??;
    Ok(written.then_some(count))
}

pub fn router(runtime: Arc<AdapterRuntime>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/data", post(ingest))
        .route("/identities", get(snapshot))
        .route("/gate", get(gate))
        .route("/admin/allowed", post(set_allowed))
        .route("/admin/verified-name", post(set_verified_name))
        .with_state(runtime)
}

fn error_response(err: &StorageError) -> Response {
    let status = match err {
        StorageError::Validation(_) => StatusCode::BAD_REQUEST,
        StorageError::NotFound { .. } => StatusCode::NOT_FOUND,
        StorageError::DuplicateKey { .. } | StorageError::Persistence { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn healthz(State(runtime): State<Arc<AdapterRuntime>>) -> Json<HealthResponse> {
    Json(runtime.health())
}

async fn ingest(
    State(runtime): State<Arc<AdapterRuntime>>,
    Json(request): Json<IngestRequest>,
) -> Response {
    match runtime.ingest(&request).await {
        Ok(_) => (
            StatusCode::CREATED,
            Json(IngestAck {
                status: "success".to_string(),
            }),
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, address = ?request.address, "report rejected");
            error_response(&err)
        }
    }
}

async fn snapshot(State(runtime): State<Arc<AdapterRuntime>>) -> Json<SnapshotResponse> {
    Json(runtime.snapshot())
}

async fn gate(
    State(runtime): State<Arc<AdapterRuntime>>,
    Query(query): Query<GateQuery>,
) -> &'static str {
    runtime.gate(&query).as_token()
}

async fn set_allowed(
    State(runtime): State<Arc<AdapterRuntime>>,
    Json(update): Json<AllowedUpdate>,
) -> Response {
    match runtime.set_allowed(&update).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => {
            warn!(error = %err, key = %update.key, "allow gate update failed");
            error_response(&err)
        }
    }
}

async fn set_verified_name(
    State(runtime): State<Arc<AdapterRuntime>>,
    Json(update): Json<VerifiedNameUpdate>,
) -> Response {
    match runtime.set_verified_name(&update).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => {
            warn!(error = %err, key = %update.key, "verified name update failed");
            error_response(&err)
        }
    }
}
