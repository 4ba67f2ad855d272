//! HTTP API for case intake, policy indexing, retrieval, and drafting.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/cases` | Create a case |
//! | `GET`  | `/api/cases` | List cases, newest first |
//! | `GET`  | `/api/cases/{id}` | Fetch one case with its artifacts |
//! | `POST` | `/api/cases/{id}/documents` | Upload a document (base64); runs text extraction |
//! | `GET`  | `/api/cases/{id}/documents` | List a case's documents |
//! | `GET`  | `/api/cases/{id}/export` | Export the case bundle (case + documents + audit trail) |
//! | `POST` | `/api/cases/{id}/review` | Mark a drafted case reviewed |
//! | `POST` | `/api/cases/{id}/extract` | Stage 1: extract structured facts |
//! | `POST` | `/api/cases/{id}/match` | Stage 2: retrieve matching policy excerpts |
//! | `POST` | `/api/cases/{id}/analyze` | Stage 3: missing-documentation checklist |
//! | `POST` | `/api/cases/{id}/draft` | Stage 4: generate the appeal letter |
//! | `POST` | `/api/cases/{id}/regenerate` | Re-run Stage 4 (no new retrieval) |
//! | `POST` | `/api/policies` | Register a policy and index its content |
//! | `GET`  | `/api/policies` | List registered policies |
//! | `POST` | `/api/search` | Semantic search over indexed policy excerpts |
//! | `GET`  | `/api/audit` | List audit entries, optionally per case |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "precondition_failed", "message": "A denial letter document is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `precondition_failed` (400),
//! `embeddings_disabled` (400), `not_found` (404), `provider_error` (502),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::extract::{self, SourceKind};
use crate::indexer;
use crate::llm::GenerationProvider;
use crate::models::{AuditEntry, Case, Document, DocumentKind, Policy, PolicyHit};
use crate::pipeline::{self, PipelineError};
use crate::{db, migrate, search, store};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: sqlx::SqlitePool,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
}

/// Starts the HTTP server.
///
/// Opens the database (creating the schema if needed), constructs the
/// embedding and generation providers from configuration, binds to
/// `[server].bind`, and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let state = AppState {
        embedder: crate::embedding::create_provider(&config.embedding)?,
        generator: crate::llm::create_generator(&config.generation)?,
        config: Arc::new(config.clone()),
        pool,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/api/cases", post(handle_create_case).get(handle_list_cases))
        .route("/api/cases/{id}", get(handle_get_case))
        .route(
            "/api/cases/{id}/documents",
            post(handle_upload_document).get(handle_list_documents),
        )
        .route("/api/cases/{id}/export", get(handle_export_case))
        .route("/api/cases/{id}/review", post(handle_review_case))
        .route("/api/cases/{id}/extract", post(handle_extract_facts))
        .route("/api/cases/{id}/match", post(handle_match_policies))
        .route("/api/cases/{id}/analyze", post(handle_analyze_denial))
        .route("/api/cases/{id}/draft", post(handle_generate_draft))
        .route("/api/cases/{id}/regenerate", post(handle_regenerate_draft))
        .route(
            "/api/policies",
            post(handle_create_policy).get(handle_list_policies),
        )
        .route("/api/search", post(handle_search))
        .route("/api/audit", get(handle_list_audit))
        .layer(cors)
        .with_state(state);

    println!("Appealdesk API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Constructs a 400 error for a stage whose precondition is not met.
fn precondition_failed(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "precondition_failed".to_string(),
        message: message.into(),
    }
}

/// Constructs a 400 error for operations that need embeddings while the
/// provider is disabled.
fn embeddings_disabled() -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "embeddings_disabled".to_string(),
        message: "Embedding provider is disabled. Set [embedding] provider in the config."
            .to_string(),
    }
}

/// Constructs a 404 Not Found error.
fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Constructs a 502 for generation/embedding provider failures.
fn provider_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "provider_error".to_string(),
        message: message.into(),
    }
}

/// Constructs a 500 Internal Server Error.
fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

fn storage(err: anyhow::Error) -> AppError {
    internal(format!("{:#}", err))
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::CaseNotFound(_) => not_found(message),
            PipelineError::Precondition(_) => precondition_failed(message),
            PipelineError::Provider(_) => provider_error(message),
            PipelineError::Storage(_) => internal(message),
        }
    }
}

async fn load_case(state: &AppState, id: &str) -> Result<Case, AppError> {
    store::get_case(&state.pool, id)
        .await
        .map_err(storage)?
        .ok_or_else(|| not_found(format!("Case not found: {}", id)))
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

/// Handler for `GET /health`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/cases ============

/// Request body for `POST /api/cases`.
#[derive(Deserialize)]
struct CreateCaseRequest {
    patient_name: String,
    payer: String,
    state: String,
    #[serde(default)]
    cpt_codes: Vec<String>,
    #[serde(default)]
    icd10_codes: Vec<String>,
}

/// Handler for `POST /api/cases`: create a case in status `new`.
async fn handle_create_case(
    State(state): State<AppState>,
    Json(req): Json<CreateCaseRequest>,
) -> Result<Json<Case>, AppError> {
    let case = store::create_case(
        &state.pool,
        &req.patient_name,
        &req.payer,
        &req.state,
        &req.cpt_codes,
        &req.icd10_codes,
    )
    .await
    .map_err(storage)?;

    store::record_audit(
        &state.pool,
        "create_case",
        Some(&case.id),
        json!({ "payer": case.payer, "state": case.state }),
    )
    .await;

    Ok(Json(case))
}

// ============ GET /api/cases ============

/// JSON response body for `GET /api/cases`.
#[derive(Serialize)]
struct CaseListResponse {
    cases: Vec<Case>,
}

/// Handler for `GET /api/cases`: all cases, newest first.
async fn handle_list_cases(
    State(state): State<AppState>,
) -> Result<Json<CaseListResponse>, AppError> {
    let cases = store::list_cases(&state.pool).await.map_err(storage)?;
    Ok(Json(CaseListResponse { cases }))
}

// ============ GET /api/cases/{id} ============

/// Handler for `GET /api/cases/{id}`.
async fn handle_get_case(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Case>, AppError> {
    let case = load_case(&state, &id).await?;
    Ok(Json(case))
}

// ============ POST /api/cases/{id}/documents ============

/// Request body for `POST /api/cases/{id}/documents`.
///
/// Bytes travel base64-encoded. `kind` is one of `denial_letter`,
/// `clinical_notes`, `imaging_report`, `policy_file`, `other`. For a
/// `policy_file` upload, the optional policy fields default to the filename
/// and the case's payer and state.
#[derive(Deserialize)]
struct UploadDocumentRequest {
    kind: String,
    filename: String,
    #[serde(default)]
    content_type: String,
    data_base64: String,
    policy_name: Option<String>,
    effective_date: Option<String>,
}

/// Handler for `POST /api/cases/{id}/documents`.
///
/// Decodes the payload, runs text extraction exactly once (off the async
/// scheduler), and stores the document with its extracted text. A
/// `policy_file` upload additionally registers the policy and reindexes its
/// excerpts from the extracted text.
async fn handle_upload_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UploadDocumentRequest>,
) -> Result<Json<Value>, AppError> {
    let case = load_case(&state, &id).await?;

    let kind = DocumentKind::parse(&req.kind)
        .ok_or_else(|| bad_request(format!("Unknown document kind: {}", req.kind)))?;

    if kind == DocumentKind::PolicyFile && !state.config.embedding.is_enabled() {
        return Err(embeddings_disabled());
    }

    let bytes = STANDARD
        .decode(&req.data_base64)
        .map_err(|e| bad_request(format!("Invalid base64 payload: {}", e)))?;
    let size_bytes = bytes.len() as i64;

    let source = SourceKind::detect(&req.content_type, &req.filename);
    let text =
        extract::extract_text_blocking(bytes, source, state.config.ocr.clone()).await;

    let document = store::insert_document(
        &state.pool,
        &case.id,
        kind,
        &req.filename,
        &req.content_type,
        size_bytes,
        &text,
    )
    .await
    .map_err(storage)?;

    store::record_audit(
        &state.pool,
        "upload_document",
        Some(&case.id),
        json!({ "kind": kind.as_str(), "filename": req.filename, "size_bytes": size_bytes }),
    )
    .await;

    let mut response = json!({ "document": document });

    if kind == DocumentKind::PolicyFile && !text.trim().is_empty() {
        let name = req
            .policy_name
            .clone()
            .unwrap_or_else(|| req.filename.clone());
        let effective_date = req.effective_date.clone().unwrap_or_default();

        let policy = store::upsert_policy(&state.pool, &name, &case.payer, &case.state, &effective_date)
            .await
            .map_err(storage)?;
        let chunks = indexer::reindex_policy(
            &state.pool,
            state.embedder.as_ref(),
            state.config.embedding.batch_size,
            &policy,
            &text,
        )
        .await
        .map_err(|e| provider_error(format!("{:#}", e)))?;

        store::record_audit(
            &state.pool,
            "index_policy",
            None,
            json!({ "policy_id": policy.id, "chunks": chunks }),
        )
        .await;

        response["policy_id"] = json!(policy.id);
        response["indexed_chunks"] = json!(chunks);
    }

    Ok(Json(response))
}

// ============ GET /api/cases/{id}/documents ============

/// JSON response body for `GET /api/cases/{id}/documents`.
#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<Document>,
}

/// Handler for `GET /api/cases/{id}/documents`.
async fn handle_list_documents(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let case = load_case(&state, &id).await?;
    let documents = store::get_documents(&state.pool, &case.id)
        .await
        .map_err(storage)?;
    Ok(Json(DocumentListResponse { documents }))
}

// ============ GET /api/cases/{id}/export ============

/// Handler for `GET /api/cases/{id}/export`.
///
/// Returns the full case bundle as one JSON document: the case with its
/// artifacts, every uploaded document with extracted text, and the audit
/// trail. Rendering (PDF, print) is a client concern.
async fn handle_export_case(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let case = load_case(&state, &id).await?;
    let documents = store::get_documents(&state.pool, &case.id)
        .await
        .map_err(storage)?;
    let audit_trail = store::list_audit(&state.pool, Some(&case.id))
        .await
        .map_err(storage)?;

    store::record_audit(
        &state.pool,
        "export_case",
        Some(&case.id),
        json!({ "documents": documents.len() }),
    )
    .await;

    Ok(Json(json!({
        "case": case,
        "documents": documents,
        "audit_trail": audit_trail,
    })))
}

// ============ POST /api/cases/{id}/review ============

/// Handler for `POST /api/cases/{id}/review`: mark a drafted case reviewed.
async fn handle_review_case(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    pipeline::review_case(&state.pool, &id).await?;
    Ok(Json(json!({ "message": "Case marked as reviewed" })))
}

// ============ Stage endpoints ============

/// Handler for `POST /api/cases/{id}/extract` (Stage 1).
async fn handle_extract_facts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let facts = pipeline::extract_facts(&state.pool, state.generator.as_ref(), &id).await?;
    Ok(Json(json!({ "extracted_facts": facts })))
}

/// Handler for `POST /api/cases/{id}/match` (Stage 2).
async fn handle_match_policies(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if !state.config.embedding.is_enabled() {
        return Err(embeddings_disabled());
    }
    let matches = pipeline::match_policies(
        &state.pool,
        state.embedder.as_ref(),
        &id,
        state.config.retrieval.default_k,
    )
    .await?;
    Ok(Json(json!({ "policy_matches": matches })))
}

/// Handler for `POST /api/cases/{id}/analyze` (Stage 3).
async fn handle_analyze_denial(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let analysis = pipeline::analyze_denial(&state.pool, state.generator.as_ref(), &id).await?;
    Ok(Json(json!({ "denial_analysis": analysis })))
}

/// Handler for `POST /api/cases/{id}/draft` (Stage 4).
async fn handle_generate_draft(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let draft = pipeline::generate_draft(&state.pool, state.generator.as_ref(), &id).await?;
    Ok(Json(json!({ "generated_draft": draft })))
}

/// Handler for `POST /api/cases/{id}/regenerate` (Stage 4 re-run).
async fn handle_regenerate_draft(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let draft = pipeline::regenerate_draft(&state.pool, state.generator.as_ref(), &id).await?;
    Ok(Json(json!({ "generated_draft": draft })))
}

// ============ POST /api/policies ============

/// Request body for `POST /api/policies`.
///
/// Content arrives either as inline `content` text or as base64 file bytes;
/// file bytes go through the same extraction path as document uploads.
#[derive(Deserialize)]
struct CreatePolicyRequest {
    name: String,
    payer: String,
    state: String,
    #[serde(default)]
    effective_date: String,
    content: Option<String>,
    data_base64: Option<String>,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    content_type: String,
}

/// Handler for `POST /api/policies`: register a policy and index its content.
///
/// A policy registered without content keeps any previously indexed excerpts.
async fn handle_create_policy(
    State(state): State<AppState>,
    Json(req): Json<CreatePolicyRequest>,
) -> Result<Json<Value>, AppError> {
    if req.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }

    let text = match (&req.content, &req.data_base64) {
        (Some(content), _) => content.clone(),
        (None, Some(data)) => {
            let bytes = STANDARD
                .decode(data)
                .map_err(|e| bad_request(format!("Invalid base64 payload: {}", e)))?;
            let source = SourceKind::detect(&req.content_type, &req.filename);
            extract::extract_text_blocking(bytes, source, state.config.ocr.clone()).await
        }
        (None, None) => String::new(),
    };

    if !text.trim().is_empty() && !state.config.embedding.is_enabled() {
        return Err(embeddings_disabled());
    }

    let policy = store::upsert_policy(
        &state.pool,
        &req.name,
        &req.payer,
        &req.state,
        &req.effective_date,
    )
    .await
    .map_err(storage)?;

    let mut indexed_chunks = 0usize;
    if !text.trim().is_empty() {
        indexed_chunks = indexer::reindex_policy(
            &state.pool,
            state.embedder.as_ref(),
            state.config.embedding.batch_size,
            &policy,
            &text,
        )
        .await
        .map_err(|e| provider_error(format!("{:#}", e)))?;

        store::record_audit(
            &state.pool,
            "index_policy",
            None,
            json!({ "policy_id": policy.id, "chunks": indexed_chunks }),
        )
        .await;
    }

    Ok(Json(json!({ "policy": policy, "indexed_chunks": indexed_chunks })))
}

// ============ GET /api/policies ============

/// JSON response body for `GET /api/policies`.
#[derive(Serialize)]
struct PolicyListResponse {
    policies: Vec<Policy>,
}

/// Handler for `GET /api/policies`.
async fn handle_list_policies(
    State(state): State<AppState>,
) -> Result<Json<PolicyListResponse>, AppError> {
    let policies = store::list_policies(&state.pool).await.map_err(storage)?;
    Ok(Json(PolicyListResponse { policies }))
}

// ============ POST /api/search ============

/// Request body for `POST /api/search`.
#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    payer: Option<String>,
    state: Option<String>,
    k: Option<usize>,
}

/// JSON response body for `POST /api/search`.
#[derive(Serialize)]
struct SearchResponse {
    results: Vec<PolicyHit>,
}

/// Handler for `POST /api/search`: direct retrieval access.
async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if !state.config.embedding.is_enabled() {
        return Err(embeddings_disabled());
    }

    let k = req.k.unwrap_or(state.config.retrieval.default_k);
    let results = search::search_policies(
        &state.pool,
        state.embedder.as_ref(),
        &req.query,
        req.payer.as_deref(),
        req.state.as_deref(),
        k,
    )
    .await
    .map_err(|e| provider_error(format!("{:#}", e)))?;

    Ok(Json(SearchResponse { results }))
}

// ============ GET /api/audit ============

/// Query parameters for `GET /api/audit`.
#[derive(Deserialize)]
struct AuditQuery {
    case_id: Option<String>,
}

/// JSON response body for `GET /api/audit`.
#[derive(Serialize)]
struct AuditListResponse {
    entries: Vec<AuditEntry>,
}

/// Handler for `GET /api/audit`: audit entries, newest first.
async fn handle_list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditListResponse>, AppError> {
    let entries = store::list_audit(&state.pool, query.case_id.as_deref())
        .await
        .map_err(storage)?;
    Ok(Json(AuditListResponse { entries }))
}
