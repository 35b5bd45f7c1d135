//! The HTTP surface from `spec.md` §6, grounded on the reference
//! workspace's `AppState`/`build_app`/`ApiError` shape: one `Arc`-held
//! state struct, one router builder, one error envelope.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Multipart, Path as AxPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use kb_auth::TokenService;
use kb_blob::BlobStore;
use kb_core::document::{ProcessingMode, Visibility};
use kb_core::role::RoleCode;
use kb_core::user::AuthContext;
use kb_core::VersionStatus;
use kb_error::{ErrorCode, KbError};
use kb_index::IndexStore;
use kb_metadata::{DocumentFilter, MetadataStore};
use kb_permissions::{can_change_visibility, can_share_with_user, is_visible, require_visible};
use kb_pipeline::{IngestService, UploadRequest};
use kb_search::{SearchFilters, SearchOrchestrator, SearchRequest};
use kb_tasks::TaskManager;
use kb_versions::VersionManager;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::tool_protocol::{self, HybridSearchParams, RawQueryParams};

#[derive(Clone)]
pub struct AppState {
    pub token_service: Arc<TokenService>,
    pub metadata: Arc<dyn MetadataStore>,
    pub blob: Arc<dyn BlobStore>,
    pub index: Arc<dyn IndexStore>,
    pub ingest: Arc<IngestService>,
    pub tasks: Arc<TaskManager>,
    pub search: Arc<SearchOrchestrator>,
    pub versions: Arc<VersionManager>,
}

/// `{error: {code, message}}` per spec §7. Wraps [`kb_error::KbError`]
/// directly rather than re-deriving the code/status mapping, since
/// `ErrorCode::http_status`/`as_str` already are that mapping.
#[derive(Debug)]
pub struct ApiError(pub KbError);

impl From<KbError> for ApiError {
    fn from(err: KbError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let dto = self.0.to_dto();
        (status, Json(json!({ "error": dto }))).into_response()
    }
}

pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/upload", post(upload))
        .route("/upload_batch", post(upload_batch))
        .route("/documents", get(list_documents))
        .route("/documents/{id}/progress", get(document_progress))
        .route("/documents/{id}", delete(delete_document))
        .route("/documents/{group_id}/versions", get(list_versions))
        .route("/documents/{group_id}/versions/{n}/restore", post(restore_version))
        .route("/documents/{id}/permissions", put(update_permissions))
        .route("/search", post(search))
        .route("/tools/hybrid_search", post(tool_hybrid_search))
        .route("/tools/execute_raw_query", post(tool_execute_raw_query))
        .with_state(state)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError(KbError::new(ErrorCode::Unauthorized, "missing bearer token")))?;
    state
        .token_service
        .verify_bearer(token)
        .await
        .map_err(|e| ApiError(e.into()))
}

// ---------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[instrument(level = "debug", skip(state, req))]
async fn login(State(state): State<Arc<AppState>>, Json(req): Json<LoginRequest>) -> Result<impl IntoResponse, ApiError> {
    let issued = state.token_service.login(&req.username, &req.password).await.map_err(|e| ApiError(e.into()))?;
    Ok(Json(issued))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[instrument(level = "debug", skip(state, req))]
async fn refresh(State(state): State<Arc<AppState>>, Json(req): Json<RefreshRequest>) -> Result<impl IntoResponse, ApiError> {
    let issued = state.token_service.refresh(&req.refresh_token).await.map_err(|e| ApiError(e.into()))?;
    Ok(Json(issued))
}

// ---------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct UploadResponse {
    version_id: Uuid,
    task_id: Uuid,
}

struct ParsedUpload {
    filename: String,
    bytes: Vec<u8>,
    processing_mode: ProcessingMode,
    visibility: Visibility,
    ocr_engine: String,
    organization_id: Option<Uuid>,
}

/// One multipart form for one file: `file` plus the form fields listed
/// in spec §6 (`category`/`tags`/`author`/`description` are accepted and
/// ignored — they are UI-front-door concerns outside this core's scope).
async fn parse_upload_multipart(mut multipart: Multipart) -> Result<ParsedUpload, ApiError> {
    let mut filename = None;
    let mut bytes = None;
    let mut processing_mode = ProcessingMode::Fast;
    let mut visibility = Visibility::Private;
    let mut ocr_engine = "tesseract".to_string();
    let mut organization_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(KbError::invalid_request(format!("malformed multipart body: {e}"))))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                filename = Some(field.file_name().unwrap_or("upload.bin").to_string());
                let data = field.bytes().await.map_err(|e| ApiError(KbError::invalid_request(e.to_string())))?;
                bytes = Some(data.to_vec());
            }
            "processing_mode" => {
                let text = field.text().await.unwrap_or_default();
                processing_mode = match text.as_str() {
                    "deep" => ProcessingMode::Deep,
                    _ => ProcessingMode::Fast,
                };
            }
            "visibility" => {
                let text = field.text().await.unwrap_or_default();
                visibility = match text.as_str() {
                    "organization" => Visibility::Organization,
                    "public" => Visibility::Public,
                    _ => Visibility::Private,
                };
            }
            "ocr_engine" => {
                ocr_engine = field.text().await.unwrap_or_default();
            }
            "organization_id" => {
                let text = field.text().await.unwrap_or_default();
                organization_id = Uuid::parse_str(&text).ok();
            }
            _ => {
                let _ = field.bytes().await;
            }
        }
    }

    let filename = filename.ok_or_else(|| ApiError(KbError::invalid_request("missing `file` field")))?;
    let bytes = bytes.ok_or_else(|| ApiError(KbError::invalid_request("missing `file` field")))?;
    Ok(ParsedUpload { filename, bytes, processing_mode, visibility, ocr_engine, organization_id })
}

#[instrument(level = "info", skip(state, headers, multipart))]
async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let parsed = parse_upload_multipart(multipart).await?;

    let outcome = state
        .ingest
        .upload(UploadRequest {
            filename: parsed.filename,
            bytes: parsed.bytes,
            owner_id: ctx.user_id,
            org_id: parsed.organization_id.or(ctx.org_id),
            visibility: parsed.visibility,
            processing_mode: parsed.processing_mode,
            ocr_engine: parsed.ocr_engine,
            parent_task_id: None,
        })
        .await?;

    info!(version_id = %outcome.version.id, "accepted upload");
    Ok((StatusCode::ACCEPTED, Json(UploadResponse { version_id: outcome.version.id, task_id: outcome.task.id })))
}

#[derive(Debug, Serialize)]
struct BatchUploadResult {
    filename: String,
    version_id: Option<Uuid>,
    task_id: Option<Uuid>,
    error: Option<String>,
}

#[instrument(level = "info", skip(state, headers, multipart))]
async fn upload_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<BatchUploadResult>>), ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let mut results = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(KbError::invalid_request(format!("malformed multipart body: {e}"))))?
    {
        if field.name() != Some("files[]") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.bin").to_string();
        let data = match field.bytes().await {
            Ok(d) => d.to_vec(),
            Err(e) => {
                results.push(BatchUploadResult { filename, version_id: None, task_id: None, error: Some(e.to_string()) });
                continue;
            }
        };

        let outcome = state
            .ingest
            .upload(UploadRequest {
                filename: filename.clone(),
                bytes: data,
                owner_id: ctx.user_id,
                org_id: ctx.org_id,
                visibility: Visibility::Private,
                processing_mode: ProcessingMode::Fast,
                ocr_engine: "tesseract".to_string(),
                parent_task_id: None,
            })
            .await;

        match outcome {
            Ok(outcome) => results.push(BatchUploadResult {
                filename,
                version_id: Some(outcome.version.id),
                task_id: Some(outcome.task.id),
                error: None,
            }),
            Err(e) => results.push(BatchUploadResult { filename, version_id: None, task_id: None, error: Some(e.message) }),
        }
    }

    Ok((StatusCode::ACCEPTED, Json(results)))
}

// ---------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListDocumentsQuery {
    organization_id: Option<Uuid>,
    status: Option<VersionStatus>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[instrument(level = "debug", skip(state, headers))]
async fn list_documents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ListDocumentsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let filter = DocumentFilter {
        org_id: q.organization_id,
        status: q.status,
        page: q.page.unwrap_or(0),
        page_size: q.page_size.unwrap_or(20),
    };
    let (documents, total) = state.metadata.list_documents(filter).await?;
    let visible: Vec<_> = documents.into_iter().filter(|v| is_visible(&ctx, v)).collect();
    Ok(Json(json!({ "documents": visible, "total": total })))
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    status: VersionStatus,
    progress_percentage: f32,
    processed_pages: u32,
    total_pages: u32,
    message: Option<String>,
    error: Option<String>,
}

#[instrument(level = "debug", skip(state, headers))]
async fn document_progress(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(id): AxPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let version = state.metadata.get_version(id).await?;
    require_visible(&ctx, &version)?;
    Ok(Json(ProgressResponse {
        status: version.status,
        progress_percentage: version.progress_percent,
        processed_pages: version.processed_pages,
        total_pages: version.total_pages,
        message: version.progress_message,
        error: version.error_message,
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteDocumentQuery {
    #[serde(default)]
    hard: bool,
}

/// Hard-deletes require the caller to be a superuser and to explicitly
/// request it; every other caller's delete is soft (spec §6: "hard-deletes
/// version; soft unless superuser explicit").
#[instrument(level = "info", skip(state, headers))]
async fn delete_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(id): AxPath<Uuid>,
    Query(q): Query<DeleteDocumentQuery>,
) -> Result<StatusCode, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let version = state.metadata.get_version(id).await?;
    let owns = ctx.is_superuser || (ctx.user_id.is_some() && version.owner_id == ctx.user_id);
    if !owns {
        return Err(ApiError(KbError::forbidden("not permitted to delete this document")));
    }
    let hard = q.hard && ctx.is_superuser;
    state.versions.delete_version(version.group_id, id, hard).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(level = "debug", skip(state, headers))]
async fn list_versions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(group_id): AxPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let versions = state.metadata.list_versions_by_group(group_id).await?;
    let visible: Vec<_> = versions.into_iter().filter(|v| is_visible(&ctx, v)).collect();
    Ok(Json(visible))
}

#[instrument(level = "info", skip(state, headers))]
async fn restore_version(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((group_id, version_number)): AxPath<(Uuid, u32)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let versions = state.metadata.list_versions_by_group(group_id).await?;
    let target = versions
        .into_iter()
        .find(|v| v.version_number == version_number)
        .ok_or_else(|| KbError::not_found("version not found"))?;
    require_visible(&ctx, &target)?;
    let owns = ctx.is_superuser || (ctx.user_id.is_some() && target.owner_id == ctx.user_id);
    if !owns {
        return Err(ApiError(KbError::forbidden("not permitted to restore this document")));
    }
    state.versions.restore(group_id, target.id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct UpdatePermissionsRequest {
    visibility: Visibility,
    #[serde(default)]
    shared_with_users: Vec<Uuid>,
    #[serde(default)]
    shared_with_roles: Vec<String>,
}

#[instrument(level = "info", skip(state, headers, req))]
async fn update_permissions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(id): AxPath<Uuid>,
    Json(req): Json<UpdatePermissionsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let mut version = state.metadata.get_version(id).await?;

    if version.visibility != req.visibility && !can_change_visibility(&ctx, &version, req.visibility) {
        return Err(ApiError(KbError::forbidden("visibility change not permitted")));
    }

    let mut shared_users = BTreeSet::new();
    for user_id in req.shared_with_users {
        let target = state.metadata.get_user(user_id).await?;
        if !can_share_with_user(&ctx, version.org_id, target.org_id) {
            return Err(ApiError(KbError::forbidden(format!("cannot share with user {user_id} outside the owning organization"))));
        }
        shared_users.insert(user_id);
    }

    version.visibility = req.visibility;
    version.shared_user_ids = shared_users;
    version.shared_role_codes = req.shared_with_roles.into_iter().map(|r| RoleCode::from(r.as_str())).collect();
    version.updated_at = Utc::now();
    state.metadata.update_version(version.clone()).await?;
    Ok(Json(version))
}

// ---------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchRequestBody {
    query: String,
    #[serde(default = "default_k")]
    k: usize,
    #[serde(default)]
    filters: SearchFiltersBody,
    #[serde(default = "default_true")]
    use_hybrid: bool,
    min_score: Option<f32>,
}

fn default_k() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
struct SearchFiltersBody {
    file_type: Option<String>,
    filename_wildcard: Option<String>,
}

#[instrument(level = "debug", skip(state, headers, req))]
async fn search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SearchRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let hits = state
        .search
        .search(
            &ctx,
            SearchRequest {
                query_text: req.query,
                k: req.k,
                filters: SearchFilters { file_type: req.filters.file_type, filename_wildcard: req.filters.filename_wildcard },
                min_score: req.min_score,
                use_hybrid: req.use_hybrid,
            },
        )
        .await?;

    let total = hits.len();
    let results: Vec<_> = hits
        .into_iter()
        .map(|h| {
            json!({
                "id": h.chunk_id,
                "text": h.text,
                "highlighted": h.highlighted,
                "score": h.score,
                "matched_bboxes": h.bbox_matches.into_iter().map(|m| json!({
                    "text": m.text,
                    "confidence": m.confidence,
                    "bbox": [m.bbox.x1, m.bbox.y1, m.bbox.x2, m.bbox.y2],
                })).collect::<Vec<_>>(),
                "page_number": h.page_number,
                "version_id": h.version_id,
                "updated_at": h.updated_at,
                "metadata": json!({
                    "document_id": h.metadata.document_id,
                    "filename": h.metadata.filename,
                    "filepath": h.metadata.filepath,
                    "file_type": h.metadata.file_type,
                    "page_number": h.page_number,
                    "original_file_url": h.metadata.original_file_url,
                    "page_image_url": h.metadata.page_image_url,
                    "checksum": h.metadata.checksum,
                }),
            })
        })
        .collect();
    Ok(Json(json!({ "results": results, "total": total })))
}

// ---------------------------------------------------------------------
// Tool-protocol surface (spec §6): accepts either access or tool tokens,
// thin wrappers around `kb_daemon::tool_protocol`.
// ---------------------------------------------------------------------

#[instrument(level = "debug", skip(state, headers, req))]
async fn tool_hybrid_search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<HybridSearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let result = tool_protocol::hybrid_search(&state.search, &ctx, req).await?;
    Ok(Json(result))
}

#[instrument(level = "debug", skip(state, headers, req))]
async fn tool_execute_raw_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RawQueryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let hits = tool_protocol::execute_raw_query(&state.index, &ctx, req).await?;
    Ok(Json(hits))
}
