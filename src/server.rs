//! HTTP server.
//!
//! Exposes the pipeline as a JSON API. The server is a thin passthrough:
//! it proxies the LLM for research and outlines, invokes the statistical
//! runtime, compiles decks, and serves cached artifacts. No UI is served.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/research` | Stream a research report as server-sent events |
//! | `POST` | `/research/sync` | Research report as one JSON document |
//! | `POST` | `/outline` | Research text → normalized outline |
//! | `POST` | `/deck` | Outline → rendered deck |
//! | `POST` | `/deck/markdown` | Outline → deck markdown (not rendered) |
//! | `POST` | `/execute` | Run one R code body |
//! | `GET`  | `/artifacts/{hash}` | Raw cached artifact |
//! | `GET`  | `/templates` | Template catalog (`?readable=true` filters) |
//! | `GET`  | `/templates/sample` | Random templates (`?count=n`) |
//! | `GET`  | `/cache/stats` | Artifact cache counters |
//!
//! # Streaming
//!
//! `POST /research` answers with `text/event-stream`. Each text delta is a
//! `chunk` event; the stream ends with a `done` event carrying the complete
//! document as JSON, or an `error` event carrying the error and the text
//! received before the failure.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "topic must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `upstream_error` (502), `render_error` (500), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front ends can
//! call the API directly.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::cache::CacheStats;
use crate::compile::classify_kind;
use crate::config::Config;
use crate::error::{CompileError, ExecutionError, QueryError, ResearchError, TransformError};
use crate::models::{CodeKind, Outline, ResearchDocument, Template};
use crate::pipeline::Pipeline;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Starts the HTTP server with the production services from `config`.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(config)?);
    run_server_with_pipeline(pipeline, &config.server.bind).await
}

/// Starts the HTTP server around an existing [`Pipeline`].
///
/// Used by tests and by embedders that supply their own generator,
/// runtime or renderer.
pub async fn run_server_with_pipeline(pipeline: Arc<Pipeline>, bind: &str) -> anyhow::Result<()> {
    let app = router(pipeline.clone());

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(
        bind,
        renderer = pipeline.renderer_name(),
        "Server listening"
    );
    println!("Deck server listening on http://{}", bind);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router without binding a socket.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/research", post(handle_research_stream))
        .route("/research/sync", post(handle_research_sync))
        .route("/outline", post(handle_outline))
        .route("/deck", post(handle_deck))
        .route("/deck/markdown", post(handle_deck_markdown))
        .route("/execute", post(handle_execute))
        .route("/artifacts/{hash}", get(handle_artifact))
        .route("/templates", get(handle_templates))
        .route("/templates/sample", get(handle_template_sample))
        .route("/cache/stats", get(handle_cache_stats))
        .layer(cors)
        .with_state(AppState { pipeline })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "not_found", message)
}

fn upstream_error(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_GATEWAY, "upstream_error", message)
}

fn internal(message: impl Into<String>) -> AppError {
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::MissingApiKey { .. } => internal(err.to_string()),
            _ => upstream_error(err.to_string()),
        }
    }
}

impl From<ResearchError> for AppError {
    fn from(err: ResearchError) -> Self {
        match err {
            ResearchError::EmptyTopic => bad_request(err.to_string()),
            ResearchError::Query { source, .. } => source.into(),
        }
    }
}

impl From<TransformError> for AppError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::EmptySourceDocument | TransformError::IncompleteSourceDocument => {
                bad_request(err.to_string())
            }
            TransformError::EmptyOutline => upstream_error(err.to_string()),
            TransformError::Query(source) => source.into(),
        }
    }
}

impl From<CompileError> for AppError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::EmptyOutline => bad_request(err.to_string()),
            CompileError::Render { .. } => app_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "render_error",
                err.to_string(),
            ),
        }
    }
}

impl From<ExecutionError> for AppError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Timeout { .. } => {
                app_error(StatusCode::REQUEST_TIMEOUT, "timeout", err.to_string())
            }
            ExecutionError::Io { .. } => internal(err.to_string()),
            ExecutionError::RuntimeFailure { .. } | ExecutionError::OutputMissing { .. } => {
                upstream_error(err.to_string())
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /research ============

#[derive(Deserialize)]
struct ResearchRequest {
    topic: String,
}

fn json_event(name: &str, value: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(value)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

/// Handler for `POST /research`.
///
/// Research runs on a background task; its deltas are forwarded through a
/// channel so the response can start before the model finishes. If the
/// client disconnects, sends fail silently and the task runs to completion.
async fn handle_research_stream(
    State(state): State<AppState>,
    Json(req): Json<ResearchRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if req.topic.trim().is_empty() {
        return Err(bad_request("topic must not be empty"));
    }

    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let pipeline = state.pipeline.clone();

    tokio::spawn(async move {
        let chunk_tx = tx.clone();
        let mut forward = move |delta: &str| {
            let _ = chunk_tx.send(Event::default().event("chunk").data(delta));
        };

        let last = match pipeline.conduct_research(&req.topic, Some(&mut forward)).await {
            Ok(document) => json_event("done", &document),
            Err(err) => {
                let partial_text = match &err {
                    ResearchError::Query { partial, .. } => partial.raw_text.clone(),
                    ResearchError::EmptyTopic => String::new(),
                };
                let app: AppError = err.into();
                json_event(
                    "error",
                    &serde_json::json!({
                        "code": app.code,
                        "message": app.message,
                        "partial_text": partial_text,
                    }),
                )
            }
        };
        let _ = tx.send(last);
    });

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ POST /research/sync ============

async fn handle_research_sync(
    State(state): State<AppState>,
    Json(req): Json<ResearchRequest>,
) -> Result<Json<ResearchDocument>, AppError> {
    let document = state.pipeline.conduct_research(&req.topic, None).await?;
    Ok(Json(document))
}

// ============ POST /outline ============

#[derive(Deserialize)]
struct OutlineRequest {
    #[serde(default)]
    topic: String,
    raw_text: String,
}

async fn handle_outline(
    State(state): State<AppState>,
    Json(req): Json<OutlineRequest>,
) -> Result<Json<Outline>, AppError> {
    let document = ResearchDocument::from_text(req.topic, req.raw_text);
    let outline = state.pipeline.generate_outline(&document, None).await?;
    Ok(Json(outline))
}

// ============ POST /deck ============

#[derive(Deserialize)]
struct DeckRequest {
    outline_text: String,
    #[serde(default)]
    template: Option<String>,
}

#[derive(Serialize)]
struct DeckResponse {
    template: String,
    renderer: String,
    html: String,
}

#[derive(Serialize)]
struct DeckMarkdownResponse {
    template: String,
    markdown: String,
}

fn deck_inputs(state: &AppState, req: &DeckRequest) -> Result<(Outline, &'static Template), AppError> {
    let template = state
        .pipeline
        .resolve_template(req.template.as_deref())
        .ok_or_else(|| {
            not_found(format!(
                "no template named: {}",
                req.template.as_deref().unwrap_or_default()
            ))
        })?;
    let outline = Outline::from_text("request", &req.outline_text);
    Ok((outline, template))
}

async fn handle_deck(
    State(state): State<AppState>,
    Json(req): Json<DeckRequest>,
) -> Result<Json<DeckResponse>, AppError> {
    let (outline, template) = deck_inputs(&state, &req)?;
    let html = state.pipeline.compile_deck(&outline, template).await?;
    Ok(Json(DeckResponse {
        template: template.name.to_string(),
        renderer: state.pipeline.renderer_name().to_string(),
        html,
    }))
}

async fn handle_deck_markdown(
    State(state): State<AppState>,
    Json(req): Json<DeckRequest>,
) -> Result<Json<DeckMarkdownResponse>, AppError> {
    let (outline, template) = deck_inputs(&state, &req)?;
    let markdown = state.pipeline.assemble_deck(&outline, template).await?;
    Ok(Json(DeckMarkdownResponse {
        template: template.name.to_string(),
        markdown,
    }))
}

// ============ POST /execute ============

#[derive(Deserialize)]
struct ExecuteRequest {
    code: String,
    /// `plot`, `table`, `generic`, or `document`. Inferred from the code
    /// when absent.
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Serialize)]
struct ExecuteResponse {
    content_hash: Option<String>,
    kind: String,
    mime_type: String,
    size_bytes: u64,
    payload: String,
}

/// Handler for `POST /execute`.
///
/// `document` knits the code as R Markdown and is never cached; the other
/// kinds go through the artifact cache.
async fn handle_execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, AppError> {
    if req.code.trim().is_empty() {
        return Err(bad_request("code must not be empty"));
    }

    let kind_name = req.kind.as_deref().map(|k| k.trim().to_ascii_lowercase());
    if kind_name.as_deref() == Some("document") {
        let text = state.pipeline.execute_document(&req.code).await?;
        return Ok(Json(ExecuteResponse {
            content_hash: None,
            kind: "document".to_string(),
            mime_type: "text/markdown".to_string(),
            size_bytes: text.len() as u64,
            payload: text,
        }));
    }

    let kind = match kind_name {
        Some(name) => name.parse::<CodeKind>().map_err(bad_request)?,
        None => classify_kind("{r}", &req.code),
    };

    let artifact = state.pipeline.execute(&req.code, kind).await?;
    Ok(Json(ExecuteResponse {
        content_hash: Some(artifact.content_hash.clone()),
        kind: kind.to_string(),
        mime_type: artifact.mime_type.as_str().to_string(),
        size_bytes: artifact.size_bytes,
        payload: artifact.payload_text(),
    }))
}

// ============ GET /artifacts/{hash} ============

async fn handle_artifact(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Response, AppError> {
    let artifact = state
        .pipeline
        .cache()
        .get(&hash)
        .ok_or_else(|| not_found(format!("no artifact with hash: {}", hash)))?;
    Ok((
        [(header::CONTENT_TYPE, artifact.mime_type.as_str())],
        artifact.payload,
    )
        .into_response())
}

// ============ GET /templates ============

#[derive(Deserialize)]
struct TemplatesQuery {
    #[serde(default)]
    readable: bool,
}

#[derive(Serialize)]
struct TemplatesResponse {
    templates: Vec<&'static Template>,
}

async fn handle_templates(
    State(state): State<AppState>,
    Query(q): Query<TemplatesQuery>,
) -> Json<TemplatesResponse> {
    Json(TemplatesResponse {
        templates: state.pipeline.list_templates(q.readable),
    })
}

#[derive(Deserialize)]
struct SampleQuery {
    #[serde(default = "default_sample_count")]
    count: usize,
}

fn default_sample_count() -> usize {
    3
}

async fn handle_template_sample(
    State(state): State<AppState>,
    Query(q): Query<SampleQuery>,
) -> Json<TemplatesResponse> {
    Json(TemplatesResponse {
        templates: state.pipeline.sample_templates(q.count),
    })
}

// ============ GET /cache/stats ============

async fn handle_cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.pipeline.cache().stats())
}
