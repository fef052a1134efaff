//! HTTP API server.
//!
//! Exposes the invoice assistant as a JSON HTTP API for the web frontend.
//! All `/api` routes except registration, login, and the provider callback
//! require a Bearer session token.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `POST`   | `/api/auth/register` | Create a credentials user, return a token |
//! | `POST`   | `/api/auth/login` | Credentials login (demo pair included) |
//! | `POST`   | `/api/auth/callback/{provider}` | Provider sign-in, link account |
//! | `GET`    | `/api/chats` | List the user's chat sessions |
//! | `POST`   | `/api/chats` | Create a chat session |
//! | `GET`    | `/api/chats/{id}` | Session with full message history |
//! | `DELETE` | `/api/chats/{id}` | Delete a session and its messages |
//! | `POST`   | `/api/chats/demo` | Seed and return the demo session |
//! | `POST`   | `/api/chat` | Ask a question; answer streams as SSE |
//! | `GET`    | `/api/invoices` | List invoices (paged) |
//! | `POST`   | `/api/invoices` | Upload an invoice (multipart `file`) |
//! | `GET`    | `/api/invoices/search` | Keyword or semantic search |
//! | `POST`   | `/api/invoices/{id}/export` | Write JSON + CSV exports |
//! | `GET`    | `/api/invoices/{id}/download` | Original bytes or processed JSON |
//! | `GET`    | `/api/dashboard` | Spending summary |
//! | `POST`   | `/api/integrations/gmail/sync` | Import invoice PDFs from Gmail |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Error responses are JSON:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "file field is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `upstream` (502), `internal` (500).
//!
//! # SSE Chat Stream
//!
//! `POST /api/chat` answers with `text/event-stream`. Frames, in order:
//! a `start` event carrying the session id and the stored user message id,
//! one `chunk` event per character of the reply (paced by
//! `[chat].stream_delay_ms`), and a final `done` event with the assistant
//! message id. If the reply cannot be built, a single `error` event is sent
//! instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for the browser client.

use axum::{
    extract::{FromRequestParts, Multipart, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ProviderIdentity};
use crate::chat;
use crate::config::Config;
use crate::dashboard;
use crate::db;
use crate::gmail;
use crate::invoices;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    /// JWT signing secret, from `LEDGERBOX_JWT_SECRET`.
    pub jwt_secret: Arc<Vec<u8>>,
}

/// Build the full application router. Exposed separately from
/// [`run_server`] so tests can drive it in-process.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/auth/register", post(handle_register))
        .route("/api/auth/login", post(handle_login))
        .route("/api/auth/callback/{provider}", post(handle_provider_callback))
        .route("/api/chats", get(handle_list_chats).post(handle_create_chat))
        .route("/api/chats/demo", post(handle_demo_chat))
        .route("/api/chats/{id}", get(handle_get_chat).delete(handle_delete_chat))
        .route("/api/chat", post(handle_chat_stream))
        .route("/api/invoices", get(handle_list_invoices).post(handle_upload_invoice))
        .route("/api/invoices/search", get(handle_search_invoices))
        .route("/api/invoices/{id}/export", post(handle_export_invoice))
        .route("/api/invoices/{id}/download", get(handle_download_invoice))
        .route("/api/dashboard", get(handle_dashboard))
        .route("/api/integrations/gmail/sync", post(handle_gmail_sync))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on `[server].bind` and run until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pool = db::connect(config).await?;
    let jwt_secret = auth::jwt_secret_from_env()?;

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        jwt_secret: Arc::new(jwt_secret.into_bytes()),
    };
    let app = build_router(state);

    tracing::info!(bind = %bind_addr, "server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
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

/// Internal error type that converts into an HTTP response.
pub struct AppError {
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn upstream_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream".to_string(),
        message: message.into(),
    }
}

fn internal_error(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "internal error");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

/// Map handler-level failures to the most appropriate status: validation
/// messages → 400, upstream service messages → 502, the rest → 500.
fn classify_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();
    if msg.contains("No linked") {
        not_found(msg)
    } else if msg.contains("Unknown search mode")
        || msg.contains("disabled")
        || msg.contains("not configured")
    {
        bad_request(msg)
    } else if msg.contains("Parsing service") || msg.contains("Gmail") || msg.contains("OpenAI") {
        upstream_error(msg)
    } else {
        internal_error(err)
    }
}

// ============ Authentication extractor ============

/// The authenticated caller, resolved from the Bearer token.
pub struct CurrentUser {
    pub id: String,
    pub email: String,
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("Missing Authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("Authorization header must be a Bearer token"))?;

        let claims = auth::verify_token(&state.jwt_secret, token)
            .map_err(|e| unauthorized(e.to_string()))?;

        Ok(CurrentUser {
            id: claims.sub,
            email: claims.email,
        })
    }
}

// ============ Auth handlers ============

#[derive(Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    user_id: String,
    email: String,
}

async fn handle_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(bad_request("email and password are required"));
    }

    let user = auth::register_user(&state.pool, req.email.trim(), &req.password, req.name.as_deref())
        .await
        .map_err(|e| {
            if e.to_string().contains("already registered") {
                bad_request(e.to_string())
            } else {
                internal_error(e)
            }
        })?;

    let token = auth::issue_token(&state.jwt_secret, &state.config.auth, &user.id, &user.email)
        .map_err(internal_error)?;

    Ok(Json(TokenResponse {
        token,
        user_id: user.id,
        email: user.email,
    }))
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn handle_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let authenticated = auth::authenticate(&state.pool, &state.config.auth, &req.email, &req.password)
        .await
        .map_err(internal_error)?;

    let Some((user_id, email)) = authenticated else {
        return Err(unauthorized("Invalid email or password"));
    };

    let token = auth::issue_token(&state.jwt_secret, &state.config.auth, &user_id, &email)
        .map_err(internal_error)?;

    Ok(Json(TokenResponse {
        token,
        user_id,
        email,
    }))
}

async fn handle_provider_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(identity): Json<ProviderIdentity>,
) -> Result<Json<TokenResponse>, AppError> {
    if identity.email.trim().is_empty() {
        return Err(bad_request("provider identity must include an email"));
    }

    let user_id = auth::link_account(&state.pool, &provider, &identity)
        .await
        .map_err(internal_error)?;

    let token = auth::issue_token(&state.jwt_secret, &state.config.auth, &user_id, &identity.email)
        .map_err(internal_error)?;

    Ok(Json(TokenResponse {
        token,
        user_id,
        email: identity.email,
    }))
}

// ============ Chat session handlers ============

async fn handle_list_chats(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let sessions = chat::list_sessions(&state.pool, &user.id)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

#[derive(Deserialize)]
struct CreateChatRequest {
    #[serde(default)]
    title: Option<String>,
}

async fn handle_create_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateChatRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = chat::create_session(&state.pool, &user.id, req.title.as_deref().unwrap_or(""))
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "session": session })))
}

async fn handle_get_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = chat::get_session(&state.pool, &user.id, &id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("no chat session with id: {}", id)))?;

    let messages = chat::list_messages(&state.pool, &session.id)
        .await
        .map_err(internal_error)?;

    Ok(Json(serde_json::json!({ "session": session, "messages": messages })))
}

async fn handle_delete_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = chat::delete_session(&state.pool, &user.id, &id)
        .await
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found(format!("no chat session with id: {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn handle_demo_chat(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = chat::ensure_demo_session(&state.pool, &user.id)
        .await
        .map_err(internal_error)?;
    let messages = chat::list_messages(&state.pool, &session.id)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "session": session, "messages": messages })))
}

// ============ POST /api/chat (SSE) ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, AppError> {
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let session = chat::ensure_session(&state.pool, &user.id, req.session_id.as_deref(), &req.message)
        .await
        .map_err(internal_error)?;

    let user_message = chat::append_message(&state.pool, &session.id, "user", &req.message)
        .await
        .map_err(internal_error)?;

    // The reply is decided up front; streaming is presentation only.
    let events = match chat::build_reply(&state.config, &state.pool, &user.id, &req.message).await {
        Ok(reply) => {
            let message = chat::append_message(&state.pool, &session.id, "assistant", &reply)
                .await
                .map_err(internal_error)?;

            let mut events = Vec::with_capacity(reply.chars().count() + 2);
            events.push(
                Event::default().event("start").data(
                    serde_json::json!({
                        "session_id": session.id,
                        "message_id": user_message.id,
                    })
                    .to_string(),
                ),
            );
            for c in reply.chars() {
                events.push(Event::default().event("chunk").data(c.to_string()));
            }
            events.push(
                Event::default()
                    .event("done")
                    .data(serde_json::json!({ "message_id": message.id }).to_string()),
            );
            events
        }
        Err(e) => {
            tracing::warn!(session_id = %session.id, error = %e, "reply building failed");
            vec![Event::default()
                .event("error")
                .data(serde_json::json!({ "message": e.to_string() }).to_string())]
        }
    };

    let delay = Duration::from_millis(state.config.chat.stream_delay_ms);
    let stream = futures::stream::iter(events).then(move |event| async move {
        tokio::time::sleep(delay).await;
        Ok::<Event, Infallible>(event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ Invoice handlers ============

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_page_size")]
    limit: i64,
}

fn default_page_size() -> i64 {
    50
}

async fn handle_list_invoices(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    if query.offset < 0 || query.limit < 1 {
        return Err(bad_request("offset must be >= 0 and limit >= 1"));
    }
    let limit = query.limit.min(200);

    let invoices = invoices::list_invoices(&state.pool, &user.id, query.offset, limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "invoices": invoices })))
}

async fn handle_upload_invoice(
    State(state): State<AppState>,
    user: CurrentUser,
    mut multipart: Multipart,
) -> Result<Json<invoices::UploadOutcome>, AppError> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            let filename = field
                .file_name()
                .unwrap_or("invoice.pdf")
                .to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| bad_request(format!("failed to read file field: {}", e)))?;
            upload = Some((filename, bytes.to_vec()));
            break;
        }
    }

    let Some((filename, bytes)) = upload else {
        return Err(bad_request("file field is required"));
    };
    if bytes.is_empty() {
        return Err(bad_request("uploaded file is empty"));
    }

    let outcome = invoices::process_upload(&state.config, &state.pool, &user.id, &filename, bytes)
        .await
        .map_err(internal_error)?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_search_mode")]
    mode: String,
}

fn default_search_mode() -> String {
    "keyword".to_string()
}

async fn handle_search_invoices(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    if query.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }

    let hits = invoices::search_invoices(&state.config, &state.pool, &user.id, &query.q, &query.mode)
        .await
        .map_err(classify_error)?;
    Ok(Json(serde_json::json!({ "results": hits })))
}

async fn handle_export_invoice(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<invoices::ExportPaths>, AppError> {
    let paths = invoices::export_invoice(&state.config, &state.pool, &user.id, &id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("no invoice with id: {}", id)))?;
    Ok(Json(paths))
}

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(default = "default_download_type", rename = "type")]
    kind: String,
}

fn default_download_type() -> String {
    "processed".to_string()
}

async fn handle_download_invoice(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let invoice = invoices::get_invoice(&state.pool, &user.id, &id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("no invoice with id: {}", id)))?;

    match query.kind.as_str() {
        "processed" => Ok(Json(serde_json::json!({
            "filename": invoice.filename,
            "extracted_data": invoice.extracted_data,
            "classified_data": invoice.classified_data,
        }))
        .into_response()),
        "original" => {
            let path = invoice
                .original_path
                .ok_or_else(|| not_found("original file was not stored"))?;
            let bytes = std::fs::read(&path)
                .map_err(|e| internal_error(anyhow::anyhow!("reading {}: {}", path, e)))?;
            Ok((
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{}\"", invoice.filename),
                    ),
                ],
                bytes,
            )
                .into_response())
        }
        other => Err(bad_request(format!(
            "Unknown download type: {}. Use original or processed.",
            other
        ))),
    }
}

// ============ Dashboard and integrations ============

async fn handle_dashboard(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<dashboard::DashboardSummary>, AppError> {
    let summary = dashboard::summarize(&state.pool, &user.id)
        .await
        .map_err(internal_error)?;
    Ok(Json(summary))
}

async fn handle_gmail_sync(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<gmail::SyncOutcome>, AppError> {
    let outcome = gmail::sync_invoices(&state.config, &state.pool, &user.id)
        .await
        .map_err(classify_error)?;
    Ok(Json(outcome))
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
