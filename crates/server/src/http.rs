//! HTTP endpoints
//!
//! Thin translation from the REST surface onto the stores, the retrieval
//! engine, and the orchestrator. Handlers own no business logic beyond
//! validation and DTO mapping.

use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use parley_core::{ApiProfile, Error, Message, Persona, Session, SessionPatch};
use parley_persistence::{ApiProfilePatch, NewApiProfile, NewPersona, PersonaPatch};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;
use crate::ws;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors_layer = build_cors_layer(
        &state.settings.server.cors_origins,
        state.settings.server.cors_enabled,
    );

    Router::new()
        // Sessions
        .route("/sessions", post(create_session).get(list_sessions))
        .route(
            "/sessions/:id",
            axum::routing::patch(update_session).delete(delete_session),
        )
        .route("/sessions/bulk-delete", post(bulk_delete_sessions))
        .route(
            "/sessions/:id/messages",
            post(post_message).get(list_messages),
        )
        // Personas
        .route("/personas", post(create_persona).get(list_personas))
        .route(
            "/personas/:id",
            get(get_persona)
                .patch(update_persona)
                .delete(delete_persona),
        )
        .route("/personas/:id/ingest-text", post(ingest_text))
        .route("/personas/:id/ingest-url", post(ingest_url))
        .route("/personas/:id/refresh-rag", post(refresh_rag))
        .route("/personas/:id/knowledge", get(knowledge_info))
        // API profiles
        .route("/api-profiles", post(create_profile).get(list_profiles))
        .route(
            "/api-profiles/:id",
            get(get_profile).patch(update_profile).delete(delete_profile),
        )
        // Ops
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        // Streaming
        .route("/ws/sessions/:id", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Build the CORS layer from configured origins; permissive only when CORS
/// is explicitly disabled (development).
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS is disabled - allowing all origins (NOT FOR PRODUCTION)");
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("Invalid CORS origin: {}", origin);
                None
            })
        })
        .collect();

    if parsed.is_empty() {
        tracing::info!("No CORS origins configured, defaulting to localhost:3000");
        return CorsLayer::new()
            .allow_origin("http://localhost:3000".parse::<HeaderValue>().expect("static origin"))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_credentials(true)
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SessionDto {
    session_id: String,
    title: Option<String>,
    user_display_name: Option<String>,
    user_handle: Option<String>,
    user_persona: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<Session> for SessionDto {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.id.to_string(),
            title: session.title,
            user_display_name: session.user_display_name,
            user_handle: session.user_handle,
            user_persona: session.user_persona,
            created_at: session.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct MessageDto {
    id: String,
    sender: String,
    content: String,
    position: i64,
    created_at: DateTime<Utc>,
}

impl From<Message> for MessageDto {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            sender: message.sender,
            content: message.content,
            position: message.position,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct PersonaDto {
    id: String,
    handle: String,
    display_name: String,
    system_prompt: String,
    tone: String,
    proactivity: f32,
    memory_window: u32,
    max_agents_per_turn: u32,
    api_profile_id: String,
    embedding_profile_id: Option<String>,
    is_default: bool,
    background_text: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<Persona> for PersonaDto {
    fn from(persona: Persona) -> Self {
        Self {
            id: persona.id,
            handle: persona.handle,
            display_name: persona.display_name,
            system_prompt: persona.system_prompt,
            tone: persona.tone,
            proactivity: persona.proactivity,
            memory_window: persona.memory_window,
            max_agents_per_turn: persona.max_agents_per_turn,
            api_profile_id: persona.api_profile_id,
            embedding_profile_id: persona.embedding_profile_id,
            is_default: persona.is_default,
            background_text: persona.background_text,
            created_at: persona.created_at,
        }
    }
}

/// API keys are write-only; responses carry a masked preview.
#[derive(Debug, Serialize)]
struct ApiProfileDto {
    id: String,
    name: String,
    base_url: String,
    model: String,
    api_key_preview: String,
    temperature: f32,
    is_embedding_model: bool,
    embedding_dim: Option<u32>,
    created_at: DateTime<Utc>,
}

impl ApiProfileDto {
    fn build(state: &AppState, profile: ApiProfile) -> Self {
        let api_key_preview = state.stores.profiles.key_preview(&profile);
        Self {
            id: profile.id,
            name: profile.name,
            base_url: profile.base_url,
            model: profile.model,
            api_key_preview,
            temperature: profile.temperature,
            is_embedding_model: profile.is_embedding_model,
            embedding_dim: profile.embedding_dim,
            created_at: profile.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    content: String,
    #[serde(default)]
    target_personas: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BulkDeleteRequest {
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct IngestTextRequest {
    text: String,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IngestUrlRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    chunks_added: usize,
    collection: String,
}

/// Source tag for chunks ingested from a persona's `background_text`.
const BACKGROUND_SOURCE: &str = "background";

// ---------------------------------------------------------------------------
// Session handlers
// ---------------------------------------------------------------------------

async fn create_session(
    State(state): State<AppState>,
    user: AuthUser,
    Json(meta): Json<SessionPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .stores
        .conversations
        .create_session(user.as_str(), meta)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "session_id": session.id.to_string() })),
    ))
}

async fn list_sessions(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<SessionDto>>, ApiError> {
    let sessions = state.stores.conversations.list_sessions(user.as_str()).await?;
    Ok(Json(sessions.into_iter().map(SessionDto::from).collect()))
}

async fn update_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> Result<Json<SessionDto>, ApiError> {
    let session_id = user.owned_session(&id)?;
    let session = state
        .stores
        .conversations
        .update_session_meta(&session_id, patch)
        .await?;
    Ok(Json(session.into()))
}

async fn delete_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session_id = user.owned_session(&id)?;
    // Cancel any in-flight turn first so nothing is persisted afterwards.
    state.orchestrator.close_session(&session_id);
    state.stores.conversations.delete_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn bulk_delete_sessions(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<BulkDeleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut ids = Vec::with_capacity(request.ids.len());
    for raw in &request.ids {
        // Skip malformed ids rather than failing the batch.
        if let Ok(id) = parley_core::SessionId::parse(raw) {
            ids.push(id);
        }
    }
    for id in &ids {
        state.orchestrator.close_session(id);
    }
    let deleted = state
        .stores
        .conversations
        .delete_sessions(&ids, user.as_str())
        .await?;
    Ok(Json(serde_json::json!({
        "deleted": deleted.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
    })))
}

async fn post_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<PostMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.content.trim().is_empty() {
        return Err(Error::Validation("content must not be empty".into()).into());
    }
    let session_id = user.owned_session(&id)?;

    let message = state
        .orchestrator
        .enqueue(&session_id, &request.content, request.target_personas)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "message_id": message.id })),
    ))
}

async fn list_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageDto>>, ApiError> {
    let session_id = user.owned_session(&id)?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let messages = state
        .stores
        .conversations
        .list_messages(&session_id, limit)
        .await?;
    Ok(Json(messages.into_iter().map(MessageDto::from).collect()))
}

// ---------------------------------------------------------------------------
// Persona handlers
// ---------------------------------------------------------------------------

async fn create_persona(
    State(state): State<AppState>,
    user: AuthUser,
    Json(new): Json<NewPersona>,
) -> Result<impl IntoResponse, ApiError> {
    let background = new.background_text.clone();
    let persona = state.stores.personas.create(user.as_str(), new).await?;

    // Seed the knowledge base when both a document and an embedder exist.
    if background.as_deref().map(str::trim).filter(|t| !t.is_empty()).is_some()
        && persona.has_knowledge_config()
    {
        if let Err(e) = ingest_background(&state, &persona).await {
            tracing::warn!(persona_id = %persona.id, error = %e, "Background ingestion failed");
        }
    }

    Ok((StatusCode::CREATED, Json(PersonaDto::from(persona))))
}

async fn list_personas(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<PersonaDto>>, ApiError> {
    let personas = state.stores.personas.list(user.as_str()).await?;
    Ok(Json(personas.into_iter().map(PersonaDto::from).collect()))
}

async fn get_persona(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<PersonaDto>, ApiError> {
    let persona = state.stores.personas.get(user.as_str(), &id).await?;
    Ok(Json(persona.into()))
}

async fn update_persona(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(patch): Json<PersonaPatch>,
) -> Result<Json<PersonaDto>, ApiError> {
    let persona = state.stores.personas.update(user.as_str(), &id, patch).await?;
    Ok(Json(persona.into()))
}

async fn delete_persona(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.stores.personas.delete(user.as_str(), &id).await?;

    // Cascade the knowledge collection; the relational delete already
    // succeeded, so a vector-store hiccup is logged rather than surfaced.
    let collection = parley_core::collection_name(user.as_str(), &id);
    if let Err(e) = state.engine.delete_collection(&collection).await {
        tracing::warn!(collection = %collection, error = %e, "Collection cleanup failed");
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn ingest_text(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<IngestTextRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    if request.text.trim().is_empty() {
        return Err(Error::Validation("text must not be empty".into()).into());
    }
    let persona = state.stores.personas.get(user.as_str(), &id).await?;
    let binding = state.knowledge_binding(&persona).await?;
    let source = request.source.unwrap_or_else(|| "pasted-text".to_string());

    let report = state.engine.ingest_text(&binding, &request.text, &source).await?;
    Ok(Json(IngestResponse {
        chunks_added: report.chunks_added,
        collection: report.collection,
    }))
}

async fn ingest_url(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<IngestUrlRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        return Err(Error::Validation("url must be http(s)".into()).into());
    }
    let persona = state.stores.personas.get(user.as_str(), &id).await?;
    let binding = state.knowledge_binding(&persona).await?;

    let report = state.engine.ingest_url(&binding, &request.url).await?;
    Ok(Json(IngestResponse {
        chunks_added: report.chunks_added,
        collection: report.collection,
    }))
}

async fn refresh_rag(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<IngestResponse>, ApiError> {
    let persona = state.stores.personas.get(user.as_str(), &id).await?;
    if persona
        .background_text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .is_none()
    {
        return Err(Error::Validation("persona has no background_text".into()).into());
    }

    let report = ingest_background(&state, &persona).await?;
    Ok(Json(IngestResponse {
        chunks_added: report.chunks_added,
        collection: report.collection,
    }))
}

async fn ingest_background(
    state: &AppState,
    persona: &Persona,
) -> Result<parley_rag::IngestReport, ApiError> {
    let binding = state.knowledge_binding(persona).await?;
    let text = persona.background_text.as_deref().unwrap_or_default();
    Ok(state.engine.ingest_text(&binding, text, BACKGROUND_SOURCE).await?)
}

async fn knowledge_info(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let persona = state.stores.personas.get(user.as_str(), &id).await?;
    let collection = parley_core::collection_name(&persona.owner, &persona.id);
    let points = state.engine.collection_size(&collection).await?;
    Ok(Json(serde_json::json!({
        "collection": collection,
        "points": points,
    })))
}

// ---------------------------------------------------------------------------
// API profile handlers
// ---------------------------------------------------------------------------

async fn create_profile(
    State(state): State<AppState>,
    user: AuthUser,
    Json(new): Json<NewApiProfile>,
) -> Result<impl IntoResponse, ApiError> {
    if new.api_key.trim().is_empty() {
        return Err(Error::Validation("api_key must not be empty".into()).into());
    }
    let profile = state.stores.profiles.create(user.as_str(), new).await?;
    Ok((StatusCode::CREATED, Json(ApiProfileDto::build(&state, profile))))
}

async fn list_profiles(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<ApiProfileDto>>, ApiError> {
    let profiles = state.stores.profiles.list(user.as_str()).await?;
    Ok(Json(
        profiles
            .into_iter()
            .map(|p| ApiProfileDto::build(&state, p))
            .collect(),
    ))
}

async fn get_profile(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiProfileDto>, ApiError> {
    let profile = state.stores.profiles.get(user.as_str(), &id).await?;
    Ok(Json(ApiProfileDto::build(&state, profile)))
}

async fn update_profile(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(patch): Json<ApiProfilePatch>,
) -> Result<Json<ApiProfileDto>, ApiError> {
    let profile = state.stores.profiles.update(user.as_str(), &id, patch).await?;
    Ok(Json(ApiProfileDto::build(&state, profile)))
}

async fn delete_profile(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let cascaded = state.stores.profiles.delete(user.as_str(), &id).await?;

    for persona_id in cascaded {
        let collection = parley_core::collection_name(user.as_str(), &persona_id);
        if let Err(e) = state.engine.delete_collection(&collection).await {
            tracing::warn!(collection = %collection, error = %e, "Collection cleanup failed");
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Ops handlers
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "bound_sessions": state.orchestrator.bound_sessions(),
        })),
    )
}

async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.stores.conversations.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ready" })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "not_ready", "detail": "database unreachable" })),
            )
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
