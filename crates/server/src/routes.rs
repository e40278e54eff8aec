use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use cardforge_core::validate::{require_jpeg, validate_animation_prompt, validate_card_prompt};
use cardforge_core::{ClientId, QuotaKind, TokenPayload};
use cardforge_engine::jobs::JobRecord;
use cardforge_engine::model::{AnimationStatus, ModelError};
use cardforge_engine::queue::QueueMessage;

use crate::state::SharedState;

const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

/// Error shape of every non-2xx API response: `{success: false, error}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    LimitReached(String),
    Internal(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(error) => (StatusCode::BAD_REQUEST, error),
            ApiError::Unauthorized(error) => (StatusCode::UNAUTHORIZED, error),
            ApiError::NotFound(error) => (StatusCode::NOT_FOUND, error),
            ApiError::LimitReached(error) => (StatusCode::TOO_MANY_REQUESTS, error),
            ApiError::Internal(error) => (StatusCode::INTERNAL_SERVER_ERROR, error),
        };
        (status, Json(json!({ "success": false, "error": error }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(state: SharedState) -> Router {
    let artifacts = ServeDir::new(&state.artifacts_root);
    Router::new()
        .route("/health", get(health))
        .route("/api/login", post(login))
        .route("/api/transform-card", post(transform_card))
        .route("/api/store-card", post(store_card))
        .route("/api/print-card", post(print_card))
        .nest_service("/artifacts", artifacts)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Best-effort client IP: forwarding headers first, `"unknown"` otherwise.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    "unknown".to_string()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    headers
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn authenticate(state: &SharedState, headers: &HeaderMap) -> Result<TokenPayload, ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("Missing authorization header".to_string()))?;
    state
        .auth
        .verify(&token)
        .map_err(|err| ApiError::Unauthorized(err.to_string()))
}

fn decode_image(raw: &str, what: &str) -> Result<Vec<u8>, ApiError> {
    B64.decode(raw.as_bytes())
        .map_err(|_| ApiError::BadRequest(format!("{what} is not valid base64")))
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, ApiError> {
    match field.as_deref() {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ApiError::BadRequest(format!("Missing {name} parameter"))),
    }
}

fn model_error(err: ModelError) -> ApiError {
    match err {
        ModelError::Rejected(reason) => ApiError::BadRequest(reason),
        other => ApiError::Internal(other.to_string()),
    }
}

fn artifact_url(key: &str) -> String {
    format!("/artifacts/{key}")
}

fn filename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct TransformCardRequest {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    user_number: Option<u32>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    card_image: Option<String>,
    #[serde(default)]
    video_prompt: Option<String>,
    #[serde(default)]
    invocation_arn: Option<String>,
    #[serde(default)]
    animation_prompt: Option<String>,
    #[serde(default)]
    override_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoreCardRequest {
    #[serde(default)]
    final_card_base64: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrintCardRequest {
    #[serde(default)]
    card_prompt: Option<String>,
    #[serde(default)]
    card_image: Option<String>,
    #[serde(default)]
    card_number: Option<u32>,
}

async fn health(State(state): State<SharedState>) -> ApiResult {
    let capacity = state.capacity.stats().await;
    Ok(Json(json!({
        "status": "healthy",
        "service": "cardforge",
        "version": env!("CARGO_PKG_VERSION"),
        "queue_depth": state.queue.depth().await,
        "capacity": capacity,
    })))
}

async fn login(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> ApiResult {
    if !state.auth.validate_login(&body.username, &body.password) {
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }
    let token = state.auth.issue_token(&body.username);
    let ip = client_ip(&headers);
    let (_, remaining) = state.ledger.remaining_for(&ip).await?;

    info!(username = %body.username, %ip, "login succeeded");
    Ok(Json(json!({
        "success": true,
        "message": "Login successful",
        "token": token,
        "expires_in": cardforge_core::auth::TOKEN_EXPIRY_HOURS * 3600,
        "user": { "username": body.username },
        "remaining": remaining,
        "client_ip": ip,
    })))
}

async fn transform_card(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<TransformCardRequest>,
) -> ApiResult {
    let token = authenticate(&state, &headers)?;
    let action = body.action.clone().unwrap_or_default();
    match action.as_str() {
        "get_job_status" | "check_job_status" => job_status(state, body).await,
        "generate_video" => generate_video(state, headers, body).await,
        "get_video_status" => video_status(state, headers, token, body).await,
        "apply_override" => apply_override(state, headers, body).await,
        _ => submit_card_job(state, headers, body).await,
    }
}

async fn submit_card_job(
    state: SharedState,
    headers: HeaderMap,
    body: TransformCardRequest,
) -> ApiResult {
    let prompt = required(&body.prompt, "prompt")?;
    validate_card_prompt(prompt).map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let client = ClientId::new(client_ip(&headers), body.device_id.unwrap_or_default());
    let decision = state.ledger.check_quota(&client.ip, QuotaKind::Cards).await?;
    if !decision.allowed {
        return Err(ApiError::LimitReached(
            "Card limit reached. Please visit the event staff to assist.".to_string(),
        ));
    }

    let display_name = body
        .user_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "Guest".to_string());
    let user_number = body.user_number.unwrap_or(1);

    let record = JobRecord::new(
        prompt,
        decision.session.to_string(),
        &client,
        user_number,
        &display_name,
    );
    state.jobs.create(&record).await?;
    state
        .queue
        .send(QueueMessage {
            job_id: record.job_id.clone(),
            prompt: prompt.to_string(),
            user_number,
            display_name,
            device_id: client.device_id.clone(),
            session_id: decision.session.to_string(),
        })
        .await?;

    info!(job_id = %record.job_id, session = %decision.session, "card job queued");
    Ok(Json(json!({
        "success": true,
        "job_id": record.job_id,
        "status": "queued",
        "message": "Card generation started. Please wait...",
        "session_id": decision.session.to_string(),
        "client_ip": client.ip,
    })))
}

async fn job_status(state: SharedState, body: TransformCardRequest) -> ApiResult {
    let job_id = required(&body.job_id, "job_id")?;
    let Some(record) = state.jobs.get(job_id).await? else {
        return Err(ApiError::NotFound(format!("Job not found: {job_id}")));
    };

    let mut response = json!({
        "success": true,
        "job_id": record.job_id,
        "status": record.status.to_string(),
    });
    if let Some(key) = &record.artifact_key {
        response["artifact_url"] = Value::String(artifact_url(key));
        response["s3_key"] = Value::String(key.clone());
    }
    if let Some(error) = &record.error {
        response["error"] = Value::String(error.clone());
    }
    Ok(Json(response))
}

async fn generate_video(
    state: SharedState,
    headers: HeaderMap,
    body: TransformCardRequest,
) -> ApiResult {
    let card_image = required(&body.card_image, "card_image")?;
    let video_prompt = required(&body.video_prompt, "video_prompt")?;
    validate_animation_prompt(video_prompt)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let image_bytes = decode_image(card_image, "card_image")?;
    require_jpeg(&image_bytes).map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let ip = client_ip(&headers);
    let decision = state.ledger.check_quota(&ip, QuotaKind::Videos).await?;
    if !decision.allowed {
        return Err(ApiError::LimitReached(
            "Video limit reached. Please visit the event staff to assist.".to_string(),
        ));
    }

    let invocation = state
        .video_model
        .start_animation(card_image, video_prompt)
        .await
        .map_err(model_error)?;

    info!(session = %decision.session, %invocation, "video generation started");
    Ok(Json(json!({
        "success": true,
        "status": "processing",
        "invocation_arn": invocation,
        "session_id": decision.session.to_string(),
        "client_ip": ip,
    })))
}

async fn video_status(
    state: SharedState,
    headers: HeaderMap,
    token: TokenPayload,
    body: TransformCardRequest,
) -> ApiResult {
    let invocation = required(&body.invocation_arn, "invocation_arn")?;

    match state
        .video_model
        .animation_status(invocation)
        .await
        .map_err(model_error)?
    {
        AnimationStatus::InProgress => Ok(Json(json!({
            "success": true,
            "status": "processing",
            "message": "Video generation in progress",
        }))),
        AnimationStatus::Failed { message } => Ok(Json(json!({
            "success": false,
            "status": "failed",
            "error": message,
        }))),
        AnimationStatus::Completed { video_b64 } => {
            let bytes = decode_image(&video_b64, "video payload")?;
            let ip = client_ip(&headers);
            let session = state.ledger.current_session(&ip).await?;
            let prompt = body.animation_prompt.as_deref().unwrap_or_default();
            let key = state
                .ledger
                .store_video(&session, &bytes, &token.username, prompt)
                .await?;
            let (_, remaining) = state.ledger.remaining_for(&ip).await?;

            Ok(Json(json!({
                "success": true,
                "status": "completed",
                "video_s3_key": key,
                "video_url": artifact_url(&key),
                "video_data": video_b64,
                "remaining": remaining,
                "session_id": session.to_string(),
            })))
        }
    }
}

async fn apply_override(
    state: SharedState,
    headers: HeaderMap,
    body: TransformCardRequest,
) -> ApiResult {
    let code = required(&body.override_code, "override_code")?;
    if code != state.override_code {
        return Err(ApiError::BadRequest("Invalid override code".to_string()));
    }

    let ip = client_ip(&headers);
    let (override_number, session) = state.ledger.apply_override(&ip).await?;
    let (_, remaining) = state.ledger.remaining_for(&ip).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Override #{override_number} applied successfully"),
        "override_number": override_number,
        "session_id": session.to_string(),
        "remaining": remaining,
        "client_ip": ip,
    })))
}

async fn store_card(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<StoreCardRequest>,
) -> ApiResult {
    let token = authenticate(&state, &headers)?;
    let card = required(&body.final_card_base64, "final_card_base64")?;
    let bytes = decode_image(card, "final_card_base64")?;

    let ip = client_ip(&headers);
    let session = state.ledger.current_session(&ip).await?;
    let prompt = body.prompt.as_deref().unwrap_or_default();
    let username = body
        .user_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(token.username);
    let key = state
        .ledger
        .store_card(&session, &bytes, &username, prompt, None)
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Final card stored successfully",
        "s3_key": key,
        "filename": filename(&key),
        "session_id": session.to_string(),
    })))
}

async fn print_card(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<PrintCardRequest>,
) -> ApiResult {
    let token = authenticate(&state, &headers)?;
    let prompt = required(&body.card_prompt, "card_prompt")?;
    let image = required(&body.card_image, "card_image")?;
    let bytes = decode_image(image, "card_image")?;
    let card_number = body.card_number.unwrap_or(1);

    let ip = client_ip(&headers);
    let decision = state.ledger.check_quota(&ip, QuotaKind::Prints).await?;
    if !decision.allowed {
        return Err(ApiError::LimitReached(
            "Print limit reached. Please visit the event staff to assist.".to_string(),
        ));
    }

    let (key, print_number) = state
        .ledger
        .store_print(&decision.session, card_number, &bytes, &token.username, prompt)
        .await?;
    let (_, remaining) = state.ledger.remaining_for(&ip).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Card saved for printing",
        "print_filename": filename(&key),
        "print_s3_key": key,
        "print_number": print_number,
        "card_number": card_number,
        "remaining": remaining,
        "session_id": decision.session.to_string(),
        "client_ip": ip,
    })))
}
