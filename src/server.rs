use crate::assistant::AssistantClient;
use crate::config::Config;
use crate::conversation::ConversationService;
use crate::driver::RunDriver;
use crate::error::ServiceError;
use crate::handler::RenderSettings;
use crate::protocol::{Framing, RunAssistantRequest, UploadFileRequest};
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures::StreamExt;
use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

pub struct AppState {
    service: Arc<dyn ConversationService>,
    driver: RunDriver,
    framing: Framing,
}

impl AppState {
    pub fn new(
        service: Arc<dyn ConversationService>,
        settings: RenderSettings,
        framing: Framing,
    ) -> Self {
        Self {
            driver: RunDriver::new(Arc::clone(&service), settings),
            service,
            framing,
        }
    }
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Service(ServiceError::Rejected { status: 404, .. }) => StatusCode::NOT_FOUND,
            ApiError::Service(_) => StatusCode::BAD_GATEWAY,
        };
        tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn run(config: Config) -> ServerResult<()> {
    config.validate()?;

    let client = AssistantClient::new(&config)?;
    let assistant = client.retrieve_assistant().await?;
    tracing::info!(
        assistant_id = %assistant.id,
        name = assistant.name.as_deref().unwrap_or("unnamed"),
        model = assistant.model.as_deref().unwrap_or("unknown"),
        "using assistant"
    );

    let state = Arc::new(AppState::new(
        Arc::new(client),
        config.render_settings(),
        config.framing,
    ));
    let app = router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!("relay listening on http://{}", config.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("relay stopped");
    Ok(())
}

pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/create_thread", post(create_thread))
        .route(
            "/upload_file_and_create_thread",
            post(upload_file_and_create_thread),
        )
        .route("/run_assistant", post(run_assistant))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn create_thread(State(state): State<Arc<AppState>>) -> Result<Json<String>, ApiError> {
    let thread_id = state.service.create_conversation(&[]).await?;
    Ok(Json(thread_id))
}

async fn upload_file_and_create_thread(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<UploadFileRequest>,
) -> Result<Json<String>, ApiError> {
    if payload.file_name.trim().is_empty() {
        return Err(ApiError::BadRequest("fileName must not be empty".into()));
    }
    let bytes = BASE64
        .decode(payload.file_base64.trim())
        .map_err(|e| ApiError::BadRequest(format!("fileBase64 is not valid base64: {}", e)))?;

    let file_id = state.service.upload_file(&payload.file_name, bytes).await?;
    let thread_id = state.service.create_conversation(&[file_id]).await?;
    Ok(Json(thread_id))
}

async fn run_assistant(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RunAssistantRequest>,
) -> Result<Response, ApiError> {
    if payload.thread_id.trim().is_empty() {
        return Err(ApiError::BadRequest("thread_id must not be empty".into()));
    }
    if payload.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }

    let span = tracing::info_span!(
        "run_assistant",
        request_id = %Uuid::new_v4(),
        thread_id = %payload.thread_id,
    );
    let fragments = state
        .driver
        .start(&payload.thread_id, &payload.message)
        .instrument(span)
        .await?;

    let framing = state.framing;
    let body = Body::from_stream(
        fragments.map(move |fragment| Ok::<_, Infallible>(framing.encode(&fragment))),
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
