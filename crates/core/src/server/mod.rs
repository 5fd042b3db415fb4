use std::io::Cursor;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::ImageFormat;
use serde::Serialize;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::enhancer::Enhancer;
use crate::pipeline::PixelBuffer;

const UPLOAD_FIELD_NAME: &str = "file";
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    enhancer: Arc<Enhancer>,
    inference_permits: Arc<Semaphore>,
    config: AppConfig,
}

impl AppState {
    pub fn new(enhancer: Enhancer, config: AppConfig) -> Self {
        let max_in_flight = config.inference.max_in_flight.max(1);
        info!(max_in_flight, "Initialized enhancement service state");

        Self {
            inner: Arc::new(AppStateInner {
                enhancer: Arc::new(enhancer),
                inference_permits: Arc::new(Semaphore::new(max_in_flight)),
                config,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/enhance", post(enhance))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Accepts a multipart upload under the `file` field, runs the 4x
/// enhancement, and responds with the result encoded as PNG regardless
/// of the uploaded format.
async fn enhance(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let upload = read_upload_field(multipart).await?;

    let decoded = image::load_from_memory(&upload)
        .map_err(|err| AppError::BadRequest(format!("could not decode uploaded image: {err}")))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    let input = PixelBuffer::new(decoded.into_raw(), width, height)?;

    debug!(width, height, upload_bytes = upload.len(), "Accepted enhancement request");

    // One permit per forward pass; excess requests queue here.
    let permit = state
        .inner
        .inference_permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| AppError::Internal("inference queue is closed".to_string()))?;

    let enhancer = Arc::clone(&state.inner.enhancer);
    let output = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        enhancer.enhance(&input)
    })
    .await
    .map_err(|err| AppError::Internal(format!("inference task failed: {err}")))??;

    let encoded = encode_png(output)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        encoded,
    )
        .into_response())
}

async fn read_upload_field(mut multipart: Multipart) -> Result<Bytes, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::BadRequest(format!("malformed multipart request: {err}")))?
    {
        if field.name() == Some(UPLOAD_FIELD_NAME) {
            return field.bytes().await.map_err(|err| {
                AppError::BadRequest(format!("failed to read uploaded file: {err}"))
            });
        }
    }

    Err(AppError::BadRequest(format!(
        "missing multipart field '{UPLOAD_FIELD_NAME}'"
    )))
}

fn encode_png(image: PixelBuffer) -> Result<Vec<u8>, AppError> {
    let buffer = image::RgbImage::from_raw(image.width, image.height, image.data)
        .ok_or_else(|| AppError::Internal("enhanced image has inconsistent dimensions".to_string()))?;

    let mut encoded = Vec::new();
    buffer
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .map_err(|err| AppError::Internal(format!("failed to encode PNG response: {err}")))?;
    Ok(encoded)
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}
