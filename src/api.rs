use std::sync::Arc;
use std::time::UNIX_EPOCH;

use rocket::form::Form;
use rocket::fs::TempFile;
use rocket::http::ContentType;
use rocket::serde::json::Json;
use rocket::tokio::io::AsyncReadExt;
use rocket::{get, post, Request, State};
use tracing::info;

use crate::app_state::AppState;
use crate::detection::detect_cells;
use crate::error::ApiError;
use crate::types::{DetectionResponse, ErrorResponse, HealthResponse, ModelInfoResponse};

/// 允许上传的图片类型（image/jpg 不标准，但浏览器会发）
pub const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/jpg"];

#[derive(FromForm)]
pub struct DetectUpload<'r> {
    pub file: TempFile<'r>,
}

fn is_allowed_content_type(content_type: Option<&ContentType>) -> bool {
    content_type.is_some_and(|ct| {
        let media = ct.media_type();
        ALLOWED_CONTENT_TYPES
            .iter()
            .filter_map(|allowed| allowed.split_once('/'))
            .any(|(top, sub)| media.top() == top && media.sub() == sub)
    })
}

/// 读落盘的上传文件。读不出来是服务端 I/O 问题，不算客户端输入错误。
async fn read_upload(file: &TempFile<'_>) -> Result<Vec<u8>, ApiError> {
    let mut bytes = Vec::with_capacity(file.len() as usize);
    let read = async {
        let mut reader = file.open().await?;
        reader.read_to_end(&mut bytes).await
    };
    read.await.map_err(upload_read_failed)?;
    Ok(bytes)
}

fn upload_read_failed(e: std::io::Error) -> ApiError {
    ApiError::Unexpected {
        cause: anyhow::Error::new(e).context("Failed to read upload"),
    }
}

#[get("/health")]
pub async fn health(state: &State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.settings.app_version.clone(),
        model_loaded: state.models.is_loaded(),
    })
}

#[get("/model")]
pub async fn model_info(state: &State<Arc<AppState>>) -> Json<ModelInfoResponse> {
    let meta = state.models.metadata();
    let last_updated = meta
        .last_updated
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs());
    let class_names = state
        .models
        .current()
        .map(|detector| detector.class_names().clone());

    Json(ModelInfoResponse {
        model: meta.name,
        status: format!("{:?}", meta.status),
        last_updated,
        class_names,
    })
}

#[post("/detect", data = "<upload>")]
pub async fn detect(
    state: &State<Arc<AppState>>,
    upload: Form<DetectUpload<'_>>,
) -> Result<Json<DetectionResponse>, ApiError> {
    let file = &upload.file;

    if !is_allowed_content_type(file.content_type()) {
        let got = file
            .content_type()
            .map(|ct| ct.to_string())
            .unwrap_or_else(|| "none".to_string());
        return Err(ApiError::InvalidInput(format!(
            "Invalid file type: {got}. Supported: JPEG, PNG"
        )));
    }

    info!(
        "Received image for detection: {}",
        file.name().unwrap_or("<unnamed>")
    );

    let bytes = read_upload(file).await?;

    let response = detect_cells(state, &bytes).await?;
    Ok(Json(response))
}

#[catch(404)]
pub fn not_found(req: &Request<'_>) -> Json<ErrorResponse> {
    Json(ErrorResponse::new(format!("Not found: {}", req.uri())))
}

#[catch(413)]
pub fn payload_too_large() -> Json<ErrorResponse> {
    Json(ErrorResponse::new("Uploaded file is too large"))
}

#[catch(422)]
pub fn unprocessable() -> Json<ErrorResponse> {
    Json(ErrorResponse::new(
        "Expected a multipart form with an image in the `file` field",
    ))
}

#[catch(500)]
pub fn internal_error() -> Json<ErrorResponse> {
    Json(ErrorResponse::new(crate::error::UNEXPECTED_DETAIL))
}
