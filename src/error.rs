use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use thiserror::Error;
use tracing::error;

use crate::model_registry::ModelError;
use crate::types::ErrorResponse;

pub const UNEXPECTED_DETAIL: &str = "An unexpected error occurred during detection";

/// 一次检测请求可能的失败
#[derive(Debug, Error)]
pub enum ApiError {
    /// 非法上传：类型不对 / 图片解不开
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    ModelLoad(#[from] ModelError),
    /// 推理或结果整理出错
    #[error("{0}")]
    Inference(String),
    /// 说不清原因的失败（比如推理线程 panic），对外只给通用提示
    #[error("{}", UNEXPECTED_DETAIL)]
    Unexpected { cause: anyhow::Error },
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::InvalidInput(_) => Status::BadRequest,
            ApiError::ModelLoad(_) | ApiError::Inference(_) | ApiError::Unexpected { .. } => {
                Status::InternalServerError
            }
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        match &self {
            ApiError::InvalidInput(detail) => error!("Invalid image: {detail}"),
            ApiError::ModelLoad(e) => error!("Model unavailable: {e}"),
            ApiError::Inference(detail) => error!("Detection error: {detail}"),
            ApiError::Unexpected { cause } => error!("Unexpected error: {cause:#}"),
        }
        (status, Json(ErrorResponse::new(self.to_string()))).respond_to(req)
    }
}
