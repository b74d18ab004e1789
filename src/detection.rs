use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GenericImageView};
use tokio::task::JoinError;
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::cell_type::{CellType, WBC_SUBGROUP};
use crate::error::ApiError;
use crate::normalizer::normalize;
use crate::types::{CellCounts, DetectionResponse};

pub const SUCCESS_MESSAGE: &str = "Detection completed successfully";

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ApiError> {
    image::load_from_memory(bytes)
        .map_err(|e| ApiError::InvalidInput(format!("Invalid image format: {e}")))
}

/// 一次检测：解码 -> 推理 -> 整理 -> 组装响应。
/// `inference_timeout_secs` 管整条流水线，包括首次加载模型和排队等 permit。
pub async fn detect_cells(state: &AppState, bytes: &[u8]) -> Result<DetectionResponse, ApiError> {
    let timeout_secs = state.settings.inference_timeout_secs;
    // 超时后阻塞任务不会被真正取消，只是不再等它
    match tokio::time::timeout(Duration::from_secs(timeout_secs), run_pipeline(state, bytes)).await
    {
        Ok(result) => result,
        Err(_) => Err(ApiError::Inference(format!(
            "Detection failed: timed out after {timeout_secs}s"
        ))),
    }
}

async fn run_pipeline(state: &AppState, bytes: &[u8]) -> Result<DetectionResponse, ApiError> {
    let image = decode_image(bytes)?;
    let (image_width, image_height) = image.dimensions();
    info!("Processing image: {}x{}", image_width, image_height);

    let detector = state.models.get_handle().await?;
    debug!(classes = ?detector.class_names(), "Model class names");

    let _permit = state
        .semaphore
        .acquire()
        .await
        .map_err(|e| ApiError::Unexpected { cause: e.into() })?;

    let params = state.settings.detect_params();
    info!(
        "Running detection with confidence threshold: {}",
        params.confidence_threshold
    );

    let raw = match detector.detect(Arc::new(image), params).await {
        Ok(raw) => raw,
        Err(cause) if cause.downcast_ref::<JoinError>().is_some() => {
            return Err(ApiError::Unexpected { cause });
        }
        Err(cause) => {
            return Err(ApiError::Inference(format!("Detection failed: {cause:#}")));
        }
    };
    info!("Raw detection count: {}", raw.len());

    let (detections, aggregate) = normalize(
        &raw,
        detector.class_names(),
        &state.label_map,
        &[WBC_SUBGROUP],
    )
    .map_err(|e| ApiError::Inference(format!("Detection failed: {e}")))?;

    for cell_type in CellType::ALL {
        debug!(%cell_type, count = aggregate.count(cell_type), "Per-type count");
    }

    let counts = CellCounts::from(&aggregate);
    info!(
        "Detection complete: {} cells, {} RBCs, {} WBCs (Neutrophil: {}, Lymphocyte: {}, \
         Monocyte: {}, Eosinophil: {}, Basophil: {}, unclassified: {}), {} Platelets, {} other",
        aggregate.total(),
        counts.rbc,
        counts.total_wbc,
        counts.neutrophil,
        counts.lymphocyte,
        counts.monocyte,
        counts.eosinophil,
        counts.basophil,
        counts.wbc_unclassified,
        counts.platelets,
        counts.other,
    );

    Ok(DetectionResponse {
        success: true,
        message: SUCCESS_MESSAGE.to_string(),
        counts,
        detections,
        image_width,
        image_height,
    })
}
