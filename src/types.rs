use serde::{Deserialize, Serialize};

use crate::cell_type::{CellLabel, CellType, WBC_SUBGROUP};
use crate::engine::ClassNames;
use crate::normalizer::CountAggregate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model_loaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfoResponse {
    pub model: String,
    pub status: String,
    /// 最近一次状态变化（unix 秒）
    pub last_updated: Option<u64>,
    pub class_names: Option<ClassNames>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

/// 单个细胞的检测记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellDetection {
    pub cell_type: CellLabel,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

/// 按类别汇总的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellCounts {
    pub rbc: u32,
    pub platelets: u32,
    pub neutrophil: u32,
    pub lymphocyte: u32,
    pub monocyte: u32,
    pub eosinophil: u32,
    pub basophil: u32,
    /// 模型只给出笼统 WBC、没有亚型的框
    pub wbc_unclassified: u32,
    /// 不在标准类别里的框
    pub other: u32,
    pub total_wbc: u32,
}

impl From<&CountAggregate> for CellCounts {
    fn from(agg: &CountAggregate) -> Self {
        Self {
            rbc: agg.count(CellType::Rbc),
            platelets: agg.count(CellType::Platelets),
            neutrophil: agg.count(CellType::Neutrophil),
            lymphocyte: agg.count(CellType::Lymphocyte),
            monocyte: agg.count(CellType::Monocyte),
            eosinophil: agg.count(CellType::Eosinophil),
            basophil: agg.count(CellType::Basophil),
            wbc_unclassified: agg.count(CellType::Wbc),
            other: agg.other(),
            total_wbc: agg.subtotal(WBC_SUBGROUP.name).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionResponse {
    pub success: bool,
    pub message: String,
    pub counts: CellCounts,
    pub detections: Vec<CellDetection>,
    pub image_width: u32,
    pub image_height: u32,
}

/// 所有错误响应的 body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ErrorResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}
