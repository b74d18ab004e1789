use std::collections::BTreeMap;

use thiserror::Error;

use crate::cell_type::{CellType, LabelMap, Subgroup};
use crate::engine::{ClassNames, RawDetection};
use crate::types::{BoundingBox, CellDetection};

/// class id 在模型类别表里查不到时用的名字
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("detection {index} has invalid confidence {confidence}")]
    InvalidConfidence { index: usize, confidence: f32 },
    #[error("detection {index} has malformed bounding box {bbox:?}")]
    MalformedBox { index: usize, bbox: [f32; 4] },
}

/// 单次请求的计数结果。
/// 封闭集合内每个类别的计数 == 带该标签的检测记录数；
/// 集合外的标签全部计入 `other`，因此所有一级计数之和 == 记录总数。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountAggregate {
    counts: BTreeMap<CellType, u32>,
    other: u32,
    subtotals: BTreeMap<&'static str, u32>,
}

impl CountAggregate {
    pub fn count(&self, cell_type: CellType) -> u32 {
        self.counts.get(&cell_type).copied().unwrap_or(0)
    }

    pub fn other(&self) -> u32 {
        self.other
    }

    pub fn subtotal(&self, name: &str) -> Option<u32> {
        self.subtotals.get(name).copied()
    }

    /// 一级计数之和（不含派生小计）
    pub fn total(&self) -> u32 {
        self.counts.values().sum::<u32>() + self.other
    }
}

/// 原始检测框 -> 标准化记录 + 计数。纯函数。
pub fn normalize(
    raw_detections: &[RawDetection],
    class_names: &ClassNames,
    label_map: &LabelMap,
    subgroups: &[Subgroup],
) -> Result<(Vec<CellDetection>, CountAggregate), NormalizeError> {
    let mut records = Vec::with_capacity(raw_detections.len());
    let mut aggregate = CountAggregate::default();

    for (index, det) in raw_detections.iter().enumerate() {
        if !(0.0..=1.0).contains(&det.confidence) {
            return Err(NormalizeError::InvalidConfidence {
                index,
                confidence: det.confidence,
            });
        }
        let [x_min, y_min, x_max, y_max] = det.bbox;
        if det.bbox.iter().any(|v| !v.is_finite()) || x_min > x_max || y_min > y_max {
            return Err(NormalizeError::MalformedBox {
                index,
                bbox: det.bbox,
            });
        }

        let raw_label = class_names.get(det.class_id).unwrap_or(UNKNOWN_LABEL);
        let label = label_map.resolve(raw_label);

        match label.cell_type() {
            Some(t) => *aggregate.counts.entry(t).or_default() += 1,
            None => aggregate.other += 1,
        }

        records.push(CellDetection {
            cell_type: label,
            confidence: det.confidence,
            bounding_box: BoundingBox {
                x_min,
                y_min,
                x_max,
                y_max,
            },
        });
    }

    for group in subgroups {
        let total = group.members.iter().map(|t| aggregate.count(*t)).sum();
        aggregate.subtotals.insert(group.name, total);
    }

    Ok((records, aggregate))
}
