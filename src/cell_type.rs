use std::fmt;

use serde::{Serialize, Serializer};

/// 标准化后的细胞类别（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CellType {
    Rbc,
    Platelets,
    Neutrophil,
    Lymphocyte,
    Monocyte,
    Eosinophil,
    Basophil,
    /// 旧模型只输出笼统的 WBC，不区分亚型
    Wbc,
}

impl CellType {
    pub const ALL: [CellType; 8] = [
        CellType::Rbc,
        CellType::Platelets,
        CellType::Neutrophil,
        CellType::Lymphocyte,
        CellType::Monocyte,
        CellType::Eosinophil,
        CellType::Basophil,
        CellType::Wbc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CellType::Rbc => "RBC",
            CellType::Platelets => "Platelets",
            CellType::Neutrophil => "Neutrophil",
            CellType::Lymphocyte => "Lymphocyte",
            CellType::Monocyte => "Monocyte",
            CellType::Eosinophil => "Eosinophil",
            CellType::Basophil => "Basophil",
            CellType::Wbc => "WBC",
        }
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个检测框最终携带的标签：要么落在封闭集合里，要么原样透传
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellLabel {
    Known(CellType),
    Other(String),
}

impl CellLabel {
    pub fn as_str(&self) -> &str {
        match self {
            CellLabel::Known(t) => t.as_str(),
            CellLabel::Other(raw) => raw,
        }
    }

    pub fn cell_type(&self) -> Option<CellType> {
        match self {
            CellLabel::Known(t) => Some(*t),
            CellLabel::Other(_) => None,
        }
    }
}

impl fmt::Display for CellLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CellLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// 模型原始类别名 -> 标准类别。
/// 覆盖大小写变体和模型里的缩写（PLT / NEUT / LYMPH ...）。
pub const STANDARD_LABELS: &[(&str, CellType)] = &[
    ("RBC", CellType::Rbc),
    ("rbc", CellType::Rbc),
    ("Red Blood Cell", CellType::Rbc),
    ("PLT", CellType::Platelets),
    ("Platelets", CellType::Platelets),
    ("platelets", CellType::Platelets),
    ("platelet", CellType::Platelets),
    ("NEUT", CellType::Neutrophil),
    ("Neutrophil", CellType::Neutrophil),
    ("neutrophil", CellType::Neutrophil),
    ("LYMPH", CellType::Lymphocyte),
    ("Lymphocyte", CellType::Lymphocyte),
    ("lymphocyte", CellType::Lymphocyte),
    ("MONO", CellType::Monocyte),
    ("Monocyte", CellType::Monocyte),
    ("monocyte", CellType::Monocyte),
    ("EOS", CellType::Eosinophil),
    ("Eosinophil", CellType::Eosinophil),
    ("eosinophil", CellType::Eosinophil),
    ("BASO", CellType::Basophil),
    ("Basophil", CellType::Basophil),
    ("basophil", CellType::Basophil),
    ("WBC", CellType::Wbc),
    ("wbc", CellType::Wbc),
    ("White Blood Cell", CellType::Wbc),
];

/// 只读的标签映射表。
/// 查不到的名字不会被丢弃，而是以 `CellLabel::Other` 原样透传。
#[derive(Debug, Clone, Copy)]
pub struct LabelMap {
    entries: &'static [(&'static str, CellType)],
}

impl LabelMap {
    pub const fn new(entries: &'static [(&'static str, CellType)]) -> Self {
        Self { entries }
    }

    pub const fn standard() -> Self {
        Self::new(STANDARD_LABELS)
    }

    pub fn lookup(&self, raw: &str) -> Option<CellType> {
        self.entries
            .iter()
            .find(|(name, _)| *name == raw)
            .map(|(_, t)| *t)
    }

    pub fn resolve(&self, raw: &str) -> CellLabel {
        match self.lookup(raw) {
            Some(t) => CellLabel::Known(t),
            None => CellLabel::Other(raw.to_string()),
        }
    }
}

impl Default for LabelMap {
    fn default() -> Self {
        Self::standard()
    }
}

/// 派生小计：把若干成员类别的计数加总成一个父类计数
#[derive(Debug, Clone, Copy)]
pub struct Subgroup {
    pub name: &'static str,
    pub members: &'static [CellType],
}

/// WBC 总数 = 五种亚型 + 未分型 WBC
pub const WBC_SUBGROUP: Subgroup = Subgroup {
    name: "total_wbc",
    members: &[
        CellType::Neutrophil,
        CellType::Lymphocyte,
        CellType::Monocyte,
        CellType::Eosinophil,
        CellType::Basophil,
        CellType::Wbc,
    ],
};
