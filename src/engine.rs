use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use serde::Serialize;

/// 推理时的调参
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

/// 模型吐出的一个原始检测框，坐标是原图像素坐标 (x_min, y_min, x_max, y_max)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// 模型自带的 class id -> 原始类别名
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ClassNames(BTreeMap<usize, String>);

impl ClassNames {
    pub fn from_list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).enumerate().collect())
    }

    pub fn get(&self, class_id: usize) -> Option<&str> {
        self.0.get(&class_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 解析 ultralytics 导出 ONNX 时写进 metadata 的 `names`，
    /// 形如 `{0: 'RBC', 1: 'WBC', 2: 'Platelets'}`。
    pub fn parse_ultralytics(raw: &str) -> Result<Self> {
        let body = raw
            .trim()
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .with_context(|| format!("class names are not a dict literal: {raw}"))?;

        let mut names = BTreeMap::new();
        let mut rest = body.trim_start();
        while !rest.is_empty() {
            let colon = rest
                .find(':')
                .with_context(|| format!("missing ':' in class names near `{rest}`"))?;
            let id: usize = rest[..colon]
                .trim()
                .parse()
                .with_context(|| format!("invalid class id `{}`", rest[..colon].trim()))?;

            rest = rest[colon + 1..].trim_start();
            let quote = match rest.chars().next() {
                Some(q @ ('\'' | '"')) => q,
                _ => bail!("class name for id {id} is not quoted"),
            };
            let end = rest[1..]
                .find(quote)
                .with_context(|| format!("unterminated class name for id {id}"))?;
            names.insert(id, rest[1..1 + end].to_string());

            rest = rest[end + 2..].trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        }

        if names.is_empty() {
            bail!("class names are empty");
        }
        Ok(Self(names))
    }
}

/// 统一的检测引擎抽象
#[async_trait]
pub trait Detector: Send + Sync {
    /// 模型的类别表
    fn class_names(&self) -> &ClassNames;

    /// 对一张已解码的图片跑一次检测
    async fn detect(
        &self,
        image: Arc<DynamicImage>,
        params: DetectParams,
    ) -> Result<Vec<RawDetection>>;
}
