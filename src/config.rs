use std::path::PathBuf;

use rocket::figment::providers::{Env, Format, Serialized, Toml};
use rocket::figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{ClassNames, DetectParams};
use crate::model_registry::ModelSource;
use crate::yolo::YoloConfig;

pub const CONFIG_FILE: &str = "CellCount.toml";
pub const ENV_PREFIX: &str = "CELLCOUNT_";
/// 默认从本地读 ONNX 导出；置空后改走 hub
pub const DEFAULT_MODEL_PATH: &str = "models/best.onnx";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings: {0}")]
    Figment(#[from] rocket::figment::Error),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 进程级配置，启动时读一次，之后只读
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app_name: String,
    pub app_version: String,
    pub debug: bool,

    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,

    /// Hugging Face 仓库名，`model_path` 为空时使用
    pub model_name: String,
    /// 仓库里的 ONNX 文件名
    pub model_file: String,
    /// 本地 ONNX 模型文件；为空时从 hub 下载
    pub model_path: Option<PathBuf>,
    /// 覆盖模型 metadata 里的类别表
    pub class_names: Option<Vec<String>>,
    pub model_confidence_threshold: f32,
    pub model_iou_threshold: f32,
    pub input_size: u32,
    pub max_detections: usize,
    pub intra_threads: usize,

    pub max_concurrent_infer: usize,
    pub inference_timeout_secs: u64,
    pub max_upload_mib: u64,
    pub preload_model: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "CellCount API".to_string(),
            app_version: "0.1.0".to_string(),
            debug: false,
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
            model_name: "keremberke/yolov8s-blood-cell-detection".to_string(),
            model_file: "best.onnx".to_string(),
            model_path: Some(PathBuf::from(DEFAULT_MODEL_PATH)),
            class_names: None,
            model_confidence_threshold: 0.1,
            model_iou_threshold: 0.45,
            input_size: 640,
            max_detections: 300,
            intra_threads: 4,
            max_concurrent_infer: 2,
            inference_timeout_secs: 30,
            max_upload_mib: 20,
            preload_model: true,
        }
    }
}

impl Settings {
    /// 默认值 <- CellCount.toml <- CELLCOUNT_* 环境变量
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment())
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("model_confidence_threshold", self.model_confidence_threshold)?;
        check_unit("model_iou_threshold", self.model_iou_threshold)?;
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return Err(ConfigError::Invalid {
                field: "input_size",
                reason: format!("{} is not a positive multiple of 32", self.input_size),
            });
        }
        if self.max_concurrent_infer == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_infer",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.inference_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "inference_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.local_model_path().is_none() && self.model_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "model_name",
                reason: "either model_name or model_path is required".to_string(),
            });
        }
        Ok(())
    }

    pub fn detect_params(&self) -> DetectParams {
        DetectParams {
            confidence_threshold: self.model_confidence_threshold,
            iou_threshold: self.model_iou_threshold,
        }
    }

    pub fn yolo_config(&self) -> YoloConfig {
        YoloConfig {
            input_size: self.input_size,
            max_detections: self.max_detections,
            intra_threads: self.intra_threads,
        }
    }

    fn local_model_path(&self) -> Option<&PathBuf> {
        self.model_path
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn model_source(&self) -> ModelSource {
        match self.local_model_path() {
            Some(path) => ModelSource::Local(path.clone()),
            None => ModelSource::Hub {
                repo: self.model_name.clone(),
                file: self.model_file.clone(),
            },
        }
    }

    pub fn class_names_override(&self) -> Option<ClassNames> {
        self.class_names
            .as_ref()
            .map(|names| ClassNames::from_list(names.iter().cloned()))
    }
}

fn check_unit(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{value} is outside [0, 1]"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(key: &str, value: impl Serialize) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Serialized::default(key, value))
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::from_figment(&Figment::from(Serialized::defaults(
            Settings::default(),
        )))
        .unwrap();
        assert_eq!(settings.model_confidence_threshold, 0.1);
        assert_eq!(settings.model_iou_threshold, 0.45);
        assert_eq!(settings.cors_origins.len(), 2);
        assert_eq!(
            settings.model_source(),
            ModelSource::Local(PathBuf::from(DEFAULT_MODEL_PATH))
        );
    }

    #[test]
    fn empty_model_path_falls_back_to_hub() {
        let settings = Settings::from_figment(&with("model_path", "")).unwrap();
        assert_eq!(
            settings.model_source(),
            ModelSource::Hub {
                repo: "keremberke/yolov8s-blood-cell-detection".to_string(),
                file: "best.onnx".to_string(),
            }
        );
    }

    #[test]
    fn hub_needs_a_repo_name() {
        let figment = with("model_path", "").merge(Serialized::default("model_name", " "));
        let err = Settings::from_figment(&figment).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "model_name",
                ..
            }
        ));
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let settings = Settings::from_figment(&with("model_confidence_threshold", 0.3)).unwrap();
        assert_eq!(settings.detect_params().confidence_threshold, 0.3);
        assert_eq!(settings.detect_params().iou_threshold, 0.45);
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let err = Settings::from_figment(&with("model_iou_threshold", 1.5)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "model_iou_threshold",
                ..
            }
        ));
    }

    #[test]
    fn input_size_must_be_stride_aligned() {
        assert!(Settings::from_figment(&with("input_size", 600)).is_err());
        assert!(Settings::from_figment(&with("input_size", 320)).is_ok());
    }

    #[test]
    fn local_path_overrides_hub() {
        let settings = Settings::from_figment(&with("model_path", "/models/cells.onnx")).unwrap();
        match settings.model_source() {
            ModelSource::Local(path) => assert_eq!(path, PathBuf::from("/models/cells.onnx")),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn class_names_override_keeps_order() {
        let settings =
            Settings::from_figment(&with("class_names", vec!["RBC", "WBC", "Platelets"])).unwrap();
        let names = settings.class_names_override().unwrap();
        assert_eq!(names.get(1), Some("WBC"));
    }

    #[test]
    fn bad_type_is_a_figment_error() {
        let err = Settings::from_figment(&with("port", "not-a-port")).unwrap_err();
        assert!(matches!(err, ConfigError::Figment(_)));
    }
}
