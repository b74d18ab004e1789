use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, bail, Context, Result};
use hf_hub::api::sync::Api;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::engine::{ClassNames, Detector};
use crate::yolo::{OnnxDetector, YoloConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub status: ModelStatus,
    pub last_updated: Option<SystemTime>,
}

impl ModelMetadata {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ModelStatus::Unloaded,
            last_updated: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to load model '{model}': {cause:#}")]
    Load { model: String, cause: anyhow::Error },
}

/// 只能跑 ONNX；ultralytics 的 .pt 权重要先导出
pub const ONNX_HINT: &str =
    "an ONNX export of the YOLOv8 checkpoint is required, e.g. `yolo export model=best.pt format=onnx`";

/// 模型权重从哪来
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub { repo: String, file: String },
}

impl ModelSource {
    pub fn id(&self) -> String {
        match self {
            ModelSource::Local(path) => path.display().to_string(),
            ModelSource::Hub { repo, .. } => repo.clone(),
        }
    }

    /// 本地路径直接用；hub 上的文件由 hf-hub 下载并缓存
    pub fn resolve(&self) -> Result<PathBuf> {
        match self {
            ModelSource::Local(path) => {
                if !path.exists() {
                    bail!(
                        "model file not found: {} ({ONNX_HINT})",
                        path.display()
                    );
                }
                Ok(path.clone())
            }
            ModelSource::Hub { repo, file } => {
                let api = Api::new().context("Failed to create Hugging Face Hub client")?;
                let path = api
                    .model(repo.clone())
                    .get(file)
                    .with_context(|| {
                        format!("Failed to download {file} from {repo} ({ONNX_HINT})")
                    })?;
                info!("Model downloaded to: {}", path.display());
                Ok(path)
            }
        }
    }
}

/// 真正把模型造出来的那一步；测试里换成 stub
pub trait ModelLoader: Send + Sync {
    fn model_id(&self) -> String;

    /// 阻塞调用（下载 + 建 session），在阻塞线程池里执行
    fn load(&self) -> Result<Arc<dyn Detector>>;
}

pub struct HubModelLoader {
    source: ModelSource,
    config: YoloConfig,
    class_names: Option<ClassNames>,
}

impl HubModelLoader {
    pub fn new(source: ModelSource, config: YoloConfig, class_names: Option<ClassNames>) -> Self {
        Self {
            source,
            config,
            class_names,
        }
    }
}

impl ModelLoader for HubModelLoader {
    fn model_id(&self) -> String {
        self.source.id()
    }

    fn load(&self) -> Result<Arc<dyn Detector>> {
        let path = self.source.resolve()?;
        let detector = OnnxDetector::from_file(&path, self.config, self.class_names.clone())
            .context(ONNX_HINT)?;
        Ok(Arc::new(detector))
    }
}

/// 共享的模型句柄：第一次用到时加载，之后所有请求复用，关停时释放。
/// 加载 / 卸载互斥；已加载的句柄本身可以并发拿去推理。
pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    detector: Arc<RwLock<Option<Arc<dyn Detector>>>>,
    transition: Arc<Mutex<()>>,
    metadata: Arc<RwLock<ModelMetadata>>,
}

impl ModelManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        let metadata = ModelMetadata::new(&loader.model_id());
        Self {
            loader,
            detector: Arc::new(RwLock::new(None)),
            transition: Arc::new(Mutex::new(())),
            metadata: Arc::new(RwLock::new(metadata)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.detector.read().is_some()
    }

    pub fn metadata(&self) -> ModelMetadata {
        self.metadata.read().clone()
    }

    /// 已加载的句柄（不触发加载）
    pub fn current(&self) -> Option<Arc<dyn Detector>> {
        self.detector.read().clone()
    }

    /// 拿到检测器，必要时加载。失败不重试，下一次调用会重新尝试。
    ///
    /// 加载放在独立任务里跑，并由它持有切换锁：调用方中途放弃（超时、断连）
    /// 时加载照样完成，结果和状态照样落下。
    pub async fn get_handle(&self) -> Result<Arc<dyn Detector>, ModelError> {
        if let Some(detector) = self.current() {
            return Ok(detector);
        }

        let guard = self.transition.clone().lock_owned().await;
        // 等锁期间可能已经有人加载完了
        if let Some(detector) = self.current() {
            return Ok(detector);
        }

        let model = self.loader.model_id();
        info!("Loading model: {}", model);
        set_status(&self.metadata, ModelStatus::Loading);

        let loader = self.loader.clone();
        let slot = self.detector.clone();
        let metadata = self.metadata.clone();
        let task_model = model.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let loaded = tokio::task::spawn_blocking(move || loader.load())
                .await
                .map_err(|e| anyhow!("model loading task failed: {e}"))
                .and_then(|r| r);

            match loaded {
                Ok(detector) => {
                    *slot.write() = Some(detector.clone());
                    set_status(&metadata, ModelStatus::Loaded);
                    info!("Model loaded successfully");
                    Ok(detector)
                }
                Err(cause) => {
                    set_status(&metadata, ModelStatus::Error);
                    error!("Failed to load model: {cause:#}");
                    Err(ModelError::Load {
                        model: task_model,
                        cause,
                    })
                }
            }
        });

        task.await.map_err(|e| {
            set_status(&self.metadata, ModelStatus::Error);
            ModelError::Load {
                model,
                cause: anyhow!("model loading task failed: {e}"),
            }
        })?
    }

    /// 释放模型，下次 get_handle 会重新加载
    pub async fn release(&self) {
        let _guard = self.transition.lock().await;
        if self.detector.write().take().is_some() {
            info!("Model unloaded");
        }
        set_status(&self.metadata, ModelStatus::Unloaded);
    }
}

fn set_status(metadata: &RwLock<ModelMetadata>, status: ModelStatus) {
    let mut meta = metadata.write();
    meta.status = status;
    meta.last_updated = Some(SystemTime::now());
}
