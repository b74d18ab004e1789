use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::cell_type::LabelMap;
use crate::config::Settings;
use crate::model_registry::{ModelLoader, ModelManager};

/// 全局共享状态：
/// - settings: 启动时读好的配置
/// - models: 共享的检测模型句柄
/// - label_map: 原始类别名 -> 标准类别
/// - semaphore: 控制最多 N 个并发推理任务
pub struct AppState {
    pub settings: Arc<Settings>,
    pub models: Arc<ModelManager>,
    pub label_map: LabelMap,
    pub semaphore: Arc<Semaphore>,
    pub max_concurrent_infer: usize,
}

impl AppState {
    pub fn new(settings: Settings, loader: Arc<dyn ModelLoader>) -> Arc<Self> {
        let max_concurrent_infer = settings.max_concurrent_infer;
        Arc::new(Self {
            settings: Arc::new(settings),
            models: Arc::new(ModelManager::new(loader)),
            label_map: LabelMap::standard(),
            semaphore: Arc::new(Semaphore::new(max_concurrent_infer)),
            max_concurrent_infer,
        })
    }
}
