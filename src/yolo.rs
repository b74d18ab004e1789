use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use ndarray::{s, Array4, ArrayView2, ArrayViewD, Axis, Ix3};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::engine::{ClassNames, DetectParams, Detector, RawDetection};

/// ultralytics letterbox 的填充灰度
const PAD_VALUE: u8 = 114;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YoloConfig {
    /// 方形输入边长，YOLOv8 默认 640
    pub input_size: u32,
    pub max_detections: usize,
    pub intra_threads: usize,
}

impl Default for YoloConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            max_detections: 300,
            intra_threads: 4,
        }
    }
}

/// letterbox 之后的输入张量，以及把框映射回原图所需的参数
#[derive(Debug)]
pub struct Letterbox {
    pub tensor: Array4<f32>,
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_width: u32,
    pub orig_height: u32,
}

impl Letterbox {
    /// 输入张量坐标系下的 (cx, cy, w, h) -> 原图 (x_min, y_min, x_max, y_max)，并裁剪到图内
    pub fn unmap(&self, cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
        let max_x = self.orig_width as f32;
        let max_y = self.orig_height as f32;
        let x_min = ((cx - w / 2.0 - self.pad_x) / self.scale).clamp(0.0, max_x);
        let y_min = ((cy - h / 2.0 - self.pad_y) / self.scale).clamp(0.0, max_y);
        let x_max = ((cx + w / 2.0 - self.pad_x) / self.scale).clamp(0.0, max_x);
        let y_max = ((cy + h / 2.0 - self.pad_y) / self.scale).clamp(0.0, max_y);
        [x_min, y_min, x_max, y_max]
    }
}

/// 等比缩放 + 居中填充到 size x size，输出 NCHW、归一化到 [0,1]
pub fn letterbox(image: &DynamicImage, size: u32) -> Letterbox {
    let (orig_width, orig_height) = image.dimensions();
    let scale = (size as f32 / orig_width as f32).min(size as f32 / orig_height as f32);
    let new_width = ((orig_width as f32 * scale).round() as u32).clamp(1, size);
    let new_height = ((orig_height as f32 * scale).round() as u32).clamp(1, size);

    let resized = imageops::resize(&image.to_rgb8(), new_width, new_height, FilterType::Triangle);

    let pad_x = (size - new_width) as f32 / 2.0;
    let pad_y = (size - new_height) as f32 / 2.0;
    let left = (pad_x - 0.1).round().max(0.0) as i64;
    let top = (pad_y - 0.1).round().max(0.0) as i64;

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
    imageops::overlay(&mut canvas, &resized, left, top);

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }

    Letterbox {
        tensor,
        scale,
        pad_x: left as f32,
        pad_y: top as f32,
        orig_width,
        orig_height,
    }
}

/// 两个 xyxy 框的 IoU
pub fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// 按类别分别做 NMS，结果按置信度降序，最多保留 `max_detections` 个
pub fn non_maximum_suppression(
    mut candidates: Vec<RawDetection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<RawDetection> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id
                && compute_iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// 解析 YOLOv8 输出 `[1, 4 + nc, anchors]`（也接受转置后的 `[1, anchors, 4 + nc]`）
pub fn decode_predictions(
    output: ArrayViewD<'_, f32>,
    letterbox: &Letterbox,
    params: DetectParams,
    max_detections: usize,
) -> Result<Vec<RawDetection>> {
    let output = output
        .into_dimensionality::<Ix3>()
        .map_err(|e| anyhow!("unexpected YOLO output rank: {e}"))?;
    if output.shape()[0] != 1 {
        bail!("expected batch size 1, got {:?}", output.shape());
    }
    let mut preds: ArrayView2<'_, f32> = output.index_axis_move(Axis(0), 0);
    if preds.shape()[0] > preds.shape()[1] {
        preds = preds.reversed_axes();
    }
    if preds.shape()[0] <= 4 {
        bail!("YOLO output has no class scores: {:?}", preds.shape());
    }

    let mut candidates = Vec::new();
    for anchor in preds.axis_iter(Axis(1)) {
        let scores = anchor.slice(s![4..]);
        let (class_id, confidence) = scores
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, v)| {
                if v > best.1 {
                    (i, v)
                } else {
                    best
                }
            });
        if confidence <= params.confidence_threshold {
            continue;
        }
        let bbox = letterbox.unmap(anchor[0], anchor[1], anchor[2], anchor[3]);
        candidates.push(RawDetection {
            class_id,
            confidence,
            bbox,
        });
    }

    debug!(candidates = candidates.len(), "YOLO candidates above threshold");
    Ok(non_maximum_suppression(
        candidates,
        params.iou_threshold,
        max_detections,
    ))
}

/// ONNX Runtime 上的 YOLOv8 检测器
pub struct OnnxDetector {
    /// Session::run 需要 &mut，推理在锁内串行
    session: Arc<Mutex<Session>>,
    input_name: String,
    class_names: ClassNames,
    config: YoloConfig,
}

impl std::fmt::Debug for OnnxDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxDetector")
            .field("input_name", &self.input_name)
            .field("class_names", &self.class_names)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OnnxDetector {
    /// 从 ONNX 文件建 session。`class_names` 为空时读取模型 metadata 里的 `names`。
    pub fn from_file(
        model_path: &Path,
        config: YoloConfig,
        class_names: Option<ClassNames>,
    ) -> Result<Self> {
        if !model_path.exists() {
            bail!("model checkpoint not found: {}", model_path.display());
        }

        info!("Loading YOLO model from {}", model_path.display());
        let session = Session::builder()
            .context("Failed to create session builder")?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .context("Failed to set CPU execution provider")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("Failed to set optimization level")?
            .with_intra_threads(config.intra_threads)
            .context("Failed to set intra threads")?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load model from {}", model_path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "images".to_string());

        let class_names = match class_names {
            Some(names) => names,
            None => embedded_class_names(&session)?,
        };
        if class_names.is_empty() {
            bail!("model has no class names");
        }

        info!(
            input = %input_name,
            classes = class_names.len(),
            "YOLO model loaded"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            input_name,
            class_names,
            config,
        })
    }
}

fn embedded_class_names(session: &Session) -> Result<ClassNames> {
    let metadata = session
        .metadata()
        .context("Failed to read model metadata")?;
    let raw = metadata
        .custom("names")
        .context("Failed to read `names` from model metadata")?
        .ok_or_else(|| anyhow!("model metadata has no `names`; configure class_names"))?;
    ClassNames::parse_ultralytics(&raw)
}

fn run_session(
    session: &Mutex<Session>,
    input_name: &str,
    image: &DynamicImage,
    config: YoloConfig,
    params: DetectParams,
) -> Result<Vec<RawDetection>> {
    let letterbox = letterbox(image, config.input_size);
    let input = Tensor::from_array(letterbox.tensor.clone())
        .context("Failed to create input tensor")?;

    let mut session = session.lock();
    let outputs = session
        .run(ort::inputs![input_name => input])
        .context("YOLO inference failed")?;
    let output = outputs[0]
        .try_extract_array::<f32>()
        .context("Failed to extract output tensor")?;

    let detections = decode_predictions(output.view(), &letterbox, params, config.max_detections)?;
    Ok(detections)
}

#[async_trait]
impl Detector for OnnxDetector {
    fn class_names(&self) -> &ClassNames {
        &self.class_names
    }

    async fn detect(
        &self,
        image: Arc<DynamicImage>,
        params: DetectParams,
    ) -> Result<Vec<RawDetection>> {
        let session = self.session.clone();
        let input_name = self.input_name.clone();
        let config = self.config;

        // 推理是 CPU 密集的同步调用，放到阻塞线程池
        let detections = tokio::task::spawn_blocking(move || {
            run_session(&session, &input_name, &image, config, params)
        })
        .await??;
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    fn params(conf: f32, iou: f32) -> DetectParams {
        DetectParams {
            confidence_threshold: conf,
            iou_threshold: iou,
        }
    }

    #[test]
    fn letterbox_pads_wide_image_vertically() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([255, 0, 0])));
        let lb = letterbox(&image, 64);

        assert_eq!(lb.tensor.shape(), &[1, 3, 64, 64]);
        assert!((lb.scale - 0.32).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 16.0);
        // 顶部是填充色，中间是原图
        assert!((lb.tensor[[0, 0, 0, 10]] - 114.0 / 255.0).abs() < 1e-6);
        assert!((lb.tensor[[0, 0, 32, 10]] - 1.0).abs() < 1e-6);
        assert!(lb.tensor[[0, 1, 32, 10]].abs() < 1e-6);
    }

    #[test]
    fn unmap_undoes_letterbox_and_clips() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(200, 100));
        let lb = letterbox(&image, 64);

        // 原图 (50,25)-(100,75) 在输入里是 cx=24 cy=32 w=16 h=16
        let [x0, y0, x1, y1] = lb.unmap(24.0, 32.0, 16.0, 16.0);
        assert!((x0 - 50.0).abs() < 1e-3);
        assert!((y0 - 25.0).abs() < 1e-3);
        assert!((x1 - 100.0).abs() < 1e-3);
        assert!((y1 - 75.0).abs() < 1e-3);

        let [x0, y0, _, _] = lb.unmap(0.0, 0.0, 10.0, 10.0);
        assert_eq!((x0, y0), (0.0, 0.0));
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert_eq!(compute_iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        assert!((compute_iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((compute_iou(&a, &[5.0, 0.0, 15.0, 10.0]) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn nms_is_class_aware() {
        let boxes = vec![
            RawDetection { class_id: 0, confidence: 0.6, bbox: [0.0, 0.0, 10.0, 10.0] },
            RawDetection { class_id: 0, confidence: 0.9, bbox: [1.0, 1.0, 11.0, 11.0] },
            RawDetection { class_id: 1, confidence: 0.5, bbox: [0.0, 0.0, 10.0, 10.0] },
        ];
        let kept = non_maximum_suppression(boxes, 0.45, 300);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
    }

    #[test]
    fn nms_caps_detections() {
        let boxes = (0..10)
            .map(|i| RawDetection {
                class_id: 0,
                confidence: 0.5,
                bbox: [i as f32 * 20.0, 0.0, i as f32 * 20.0 + 10.0, 10.0],
            })
            .collect();
        assert_eq!(non_maximum_suppression(boxes, 0.45, 3).len(), 3);
    }

    #[test]
    fn decodes_channel_first_output() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(64, 64));
        let lb = letterbox(&image, 64);

        // 2 个类别，8 个 anchor，只填前 3 个
        let mut out = Array3::<f32>::zeros((1, 6, 8));
        // anchor 0: class 1, 0.8
        for (row, v) in [32.0, 32.0, 10.0, 10.0, 0.1, 0.8].iter().enumerate() {
            out[[0, row, 0]] = *v;
        }
        // anchor 1: 低于阈值
        for (row, v) in [10.0, 10.0, 4.0, 4.0, 0.05, 0.02].iter().enumerate() {
            out[[0, row, 1]] = *v;
        }
        // anchor 2: 与 anchor 0 重叠但类别不同
        for (row, v) in [33.0, 33.0, 10.0, 10.0, 0.7, 0.3].iter().enumerate() {
            out[[0, row, 2]] = *v;
        }

        let dets = decode_predictions(out.view().into_dyn(), &lb, params(0.1, 0.45), 300).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_id, 1);
        assert!((dets[0].confidence - 0.8).abs() < 1e-6);
        assert_eq!(dets[0].bbox, [27.0, 27.0, 37.0, 37.0]);
        assert_eq!(dets[1].class_id, 0);
    }

    #[test]
    fn decodes_transposed_output() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(64, 64));
        let lb = letterbox(&image, 64);

        let mut out = Array3::<f32>::zeros((1, 8, 5));
        out[[0, 3, 0]] = 20.0;
        out[[0, 3, 1]] = 20.0;
        out[[0, 3, 2]] = 8.0;
        out[[0, 3, 3]] = 8.0;
        out[[0, 3, 4]] = 0.9;

        let dets = decode_predictions(out.view().into_dyn(), &lb, params(0.25, 0.45), 300).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 0);
        assert_eq!(dets[0].bbox, [16.0, 16.0, 24.0, 24.0]);
    }

    #[test]
    fn rejects_output_without_scores() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let lb = letterbox(&image, 8);
        let out = Array3::<f32>::zeros((1, 4, 4));
        assert!(decode_predictions(out.view().into_dyn(), &lb, params(0.1, 0.45), 10).is_err());
    }
}
