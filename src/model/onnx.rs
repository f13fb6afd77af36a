// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/model/onnx.rs - ONNX YOLO 车牌检测器
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! # ONNX 检测模型
//!
//! 加载 Ultralytics 导出的 YOLOv8/YOLO11 检测模型（输出 `[1, 4 + nc, N]`）。
//!
//! ```text
//! onnx:///models/license_plate_detector.onnx?conf=0.15&imgsz=640
//! ```
//!
//! 类别名从模型元数据 `names` 读取，也可以用 `names=` 或 `classes=` 查询参数指定。

use std::path::PathBuf;
use std::time::Instant;

use image::{Rgb, RgbImage, imageops};
use ort::session::Session;
use ort::value::Tensor;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::{DetectItem, DetectResult, DetectorConfig, Model, TargetClasses, parse_class_names};
use crate::{FromUrlWithScheme, bbox::RawBox, frame::Frame, url_to_path};

#[derive(Error, Debug)]
pub enum OnnxModelError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("模型文件不存在: {0}")]
  ModelNotFound(PathBuf),
  #[error("无效的模型路径")]
  InvalidPath(#[from] std::string::FromUtf8Error),
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(#[from] ort::Error),
  #[error("配置错误: {0}")]
  ConfigError(#[from] super::ConfigError),
  #[error("模型没有输出")]
  NoOutput,
  #[error("不支持的输出形状: {0:?}")]
  UnsupportedOutputShape(Vec<i64>),
}

const ONNX_MODEL_SCHEME: &str = "onnx";
const LETTERBOX_FILL: u8 = 114;

pub struct OnnxModel {
  session: Session,
  input_name: String,
  config: DetectorConfig,
  targets: TargetClasses,
}

impl OnnxModel {
  pub fn load(url: &Url, config: DetectorConfig) -> Result<Self, OnnxModelError> {
    if url.scheme() != ONNX_MODEL_SCHEME {
      return Err(OnnxModelError::SchemeMismatch);
    }

    let path = url_to_path(url)?;
    if !path.is_file() {
      return Err(OnnxModelError::ModelNotFound(path));
    }

    info!("正在加载 ONNX 模型: {}", path.display());
    let session = Session::builder()?.commit_from_file(&path)?;

    let model_names = {
      let metadata = session.metadata()?;
      metadata
        .custom("names")?
        .map(|text| parse_class_names(&text))
        .unwrap_or_default()
    };
    info!("模型类别: {:?}", model_names);

    let targets = config.target_classes(&model_names);
    info!("目标类别: {:?}", targets.ids().collect::<Vec<_>>());

    let input_name = session
      .inputs
      .first()
      .map(|input| input.name.clone())
      .unwrap_or_else(|| "images".to_string());

    Ok(Self {
      session,
      input_name,
      config,
      targets,
    })
  }

  pub fn targets(&self) -> &TargetClasses {
    &self.targets
  }
}

impl FromUrlWithScheme for OnnxModel {
  const SCHEME: &'static str = ONNX_MODEL_SCHEME;
}

impl crate::FromUrl for OnnxModel {
  type Error = OnnxModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let config = DetectorConfig::default().apply_query(url)?;
    Self::load(url, config)
  }
}

/// 等比缩放并填充到 `size`×`size`
struct Letterbox {
  scale: f32,
  pad_x: f32,
  pad_y: f32,
}

fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
  let (w, h) = image.dimensions();
  let scale = (size as f32 / w as f32).min(size as f32 / h as f32);
  let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
  let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);

  let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);
  let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
  let pad_x = (size - new_w) / 2;
  let pad_y = (size - new_h) / 2;
  imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

  (
    canvas,
    Letterbox {
      scale,
      pad_x: pad_x as f32,
      pad_y: pad_y as f32,
    },
  )
}

fn to_nchw(image: &RgbImage) -> Vec<f32> {
  let (w, h) = image.dimensions();
  let plane = (w * h) as usize;
  let mut data = vec![0f32; 3 * plane];
  for (i, pixel) in image.pixels().enumerate() {
    data[i] = pixel[0] as f32 / 255.0;
    data[plane + i] = pixel[1] as f32 / 255.0;
    data[2 * plane + i] = pixel[2] as f32 / 255.0;
  }
  data
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
  x1: f32,
  y1: f32,
  x2: f32,
  y2: f32,
  score: f32,
  class_id: u32,
}

impl Candidate {
  fn iou(&self, other: &Candidate) -> f32 {
    let ix1 = self.x1.max(other.x1);
    let iy1 = self.y1.max(other.y1);
    let ix2 = self.x2.min(other.x2);
    let iy2 = self.y2.min(other.y2);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    if inter == 0.0 {
      return 0.0;
    }
    let area_a = (self.x2 - self.x1) * (self.y2 - self.y1);
    let area_b = (other.x2 - other.x1) * (other.y2 - other.y1);
    inter / (area_a + area_b - inter)
  }
}

/// 按类别做非极大值抑制
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
  let mut keep: Vec<Candidate> = Vec::new();
  for c in candidates {
    if keep
      .iter()
      .all(|k| k.class_id != c.class_id || k.iou(&c) < iou_threshold)
    {
      keep.push(c);
    }
  }
  keep
}

/// 解码 `[1, 4 + nc, N]`（或转置的 `[1, N, 4 + nc]`）输出
fn decode(
  dims: &[i64],
  data: &[f32],
  targets: &TargetClasses,
  confidence: f32,
  lb: &Letterbox,
) -> Result<Vec<Candidate>, OnnxModelError> {
  let [_, a, b] = dims else {
    return Err(OnnxModelError::UnsupportedOutputShape(dims.to_vec()));
  };
  let (a, b) = (*a as usize, *b as usize);
  let channel_major = a < b;
  let (channels, proposals) = if channel_major { (a, b) } else { (b, a) };
  if channels <= 4 || data.len() < channels * proposals {
    return Err(OnnxModelError::UnsupportedOutputShape(dims.to_vec()));
  }

  let at = |c: usize, i: usize| {
    if channel_major {
      data[c * proposals + i]
    } else {
      data[i * channels + c]
    }
  };

  let mut candidates = Vec::new();
  for i in 0..proposals {
    let (mut best_class, mut best_score) = (0usize, f32::MIN);
    for c in 4..channels {
      let s = at(c, i);
      if s > best_score {
        best_score = s;
        best_class = c - 4;
      }
    }
    if best_score < confidence || !targets.contains(best_class as u32) {
      continue;
    }

    let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
    candidates.push(Candidate {
      x1: (cx - w / 2.0 - lb.pad_x) / lb.scale,
      y1: (cy - h / 2.0 - lb.pad_y) / lb.scale,
      x2: (cx + w / 2.0 - lb.pad_x) / lb.scale,
      y2: (cy + h / 2.0 - lb.pad_y) / lb.scale,
      score: best_score,
      class_id: best_class as u32,
    });
  }
  Ok(candidates)
}

impl Model for OnnxModel {
  type Error = OnnxModelError;

  fn infer(&mut self, frame: &Frame) -> Result<DetectResult, Self::Error> {
    if self.targets.is_empty() {
      return Ok(DetectResult::empty());
    }

    let start = Instant::now();
    let size = self.config.imgsz;
    let (input, lb) = letterbox(&frame.image, size);
    let shape = [1usize, 3, size as usize, size as usize];
    let tensor = Tensor::from_array((shape, to_nchw(&input).into_boxed_slice()))?;

    let outputs = self
      .session
      .run(ort::inputs![self.input_name.as_str() => tensor])?;
    let (_, output) = outputs.iter().next().ok_or(OnnxModelError::NoOutput)?;
    let (out_shape, data) = output.try_extract_tensor::<f32>()?;
    let dims: Vec<i64> = out_shape.iter().copied().collect();

    let candidates = decode(&dims, data, &self.targets, self.config.confidence, &lb)?;
    let kept = nms(candidates, self.config.iou);

    debug!(
      frame = frame.index,
      detections = kept.len(),
      elapsed = ?start.elapsed(),
      "ONNX 推理完成"
    );

    let items: Vec<DetectItem> = kept
      .into_iter()
      .map(|c| DetectItem {
        class_id: c.class_id,
        score: c.score,
        bbox: RawBox::from_f32_outward(c.x1, c.y1, c.x2, c.y2),
        track_id: None,
      })
      .collect();
    Ok(items.into())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn identity_box() -> Letterbox {
    Letterbox {
      scale: 1.0,
      pad_x: 0.0,
      pad_y: 0.0,
    }
  }

  #[test]
  fn letterbox_keeps_aspect_ratio() {
    let image = RgbImage::new(1280, 720);
    let (canvas, lb) = letterbox(&image, 640);
    assert_eq!(canvas.dimensions(), (640, 640));
    assert_eq!(lb.scale, 0.5);
    assert_eq!(lb.pad_x, 0.0);
    assert_eq!(lb.pad_y, 140.0);
    assert_eq!(canvas.get_pixel(0, 0), &Rgb([LETTERBOX_FILL; 3]));
  }

  #[test]
  fn decodes_channel_major_output_for_target_classes() {
    // 2 个类别、3 个候选框，布局 [1, 6, 3]
    let proposals = 3;
    #[rustfmt::skip]
    let data = vec![
      50.0, 10.0, 200.0,  // cx
      50.0, 10.0, 200.0,  // cy
      20.0,  4.0,  40.0,  // w
      10.0,  4.0,  40.0,  // h
       0.9,  0.1,   0.05, // class 0 (plate)
       0.1,  0.8,   0.95, // class 1 (car)
    ];
    let targets = TargetClasses::from_ids([0]);
    let out = decode(&[1, 6, proposals], &data, &targets, 0.15, &identity_box()).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!((out[0].x1, out[0].y1, out[0].x2, out[0].y2), (40.0, 45.0, 60.0, 55.0));
  }

  #[test]
  fn decode_maps_back_through_letterbox() {
    let data = vec![320.0, 320.0, 100.0, 50.0, 0.9];
    let lb = Letterbox {
      scale: 0.5,
      pad_x: 0.0,
      pad_y: 140.0,
    };
    let out = decode(&[1, 5, 1], &data, &TargetClasses::from_ids([0]), 0.5, &lb).unwrap();
    assert_eq!(out[0].x1, 540.0);
    assert_eq!(out[0].y1, 310.0);
    assert_eq!(out[0].x2, 740.0);
    assert_eq!(out[0].y2, 410.0);
  }

  #[test]
  fn nms_suppresses_overlaps_within_class() {
    let c = |x: f32, score: f32, class_id: u32| Candidate {
      x1: x,
      y1: 0.0,
      x2: x + 10.0,
      y2: 10.0,
      score,
      class_id,
    };
    let kept = nms(vec![c(0.0, 0.6, 0), c(1.0, 0.9, 0), c(1.0, 0.5, 1), c(50.0, 0.4, 0)], 0.45);
    assert_eq!(kept.len(), 3);
    assert_eq!(kept[0].score, 0.9);
  }

  #[test]
  fn rejects_unexpected_shapes() {
    let targets = TargetClasses::from_ids([0]);
    assert!(decode(&[1, 3], &[0.0; 3], &targets, 0.1, &identity_box()).is_err());
    assert!(decode(&[1, 4, 10], &[0.0; 40], &targets, 0.1, &identity_box()).is_err());
  }
}
