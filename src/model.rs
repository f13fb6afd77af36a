// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/model.rs - 检测模型
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

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, bbox::RawBox, frame::Frame};

/// 检测模型
///
/// 每次调用只依据当前帧给出检测结果；跨帧身份（`track_id`）只是提示。
pub trait Model {
  type Error: std::error::Error + Send + Sync + 'static;

  fn infer(&mut self, frame: &Frame) -> Result<DetectResult, Self::Error>;
}

impl<M: Model + ?Sized> Model for Box<M> {
  type Error = M::Error;

  fn infer(&mut self, frame: &Frame) -> Result<DetectResult, Self::Error> {
    (**self).infer(frame)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  /// 帧像素坐标，可能越界
  pub bbox: RawBox,
  /// 跟踪器给出的身份，可能缺失
  pub track_id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 判定为车牌的类别名关键字（不区分大小写）
pub const PLATE_KEYWORDS: [&str; 2] = ["plate", "license"];

/// 需要遮蔽的类别集合
///
/// 在启动时解析一次。集合为空表示永远不会产生检测框。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetClasses {
  ids: BTreeSet<u32>,
}

impl TargetClasses {
  pub fn from_ids<I: IntoIterator<Item = u32>>(ids: I) -> Self {
    Self {
      ids: ids.into_iter().collect(),
    }
  }

  /// 根据模型类别名解析目标类别
  ///
  /// 名称中含有 [`PLATE_KEYWORDS`] 的类别都被选中；若没有匹配且模型只有一个
  /// 类别，则认为该类别就是车牌。
  pub fn resolve<S: AsRef<str>>(names: &[(u32, S)]) -> Self {
    let ids: BTreeSet<u32> = names
      .iter()
      .filter(|(_, name)| {
        let lower = name.as_ref().to_lowercase();
        PLATE_KEYWORDS.iter().any(|k| lower.contains(k))
      })
      .map(|(id, _)| *id)
      .collect();

    if !ids.is_empty() {
      return Self { ids };
    }

    match names {
      [(id, name)] => {
        info!("单类别模型，假定类别 {} ({}) 为车牌", id, name.as_ref());
        Self::from_ids([*id])
      }
      _ => {
        warn!("模型类别中没有车牌类别，不会产生任何遮蔽");
        Self::default()
      }
    }
  }

  pub fn contains(&self, id: u32) -> bool {
    self.ids.contains(&id)
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
    self.ids.iter().copied()
  }
}

/// 解析 Ultralytics 导出模型中的 `names` 元数据
///
/// 形如 `{0: 'license_plate', 1: 'car'}`，也接受 JSON 形式 `{"0": "plate"}`。
pub fn parse_class_names(text: &str) -> Vec<(u32, String)> {
  let mut names = Vec::new();
  let mut rest = text.trim().trim_start_matches('{').trim_end_matches('}');

  while let Some(colon) = rest.find(':') {
    let key = rest[..colon]
      .trim()
      .trim_start_matches(',')
      .trim()
      .trim_matches(|c| c == '"' || c == '\'');
    let value = rest[colon + 1..].trim_start();
    let Some(quote) = value.chars().next().filter(|c| *c == '\'' || *c == '"') else {
      break;
    };
    let body = &value[1..];
    let Some(end) = body.find(quote) else {
      break;
    };
    if let Ok(id) = key.parse::<u32>() {
      names.push((id, body[..end].to_string()));
    }
    rest = &body[end + 1..];
  }

  names
}

/// 检测配置
///
/// 来源优先级：命令行 > 模型 URL 查询参数 > 默认值。
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
  /// 置信度阈值 (0.0 - 1.0)
  pub confidence: f32,
  /// 推理输入边长（像素）
  pub imgsz: u32,
  /// NMS IOU 阈值
  pub iou: f32,
  /// 显式指定的目标类别，跳过类别名解析
  pub classes: Option<Vec<u32>>,
  /// 模型缺少元数据时使用的类别名（按序号）
  pub names: Option<Vec<String>>,
}

pub const DEFAULT_CONFIDENCE: f32 = 0.15;
pub const DEFAULT_IMGSZ: u32 = 640;
pub const DEFAULT_IOU: f32 = 0.45;

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      confidence: DEFAULT_CONFIDENCE,
      imgsz: DEFAULT_IMGSZ,
      iou: DEFAULT_IOU,
      classes: None,
      names: None,
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("参数 {key} 的值无效: {value}")]
  InvalidValue { key: String, value: String },
}

fn parse_list<T: std::str::FromStr>(key: &str, value: &str) -> Result<Vec<T>, ConfigError> {
  value
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(|s| {
      s.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
      })
    })
    .collect()
}

impl DetectorConfig {
  /// 从 URL 查询参数中读取 `conf`、`imgsz`、`iou`、`classes`、`names`
  pub fn apply_query(mut self, url: &Url) -> Result<Self, ConfigError> {
    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();

    let invalid = |key: &str, value: &str| ConfigError::InvalidValue {
      key: key.to_string(),
      value: value.to_string(),
    };

    if let Some(v) = query.get("conf") {
      self.confidence = v.parse().map_err(|_| invalid("conf", v))?;
    }
    if let Some(v) = query.get("imgsz") {
      self.imgsz = v.parse().map_err(|_| invalid("imgsz", v))?;
    }
    if let Some(v) = query.get("iou") {
      self.iou = v.parse().map_err(|_| invalid("iou", v))?;
    }
    if let Some(v) = query.get("classes") {
      self.classes = Some(parse_list("classes", v)?);
    }
    if let Some(v) = query.get("names") {
      self.names = Some(parse_list("names", v)?);
    }

    self.validate()
  }

  pub fn validate(self) -> Result<Self, ConfigError> {
    if !(0.0..=1.0).contains(&self.confidence) {
      return Err(ConfigError::InvalidValue {
        key: "conf".to_string(),
        value: self.confidence.to_string(),
      });
    }
    if !(0.0..=1.0).contains(&self.iou) {
      return Err(ConfigError::InvalidValue {
        key: "iou".to_string(),
        value: self.iou.to_string(),
      });
    }
    if self.imgsz == 0 || self.imgsz % 32 != 0 {
      return Err(ConfigError::InvalidValue {
        key: "imgsz".to_string(),
        value: self.imgsz.to_string(),
      });
    }
    Ok(self)
  }

  /// 根据配置与模型类别名确定目标类别
  pub fn target_classes(&self, model_names: &[(u32, String)]) -> TargetClasses {
    if let Some(ids) = &self.classes {
      return TargetClasses::from_ids(ids.iter().copied());
    }
    if !model_names.is_empty() {
      return TargetClasses::resolve(model_names);
    }
    let names: Vec<(u32, String)> = self
      .names
      .iter()
      .flatten()
      .enumerate()
      .map(|(i, n)| (i as u32, n.clone()))
      .collect();
    TargetClasses::resolve(&names)
  }
}

mod static_model;
pub use self::static_model::{StaticModel, StaticModelError};

#[cfg(feature = "model_onnx")]
mod onnx;
#[cfg(feature = "model_onnx")]
pub use self::onnx::{OnnxModel, OnnxModelError};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("Static model error: {0}")]
  StaticModelError(#[from] StaticModelError),
  #[cfg(feature = "model_onnx")]
  #[error("ONNX model error: {0}")]
  OnnxModelError(#[from] OnnxModelError),
  #[error("配置错误: {0}")]
  ConfigError(#[from] ConfigError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
}

pub enum ModelWrapper {
  Static(StaticModel),
  #[cfg(feature = "model_onnx")]
  Onnx(OnnxModel),
}

impl ModelWrapper {
  /// 按 URL scheme 创建模型，`config` 已合并了查询参数与命令行
  #[cfg_attr(not(feature = "model_onnx"), allow(unused_variables))]
  pub fn from_url_with_config(url: &Url, config: DetectorConfig) -> Result<Self, ModelError> {
    if url.scheme() == StaticModel::SCHEME {
      return Ok(ModelWrapper::Static(StaticModel::from_url(url)?));
    }
    #[cfg(feature = "model_onnx")]
    {
      if url.scheme() == OnnxModel::SCHEME {
        return Ok(ModelWrapper::Onnx(OnnxModel::load(url, config)?));
      }
    }
    Err(ModelError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl FromUrl for ModelWrapper {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let config = DetectorConfig::default().apply_query(url)?;
    Self::from_url_with_config(url, config)
  }
}

impl Model for ModelWrapper {
  type Error = ModelError;

  fn infer(&mut self, frame: &Frame) -> Result<DetectResult, Self::Error> {
    match self {
      ModelWrapper::Static(model) => match model.infer(frame) {
        Ok(result) => Ok(result),
        Err(never) => match never {},
      },
      #[cfg(feature = "model_onnx")]
      ModelWrapper::Onnx(model) => model.infer(frame).map_err(ModelError::from),
    }
  }
}
