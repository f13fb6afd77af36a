// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/model/static_model.rs - 固定检测框模型
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

//! 每一帧都返回同样的检测框，用于标定遮蔽位置或只做转码。
//!
//! - `static:` 不返回任何检测框
//! - `static:?box=100,100,300,150&box=0,0,20,20` 每帧返回两个框

use std::convert::Infallible;

use thiserror::Error;
use tracing::error;
use url::Url;

use super::{DetectItem, DetectResult, Model};
use crate::{FromUrl, FromUrlWithScheme, bbox::RawBox, frame::Frame};

#[derive(Error, Debug)]
pub enum StaticModelError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("Invalid box '{0}', expected x1,y1,x2,y2")]
  InvalidBox(String),
}

const STATIC_MODEL_SCHEME: &str = "static";

#[derive(Debug, Clone, Default)]
pub struct StaticModel {
  boxes: Vec<RawBox>,
}

impl StaticModel {
  pub fn new(boxes: Vec<RawBox>) -> Self {
    Self { boxes }
  }

  pub fn boxes(&self) -> &[RawBox] {
    &self.boxes
  }
}

fn parse_box(value: &str) -> Result<RawBox, StaticModelError> {
  let coords = value
    .split(',')
    .map(|s| s.trim().parse::<i32>())
    .collect::<Result<Vec<_>, _>>()
    .map_err(|_| StaticModelError::InvalidBox(value.to_string()))?;

  match coords.as_slice() {
    [x1, y1, x2, y2] => Ok(RawBox::new(*x1, *y1, *x2, *y2)),
    _ => Err(StaticModelError::InvalidBox(value.to_string())),
  }
}

impl FromUrl for StaticModel {
  type Error = StaticModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != STATIC_MODEL_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        STATIC_MODEL_SCHEME,
        url.scheme()
      );
      return Err(StaticModelError::SchemeMismatch);
    }

    let boxes = url
      .query_pairs()
      .filter(|(k, _)| k == "box")
      .map(|(_, v)| parse_box(&v))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(StaticModel { boxes })
  }
}

impl FromUrlWithScheme for StaticModel {
  const SCHEME: &'static str = STATIC_MODEL_SCHEME;
}

impl Model for StaticModel {
  type Error = Infallible;

  fn infer(&mut self, _frame: &Frame) -> Result<DetectResult, Self::Error> {
    let items: Vec<DetectItem> = self
      .boxes
      .iter()
      .map(|bbox| DetectItem {
        class_id: 0,
        score: 1.0,
        bbox: *bbox,
        track_id: None,
      })
      .collect();
    Ok(items.into())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::RgbImage;

  #[test]
  fn parses_boxes_from_query() {
    let url = Url::parse("static:?box=100,100,300,150&box=-50,-50,700,600").unwrap();
    let model = StaticModel::from_url(&url).unwrap();
    assert_eq!(
      model.boxes(),
      &[RawBox::new(100, 100, 300, 150), RawBox::new(-50, -50, 700, 600)]
    );
  }

  #[test]
  fn empty_query_means_no_detections() {
    let mut model = StaticModel::from_url(&Url::parse("static:").unwrap()).unwrap();
    let frame = Frame::new(RgbImage::new(8, 8), 0, 0);
    assert!(model.infer(&frame).unwrap().is_empty());
  }

  #[test]
  fn malformed_box_is_rejected() {
    for bad in ["static:?box=1,2,3", "static:?box=a,b,c,d", "static:?box=1,2,3,4,5"] {
      let url = Url::parse(bad).unwrap();
      assert!(matches!(
        StaticModel::from_url(&url),
        Err(StaticModelError::InvalidBox(_))
      ));
    }
  }

  #[test]
  fn other_scheme_is_rejected() {
    let url = Url::parse("onnx:///m.onnx").unwrap();
    assert!(matches!(
      StaticModel::from_url(&url),
      Err(StaticModelError::SchemeMismatch)
    ));
  }
}
