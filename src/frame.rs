// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/frame.rs - 帧与视频流元数据定义
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

use std::fmt;
use std::str::FromStr;

use image::RgbImage;
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

/// 帧数据
///
/// 由输入源在每次迭代中创建，经过遮蔽渲染后移交给输出，不会跨迭代保留。
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据（HWC，8 位）
  pub image: RgbImage,
  /// 帧索引（从 0 开始）
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }

  /// 从紧密排列的 RGB24 数据构造帧
  pub fn from_raw(
    width: u32,
    height: u32,
    data: Vec<u8>,
    index: u64,
    timestamp_ms: u64,
  ) -> Option<Self> {
    RgbImage::from_raw(width, height, data).map(|image| Self::new(image, index, timestamp_ms))
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameRateError {
  #[error("无效的帧率: {0}")]
  Invalid(String),
}

/// 有理数帧率，例如 30000/1001
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
  pub num: u32,
  pub den: u32,
}

impl FrameRate {
  pub const fn new(num: u32, den: u32) -> Self {
    Self { num, den }
  }

  pub const fn integer(fps: u32) -> Self {
    Self { num: fps, den: 1 }
  }

  pub fn as_f64(&self) -> f64 {
    if self.den == 0 {
      0.0
    } else {
      self.num as f64 / self.den as f64
    }
  }

  pub fn is_valid(&self) -> bool {
    self.num > 0 && self.den > 0
  }

  /// 第 `index` 帧的时间戳（毫秒）
  pub fn timestamp_ms(&self, index: u64) -> u64 {
    if !self.is_valid() {
      return 0;
    }
    ((index as u128 * self.den as u128 * 1000) / self.num as u128) as u64
  }

  /// 第 `index` 帧的时间戳（纳秒）
  pub fn timestamp_ns(&self, index: u64) -> u64 {
    if !self.is_valid() {
      return 0;
    }
    ((index as u128 * self.den as u128 * 1_000_000_000) / self.num as u128) as u64
  }
}

impl fmt::Display for FrameRate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.num, self.den)
  }
}

impl FromStr for FrameRate {
  type Err = FrameRateError;

  /// 解析 `30000/1001`、`25/1` 或 `29.97` 形式的帧率
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    let invalid = || FrameRateError::Invalid(s.to_string());

    let rate = if let Some((num, den)) = s.split_once('/') {
      let num = num.trim().parse::<u32>().map_err(|_| invalid())?;
      let den = den.trim().parse::<u32>().map_err(|_| invalid())?;
      FrameRate::new(num, den)
    } else if let Ok(fps) = s.parse::<u32>() {
      FrameRate::integer(fps)
    } else {
      let fps = s.parse::<f64>().map_err(|_| invalid())?;
      if !fps.is_finite() || fps <= 0.0 {
        return Err(invalid());
      }
      FrameRate::new((fps * 1000.0).round() as u32, 1000)
    };

    if rate.is_valid() {
      Ok(rate)
    } else {
      Err(invalid())
    }
  }
}

/// 视频流元数据，在打开流时读取一次，之后不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMeta {
  pub width: u32,
  pub height: u32,
  pub frame_rate: FrameRate,
  /// 总帧数，0 表示未知
  pub total_frames: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("帧尺寸不匹配: 期望 {expected_width}x{expected_height}, 实际 {actual_width}x{actual_height}")]
pub struct GeometryMismatch {
  pub expected_width: u32,
  pub expected_height: u32,
  pub actual_width: u32,
  pub actual_height: u32,
}

impl StreamMeta {
  pub fn total(&self) -> Option<u64> {
    (self.total_frames > 0).then_some(self.total_frames)
  }

  pub fn frame_len(&self) -> usize {
    self.width as usize * self.height as usize * RGB_CHANNELS
  }

  pub fn check_geometry(&self, frame: &Frame) -> Result<(), GeometryMismatch> {
    if frame.width() == self.width && frame.height() == self.height {
      Ok(())
    } else {
      Err(GeometryMismatch {
        expected_width: self.width,
        expected_height: self.height,
        actual_width: frame.width(),
        actual_height: frame.height(),
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_rational_and_decimal_rates() {
    assert_eq!("30000/1001".parse::<FrameRate>(), Ok(FrameRate::new(30000, 1001)));
    assert_eq!("25".parse::<FrameRate>(), Ok(FrameRate::integer(25)));
    assert_eq!("29.97".parse::<FrameRate>(), Ok(FrameRate::new(29970, 1000)));
    assert!("0/0".parse::<FrameRate>().is_err());
    assert!("abc".parse::<FrameRate>().is_err());
  }

  #[test]
  fn timestamps_follow_rate() {
    let rate = FrameRate::integer(30);
    assert_eq!(rate.timestamp_ms(0), 0);
    assert_eq!(rate.timestamp_ms(30), 1000);
    assert_eq!(rate.timestamp_ns(1), 33_333_333);
  }

  #[test]
  fn geometry_check_rejects_other_sizes() {
    let meta = StreamMeta {
      width: 4,
      height: 2,
      frame_rate: FrameRate::integer(30),
      total_frames: 0,
    };
    assert_eq!(meta.total(), None);
    let ok = Frame::new(RgbImage::new(4, 2), 0, 0);
    let bad = Frame::new(RgbImage::new(2, 4), 1, 0);
    assert!(meta.check_geometry(&ok).is_ok());
    let err = meta.check_geometry(&bad).unwrap_err();
    assert_eq!(err.actual_width, 2);
  }
}
