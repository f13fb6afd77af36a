// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/bbox.rs - 检测框定义与边界裁剪
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

/// 检测器给出的原始框，坐标可能越界或反转
///
/// 左上角包含，右下角不包含。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBox {
  pub x1: i32,
  pub y1: i32,
  pub x2: i32,
  pub y2: i32,
}

impl RawBox {
  pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
    Self { x1, y1, x2, y2 }
  }

  /// 将浮点坐标向外取整，保证遮蔽区域覆盖整个检测框
  pub fn from_f32_outward(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    Self {
      x1: x1.floor() as i32,
      y1: y1.floor() as i32,
      x2: x2.ceil() as i32,
      y2: y2.ceil() as i32,
    }
  }
}

/// 经过裁剪的遮蔽区域
///
/// 不变式: `x1 < x2 <= width`，`y1 < y2 <= height`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RedactBox {
  x1: u32,
  y1: u32,
  x2: u32,
  y2: u32,
}

impl RedactBox {
  pub fn x1(&self) -> u32 {
    self.x1
  }

  pub fn y1(&self) -> u32 {
    self.y1
  }

  pub fn x2(&self) -> u32 {
    self.x2
  }

  pub fn y2(&self) -> u32 {
    self.y2
  }

  pub fn width(&self) -> u32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> u32 {
    self.y2 - self.y1
  }

  pub fn contains(&self, x: u32, y: u32) -> bool {
    x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
  }
}

impl From<RedactBox> for RawBox {
  fn from(b: RedactBox) -> Self {
    RawBox::new(b.x1 as i32, b.y1 as i32, b.x2 as i32, b.y2 as i32)
  }
}

/// 将原始框裁剪到帧范围内
///
/// 面积为零或完全在帧外的框返回 `None`，这不是错误。
pub fn sanitize(raw: RawBox, width: u32, height: u32) -> Option<RedactBox> {
  let (w, h) = (i64::from(width), i64::from(height));

  let x1 = i64::from(raw.x1).max(0);
  let y1 = i64::from(raw.y1).max(0);
  let x2 = i64::from(raw.x2).min(w);
  let y2 = i64::from(raw.y2).min(h);

  if x2 <= x1 || y2 <= y1 {
    return None;
  }

  Some(RedactBox {
    x1: x1 as u32,
    y1: y1 as u32,
    x2: x2 as u32,
    y2: y2 as u32,
  })
}
