// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/redact.rs - 遮蔽渲染
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

//! 遮蔽策略为纯色不透明填充。模糊或马赛克会保留部分信息，不采用。

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use tracing::trace;

use crate::{
  bbox::{RedactBox, sanitize},
  frame::Frame,
  model::DetectItem,
};

/// 遮蔽填充色（中灰，三通道相同）
pub const REDACT_FILL: Rgb<u8> = Rgb([128, 128, 128]);

/// 用填充色覆盖 `region` 内所有像素
///
/// `region` 必须已经过 [`sanitize`] 裁剪。
pub fn redact(image: &mut RgbImage, region: &RedactBox) {
  let rect = Rect::at(region.x1() as i32, region.y1() as i32).of_size(region.width(), region.height());
  draw_filled_rect_mut(image, rect, REDACT_FILL);
}

/// 裁剪并渲染一帧的全部检测结果，返回实际绘制的区域数
pub fn redact_detections(frame: &mut Frame, items: &[DetectItem]) -> usize {
  let (width, height) = (frame.width(), frame.height());
  let mut drawn = 0;
  for item in items {
    match sanitize(item.bbox, width, height) {
      Some(region) => {
        redact(&mut frame.image, &region);
        drawn += 1;
      }
      None => trace!(frame = frame.index, bbox = ?item.bbox, "丢弃退化检测框"),
    }
  }
  drawn
}
