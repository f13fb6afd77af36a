// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输入模块
//!
//! 使用 `decodebin` 解码视频文件，经 `videoconvert` 转为 RGB 后从 appsink 读出。
//!
//! ```text
//! gst:///data/dashcam.mp4
//! ```
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! 打开时先将管道置于 Paused 并等待预滚（preroll），从第一帧的 caps 中读出
//! 尺寸与帧率，再查询时长估算总帧数。预滚帧不会被消耗，之后正常读出。

use std::path::{Path, PathBuf};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::FrameSource;
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameRate, RGB_CHANNELS, StreamMeta},
  url_to_path,
};

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不匹配（期望 "gst://"）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("无效的文件路径")]
  InvalidPath(#[from] std::string::FromUtf8Error),
  #[error("输入文件不存在: {0}")]
  NotFound(PathBuf),
  /// 无法获取 filesrc 元素
  #[error("Failed to get filesrc element")]
  FileSrcNotFound,
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format")]
  UnsupportedFormat,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 缓冲区大小不匹配
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

const GSTREAMER_INPUT_SCHEME: &str = "gst";

/// GStreamer 视频输入
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  meta: StreamMeta,
  stride: usize,
  next_index: u64,
  closed: bool,
}

impl GStreamerInput {
  pub fn open(path: &Path) -> Result<Self, GStreamerInputError> {
    if !path.is_file() {
      return Err(GStreamerInputError::NotFound(path.to_path_buf()));
    }

    gst::init()?;

    let pipeline_desc = "filesrc name=src ! decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink name=sink sync=false max-buffers=4";
    info!(
      "GStreamer pipeline description: {} (location={})",
      pipeline_desc,
      path.display()
    );

    let pipeline = gst::parse::launch(pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    pipeline
      .by_name("src")
      .ok_or(GStreamerInputError::FileSrcNotFound)?
      .set_property("location", path.to_string_lossy().into_owned());

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    let mut input = GStreamerInput {
      pipeline,
      appsink,
      meta: StreamMeta {
        width: 0,
        height: 0,
        frame_rate: FrameRate::integer(0),
        total_frames: 0,
      },
      stride: 0,
      next_index: 0,
      closed: false,
    };

    input.pipeline.set_state(gst::State::Paused)?;
    let preroll = input.appsink.pull_preroll().map_err(|_| {
      GStreamerInputError::PipelineError(input.bus_error().unwrap_or_else(|| "预滚失败".to_string()))
    })?;
    let caps = preroll
      .caps()
      .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;
    let video_info =
      gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
    if video_info.format() != gst_video::VideoFormat::Rgb {
      return Err(GStreamerInputError::UnsupportedFormat);
    }

    let fps = video_info.fps();
    let frame_rate = FrameRate::new(fps.numer().max(0) as u32, fps.denom().max(0) as u32);
    let total_frames = match input.pipeline.query_duration::<gst::ClockTime>() {
      Some(duration) if frame_rate.is_valid() => {
        (duration.nseconds() as f64 * frame_rate.as_f64() / 1e9).round() as u64
      }
      _ => 0,
    };

    input.meta = StreamMeta {
      width: video_info.width(),
      height: video_info.height(),
      frame_rate,
      total_frames,
    };
    input.stride = video_info.stride()[0] as usize;

    info!(
      "视频输入: {} ({}x{} @ {} fps, {} 帧)",
      path.display(),
      input.meta.width,
      input.meta.height,
      input.meta.frame_rate,
      total_frames
    );

    input.pipeline.set_state(gst::State::Playing)?;
    Ok(input)
  }

  /// 取出总线上的错误消息
  fn bus_error(&self) -> Option<String> {
    let bus = self.pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
      gst::MessageView::Error(err) => Some(format!(
        "{} ({})",
        err.error(),
        err.debug().map(|d| d.to_string()).unwrap_or_default()
      )),
      _ => None,
    }
  }

  fn copy_sample(&self, sample: &gst::Sample) -> Result<Vec<u8>, GStreamerInputError> {
    let buffer = sample
      .buffer()
      .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
    let map = buffer.map_readable().map_err(|e| {
      GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
    })?;
    let data = map.as_slice();

    let width = self.meta.width as usize;
    let height = self.meta.height as usize;
    let row = width * RGB_CHANNELS;
    let expected = self.stride * height.saturating_sub(1) + row;
    if data.len() < expected {
      return Err(GStreamerInputError::BufferSizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    // 行尾可能有对齐填充
    let mut out = Vec::with_capacity(row * height);
    for y in 0..height {
      let start = y * self.stride;
      out.extend_from_slice(&data[start..start + row]);
    }
    Ok(out)
  }
}

impl FromUrl for GStreamerInput {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != GSTREAMER_INPUT_SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }
    Self::open(&url_to_path(url)?)
  }
}

impl FromUrlWithScheme for GStreamerInput {
  const SCHEME: &'static str = GSTREAMER_INPUT_SCHEME;
}

impl FrameSource for GStreamerInput {
  type Error = GStreamerInputError;

  fn meta(&self) -> &StreamMeta {
    &self.meta
  }

  fn read_frame(&mut self) -> Result<Option<Frame>, Self::Error> {
    if self.closed {
      return Ok(None);
    }

    let sample = match self.appsink.pull_sample() {
      Ok(sample) => sample,
      Err(_) if self.appsink.is_eos() => {
        debug!("GStreamer 输入结束，共 {} 帧", self.next_index);
        return Ok(None);
      }
      Err(e) => {
        let reason = self.bus_error().unwrap_or_else(|| e.to_string());
        error!("Failed to pull sample: {}", reason);
        return Err(GStreamerInputError::PipelineError(reason));
      }
    };

    let data = self.copy_sample(&sample)?;
    let index = self.next_index;
    self.next_index += 1;
    let timestamp_ms = self.meta.frame_rate.timestamp_ms(index);
    Frame::from_raw(self.meta.width, self.meta.height, data, index, timestamp_ms)
      .map(Some)
      .ok_or(GStreamerInputError::BufferSizeMismatch {
        expected: self.meta.frame_len(),
        actual: 0,
      })
  }

  fn close(&mut self) -> Result<(), Self::Error> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    self.pipeline.set_state(gst::State::Null)?;
    Ok(())
  }
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}
