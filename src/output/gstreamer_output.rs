// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/output/gstreamer_output.rs - GStreamer 视频文件输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频文件输出模块
//!
//! 将遮蔽后的视频帧编码保存为视频文件，封装格式按扩展名选择。
//!
//! - **MP4** / **MKV** (H.264)
//! - **AVI** (H.264)
//! - **WebM** (VP8)
//!
//! ```text
//! gst:///data/out.mp4
//! ```
//!
//! 尺寸与帧率取自输入流，不再通过 URL 参数指定。

use std::path::{Path, PathBuf};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use super::FrameSink;
use crate::{
  check_output_path,
  frame::{Frame, GeometryMismatch, RGB_CHANNELS, StreamMeta},
  url_to_path,
};

/// GStreamer 视频输出错误类型
#[derive(Error, Debug)]
pub enum GStreamerOutputError {
  /// URI scheme 不匹配
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("无效的文件路径")]
  InvalidPath(#[from] std::string::FromUtf8Error),
  #[error("输出目录不存在: {0}")]
  DirectoryNotFound(PathBuf),
  #[error("输出路径不可写 {path}: {source}")]
  NotWritable {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  /// 无法获取 filesink 元素
  #[error("Failed to get filesink element")]
  FileSinkNotFound,
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsrc 元素
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  /// 无法转换元素为 appsrc
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  /// 缓冲区创建错误
  #[error("Buffer creation error")]
  BufferCreationError,
  #[error(transparent)]
  Geometry(#[from] GeometryMismatch),
  #[error("输出已关闭")]
  Closed,
}

const GSTREAMER_OUTPUT_SCHEME: &str = "gst";

/// 按扩展名选择编码与封装，`location` 在创建后单独设置
fn pipeline_description(path: &Path) -> &'static str {
  let extension = path
    .extension()
    .and_then(|e| e.to_str())
    .map(str::to_ascii_lowercase)
    .unwrap_or_default();

  match extension.as_str() {
    "mkv" => {
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux ! filesink name=sink"
    }
    "avi" => {
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc ! avimux ! filesink name=sink"
    }
    "webm" => "appsrc name=src ! videoconvert ! vp8enc ! webmmux ! filesink name=sink",
    _ => {
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! mp4mux ! filesink name=sink"
    }
  }
}

/// GStreamer 视频文件输出
pub struct GStreamerOutput {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  meta: StreamMeta,
  info: gst_video::VideoInfo,
  frame_count: u64,
  closed: bool,
}

impl GStreamerOutput {
  pub const SCHEME: &'static str = GSTREAMER_OUTPUT_SCHEME;

  pub fn from_url(url: &Url, meta: &StreamMeta) -> Result<Self, GStreamerOutputError> {
    if url.scheme() != GSTREAMER_OUTPUT_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        GSTREAMER_OUTPUT_SCHEME,
        url.scheme()
      );
      return Err(GStreamerOutputError::SchemeMismatch);
    }
    Self::open(&url_to_path(url)?, meta)
  }

  pub fn open(path: &Path, meta: &StreamMeta) -> Result<Self, GStreamerOutputError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      if !parent.is_dir() {
        return Err(GStreamerOutputError::DirectoryNotFound(parent.to_path_buf()));
      }
    }
    check_output_path(path).map_err(|source| GStreamerOutputError::NotWritable {
      path: path.to_path_buf(),
      source,
    })?;

    gst::init()?;

    let pipeline_desc = pipeline_description(path);
    info!(
      "Creating video output pipeline: {} (location={})",
      pipeline_desc,
      path.display()
    );

    let pipeline = gst::parse::launch(pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerOutputError::PipelineError("Failed to create pipeline".to_string()))?;

    pipeline
      .by_name("sink")
      .ok_or(GStreamerOutputError::FileSinkNotFound)?
      .set_property("location", path.to_string_lossy().into_owned());

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerOutputError::AppSrcConversionFailed)?;

    let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, meta.width, meta.height)
      .fps(gst::Fraction::new(
        meta.frame_rate.num as i32,
        meta.frame_rate.den as i32,
      ))
      .build()?;

    appsrc.set_caps(Some(&info.to_caps()?));
    appsrc.set_format(gst::Format::Time);

    pipeline.set_state(gst::State::Playing)?;

    info!(
      "Video output initialized: {}x{} @ {} fps -> {}",
      meta.width,
      meta.height,
      meta.frame_rate,
      path.display()
    );

    Ok(GStreamerOutput {
      pipeline,
      appsrc,
      meta: *meta,
      info,
      frame_count: 0,
      closed: false,
    })
  }

  fn push_frame(&mut self, frame: &Frame) -> Result<(), GStreamerOutputError> {
    let stride = self.info.stride()[0] as usize;
    let row = self.meta.width as usize * RGB_CHANNELS;
    let mut buffer = gst::Buffer::with_size(self.info.size())
      .map_err(|_| GStreamerOutputError::BufferCreationError)?;

    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or(GStreamerOutputError::BufferCreationError)?;
      let mut buffer_map = buffer_ref.map_writable().map_err(|_| {
        GStreamerOutputError::PipelineError("Failed to map buffer".to_string())
      })?;
      // 每行按 caps 要求的 stride 对齐
      for (y, src) in frame.image.as_raw().chunks_exact(row).enumerate() {
        let start = y * stride;
        buffer_map[start..start + row].copy_from_slice(src);
      }
    }

    let rate = self.meta.frame_rate;
    let pts = rate.timestamp_ns(self.frame_count);
    let next = rate.timestamp_ns(self.frame_count + 1);
    self.frame_count += 1;

    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or(GStreamerOutputError::BufferCreationError)?;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(next - pts));
    }

    self.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerOutputError::PipelineError(format!("Failed to push buffer: {:?}", e))
    })?;

    Ok(())
  }

  /// 等待 EOS 传递到 filesink，确保文件尾已写出
  fn wait_for_eos(&self) -> Result<(), GStreamerOutputError> {
    let bus = self
      .pipeline
      .bus()
      .ok_or_else(|| GStreamerOutputError::PipelineError("Pipeline has no bus".to_string()))?;
    let msg = bus.timed_pop_filtered(
      gst::ClockTime::NONE,
      &[gst::MessageType::Eos, gst::MessageType::Error],
    );
    match msg.as_ref().map(|m| m.view()) {
      Some(gst::MessageView::Error(err)) => Err(GStreamerOutputError::PipelineError(format!(
        "{} ({})",
        err.error(),
        err.debug().map(|d| d.to_string()).unwrap_or_default()
      ))),
      _ => Ok(()),
    }
  }
}

impl FrameSink for GStreamerOutput {
  type Error = GStreamerOutputError;

  fn write_frame(&mut self, frame: Frame) -> Result<(), Self::Error> {
    if self.closed {
      return Err(GStreamerOutputError::Closed);
    }
    self.meta.check_geometry(&frame)?;
    self.push_frame(&frame)
  }

  fn close(&mut self) -> Result<(), Self::Error> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;

    let finished = self
      .appsrc
      .end_of_stream()
      .map_err(|e| GStreamerOutputError::PipelineError(format!("Failed to send EOS: {:?}", e)))
      .and_then(|_| self.wait_for_eos());
    let stopped = self.pipeline.set_state(gst::State::Null);

    info!(
      "Video output closed. Total frames written: {}",
      self.frame_count
    );
    finished?;
    stopped?;
    Ok(())
  }
}

impl Drop for GStreamerOutput {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("Failed to stop GStreamer video output pipeline: {}", e);
    }
  }
}
