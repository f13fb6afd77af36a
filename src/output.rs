// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/output.rs - 视频输出
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

use thiserror::Error;
use url::Url;

use crate::frame::{Frame, StreamMeta};

/// 按提交顺序追加帧的输出
///
/// 尺寸与打开时的 [`StreamMeta`] 不一致的帧是致命错误，不做缩放。
pub trait FrameSink {
  type Error: std::error::Error + Send + Sync + 'static;

  fn write_frame(&mut self, frame: Frame) -> Result<(), Self::Error>;

  /// 完成写出并释放资源，重复调用无副作用
  fn close(&mut self) -> Result<(), Self::Error>;
}

impl<K: FrameSink + ?Sized> FrameSink for Box<K> {
  type Error = K::Error;

  fn write_frame(&mut self, frame: Frame) -> Result<(), Self::Error> {
    (**self).write_frame(frame)
  }

  fn close(&mut self) -> Result<(), Self::Error> {
    (**self).close()
  }
}

#[cfg(feature = "ffmpeg_io")]
mod ffmpeg_output;
#[cfg(feature = "ffmpeg_io")]
pub use self::ffmpeg_output::{EncoderOptions, FfmpegOutput, FfmpegOutputError};

#[cfg(feature = "gstreamer_io")]
mod gstreamer_output;
#[cfg(feature = "gstreamer_io")]
pub use self::gstreamer_output::{GStreamerOutput, GStreamerOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "ffmpeg_io")]
  #[error("ffmpeg 视频输出错误: {0}")]
  FfmpegOutputError(#[from] FfmpegOutputError),
  #[cfg(feature = "gstreamer_io")]
  #[error("GStreamer 视频输出错误: {0}")]
  GStreamerOutputError(#[from] GStreamerOutputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  #[cfg(feature = "ffmpeg_io")]
  Ffmpeg(FfmpegOutput),
  #[cfg(feature = "gstreamer_io")]
  GStreamer(GStreamerOutput),
}

impl OutputWrapper {
  /// 按 URL scheme 打开输出，尺寸与帧率取自输入流
  pub fn open(url: &Url, meta: &StreamMeta) -> Result<Self, OutputError> {
    match url.scheme() {
      #[cfg(feature = "ffmpeg_io")]
      FfmpegOutput::SCHEME => Ok(OutputWrapper::Ffmpeg(FfmpegOutput::from_url(url, meta)?)),
      #[cfg(feature = "gstreamer_io")]
      GStreamerOutput::SCHEME => Ok(OutputWrapper::GStreamer(GStreamerOutput::from_url(
        url, meta,
      )?)),
      scheme => Err(OutputError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl FrameSink for OutputWrapper {
  type Error = OutputError;

  fn write_frame(&mut self, frame: Frame) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "ffmpeg_io")]
      OutputWrapper::Ffmpeg(output) => output.write_frame(frame).map_err(OutputError::from),
      #[cfg(feature = "gstreamer_io")]
      OutputWrapper::GStreamer(output) => output.write_frame(frame).map_err(OutputError::from),
    }
  }

  fn close(&mut self) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "ffmpeg_io")]
      OutputWrapper::Ffmpeg(output) => output.close().map_err(OutputError::from),
      #[cfg(feature = "gstreamer_io")]
      OutputWrapper::GStreamer(output) => output.close().map_err(OutputError::from),
    }
  }
}
