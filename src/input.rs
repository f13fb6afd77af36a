// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/input.rs - 视频输入
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

use crate::{
  FromUrl,
  frame::{Frame, StreamMeta},
};

/// 只能向前读取的帧序列
///
/// `read_frame` 返回 `Ok(None)` 表示流结束，与读取失败区分开。
pub trait FrameSource {
  type Error: std::error::Error + Send + Sync + 'static;

  /// 打开时读取的元数据
  fn meta(&self) -> &StreamMeta;

  fn read_frame(&mut self) -> Result<Option<Frame>, Self::Error>;

  /// 释放底层资源，重复调用无副作用
  fn close(&mut self) -> Result<(), Self::Error>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  type Error = S::Error;

  fn meta(&self) -> &StreamMeta {
    (**self).meta()
  }

  fn read_frame(&mut self) -> Result<Option<Frame>, Self::Error> {
    (**self).read_frame()
  }

  fn close(&mut self) -> Result<(), Self::Error> {
    (**self).close()
  }
}

#[cfg(feature = "ffmpeg_io")]
mod ffmpeg_input;
#[cfg(feature = "ffmpeg_io")]
pub use self::ffmpeg_input::{FfmpegInput, FfmpegInputError};

#[cfg(feature = "gstreamer_io")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_io")]
pub use self::gstreamer_input::{GStreamerInput, GStreamerInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "ffmpeg_io")]
  #[error("ffmpeg input error: {0}")]
  FfmpegInputError(#[from] FfmpegInputError),
  #[cfg(feature = "gstreamer_io")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
}

pub enum InputWrapper {
  #[cfg(feature = "ffmpeg_io")]
  Ffmpeg(FfmpegInput),
  #[cfg(feature = "gstreamer_io")]
  GStreamer(GStreamerInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "ffmpeg_io")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == FfmpegInput::SCHEME {
        return Ok(InputWrapper::Ffmpeg(FfmpegInput::from_url(url)?));
      }
    }
    #[cfg(feature = "gstreamer_io")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInput::SCHEME {
        return Ok(InputWrapper::GStreamer(GStreamerInput::from_url(url)?));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl FrameSource for InputWrapper {
  type Error = InputError;

  fn meta(&self) -> &StreamMeta {
    match self {
      #[cfg(feature = "ffmpeg_io")]
      InputWrapper::Ffmpeg(input) => input.meta(),
      #[cfg(feature = "gstreamer_io")]
      InputWrapper::GStreamer(input) => input.meta(),
    }
  }

  fn read_frame(&mut self) -> Result<Option<Frame>, Self::Error> {
    match self {
      #[cfg(feature = "ffmpeg_io")]
      InputWrapper::Ffmpeg(input) => input.read_frame().map_err(InputError::from),
      #[cfg(feature = "gstreamer_io")]
      InputWrapper::GStreamer(input) => input.read_frame().map_err(InputError::from),
    }
  }

  fn close(&mut self) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "ffmpeg_io")]
      InputWrapper::Ffmpeg(input) => input.close().map_err(InputError::from),
      #[cfg(feature = "gstreamer_io")]
      InputWrapper::GStreamer(input) => input.close().map_err(InputError::from),
    }
  }
}
