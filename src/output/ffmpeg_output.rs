// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/output/ffmpeg_output.rs - 基于 ffmpeg 子进程的视频编码
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

//! # ffmpeg 视频输出
//!
//! 将 rgb24 原始帧写入 `ffmpeg` 标准输入，由其编码为视频文件。
//!
//! ```text
//! video:///data/out.mp4
//! video:///data/out.mp4?crf=23&preset=medium
//! video:///data/out.mkv?lossless=true
//! ```
//!
//! ## 参数说明
//!
//! - `codec`: 视频编码器，默认 `libx264`
//! - `crf`: 质量参数（0-51，越小质量越好），默认 18
//! - `preset`: 编码速度预设，默认 `fast`
//! - `lossless`: 使用 FFV1 无损编码，适合 `.mkv`，默认 `false`

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::FrameSink;
use crate::{
  ffmpeg::{drain_stderr, ffmpeg_program, join_stderr},
  check_output_path,
  frame::{Frame, GeometryMismatch, StreamMeta},
  url_to_path,
};

#[derive(Error, Debug)]
pub enum FfmpegOutputError {
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
    source: io::Error,
  },
  #[error("参数 {key} 的值无效: {value}")]
  InvalidOption { key: String, value: String },
  #[error("无效的视频参数: {0}")]
  InvalidStream(String),
  #[error("无法启动 {program} (请确保已安装): {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },
  #[error(transparent)]
  Geometry(#[from] GeometryMismatch),
  #[error("输出已关闭")]
  Closed,
  #[error("ffmpeg 编码失败: {0}")]
  Encode(String),
  #[error("IO 错误: {0}")]
  Io(#[from] io::Error),
}

const FFMPEG_OUTPUT_SCHEME: &str = "video";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderOptions {
  pub codec: String,
  pub crf: u8,
  pub preset: String,
  pub lossless: bool,
}

impl Default for EncoderOptions {
  fn default() -> Self {
    Self {
      codec: "libx264".to_string(),
      crf: 18,
      preset: "fast".to_string(),
      lossless: false,
    }
  }
}

impl EncoderOptions {
  pub fn from_query(url: &Url) -> Result<Self, FfmpegOutputError> {
    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();
    let invalid = |key: &str, value: &str| FfmpegOutputError::InvalidOption {
      key: key.to_string(),
      value: value.to_string(),
    };

    let mut options = Self::default();
    if let Some(codec) = query.get("codec") {
      options.codec = codec.clone();
    }
    if let Some(v) = query.get("crf") {
      options.crf = v
        .parse()
        .ok()
        .filter(|crf| *crf <= 51)
        .ok_or_else(|| invalid("crf", v))?;
    }
    if let Some(preset) = query.get("preset") {
      options.preset = preset.clone();
    }
    if let Some(v) = query.get("lossless") {
      options.lossless = match v.as_str() {
        "1" | "true" | "yes" => true,
        "0" | "false" | "no" => false,
        _ => return Err(invalid("lossless", v)),
      };
    }
    Ok(options)
  }

  /// 编码参数（`-c:v` 之后的部分）
  ///
  /// yuv420p 要求宽高为偶数，奇数尺寸改用 yuv444p。
  pub fn codec_args(&self, width: u32, height: u32) -> Vec<String> {
    if self.lossless {
      return ["-c:v", "ffv1", "-level", "3", "-pix_fmt", "gbrp"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    }
    let pix_fmt = if width % 2 == 0 && height % 2 == 0 {
      "yuv420p"
    } else {
      "yuv444p"
    };
    vec![
      "-c:v".to_string(),
      self.codec.clone(),
      "-pix_fmt".to_string(),
      pix_fmt.to_string(),
      "-preset".to_string(),
      self.preset.clone(),
      "-crf".to_string(),
      self.crf.to_string(),
    ]
  }
}

pub struct FfmpegOutput {
  path: PathBuf,
  meta: StreamMeta,
  child: Option<Child>,
  stdin: Option<ChildStdin>,
  stderr: Option<JoinHandle<String>>,
  frames_written: u64,
}

impl FfmpegOutput {
  pub const SCHEME: &'static str = FFMPEG_OUTPUT_SCHEME;

  pub fn from_url(url: &Url, meta: &StreamMeta) -> Result<Self, FfmpegOutputError> {
    if url.scheme() != FFMPEG_OUTPUT_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        FFMPEG_OUTPUT_SCHEME,
        url.scheme()
      );
      return Err(FfmpegOutputError::SchemeMismatch);
    }
    let options = EncoderOptions::from_query(url)?;
    Self::open(&url_to_path(url)?, meta, &options)
  }

  pub fn open(
    path: &Path,
    meta: &StreamMeta,
    options: &EncoderOptions,
  ) -> Result<Self, FfmpegOutputError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      if !parent.is_dir() {
        return Err(FfmpegOutputError::DirectoryNotFound(parent.to_path_buf()));
      }
    }
    if meta.width == 0 || meta.height == 0 || !meta.frame_rate.is_valid() {
      return Err(FfmpegOutputError::InvalidStream(format!(
        "{}x{} @ {}",
        meta.width, meta.height, meta.frame_rate
      )));
    }
    check_output_path(path).map_err(|source| FfmpegOutputError::NotWritable {
      path: path.to_path_buf(),
      source,
    })?;

    let program = ffmpeg_program();
    let codec_args = options.codec_args(meta.width, meta.height);
    debug!("ffmpeg 编码参数: {:?}", codec_args);

    let mut child = Command::new(&program)
      .args(["-y", "-v", "error"])
      .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
      .arg("-s")
      .arg(format!("{}x{}", meta.width, meta.height))
      .arg("-framerate")
      .arg(meta.frame_rate.to_string())
      .args(["-i", "-", "-an"])
      .args(&codec_args)
      .arg(path)
      .stdin(Stdio::piped())
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|source| FfmpegOutputError::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
      })?;

    info!(
      "视频输出: {} ({}x{} @ {} fps)",
      path.display(),
      meta.width,
      meta.height,
      meta.frame_rate
    );

    let stdin = child.stdin.take();
    let stderr = child.stderr.take().map(drain_stderr);
    Ok(FfmpegOutput {
      path: path.to_path_buf(),
      meta: *meta,
      child: Some(child),
      stdin,
      stderr,
      frames_written: 0,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn frames_written(&self) -> u64 {
    self.frames_written
  }
}

impl FrameSink for FfmpegOutput {
  type Error = FfmpegOutputError;

  fn write_frame(&mut self, frame: Frame) -> Result<(), Self::Error> {
    self.meta.check_geometry(&frame)?;
    let stdin = self.stdin.as_mut().ok_or(FfmpegOutputError::Closed)?;
    stdin.write_all(frame.image.as_raw())?;
    self.frames_written += 1;
    Ok(())
  }

  fn close(&mut self) -> Result<(), Self::Error> {
    // 关闭标准输入使 ffmpeg 收到 EOF 并写完文件尾
    self.stdin = None;
    let Some(mut child) = self.child.take() else {
      return Ok(());
    };
    let status = child.wait()?;
    let stderr = join_stderr(self.stderr.take());
    if status.success() {
      info!(
        "视频编码完成: {} ({} 帧)",
        self.path.display(),
        self.frames_written
      );
      Ok(())
    } else {
      error!("ffmpeg 错误: {}", stderr);
      Err(FfmpegOutputError::Encode(if stderr.is_empty() {
        status.to_string()
      } else {
        stderr
      }))
    }
  }
}

impl Drop for FfmpegOutput {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("Failed to finish ffmpeg encoder: {}", e);
    }
  }
}
