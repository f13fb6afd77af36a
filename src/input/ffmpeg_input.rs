// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/input/ffmpeg_input.rs - 基于 ffmpeg 子进程的视频解码
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

//! # ffmpeg 视频输入
//!
//! 先用 `ffprobe` 读取第一路视频流的尺寸、帧率与帧数，再启动 `ffmpeg`
//! 将其解码为 rgb24 原始帧从标准输出读出。
//!
//! ```text
//! video:///data/dashcam.mp4
//! ```
//!
//! 需要 `ffmpeg` 与 `ffprobe` 在 `PATH` 中，或通过环境变量
//! `PLATEMASK_FFMPEG` / `PLATEMASK_FFPROBE` 指定。

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::FrameSource;
use crate::{
  FromUrl, FromUrlWithScheme,
  ffmpeg::{drain_stderr, ffmpeg_program, ffprobe_program, join_stderr},
  frame::{Frame, FrameRate, StreamMeta},
  url_to_path,
};

#[derive(Error, Debug)]
pub enum FfmpegInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("无效的文件路径")]
  InvalidPath(#[from] std::string::FromUtf8Error),
  #[error("输入文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("无法启动 {program} (请确保已安装): {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },
  #[error("ffprobe 失败: {0}")]
  Probe(String),
  #[error("无法解析 ffprobe 输出: {0}")]
  ProbeOutput(#[from] serde_json::Error),
  #[error("文件中没有可用的视频流")]
  NoVideoStream,
  #[error("帧 {index} 数据不完整: 期望 {expected} 字节, 实际 {actual} 字节")]
  TruncatedFrame {
    index: u64,
    expected: usize,
    actual: usize,
  },
  #[error("ffmpeg 解码失败: {0}")]
  Decode(String),
  #[error("IO 错误: {0}")]
  Io(#[from] io::Error),
}

const FFMPEG_INPUT_SCHEME: &str = "video";

pub struct FfmpegInput {
  path: PathBuf,
  meta: StreamMeta,
  child: Option<Child>,
  stdout: Option<ChildStdout>,
  stderr: Option<JoinHandle<String>>,
  next_index: u64,
  finished: bool,
}

fn spawn_error(program: &std::ffi::OsStr, source: io::Error) -> FfmpegInputError {
  FfmpegInputError::Spawn {
    program: program.to_string_lossy().into_owned(),
    source,
  }
}

/// 解析 `ffprobe -of json` 的输出
fn parse_probe(json: &str) -> Result<StreamMeta, FfmpegInputError> {
  let value: Value = serde_json::from_str(json)?;
  let stream = value
    .get("streams")
    .and_then(Value::as_array)
    .and_then(|streams| streams.first())
    .ok_or(FfmpegInputError::NoVideoStream)?;

  let dimension = |key: &str| {
    stream
      .get(key)
      .and_then(Value::as_u64)
      .and_then(|v| u32::try_from(v).ok())
      .filter(|v| *v > 0)
  };
  let (Some(width), Some(height)) = (dimension("width"), dimension("height")) else {
    return Err(FfmpegInputError::NoVideoStream);
  };

  let rate = |key: &str| {
    stream
      .get(key)
      .and_then(Value::as_str)
      .and_then(|s| s.parse::<FrameRate>().ok())
  };
  let frame_rate = rate("avg_frame_rate")
    .or_else(|| rate("r_frame_rate"))
    .ok_or_else(|| FfmpegInputError::Probe("无法确定帧率".to_string()))?;

  let as_number = |v: &Value| {
    v.as_str()
      .and_then(|s| s.parse::<f64>().ok())
      .or_else(|| v.as_f64())
  };
  let nb_frames = stream
    .get("nb_frames")
    .and_then(as_number)
    .filter(|n| *n > 0.0)
    .map(|n| n as u64);
  let duration = stream
    .get("duration")
    .and_then(as_number)
    .or_else(|| value.get("format")?.get("duration").and_then(as_number))
    .filter(|d| d.is_finite() && *d > 0.0);
  let total_frames = nb_frames
    .or_else(|| duration.map(|d| (d * frame_rate.as_f64()).round() as u64))
    .unwrap_or(0);

  Ok(StreamMeta {
    width,
    height,
    frame_rate,
    total_frames,
  })
}

fn probe(path: &Path) -> Result<StreamMeta, FfmpegInputError> {
  let program = ffprobe_program();
  let output = Command::new(&program)
    .args(["-v", "error", "-select_streams", "v:0"])
    .args(["-show_entries", "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames,duration"])
    .args(["-show_entries", "format=duration"])
    .args(["-of", "json"])
    .arg(path)
    .stdin(Stdio::null())
    .output()
    .map_err(|e| spawn_error(&program, e))?;

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    error!("ffprobe 错误: {}", stderr.trim());
    return Err(FfmpegInputError::Probe(stderr.trim().to_string()));
  }

  parse_probe(&String::from_utf8_lossy(&output.stdout))
}

/// 读满 `buf`，返回实际读到的字节数；只有流结束时才会少于 `buf.len()`
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
  let mut filled = 0;
  while filled < buf.len() {
    match reader.read(&mut buf[filled..]) {
      Ok(0) => break,
      Ok(n) => filled += n,
      Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
      Err(e) => return Err(e),
    }
  }
  Ok(filled)
}

impl FfmpegInput {
  pub fn open(path: &Path) -> Result<Self, FfmpegInputError> {
    if !path.is_file() {
      return Err(FfmpegInputError::NotFound(path.to_path_buf()));
    }

    let meta = probe(path)?;
    info!(
      "视频输入: {} ({}x{} @ {} fps, {} 帧)",
      path.display(),
      meta.width,
      meta.height,
      meta.frame_rate,
      meta
        .total()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "未知".to_string())
    );

    let program = ffmpeg_program();
    let mut child = Command::new(&program)
      .args(["-v", "error", "-nostdin", "-i"])
      .arg(path)
      .args(["-map", "0:v:0", "-vsync", "passthrough"])
      .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|e| spawn_error(&program, e))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take().map(drain_stderr);

    Ok(FfmpegInput {
      path: path.to_path_buf(),
      meta,
      child: Some(child),
      stdout,
      stderr,
      next_index: 0,
      finished: false,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// 解码进程输出结束后检查其退出状态
  fn finish(&mut self) -> Result<(), FfmpegInputError> {
    self.finished = true;
    self.stdout = None;
    let Some(mut child) = self.child.take() else {
      return Ok(());
    };
    let status = child.wait()?;
    let stderr = join_stderr(self.stderr.take());
    if status.success() {
      debug!("ffmpeg 解码结束，共 {} 帧", self.next_index);
      Ok(())
    } else {
      error!("ffmpeg 错误: {}", stderr);
      Err(FfmpegInputError::Decode(if stderr.is_empty() {
        status.to_string()
      } else {
        stderr
      }))
    }
  }
}

impl FromUrl for FfmpegInput {
  type Error = FfmpegInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != FFMPEG_INPUT_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        FFMPEG_INPUT_SCHEME,
        url.scheme()
      );
      return Err(FfmpegInputError::SchemeMismatch);
    }
    Self::open(&url_to_path(url)?)
  }
}

impl FromUrlWithScheme for FfmpegInput {
  const SCHEME: &'static str = FFMPEG_INPUT_SCHEME;
}

impl FrameSource for FfmpegInput {
  type Error = FfmpegInputError;

  fn meta(&self) -> &StreamMeta {
    &self.meta
  }

  fn read_frame(&mut self) -> Result<Option<Frame>, Self::Error> {
    if self.finished {
      return Ok(None);
    }
    let Some(stdout) = self.stdout.as_mut() else {
      return Ok(None);
    };

    let expected = self.meta.frame_len();
    let mut data = vec![0u8; expected];
    let actual = read_full(stdout, &mut data)?;

    if actual == 0 {
      self.finish()?;
      return Ok(None);
    }
    if actual < expected {
      return Err(FfmpegInputError::TruncatedFrame {
        index: self.next_index,
        expected,
        actual,
      });
    }

    let index = self.next_index;
    self.next_index += 1;
    let timestamp_ms = self.meta.frame_rate.timestamp_ms(index);
    Ok(Frame::from_raw(
      self.meta.width,
      self.meta.height,
      data,
      index,
      timestamp_ms,
    ))
  }

  fn close(&mut self) -> Result<(), Self::Error> {
    self.stdout = None;
    if let Some(mut child) = self.child.take() {
      if !self.finished && matches!(child.try_wait(), Ok(None)) {
        debug!("提前结束 ffmpeg 解码进程");
        let _ = child.kill();
      }
      child.wait()?;
      let _ = join_stderr(self.stderr.take());
    }
    self.finished = true;
    Ok(())
  }
}

impl Drop for FfmpegInput {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("Failed to stop ffmpeg decoder: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_probe_with_frame_count() {
    let json = r#"{
      "programs": [],
      "streams": [{
        "width": 640, "height": 480,
        "r_frame_rate": "30/1", "avg_frame_rate": "30/1",
        "nb_frames": "60", "duration": "2.000000"
      }],
      "format": { "duration": "2.000000" }
    }"#;
    let meta = parse_probe(json).unwrap();
    assert_eq!((meta.width, meta.height), (640, 480));
    assert_eq!(meta.frame_rate, FrameRate::integer(30));
    assert_eq!(meta.total(), Some(60));
  }

  #[test]
  fn falls_back_to_duration_and_real_rate() {
    let json = r#"{
      "streams": [{
        "width": 1920, "height": 1080,
        "r_frame_rate": "30000/1001", "avg_frame_rate": "0/0"
      }],
      "format": { "duration": "10.010000" }
    }"#;
    let meta = parse_probe(json).unwrap();
    assert_eq!(meta.frame_rate, FrameRate::new(30000, 1001));
    assert_eq!(meta.total(), Some(300));
  }

  #[test]
  fn unknown_total_is_zero() {
    let json = r#"{"streams": [{"width": 4, "height": 2, "avg_frame_rate": "25/1"}]}"#;
    assert_eq!(parse_probe(json).unwrap().total(), None);
  }

  #[test]
  fn missing_stream_is_an_error() {
    assert!(matches!(
      parse_probe(r#"{"streams": []}"#),
      Err(FfmpegInputError::NoVideoStream)
    ));
    assert!(matches!(
      parse_probe(r#"{"streams": [{"avg_frame_rate": "25/1"}]}"#),
      Err(FfmpegInputError::NoVideoStream)
    ));
  }

  #[test]
  fn read_full_distinguishes_eof_from_short_read() {
    let mut buf = [0u8; 4];
    assert_eq!(read_full(&mut &[1u8, 2, 3, 4, 5][..], &mut buf).unwrap(), 4);
    assert_eq!(read_full(&mut &[1u8, 2][..], &mut buf).unwrap(), 2);
    assert_eq!(read_full(&mut &[][..], &mut buf).unwrap(), 0);
  }

  #[test]
  fn missing_file_is_rejected_before_spawning() {
    let url = Url::parse("video:///definitely/not/here.mp4").unwrap();
    assert!(matches!(
      FfmpegInput::from_url(&url),
      Err(FfmpegInputError::NotFound(_))
    ));
  }
}
