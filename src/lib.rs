// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod bbox;
pub mod frame;
pub mod input;
pub mod model;
pub mod output;
pub mod progress;
pub mod redact;
pub mod task;

#[cfg(not(any(feature = "ffmpeg_io", feature = "gstreamer_io")))]
compile_error!("至少需要启用一个视频后端: ffmpeg_io 或 gstreamer_io");

use std::io;
use std::path::{Path, PathBuf};

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 将 URL 路径部分解码为本地文件路径
///
/// `video:///tmp/a%20b.mp4` 与 `video://tmp/a.mp4` 都会被接受，后者把 host 当作
/// 相对路径的第一段。
pub fn url_to_path(url: &url::Url) -> Result<PathBuf, std::string::FromUtf8Error> {
  let path = urlencoding::decode(url.path())?;
  let path = match url.host_str() {
    Some(host) if !host.is_empty() => format!("{}{}", host, path),
    _ => path.into_owned(),
  };
  Ok(PathBuf::from(path))
}

/// 打开编码器之前确认输出路径可写
///
/// 路径不能是目录，且能以写方式打开（不存在时创建，已有内容不截断）。
pub fn check_output_path(path: &Path) -> io::Result<()> {
  if path.is_dir() {
    return Err(io::Error::new(
      io::ErrorKind::IsADirectory,
      format!("{} 是目录", path.display()),
    ));
  }
  std::fs::OpenOptions::new()
    .write(true)
    .create(true)
    .truncate(false)
    .open(path)
    .map(drop)
}

#[cfg(feature = "ffmpeg_io")]
pub(crate) mod ffmpeg {
  use std::ffi::OsString;
  use std::io::Read;
  use std::process::ChildStderr;
  use std::thread::{self, JoinHandle};

  /// `PLATEMASK_FFMPEG` 可覆盖 ffmpeg 可执行文件
  pub fn ffmpeg_program() -> OsString {
    std::env::var_os("PLATEMASK_FFMPEG").unwrap_or_else(|| "ffmpeg".into())
  }

  /// `PLATEMASK_FFPROBE` 可覆盖 ffprobe 可执行文件
  pub fn ffprobe_program() -> OsString {
    std::env::var_os("PLATEMASK_FFPROBE").unwrap_or_else(|| "ffprobe".into())
  }

  /// 在后台线程中读完子进程的 stderr，避免管道写满阻塞子进程
  pub fn drain_stderr(mut stderr: ChildStderr) -> JoinHandle<String> {
    thread::spawn(move || {
      let mut buf = Vec::new();
      let _ = stderr.read_to_end(&mut buf);
      String::from_utf8_lossy(&buf).trim().to_string()
    })
  }

  pub fn join_stderr(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
  }
}
