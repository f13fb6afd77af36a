// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/args.rs - 命令行参数
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use clap::{ArgAction, Parser};
use tracing::level_filters::LevelFilter;
use url::Url;

use platemask::model::{ConfigError, DetectorConfig};

/// Platemask 车牌遮蔽
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入视频
  /// 支持格式:
  /// - 文件路径: dashcam.mp4（等同于 video://）
  /// - ffmpeg: video:///data/dashcam.mp4
  /// - GStreamer: gst:///data/dashcam.mp4
  #[arg(long, value_name = "SOURCE", value_parser = parse_media_location)]
  pub input: Url,

  /// 输出视频
  /// 支持格式:
  /// - 文件路径: out.mp4（等同于 video://）
  /// - ffmpeg: video:///data/out.mp4?crf=23 或 video:///data/out.mkv?lossless=true
  /// - GStreamer: gst:///data/out.mp4
  #[arg(long, value_name = "OUTPUT", value_parser = parse_media_location)]
  pub output: Url,

  /// 检测模型
  /// 支持格式:
  /// - ONNX: lp.onnx 或 onnx:///models/lp.onnx?conf=0.2
  /// - 固定检测框: static:?box=100,100,300,150
  #[arg(long, value_name = "MODEL", value_parser = parse_model_location)]
  pub model: Url,

  /// 置信度阈值 (0.0 - 1.0)，默认 0.15
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,

  /// 推理输入边长（32 的倍数），默认 640
  #[arg(long, value_name = "PIXELS")]
  pub imgsz: Option<u32>,

  /// NMS IOU 阈值 (0.0 - 1.0)，默认 0.45
  #[arg(long, value_name = "THRESHOLD")]
  pub iou: Option<f32>,

  /// 显式指定车牌类别编号，跳过类别名匹配
  #[arg(long, value_name = "IDS", value_delimiter = ',')]
  pub classes: Option<Vec<u32>>,

  /// 每处理多少帧报告一次进度（0 表示不报告）
  #[arg(long, default_value = "30", value_name = "FRAMES")]
  pub progress_every: u64,

  /// 以 JSON 行格式将进度写到标准输出
  #[arg(long)]
  pub progress_json: bool,

  /// 输出更详细的日志（可重复）
  #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
  pub verbose: u8,

  /// 只输出警告与错误
  #[arg(short, long)]
  pub quiet: bool,
}

impl Args {
  pub fn log_level(&self) -> LevelFilter {
    if self.quiet {
      return LevelFilter::WARN;
    }
    match self.verbose {
      0 => LevelFilter::INFO,
      1 => LevelFilter::DEBUG,
      _ => LevelFilter::TRACE,
    }
  }

  /// 合并检测配置：命令行 > 模型 URL 查询参数 > 默认值
  pub fn detector_config(&self) -> Result<DetectorConfig, ConfigError> {
    let mut config = DetectorConfig::default().apply_query(&self.model)?;
    if let Some(confidence) = self.confidence {
      config.confidence = confidence;
    }
    if let Some(imgsz) = self.imgsz {
      config.imgsz = imgsz;
    }
    if let Some(iou) = self.iou {
      config.iou = iou;
    }
    if let Some(classes) = &self.classes {
      config.classes = Some(classes.clone());
    }
    config.validate()
  }
}

/// 将文件路径转换为 `scheme://` URL，路径各段做百分号编码
fn path_to_url(scheme: &str, path: &Path) -> Result<Url, String> {
  let absolute = if path.is_absolute() {
    path.to_path_buf()
  } else {
    std::env::current_dir()
      .map_err(|e| format!("无法获取当前目录: {}", e))?
      .join(path)
  };
  let text = absolute
    .to_str()
    .ok_or_else(|| format!("路径不是有效的 UTF-8: {}", absolute.display()))?;
  let encoded = text
    .split('/')
    .map(|segment| urlencoding::encode(segment).into_owned())
    .collect::<Vec<_>>()
    .join("/");
  Url::parse(&format!("{}://{}", scheme, encoded)).map_err(|e| e.to_string())
}

/// 已经是 URL 的参数原样使用；单字母 scheme 视为 Windows 盘符
fn explicit_url(value: &str) -> Option<Url> {
  Url::parse(value).ok().filter(|url| url.scheme().len() > 1)
}

fn parse_media_location(value: &str) -> Result<Url, String> {
  match explicit_url(value) {
    Some(url) => Ok(url),
    None => path_to_url("video", Path::new(value)),
  }
}

fn parse_model_location(value: &str) -> Result<Url, String> {
  match explicit_url(value) {
    Some(url) => Ok(url),
    None => path_to_url("onnx", Path::new(value)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use platemask::url_to_path;

  #[test]
  fn bare_paths_become_video_urls() {
    let url = parse_media_location("/data/my clip.mp4").unwrap();
    assert_eq!(url.scheme(), "video");
    assert_eq!(url.as_str(), "video:///data/my%20clip.mp4");
    assert_eq!(url_to_path(&url).unwrap(), Path::new("/data/my clip.mp4"));
  }

  #[test]
  fn explicit_urls_are_kept() {
    let url = parse_media_location("gst:///data/in.mp4").unwrap();
    assert_eq!(url.scheme(), "gst");
    let model = parse_model_location("static:?box=1,2,3,4").unwrap();
    assert_eq!(model.scheme(), "static");
    let model = parse_model_location("/models/lp.onnx").unwrap();
    assert_eq!(model.scheme(), "onnx");
  }

  #[test]
  fn command_line_overrides_model_query() {
    let args = Args::parse_from([
      "platemask",
      "--input",
      "/in.mp4",
      "--output",
      "/out.mp4",
      "--model",
      "onnx:///lp.onnx?conf=0.3&imgsz=1280",
      "--confidence",
      "0.5",
      "--classes",
      "0,2",
    ]);
    let config = args.detector_config().unwrap();
    assert_eq!(config.confidence, 0.5);
    assert_eq!(config.imgsz, 1280);
    assert_eq!(config.classes, Some(vec![0, 2]));
    assert_eq!(args.log_level(), LevelFilter::INFO);
  }

  #[test]
  fn invalid_override_is_rejected() {
    let args = Args::parse_from([
      "platemask",
      "--input",
      "/in.mp4",
      "--output",
      "/out.mp4",
      "--model",
      "static:",
      "--imgsz",
      "100",
    ]);
    assert!(args.detector_config().is_err());
  }
}
