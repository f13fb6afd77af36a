// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/progress.rs - 处理进度
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

use std::io::Write;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{info, warn};

/// 某一时刻的处理进度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
  pub frames_processed: u64,
  /// 总帧数未知时为 `None`
  pub frames_total: Option<u64>,
  pub elapsed: Duration,
}

impl ProgressSnapshot {
  pub fn throughput_fps(&self) -> f64 {
    let secs = self.elapsed.as_secs_f64();
    if secs > 0.0 {
      self.frames_processed as f64 / secs
    } else {
      0.0
    }
  }

  /// 完成百分比，总帧数未知时为 `None`
  pub fn percent(&self) -> Option<f64> {
    self
      .frames_total
      .filter(|t| *t > 0)
      .map(|t| (self.frames_processed as f64 / t as f64 * 100.0).min(100.0))
  }
}

/// 进度观察者，由调用方注入
pub trait ProgressObserver {
  fn on_progress(&mut self, snapshot: &ProgressSnapshot);
}

impl<F: FnMut(&ProgressSnapshot)> ProgressObserver for F {
  fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
    self(snapshot)
  }
}

/// 以日志形式输出进度
#[derive(Debug, Default)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
  fn on_progress(&mut self, s: &ProgressSnapshot) {
    match (s.frames_total, s.percent()) {
      (Some(total), Some(percent)) => info!(
        "进度: {}/{} 帧 ({:.1}%), 已用 {:.1}s, {:.1} fps",
        s.frames_processed,
        total,
        percent,
        s.elapsed.as_secs_f64(),
        s.throughput_fps()
      ),
      _ => info!(
        "进度: {} 帧 (总数未知), 已用 {:.1}s, {:.1} fps",
        s.frames_processed,
        s.elapsed.as_secs_f64(),
        s.throughput_fps()
      ),
    }
  }
}

/// 每次进度写一行 JSON
pub struct JsonProgress<W: Write> {
  writer: W,
}

impl<W: Write> JsonProgress<W> {
  pub fn new(writer: W) -> Self {
    Self { writer }
  }

  pub fn into_inner(self) -> W {
    self.writer
  }
}

impl<W: Write> ProgressObserver for JsonProgress<W> {
  fn on_progress(&mut self, s: &ProgressSnapshot) {
    let line = json!({
      "timestamp": chrono::Local::now().to_rfc3339(),
      "frames_processed": s.frames_processed,
      "frames_total": s.frames_total,
      "elapsed_seconds": s.elapsed.as_secs_f64(),
      "throughput_fps": s.throughput_fps(),
    });
    if let Err(e) = writeln!(self.writer, "{}", line).and_then(|_| self.writer.flush()) {
      warn!("写出进度失败: {}", e);
    }
  }
}

/// 每处理 `interval` 帧通知一次观察者
pub struct ProgressReporter<'a> {
  interval: u64,
  frames_total: Option<u64>,
  start: Instant,
  observer: Option<Box<dyn ProgressObserver + 'a>>,
}

impl<'a> ProgressReporter<'a> {
  pub fn new(
    interval: u64,
    frames_total: Option<u64>,
    observer: Option<Box<dyn ProgressObserver + 'a>>,
  ) -> Self {
    Self {
      interval,
      frames_total,
      start: Instant::now(),
      observer,
    }
  }

  pub fn snapshot(&self, frames_processed: u64) -> ProgressSnapshot {
    ProgressSnapshot {
      frames_processed,
      frames_total: self.frames_total,
      elapsed: self.start.elapsed(),
    }
  }

  /// 第 `frames_processed` 帧处理完毕，到达间隔时通知观察者
  pub fn advance(&mut self, frames_processed: u64) {
    if self.interval == 0 || frames_processed % self.interval != 0 {
      return;
    }
    let snapshot = self.snapshot(frames_processed);
    if let Some(observer) = self.observer.as_mut() {
      observer.on_progress(&snapshot);
    }
  }

  pub fn elapsed(&self) -> Duration {
    self.start.elapsed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn throughput_and_percent() {
    let s = ProgressSnapshot {
      frames_processed: 30,
      frames_total: Some(60),
      elapsed: Duration::from_secs(2),
    };
    assert_eq!(s.throughput_fps(), 15.0);
    assert_eq!(s.percent(), Some(50.0));
  }

  #[test]
  fn unknown_total_has_no_percent() {
    let s = ProgressSnapshot {
      frames_processed: 30,
      frames_total: None,
      elapsed: Duration::ZERO,
    };
    assert_eq!(s.percent(), None);
    assert_eq!(s.throughput_fps(), 0.0);
  }

  #[test]
  fn reports_every_interval() {
    let mut seen = Vec::new();
    {
      let observer = |s: &ProgressSnapshot| seen.push(s.frames_processed);
      let mut reporter = ProgressReporter::new(30, Some(100), Some(Box::new(observer)));
      for n in 1..=100 {
        reporter.advance(n);
      }
    }
    assert_eq!(seen, vec![30, 60, 90]);
  }

  #[test]
  fn zero_interval_disables_reports() {
    let mut count = 0;
    {
      let observer = |_: &ProgressSnapshot| count += 1;
      let mut reporter = ProgressReporter::new(0, None, Some(Box::new(observer)));
      for n in 1..=10 {
        reporter.advance(n);
      }
    }
    assert_eq!(count, 0);
  }

  #[test]
  fn json_lines_carry_all_fields() {
    let mut json = JsonProgress::new(Vec::new());
    json.on_progress(&ProgressSnapshot {
      frames_processed: 10,
      frames_total: None,
      elapsed: Duration::from_millis(500),
    });
    let text = String::from_utf8(json.into_inner()).unwrap();
    let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
    assert_eq!(value["frames_processed"], 10);
    assert!(value["frames_total"].is_null());
    assert_eq!(value["throughput_fps"], 20.0);
    assert!(value["timestamp"].is_string());
  }
}
