// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/task.rs - 遮蔽任务驱动
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

//! # 任务驱动
//!
//! 状态机: `Opening → Running → Draining → Closed`，任何状态都可能进入 `Failed`。
//! 失败路径同样经过 Draining，输入与输出各自只关闭一次。

use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::StreamMeta,
  input::FrameSource,
  model::Model,
  output::FrameSink,
  progress::{ProgressObserver, ProgressReporter},
  redact::redact_detections,
};

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("无法打开输入: {0}")]
  OpenInput(#[source] BoxError),
  #[error("无法打开输出: {0}")]
  OpenOutput(#[source] BoxError),
  #[error("读取第 {index} 帧失败: {source}")]
  Read { index: u64, source: BoxError },
  #[error("第 {index} 帧检测失败: {source}")]
  Detection { index: u64, source: BoxError },
  #[error("写出第 {index} 帧失败: {source}")]
  Write { index: u64, source: BoxError },
  #[error("完成输出失败: {0}")]
  Finalize(#[source] BoxError),
  #[error("任务被中断，已处理 {processed} 帧")]
  Interrupted { processed: u64 },
}

impl TaskError {
  /// 出错帧的索引（从 0 开始）
  pub fn frame_index(&self) -> Option<u64> {
    match self {
      TaskError::Read { index, .. }
      | TaskError::Detection { index, .. }
      | TaskError::Write { index, .. } => Some(*index),
      _ => None,
    }
  }

  pub fn exit_code(&self) -> u8 {
    match self {
      TaskError::OpenInput(_) | TaskError::OpenOutput(_) => 2,
      TaskError::Read { .. } => 3,
      TaskError::Detection { .. } => 4,
      TaskError::Write { .. } | TaskError::Finalize(_) => 5,
      TaskError::Interrupted { .. } => 130,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Opening,
  Running,
  Draining,
  Closed,
  Failed,
}

/// 任务结束时的统计
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
  pub frames: u64,
  pub frames_total: Option<u64>,
  /// 实际绘制的遮蔽区域数
  pub redactions: u64,
  pub elapsed: Duration,
}

impl RunSummary {
  pub fn throughput_fps(&self) -> f64 {
    let secs = self.elapsed.as_secs_f64();
    if secs > 0.0 {
      self.frames as f64 / secs
    } else {
      0.0
    }
  }
}

struct StateLog {
  state: PipelineState,
}

impl StateLog {
  fn enter(&mut self, next: PipelineState) {
    debug!("状态: {:?} -> {:?}", self.state, next);
    self.state = next;
  }
}

struct Counters {
  frames: u64,
  redactions: u64,
}

/// 逐帧执行 读取 → 检测 → 裁剪 → 遮蔽 → 写出
pub struct RedactTask<'a> {
  progress_every: u64,
  observer: Option<Box<dyn ProgressObserver + 'a>>,
  interrupt: Option<Receiver<()>>,
}

impl Default for RedactTask<'_> {
  fn default() -> Self {
    Self {
      progress_every: 30,
      observer: None,
      interrupt: None,
    }
  }
}

impl<'a> RedactTask<'a> {
  /// 每处理 `n` 帧通知一次进度，0 表示不通知
  pub fn with_progress_every(mut self, n: u64) -> Self {
    self.progress_every = n;
    self
  }

  pub fn with_observer<P: ProgressObserver + 'a>(mut self, observer: P) -> Self {
    self.observer = Some(Box::new(observer));
    self
  }

  /// 每帧开始前检查一次中断信号
  pub fn with_interrupt(mut self, rx: Receiver<()>) -> Self {
    self.interrupt = Some(rx);
    self
  }

  fn interrupted(&self) -> bool {
    self
      .interrupt
      .as_ref()
      .map(|rx| rx.try_recv().is_ok())
      .unwrap_or(false)
  }

  fn process<S, M, K>(
    &self,
    source: &mut S,
    model: &mut M,
    sink: &mut K,
    reporter: &mut ProgressReporter<'_>,
    counters: &mut Counters,
  ) -> Result<(), TaskError>
  where
    S: FrameSource,
    M: Model,
    K: FrameSink,
  {
    loop {
      if self.interrupted() {
        warn!("中断信号接收，退出任务循环");
        return Err(TaskError::Interrupted {
          processed: counters.frames,
        });
      }

      let mut frame = match source.read_frame() {
        Ok(Some(frame)) => frame,
        Ok(None) => {
          debug!("输入结束");
          return Ok(());
        }
        Err(e) => {
          return Err(TaskError::Read {
            index: counters.frames,
            source: Box::new(e),
          });
        }
      };

      let index = frame.index;
      let result = model.infer(&frame).map_err(|e| TaskError::Detection {
        index,
        source: Box::new(e),
      })?;
      let drawn = redact_detections(&mut frame, &result.items);
      if drawn > 0 {
        debug!(frame = index, detections = result.len(), drawn, "帧已遮蔽");
      }

      sink.write_frame(frame).map_err(|e| TaskError::Write {
        index,
        source: Box::new(e),
      })?;

      counters.frames += 1;
      counters.redactions += drawn as u64;
      reporter.advance(counters.frames);
    }
  }
}

impl<'a, I, M, O, S, SE, K, KE> Task<I, M, O> for RedactTask<'a>
where
  I: FnOnce() -> Result<S, SE>,
  O: FnOnce(&StreamMeta) -> Result<K, KE>,
  S: FrameSource,
  M: Model,
  K: FrameSink,
  SE: std::error::Error + Send + Sync + 'static,
  KE: std::error::Error + Send + Sync + 'static,
{
  type Output = RunSummary;
  type Error = TaskError;

  fn run_task(mut self, input: I, mut model: M, output: O) -> Result<RunSummary, TaskError> {
    info!("开始任务...");
    let mut state = StateLog {
      state: PipelineState::Opening,
    };

    let mut source = match input() {
      Ok(source) => source,
      Err(e) => {
        error!("无法打开输入: {}", e);
        state.enter(PipelineState::Failed);
        return Err(TaskError::OpenInput(Box::new(e)));
      }
    };

    let meta = *source.meta();
    info!(
      "视频: {}x{} @ {} fps, 总帧数: {}",
      meta.width,
      meta.height,
      meta.frame_rate,
      meta
        .total()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "未知".to_string())
    );

    let mut sink = match output(&meta) {
      Ok(sink) => sink,
      Err(e) => {
        error!("无法打开输出: {}", e);
        state.enter(PipelineState::Failed);
        if let Err(close_err) = source.close() {
          warn!("关闭输入失败: {}", close_err);
        }
        return Err(TaskError::OpenOutput(Box::new(e)));
      }
    };

    state.enter(PipelineState::Running);
    let mut reporter = ProgressReporter::new(self.progress_every, meta.total(), self.observer.take());
    let mut counters = Counters {
      frames: 0,
      redactions: 0,
    };
    let outcome = self.process(&mut source, &mut model, &mut sink, &mut reporter, &mut counters);

    state.enter(PipelineState::Draining);
    let source_closed = source.close();
    let sink_closed = sink.close();
    if let Err(e) = &source_closed {
      warn!("关闭输入失败: {}", e);
    }

    match outcome {
      Ok(()) => {
        if let Err(e) = sink_closed {
          error!("完成输出失败: {}", e);
          state.enter(PipelineState::Failed);
          return Err(TaskError::Finalize(Box::new(e)));
        }
        state.enter(PipelineState::Closed);
        let summary = RunSummary {
          frames: counters.frames,
          frames_total: meta.total(),
          redactions: counters.redactions,
          elapsed: reporter.elapsed(),
        };
        info!(
          "任务完成: {} 帧, {} 处遮蔽, 耗时 {:.2?}, {:.1} fps",
          summary.frames,
          summary.redactions,
          summary.elapsed,
          summary.throughput_fps()
        );
        Ok(summary)
      }
      Err(e) => {
        if let Err(close_err) = &sink_closed {
          warn!("关闭输出失败: {}", close_err);
        }
        error!("任务失败: {}", e);
        state.enter(PipelineState::Failed);
        Err(e)
      }
    }
  }
}
