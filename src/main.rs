// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use std::process::ExitCode;
use std::sync::mpsc;
use std::{thread, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info, warn};

use platemask::{
  FromUrl,
  frame::StreamMeta,
  input::InputWrapper,
  model::ModelWrapper,
  output::OutputWrapper,
  progress::{JsonProgress, TracingProgress},
  task::{RedactTask, RunSummary, Task, TaskError},
};

fn run(args: &args::Args) -> Result<RunSummary> {
  if args.input == args.output {
    bail!("输出不能与输入相同: {}", args.output);
  }

  let config = args.detector_config().context("检测参数无效")?;
  info!("检测配置: {:?}", config);

  info!("正在加载模型...");
  let model = ModelWrapper::from_url_with_config(&args.model, config)?;
  info!("模型加载完成");

  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(130);
    });
  })
  .context("无法设置 Ctrl-C 处理函数")?;

  let task = RedactTask::default()
    .with_progress_every(args.progress_every)
    .with_interrupt(rx);
  let task = if args.progress_json {
    task.with_observer(JsonProgress::new(std::io::stdout()))
  } else {
    task.with_observer(TracingProgress)
  };

  let summary = task.run_task(
    || InputWrapper::from_url(&args.input),
    model,
    |meta: &StreamMeta| OutputWrapper::open(&args.output, meta),
  )?;
  Ok(summary)
}

fn main() -> ExitCode {
  let args = args::Args::parse();

  tracing_subscriber::fmt()
    .with_max_level(args.log_level())
    .with_writer(std::io::stderr)
    .init();

  info!("Platemask {} 车牌遮蔽", env!("CARGO_PKG_VERSION"));
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);
  info!("模型: {}", args.model);

  match run(&args) {
    Ok(summary) => {
      info!(
        "处理完成! 总帧数: {}, 遮蔽: {}, 输出文件: {}",
        summary.frames, summary.redactions, args.output
      );
      ExitCode::SUCCESS
    }
    Err(e) => {
      error!("{:#}", e);
      match e.downcast_ref::<TaskError>() {
        Some(task_error) => ExitCode::from(task_error.exit_code()),
        None => ExitCode::FAILURE,
      }
    }
  }
}
