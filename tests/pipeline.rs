// 该文件是 Platemask （车牌遮蔽） 项目的一部分。
// tests/pipeline.rs - 任务驱动测试
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

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::mpsc;

use image::{Rgb, RgbImage};
use platemask::{
  bbox::RawBox,
  frame::{Frame, FrameRate, StreamMeta},
  input::FrameSource,
  model::{DetectResult, Model, StaticModel},
  output::FrameSink,
  progress::ProgressSnapshot,
  redact::REDACT_FILL,
  task::{RedactTask, RunSummary, Task, TaskError},
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const FRAMES: u64 = 60;

fn pattern(index: u64, width: u32, height: u32) -> RgbImage {
  let seed = index as u32;
  RgbImage::from_fn(width, height, |x, y| {
    Rgb([
      ((x + seed * 3) % 251) as u8,
      ((y + seed * 5) % 241) as u8,
      ((x * y + seed) % 127) as u8,
    ])
  })
}

fn meta(total_frames: u64) -> StreamMeta {
  StreamMeta {
    width: WIDTH,
    height: HEIGHT,
    frame_rate: FrameRate::integer(30),
    total_frames,
  }
}

struct MemSource {
  meta: StreamMeta,
  frames: u64,
  read: u64,
  fail_at: Option<u64>,
  /// 从该帧起输出错误尺寸
  bad_size_at: Option<u64>,
  closes: Rc<Cell<u32>>,
}

impl MemSource {
  fn new(frames: u64, closes: &Rc<Cell<u32>>) -> Self {
    Self {
      meta: meta(frames),
      frames,
      read: 0,
      fail_at: None,
      bad_size_at: None,
      closes: closes.clone(),
    }
  }
}

impl FrameSource for MemSource {
  type Error = io::Error;

  fn meta(&self) -> &StreamMeta {
    &self.meta
  }

  fn read_frame(&mut self) -> Result<Option<Frame>, Self::Error> {
    if self.fail_at == Some(self.read) {
      return Err(io::Error::other("corrupt packet"));
    }
    if self.read >= self.frames {
      return Ok(None);
    }
    let index = self.read;
    self.read += 1;
    let (w, h) = if self.bad_size_at.is_some_and(|k| index >= k) {
      (WIDTH / 2, HEIGHT / 2)
    } else {
      (WIDTH, HEIGHT)
    };
    Ok(Some(Frame::new(
      pattern(index, w, h),
      index,
      self.meta.frame_rate.timestamp_ms(index),
    )))
  }

  fn close(&mut self) -> Result<(), Self::Error> {
    self.closes.set(self.closes.get() + 1);
    Ok(())
  }
}

struct MemSink {
  meta: StreamMeta,
  written: Rc<RefCell<Vec<Frame>>>,
  fail_at: Option<u64>,
  closes: Rc<Cell<u32>>,
}

impl FrameSink for MemSink {
  type Error = io::Error;

  fn write_frame(&mut self, frame: Frame) -> Result<(), Self::Error> {
    if self.meta.check_geometry(&frame).is_err() {
      return Err(io::Error::other("geometry mismatch"));
    }
    let mut written = self.written.borrow_mut();
    if self.fail_at == Some(written.len() as u64) {
      return Err(io::Error::other("disk full"));
    }
    written.push(frame);
    Ok(())
  }

  fn close(&mut self) -> Result<(), Self::Error> {
    self.closes.set(self.closes.get() + 1);
    Ok(())
  }
}

/// 在指定帧返回错误的检测器
struct FailingModel {
  fail_at: u64,
}

impl Model for FailingModel {
  type Error = io::Error;

  fn infer(&mut self, frame: &Frame) -> Result<DetectResult, Self::Error> {
    if frame.index == self.fail_at {
      Err(io::Error::other("inference backend crashed"))
    } else {
      Ok(DetectResult::empty())
    }
  }
}

struct Harness {
  source_closes: Rc<Cell<u32>>,
  sink_closes: Rc<Cell<u32>>,
  sink_opened: Rc<Cell<bool>>,
  written: Rc<RefCell<Vec<Frame>>>,
  sink_fail_at: Option<u64>,
}

impl Harness {
  fn new() -> Self {
    Self {
      source_closes: Rc::new(Cell::new(0)),
      sink_closes: Rc::new(Cell::new(0)),
      sink_opened: Rc::new(Cell::new(false)),
      written: Rc::new(RefCell::new(Vec::new())),
      sink_fail_at: None,
    }
  }

  fn source(&self, frames: u64) -> MemSource {
    MemSource::new(frames, &self.source_closes)
  }

  fn run<M: Model>(
    &self,
    task: RedactTask<'_>,
    source: MemSource,
    model: M,
  ) -> Result<RunSummary, TaskError> {
    task.run_task(
      move || Ok::<_, io::Error>(source),
      model,
      |meta: &StreamMeta| {
        self.sink_opened.set(true);
        Ok::<_, io::Error>(MemSink {
          meta: *meta,
          written: self.written.clone(),
          fail_at: self.sink_fail_at,
          closes: self.sink_closes.clone(),
        })
      },
    )
  }

  fn assert_closed_once(&self) {
    assert_eq!(self.source_closes.get(), 1, "输入应当只关闭一次");
    if self.sink_opened.get() {
      assert_eq!(self.sink_closes.get(), 1, "输出应当只关闭一次");
    }
  }

  fn written_indices(&self) -> Vec<u64> {
    self.written.borrow().iter().map(|f| f.index).collect()
  }
}

#[test]
fn empty_detector_passes_frames_through_unchanged() {
  let h = Harness::new();
  let summary = h
    .run(RedactTask::default(), h.source(FRAMES), StaticModel::default())
    .unwrap();

  assert_eq!(summary.frames, FRAMES);
  assert_eq!(summary.redactions, 0);
  assert_eq!(summary.frames_total, Some(FRAMES));
  assert_eq!(h.written_indices(), (0..FRAMES).collect::<Vec<_>>());
  for frame in h.written.borrow().iter() {
    assert_eq!((frame.width(), frame.height()), (WIDTH, HEIGHT));
    assert_eq!(frame.image, pattern(frame.index, WIDTH, HEIGHT));
  }
  h.assert_closed_once();
}

#[test]
fn fixed_box_greys_exactly_that_rectangle() {
  let h = Harness::new();
  let model = StaticModel::new(vec![RawBox::new(100, 100, 300, 150)]);
  let summary = h.run(RedactTask::default(), h.source(FRAMES), model).unwrap();

  assert_eq!(summary.frames, FRAMES);
  assert_eq!(summary.redactions, FRAMES);
  for frame in h.written.borrow().iter() {
    let original = pattern(frame.index, WIDTH, HEIGHT);
    for (x, y, pixel) in frame.image.enumerate_pixels() {
      let inside = (100..300).contains(&x) && (100..150).contains(&y);
      if inside {
        assert_eq!(*pixel, REDACT_FILL);
      } else {
        assert_eq!(pixel, original.get_pixel(x, y));
      }
    }
  }
  h.assert_closed_once();
}

#[test]
fn oversized_box_greys_whole_frame() {
  let h = Harness::new();
  let model = StaticModel::new(vec![RawBox::new(-50, -50, 700, 600)]);
  h.run(RedactTask::default(), h.source(5), model).unwrap();

  assert_eq!(h.written.borrow().len(), 5);
  for frame in h.written.borrow().iter() {
    assert!(frame.image.pixels().all(|p| *p == REDACT_FILL));
  }
}

#[test]
fn degenerate_boxes_are_ignored() {
  let h = Harness::new();
  let model = StaticModel::new(vec![RawBox::new(700, 10, 800, 20), RawBox::new(5, 5, 5, 50)]);
  let summary = h.run(RedactTask::default(), h.source(3), model).unwrap();

  assert_eq!(summary.redactions, 0);
  for frame in h.written.borrow().iter() {
    assert_eq!(frame.image, pattern(frame.index, WIDTH, HEIGHT));
  }
}

#[test]
fn empty_input_still_releases_resources() {
  let h = Harness::new();
  let summary = h
    .run(RedactTask::default(), h.source(0), StaticModel::default())
    .unwrap();
  assert_eq!(summary.frames, 0);
  assert_eq!(summary.frames_total, None);
  assert!(h.sink_opened.get());
  h.assert_closed_once();
}

#[test]
fn detection_failure_reports_frame_and_releases_once() {
  let h = Harness::new();
  let err = h
    .run(RedactTask::default(), h.source(FRAMES), FailingModel { fail_at: 17 })
    .unwrap_err();

  assert!(matches!(err, TaskError::Detection { index: 17, .. }), "{err}");
  assert_eq!(err.frame_index(), Some(17));
  assert_eq!(h.written_indices(), (0..17).collect::<Vec<_>>());
  h.assert_closed_once();
}

#[test]
fn write_failure_reports_frame_and_releases_once() {
  let mut h = Harness::new();
  h.sink_fail_at = Some(5);
  let err = h
    .run(RedactTask::default(), h.source(FRAMES), StaticModel::default())
    .unwrap_err();

  assert!(matches!(err, TaskError::Write { index: 5, .. }), "{err}");
  assert_eq!(h.written.borrow().len(), 5);
  h.assert_closed_once();
}

#[test]
fn read_failure_reports_frame_and_releases_once() {
  let h = Harness::new();
  let mut source = h.source(FRAMES);
  source.fail_at = Some(9);
  let err = h
    .run(RedactTask::default(), source, StaticModel::default())
    .unwrap_err();

  assert!(matches!(err, TaskError::Read { index: 9, .. }), "{err}");
  assert_eq!(h.written.borrow().len(), 9);
  h.assert_closed_once();
}

#[test]
fn mismatched_frame_size_is_fatal() {
  let h = Harness::new();
  let mut source = h.source(10);
  source.bad_size_at = Some(4);
  let err = h
    .run(RedactTask::default(), source, StaticModel::default())
    .unwrap_err();

  assert!(matches!(err, TaskError::Write { index: 4, .. }), "{err}");
  assert_eq!(h.written.borrow().len(), 4);
  h.assert_closed_once();
}

#[test]
fn input_open_failure_opens_nothing_else() {
  let h = Harness::new();
  let err = RedactTask::default()
    .run_task(
      || Err::<MemSource, _>(io::Error::new(io::ErrorKind::NotFound, "no such file")),
      StaticModel::default(),
      |meta: &StreamMeta| {
        h.sink_opened.set(true);
        Ok::<_, io::Error>(MemSink {
          meta: *meta,
          written: h.written.clone(),
          fail_at: None,
          closes: h.sink_closes.clone(),
        })
      },
    )
    .unwrap_err();

  assert!(matches!(err, TaskError::OpenInput(_)));
  assert_eq!(err.exit_code(), 2);
  assert!(!h.sink_opened.get());
}

#[test]
fn output_open_failure_closes_input() {
  let h = Harness::new();
  let source = h.source(FRAMES);
  let err = RedactTask::default()
    .run_task(
      move || Ok::<_, io::Error>(source),
      StaticModel::default(),
      |_: &StreamMeta| Err::<MemSink, _>(io::Error::new(io::ErrorKind::PermissionDenied, "read-only")),
    )
    .unwrap_err();

  assert!(matches!(err, TaskError::OpenOutput(_)));
  assert_eq!(h.source_closes.get(), 1);
}

#[cfg(feature = "ffmpeg_io")]
#[test]
fn directory_output_fails_at_open() {
  use platemask::output::OutputWrapper;
  use url::Url;

  let h = Harness::new();
  let dir = tempfile::tempdir().unwrap();
  let url = Url::parse(&format!("video://{}", dir.path().display())).unwrap();
  let source = h.source(FRAMES);
  let err = RedactTask::default()
    .run_task(
      move || Ok::<_, io::Error>(source),
      StaticModel::new(vec![RawBox::new(0, 0, 10, 10)]),
      |meta: &StreamMeta| OutputWrapper::open(&url, meta),
    )
    .unwrap_err();

  assert!(matches!(err, TaskError::OpenOutput(_)), "{err}");
  assert_eq!(err.exit_code(), 2);
  assert_eq!(err.frame_index(), None);
  assert_eq!(h.source_closes.get(), 1);
}

#[test]
fn interrupt_stops_after_current_frame() {
  let h = Harness::new();
  let (tx, rx) = mpsc::channel();
  let task = RedactTask::default()
    .with_progress_every(10)
    .with_interrupt(rx)
    .with_observer(move |s: &ProgressSnapshot| {
      if s.frames_processed == 30 {
        let _ = tx.send(());
      }
    });
  let err = h.run(task, h.source(FRAMES), StaticModel::default()).unwrap_err();

  assert!(matches!(err, TaskError::Interrupted { processed: 30 }), "{err}");
  assert_eq!(err.exit_code(), 130);
  assert_eq!(h.written.borrow().len(), 30);
  h.assert_closed_once();
}

#[test]
fn progress_is_reported_every_n_frames() {
  let h = Harness::new();
  let seen = RefCell::new(Vec::new());
  let task = RedactTask::default()
    .with_progress_every(30)
    .with_observer(|s: &ProgressSnapshot| seen.borrow_mut().push(*s));
  h.run(task, h.source(FRAMES), StaticModel::default()).unwrap();

  let seen = seen.into_inner();
  assert_eq!(
    seen.iter().map(|s| s.frames_processed).collect::<Vec<_>>(),
    vec![30, 60]
  );
  assert_eq!(seen[0].percent(), Some(50.0));
  assert_eq!(seen[1].percent(), Some(100.0));
  assert!(seen[1].elapsed >= seen[0].elapsed);
}

#[test]
fn unknown_total_reports_indeterminate_progress() {
  let h = Harness::new();
  let mut source = h.source(20);
  source.meta.total_frames = 0;
  let seen = RefCell::new(Vec::new());
  let task = RedactTask::default()
    .with_progress_every(10)
    .with_observer(|s: &ProgressSnapshot| seen.borrow_mut().push(*s));
  let summary = h.run(task, source, StaticModel::default()).unwrap();

  assert_eq!(summary.frames, 20);
  assert_eq!(summary.frames_total, None);
  let seen = seen.into_inner();
  assert_eq!(seen.len(), 2);
  assert!(seen.iter().all(|s| s.frames_total.is_none() && s.percent().is_none()));
}
