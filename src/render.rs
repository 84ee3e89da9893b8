// SPDX-License-Identifier: GPL-3.0-only

//! Render loop and frame-rate measurement
//!
//! The render thread redraws whenever its [`RedrawTrigger`] fires. Every
//! redraw is counted, and once per reporting interval the windowed rate is
//! handed to a [`RateSink`]. The counter lives on the render thread only;
//! other threads see nothing but the delivered values.
//!
//! Reports are emitted from the redraw path: the first redraw after the
//! interval has elapsed closes the window and measures it. The interval is
//! therefore a lower bound on the reporting period, and a stalled trigger
//! produces no report until it fires again. The reported rate still covers
//! the real elapsed time, so a late report is accurate, only delayed.

use crate::backends::camera::frame_loop::{LoopAction, LoopController};
use crate::backends::camera::{BackendResult, FrameSize};
use crate::constants::render::FPS_SMOOTHING;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Frames counted over one reporting window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsSample {
    pub frames: u64,
    pub elapsed: Duration,
}

impl FpsSample {
    /// Frames per second over the window
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

/// Counts rendered frames and emits one sample per interval
#[derive(Debug, Clone)]
pub struct FpsCounter {
    interval: Duration,
    window_start: Option<Instant>,
    frames: u64,
    last_frame: Option<Instant>,
    smoothed: Option<f64>,
}

impl FpsCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            frames: 0,
            last_frame: None,
            smoothed: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a frame drawn at `now`
    ///
    /// The first frame opens the window. Returns a sample and resets the
    /// count once at least one interval has elapsed since the window opened.
    pub fn record_frame(&mut self, now: Instant) -> Option<FpsSample> {
        if let Some(last) = self.last_frame {
            let delta = now.saturating_duration_since(last).as_secs_f64();
            if delta > 0.0 {
                let instant = 1.0 / delta;
                self.smoothed = Some(match self.smoothed {
                    Some(prev) => prev * FPS_SMOOTHING + instant * (1.0 - FPS_SMOOTHING),
                    None => instant,
                });
            }
        }
        self.last_frame = Some(now);

        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return None;
        };

        self.frames += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.interval {
            return None;
        }

        let sample = FpsSample {
            frames: self.frames,
            elapsed,
        };
        self.window_start = Some(now);
        self.frames = 0;
        Some(sample)
    }

    /// Exponentially smoothed per-frame rate, if two frames have been seen
    pub fn smoothed(&self) -> Option<f64> {
        self.smoothed
    }

    /// Forget all history
    pub fn reset(&mut self) {
        self.window_start = None;
        self.frames = 0;
        self.last_frame = None;
        self.smoothed = None;
    }
}

/// Drawing target of the render loop
pub trait RenderSurface: Send {
    /// The surface exists; allocate drawing resources
    fn created(&mut self);

    /// The surface changed size
    fn resized(&mut self, width: u32, height: u32);

    /// Draw one frame
    fn draw(&mut self);
}

/// Receives each windowed frame rate
pub trait RateSink: Send {
    fn deliver(&mut self, fps: f64);
}

/// Host-provided redraw cadence
pub trait RedrawTrigger: Send {
    /// Block until the next redraw is due; `false` ends the render loop
    fn wait_next(&mut self) -> bool;
}

/// Fixed-rate redraw trigger
#[derive(Debug, Clone)]
pub struct IntervalTrigger {
    period: Duration,
    next: Option<Instant>,
}

impl IntervalTrigger {
    pub fn new(period: Duration) -> Self {
        Self { period, next: None }
    }

    pub fn from_hz(hz: u32) -> Self {
        Self::new(Duration::from_secs(1) / hz.max(1))
    }
}

impl RedrawTrigger for IntervalTrigger {
    fn wait_next(&mut self) -> bool {
        let now = Instant::now();
        let due = *self.next.get_or_insert(now);
        if due > now {
            thread::sleep(due - now);
        }
        let mut next = due + self.period;
        let now = Instant::now();
        if next < now {
            next = now + self.period;
        }
        self.next = Some(next);
        true
    }
}

/// Surface that draws nothing; lets the loop run without a display
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    size: Option<FrameSize>,
    frames: u64,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> Option<FrameSize> {
        self.size
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames
    }
}

impl RenderSurface for HeadlessSurface {
    fn created(&mut self) {
        debug!("Headless surface created");
    }

    fn resized(&mut self, width: u32, height: u32) {
        self.size = Some(FrameSize::new(width, height));
    }

    fn draw(&mut self) {
        self.frames += 1;
    }
}

/// Surface callbacks plus frame counting
pub struct RenderLoop<S, R> {
    surface: S,
    rates: R,
    counter: FpsCounter,
}

impl<S: RenderSurface, R: RateSink> RenderLoop<S, R> {
    pub fn new(surface: S, rates: R, report_interval: Duration) -> Self {
        Self {
            surface,
            rates,
            counter: FpsCounter::new(report_interval),
        }
    }

    pub fn on_surface_created(&mut self) {
        self.counter.reset();
        self.surface.created();
    }

    pub fn on_surface_changed(&mut self, width: u32, height: u32) {
        debug!(width, height, "Render surface resized");
        self.surface.resized(width, height);
    }

    /// Draw and count one frame, delivering the rate when a window closes
    pub fn on_draw_frame(&mut self, now: Instant) -> Option<FpsSample> {
        self.surface.draw();
        let sample = self.counter.record_frame(now)?;
        let fps = sample.rate();
        trace!(
            fps,
            frames = sample.frames,
            smoothed = self.counter.smoothed().unwrap_or(0.0),
            "Render rate"
        );
        self.rates.deliver(fps);
        Some(sample)
    }

    pub fn smoothed_fps(&self) -> Option<f64> {
        self.counter.smoothed()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }
}

/// Parameters of a render thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSettings {
    pub surface_size: FrameSize,
    pub report_interval: Duration,
}

/// Dedicated thread running a [`RenderLoop`]
///
/// The loop state, including the rate sink, is dropped on the render thread
/// when it exits, so once [`RenderThread::stop`] returns the sink has been
/// released and nothing more is delivered.
pub struct RenderThread {
    controller: LoopController,
}

impl RenderThread {
    pub fn spawn<S, R, T>(surface: S, rates: R, mut trigger: T, settings: RenderSettings) -> BackendResult<Self>
    where
        S: RenderSurface + 'static,
        R: RateSink + 'static,
        T: RedrawTrigger + 'static,
    {
        info!(
            size = %settings.surface_size,
            interval_ms = settings.report_interval.as_millis() as u64,
            "Starting render thread"
        );
        let controller = LoopController::start_with_init(
            "render",
            move || {
                let mut render = RenderLoop::new(surface, rates, settings.report_interval);
                render.on_surface_created();
                render.on_surface_changed(settings.surface_size.width, settings.surface_size.height);
                Ok(render)
            },
            move |render: &mut RenderLoop<S, R>| {
                if !trigger.wait_next() {
                    return LoopAction::Stop;
                }
                render.on_draw_frame(Instant::now());
                LoopAction::Continue
            },
        )?;
        Ok(Self { controller })
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Stop redrawing and wait for the render thread
    pub fn stop(&mut self) {
        self.controller.stop();
    }
}

impl std::fmt::Debug for RenderThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderThread")
            .field("running", &self.is_running())
            .finish()
    }
}
