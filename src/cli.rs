// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Listing available cameras
//! - Running the capture pipeline with a frame-rate readout
//! - Printing the effective configuration

use edgecam::backends::camera::{
    CameraBackend, CapturePipeline, DeviceState, FrameBuffer, FrameSize, PixelFormat,
    PreviewSink, ProcessingSink, SessionState, VirtualCameraBackend,
};
use edgecam::config::Config;
use edgecam::constants::get_resolution_label;
use edgecam::errors::ProcessingError;
use edgecam::render::{HeadlessSurface, IntervalTrigger, RenderSettings, RenderThread};
use edgecam::ui::UiContext;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Running luma statistics over processed frames
#[derive(Debug, Clone, Copy, Default)]
struct LumaStats {
    frames: u64,
    last_mean: f64,
    min_mean: Option<f64>,
    max_mean: Option<f64>,
}

/// Processing sink computing the mean brightness of each frame
#[derive(Default)]
struct LumaStatsSink {
    stats: Mutex<LumaStats>,
}

impl LumaStatsSink {
    fn snapshot(&self) -> LumaStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProcessingSink for LumaStatsSink {
    fn process(&self, frame: &FrameBuffer<'_>) -> Result<(), ProcessingError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(ProcessingError::UnsupportedFrame(format!(
                "{}x{}",
                frame.width, frame.height
            )));
        }

        let mut sum = 0u64;
        for y in 0..frame.height {
            let row = frame
                .row(y)
                .ok_or_else(|| ProcessingError::Failed(format!("row {} out of bounds", y)))?;
            sum += row.iter().map(|&b| b as u64).sum::<u64>();
        }
        let mean = sum as f64 / (frame.width as u64 * frame.height as u64) as f64;

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.frames += 1;
        stats.last_mean = mean;
        stats.min_mean = Some(stats.min_mean.map_or(mean, |m| m.min(mean)));
        stats.max_mean = Some(stats.max_mean.map_or(mean, |m| m.max(mean)));
        Ok(())
    }
}

/// Preview target that only records the negotiated size
struct HeadlessPreview;

impl PreviewSink for HeadlessPreview {
    fn set_buffer_size(&self, size: FrameSize) {
        info!(size = %size, "Preview buffer size set");
    }
}

/// List all available cameras
pub fn list_cameras(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let backend = VirtualCameraBackend::new(config.sensor_settings());
    let cameras = backend.enumerate_cameras();

    if cameras.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }

    println!("Available cameras:");
    println!();
    for camera in &cameras {
        println!("  [{}] {}", camera.id, camera.name);

        let mut sizes = backend.output_sizes(&camera.id, PixelFormat::Yuv420)?;
        // Sort by resolution (highest first)
        sizes.sort_by_key(|s| std::cmp::Reverse(s.area()));
        let size_strs: Vec<String> = sizes
            .iter()
            .map(|s| match get_resolution_label(s.width) {
                Some(label) => format!("{} ({})", s, label),
                None => s.to_string(),
            })
            .collect();
        if !size_strs.is_empty() {
            println!("      Sizes: {}", size_strs.join(", "));
        }
        println!();
    }

    Ok(())
}

/// Print the effective configuration as JSON
pub fn print_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Run the capture pipeline and render loop until `duration` or Ctrl+C
pub fn run_capture(
    config: &Config,
    camera: Option<String>,
    duration: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = config.clone();
    if let Some(camera) = camera {
        config.camera_id = camera;
    }

    let backend = Arc::new(VirtualCameraBackend::new(config.sensor_settings()));
    let sink = Arc::new(LumaStatsSink::default());
    let preview: Option<Arc<dyn PreviewSink>> = if config.capture.preview_enabled {
        Some(Arc::new(HeadlessPreview))
    } else {
        None
    };

    let settings = config.pipeline_settings();
    println!("Using camera: {}", settings.camera_id);

    let mut pipeline = CapturePipeline::new(backend.clone(), settings, sink.clone(), preview);
    pipeline.start()?;

    let (mut ui, ui_handle) = UiContext::new(config.ui_queue_capacity());
    let mut render = RenderThread::spawn(
        HeadlessSurface::new(),
        ui_handle,
        IntervalTrigger::from_hz(config.timing.render_rate_hz),
        RenderSettings {
            surface_size: config.capture.preferred_size,
            report_interval: config.timing.fps_report_interval(),
        },
    )?;

    match duration {
        Some(secs) => println!("Running for {} seconds (press Ctrl+C to stop early)", secs),
        None => println!("Running... (press Ctrl+C to stop)"),
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut status_rx = pipeline.subscribe();

    runtime.block_on(async {
        let deadline = async {
            match duration {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let stats_sink = Arc::clone(&sink);
        let mut listener = move |fps: f64| {
            let stats = stats_sink.snapshot();
            println!(
                "FPS: {:.1} | processed: {} | mean luma: {:.1}",
                fps, stats.frames, stats.last_mean
            );
        };
        let mut announced = None;

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = &mut ctrl_c => {
                    println!();
                    println!("Stopping early...");
                    break;
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = status_rx.borrow_and_update().clone();
                    let ended = status.device.is_fatal()
                        || status.session == SessionState::Failed
                        || status.device == DeviceState::Closed;
                    if let (true, Some(error)) = (ended, &status.last_error) {
                        eprintln!("Capture stopped: {}", error);
                        break;
                    }
                    if announced != status.session_id && status.capture_size.is_some() {
                        announced = status.session_id;
                        if let Some(size) = status.capture_size {
                            println!("Capture size: {}", size);
                        }
                    }
                }
                alive = ui.next(&mut listener) => {
                    if !alive {
                        break;
                    }
                }
            }
        }
    });

    render.stop();
    let status = pipeline.status();
    pipeline.stop();

    let luma = sink.snapshot();
    let sensor = backend.stats();
    println!();
    println!("Frames produced:  {}", sensor.frames_produced);
    println!("Frames processed: {}", status.dispatch.delivered);
    println!("Frames dropped:   {}", status.queue.dropped);
    println!("Sink failures:    {}", status.dispatch.sink_failures);
    if let (Some(min), Some(max)) = (luma.min_mean, luma.max_mean) {
        println!("Mean luma range:  {:.1} - {:.1}", min, max);
    }

    Ok(())
}
