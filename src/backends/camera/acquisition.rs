// SPDX-License-Identifier: GPL-3.0-only

//! Frame acquisition and dispatch
//!
//! Runs on the background context once per image-available notification.
//! Only the newest waiting image is taken; its luma plane is handed to the
//! [`ProcessingSink`] and the image is released right after, whatever the
//! sink returned. A leaked image would permanently occupy a queue slot and
//! stall capture once every slot is held.

use super::image_queue::{Image, ImageQueue};
use crate::errors::ProcessingError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// One grayscale frame, borrowed for the duration of a single dispatch
#[derive(Debug, Clone, Copy)]
pub struct FrameBuffer<'a> {
    pub width: u32,
    pub height: u32,
    /// Bytes per row in `data`, at least `width`
    pub row_stride: u32,
    pub data: &'a [u8],
    /// Capture order of this frame within its session
    pub sequence: u64,
    pub captured_at: Instant,
}

impl FrameBuffer<'_> {
    /// Visible pixels of row `y`, without stride padding
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.row_stride as usize;
        self.data.get(start..start + self.width as usize)
    }
}

/// External consumer of captured frames
///
/// Called on the background context, never on the UI thread. The frame may
/// not be retained past the call. Implementations should return well within
/// one frame interval; frames arriving meanwhile are dropped upstream.
pub trait ProcessingSink: Send + Sync {
    fn process(&self, frame: &FrameBuffer<'_>) -> Result<(), ProcessingError>;
}

/// What a single image-available notification resulted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing was waiting
    NoFrame,
    /// The sink accepted the frame
    Delivered,
    /// The sink returned an error or panicked
    SinkFailed,
    /// The image had no usable luma plane
    Malformed,
}

/// Running totals of dispatch outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub sink_failures: u64,
    pub spurious_wakeups: u64,
    pub malformed: u64,
}

/// Acquires images and forwards them to the processing sink
pub struct FrameDispatcher {
    sink: Arc<dyn ProcessingSink>,
    stats: DispatchStats,
}

impl FrameDispatcher {
    pub fn new(sink: Arc<dyn ProcessingSink>) -> Self {
        Self {
            sink,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Handle one image-available notification for `queue`
    pub fn on_image_available(&mut self, queue: &ImageQueue) -> DispatchOutcome {
        let Some(image) = queue.acquire_latest_image() else {
            trace!("Image notification with nothing waiting");
            self.stats.spurious_wakeups += 1;
            return DispatchOutcome::NoFrame;
        };

        let outcome = self.dispatch(&image);
        image.release();

        match outcome {
            DispatchOutcome::Delivered => self.stats.delivered += 1,
            DispatchOutcome::SinkFailed => self.stats.sink_failures += 1,
            DispatchOutcome::Malformed => self.stats.malformed += 1,
            DispatchOutcome::NoFrame => {}
        }
        outcome
    }

    fn dispatch(&self, image: &Image) -> DispatchOutcome {
        // Plane 0 is luma for every supported format
        let Some((data, row_stride)) = image.plane(0) else {
            warn!(sequence = image.sequence(), "Image has no luma plane");
            return DispatchOutcome::Malformed;
        };

        let frame = FrameBuffer {
            width: image.width(),
            height: image.height(),
            row_stride,
            data,
            sequence: image.sequence(),
            captured_at: image.captured_at(),
        };

        if row_stride < frame.width
            || data.len() < (frame.height as usize).saturating_sub(1) * row_stride as usize + frame.width as usize
        {
            warn!(
                sequence = frame.sequence,
                width = frame.width,
                height = frame.height,
                row_stride,
                len = data.len(),
                "Luma plane smaller than frame geometry"
            );
            return DispatchOutcome::Malformed;
        }

        let sink = &self.sink;
        match panic::catch_unwind(AssertUnwindSafe(|| sink.process(&frame))) {
            Ok(Ok(())) => {
                if frame.sequence % crate::constants::timing::FRAME_LOG_INTERVAL == 0 {
                    debug!(
                        sequence = frame.sequence,
                        latency_us = frame.captured_at.elapsed().as_micros() as u64,
                        "Frame dispatched"
                    );
                }
                DispatchOutcome::Delivered
            }
            Ok(Err(e)) => {
                warn!(sequence = frame.sequence, error = %e, "Processing sink rejected frame");
                DispatchOutcome::SinkFailed
            }
            Err(_) => {
                error!(sequence = frame.sequence, "Processing sink panicked");
                DispatchOutcome::SinkFailed
            }
        }
    }
}

impl std::fmt::Debug for FrameDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDispatcher")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
