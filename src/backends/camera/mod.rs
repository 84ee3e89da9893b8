// SPDX-License-Identifier: GPL-3.0-only

//! Camera capture backend
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐       start()/stop()
//! │  Host (CLI / UI)     │ ──────────────────────┐
//! └──────────────────────┘                       ▼
//!                                   ┌────────────────────────┐
//!                                   │    CapturePipeline     │
//!                                   └───────────┬────────────┘
//!                                               │ PipelineEvent
//!                                               ▼
//!  hardware threads ── CameraEvent ──▶ ┌────────────────────────┐
//!                                      │  BackgroundContext     │  one worker thread
//!                                      │  ├─ DeviceManager      │
//!                                      │  ├─ SessionManager     │
//!                                      │  └─ FrameDispatcher ───┼──▶ ProcessingSink
//!                                      └────────────────────────┘
//! ```
//!
//! The hardware is reached only through the [`CameraBackend`] and
//! [`CameraDeviceHandle`] traits. Everything the hardware reports comes back
//! asynchronously as a [`CameraEvent`] through a [`CameraEventSink`], which the
//! pipeline routes into its background context.

pub mod acquisition;
pub mod background;
pub mod frame_loop;
pub mod image_queue;
pub mod manager;
pub mod pipeline;
pub mod session;
pub mod types;
pub mod virtual_sensor;

pub use acquisition::{FrameBuffer, FrameDispatcher, ProcessingSink};
pub use background::{BackgroundContext, ContextHandle};
pub use image_queue::{Image, ImageQueue, ImageWriter};
pub use manager::DeviceManager;
pub use pipeline::{CapturePipeline, PipelineSettings, PipelineStatus};
pub use session::{CapturePolicy, PreviewSink, SessionManager};
pub use types::*;
pub use virtual_sensor::VirtualCameraBackend;

/// Session parameters handed to the hardware
pub struct SessionConfig {
    /// Pipeline-assigned id, echoed back in session events
    pub session_id: u64,
    pub size: FrameSize,
    pub format: PixelFormat,
    /// Queue receiving processing frames
    pub processing: ImageWriter,
    /// Whether a preview surface is attached
    pub preview: bool,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("session_id", &self.session_id)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("preview", &self.preview)
            .finish()
    }
}

/// Entry point to a camera provider
pub trait CameraBackend: Send + Sync {
    /// Enumerate available cameras
    fn enumerate_cameras(&self) -> Vec<CameraDevice>;

    /// Output sizes a camera supports for `format`
    fn output_sizes(&self, camera_id: &str, format: PixelFormat) -> BackendResult<Vec<FrameSize>>;

    /// Request access to a camera
    ///
    /// Returns once the request is submitted. The outcome arrives later on
    /// `events` as exactly one of `DeviceEvent::Opened`, `Disconnected` or
    /// `Error`. After `Opened`, the device keeps using `events` for session
    /// events, image notifications and runtime disconnects.
    fn open(&self, camera_id: &str, events: CameraEventSink) -> BackendResult<()>;
}

/// An opened camera
///
/// Dropping a handle closes the device.
pub trait CameraDeviceHandle: Send {
    fn id(&self) -> &str;

    /// Output sizes supported for `format`
    fn output_sizes(&self, format: PixelFormat) -> Vec<FrameSize>;

    /// Submit a session configuration
    ///
    /// Completion is reported as `SessionEvent::Configured` or
    /// `SessionEvent::ConfigureFailed` carrying `config.session_id`. A new
    /// configuration supersedes any earlier one.
    fn create_session(&mut self, config: SessionConfig) -> BackendResult<()>;

    /// Start streaming for a configured session
    fn set_repeating_request(&mut self, session_id: u64, request: CaptureRequest)
    -> BackendResult<()>;

    /// Stop streaming and discard the session
    ///
    /// When this returns no further image is written for `session_id`.
    fn abort_session(&mut self, session_id: u64);

    /// Release the device. Idempotent.
    fn close(&mut self);
}
