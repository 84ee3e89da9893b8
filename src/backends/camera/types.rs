// SPDX-License-Identifier: GPL-3.0-only
// Shared types for camera backend abstraction

//! Shared types for camera backends

use super::CameraDeviceHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Represents a camera device as reported by enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    /// Logical id used to open the device (e.g. "virtual:0")
    pub id: String,
    /// Human readable name
    pub name: String,
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one frame
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for FrameSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel layout of images written into the processing queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Semi-planar 4:2:0 (Y plane followed by interleaved UV plane)
    Yuv420,
    /// Single 8-bit luma plane
    Gray8,
}

/// Location of one plane inside an image buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset from the start of the buffer
    pub offset: usize,
    /// Plane length in bytes
    pub len: usize,
    /// Bytes per row, including padding
    pub row_stride: u32,
}

/// Lifecycle of the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Closed,
    Opening,
    Opened,
    /// Hardware access was lost; terminal until the host restarts the pipeline
    Disconnected,
    /// The device reported an error code; terminal until restart
    Error(i32),
}

impl DeviceState {
    /// True for states that end the stream and require a fresh start
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceState::Disconnected | DeviceState::Error(_))
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Closed => write!(f, "closed"),
            DeviceState::Opening => write!(f, "opening"),
            DeviceState::Opened => write!(f, "opened"),
            DeviceState::Disconnected => write!(f, "disconnected"),
            DeviceState::Error(code) => write!(f, "error ({})", code),
        }
    }
}

/// Lifecycle of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unconfigured,
    Configuring,
    Active,
    /// Hardware rejected the configuration; a fresh configure is required
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Unconfigured => write!(f, "unconfigured"),
            SessionState::Configuring => write!(f, "configuring"),
            SessionState::Active => write!(f, "active"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Autofocus policy requested for a repeating capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfMode {
    Off,
    #[default]
    ContinuousPicture,
}

/// Destination surfaces of a capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTarget {
    Processing,
    Preview,
}

/// Repeating capture request submitted once a session is active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub targets: Vec<CaptureTarget>,
    pub af_mode: AfMode,
}

/// Outcome of an asynchronous device open
pub enum DeviceEvent {
    Opened(Box<dyn CameraDeviceHandle>),
    Disconnected,
    Error(i32),
}

impl std::fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEvent::Opened(handle) => write!(f, "Opened({})", handle.id()),
            DeviceEvent::Disconnected => write!(f, "Disconnected"),
            DeviceEvent::Error(code) => write!(f, "Error({})", code),
        }
    }
}

/// Outcome of an asynchronous session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Configured { session_id: u64 },
    ConfigureFailed { session_id: u64, reason: String },
}

/// Everything the hardware reports back to the pipeline
#[derive(Debug)]
pub enum CameraEvent {
    Device(DeviceEvent),
    Session(SessionEvent),
    /// An image was queued for the given session
    ImageAvailable { session_id: u64 },
}

/// Delivers camera events into the background context
///
/// Hardware code holds a clone of this and never learns where events go.
/// Returns `false` once the receiving context has stopped.
#[derive(Clone)]
pub struct CameraEventSink {
    deliver: Arc<dyn Fn(CameraEvent) -> bool + Send + Sync>,
}

impl CameraEventSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(CameraEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Send an event, returning whether it was accepted
    pub fn send(&self, event: CameraEvent) -> bool {
        (self.deliver)(event)
    }

    pub fn device(&self, event: DeviceEvent) -> bool {
        self.send(CameraEvent::Device(event))
    }

    pub fn session(&self, event: SessionEvent) -> bool {
        self.send(CameraEvent::Session(event))
    }
}

impl std::fmt::Debug for CameraEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraEventSink").finish_non_exhaustive()
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error types for backend operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Camera device not found
    DeviceNotFound(String),
    /// Hardware access was lost
    DeviceDisconnected,
    /// Device reported an error code
    DeviceError(i32),
    /// Session configuration was rejected
    ConfigurationFailed(String),
    /// Operation not valid in the current lifecycle state
    InvalidState(String),
    /// The background context no longer accepts work
    ContextStopped,
    /// Other errors
    Other(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::DeviceNotFound(msg) => write!(f, "Device not found: {}", msg),
            BackendError::DeviceDisconnected => write!(f, "Device disconnected"),
            BackendError::DeviceError(code) => write!(f, "Device error code {}", code),
            BackendError::ConfigurationFailed(msg) => {
                write!(f, "Session configuration failed: {}", msg)
            }
            BackendError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            BackendError::ContextStopped => write!(f, "Background context stopped"),
            BackendError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_device_states() {
        assert!(DeviceState::Disconnected.is_fatal());
        assert!(DeviceState::Error(3).is_fatal());
        assert!(!DeviceState::Opened.is_fatal());
        assert!(!DeviceState::Closed.is_fatal());
    }

    #[test]
    fn test_event_sink_reports_acceptance() {
        let sink = CameraEventSink::new(|event| matches!(event, CameraEvent::ImageAvailable { .. }));
        assert!(sink.send(CameraEvent::ImageAvailable { session_id: 1 }));
        assert!(!sink.device(DeviceEvent::Disconnected));
    }

    #[test]
    fn test_frame_size_display() {
        assert_eq!(FrameSize::new(640, 480).to_string(), "640x480");
        assert!(FrameSize::new(0, 480).is_empty());
    }
}
