// SPDX-License-Identifier: MPL-2.0

//! edgecam - camera capture with frame dispatch and render throughput readout
//!
//! Frames from a camera are delivered to a processing sink on a background
//! thread, while an independent render loop measures its own redraw rate and
//! reports it to the UI thread.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Camera abstraction, capture pipeline and synthetic sensor
//! - [`render`]: Render loop and frame-rate measurement
//! - [`ui`]: Marshaling of render results onto the UI thread
//! - [`config`]: User configuration handling
//! - [`errors`]: Application and processing errors
//!
//! # Example
//!
//! ```ignore
//! let backend = Arc::new(VirtualCameraBackend::default());
//! let mut pipeline = CapturePipeline::new(backend, PipelineSettings::default(), sink, None);
//! pipeline.start()?;
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod render;
pub mod ui;

// Re-export commonly used types
pub use backends::camera::{CapturePipeline, PipelineSettings, PipelineStatus, ProcessingSink};
pub use config::Config;
pub use errors::{AppError, AppResult, ProcessingError};
