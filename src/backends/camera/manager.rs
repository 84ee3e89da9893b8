// SPDX-License-Identifier: GPL-3.0-only

//! Capture device lifecycle manager
//!
//! Owns the opened device handle and its state. Lives on the background
//! context; every method is called from that one thread.

use super::types::*;
use super::{CameraBackend, CameraDeviceHandle};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a device event changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTransition {
    /// The device is open and ready for a session
    Opened,
    /// Access was lost; the device has been released
    Lost(DeviceState),
    /// Event did not apply to the current state
    Ignored,
}

/// Opens and closes the capture device
pub struct DeviceManager {
    backend: Arc<dyn CameraBackend>,
    camera_id: Option<String>,
    state: DeviceState,
    handle: Option<Box<dyn CameraDeviceHandle>>,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            backend,
            camera_id: None,
            state: DeviceState::Closed,
            handle: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Request access to `camera_id`; the outcome arrives as a [`DeviceEvent`]
    pub fn open(&mut self, camera_id: &str, events: CameraEventSink) -> BackendResult<()> {
        if matches!(self.state, DeviceState::Opening | DeviceState::Opened) {
            return Err(BackendError::InvalidState(format!(
                "device already {}",
                self.state
            )));
        }

        info!(camera = %camera_id, "Opening camera");
        self.camera_id = Some(camera_id.to_string());
        self.state = DeviceState::Opening;

        if let Err(e) = self.backend.open(camera_id, events) {
            error!(camera = %camera_id, error = %e, "Camera open request failed");
            self.state = DeviceState::Closed;
            return Err(e);
        }
        Ok(())
    }

    /// Apply an asynchronous open/runtime event
    ///
    /// Callers must discard any session before passing a `Disconnected` or
    /// `Error` event here, since the handle is released immediately.
    pub fn on_event(&mut self, event: DeviceEvent) -> DeviceTransition {
        match event {
            DeviceEvent::Opened(mut handle) => {
                if self.state != DeviceState::Opening {
                    // Open completed after close(); release it right away
                    info!(camera = %handle.id(), state = %self.state, "Closing late-opened camera");
                    handle.close();
                    return DeviceTransition::Ignored;
                }
                info!(camera = %handle.id(), "Camera opened");
                self.handle = Some(handle);
                self.state = DeviceState::Opened;
                DeviceTransition::Opened
            }
            DeviceEvent::Disconnected => self.lose(DeviceState::Disconnected),
            DeviceEvent::Error(code) => self.lose(DeviceState::Error(code)),
        }
    }

    fn lose(&mut self, new_state: DeviceState) -> DeviceTransition {
        if !matches!(self.state, DeviceState::Opening | DeviceState::Opened) {
            debug!(state = %self.state, event = %new_state, "Ignoring device event for inactive camera");
            return DeviceTransition::Ignored;
        }

        error!(
            camera = self.camera_id.as_deref().unwrap_or("?"),
            state = %new_state,
            "Camera access lost, stream ended"
        );
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        self.state = new_state;
        DeviceTransition::Lost(new_state)
    }

    /// The opened device, if any
    pub fn handle_mut(&mut self) -> Option<&mut (dyn CameraDeviceHandle + 'static)> {
        self.handle.as_deref_mut()
    }

    /// Release the device if held. Safe to call in any state.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            info!(camera = %handle.id(), "Closing camera");
            handle.close();
        } else if self.state == DeviceState::Opening {
            warn!("Closing while open is in flight; the late device will be released");
        }
        self.state = DeviceState::Closed;
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("camera_id", &self.camera_id)
            .field("state", &self.state)
            .finish()
    }
}
