// SPDX-License-Identifier: GPL-3.0-only

//! Capture pipeline
//!
//! Ties the device manager, session manager and frame dispatcher together on
//! one background context. Host calls and hardware callbacks are both turned
//! into [`PipelineEvent`]s and processed strictly in order on that context,
//! so no lifecycle state is ever touched from two threads.
//!
//! Lifecycle:
//!
//! ```text
//! start() ─▶ Open ─▶ Opened ─▶ configure ─▶ Configured ─▶ repeating request
//!                                                              │
//!                        ImageAvailable ─▶ dispatch ◀──────────┘
//! stop()  ─▶ Shutdown ─▶ session teardown ─▶ device close ─▶ context drained
//! ```
//!
//! Losing the device (disconnect or error) ends the stream. There is no
//! automatic retry; the host restarts the pipeline.

use super::acquisition::{DispatchStats, FrameDispatcher, ProcessingSink};
use super::background::{BackgroundContext, ContextHandle};
use super::image_queue::QueueStats;
use super::manager::{DeviceManager, DeviceTransition};
use super::session::{CapturePolicy, PreviewSink, SessionManager, SessionTransition};
use super::types::*;
use super::CameraBackend;
use crate::constants::{capture, timing};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Work items processed on the pipeline's background context
pub enum PipelineEvent {
    /// Request access to the configured camera
    Open,
    /// (Re)configure the capture session on the opened device
    Configure,
    /// Callback from the hardware
    Camera(CameraEvent),
    /// Release everything, then acknowledge on the channel
    Shutdown(mpsc::SyncSender<()>),
}

impl std::fmt::Debug for PipelineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineEvent::Open => write!(f, "Open"),
            PipelineEvent::Configure => write!(f, "Configure"),
            PipelineEvent::Camera(event) => write!(f, "Camera({:?})", event),
            PipelineEvent::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

/// Snapshot of the pipeline published after every processed event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStatus {
    pub device: DeviceState,
    pub session: SessionState,
    pub session_id: Option<u64>,
    pub capture_size: Option<FrameSize>,
    pub dispatch: DispatchStats,
    /// Counters of the most recent session's queue
    pub queue: QueueStats,
    pub last_error: Option<BackendError>,
}

/// Pipeline parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub camera_id: String,
    pub policy: CapturePolicy,
    pub shutdown_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            camera_id: capture::DEFAULT_CAMERA_ID.to_string(),
            policy: CapturePolicy::default(),
            shutdown_timeout: timing::SHUTDOWN_TIMEOUT,
        }
    }
}

/// State machine living on the background context
struct CaptureController {
    camera_id: String,
    devices: DeviceManager,
    sessions: SessionManager,
    dispatcher: FrameDispatcher,
    events: CameraEventSink,
    status: watch::Sender<PipelineStatus>,
    last_error: Option<BackendError>,
    /// Raised by the host before shutdown is queued; events still waiting
    /// ahead of it must not reach the sink
    halted: Arc<AtomicBool>,
}

impl CaptureController {
    fn handle(&mut self, event: PipelineEvent) {
        trace!(?event, "Pipeline event");
        match event {
            PipelineEvent::Open => self.open(),
            PipelineEvent::Configure => self.configure(),
            PipelineEvent::Camera(CameraEvent::Device(event)) => self.on_device_event(event),
            PipelineEvent::Camera(CameraEvent::Session(event)) => self.on_session_event(event),
            PipelineEvent::Camera(CameraEvent::ImageAvailable { session_id }) => {
                self.on_image_available(session_id)
            }
            PipelineEvent::Shutdown(reply) => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
        self.publish();
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn open(&mut self) {
        if self.is_halted() {
            return;
        }
        if let Err(e) = self.devices.open(&self.camera_id, self.events.clone()) {
            self.last_error = Some(e);
        }
    }

    fn configure(&mut self) {
        if self.is_halted() {
            return;
        }
        let Some(device) = self.devices.handle_mut() else {
            debug!(state = %self.devices.state(), "Configure requested without an opened device");
            return;
        };
        if let Err(e) = self.sessions.configure(device, self.events.clone()) {
            self.last_error = Some(e);
        }
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        let losing = matches!(event, DeviceEvent::Disconnected | DeviceEvent::Error(_));
        if losing {
            // The session goes before the device it runs on
            self.sessions.teardown(self.devices.handle_mut());
        }

        match self.devices.on_event(event) {
            DeviceTransition::Opened => self.configure(),
            DeviceTransition::Lost(state) => {
                error!(camera = %self.camera_id, state = %state, "Capture stopped, restart required");
                self.last_error = Some(match state {
                    DeviceState::Error(code) => BackendError::DeviceError(code),
                    _ => BackendError::DeviceDisconnected,
                });
            }
            DeviceTransition::Ignored => {}
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let reason = match &event {
            SessionEvent::ConfigureFailed { reason, .. } => Some(reason.clone()),
            SessionEvent::Configured { .. } => None,
        };
        let Some(device) = self.devices.handle_mut() else {
            debug!(?event, "Session event without an opened device");
            return;
        };
        if self.sessions.on_event(device, event) == SessionTransition::Failed {
            self.last_error = Some(BackendError::ConfigurationFailed(
                reason.unwrap_or_else(|| "repeating request rejected".to_string()),
            ));
        }
    }

    fn on_image_available(&mut self, session_id: u64) {
        if self.is_halted() {
            trace!(session_id, "Image notification after stop, not dispatching");
            return;
        }
        match self.sessions.take_ready(session_id) {
            Some(queue) => {
                self.dispatcher.on_image_available(queue);
            }
            None => trace!(session_id, "Image notification for inactive session"),
        }
    }

    fn shutdown(&mut self) {
        self.halted.store(true, Ordering::Release);
        self.sessions.teardown(self.devices.handle_mut());
        self.devices.close();
        info!(camera = %self.camera_id, "Capture pipeline released");
    }

    fn publish(&self) {
        let session = self.sessions.current();
        let device = self.devices.state();
        let dispatch = self.dispatcher.stats();
        let queue = session.map(|s| s.queue().stats());
        let last_error = self.last_error.clone();

        self.status.send_modify(|status| {
            status.device = device;
            status.session = session.map(|s| s.state).unwrap_or_default();
            status.session_id = session.map(|s| s.id);
            status.capture_size = session.map(|s| s.size);
            status.dispatch = dispatch;
            if let Some(queue) = queue {
                status.queue = queue;
            }
            status.last_error = last_error;
        });
    }
}

/// Cloneable, thread-safe control handle for a running pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    context: ContextHandle<PipelineEvent>,
}

impl PipelineHandle {
    /// Reconfigure the session; any current session is replaced
    pub fn configure(&self) -> BackendResult<()> {
        self.context.post(PipelineEvent::Configure)
    }

    pub fn is_running(&self) -> bool {
        self.context.is_accepting()
    }
}

/// Frame capture pipeline for one camera
///
/// # Example
///
/// ```ignore
/// let mut pipeline = CapturePipeline::new(backend, settings, sink, None);
/// pipeline.start()?;
/// // frames flow into `sink` on the background context
/// pipeline.stop();
/// ```
pub struct CapturePipeline {
    backend: Arc<dyn CameraBackend>,
    settings: PipelineSettings,
    sink: Arc<dyn ProcessingSink>,
    preview: Option<Arc<dyn PreviewSink>>,
    context: Option<BackgroundContext<PipelineEvent>>,
    halted: Arc<AtomicBool>,
    status: watch::Sender<PipelineStatus>,
}

impl CapturePipeline {
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        settings: PipelineSettings,
        sink: Arc<dyn ProcessingSink>,
        preview: Option<Arc<dyn PreviewSink>>,
    ) -> Self {
        let (status, _) = watch::channel(PipelineStatus::default());
        Self {
            backend,
            settings,
            sink,
            preview,
            context: None,
            halted: Arc::new(AtomicBool::new(false)),
            status,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Start the background context and request the camera
    ///
    /// Returns once the open request is queued; the device opens and the
    /// session is configured asynchronously.
    pub fn start(&mut self) -> BackendResult<()> {
        if self.context.is_some() {
            return Err(BackendError::InvalidState("pipeline already started".into()));
        }

        info!(
            camera = %self.settings.camera_id,
            preferred = %self.settings.policy.preferred_size,
            fallback = %self.settings.policy.fallback_size,
            "Starting capture pipeline"
        );
        self.status.send_replace(PipelineStatus::default());

        let backend = Arc::clone(&self.backend);
        let camera_id = self.settings.camera_id.clone();
        let policy = self.settings.policy.clone();
        let sink = Arc::clone(&self.sink);
        let preview = self.preview.clone();
        let status = self.status.clone();
        // A fresh flag per run; a detached context from an earlier run keeps its own
        self.halted = Arc::new(AtomicBool::new(false));
        let halted = Arc::clone(&self.halted);

        let context = BackgroundContext::start_with("capture-bg", move |handle| {
            let events = CameraEventSink::new(move |event| handle.post(PipelineEvent::Camera(event)).is_ok());
            let mut controller = CaptureController {
                camera_id,
                devices: DeviceManager::new(backend),
                sessions: SessionManager::new(policy, preview),
                dispatcher: FrameDispatcher::new(sink),
                events,
                status,
                last_error: None,
                halted,
            };
            move |event| controller.handle(event)
        })?;

        context.post(PipelineEvent::Open)?;
        self.context = Some(context);
        Ok(())
    }

    /// Release the session and device, then stop the background context
    ///
    /// Idempotent. No frame is handed to the sink once this returns; a
    /// dispatch already running may still finish. Waits at most the
    /// configured shutdown timeout in total and returns `false` if the
    /// context had to be abandoned.
    pub fn stop(&mut self) -> bool {
        let Some(mut context) = self.context.take() else {
            return true;
        };
        let timeout = self.settings.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        info!(camera = %self.settings.camera_id, "Stopping capture pipeline");

        // Notifications queued ahead of the shutdown event are skipped
        self.halted.store(true, Ordering::Release);

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let released = match context.post(PipelineEvent::Shutdown(reply_tx)) {
            Ok(()) => match reply_rx.recv_timeout(timeout) {
                Ok(()) => true,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Camera release timed out");
                    false
                }
                Err(RecvTimeoutError::Disconnected) => false,
            },
            Err(e) => {
                warn!(error = %e, "Background context already stopped");
                false
            }
        };

        let drained = context.stop(deadline.saturating_duration_since(Instant::now()));
        released && drained
    }

    /// Request a new session on the opened device
    pub fn configure(&self) -> BackendResult<()> {
        match &self.context {
            Some(context) => context.post(PipelineEvent::Configure),
            None => Err(BackendError::ContextStopped),
        }
    }

    /// Control handle usable from other threads
    pub fn handle(&self) -> Option<PipelineHandle> {
        self.context.as_ref().map(|context| PipelineHandle {
            context: context.handle(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.context.as_ref().is_some_and(|c| c.is_running())
    }

    /// Latest published status
    pub fn status(&self) -> PipelineStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified whenever the status changes
    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.subscribe()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::FrameBuffer;
    use crate::backends::camera::virtual_sensor::{VirtualCameraBackend, VirtualSensorSettings};
    use crate::errors::ProcessingError;

    struct NullSink;

    impl ProcessingSink for NullSink {
        fn process(&self, _frame: &FrameBuffer<'_>) -> Result<(), ProcessingError> {
            Ok(())
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn fast_backend() -> Arc<VirtualCameraBackend> {
        Arc::new(VirtualCameraBackend::new(VirtualSensorSettings {
            open_latency: Duration::from_millis(1),
            configure_latency: Duration::from_millis(1),
            ..Default::default()
        }))
    }

    #[test]
    fn test_start_reaches_active_session() {
        let backend = fast_backend();
        let mut pipeline = CapturePipeline::new(
            backend.clone(),
            PipelineSettings::default(),
            Arc::new(NullSink),
            None,
        );
        pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(BackendError::InvalidState(_))));

        assert!(wait_until(|| pipeline.status().dispatch.delivered > 0));
        let status = pipeline.status();
        assert_eq!(status.device, DeviceState::Opened);
        assert_eq!(status.session, SessionState::Active);
        assert_eq!(status.capture_size, Some(FrameSize::new(640, 480)));

        assert!(pipeline.stop());
        assert!(pipeline.stop());
        assert_eq!(pipeline.status().device, DeviceState::Closed);
        assert_eq!(backend.stats().open_devices, 0);
        assert_eq!(backend.stats().active_streams, 0);
    }

    #[test]
    fn test_unknown_camera_records_error() {
        let settings = PipelineSettings {
            camera_id: "virtual:404".into(),
            ..Default::default()
        };
        let mut pipeline = CapturePipeline::new(fast_backend(), settings, Arc::new(NullSink), None);
        pipeline.start().unwrap();
        assert!(wait_until(|| pipeline.status().last_error.is_some()));
        assert_eq!(
            pipeline.status().last_error,
            Some(BackendError::DeviceNotFound("virtual:404".into()))
        );
        assert_eq!(pipeline.status().device, DeviceState::Closed);
    }

    #[test]
    fn test_configure_before_start_is_rejected() {
        let pipeline = CapturePipeline::new(
            fast_backend(),
            PipelineSettings::default(),
            Arc::new(NullSink),
            None,
        );
        assert_eq!(pipeline.configure(), Err(BackendError::ContextStopped));
        assert!(pipeline.handle().is_none());
    }
}
