// SPDX-License-Identifier: GPL-3.0-only

//! Capture session configuration
//!
//! A session binds the opened device to the processing queue and, optionally,
//! a preview surface. Only one session exists at a time: configuring again
//! tears the previous one down first, and acknowledgements for a superseded
//! session are ignored.

use super::image_queue::ImageQueue;
use super::types::*;
use super::{CameraDeviceHandle, SessionConfig};
use crate::constants::capture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// External preview surface; only told the buffer size to allocate
pub trait PreviewSink: Send + Sync {
    fn set_buffer_size(&self, size: FrameSize);
}

/// Resolution and queue policy for new sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePolicy {
    /// Used when the device offers exactly this size
    pub preferred_size: FrameSize,
    /// Used otherwise
    pub fallback_size: FrameSize,
    /// Queue capacity (queued + held images)
    pub max_images: usize,
    pub format: PixelFormat,
    pub af_mode: AfMode,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            preferred_size: capture::PREFERRED_SIZE,
            fallback_size: capture::FALLBACK_SIZE,
            max_images: capture::MAX_IMAGES,
            format: PixelFormat::Yuv420,
            af_mode: AfMode::ContinuousPicture,
        }
    }
}

/// Pick the capture size: the preferred size on exact match, else the fallback
pub fn select_capture_size(supported: &[FrameSize], policy: &CapturePolicy) -> FrameSize {
    if supported.contains(&policy.preferred_size) {
        policy.preferred_size
    } else {
        debug!(
            preferred = %policy.preferred_size,
            fallback = %policy.fallback_size,
            supported = supported.len(),
            "Preferred capture size unavailable, using fallback"
        );
        policy.fallback_size
    }
}

/// The current capture session
#[derive(Debug)]
pub struct CaptureSession {
    pub id: u64,
    pub state: SessionState,
    pub size: FrameSize,
    pub targets: Vec<CaptureTarget>,
    queue: ImageQueue,
    /// Set while an image-available notification is in flight
    notified: Arc<AtomicBool>,
}

impl CaptureSession {
    pub fn queue(&self) -> &ImageQueue {
        &self.queue
    }
}

/// What a session event changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    Active,
    Failed,
    Ignored,
}

/// Creates, activates and tears down capture sessions
pub struct SessionManager {
    policy: CapturePolicy,
    preview: Option<Arc<dyn PreviewSink>>,
    next_id: u64,
    current: Option<CaptureSession>,
}

impl SessionManager {
    pub fn new(policy: CapturePolicy, preview: Option<Arc<dyn PreviewSink>>) -> Self {
        Self {
            policy,
            preview,
            next_id: 1,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&CaptureSession> {
        self.current.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.current
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Unconfigured)
    }

    /// Configure a new session on `device`, replacing any existing one
    ///
    /// `events` receives an `ImageAvailable` notification when frames are
    /// waiting in the new session's queue; notifications are coalesced until
    /// consumed with [`SessionManager::take_ready`].
    ///
    /// Returns the new session id; activation is reported later through
    /// [`SessionManager::on_event`].
    pub fn configure(
        &mut self,
        device: &mut (dyn CameraDeviceHandle + 'static),
        events: CameraEventSink,
    ) -> BackendResult<u64> {
        self.teardown(Some(&mut *device));

        let supported = device.output_sizes(self.policy.format);
        let size = select_capture_size(&supported, &self.policy);
        let session_id = self.next_id;
        self.next_id += 1;

        let queue = ImageQueue::new(size, self.policy.format, self.policy.max_images);
        // At most one notification in flight; the consumer always takes the newest image
        let notified = Arc::new(AtomicBool::new(false));
        let pending = Arc::clone(&notified);
        queue.set_listener(move || {
            if pending.swap(true, Ordering::AcqRel) {
                return;
            }
            if !events.send(CameraEvent::ImageAvailable { session_id }) {
                pending.store(false, Ordering::Release);
            }
        });

        let mut targets = vec![CaptureTarget::Processing];
        if let Some(preview) = &self.preview {
            preview.set_buffer_size(size);
            targets.push(CaptureTarget::Preview);
        }

        info!(
            camera = %device.id(),
            session_id,
            size = %size,
            preview = self.preview.is_some(),
            "Configuring capture session"
        );

        let config = SessionConfig {
            session_id,
            size,
            format: self.policy.format,
            processing: queue.writer(),
            preview: self.preview.is_some(),
        };

        let submitted = device.create_session(config);
        let state = if submitted.is_ok() {
            SessionState::Configuring
        } else {
            SessionState::Failed
        };
        self.current = Some(CaptureSession {
            id: session_id,
            state,
            size,
            targets,
            queue,
            notified,
        });

        match submitted {
            Ok(()) => Ok(session_id),
            Err(e) => {
                error!(session_id, error = %e, "Session configuration could not be submitted");
                if let Some(session) = &self.current {
                    session.queue.close();
                }
                Err(e)
            }
        }
    }

    /// Apply a configuration acknowledgement from the hardware
    pub fn on_event(
        &mut self,
        device: &mut (dyn CameraDeviceHandle + 'static),
        event: SessionEvent,
    ) -> SessionTransition {
        let af_mode = self.policy.af_mode;
        let (event_id, failure) = match event {
            SessionEvent::Configured { session_id } => (session_id, None),
            SessionEvent::ConfigureFailed { session_id, reason } => (session_id, Some(reason)),
        };

        let Some(session) = self
            .current
            .as_mut()
            .filter(|s| s.id == event_id && s.state == SessionState::Configuring)
        else {
            debug!(session_id = event_id, "Ignoring event for superseded session");
            return SessionTransition::Ignored;
        };

        if let Some(reason) = failure {
            error!(session_id = event_id, reason = %reason, "Session configuration rejected");
            session.state = SessionState::Failed;
            session.queue.close();
            return SessionTransition::Failed;
        }

        let request = CaptureRequest {
            targets: session.targets.clone(),
            af_mode,
        };
        match device.set_repeating_request(session.id, request) {
            Ok(()) => {
                info!(session_id = session.id, size = %session.size, "Capture session active");
                session.state = SessionState::Active;
                SessionTransition::Active
            }
            Err(e) => {
                error!(session_id = session.id, error = %e, "Repeating request rejected");
                session.state = SessionState::Failed;
                session.queue.close();
                SessionTransition::Failed
            }
        }
    }

    /// Consume the pending notification of `session_id` and return its queue
    ///
    /// Images queued after this call raise a new notification.
    pub fn take_ready(&self, session_id: u64) -> Option<&ImageQueue> {
        let session = self.current.as_ref().filter(|s| s.id == session_id)?;
        session.notified.store(false, Ordering::Release);
        (session.state == SessionState::Active).then_some(&session.queue)
    }

    /// Discard the current session
    ///
    /// The queue is closed first so nothing more is dispatched, then the
    /// hardware stream is stopped.
    pub fn teardown(&mut self, device: Option<&mut (dyn CameraDeviceHandle + 'static)>) {
        let Some(session) = self.current.take() else {
            return;
        };
        session.queue.close();
        match device {
            Some(device) => device.abort_session(session.id),
            None => warn!(session_id = session.id, "Session discarded without a device"),
        }
        debug!(session_id = session.id, state = %session.state, "Capture session torn down");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("policy", &self.policy)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::ImageWriter;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct ScriptedDevice {
        sizes: Vec<FrameSize>,
        created: Vec<(u64, FrameSize)>,
        writers: Vec<ImageWriter>,
        repeating: Vec<(u64, CaptureRequest)>,
        aborted: Vec<u64>,
        reject_repeating: bool,
    }

    impl CameraDeviceHandle for ScriptedDevice {
        fn id(&self) -> &str {
            "scripted"
        }
        fn output_sizes(&self, _format: PixelFormat) -> Vec<FrameSize> {
            self.sizes.clone()
        }
        fn create_session(&mut self, config: SessionConfig) -> BackendResult<()> {
            self.created.push((config.session_id, config.size));
            self.writers.push(config.processing);
            Ok(())
        }
        fn set_repeating_request(&mut self, id: u64, request: CaptureRequest) -> BackendResult<()> {
            if self.reject_repeating {
                return Err(BackendError::Other("no".into()));
            }
            self.repeating.push((id, request));
            Ok(())
        }
        fn abort_session(&mut self, id: u64) {
            self.aborted.push(id);
        }
        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct SizeRecorder {
        sizes: Mutex<Vec<FrameSize>>,
    }

    impl PreviewSink for SizeRecorder {
        fn set_buffer_size(&self, size: FrameSize) {
            self.sizes.lock().unwrap().push(size);
        }
    }

    fn sink() -> CameraEventSink {
        CameraEventSink::new(|_| true)
    }

    #[test]
    fn test_select_prefers_exact_match() {
        let policy = CapturePolicy::default();
        let sizes = [FrameSize::new(1920, 1080), FrameSize::new(640, 480)];
        assert_eq!(select_capture_size(&sizes, &policy), FrameSize::new(640, 480));
    }

    #[test]
    fn test_select_falls_back_without_exact_match() {
        let policy = CapturePolicy::default();
        let sizes = [FrameSize::new(640, 360), FrameSize::new(1920, 1080)];
        assert_eq!(select_capture_size(&sizes, &policy), FrameSize::new(1280, 720));
        assert_eq!(select_capture_size(&[], &policy), FrameSize::new(1280, 720));
    }

    #[test]
    fn test_configure_then_activate() {
        let preview = Arc::new(SizeRecorder::default());
        let mut sessions = SessionManager::new(CapturePolicy::default(), Some(preview.clone()));
        let mut device = ScriptedDevice {
            sizes: vec![FrameSize::new(640, 480)],
            ..Default::default()
        };

        let id = sessions.configure(&mut device, sink()).unwrap();
        assert_eq!(sessions.state(), SessionState::Configuring);
        assert!(sessions.take_ready(id).is_none());

        let transition = sessions.on_event(&mut device, SessionEvent::Configured { session_id: id });
        assert_eq!(transition, SessionTransition::Active);
        assert!(sessions.take_ready(id).is_some());

        assert_eq!(*preview.sizes.lock().unwrap(), vec![FrameSize::new(640, 480)]);
        let (_, request) = &device.repeating[0];
        assert_eq!(
            request.targets,
            vec![CaptureTarget::Processing, CaptureTarget::Preview]
        );
        assert_eq!(request.af_mode, AfMode::ContinuousPicture);
    }

    #[test]
    fn test_reconfigure_supersedes_previous_session() {
        let mut sessions = SessionManager::new(CapturePolicy::default(), None);
        let mut device = ScriptedDevice::default();

        let first = sessions.configure(&mut device, sink()).unwrap();
        let second = sessions.configure(&mut device, sink()).unwrap();
        assert_ne!(first, second);
        assert_eq!(device.aborted, vec![first]);

        // Late acknowledgement for the first session changes nothing
        assert_eq!(
            sessions.on_event(&mut device, SessionEvent::Configured { session_id: first }),
            SessionTransition::Ignored
        );
        assert!(device.repeating.is_empty());
        assert_eq!(sessions.state(), SessionState::Configuring);
    }

    #[test]
    fn test_configure_failure_is_terminal() {
        let mut sessions = SessionManager::new(CapturePolicy::default(), None);
        let mut device = ScriptedDevice::default();
        let id = sessions.configure(&mut device, sink()).unwrap();

        let transition = sessions.on_event(
            &mut device,
            SessionEvent::ConfigureFailed {
                session_id: id,
                reason: "unsupported".into(),
            },
        );
        assert_eq!(transition, SessionTransition::Failed);
        assert_eq!(sessions.state(), SessionState::Failed);

        // A repeated acknowledgement cannot revive it
        assert_eq!(
            sessions.on_event(&mut device, SessionEvent::Configured { session_id: id }),
            SessionTransition::Ignored
        );
        assert!(sessions.current().unwrap().queue().is_closed());
    }

    #[test]
    fn test_rejected_repeating_request_fails_session() {
        let mut sessions = SessionManager::new(CapturePolicy::default(), None);
        let mut device = ScriptedDevice {
            reject_repeating: true,
            ..Default::default()
        };
        let id = sessions.configure(&mut device, sink()).unwrap();
        assert_eq!(
            sessions.on_event(&mut device, SessionEvent::Configured { session_id: id }),
            SessionTransition::Failed
        );
    }

    #[test]
    fn test_teardown_closes_queue() {
        let mut sessions = SessionManager::new(CapturePolicy::default(), None);
        let mut device = ScriptedDevice::default();
        let id = sessions.configure(&mut device, sink()).unwrap();
        sessions.on_event(&mut device, SessionEvent::Configured { session_id: id });

        sessions.teardown(Some(&mut device));
        assert!(sessions.current().is_none());
        assert!(sessions.take_ready(id).is_none());
        assert_eq!(device.aborted, vec![id]);
    }

    #[test]
    fn test_notifications_coalesce_until_taken() {
        let mut sessions = SessionManager::new(CapturePolicy::default(), None);
        let mut device = ScriptedDevice::default();
        let posted = Arc::new(AtomicUsize::new(0));
        let posted_clone = Arc::clone(&posted);
        let events = CameraEventSink::new(move |_| {
            posted_clone.fetch_add(1, Ordering::SeqCst);
            true
        });

        let id = sessions.configure(&mut device, events).unwrap();
        sessions.on_event(&mut device, SessionEvent::Configured { session_id: id });
        let writer = device.writers[0].clone();
        let push = || {
            let planes = vec![PlaneLayout {
                offset: 0,
                len: 16,
                row_stride: 16,
            }];
            writer.queue_image(vec![0; 16], planes, Instant::now())
        };

        for _ in 0..3 {
            assert!(push());
        }
        assert_eq!(posted.load(Ordering::SeqCst), 1);

        assert!(sessions.take_ready(id).is_some());
        assert!(push());
        assert_eq!(posted.load(Ordering::SeqCst), 2);
        assert!(sessions.take_ready(id + 1).is_none());
    }
}
