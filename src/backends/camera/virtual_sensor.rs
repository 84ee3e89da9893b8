// SPDX-License-Identifier: GPL-3.0-only

//! Synthetic camera backend
//!
//! Behaves like asynchronous capture hardware without touching any device:
//! opening and configuring complete on helper threads after a configurable
//! latency, and an active session streams NV12 frames at the configured
//! framerate into the session's image queue. Faults (failed opens, rejected
//! configurations, disconnects, device errors) can be injected at runtime.
//!
//! The luma plane carries a moving gradient: row `y` of frame `n` holds the
//! value `(y + n) mod 256`. The chroma plane is neutral grey.

use super::frame_loop::{LoopAction, LoopController};
use super::image_queue::ImageWriter;
use super::types::*;
use super::{CameraBackend, CameraDeviceHandle, SessionConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Row stride alignment of produced frames, in bytes
const ROW_ALIGNMENT: u32 = 64;

/// One synthetic camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualCameraSpec {
    pub id: String,
    pub name: String,
    pub output_sizes: Vec<FrameSize>,
    pub framerate: u32,
    pub supports_autofocus: bool,
}

impl Default for VirtualCameraSpec {
    fn default() -> Self {
        Self {
            id: "virtual:0".to_string(),
            name: "Virtual Sensor".to_string(),
            output_sizes: vec![
                FrameSize::new(1920, 1080),
                FrameSize::new(1280, 720),
                FrameSize::new(640, 480),
                FrameSize::new(320, 240),
            ],
            framerate: 30,
            supports_autofocus: true,
        }
    }
}

/// How the next open request resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenOutcome {
    #[default]
    Succeed,
    /// Report `DeviceEvent::Disconnected`
    Disconnect,
    /// Report `DeviceEvent::Error` with this code
    Fail(i32),
}

/// Behaviour of the synthetic hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualSensorSettings {
    pub cameras: Vec<VirtualCameraSpec>,
    /// Delay before an open request resolves
    pub open_latency: Duration,
    /// Delay before a session configuration is acknowledged
    pub configure_latency: Duration,
    pub open_outcome: OpenOutcome,
    pub reject_configuration: bool,
}

impl Default for VirtualSensorSettings {
    fn default() -> Self {
        Self {
            cameras: vec![VirtualCameraSpec::default()],
            open_latency: Duration::from_millis(20),
            configure_latency: Duration::from_millis(10),
            open_outcome: OpenOutcome::Succeed,
            reject_configuration: false,
        }
    }
}

/// Snapshot of sensor activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorStats {
    /// Frames accepted by an image queue
    pub frames_produced: u64,
    /// Frames the queue refused (closed or every slot held)
    pub frames_rejected: u64,
    /// Devices opened and not yet closed
    pub open_devices: usize,
    /// Sessions currently streaming
    pub active_streams: usize,
    /// Highest `active_streams` ever observed
    pub peak_active_streams: usize,
    pub sessions_created: u64,
}

#[derive(Default)]
struct Counters {
    frames_produced: AtomicU64,
    frames_rejected: AtomicU64,
    open_devices: AtomicUsize,
    active_streams: AtomicUsize,
    peak_active_streams: AtomicUsize,
    sessions_created: AtomicU64,
}

struct SensorShared {
    settings: Mutex<VirtualSensorSettings>,
    counters: Counters,
    devices: Mutex<Vec<Weak<DeviceShared>>>,
}

impl SensorShared {
    fn settings(&self) -> MutexGuard<'_, VirtualSensorSettings> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_devices(&self) -> Vec<Arc<DeviceShared>> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.retain(|d| d.strong_count() > 0);
        devices.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Camera backend backed by synthetic sensors
#[derive(Clone)]
pub struct VirtualCameraBackend {
    shared: Arc<SensorShared>,
}

impl VirtualCameraBackend {
    pub fn new(settings: VirtualSensorSettings) -> Self {
        Self {
            shared: Arc::new(SensorShared {
                settings: Mutex::new(settings),
                counters: Counters::default(),
                devices: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_open_outcome(&self, outcome: OpenOutcome) {
        self.shared.settings().open_outcome = outcome;
    }

    pub fn set_reject_configuration(&self, reject: bool) {
        self.shared.settings().reject_configuration = reject;
    }

    pub fn stats(&self) -> SensorStats {
        let c = &self.shared.counters;
        SensorStats {
            frames_produced: c.frames_produced.load(Ordering::Acquire),
            frames_rejected: c.frames_rejected.load(Ordering::Acquire),
            open_devices: c.open_devices.load(Ordering::Acquire),
            active_streams: c.active_streams.load(Ordering::Acquire),
            peak_active_streams: c.peak_active_streams.load(Ordering::Acquire),
            sessions_created: c.sessions_created.load(Ordering::Acquire),
        }
    }

    /// Simulate unplugging every open device
    pub fn disconnect_all(&self) {
        for device in self.shared.live_devices() {
            device.lose(DeviceEvent::Disconnected);
        }
    }

    /// Simulate a fatal error on every open device
    pub fn report_error(&self, code: i32) {
        for device in self.shared.live_devices() {
            device.lose(DeviceEvent::Error(code));
        }
    }
}

impl Default for VirtualCameraBackend {
    fn default() -> Self {
        Self::new(VirtualSensorSettings::default())
    }
}

impl std::fmt::Debug for VirtualCameraBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualCameraBackend")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl CameraBackend for VirtualCameraBackend {
    fn enumerate_cameras(&self) -> Vec<CameraDevice> {
        self.shared
            .settings()
            .cameras
            .iter()
            .map(|spec| CameraDevice {
                id: spec.id.clone(),
                name: spec.name.clone(),
            })
            .collect()
    }

    fn output_sizes(&self, camera_id: &str, _format: PixelFormat) -> BackendResult<Vec<FrameSize>> {
        self.shared
            .settings()
            .cameras
            .iter()
            .find(|spec| spec.id == camera_id)
            .map(|spec| spec.output_sizes.clone())
            .ok_or_else(|| BackendError::DeviceNotFound(camera_id.to_string()))
    }

    fn open(&self, camera_id: &str, events: CameraEventSink) -> BackendResult<()> {
        let (spec, latency, outcome, configure_latency) = {
            let settings = self.shared.settings();
            let spec = settings
                .cameras
                .iter()
                .find(|spec| spec.id == camera_id)
                .cloned()
                .ok_or_else(|| BackendError::DeviceNotFound(camera_id.to_string()))?;
            (
                spec,
                settings.open_latency,
                settings.open_outcome,
                settings.configure_latency,
            )
        };

        let sensor = Arc::clone(&self.shared);
        debug!(camera = %camera_id, latency_ms = latency.as_millis() as u64, "Virtual open requested");

        thread::Builder::new()
            .name("virtual-open".to_string())
            .spawn(move || {
                thread::sleep(latency);
                let accepted = match outcome {
                    OpenOutcome::Succeed => {
                        let device = VirtualDevice::new(spec, sensor, events.clone(), configure_latency);
                        // A refused event drops the device, which closes it
                        events.device(DeviceEvent::Opened(Box::new(device)))
                    }
                    OpenOutcome::Disconnect => events.device(DeviceEvent::Disconnected),
                    OpenOutcome::Fail(code) => events.device(DeviceEvent::Error(code)),
                };
                if !accepted {
                    debug!("Open result delivered after pipeline stopped");
                }
            })
            .map_err(|e| BackendError::Other(format!("Failed to spawn open thread: {}", e)))?;

        Ok(())
    }
}

/// A streaming producer; stopping it is tied to drop
struct Stream {
    session_id: u64,
    controller: LoopController,
    sensor: Arc<SensorShared>,
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.controller.stop();
        self.sensor.counters.active_streams.fetch_sub(1, Ordering::AcqRel);
        debug!(session_id = self.session_id, "Virtual stream stopped");
    }
}

/// State shared between a device handle, its helper threads and the backend
struct DeviceShared {
    id: String,
    events: CameraEventSink,
    /// Current session id, 0 when none
    current_session: AtomicU64,
    /// Session id acknowledged as configured, 0 when none
    configured_session: AtomicU64,
    lost: AtomicBool,
    stream: Mutex<Option<Stream>>,
}

impl DeviceShared {
    fn take_stream(&self) -> Option<Stream> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn lose(&self, event: DeviceEvent) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(camera = %self.id, ?event, "Virtual device lost");
        drop(self.take_stream());
        self.current_session.store(0, Ordering::Release);
        self.configured_session.store(0, Ordering::Release);
        self.events.device(event);
    }
}

/// Opened synthetic camera
pub struct VirtualDevice {
    spec: VirtualCameraSpec,
    sensor: Arc<SensorShared>,
    shared: Arc<DeviceShared>,
    configure_latency: Duration,
    writer: Option<ImageWriter>,
    closed: bool,
}

impl VirtualDevice {
    fn new(
        spec: VirtualCameraSpec,
        sensor: Arc<SensorShared>,
        events: CameraEventSink,
        configure_latency: Duration,
    ) -> Self {
        let shared = Arc::new(DeviceShared {
            id: spec.id.clone(),
            events,
            current_session: AtomicU64::new(0),
            configured_session: AtomicU64::new(0),
            lost: AtomicBool::new(false),
            stream: Mutex::new(None),
        });
        sensor
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&shared));
        sensor.counters.open_devices.fetch_add(1, Ordering::AcqRel);
        info!(camera = %spec.id, "Virtual device opened");

        Self {
            spec,
            sensor,
            shared,
            configure_latency,
            writer: None,
            closed: false,
        }
    }

    fn check_usable(&self) -> BackendResult<()> {
        if self.closed {
            return Err(BackendError::InvalidState("device closed".into()));
        }
        if self.shared.lost.load(Ordering::Acquire) {
            return Err(BackendError::DeviceDisconnected);
        }
        Ok(())
    }

    fn start_stream(&self, session_id: u64, writer: ImageWriter) -> BackendResult<Stream> {
        let interval = Duration::from_secs(1) / self.spec.framerate.max(1);
        let sensor = Arc::clone(&self.sensor);
        let thread_name = format!("virtual-sensor-{}", session_id);

        let controller = LoopController::start_with_init(
            &thread_name,
            move || Ok(Producer::new(writer, interval)),
            move |producer: &mut Producer| producer.step(&sensor.counters),
        )?;

        let counters = &self.sensor.counters;
        let active = counters.active_streams.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak_active_streams.fetch_max(active, Ordering::AcqRel);

        Ok(Stream {
            session_id,
            controller,
            sensor: Arc::clone(&self.sensor),
        })
    }
}

impl CameraDeviceHandle for VirtualDevice {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn output_sizes(&self, _format: PixelFormat) -> Vec<FrameSize> {
        self.spec.output_sizes.clone()
    }

    fn create_session(&mut self, config: SessionConfig) -> BackendResult<()> {
        self.check_usable()?;

        // The new session supersedes whatever was streaming
        drop(self.shared.take_stream());
        self.shared.configured_session.store(0, Ordering::Release);
        self.shared
            .current_session
            .store(config.session_id, Ordering::Release);
        self.writer = Some(config.processing);
        self.sensor
            .counters
            .sessions_created
            .fetch_add(1, Ordering::AcqRel);

        let session_id = config.session_id;
        let size = config.size;
        let supported = self.spec.output_sizes.contains(&config.size);
        let reject = self.sensor.settings().reject_configuration;
        let latency = self.configure_latency;
        let device = Arc::clone(&self.shared);
        debug!(camera = %self.spec.id, session_id, size = %size, "Virtual session requested");

        thread::Builder::new()
            .name("virtual-configure".to_string())
            .spawn(move || {
                thread::sleep(latency);
                if device.lost.load(Ordering::Acquire)
                    || device.current_session.load(Ordering::Acquire) != session_id
                {
                    trace!(session_id, "Session superseded before acknowledgement");
                    return;
                }
                let event = if reject || !supported {
                    SessionEvent::ConfigureFailed {
                        session_id,
                        reason: if supported {
                            "configuration rejected by sensor".to_string()
                        } else {
                            format!("size {} not supported", size)
                        },
                    }
                } else {
                    device.configured_session.store(session_id, Ordering::Release);
                    SessionEvent::Configured { session_id }
                };
                device.events.session(event);
            })
            .map_err(|e| BackendError::Other(format!("Failed to spawn configure thread: {}", e)))?;

        Ok(())
    }

    fn set_repeating_request(&mut self, session_id: u64, request: CaptureRequest) -> BackendResult<()> {
        self.check_usable()?;
        if self.shared.configured_session.load(Ordering::Acquire) != session_id {
            return Err(BackendError::InvalidState(format!(
                "session {} is not configured",
                session_id
            )));
        }
        if !request.targets.contains(&CaptureTarget::Processing) {
            return Err(BackendError::InvalidState("request has no processing target".into()));
        }
        if request.af_mode == AfMode::ContinuousPicture && !self.spec.supports_autofocus {
            info!(camera = %self.spec.id, "Autofocus unsupported, continuing with fixed focus");
        }
        let writer = self
            .writer
            .clone()
            .ok_or_else(|| BackendError::InvalidState("no output queue".into()))?;

        drop(self.shared.take_stream());
        let stream = self.start_stream(session_id, writer)?;
        *self.shared.stream.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream);
        info!(camera = %self.spec.id, session_id, fps = self.spec.framerate, "Virtual stream started");
        Ok(())
    }

    fn abort_session(&mut self, session_id: u64) {
        if self.shared.current_session.load(Ordering::Acquire) != session_id {
            return;
        }
        drop(self.shared.take_stream());
        self.shared.current_session.store(0, Ordering::Release);
        self.shared.configured_session.store(0, Ordering::Release);
        self.writer = None;
        debug!(camera = %self.spec.id, session_id, "Virtual session aborted");
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        drop(self.shared.take_stream());
        self.shared.current_session.store(0, Ordering::Release);
        self.shared.configured_session.store(0, Ordering::Release);
        self.writer = None;
        self.sensor
            .counters
            .open_devices
            .fetch_sub(1, Ordering::AcqRel);
        info!(camera = %self.spec.id, "Virtual device closed");
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Frame producer owned by the stream thread
struct Producer {
    writer: ImageWriter,
    interval: Duration,
    next_frame: Instant,
    sequence: u64,
}

impl Producer {
    fn new(writer: ImageWriter, interval: Duration) -> Self {
        Self {
            writer,
            interval,
            next_frame: Instant::now(),
            sequence: 0,
        }
    }

    fn step(&mut self, counters: &Counters) -> LoopAction {
        let now = Instant::now();
        if now < self.next_frame {
            thread::sleep(self.next_frame - now);
        }
        self.next_frame += self.interval;
        if self.next_frame < Instant::now() {
            // Fell behind; do not burst to catch up
            self.next_frame = Instant::now() + self.interval;
        }

        let Some(mut buffer) = self.writer.dequeue_buffer() else {
            debug!("Image queue closed, ending stream");
            return LoopAction::Stop;
        };
        let planes = fill_frame(
            &mut buffer,
            self.writer.size(),
            self.writer.format(),
            self.sequence,
        );
        self.sequence += 1;

        if self.writer.queue_image(buffer, planes, Instant::now()) {
            counters.frames_produced.fetch_add(1, Ordering::AcqRel);
        } else {
            counters.frames_rejected.fetch_add(1, Ordering::AcqRel);
            if self.writer.is_closed() {
                return LoopAction::Stop;
            }
        }
        LoopAction::Continue
    }
}

/// Write one synthetic frame into `buffer` and describe its planes
fn fill_frame(buffer: &mut Vec<u8>, size: FrameSize, format: PixelFormat, sequence: u64) -> Vec<PlaneLayout> {
    let stride = size.width.div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT;
    let luma_len = stride as usize * size.height as usize;
    let chroma_len = match format {
        PixelFormat::Yuv420 => stride as usize * size.height.div_ceil(2) as usize,
        PixelFormat::Gray8 => 0,
    };

    buffer.clear();
    buffer.resize(luma_len + chroma_len, 0);

    let (luma, chroma) = buffer.split_at_mut(luma_len);
    if stride > 0 {
        for (row, line) in luma.chunks_exact_mut(stride as usize).enumerate() {
            line.fill((row as u64).wrapping_add(sequence) as u8);
        }
    }
    chroma.fill(128);

    let mut planes = vec![PlaneLayout {
        offset: 0,
        len: luma_len,
        row_stride: stride,
    }];
    if chroma_len > 0 {
        planes.push(PlaneLayout {
            offset: luma_len,
            len: chroma_len,
            row_stride: stride,
        });
    }
    if sequence == 0 {
        trace!(size = %size, stride, "First synthetic frame");
    }
    planes
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("id", &self.spec.id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::image_queue::ImageQueue;
    use std::sync::mpsc;

    fn channel_sink() -> (CameraEventSink, mpsc::Receiver<CameraEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sink = CameraEventSink::new(move |event| tx.lock().unwrap().send(event).is_ok());
        (sink, rx)
    }

    fn fast_backend() -> VirtualCameraBackend {
        VirtualCameraBackend::new(VirtualSensorSettings {
            open_latency: Duration::from_millis(1),
            configure_latency: Duration::from_millis(1),
            ..Default::default()
        })
    }

    fn open_device(backend: &VirtualCameraBackend) -> (Box<dyn CameraDeviceHandle>, mpsc::Receiver<CameraEvent>) {
        let (sink, rx) = channel_sink();
        backend.open("virtual:0", sink).unwrap();
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            CameraEvent::Device(DeviceEvent::Opened(handle)) => (handle, rx),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unknown_camera_fails_synchronously() {
        let backend = fast_backend();
        let (sink, _rx) = channel_sink();
        assert_eq!(
            backend.open("virtual:9", sink),
            Err(BackendError::DeviceNotFound("virtual:9".into()))
        );
        assert_eq!(backend.enumerate_cameras().len(), 1);
    }

    #[test]
    fn test_open_failure_is_reported_as_event() {
        let backend = fast_backend();
        backend.set_open_outcome(OpenOutcome::Fail(3));
        let (sink, rx) = channel_sink();
        backend.open("virtual:0", sink).unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            CameraEvent::Device(DeviceEvent::Error(3))
        ));
        assert_eq!(backend.stats().open_devices, 0);
    }

    #[test]
    fn test_session_streams_gradient_frames() {
        let backend = fast_backend();
        let (mut device, rx) = open_device(&backend);
        let size = FrameSize::new(320, 240);
        let queue = ImageQueue::new(size, PixelFormat::Yuv420, 2);

        device
            .create_session(SessionConfig {
                session_id: 7,
                size,
                format: PixelFormat::Yuv420,
                processing: queue.writer(),
                preview: false,
            })
            .unwrap();
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            CameraEvent::Session(SessionEvent::Configured { session_id }) => assert_eq!(session_id, 7),
            other => panic!("unexpected event {:?}", other),
        }

        let request = CaptureRequest {
            targets: vec![CaptureTarget::Processing],
            af_mode: AfMode::ContinuousPicture,
        };
        device.set_repeating_request(7, request).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let image = loop {
            if let Some(image) = queue.acquire_latest_image() {
                break image;
            }
            assert!(Instant::now() < deadline, "no frame produced");
            thread::sleep(Duration::from_millis(5));
        };

        let (luma, stride) = image.plane(0).unwrap();
        assert_eq!(stride, 320);
        let base = luma[0];
        assert_eq!(luma[stride as usize], base.wrapping_add(1));
        let (chroma, _) = image.plane(1).unwrap();
        assert!(chroma.iter().all(|&b| b == 128));
        drop(image);

        assert_eq!(backend.stats().active_streams, 1);
        device.abort_session(7);
        assert_eq!(backend.stats().active_streams, 0);

        device.close();
        assert_eq!(backend.stats().open_devices, 0);
    }

    #[test]
    fn test_repeating_request_requires_configured_session() {
        let backend = fast_backend();
        let (mut device, _rx) = open_device(&backend);
        let request = CaptureRequest {
            targets: vec![CaptureTarget::Processing],
            af_mode: AfMode::Off,
        };
        assert!(matches!(
            device.set_repeating_request(1, request),
            Err(BackendError::InvalidState(_))
        ));
    }

    #[test]
    fn test_rejected_configuration() {
        let backend = fast_backend();
        backend.set_reject_configuration(true);
        let (mut device, rx) = open_device(&backend);
        let size = FrameSize::new(640, 480);
        let queue = ImageQueue::new(size, PixelFormat::Yuv420, 2);
        device
            .create_session(SessionConfig {
                session_id: 1,
                size,
                format: PixelFormat::Yuv420,
                processing: queue.writer(),
                preview: true,
            })
            .unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            CameraEvent::Session(SessionEvent::ConfigureFailed { session_id: 1, .. })
        ));
    }

    #[test]
    fn test_disconnect_reports_and_blocks_device() {
        let backend = fast_backend();
        let (mut device, rx) = open_device(&backend);
        backend.disconnect_all();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            CameraEvent::Device(DeviceEvent::Disconnected)
        ));

        let queue = ImageQueue::new(FrameSize::new(640, 480), PixelFormat::Yuv420, 2);
        let result = device.create_session(SessionConfig {
            session_id: 1,
            size: FrameSize::new(640, 480),
            format: PixelFormat::Yuv420,
            processing: queue.writer(),
            preview: false,
        });
        assert_eq!(result, Err(BackendError::DeviceDisconnected));

        drop(device);
        assert_eq!(backend.stats().open_devices, 0);
    }

    fn start_producer(queue: &ImageQueue, counters: &Arc<Counters>) -> LoopController {
        let writer = queue.writer();
        let counters = Arc::clone(counters);
        LoopController::start_with_init(
            "test-producer",
            move || Ok(Producer::new(writer, Duration::from_millis(2))),
            move |producer: &mut Producer| producer.step(&counters),
        )
        .unwrap()
    }

    fn wait_for_frames(counters: &Counters, count: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while counters.frames_produced.load(Ordering::Acquire) < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(counters.frames_produced.load(Ordering::Acquire) >= count);
    }

    #[test]
    fn test_stopped_producer_writes_nothing_more() {
        let counters = Arc::new(Counters::default());
        let queue = ImageQueue::new(FrameSize::new(64, 4), PixelFormat::Gray8, 2);
        let mut controller = start_producer(&queue, &counters);
        wait_for_frames(&counters, 5);

        controller.stop();
        assert!(!controller.is_running());
        let produced = counters.frames_produced.load(Ordering::Acquire);
        let queued = queue.stats().queued;

        thread::sleep(Duration::from_millis(30));
        assert_eq!(counters.frames_produced.load(Ordering::Acquire), produced);
        assert_eq!(queue.stats().queued, queued);
        assert!(queue.depth() <= 2);
    }

    #[test]
    fn test_producer_ends_when_queue_closes() {
        let counters = Arc::new(Counters::default());
        let queue = ImageQueue::new(FrameSize::new(64, 4), PixelFormat::Gray8, 2);
        let controller = start_producer(&queue, &counters);
        wait_for_frames(&counters, 1);

        queue.close();
        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!controller.is_running());
    }

    #[test]
    fn test_fill_frame_gray() {
        let mut buffer = Vec::new();
        let planes = fill_frame(&mut buffer, FrameSize::new(10, 3), PixelFormat::Gray8, 255);
        assert_eq!(planes.len(), 1);
        assert_eq!(planes[0].row_stride, 64);
        assert_eq!(buffer.len(), 64 * 3);
        assert_eq!(buffer[0], 255);
        assert_eq!(buffer[64], 0);
    }
}
