// SPDX-License-Identifier: GPL-3.0-only

//! Bounded image queue between the capture hardware and the frame dispatcher
//!
//! The hardware side ([`ImageWriter`]) fills buffers and queues them; the
//! consumer side ([`ImageQueue`]) acquires the newest queued image. The number
//! of images that are queued or held by the consumer never exceeds the queue
//! capacity:
//!
//! - when the queue is full and older images are still waiting, the oldest
//!   waiting image is recycled to make room (drop-oldest)
//! - when every slot is held by the consumer the new frame is dropped and
//!   counted as a stall; a consumer that never releases stalls capture
//!
//! Acquired images are returned through [`Image::release`] or by dropping
//! them, so each image is released exactly once.

use super::types::{FrameSize, PixelFormat, PlaneLayout};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, trace};

type AvailableListener = Arc<dyn Fn() + Send + Sync>;

/// Counters describing queue behaviour since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Images accepted from the producer
    pub queued: u64,
    /// Waiting images discarded because a newer one replaced them
    pub dropped: u64,
    /// Frames rejected because the consumer held every slot
    pub stalled: u64,
    /// Images handed to the consumer
    pub acquired: u64,
    /// Images returned by the consumer
    pub released: u64,
    /// Highest observed queued + acquired count
    pub peak_depth: usize,
}

struct PendingImage {
    buffer: Vec<u8>,
    planes: Vec<PlaneLayout>,
    sequence: u64,
    captured_at: Instant,
}

struct QueueState {
    capacity: usize,
    free: Vec<Vec<u8>>,
    queued: VecDeque<PendingImage>,
    acquired: usize,
    closed: bool,
    next_sequence: u64,
    stats: QueueStats,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.queued.len() + self.acquired
    }

    fn recycle(&mut self, buffer: Vec<u8>) {
        if !self.closed && self.free.len() < self.capacity {
            self.free.push(buffer);
        }
    }
}

struct Shared {
    size: FrameSize,
    format: PixelFormat,
    state: Mutex<QueueState>,
    listener: Mutex<Option<AvailableListener>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, buffer: Vec<u8>) {
        let mut state = self.lock();
        state.acquired = state.acquired.saturating_sub(1);
        state.stats.released += 1;
        state.recycle(buffer);
    }
}

/// Consumer side of the queue
pub struct ImageQueue {
    shared: Arc<Shared>,
}

impl ImageQueue {
    /// Create a queue for images of `size`/`format` holding at most `capacity` images
    pub fn new(size: FrameSize, format: PixelFormat, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!(size = %size, ?format, capacity, "Creating image queue");
        Self {
            shared: Arc::new(Shared {
                size,
                format,
                state: Mutex::new(QueueState {
                    capacity,
                    free: Vec::with_capacity(capacity),
                    queued: VecDeque::with_capacity(capacity),
                    acquired: 0,
                    closed: false,
                    next_sequence: 0,
                    stats: QueueStats::default(),
                }),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Producer handle for the hardware
    pub fn writer(&self) -> ImageWriter {
        ImageWriter {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn size(&self) -> FrameSize {
        self.shared.size
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    /// Register the callback fired after each queued image
    ///
    /// The callback runs on the producer's thread and should only post a
    /// notification elsewhere.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(listener));
    }

    /// Acquire the newest waiting image, discarding any older ones
    ///
    /// Returns `None` when nothing is waiting or the queue is closed.
    pub fn acquire_latest_image(&self) -> Option<Image> {
        let mut state = self.shared.lock();
        if state.closed {
            return None;
        }

        let newest = state.queued.pop_back()?;
        while let Some(stale) = state.queued.pop_front() {
            trace!(sequence = stale.sequence, "Discarding stale image");
            state.stats.dropped += 1;
            state.recycle(stale.buffer);
        }

        state.acquired += 1;
        state.stats.acquired += 1;

        Some(Image {
            shared: Arc::clone(&self.shared),
            buffer: Some(newest.buffer),
            planes: newest.planes,
            sequence: newest.sequence,
            captured_at: newest.captured_at,
        })
    }

    /// Images currently queued or held by the consumer
    pub fn depth(&self) -> usize {
        self.shared.lock().depth()
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stop accepting images and discard everything waiting
    ///
    /// Images already acquired stay valid until released.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let discarded = state.queued.len() as u64;
            state.queued.clear();
            state.free.clear();
            state.stats.dropped += discarded;
            debug!(discarded, "Image queue closed");
        }
        self.shared
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

impl Drop for ImageQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ImageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ImageQueue")
            .field("size", &self.shared.size)
            .field("capacity", &state.capacity)
            .field("depth", &state.depth())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Producer side of the queue, handed to the capture hardware
#[derive(Clone)]
pub struct ImageWriter {
    shared: Arc<Shared>,
}

impl ImageWriter {
    pub fn size(&self) -> FrameSize {
        self.shared.size
    }

    pub fn format(&self) -> PixelFormat {
        self.shared.format
    }

    /// Get an empty buffer to fill, reusing a recycled one when available
    pub fn dequeue_buffer(&self) -> Option<Vec<u8>> {
        let mut state = self.shared.lock();
        if state.closed {
            return None;
        }
        Some(state.free.pop().unwrap_or_default())
    }

    /// Queue a filled buffer
    ///
    /// Returns `false` when the frame was not queued (queue closed or every
    /// slot held by the consumer).
    pub fn queue_image(&self, buffer: Vec<u8>, planes: Vec<PlaneLayout>, captured_at: Instant) -> bool {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return false;
            }

            if state.depth() >= state.capacity {
                match state.queued.pop_front() {
                    Some(oldest) => {
                        trace!(sequence = oldest.sequence, "Queue full, dropping oldest image");
                        state.stats.dropped += 1;
                        state.recycle(oldest.buffer);
                    }
                    None => {
                        state.stats.stalled += 1;
                        if state.stats.stalled.is_power_of_two() {
                            debug!(
                                stalled = state.stats.stalled,
                                held = state.acquired,
                                "Consumer holds every image slot, dropping frame"
                            );
                        }
                        state.recycle(buffer);
                        return false;
                    }
                }
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.queued.push_back(PendingImage {
                buffer,
                planes,
                sequence,
                captured_at,
            });
            state.stats.queued += 1;
            let depth = state.depth();
            if depth > state.stats.peak_depth {
                state.stats.peak_depth = depth;
            }
        }

        let listener = self
            .shared
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// An image acquired from the queue
///
/// Holding an `Image` occupies one queue slot. The slot is returned by
/// [`Image::release`] or on drop, whichever happens first.
pub struct Image {
    shared: Arc<Shared>,
    buffer: Option<Vec<u8>>,
    planes: Vec<PlaneLayout>,
    sequence: u64,
    captured_at: Instant,
}

impl Image {
    pub fn width(&self) -> u32 {
        self.shared.size.width
    }

    pub fn height(&self) -> u32 {
        self.shared.size.height
    }

    pub fn format(&self) -> PixelFormat {
        self.shared.format
    }

    /// Producer-assigned sequence number, increasing in capture order
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Bytes and row stride of plane `index`, if present and in bounds
    pub fn plane(&self, index: usize) -> Option<(&[u8], u32)> {
        let layout = self.planes.get(index)?;
        let buffer = self.buffer.as_deref()?;
        let end = layout.offset.checked_add(layout.len)?;
        buffer
            .get(layout.offset..end)
            .map(|bytes| (bytes, layout.row_stride))
    }

    /// Return the image to the queue
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.shared.release(buffer);
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("size", &self.shared.size)
            .field("sequence", &self.sequence)
            .field("planes", &self.planes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gray_queue(capacity: usize) -> ImageQueue {
        ImageQueue::new(FrameSize::new(4, 2), PixelFormat::Gray8, capacity)
    }

    fn push(writer: &ImageWriter, fill: u8) -> bool {
        let mut buffer = writer.dequeue_buffer().expect("queue open");
        buffer.clear();
        buffer.resize(8, fill);
        let planes = vec![PlaneLayout {
            offset: 0,
            len: 8,
            row_stride: 4,
        }];
        writer.queue_image(buffer, planes, Instant::now())
    }

    #[test]
    fn test_empty_queue_yields_nothing() {
        let queue = gray_queue(2);
        assert!(queue.acquire_latest_image().is_none());
        assert_eq!(queue.stats().acquired, 0);
    }

    #[test]
    fn test_acquire_latest_discards_older() {
        let queue = gray_queue(2);
        let writer = queue.writer();
        for fill in 1..=10u8 {
            assert!(push(&writer, fill));
            assert!(queue.depth() <= 2);
        }

        let image = queue.acquire_latest_image().expect("image");
        let (bytes, stride) = image.plane(0).expect("luma plane");
        assert_eq!(bytes[0], 10);
        assert_eq!(stride, 4);
        assert_eq!(image.sequence(), 9);
        drop(image);

        let stats = queue.stats();
        assert_eq!(stats.queued, 10);
        assert_eq!(stats.dropped, 9);
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
        assert!(stats.peak_depth <= 2);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_held_images_stall_producer() {
        let queue = gray_queue(2);
        let writer = queue.writer();

        push(&writer, 1);
        let first = queue.acquire_latest_image().expect("first");
        push(&writer, 2);
        let second = queue.acquire_latest_image().expect("second");

        // Both slots held by the consumer
        assert!(!push(&writer, 3));
        assert_eq!(queue.stats().stalled, 1);

        first.release();
        assert!(push(&writer, 4));
        drop(second);
        assert_eq!(queue.stats().released, 2);
    }

    #[test]
    fn test_listener_fires_per_queued_image() {
        let queue = gray_queue(2);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        queue.set_listener(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let writer = queue.writer();
        push(&writer, 1);
        push(&writer, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_rejects_producer_and_keeps_held_image_valid() {
        let queue = gray_queue(2);
        let writer = queue.writer();
        push(&writer, 7);
        let image = queue.acquire_latest_image().expect("image");
        push(&writer, 8);

        queue.close();
        assert!(writer.dequeue_buffer().is_none());
        assert!(queue.acquire_latest_image().is_none());
        assert_eq!(image.plane(0).map(|(b, _)| b[0]), Some(7));

        image.release();
        let stats = queue.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_out_of_bounds_plane_is_none() {
        let queue = gray_queue(1);
        let writer = queue.writer();
        let planes = vec![PlaneLayout {
            offset: 4,
            len: 100,
            row_stride: 4,
        }];
        assert!(writer.queue_image(vec![0; 8], planes, Instant::now()));
        let image = queue.acquire_latest_image().expect("image");
        assert!(image.plane(0).is_none());
        assert!(image.plane(1).is_none());
    }
}
