// SPDX-License-Identifier: GPL-3.0-only

//! UI-thread marshaling
//!
//! The render thread never calls UI code. It pushes values into a bounded
//! channel through a [`UiHandle`], and the thread that owns the [`UiContext`]
//! drains the channel and invokes the [`RateListener`]. When the channel is
//! full, new values are dropped instead of blocking the render thread.
//!
//! Each value carries the liveness flag of the handle that sent it. Dropping
//! the handle revokes the flag, so values still queued at that point are
//! discarded rather than delivered.

use crate::render::RateSink;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, trace};

/// Receives frame-rate updates on the UI context
pub trait RateListener {
    fn on_rate(&mut self, fps: f64);
}

impl<F: FnMut(f64)> RateListener for F {
    fn on_rate(&mut self, fps: f64) {
        self(fps)
    }
}

/// Message marshaled onto the UI context
#[derive(Debug)]
pub enum UiEvent {
    FrameRate { fps: f64, live: Arc<AtomicBool> },
}

/// Sending side, owned by the render thread
#[derive(Debug)]
pub struct UiHandle {
    sender: mpsc::Sender<UiEvent>,
    live: Arc<AtomicBool>,
    dropped: u64,
}

impl UiHandle {
    /// Values discarded because the UI context was behind
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl RateSink for UiHandle {
    fn deliver(&mut self, fps: f64) {
        let event = UiEvent::FrameRate {
            fps,
            live: Arc::clone(&self.live),
        };
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                debug!(fps, dropped = self.dropped, "UI context busy, dropping frame rate");
            }
            Err(TrySendError::Closed(_)) => {
                trace!(fps, "UI context gone, dropping frame rate");
            }
        }
    }
}

impl Drop for UiHandle {
    fn drop(&mut self) {
        self.live.store(false, Ordering::Release);
    }
}

/// Receiving side, owned by the UI thread
#[derive(Debug)]
pub struct UiContext {
    receiver: mpsc::Receiver<UiEvent>,
}

impl UiContext {
    /// Create a context and the handle that feeds it
    pub fn new(capacity: usize) -> (Self, UiHandle) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = UiHandle {
            sender,
            live: Arc::new(AtomicBool::new(true)),
            dropped: 0,
        };
        (Self { receiver }, handle)
    }

    fn deliver(event: UiEvent, listener: &mut dyn RateListener) -> bool {
        match event {
            UiEvent::FrameRate { fps, live } => {
                if !live.load(Ordering::Acquire) {
                    trace!(fps, "Discarding frame rate from stopped renderer");
                    return false;
                }
                listener.on_rate(fps);
                true
            }
        }
    }

    /// Deliver everything already queued, without waiting
    ///
    /// Returns the number of listener invocations.
    pub fn dispatch_pending(&mut self, listener: &mut dyn RateListener) -> usize {
        let mut delivered = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if Self::deliver(event, listener) {
                        delivered += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        delivered
    }

    /// Wait for the next value and deliver it
    ///
    /// Returns `false` once the handle is gone and the queue is empty.
    /// Cancel safe, so it can be used as a `tokio::select!` branch.
    pub async fn next(&mut self, listener: &mut dyn RateListener) -> bool {
        match self.receiver.recv().await {
            Some(event) => {
                Self::deliver(event, listener);
                true
            }
            None => false,
        }
    }

    /// Deliver values until the handle is dropped
    pub async fn run(&mut self, listener: &mut dyn RateListener) {
        while self.next(listener).await {}
        debug!("UI context finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_values_delivered_in_order() {
        let (mut ui, mut handle) = UiContext::new(4);
        handle.deliver(30.0);
        handle.deliver(29.5);

        let mut seen = Vec::new();
        let delivered = ui.dispatch_pending(&mut |fps: f64| seen.push(fps));
        assert_eq!(delivered, 2);
        assert_eq!(seen, vec![30.0, 29.5]);
    }

    #[test]
    fn test_full_channel_drops_newest() {
        let (mut ui, mut handle) = UiContext::new(1);
        handle.deliver(1.0);
        handle.deliver(2.0);
        assert_eq!(handle.dropped(), 1);

        let mut seen = Vec::new();
        ui.dispatch_pending(&mut |fps: f64| seen.push(fps));
        assert_eq!(seen, vec![1.0]);
    }

    #[test]
    fn test_values_from_dropped_handle_are_discarded() {
        let (mut ui, mut handle) = UiContext::new(4);
        handle.deliver(60.0);
        drop(handle);

        let mut calls = 0;
        assert_eq!(ui.dispatch_pending(&mut |_: f64| calls += 1), 0);
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_run_ends_when_handle_dropped() {
        let (mut ui, mut handle) = UiContext::new(4);
        let producer = std::thread::spawn(move || {
            handle.deliver(24.0);
            // Handle dropped here
        });
        producer.join().unwrap();

        let mut seen = Vec::new();
        ui.run(&mut |fps: f64| seen.push(fps)).await;
        // The handle was already gone, so the queued value is stale
        assert!(seen.is_empty());
    }
}
