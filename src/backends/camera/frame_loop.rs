// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle management for repeating loops
//!
//! Used for the synthetic sensor's frame producer and for the render thread,
//! so every long-running loop starts, stops and joins the same way.

use super::types::{BackendError, BackendResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Action returned by the loop callback to control loop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Continue running the loop
    Continue,
    /// Stop the loop gracefully
    Stop,
}

/// Controller for a loop running in a separate named thread
///
/// # Example
///
/// ```ignore
/// let mut controller = LoopController::start_with_init(
///     "sensor-0",
///     move || Ok(Producer::new(writer, interval)),
///     move |producer: &mut Producer| producer.step(&counters),
/// )?;
///
/// // Later, stop the loop and wait for the thread
/// controller.stop();
/// ```
pub struct LoopController {
    /// Thread handle for joining
    thread_handle: Option<JoinHandle<()>>,
    /// Signal to stop the loop
    stop_signal: Arc<AtomicBool>,
    /// Name for logging
    name: String,
}

impl LoopController {
    /// Start a loop in a separate thread
    ///
    /// `init_fn` runs once on the new thread to set up state owned by that
    /// thread. If it fails, the thread exits without running the loop.
    /// Otherwise `loop_fn` is called until it returns `LoopAction::Stop` or
    /// [`stop`](Self::stop) is called. The state is dropped on the loop
    /// thread before it exits.
    pub fn start_with_init<S, I, F>(name: &str, init_fn: I, mut loop_fn: F) -> BackendResult<Self>
    where
        S: 'static,
        I: FnOnce() -> Result<S, String> + Send + 'static,
        F: FnMut(&mut S) -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);
        let name_clone = name.to_string();

        info!(name = %name, "Starting loop thread");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut state = match init_fn() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(name = %name_clone, error = %e, "Initialization failed");
                        return;
                    }
                };

                while !stop_signal_clone.load(Ordering::Acquire) {
                    if loop_fn(&mut state) == LoopAction::Stop {
                        debug!(name = %name_clone, "Loop requested stop");
                        break;
                    }
                }

                debug!(name = %name_clone, "Loop thread exiting");
            })
            .map_err(|e| BackendError::Other(format!("Failed to spawn {}: {}", name, e)))?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        })
    }

    /// Check if the loop is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and wait for the thread to finish
    ///
    /// When this returns, the loop callback will not run again and the loop
    /// state has been dropped.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Release);
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Stopping from inside the loop; the flag ends it after this iteration
            warn!(name = %self.name, "Loop stopped from its own thread, not joining");
            return;
        }
        if let Err(e) = handle.join() {
            warn!(name = %self.name, "Loop thread panicked: {:?}", e);
        } else {
            debug!(name = %self.name, "Loop thread finished");
        }
    }
}

impl Drop for LoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::thread::ThreadId;
    use std::time::{Duration, Instant};

    /// Loop state that records where and when it was dropped
    struct ThreadBound {
        dropped_on: Arc<Mutex<Option<ThreadId>>>,
    }

    impl Drop for ThreadBound {
        fn drop(&mut self) {
            *self.dropped_on.lock().unwrap() = Some(thread::current().id());
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_state_dropped_on_loop_thread_before_stop_returns() {
        let dropped_on = Arc::new(Mutex::new(None));
        let state_slot = Arc::clone(&dropped_on);
        let iterations = Arc::new(AtomicU32::new(0));
        let iterations_clone = Arc::clone(&iterations);

        let mut controller = LoopController::start_with_init(
            "test-owned-state",
            move || Ok(ThreadBound { dropped_on: state_slot }),
            move |_: &mut ThreadBound| {
                iterations_clone.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                LoopAction::Continue
            },
        )
        .unwrap();

        assert!(wait_until(|| iterations.load(Ordering::SeqCst) > 2));
        assert!(dropped_on.lock().unwrap().is_none());

        controller.stop();
        let dropped = *dropped_on.lock().unwrap();
        assert!(dropped.is_some(), "state not dropped by stop()");
        assert_ne!(dropped, Some(thread::current().id()));
        assert!(!controller.is_running());

        let after_stop = iterations.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(iterations.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_loop_requested_stop_releases_state() {
        let dropped_on = Arc::new(Mutex::new(None));
        let state_slot = Arc::clone(&dropped_on);

        let controller = LoopController::start_with_init(
            "test-self-stop",
            move || Ok((ThreadBound { dropped_on: state_slot }, 0u32)),
            |(_, remaining): &mut (ThreadBound, u32)| {
                *remaining += 1;
                if *remaining == 3 {
                    LoopAction::Stop
                } else {
                    LoopAction::Continue
                }
            },
        )
        .unwrap();

        assert!(wait_until(|| !controller.is_running()));
        assert!(dropped_on.lock().unwrap().is_some());
    }

    #[test]
    fn test_init_failure_skips_loop() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let mut controller = LoopController::start_with_init(
            "test-fail-init",
            || Err::<ThreadBound, _>("no buffer".to_string()),
            move |_: &mut ThreadBound| {
                ran_clone.store(true, Ordering::SeqCst);
                LoopAction::Stop
            },
        )
        .unwrap();

        controller.stop();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!controller.is_running());
    }

    #[test]
    fn test_drop_stops_loop() {
        let iterations = Arc::new(AtomicU32::new(0));
        let iterations_clone = Arc::clone(&iterations);

        let controller = LoopController::start_with_init(
            "test-drop",
            || Ok(()),
            move |_: &mut ()| {
                iterations_clone.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                LoopAction::Continue
            },
        )
        .unwrap();
        assert!(wait_until(|| iterations.load(Ordering::SeqCst) > 0));

        drop(controller);
        let after_drop = iterations.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(iterations.load(Ordering::SeqCst), after_drop);
    }
}
