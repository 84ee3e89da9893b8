// SPDX-License-Identifier: GPL-3.0-only

//! Background execution context for camera callbacks
//!
//! A dedicated worker thread drains a FIFO queue of events and hands each one
//! to a single handler. Device, session and image-available callbacks are all
//! posted here, so the handler state is only ever touched by one thread and
//! never by the UI.

use super::types::{BackendError, BackendResult};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

enum Envelope<E> {
    Event(E),
    Shutdown,
}

/// Cloneable handle for posting events into a [`BackgroundContext`]
pub struct ContextHandle<E> {
    sender: mpsc::Sender<Envelope<E>>,
    accepting: Arc<AtomicBool>,
}

impl<E> Clone for ContextHandle<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            accepting: Arc::clone(&self.accepting),
        }
    }
}

impl<E: Send> ContextHandle<E> {
    /// Queue an event behind everything already posted
    pub fn post(&self, event: E) -> BackendResult<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BackendError::ContextStopped);
        }
        self.sender
            .send(Envelope::Event(event))
            .map_err(|_| BackendError::ContextStopped)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

/// Worker thread with a serial event queue
pub struct BackgroundContext<E: Send + 'static> {
    name: String,
    handle: ContextHandle<E>,
    thread_handle: Option<JoinHandle<()>>,
    exited: mpsc::Receiver<()>,
}

impl<E: Send + 'static> BackgroundContext<E> {
    /// Spawn the worker thread; `handler` receives every posted event in order
    pub fn start<H>(name: &str, handler: H) -> BackendResult<Self>
    where
        H: FnMut(E) + Send + 'static,
    {
        Self::start_with(name, move |_| handler)
    }

    /// Like [`start`](Self::start), but builds the handler from a handle to
    /// the context itself so it can route callbacks back into the queue
    pub fn start_with<H, M>(name: &str, make_handler: M) -> BackendResult<Self>
    where
        H: FnMut(E) + Send + 'static,
        M: FnOnce(ContextHandle<E>) -> H,
    {
        let (sender, receiver) = mpsc::channel::<Envelope<E>>();
        let (exit_tx, exited) = mpsc::channel::<()>();
        let accepting = Arc::new(AtomicBool::new(true));
        let thread_name = name.to_string();
        let handle = ContextHandle { sender, accepting };
        let mut handler = make_handler(handle.clone());

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %thread_name, "Background context running");
                while let Ok(envelope) = receiver.recv() {
                    let event = match envelope {
                        Envelope::Event(event) => event,
                        Envelope::Shutdown => break,
                    };
                    if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                        error!(name = %thread_name, "Background handler panicked, continuing");
                    }
                }
                debug!(name = %thread_name, "Background context drained");
                let _ = exit_tx.send(());
            })
            .map_err(|e| BackendError::Other(format!("Failed to spawn {}: {}", name, e)))?;

        info!(name = %name, "Background context started");

        Ok(Self {
            name: name.to_string(),
            handle,
            thread_handle: Some(thread_handle),
            exited,
        })
    }

    /// Handle for posting from other threads
    pub fn handle(&self) -> ContextHandle<E> {
        self.handle.clone()
    }

    pub fn post(&self, event: E) -> BackendResult<()> {
        self.handle.post(event)
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop accepting events, drain the queue and wait for the worker
    ///
    /// Returns `true` when the worker terminated within `timeout`. On timeout
    /// the thread is detached and a warning is logged.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(thread_handle) = self.thread_handle.take() else {
            return true;
        };

        self.handle.accepting.store(false, Ordering::Release);
        // Events already queued are processed before the marker
        let _ = self.handle.sender.send(Envelope::Shutdown);

        if thread_handle.thread().id() == thread::current().id() {
            warn!(name = %self.name, "Background context stopped from its own thread");
            return false;
        }

        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread_handle.join().is_err() {
                    warn!(name = %self.name, "Background thread panicked during shutdown");
                }
                info!(name = %self.name, "Background context stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    name = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Background context did not terminate in time, detaching"
                );
                false
            }
        }
    }
}

impl<E: Send + 'static> Drop for BackgroundContext<E> {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop(crate::constants::timing::SHUTDOWN_TIMEOUT);
        }
    }
}

impl<E: Send + 'static> std::fmt::Debug for BackgroundContext<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundContext")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}
