//! Scripted in-memory transport for tests.
//!
//! The mock answers written command frames from a per-command script
//! queue, echoing the sequence id the way the firmware does. Tests keep
//! a [`MockHandle`] to script replies, inspect wire traffic, and yank
//! the virtual cable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scroll::{BE, Pread, Pwrite};
use tokio::sync::{Notify, watch};

use crate::constants::{FRAME_MAGIC, RESP_HEADER_LEN};
use crate::error::TransportError;

use super::{Liveness, Transport};

enum Script {
    Reply { status: u8, body: Vec<u8> },
    /// Swallow the command without answering (timeout scenarios).
    Silent,
}

#[derive(Default)]
struct MockInner {
    scripts: HashMap<u16, VecDeque<Script>>,
    inbox: Vec<u8>,
    writes: Vec<Vec<u8>>,
    overlap: bool,
}

struct MockState {
    open: Arc<AtomicBool>,
    liveness_tx: watch::Sender<bool>,
    liveness_rx: watch::Receiver<bool>,
    notify: Notify,
    inner: Mutex<MockInner>,
    poll_liveness: AtomicBool,
}

pub struct MockTransport {
    state: Arc<MockState>,
}

/// Cloneable control handle retained by the test after the transport
/// itself moves into the session.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<MockState>,
}

/// Build a raw response frame, for injecting traffic the session did
/// not ask for.
pub fn response_frame(command: u16, seq: u32, status: u8, body: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; RESP_HEADER_LEN + body.len()];
    raw[0..2].copy_from_slice(&FRAME_MAGIC);
    // infallible: the buffer is sized above
    let _ = raw.pwrite_with(command, 2, BE);
    let _ = raw.pwrite_with(seq, 4, BE);
    raw[8] = status;
    let _ = raw.pwrite_with(body.len() as u32, 9, BE);
    raw[RESP_HEADER_LEN..].copy_from_slice(body);
    raw
}

impl MockTransport {
    pub fn new() -> Self {
        let (liveness_tx, liveness_rx) = watch::channel(true);
        MockTransport {
            state: Arc::new(MockState {
                open: Arc::new(AtomicBool::new(true)),
                liveness_tx,
                liveness_rx,
                notify: Notify::new(),
                inner: Mutex::new(MockInner::default()),
                poll_liveness: AtomicBool::new(false),
            }),
        }
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        MockTransport::new()
    }
}

impl MockHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockInner> {
        self.state.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a successful reply body for the next occurrence of `command`.
    pub fn reply(&self, command: u16, body: Vec<u8>) {
        self.reply_status(command, 0, body);
    }

    /// Queue a reply with an explicit device status code.
    pub fn reply_status(&self, command: u16, status: u8, body: Vec<u8>) {
        self.lock()
            .scripts
            .entry(command)
            .or_default()
            .push_back(Script::Reply { status, body });
    }

    /// Swallow the next occurrence of `command` without responding.
    pub fn no_reply(&self, command: u16) {
        self.lock()
            .scripts
            .entry(command)
            .or_default()
            .push_back(Script::Silent);
    }

    /// Push raw bytes into the read path, bypassing the scripts.
    pub fn inject_raw(&self, bytes: &[u8]) {
        self.lock().inbox.extend_from_slice(bytes);
        self.state.notify.notify_waiters();
    }

    /// Simulate the cable being pulled.
    pub fn disconnect(&self) {
        self.state.open.store(false, Ordering::SeqCst);
        let _ = self.state.liveness_tx.send(false);
        self.state.notify.notify_waiters();
    }

    /// Report liveness through the poll flag instead of the event channel.
    pub fn use_poll_liveness(&self) {
        self.state.poll_liveness.store(true, Ordering::SeqCst);
    }

    /// Every frame the session has written, oldest first.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Whether a command frame ever arrived while a reply was still
    /// queued for reading.
    pub fn overlap_detected(&self) -> bool {
        self.lock().overlap
    }

    /// Command ids of every written frame, in wire order.
    pub fn sent_commands(&self) -> Vec<u16> {
        self.lock()
            .writes
            .iter()
            .filter_map(|w| w.pread_with::<u16>(2, BE).ok())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.state.open.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let command = bytes
            .pread_with::<u16>(2, BE)
            .map_err(|e| TransportError::Transfer(format!("unparseable write: {e}")))?;
        let seq = bytes
            .pread_with::<u32>(4, BE)
            .map_err(|e| TransportError::Transfer(format!("unparseable write: {e}")))?;

        let mut inner = self.state.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.inbox.is_empty() {
            // a new command went out before the previous reply was drained
            inner.overlap = true;
        }
        inner.writes.push(bytes.to_vec());
        let script = inner
            .scripts
            .get_mut(&command)
            .and_then(|queue| queue.pop_front())
            // unscripted commands get an empty OK, so happy-path tests
            // only script what they care about
            .unwrap_or(Script::Reply {
                status: 0,
                body: Vec::new(),
            });
        match script {
            Script::Reply { status, body } => {
                let frame = response_frame(command, seq, status, &body);
                inner.inbox.extend_from_slice(&frame);
            }
            Script::Silent => {}
        }
        drop(inner);
        self.state.notify.notify_waiters();
        Ok(())
    }

    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        loop {
            let notified = self.state.notify.notified();
            {
                let mut inner = self.state.inner.lock().unwrap_or_else(|e| e.into_inner());
                if !inner.inbox.is_empty() {
                    let n = max_len.min(inner.inbox.len());
                    return Ok(inner.inbox.drain(..n).collect());
                }
                if !self.state.open.load(Ordering::SeqCst) {
                    return Err(TransportError::Disconnected);
                }
            }
            notified.await;
        }
    }

    async fn close(&mut self) {
        self.state.open.store(false, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    fn liveness(&self) -> Liveness {
        if self.state.poll_liveness.load(Ordering::SeqCst) {
            Liveness::Poll(Arc::clone(&self.state.open))
        } else {
            Liveness::Event(self.state.liveness_rx.clone())
        }
    }
}
