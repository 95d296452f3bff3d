//! Abstract device transport interface.
//!
//! A transport is the raw byte pipe to the recorder: async bulk writes
//! and reads with no protocol knowledge. The session owns it exclusively
//! while connected; nothing else touches the wire.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::TransportError;

pub use self::usb::UsbTransport;

pub mod mock;
mod usb;

/// How the session learns the device went away.
///
/// Event-driven notification is preferred; the poll flag is the fallback
/// for transports without one, sampled at a multi-second interval.
pub enum Liveness {
    /// Receiver flips to `false` when the transport detects a disconnect.
    Event(watch::Receiver<bool>),
    /// `true` while the transport believes the device is present.
    Poll(Arc<AtomicBool>),
}

#[async_trait]
pub trait Transport: Send + 'static {
    /// Write one encoded frame (or frame fragment) to the device.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read up to `max_len` bytes. Resolves when the device produces
    /// data; cancel-safe, so callers may stop awaiting it at any time.
    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Graceful teardown. Errors past this point are expected and ignored.
    async fn close(&mut self);

    /// Obtain this transport's liveness source. Called once at connect.
    fn liveness(&self) -> Liveness;
}
