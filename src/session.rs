//! Device session: connection lifecycle, operation lock, sequence
//! correlation.
//!
//! One `DeviceSession` exists per attached recorder. The device cannot
//! multiplex command streams, so every operation (including a whole
//! multi-block download) runs under a single FIFO lock; the lock also
//! owns the transport, which makes holding it the only path to the wire.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::constants::{LIVENESS_POLL_INTERVAL, MAX_PACKET_SIZE, SEQ_MODULUS};
use crate::device::{Model, ModelDb};
use crate::download::TransferSession;
use crate::error::{Error, Result};
use crate::protocol::{
    BtDevice, BtLinkStatus, Command, DeviceInfo, DeviceSettings, FileEntry, FrameDecoder,
    ScheduleEntry, StorageInfo, decode_bt_scan, decode_device_time, decode_file_count,
    decode_file_list,
};
use crate::transport::{Liveness, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Fire-and-forget activity notifications for UI display. Not part of
/// the command/response contract; slow consumers just miss events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    OperationStarted { command: &'static str },
    OperationFinished { command: &'static str, ok: bool },
    DownloadProgress { received: u32, total: u32 },
    ConnectionLost { operations_failed: usize },
}

struct PendingOp {
    command: u16,
    issued_at: Instant,
    timeout: Duration,
}

/// Pending-operation table. Sequence ids are handed out from a wrapping
/// counter that skips ids still in flight, so an extremely long transfer
/// can never collide with a fresh operation.
#[derive(Default)]
struct PendingTable {
    next_seq: u32,
    ops: HashMap<u32, PendingOp>,
}

impl PendingTable {
    fn allocate(&mut self, command: u16, timeout: Duration) -> u32 {
        loop {
            let seq = self.next_seq;
            self.next_seq = (self.next_seq + 1) % SEQ_MODULUS;
            if !self.ops.contains_key(&seq) {
                self.ops.insert(
                    seq,
                    PendingOp {
                        command,
                        issued_at: Instant::now(),
                        timeout,
                    },
                );
                return seq;
            }
        }
    }

    fn complete(&mut self, seq: u32) -> Option<PendingOp> {
        self.ops.remove(&seq)
    }

    fn contains(&self, seq: u32) -> bool {
        self.ops.contains_key(&seq)
    }

    fn fail_all(&mut self) -> usize {
        let n = self.ops.len();
        self.ops.clear();
        n
    }
}

struct Link<T> {
    transport: T,
    decoder: FrameDecoder,
}

struct Inner<T: Transport> {
    /// The operation lock. tokio's mutex queues waiters FIFO, which is
    /// exactly the single-flight policy the device needs.
    link: AsyncMutex<Option<Link<T>>>,
    pending: StdMutex<PendingTable>,
    model: StdMutex<Option<Model>>,
    /// Abort signal of the current connection; replaced on each connect.
    cancel: StdMutex<CancellationToken>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

/// Handle to one attached recorder. Cheap to clone; all clones share
/// the same lock, pending table and connection state.
pub struct DeviceSession<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for DeviceSession<T> {
    fn clone(&self) -> Self {
        DeviceSession {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Default for DeviceSession<T> {
    fn default() -> Self {
        DeviceSession::new()
    }
}

impl<T: Transport> DeviceSession<T> {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(64);
        DeviceSession {
            inner: Arc::new(Inner {
                link: AsyncMutex::new(None),
                pending: StdMutex::new(PendingTable::default()),
                model: StdMutex::new(None),
                cancel: StdMutex::new(CancellationToken::new()),
                state_tx,
                events_tx,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// The model matched at connect time, while connected.
    pub fn model(&self) -> Option<Model> {
        self.inner.model_slot().clone()
    }

    /// Open the session over `transport`: identify the device, match its
    /// model in the catalog, and start liveness supervision. Any failure
    /// on this path is a [`Error::Connection`].
    pub async fn connect(&self, transport: T) -> Result<DeviceInfo> {
        let inner = &self.inner;
        let mut guard = inner.link.lock().await;
        if guard.is_some() {
            return Err(Error::Connection("already connected".into()));
        }
        inner.set_state(ConnectionState::Connecting);

        let token = CancellationToken::new();
        *inner.cancel_slot() = token.clone();

        let liveness = transport.liveness();
        let mut link = Link {
            transport,
            decoder: FrameDecoder::new(),
        };

        let handshake = inner
            .roundtrip(&mut link, &Command::GetDeviceInfo, &token)
            .await
            .and_then(|body| DeviceInfo::parse(&body))
            .and_then(|info| ModelDb::find_model(info.model_code).map(|model| (info, model)));
        let (info, model) = match handshake {
            Ok(ok) => ok,
            Err(e) => {
                link.transport.close().await;
                inner.set_state(ConnectionState::Disconnected);
                return Err(Error::Connection(format!("handshake failed: {e}")));
            }
        };
        log::info!("connected to {model}, device {info}");
        *inner.model_slot() = Some(model);
        *guard = Some(link);
        inner.set_state(ConnectionState::Connected);
        drop(guard);

        tokio::spawn(supervise(Arc::clone(inner), liveness, token));
        Ok(info)
    }

    /// Tear the session down. The abort signal is raised *before*
    /// waiting on the operation lock: a transfer loop holding the lock
    /// unwinds at its next checkpoint instead of deadlocking us here.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        inner.set_state(ConnectionState::Disconnecting);
        inner.cancel_slot().cancel();

        let mut guard = inner.link.lock().await;
        if let Some(mut link) = guard.take() {
            link.transport.close().await;
        }
        let failed = inner.pending_table().fail_all();
        if failed > 0 {
            log::debug!("dropped {failed} pending operation(s) on disconnect");
        }
        *inner.model_slot() = None;
        inner.set_state(ConnectionState::Disconnected);
    }

    /// Run one command/response cycle. Callers queue FIFO on the
    /// operation lock; the variant gate fails fast before any locking
    /// or wire activity.
    pub async fn execute(&self, cmd: Command) -> Result<Vec<u8>> {
        let inner = &self.inner;
        if cmd.needs_bluetooth() {
            match inner.model_slot().clone() {
                Some(model) if model.supports_bluetooth() => {}
                Some(model) => {
                    return Err(Error::Unsupported {
                        command: cmd.name(),
                        model: model.name,
                    });
                }
                None => return Err(Error::Connection("not connected".into())),
            }
        }
        let token = inner.cancel_slot().clone();

        inner.emit(SessionEvent::OperationStarted {
            command: cmd.name(),
        });
        let result = self.execute_locked(&cmd, &token).await;
        inner.emit(SessionEvent::OperationFinished {
            command: cmd.name(),
            ok: result.is_ok(),
        });
        result
    }

    async fn execute_locked(&self, cmd: &Command, token: &CancellationToken) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let mut guard = tokio::select! {
            guard = inner.link.lock() => guard,
            // a queued acquire must not outlive the connection
            _ = token.cancelled() => return Err(Error::ConnectionLost),
        };
        if token.is_cancelled() {
            return Err(Error::ConnectionLost);
        }
        let link = guard
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".into()))?;
        inner.roundtrip(link, cmd, token).await
    }

    /// Download a whole recording as one logical operation: the lock is
    /// held across every block request. The abort signal is checked
    /// before each block; a partial buffer is never delivered.
    pub async fn download_file(&self, name: &str, expected_size: u32) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let token = inner.cancel_slot().clone();
        inner.emit(SessionEvent::OperationStarted {
            command: "DOWNLOAD_FILE",
        });
        let result = self.download_locked(name, expected_size, &token).await;
        inner.emit(SessionEvent::OperationFinished {
            command: "DOWNLOAD_FILE",
            ok: result.is_ok(),
        });
        result
    }

    async fn download_locked(
        &self,
        name: &str,
        expected_size: u32,
        token: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let mut guard = tokio::select! {
            guard = inner.link.lock() => guard,
            _ = token.cancelled() => return Err(Error::Aborted),
        };
        if token.is_cancelled() {
            return Err(Error::Aborted);
        }
        let link = guard
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".into()))?;

        let mut session = TransferSession::new(name, expected_size);
        while !session.is_complete() {
            if token.is_cancelled() {
                log::debug!(
                    "download of {} aborted after {} bytes",
                    name,
                    session.received()
                );
                return Err(Error::Aborted);
            }
            let cmd = Command::GetFileBlock {
                name: name.to_string(),
                index: session.next_block(),
            };
            let block = match inner.roundtrip(link, &cmd, token).await {
                Ok(block) => block,
                // a mid-transfer disconnect resolves as an abort; the
                // session-wide cascade is reported separately
                Err(Error::ConnectionLost) => return Err(Error::Aborted),
                Err(e) => return Err(e),
            };
            session.push_block(&block)?;
            inner.emit(SessionEvent::DownloadProgress {
                received: session.received(),
                total: expected_size,
            });
        }
        session.finish()
    }

    pub async fn device_info(&self) -> Result<DeviceInfo> {
        let body = self.execute(Command::GetDeviceInfo).await?;
        DeviceInfo::parse(&body)
    }

    pub async fn device_time(&self) -> Result<u64> {
        let body = self.execute(Command::GetDeviceTime).await?;
        decode_device_time(&body)
    }

    pub async fn set_device_time(&self, unix_secs: u64) -> Result<()> {
        self.execute(Command::SetDeviceTime { unix_secs }).await?;
        Ok(())
    }

    pub async fn file_count(&self) -> Result<u32> {
        let body = self.execute(Command::GetFileCount).await?;
        decode_file_count(&body)
    }

    pub async fn list_files(&self) -> Result<Vec<FileEntry>> {
        let body = self.execute(Command::GetFileList).await?;
        decode_file_list(&body)
    }

    pub async fn delete_file(&self, name: &str) -> Result<()> {
        self.execute(Command::DeleteFile { name: name.into() }).await?;
        Ok(())
    }

    pub async fn storage_info(&self) -> Result<StorageInfo> {
        let body = self.execute(Command::GetStorageInfo).await?;
        StorageInfo::parse(&body)
    }

    pub async fn format_storage(&self) -> Result<()> {
        self.execute(Command::FormatStorage).await?;
        Ok(())
    }

    pub async fn settings(&self) -> Result<DeviceSettings> {
        let body = self.execute(Command::GetSettings).await?;
        DeviceSettings::parse(&body)
    }

    pub async fn apply_settings(&self, settings: DeviceSettings) -> Result<()> {
        self.execute(Command::SetSettings(settings)).await?;
        Ok(())
    }

    pub async fn push_schedule(&self, entries: Vec<ScheduleEntry>) -> Result<()> {
        self.execute(Command::PushSchedule(entries)).await?;
        Ok(())
    }

    pub async fn factory_reset(&self) -> Result<()> {
        self.execute(Command::FactoryReset).await?;
        Ok(())
    }

    pub async fn request_firmware_upgrade(
        &self,
        version: [u8; 3],
        size: u32,
        crc: u32,
    ) -> Result<()> {
        self.execute(Command::RequestFirmwareUpgrade { version, size, crc })
            .await?;
        Ok(())
    }

    pub async fn bt_scan(&self) -> Result<Vec<BtDevice>> {
        let body = self.execute(Command::BtScan).await?;
        decode_bt_scan(&body)
    }

    pub async fn bt_connect(&self, addr: [u8; 6]) -> Result<()> {
        self.execute(Command::BtConnect { addr }).await?;
        Ok(())
    }

    pub async fn bt_status(&self) -> Result<BtLinkStatus> {
        let body = self.execute(Command::BtStatus).await?;
        BtLinkStatus::parse(&body)
    }
}

impl<T: Transport> Inner<T> {
    fn pending_table(&self) -> StdMutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn model_slot(&self) -> StdMutexGuard<'_, Option<Model>> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_slot(&self) -> StdMutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        log::debug!("connection state -> {state:?}");
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// One wire round trip. The caller must hold the operation lock; the
    /// response is matched by sequence id through the pending table, and
    /// anything stale is discarded without side effects.
    async fn roundtrip(
        &self,
        link: &mut Link<T>,
        cmd: &Command,
        token: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let deadline = cmd.timeout();
        let seq = self.pending_table().allocate(cmd.id(), deadline);
        let frame = match cmd.encode(seq) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending_table().complete(seq);
                return Err(e);
            }
        };
        log::debug!("=> {}", hex::encode(&frame));
        let started = Instant::now();

        let wire = async {
            link.transport.write(&frame).await.map_err(Error::from)?;
            loop {
                let raw = link.transport.read(MAX_PACKET_SIZE).await.map_err(Error::from)?;
                link.decoder.feed(&raw);
                while let Some(resp) = link.decoder.next_frame()? {
                    if resp.seq != seq {
                        if self.pending_table().contains(resp.seq) {
                            log::warn!("response for a different pending operation: {resp:?}");
                        } else {
                            log::debug!("discarding stale frame {resp:?}");
                        }
                        continue;
                    }
                    self.pending_table().complete(seq);
                    log::debug!("<= {resp:?}");
                    if resp.command != cmd.id() {
                        return Err(Error::protocol(format!(
                            "response command 0x{:04x} does not echo 0x{:04x}",
                            resp.command,
                            cmd.id()
                        )));
                    }
                    if !resp.is_ok() {
                        return Err(Error::protocol(format!(
                            "{} failed with device status 0x{:02x}",
                            cmd.name(),
                            resp.status
                        )));
                    }
                    return Ok(resp.body);
                }
            }
        };

        let result = tokio::select! {
            res = timeout(deadline, wire) => match res {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout {
                    command: cmd.name(),
                    elapsed: started.elapsed(),
                }),
            },
            _ = token.cancelled() => Err(Error::ConnectionLost),
        };
        if let Err(ref e) = result {
            // a timed-out or cancelled operation leaves no pending entry
            // behind; a late response for it will be treated as stale
            if let Some(op) = self.pending_table().complete(seq) {
                log::debug!(
                    "dropping pending {} (cmd 0x{:04x}, issued {:?} ago, budget {:?}): {e}",
                    cmd.name(),
                    op.command,
                    op.issued_at.elapsed(),
                    op.timeout,
                );
            }
        }
        result
    }

    /// Connection-loss handling: raise the abort signal, reject every
    /// pending operation, reap the link once the current holder has
    /// unwound, then mark the session disconnected.
    async fn on_connection_lost(&self, token: &CancellationToken) {
        if *self.state_tx.borrow() != ConnectionState::Connected {
            return;
        }
        log::warn!("device connection lost");
        token.cancel();
        let failed = self.pending_table().fail_all();

        // reap the link before publishing the state change, so that an
        // observer seeing Disconnected can reconnect immediately
        let mut guard = self.link.lock().await;
        if let Some(mut link) = guard.take() {
            link.transport.close().await;
        }
        drop(guard);
        *self.model_slot() = None;
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::ConnectionLost {
            operations_failed: failed,
        });
    }
}

/// Liveness supervision for one connection. Prefers the transport's
/// disconnect events; falls back to sampling the poll flag at a coarse
/// interval. Exits quietly on orderly disconnect.
async fn supervise<T: Transport>(
    inner: Arc<Inner<T>>,
    liveness: Liveness,
    token: CancellationToken,
) {
    let lost = match liveness {
        Liveness::Event(mut rx) => loop {
            tokio::select! {
                _ = token.cancelled() => break false,
                changed = rx.changed() => match changed {
                    Ok(()) => {
                        if !*rx.borrow() {
                            break true;
                        }
                    }
                    // sender gone means the transport is gone
                    Err(_) => break true,
                },
            }
        },
        Liveness::Poll(flag) => loop {
            tokio::select! {
                _ = token.cancelled() => break false,
                _ = sleep(LIVENESS_POLL_INTERVAL) => {
                    if !flag.load(Ordering::SeqCst) {
                        break true;
                    }
                }
            }
        },
    };
    if lost {
        inner.on_connection_lost(&token).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SHORT_TIMEOUT;

    #[test]
    fn sequence_ids_are_unique_among_pending() {
        let mut table = PendingTable::default();
        let a = table.allocate(1, SHORT_TIMEOUT);
        let b = table.allocate(1, SHORT_TIMEOUT);
        let c = table.allocate(2, SHORT_TIMEOUT);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(table.contains(a) && table.contains(b) && table.contains(c));
    }

    #[test]
    fn sequence_counter_wraps_and_skips_pending_ids() {
        let mut table = PendingTable::default();
        let first = table.allocate(1, SHORT_TIMEOUT);
        assert_eq!(first, 0);

        // leave seq 0 pending and walk the counter to the wrap point
        table.next_seq = SEQ_MODULUS - 1;
        let last = table.allocate(2, SHORT_TIMEOUT);
        assert_eq!(last, SEQ_MODULUS - 1);

        // wrapping lands on 0, which is still pending, so it is skipped
        let wrapped = table.allocate(3, SHORT_TIMEOUT);
        assert_eq!(wrapped, 1);
        assert!(table.contains(0));
    }

    #[test]
    fn completing_removes_only_that_operation() {
        let mut table = PendingTable::default();
        let a = table.allocate(1, SHORT_TIMEOUT);
        let b = table.allocate(2, SHORT_TIMEOUT);
        assert!(table.complete(a).is_some());
        assert!(table.complete(a).is_none());
        assert!(table.contains(b));
    }

    #[test]
    fn fail_all_reports_the_pending_count() {
        let mut table = PendingTable::default();
        table.allocate(1, SHORT_TIMEOUT);
        table.allocate(2, SHORT_TIMEOUT);
        assert_eq!(table.fail_all(), 2);
        assert_eq!(table.fail_all(), 0);
    }
}
