//! USB transportation over nusb bulk endpoints.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use nusb::transfer::RequestBuffer;
use tokio::sync::watch;

use crate::error::{Error, TransportError};

use super::{Liveness, Transport};

const VENDOR_ID: u16 = 0x3b5e;
const PRODUCT_ID: u16 = 0x0c01;

const ENDPOINT_OUT: u8 = 0x02;
const ENDPOINT_IN: u8 = 0x82;

pub struct UsbTransport {
    interface: nusb::Interface,
    open: Arc<AtomicBool>,
    liveness_tx: watch::Sender<bool>,
    liveness_rx: watch::Receiver<bool>,
}

impl UsbTransport {
    /// Count attached recorders without claiming any of them.
    pub fn scan_devices() -> crate::error::Result<usize> {
        let n = nusb::list_devices()
            .map_err(|e| Error::Connection(format!("usb enumeration failed: {e}")))?
            .filter(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID)
            .enumerate()
            .map(|(i, d)| {
                log::debug!(
                    "found VoxPen #{} on bus {} addr {}",
                    i,
                    d.bus_number(),
                    d.device_address()
                );
            })
            .count();
        Ok(n)
    }

    pub fn open_nth(nth: usize) -> crate::error::Result<UsbTransport> {
        let device_info = nusb::list_devices()
            .map_err(|e| Error::Connection(format!("usb enumeration failed: {e}")))?
            .filter(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID)
            .nth(nth)
            .ok_or_else(|| {
                Error::Connection(format!(
                    "no VoxPen found ({VENDOR_ID:04x}:{PRODUCT_ID:04x} device absent at index #{nth})"
                ))
            })?;
        log::debug!("opening VoxPen at bus {}", device_info.bus_number());

        let device = device_info
            .open()
            .map_err(|e| Error::Connection(format!("cannot open device: {e}")))?;

        let config = device
            .active_configuration()
            .map_err(|e| Error::Connection(format!("cannot read configuration: {e}")))?;
        let mut endpoint_out_found = false;
        let mut endpoint_in_found = false;
        for alt in config.interface_alt_settings() {
            for endpoint in alt.endpoints() {
                if endpoint.address() == ENDPOINT_OUT {
                    endpoint_out_found = true;
                }
                if endpoint.address() == ENDPOINT_IN {
                    endpoint_in_found = true;
                }
            }
        }
        if !(endpoint_out_found && endpoint_in_found) {
            return Err(Error::Connection("usb endpoints not found".into()));
        }

        let interface = device
            .detach_and_claim_interface(0)
            .map_err(|e| Error::Connection(format!("cannot claim interface: {e}")))?;

        let (liveness_tx, liveness_rx) = watch::channel(true);
        Ok(UsbTransport {
            interface,
            open: Arc::new(AtomicBool::new(true)),
            liveness_tx,
            liveness_rx,
        })
    }

    pub fn open_any() -> crate::error::Result<UsbTransport> {
        Self::open_nth(0)
    }

    fn map_transfer_error(&self, e: nusb::transfer::TransferError) -> TransportError {
        if matches!(e, nusb::transfer::TransferError::Disconnected) {
            // flip the liveness source so the session supervisor reacts
            // even when no operation is in flight
            self.open.store(false, Ordering::SeqCst);
            let _ = self.liveness_tx.send(false);
            TransportError::Disconnected
        } else {
            TransportError::Transfer(e.to_string())
        }
    }
}

#[async_trait]
impl Transport for UsbTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.interface
            .bulk_out(ENDPOINT_OUT, bytes.to_vec())
            .await
            .into_result()
            .map_err(|e| self.map_transfer_error(e))?;
        Ok(())
    }

    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.interface
            .bulk_in(ENDPOINT_IN, RequestBuffer::new(max_len))
            .await
            .into_result()
            .map_err(|e| self.map_transfer_error(e))
    }

    async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.liveness_tx.send(false);
    }

    fn liveness(&self) -> Liveness {
        Liveness::Event(self.liveness_rx.clone())
    }
}
