//! Transport context
//!
//! [`BulkTransport`] is the caller-owned handle for one device session. It is
//! empty until `open` succeeds, dispatches every transfer to the backend the
//! selector picked, and returns to the empty state on `close`.

use crate::backend::{Backend, BackendKind, BulkBackend};
use crate::config::TransportConfig;
use crate::descriptor::BulkEndpoints;
use crate::error::{Error, Result, TransferError};
use crate::identity::DeviceIdentity;
use crate::selector::{BackendProvider, default_providers, select_backend};
use std::time::Duration;
use tracing::debug;

/// Bulk channel to the vendor interface of one device
///
/// Not safe for concurrent use; callers serialize all calls on an instance.
#[derive(Debug, Default)]
pub struct BulkTransport {
    backend: Option<Backend>,
}

impl BulkTransport {
    /// Empty transport; nothing is acquired until `open`
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `device` with the platform's default providers and timings
    pub fn connect(device: &DeviceIdentity) -> Result<Self> {
        let mut transport = Self::new();
        transport.open(device)?;
        Ok(transport)
    }

    pub fn open(&mut self, device: &DeviceIdentity) -> Result<()> {
        self.open_with(device, &default_providers(&TransportConfig::default()))
    }

    /// Open `device` trying `providers` in order
    ///
    /// On failure the transport stays empty and may be opened again.
    pub fn open_with(
        &mut self,
        device: &DeviceIdentity,
        providers: &[Box<dyn BackendProvider>],
    ) -> Result<()> {
        if self.backend.is_some() {
            return Err(Error::AlreadyOpen);
        }

        self.backend = Some(select_backend(device, providers)?);
        Ok(())
    }

    /// Send `data` as one bulk transfer, waiting at most `timeout_ms`
    pub fn write(
        &mut self,
        data: &[u8],
        timeout_ms: u32,
    ) -> std::result::Result<usize, TransferError> {
        let backend = self.backend.as_mut().ok_or(TransferError::NotOpen)?;
        backend.write(data, Duration::from_millis(u64::from(timeout_ms)))
    }

    /// Receive into `buf` until it is full or the device sends a short packet
    pub fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransferError> {
        let backend = self.backend.as_mut().ok_or(TransferError::NotOpen)?;
        backend.read(buf)
    }

    /// Byte count on success, negative sentinel on failure
    pub fn write_status(&mut self, data: &[u8], timeout_ms: u32) -> i32 {
        status(self.write(data, timeout_ms))
    }

    /// Byte count on success, negative sentinel on failure
    pub fn read_status(&mut self, buf: &mut [u8]) -> i32 {
        status(self.read(buf))
    }

    /// Release everything acquired by `open`; safe to call at any time
    pub fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            let kind = backend.kind();
            backend.close();
            debug!("Closed {} transport", kind);
        }
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    /// Active backend, if open
    pub fn kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    pub fn endpoints(&self) -> Option<BulkEndpoints> {
        self.backend.as_ref().map(|b| b.endpoints())
    }

    pub fn interface_number(&self) -> Option<u8> {
        self.endpoints().map(|e| e.interface_number)
    }
}

impl Drop for BulkTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn status(result: std::result::Result<usize, TransferError>) -> i32 {
    match result {
        Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
        Err(e) => e.code(),
    }
}
