//! libusb bulk backend
//!
//! Reuses the input stack's libusb handle when the device publishes one;
//! otherwise opens an independent connection through a private context.
//! Resources are released in reverse order of acquisition: interface claim,
//! owned handle, private context, runtime lease.

use crate::backend::{BackendKind, BulkBackend};
use crate::chunked::read_chunked;
use crate::config::TransportConfig;
use crate::descriptor::{BulkEndpoints, VENDOR_INTERFACE, find_bulk_endpoints};
use crate::error::{Error, Result, TransferError};
use crate::handle::{SharedDeviceHandle, UsbDeviceHandle};
use crate::identity::DeviceIdentity;
use crate::runtime::{RuntimeLease, UsbRuntime};
use rusb::{Context, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

/// Who is responsible for closing the device handle
pub enum HandleOwnership {
    /// Opened by this transport; closed on teardown
    Owned(Box<dyn UsbDeviceHandle>),
    /// Borrowed from the input stack; never closed here
    Borrowed(SharedDeviceHandle),
}

impl HandleOwnership {
    pub fn is_owned(&self) -> bool {
        matches!(self, HandleOwnership::Owned(_))
    }

    fn with<R>(&mut self, f: impl FnOnce(&mut (dyn UsbDeviceHandle + 'static)) -> R) -> R {
        match self {
            HandleOwnership::Owned(handle) => f(&mut **handle),
            HandleOwnership::Borrowed(shared) => f(&mut *shared.lock()),
        }
    }
}

/// Bulk transport over a libusb device handle
pub struct GenericBackend {
    handle: Option<HandleOwnership>,
    private_context: Option<Context>,
    lease: Option<RuntimeLease>,
    claimed: Option<u8>,
    endpoints: BulkEndpoints,
    read_timeout: Duration,
    chunk_size: usize,
}

impl GenericBackend {
    /// Resolve a handle for `device`, then discover endpoints and claim the vendor interface
    pub fn open(
        device: &DeviceIdentity,
        runtime: &UsbRuntime,
        config: &TransportConfig,
    ) -> Result<Self> {
        let lease = runtime.acquire()?;

        if let Some(shared) = device.shared_handle() {
            debug!("Reusing input stack libusb handle");
            return Self::attach(lease, None, HandleOwnership::Borrowed(shared), config);
        }

        // No shared handle: open our own connection to reach the vendor interface
        let context = Context::new().map_err(Error::RuntimeInit)?;
        let handle = open_matching(&context, device.vendor_id, device.product_id)?;
        debug!(
            "Opened independent libusb handle for {:04x}:{:04x}",
            device.vendor_id, device.product_id
        );

        Self::attach(
            lease,
            Some(context),
            HandleOwnership::Owned(Box::new(handle)),
            config,
        )
    }

    /// Take over an already-resolved handle
    ///
    /// On failure everything passed in is released before returning, in the
    /// same order `close` would use.
    pub fn attach(
        lease: RuntimeLease,
        private_context: Option<Context>,
        mut handle: HandleOwnership,
        config: &TransportConfig,
    ) -> Result<Self> {
        match claim_vendor_interface(&mut handle) {
            Ok(endpoints) => Ok(Self {
                handle: Some(handle),
                private_context,
                lease: Some(lease),
                claimed: Some(endpoints.interface_number),
                endpoints,
                read_timeout: config.generic_read_timeout(),
                chunk_size: config.chunk_size(),
            }),
            Err(e) => {
                drop(handle);
                drop(private_context);
                lease.release();
                Err(e)
            }
        }
    }

    /// Whether the handle will be closed by this backend
    pub fn owns_handle(&self) -> bool {
        self.handle.as_ref().is_some_and(HandleOwnership::is_owned)
    }

    pub fn has_private_context(&self) -> bool {
        self.private_context.is_some()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.is_some()
    }
}

/// Endpoint discovery followed by auto-detach and claim
fn claim_vendor_interface(handle: &mut HandleOwnership) -> Result<BulkEndpoints> {
    handle.with(|h| {
        let layout = h.config_layout().map_err(|e| {
            debug!("Couldn't read configuration descriptor: {}", e);
            Error::EndpointDiscovery {
                interface: VENDOR_INTERFACE,
            }
        })?;
        let endpoints = find_bulk_endpoints(&layout).ok_or(Error::EndpointDiscovery {
            interface: VENDOR_INTERFACE,
        })?;
        debug!(
            "Found bulk endpoints on interface {}: out={:#04x}, in={:#04x}",
            endpoints.interface_number, endpoints.out_endpoint, endpoints.in_endpoint
        );

        if let Err(e) = h.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }

        h.claim_interface(endpoints.interface_number)
            .map_err(|source| Error::Claim {
                interface: endpoints.interface_number,
                source,
            })?;
        debug!("Claimed interface {}", endpoints.interface_number);

        Ok(endpoints)
    })
}

/// Open the first enumerated device matching the identifiers
fn open_matching<T: UsbContext>(
    context: &T,
    vendor_id: u16,
    product_id: u16,
) -> Result<DeviceHandle<T>> {
    let devices = context.devices()?;
    let mut open_error = None;

    for device in devices.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if desc.vendor_id() != vendor_id || desc.product_id() != product_id {
            continue;
        }
        match device.open() {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                debug!(
                    "Failed to open {:04x}:{:04x} at bus {} address {}: {}",
                    vendor_id,
                    product_id,
                    device.bus_number(),
                    device.address(),
                    e
                );
                open_error = Some(e);
            }
        }
    }

    match open_error {
        Some(e) => Err(Error::Open(e)),
        None => Err(Error::DeviceNotFound {
            vendor_id,
            product_id,
        }),
    }
}

impl BulkBackend for GenericBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
    }

    fn endpoints(&self) -> BulkEndpoints {
        self.endpoints
    }

    fn write(
        &mut self,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransferError> {
        let endpoint = self.endpoints.out_endpoint;
        let handle = self.handle.as_mut().ok_or(TransferError::NotOpen)?;

        let written = handle
            .with(|h| h.write_bulk(endpoint, data, timeout))
            .map_err(TransferError::from)?;
        debug!("Bulk OUT {:#04x}: {} of {} bytes", endpoint, written, data.len());
        Ok(written)
    }

    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransferError> {
        let endpoint = self.endpoints.in_endpoint;
        let timeout = self.read_timeout;
        let chunk_size = self.chunk_size;
        let handle = self.handle.as_mut().ok_or(TransferError::NotOpen)?;

        read_chunked(buf, chunk_size, |chunk| {
            handle
                .with(|h| h.read_bulk(endpoint, chunk, timeout))
                .map_err(TransferError::from)
        })
    }

    fn flush(&mut self) {}

    fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Some(interface) = self.claimed.take() {
                match handle.with(|h| h.release_interface(interface)) {
                    Ok(()) => debug!("Released interface {}", interface),
                    Err(e) => warn!("Failed to release interface {}: {}", interface, e),
                }
            }
            if handle.is_owned() {
                debug!("Closing owned libusb handle");
            }
            drop(handle);
        }

        if self.private_context.take().is_some() {
            debug!("Tearing down private libusb context");
        }

        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}

impl Drop for GenericBackend {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        HandleCall, MockDeviceHandle, layout_without_vendor_interface, mock_runtime,
    };

    fn config() -> TransportConfig {
        TransportConfig::default()
    }

    #[test]
    fn test_attach_owned_claims_interface() {
        let runtime = mock_runtime();
        let mock = MockDeviceHandle::vendor_device();
        let log = mock.log();

        let backend = GenericBackend::attach(
            runtime.acquire().unwrap(),
            None,
            HandleOwnership::Owned(Box::new(mock)),
            &config(),
        )
        .unwrap();

        assert!(backend.owns_handle());
        assert!(backend.is_claimed());
        assert_eq!(backend.endpoints().out_endpoint, 0x02);
        assert_eq!(backend.endpoints().in_endpoint, 0x82);
        assert_eq!(
            log.calls(),
            vec![HandleCall::AutoDetach(true), HandleCall::Claim(1)]
        );
    }

    #[test]
    fn test_close_releases_in_order() {
        let runtime = mock_runtime();
        let mock = MockDeviceHandle::vendor_device();
        let log = mock.log();

        let mut backend = GenericBackend::attach(
            runtime.acquire().unwrap(),
            None,
            HandleOwnership::Owned(Box::new(mock)),
            &config(),
        )
        .unwrap();
        assert_eq!(runtime.active_leases(), 1);

        backend.close();
        backend.close();

        let calls = log.calls();
        assert_eq!(
            &calls[2..],
            &[HandleCall::Release(1), HandleCall::Closed]
        );
        assert_eq!(runtime.active_leases(), 0);
    }

    #[test]
    fn test_borrowed_handle_is_not_closed() {
        let runtime = mock_runtime();
        let mock = MockDeviceHandle::vendor_device();
        let log = mock.log();
        let shared = SharedDeviceHandle::new(mock);

        let mut backend = GenericBackend::attach(
            runtime.acquire().unwrap(),
            None,
            HandleOwnership::Borrowed(shared.clone()),
            &config(),
        )
        .unwrap();
        assert!(!backend.owns_handle());

        backend.close();
        assert!(log.calls().contains(&HandleCall::Release(1)));
        assert!(!log.calls().contains(&HandleCall::Closed));
        assert_eq!(shared.holders(), 1);
    }

    #[test]
    fn test_discovery_failure_claims_nothing() {
        let runtime = mock_runtime();
        let mock = MockDeviceHandle::new(layout_without_vendor_interface());
        let log = mock.log();

        let result = GenericBackend::attach(
            runtime.acquire().unwrap(),
            None,
            HandleOwnership::Owned(Box::new(mock)),
            &config(),
        );

        assert!(matches!(
            result,
            Err(Error::EndpointDiscovery { interface: 1 })
        ));
        assert_eq!(log.calls(), vec![HandleCall::Closed]);
        assert_eq!(runtime.active_leases(), 0);
    }

    #[test]
    fn test_unreadable_config_is_discovery_failure() {
        let runtime = mock_runtime();
        let mock = MockDeviceHandle::vendor_device().config_fails(rusb::Error::Io);
        let log = mock.log();

        let result = GenericBackend::attach(
            runtime.acquire().unwrap(),
            None,
            HandleOwnership::Owned(Box::new(mock)),
            &config(),
        );

        assert!(matches!(
            result,
            Err(Error::EndpointDiscovery { interface: 1 })
        ));
        assert_eq!(log.calls(), vec![HandleCall::Closed]);
        assert_eq!(runtime.active_leases(), 0);
    }

    #[test]
    fn test_claim_failure_releases_everything() {
        let runtime = mock_runtime();
        let mock = MockDeviceHandle::vendor_device().claim_fails(rusb::Error::Busy);
        let log = mock.log();

        let result = GenericBackend::attach(
            runtime.acquire().unwrap(),
            None,
            HandleOwnership::Owned(Box::new(mock)),
            &config(),
        );

        assert!(matches!(
            result,
            Err(Error::Claim {
                interface: 1,
                source: rusb::Error::Busy
            })
        ));
        assert!(!log.calls().contains(&HandleCall::Release(1)));
        assert!(log.calls().contains(&HandleCall::Closed));
        assert_eq!(runtime.active_leases(), 0);
    }

    #[test]
    fn test_auto_detach_failure_is_not_fatal() {
        let runtime = mock_runtime();
        let mock = MockDeviceHandle::vendor_device().auto_detach_fails(rusb::Error::NotSupported);

        let backend = GenericBackend::attach(
            runtime.acquire().unwrap(),
            None,
            HandleOwnership::Owned(Box::new(mock)),
            &config(),
        );
        assert!(backend.is_ok());
    }

    #[test]
    fn test_write_propagates_library_error() {
        let runtime = mock_runtime();
        let mock = MockDeviceHandle::vendor_device()
            .with_writes(vec![Ok(5), Err(rusb::Error::Pipe), Err(rusb::Error::Timeout)]);

        let mut backend = GenericBackend::attach(
            runtime.acquire().unwrap(),
            None,
            HandleOwnership::Owned(Box::new(mock)),
            &config(),
        )
        .unwrap();

        let timeout = Duration::from_millis(100);
        assert_eq!(backend.write(b"hello", timeout), Ok(5));
        assert_eq!(
            backend.write(b"hello", timeout),
            Err(TransferError::Usb(rusb::Error::Pipe))
        );
        assert_eq!(backend.write(b"hello", timeout), Err(TransferError::Timeout));
    }

    #[test]
    fn test_read_uses_in_endpoint_and_chunk_timeout() {
        let runtime = mock_runtime();
        let mock = MockDeviceHandle::vendor_device().with_reads(vec![Ok(64), Ok(10)]);
        let log = mock.log();

        let mut backend = GenericBackend::attach(
            runtime.acquire().unwrap(),
            None,
            HandleOwnership::Owned(Box::new(mock)),
            &config(),
        )
        .unwrap();

        let mut buf = [0u8; 256];
        assert_eq!(backend.read(&mut buf), Ok(74));
        assert!(log.calls().contains(&HandleCall::Read {
            endpoint: 0x82,
            len: 64,
            timeout_ms: 500
        }));
    }

    #[test]
    fn test_io_after_close_is_not_open() {
        let runtime = mock_runtime();
        let mut backend = GenericBackend::attach(
            runtime.acquire().unwrap(),
            None,
            HandleOwnership::Owned(Box::new(MockDeviceHandle::vendor_device())),
            &config(),
        )
        .unwrap();
        backend.close();

        let mut buf = [0u8; 8];
        assert_eq!(backend.read(&mut buf), Err(TransferError::NotOpen));
        assert_eq!(
            backend.write(b"x", Duration::from_millis(1)),
            Err(TransferError::NotOpen)
        );
    }
}
