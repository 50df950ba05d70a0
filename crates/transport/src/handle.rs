//! Generic library device handles
//!
//! [`UsbDeviceHandle`] is the slice of the libusb handle surface the generic
//! backend needs. It is implemented for `rusb::DeviceHandle` and for the test
//! mocks in [`crate::test_utils`].

use crate::descriptor::ConfigLayout;
use rusb::{DeviceHandle, UsbContext};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Operations the generic backend performs on an open device
pub trait UsbDeviceHandle: Send {
    /// Owned copy of the active configuration descriptor
    fn config_layout(&self) -> rusb::Result<ConfigLayout>;

    fn set_auto_detach_kernel_driver(&mut self, enable: bool) -> rusb::Result<()>;

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;

    /// Synchronous bulk OUT bounded by `timeout`
    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Synchronous bulk IN bounded by `timeout`
    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration)
    -> rusb::Result<usize>;
}

impl<T: UsbContext> UsbDeviceHandle for DeviceHandle<T> {
    fn config_layout(&self) -> rusb::Result<ConfigLayout> {
        let config = self.device().active_config_descriptor()?;
        Ok(ConfigLayout::from(&config))
    }

    fn set_auto_detach_kernel_driver(&mut self, enable: bool) -> rusb::Result<()> {
        DeviceHandle::set_auto_detach_kernel_driver(self, enable)
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, interface)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, interface)
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, data, timeout)
    }

    fn read_bulk(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }
}

/// A device handle owned by someone else (typically the input stack)
///
/// The transport may use it but never closes it; dropping the last clone
/// held by the transport leaves the owner's handle untouched.
#[derive(Clone)]
pub struct SharedDeviceHandle {
    inner: Arc<Mutex<dyn UsbDeviceHandle>>,
}

impl SharedDeviceHandle {
    pub fn new<H: UsbDeviceHandle + 'static>(handle: H) -> Self {
        Self {
            inner: Arc::new(Mutex::new(handle)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, dyn UsbDeviceHandle + 'static> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live references, including the owner's
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for SharedDeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDeviceHandle")
            .field("holders", &self.holders())
            .finish()
    }
}
