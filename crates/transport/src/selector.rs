//! Backend selection
//!
//! Providers are tried in priority order. The first one that opens the device
//! wins; failures of earlier providers are logged and swallowed so that only
//! the final outcome reaches the caller.

use crate::backend::{Backend, BackendKind, BulkBackend, GenericBackend};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;
use crate::runtime::UsbRuntime;
use tracing::{debug, info};

#[cfg(windows)]
pub use crate::backend::winusb::WinUsbProvider;

/// Something that can bring up one kind of backend for a device
pub trait BackendProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn open(&self, device: &DeviceIdentity) -> Result<Backend>;
}

/// Opens the generic libusb backend
#[derive(Clone)]
pub struct LibusbProvider {
    runtime: UsbRuntime,
    config: TransportConfig,
}

impl LibusbProvider {
    /// Provider sharing the process-wide runtime
    pub fn new(config: TransportConfig) -> Self {
        Self::with_runtime(UsbRuntime::global().clone(), config)
    }

    pub fn with_runtime(runtime: UsbRuntime, config: TransportConfig) -> Self {
        Self { runtime, config }
    }

    pub fn runtime(&self) -> &UsbRuntime {
        &self.runtime
    }
}

impl BackendProvider for LibusbProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
    }

    fn open(&self, device: &DeviceIdentity) -> Result<Backend> {
        GenericBackend::open(device, &self.runtime, &self.config).map(Backend::Generic)
    }
}

/// Providers for the running platform, highest priority first
pub fn default_providers(config: &TransportConfig) -> Vec<Box<dyn BackendProvider>> {
    let mut providers: Vec<Box<dyn BackendProvider>> = Vec::new();

    #[cfg(windows)]
    providers.push(Box::new(WinUsbProvider::new(config.clone())));

    providers.push(Box::new(LibusbProvider::new(config.clone())));
    providers
}

/// Open `device` with the first provider that succeeds
pub fn select_backend(
    device: &DeviceIdentity,
    providers: &[Box<dyn BackendProvider>],
) -> Result<Backend> {
    let mut last_error = None;

    for provider in providers {
        match provider.open(device) {
            Ok(backend) => {
                let endpoints = backend.endpoints();
                info!(
                    "Opened {:04x}:{:04x} via {} backend (interface {}, out {:#04x}, in {:#04x})",
                    device.vendor_id,
                    device.product_id,
                    backend.kind(),
                    endpoints.interface_number,
                    endpoints.out_endpoint,
                    endpoints.in_endpoint
                );
                return Ok(backend);
            }
            Err(e) => {
                debug!("{} backend unavailable: {}", provider.kind(), e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(Error::NoBackend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FnProvider, MockDeviceHandle, MockPipeSession};
    use crate::test_utils::{generic_backend, mock_runtime, native_backend};

    fn device() -> DeviceIdentity {
        DeviceIdentity::new(0x057e, 0x2069)
    }

    #[test]
    fn test_first_success_wins() {
        let native = FnProvider::new(BackendKind::Native, |_| {
            native_backend(MockPipeSession::vendor_pipes())
        });
        let generic = FnProvider::new(BackendKind::Generic, |_| {
            generic_backend(&mock_runtime(), MockDeviceHandle::vendor_device())
        });
        let generic_attempts = generic.attempts();
        let providers: Vec<Box<dyn BackendProvider>> = vec![Box::new(native), Box::new(generic)];

        let backend = select_backend(&device(), &providers).unwrap();
        assert_eq!(backend.kind(), BackendKind::Native);
        assert_eq!(*generic_attempts.lock().unwrap(), 0);
    }

    #[test]
    fn test_native_failure_falls_back() {
        let native = FnProvider::new(BackendKind::Native, |_| {
            Err(Error::Native("interface locked".into()))
        });
        let generic = FnProvider::new(BackendKind::Generic, |_| {
            generic_backend(&mock_runtime(), MockDeviceHandle::vendor_device())
        });
        let providers: Vec<Box<dyn BackendProvider>> = vec![Box::new(native), Box::new(generic)];

        let backend = select_backend(&device(), &providers).unwrap();
        assert_eq!(backend.kind(), BackendKind::Generic);
    }

    #[test]
    fn test_last_error_is_reported() {
        let native = FnProvider::new(BackendKind::Native, |_| {
            Err(Error::Native("interface locked".into()))
        });
        let generic = FnProvider::new(BackendKind::Generic, |d| {
            Err(Error::DeviceNotFound {
                vendor_id: d.vendor_id,
                product_id: d.product_id,
            })
        });
        let providers: Vec<Box<dyn BackendProvider>> = vec![Box::new(native), Box::new(generic)];

        let err = select_backend(&device(), &providers).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound { .. }));
    }

    #[test]
    fn test_no_providers() {
        let err = select_backend(&device(), &[]).unwrap_err();
        assert!(matches!(err, Error::NoBackend));
    }

    #[test]
    fn test_default_providers_end_with_libusb() {
        let providers = default_providers(&TransportConfig::default());
        assert_eq!(providers.last().map(|p| p.kind()), Some(BackendKind::Generic));
        #[cfg(windows)]
        assert_eq!(providers[0].kind(), BackendKind::Native);
        #[cfg(not(windows))]
        assert_eq!(providers.len(), 1);
    }
}
