//! Bulk backends
//!
//! Exactly one backend drives a transport. Both implement [`BulkBackend`];
//! the transport stores whichever the selector picked as a [`Backend`] and
//! dispatches every call through it.

pub mod generic;
pub mod native;
#[cfg(windows)]
pub mod winusb;

pub use generic::{GenericBackend, HandleOwnership};
pub use native::{NativeBackend, PipeInfo, PipeOutcome, PipeSession};

use crate::descriptor::BulkEndpoints;
use crate::error::TransferError;
use std::fmt;
use std::time::Duration;

/// Which driver path carries the bulk traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Platform driver path (WinUSB)
    Native,
    /// Portable libusb path
    Generic,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Generic => write!(f, "libusb"),
        }
    }
}

/// Uniform capability set of a bulk backend
pub trait BulkBackend {
    fn kind(&self) -> BackendKind;

    /// Vendor interface and endpoint addresses in use
    fn endpoints(&self) -> BulkEndpoints;

    /// Send `data` as one bulk OUT transfer bounded by `timeout`
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransferError>;

    /// Packet-chunked bulk IN into `buf`
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError>;

    /// Discard stale inbound data, best-effort
    fn flush(&mut self);

    /// Release everything the backend acquired; safe to call repeatedly
    fn close(&mut self);
}

/// The active backend of a transport
pub enum Backend {
    Native(NativeBackend),
    Generic(GenericBackend),
}

impl Backend {
    fn inner(&self) -> &dyn BulkBackend {
        match self {
            Backend::Native(b) => b,
            Backend::Generic(b) => b,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn BulkBackend {
        match self {
            Backend::Native(b) => b,
            Backend::Generic(b) => b,
        }
    }
}

impl BulkBackend for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn endpoints(&self) -> BulkEndpoints {
        self.inner().endpoints()
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransferError> {
        self.inner_mut().write(data, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.inner_mut().read(buf)
    }

    fn flush(&mut self) {
        self.inner_mut().flush()
    }

    fn close(&mut self) {
        self.inner_mut().close()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .field("endpoints", &self.endpoints())
            .finish()
    }
}
