//! Bulk transport for a composite USB device
//!
//! The device exposes an input interface owned by the operating system and a
//! vendor interface used for bulk command/response traffic. This crate opens
//! the vendor interface through the best available backend (WinUSB on
//! Windows, libusb everywhere) and exposes chunked reads and bounded writes.
//!
//! # Example
//!
//! ```no_run
//! use transport::{BulkTransport, DeviceIdentity, NINTENDO_VENDOR_ID};
//!
//! let device = DeviceIdentity::new(NINTENDO_VENDOR_ID, 0x2069);
//! let mut transport = BulkTransport::connect(&device)?;
//!
//! transport.write(&[0x02, 0x91, 0x01, 0x04], 100)?;
//! let mut response = [0u8; 64];
//! let n = transport.read(&mut response)?;
//! println!("{} bytes via {:?}", n, transport.kind());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
mod chunked;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod handle;
pub mod identity;
pub mod runtime;
pub mod selector;
pub mod test_utils;
pub mod transport;

pub use backend::{Backend, BackendKind, BulkBackend};
pub use config::TransportConfig;
pub use descriptor::{BulkEndpoints, ConfigLayout, VENDOR_INTERFACE, find_bulk_endpoints};
pub use error::{
    Error, GENERIC_FAILURE_SENTINEL, Result, TIMEOUT_SENTINEL, TransferError, map_rusb_error_code,
};
pub use handle::{SharedDeviceHandle, UsbDeviceHandle};
pub use identity::{
    DeviceIdentity, DeviceProperties, NINTENDO_VENDOR_ID, PROP_LIBUSB_DEVICE_HANDLE, PropertyValue,
};
pub use runtime::{RuntimeLease, UsbRuntime};
pub use selector::{BackendProvider, LibusbProvider, default_providers, select_backend};
pub use transport::BulkTransport;
