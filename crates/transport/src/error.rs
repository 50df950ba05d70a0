//! Transport error types
//!
//! Two families: [`Error`] covers opening and lifecycle failures and carries a
//! descriptive message, [`TransferError`] covers individual reads and writes
//! and maps onto the negative sentinel codes callers use for retry decisions.

use thiserror::Error;

/// Sentinel returned for a transfer that did not complete within its deadline.
///
/// Matches libusb's `LIBUSB_ERROR_TIMEOUT` so both backends report timeouts
/// with the same value.
pub const TIMEOUT_SENTINEL: i32 = -7;

/// Sentinel returned for a transfer that failed for any reason other than a timeout.
pub const GENERIC_FAILURE_SENTINEL: i32 = -1;

/// Errors raised while opening or managing a transport
#[derive(Debug, Error)]
pub enum Error {
    /// The generic USB library runtime could not be brought up
    #[error("Couldn't initialize libusb: {0}")]
    RuntimeInit(rusb::Error),

    /// No device with the requested identifiers could be opened
    #[error("Couldn't get libusb device handle for {vendor_id:04x}:{product_id:04x}")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    /// Opening a matched device failed
    #[error("Couldn't open device: {0}")]
    Open(rusb::Error),

    /// The configuration descriptor lacks the vendor bulk interface or its endpoints
    #[error("Couldn't find bulk endpoints on interface {interface}")]
    EndpointDiscovery { interface: u8 },

    /// The vendor interface is owned by another process or driver
    #[error("Couldn't claim interface {interface}: {source}")]
    Claim {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    /// The platform driver path failed
    #[error("Native driver error: {0}")]
    Native(String),

    /// `open` was called on a transport that already has an active backend
    #[error("Transport is already open")]
    AlreadyOpen,

    /// No backend provider was available to try
    #[error("No bulk backend available")]
    NoBackend,

    /// Any other generic library failure
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

/// Type alias for transport results
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single bulk read or write
///
/// A short transfer is not an error; it is reported as a byte count smaller
/// than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The device did not complete the transfer in time
    #[error("Transfer timed out")]
    Timeout,

    /// The transport has no active backend
    #[error("Transport is not open")]
    NotOpen,

    /// The generic library reported an error
    #[error("USB transfer failed: {0}")]
    Usb(rusb::Error),

    /// The platform driver reported an error (raw OS error code)
    #[error("Native transfer failed: os error {code}")]
    Native { code: u32 },
}

impl TransferError {
    /// Negative sentinel for this failure
    ///
    /// Timeouts always map to [`TIMEOUT_SENTINEL`]. Generic library failures
    /// propagate the library's own code unchanged; everything else maps to
    /// [`GENERIC_FAILURE_SENTINEL`].
    pub fn code(&self) -> i32 {
        match self {
            TransferError::Timeout => TIMEOUT_SENTINEL,
            TransferError::Usb(err) => map_rusb_error_code(*err),
            TransferError::NotOpen | TransferError::Native { .. } => GENERIC_FAILURE_SENTINEL,
        }
    }

    /// True if the failure was a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout)
    }
}

impl From<rusb::Error> for TransferError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => TransferError::Timeout,
            other => TransferError::Usb(other),
        }
    }
}

/// Map rusb::Error to the libusb numeric error code
pub fn map_rusb_error_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => TIMEOUT_SENTINEL,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}
