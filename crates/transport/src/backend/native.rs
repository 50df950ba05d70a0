//! Platform driver bulk backend
//!
//! The generic library cannot claim the vendor interface on platforms where
//! the OS input driver already owns interface 0 of the composite device. There
//! the vendor interface is bound to the platform's native bulk driver and is
//! driven through a [`PipeSession`].
//!
//! Every transfer follows the same shape: submit one asynchronous operation,
//! wait once with a deadline, and on expiry abort the pipe and wait briefly
//! for the cancellation to be acknowledged.

use crate::backend::{BackendKind, BulkBackend};
use crate::chunked::read_chunked;
use crate::config::TransportConfig;
use crate::descriptor::{BulkEndpoints, BulkPairScan, VENDOR_INTERFACE};
use crate::error::{Error, Result, TransferError};
use rusb::TransferType;
use std::time::Duration;
use tracing::debug;

/// One pipe reported by the driver for alternate setting 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeInfo {
    pub pipe_id: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

/// Result of a single bounded pipe transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
    /// Finished with this many bytes
    Completed(usize),
    /// Still pending when the deadline passed; the caller must abort the pipe
    TimedOut,
    /// Rejected or failed with an OS error code
    Failed(u32),
}

/// An initialized driver session on the vendor interface
///
/// Implementations own the device-interface file handle and the driver
/// session handle, and release both in `close`.
pub trait PipeSession: Send {
    /// Pipes exposed by alternate setting 0
    fn query_pipes(&mut self) -> std::result::Result<Vec<PipeInfo>, u32>;

    /// Apply a transfer timeout policy to `pipe`
    fn set_pipe_timeout(&mut self, pipe: u8, timeout: Duration) -> std::result::Result<(), u32>;

    /// Issue one asynchronous write and wait up to `timeout` for it
    fn write_pipe(&mut self, pipe: u8, data: &[u8], timeout: Duration) -> PipeOutcome;

    /// Issue one asynchronous read and wait up to `timeout` for it
    fn read_pipe(&mut self, pipe: u8, buf: &mut [u8], timeout: Duration) -> PipeOutcome;

    /// Cancel in-flight I/O on `pipe` and wait up to `grace` for acknowledgment
    fn abort_pipe(&mut self, pipe: u8, grace: Duration);

    fn reset_pipe(&mut self, pipe: u8) -> std::result::Result<(), u32>;

    /// Synchronous read bounded only by the pipe's timeout policy
    fn read_pipe_blocking(&mut self, pipe: u8, buf: &mut [u8]) -> std::result::Result<usize, u32>;

    /// Free the driver session and close the device handle
    fn close(&mut self);
}

/// Pick the first bulk pipe of each direction
pub fn select_bulk_pipes(pipes: &[PipeInfo]) -> Option<BulkEndpoints> {
    let mut scan = BulkPairScan::default();
    for pipe in pipes
        .iter()
        .filter(|p| p.transfer_type == TransferType::Bulk)
    {
        if scan.record(pipe.pipe_id) {
            break;
        }
    }
    scan.finish(VENDOR_INTERFACE)
}

/// Bulk transport over a native driver session
pub struct NativeBackend {
    session: Option<Box<dyn PipeSession>>,
    endpoints: BulkEndpoints,
    config: TransportConfig,
}

impl NativeBackend {
    /// Query bulk pipes on an initialized session and apply the timeout policy
    ///
    /// The session is closed if it does not expose both bulk pipes.
    pub fn attach(mut session: Box<dyn PipeSession>, config: &TransportConfig) -> Result<Self> {
        let pipes = match session.query_pipes() {
            Ok(pipes) => pipes,
            Err(code) => {
                session.close();
                return Err(Error::Native(format!(
                    "pipe query failed: os error {}",
                    code
                )));
            }
        };

        let Some(endpoints) = select_bulk_pipes(&pipes) else {
            session.close();
            return Err(Error::Native(format!(
                "missing bulk pipes ({} pipes reported)",
                pipes.len()
            )));
        };

        for pipe in [endpoints.out_endpoint, endpoints.in_endpoint] {
            if let Err(code) = session.set_pipe_timeout(pipe, config.pipe_timeout()) {
                debug!("Failed to set timeout policy on pipe {:#04x}: os error {}", pipe, code);
            }
        }

        debug!(
            "Native session ready: out pipe {:#04x}, in pipe {:#04x}",
            endpoints.out_endpoint, endpoints.in_endpoint
        );

        Ok(Self {
            session: Some(session),
            endpoints,
            config: config.clone(),
        })
    }

    /// Attach to the first candidate session that works, then flush it
    ///
    /// Candidates are opened lazily; a candidate that fails to open or attach
    /// is skipped.
    pub fn open_first<I>(candidates: I, config: &TransportConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Result<Box<dyn PipeSession>>>,
    {
        let mut last_error = None;

        for candidate in candidates {
            match candidate.and_then(|session| Self::attach(session, config)) {
                Ok(mut backend) => {
                    backend.flush();
                    return Ok(backend);
                }
                Err(e) => {
                    debug!("Skipping native candidate: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Native("no matching device interface".into())))
    }
}

/// Turn a pipe outcome into a transfer result, aborting the pipe on timeout
fn settle(
    session: &mut dyn PipeSession,
    pipe: u8,
    grace: Duration,
    outcome: PipeOutcome,
) -> std::result::Result<usize, TransferError> {
    match outcome {
        PipeOutcome::Completed(n) => Ok(n),
        PipeOutcome::TimedOut => {
            debug!("Transfer on pipe {:#04x} timed out, aborting", pipe);
            session.abort_pipe(pipe, grace);
            Err(TransferError::Timeout)
        }
        PipeOutcome::Failed(code) => Err(TransferError::Native { code }),
    }
}

impl BulkBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn endpoints(&self) -> BulkEndpoints {
        self.endpoints
    }

    fn write(
        &mut self,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransferError> {
        let pipe = self.endpoints.out_endpoint;
        let grace = self.config.cancel_grace();
        let session = self.session.as_mut().ok_or(TransferError::NotOpen)?;

        let outcome = session.write_pipe(pipe, data, timeout);
        settle(&mut **session, pipe, grace, outcome)
    }

    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, TransferError> {
        let pipe = self.endpoints.in_endpoint;
        let grace = self.config.cancel_grace();
        let timeout = self.config.native_read_timeout();
        let chunk_size = self.config.chunk_size();
        let session = self.session.as_mut().ok_or(TransferError::NotOpen)?;

        read_chunked(buf, chunk_size, |chunk| {
            let outcome = session.read_pipe(pipe, chunk, timeout);
            settle(&mut **session, pipe, grace, outcome)
        })
    }

    fn flush(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let out_pipe = self.endpoints.out_endpoint;
        let in_pipe = self.endpoints.in_endpoint;

        let _ = session.reset_pipe(out_pipe);
        let _ = session.reset_pipe(in_pipe);

        let _ = session.set_pipe_timeout(in_pipe, self.config.flush_timeout());
        let mut scratch = vec![0u8; self.config.chunk_size()];
        let mut drained = 0;
        for _ in 0..self.config.flush_max_reads {
            match session.read_pipe_blocking(in_pipe, &mut scratch) {
                Ok(n) if n > 0 => drained += n,
                _ => break,
            }
        }
        let _ = session.set_pipe_timeout(in_pipe, self.config.pipe_timeout());

        if drained > 0 {
            debug!("Discarded {} stale bytes from pipe {:#04x}", drained, in_pipe);
        }
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            debug!("Closed native driver session");
        }
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        self.close();
    }
}
