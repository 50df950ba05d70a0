//! Test utilities for the bulk transport
//!
//! Mock device handles and driver sessions with scripted responses and
//! shared call logs, so both backends can be exercised without hardware.
//!
//! # Example
//!
//! ```
//! use transport::test_utils::{HandleCall, MockDeviceHandle};
//! use transport::handle::UsbDeviceHandle;
//!
//! let mut mock = MockDeviceHandle::vendor_device();
//! let log = mock.log();
//! mock.claim_interface(1).unwrap();
//! assert_eq!(log.calls(), vec![HandleCall::Claim(1)]);
//! ```

use crate::backend::{Backend, BackendKind, GenericBackend, HandleOwnership, NativeBackend};
use crate::backend::{PipeInfo, PipeOutcome, PipeSession};
use crate::config::TransportConfig;
use crate::descriptor::{AltSettingLayout, ConfigLayout, EndpointLayout, InterfaceLayout};
use crate::error::Result;
use crate::handle::UsbDeviceHandle;
use crate::identity::DeviceIdentity;
use crate::runtime::UsbRuntime;
use crate::selector::BackendProvider;
use rusb::TransferType;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Byte written into every buffer a mock read fills
pub const MOCK_FILL_BYTE: u8 = 0xA5;

/// Call log shared between a mock and the test that inspects it
#[derive(Debug)]
pub struct CallLog<T> {
    calls: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for CallLog<T> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<T> Default for CallLog<T> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone + PartialEq> CallLog<T> {
    pub fn push(&self, call: T) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    /// Snapshot of every call recorded so far
    pub fn calls(&self) -> Vec<T> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many times `call` was recorded
    pub fn count(&self, call: &T) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| *c == call)
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

// ============================================================================
// Descriptor builders
// ============================================================================

/// Endpoint with a 64-byte max packet size
pub fn endpoint(address: u8, transfer_type: TransferType) -> EndpointLayout {
    EndpointLayout {
        address,
        transfer_type,
        max_packet_size: 64,
    }
}

/// Interface with a single alternate setting
pub fn interface(number: u8, endpoints: Vec<EndpointLayout>) -> InterfaceLayout {
    InterfaceLayout {
        number,
        alt_settings: vec![AltSettingLayout {
            interface_number: number,
            setting_number: 0,
            endpoints,
        }],
    }
}

/// Composite layout: interrupt input on interface 0, bulk pair 0x02/0x82 on interface 1
pub fn vendor_layout() -> ConfigLayout {
    ConfigLayout {
        interfaces: vec![
            interface(0, vec![endpoint(0x81, TransferType::Interrupt)]),
            interface(
                1,
                vec![
                    endpoint(0x02, TransferType::Bulk),
                    endpoint(0x82, TransferType::Bulk),
                ],
            ),
        ],
    }
}

/// Layout with only the input interface
pub fn layout_without_vendor_interface() -> ConfigLayout {
    ConfigLayout {
        interfaces: vec![interface(0, vec![endpoint(0x81, TransferType::Interrupt)])],
    }
}

// ============================================================================
// Generic library handle mock
// ============================================================================

/// Call recorded by [`MockDeviceHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleCall {
    AutoDetach(bool),
    Claim(u8),
    Release(u8),
    Write {
        endpoint: u8,
        len: usize,
        timeout_ms: u64,
    },
    Read {
        endpoint: u8,
        len: usize,
        timeout_ms: u64,
    },
    /// The handle was dropped
    Closed,
}

/// Scripted [`UsbDeviceHandle`]
///
/// Writes succeed with the full length unless scripted. Reads time out once
/// the script runs dry.
pub struct MockDeviceHandle {
    layout: ConfigLayout,
    log: CallLog<HandleCall>,
    config_error: Option<rusb::Error>,
    claim_error: Option<rusb::Error>,
    auto_detach_error: Option<rusb::Error>,
    writes: VecDeque<rusb::Result<usize>>,
    reads: VecDeque<rusb::Result<usize>>,
}

impl MockDeviceHandle {
    pub fn new(layout: ConfigLayout) -> Self {
        Self {
            layout,
            log: CallLog::default(),
            config_error: None,
            claim_error: None,
            auto_detach_error: None,
            writes: VecDeque::new(),
            reads: VecDeque::new(),
        }
    }

    /// Mock exposing [`vendor_layout`]
    pub fn vendor_device() -> Self {
        Self::new(vendor_layout())
    }

    /// Configuration descriptor cannot be read
    pub fn config_fails(mut self, error: rusb::Error) -> Self {
        self.config_error = Some(error);
        self
    }

    pub fn claim_fails(mut self, error: rusb::Error) -> Self {
        self.claim_error = Some(error);
        self
    }

    pub fn auto_detach_fails(mut self, error: rusb::Error) -> Self {
        self.auto_detach_error = Some(error);
        self
    }

    pub fn with_writes(mut self, writes: Vec<rusb::Result<usize>>) -> Self {
        self.writes = writes.into();
        self
    }

    pub fn with_reads(mut self, reads: Vec<rusb::Result<usize>>) -> Self {
        self.reads = reads.into();
        self
    }

    pub fn log(&self) -> CallLog<HandleCall> {
        self.log.clone()
    }
}

impl UsbDeviceHandle for MockDeviceHandle {
    fn config_layout(&self) -> rusb::Result<ConfigLayout> {
        self.config_error.map_or_else(|| Ok(self.layout.clone()), Err)
    }

    fn set_auto_detach_kernel_driver(&mut self, enable: bool) -> rusb::Result<()> {
        self.log.push(HandleCall::AutoDetach(enable));
        self.auto_detach_error.map_or(Ok(()), Err)
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.log.push(HandleCall::Claim(interface));
        self.claim_error.map_or(Ok(()), Err)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.log.push(HandleCall::Release(interface));
        Ok(())
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.log.push(HandleCall::Write {
            endpoint,
            len: data.len(),
            timeout_ms: timeout.as_millis() as u64,
        });
        self.writes.pop_front().unwrap_or(Ok(data.len()))
    }

    fn read_bulk(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.log.push(HandleCall::Read {
            endpoint,
            len: buf.len(),
            timeout_ms: timeout.as_millis() as u64,
        });
        let n = self
            .reads
            .pop_front()
            .unwrap_or(Err(rusb::Error::Timeout))?
            .min(buf.len());
        buf[..n].fill(MOCK_FILL_BYTE);
        Ok(n)
    }
}

impl Drop for MockDeviceHandle {
    fn drop(&mut self) {
        self.log.push(HandleCall::Closed);
    }
}

// ============================================================================
// Native driver session mock
// ============================================================================

/// Call recorded by [`MockPipeSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeCall {
    QueryPipes,
    SetTimeout { pipe: u8, ms: u64 },
    Write { pipe: u8, len: usize, timeout_ms: u64 },
    Read { pipe: u8, len: usize, timeout_ms: u64 },
    Abort { pipe: u8, grace_ms: u64 },
    Reset { pipe: u8 },
    /// Policy-bounded synchronous read used while flushing
    DrainRead { pipe: u8 },
    Close,
}

/// Scripted [`PipeSession`]
///
/// Writes complete in full unless scripted; reads time out once the script
/// runs dry. Stale data is returned only by drain reads.
pub struct MockPipeSession {
    pipes: Vec<PipeInfo>,
    log: CallLog<PipeCall>,
    query_error: Option<u32>,
    writes: VecDeque<PipeOutcome>,
    reads: VecDeque<PipeOutcome>,
    stale: VecDeque<usize>,
}

impl MockPipeSession {
    pub fn with_pipes(pipes: Vec<PipeInfo>) -> Self {
        Self {
            pipes,
            log: CallLog::default(),
            query_error: None,
            writes: VecDeque::new(),
            reads: VecDeque::new(),
            stale: VecDeque::new(),
        }
    }

    /// Interface 1, alternate setting 0: bulk OUT 0x02 and bulk IN 0x82
    pub fn vendor_pipes() -> Self {
        Self::with_pipes(vec![
            PipeInfo {
                pipe_id: 0x02,
                transfer_type: TransferType::Bulk,
                max_packet_size: 64,
            },
            PipeInfo {
                pipe_id: 0x82,
                transfer_type: TransferType::Bulk,
                max_packet_size: 64,
            },
        ])
    }

    pub fn query_fails(mut self, code: u32) -> Self {
        self.query_error = Some(code);
        self
    }

    pub fn with_writes(mut self, writes: Vec<PipeOutcome>) -> Self {
        self.writes = writes.into();
        self
    }

    pub fn with_reads(mut self, reads: Vec<PipeOutcome>) -> Self {
        self.reads = reads.into();
        self
    }

    /// Sizes of stale packets waiting in the IN pipe
    pub fn with_stale(mut self, packets: Vec<usize>) -> Self {
        self.stale = packets.into();
        self
    }

    pub fn log(&self) -> CallLog<PipeCall> {
        self.log.clone()
    }
}

impl PipeSession for MockPipeSession {
    fn query_pipes(&mut self) -> std::result::Result<Vec<PipeInfo>, u32> {
        self.log.push(PipeCall::QueryPipes);
        match self.query_error {
            Some(code) => Err(code),
            None => Ok(self.pipes.clone()),
        }
    }

    fn set_pipe_timeout(&mut self, pipe: u8, timeout: Duration) -> std::result::Result<(), u32> {
        self.log.push(PipeCall::SetTimeout {
            pipe,
            ms: timeout.as_millis() as u64,
        });
        Ok(())
    }

    fn write_pipe(&mut self, pipe: u8, data: &[u8], timeout: Duration) -> PipeOutcome {
        self.log.push(PipeCall::Write {
            pipe,
            len: data.len(),
            timeout_ms: timeout.as_millis() as u64,
        });
        self.writes
            .pop_front()
            .unwrap_or(PipeOutcome::Completed(data.len()))
    }

    fn read_pipe(&mut self, pipe: u8, buf: &mut [u8], timeout: Duration) -> PipeOutcome {
        self.log.push(PipeCall::Read {
            pipe,
            len: buf.len(),
            timeout_ms: timeout.as_millis() as u64,
        });
        match self.reads.pop_front().unwrap_or(PipeOutcome::TimedOut) {
            PipeOutcome::Completed(n) => {
                let n = n.min(buf.len());
                buf[..n].fill(MOCK_FILL_BYTE);
                PipeOutcome::Completed(n)
            }
            other => other,
        }
    }

    fn abort_pipe(&mut self, pipe: u8, grace: Duration) {
        self.log.push(PipeCall::Abort {
            pipe,
            grace_ms: grace.as_millis() as u64,
        });
    }

    fn reset_pipe(&mut self, pipe: u8) -> std::result::Result<(), u32> {
        self.log.push(PipeCall::Reset { pipe });
        Ok(())
    }

    fn read_pipe_blocking(&mut self, pipe: u8, buf: &mut [u8]) -> std::result::Result<usize, u32> {
        self.log.push(PipeCall::DrainRead { pipe });
        let n = self.stale.pop_front().unwrap_or(0).min(buf.len());
        buf[..n].fill(MOCK_FILL_BYTE);
        Ok(n)
    }

    fn close(&mut self) {
        self.log.push(PipeCall::Close);
    }
}

// ============================================================================
// Backend and provider helpers
// ============================================================================

/// Runtime that counts leases without loading the USB library
pub fn mock_runtime() -> UsbRuntime {
    UsbRuntime::with_initializer(|| Ok(None))
}

/// Generic backend over an owned mock handle
pub fn generic_backend(runtime: &UsbRuntime, handle: MockDeviceHandle) -> Result<Backend> {
    GenericBackend::attach(
        runtime.acquire()?,
        None,
        HandleOwnership::Owned(Box::new(handle)),
        &TransportConfig::default(),
    )
    .map(Backend::Generic)
}

/// Native backend over a mock session, flushed the way a real open would be
pub fn native_backend(session: MockPipeSession) -> Result<Backend> {
    let candidates: Vec<Result<Box<dyn PipeSession>>> = vec![Ok(Box::new(session))];
    NativeBackend::open_first(candidates, &TransportConfig::default()).map(Backend::Native)
}

type OpenFn = dyn Fn(&DeviceIdentity) -> Result<Backend> + Send + Sync;

/// Provider backed by a closure, recording how often it was asked to open
pub struct FnProvider {
    kind: BackendKind,
    open: Box<OpenFn>,
    attempts: Arc<Mutex<usize>>,
}

impl FnProvider {
    pub fn new<F>(kind: BackendKind, open: F) -> Self
    where
        F: Fn(&DeviceIdentity) -> Result<Backend> + Send + Sync + 'static,
    {
        Self {
            kind,
            open: Box::new(open),
            attempts: Arc::new(Mutex::new(0)),
        }
    }

    /// Shared counter of open attempts
    pub fn attempts(&self) -> Arc<Mutex<usize>> {
        Arc::clone(&self.attempts)
    }
}

impl BackendProvider for FnProvider {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn open(&self, device: &DeviceIdentity) -> Result<Backend> {
        *self.attempts.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        (self.open)(device)
    }
}
