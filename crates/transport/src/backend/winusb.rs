//! WinUSB driver session
//!
//! Enumerates the vendor bulk interface through SetupAPI, opens it with
//! overlapped I/O and drives its pipes through WinUSB. Each transfer owns its
//! buffer and OVERLAPPED block so an aborted transfer that the driver has not
//! yet acknowledged can be parked until the session closes. One still pending
//! after close is leaked rather than freed under the driver.

use crate::backend::native::{NativeBackend, PipeInfo, PipeOutcome, PipeSession};
use crate::backend::{Backend, BackendKind};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::identity::DeviceIdentity;
use crate::selector::BackendProvider;
use rusb::TransferType;
use std::ffi::c_void;
use std::mem::{self, offset_of};
use std::ptr;
use std::time::Duration;
use tracing::{debug, warn};
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    DIGCF_DEVICEINTERFACE, DIGCF_PRESENT, HDEVINFO, SP_DEVICE_INTERFACE_DATA,
    SP_DEVICE_INTERFACE_DETAIL_DATA_W, SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInterfaces,
    SetupDiGetClassDevsW, SetupDiGetDeviceInterfaceDetailW,
};
use windows_sys::Win32::Devices::Usb::{
    PIPE_TRANSFER_TIMEOUT, USB_INTERFACE_DESCRIPTOR, UsbdPipeTypeBulk, UsbdPipeTypeInterrupt,
    UsbdPipeTypeIsochronous, WINUSB_INTERFACE_HANDLE, WINUSB_PIPE_INFORMATION, WinUsb_AbortPipe,
    WinUsb_Free, WinUsb_GetOverlappedResult, WinUsb_Initialize, WinUsb_QueryInterfaceSettings,
    WinUsb_QueryPipe, WinUsb_ReadPipe, WinUsb_ResetPipe, WinUsb_SetPipePolicy, WinUsb_WritePipe,
};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_IO_PENDING, ERROR_SEM_TIMEOUT, FALSE, GENERIC_READ, GENERIC_WRITE, GetLastError, HANDLE,
    INVALID_HANDLE_VALUE, TRUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::OVERLAPPED;
use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject};
use windows_sys::core::GUID;

/// Device interface class registered by the driver package for the bulk interface
pub const BULK_INTERFACE_GUID: GUID = GUID::from_u128(0x6f13725e_ef0e_4fd3_ae5f_b2de989ec825);

fn os_error(what: &str) -> Error {
    let code = unsafe { GetLastError() };
    Error::Native(format!("{} failed: os error {}", what, code))
}

/// Outcome for a transfer the driver failed with `code`
///
/// The pipe's `PIPE_TRANSFER_TIMEOUT` policy expires a request with
/// `ERROR_SEM_TIMEOUT`, which is a timeout like any other.
fn outcome_for_error(code: u32) -> PipeOutcome {
    if code == ERROR_SEM_TIMEOUT {
        PipeOutcome::TimedOut
    } else {
        PipeOutcome::Failed(code)
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// A present device interface of the bulk class
#[derive(Debug, Clone)]
pub struct InterfacePath {
    /// Path as reported, for matching and logging
    pub display: String,
    /// NUL-terminated wide path for opening
    wide: Vec<u16>,
}

struct DeviceInfoList(HDEVINFO);

impl Drop for DeviceInfoList {
    fn drop(&mut self) {
        unsafe {
            SetupDiDestroyDeviceInfoList(self.0);
        }
    }
}

/// Paths of every present device interface registered under `guid`
pub fn device_interface_paths(guid: &GUID) -> Result<Vec<InterfacePath>> {
    let set = unsafe {
        SetupDiGetClassDevsW(
            guid,
            ptr::null(),
            ptr::null_mut(),
            DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
        )
    };
    if set as isize == -1 {
        return Err(os_error("SetupDiGetClassDevs"));
    }
    let set = DeviceInfoList(set);

    let mut paths = Vec::new();
    for index in 0.. {
        let mut interface: SP_DEVICE_INTERFACE_DATA = unsafe { mem::zeroed() };
        interface.cbSize = mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;

        let found =
            unsafe { SetupDiEnumDeviceInterfaces(set.0, ptr::null(), guid, index, &mut interface) };
        if found == FALSE {
            break;
        }

        match interface_detail_path(&set, &interface) {
            Some(path) => paths.push(path),
            None => debug!("Skipping device interface {} without a readable path", index),
        }
    }

    Ok(paths)
}

fn interface_detail_path(
    set: &DeviceInfoList,
    interface: &SP_DEVICE_INTERFACE_DATA,
) -> Option<InterfacePath> {
    let mut required = 0u32;
    unsafe {
        SetupDiGetDeviceInterfaceDetailW(
            set.0,
            interface,
            ptr::null_mut(),
            0,
            &mut required,
            ptr::null_mut(),
        );
    }
    let path_offset = offset_of!(SP_DEVICE_INTERFACE_DETAIL_DATA_W, DevicePath);
    if (required as usize) <= path_offset {
        return None;
    }

    // u32 storage keeps the detail block aligned for its cbSize field
    let mut storage = vec![0u32; (required as usize).div_ceil(4)];
    let detail = storage.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W;
    unsafe {
        (*detail).cbSize = mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
    }

    let ok = unsafe {
        SetupDiGetDeviceInterfaceDetailW(
            set.0,
            interface,
            detail,
            required,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if ok == FALSE {
        return None;
    }

    let max_units = (required as usize - path_offset) / 2;
    let raw = unsafe {
        std::slice::from_raw_parts(ptr::addr_of!((*detail).DevicePath) as *const u16, max_units)
    };
    let len = raw.iter().position(|c| *c == 0).unwrap_or(raw.len());

    let mut wide = raw[..len].to_vec();
    wide.push(0);
    Some(InterfacePath {
        display: String::from_utf16_lossy(&raw[..len]),
        wide,
    })
}

/// One overlapped transfer: its event, OVERLAPPED block and buffer
struct PendingIo {
    overlapped: OVERLAPPED,
    buffer: Vec<u8>,
}

impl PendingIo {
    fn new(buffer: Vec<u8>) -> std::result::Result<Box<Self>, u32> {
        let event = unsafe { CreateEventW(ptr::null(), TRUE, FALSE, ptr::null()) };
        if event.is_null() {
            return Err(unsafe { GetLastError() });
        }
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        overlapped.hEvent = event;
        Ok(Box::new(Self { overlapped, buffer }))
    }

    fn event(&self) -> HANDLE {
        self.overlapped.hEvent
    }

    fn wait(&self, timeout: Duration) -> bool {
        unsafe { WaitForSingleObject(self.event(), millis(timeout)) == WAIT_OBJECT_0 }
    }
}

impl Drop for PendingIo {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.overlapped.hEvent);
        }
    }
}

/// WinUSB session on one device interface
pub struct WinUsbSession {
    file: HANDLE,
    winusb: WINUSB_INTERFACE_HANDLE,
    in_flight: Option<(u8, Box<PendingIo>)>,
    /// Aborted transfers the driver never acknowledged
    abandoned: Vec<(u8, Box<PendingIo>)>,
    cancel_grace: Duration,
}

// The handles are owned exclusively by the session and only used by the
// thread that currently holds it
unsafe impl Send for WinUsbSession {}

impl WinUsbSession {
    /// Open `path` for overlapped I/O and initialize a WinUSB session on it
    pub fn open(path: &InterfacePath, cancel_grace: Duration) -> Result<Self> {
        let file = unsafe {
            CreateFileW(
                path.wide.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if file == INVALID_HANDLE_VALUE {
            return Err(os_error("CreateFile"));
        }

        let mut winusb: WINUSB_INTERFACE_HANDLE = ptr::null_mut();
        if unsafe { WinUsb_Initialize(file, &mut winusb) } == FALSE {
            let err = os_error("WinUsb_Initialize");
            unsafe {
                CloseHandle(file);
            }
            return Err(err);
        }

        debug!("WinUSB session opened on {}", path.display);
        Ok(Self {
            file,
            winusb,
            in_flight: None,
            abandoned: Vec::new(),
            cancel_grace,
        })
    }

    fn is_closed(&self) -> bool {
        self.winusb.is_null()
    }

    /// Wait for a submitted transfer; a timed-out transfer stays in flight
    fn finish(
        &mut self,
        pipe: u8,
        io: Box<PendingIo>,
        timeout: Duration,
    ) -> std::result::Result<(Box<PendingIo>, usize), PipeOutcome> {
        if !io.wait(timeout) {
            self.in_flight = Some((pipe, io));
            return Err(PipeOutcome::TimedOut);
        }

        let mut transferred = 0u32;
        let ok = unsafe {
            WinUsb_GetOverlappedResult(self.winusb, &io.overlapped, &mut transferred, FALSE)
        };
        if ok == FALSE {
            return Err(outcome_for_error(unsafe { GetLastError() }));
        }
        Ok((io, transferred as usize))
    }

    fn park_in_flight(&mut self) {
        if let Some(stale) = self.in_flight.take() {
            self.abandoned.push(stale);
        }
    }
}

impl PipeSession for WinUsbSession {
    fn query_pipes(&mut self) -> std::result::Result<Vec<PipeInfo>, u32> {
        let mut descriptor: USB_INTERFACE_DESCRIPTOR = unsafe { mem::zeroed() };
        if unsafe { WinUsb_QueryInterfaceSettings(self.winusb, 0, &mut descriptor) } == FALSE {
            return Err(unsafe { GetLastError() });
        }

        let mut pipes = Vec::with_capacity(descriptor.bNumEndpoints as usize);
        for index in 0..descriptor.bNumEndpoints {
            let mut info: WINUSB_PIPE_INFORMATION = unsafe { mem::zeroed() };
            if unsafe { WinUsb_QueryPipe(self.winusb, 0, index, &mut info) } == FALSE {
                return Err(unsafe { GetLastError() });
            }

            let transfer_type = if info.PipeType == UsbdPipeTypeBulk {
                TransferType::Bulk
            } else if info.PipeType == UsbdPipeTypeInterrupt {
                TransferType::Interrupt
            } else if info.PipeType == UsbdPipeTypeIsochronous {
                TransferType::Isochronous
            } else {
                TransferType::Control
            };

            pipes.push(PipeInfo {
                pipe_id: info.PipeId,
                transfer_type,
                max_packet_size: info.MaximumPacketSize,
            });
        }

        Ok(pipes)
    }

    fn set_pipe_timeout(&mut self, pipe: u8, timeout: Duration) -> std::result::Result<(), u32> {
        let ms = millis(timeout);
        let ok = unsafe {
            WinUsb_SetPipePolicy(
                self.winusb,
                pipe,
                PIPE_TRANSFER_TIMEOUT,
                mem::size_of::<u32>() as u32,
                &ms as *const u32 as *const c_void,
            )
        };
        if ok == FALSE {
            return Err(unsafe { GetLastError() });
        }
        Ok(())
    }

    fn write_pipe(&mut self, pipe: u8, data: &[u8], timeout: Duration) -> PipeOutcome {
        self.park_in_flight();
        let io = match PendingIo::new(data.to_vec()) {
            Ok(io) => io,
            Err(code) => return PipeOutcome::Failed(code),
        };

        let ok = unsafe {
            WinUsb_WritePipe(
                self.winusb,
                pipe,
                io.buffer.as_ptr(),
                io.buffer.len() as u32,
                ptr::null_mut(),
                &io.overlapped,
            )
        };
        if ok == FALSE {
            let code = unsafe { GetLastError() };
            if code != ERROR_IO_PENDING {
                return outcome_for_error(code);
            }
        }

        match self.finish(pipe, io, timeout) {
            Ok((_, n)) => PipeOutcome::Completed(n),
            Err(outcome) => outcome,
        }
    }

    fn read_pipe(&mut self, pipe: u8, buf: &mut [u8], timeout: Duration) -> PipeOutcome {
        self.park_in_flight();
        let mut io = match PendingIo::new(vec![0u8; buf.len()]) {
            Ok(io) => io,
            Err(code) => return PipeOutcome::Failed(code),
        };

        let ok = unsafe {
            WinUsb_ReadPipe(
                self.winusb,
                pipe,
                io.buffer.as_mut_ptr(),
                io.buffer.len() as u32,
                ptr::null_mut(),
                &io.overlapped,
            )
        };
        if ok == FALSE {
            let code = unsafe { GetLastError() };
            if code != ERROR_IO_PENDING {
                return outcome_for_error(code);
            }
        }

        match self.finish(pipe, io, timeout) {
            Ok((io, n)) => {
                let n = n.min(buf.len());
                buf[..n].copy_from_slice(&io.buffer[..n]);
                PipeOutcome::Completed(n)
            }
            Err(outcome) => outcome,
        }
    }

    fn abort_pipe(&mut self, pipe: u8, grace: Duration) {
        unsafe {
            WinUsb_AbortPipe(self.winusb, pipe);
        }

        let Some((in_flight_pipe, io)) = self.in_flight.take() else {
            return;
        };
        if in_flight_pipe != pipe || !io.wait(grace) {
            debug!("Abort on pipe {:#04x} not acknowledged yet", in_flight_pipe);
            self.abandoned.push((in_flight_pipe, io));
        }
    }

    fn reset_pipe(&mut self, pipe: u8) -> std::result::Result<(), u32> {
        if unsafe { WinUsb_ResetPipe(self.winusb, pipe) } == FALSE {
            return Err(unsafe { GetLastError() });
        }
        Ok(())
    }

    fn read_pipe_blocking(&mut self, pipe: u8, buf: &mut [u8]) -> std::result::Result<usize, u32> {
        let mut transferred = 0u32;
        let ok = unsafe {
            WinUsb_ReadPipe(
                self.winusb,
                pipe,
                buf.as_mut_ptr(),
                buf.len() as u32,
                &mut transferred,
                ptr::null(),
            )
        };
        if ok == FALSE {
            return Err(unsafe { GetLastError() });
        }
        Ok(transferred as usize)
    }

    fn close(&mut self) {
        if self.is_closed() {
            return;
        }

        self.park_in_flight();
        for (pipe, _) in &self.abandoned {
            unsafe {
                WinUsb_AbortPipe(self.winusb, *pipe);
            }
        }

        unsafe {
            if WinUsb_Free(self.winusb) == FALSE {
                warn!("WinUsb_Free failed: os error {}", GetLastError());
            }
            CloseHandle(self.file);
        }
        self.winusb = ptr::null_mut();
        self.file = INVALID_HANDLE_VALUE;

        for (pipe, io) in self.abandoned.drain(..) {
            if !io.wait(self.cancel_grace) {
                warn!(
                    "Pending transfer on pipe {:#04x} outlived the session; leaking its buffer",
                    pipe
                );
                mem::forget(io);
            }
        }
        debug!("WinUSB session closed");
    }
}

impl Drop for WinUsbSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens the native backend through WinUSB
#[derive(Clone)]
pub struct WinUsbProvider {
    config: TransportConfig,
}

impl WinUsbProvider {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl BackendProvider for WinUsbProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn open(&self, device: &DeviceIdentity) -> Result<Backend> {
        let paths = device_interface_paths(&BULK_INTERFACE_GUID)?;
        debug!("Found {} bulk device interface(s)", paths.len());

        let grace = self.config.cancel_grace();
        let candidates = paths
            .iter()
            .filter(|path| device.matches_device_path(&path.display))
            .map(|path| {
                WinUsbSession::open(path, grace).map(|s| Box::new(s) as Box<dyn PipeSession>)
            });

        NativeBackend::open_first(candidates, &self.config).map(Backend::Native)
    }
}
