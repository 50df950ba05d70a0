//! Reference-counted generic USB library runtime
//!
//! Bringing the library up is process-wide state. Each transport holds a
//! [`RuntimeLease`] for as long as it uses the generic path; the library
//! context is created by the first acquire and torn down when the last lease
//! is released.

use crate::error::{Error, Result};
use rusb::Context;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::debug;

type Initializer = dyn Fn() -> rusb::Result<Option<Context>> + Send + Sync;

/// Shared runtime handle with acquire/release semantics
#[derive(Clone)]
pub struct UsbRuntime {
    slot: Arc<Mutex<Weak<RuntimeState>>>,
    init: Arc<Initializer>,
}

struct RuntimeState {
    context: Option<Context>,
    version: String,
}

/// One hold on the runtime; dropping it releases the hold
pub struct RuntimeLease {
    state: Arc<RuntimeState>,
}

impl UsbRuntime {
    /// Create an isolated runtime slot backed by a libusb context
    pub fn new() -> Self {
        Self::with_initializer(|| Context::new().map(Some))
    }

    /// Runtime whose library context comes from `init`
    ///
    /// `init` runs each time the runtime is brought up from zero leases. An
    /// initializer returning `Ok(None)` yields a runtime that only counts
    /// leases.
    pub fn with_initializer<F>(init: F) -> Self
    where
        F: Fn() -> rusb::Result<Option<Context>> + Send + Sync + 'static,
    {
        Self {
            slot: Arc::new(Mutex::new(Weak::new())),
            init: Arc::new(init),
        }
    }

    /// The process-wide runtime
    pub fn global() -> &'static UsbRuntime {
        static GLOBAL: OnceLock<UsbRuntime> = OnceLock::new();
        GLOBAL.get_or_init(UsbRuntime::new)
    }

    /// Acquire a hold on the runtime, bringing it up if nobody holds it
    ///
    /// Fails with [`Error::RuntimeInit`] when the library cannot be
    /// initialized; no lease is recorded in that case.
    pub fn acquire(&self) -> Result<RuntimeLease> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(state) = slot.upgrade() {
            return Ok(RuntimeLease { state });
        }

        let context = (self.init)().map_err(Error::RuntimeInit)?;
        let version = rusb::version();
        let state = Arc::new(RuntimeState {
            context,
            version: format!(
                "{}.{}.{}",
                version.major(),
                version.minor(),
                version.micro()
            ),
        });
        debug!("libusb runtime initialized (libusb {})", state.version);
        *slot = Arc::downgrade(&state);

        Ok(RuntimeLease { state })
    }

    /// Number of outstanding leases
    pub fn active_leases(&self) -> usize {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .strong_count()
    }
}

impl Default for UsbRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UsbRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbRuntime")
            .field("active_leases", &self.active_leases())
            .finish()
    }
}

impl RuntimeLease {
    /// Version string of the loaded library
    pub fn library_version(&self) -> &str {
        &self.state.version
    }

    /// Library context shared by every holder, if the runtime created one
    pub fn context(&self) -> Option<&Context> {
        self.state.context.as_ref()
    }

    /// Give the hold back
    pub fn release(self) {}
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        debug!("libusb runtime released");
    }
}

impl std::fmt::Debug for RuntimeLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeLease")
            .field("version", &self.state.version)
            .field("has_context", &self.state.context.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_runtime() -> (UsbRuntime, Arc<AtomicUsize>) {
        let inits = Arc::new(AtomicUsize::new(0));
        let counter = inits.clone();
        let runtime = UsbRuntime::with_initializer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });
        (runtime, inits)
    }

    #[test]
    fn test_leases_are_counted() {
        let (runtime, inits) = counting_runtime();
        assert_eq!(runtime.active_leases(), 0);

        let a = runtime.acquire().unwrap();
        let b = runtime.acquire().unwrap();
        assert_eq!(runtime.active_leases(), 2);
        assert_eq!(inits.load(Ordering::SeqCst), 1);

        a.release();
        assert_eq!(runtime.active_leases(), 1);
        drop(b);
        assert_eq!(runtime.active_leases(), 0);
    }

    #[test]
    fn test_reacquire_after_teardown() {
        let (runtime, inits) = counting_runtime();
        runtime.acquire().unwrap().release();
        let lease = runtime.acquire().unwrap();
        assert!(!lease.library_version().is_empty());
        assert!(lease.context().is_none());
        assert_eq!(runtime.active_leases(), 1);
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_init_failure_records_no_lease() {
        let runtime = UsbRuntime::with_initializer(|| Err(rusb::Error::Other));

        let err = runtime.acquire().unwrap_err();
        assert!(matches!(err, Error::RuntimeInit(rusb::Error::Other)));
        assert_eq!(runtime.active_leases(), 0);
    }

    #[test]
    fn test_isolated_runtimes() {
        let (a, _) = counting_runtime();
        let (b, _) = counting_runtime();
        let _lease = a.acquire().unwrap();
        assert_eq!(a.active_leases(), 1);
        assert_eq!(b.active_leases(), 0);
    }
}
