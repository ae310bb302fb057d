use crate::config::ConnectOptions;
use crate::connect::{default_converter, Connection, ConnectionInner};
use crate::datatypes::TypeConverter;
use crate::diagnostics::check_status;
use crate::error::{Error, Result};
use crate::library;
use crate::native::NativeApi;
use crate::types::*;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::ptr;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Serializes library loading and driver connects; native driver
/// initialization is frequently not safe for concurrent first use.
pub(crate) static DRIVER_LOCK: Mutex<()> = parking_lot::const_mutex(());

static SHARED: OnceCell<Environment> = OnceCell::new();

/// Opaque native handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle(SQLHANDLE);

// Handles are plain tokens; exclusive use is enforced by their owners.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub fn from_raw(raw: SQLHANDLE) -> Self {
        Handle(raw)
    }

    pub fn as_raw(self) -> SQLHANDLE {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// A handle together with its type, as needed for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleRef {
    Env(Handle),
    Dbc(Handle),
    Stmt(Handle),
}

impl HandleRef {
    pub fn handle_type(self) -> SQLSMALLINT {
        match self {
            HandleRef::Env(_) => SQL_HANDLE_ENV,
            HandleRef::Dbc(_) => SQL_HANDLE_DBC,
            HandleRef::Stmt(_) => SQL_HANDLE_STMT,
        }
    }

    pub fn raw(self) -> SQLHANDLE {
        match self {
            HandleRef::Env(h) | HandleRef::Dbc(h) | HandleRef::Stmt(h) => h.as_raw(),
        }
    }
}

/// Allocate a connection or statement handle below `parent`.
pub fn alloc_handle(api: &dyn NativeApi, handle_type: SQLSMALLINT, parent: HandleRef) -> Result<Handle> {
    let mut output: SQLHANDLE = ptr::null_mut();
    let rc = unsafe { api.alloc_handle(handle_type, parent.raw(), &mut output) };
    check_status(api, rc, parent, "SQLAllocHandle", &[])?;
    if output.is_null() {
        return Err(Error::interface(
            "SQL_INVALID_HANDLE",
            "SQLAllocHandle did not return a handle.",
        ));
    }
    Ok(Handle(output))
}

/// Free a handle. An already invalid handle is not an error.
pub fn free_handle(api: &dyn NativeApi, handle: HandleRef) -> Result<()> {
    let rc = unsafe { api.free_handle(handle.handle_type(), handle.raw()) };
    if rc == SQL_INVALID_HANDLE {
        debug!("SQLFreeHandle: handle {:?} was already invalid", handle);
        return Ok(());
    }
    check_status(api, rc, handle, "SQLFreeHandle", &[])?;
    Ok(())
}

/// Runtime context: the native API, the environment handle and the
/// registry of connections that are still open.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

pub(crate) struct EnvInner {
    pub(crate) api: Arc<dyn NativeApi>,
    henv: Mutex<Option<Handle>>,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
}

impl Environment {
    /// Allocate the environment handle and request ODBC 3 behavior.
    pub fn new(api: Arc<dyn NativeApi>) -> Result<Self> {
        let mut raw: SQLHANDLE = ptr::null_mut();
        let rc = unsafe { api.alloc_handle(SQL_HANDLE_ENV, ptr::null_mut(), &mut raw) };
        check_status(&*api, rc, HandleRef::Env(Handle(raw)), "SQLAllocHandle", &[])?;
        if raw.is_null() {
            return Err(Error::interface(
                "SQL_INVALID_HANDLE",
                "SQLAllocHandle did not return an environment handle.",
            ));
        }
        let henv = Handle(raw);
        let rc = unsafe {
            api.set_env_attr(
                raw,
                SQL_ATTR_ODBC_VERSION,
                SQL_OV_ODBC3 as usize as SQLPOINTER,
                0,
            )
        };
        if let Err(e) = check_status(
            &*api,
            rc,
            HandleRef::Env(henv),
            "SQLSetEnvAttr - SQL_ATTR_ODBC_VERSION",
            &[],
        ) {
            let _ = free_handle(&*api, HandleRef::Env(henv));
            return Err(e);
        }
        debug!("Allocated ODBC environment handle {:?}", henv);
        Ok(Environment {
            inner: Arc::new(EnvInner {
                api,
                henv: Mutex::new(Some(henv)),
                connections: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Load the driver manager (once per process) and create a context on it.
    pub fn initialize(locator: Option<&str>) -> Result<Self> {
        let api = library::initialize(locator)?;
        Self::new(api)
    }

    /// Process-wide context, created on first use.
    pub fn shared(locator: Option<&str>) -> Result<Self> {
        SHARED.get_or_try_init(|| Self::initialize(locator)).cloned()
    }

    pub fn api(&self) -> &Arc<dyn NativeApi> {
        &self.inner.api
    }

    pub fn connect(&self, options: &ConnectOptions) -> Result<Connection> {
        Connection::open(self.inner.clone(), options, default_converter())
    }

    /// Connect with a caller-supplied type converter.
    pub fn connect_with_converter(
        &self,
        options: &ConnectOptions,
        converter: Arc<dyn TypeConverter>,
    ) -> Result<Connection> {
        Connection::open(self.inner.clone(), options, converter)
    }

    /// Number of connections that are registered and still alive.
    pub fn open_connections(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    /// Close every connection still open, then free the environment handle.
    pub fn shutdown(&self) -> Result<()> {
        let leaked: Vec<Arc<ConnectionInner>> = self
            .inner
            .connections
            .lock()
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        if !leaked.is_empty() {
            warn!(
                "{} open connections found on shutdown, attempting to close...",
                leaked.len()
            );
            for conn in leaked {
                if let Err(e) = conn.close() {
                    warn!("Failed to close leaked connection: {}", e);
                }
            }
        }
        let henv = self.inner.henv.lock().take();
        if let Some(henv) = henv {
            free_handle(&*self.inner.api, HandleRef::Env(henv))?;
            debug!("Freed ODBC environment handle {:?}", henv);
        }
        Ok(())
    }
}

impl EnvInner {
    pub(crate) fn handle(&self) -> Result<Handle> {
        let henv = *self.henv.lock();
        henv.ok_or_else(|| {
            Error::interface("ENVIRONMENT_CLOSED", "The ODBC environment has been shut down.")
        })
    }

    pub(crate) fn register(&self, conn: &Arc<ConnectionInner>) {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.push(Arc::downgrade(conn));
    }

    pub(crate) fn deregister(&self, conn: &ConnectionInner) {
        self.connections
            .lock()
            .retain(|c| c.strong_count() > 0 && !ptr::eq(c.as_ptr(), conn));
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        if let Some(henv) = self.henv.get_mut().take() {
            let _ = free_handle(&*self.api, HandleRef::Env(henv));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryDriver;

    #[test]
    fn environment_requests_odbc3() {
        let driver = Arc::new(MemoryDriver::new());
        let env = Environment::new(driver.clone()).unwrap();
        assert_eq!(driver.odbc_version(), Some(SQL_OV_ODBC3));
        env.shutdown().unwrap();
        assert_eq!(driver.live_handles(), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let driver = Arc::new(MemoryDriver::new());
        let env = Environment::new(driver.clone()).unwrap();
        env.shutdown().unwrap();
        env.shutdown().unwrap();
        assert_eq!(driver.calls_named("SQLFreeHandle"), 1);
    }

    #[test]
    fn free_tolerates_invalid_handle() {
        let driver = MemoryDriver::new();
        let bogus = Handle::from_raw(0xdead as SQLHANDLE);
        free_handle(&driver, HandleRef::Stmt(bogus)).unwrap();
    }

    #[test]
    fn shutdown_sweeps_leaked_connections() {
        let driver = Arc::new(MemoryDriver::new());
        let env = Environment::new(driver.clone()).unwrap();
        let conn = env
            .connect(&ConnectOptions::new("Memory").system("local"))
            .unwrap();
        assert_eq!(env.open_connections(), 1);
        env.shutdown().unwrap();
        assert!(conn.is_closed());
        assert_eq!(env.open_connections(), 0);
        assert_eq!(driver.live_handles(), 0);
    }
}
