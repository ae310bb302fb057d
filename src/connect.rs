use crate::attr;
use crate::config::{redact_password, ConnectOptions, PRIMARY_DB_TYPE};
use crate::cursor::{Cursor, StatementSlot};
use crate::datatypes::{DefaultConverter, TypeConverter};
use crate::diagnostics::check_status;
use crate::error::{Error, Result};
use crate::handle::{alloc_handle, free_handle, EnvInner, Handle, HandleRef, DRIVER_LOCK};
use crate::native::NativeApi;
use crate::types::*;
use parking_lot::Mutex;
use std::mem;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Timeout of the statements run while setting up a session.
pub const SESSION_SETUP_TIMEOUT: u32 = 120;

/// An open session with the database.
///
/// Cheap to clone; the session is closed by [`Connection::close`] or when the
/// last handle to it (including its cursors) is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    env: Arc<EnvInner>,
    db_type: String,
    converter: Arc<dyn TypeConverter>,
    state: Mutex<ConnState>,
    session: Mutex<Option<String>>,
}

struct ConnState {
    hdbc: Option<Handle>,
    cursors: Vec<(u64, Arc<StatementSlot>)>,
    cursor_count: u64,
    autocommit: bool,
}

impl Connection {
    pub(crate) fn open(
        env: Arc<EnvInner>,
        options: &ConnectOptions,
        converter: Arc<dyn TypeConverter>,
    ) -> Result<Self> {
        let conn_str = options.connection_string();
        debug!(
            "Creating connection using ODBC ConnectionString: {}",
            redact_password(&conn_str)
        );
        let api = &*env.api;
        let henv = env.handle()?;
        let hdbc = alloc_handle(api, SQL_HANDLE_DBC, HandleRef::Env(henv))?;
        let wide = to_wide_nts(&conn_str);
        let status = {
            let _guard = DRIVER_LOCK.lock();
            let rc = unsafe {
                api.driver_connect_w(
                    hdbc.as_raw(),
                    ptr::null_mut(),
                    wide.as_ptr(),
                    SQL_NTS as SQLSMALLINT,
                    ptr::null_mut(),
                    0,
                    ptr::null_mut(),
                    SQL_DRIVER_NOPROMPT,
                )
            };
            check_status(api, rc, HandleRef::Dbc(hdbc), "SQLDriverConnectW", &[])
        };
        if let Err(e) = status {
            if let Err(free_err) = free_handle(api, HandleRef::Dbc(hdbc)) {
                warn!("Failed to free connection handle after failed connect: {}", free_err);
            }
            return Err(e);
        }

        let inner = Arc::new(ConnectionInner {
            env: env.clone(),
            db_type: options.db_type.clone(),
            converter,
            state: Mutex::new(ConnState {
                hdbc: Some(hdbc),
                cursors: Vec::new(),
                cursor_count: 0,
                autocommit: options.autocommit,
            }),
            session: Mutex::new(None),
        });
        env.register(&inner);
        let conn = Connection { inner };
        if let Err(e) = conn.setup(options) {
            if let Err(close_err) = conn.close() {
                warn!("Failed to close connection after setup error: {}", close_err);
            }
            return Err(e);
        }
        Ok(conn)
    }

    fn setup(&self, options: &ConnectOptions) -> Result<()> {
        let hdbc = self.inner.hdbc()?;
        attr::set_autocommit(&**self.inner.api(), hdbc, options.autocommit)?;
        if self.inner.db_type == PRIMARY_DB_TYPE {
            let mut cursor = self.inner.open_cursor(0)?;
            cursor.set_query_timeout(SESSION_SETUP_TIMEOUT);
            let session = cursor
                .execute("SELECT SESSION", &[])?
                .fetch_one()?
                .and_then(|row| row.get(0).filter(|v| !v.is_null()).map(ToString::to_string));
            *self.inner.session.lock() = session;
            if let Some(bands) = options.query_band_string() {
                cursor.execute(&format!("SET QUERY_BAND = '{bands}' FOR SESSION"), &[])?;
            }
            cursor.close()?;
            if !options.autocommit {
                self.commit()?;
            }
            debug!("SELECT SESSION returned {}", self.inner.session_label());
        }
        Ok(())
    }

    /// Open a new cursor on this connection.
    pub fn cursor(&self) -> Result<Cursor> {
        let num = {
            let mut state = self.inner.state.lock();
            state.cursor_count += 1;
            state.cursor_count
        };
        let cursor = self.inner.open_cursor(num)?;
        debug!(
            "Creating cursor {} for session {}.",
            num,
            self.inner.session_label()
        );
        Ok(cursor)
    }

    pub fn commit(&self) -> Result<()> {
        self.inner.end_tran(SQL_COMMIT, "SQLEndTran - SQL_COMMIT")
    }

    pub fn rollback(&self) -> Result<()> {
        self.inner.end_tran(SQL_ROLLBACK, "SQLEndTran - SQL_ROLLBACK")
    }

    /// Close every cursor and the session. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().hdbc.is_none()
    }

    /// Server-assigned session number, for variants that report one.
    pub fn session_no(&self) -> Option<String> {
        self.inner.session.lock().clone()
    }

    pub fn autocommit(&self) -> bool {
        self.inner.state.lock().autocommit
    }

    pub fn set_autocommit(&self, autocommit: bool) -> Result<()> {
        let hdbc = self.inner.hdbc()?;
        attr::set_autocommit(&**self.inner.api(), hdbc, autocommit)?;
        self.inner.state.lock().autocommit = autocommit;
        Ok(())
    }

    pub fn db_type(&self) -> &str {
        &self.inner.db_type
    }

    /// Number of cursors currently open on this connection.
    pub fn open_cursors(&self) -> usize {
        self.inner.state.lock().cursors.len()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("db_type", &self.inner.db_type)
            .field("session", &self.session_no())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionInner {
    pub(crate) fn api(&self) -> &Arc<dyn NativeApi> {
        &self.env.api
    }

    pub(crate) fn db_type(&self) -> &str {
        &self.db_type
    }

    pub(crate) fn converter(&self) -> &Arc<dyn TypeConverter> {
        &self.converter
    }

    pub(crate) fn session_label(&self) -> String {
        self.session
            .lock()
            .clone()
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    fn hdbc(&self) -> Result<Handle> {
        let hdbc = self.state.lock().hdbc;
        hdbc.ok_or_else(|| Error::interface("CONNECTION_CLOSED", "The connection has been closed."))
    }

    fn open_cursor(self: &Arc<Self>, num: u64) -> Result<Cursor> {
        let mut state = self.state.lock();
        let hdbc = state.hdbc.ok_or_else(|| {
            Error::interface("CONNECTION_CLOSED", "The connection has been closed.")
        })?;
        let hstmt = alloc_handle(&*self.env.api, SQL_HANDLE_STMT, HandleRef::Dbc(hdbc))?;
        let slot = Arc::new(StatementSlot::new(hstmt));
        state.cursors.push((num, slot.clone()));
        Ok(Cursor::new(self.clone(), num, slot))
    }

    pub(crate) fn remove_cursor(&self, num: u64) {
        self.state.lock().cursors.retain(|(n, _)| *n != num);
    }

    fn end_tran(&self, completion: SQLSMALLINT, method: &str) -> Result<()> {
        let hdbc = self.hdbc()?;
        let api = &*self.env.api;
        let rc = unsafe { api.end_tran(SQL_HANDLE_DBC, hdbc.as_raw(), completion) };
        check_status(api, rc, HandleRef::Dbc(hdbc), method, &[])?;
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<()> {
        let (hdbc, cursors) = {
            let mut state = self.state.lock();
            match state.hdbc.take() {
                Some(hdbc) => (hdbc, mem::take(&mut state.cursors)),
                None => return Ok(()),
            }
        };
        let api = &*self.env.api;
        let session = self.session_label();
        debug!("Closing session {}...", session);
        for (num, slot) in cursors {
            let hstmt = slot.hstmt.lock().take();
            if let Some(hstmt) = hstmt {
                if num > 0 {
                    debug!("Closing cursor {} for session {}.", num, session);
                }
                if let Err(e) = free_handle(api, HandleRef::Stmt(hstmt)) {
                    warn!("Failed to free cursor {} of session {}: {}", num, session, e);
                }
            }
        }
        let disconnected = self.disconnect(api, hdbc, &session);
        let freed = free_handle(api, HandleRef::Dbc(hdbc));
        self.env.deregister(self);
        debug!("Session {} closed.", session);
        disconnected.and(freed)
    }

    fn disconnect(&self, api: &dyn NativeApi, hdbc: Handle, session: &str) -> Result<()> {
        let rc = unsafe { api.disconnect(hdbc.as_raw()) };
        let states = check_status(
            api,
            rc,
            HandleRef::Dbc(hdbc),
            "SQLDisconnect",
            &[
                SQL_STATE_CONNECTION_NOT_OPEN,
                SQL_STATE_INVALID_TRANSACTION_STATE,
            ],
        )?;
        if states
            .iter()
            .any(|s| s == SQL_STATE_INVALID_TRANSACTION_STATE)
        {
            warn!(
                "Rolling back open transaction for session {} so it can be closed.",
                session
            );
            let rc = unsafe { api.end_tran(SQL_HANDLE_DBC, hdbc.as_raw(), SQL_ROLLBACK) };
            check_status(api, rc, HandleRef::Dbc(hdbc), "SQLEndTran - SQL_ROLLBACK", &[])?;
            let rc = unsafe { api.disconnect(hdbc.as_raw()) };
            check_status(api, rc, HandleRef::Dbc(hdbc), "SQLDisconnect", &[])?;
        }
        Ok(())
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close connection on drop: {}", e);
        }
    }
}

/// Converter used when none is supplied.
pub(crate) fn default_converter() -> Arc<dyn TypeConverter> {
    Arc::new(DefaultConverter)
}
