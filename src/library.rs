//! Runtime-loaded ODBC driver manager.

use crate::error::{Error, Result};
use crate::handle::DRIVER_LOCK;
use crate::native::NativeApi;
use crate::types::*;
use libloading::Library;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{debug, info};

type AllocHandleFn = unsafe extern "system" fn(SQLSMALLINT, SQLHANDLE, *mut SQLHANDLE) -> SQLRETURN;
type FreeHandleFn = unsafe extern "system" fn(SQLSMALLINT, SQLHANDLE) -> SQLRETURN;
type SetAttrFn = unsafe extern "system" fn(SQLHANDLE, SQLINTEGER, SQLPOINTER, SQLINTEGER) -> SQLRETURN;
type DriverConnectFn = unsafe extern "system" fn(
    SQLHANDLE,
    SQLHWND,
    *const SQLWCHAR,
    SQLSMALLINT,
    *mut SQLWCHAR,
    SQLSMALLINT,
    *mut SQLSMALLINT,
    SQLUSMALLINT,
) -> SQLRETURN;
type HandleFn = unsafe extern "system" fn(SQLHANDLE) -> SQLRETURN;
type EndTranFn = unsafe extern "system" fn(SQLSMALLINT, SQLHANDLE, SQLSMALLINT) -> SQLRETURN;
type TextFn = unsafe extern "system" fn(SQLHANDLE, *const SQLWCHAR, SQLINTEGER) -> SQLRETURN;
type CountFn = unsafe extern "system" fn(SQLHANDLE, *mut SQLSMALLINT) -> SQLRETURN;
type RowCountFn = unsafe extern "system" fn(SQLHANDLE, *mut SQLLEN) -> SQLRETURN;
type DescribeParamFn = unsafe extern "system" fn(
    SQLHANDLE,
    SQLUSMALLINT,
    *mut SQLSMALLINT,
    *mut SQLULEN,
    *mut SQLSMALLINT,
    *mut SQLSMALLINT,
) -> SQLRETURN;
type BindParameterFn = unsafe extern "system" fn(
    SQLHANDLE,
    SQLUSMALLINT,
    SQLSMALLINT,
    SQLSMALLINT,
    SQLSMALLINT,
    SQLULEN,
    SQLSMALLINT,
    SQLPOINTER,
    SQLLEN,
    *mut SQLLEN,
) -> SQLRETURN;
type FreeStmtFn = unsafe extern "system" fn(SQLHANDLE, SQLUSMALLINT) -> SQLRETURN;
type DescribeColFn = unsafe extern "system" fn(
    SQLHANDLE,
    SQLUSMALLINT,
    *mut SQLWCHAR,
    SQLSMALLINT,
    *mut SQLSMALLINT,
    *mut SQLSMALLINT,
    *mut SQLULEN,
    *mut SQLSMALLINT,
    *mut SQLSMALLINT,
) -> SQLRETURN;
type ColAttributeFn = unsafe extern "system" fn(
    SQLHANDLE,
    SQLUSMALLINT,
    SQLUSMALLINT,
    SQLPOINTER,
    SQLSMALLINT,
    *mut SQLSMALLINT,
    *mut SQLLEN,
) -> SQLRETURN;
type GetDataFn = unsafe extern "system" fn(
    SQLHANDLE,
    SQLUSMALLINT,
    SQLSMALLINT,
    SQLPOINTER,
    SQLLEN,
    *mut SQLLEN,
) -> SQLRETURN;
type GetDiagRecFn = unsafe extern "system" fn(
    SQLSMALLINT,
    SQLHANDLE,
    SQLSMALLINT,
    *mut SQLWCHAR,
    *mut SQLINTEGER,
    *mut SQLWCHAR,
    SQLSMALLINT,
    *mut SQLSMALLINT,
) -> SQLRETURN;

static LIBRARY: OnceCell<Arc<OdbcLibrary>> = OnceCell::new();

/// Entry points resolved from the driver manager shared library.
pub struct OdbcLibrary {
    path: String,
    alloc_handle: AllocHandleFn,
    free_handle: FreeHandleFn,
    set_env_attr: SetAttrFn,
    driver_connect_w: DriverConnectFn,
    disconnect: HandleFn,
    set_connect_attr: SetAttrFn,
    end_tran: EndTranFn,
    exec_direct_w: TextFn,
    prepare_w: TextFn,
    num_params: CountFn,
    describe_param: DescribeParamFn,
    bind_parameter: BindParameterFn,
    execute: HandleFn,
    set_stmt_attr: SetAttrFn,
    free_stmt: FreeStmtFn,
    num_result_cols: CountFn,
    row_count: RowCountFn,
    describe_col_w: DescribeColFn,
    col_attribute_w: ColAttributeFn,
    fetch: HandleFn,
    get_data: GetDataFn,
    more_results: HandleFn,
    get_diag_rec_w: GetDiagRecFn,
    // Keeps the resolved function pointers valid.
    _library: Library,
}

/// Platform default for the driver manager library.
///
/// Character buffers are UTF-16, so macOS defaults to unixODBC. iODBC's `W`
/// entry points take a 4-byte `wchar_t` and are not supported.
pub fn default_library_path() -> &'static str {
    if cfg!(windows) {
        "odbc32.dll"
    } else if cfg!(target_os = "macos") {
        "libodbc.2.dylib"
    } else {
        "libodbc.so"
    }
}

/// Load the driver manager exactly once per process.
///
/// Later calls return the already loaded library; a different `locator` on a
/// later call is ignored.
pub fn initialize(locator: Option<&str>) -> Result<Arc<dyn NativeApi>> {
    let _guard = DRIVER_LOCK.lock();
    if let Some(lib) = LIBRARY.get() {
        if let Some(path) = locator {
            if path != lib.path {
                debug!(
                    "ODBC library already loaded from {}, ignoring {}",
                    lib.path, path
                );
            }
        }
        return Ok(lib.clone());
    }
    let path = match locator {
        Some(path) => path,
        None => default_library_path(),
    };
    info!("Loading ODBC library: {}", path);
    let lib = Arc::new(OdbcLibrary::load(path)?);
    // Guarded by DRIVER_LOCK, so the cell is still empty here.
    let _ = LIBRARY.set(lib.clone());
    Ok(lib)
}

unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T> {
    let mut cname = name.as_bytes().to_vec();
    cname.push(0);
    library
        .get::<T>(&cname)
        .map(|s| *s)
        .map_err(|e| Error::interface("LIBRARY_SYMBOL", format!("{name}: {e}")))
}

impl OdbcLibrary {
    pub fn load(path: &str) -> Result<Self> {
        let library = unsafe { Library::new(path) }.map_err(|e| {
            Error::interface("LIBRARY_LOAD", format!("Unable to load {path}: {e}"))
        })?;
        unsafe {
            Ok(Self {
                path: path.to_string(),
                alloc_handle: symbol(&library, "SQLAllocHandle")?,
                free_handle: symbol(&library, "SQLFreeHandle")?,
                set_env_attr: symbol(&library, "SQLSetEnvAttr")?,
                driver_connect_w: symbol(&library, "SQLDriverConnectW")?,
                disconnect: symbol(&library, "SQLDisconnect")?,
                set_connect_attr: symbol(&library, "SQLSetConnectAttrW")?,
                end_tran: symbol(&library, "SQLEndTran")?,
                exec_direct_w: symbol(&library, "SQLExecDirectW")?,
                prepare_w: symbol(&library, "SQLPrepareW")?,
                num_params: symbol(&library, "SQLNumParams")?,
                describe_param: symbol(&library, "SQLDescribeParam")?,
                bind_parameter: symbol(&library, "SQLBindParameter")?,
                execute: symbol(&library, "SQLExecute")?,
                set_stmt_attr: symbol(&library, "SQLSetStmtAttrW")?,
                free_stmt: symbol(&library, "SQLFreeStmt")?,
                num_result_cols: symbol(&library, "SQLNumResultCols")?,
                row_count: symbol(&library, "SQLRowCount")?,
                describe_col_w: symbol(&library, "SQLDescribeColW")?,
                col_attribute_w: symbol(&library, "SQLColAttributeW")?,
                fetch: symbol(&library, "SQLFetch")?,
                get_data: symbol(&library, "SQLGetData")?,
                more_results: symbol(&library, "SQLMoreResults")?,
                get_diag_rec_w: symbol(&library, "SQLGetDiagRecW")?,
                _library: library,
            })
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl NativeApi for OdbcLibrary {
    unsafe fn alloc_handle(&self, t: SQLSMALLINT, input: SQLHANDLE, out: *mut SQLHANDLE) -> SQLRETURN {
        (self.alloc_handle)(t, input, out)
    }

    unsafe fn free_handle(&self, t: SQLSMALLINT, handle: SQLHANDLE) -> SQLRETURN {
        (self.free_handle)(t, handle)
    }

    unsafe fn set_env_attr(&self, henv: SQLHANDLE, a: SQLINTEGER, v: SQLPOINTER, l: SQLINTEGER) -> SQLRETURN {
        (self.set_env_attr)(henv, a, v, l)
    }

    unsafe fn driver_connect_w(
        &self,
        hdbc: SQLHANDLE,
        hwnd: SQLHWND,
        conn_str_in: *const SQLWCHAR,
        conn_str_in_len: SQLSMALLINT,
        conn_str_out: *mut SQLWCHAR,
        conn_str_out_max: SQLSMALLINT,
        conn_str_out_len: *mut SQLSMALLINT,
        driver_completion: SQLUSMALLINT,
    ) -> SQLRETURN {
        (self.driver_connect_w)(
            hdbc,
            hwnd,
            conn_str_in,
            conn_str_in_len,
            conn_str_out,
            conn_str_out_max,
            conn_str_out_len,
            driver_completion,
        )
    }

    unsafe fn disconnect(&self, hdbc: SQLHANDLE) -> SQLRETURN {
        (self.disconnect)(hdbc)
    }

    unsafe fn set_connect_attr(&self, hdbc: SQLHANDLE, a: SQLINTEGER, v: SQLPOINTER, l: SQLINTEGER) -> SQLRETURN {
        (self.set_connect_attr)(hdbc, a, v, l)
    }

    unsafe fn end_tran(&self, t: SQLSMALLINT, handle: SQLHANDLE, completion: SQLSMALLINT) -> SQLRETURN {
        (self.end_tran)(t, handle, completion)
    }

    unsafe fn exec_direct_w(&self, hstmt: SQLHANDLE, text: *const SQLWCHAR, len: SQLINTEGER) -> SQLRETURN {
        (self.exec_direct_w)(hstmt, text, len)
    }

    unsafe fn prepare_w(&self, hstmt: SQLHANDLE, text: *const SQLWCHAR, len: SQLINTEGER) -> SQLRETURN {
        (self.prepare_w)(hstmt, text, len)
    }

    unsafe fn num_params(&self, hstmt: SQLHANDLE, count: *mut SQLSMALLINT) -> SQLRETURN {
        (self.num_params)(hstmt, count)
    }

    unsafe fn describe_param(
        &self,
        hstmt: SQLHANDLE,
        param_number: SQLUSMALLINT,
        data_type: *mut SQLSMALLINT,
        param_size: *mut SQLULEN,
        decimal_digits: *mut SQLSMALLINT,
        nullable: *mut SQLSMALLINT,
    ) -> SQLRETURN {
        (self.describe_param)(hstmt, param_number, data_type, param_size, decimal_digits, nullable)
    }

    unsafe fn bind_parameter(
        &self,
        hstmt: SQLHANDLE,
        param_number: SQLUSMALLINT,
        input_output_type: SQLSMALLINT,
        value_type: SQLSMALLINT,
        parameter_type: SQLSMALLINT,
        column_size: SQLULEN,
        decimal_digits: SQLSMALLINT,
        value: SQLPOINTER,
        buffer_length: SQLLEN,
        str_len_or_ind: *mut SQLLEN,
    ) -> SQLRETURN {
        (self.bind_parameter)(
            hstmt,
            param_number,
            input_output_type,
            value_type,
            parameter_type,
            column_size,
            decimal_digits,
            value,
            buffer_length,
            str_len_or_ind,
        )
    }

    unsafe fn execute(&self, hstmt: SQLHANDLE) -> SQLRETURN {
        (self.execute)(hstmt)
    }

    unsafe fn set_stmt_attr(&self, hstmt: SQLHANDLE, a: SQLINTEGER, v: SQLPOINTER, l: SQLINTEGER) -> SQLRETURN {
        (self.set_stmt_attr)(hstmt, a, v, l)
    }

    unsafe fn free_stmt(&self, hstmt: SQLHANDLE, option: SQLUSMALLINT) -> SQLRETURN {
        (self.free_stmt)(hstmt, option)
    }

    unsafe fn num_result_cols(&self, hstmt: SQLHANDLE, count: *mut SQLSMALLINT) -> SQLRETURN {
        (self.num_result_cols)(hstmt, count)
    }

    unsafe fn row_count(&self, hstmt: SQLHANDLE, count: *mut SQLLEN) -> SQLRETURN {
        (self.row_count)(hstmt, count)
    }

    unsafe fn describe_col_w(
        &self,
        hstmt: SQLHANDLE,
        col_number: SQLUSMALLINT,
        col_name: *mut SQLWCHAR,
        buffer_length: SQLSMALLINT,
        name_length: *mut SQLSMALLINT,
        data_type: *mut SQLSMALLINT,
        column_size: *mut SQLULEN,
        decimal_digits: *mut SQLSMALLINT,
        nullable: *mut SQLSMALLINT,
    ) -> SQLRETURN {
        (self.describe_col_w)(
            hstmt,
            col_number,
            col_name,
            buffer_length,
            name_length,
            data_type,
            column_size,
            decimal_digits,
            nullable,
        )
    }

    unsafe fn col_attribute_w(
        &self,
        hstmt: SQLHANDLE,
        col_number: SQLUSMALLINT,
        field_identifier: SQLUSMALLINT,
        char_attr: SQLPOINTER,
        buffer_length: SQLSMALLINT,
        string_length: *mut SQLSMALLINT,
        numeric_attr: *mut SQLLEN,
    ) -> SQLRETURN {
        (self.col_attribute_w)(
            hstmt,
            col_number,
            field_identifier,
            char_attr,
            buffer_length,
            string_length,
            numeric_attr,
        )
    }

    unsafe fn fetch(&self, hstmt: SQLHANDLE) -> SQLRETURN {
        (self.fetch)(hstmt)
    }

    unsafe fn get_data(
        &self,
        hstmt: SQLHANDLE,
        col: SQLUSMALLINT,
        target_type: SQLSMALLINT,
        target_value: SQLPOINTER,
        buffer_length: SQLLEN,
        str_len_or_ind: *mut SQLLEN,
    ) -> SQLRETURN {
        (self.get_data)(hstmt, col, target_type, target_value, buffer_length, str_len_or_ind)
    }

    unsafe fn more_results(&self, hstmt: SQLHANDLE) -> SQLRETURN {
        (self.more_results)(hstmt)
    }

    unsafe fn get_diag_rec_w(
        &self,
        handle_type: SQLSMALLINT,
        handle: SQLHANDLE,
        rec_number: SQLSMALLINT,
        sql_state: *mut SQLWCHAR,
        native_error: *mut SQLINTEGER,
        message_text: *mut SQLWCHAR,
        buffer_length: SQLSMALLINT,
        text_length: *mut SQLSMALLINT,
    ) -> SQLRETURN {
        (self.get_diag_rec_w)(
            handle_type,
            handle,
            rec_number,
            sql_state,
            native_error,
            message_text,
            buffer_length,
            text_length,
        )
    }
}
