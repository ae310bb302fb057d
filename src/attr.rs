use crate::diagnostics::check_status;
use crate::error::Result;
use crate::handle::{Handle, HandleRef};
use crate::native::NativeApi;
use crate::types::*;

fn set_stmt_attr(
    api: &dyn NativeApi,
    hstmt: Handle,
    attribute: SQLINTEGER,
    value: SQLULEN,
    method: &str,
) -> Result<()> {
    let rc = unsafe {
        api.set_stmt_attr(
            hstmt.as_raw(),
            attribute,
            value as SQLPOINTER,
            SQL_IS_UINTEGER,
        )
    };
    check_status(api, rc, HandleRef::Stmt(hstmt), method, &[])?;
    Ok(())
}

/// Query timeout in seconds; 0 disables it.
pub fn set_query_timeout(api: &dyn NativeApi, hstmt: Handle, seconds: u32) -> Result<()> {
    set_stmt_attr(
        api,
        hstmt,
        SQL_ATTR_QUERY_TIMEOUT,
        seconds as SQLULEN,
        "SQLSetStmtAttr - SQL_ATTR_QUERY_TIMEOUT",
    )
}

/// Number of parameter rows the next execute reads.
pub fn set_paramset_size(api: &dyn NativeApi, hstmt: Handle, rows: usize) -> Result<()> {
    set_stmt_attr(
        api,
        hstmt,
        SQL_ATTR_PARAMSET_SIZE,
        rows,
        "SQLSetStmtAttr - SQL_ATTR_PARAMSET_SIZE",
    )
}

pub fn set_param_bind_by_column(api: &dyn NativeApi, hstmt: Handle) -> Result<()> {
    set_stmt_attr(
        api,
        hstmt,
        SQL_ATTR_PARAM_BIND_TYPE,
        SQL_PARAM_BIND_BY_COLUMN,
        "SQLSetStmtAttr - SQL_ATTR_PARAM_BIND_TYPE",
    )
}

pub fn set_autocommit(api: &dyn NativeApi, hdbc: Handle, autocommit: bool) -> Result<()> {
    let value = if autocommit {
        SQL_AUTOCOMMIT_ON
    } else {
        SQL_AUTOCOMMIT_OFF
    };
    let rc = unsafe {
        api.set_connect_attr(
            hdbc.as_raw(),
            SQL_ATTR_AUTOCOMMIT,
            value as SQLPOINTER,
            SQL_IS_UINTEGER,
        )
    };
    check_status(
        api,
        rc,
        HandleRef::Dbc(hdbc),
        "SQLSetConnectAttr - SQL_ATTR_AUTOCOMMIT",
        &[],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryDriver;

    #[test]
    fn statement_attributes_reach_the_driver() {
        let driver = MemoryDriver::new();
        let hstmt = Handle::from_raw(driver.alloc_raw_statement());
        set_query_timeout(&driver, hstmt, 120).unwrap();
        set_paramset_size(&driver, hstmt, 3).unwrap();
        set_param_bind_by_column(&driver, hstmt).unwrap();
        assert_eq!(driver.stmt_attr(hstmt.as_raw(), SQL_ATTR_QUERY_TIMEOUT), Some(120));
        assert_eq!(driver.stmt_attr(hstmt.as_raw(), SQL_ATTR_PARAMSET_SIZE), Some(3));
        assert_eq!(
            driver.stmt_attr(hstmt.as_raw(), SQL_ATTR_PARAM_BIND_TYPE),
            Some(SQL_PARAM_BIND_BY_COLUMN)
        );
    }

    #[test]
    fn attribute_on_freed_statement_is_an_interface_error() {
        let driver = MemoryDriver::new();
        let bogus = Handle::from_raw(0xbeef as SQLHANDLE);
        let err = set_query_timeout(&driver, bogus, 5).unwrap_err();
        assert_eq!(err.interface_code(), Some("SQL_INVALID_HANDLE"));
    }
}
