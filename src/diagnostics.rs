use crate::error::{Error, Result};
use crate::handle::HandleRef;
use crate::native::NativeApi;
use crate::types::*;
use tracing::{debug, info, trace};

/// Diagnostic record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiagRecord {
    pub state: String, // 5-char SQLSTATE e.g. "HY000"
    pub native_error: i32,
    pub message: String,
}

/// Retrieve every diagnostic record attached to `handle`.
///
/// A message longer than the buffer is re-read once into a buffer of the
/// reported length, without advancing the record number.
pub fn get_diagnostic_info(api: &dyn NativeApi, handle: HandleRef) -> Result<Vec<DiagRecord>> {
    let mut info = Vec::new();
    let mut rec_number: SQLSMALLINT = 1;
    let mut sql_state = [0 as SQLWCHAR; 6];
    let mut native_error: SQLINTEGER = 0;
    let mut message = vec![0 as SQLWCHAR; SMALL_BUFFER_SIZE];
    let mut message_length: SQLSMALLINT = 0;
    let mut resized = false;
    loop {
        let buffer_length = message.len().min(SQLSMALLINT::MAX as usize) as SQLSMALLINT;
        let rc = unsafe {
            api.get_diag_rec_w(
                handle.handle_type(),
                handle.raw(),
                rec_number,
                sql_state.as_mut_ptr(),
                &mut native_error,
                message.as_mut_ptr(),
                buffer_length,
                &mut message_length,
            )
        };
        match rc {
            SQL_SUCCESS_WITH_INFO
                if !resized && message_length.max(0) as usize >= message.len() =>
            {
                // Resize buffer to fit entire message.
                message = vec![0; message_length as usize + 1];
                resized = true;
            }
            SQL_SUCCESS | SQL_SUCCESS_WITH_INFO => {
                info.push(DiagRecord {
                    state: from_wide_nts(&sql_state),
                    native_error: native_error.saturating_abs(),
                    message: from_wide_nts(&message),
                });
                rec_number += 1;
                resized = false;
            }
            SQL_NO_DATA => return Ok(info),
            SQL_INVALID_HANDLE => {
                return Err(Error::interface(
                    "SQL_INVALID_HANDLE",
                    "Invalid handle passed to SQLGetDiagRecW.",
                ))
            }
            SQL_ERROR => {
                return Err(Error::interface(
                    "SQL_ERROR",
                    "SQL_ERROR returned from SQLGetDiagRecW.",
                ))
            }
            other => {
                return Err(Error::interface(
                    "UNKNOWN_RETURN_CODE",
                    format!("SQLGetDiagRecW returned an unknown return code: {other}"),
                ))
            }
        }
    }
}

/// Interpret the return code of a native call.
///
/// Returns the SQLSTATEs seen. Raises on the first error record whose state
/// is not in `ignore`; an ignored record ends the scan, since the records
/// behind it describe the earlier failure that caused it.
pub fn check_status(
    api: &dyn NativeApi,
    rc: SQLRETURN,
    handle: HandleRef,
    method: &str,
    ignore: &[&str],
) -> Result<Vec<String>> {
    trace!("{} returned status code {}", method, return_code_name(rc));
    let mut states = Vec::new();
    match rc {
        SQL_SUCCESS | SQL_NO_DATA => return Ok(states),
        SQL_SUCCESS_WITH_INFO | SQL_ERROR | SQL_NEED_DATA => {}
        SQL_INVALID_HANDLE => {
            return Err(Error::interface(
                "SQL_INVALID_HANDLE",
                format!("Invalid handle passed to {method}."),
            ))
        }
        other => {
            return Err(Error::interface(
                "UNKNOWN_RETURN_CODE",
                format!("{method} returned an unknown return code: {other}"),
            ))
        }
    }

    let info = get_diagnostic_info(api, handle)?;
    for rec in &info {
        states.push(rec.state.clone());
        if rc == SQL_SUCCESS_WITH_INFO {
            debug!("{} succeeded with info: [{}] {}", method, rec.state, rec.message);
        } else if !ignore.contains(&rec.state.as_str()) {
            debug!(
                "{} returned non-successful error code {}: [{}] {}",
                method,
                return_code_name(rc),
                rec.state,
                rec.message
            );
            return Err(Error::Database {
                code: rec.native_error,
                message: format!("[{}] {}", rec.state, rec.message),
                sql_state: rec.state.clone(),
            });
        } else {
            debug!(
                "Ignoring return of {} from {}: [{}] {}",
                return_code_name(rc),
                method,
                rec.state,
                rec.message
            );
            break;
        }
    }
    if info.is_empty() {
        info!(
            "No information associated with return code {} from {}",
            return_code_name(rc),
            method
        );
    }
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use crate::mock::MemoryDriver;

    fn stmt_with(driver: &MemoryDriver) -> HandleRef {
        HandleRef::Stmt(Handle::from_raw(driver.alloc_raw_statement()))
    }

    #[test]
    fn success_returns_no_states() {
        let driver = MemoryDriver::new();
        let h = stmt_with(&driver);
        let states = check_status(&driver, SQL_SUCCESS, h, "SQLExecute", &[]).unwrap();
        assert!(states.is_empty());
    }

    #[test]
    fn error_raises_database_error_with_state() {
        let driver = MemoryDriver::new();
        let h = stmt_with(&driver);
        driver.push_diagnostic(h.raw(), "42S02", 3807, "Object 'foo' does not exist.");
        let err = check_status(&driver, SQL_ERROR, h, "SQLExecDirectW", &[]).unwrap_err();
        match err {
            Error::Database {
                code,
                message,
                sql_state,
            } => {
                assert_eq!(code, 3807);
                assert_eq!(sql_state, "42S02");
                assert_eq!(message, "[42S02] Object 'foo' does not exist.");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn info_records_are_returned_not_raised() {
        let driver = MemoryDriver::new();
        let h = stmt_with(&driver);
        driver.push_diagnostic(h.raw(), "01004", 0, "String data, right truncated");
        driver.push_diagnostic(h.raw(), "01000", 0, "General warning");
        let states = check_status(&driver, SQL_SUCCESS_WITH_INFO, h, "SQLGetData", &[]).unwrap();
        assert_eq!(states, vec!["01004".to_string(), "01000".to_string()]);
    }

    #[test]
    fn ignored_state_short_circuits_the_scan() {
        let driver = MemoryDriver::new();
        let h = stmt_with(&driver);
        driver.push_diagnostic(h.raw(), "08003", 0, "Connection not open");
        driver.push_diagnostic(h.raw(), "08S01", 0, "Communication link failure");
        let states = check_status(&driver, SQL_ERROR, h, "SQLDisconnect", &["08003"]).unwrap();
        assert_eq!(states, vec!["08003".to_string()]);
    }

    #[test]
    fn error_without_records_is_not_raised() {
        let driver = MemoryDriver::new();
        let h = stmt_with(&driver);
        let states = check_status(&driver, SQL_ERROR, h, "SQLExecute", &[]).unwrap();
        assert!(states.is_empty());
    }

    #[test]
    fn invalid_handle_and_unknown_codes_are_interface_errors() {
        let driver = MemoryDriver::new();
        let h = stmt_with(&driver);
        let err = check_status(&driver, SQL_INVALID_HANDLE, h, "SQLFetch", &[]).unwrap_err();
        assert_eq!(err.interface_code(), Some("SQL_INVALID_HANDLE"));
        let err = check_status(&driver, 7, h, "SQLFetch", &[]).unwrap_err();
        assert_eq!(err.interface_code(), Some("UNKNOWN_RETURN_CODE"));
    }

    #[test]
    fn long_messages_are_reread_into_a_larger_buffer() {
        let driver = MemoryDriver::new();
        let h = stmt_with(&driver);
        let long = "x".repeat(SMALL_BUFFER_SIZE * 2 + 17);
        driver.push_diagnostic(h.raw(), "HY000", 1, &long);
        driver.push_diagnostic(h.raw(), "HY001", 2, "second");
        let info = get_diagnostic_info(&driver, h).unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].message, long);
        assert_eq!(info[1].state, "HY001");
        assert_eq!(info[1].message, "second");
    }

    #[test]
    fn native_codes_are_reported_as_absolute_values() {
        let driver = MemoryDriver::new();
        let h = stmt_with(&driver);
        driver.push_diagnostic(h.raw(), "HY000", -5, "negative");
        let info = get_diagnostic_info(&driver, h).unwrap();
        assert_eq!(info[0].native_error, 5);
    }
}
