#![allow(non_camel_case_types)]

//! ODBC C typedefs and the constants used across the native call boundary.

use std::ffi::c_void;

pub type SQLSMALLINT = i16;
pub type SQLUSMALLINT = u16;
pub type SQLINTEGER = i32;
pub type SQLLEN = isize;
pub type SQLULEN = usize;
pub type SQLRETURN = SQLSMALLINT;
pub type SQLPOINTER = *mut c_void;
pub type SQLHANDLE = *mut c_void;
pub type SQLHWND = *mut c_void;
pub type SQLWCHAR = u16;

// ── Return codes ────────────────────────────────────────────────────

pub const SQL_SUCCESS: SQLRETURN = 0;
pub const SQL_SUCCESS_WITH_INFO: SQLRETURN = 1;
pub const SQL_ERROR: SQLRETURN = -1;
pub const SQL_INVALID_HANDLE: SQLRETURN = -2;
pub const SQL_NEED_DATA: SQLRETURN = 99;
pub const SQL_NO_DATA: SQLRETURN = 100;

// ── Handle types ────────────────────────────────────────────────────

pub const SQL_HANDLE_ENV: SQLSMALLINT = 1;
pub const SQL_HANDLE_DBC: SQLSMALLINT = 2;
pub const SQL_HANDLE_STMT: SQLSMALLINT = 3;

// ── Attributes ──────────────────────────────────────────────────────

pub const SQL_ATTR_ODBC_VERSION: SQLINTEGER = 200;
pub const SQL_OV_ODBC3: SQLINTEGER = 3;
pub const SQL_ATTR_QUERY_TIMEOUT: SQLINTEGER = 0;
pub const SQL_ATTR_AUTOCOMMIT: SQLINTEGER = 102;
pub const SQL_ATTR_PARAM_BIND_TYPE: SQLINTEGER = 18;
pub const SQL_ATTR_PARAMSET_SIZE: SQLINTEGER = 22;
pub const SQL_PARAM_BIND_BY_COLUMN: SQLULEN = 0;
pub const SQL_AUTOCOMMIT_OFF: SQLULEN = 0;
pub const SQL_AUTOCOMMIT_ON: SQLULEN = 1;
pub const SQL_IS_UINTEGER: SQLINTEGER = -5;

// ── SQLFreeStmt options ─────────────────────────────────────────────

pub const SQL_CLOSE: SQLUSMALLINT = 0;
pub const SQL_UNBIND: SQLUSMALLINT = 2;
pub const SQL_RESET_PARAMS: SQLUSMALLINT = 3;

// ── Parameter direction ─────────────────────────────────────────────

pub const SQL_PARAM_INPUT: SQLSMALLINT = 1;
pub const SQL_PARAM_INPUT_OUTPUT: SQLSMALLINT = 2;
pub const SQL_PARAM_OUTPUT: SQLSMALLINT = 4;

// ── Lengths and indicators ──────────────────────────────────────────

pub const SQL_NULL_DATA: SQLLEN = -1;
pub const SQL_NO_TOTAL: SQLLEN = -4;
pub const SQL_NTS: SQLLEN = -3;

// ── SQL and C data types ────────────────────────────────────────────

pub const SQL_CHAR: SQLSMALLINT = 1;
pub const SQL_INTEGER: SQLSMALLINT = 4;
pub const SQL_VARCHAR: SQLSMALLINT = 12;
pub const SQL_BINARY: SQLSMALLINT = -2;
pub const SQL_VARBINARY: SQLSMALLINT = -3;
pub const SQL_LONGVARBINARY: SQLSMALLINT = -4;
pub const SQL_WCHAR: SQLSMALLINT = -8;
pub const SQL_WVARCHAR: SQLSMALLINT = -9;
pub const SQL_WLONGVARCHAR: SQLSMALLINT = -10;
pub const SQL_C_BINARY: SQLSMALLINT = SQL_BINARY;
pub const SQL_C_WCHAR: SQLSMALLINT = SQL_WCHAR;

pub const SQL_NO_NULLS: SQLSMALLINT = 0;
pub const SQL_NULLABLE: SQLSMALLINT = 1;

// ── Column attributes ───────────────────────────────────────────────

pub const SQL_DESC_TYPE_NAME: SQLUSMALLINT = 14;

// ── Transactions ────────────────────────────────────────────────────

pub const SQL_COMMIT: SQLSMALLINT = 0;
pub const SQL_ROLLBACK: SQLSMALLINT = 1;

pub const SQL_DRIVER_NOPROMPT: SQLUSMALLINT = 0;

// ── SQLSTATEs the core branches on ──────────────────────────────────

pub const SQL_STATE_DATA_TRUNCATED: &str = "01004";
pub const SQL_STATE_CONNECTION_NOT_OPEN: &str = "08003";
pub const SQL_STATE_INVALID_TRANSACTION_STATE: &str = "25000";

/// Characters in the default diagnostic, column-name and output-parameter buffers.
pub const SMALL_BUFFER_SIZE: usize = 1 << 12;
/// Bytes in the default row-fetch working buffer.
pub const LARGE_BUFFER_SIZE: usize = 1 << 20;

/// Human-readable name for a return code, used in log lines.
pub fn return_code_name(rc: SQLRETURN) -> &'static str {
    match rc {
        SQL_SUCCESS => "SQL_SUCCESS",
        SQL_SUCCESS_WITH_INFO => "SQL_SUCCESS_WITH_INFO",
        SQL_ERROR => "SQL_ERROR",
        SQL_INVALID_HANDLE => "SQL_INVALID_HANDLE",
        SQL_NEED_DATA => "SQL_NEED_DATA",
        SQL_NO_DATA => "SQL_NO_DATA",
        _ => "UNKNOWN",
    }
}

/// Encode as UTF-16 with a trailing terminator.
pub fn to_wide_nts(s: &str) -> Vec<SQLWCHAR> {
    let mut w: Vec<SQLWCHAR> = s.encode_utf16().collect();
    w.push(0);
    w
}

/// Decode a UTF-16 buffer up to the first terminator (or the whole slice).
pub fn from_wide_nts(buf: &[SQLWCHAR]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_strings_keep_terminator() {
        let w = to_wide_nts("abc");
        assert_eq!(w, vec![97, 98, 99, 0]);
        assert_eq!(from_wide_nts(&w), "abc");
    }

    #[test]
    fn wide_decode_without_terminator_uses_full_slice() {
        let w: Vec<u16> = "héllo".encode_utf16().collect();
        assert_eq!(from_wide_nts(&w), "héllo");
    }

    #[test]
    fn return_code_names() {
        assert_eq!(return_code_name(SQL_NO_DATA), "SQL_NO_DATA");
        assert_eq!(return_code_name(42), "UNKNOWN");
    }
}
