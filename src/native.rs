//! The native call boundary.
//!
//! Every ODBC entry point the core depends on, expressed as a trait so the
//! driver manager can be loaded at runtime ([`crate::library`]) or replaced by
//! the in-memory driver in tests. Each method has the exact C contract of the
//! function it is named after, including pointer ownership: buffers passed to
//! `bind_parameter` must stay valid until the matching `execute` returns.

use crate::types::*;

#[allow(clippy::too_many_arguments)]
pub trait NativeApi: Send + Sync {
    /// # Safety
    /// `output` must be valid for writes.
    unsafe fn alloc_handle(
        &self,
        handle_type: SQLSMALLINT,
        input_handle: SQLHANDLE,
        output_handle: *mut SQLHANDLE,
    ) -> SQLRETURN;

    /// # Safety
    /// `handle` must not be used after a successful free.
    unsafe fn free_handle(&self, handle_type: SQLSMALLINT, handle: SQLHANDLE) -> SQLRETURN;

    /// # Safety
    /// `value` is interpreted according to `attribute`.
    unsafe fn set_env_attr(
        &self,
        henv: SQLHANDLE,
        attribute: SQLINTEGER,
        value: SQLPOINTER,
        string_length: SQLINTEGER,
    ) -> SQLRETURN;

    /// # Safety
    /// String pointers must be valid for the given lengths.
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
    ) -> SQLRETURN;

    /// # Safety
    /// `hdbc` must be a connection handle.
    unsafe fn disconnect(&self, hdbc: SQLHANDLE) -> SQLRETURN;

    /// # Safety
    /// `value` is interpreted according to `attribute`.
    unsafe fn set_connect_attr(
        &self,
        hdbc: SQLHANDLE,
        attribute: SQLINTEGER,
        value: SQLPOINTER,
        string_length: SQLINTEGER,
    ) -> SQLRETURN;

    /// # Safety
    /// `handle` must match `handle_type`.
    unsafe fn end_tran(
        &self,
        handle_type: SQLSMALLINT,
        handle: SQLHANDLE,
        completion_type: SQLSMALLINT,
    ) -> SQLRETURN;

    /// # Safety
    /// `text` must be valid for `text_length` characters or terminated.
    unsafe fn exec_direct_w(
        &self,
        hstmt: SQLHANDLE,
        text: *const SQLWCHAR,
        text_length: SQLINTEGER,
    ) -> SQLRETURN;

    /// # Safety
    /// `text` must be valid for `text_length` characters or terminated.
    unsafe fn prepare_w(
        &self,
        hstmt: SQLHANDLE,
        text: *const SQLWCHAR,
        text_length: SQLINTEGER,
    ) -> SQLRETURN;

    /// # Safety
    /// `count` must be valid for writes.
    unsafe fn num_params(&self, hstmt: SQLHANDLE, count: *mut SQLSMALLINT) -> SQLRETURN;

    /// # Safety
    /// Output pointers must be valid for writes.
    unsafe fn describe_param(
        &self,
        hstmt: SQLHANDLE,
        param_number: SQLUSMALLINT,
        data_type: *mut SQLSMALLINT,
        param_size: *mut SQLULEN,
        decimal_digits: *mut SQLSMALLINT,
        nullable: *mut SQLSMALLINT,
    ) -> SQLRETURN;

    /// # Safety
    /// `value` and `str_len_or_ind` are deferred buffers read (and for output
    /// parameters written) by the next `execute`.
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
    ) -> SQLRETURN;

    /// # Safety
    /// All bound parameter buffers must still be alive.
    unsafe fn execute(&self, hstmt: SQLHANDLE) -> SQLRETURN;

    /// # Safety
    /// `value` is interpreted according to `attribute`.
    unsafe fn set_stmt_attr(
        &self,
        hstmt: SQLHANDLE,
        attribute: SQLINTEGER,
        value: SQLPOINTER,
        string_length: SQLINTEGER,
    ) -> SQLRETURN;

    /// # Safety
    /// `hstmt` must be a statement handle.
    unsafe fn free_stmt(&self, hstmt: SQLHANDLE, option: SQLUSMALLINT) -> SQLRETURN;

    /// # Safety
    /// `count` must be valid for writes.
    unsafe fn num_result_cols(&self, hstmt: SQLHANDLE, count: *mut SQLSMALLINT) -> SQLRETURN;

    /// # Safety
    /// `count` must be valid for writes.
    unsafe fn row_count(&self, hstmt: SQLHANDLE, count: *mut SQLLEN) -> SQLRETURN;

    /// # Safety
    /// `col_name` must hold `buffer_length` characters; other outputs must be writable.
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
    ) -> SQLRETURN;

    /// # Safety
    /// `char_attr` must hold `buffer_length` bytes.
    unsafe fn col_attribute_w(
        &self,
        hstmt: SQLHANDLE,
        col_number: SQLUSMALLINT,
        field_identifier: SQLUSMALLINT,
        char_attr: SQLPOINTER,
        buffer_length: SQLSMALLINT,
        string_length: *mut SQLSMALLINT,
        numeric_attr: *mut SQLLEN,
    ) -> SQLRETURN;

    /// # Safety
    /// `hstmt` must be a statement handle with an open result set.
    unsafe fn fetch(&self, hstmt: SQLHANDLE) -> SQLRETURN;

    /// # Safety
    /// `target_value` must hold `buffer_length` bytes.
    unsafe fn get_data(
        &self,
        hstmt: SQLHANDLE,
        col: SQLUSMALLINT,
        target_type: SQLSMALLINT,
        target_value: SQLPOINTER,
        buffer_length: SQLLEN,
        str_len_or_ind: *mut SQLLEN,
    ) -> SQLRETURN;

    /// # Safety
    /// `hstmt` must be a statement handle.
    unsafe fn more_results(&self, hstmt: SQLHANDLE) -> SQLRETURN;

    /// # Safety
    /// `sql_state` holds 6 characters, `message_text` holds `buffer_length` characters.
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
    ) -> SQLRETURN;
}
