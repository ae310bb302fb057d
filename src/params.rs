//! Parameter binding.
//!
//! Two strategies: [`RowBinding`] binds one argument row per execute and
//! supports output parameters; [`ColumnarBinding`] binds every row at once
//! as column-wise arrays for a single execute.

use crate::attr;
use crate::datatypes::Value;
use crate::diagnostics::check_status;
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleRef};
use crate::native::NativeApi;
use crate::types::*;
use std::mem;
use std::ops::Index;
use std::ptr;
use tracing::{debug, trace};

/// A statement argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    Value(Value),
    /// Output parameter; `size` is the buffer capacity in characters.
    Out { size: Option<usize> },
    /// Input/output parameter seeded with `value`.
    InOut { value: Value, size: Option<usize> },
}

impl Param {
    pub fn null() -> Self {
        Param::Value(Value::Null)
    }

    pub fn out() -> Self {
        Param::Out { size: None }
    }

    pub fn out_sized(size: usize) -> Self {
        Param::Out { size: Some(size) }
    }

    pub fn in_out(value: impl Into<Value>) -> Self {
        Param::InOut {
            value: value.into(),
            size: None,
        }
    }

    pub fn in_out_sized(value: impl Into<Value>, size: usize) -> Self {
        Param::InOut {
            value: value.into(),
            size: Some(size),
        }
    }

    pub fn is_output(&self) -> bool {
        !matches!(self, Param::Value(_))
    }

    fn is_binary(&self) -> bool {
        matches!(
            self,
            Param::Value(Value::Binary(_)) | Param::InOut { value: Value::Binary(_), .. }
        )
    }
}

macro_rules! param_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Param {
            fn from(v: $t) -> Self {
                Param::Value(Value::from(v))
            }
        })*
    };
}

param_from!(&str, String, i32, i64, f64, Vec<u8>, &[u8]);

impl From<Value> for Param {
    fn from(v: Value) -> Self {
        Param::Value(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        Param::Value(Value::from(v))
    }
}

/// Build a `Vec<Param>` from heterogeneous values.
#[macro_export]
macro_rules! params {
    () => { ::std::vec::Vec::<$crate::Param>::new() };
    ($($p:expr),+ $(,)?) => { vec![$($crate::Param::from($p)),+] };
}

/// Declared SQL type of every parameter marker of the prepared statement.
pub fn describe_params(api: &dyn NativeApi, hstmt: Handle) -> Result<Vec<SQLSMALLINT>> {
    let mut count: SQLSMALLINT = 0;
    let rc = unsafe { api.num_params(hstmt.as_raw(), &mut count) };
    check_status(api, rc, HandleRef::Stmt(hstmt), "SQLNumParams", &[])?;
    let mut data_types = Vec::with_capacity(count.max(0) as usize);
    for n in 1..=count.max(0) {
        let mut data_type: SQLSMALLINT = 0;
        let mut size: SQLULEN = 0;
        let mut digits: SQLSMALLINT = 0;
        let mut nullable: SQLSMALLINT = 0;
        let rc = unsafe {
            api.describe_param(
                hstmt.as_raw(),
                n as SQLUSMALLINT,
                &mut data_type,
                &mut size,
                &mut digits,
                &mut nullable,
            )
        };
        check_status(api, rc, HandleRef::Stmt(hstmt), "SQLDescribeParam", &[])?;
        data_types.push(data_type);
    }
    Ok(data_types)
}

pub(crate) fn check_count(supplied: usize, expected: usize) -> Result<()> {
    if supplied != expected {
        return Err(Error::interface(
            "PARAMS_MISMATCH",
            format!(
                "The number of supplied parameters ({supplied}) does not match the expected number of parameters ({expected})."
            ),
        ));
    }
    Ok(())
}

fn text_sql_type(data_types: &[SQLSMALLINT], ordinal: usize) -> SQLSMALLINT {
    if data_types.get(ordinal) == Some(&SQL_WLONGVARCHAR) {
        SQL_WLONGVARCHAR
    } else {
        SQL_WVARCHAR
    }
}

// ── Per-row binding ────────────────────────────────────────────────

enum ParamBuffer {
    Null,
    Wide(Vec<SQLWCHAR>),
    Bytes(Vec<u8>),
}

/// Handle to an output value registered at bind time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputResolver {
    ordinal: usize,
}

impl OutputResolver {
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

/// Native buffers of one bound argument row.
///
/// The buffers and indicators are heap allocations that are never resized
/// after binding, so the pointers handed to the driver stay valid for the
/// lifetime of this value.
pub struct RowBinding {
    buffers: Vec<ParamBuffer>,
    indicators: Vec<SQLLEN>,
    outputs: Vec<OutputResolver>,
    executed: bool,
}

impl RowBinding {
    /// Validate `row` against the prepared parameter count, then bind it.
    pub fn bind(
        api: &dyn NativeApi,
        hstmt: Handle,
        row: &[Param],
        data_types: &[SQLSMALLINT],
    ) -> Result<Self> {
        check_count(row.len(), data_types.len())?;
        let mut binding = RowBinding {
            buffers: Vec::with_capacity(row.len()),
            indicators: vec![0; row.len()],
            outputs: Vec::new(),
            executed: false,
        };
        for (ordinal, param) in row.iter().enumerate() {
            binding.bind_one(api, hstmt, ordinal, param, data_types)?;
        }
        Ok(binding)
    }

    fn bind_one(
        &mut self,
        api: &dyn NativeApi,
        hstmt: Handle,
        ordinal: usize,
        param: &Param,
        data_types: &[SQLSMALLINT],
    ) -> Result<()> {
        let text_type = text_sql_type(data_types, ordinal);
        let (io_type, value_type, sql_type, buffer, indicator) = match param {
            Param::Value(Value::Null) => (
                SQL_PARAM_INPUT,
                SQL_C_WCHAR,
                text_type,
                ParamBuffer::Null,
                SQL_NULL_DATA,
            ),
            Param::Value(Value::Binary(bytes)) => (
                SQL_PARAM_INPUT,
                SQL_C_BINARY,
                SQL_LONGVARBINARY,
                ParamBuffer::Bytes(bytes.clone()),
                bytes.len() as SQLLEN,
            ),
            Param::Value(value) => {
                let text = value.to_text().unwrap_or_default();
                (
                    SQL_PARAM_INPUT,
                    SQL_C_WCHAR,
                    text_type,
                    ParamBuffer::Wide(to_wide_nts(&text)),
                    SQL_NTS,
                )
            }
            Param::Out { size } => {
                let capacity = size.unwrap_or(SMALL_BUFFER_SIZE).max(1);
                self.outputs.push(OutputResolver { ordinal });
                (
                    SQL_PARAM_OUTPUT,
                    SQL_C_WCHAR,
                    text_type,
                    ParamBuffer::Wide(vec![0; capacity]),
                    0,
                )
            }
            Param::InOut {
                value: Value::Binary(_),
                ..
            } => {
                return Err(Error::interface(
                    "UNSUPPORTED_PARAMETER",
                    format!("Binary input/output parameters are not supported (parameter {}).", ordinal + 1),
                ))
            }
            Param::InOut { value, size } => {
                let seed: Vec<SQLWCHAR> = value
                    .to_text()
                    .map(|t| t.encode_utf16().collect())
                    .unwrap_or_default();
                let capacity = size.unwrap_or(SMALL_BUFFER_SIZE).max(seed.len() + 1);
                let mut buf = vec![0; capacity];
                buf[..seed.len()].copy_from_slice(&seed);
                self.outputs.push(OutputResolver { ordinal });
                let indicator = if value.is_null() { SQL_NULL_DATA } else { SQL_NTS };
                (
                    SQL_PARAM_INPUT_OUTPUT,
                    SQL_C_WCHAR,
                    text_type,
                    ParamBuffer::Wide(buf),
                    indicator,
                )
            }
        };
        self.buffers.push(buffer);
        self.indicators[ordinal] = indicator;

        let (value_ptr, buffer_length, column_size) = match &mut self.buffers[ordinal] {
            ParamBuffer::Null => (ptr::null_mut(), 0, 1),
            ParamBuffer::Wide(buf) => (
                buf.as_mut_ptr() as SQLPOINTER,
                (buf.len() * mem::size_of::<SQLWCHAR>()) as SQLLEN,
                buf.len(),
            ),
            ParamBuffer::Bytes(buf) => (
                buf.as_mut_ptr() as SQLPOINTER,
                buf.len() as SQLLEN,
                buf.len().max(1),
            ),
        };
        trace!("Binding parameter {}...", ordinal + 1);
        let rc = unsafe {
            api.bind_parameter(
                hstmt.as_raw(),
                (ordinal + 1) as SQLUSMALLINT,
                io_type,
                value_type,
                sql_type,
                column_size as SQLULEN,
                0,
                value_ptr,
                buffer_length,
                self.indicators.as_mut_ptr().add(ordinal),
            )
        };
        check_status(api, rc, HandleRef::Stmt(hstmt), "SQLBindParameter", &[])?;
        Ok(())
    }

    pub fn outputs(&self) -> &[OutputResolver] {
        &self.outputs
    }

    /// Record that the execute these buffers were bound for succeeded.
    pub fn mark_executed(&mut self) {
        self.executed = true;
    }

    /// Read an output value. Only defined after a successful execute.
    pub fn resolve(&self, resolver: OutputResolver) -> Result<Value> {
        if !self.executed {
            return Err(Error::interface(
                "OUTPUT_NOT_READY",
                format!(
                    "Output parameter {} was read before its statement executed successfully.",
                    resolver.ordinal + 1
                ),
            ));
        }
        let indicator = self.indicators[resolver.ordinal];
        if indicator == SQL_NULL_DATA {
            return Ok(Value::Null);
        }
        match &self.buffers[resolver.ordinal] {
            ParamBuffer::Wide(buf) => {
                let units = if indicator >= 0 {
                    (indicator as usize / mem::size_of::<SQLWCHAR>()).min(buf.len())
                } else {
                    buf.len()
                };
                Ok(Value::Text(from_wide_nts(&buf[..units])))
            }
            ParamBuffer::Bytes(buf) => Ok(Value::Binary(buf.clone())),
            ParamBuffer::Null => Ok(Value::Null),
        }
    }
}

/// Result of a procedure call: inputs as supplied, outputs as returned.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutParams {
    values: Vec<Value>,
}

impl OutParams {
    pub(crate) fn new(values: Vec<Value>) -> Self {
        OutParams { values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl Index<usize> for OutParams {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

// ── Columnar binding ───────────────────────────────────────────────

/// Contiguous `rows × stride` element buffer with a parallel indicator array.
pub struct ColumnArena<T> {
    data: Vec<T>,
    indicators: Vec<SQLLEN>,
    stride: usize,
    rows: usize,
}

impl<T: Copy + Default> ColumnArena<T> {
    pub fn new(rows: usize, stride: usize) -> Self {
        let stride = stride.max(1);
        ColumnArena {
            data: vec![T::default(); rows * stride],
            indicators: vec![SQL_NULL_DATA; rows],
            stride,
            rows,
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Element size of one row in bytes.
    pub fn element_bytes(&self) -> usize {
        self.stride * mem::size_of::<T>()
    }

    fn check_row(&self, row: usize) -> Result<()> {
        if row >= self.rows {
            return Err(Error::interface(
                "ARENA_OUT_OF_BOUNDS",
                format!("Row {row} is outside a parameter array of {} rows.", self.rows),
            ));
        }
        Ok(())
    }

    pub fn slot(&self, row: usize) -> Result<&[T]> {
        self.check_row(row)?;
        Ok(&self.data[row * self.stride..(row + 1) * self.stride])
    }

    pub fn slot_mut(&mut self, row: usize) -> Result<&mut [T]> {
        self.check_row(row)?;
        let stride = self.stride;
        Ok(&mut self.data[row * stride..(row + 1) * stride])
    }

    /// Write `values` left-aligned into the slot of `row`.
    pub fn write(&mut self, row: usize, values: &[T], indicator: SQLLEN) -> Result<()> {
        let slot = self.slot_mut(row)?;
        if values.len() > slot.len() {
            return Err(Error::interface(
                "ARENA_OUT_OF_BOUNDS",
                format!(
                    "Value of {} elements does not fit a slot of {}.",
                    values.len(),
                    slot.len()
                ),
            ));
        }
        slot[..values.len()].copy_from_slice(values);
        self.indicators[row] = indicator;
        Ok(())
    }

    pub fn set_null(&mut self, row: usize) -> Result<()> {
        self.check_row(row)?;
        self.indicators[row] = SQL_NULL_DATA;
        Ok(())
    }

    pub fn indicator(&self, row: usize) -> Result<SQLLEN> {
        self.check_row(row)?;
        Ok(self.indicators[row])
    }

    fn data_ptr(&mut self) -> SQLPOINTER {
        self.data.as_mut_ptr() as SQLPOINTER
    }

    fn indicator_ptr(&mut self) -> *mut SQLLEN {
        self.indicators.as_mut_ptr()
    }
}

enum ColumnBuffer {
    Text(ColumnArena<SQLWCHAR>),
    Binary(ColumnArena<u8>),
}

/// Every argument row bound as column-wise arrays.
pub struct ColumnarBinding {
    columns: Vec<ColumnBuffer>,
    rows: usize,
}

impl ColumnarBinding {
    /// Validate all rows, then bind one array per parameter ordinal.
    pub fn bind(
        api: &dyn NativeApi,
        hstmt: Handle,
        rows: &[Vec<Param>],
        data_types: &[SQLSMALLINT],
    ) -> Result<Self> {
        let num_params = data_types.len();
        for (n, row) in rows.iter().enumerate() {
            trace!("ParamSet {}: {:?}", n + 1, row);
            check_count(row.len(), num_params)?;
            if let Some(pos) = row.iter().position(Param::is_output) {
                return Err(Error::interface(
                    "UNSUPPORTED_PARAMETER",
                    format!(
                        "Output parameters are not supported in batch mode (parameter {}).",
                        pos + 1
                    ),
                ));
            }
        }
        let mut binary = vec![false; num_params];
        for (ordinal, is_binary) in binary.iter_mut().enumerate() {
            let mut kinds = rows
                .iter()
                .map(|row| &row[ordinal])
                .filter(|p| !matches!(p, Param::Value(Value::Null)))
                .map(Param::is_binary);
            if let Some(first) = kinds.next() {
                if kinds.any(|k| k != first) {
                    return Err(Error::interface(
                        "MIXED_PARAMETER_TYPES",
                        format!(
                            "Parameter {} mixes binary and non-binary values within one batch.",
                            ordinal + 1
                        ),
                    ));
                }
                *is_binary = first;
            }
        }

        attr::set_param_bind_by_column(api, hstmt)?;
        attr::set_paramset_size(api, hstmt, rows.len())?;

        let mut binding = ColumnarBinding {
            columns: Vec::with_capacity(num_params),
            rows: rows.len(),
        };
        for ordinal in 0..num_params {
            let column = if binary[ordinal] {
                ColumnBuffer::Binary(binary_column(rows, ordinal)?)
            } else {
                ColumnBuffer::Text(text_column(rows, ordinal)?)
            };
            binding.columns.push(column);
            let text_type = text_sql_type(data_types, ordinal);
            let (value_type, sql_type, value_ptr, element_bytes, stride, ind_ptr) =
                match &mut binding.columns[ordinal] {
                    ColumnBuffer::Text(arena) => (
                        SQL_C_WCHAR,
                        text_type,
                        arena.data_ptr(),
                        arena.element_bytes(),
                        arena.stride(),
                        arena.indicator_ptr(),
                    ),
                    ColumnBuffer::Binary(arena) => (
                        SQL_C_BINARY,
                        SQL_LONGVARBINARY,
                        arena.data_ptr(),
                        arena.element_bytes(),
                        arena.stride(),
                        arena.indicator_ptr(),
                    ),
                };
            debug!("Max length for parameter {} is {}.", ordinal + 1, stride);
            trace!("Binding parameter {}...", ordinal + 1);
            let rc = unsafe {
                api.bind_parameter(
                    hstmt.as_raw(),
                    (ordinal + 1) as SQLUSMALLINT,
                    SQL_PARAM_INPUT,
                    value_type,
                    sql_type,
                    stride as SQLULEN,
                    0,
                    value_ptr,
                    element_bytes as SQLLEN,
                    ind_ptr,
                )
            };
            check_status(api, rc, HandleRef::Stmt(hstmt), "SQLBindParameter", &[])?;
        }
        Ok(binding)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

fn text_column(rows: &[Vec<Param>], ordinal: usize) -> Result<ColumnArena<SQLWCHAR>> {
    let encoded: Vec<Option<Vec<SQLWCHAR>>> = rows
        .iter()
        .map(|row| match &row[ordinal] {
            Param::Value(v) => v.to_text().map(|t| t.encode_utf16().collect()),
            _ => None,
        })
        .collect();
    let max_len = encoded.iter().flatten().map(Vec::len).max().unwrap_or(0);
    // One extra unit for the terminator.
    let mut arena = ColumnArena::new(rows.len(), max_len + 1);
    for (row, value) in encoded.iter().enumerate() {
        match value {
            Some(units) => arena.write(row, units, SQL_NTS)?,
            None => arena.set_null(row)?,
        }
    }
    Ok(arena)
}

fn binary_column(rows: &[Vec<Param>], ordinal: usize) -> Result<ColumnArena<u8>> {
    let max_len = rows
        .iter()
        .filter_map(|row| match &row[ordinal] {
            Param::Value(Value::Binary(b)) => Some(b.len()),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    let mut arena = ColumnArena::new(rows.len(), max_len);
    for (row, values) in rows.iter().enumerate() {
        match &values[ordinal] {
            Param::Value(Value::Binary(b)) => arena.write(row, b, b.len() as SQLLEN)?,
            _ => arena.set_null(row)?,
        }
    }
    Ok(arena)
}
