//! Result set metadata and row production.

use crate::datatypes::{TypeCode, TypeConverter, Value};
use crate::diagnostics::check_status;
use crate::error::Result;
use crate::handle::{Handle, HandleRef};
use crate::native::NativeApi;
use crate::types::*;
use std::collections::HashMap;
use std::mem;
use std::ops::Index;
use std::ptr;
use std::slice;
use std::sync::Arc;
use tracing::{debug, trace};

/// Column descriptor
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDesc {
    pub name: String,
    pub type_code: TypeCode,
    /// Native type name as reported by the driver.
    pub type_name: String,
    pub size: usize,
    pub decimal_digits: i16,
    pub nullable: bool,
}

/// One fetched row.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    index: Arc<HashMap<String, usize>>,
}

impl Row {
    pub fn get(&self, col: usize) -> Option<&Value> {
        self.values.get(col)
    }

    /// Look up a value by column name, ignoring case.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.index
            .get(&name.to_lowercase())
            .and_then(|&i| self.values.get(i))
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

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, col: usize) -> &Value {
        &self.values[col]
    }
}

/// Metadata of the statement's current result.
pub(crate) struct ResultInfo {
    pub description: Vec<ColumnDesc>,
    pub rowcount: i64,
    pub columns: Arc<HashMap<String, usize>>,
    pub reader: Option<RowReader>,
}

/// Enumerate column metadata and the row count after an execute.
///
/// A row reader is created only when the result has columns.
pub(crate) fn describe_results(
    api: &dyn NativeApi,
    hstmt: Handle,
    db_type: &str,
    converter: &Arc<dyn TypeConverter>,
    fetch_buffer_size: usize,
) -> Result<ResultInfo> {
    let stmt = HandleRef::Stmt(hstmt);
    let mut column_count: SQLSMALLINT = 0;
    let rc = unsafe { api.num_result_cols(hstmt.as_raw(), &mut column_count) };
    check_status(api, rc, stmt, "SQLNumResultCols", &[])?;
    let mut row_count: SQLLEN = 0;
    let rc = unsafe { api.row_count(hstmt.as_raw(), &mut row_count) };
    check_status(api, rc, stmt, "SQLRowCount", &[])?;

    let mut description = Vec::with_capacity(column_count.max(0) as usize);
    let mut columns = HashMap::new();
    let mut name_buf = vec![0 as SQLWCHAR; SMALL_BUFFER_SIZE];
    for col in 1..=column_count.max(0) {
        let mut name_length: SQLSMALLINT = 0;
        let mut data_type: SQLSMALLINT = 0;
        let mut column_size: SQLULEN = 0;
        let mut decimal_digits: SQLSMALLINT = 0;
        let mut nullable: SQLSMALLINT = 0;
        name_buf.fill(0);
        let rc = unsafe {
            api.describe_col_w(
                hstmt.as_raw(),
                col as SQLUSMALLINT,
                name_buf.as_mut_ptr(),
                name_buf.len() as SQLSMALLINT,
                &mut name_length,
                &mut data_type,
                &mut column_size,
                &mut decimal_digits,
                &mut nullable,
            )
        };
        check_status(api, rc, stmt, "SQLDescribeColW", &[])?;
        let name = from_wide_nts(&name_buf);

        name_buf.fill(0);
        let mut attr_length: SQLSMALLINT = 0;
        let rc = unsafe {
            api.col_attribute_w(
                hstmt.as_raw(),
                col as SQLUSMALLINT,
                SQL_DESC_TYPE_NAME,
                name_buf.as_mut_ptr() as SQLPOINTER,
                (name_buf.len() * mem::size_of::<SQLWCHAR>()) as SQLSMALLINT,
                &mut attr_length,
                ptr::null_mut(),
            )
        };
        check_status(api, rc, stmt, "SQLColAttributeW", &[])?;
        let type_name = from_wide_nts(&name_buf);
        let type_code = converter.convert_type(db_type, &type_name);

        columns.insert(name.to_lowercase(), (col - 1) as usize);
        description.push(ColumnDesc {
            name,
            type_code,
            type_name,
            size: column_size,
            decimal_digits,
            nullable: nullable != SQL_NO_NULLS,
        });
    }
    let columns = Arc::new(columns);
    let reader = if description.is_empty() {
        None
    } else {
        Some(RowReader::new(
            description.clone(),
            columns.clone(),
            db_type.to_string(),
            converter.clone(),
            fetch_buffer_size,
        ))
    };
    Ok(ResultInfo {
        description,
        rowcount: row_count as i64,
        columns,
        reader,
    })
}

/// Forward-only reader over the rows of one result set.
pub(crate) struct RowReader {
    buffer: Vec<SQLWCHAR>,
    description: Vec<ColumnDesc>,
    index: Arc<HashMap<String, usize>>,
    db_type: String,
    converter: Arc<dyn TypeConverter>,
    finished: bool,
}

impl RowReader {
    fn new(
        description: Vec<ColumnDesc>,
        index: Arc<HashMap<String, usize>>,
        db_type: String,
        converter: Arc<dyn TypeConverter>,
        buffer_bytes: usize,
    ) -> Self {
        // At least one character plus its terminator.
        let units = (buffer_bytes / mem::size_of::<SQLWCHAR>()).max(2);
        RowReader {
            buffer: vec![0; units],
            description,
            index,
            db_type,
            converter,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn byte_len(&self) -> usize {
        self.buffer.len() * mem::size_of::<SQLWCHAR>()
    }

    fn bytes(&self, len: usize) -> &[u8] {
        let len = len.min(self.byte_len());
        unsafe { slice::from_raw_parts(self.buffer.as_ptr() as *const u8, len) }
    }

    /// Fetch the next row, or `None` once the result set is exhausted.
    pub fn next_row(&mut self, api: &dyn NativeApi, hstmt: Handle) -> Result<Option<Row>> {
        if self.finished {
            return Ok(None);
        }
        let rc = unsafe { api.fetch(hstmt.as_raw()) };
        if let Err(e) = check_status(api, rc, HandleRef::Stmt(hstmt), "SQLFetch", &[]) {
            self.finished = true;
            return Err(e);
        }
        if rc == SQL_NO_DATA {
            self.finished = true;
            return Ok(None);
        }
        let mut values = Vec::with_capacity(self.description.len());
        for col in 0..self.description.len() {
            let raw = if self.description[col].type_code == TypeCode::Binary {
                self.read_binary(api, hstmt, col + 1)?
            } else {
                self.read_text(api, hstmt, col + 1)?
            };
            let desc = &self.description[col];
            values.push(self.converter.convert_value(
                &self.db_type,
                &desc.type_name,
                desc.type_code,
                raw,
            )?);
        }
        trace!("Fetched row: {:?}", values);
        Ok(Some(Row {
            values,
            index: self.index.clone(),
        }))
    }

    fn get_data(
        &mut self,
        api: &dyn NativeApi,
        hstmt: Handle,
        col: usize,
        target_type: SQLSMALLINT,
        method: &str,
    ) -> Result<(SQLLEN, bool)> {
        let mut indicator: SQLLEN = 0;
        let byte_len = self.byte_len() as SQLLEN;
        let rc = unsafe {
            api.get_data(
                hstmt.as_raw(),
                col as SQLUSMALLINT,
                target_type,
                self.buffer.as_mut_ptr() as SQLPOINTER,
                byte_len,
                &mut indicator,
            )
        };
        let states = check_status(api, rc, HandleRef::Stmt(hstmt), method, &[])?;
        let truncated = states.iter().any(|s| s == SQL_STATE_DATA_TRUNCATED);
        Ok((indicator, truncated))
    }

    fn read_binary(&mut self, api: &dyn NativeApi, hstmt: Handle, col: usize) -> Result<Value> {
        let (indicator, truncated) = self.get_data(api, hstmt, col, SQL_C_BINARY, "SQLGetData")?;
        if indicator == SQL_NULL_DATA {
            return Ok(Value::Null);
        }
        let byte_len = self.byte_len();
        if !truncated {
            let len = if indicator >= 0 { indicator as usize } else { byte_len };
            return Ok(Value::Binary(self.bytes(len).to_vec()));
        }
        debug!(
            "Data truncated. Calling SQLGetData to get next part of data for column {} of size {}.",
            col, indicator
        );
        if indicator == SQL_NO_TOTAL {
            let mut value = self.bytes(byte_len).to_vec();
            loop {
                let (indicator, truncated) =
                    self.get_data(api, hstmt, col, SQL_C_BINARY, "SQLGetData2")?;
                let len = if truncated || indicator < 0 {
                    byte_len
                } else {
                    (indicator as usize).min(byte_len)
                };
                value.extend_from_slice(self.bytes(len));
                if !truncated {
                    break;
                }
            }
            return Ok(Value::Binary(value));
        }
        let total = indicator as usize;
        let mut value = vec![0u8; total.max(byte_len)];
        value[..byte_len].copy_from_slice(self.bytes(byte_len));
        if total > byte_len {
            let tail = &mut value[byte_len..];
            let mut tail_indicator: SQLLEN = 0;
            let rc = unsafe {
                api.get_data(
                    hstmt.as_raw(),
                    col as SQLUSMALLINT,
                    SQL_C_BINARY,
                    tail.as_mut_ptr() as SQLPOINTER,
                    tail.len() as SQLLEN,
                    &mut tail_indicator,
                )
            };
            check_status(api, rc, HandleRef::Stmt(hstmt), "SQLGetData2", &[])?;
        }
        value.truncate(total);
        Ok(Value::Binary(value))
    }

    fn read_text(&mut self, api: &dyn NativeApi, hstmt: Handle, col: usize) -> Result<Value> {
        let capacity = self.buffer.len() - 1;
        let mut units: Vec<SQLWCHAR> = Vec::new();
        let mut method = "SQLGetData";
        loop {
            self.buffer[0] = 0;
            let (indicator, truncated) = self.get_data(api, hstmt, col, SQL_C_WCHAR, method)?;
            if indicator == SQL_NULL_DATA {
                return Ok(Value::Null);
            }
            // A truncated chunk fills the whole buffer; embedded U+0000 is data.
            let len = if indicator >= 0 {
                (indicator as usize / mem::size_of::<SQLWCHAR>()).min(capacity)
            } else if truncated && indicator == SQL_NO_TOTAL {
                capacity
            } else {
                self.buffer[..capacity]
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(capacity)
            };
            units.extend_from_slice(&self.buffer[..len]);
            if !truncated {
                break;
            }
            if method == "SQLGetData" {
                debug!(
                    "Data truncated. Calling SQLGetData to get next part of data for column {} of size {}.",
                    col, indicator
                );
            }
            method = "SQLGetData2";
        }
        Ok(Value::Text(String::from_utf16_lossy(&units)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::DefaultConverter;
    use crate::mock::MemoryDriver;

    fn run(driver: &MemoryDriver, sql: &str, buffer_bytes: usize) -> (Handle, ResultInfo) {
        let hstmt = Handle::from_raw(driver.alloc_raw_statement());
        let text = to_wide_nts(sql);
        let rc = unsafe { driver.exec_direct_w(hstmt.as_raw(), text.as_ptr(), SQL_NTS as SQLINTEGER) };
        assert_eq!(rc, SQL_SUCCESS);
        let converter: Arc<dyn TypeConverter> = Arc::new(DefaultConverter);
        let info = describe_results(driver, hstmt, "Memory", &converter, buffer_bytes).unwrap();
        (hstmt, info)
    }

    #[test]
    fn describes_columns_and_builds_name_index() {
        let driver = MemoryDriver::new();
        driver.execute_sql("CREATE TABLE t (Id INTEGER NOT NULL, Name VARCHAR(20), Data VARBYTE(8))");
        let (_, info) = run(&driver, "SELECT * FROM t", LARGE_BUFFER_SIZE);
        assert_eq!(info.description.len(), 3);
        assert_eq!(info.description[0].name, "Id");
        assert_eq!(info.description[0].type_code, TypeCode::Number);
        assert!(!info.description[0].nullable);
        assert_eq!(info.description[1].type_name, "VARCHAR");
        assert_eq!(info.description[1].size, 20);
        assert_eq!(info.description[2].type_code, TypeCode::Binary);
        assert_eq!(info.columns.get("name"), Some(&1));
        assert!(info.reader.is_some());
    }

    #[test]
    fn statement_without_columns_has_no_reader() {
        let driver = MemoryDriver::new();
        let (_, info) = run(&driver, "CREATE TABLE t (a INTEGER)", LARGE_BUFFER_SIZE);
        assert!(info.description.is_empty());
        assert!(info.reader.is_none());
    }

    #[test]
    fn truncated_text_is_reassembled() {
        let driver = MemoryDriver::new();
        driver.execute_sql("CREATE TABLE t (a LONG VARCHAR)");
        let long: String = "0123456789".repeat(1000);
        driver.insert_row("t", vec![Value::Text(long.clone())]);
        let (hstmt, mut info) = run(&driver, "SELECT * FROM t", SMALL_BUFFER_SIZE);
        let reader = info.reader.as_mut().unwrap();
        let row = reader.next_row(&driver, hstmt).unwrap().unwrap();
        assert_eq!(row[0], Value::Text(long));
        assert!(reader.next_row(&driver, hstmt).unwrap().is_none());
        assert!(reader.is_finished());
        assert!(driver.calls_named("SQLGetData") > 2);
    }

    #[test]
    fn surrogate_pairs_survive_chunk_boundaries() {
        let driver = MemoryDriver::new();
        driver.execute_sql("CREATE TABLE t (a LONG VARCHAR)");
        let text: String = "ab\u{1F600}".repeat(50);
        driver.insert_row("t", vec![Value::Text(text.clone())]);
        // Three units of space per call splits most surrogate pairs.
        let (hstmt, mut info) = run(&driver, "SELECT * FROM t", 8);
        let row = info.reader.as_mut().unwrap().next_row(&driver, hstmt).unwrap().unwrap();
        assert_eq!(row[0], Value::Text(text));
    }

    #[test]
    fn truncated_binary_uses_one_continuation_call() {
        let driver = MemoryDriver::new();
        driver.execute_sql("CREATE TABLE t (a VARBYTE(64000))");
        let bytes: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        driver.insert_row("t", vec![Value::Binary(bytes.clone())]);
        let (hstmt, mut info) = run(&driver, "SELECT * FROM t", SMALL_BUFFER_SIZE);
        let row = info.reader.as_mut().unwrap().next_row(&driver, hstmt).unwrap().unwrap();
        assert_eq!(row[0], Value::Binary(bytes));
        assert_eq!(driver.calls_named("SQLGetData"), 2);
    }

    #[test]
    fn binary_without_total_is_read_in_chunks() {
        let driver = MemoryDriver::new();
        driver.set_report_no_total(true);
        driver.execute_sql("CREATE TABLE t (a VARBYTE(64000))");
        let bytes: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
        driver.insert_row("t", vec![Value::Binary(bytes.clone())]);
        let (hstmt, mut info) = run(&driver, "SELECT * FROM t", SMALL_BUFFER_SIZE);
        let row = info.reader.as_mut().unwrap().next_row(&driver, hstmt).unwrap().unwrap();
        assert_eq!(row[0], Value::Binary(bytes));
        assert_eq!(driver.calls_named("SQLGetData"), 3);
    }

    #[test]
    fn nulls_and_empties_are_distinct() {
        let driver = MemoryDriver::new();
        driver.execute_sql("CREATE TABLE t (a VARCHAR(10), b VARBYTE(10))");
        driver.insert_row("t", vec![Value::Null, Value::Null]);
        driver.insert_row("t", vec![Value::Text(String::new()), Value::Binary(Vec::new())]);
        let (hstmt, mut info) = run(&driver, "SELECT * FROM t", LARGE_BUFFER_SIZE);
        let reader = info.reader.as_mut().unwrap();
        let first = reader.next_row(&driver, hstmt).unwrap().unwrap();
        assert_eq!(first.values(), &[Value::Null, Value::Null]);
        let second = reader.next_row(&driver, hstmt).unwrap().unwrap();
        assert_eq!(
            second.values(),
            &[Value::Text(String::new()), Value::Binary(Vec::new())]
        );
        assert_eq!(second.get_by_name("A"), Some(&Value::Text(String::new())));
    }
}
