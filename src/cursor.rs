use crate::attr;
use crate::connect::ConnectionInner;
use crate::datatypes::Value;
use crate::diagnostics::check_status;
use crate::error::{Error, Result};
use crate::fetch::{describe_results, ColumnDesc, Row, RowReader};
use crate::handle::{free_handle, Handle, HandleRef};
use crate::native::NativeApi;
use crate::params::{check_count, describe_params, ColumnarBinding, OutParams, Param, RowBinding};
use crate::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Statement handle shared between a cursor and its connection, so that
/// closing the connection can release it.
pub(crate) struct StatementSlot {
    pub(crate) hstmt: Mutex<Option<Handle>>,
}

impl StatementSlot {
    pub(crate) fn new(hstmt: Handle) -> Self {
        StatementSlot {
            hstmt: Mutex::new(Some(hstmt)),
        }
    }
}

fn open_handle(hstmt: &Option<Handle>) -> Result<Handle> {
    hstmt.ok_or_else(|| Error::interface("CURSOR_CLOSED", "The cursor has been closed."))
}

/// Replace line feeds outside of quoted literals and block comments with
/// carriage returns.
pub fn convert_line_feeds(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut in_comment = false;
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' if quote.is_none() && !in_comment => {
                out.push('\r');
                continue;
            }
            '\'' | '"' if !in_comment => match quote {
                Some(q) if q == c => quote = None,
                None => quote = Some(c),
                _ => {}
            },
            '/' if quote.is_none() && !in_comment && chars.peek() == Some(&'*') => {
                in_comment = true;
            }
            '*' if in_comment && chars.peek() == Some(&'/') => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
                in_comment = false;
                continue;
            }
            _ => {}
        }
        out.push(c);
    }
    out
}

/// A statement handle plus the state of its last execution.
pub struct Cursor {
    conn: Arc<ConnectionInner>,
    num: u64,
    slot: Arc<StatementSlot>,
    description: Vec<ColumnDesc>,
    rowcount: i64,
    columns: Arc<HashMap<String, usize>>,
    reader: Option<RowReader>,
    outputs: Option<OutParams>,
    fetch_buffer_size: usize,
    query_timeout: u32,
}

impl Cursor {
    pub(crate) fn new(conn: Arc<ConnectionInner>, num: u64, slot: Arc<StatementSlot>) -> Self {
        Cursor {
            conn,
            num,
            slot,
            description: Vec::new(),
            rowcount: -1,
            columns: Arc::new(HashMap::new()),
            reader: None,
            outputs: None,
            fetch_buffer_size: LARGE_BUFFER_SIZE,
            query_timeout: 0,
        }
    }

    fn api(&self) -> Arc<dyn NativeApi> {
        self.conn.api().clone()
    }

    /// Per-execute query timeout in seconds; 0 disables it.
    pub fn set_query_timeout(&mut self, seconds: u32) {
        self.query_timeout = seconds;
    }

    pub fn query_timeout(&self) -> u32 {
        self.query_timeout
    }

    /// Size in bytes of the working buffer used by later executions.
    pub fn set_fetch_buffer_size(&mut self, bytes: usize) {
        self.fetch_buffer_size = bytes;
    }

    pub fn description(&self) -> &[ColumnDesc] {
        &self.description
    }

    /// Affected or produced row count of the last execution; -1 when unknown.
    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.get(&name.to_lowercase()).copied()
    }

    /// Parameter values of the last per-row execution with outputs resolved.
    pub fn output_values(&self) -> Option<&OutParams> {
        self.outputs.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.slot.hstmt.lock().is_none()
    }

    fn reset(&mut self) {
        self.description.clear();
        self.rowcount = -1;
        self.columns = Arc::new(HashMap::new());
        self.reader = None;
        self.outputs = None;
    }

    /// Close any pending result and drop bound parameters.
    fn free(&mut self, api: &dyn NativeApi, hstmt: Handle) -> Result<()> {
        self.reset();
        let rc = unsafe { api.free_stmt(hstmt.as_raw(), SQL_CLOSE) };
        check_status(api, rc, HandleRef::Stmt(hstmt), "SQLFreeStmt - SQL_CLOSE", &[])?;
        reset_params(api, hstmt)
    }

    fn handle_results(&mut self, api: &dyn NativeApi, hstmt: Handle) -> Result<()> {
        self.reset();
        let info = describe_results(
            api,
            hstmt,
            self.conn.db_type(),
            self.conn.converter(),
            self.fetch_buffer_size,
        )?;
        self.description = info.description;
        self.rowcount = info.rowcount;
        self.columns = info.columns;
        self.reader = info.reader;
        Ok(())
    }

    /// Execute `query` directly, or prepared with one argument row when
    /// `params` is not empty.
    pub fn execute(&mut self, query: &str, params: &[Param]) -> Result<&mut Self> {
        if !params.is_empty() {
            return self.executemany(query, &[params.to_vec()], false);
        }
        let api = self.api();
        let api = &*api;
        let slot = self.slot.clone();
        let guard = slot.hstmt.lock();
        let hstmt = open_handle(&guard)?;
        debug!(
            "Executing query on session {} using SQLExecDirectW: {}",
            self.conn.session_label(),
            query
        );
        self.free(api, hstmt)?;
        attr::set_query_timeout(api, hstmt, self.query_timeout)?;
        let text = to_wide_nts(&convert_line_feeds(query));
        let rc = unsafe { api.exec_direct_w(hstmt.as_raw(), text.as_ptr(), SQL_NTS as SQLINTEGER) };
        check_status(api, rc, HandleRef::Stmt(hstmt), "SQLExecDirectW", &[])?;
        self.handle_results(api, hstmt)?;
        Ok(self)
    }

    /// Prepare `query` once and execute it for every argument row.
    ///
    /// With `batch` all rows are bound column-wise and sent in one execute;
    /// output parameters are then not allowed.
    pub fn executemany(&mut self, query: &str, rows: &[Vec<Param>], batch: bool) -> Result<&mut Self> {
        let api = self.api();
        let api = &*api;
        let slot = self.slot.clone();
        let guard = slot.hstmt.lock();
        let hstmt = open_handle(&guard)?;
        let stmt = HandleRef::Stmt(hstmt);
        self.free(api, hstmt)?;
        let text = to_wide_nts(&convert_line_feeds(query));
        let rc = unsafe { api.prepare_w(hstmt.as_raw(), text.as_ptr(), SQL_NTS as SQLINTEGER) };
        check_status(api, rc, stmt, "SQLPrepareW", &[])?;
        attr::set_query_timeout(api, hstmt, self.query_timeout)?;
        let data_types = describe_params(api, hstmt)?;
        if rows.is_empty() {
            self.rowcount = 0;
            return Ok(self);
        }

        if batch {
            debug!(
                "Executing query on session {} using batched SQLExecute: {}",
                self.conn.session_label(),
                query
            );
            let binding = ColumnarBinding::bind(api, hstmt, rows, &data_types)?;
            debug!("Executing prepared statement for {} parameter sets.", binding.rows());
            let rc = unsafe { api.execute(hstmt.as_raw()) };
            let status = check_status(api, rc, stmt, "SQLExecute", &[]);
            reset_params(api, hstmt)?;
            drop(binding);
            status?;
            self.handle_results(api, hstmt)?;
            return Ok(self);
        }

        debug!(
            "Executing query on session {} using SQLExecute: {}",
            self.conn.session_label(),
            query
        );
        attr::set_paramset_size(api, hstmt, 1)?;
        let mut earlier_rows: i64 = 0;
        let mut outputs = None;
        for (n, row) in rows.iter().enumerate() {
            trace!("ParamSet {}: {:?}", n + 1, row);
            check_count(row.len(), data_types.len())?;
            if n > 0 {
                let rc = unsafe { api.free_stmt(hstmt.as_raw(), SQL_CLOSE) };
                check_status(api, rc, stmt, "SQLFreeStmt - SQL_CLOSE", &[])?;
            }
            let mut binding = RowBinding::bind(api, hstmt, row, &data_types)?;
            debug!("Executing prepared statement.");
            let rc = unsafe { api.execute(hstmt.as_raw()) };
            let status = check_status(api, rc, stmt, "SQLExecute", &[]);
            if status.is_ok() {
                binding.mark_executed();
            }
            let resolved = resolve_outputs(&binding, row);
            reset_params(api, hstmt)?;
            drop(binding);
            status?;
            outputs = Some(resolved?);
            if n + 1 < rows.len() {
                let count = row_count(api, hstmt)?;
                if count > 0 {
                    earlier_rows += count;
                }
            }
        }
        self.handle_results(api, hstmt)?;
        if rows.len() > 1 && self.rowcount >= 0 {
            self.rowcount += earlier_rows;
        }
        self.outputs = outputs;
        Ok(self)
    }

    /// Call a stored procedure with one marker per parameter.
    pub fn callproc(&mut self, procname: &str, params: &[Param]) -> Result<OutParams> {
        let markers = vec!["?"; params.len()].join(", ");
        let query = format!("CALL {procname} ({markers})");
        debug!("Executing Procedure: {}", query);
        self.execute(&query, params)?;
        Ok(self.outputs.clone().unwrap_or_default())
    }

    /// Advance to the next result of a multi-statement execution.
    pub fn nextset(&mut self) -> Result<bool> {
        let api = self.api();
        let api = &*api;
        let slot = self.slot.clone();
        let guard = slot.hstmt.lock();
        let hstmt = open_handle(&guard)?;
        let rc = unsafe { api.more_results(hstmt.as_raw()) };
        check_status(api, rc, HandleRef::Stmt(hstmt), "SQLMoreResults", &[])?;
        if rc == SQL_SUCCESS || rc == SQL_SUCCESS_WITH_INFO {
            self.handle_results(api, hstmt)?;
            return Ok(true);
        }
        self.reader = None;
        Ok(false)
    }

    /// Next row of the current result set, `None` once it is exhausted.
    pub fn fetch_one(&mut self) -> Result<Option<Row>> {
        let api = self.api();
        let slot = self.slot.clone();
        let guard = slot.hstmt.lock();
        let hstmt = open_handle(&guard)?;
        match self.reader.as_mut() {
            Some(reader) => reader.next_row(&*api, hstmt),
            None => Err(Error::interface(
                "NO_RESULT_SET",
                "The last execution did not produce a result set.",
            )),
        }
    }

    pub fn fetch_many(&mut self, size: usize) -> Result<Vec<Row>> {
        self.rows().take(size).collect()
    }

    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        self.rows().collect()
    }

    /// Iterate over the remaining rows of the current result set.
    pub fn rows(&mut self) -> Rows<'_> {
        Rows {
            cursor: self,
            done: false,
        }
    }

    /// Free the statement handle. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.reader = None;
        let hstmt = self.slot.hstmt.lock().take();
        if let Some(hstmt) = hstmt {
            if self.num > 0 {
                debug!(
                    "Closing cursor {} for session {}.",
                    self.num,
                    self.conn.session_label()
                );
            }
            self.conn.remove_cursor(self.num);
            free_handle(&*self.api(), HandleRef::Stmt(hstmt))?;
        }
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close cursor {}: {}", self.num, e);
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("num", &self.num)
            .field("rowcount", &self.rowcount)
            .field("columns", &self.description.len())
            .finish()
    }
}

/// Row iterator over a cursor's current result set. Stops after the first error.
pub struct Rows<'c> {
    cursor: &'c mut Cursor,
    done: bool,
}

impl Iterator for Rows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.cursor.fetch_one().transpose();
        if !matches!(next, Some(Ok(_))) {
            self.done = true;
        }
        next
    }
}

fn reset_params(api: &dyn NativeApi, hstmt: Handle) -> Result<()> {
    let rc = unsafe { api.free_stmt(hstmt.as_raw(), SQL_RESET_PARAMS) };
    check_status(
        api,
        rc,
        HandleRef::Stmt(hstmt),
        "SQLFreeStmt - SQL_RESET_PARAMS",
        &[],
    )?;
    Ok(())
}

fn row_count(api: &dyn NativeApi, hstmt: Handle) -> Result<i64> {
    let mut count: SQLLEN = 0;
    let rc = unsafe { api.row_count(hstmt.as_raw(), &mut count) };
    check_status(api, rc, HandleRef::Stmt(hstmt), "SQLRowCount", &[])?;
    Ok(count as i64)
}

fn resolve_outputs(binding: &RowBinding, row: &[Param]) -> Result<OutParams> {
    let mut values: Vec<Value> = row
        .iter()
        .map(|p| match p {
            Param::Value(v) | Param::InOut { value: v, .. } => v.clone(),
            Param::Out { .. } => Value::Null,
        })
        .collect();
    for &resolver in binding.outputs() {
        values[resolver.ordinal()] = binding.resolve(resolver)?;
    }
    Ok(OutParams::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_feeds_outside_literals_become_carriage_returns() {
        assert_eq!(convert_line_feeds("SELECT 1\nFROM t"), "SELECT 1\rFROM t");
        assert_eq!(
            convert_line_feeds("SELECT 'a\nb'\n, \"x\ny\""),
            "SELECT 'a\nb'\r, \"x\ny\""
        );
        assert_eq!(
            convert_line_feeds("SELECT /* a\nb */ 1\n"),
            "SELECT /* a\nb */ 1\r"
        );
        assert_eq!(convert_line_feeds("'it''s'\n"), "'it''s'\r");
    }
}
