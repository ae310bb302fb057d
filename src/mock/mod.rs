//! In-memory ODBC driver.
//!
//! Implements [`NativeApi`] over a small table store so the whole stack
//! (binding, execution, diagnostics, truncated reads, transactions) can be
//! exercised without a driver manager. Handles are integer ids; freed or
//! unknown ids report `SQL_INVALID_HANDLE`. Every call is recorded by name
//! for assertions.

mod engine;

pub use engine::{MockColumn, MockError};

use crate::datatypes::Value;
use crate::diagnostics::DiagRecord;
use crate::native::NativeApi;
use crate::types::*;
use engine::{literal_column, marker_count, parse, Command, Database, Expr, ResultSet};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ptr;
use std::slice;

/// Stored procedure body: receives every argument (outputs as `Null`) and
/// returns the value of every argument after the call.
pub type Procedure = Box<dyn Fn(&[Value]) -> Result<Vec<Value>, MockError> + Send + Sync>;

/// Session numbers start here.
const FIRST_SESSION: u64 = 1000;

struct EnvState;

struct DbcState {
    env: usize,
    connected: bool,
    autocommit: bool,
    in_txn: bool,
    snapshot: Option<Database>,
    session: u64,
}

struct BoundParam {
    io_type: SQLSMALLINT,
    value_type: SQLSMALLINT,
    value: SQLPOINTER,
    buffer_length: SQLLEN,
    indicator: *mut SQLLEN,
}

// Bound pointers are only dereferenced inside execute calls, while the
// caller keeps the buffers alive.
unsafe impl Send for BoundParam {}

struct ActiveResult {
    set: ResultSet,
    row: Option<usize>,
    offsets: Vec<Option<usize>>,
}

impl ActiveResult {
    fn new(set: ResultSet) -> Self {
        let width = set.columns.len();
        ActiveResult {
            set,
            row: None,
            offsets: vec![None; width],
        }
    }
}

#[derive(Default)]
struct StmtState {
    dbc: Option<usize>,
    attrs: HashMap<SQLINTEGER, SQLULEN>,
    prepared: Option<Vec<Command>>,
    bound: BTreeMap<SQLUSMALLINT, BoundParam>,
    current: Option<ActiveResult>,
    pending: VecDeque<ResultSet>,
}

enum Object {
    Env(EnvState),
    Dbc(DbcState),
    Stmt(StmtState),
}

impl Object {
    fn handle_type(&self) -> SQLSMALLINT {
        match self {
            Object::Env(_) => SQL_HANDLE_ENV,
            Object::Dbc(_) => SQL_HANDLE_DBC,
            Object::Stmt(_) => SQL_HANDLE_STMT,
        }
    }
}

struct Failure {
    function: &'static str,
    error: MockError,
}

struct State {
    next_id: usize,
    objects: HashMap<usize, Object>,
    diags: HashMap<usize, Vec<DiagRecord>>,
    calls: Vec<&'static str>,
    db: Database,
    procedures: HashMap<String, Procedure>,
    failures: Vec<Failure>,
    report_no_total: bool,
    next_session: u64,
    odbc_version: Option<SQLINTEGER>,
    connection_strings: Vec<String>,
    query_bands: Vec<String>,
    completions: Vec<SQLSMALLINT>,
}

/// Outcome of running a request: result sets plus values for output markers.
struct RunOutcome {
    results: Vec<ResultSet>,
    outputs: Vec<(usize, Value)>,
}

fn id_of(handle: SQLHANDLE) -> usize {
    handle as usize
}

fn decode_wide(text: *const SQLWCHAR, len: SQLINTEGER) -> String {
    if text.is_null() {
        return String::new();
    }
    let count = if len < 0 {
        let mut n = 0;
        unsafe {
            while *text.add(n) != 0 {
                n += 1;
            }
        }
        n
    } else {
        len as usize
    };
    let units = unsafe { slice::from_raw_parts(text, count) };
    String::from_utf16_lossy(units)
}

/// Copy `units` into a character buffer of `capacity` with a terminator;
/// returns the number of units copied.
unsafe fn write_wide(dest: *mut SQLWCHAR, capacity: usize, units: &[SQLWCHAR]) -> usize {
    if dest.is_null() || capacity == 0 {
        return 0;
    }
    let copy = units.len().min(capacity - 1);
    ptr::copy_nonoverlapping(units.as_ptr(), dest, copy);
    *dest.add(copy) = 0;
    copy
}

unsafe fn read_bound(param: &BoundParam, row: usize) -> Value {
    if param.io_type == SQL_PARAM_OUTPUT || param.value.is_null() {
        return Value::Null;
    }
    let indicator = if param.indicator.is_null() {
        SQL_NTS
    } else {
        *param.indicator.add(row)
    };
    if indicator == SQL_NULL_DATA {
        return Value::Null;
    }
    let element = param.buffer_length.max(0) as usize;
    let base = (param.value as *const u8).add(row * element);
    if param.value_type == SQL_C_BINARY {
        let len = if indicator >= 0 { indicator as usize } else { element };
        return Value::Binary(slice::from_raw_parts(base, len).to_vec());
    }
    let units = base as *const SQLWCHAR;
    let capacity = element / 2;
    let len = if indicator >= 0 {
        (indicator as usize / 2).min(capacity)
    } else {
        let mut n = 0;
        while n < capacity && *units.add(n) != 0 {
            n += 1;
        }
        n
    };
    Value::Text(String::from_utf16_lossy(slice::from_raw_parts(units, len)))
}

/// Store an output value; true when it had to be truncated.
unsafe fn write_output(param: &BoundParam, value: &Value) -> bool {
    let indicator = param.indicator;
    if value.is_null() {
        if !indicator.is_null() {
            *indicator = SQL_NULL_DATA;
        }
        return false;
    }
    let text: Vec<SQLWCHAR> = value.to_string().encode_utf16().collect();
    let capacity = param.buffer_length.max(0) as usize / 2;
    let copied = write_wide(param.value as *mut SQLWCHAR, capacity, &text);
    if !indicator.is_null() {
        *indicator = (text.len() * 2) as SQLLEN;
    }
    copied < text.len()
}

fn value_units(value: &Value) -> Vec<SQLWCHAR> {
    value.to_string().encode_utf16().collect()
}

fn value_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Binary(b) => b.clone(),
        other => other.to_string().into_bytes(),
    }
}

impl State {
    fn new() -> Self {
        State {
            next_id: 1,
            objects: HashMap::new(),
            diags: HashMap::new(),
            calls: Vec::new(),
            db: Database::default(),
            procedures: HashMap::new(),
            failures: Vec::new(),
            report_no_total: false,
            next_session: FIRST_SESSION,
            odbc_version: None,
            connection_strings: Vec::new(),
            query_bands: Vec::new(),
            completions: Vec::new(),
        }
    }

    /// Record the call and reset the diagnostic area of `handle`.
    fn enter(&mut self, function: &'static str, handle: SQLHANDLE) {
        self.calls.push(function);
        self.diags.remove(&id_of(handle));
    }

    fn insert(&mut self, object: Object) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(id, object);
        id
    }

    fn is(&self, id: usize, handle_type: SQLSMALLINT) -> bool {
        self.objects
            .get(&id)
            .is_some_and(|o| o.handle_type() == handle_type)
    }

    fn post(&mut self, id: usize, error: MockError) -> SQLRETURN {
        self.diags.entry(id).or_default().push(DiagRecord {
            state: error.state,
            native_error: error.native,
            message: error.message,
        });
        SQL_ERROR
    }

    fn warn(&mut self, id: usize, state: &str, message: &str) {
        self.diags.entry(id).or_default().push(DiagRecord {
            state: state.to_string(),
            native_error: 0,
            message: message.to_string(),
        });
    }

    fn injected(&mut self, function: &'static str, id: usize) -> Option<SQLRETURN> {
        let pos = self.failures.iter().position(|f| f.function == function)?;
        let failure = self.failures.remove(pos);
        Some(self.post(id, failure.error))
    }

    fn dbc(&mut self, id: usize) -> Option<&mut DbcState> {
        match self.objects.get_mut(&id) {
            Some(Object::Dbc(dbc)) => Some(dbc),
            _ => None,
        }
    }

    fn stmt(&mut self, id: usize) -> Option<&mut StmtState> {
        match self.objects.get_mut(&id) {
            Some(Object::Stmt(stmt)) => Some(stmt),
            _ => None,
        }
    }

    /// Run parsed commands for every parameter set.
    fn run(
        &mut self,
        dbc: Option<usize>,
        commands: &[Command],
        sets: &[Vec<Value>],
    ) -> Result<RunOutcome, MockError> {
        let first: &[Value] = sets.first().map(Vec::as_slice).unwrap_or(&[]);
        let resolve = |exprs: &[Expr], set: &[Value]| -> Vec<Value> {
            exprs
                .iter()
                .map(|e| match e {
                    Expr::Marker(m) => set.get(*m).cloned().unwrap_or(Value::Null),
                    Expr::Literal(v) => v.clone(),
                })
                .collect()
        };

        let (session, transactional) = match dbc.and_then(|id| self.dbc(id)) {
            Some(dbc) => (dbc.session, !dbc.autocommit),
            None => (0, false),
        };
        if transactional {
            let snapshot = self.db.clone();
            if let Some(dbc) = dbc.and_then(|id| self.dbc(id)) {
                dbc.in_txn = true;
                dbc.snapshot.get_or_insert(snapshot);
            }
        }

        let mut outcome = RunOutcome {
            results: Vec::new(),
            outputs: Vec::new(),
        };
        let count = |n: i64| ResultSet {
            row_count: n,
            ..ResultSet::default()
        };
        for command in commands {
            let result = match command {
                Command::SelectSession => ResultSet {
                    columns: vec![MockColumn {
                        name: "Session".into(),
                        sql_type: SQL_INTEGER,
                        type_name: "INTEGER".into(),
                        size: 10,
                        nullable: false,
                    }],
                    rows: vec![vec![Value::Integer(session as i64)]],
                    row_count: 1,
                },
                Command::SetQueryBand(band) => {
                    self.query_bands.push(band.clone());
                    count(0)
                }
                Command::CreateTable { name, columns } => {
                    self.db.create(name, columns.clone())?;
                    count(0)
                }
                Command::DropTable { name } => {
                    self.db.drop_table(name)?;
                    count(0)
                }
                Command::Insert { table, values } => {
                    let sets: Vec<&[Value]> = if sets.is_empty() {
                        vec![&[][..]]
                    } else {
                        sets.iter().map(Vec::as_slice).collect()
                    };
                    for set in &sets {
                        self.db.insert(table, resolve(values, set))?;
                    }
                    count(sets.len() as i64)
                }
                Command::Delete { table } => count(self.db.delete_all(table)?),
                Command::SelectAll { table } => self.db.select_all(table)?,
                Command::SelectLiterals(exprs) => {
                    let row = resolve(exprs, first);
                    ResultSet {
                        columns: row
                            .iter()
                            .enumerate()
                            .map(|(i, v)| literal_column(i, v))
                            .collect(),
                        rows: vec![row],
                        row_count: 1,
                    }
                }
                Command::Call { name, args } => {
                    let procedure = self.procedures.get(&name.to_ascii_lowercase()).ok_or_else(|| {
                        MockError::new("42000", 5495, format!("Stored Procedure '{name}' does not exist."))
                    })?;
                    let inputs = resolve(args, first);
                    let returned = procedure(&inputs)?;
                    for (arg, value) in args.iter().zip(returned) {
                        if let Expr::Marker(m) = arg {
                            outcome.outputs.push((*m, value));
                        }
                    }
                    count(-1)
                }
            };
            outcome.results.push(result);
        }
        Ok(outcome)
    }

    /// Execute `commands` on statement `id` with its bound parameters.
    fn execute_on(&mut self, id: usize, commands: Vec<Command>) -> SQLRETURN {
        let markers = marker_count(&commands);
        let Some(stmt) = self.stmt(id) else {
            return SQL_INVALID_HANDLE;
        };
        stmt.current = None;
        stmt.pending.clear();
        let dbc = stmt.dbc;
        let rows = stmt
            .attrs
            .get(&SQL_ATTR_PARAMSET_SIZE)
            .copied()
            .unwrap_or(1)
            .max(1);
        if (1..=markers).any(|n| !stmt.bound.contains_key(&(n as SQLUSMALLINT))) {
            return self.post(id, MockError::new("07002", 0, "COUNT field incorrect"));
        }
        let sets: Vec<Vec<Value>> = if markers == 0 {
            Vec::new()
        } else {
            (0..rows)
                .map(|row| {
                    stmt.bound
                        .values()
                        .take(markers)
                        .map(|p| unsafe { read_bound(p, row) })
                        .collect()
                })
                .collect()
        };

        let outcome = match self.run(dbc, &commands, &sets) {
            Ok(outcome) => outcome,
            Err(e) => return self.post(id, e),
        };
        let mut truncated = false;
        let Some(stmt) = self.stmt(id) else {
            return SQL_INVALID_HANDLE;
        };
        for (marker, value) in &outcome.outputs {
            if let Some(param) = stmt.bound.get(&((marker + 1) as SQLUSMALLINT)) {
                if param.io_type != SQL_PARAM_INPUT {
                    truncated |= unsafe { write_output(param, value) };
                }
            }
        }
        let mut results = outcome.results.into_iter();
        stmt.current = results.next().map(ActiveResult::new);
        stmt.pending = results.collect();
        if truncated {
            self.warn(id, SQL_STATE_DATA_TRUNCATED, "String data, right truncated");
            return SQL_SUCCESS_WITH_INFO;
        }
        SQL_SUCCESS
    }
}

/// In-memory ODBC driver. Procedures registered on it run while the driver
/// is locked and must not call back into it.
pub struct MemoryDriver {
    state: Mutex<State>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver {
            state: Mutex::new(State::new()),
        }
    }

    /// A statement handle not attached to any connection (autocommit).
    pub fn alloc_raw_statement(&self) -> SQLHANDLE {
        let id = self.state.lock().insert(Object::Stmt(StmtState::default()));
        id as SQLHANDLE
    }

    pub fn push_diagnostic(&self, handle: SQLHANDLE, state: &str, native: i32, message: &str) {
        self.state
            .lock()
            .diags
            .entry(id_of(handle))
            .or_default()
            .push(DiagRecord {
                state: state.to_string(),
                native_error: native,
                message: message.to_string(),
            });
    }

    /// Make the next call of `function` fail with the given diagnostic.
    /// A failed `SQLDisconnect` still leaves the connection closed.
    pub fn fail_next(&self, function: &'static str, state: &str, native: i32, message: &str) {
        self.state.lock().failures.push(Failure {
            function,
            error: MockError::new(state, native, message),
        });
    }

    pub fn register_procedure<F>(&self, name: &str, body: F)
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, MockError> + Send + Sync + 'static,
    {
        self.state
            .lock()
            .procedures
            .insert(name.to_ascii_lowercase(), Box::new(body));
    }

    /// Report `SQL_NO_TOTAL` instead of the remaining length for truncated binary reads.
    pub fn set_report_no_total(&self, enabled: bool) {
        self.state.lock().report_no_total = enabled;
    }

    /// Run SQL directly against the store. Panics on failure.
    pub fn execute_sql(&self, sql: &str) {
        let mut state = self.state.lock();
        let result = parse(sql).and_then(|commands| state.run(None, &commands, &[]));
        if let Err(e) = result {
            panic!("execute_sql({sql:?}) failed: [{}] {}", e.state, e.message);
        }
    }

    /// Append a row directly. Panics on failure.
    pub fn insert_row(&self, table: &str, row: Vec<Value>) {
        if let Err(e) = self.state.lock().db.insert(table, row) {
            panic!("insert_row({table:?}) failed: [{}] {}", e.state, e.message);
        }
    }

    /// Committed and uncommitted rows of `table`.
    pub fn table_rows(&self, table: &str) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .db
            .table(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn calls_named(&self, function: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| **c == function)
            .count()
    }

    pub fn odbc_version(&self) -> Option<SQLINTEGER> {
        self.state.lock().odbc_version
    }

    pub fn live_handles(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn stmt_attr(&self, hstmt: SQLHANDLE, attribute: SQLINTEGER) -> Option<SQLULEN> {
        self.state
            .lock()
            .stmt(id_of(hstmt))
            .and_then(|s| s.attrs.get(&attribute).copied())
    }

    pub fn connection_strings(&self) -> Vec<String> {
        self.state.lock().connection_strings.clone()
    }

    pub fn query_bands(&self) -> Vec<String> {
        self.state.lock().query_bands.clone()
    }

    pub fn commits(&self) -> usize {
        self.count_completions(SQL_COMMIT)
    }

    pub fn rollbacks(&self) -> usize {
        self.count_completions(SQL_ROLLBACK)
    }

    fn count_completions(&self, completion: SQLSMALLINT) -> usize {
        self.state
            .lock()
            .completions
            .iter()
            .filter(|c| **c == completion)
            .count()
    }
}

#[allow(clippy::too_many_arguments)]
impl NativeApi for MemoryDriver {
    unsafe fn alloc_handle(
        &self,
        handle_type: SQLSMALLINT,
        input_handle: SQLHANDLE,
        output_handle: *mut SQLHANDLE,
    ) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLAllocHandle", input_handle);
        let parent = id_of(input_handle);
        let object = match handle_type {
            SQL_HANDLE_ENV => Object::Env(EnvState),
            SQL_HANDLE_DBC => {
                if !st.is(parent, SQL_HANDLE_ENV) {
                    return SQL_INVALID_HANDLE;
                }
                if let Some(rc) = st.injected("SQLAllocHandle", parent) {
                    return rc;
                }
                Object::Dbc(DbcState {
                    env: parent,
                    connected: false,
                    autocommit: true,
                    in_txn: false,
                    snapshot: None,
                    session: 0,
                })
            }
            SQL_HANDLE_STMT => {
                let connected = match st.dbc(parent) {
                    Some(dbc) => dbc.connected,
                    None => return SQL_INVALID_HANDLE,
                };
                if !connected {
                    return st.post(parent, MockError::new("08003", 0, "Connection not open"));
                }
                if let Some(rc) = st.injected("SQLAllocHandle", parent) {
                    return rc;
                }
                Object::Stmt(StmtState {
                    dbc: Some(parent),
                    ..StmtState::default()
                })
            }
            _ => return st.post(parent, MockError::new("HY092", 0, "Invalid handle type")),
        };
        let id = st.insert(object);
        if !output_handle.is_null() {
            *output_handle = id as SQLHANDLE;
        }
        SQL_SUCCESS
    }

    unsafe fn free_handle(&self, handle_type: SQLSMALLINT, handle: SQLHANDLE) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLFreeHandle", handle);
        let id = id_of(handle);
        if !st.is(id, handle_type) {
            return SQL_INVALID_HANDLE;
        }
        match handle_type {
            SQL_HANDLE_ENV => {
                let busy = st
                    .objects
                    .values()
                    .any(|o| matches!(o, Object::Dbc(dbc) if dbc.env == id));
                if busy {
                    return st.post(id, MockError::new("HY010", 0, "Function sequence error"));
                }
            }
            SQL_HANDLE_DBC => {
                if st.dbc(id).is_some_and(|dbc| dbc.connected) {
                    return st.post(id, MockError::new("HY010", 0, "Function sequence error"));
                }
                let children: Vec<usize> = st
                    .objects
                    .iter()
                    .filter(|(_, o)| matches!(o, Object::Stmt(s) if s.dbc == Some(id)))
                    .map(|(child, _)| *child)
                    .collect();
                for child in children {
                    st.objects.remove(&child);
                    st.diags.remove(&child);
                }
            }
            _ => {}
        }
        st.objects.remove(&id);
        st.diags.remove(&id);
        SQL_SUCCESS
    }

    unsafe fn set_env_attr(
        &self,
        henv: SQLHANDLE,
        attribute: SQLINTEGER,
        value: SQLPOINTER,
        _string_length: SQLINTEGER,
    ) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLSetEnvAttr", henv);
        if !st.is(id_of(henv), SQL_HANDLE_ENV) {
            return SQL_INVALID_HANDLE;
        }
        if attribute == SQL_ATTR_ODBC_VERSION {
            st.odbc_version = Some(value as usize as SQLINTEGER);
        }
        SQL_SUCCESS
    }

    unsafe fn driver_connect_w(
        &self,
        hdbc: SQLHANDLE,
        _hwnd: SQLHWND,
        conn_str_in: *const SQLWCHAR,
        conn_str_in_len: SQLSMALLINT,
        _conn_str_out: *mut SQLWCHAR,
        _conn_str_out_max: SQLSMALLINT,
        conn_str_out_len: *mut SQLSMALLINT,
        _driver_completion: SQLUSMALLINT,
    ) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLDriverConnectW", hdbc);
        let id = id_of(hdbc);
        let connected = match st.dbc(id) {
            Some(dbc) => dbc.connected,
            None => return SQL_INVALID_HANDLE,
        };
        if let Some(rc) = st.injected("SQLDriverConnectW", id) {
            return rc;
        }
        if connected {
            return st.post(id, MockError::new("08002", 0, "Connection name in use"));
        }
        let conn_str = decode_wide(conn_str_in, conn_str_in_len as SQLINTEGER);
        let has_driver = conn_str.split(';').any(|part| {
            part.split_once('=')
                .is_some_and(|(k, v)| k.trim().eq_ignore_ascii_case("driver") && !v.trim().is_empty())
        });
        if !has_driver {
            return st.post(
                id,
                MockError::new(
                    "IM002",
                    0,
                    "Data source name not found and no default driver specified",
                ),
            );
        }
        st.connection_strings.push(conn_str);
        let session = st.next_session;
        st.next_session += 1;
        if let Some(dbc) = st.dbc(id) {
            dbc.connected = true;
            dbc.session = session;
            dbc.in_txn = false;
            dbc.snapshot = None;
        }
        if !conn_str_out_len.is_null() {
            *conn_str_out_len = 0;
        }
        SQL_SUCCESS
    }

    unsafe fn disconnect(&self, hdbc: SQLHANDLE) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLDisconnect", hdbc);
        let id = id_of(hdbc);
        let (connected, dirty) = match st.dbc(id) {
            Some(dbc) => (dbc.connected, dbc.in_txn && !dbc.autocommit),
            None => return SQL_INVALID_HANDLE,
        };
        if let Some(rc) = st.injected("SQLDisconnect", id) {
            // The link is gone whatever the reported failure.
            if let Some(dbc) = st.dbc(id) {
                dbc.connected = false;
                dbc.in_txn = false;
            }
            return rc;
        }
        if !connected {
            return st.post(id, MockError::new("08003", 0, "Connection not open"));
        }
        if dirty {
            return st.post(id, MockError::new("25000", 0, "Invalid transaction state"));
        }
        if let Some(dbc) = st.dbc(id) {
            dbc.connected = false;
        }
        SQL_SUCCESS
    }

    unsafe fn set_connect_attr(
        &self,
        hdbc: SQLHANDLE,
        attribute: SQLINTEGER,
        value: SQLPOINTER,
        _string_length: SQLINTEGER,
    ) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLSetConnectAttr", hdbc);
        let Some(dbc) = st.dbc(id_of(hdbc)) else {
            return SQL_INVALID_HANDLE;
        };
        if attribute == SQL_ATTR_AUTOCOMMIT {
            let on = value as SQLULEN != SQL_AUTOCOMMIT_OFF;
            if on && dbc.in_txn {
                dbc.in_txn = false;
                dbc.snapshot = None;
            }
            dbc.autocommit = on;
        }
        SQL_SUCCESS
    }

    unsafe fn end_tran(
        &self,
        handle_type: SQLSMALLINT,
        handle: SQLHANDLE,
        completion_type: SQLSMALLINT,
    ) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLEndTran", handle);
        let id = id_of(handle);
        if handle_type != SQL_HANDLE_DBC || !st.is(id, SQL_HANDLE_DBC) {
            return SQL_INVALID_HANDLE;
        }
        if let Some(rc) = st.injected("SQLEndTran", id) {
            return rc;
        }
        let connected = st.dbc(id).is_some_and(|dbc| dbc.connected);
        if !connected {
            return st.post(id, MockError::new("08003", 0, "Connection not open"));
        }
        st.completions.push(completion_type);
        let snapshot = st.dbc(id).and_then(|dbc| {
            dbc.in_txn = false;
            dbc.snapshot.take()
        });
        if completion_type == SQL_ROLLBACK {
            if let Some(snapshot) = snapshot {
                st.db = snapshot;
            }
        }
        SQL_SUCCESS
    }

    unsafe fn exec_direct_w(
        &self,
        hstmt: SQLHANDLE,
        text: *const SQLWCHAR,
        text_length: SQLINTEGER,
    ) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLExecDirectW", hstmt);
        let id = id_of(hstmt);
        if !st.is(id, SQL_HANDLE_STMT) {
            return SQL_INVALID_HANDLE;
        }
        if let Some(rc) = st.injected("SQLExecDirectW", id) {
            return rc;
        }
        match parse(&decode_wide(text, text_length)) {
            Ok(commands) => st.execute_on(id, commands),
            Err(e) => st.post(id, e),
        }
    }

    unsafe fn prepare_w(
        &self,
        hstmt: SQLHANDLE,
        text: *const SQLWCHAR,
        text_length: SQLINTEGER,
    ) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLPrepareW", hstmt);
        let id = id_of(hstmt);
        if !st.is(id, SQL_HANDLE_STMT) {
            return SQL_INVALID_HANDLE;
        }
        if let Some(rc) = st.injected("SQLPrepareW", id) {
            return rc;
        }
        match parse(&decode_wide(text, text_length)) {
            Ok(commands) => {
                if let Some(stmt) = st.stmt(id) {
                    stmt.prepared = Some(commands);
                    stmt.current = None;
                    stmt.pending.clear();
                }
                SQL_SUCCESS
            }
            Err(e) => st.post(id, e),
        }
    }

    unsafe fn num_params(&self, hstmt: SQLHANDLE, count: *mut SQLSMALLINT) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLNumParams", hstmt);
        let id = id_of(hstmt);
        let Some(stmt) = st.stmt(id) else {
            return SQL_INVALID_HANDLE;
        };
        let Some(commands) = &stmt.prepared else {
            return st.post(id, MockError::new("HY010", 0, "Function sequence error"));
        };
        if !count.is_null() {
            *count = marker_count(commands) as SQLSMALLINT;
        }
        SQL_SUCCESS
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
        let mut st = self.state.lock();
        st.enter("SQLDescribeParam", hstmt);
        let id = id_of(hstmt);
        let Some(stmt) = st.stmt(id) else {
            return SQL_INVALID_HANDLE;
        };
        let Some(commands) = stmt.prepared.clone() else {
            return st.post(id, MockError::new("HY010", 0, "Function sequence error"));
        };
        let marker = param_number as usize;
        if marker == 0 || marker > marker_count(&commands) {
            return st.post(id, MockError::new("07009", 0, "Invalid descriptor index"));
        }
        let mut column = None;
        for command in &commands {
            if let Command::Insert { table, values } = command {
                let pos = values.iter().position(|e| *e == Expr::Marker(marker - 1));
                if let (Some(pos), Ok(table)) = (pos, st.db.table(table)) {
                    column = table.columns.get(pos).cloned();
                }
            }
        }
        let (sql_type, size, is_nullable) = match column {
            Some(c) => (c.sql_type, c.size, c.nullable),
            None => (SQL_WVARCHAR, 4000, true),
        };
        if !data_type.is_null() {
            *data_type = sql_type;
        }
        if !param_size.is_null() {
            *param_size = size;
        }
        if !decimal_digits.is_null() {
            *decimal_digits = 0;
        }
        if !nullable.is_null() {
            *nullable = if is_nullable { SQL_NULLABLE } else { SQL_NO_NULLS };
        }
        SQL_SUCCESS
    }

    unsafe fn bind_parameter(
        &self,
        hstmt: SQLHANDLE,
        param_number: SQLUSMALLINT,
        input_output_type: SQLSMALLINT,
        value_type: SQLSMALLINT,
        _parameter_type: SQLSMALLINT,
        _column_size: SQLULEN,
        _decimal_digits: SQLSMALLINT,
        value: SQLPOINTER,
        buffer_length: SQLLEN,
        str_len_or_ind: *mut SQLLEN,
    ) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLBindParameter", hstmt);
        let id = id_of(hstmt);
        let Some(stmt) = st.stmt(id) else {
            return SQL_INVALID_HANDLE;
        };
        if param_number == 0 {
            return st.post(id, MockError::new("07009", 0, "Invalid descriptor index"));
        }
        stmt.bound.insert(
            param_number,
            BoundParam {
                io_type: input_output_type,
                value_type,
                value,
                buffer_length,
                indicator: str_len_or_ind,
            },
        );
        SQL_SUCCESS
    }

    unsafe fn execute(&self, hstmt: SQLHANDLE) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLExecute", hstmt);
        let id = id_of(hstmt);
        let Some(stmt) = st.stmt(id) else {
            return SQL_INVALID_HANDLE;
        };
        let Some(commands) = stmt.prepared.clone() else {
            return st.post(id, MockError::new("HY010", 0, "Function sequence error"));
        };
        if let Some(rc) = st.injected("SQLExecute", id) {
            return rc;
        }
        st.execute_on(id, commands)
    }

    unsafe fn set_stmt_attr(
        &self,
        hstmt: SQLHANDLE,
        attribute: SQLINTEGER,
        value: SQLPOINTER,
        _string_length: SQLINTEGER,
    ) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLSetStmtAttr", hstmt);
        let Some(stmt) = st.stmt(id_of(hstmt)) else {
            return SQL_INVALID_HANDLE;
        };
        stmt.attrs.insert(attribute, value as SQLULEN);
        SQL_SUCCESS
    }

    unsafe fn free_stmt(&self, hstmt: SQLHANDLE, option: SQLUSMALLINT) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLFreeStmt", hstmt);
        let Some(stmt) = st.stmt(id_of(hstmt)) else {
            return SQL_INVALID_HANDLE;
        };
        match option {
            SQL_CLOSE => {
                stmt.current = None;
                stmt.pending.clear();
            }
            SQL_RESET_PARAMS => stmt.bound.clear(),
            _ => {}
        }
        SQL_SUCCESS
    }

    unsafe fn num_result_cols(&self, hstmt: SQLHANDLE, count: *mut SQLSMALLINT) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLNumResultCols", hstmt);
        let Some(stmt) = st.stmt(id_of(hstmt)) else {
            return SQL_INVALID_HANDLE;
        };
        if !count.is_null() {
            *count = stmt
                .current
                .as_ref()
                .map_or(0, |r| r.set.columns.len() as SQLSMALLINT);
        }
        SQL_SUCCESS
    }

    unsafe fn row_count(&self, hstmt: SQLHANDLE, count: *mut SQLLEN) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLRowCount", hstmt);
        let Some(stmt) = st.stmt(id_of(hstmt)) else {
            return SQL_INVALID_HANDLE;
        };
        if !count.is_null() {
            *count = stmt
                .current
                .as_ref()
                .map_or(-1, |r| r.set.row_count as SQLLEN);
        }
        SQL_SUCCESS
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
        let mut st = self.state.lock();
        st.enter("SQLDescribeColW", hstmt);
        let id = id_of(hstmt);
        let Some(stmt) = st.stmt(id) else {
            return SQL_INVALID_HANDLE;
        };
        let column = stmt
            .current
            .as_ref()
            .and_then(|r| r.set.columns.get((col_number as usize).wrapping_sub(1)))
            .cloned();
        let Some(column) = column else {
            return st.post(id, MockError::new("07009", 0, "Invalid descriptor index"));
        };
        let name: Vec<SQLWCHAR> = column.name.encode_utf16().collect();
        write_wide(col_name, buffer_length.max(0) as usize, &name);
        if !name_length.is_null() {
            *name_length = name.len() as SQLSMALLINT;
        }
        if !data_type.is_null() {
            *data_type = column.sql_type;
        }
        if !column_size.is_null() {
            *column_size = column.size;
        }
        if !decimal_digits.is_null() {
            *decimal_digits = 0;
        }
        if !nullable.is_null() {
            *nullable = if column.nullable { SQL_NULLABLE } else { SQL_NO_NULLS };
        }
        SQL_SUCCESS
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
        let mut st = self.state.lock();
        st.enter("SQLColAttributeW", hstmt);
        let id = id_of(hstmt);
        let Some(stmt) = st.stmt(id) else {
            return SQL_INVALID_HANDLE;
        };
        let column = stmt
            .current
            .as_ref()
            .and_then(|r| r.set.columns.get((col_number as usize).wrapping_sub(1)))
            .cloned();
        let Some(column) = column else {
            return st.post(id, MockError::new("07009", 0, "Invalid descriptor index"));
        };
        if field_identifier == SQL_DESC_TYPE_NAME {
            let name: Vec<SQLWCHAR> = column.type_name.encode_utf16().collect();
            write_wide(
                char_attr as *mut SQLWCHAR,
                buffer_length.max(0) as usize / 2,
                &name,
            );
            if !string_length.is_null() {
                *string_length = (name.len() * 2) as SQLSMALLINT;
            }
        } else if !numeric_attr.is_null() {
            *numeric_attr = 0;
        }
        SQL_SUCCESS
    }

    unsafe fn fetch(&self, hstmt: SQLHANDLE) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLFetch", hstmt);
        let id = id_of(hstmt);
        let Some(stmt) = st.stmt(id) else {
            return SQL_INVALID_HANDLE;
        };
        let Some(active) = stmt.current.as_mut().filter(|r| !r.set.columns.is_empty()) else {
            return st.post(id, MockError::new("24000", 0, "Invalid cursor state"));
        };
        let next = active.row.map_or(0, |r| r + 1);
        if next >= active.set.rows.len() {
            active.row = Some(active.set.rows.len());
            return SQL_NO_DATA;
        }
        active.row = Some(next);
        active.offsets.iter_mut().for_each(|o| *o = None);
        SQL_SUCCESS
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
        let mut st = self.state.lock();
        st.enter("SQLGetData", hstmt);
        let id = id_of(hstmt);
        let report_no_total = st.report_no_total;
        let Some(stmt) = st.stmt(id) else {
            return SQL_INVALID_HANDLE;
        };
        let Some(active) = stmt.current.as_mut() else {
            return st.post(id, MockError::new("24000", 0, "Invalid cursor state"));
        };
        let Some(row) = active.row.filter(|r| *r < active.set.rows.len()) else {
            return st.post(id, MockError::new("24000", 0, "Invalid cursor state"));
        };
        let col = (col as usize).wrapping_sub(1);
        let Some(value) = active.set.rows[row].get(col).cloned() else {
            return st.post(id, MockError::new("07009", 0, "Invalid descriptor index"));
        };
        let offset = active.offsets[col];
        if value.is_null() {
            if offset.is_some() {
                return SQL_NO_DATA;
            }
            active.offsets[col] = Some(0);
            if !str_len_or_ind.is_null() {
                *str_len_or_ind = SQL_NULL_DATA;
            }
            return SQL_SUCCESS;
        }

        let truncated = if target_type == SQL_C_BINARY {
            let bytes = value_bytes(&value);
            let start = offset.unwrap_or(0);
            if offset.is_some() && start >= bytes.len() {
                return SQL_NO_DATA;
            }
            let remaining = &bytes[start..];
            let copy = remaining.len().min(buffer_length.max(0) as usize);
            if !target_value.is_null() {
                ptr::copy_nonoverlapping(remaining.as_ptr(), target_value as *mut u8, copy);
            }
            let truncated = copy < remaining.len();
            if !str_len_or_ind.is_null() {
                *str_len_or_ind = if truncated && report_no_total {
                    SQL_NO_TOTAL
                } else {
                    remaining.len() as SQLLEN
                };
            }
            active.offsets[col] = Some(start + copy);
            truncated
        } else {
            let units = value_units(&value);
            let start = offset.unwrap_or(0);
            if offset.is_some() && start >= units.len() {
                return SQL_NO_DATA;
            }
            let remaining = &units[start..];
            let copied = write_wide(
                target_value as *mut SQLWCHAR,
                buffer_length.max(0) as usize / 2,
                remaining,
            );
            if !str_len_or_ind.is_null() {
                *str_len_or_ind = (remaining.len() * 2) as SQLLEN;
            }
            active.offsets[col] = Some(start + copied);
            copied < remaining.len()
        };
        if truncated {
            st.warn(id, SQL_STATE_DATA_TRUNCATED, "String data, right truncated");
            return SQL_SUCCESS_WITH_INFO;
        }
        SQL_SUCCESS
    }

    unsafe fn more_results(&self, hstmt: SQLHANDLE) -> SQLRETURN {
        let mut st = self.state.lock();
        st.enter("SQLMoreResults", hstmt);
        let Some(stmt) = st.stmt(id_of(hstmt)) else {
            return SQL_INVALID_HANDLE;
        };
        match stmt.pending.pop_front() {
            Some(next) => {
                stmt.current = Some(ActiveResult::new(next));
                SQL_SUCCESS
            }
            None => {
                stmt.current = None;
                SQL_NO_DATA
            }
        }
    }

    unsafe fn get_diag_rec_w(
        &self,
        _handle_type: SQLSMALLINT,
        handle: SQLHANDLE,
        rec_number: SQLSMALLINT,
        sql_state: *mut SQLWCHAR,
        native_error: *mut SQLINTEGER,
        message_text: *mut SQLWCHAR,
        buffer_length: SQLSMALLINT,
        text_length: *mut SQLSMALLINT,
    ) -> SQLRETURN {
        let mut st = self.state.lock();
        st.calls.push("SQLGetDiagRecW");
        let id = id_of(handle);
        if !st.objects.contains_key(&id) {
            return SQL_INVALID_HANDLE;
        }
        if rec_number < 1 {
            return SQL_ERROR;
        }
        let Some(rec) = st
            .diags
            .get(&id)
            .and_then(|d| d.get(rec_number as usize - 1))
        else {
            return SQL_NO_DATA;
        };
        let state: Vec<SQLWCHAR> = rec.state.encode_utf16().collect();
        write_wide(sql_state, 6, &state);
        if !native_error.is_null() {
            *native_error = rec.native_error;
        }
        let message: Vec<SQLWCHAR> = rec.message.encode_utf16().collect();
        let capacity = buffer_length.max(0) as usize;
        write_wide(message_text, capacity, &message);
        if !text_length.is_null() {
            *text_length = message.len().min(SQLSMALLINT::MAX as usize) as SQLSMALLINT;
        }
        if message.len() >= capacity {
            return SQL_SUCCESS_WITH_INFO;
        }
        SQL_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(driver: &MemoryDriver, hstmt: SQLHANDLE, sql: &str) -> SQLRETURN {
        let text = to_wide_nts(sql);
        unsafe { driver.exec_direct_w(hstmt, text.as_ptr(), SQL_NTS as SQLINTEGER) }
    }

    #[test]
    fn unknown_handles_are_invalid() {
        let driver = MemoryDriver::new();
        let bogus = 0xdead as SQLHANDLE;
        assert_eq!(exec(&driver, bogus, "SELECT 1"), SQL_INVALID_HANDLE);
        assert_eq!(unsafe { driver.free_handle(SQL_HANDLE_STMT, bogus) }, SQL_INVALID_HANDLE);
    }

    #[test]
    fn multi_statement_requests_queue_results() {
        let driver = MemoryDriver::new();
        let hstmt = driver.alloc_raw_statement();
        assert_eq!(exec(&driver, hstmt, "SELECT 1; SELECT 'a', 2"), SQL_SUCCESS);
        let mut cols: SQLSMALLINT = 0;
        unsafe { driver.num_result_cols(hstmt, &mut cols) };
        assert_eq!(cols, 1);
        assert_eq!(unsafe { driver.more_results(hstmt) }, SQL_SUCCESS);
        unsafe { driver.num_result_cols(hstmt, &mut cols) };
        assert_eq!(cols, 2);
        assert_eq!(unsafe { driver.more_results(hstmt) }, SQL_NO_DATA);
    }

    #[test]
    fn failed_statements_leave_diagnostics() {
        let driver = MemoryDriver::new();
        let hstmt = driver.alloc_raw_statement();
        assert_eq!(exec(&driver, hstmt, "SELECT * FROM nowhere"), SQL_ERROR);
        let mut state = [0 as SQLWCHAR; 6];
        let mut native = 0;
        let mut msg = [0 as SQLWCHAR; 64];
        let mut len = 0;
        let rc = unsafe {
            driver.get_diag_rec_w(
                SQL_HANDLE_STMT,
                hstmt,
                1,
                state.as_mut_ptr(),
                &mut native,
                msg.as_mut_ptr(),
                msg.len() as SQLSMALLINT,
                &mut len,
            )
        };
        assert_eq!(rc, SQL_SUCCESS);
        assert_eq!(from_wide_nts(&state), "42S02");
        assert_eq!(native, 3807);
        assert_eq!(from_wide_nts(&msg), "Object 'nowhere' does not exist.");
        // The next call clears the diagnostic area.
        assert_eq!(exec(&driver, hstmt, "SELECT 1"), SQL_SUCCESS);
        let rc = unsafe {
            driver.get_diag_rec_w(
                SQL_HANDLE_STMT,
                hstmt,
                1,
                state.as_mut_ptr(),
                &mut native,
                msg.as_mut_ptr(),
                msg.len() as SQLSMALLINT,
                &mut len,
            )
        };
        assert_eq!(rc, SQL_NO_DATA);
    }

    #[test]
    fn injected_failures_fire_once() {
        let driver = MemoryDriver::new();
        let hstmt = driver.alloc_raw_statement();
        driver.fail_next("SQLExecDirectW", "HY000", 1, "boom");
        assert_eq!(exec(&driver, hstmt, "SELECT 1"), SQL_ERROR);
        assert_eq!(exec(&driver, hstmt, "SELECT 1"), SQL_SUCCESS);
    }
}
