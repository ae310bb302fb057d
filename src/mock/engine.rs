//! Statement parsing and table storage for the in-memory driver.
//!
//! Understands just enough SQL for the test suites: `CREATE TABLE`,
//! `DROP TABLE`, `INSERT ... VALUES`, `DELETE FROM`, `SELECT * FROM`,
//! `SELECT <literals>`, `SELECT SESSION`, `SET QUERY_BAND` and `CALL`.

use crate::datatypes::Value;
use crate::types::*;
use std::collections::BTreeMap;

/// Driver-side failure, reported through the diagnostic area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockError {
    pub state: String,
    pub native: i32,
    pub message: String,
}

impl MockError {
    pub fn new(state: &str, native: i32, message: impl Into<String>) -> Self {
        MockError {
            state: state.to_string(),
            native,
            message: message.into(),
        }
    }

    fn syntax(message: impl Into<String>) -> Self {
        MockError::new("42000", 3706, message)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MockColumn {
    pub name: String,
    pub sql_type: SQLSMALLINT,
    pub type_name: String,
    pub size: usize,
    pub nullable: bool,
}

impl MockColumn {
    fn is_binary(&self) -> bool {
        matches!(self.sql_type, SQL_BINARY | SQL_VARBINARY | SQL_LONGVARBINARY)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Table {
    pub columns: Vec<MockColumn>,
    pub rows: Vec<Vec<Value>>,
}

/// Columns and rows produced by a query.
#[derive(Clone, Debug, Default)]
pub struct ResultSet {
    pub columns: Vec<MockColumn>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Zero-based parameter marker number within the whole request.
    Marker(usize),
    Literal(Value),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    SelectSession,
    SetQueryBand(String),
    CreateTable { name: String, columns: Vec<MockColumn> },
    DropTable { name: String },
    Insert { table: String, values: Vec<Expr> },
    Delete { table: String },
    SelectAll { table: String },
    SelectLiterals(Vec<Expr>),
    Call { name: String, args: Vec<Expr> },
}

/// Split on `delim` outside of quotes and parentheses.
fn split_top_level(s: &str, delim: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote = false;
    let mut depth = 0usize;
    for c in s.chars() {
        match c {
            '\'' => quote = !quote,
            '(' if !quote => depth += 1,
            ')' if !quote => depth = depth.saturating_sub(1),
            _ if c == delim && !quote && depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);
    parts
}

fn normalize(sql: &str) -> String {
    sql.replace(['\r', '\n', '\t'], " ").trim().to_string()
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => Some(s[prefix.len()..].trim_start()),
        _ => None,
    }
}

/// Contents of the outermost parentheses.
fn parenthesized(s: &str) -> Result<(&str, &str), MockError> {
    let open = s
        .find('(')
        .ok_or_else(|| MockError::syntax("Expected '('."))?;
    let close = s
        .rfind(')')
        .filter(|&c| c > open)
        .ok_or_else(|| MockError::syntax("Expected ')'."))?;
    Ok((s[..open].trim(), &s[open + 1..close]))
}

fn unquote(s: &str) -> Option<String> {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        Some(s[1..s.len() - 1].replace("''", "'"))
    } else {
        None
    }
}

fn parse_expr(s: &str, markers: &mut usize) -> Result<Expr, MockError> {
    let s = s.trim();
    if s == "?" {
        let n = *markers;
        *markers += 1;
        return Ok(Expr::Marker(n));
    }
    if let Some(text) = unquote(s) {
        return Ok(Expr::Literal(Value::Text(text)));
    }
    if s.eq_ignore_ascii_case("NULL") {
        return Ok(Expr::Literal(Value::Null));
    }
    if let Ok(i) = s.parse::<i64>() {
        return Ok(Expr::Literal(Value::Integer(i)));
    }
    if let Ok(f) = s.parse::<f64>() {
        return Ok(Expr::Literal(Value::Float(f)));
    }
    Err(MockError::syntax(format!("Syntax error: unexpected '{s}'.")))
}

fn parse_list(s: &str, markers: &mut usize) -> Result<Vec<Expr>, MockError> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    split_top_level(s, ',')
        .iter()
        .map(|part| parse_expr(part, markers))
        .collect()
}

fn parse_column(def: &str) -> Result<MockColumn, MockError> {
    let def = def.trim();
    let (name, rest) = def
        .split_once(' ')
        .ok_or_else(|| MockError::syntax(format!("Missing type for column '{def}'.")))?;
    let mut ty = rest.trim().to_ascii_uppercase();
    let mut nullable = true;
    if let Some(stripped) = ty.strip_suffix("NOT NULL") {
        ty = stripped.trim().to_string();
        nullable = false;
    }
    let (base, size) = match ty.find('(') {
        Some(open) => {
            let inner = ty[open + 1..].trim_end_matches(')');
            let size = inner
                .split(',')
                .next()
                .and_then(|n| n.trim().parse::<usize>().ok());
            (ty[..open].trim().to_string(), size)
        }
        None => (ty.clone(), None),
    };
    let (sql_type, default_size) = match base.as_str() {
        "INTEGER" | "INT" | "SMALLINT" | "BIGINT" | "BYTEINT" => (SQL_INTEGER, 10),
        "FLOAT" | "REAL" | "DOUBLE PRECISION" | "DECIMAL" | "NUMERIC" => (SQL_VARCHAR, 18),
        "VARCHAR" | "CHAR" => (SQL_WVARCHAR, 1),
        "LONG VARCHAR" | "CLOB" => (SQL_WLONGVARCHAR, 64000),
        "VARBYTE" | "BYTE" => (SQL_VARBINARY, 1),
        "BLOB" => (SQL_LONGVARBINARY, 2_097_088_000),
        other => return Err(MockError::syntax(format!("Unknown data type '{other}'."))),
    };
    Ok(MockColumn {
        name: name.trim().to_string(),
        sql_type,
        type_name: base,
        size: size.unwrap_or(default_size),
        nullable,
    })
}

fn parse_one(stmt: &str, markers: &mut usize) -> Result<Command, MockError> {
    if stmt.eq_ignore_ascii_case("SELECT SESSION") {
        return Ok(Command::SelectSession);
    }
    if let Some(rest) = strip_prefix_ci(stmt, "SET QUERY_BAND") {
        let rest = rest.trim_start_matches('=').trim();
        let end = rest
            .rfind('\'')
            .ok_or_else(|| MockError::syntax("Expected quoted query band."))?;
        let band = unquote(&rest[..=end])
            .ok_or_else(|| MockError::syntax("Expected quoted query band."))?;
        return Ok(Command::SetQueryBand(band));
    }
    if let Some(rest) = strip_prefix_ci(stmt, "CREATE TABLE") {
        let (name, defs) = parenthesized(rest)?;
        let columns = split_top_level(defs, ',')
            .iter()
            .map(|d| parse_column(d))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Command::CreateTable {
            name: name.to_string(),
            columns,
        });
    }
    if let Some(rest) = strip_prefix_ci(stmt, "DROP TABLE") {
        return Ok(Command::DropTable {
            name: rest.trim().to_string(),
        });
    }
    if let Some(rest) = strip_prefix_ci(stmt, "INSERT INTO") {
        let (head, list) = parenthesized(rest)?;
        let table = head
            .split_whitespace()
            .next()
            .ok_or_else(|| MockError::syntax("Missing table name."))?;
        return Ok(Command::Insert {
            table: table.to_string(),
            values: parse_list(list, markers)?,
        });
    }
    if let Some(rest) = strip_prefix_ci(stmt, "DELETE FROM") {
        return Ok(Command::Delete {
            table: rest.trim().to_string(),
        });
    }
    if let Some(rest) = strip_prefix_ci(stmt, "CALL") {
        let (name, list) = parenthesized(rest)?;
        return Ok(Command::Call {
            name: name.to_string(),
            args: parse_list(list, markers)?,
        });
    }
    if let Some(rest) = strip_prefix_ci(stmt, "SELECT") {
        if let Some(table) = strip_prefix_ci(rest, "* FROM") {
            return Ok(Command::SelectAll {
                table: table.trim().to_string(),
            });
        }
        return Ok(Command::SelectLiterals(parse_list(rest, markers)?));
    }
    Err(MockError::syntax(format!(
        "Syntax error, expected something like a 'SELECT' keyword: '{stmt}'."
    )))
}

/// Parse a request of one or more `;`-separated statements.
pub fn parse(sql: &str) -> Result<Vec<Command>, MockError> {
    let mut markers = 0;
    let commands = split_top_level(&normalize(sql), ';')
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| parse_one(s, &mut markers))
        .collect::<Result<Vec<_>, _>>()?;
    if commands.is_empty() {
        return Err(MockError::syntax("Empty request."));
    }
    Ok(commands)
}

/// Number of parameter markers in a parsed request.
pub fn marker_count(commands: &[Command]) -> usize {
    commands
        .iter()
        .flat_map(|c| match c {
            Command::Insert { values, .. } => values.as_slice(),
            Command::SelectLiterals(values) => values.as_slice(),
            Command::Call { args, .. } => args.as_slice(),
            _ => &[][..],
        })
        .filter(|e| matches!(e, Expr::Marker(_)))
        .count()
}

/// Stored tables.
#[derive(Clone, Debug, Default)]
pub struct Database {
    pub tables: BTreeMap<String, Table>,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn missing(name: &str) -> MockError {
    MockError::new("42S02", 3807, format!("Object '{name}' does not exist."))
}

impl Database {
    pub fn table(&self, name: &str) -> Result<&Table, MockError> {
        self.tables.get(&key(name)).ok_or_else(|| missing(name))
    }

    pub fn create(&mut self, name: &str, columns: Vec<MockColumn>) -> Result<(), MockError> {
        if self.tables.contains_key(&key(name)) {
            return Err(MockError::new(
                "42S01",
                3803,
                format!("Table '{name}' already exists."),
            ));
        }
        self.tables.insert(
            key(name),
            Table {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn drop_table(&mut self, name: &str) -> Result<(), MockError> {
        self.tables
            .remove(&key(name))
            .map(|_| ())
            .ok_or_else(|| missing(name))
    }

    pub fn insert(&mut self, name: &str, row: Vec<Value>) -> Result<(), MockError> {
        let table = self.tables.get_mut(&key(name)).ok_or_else(|| missing(name))?;
        if row.len() != table.columns.len() {
            return Err(MockError::new(
                "21S01",
                3812,
                format!(
                    "Insert value list has {} values for {} columns.",
                    row.len(),
                    table.columns.len()
                ),
            ));
        }
        let row = row
            .into_iter()
            .zip(&table.columns)
            .map(|(value, column)| coerce(value, column))
            .collect::<Result<Vec<_>, _>>()?;
        table.rows.push(row);
        Ok(())
    }

    pub fn delete_all(&mut self, name: &str) -> Result<i64, MockError> {
        let table = self.tables.get_mut(&key(name)).ok_or_else(|| missing(name))?;
        let count = table.rows.len() as i64;
        table.rows.clear();
        Ok(count)
    }

    pub fn select_all(&self, name: &str) -> Result<ResultSet, MockError> {
        let table = self.table(name)?;
        Ok(ResultSet {
            columns: table.columns.clone(),
            rows: table.rows.clone(),
            row_count: table.rows.len() as i64,
        })
    }
}

fn coerce(value: Value, column: &MockColumn) -> Result<Value, MockError> {
    if value.is_null() {
        if !column.nullable {
            return Err(MockError::new(
                "23000",
                3811,
                format!("Column '{}' is NOT NULL.", column.name),
            ));
        }
        return Ok(value);
    }
    if column.is_binary() {
        return match value {
            Value::Binary(_) => Ok(value),
            other => Err(MockError::new(
                "22018",
                3532,
                format!("Cannot store {other:?} in binary column '{}'.", column.name),
            )),
        };
    }
    if column.sql_type == SQL_INTEGER {
        return match &value {
            Value::Integer(_) => Ok(value),
            Value::Text(t) => t.trim().parse::<i64>().map(Value::Integer).map_err(|_| {
                MockError::new("22018", 2620, format!("Bad character in format or data: '{t}'."))
            }),
            other => Err(MockError::new(
                "22018",
                2620,
                format!("Cannot store {other:?} in integer column '{}'.", column.name),
            )),
        };
    }
    Ok(match value {
        Value::Binary(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
        other => Value::Text(other.to_text().unwrap_or_default()),
    })
}

/// Column produced by `SELECT <literal>`.
pub fn literal_column(index: usize, value: &Value) -> MockColumn {
    let (sql_type, type_name) = match value {
        Value::Integer(_) => (SQL_INTEGER, "INTEGER"),
        Value::Float(_) => (SQL_VARCHAR, "FLOAT"),
        Value::Binary(_) => (SQL_VARBINARY, "VARBYTE"),
        Value::Null | Value::Text(_) => (SQL_WVARCHAR, "VARCHAR"),
    };
    MockColumn {
        name: format!("col{}", index + 1),
        sql_type,
        type_name: type_name.to_string(),
        size: value.to_text().map_or(1, |t| t.chars().count().max(1)),
        nullable: true,
    }
}
