//! Statement execution, parameter binding and fetching against the in-memory driver.

mod common;

use common::{connect, memory_env};
use odbcbridge::mock::MockError;
use odbcbridge::{params, Param, Value};

#[test]
fn select_literal_returns_one_row() {
    let (_driver, env) = memory_env();
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let rows = cursor.execute("SELECT 1", &[]).unwrap().fetch_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].len(), 1);
    assert_eq!(rows[0][0], Value::Integer(1));
    assert_eq!(cursor.rowcount(), 1);
    assert_eq!(cursor.description()[0].type_name, "INTEGER");
}

#[test]
fn batched_executemany_inserts_rows_in_order() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Id INTEGER, Name VARCHAR(20))");
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let rows = vec![params![1, "one"], params![2, "two"], params![3, "three"]];
    cursor.executemany("INSERT INTO t VALUES (?, ?)", &rows, true).unwrap();
    assert_eq!(cursor.rowcount(), 3);
    assert_eq!(
        driver.table_rows("t"),
        vec![
            vec![Value::Integer(1), Value::from("one")],
            vec![Value::Integer(2), Value::from("two")],
            vec![Value::Integer(3), Value::from("three")],
        ]
    );
    assert_eq!(driver.calls_named("SQLExecute"), 1);
}

#[test]
fn batched_and_per_row_execution_store_the_same_rows() {
    let rows = vec![
        params![1, "a", vec![0u8, 1, 2]],
        params![2, Param::null(), Param::null()],
        params![3, "", Vec::<u8>::new()],
        params![4, "longer text value", vec![9u8; 40]],
    ];
    let mut stored = Vec::new();
    for batch in [true, false] {
        let (driver, env) = memory_env();
        driver.execute_sql("CREATE TABLE t (Id INTEGER, Name VARCHAR(40), Data VARBYTE(64))");
        let conn = connect(&env);
        let mut cursor = conn.cursor().unwrap();
        cursor.executemany("INSERT INTO t VALUES (?, ?, ?)", &rows, batch).unwrap();
        assert_eq!(cursor.rowcount(), 4);
        stored.push(driver.table_rows("t"));
    }
    assert_eq!(stored[0], stored[1]);
    assert_eq!(stored[0][1][1], Value::Null);
    assert_eq!(stored[0][2][1], Value::Text(String::new()));
    assert_eq!(stored[0][2][2], Value::Binary(Vec::new()));
}

#[test]
fn per_row_executemany_sums_row_counts() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Id INTEGER)");
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let rows: Vec<Vec<Param>> = (1..=5).map(|i| params![i]).collect();
    cursor.executemany("INSERT INTO t VALUES (?)", &rows, false).unwrap();
    assert_eq!(cursor.rowcount(), 5);
    assert_eq!(driver.calls_named("SQLExecute"), 5);
    assert_eq!(driver.table_rows("t").len(), 5);
}

#[test]
fn executemany_without_rows_reports_zero() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Id INTEGER)");
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    cursor.executemany("INSERT INTO t VALUES (?)", &[], true).unwrap();
    assert_eq!(cursor.rowcount(), 0);
    assert_eq!(driver.calls_named("SQLExecute"), 0);
}

#[test]
fn long_text_is_reassembled_from_a_small_buffer() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Body LONG VARCHAR)");
    let long: String = (0..10_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    driver.insert_row("t", vec![Value::Text(long.clone())]);
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    cursor.set_fetch_buffer_size(4096);
    let rows = cursor.execute("SELECT * FROM t", &[]).unwrap().fetch_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], Value::Text(long));
}

#[test]
fn embedded_nul_characters_survive_continuation_reads() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Body LONG VARCHAR)");
    let long = "ab\0cd".repeat(3000);
    driver.insert_row("t", vec![Value::Text(long.clone())]);
    driver.insert_row("t", vec![Value::from("ab\0cd")]);
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    cursor.set_fetch_buffer_size(4096);
    let rows = cursor.execute("SELECT * FROM t", &[]).unwrap().fetch_all().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], Value::Text(long));
    assert_eq!(rows[1][0], Value::from("ab\0cd"));
}

#[test]
fn null_and_empty_values_are_distinct() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Name VARCHAR(10), Data VARBYTE(10))");
    driver.insert_row("t", vec![Value::Null, Value::Null]);
    driver.insert_row("t", vec![Value::from(""), Value::Binary(Vec::new())]);
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let rows = cursor.execute("SELECT * FROM t", &[]).unwrap().fetch_all().unwrap();
    assert_eq!(rows[0].values(), &[Value::Null, Value::Null]);
    assert_eq!(rows[1].values(), &[Value::from(""), Value::Binary(Vec::new())]);
    assert!(cursor.description()[0].nullable);
}

#[test]
fn rows_are_addressable_by_column_name() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Id INTEGER NOT NULL, Name VARCHAR(10))");
    driver.insert_row("t", vec![Value::Integer(7), Value::from("seven")]);
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    cursor.execute("SELECT * FROM t", &[]).unwrap();
    assert_eq!(cursor.column_index("NAME"), Some(1));
    let row = cursor.fetch_one().unwrap().unwrap();
    assert_eq!(row.get_by_name("id"), Some(&Value::Integer(7)));
    assert_eq!(row.get_by_name("Name"), Some(&Value::from("seven")));
    assert!(cursor.fetch_one().unwrap().is_none());
}

#[test]
fn fetch_many_stops_early_and_rows_can_be_abandoned() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Id INTEGER)");
    for i in 0..10 {
        driver.insert_row("t", vec![Value::Integer(i)]);
    }
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    cursor.execute("SELECT * FROM t", &[]).unwrap();
    assert_eq!(cursor.fetch_many(3).unwrap().len(), 3);
    assert_eq!(cursor.rows().take(2).count(), 2);
    // Re-executing discards the rest of the pending result.
    let rows = cursor.execute("SELECT 'x'", &[]).unwrap().fetch_all().unwrap();
    assert_eq!(rows[0][0], Value::from("x"));
}

#[test]
fn callproc_returns_driver_assigned_outputs() {
    let (driver, env) = memory_env();
    driver.register_procedure("bump", |args| {
        let n = args[0].as_i64().unwrap_or(0);
        Ok(vec![Value::Integer(n + 1), Value::from(format!("was {n}"))])
    });
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let out = cursor
        .callproc("bump", &[Param::in_out(41), Param::out()])
        .unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0], Value::from("42"));
    assert_eq!(out[1], Value::from("was 41"));
    assert_eq!(cursor.output_values(), Some(&out));
}

#[test]
fn callproc_keeps_input_values_and_null_outputs() {
    let (driver, env) = memory_env();
    driver.register_procedure("maybe", |args| Ok(vec![args[0].clone(), Value::Null]));
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let out = cursor
        .callproc("maybe", &[Param::from("in"), Param::out_sized(8)])
        .unwrap();
    assert_eq!(out.values(), &[Value::from("in"), Value::Null]);
}

#[test]
fn procedure_errors_surface_as_database_errors() {
    let (driver, env) = memory_env();
    driver.register_procedure("fails", |_| Err(MockError::new("HY000", 7504, "boom")));
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let err = cursor.callproc("fails", &[Param::from(1)]).unwrap_err();
    assert_eq!(err.sql_state(), Some("HY000"));
    assert!(err.to_string().contains("boom"));
    assert!(cursor.output_values().is_none());
}

#[test]
fn parameter_count_mismatch_fails_before_binding() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (a INTEGER, b INTEGER, c INTEGER)");
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let err = cursor.execute("INSERT INTO t VALUES (?, ?, ?)", &params![1, 2]).unwrap_err();
    assert_eq!(err.interface_code(), Some("PARAMS_MISMATCH"));
    assert_eq!(driver.calls_named("SQLBindParameter"), 0);
    assert_eq!(driver.calls_named("SQLExecute"), 0);
}

#[test]
fn short_argument_row_fails_before_the_statement_is_reset() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (a INTEGER, b INTEGER)");
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let before = driver.calls_named("SQLFreeStmt");
    cursor
        .executemany("INSERT INTO t VALUES (?, ?)", &[params![1, 2]], false)
        .unwrap();
    let single_row = driver.calls_named("SQLFreeStmt") - before;

    let before = driver.calls_named("SQLFreeStmt");
    let err = cursor
        .executemany("INSERT INTO t VALUES (?, ?)", &[params![3, 4], params![5]], false)
        .unwrap_err();
    assert_eq!(err.interface_code(), Some("PARAMS_MISMATCH"));
    assert_eq!(driver.calls_named("SQLFreeStmt") - before, single_row);
    assert_eq!(driver.table_rows("t").len(), 2);
}

#[test]
fn batch_rejects_output_parameters() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (a VARCHAR(10))");
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let err = cursor
        .executemany("INSERT INTO t VALUES (?)", &[vec![Param::out()]], true)
        .unwrap_err();
    assert_eq!(err.interface_code(), Some("UNSUPPORTED_PARAMETER"));
}

#[test]
fn multi_statement_results_are_walked_with_nextset() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Id INTEGER)");
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    cursor
        .execute("INSERT INTO t VALUES (1);\nINSERT INTO t VALUES (2);\nSELECT * FROM t", &[])
        .unwrap();
    assert_eq!(cursor.rowcount(), 1);
    assert!(cursor.description().is_empty());
    assert!(cursor.nextset().unwrap());
    assert!(cursor.nextset().unwrap());
    let rows = cursor.fetch_all().unwrap();
    assert_eq!(rows.len(), 2);
    assert!(!cursor.nextset().unwrap());
    let err = cursor.fetch_one().unwrap_err();
    assert_eq!(err.interface_code(), Some("NO_RESULT_SET"));
}

#[test]
fn driver_errors_carry_state_and_native_code() {
    let (_driver, env) = memory_env();
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let err = cursor.execute("SELECT * FROM missing", &[]).unwrap_err();
    assert_eq!(err.sql_state(), Some("42S02"));
    match err {
        odbcbridge::Error::Database { code, message, .. } => {
            assert_eq!(code, 3807);
            assert!(message.contains("missing"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn query_timeout_is_applied_to_the_statement() {
    let (driver, env) = memory_env();
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    cursor.set_query_timeout(30);
    cursor.execute("SELECT 1", &[]).unwrap();
    assert_eq!(cursor.query_timeout(), 30);
    assert!(driver.calls_named("SQLSetStmtAttr") >= 1);
}

#[test]
fn closed_cursor_rejects_work_and_closes_once() {
    let (driver, env) = memory_env();
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    assert_eq!(conn.open_cursors(), 1);
    cursor.close().unwrap();
    cursor.close().unwrap();
    assert!(cursor.is_closed());
    assert_eq!(conn.open_cursors(), 0);
    let before = driver.calls_named("SQLFreeHandle");
    drop(cursor);
    assert_eq!(driver.calls_named("SQLFreeHandle"), before);

    let mut cursor = conn.cursor().unwrap();
    conn.close().unwrap();
    let err = cursor.execute("SELECT 1", &[]).unwrap_err();
    assert_eq!(err.interface_code(), Some("CURSOR_CLOSED"));
}
