//! Connection lifecycle: session setup, transactions and teardown.

mod common;

use common::{connect, memory_env, plain_options, teradata_options};
use odbcbridge::{ConnectOptions, Value};

#[test]
fn teradata_sessions_report_their_number_and_query_bands() {
    let (driver, env) = memory_env();
    let conn = env
        .connect(&teradata_options().query_band("ApplicationName", "etl").query_band("Org", "qa"))
        .unwrap();
    assert_eq!(conn.session_no().as_deref(), Some("1000"));
    assert_eq!(driver.query_bands(), vec!["ApplicationName=etl;Org=qa;".to_string()]);
    // Setup statements run in a transaction that is committed before use.
    assert_eq!(driver.commits(), 1);
    assert_eq!(conn.open_cursors(), 0);
    conn.close().unwrap();
    assert_eq!(driver.rollbacks(), 0);
}

#[test]
fn autocommit_sessions_skip_the_setup_commit() {
    let (driver, env) = memory_env();
    let conn = env.connect(&teradata_options().autocommit(true)).unwrap();
    assert!(conn.autocommit());
    assert!(driver.query_bands().is_empty());
    assert_eq!(driver.commits(), 0);
    let second = env.connect(&teradata_options().autocommit(true)).unwrap();
    assert_eq!(second.session_no().as_deref(), Some("1001"));
}

#[test]
fn other_database_types_run_no_setup() {
    let (driver, env) = memory_env();
    let conn = connect(&env);
    assert_eq!(conn.session_no(), None);
    assert_eq!(conn.db_type(), "Memory");
    assert_eq!(driver.calls_named("SQLExecDirectW"), 0);
}

#[test]
fn driver_receives_the_full_connection_string() {
    let (driver, env) = memory_env();
    let _conn = env
        .connect(&teradata_options().transaction_mode("TERA").param("CHARSET", "UTF8"))
        .unwrap();
    assert_eq!(
        driver.connection_strings(),
        vec!["DRIVER=Teradata;DBCNAME=tdprod;UID=dbc;PWD=secret;SESSIONMODE=Teradata;CHARSET=UTF8".to_string()]
    );
}

#[test]
fn failed_connect_frees_the_connection_handle() {
    let (driver, env) = memory_env();
    driver.fail_next("SQLDriverConnectW", "08001", 10065, "Unable to connect to tdprod");
    let err = env.connect(&teradata_options()).unwrap_err();
    assert_eq!(err.sql_state(), Some("08001"));
    assert_eq!(driver.live_handles(), 1);
    assert_eq!(env.open_connections(), 0);
}

#[test]
fn missing_driver_name_is_reported_by_the_driver() {
    let (driver, env) = memory_env();
    let err = env.connect(&ConnectOptions::new("")).unwrap_err();
    assert_eq!(err.sql_state(), Some("IM002"));
    assert_eq!(driver.live_handles(), 1);
}

#[test]
fn failed_setup_closes_the_session() {
    let (driver, env) = memory_env();
    driver.fail_next("SQLExecDirectW", "HY000", 3523, "No access to session information");
    let err = env.connect(&teradata_options()).unwrap_err();
    assert_eq!(err.sql_state(), Some("HY000"));
    assert!(driver.calls_named("SQLDisconnect") >= 1);
    assert_eq!(driver.live_handles(), 1);
    assert_eq!(env.open_connections(), 0);
}

#[test]
fn closing_with_an_open_transaction_rolls_back_once() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Id INTEGER)");
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    cursor.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    assert_eq!(driver.table_rows("t").len(), 1);
    conn.close().unwrap();
    assert!(conn.is_closed());
    assert_eq!(driver.rollbacks(), 1);
    assert_eq!(driver.calls_named("SQLDisconnect"), 2);
    assert!(driver.table_rows("t").is_empty());
    assert_eq!(driver.live_handles(), 1);
}

#[test]
fn committed_work_survives_close() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Id INTEGER)");
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    cursor.execute("INSERT INTO t VALUES (?)", &odbcbridge::params![5]).unwrap();
    conn.commit().unwrap();
    conn.close().unwrap();
    assert_eq!(driver.rollbacks(), 0);
    assert_eq!(driver.table_rows("t"), vec![vec![Value::Integer(5)]]);
}

#[test]
fn rollback_discards_uncommitted_rows() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Id INTEGER)");
    driver.insert_row("t", vec![Value::Integer(1)]);
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    cursor.execute("DELETE FROM t", &[]).unwrap();
    assert_eq!(cursor.rowcount(), 1);
    conn.rollback().unwrap();
    assert_eq!(driver.table_rows("t").len(), 1);
}

#[test]
fn enabling_autocommit_commits_pending_work() {
    let (driver, env) = memory_env();
    driver.execute_sql("CREATE TABLE t (Id INTEGER)");
    let conn = connect(&env);
    conn.cursor().unwrap().execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    conn.set_autocommit(true).unwrap();
    assert!(conn.autocommit());
    conn.close().unwrap();
    assert_eq!(driver.rollbacks(), 0);
    assert_eq!(driver.table_rows("t").len(), 1);
}

#[test]
fn connection_not_open_on_close_is_ignored() {
    let (driver, env) = memory_env();
    let conn = connect(&env);
    driver.fail_next("SQLDisconnect", "08003", 0, "Connection not open");
    conn.close().unwrap();
    assert_eq!(driver.rollbacks(), 0);
}

#[test]
fn closing_twice_is_a_no_op() {
    let (driver, env) = memory_env();
    let conn = connect(&env);
    let _cursor = conn.cursor().unwrap();
    conn.close().unwrap();
    let frees = driver.calls_named("SQLFreeHandle");
    conn.close().unwrap();
    assert_eq!(driver.calls_named("SQLFreeHandle"), frees);
    let err = conn.cursor().unwrap_err();
    assert_eq!(err.interface_code(), Some("CONNECTION_CLOSED"));
    let err = conn.commit().unwrap_err();
    assert_eq!(err.interface_code(), Some("CONNECTION_CLOSED"));
}

#[test]
fn dropping_the_last_handle_closes_the_session() {
    let (driver, env) = memory_env();
    let conn = connect(&env);
    let mut cursor = conn.cursor().unwrap();
    let clone = conn.clone();
    drop(conn);
    assert!(!clone.is_closed());
    cursor.execute("SELECT 1", &[]).unwrap();
    drop(clone);
    // The cursor still holds the session open.
    assert_eq!(env.open_connections(), 1);
    drop(cursor);
    assert_eq!(env.open_connections(), 0);
    assert_eq!(driver.live_handles(), 1);
}

#[test]
fn shutdown_closes_remaining_sessions() {
    let (driver, env) = memory_env();
    let first = connect(&env);
    let second = env.connect(&plain_options().autocommit(true)).unwrap();
    assert_eq!(env.open_connections(), 2);
    env.shutdown().unwrap();
    assert!(first.is_closed());
    assert!(second.is_closed());
    assert_eq!(driver.live_handles(), 0);
    let err = env.connect(&plain_options()).unwrap_err();
    assert_eq!(err.interface_code(), Some("ENVIRONMENT_CLOSED"));
}
