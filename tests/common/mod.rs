//! Shared fixtures for the integration tests.
//!
//! Every test gets its own in-memory driver and environment, so tests can
//! run in parallel without sharing tables or session numbers.

#![allow(dead_code)]

use odbcbridge::mock::MemoryDriver;
use odbcbridge::{ConnectOptions, Connection, Environment};
use std::sync::Arc;

pub fn memory_env() -> (Arc<MemoryDriver>, Environment) {
    let driver = Arc::new(MemoryDriver::new());
    let env = Environment::new(driver.clone()).expect("environment");
    (driver, env)
}

/// Options for a plain (non-Teradata) session with no setup statements.
pub fn plain_options() -> ConnectOptions {
    ConnectOptions::new("Memory")
        .system("local")
        .username("dbc")
        .password("dbc")
}

pub fn teradata_options() -> ConnectOptions {
    ConnectOptions::new("Teradata")
        .system("tdprod")
        .username("dbc")
        .password("secret")
}

pub fn connect(env: &Environment) -> Connection {
    env.connect(&plain_options()).expect("connect")
}
