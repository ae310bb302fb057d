//! Synchronous database access over an ODBC driver manager.
//!
//! ```no_run
//! use odbcbridge::{connect, params, ConnectOptions};
//!
//! # fn main() -> odbcbridge::Result<()> {
//! let conn = connect(&ConnectOptions::default().system("tdprod").username("dbc").password("dbc"))?;
//! let mut cursor = conn.cursor()?;
//! cursor.execute("SELECT * FROM t WHERE id = ?", &params![42])?;
//! for row in cursor.rows() {
//!     println!("{:?}", row?);
//! }
//! conn.close()?;
//! # Ok(())
//! # }
//! ```

pub mod attr;
pub mod config;
pub mod connect;
pub mod cursor;
pub mod datatypes;
pub mod diagnostics;
pub mod error;
pub mod fetch;
pub mod handle;
pub mod library;
pub mod native;
pub mod params;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use config::ConnectOptions;
pub use connect::Connection;
pub use cursor::{Cursor, Rows};
pub use datatypes::{DefaultConverter, TypeCode, TypeConverter, Value};
pub use diagnostics::DiagRecord;
pub use error::{Error, Result};
pub use fetch::{ColumnDesc, Row};
pub use handle::Environment;
pub use native::NativeApi;
pub use params::{OutParams, Param};

/// Connect through the process-wide environment, loading the driver manager
/// named by `options.odbc_lib_path` (or the platform default) on first use.
pub fn connect(options: &ConnectOptions) -> Result<Connection> {
    Environment::shared(options.odbc_lib_path.as_deref())?.connect(options)
}
