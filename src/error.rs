use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Misuse of the binding layer itself: bad handles, unknown return codes,
    /// parameter mismatches, closed objects.
    #[error("{code}: {message}")]
    Interface { code: String, message: String },

    /// Failure reported by the driver or the server.
    #[error("{message} (native error {code})")]
    Database {
        code: i32,
        message: String,
        sql_state: String,
    },
}

impl Error {
    pub fn interface(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Interface {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The SQLSTATE of a database error.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Database { sql_state, .. } => Some(sql_state),
            Error::Interface { .. } => None,
        }
    }

    /// The interface error code (e.g. `PARAMS_MISMATCH`).
    pub fn interface_code(&self) -> Option<&str> {
        match self {
            Error::Interface { code, .. } => Some(code),
            Error::Database { .. } => None,
        }
    }

    pub fn is_interface(&self) -> bool {
        matches!(self, Error::Interface { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_error_exposes_state() {
        let e = Error::Database {
            code: 3807,
            message: "[42S02] Object 'x' does not exist.".into(),
            sql_state: "42S02".into(),
        };
        assert_eq!(e.sql_state(), Some("42S02"));
        assert!(!e.is_interface());
        assert_eq!(
            e.to_string(),
            "[42S02] Object 'x' does not exist. (native error 3807)"
        );
    }

    #[test]
    fn interface_error_display() {
        let e = Error::interface("PARAMS_MISMATCH", "expected 3, got 2");
        assert_eq!(e.interface_code(), Some("PARAMS_MISMATCH"));
        assert_eq!(e.sql_state(), None);
        assert_eq!(e.to_string(), "PARAMS_MISMATCH: expected 3, got 2");
    }
}
