use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;

/// Database variant that gets the session setup (session number, query bands).
pub const PRIMARY_DB_TYPE: &str = "Teradata";

static PASSWORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)PWD=(?:\{(?:[^}]|\}\})*\}|[^;]*)(?:;|$)").expect("static regex")
});

/// Options for opening a connection.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// ODBC driver name; also selects the database variant.
    pub db_type: String,
    pub system: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub autocommit: bool,
    /// `TERA`, `ANSI` or `DEFAULT`.
    pub transaction_mode: Option<String>,
    pub query_bands: BTreeMap<String, String>,
    pub odbc_lib_path: Option<String>,
    /// Additional connection string pairs in insertion order. A key that
    /// matches a built-in pair replaces its value.
    #[serde(deserialize_with = "ordered_pairs")]
    pub params: Vec<(String, String)>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            db_type: PRIMARY_DB_TYPE.to_string(),
            system: None,
            username: None,
            password: None,
            autocommit: false,
            transaction_mode: None,
            query_bands: BTreeMap::new(),
            odbc_lib_path: None,
            params: Vec::new(),
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("db_type", &self.db_type)
            .field("system", &self.system)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "XXX"))
            .field("autocommit", &self.autocommit)
            .field("transaction_mode", &self.transaction_mode)
            .field("query_bands", &self.query_bands)
            .field("odbc_lib_path", &self.odbc_lib_path)
            .field("params", &self.params)
            .finish()
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new(db_type: impl Into<String>) -> Self {
        ConnectOptions {
            db_type: db_type.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    #[must_use]
    pub fn transaction_mode(mut self, mode: impl Into<String>) -> Self {
        self.transaction_mode = Some(mode.into());
        self
    }

    #[must_use]
    pub fn query_band(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_bands.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn odbc_lib_path(mut self, path: impl Into<String>) -> Self {
        self.odbc_lib_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_param(key.into(), value.into());
        self
    }

    fn set_param(&mut self, key: String, value: String) {
        match self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(existing) => existing.1 = value,
            None => self.params.push((key, value)),
        }
    }

    /// Build options from plain key/value configuration pairs.
    ///
    /// Keys are case-insensitive. `queryband.<name>` adds a query band; keys
    /// that are not recognized become extra connection string pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut options = ConnectOptions::default();
        for (key, value) in pairs {
            let key = key.as_ref();
            let value = value.into();
            let lower = key.to_ascii_lowercase();
            match lower.as_str() {
                "dbtype" | "db_type" | "driver" => options.db_type = value,
                "system" | "dbcname" => options.system = Some(value),
                "username" | "user" | "uid" => options.username = Some(value),
                "password" | "pwd" => options.password = Some(value),
                "autocommit" => options.autocommit = parse_bool(key, &value)?,
                "transactionmode" | "transaction_mode" | "sessionmode" => {
                    options.transaction_mode = Some(value)
                }
                "odbclibpath" | "odbc_lib_path" => options.odbc_lib_path = Some(value),
                _ => {
                    if let Some(band) = lower.strip_prefix("queryband.") {
                        let band = &key[key.len() - band.len()..];
                        options.query_bands.insert(band.to_string(), value);
                    } else {
                        options.set_param(key.to_string(), value);
                    }
                }
            }
        }
        Ok(options)
    }

    /// Driver connection string, `;`-joined. Values containing `;`, `{` or
    /// `}` are wrapped in braces.
    pub fn connection_string(&self) -> String {
        let mut pairs: Vec<(String, String)> = vec![("DRIVER".into(), self.db_type.clone())];
        if let Some(system) = &self.system {
            pairs.push(("DBCNAME".into(), system.clone()));
        }
        if let Some(username) = &self.username {
            pairs.push(("UID".into(), username.clone()));
        }
        if let Some(password) = &self.password {
            pairs.push(("PWD".into(), password.clone()));
        }
        if let Some(mode) = &self.transaction_mode {
            let mode = if mode == "TERA" { "Teradata" } else { mode.as_str() };
            pairs.push(("SESSIONMODE".into(), mode.to_string()));
        }
        for (key, value) in &self.params {
            match pairs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
                Some(existing) => existing.1 = value.clone(),
                None => pairs.push((key.clone(), value.clone())),
            }
        }
        pairs
            .iter()
            .map(|(k, v)| format!("{k}={}", quote_value(v)))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Query bands in `k=v;k=v;` form.
    pub fn query_band_string(&self) -> Option<String> {
        if self.query_bands.is_empty() {
            return None;
        }
        Some(
            self.query_bands
                .iter()
                .map(|(k, v)| format!("{k}={v};"))
                .collect(),
        )
    }
}

/// Replace the password value of a connection string with `XXX`.
pub fn redact_password(conn_str: &str) -> String {
    PASSWORD_PATTERN.replace_all(conn_str, "PWD=XXX;").into_owned()
}

fn quote_value(value: &str) -> String {
    if value.contains([';', '{', '}']) {
        format!("{{{}}}", value.replace('}', "}}"))
    } else {
        value.to_string()
    }
}

fn ordered_pairs<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PairsVisitor;

    impl<'de> Visitor<'de> for PairsVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of connection string pairs")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut pairs: Vec<(String, String)> = Vec::new();
            while let Some((key, value)) = map.next_entry::<String, String>()? {
                match pairs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
                    Some(existing) => existing.1 = value,
                    None => pairs.push((key, value)),
                }
            }
            Ok(pairs)
        }
    }

    deserializer.deserialize_map(PairsVisitor)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::interface(
            "INVALID_CONFIG",
            format!("{key} must be a boolean, got {value:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_order() {
        let opts = ConnectOptions::new("Teradata")
            .system("tdprod")
            .username("dbc")
            .password("secret")
            .transaction_mode("TERA")
            .param("CHARSET", "UTF8");
        assert_eq!(
            opts.connection_string(),
            "DRIVER=Teradata;DBCNAME=tdprod;UID=dbc;PWD=secret;SESSIONMODE=Teradata;CHARSET=UTF8"
        );
    }

    #[test]
    fn password_is_redacted() {
        assert_eq!(
            redact_password("DRIVER=x;UID=u;PWD=hunter2;CHARSET=UTF8"),
            "DRIVER=x;UID=u;PWD=XXX;CHARSET=UTF8"
        );
        assert_eq!(redact_password("DRIVER=x;PWD=hunter2"), "DRIVER=x;PWD=XXX;");
        let opts = ConnectOptions::default().password("hunter2");
        assert!(!format!("{opts:?}").contains("hunter2"));
    }

    #[test]
    fn separators_in_values_are_braced_and_redacted() {
        let opts = ConnectOptions::new("Teradata").username("u").password("ab;cd");
        let conn_str = opts.connection_string();
        assert_eq!(conn_str, "DRIVER=Teradata;UID=u;PWD={ab;cd}");
        assert_eq!(redact_password(&conn_str), "DRIVER=Teradata;UID=u;PWD=XXX;");

        let opts = ConnectOptions::new("Teradata").password("x}y").param("CHARSET", "UTF8");
        let conn_str = opts.connection_string();
        assert_eq!(conn_str, "DRIVER=Teradata;PWD={x}}y};CHARSET=UTF8");
        let logged = redact_password(&conn_str);
        assert_eq!(logged, "DRIVER=Teradata;PWD=XXX;CHARSET=UTF8");
        assert!(!logged.contains('y'));
    }

    #[test]
    fn extra_pairs_keep_order_and_override_built_ins() {
        let opts = ConnectOptions::new("Teradata")
            .system("tdprod")
            .param("TMODE", "ANSI")
            .param("CHARSET", "UTF8")
            .param("dbcname", "tdtest")
            .param("TMODE", "TERA");
        assert_eq!(
            opts.connection_string(),
            "DRIVER=Teradata;DBCNAME=tdtest;TMODE=TERA;CHARSET=UTF8"
        );
    }

    #[test]
    fn from_pairs_recognizes_keys() {
        let opts = ConnectOptions::from_pairs([
            ("System", "tdprod"),
            ("UID", "dbc"),
            ("autoCommit", "yes"),
            ("queryBand.ApplicationName", "etl"),
            ("CHARSET", "UTF8"),
        ])
        .unwrap();
        assert_eq!(opts.system.as_deref(), Some("tdprod"));
        assert_eq!(opts.username.as_deref(), Some("dbc"));
        assert!(opts.autocommit);
        assert_eq!(opts.query_band_string().as_deref(), Some("ApplicationName=etl;"));
        assert_eq!(opts.params, vec![("CHARSET".to_string(), "UTF8".to_string())]);
    }

    #[test]
    fn from_pairs_rejects_bad_boolean() {
        let err = ConnectOptions::from_pairs([("autocommit", "maybe")]).unwrap_err();
        assert_eq!(err.interface_code(), Some("INVALID_CONFIG"));
    }

    #[test]
    fn deserializes_with_defaults() {
        let opts: ConnectOptions = serde_json::from_str(
            r#"{"system":"tdprod","query_bands":{"org":"x"},"params":{"TMODE":"ANSI","CHARSET":"UTF8"}}"#,
        )
        .unwrap();
        assert_eq!(opts.db_type, PRIMARY_DB_TYPE);
        assert_eq!(
            opts.connection_string(),
            "DRIVER=Teradata;DBCNAME=tdprod;TMODE=ANSI;CHARSET=UTF8"
        );
        assert!(!opts.autocommit);
        assert_eq!(opts.query_band_string().as_deref(), Some("org=x;"));
    }
}
