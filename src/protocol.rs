//! Query protocol data model
//!
//! Commands written to the server, and the rows, status lines and
//! notifications read back from it. Wire encoding lives in
//! `transport::codec`; these types only hold decoded values.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Status id the server reports for list commands that matched nothing
pub const EMPTY_RESULT_SET: u32 = 1281;

/// Value of a single command argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Single(String),
    /// Encoded as one `key=value` block per element, joined by `|`
    Many(Vec<String>),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Single(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Single(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Single(v.clone())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Single(if v { "1" } else { "0" }.to_string())
    }
}

macro_rules! value_from_number {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Single(v.to_string())
                }
            }
        )*
    };
}

value_from_number!(u8, u16, u32, u64, usize, i8, i16, i32, i64);

impl<T: ToString> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Many(values.iter().map(ToString::to_string).collect())
    }
}

impl<T: ToString> From<&[T]> for Value {
    fn from(values: &[T]) -> Self {
        Value::Many(values.iter().map(ToString::to_string).collect())
    }
}

/// A command as submitted to the server
///
/// Built once and never mutated after submission. Arguments keep their
/// insertion order on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<(String, Value)>,
    options: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            options: Vec::new(),
        }
    }

    /// Append a `key=value` argument
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push((key.into(), value.into()));
        self
    }

    /// Append an argument only when it is set; `None` is omitted from the wire
    pub fn arg_opt<V: Into<Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.arg(key, value),
            None => self,
        }
    }

    /// Append a bare option such as `-uid`; the leading dash is optional
    pub fn flag(mut self, option: impl Into<String>) -> Self {
        let option = option.into();
        let option = option.trim_start_matches('-').to_string();
        self.options.push(option);
        self
    }

    /// Append an option only when `enabled` is true
    pub fn flag_if(self, option: impl Into<String>, enabled: bool) -> Self {
        if enabled { self.flag(option) } else { self }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[(String, Value)] {
        &self.args
    }

    /// Option words without their leading dash
    pub fn options(&self) -> &[String] {
        &self.options
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Field lookup failure on a decoded row
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("missing field `{0}`")]
    Missing(String),
    #[error("invalid value `{value}` for field `{key}`")]
    Invalid { key: String, value: String },
}

/// One decoded row: field name to raw (unescaped) string value
///
/// Bare flags decode to a key with an empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, String>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Parse an optional field; an absent field is `Ok(None)`
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, FieldError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| FieldError::Invalid {
                key: key.to_string(),
                value: value.clone(),
            }),
        }
    }

    /// Parse a field that must be present
    pub fn require<T: FromStr>(&self, key: &str) -> Result<T, FieldError> {
        self.parse(key)?
            .ok_or_else(|| FieldError::Missing(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Row(iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect())
    }
}

/// Decoded rows of a command response
pub type ResultRecord = Vec<Row>;

/// Terminal line of every command response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusLine {
    pub id: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_permid: Option<u32>,
}

impl StatusLine {
    pub fn ok() -> Self {
        Self {
            id: 0,
            msg: "ok".to_string(),
            extra_msg: None,
            failed_permid: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.id == 0
    }

    pub fn is_empty_result(&self) -> bool {
        self.id == EMPTY_RESULT_SET
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id {})", self.msg, self.id)?;
        if let Some(extra) = &self.extra_msg {
            write!(f, ": {}", extra)?;
        }
        if let Some(permid) = self.failed_permid {
            write!(f, " [failed_permid={}]", permid)?;
        }
        Ok(())
    }
}

/// Unsolicited server-pushed line, routed by name only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub name: String,
    pub payload: Row,
}

/// Successful command completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResponse {
    pub rows: ResultRecord,
    pub status: StatusLine,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder_keeps_order_and_omits_unset() {
        let command = Command::new("clientlist")
            .arg("cid", 5u32)
            .arg_opt("cpw", None::<&str>)
            .arg("clid", vec![1, 2])
            .flag("-uid")
            .flag("away")
            .flag_if("voice", false);

        assert_eq!(command.name(), "clientlist");
        assert_eq!(command.args().len(), 2);
        assert_eq!(command.args()[0].0, "cid");
        assert_eq!(
            command.args()[1].1,
            Value::Many(vec!["1".to_string(), "2".to_string()])
        );
        assert_eq!(command.options(), &["uid".to_string(), "away".to_string()]);
    }

    #[test]
    fn test_bool_value_encodes_as_digit() {
        assert_eq!(Value::from(true), Value::Single("1".to_string()));
        assert_eq!(Value::from(false), Value::Single("0".to_string()));
    }

    #[test]
    fn test_row_field_access() {
        let row: Row = [("clid", "7"), ("client_nickname", "bob"), ("bad", "x")]
            .into_iter()
            .collect();

        assert_eq!(row.require::<u32>("clid"), Ok(7));
        assert_eq!(row.parse::<u32>("missing"), Ok(None));
        assert_eq!(
            row.require::<u32>("missing"),
            Err(FieldError::Missing("missing".to_string()))
        );
        assert!(matches!(
            row.require::<u32>("bad"),
            Err(FieldError::Invalid { .. })
        ));
        assert_eq!(row.get("client_nickname"), Some("bob"));
        assert!(row.contains_key("clid"));
        assert!(!row.contains_key("missing"));
    }

    #[test]
    fn test_bare_flag_is_present_with_empty_value() {
        let row: Row = [("clid", "7"), ("client_away", "")].into_iter().collect();
        assert!(row.contains_key("client_away"));
        assert_eq!(row.get("client_away"), Some(""));
        assert!(!row.contains_key("client_input_muted"));
    }

    #[test]
    fn test_status_line_display() {
        let status = StatusLine {
            id: 2568,
            msg: "insufficient client permissions".to_string(),
            extra_msg: None,
            failed_permid: Some(4),
        };
        assert!(!status.is_ok());
        assert_eq!(
            status.to_string(),
            "insufficient client permissions (id 2568) [failed_permid=4]"
        );
    }
}
