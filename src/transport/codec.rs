//! Line codec for the query protocol
//!
//! Values are escaped with two-character backslash sequences, fields are
//! separated by spaces, rows by `|`, and lines end with `\n` (the server adds
//! a trailing `\r`). `QueryCodec` plugs the framing into `tokio_util::codec`.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{Command, Notification, Row, StatusLine, Value};
use crate::transport::{ParseError, QueryError};

/// Upper bound on a single server line
const DEFAULT_MAX_LINE: usize = 8 * 1024 * 1024;

/// A decoded control-stream line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Result rows for the command in flight
    Rows(Vec<Row>),
    /// Terminal `error id=.. msg=..` line
    Status(StatusLine),
    /// One notification per `|`-separated row, all sharing the line's name
    Notifications(Vec<Notification>),
}

/// Escape a value for the wire
///
/// The server has no sequence for `;`, so it is sent literally.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            ' ' => out.push_str("\\s"),
            '|' => out.push_str("\\p"),
            '\u{07}' => out.push_str("\\a"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0B}' => out.push_str("\\v"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse `escape` in a single left-to-right pass
pub fn unescape(value: &str) -> Result<String, ParseError> {
    if !value.contains('\\') {
        return Ok(value.to_string());
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let decoded = match chars.next() {
            Some('\\') => '\\',
            Some('/') => '/',
            Some('s') => ' ',
            Some('p') => '|',
            Some('a') => '\u{07}',
            Some('b') => '\u{08}',
            Some('f') => '\u{0C}',
            Some('n') => '\n',
            Some('r') => '\r',
            Some('t') => '\t',
            Some('v') => '\u{0B}',
            Some(other) => return Err(ParseError::InvalidEscape(other)),
            None => return Err(ParseError::DanglingEscape),
        };
        out.push(decoded);
    }
    Ok(out)
}

/// Encode a command into a single `\n`-terminated line
pub fn encode_command(command: &Command) -> String {
    let mut line = escape(command.name());

    for (key, value) in command.args() {
        let key = escape(key);
        match value {
            Value::Single(v) => {
                line.push(' ');
                line.push_str(&key);
                line.push('=');
                line.push_str(&escape(v));
            }
            Value::Many(values) if values.is_empty() => {}
            Value::Many(values) => {
                let blocks: Vec<String> = values
                    .iter()
                    .map(|v| format!("{}={}", key, escape(v)))
                    .collect();
                line.push(' ');
                line.push_str(&blocks.join("|"));
            }
        }
    }

    for option in command.options() {
        line.push_str(" -");
        line.push_str(&escape(option));
    }

    line.push('\n');
    line
}

/// Encode a row the way the server writes one (fields joined by spaces)
pub fn encode_row(row: &Row) -> String {
    row.iter()
        .map(|(key, value)| {
            if value.is_empty() {
                escape(key)
            } else {
                format!("{}={}", escape(key), escape(value))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode one row of space-separated tokens
pub fn decode_row(row: &str) -> Result<Row, ParseError> {
    let mut decoded = Row::new();
    for token in row.split(' ').filter(|t| !t.is_empty()) {
        match token.split_once('=') {
            Some(("", _)) => return Err(ParseError::EmptyKey(token.to_string())),
            Some((key, value)) => decoded.insert(unescape(key)?, unescape(value)?),
            None => decoded.insert(unescape(token)?, String::new()),
        }
    }
    Ok(decoded)
}

/// Decode a `|`-separated payload block into rows
pub fn decode_rows(payload: &str) -> Result<Vec<Row>, ParseError> {
    payload.split('|').map(decode_row).collect()
}

fn decode_status(fields: &str) -> Result<StatusLine, ParseError> {
    let row = decode_row(fields)?;
    Ok(StatusLine {
        id: row.require("id").map_err(ParseError::Status)?,
        msg: row.get("msg").unwrap_or_default().to_string(),
        extra_msg: row.get("extra_msg").map(str::to_string),
        failed_permid: row.parse("failed_permid").map_err(ParseError::Status)?,
    })
}

/// Decode a single line (already stripped of its terminator)
pub fn decode_line(line: &str) -> Result<Frame, ParseError> {
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));

    if head == "error" {
        return decode_status(rest).map(Frame::Status);
    }

    if head.starts_with("notify") && !head.contains('=') {
        let notifications = decode_rows(rest)?
            .into_iter()
            .map(|payload| Notification {
                name: head.to_string(),
                payload,
            })
            .collect();
        return Ok(Frame::Notifications(notifications));
    }

    decode_rows(line).map(Frame::Rows)
}

/// Line framing for the control stream
#[derive(Debug, Clone)]
pub struct QueryCodec {
    max_length: usize,
    next_index: usize,
}

impl QueryCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

impl Default for QueryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for QueryCodec {
    type Item = String;
    type Error = QueryError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, QueryError> {
        loop {
            let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') else {
                self.next_index = buf.len();
                if buf.len() > self.max_length {
                    return Err(ParseError::LineTooLong(self.max_length).into());
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let raw = buf.split_to(end + 1);
            let line = std::str::from_utf8(&raw[..end]).map_err(|_| ParseError::Utf8)?;
            let line = line.trim_matches('\r');
            if line.is_empty() {
                continue;
            }
            return Ok(Some(line.to_string()));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, QueryError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }

        let rest = String::from_utf8_lossy(buf)
            .trim_matches(|c| c == '\r' || c == '\n')
            .to_string();
        buf.clear();
        self.next_index = 0;

        if rest.is_empty() {
            Ok(None)
        } else {
            Err(ParseError::TrailingData(rest).into())
        }
    }
}

impl Encoder<&Command> for QueryCodec {
    type Error = QueryError;

    fn encode(&mut self, command: &Command, dst: &mut BytesMut) -> Result<(), QueryError> {
        let line = encode_command(command);
        dst.reserve(line.len());
        dst.put(line.as_bytes());
        Ok(())
    }
}
