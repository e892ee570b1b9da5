//! Transport layer for the query connection
//!
//! This module owns everything between a caller's `Command` and the socket:
//! - `codec`: escaping, line framing and record splitting
//! - `queue`: FIFO of pending commands with a single in-flight slot
//! - `router`: result-vs-notification classification and subscriber dispatch
//! - `antispam`: pacing gate in front of the queue
//! - `connection`: socket lifecycle, keepalive and the driver task

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{FieldError, StatusLine};

mod antispam;
mod codec;
mod connection;
mod queue;
mod router;

pub use codec::{
    Frame, QueryCodec, decode_line, decode_row, decode_rows, encode_command, encode_row, escape,
    unescape,
};
pub use connection::{CloseReason, CommandHandle, Connection, ConnectionState};
pub use router::{HandlerError, SubscriptionId};

/// Default ServerQuery raw TCP port
pub const DEFAULT_QUERY_PORT: u16 = 10011;

/// Default file transfer port
pub const DEFAULT_TRANSFER_PORT: u16 = 30033;

/// Malformed data on the control stream; stream alignment is lost
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected greeting: {0:?}")]
    Greeting(String),
    #[error("invalid escape sequence `\\{0}`")]
    InvalidEscape(char),
    #[error("dangling escape character at end of value")]
    DanglingEscape,
    #[error("empty field name in token {0:?}")]
    EmptyKey(String),
    #[error("malformed status line: {0}")]
    Status(#[source] FieldError),
    #[error("line is not valid UTF-8")]
    Utf8,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("unterminated data at end of stream: {0:?}")]
    TrailingData(String),
    #[error("{0} received while no command was in flight")]
    Unsolicited(&'static str),
}

/// Errors surfaced by the query transport
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("protocol error: {0}")]
    Parse(#[from] ParseError),
    #[error("command failed: {0}")]
    Command(StatusLine),
    #[error("command `{command}` timed out after {elapsed:?}")]
    Timeout { command: String, elapsed: Duration },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("socket I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for QueryError {
    fn from(e: std::io::Error) -> Self {
        QueryError::Io(Arc::new(e))
    }
}

impl QueryError {
    /// Status line carried by a server-side command failure
    pub fn status(&self) -> Option<&StatusLine> {
        match self {
            QueryError::Command(status) => Some(status),
            _ => None,
        }
    }

    /// Whether the error ends the connection rather than a single command
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueryError::Parse(_) | QueryError::ConnectionClosed | QueryError::Io(_)
        )
    }
}

/// Timers and pacing consumed by the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Idle period after which a keepalive command is sent; `None` disables it
    pub keepalive: Option<Duration>,
    /// Minimum spacing between released commands; `None` disables the gate
    pub antispam: Option<Duration>,
    /// Budget for a command to receive its status line; `None` waits forever
    pub command_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Command sent by the keepalive timer
    pub keepalive_command: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(240)),
            antispam: None,
            command_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            keepalive_command: "version".to_string(),
        }
    }
}
