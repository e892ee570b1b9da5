//! Client for the TeamSpeak 3 ServerQuery protocol.
//!
//! [`transport::Connection`] owns the control socket: it serializes commands
//! one at a time, routes notifications to subscribers, keeps the session alive
//! and optionally paces commands below the server's flood limits.
//! [`transfer::FileTransfer`] moves file payloads over the separate transfer
//! port, and [`query::QueryClient`] wraps a handful of common commands.

pub mod conf;
pub mod events;
pub mod protocol;
pub mod query;
pub mod transfer;
pub mod transport;

pub use events::{Event, EventClass, EventKind};
pub use protocol::{Command, QueryResponse, Row, StatusLine};
pub use query::{ClientError, QueryClient};
pub use transfer::{FileTransfer, TransferError, TransferSession};
pub use transport::{Connection, ConnectionState, QueryError, TransportConfig};
