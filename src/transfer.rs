//! File transfer channel
//!
//! Every transfer runs over its own short-lived TCP connection. The client
//! writes the session key, then either streams the payload (upload) or reads it
//! back (download). There is no framing beyond the byte count negotiated on the
//! control connection, so size checks happen here.

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// A reserved transfer slot; consumed by exactly one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub key: String,
    /// Byte count declared when the slot was reserved
    pub size: Option<u64>,
    /// Port announced by the server, if it differs from the default
    pub port: Option<u16>,
}

impl TransferSession {
    pub fn new(key: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            key: key.into(),
            size,
            port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("transfer I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("declared {declared} bytes but {actual} were provided")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("connection closed after {received} of {expected} bytes")]
    ShortRead { expected: u64, received: u64 },
    #[error("upload requires a declared size")]
    MissingSize,
    #[error("could not connect within {0:?}")]
    Timeout(Duration),
}

/// Opens transfer connections against one server host
#[derive(Debug, Clone)]
pub struct FileTransfer {
    host: String,
    default_port: u16,
    connect_timeout: Duration,
}

impl FileTransfer {
    pub fn new(host: impl Into<String>, default_port: u16) -> Self {
        Self {
            host: host.into(),
            default_port,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upload an in-memory payload; its length must match the declared size
    pub async fn upload(&self, session: TransferSession, data: &[u8]) -> Result<u64, TransferError> {
        let declared = session.size.ok_or(TransferError::MissingSize)?;
        let actual = data.len() as u64;
        if actual != declared {
            return Err(TransferError::SizeMismatch { declared, actual });
        }
        self.upload_from(session, data).await
    }

    /// Stream exactly the declared number of bytes from `reader`.
    ///
    /// A source that runs dry early fails with `SizeMismatch`; extra bytes in
    /// the source are left unread.
    pub async fn upload_from<R>(&self, session: TransferSession, reader: R) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let declared = session.size.ok_or(TransferError::MissingSize)?;
        let mut stream = self.open(&session).await?;

        let copied = tokio::io::copy(&mut reader.take(declared), &mut stream).await?;
        if copied != declared {
            log::warn!("upload source ended after {} of {} bytes", copied, declared);
            return Err(TransferError::SizeMismatch {
                declared,
                actual: copied,
            });
        }

        stream.flush().await?;
        stream.shutdown().await?;
        // The server closes its side once it has the whole payload
        let mut trailing = Vec::new();
        stream.read_to_end(&mut trailing).await?;
        if !trailing.is_empty() {
            log::debug!("ignoring {} bytes sent by server after upload", trailing.len());
        }

        log::info!("uploaded {} bytes", copied);
        Ok(copied)
    }

    /// Download the payload into memory
    pub async fn download(&self, session: TransferSession) -> Result<Vec<u8>, TransferError> {
        let mut data = Vec::with_capacity(session.size.unwrap_or(0).min(16 * 1024 * 1024) as usize);
        self.download_to(session, &mut data).await?;
        Ok(data)
    }

    /// Stream the payload into `writer`; reads to EOF when no size was declared
    pub async fn download_to<W>(&self, session: TransferSession, mut writer: W) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let expected = session.size;
        let mut stream = self.open(&session).await?;

        let received = match expected {
            Some(expected) => {
                let received = tokio::io::copy(&mut (&mut stream).take(expected), &mut writer).await?;
                if received < expected {
                    return Err(TransferError::ShortRead { expected, received });
                }
                received
            }
            None => tokio::io::copy(&mut stream, &mut writer).await?,
        };
        writer.flush().await?;

        log::info!("downloaded {} bytes", received);
        Ok(received)
    }

    async fn open(&self, session: &TransferSession) -> Result<TcpStream, TransferError> {
        let port = session.port.unwrap_or(self.default_port);
        log::debug!("opening transfer connection to {}:{}", self.host, port);

        let mut stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), port)),
        )
        .await
        .map_err(|_| TransferError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;

        stream.write_all(session.key.as_bytes()).await?;
        Ok(stream)
    }
}
