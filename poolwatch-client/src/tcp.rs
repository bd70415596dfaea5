//! TCP connector speaking newline-delimited JSON.
//!
//! Each stream uses its own connection. After connecting, the client writes
//! one [`StreamRequest`] line; the core then pushes one JSON document per
//! line until it closes the connection.
//!
//! ```text
//! client -> {"stream":"status","interval_ms":1000}
//! core   -> {"total_task":10,"total_result":8,"threads":[...]}
//! core   -> {"total_task":12,"total_result":11,"threads":[...]}
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use poolwatch_types::{EventBatch, RawStatusSample};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{
    ClientError, CoreConnector, CoreStreams, ReceiveStream, StreamError, TransportCredentials,
};

/// Server name verified against the core's certificate.
pub const TLS_SERVER_NAME: &str = "localhost";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest line accepted from a core.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// First line sent on every stream connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct StreamRequest {
    /// `"status"` or `"events"`.
    pub stream: String,
    /// Push interval requested from the core.
    pub interval_ms: u64,
}

impl StreamRequest {
    pub fn status(interval: Duration) -> Self {
        Self {
            stream: "status".to_string(),
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn events(interval: Duration) -> Self {
        Self {
            stream: "events".to_string(),
            interval_ms: interval.as_millis() as u64,
        }
    }
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Connector for cores reachable over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    max_line_bytes: usize,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    /// Set how long a single dial may take (default: 10 seconds).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// A line longer than this ends the stream with a decode error.
    pub fn max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    async fn dial(
        &self,
        address: &str,
        credentials: &TransportCredentials,
    ) -> Result<Box<dyn Io>, ClientError> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Connection(format!("{}: {}", address, e)))?;

        match credentials {
            TransportCredentials::Insecure => Ok(Box::new(tcp)),
            TransportCredentials::Tls { ca_path } => {
                let connector = tls_connector(ca_path).await?;
                let domain = ServerName::try_from(TLS_SERVER_NAME)
                    .map_err(|e| ClientError::Tls(e.to_string()))?;
                let tls = connector
                    .connect(domain, tcp)
                    .await
                    .map_err(|e| ClientError::Tls(format!("{}: {}", address, e)))?;
                Ok(Box::new(tls))
            }
        }
    }

    async fn open_stream(
        &self,
        address: &str,
        credentials: &TransportCredentials,
        request: &StreamRequest,
    ) -> Result<BufReader<Box<dyn Io>>, ClientError> {
        let mut io = self.dial(address, credentials).await?;

        let mut line =
            serde_json::to_string(request).map_err(|e| ClientError::Request(e.to_string()))?;
        line.push('\n');
        io.write_all(line.as_bytes())
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        io.flush()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;

        Ok(BufReader::new(io))
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoreConnector for TcpConnector {
    async fn open(
        &self,
        address: &str,
        credentials: &TransportCredentials,
        interval: Duration,
    ) -> Result<CoreStreams, ClientError> {
        let status = self
            .open_stream(address, credentials, &StreamRequest::status(interval))
            .await?;
        let events = self
            .open_stream(address, credentials, &StreamRequest::events(interval))
            .await?;

        tracing::debug!(address, tls = credentials.is_tls(), "Opened core streams");

        Ok(CoreStreams {
            status: Box::new(LineStream::new(status, self.max_line_bytes, decode_status)),
            events: Box::new(LineStream::new(events, self.max_line_bytes, decode_events)),
        })
    }
}

/// Build a TLS connector trusting the PEM certificates at `ca_path`.
async fn tls_connector(ca_path: &Path) -> Result<TlsConnector, ClientError> {
    let pem = tokio::fs::read(ca_path)
        .await
        .map_err(|e| ClientError::Credentials(format!("{}: {}", ca_path.display(), e)))?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| ClientError::Credentials(e.to_string()))?;
        roots
            .add(cert)
            .map_err(|e| ClientError::Credentials(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(ClientError::Credentials(format!(
            "{}: no certificates found",
            ca_path.display()
        )));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

fn decode_status(line: &str) -> Result<RawStatusSample, StreamError> {
    serde_json::from_str(line).map_err(|e| StreamError::Decode(e.to_string()))
}

fn decode_events(line: &str) -> Result<EventBatch, StreamError> {
    match serde_json::from_str::<Option<EventBatch>>(line) {
        Ok(Some(batch)) => Ok(batch),
        Ok(None) => Ok(EventBatch::default()),
        Err(e) => {
            tracing::debug!(error = %e, "Undecodable event batch, substituting empty batch");
            Ok(EventBatch::default())
        }
    }
}

/// Reads one JSON document per line from a stream connection.
struct LineStream<T> {
    reader: BufReader<Box<dyn Io>>,
    line: String,
    limit: u64,
    decode: fn(&str) -> Result<T, StreamError>,
}

impl<T> LineStream<T> {
    fn new(
        reader: BufReader<Box<dyn Io>>,
        max_line_bytes: usize,
        decode: fn(&str) -> Result<T, StreamError>,
    ) -> Self {
        Self {
            reader,
            line: String::new(),
            limit: max_line_bytes as u64,
            decode,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> ReceiveStream<T> for LineStream<T> {
    async fn receive(&mut self) -> Result<T, StreamError> {
        loop {
            self.line.clear();
            let read = (&mut self.reader)
                .take(self.limit)
                .read_line(&mut self.line)
                .await?;
            if read == 0 {
                return Err(StreamError::Closed);
            }
            if read as u64 >= self.limit && !self.line.ends_with('\n') {
                return Err(StreamError::Decode(format!(
                    "line exceeds {} bytes",
                    self.limit
                )));
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            return (self.decode)(line);
        }
    }
}
