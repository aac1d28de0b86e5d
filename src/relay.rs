//! Backend relay.
//!
//! Bridges one inbound request to one outbound socket exchange:
//! connect, send the fixed request, read until the peer closes, escape.
//!
//! The backend protocol has no framing; "connection closed" means
//! "response complete". A backend that closes early cannot be told apart
//! from one that finished, so the outcome records how the stream ended
//! and anything other than a clean close is logged.

use crate::config::RelayConfig;
use crate::escape::escape_html;
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// The single command line followed by the `.` sentinel line.
pub const REQUEST_PAYLOAD: &[u8] = b"text request\n.\n";

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Parameters of one backend exchange.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Idle timeout per read; `None` waits for the peer to close.
    pub read_timeout: Option<Duration>,
    pub max_response_bytes: usize,
}

impl RelayRequest {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            max_response_bytes: config.max_response_bytes,
        }
    }
}

/// How the response stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Peer closed its side.
    Closed,
    /// Read or write failed; whatever was read so far is kept.
    Io(io::ErrorKind),
    /// No data arrived within the read timeout.
    TimedOut,
    /// Response ran past the size cap and was cut there.
    LimitReached,
}

/// A completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    /// Escaped text, ready to embed in the page.
    pub body: String,
    /// Raw bytes received before the stream ended.
    pub bytes_read: usize,
    pub end: StreamEnd,
}

/// Backend could not be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectError {
    pub code: i32,
    pub message: String,
}

impl ConnectError {
    /// Split an I/O error into errno and the bare description.
    pub fn from_io(err: &io::Error) -> Self {
        let code = err.raw_os_error().unwrap_or(0);
        let text = err.to_string();
        let message = match text.rfind(" (os error ") {
            Some(pos) => text[..pos].to_string(),
            None => text,
        };
        Self { code, message }
    }

    pub fn timed_out() -> Self {
        Self {
            code: libc::ETIMEDOUT,
            message: "Connection timed out".to_string(),
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for ConnectError {}

/// Result of `Relay::fetch_text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Text(RelayResponse),
    ConnectFailed(ConnectError),
}

impl RelayOutcome {
    /// Body served to HTTP callers: the escaped text, or the error line.
    pub fn into_body(self) -> String {
        match self {
            RelayOutcome::Text(response) => response.body,
            RelayOutcome::ConnectFailed(err) => format!("{err}\n"),
        }
    }
}

/// Relay to a fixed backend
#[derive(Debug, Clone)]
pub struct Relay {
    request: RelayRequest,
}

impl Relay {
    pub fn new(request: RelayRequest) -> Self {
        Relay { request }
    }

    pub fn request(&self) -> &RelayRequest {
        &self.request
    }

    /// Run one exchange with the backend.
    pub async fn fetch_text(&self) -> RelayOutcome {
        let mut stream = match self.connect().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    host = %self.request.host,
                    port = self.request.port,
                    code = err.code,
                    message = %err.message,
                    "Backend connect failed"
                );
                return RelayOutcome::ConnectFailed(err);
            }
        };

        let (raw, end) = self.exchange(&mut stream).await;
        // Connection closes here on every path.
        drop(stream);

        if end != StreamEnd::Closed {
            warn!(?end, bytes = raw.len(), "Backend response may be truncated");
        } else {
            debug!(bytes = raw.len(), "Backend response complete");
        }

        let text = String::from_utf8_lossy(&raw);
        RelayOutcome::Text(RelayResponse {
            body: escape_html(&text).into_owned(),
            bytes_read: raw.len(),
            end,
        })
    }

    async fn connect(&self) -> Result<TcpStream, ConnectError> {
        let target = (self.request.host.as_str(), self.request.port);
        match tokio::time::timeout(self.request.connect_timeout, TcpStream::connect(target)).await
        {
            Ok(Ok(stream)) => {
                trace!(peer = ?stream.peer_addr().ok(), "Connected to backend");
                Ok(stream)
            }
            Ok(Err(e)) => Err(ConnectError::from_io(&e)),
            Err(_) => Err(ConnectError::timed_out()),
        }
    }

    /// Send the request and accumulate everything until the stream ends.
    async fn exchange(&self, stream: &mut TcpStream) -> (BytesMut, StreamEnd) {
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

        if let Err(e) = stream.write_all(REQUEST_PAYLOAD).await {
            return (buffer, StreamEnd::Io(e.kind()));
        }

        loop {
            // A response of exactly the cap is complete only if the next read hits EOF.
            if buffer.len() > self.request.max_response_bytes {
                buffer.truncate(self.request.max_response_bytes);
                return (buffer, StreamEnd::LimitReached);
            }
            buffer.reserve(BUFFER_SIZE);

            let read = match self.request.read_timeout {
                Some(limit) => match tokio::time::timeout(limit, stream.read_buf(&mut buffer)).await
                {
                    Ok(read) => read,
                    Err(_) => return (buffer, StreamEnd::TimedOut),
                },
                None => stream.read_buf(&mut buffer).await,
            };

            match read {
                Ok(0) => return (buffer, StreamEnd::Closed),
                Ok(n) => trace!(n, "Read from backend"),
                Err(e) => return (buffer, StreamEnd::Io(e.kind())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn request(port: u16) -> RelayRequest {
        RelayRequest {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(2),
            read_timeout: None,
            max_response_bytes: 1024 * 1024,
        }
    }

    /// Accept one connection, read the request, reply, then hold the
    /// socket open for `linger` before closing.
    async fn one_shot_backend(
        reply: &'static [u8],
        linger: Duration,
    ) -> (u16, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 64];
            while !received.ends_with(b"\n.\n") {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..n]);
            }
            stream.write_all(reply).await.unwrap();
            tokio::time::sleep(linger).await;
            received
        });

        (port, handle)
    }

    fn expect_text(outcome: RelayOutcome) -> RelayResponse {
        match outcome {
            RelayOutcome::Text(response) => response,
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plain_text_passes_through() {
        let (port, backend) = one_shot_backend(b"Hello, Kindle!", Duration::ZERO).await;

        let response = expect_text(Relay::new(request(port)).fetch_text().await);
        assert_eq!(response.body, "Hello, Kindle!");
        assert_eq!(response.bytes_read, 14);
        assert_eq!(response.end, StreamEnd::Closed);

        assert_eq!(backend.await.unwrap(), REQUEST_PAYLOAD);
    }

    #[tokio::test]
    async fn test_markup_is_escaped_once() {
        let (port, _backend) = one_shot_backend(b"<b>bold</b>", Duration::ZERO).await;

        let outcome = Relay::new(request(port)).fetch_text().await;
        assert_eq!(outcome.into_body(), "&lt;b&gt;bold&lt;/b&gt;");
    }

    #[tokio::test]
    async fn test_empty_response() {
        let (port, _backend) = one_shot_backend(b"", Duration::ZERO).await;

        let response = expect_text(Relay::new(request(port)).fetch_text().await);
        assert_eq!(response.body, "");
        assert_eq!(response.end, StreamEnd::Closed);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Reserve a port, then free it so nothing is listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let outcome = Relay::new(request(port)).fetch_text().await;
        let err = match &outcome {
            RelayOutcome::ConnectFailed(err) => err.clone(),
            other => panic!("unexpected: {:?}", other),
        };
        assert_ne!(err.code, 0);
        assert!(!err.message.is_empty());
        assert!(!err.message.contains("os error"));

        let body = outcome.into_body();
        assert_eq!(body, format!("{} ({})\n", err.message, err.code));
        assert!(!body.contains("&"));
    }

    #[tokio::test]
    async fn test_read_timeout_keeps_partial_body() {
        let (port, _backend) = one_shot_backend(b"partial <", Duration::from_secs(2)).await;

        let mut req = request(port);
        req.read_timeout = Some(Duration::from_millis(100));

        let response = expect_text(Relay::new(req).fetch_text().await);
        assert_eq!(response.end, StreamEnd::TimedOut);
        assert_eq!(response.body, "partial &lt;");
    }

    #[tokio::test]
    async fn test_response_capped() {
        let (port, _backend) = one_shot_backend(b"0123456789", Duration::ZERO).await;

        let mut req = request(port);
        req.max_response_bytes = 4;

        let response = expect_text(Relay::new(req).fetch_text().await);
        assert_eq!(response.end, StreamEnd::LimitReached);
        assert_eq!(response.body, "0123");
        assert_eq!(response.bytes_read, 4);
    }

    #[tokio::test]
    async fn test_response_exactly_at_cap_is_complete() {
        let (port, _backend) = one_shot_backend(b"0123", Duration::ZERO).await;

        let mut req = request(port);
        req.max_response_bytes = 4;

        let response = expect_text(Relay::new(req).fetch_text().await);
        assert_eq!(response.end, StreamEnd::Closed);
        assert_eq!(response.body, "0123");
        assert_eq!(response.bytes_read, 4);
    }

    #[test]
    fn test_connect_error_from_os_error() {
        let err = ConnectError::from_io(&io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert_eq!(err.code, libc::ECONNREFUSED);
        assert_eq!(err.to_string(), format!("{} ({})", err.message, libc::ECONNREFUSED));
        assert!(!err.message.contains("os error"));
    }

    #[test]
    fn test_connect_error_without_errno() {
        let err = ConnectError::from_io(&io::Error::new(io::ErrorKind::Other, "lookup failed"));
        assert_eq!(err.code, 0);
        assert_eq!(err.to_string(), "lookup failed (0)");
    }

    #[test]
    fn test_timed_out_error() {
        let err = ConnectError::timed_out();
        assert_eq!(err.code, libc::ETIMEDOUT);
        assert_eq!(err.to_string(), format!("Connection timed out ({})", libc::ETIMEDOUT));
    }
}
