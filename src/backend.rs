//! Line-oriented text backend.
//!
//! The service the relay talks to. Per connection:
//! - Client sends lines, terminated by a line holding a single `.`
//! - Server answers every line with the latest message
//! - After the sentinel (or EOF) the server sends
//!   `Overall message is:<all lines concatenated>` and closes
//!
//! ```text
//! Request:  text request\n.\n
//! Response: Hello, Kindle!\nOverall message is:text request\n
//! ```
//!
//! Lines longer than `MAX_LINE_LENGTH`, or a request whose lines add up to
//! more than `MAX_INPUT_LENGTH`, end the session with an `ERROR` line.
//! Bytes that are not valid UTF-8 are replaced with U+FFFD.
//!
//! The latest message lives on a shared board, replaced by every line
//! read from standard input.

use crate::config::BackendConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Line that ends a request
const SENTINEL: &str = ".";

/// Longest accepted line, terminator included
pub const MAX_LINE_LENGTH: usize = 1024;

/// Longest accepted request, all lines concatenated
pub const MAX_INPUT_LENGTH: usize = 64 * 1024;

/// Latest message handed to clients
#[derive(Debug, Default)]
pub struct MessageBoard {
    latest: RwLock<String>,
}

impl MessageBoard {
    pub fn new(initial: impl Into<String>) -> Arc<Self> {
        Arc::new(MessageBoard {
            latest: RwLock::new(initial.into()),
        })
    }

    pub fn publish(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(len = message.len(), "Publishing message");
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = message;
    }

    pub fn latest(&self) -> String {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Backend server instance
pub struct Backend {
    config: BackendConfig,
    board: Arc<MessageBoard>,
    connection_limit: Arc<Semaphore>,
}

impl Backend {
    pub fn new(config: BackendConfig) -> Self {
        let board = MessageBoard::new(config.message.clone());
        let connection_limit = Arc::new(Semaphore::new(config.max_connections.max(1)));

        Backend {
            config,
            board,
            connection_limit,
        }
    }

    pub fn board(&self) -> &Arc<MessageBoard> {
        &self.board
    }

    /// Bind the configured address with SO_REUSEADDR so restarts do not
    /// wait out TIME_WAIT.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let addr = tokio::net::lookup_host(&self.config.listen)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address for {}", self.config.listen),
                )
            })?;

        TcpListener::from_std(create_listener(addr)?)
    }

    /// Bind and accept sessions until cancelled.
    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = self.bind().await?;
        info!(address = %listener.local_addr()?, "Backend listening");
        self.serve(listener, cancel).await
    }

    /// Accept sessions on an already bound listener until cancelled.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            // Wait for a session slot
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.connection_limit.clone().acquire_owned() => permit?,
            };

            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New session");

                    let board = Arc::clone(&self.board);

                    tokio::spawn(async move {
                        match handle_session(stream, &board).await {
                            Ok(input) => trace!(peer = %addr, %input, "Session finished"),
                            Err(e) => debug!(peer = %addr, error = %e, "Session error"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("Backend stopped");
        Ok(())
    }
}

/// Serve one session. Returns the concatenated input lines.
pub async fn handle_session<S>(stream: S, board: &MessageBoard) -> io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut line = Vec::with_capacity(MAX_LINE_LENGTH);
    let mut input = String::new();

    loop {
        line.clear();

        // Never buffer more than one line's worth
        let n = (&mut stream)
            .take(MAX_LINE_LENGTH as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            // EOF
            break;
        }

        if !line.ends_with(b"\n") && line.len() > MAX_LINE_LENGTH {
            return reject(&mut stream, "line too long").await;
        }

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim_end_matches(['\r', '\n']);
        if trimmed == SENTINEL {
            break;
        }

        if input.len() + trimmed.len() > MAX_INPUT_LENGTH {
            return reject(&mut stream, "request too long").await;
        }
        input.push_str(trimmed);

        let reply = format!("{}\n", board.latest());
        stream.write_all(reply.as_bytes()).await?;
    }

    let overall = format!("Overall message is:{input}\n");
    stream.write_all(overall.as_bytes()).await?;
    stream.flush().await?;

    Ok(input)
}

/// Tell the client why the session ends, then fail it.
async fn reject<W>(writer: &mut W, reason: &str) -> io::Result<String>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(format!("ERROR {reason}\n").as_bytes()).await?;
    writer.flush().await?;
    Err(io::Error::new(io::ErrorKind::InvalidData, reason.to_string()))
}

/// Publish every line of `reader` to the board until EOF.
pub async fn feed_lines<R>(reader: R, board: &MessageBoard) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut count = 0;

    while let Some(line) = lines.next_line().await? {
        board.publish(line);
        count += 1;
    }

    debug!(count, "Message input closed");
    Ok(count)
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
