//! Line-delimited JSON transport to the mixing coordinator.
//!
//! Each message is one JSON object terminated by `\n`. Every send and
//! receive is bounded by its own timeout, and failures carry the remote
//! address, the message type and the call site that issued them.

use std::future::Future;
use std::panic::Location;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use crate::messages::{ServerError, ServerErrorCode};

/// Upper bound on one encoded message, newline included.
pub const MAX_LINE_BYTES: u64 = 16 * 1024 * 1024;

/// A byte stream to the coordinator.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {
    /// Remote address used to annotate errors.
    fn remote_addr(&self) -> String;
}

impl Conn for tokio::net::TcpStream {
    fn remote_addr(&self) -> String {
        self.peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string())
    }
}

impl Conn for tokio::io::DuplexStream {
    fn remote_addr(&self) -> String {
        "in-memory".to_string()
    }
}

/// What went wrong moving one message.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decode: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("message exceeds {MAX_LINE_BYTES} bytes")]
    TooLarge,
}

/// Transport errors, annotated for diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send {msg_type} to {remote} (at {location}): {source}")]
    Send {
        remote: String,
        msg_type: &'static str,
        location: &'static Location<'static>,
        #[source]
        source: FrameError,
    },

    #[error("recv {msg_type} from {remote} (at {location}): {source}")]
    Recv {
        remote: String,
        msg_type: &'static str,
        location: &'static Location<'static>,
        #[source]
        source: FrameError,
    },

    #[error("{msg_type} from {remote} (at {location}): {error}")]
    Server {
        remote: String,
        msg_type: &'static str,
        location: &'static Location<'static>,
        error: ServerError,
    },
}

impl TransportError {
    /// The coordinator error carried by a decoded reply, if any.
    pub const fn server_error(&self) -> Option<ServerError> {
        match self {
            Self::Server { error, .. } => Some(*error),
            _ => None,
        }
    }

    /// Whether the failure was a timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Send {
                source: FrameError::Timeout(_),
                ..
            } | Self::Recv {
                source: FrameError::Timeout(_),
                ..
            }
        )
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Framed message client over a coordinator connection.
pub struct Client<C> {
    stream: BufReader<C>,
    remote: String,
}

impl<C: Conn> Client<C> {
    pub fn new(conn: C) -> Self {
        let remote = conn.remote_addr();
        Self {
            stream: BufReader::new(conn),
            remote,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Send one message, failing if it is not flushed within `limit`.
    #[track_caller]
    pub fn send<T: Serialize>(
        &mut self,
        msg: &T,
        limit: Duration,
    ) -> impl Future<Output = Result<(), TransportError>> {
        let location = Location::caller();
        let msg_type = short_type_name::<T>();
        let encoded = serde_json::to_vec(msg);
        async move {
            let result = async {
                let mut line = encoded.map_err(FrameError::Encode)?;
                line.push(b'\n');
                timeout(limit, async {
                    self.stream.write_all(&line).await?;
                    self.stream.flush().await
                })
                .await
                .map_err(|_| FrameError::Timeout(limit))??;
                Ok::<_, FrameError>(())
            }
            .await;
            result.map_err(|source| TransportError::Send {
                remote: self.remote.clone(),
                msg_type,
                location,
                source,
            })
        }
    }

    /// Receive one message, waiting at most `limit` or forever when `None`.
    ///
    /// A reply that decodes but carries a coordinator error code is returned
    /// as [`TransportError::Server`].
    #[track_caller]
    pub fn recv<T: DeserializeOwned + ServerErrorCode>(
        &mut self,
        limit: Option<Duration>,
    ) -> impl Future<Output = Result<T, TransportError>> {
        let location = Location::caller();
        let msg_type = short_type_name::<T>();
        async move {
            let result = match limit {
                Some(limit) => timeout(limit, self.read_frame::<T>())
                    .await
                    .unwrap_or(Err(FrameError::Timeout(limit))),
                None => self.read_frame::<T>().await,
            };
            let msg = result.map_err(|source| TransportError::Recv {
                remote: self.remote.clone(),
                msg_type,
                location,
                source,
            })?;
            if let Some(error) = msg.server_error() {
                return Err(TransportError::Server {
                    remote: self.remote.clone(),
                    msg_type,
                    location,
                    error,
                });
            }
            Ok(msg)
        }
    }

    async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        let mut line = String::new();
        let n = (&mut self.stream)
            .take(MAX_LINE_BYTES)
            .read_line(&mut line)
            .await?;
        if n == 0 {
            return Err(FrameError::Closed);
        }
        if !line.ends_with('\n') {
            return Err(if n as u64 >= MAX_LINE_BYTES {
                FrameError::TooLarge
            } else {
                FrameError::Closed
            });
        }
        serde_json::from_str(line.trim_end()).map_err(FrameError::Decode)
    }

    /// Flush and close the write half.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde::Deserialize;
    use tokio::io::duplex;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
        #[serde(default)]
        err: u32,
    }

    impl ServerErrorCode for Ping {
        fn server_error(&self) -> Option<ServerError> {
            ServerError::from_code(self.err)
        }
    }

    #[tokio::test]
    async fn send_writes_one_line() {
        let (a, b) = duplex(1024);
        let mut client = Client::new(a);
        client
            .send(&Ping { n: 7, err: 0 }, Duration::from_secs(1))
            .await
            .unwrap();

        let mut lines = BufReader::new(b).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"n":7,"err":0}"#);
    }

    #[tokio::test]
    async fn recv_decodes_line() {
        let (a, mut b) = duplex(1024);
        let mut client = Client::new(a);
        b.write_all(b"{\"n\":3}\n{\"n\":4}\n").await.unwrap();

        let first: Ping = client.recv(Some(Duration::from_secs(1))).await.unwrap();
        let second: Ping = client.recv(None).await.unwrap();
        assert_eq!(first.n, 3);
        assert_eq!(second.n, 4);
    }

    #[tokio::test]
    async fn recv_surfaces_server_error() {
        let (a, mut b) = duplex(1024);
        let mut client = Client::new(a);
        b.write_all(b"{\"n\":0,\"err\":1}\n").await.unwrap();

        let err = client
            .recv::<Ping>(Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.server_error(), Some(ServerError::AbortedSession));
    }

    #[tokio::test]
    async fn recv_times_out() {
        let (a, _b) = duplex(1024);
        let mut client = Client::new(a);
        let err = client
            .recv::<Ping>(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let msg = err.to_string();
        assert!(msg.contains("Ping"), "{msg}");
        assert!(msg.contains("in-memory"), "{msg}");
        assert!(msg.contains("transport.rs"), "{msg}");
    }

    #[tokio::test]
    async fn recv_reports_closed_connection() {
        let (a, b) = duplex(1024);
        let mut client = Client::new(a);
        drop(b);
        let err = client.recv::<Ping>(None).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Recv {
                source: FrameError::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn recv_rejects_malformed_json() {
        let (a, mut b) = duplex(1024);
        let mut client = Client::new(a);
        b.write_all(b"not json\n").await.unwrap();
        let err = client.recv::<Ping>(None).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Recv {
                source: FrameError::Decode(_),
                ..
            }
        ));
    }

    #[test]
    fn type_names_are_short() {
        assert_eq!(short_type_name::<Ping>(), "Ping");
    }
}
