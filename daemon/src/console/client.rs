use astro_protocol::console::{PlayerSnapshot, ServerStatistics};
use async_trait::async_trait;
use encoding::all::UTF_8;
use encoding::{DecoderTrap, Encoding};
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

pub const LIST_PLAYERS: &str = "DSListPlayers";
pub const SERVER_STATISTICS: &str = "DSServerStatistics";
pub const SAVE_GAME: &str = "DSSaveGame";
pub const SERVER_SHUTDOWN: &str = "DSServerShutdown";

const MAX_REPLY_LEN: usize = 1 << 20;

/// Where the console listens and how long one session may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleEndpoint {
    pub host: IpAddr,
    pub port: u16,
    pub timeout: Duration,
}

impl ConsoleEndpoint {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("console {addr} unreachable: {source}")]
    Connection {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("console {addr} did not answer within {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
    #[error("malformed reply to {command}: {reason}")]
    Protocol {
        command: &'static str,
        reason: String,
    },
}

impl ConsoleError {
    /// Connection failures mean the server is still booting (or gone); they are
    /// retried on the next poll.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            ConsoleError::Connection { .. } | ConsoleError::Timeout { .. }
        )
    }
}

/// The subset of the server console the supervisor speaks.
#[async_trait]
pub trait Console: Send + Sync {
    /// `Ok(None)` is "not ready yet": the console closed without sending anything.
    async fn list_players(
        &self,
        endpoint: &ConsoleEndpoint,
    ) -> Result<Option<PlayerSnapshot>, ConsoleError>;

    async fn server_statistics(
        &self,
        endpoint: &ConsoleEndpoint,
    ) -> Result<Option<ServerStatistics>, ConsoleError>;

    async fn save_game(&self, endpoint: &ConsoleEndpoint) -> Result<(), ConsoleError>;

    async fn shutdown_server(&self, endpoint: &ConsoleEndpoint) -> Result<(), ConsoleError>;
}

/// One short-lived TCP session per command; nothing is reused between calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleClient;

impl ConsoleClient {
    pub fn new() -> Self {
        ConsoleClient
    }

    async fn open(endpoint: &ConsoleEndpoint, deadline: Instant) -> Result<TcpStream, ConsoleError> {
        let addr = endpoint.addr();
        match time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConsoleError::Connection { addr, source }),
            Err(_) => Err(ConsoleError::Timeout {
                addr,
                timeout: endpoint.timeout,
            }),
        }
    }

    async fn send(
        stream: &mut TcpStream,
        endpoint: &ConsoleEndpoint,
        deadline: Instant,
        command: &'static str,
    ) -> Result<(), ConsoleError> {
        let addr = endpoint.addr();
        let line = format!("{}\n", command);
        let write = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        };
        match time::timeout_at(deadline, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ConsoleError::Connection { addr, source }),
            Err(_) => Err(ConsoleError::Timeout {
                addr,
                timeout: endpoint.timeout,
            }),
        }
    }

    /// Sends `command` and reads until the reply parses, the peer closes, or the
    /// deadline passes.
    async fn query<T: DeserializeOwned>(
        endpoint: &ConsoleEndpoint,
        command: &'static str,
    ) -> Result<Option<T>, ConsoleError> {
        let deadline = Instant::now() + endpoint.timeout;
        let addr = endpoint.addr();
        let mut stream = Self::open(endpoint, deadline).await?;
        Self::send(&mut stream, endpoint, deadline, command).await?;

        let mut reply = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match time::timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(Ok(n)) => n,
                Ok(Err(source)) => return Err(ConsoleError::Connection { addr, source }),
                Err(_) if is_blank(&reply) => {
                    return Err(ConsoleError::Timeout {
                        addr,
                        timeout: endpoint.timeout,
                    })
                }
                Err(_) => {
                    return Err(ConsoleError::Protocol {
                        command,
                        reason: format!("reply still incomplete after {:?}", endpoint.timeout),
                    })
                }
            };

            if n == 0 {
                if is_blank(&reply) {
                    debug!("console {} closed without a reply to {}", addr, command);
                    return Ok(None);
                }
                return match parse_reply(command, &reply)? {
                    Some(value) => Ok(Some(value)),
                    None => Err(ConsoleError::Protocol {
                        command,
                        reason: "connection closed in the middle of the reply".to_owned(),
                    }),
                };
            }

            reply.extend_from_slice(&chunk[..n]);
            if reply.len() > MAX_REPLY_LEN {
                return Err(ConsoleError::Protocol {
                    command,
                    reason: format!("reply exceeds {} bytes", MAX_REPLY_LEN),
                });
            }
            if let Some(value) = parse_reply(command, &reply)? {
                return Ok(Some(value));
            }
        }
    }

    /// Fire-and-forget commands; the server does not answer them.
    async fn execute(endpoint: &ConsoleEndpoint, command: &'static str) -> Result<(), ConsoleError> {
        let deadline = Instant::now() + endpoint.timeout;
        let mut stream = Self::open(endpoint, deadline).await?;
        Self::send(&mut stream, endpoint, deadline, command).await?;
        // half-close is best effort, the command is already on the wire
        let _ = time::timeout_at(deadline, stream.shutdown()).await;
        debug!("sent {} to console {}", command, endpoint.addr());
        Ok(())
    }
}

#[async_trait]
impl Console for ConsoleClient {
    async fn list_players(
        &self,
        endpoint: &ConsoleEndpoint,
    ) -> Result<Option<PlayerSnapshot>, ConsoleError> {
        Self::query(endpoint, LIST_PLAYERS).await
    }

    async fn server_statistics(
        &self,
        endpoint: &ConsoleEndpoint,
    ) -> Result<Option<ServerStatistics>, ConsoleError> {
        Self::query(endpoint, SERVER_STATISTICS).await
    }

    async fn save_game(&self, endpoint: &ConsoleEndpoint) -> Result<(), ConsoleError> {
        Self::execute(endpoint, SAVE_GAME).await
    }

    async fn shutdown_server(&self, endpoint: &ConsoleEndpoint) -> Result<(), ConsoleError> {
        Self::execute(endpoint, SERVER_SHUTDOWN).await
    }
}

fn is_blank(raw: &[u8]) -> bool {
    raw.iter().all(|b| b.is_ascii_whitespace() || *b == 0)
}

/// `Ok(None)` means the bytes so far are a valid prefix and more are needed.
fn parse_reply<T: DeserializeOwned>(
    command: &'static str,
    raw: &[u8],
) -> Result<Option<T>, ConsoleError> {
    let text = UTF_8
        .decode(raw, DecoderTrap::Replace)
        .map_err(|e| ConsoleError::Protocol {
            command,
            reason: e.into_owned(),
        })?;
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if text.is_empty() {
        return Ok(None);
    }

    match serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .next()
    {
        Some(Ok(value)) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ConsoleError::Protocol {
                command,
                reason: e.to_string(),
            }),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(ConsoleError::Protocol {
            command,
            reason: e.to_string(),
        }),
        None => Ok(None),
    }
}
