mod banner;
mod http;
mod memcached;
mod mysql;
mod postgres;

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};

use crate::config::{DEFAULT_PING_PATH, ProbeConfig};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out connecting to {address} after {}s", after.as_secs())]
    Timeout { address: String, after: Duration },
    #[error("i/o error while probing: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server refused: {0}")]
    Refused(String),
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Who, if anyone, is listening on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PortClassification {
    NotInUse,
    UsedBySelf { version: Option<String> },
    /// Same protocol family, different product (e.g. MySQL answering where
    /// MariaDB was expected).
    UsedByOtherSameCategory { product: String },
    UsedByOther { banner: Option<String> },
}

impl PortClassification {
    pub fn is_free(&self) -> bool {
        matches!(self, PortClassification::NotInUse)
    }
}

impl fmt::Display for PortClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortClassification::NotInUse => write!(f, "not in use"),
            PortClassification::UsedBySelf { version: Some(version) } => {
                write!(f, "used by this module ({version})")
            }
            PortClassification::UsedBySelf { version: None } => write!(f, "used by this module"),
            PortClassification::UsedByOtherSameCategory { product } => {
                write!(f, "used by another product of the same kind ({product})")
            }
            PortClassification::UsedByOther {
                banner: Some(banner),
            } => write!(f, "used by another application ({banner})"),
            PortClassification::UsedByOther { banner: None } => {
                write!(f, "used by another application")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerMatch {
    Contains(&'static str),
    StartsWith(&'static str),
    Equals(&'static str),
}

impl BannerMatch {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            BannerMatch::Contains(needle) => line.contains(needle),
            BannerMatch::StartsWith(prefix) => line.starts_with(prefix),
            BannerMatch::Equals(expected) => line == *expected,
        }
    }
}

/// Cheapest exchange that identifies the product behind a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeProtocol {
    /// Any listener is reported as foreign; used where identification would
    /// need TLS.
    Connect,
    Http { server_token: &'static str },
    Banner(BannerMatch),
    MySql { product: &'static str },
    Postgres,
    Memcached,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PortProbe {
    host: String,
    timeout: Duration,
    ping_path: String,
    attempts: Arc<AtomicU64>,
}

impl PortProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            host: config.host.clone(),
            timeout: config.timeout,
            ping_path: DEFAULT_PING_PATH.to_string(),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_ping_path(mut self, ping_path: impl Into<String>) -> Self {
        self.ping_path = ping_path.into();
        self
    }

    /// Number of probes started through this handle and its clones.
    #[cfg(test)]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub async fn classify(
        &self,
        port: u16,
        protocol: ProbeProtocol,
        credentials: Option<&Credentials>,
    ) -> ProbeResult<PortClassification> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let address = format!("{}:{}", self.host, port);
        tracing::trace!(attempt, %address, ?protocol, "probing");
        let mut stream = match timeout(self.timeout, TcpStream::connect(&address)).await {
            Err(_) => {
                return Err(ProbeError::Timeout {
                    address,
                    after: self.timeout,
                });
            }
            Ok(Err(error)) => {
                tracing::debug!(%error, %address, "no listener");
                return Ok(PortClassification::NotInUse);
            }
            Ok(Ok(stream)) => stream,
        };

        let exchange = self.exchange(&mut stream, port, protocol, credentials);
        let classification = match timeout(self.timeout, exchange).await {
            Ok(Ok(classification)) => classification,
            Ok(Err(error)) => {
                tracing::debug!(%error, %address, "listener did not identify itself");
                PortClassification::UsedByOther { banner: None }
            }
            Err(_) => {
                tracing::debug!(%address, "listener stayed silent");
                PortClassification::UsedByOther { banner: None }
            }
        };
        Ok(classification)
    }

    /// Log in to the server behind `port` as `current` and set the password
    /// of `target.user` there. Only database protocols carry accounts.
    pub async fn change_password(
        &self,
        port: u16,
        protocol: ProbeProtocol,
        current: &Credentials,
        target: &Credentials,
    ) -> ProbeResult<()> {
        let address = format!("{}:{}", self.host, port);
        let change = async {
            let mut stream = TcpStream::connect(&address).await?;
            match protocol {
                ProbeProtocol::MySql { .. } => {
                    mysql::change_password(&mut stream, current, target).await
                }
                ProbeProtocol::Postgres => {
                    postgres::change_password(&mut stream, current, target).await
                }
                other => Err(ProbeError::Protocol(format!(
                    "{other:?} listeners have no accounts"
                ))),
            }
        };
        let outcome = timeout(self.timeout, change).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout {
                address,
                after: self.timeout,
            }),
        }
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        port: u16,
        protocol: ProbeProtocol,
        credentials: Option<&Credentials>,
    ) -> ProbeResult<PortClassification> {
        match protocol {
            ProbeProtocol::Connect => Ok(PortClassification::UsedByOther { banner: None }),
            ProbeProtocol::Http { server_token } => {
                http::probe(stream, &self.host, port, &self.ping_path, server_token).await
            }
            ProbeProtocol::Banner(matcher) => banner::probe(stream, matcher).await,
            ProbeProtocol::MySql { product } => mysql::probe(stream, product, credentials).await,
            ProbeProtocol::Postgres => postgres::probe(stream, credentials).await,
            ProbeProtocol::Memcached => memcached::probe(stream).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use std::net::SocketAddr;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    /// Listener that greets every connection with `greeting`, then drains
    /// whatever the peer sends until it hangs up.
    pub(crate) async fn greeting_server(greeting: &'static [u8]) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = stream.write_all(greeting).await;
                    let mut sink = [0u8; 512];
                    while let Ok(read) = stream.read(&mut sink).await {
                        if read == 0 {
                            break;
                        }
                    }
                });
            }
        });
        (addr, handle)
    }

    /// Listener that answers the first request with `response` and closes.
    pub(crate) async fn reply_server(response: &'static [u8]) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = [0u8; 1024];
                    let _ = stream.read(&mut request).await;
                    let _ = stream.write_all(response).await;
                });
            }
        });
        (addr, handle)
    }
}
