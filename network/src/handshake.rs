//! Outbound version/verack negotiation.
//!
//! Policy: besides `version` and `verack` the peer may only send capability
//! announcements (see [`Message::is_auxiliary`]) before the handshake
//! completes. Anything else, a second `version`, or a `verack` ahead of the
//! peer's `version` aborts the connection with a protocol violation.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::message::{Message, VersionMessage};
use crate::p2p::{Connection, Timeouts};
use crate::params::Network;
use crate::{MIN_PROTOCOL_VERSION, NetworkError};

#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    pub network: Network,
    pub user_agent: String,
    pub start_height: i32,
    pub timeouts: Timeouts,
    /// Bounds dialing and the whole exchange.
    pub handshake_timeout: Duration,
}

impl HandshakeConfig {
    pub fn new(network: Network, user_agent: impl Into<String>) -> Self {
        Self {
            network,
            user_agent: user_agent.into(),
            start_height: 0,
            timeouts: Timeouts::default(),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

/// A negotiated peer and the connection it was negotiated on.
pub struct Peer<T = TcpStream> {
    pub addr: SocketAddr,
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub connection: Connection<T>,
}

impl<T> std::fmt::Debug for Peer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("version", &self.version)
            .field("services", &self.services)
            .field("user_agent", &self.user_agent)
            .field("start_height", &self.start_height)
            .finish_non_exhaustive()
    }
}

pub async fn negotiate_outbound(
    addr: SocketAddr,
    config: &HandshakeConfig,
) -> Result<Peer, NetworkError> {
    let connection = Connection::connect(
        addr,
        config.network,
        config.timeouts,
        config.handshake_timeout,
    )
    .await?;
    negotiate(connection, config).await
}

pub async fn negotiate<T>(
    mut connection: Connection<T>,
    config: &HandshakeConfig,
) -> Result<Peer<T>, NetworkError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let remote = match timeout(config.handshake_timeout, exchange(&mut connection, config)).await
    {
        Ok(result) => result?,
        Err(_) => return Err(NetworkError::Timeout),
    };
    let addr = connection.peer_addr();
    info!(
        peer = %addr,
        version = remote.version,
        user_agent = %remote.user_agent,
        start_height = remote.start_height,
        "handshake completed"
    );
    Ok(Peer {
        addr,
        version: remote.version,
        services: remote.services,
        user_agent: remote.user_agent,
        start_height: remote.start_height,
        connection,
    })
}

async fn exchange<T>(
    connection: &mut Connection<T>,
    config: &HandshakeConfig,
) -> Result<VersionMessage, NetworkError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    // 1. Announce ourselves
    let nonce = rand::random::<u64>();
    let ours = VersionMessage::new(
        connection.peer_addr(),
        &config.user_agent,
        config.start_height,
        nonce,
    );
    connection.send(Message::Version(ours)).await?;

    // 2. Collect the peer's version and verack
    let mut remote: Option<VersionMessage> = None;
    loop {
        let message = match connection.recv().await {
            Ok(message) => message,
            Err(err) if err.is_timeout() => continue,
            Err(err) => return Err(err),
        };
        match message {
            Message::Version(version) => {
                if remote.is_some() {
                    return Err(NetworkError::violation("duplicate version message"));
                }
                if version.nonce == nonce {
                    return Err(NetworkError::violation("connected to self"));
                }
                if version.version < MIN_PROTOCOL_VERSION {
                    return Err(NetworkError::UnsupportedVersion {
                        version: version.version,
                        minimum: MIN_PROTOCOL_VERSION,
                    });
                }
                // 3. Acknowledge it
                connection.send(Message::Verack).await?;
                remote = Some(version);
            }
            Message::Verack => {
                return remote.ok_or_else(|| NetworkError::violation("verack before version"));
            }
            Message::Ping(ping) => connection.send(Message::Pong(ping)).await?,
            other if other.is_auxiliary() => {
                debug!(command = %other.command(), "ignoring capability message during handshake");
            }
            other => {
                return Err(NetworkError::violation(format!(
                    "unexpected '{}' before handshake completed",
                    other.command()
                )));
            }
        }
    }
}
