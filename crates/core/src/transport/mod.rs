//! Machine-to-machine transport.
//!
//! A machine exposes a [`NetworkEndpoint`] through a listener and reaches its peers
//! through [`PeerClient`]s. Both are produced by a [`Transport`], so the same machine
//! code runs over real sockets ([`tcp::TcpTransport`]) or inside a single process
//! ([`in_memory::InMemoryNetwork`]).

use std::{
    fmt::Display,
    future::Future,
    io,
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle};

use crate::message::{Ack, ClockMessage};

pub mod endpoint;
pub mod in_memory;
pub mod tcp;

pub use endpoint::NetworkEndpoint;

/// Default time a peer has to acknowledge a delivery.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Creates listeners and peer clients for one kind of network.
pub trait Transport: Clone + Send + Sync + 'static {
    type Client: PeerClient;

    /// Starts accepting `DeliverClockMessage` calls at `addr`, handing them to `endpoint`.
    fn bind(
        &self,
        addr: PeerAddress,
        endpoint: NetworkEndpoint,
    ) -> impl Future<Output = io::Result<ListenerHandle>> + Send;

    /// Creates a client for `peer`. Connecting is deferred to the first delivery.
    fn connect(&self, peer: PeerAddress) -> Self::Client;
}

/// Outbound stub for a single peer.
pub trait PeerClient: Send + Sync + 'static {
    fn address(&self) -> &PeerAddress;

    /// Issues a `DeliverClockMessage` call and waits for the acknowledgment,
    /// bounded by the transport's timeout.
    fn deliver(&self, msg: ClockMessage) -> impl Future<Output = Result<Ack, NetworkError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: PeerAddress, reason: String },
    #[error("peer {peer} did not answer within {after:?}")]
    Timeout { peer: PeerAddress, after: Duration },
    #[error("peer {peer} rejected the message")]
    Rejected { peer: PeerAddress },
    #[error("error while de/serializing message for {peer}: {reason}")]
    Codec { peer: PeerAddress, reason: String },
    #[error("connection to {peer} closed")]
    Closed { peer: PeerAddress },
}

impl NetworkError {
    pub fn peer(&self) -> &PeerAddress {
        match self {
            Self::Unreachable { peer, .. }
            | Self::Timeout { peer, .. }
            | Self::Rejected { peer }
            | Self::Codec { peer, .. }
            | Self::Closed { peer } => peer,
        }
    }
}

/// Network location of a machine (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid peer address `{0}`, expected host:port")]
pub struct InvalidPeerAddress(pub String);

impl FromStr for PeerAddress {
    type Err = InvalidPeerAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || InvalidPeerAddress(s.to_owned());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || host.contains(char::is_whitespace) || host.contains(',') {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = InvalidPeerAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerAddress> for String {
    fn from(addr: PeerAddress) -> Self {
        addr.to_string()
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses a comma-separated list of peer addresses, ignoring empty entries.
pub fn parse_peer_list(list: &str) -> Result<Vec<PeerAddress>, InvalidPeerAddress> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

/// Handle to a running listener.
///
/// Dropping the handle without calling [`ListenerHandle::shutdown`] also stops the
/// listener, but without waiting for outstanding calls.
pub struct ListenerHandle {
    local_addr: PeerAddress,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub(crate) fn new(
        local_addr: PeerAddress,
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            local_addr,
            stop,
            task,
        }
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> &PeerAddress {
        &self.local_addr
    }

    /// Stops accepting new calls and waits for outstanding ones to finish or fail.
    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        if let Err(err) = self.task.await {
            tracing::warn!(
                addr = %self.local_addr,
                error = %err,
                "Listener task failed during shutdown"
            );
        }
    }
}

/// Resolves once the listener owning `stop` is told to shut down (or goes away).
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
