//! In-process transport. Machines sharing an [`InMemoryNetwork`] reach each other
//! through a registry of bound endpoints instead of sockets.
use std::{
    collections::HashMap,
    future::Future,
    io,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tokio::sync::watch;

use super::{ListenerHandle, NetworkEndpoint, NetworkError, PeerAddress, PeerClient, Transport};
use crate::message::{Ack, ClockMessage, DeliverClockMessage, WireRequest};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

#[derive(Clone)]
pub struct InMemoryNetwork {
    endpoints: Arc<RwLock<HashMap<PeerAddress, NetworkEndpoint>>>,
    next_port: Arc<AtomicU16>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::default(),
            next_port: Arc::new(AtomicU16::new(FIRST_EPHEMERAL_PORT)),
        }
    }

    /// Number of currently bound endpoints.
    pub fn bound(&self) -> usize {
        self.endpoints.read().len()
    }

    fn register(&self, addr: PeerAddress, endpoint: NetworkEndpoint) -> io::Result<PeerAddress> {
        let mut endpoints = self.endpoints.write();
        let addr = if addr.port() == 0 {
            loop {
                let port = self.next_port.fetch_add(1, Ordering::Relaxed);
                if port == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "ephemeral ports exhausted",
                    ));
                }
                let candidate = PeerAddress::new(addr.host(), port);
                if !endpoints.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            addr
        };
        if endpoints.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("address {addr} already bound"),
            ));
        }
        endpoints.insert(addr.clone(), endpoint);
        Ok(addr)
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for InMemoryNetwork {
    type Client = InMemoryPeerClient;

    fn bind(
        &self,
        addr: PeerAddress,
        endpoint: NetworkEndpoint,
    ) -> impl Future<Output = io::Result<ListenerHandle>> + Send {
        let network = self.clone();
        async move {
            let local_addr = network.register(addr, endpoint)?;
            let (stop_tx, mut stop_rx) = watch::channel(false);
            let bound = local_addr.clone();
            let task = tokio::spawn(async move {
                super::stopped(&mut stop_rx).await;
                network.endpoints.write().remove(&bound);
                tracing::debug!(addr = %bound, "In-memory listener stopped");
            });
            Ok(ListenerHandle::new(local_addr, stop_tx, task))
        }
    }

    fn connect(&self, peer: PeerAddress) -> Self::Client {
        InMemoryPeerClient {
            peer,
            network: self.clone(),
        }
    }
}

pub struct InMemoryPeerClient {
    peer: PeerAddress,
    network: InMemoryNetwork,
}

impl InMemoryPeerClient {
    fn call(&self, msg: &ClockMessage) -> Result<Ack, NetworkError> {
        let codec_err = |reason: String| NetworkError::Codec {
            peer: self.peer.clone(),
            reason,
        };
        let request = DeliverClockMessage::try_from(msg).map_err(|err| codec_err(err.to_string()))?;
        // requests cross the same codec as the wire
        let bytes = bincode::serialize(&WireRequest::DeliverClockMessage(request))
            .map_err(|err| codec_err(err.to_string()))?;
        let WireRequest::DeliverClockMessage(request) =
            bincode::deserialize(&bytes).map_err(|err| codec_err(err.to_string()))?;

        let endpoint = self.network.endpoints.read().get(&self.peer).cloned();
        match endpoint {
            Some(endpoint) => Ok(endpoint.deliver(request)),
            None => Err(NetworkError::Unreachable {
                peer: self.peer.clone(),
                reason: "connection refused".into(),
            }),
        }
    }
}

impl PeerClient for InMemoryPeerClient {
    fn address(&self) -> &PeerAddress {
        &self.peer
    }

    fn deliver(&self, msg: ClockMessage) -> impl Future<Output = Result<Ack, NetworkError>> + Send {
        let result = self.call(&msg);
        async move { result }
    }
}
