//! `DeliverClockMessage` over TCP.
//!
//! Every frame is a big-endian `u32` length followed by a bincode payload. A client
//! keeps one connection per peer and issues calls sequentially on it; each request
//! frame is answered by exactly one [`Ack`] frame.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{watch, Mutex},
    task::JoinSet,
};

use super::{
    ListenerHandle, NetworkEndpoint, NetworkError, PeerAddress, PeerClient, Transport,
    DEFAULT_SEND_TIMEOUT,
};
use crate::message::{Ack, ClockMessage, DeliverClockMessage, WireRequest};

pub(crate) const MAX_FRAME_LEN: u32 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub(crate) enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    use byteorder::{BigEndian, WriteBytesExt};

    let payload = bincode::serialize(value)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(FrameError::TooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.write_u32::<BigEndian>(len)?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub(crate) async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    use tokio::io::AsyncWriteExt;

    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    use tokio::io::AsyncReadExt;

    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len as usize));
    }
    let mut buf = vec![0; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_TIMEOUT)
    }
}

impl Transport for TcpTransport {
    type Client = TcpPeerClient;

    fn bind(
        &self,
        addr: PeerAddress,
        endpoint: NetworkEndpoint,
    ) -> impl Future<Output = io::Result<ListenerHandle>> + Send {
        async move {
            let listener = TcpListener::bind((addr.host(), addr.port())).await?;
            let local_addr = PeerAddress::from(listener.local_addr()?);
            tracing::info!(machine = %endpoint.owner(), addr = %local_addr, "Listening");
            let (stop_tx, stop_rx) = watch::channel(false);
            let task = tokio::spawn(accept_loop(listener, endpoint, stop_rx));
            Ok(ListenerHandle::new(local_addr, stop_tx, task))
        }
    }

    fn connect(&self, peer: PeerAddress) -> Self::Client {
        TcpPeerClient {
            peer,
            timeout: self.timeout,
            stream: Arc::new(Mutex::new(None)),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    endpoint: NetworkEndpoint,
    mut stop: watch::Receiver<bool>,
) {
    let conn_stop = stop.clone();
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = super::stopped(&mut stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    connections.spawn(serve_connection(
                        stream,
                        remote,
                        endpoint.clone(),
                        conn_stop.clone(),
                    ));
                }
                Err(err) => {
                    tracing::warn!(
                        machine = %endpoint.owner(),
                        error = %err,
                        "Failed to accept connection"
                    );
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
    tracing::debug!(machine = %endpoint.owner(), "Listener stopped");
}

async fn serve_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    endpoint: NetworkEndpoint,
    mut stop: watch::Receiver<bool>,
) {
    tracing::debug!(machine = %endpoint.owner(), %remote, "Peer connected");
    loop {
        let request = tokio::select! {
            _ = super::stopped(&mut stop) => break,
            frame = read_frame::<_, WireRequest>(&mut stream) => frame,
        };
        let ack = match request {
            Ok(WireRequest::DeliverClockMessage(request)) => endpoint.deliver(request),
            Err(FrameError::Serialization(err)) => {
                tracing::warn!(
                    machine = %endpoint.owner(),
                    %remote,
                    error = %err,
                    "Undecodable request"
                );
                Ack::rejected()
            }
            Err(FrameError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                tracing::debug!(
                    machine = %endpoint.owner(),
                    %remote,
                    error = %err,
                    "Dropping connection"
                );
                break;
            }
        };
        if let Err(err) = write_frame(&mut stream, &ack).await {
            tracing::debug!(
                machine = %endpoint.owner(),
                %remote,
                error = %err,
                "Failed to answer peer"
            );
            break;
        }
    }
}

/// Connection to one peer, established lazily and re-established after a failure.
#[derive(Clone)]
pub struct TcpPeerClient {
    peer: PeerAddress,
    timeout: Duration,
    stream: Arc<Mutex<Option<TcpStream>>>,
}

impl TcpPeerClient {
    async fn call(&self, request: &WireRequest) -> Result<Ack, NetworkError> {
        let mut slot = self.stream.lock().await;
        // the stream only goes back into the slot after a complete exchange
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => TcpStream::connect((self.peer.host(), self.peer.port()))
                .await
                .map_err(|err| NetworkError::Unreachable {
                    peer: self.peer.clone(),
                    reason: err.to_string(),
                })?,
        };
        write_frame(&mut stream, request)
            .await
            .map_err(|err| self.frame_error(err))?;
        let ack = read_frame::<_, Ack>(&mut stream)
            .await
            .map_err(|err| self.frame_error(err))?;
        *slot = Some(stream);
        Ok(ack)
    }

    fn frame_error(&self, err: FrameError) -> NetworkError {
        let peer = self.peer.clone();
        match err {
            FrameError::Io(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::BrokenPipe
                ) =>
            {
                NetworkError::Closed { peer }
            }
            FrameError::Io(err) => NetworkError::Unreachable {
                peer,
                reason: err.to_string(),
            },
            err @ (FrameError::Serialization(_) | FrameError::TooLarge(_)) => NetworkError::Codec {
                peer,
                reason: err.to_string(),
            },
        }
    }
}

impl PeerClient for TcpPeerClient {
    fn address(&self) -> &PeerAddress {
        &self.peer
    }

    fn deliver(&self, msg: ClockMessage) -> impl Future<Output = Result<Ack, NetworkError>> + Send {
        async move {
            let request = DeliverClockMessage::try_from(&msg).map_err(|err| NetworkError::Codec {
                peer: self.peer.clone(),
                reason: err.to_string(),
            })?;
            let request = WireRequest::DeliverClockMessage(request);
            match tokio::time::timeout(self.timeout, self.call(&request)).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout {
                    peer: self.peer.clone(),
                    after: self.timeout,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{message::MachineId, node::InboundQueue};

    fn loopback() -> PeerAddress {
        PeerAddress::new("127.0.0.1", 0)
    }

    fn endpoint(id: &str) -> (NetworkEndpoint, InboundQueue) {
        let queue = InboundQueue::new();
        (
            NetworkEndpoint::new(MachineId::new(id).unwrap(), queue.clone()),
            queue,
        )
    }

    fn message(clock: u64) -> ClockMessage {
        ClockMessage::new(MachineId::new("machine1").unwrap(), clock, Utc::now())
    }

    #[tokio::test]
    #[test_log::test]
    async fn delivers_over_tcp() -> testresult::TestResult {
        let transport = TcpTransport::default();
        let (endpoint, queue) = endpoint("machine2");
        let listener = transport.bind(loopback(), endpoint).await?;

        let client = transport.connect(listener.local_addr().clone());
        for clock in [3, 4, 9] {
            let ack = client.deliver(message(clock)).await?;
            assert!(ack.received);
        }
        assert_eq!(queue.len(), 3);
        let clocks: Vec<_> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|m| m.logical_clock)
            .collect();
        assert_eq!(clocks, vec![3, 4, 9]);

        listener.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    #[test_log::test]
    async fn unbound_peer_is_unreachable() -> testresult::TestResult {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };
        let client = TcpTransport::default().connect(PeerAddress::new("127.0.0.1", port));
        let err = client.deliver(message(1)).await.unwrap_err();
        assert!(
            matches!(err, NetworkError::Unreachable { .. }),
            "unexpected error: {err}"
        );
        Ok(())
    }

    #[tokio::test]
    #[test_log::test]
    async fn address_in_use_fails_bind() -> testresult::TestResult {
        let transport = TcpTransport::default();
        let (first, _) = endpoint("machine1");
        let listener = transport.bind(loopback(), first).await?;

        let (second, _) = endpoint("machine2");
        let result = transport.bind(listener.local_addr().clone(), second).await;
        assert!(result.is_err());

        listener.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    #[test_log::test]
    async fn garbage_frame_is_rejected() -> testresult::TestResult {
        let transport = TcpTransport::default();
        let (endpoint, queue) = endpoint("machine2");
        let listener = transport.bind(loopback(), endpoint).await?;

        let addr = listener.local_addr();
        let mut raw = TcpStream::connect((addr.host(), addr.port())).await?;
        raw.write_u32(4).await?;
        raw.write_all(&[0xff; 4]).await?;
        raw.flush().await?;
        let ack: Ack = read_frame(&mut raw).await?;
        assert!(!ack.received);
        assert!(queue.is_empty());

        // the connection remains usable after a rejected frame
        let request = WireRequest::DeliverClockMessage(DeliverClockMessage::try_from(&message(5))?);
        write_frame(&mut raw, &request).await?;
        let ack: Ack = read_frame(&mut raw).await?;
        assert!(ack.received);
        assert_eq!(queue.len(), 1);

        drop(raw);
        listener.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    #[test_log::test]
    async fn stopped_listener_refuses_deliveries() -> testresult::TestResult {
        let transport = TcpTransport::new(Duration::from_millis(500));
        let (endpoint, _queue) = endpoint("machine2");
        let listener = transport.bind(loopback(), endpoint).await?;
        let client = transport.connect(listener.local_addr().clone());
        assert!(client.deliver(message(1)).await?.received);

        listener.shutdown().await;
        assert!(client.deliver(message(2)).await.is_err());
        Ok(())
    }

    #[test]
    fn oversized_frames_are_refused() {
        let payload = vec![0u8; MAX_FRAME_LEN as usize + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(FrameError::TooLarge(_))
        ));
    }
}
