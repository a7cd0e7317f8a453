//! In-process transport used by tests and the smoke binary.
//!
//! [`pair`] returns a [`MemoryConnector`] for the client side and a
//! [`MemoryServer`] that accepts one [`MemoryPeer`] per successful connect.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    frame::{FrameError, InboundFrame, OutboundFrame},
    transport::{Connector, Transport, TransportError},
};

#[derive(Debug)]
enum ServerSignal {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct ConnectorState {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refusals: AtomicU32,
    attempts: AtomicU32,
}

pub fn pair() -> (MemoryConnector, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            state: Arc::new(ConnectorState {
                accept_tx,
                refusals: AtomicU32::new(0),
                attempts: AtomicU32::new(0),
            }),
        },
        MemoryServer { accept_rx },
    )
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<ConnectorState>,
}

impl MemoryConnector {
    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        self.state.refusals.store(count, Ordering::SeqCst);
    }

    /// Number of connect calls so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    type Transport = MemoryTransport;

    async fn connect(&self) -> Result<MemoryTransport, TransportError> {
        let attempt = self.state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let refused = self
            .state
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            debug!(attempt, "memory connector refusing connection");
            return Err(TransportError::Refused("refused by test server".to_owned()));
        }

        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        self.state
            .accept_tx
            .send(MemoryPeer {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Refused("server is gone".to_owned()))?;

        Ok(MemoryTransport {
            to_server,
            from_server,
        })
    }
}

/// Client end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<ServerSignal>,
}

impl Transport for MemoryTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.to_server
            .send(text)
            .map_err(|_| TransportError::Io("peer dropped".to_owned()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        match self.from_server.recv().await? {
            ServerSignal::Text(text) => Some(Ok(text)),
            ServerSignal::Close { code, reason } => {
                self.from_server.close();
                Some(Err(TransportError::Closed { code, reason }))
            }
        }
    }
}

#[derive(Debug)]
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryServer {
    /// Wait for the next client connection. `None` once every connector is dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

/// Server end of one in-memory connection. Dropping it closes the connection.
#[derive(Debug)]
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<ServerSignal>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Returns `false` when the client end is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(ServerSignal::Text(text.into())).is_ok()
    }

    pub fn send_frame(&self, frame: &InboundFrame, sequence: Option<u64>) -> bool {
        match frame.encode(sequence) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Close with a status code, like a websocket close frame.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.to_client.send(ServerSignal::Close {
            code,
            reason: reason.into(),
        });
    }

    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub async fn recv_frame(&mut self) -> Option<Result<OutboundFrame, FrameError>> {
        let text = self.recv_text().await?;
        Some(OutboundFrame::decode(&text))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn connects_and_exchanges_frames() {
        let (connector, mut server) = pair();
        let mut client = connector.connect().await.expect("connect should work");
        let mut peer = timeout(Duration::from_secs(1), server.accept())
            .await
            .expect("accept timeout")
            .expect("peer should be accepted");

        assert!(peer.send_frame(&InboundFrame::HeartbeatAck, None));
        let text = client
            .recv()
            .await
            .expect("frame expected")
            .expect("text expected");
        assert_eq!(
            InboundFrame::decode(&text).expect("decode").frame,
            InboundFrame::HeartbeatAck
        );

        client
            .send(
                OutboundFrame::Heartbeat { seq: Some(1) }
                    .encode()
                    .expect("encode"),
            )
            .await
            .expect("send should work");
        assert_eq!(
            peer.recv_frame().await.expect("frame expected"),
            Ok(OutboundFrame::Heartbeat { seq: Some(1) })
        );
    }

    #[tokio::test]
    async fn refuses_configured_attempts() {
        let (connector, _server) = pair();
        connector.refuse_next(2);

        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Refused(_))
        ));
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Refused(_))
        ));
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn close_and_drop_end_the_stream() {
        let (connector, mut server) = pair();
        let mut client = connector.connect().await.expect("connect");
        let peer = server.accept().await.expect("peer");

        peer.close(4004, "authentication failed");
        assert_eq!(
            client.recv().await,
            Some(Err(TransportError::Closed {
                code: 4004,
                reason: "authentication failed".into()
            }))
        );
        assert_eq!(client.recv().await, None);

        let mut second = connector.connect().await.expect("connect");
        drop(server.accept().await.expect("peer"));
        assert_eq!(second.recv().await, None);
    }
}
