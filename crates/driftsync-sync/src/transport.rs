//! Transport abstraction for the fast-sync channel.
//!
//! A transport is a bidirectional stream of text messages between exactly two
//! peers. Inbound messages are pulled with [`Transport::recv`]. A
//! [`Connector`] hands out fresh transports so a session can reconnect after
//! a failure.

use async_trait::async_trait;

use crate::error::Result;

/// Transport trait for sending and receiving chunk messages.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message. Resolves once the message has been handed to the
    /// peer's inbound queue.
    async fn send(&self, message: String) -> Result<()>;

    /// Receive the next message. Fails once either side is destroyed.
    async fn recv(&self) -> Result<String>;

    /// Release the transport. Idempotent. Pending and later operations on
    /// both ends fail.
    async fn destroy(&self);
}

/// Produces connected transports, one per (re)connection.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport + 'static;

    async fn connect(&self) -> Result<Self::Transport>;
}

/// In-memory transports and connectors for tests and same-process peers.
pub mod memory {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{mpsc, watch, Mutex};

    use crate::error::SyncError;

    /// One end of an in-memory transport pair.
    pub struct MemoryTransport {
        outbound: mpsc::UnboundedSender<String>,
        inbound: Mutex<mpsc::UnboundedReceiver<String>>,
        local_closed: Arc<watch::Sender<bool>>,
        remote_closed: watch::Receiver<bool>,
    }

    /// Two connected transports.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (a_closed, a_closed_rx) = watch::channel(false);
        let (b_closed, b_closed_rx) = watch::channel(false);

        let a = MemoryTransport {
            outbound: a_tx,
            inbound: Mutex::new(b_rx),
            local_closed: Arc::new(a_closed),
            remote_closed: b_closed_rx,
        };
        let b = MemoryTransport {
            outbound: b_tx,
            inbound: Mutex::new(a_rx),
            local_closed: Arc::new(b_closed),
            remote_closed: a_closed_rx,
        };
        (a, b)
    }

    impl MemoryTransport {
        fn is_closed(&self) -> bool {
            *self.local_closed.borrow() || *self.remote_closed.borrow()
        }

        async fn closed(&self) {
            let mut local = self.local_closed.subscribe();
            let mut remote = self.remote_closed.clone();
            tokio::select! {
                _ = local.wait_for(|c| *c) => {}
                _ = remote.wait_for(|c| *c) => {}
            }
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, message: String) -> Result<()> {
            if self.is_closed() {
                return Err(SyncError::TransportError("transport closed".into()));
            }
            self.outbound
                .send(message)
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }

        async fn recv(&self) -> Result<String> {
            if *self.local_closed.borrow() {
                return Err(SyncError::TransportError("transport closed".into()));
            }
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                biased;
                message = inbound.recv() => {
                    message.ok_or_else(|| SyncError::TransportError("peer disconnected".into()))
                }
                _ = self.closed() => Err(SyncError::TransportError("transport closed".into())),
            }
        }

        async fn destroy(&self) {
            self.local_closed.send_replace(true);
        }
    }

    /// Connects the k-th `connect` of one side with the k-th `connect` of the
    /// other.
    pub struct MemoryConnector {
        role: Side,
        outgoing: mpsc::UnboundedSender<MemoryTransport>,
        incoming: Mutex<mpsc::UnboundedReceiver<MemoryTransport>>,
        connect_timeout: Duration,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Side {
        Initiator,
        Acceptor,
    }

    impl MemoryConnector {
        /// An initiator and an acceptor that rendezvous with each other.
        pub fn pair() -> (MemoryConnector, MemoryConnector) {
            let (to_acceptor, from_initiator) = mpsc::unbounded_channel();
            let (to_initiator, from_acceptor) = mpsc::unbounded_channel();
            let default_timeout = Duration::from_secs(10);

            (
                MemoryConnector {
                    role: Side::Initiator,
                    outgoing: to_acceptor,
                    incoming: Mutex::new(from_acceptor),
                    connect_timeout: default_timeout,
                },
                MemoryConnector {
                    role: Side::Acceptor,
                    outgoing: to_initiator,
                    incoming: Mutex::new(from_initiator),
                    connect_timeout: default_timeout,
                },
            )
        }

        /// Bound how long the acceptor waits for the initiator.
        pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
            self.connect_timeout = timeout;
            self
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        type Transport = MemoryTransport;

        async fn connect(&self) -> Result<MemoryTransport> {
            match self.role {
                Side::Initiator => {
                    let (local, remote) = pair();
                    self.outgoing
                        .send(remote)
                        .map_err(|_| SyncError::TransportError("acceptor gone".into()))?;
                    Ok(local)
                }
                Side::Acceptor => {
                    let mut incoming = self.incoming.lock().await;
                    tokio::time::timeout(self.connect_timeout, incoming.recv())
                        .await
                        .map_err(|_| SyncError::TransportError("no incoming connection".into()))?
                        .ok_or_else(|| SyncError::TransportError("initiator gone".into()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{pair, MemoryConnector};
    use super::*;
    use crate::error::SyncError;

    #[tokio::test]
    async fn test_memory_transport_send_recv() {
        let (a, b) = pair();
        a.send("one".into()).await.unwrap();
        a.send("two".into()).await.unwrap();
        b.send("back".into()).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), "one");
        assert_eq!(b.recv().await.unwrap(), "two");
        assert_eq!(a.recv().await.unwrap(), "back");
    }

    #[tokio::test]
    async fn test_destroy_fails_both_ends() {
        let (a, b) = pair();
        let pending = tokio::spawn(async move {
            let result = b.recv().await;
            (b, result)
        });

        a.destroy().await;
        a.destroy().await;

        let (b, result) = pending.await.unwrap();
        assert!(matches!(result, Err(SyncError::TransportError(_))));
        assert!(b.send("late".into()).await.is_err());
        assert!(a.send("late".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_connector_pairs_kth_connections() {
        let (initiator, acceptor) = MemoryConnector::pair();

        let first = initiator.connect().await.unwrap();
        let second = initiator.connect().await.unwrap();

        let accepted_first = acceptor.connect().await.unwrap();
        let accepted_second = acceptor.connect().await.unwrap();

        first.send("1".into()).await.unwrap();
        second.send("2".into()).await.unwrap();
        assert_eq!(accepted_first.recv().await.unwrap(), "1");
        assert_eq!(accepted_second.recv().await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_acceptor_times_out_without_initiator() {
        let (_initiator, acceptor) = MemoryConnector::pair();
        let acceptor = acceptor.with_connect_timeout(std::time::Duration::from_millis(20));
        assert!(acceptor.connect().await.is_err());
    }
}
