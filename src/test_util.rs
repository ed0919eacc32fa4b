//! Recording handlers for testing code built on network connections and
//! endpoints. They are used by this crate's own tests, and exported so that
//! applications can await connection and endpoint callbacks in their tests
//! the same way.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::net::connection::{ConnectionHandler, NetworkConnection};
use crate::net::endpoint::EndpointHandler;


const AWAIT_TIMEOUT: Duration = Duration::from_secs(5);


/// Accumulates everything a connection reports and lets tests await it with
/// a bounded timeout.
#[derive(Default)]
pub struct ConnectionRecorder {
    stream: Mutex<Vec<u8>>,
    broken: Mutex<Vec<bool>>,
    changed: Notify,
}

impl ConnectionRecorder {
    pub fn new() -> Arc<ConnectionRecorder> {
        Arc::new(ConnectionRecorder::default())
    }

    /// All bytes received so far, in order.
    pub fn stream(&self) -> Vec<u8> {
        self.stream.lock().unwrap().clone()
    }

    /// The `graceful` flag of every broken callback so far.
    pub fn broken_events(&self) -> Vec<bool> {
        self.broken.lock().unwrap().clone()
    }

    pub fn broken_count(&self) -> usize {
        self.broken.lock().unwrap().len()
    }

    /// Waits until at least `num_bytes` bytes have been received. Returns
    /// false on timeout.
    pub async fn await_stream(&self, num_bytes: usize) -> bool {
        self.await_condition(|| self.stream.lock().unwrap().len() >= num_bytes)
            .await
    }

    /// Waits until the broken delegate has fired at least once. Returns
    /// false on timeout.
    pub async fn await_broken(&self) -> bool {
        self.await_condition(|| !self.broken.lock().unwrap().is_empty())
            .await
    }

    async fn await_condition(&self, condition: impl Fn() -> bool) -> bool {
        timeout(AWAIT_TIMEOUT, async {
            loop {
                // register interest before checking, so a notification
                //  between check and await is not lost
                let notified = self.changed.notified();
                if condition() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl ConnectionHandler for ConnectionRecorder {
    async fn on_message(&self, message: Bytes) {
        self.stream.lock().unwrap().extend_from_slice(&message);
        self.changed.notify_waiters();
    }

    async fn on_broken(&self, graceful: bool) {
        self.broken.lock().unwrap().push(graceful);
        self.changed.notify_waiters();
    }
}


/// A copy of one received datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub address: Ipv4Addr,
    pub port: u16,
    pub body: Vec<u8>,
}

/// Collects the connections and datagrams an endpoint hands out.
///
/// When constructed with
/// [`processing_accepted_with`](EndpointRecorder::processing_accepted_with),
/// every accepted connection is immediately put into processing with the
/// given recorder as its handler, the way a server loop would.
#[derive(Default)]
pub struct EndpointRecorder {
    packets: Mutex<Vec<ReceivedPacket>>,
    connections: Mutex<Vec<Arc<NetworkConnection>>>,
    accepted_handler: Option<Arc<ConnectionRecorder>>,
    changed: Notify,
}

impl EndpointRecorder {
    pub fn new() -> Arc<EndpointRecorder> {
        Arc::new(EndpointRecorder::default())
    }

    pub fn processing_accepted_with(handler: Arc<ConnectionRecorder>) -> Arc<EndpointRecorder> {
        Arc::new(EndpointRecorder {
            accepted_handler: Some(handler),
            ..EndpointRecorder::default()
        })
    }

    pub fn packets(&self) -> Vec<ReceivedPacket> {
        self.packets.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn connection(&self, index: usize) -> Arc<NetworkConnection> {
        self.connections.lock().unwrap()[index].clone()
    }

    /// Waits until at least one connection has been accepted. Returns false
    /// on timeout.
    pub async fn await_connection(&self) -> bool {
        self.await_condition(|| !self.connections.lock().unwrap().is_empty())
            .await
    }

    /// Waits until at least one datagram has been received. Returns false
    /// on timeout.
    pub async fn await_packet(&self) -> bool {
        self.await_condition(|| !self.packets.lock().unwrap().is_empty())
            .await
    }

    async fn await_condition(&self, condition: impl Fn() -> bool) -> bool {
        timeout(AWAIT_TIMEOUT, async {
            loop {
                let notified = self.changed.notified();
                if condition() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl EndpointHandler for EndpointRecorder {
    async fn on_new_connection(&self, connection: NetworkConnection) {
        if let Some(handler) = &self.accepted_handler {
            let _ = connection.process(handler.clone()).await;
        }
        self.connections.lock().unwrap().push(Arc::new(connection));
        self.changed.notify_waiters();
    }

    async fn on_packet(&self, address: Ipv4Addr, port: u16, body: Bytes) {
        self.packets.lock().unwrap().push(ReceivedPacket {
            address,
            port,
            body: body.to_vec(),
        });
        self.changed.notify_waiters();
    }
}
