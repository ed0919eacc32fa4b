use std::cmp::min;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use tokio::io::Interest;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

use crate::diagnostics::sender::{
    DiagnosticDelegate, DiagnosticsSender, SubscriptionHandle, LEVEL_ERROR, LEVEL_WARNING,
};
use crate::net::config::ConnectionConfig;
use crate::util::byte_queue::ByteQueue;


/// The callbacks a connection owner provides to [`NetworkConnection::process`].
/// Both are invoked from the connection's worker task with all internal locks
/// released, so they may call back into the connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called with every chunk of bytes received from the peer. Chunks may
    /// be coalesced or split differently from how the peer sent them, but
    /// the byte order is exactly the order received.
    async fn on_message(&self, message: Bytes);

    /// Called exactly once per session when the session ends, regardless of
    /// the reason. `graceful` is true when the peer sent an orderly close.
    async fn on_broken(&self, graceful: bool);
}


/// One established TCP session with a peer.
///
/// Lifecycle: construct, [`connect`](NetworkConnection::connect) (or receive
/// an already-connected instance from an endpoint), then
/// [`process`](NetworkConnection::process) to start the dedicated I/O worker.
/// Outbound data is queued by [`send`](NetworkConnection::send) and written
/// by the worker as the socket accepts it.
///
/// The object may be recycled: a second `connect` tears down any prior
/// session (firing the broken delegate once) before opening the new one.
///
/// Dropping the handle tears the session down abruptly without invoking the
/// broken delegate; call [`close`](NetworkConnection::close) for defined
/// shutdown semantics.
pub struct NetworkConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    state: RwLock<ConnectionState>,
    /// wakes the worker when user code changed connection state
    state_change: Notify,
    /// outside the lock so teardown can be requested without locking
    stop_worker: AtomicBool,
    diagnostics: DiagnosticsSender,
    config: ConnectionConfig,
}

struct ConnectionState {
    socket: Option<Arc<TcpStream>>,
    peer_address: Ipv4Addr,
    peer_port: u16,
    bound_address: Ipv4Addr,
    bound_port: u16,
    handler: Option<Arc<dyn ConnectionHandler>>,
    output_queue: ByteQueue,
    peer_closed: bool,
    closing: bool,
    shutdown_sent: bool,
    /// latch guaranteeing the broken delegate fires at most once per session
    broken_fired: bool,
    worker: Option<JoinHandle<()>>,
}

impl ConnectionState {
    fn detached() -> ConnectionState {
        ConnectionState {
            socket: None,
            peer_address: Ipv4Addr::UNSPECIFIED,
            peer_port: 0,
            bound_address: Ipv4Addr::UNSPECIFIED,
            bound_port: 0,
            handler: None,
            output_queue: ByteQueue::new(),
            peer_closed: false,
            closing: false,
            shutdown_sent: false,
            broken_fired: false,
            worker: None,
        }
    }
}

impl NetworkConnection {
    pub fn new() -> NetworkConnection {
        NetworkConnection::with_config(ConnectionConfig::default())
    }

    pub fn with_config(config: ConnectionConfig) -> NetworkConnection {
        NetworkConnection {
            inner: Arc::new(ConnectionInner {
                state: RwLock::new(ConnectionState::detached()),
                state_change: Notify::new(),
                stop_worker: AtomicBool::new(false),
                diagnostics: DiagnosticsSender::new("NetworkConnection"),
                config,
            }),
        }
    }

    /// Wraps an already-connected socket, as produced by an accepting
    /// endpoint. The worker is not started; the owner chooses the delegates
    /// by calling [`process`](NetworkConnection::process).
    pub(crate) fn from_accepted(
        stream: TcpStream,
        bound: SocketAddrV4,
        peer: SocketAddrV4,
    ) -> NetworkConnection {
        let connection = NetworkConnection::new();
        {
            let state = connection.inner.state.try_write();
            let mut state = state.expect("freshly created state is uncontended");
            state.socket = Some(Arc::new(stream));
            state.bound_address = *bound.ip();
            state.bound_port = bound.port();
            state.peer_address = *peer.ip();
            state.peer_port = peer.port();
        }
        connection
    }

    /// Establishes a connection to the given peer, tearing down any prior
    /// session first (firing its broken delegate once). The socket is
    /// configured for abortive close (`SO_LINGER {on, 0}`) and bound to an
    /// ephemeral local port, which is recorded along with the local address.
    pub async fn connect(&self, peer_address: Ipv4Addr, peer_port: u16) -> anyhow::Result<()> {
        if let Some(handler) = self.shut_down_session().await {
            handler.on_broken(false).await;
        }

        let diagnostics = &self.inner.diagnostics;
        let socket = TcpSocket::new_v4()
            .map_err(|e| publish_error(diagnostics, "error creating socket", e))?;
        socket
            .bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(|e| publish_error(diagnostics, "error in bind", e))?;
        let stream = socket
            .connect(SocketAddr::V4(SocketAddrV4::new(peer_address, peer_port)))
            .await
            .map_err(|e| publish_error(diagnostics, "error in connect", e))?;
        let _ = SockRef::from(&stream).set_linger(Some(Duration::from_secs(0)));
        let bound = match stream.local_addr() {
            Ok(SocketAddr::V4(address)) => address,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };

        let mut state = self.inner.state.write().await;
        *state = ConnectionState::detached();
        state.socket = Some(Arc::new(stream));
        state.peer_address = peer_address;
        state.peer_port = peer_port;
        state.bound_address = *bound.ip();
        state.bound_port = bound.port();
        Ok(())
    }

    /// Starts the dedicated worker that reads from the socket, delivers
    /// received bytes to the handler, and writes queued outbound data.
    /// Calling it again while already processing publishes a warning and
    /// succeeds without effect.
    pub async fn process(&self, handler: Arc<dyn ConnectionHandler>) -> anyhow::Result<()> {
        let mut state = self.inner.state.write().await;
        if state.socket.is_none() {
            self.inner.diagnostics.publish(LEVEL_ERROR, "not connected");
            bail!("not connected");
        }
        if state.worker.is_some() {
            self.inner.diagnostics.publish(LEVEL_WARNING, "already processing");
            return Ok(());
        }
        state.handler = Some(handler);
        state.broken_fired = false;
        self.inner.stop_worker.store(false, Ordering::Release);
        state.worker = Some(tokio::spawn(run_worker(self.inner.clone())));
        Ok(())
    }

    /// Appends the given data to the outbound queue and wakes the worker.
    /// Never fails locally; send failures surface through the broken
    /// delegate.
    pub async fn send(&self, message: impl Into<Bytes> + Send) {
        let mut state = self.inner.state.write().await;
        state.output_queue.enqueue(message.into());
        self.inner.state_change.notify_one();
    }

    /// Ends the session.
    ///
    /// With `clean == false` the connection closes immediately, discarding
    /// any queued outbound data, and the broken delegate fires with
    /// `graceful == false` (unless it already fired this session).
    ///
    /// With `clean == true` the worker first drains the outbound queue, then
    /// half-closes the send side, and fully closes once the peer has closed
    /// as well.
    pub async fn close(&self, clean: bool) {
        if clean {
            let mut state = self.inner.state.write().await;
            if state.socket.is_some() {
                state.closing = true;
                self.inner.diagnostics.publish(1, "closing connection");
                self.inner.state_change.notify_one();
            }
        } else if let Some(handler) = self.shut_down_session().await {
            handler.on_broken(false).await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.read().await.socket.is_some()
    }

    pub async fn peer_address(&self) -> Ipv4Addr {
        self.inner.state.read().await.peer_address
    }

    pub async fn peer_port(&self) -> u16 {
        self.inner.state.read().await.peer_port
    }

    pub async fn bound_address(&self) -> Ipv4Addr {
        self.inner.state.read().await.bound_address
    }

    pub async fn bound_port(&self) -> u16 {
        self.inner.state.read().await.bound_port
    }

    pub fn subscribe_diagnostics(
        &self,
        delegate: DiagnosticDelegate,
        min_level: usize,
    ) -> SubscriptionHandle {
        self.inner.diagnostics.subscribe(delegate, min_level)
    }

    /// Stops the worker, closes the socket and returns the handler to fire
    /// the broken delegate on, if it has not fired yet this session.
    async fn shut_down_session(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.inner.stop_worker.store(true, Ordering::Release);
        self.inner.state_change.notify_one();

        let worker = self.inner.state.write().await.worker.take();
        if let Some(worker) = worker {
            if tokio::task::try_id() == Some(worker.id()) {
                // we are on the worker itself (called from inside a
                //  delegate); it is already unwinding, joining would deadlock
                drop(worker);
            } else {
                let _ = worker.await;
            }
        }

        let mut state = self.inner.state.write().await;
        state.output_queue = ByteQueue::new();
        close_socket_now(&mut state, &self.inner.diagnostics);
        claim_broken_handler(&mut state)
    }
}

impl Default for NetworkConnection {
    fn default() -> NetworkConnection {
        NetworkConnection::new()
    }
}

impl Drop for NetworkConnection {
    fn drop(&mut self) {
        // the worker owns its own reference to the state and unwinds on its
        //  own; no delegate fires on drop
        self.inner.stop_worker.store(true, Ordering::Release);
        self.inner.state_change.notify_one();
    }
}


/// Best-effort IPv4 lookup for a host name, returning the first IPv4 result
/// of a synchronous DNS query, or `None` on any failure.
pub fn address_of_host(host_name: &str) -> Option<Ipv4Addr> {
    let addresses = (host_name, 0u16).to_socket_addrs().ok()?;
    for address in addresses {
        if let SocketAddr::V4(v4) = address {
            return Some(*v4.ip());
        }
    }
    None
}


fn publish_error(
    diagnostics: &DiagnosticsSender,
    what: &str,
    e: impl std::fmt::Display,
) -> anyhow::Error {
    let message = format!("{} ({})", what, e);
    diagnostics.publish(LEVEL_ERROR, &message);
    anyhow!(message)
}

fn claim_broken_handler(state: &mut ConnectionState) -> Option<Arc<dyn ConnectionHandler>> {
    match &state.handler {
        Some(handler) if !state.broken_fired => {
            state.broken_fired = true;
            Some(handler.clone())
        }
        _ => None,
    }
}

fn close_socket_now(state: &mut ConnectionState, diagnostics: &DiagnosticsSender) {
    // the last clone of the stream closes the socket; linger {on, 0} makes
    //  that an abortive close
    if state.socket.take().is_some() {
        diagnostics.publish(1, "closed connection");
    }
}


async fn run_worker(inner: Arc<ConnectionInner>) {
    let diagnostics = inner.diagnostics.clone();
    let max_read_size = inner.config.max_read_size;
    let max_write_size = inner.config.max_write_size;
    let mut wait = true;

    loop {
        if inner.stop_worker.load(Ordering::Acquire) {
            break;
        }
        let (socket, interest) = {
            let state = inner.state.read().await;
            let Some(socket) = state.socket.clone() else {
                break;
            };
            let mut interest = None;
            if !state.peer_closed {
                interest = Some(Interest::READABLE);
            }
            if state.output_queue.bytes_queued() > 0 {
                interest = Some(match interest {
                    Some(interest) => interest | Interest::WRITABLE,
                    None => Interest::WRITABLE,
                });
            }
            (socket, interest)
        };

        if wait {
            diagnostics.publish(0, "worker going to sleep");
            match interest {
                Some(interest) => {
                    tokio::select! {
                        _ = socket.ready(interest) => {}
                        _ = inner.state_change.notified() => {}
                    }
                }
                None => inner.state_change.notified().await,
            }
        }
        diagnostics.publish(0, "worker woke up");
        wait = true;
        if inner.stop_worker.load(Ordering::Acquire) {
            break;
        }

        let mut state = inner.state.write().await;
        if state.socket.is_none() {
            break;
        }

        if !state.peer_closed {
            diagnostics.publish(0, "worker trying to read");
            let mut buffer = BytesMut::zeroed(max_read_size);
            match socket.try_read(&mut buffer) {
                Ok(received) if received > 0 => {
                    diagnostics.publish(0, "worker read something");
                    buffer.truncate(received);
                    let handler = state.handler.clone();
                    drop(state);
                    if let Some(handler) = handler {
                        handler.on_message(buffer.freeze()).await;
                    }
                    wait = false;
                    state = inner.state.write().await;
                }
                Ok(_) => {
                    diagnostics.publish(1, "connection closed gracefully by peer");
                    state.peer_closed = true;
                    let broken = claim_broken_handler(&mut state);
                    drop(state);
                    if let Some(handler) = broken {
                        handler.on_broken(true).await;
                    }
                    state = inner.state.write().await;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    diagnostics.publish(1, format!("connection closed abruptly by peer ({})", e));
                    close_socket_now(&mut state, &diagnostics);
                    let broken = claim_broken_handler(&mut state);
                    drop(state);
                    if let Some(handler) = broken {
                        handler.on_broken(false).await;
                    }
                    break;
                }
            }
        }
        if state.socket.is_none() {
            break;
        }

        let queued = state.output_queue.bytes_queued();
        if queued > 0 {
            diagnostics.publish(0, "worker trying to write");
            let write_size = min(queued, max_write_size);
            let chunk = state.output_queue.peek(write_size);
            match socket.try_write(&chunk) {
                Ok(sent) if sent > 0 => {
                    diagnostics.publish(0, "worker wrote something");
                    state.output_queue.drop_bytes(sent);
                    if sent == write_size && state.output_queue.bytes_queued() > 0 {
                        diagnostics.publish(0, "worker has more to write");
                        wait = false;
                    }
                }
                Ok(_) => {
                    // the socket accepting zero bytes is treated as
                    //  unrecoverable; known quirk of this implementation
                    diagnostics.publish(0, "worker breaking due to send returning 0");
                    close_socket_now(&mut state, &diagnostics);
                    let broken = claim_broken_handler(&mut state);
                    drop(state);
                    if let Some(handler) = broken {
                        handler.on_broken(false).await;
                    }
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // queued data stays for the next readiness event
                }
                Err(e) => {
                    diagnostics.publish(1, format!("connection closed abruptly by peer ({})", e));
                    close_socket_now(&mut state, &diagnostics);
                    let broken = claim_broken_handler(&mut state);
                    drop(state);
                    if let Some(handler) = broken {
                        handler.on_broken(false).await;
                    }
                    diagnostics.publish(0, "worker breaking due to send error");
                    break;
                }
            }
        }

        if state.output_queue.bytes_queued() == 0 && state.closing {
            if !state.shutdown_sent {
                diagnostics.publish(0, "worker closing and done sending");
                if let Some(socket) = &state.socket {
                    let _ = SockRef::from(socket.as_ref()).shutdown(Shutdown::Write);
                }
                state.shutdown_sent = true;
            }
            if state.peer_closed {
                diagnostics.publish(0, "worker closing connection immediately");
                close_socket_now(&mut state, &diagnostics);
                let broken = claim_broken_handler(&mut state);
                drop(state);
                if let Some(handler) = broken {
                    handler.on_broken(false).await;
                }
                break;
            }
        }
    }
    diagnostics.publish(0, "worker stopping");
}
