use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

use crate::diagnostics::sender::{
    DiagnosticDelegate, DiagnosticsSender, SubscriptionHandle, LEVEL_ERROR, LEVEL_WARNING,
};
use crate::net::config::EndpointConfig;
use crate::net::connection::NetworkConnection;
use crate::net::interfaces::interface_addresses;


/// What kind of socket an endpoint operates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    /// Bound UDP socket that may both send and receive unicast datagrams.
    Datagram,

    /// Bound, listening TCP socket accepting inbound sessions.
    Connection,

    /// UDP socket with its outgoing interface pinned to the configured
    /// local address; send-only.
    MulticastSend,

    /// UDP socket that joins the configured group on every interface that
    /// is up; receive-only.
    MulticastReceive,
}

/// The callbacks an endpoint owner provides to [`NetworkEndpoint::open`].
/// Invoked from the endpoint's worker task with all internal locks released.
#[async_trait]
pub trait EndpointHandler: Send + Sync + 'static {
    /// Called for every accepted connection in [`EndpointMode::Connection`].
    /// The connection's worker has not been started; the owner chooses the
    /// delegates by calling [`NetworkConnection::process`].
    async fn on_new_connection(&self, _connection: NetworkConnection) {}

    /// Called for every received datagram in [`EndpointMode::Datagram`] and
    /// [`EndpointMode::MulticastReceive`], with the sender's address and
    /// port.
    async fn on_packet(&self, _address: Ipv4Addr, _port: u16, _body: Bytes) {}
}


struct QueuedPacket {
    address: Ipv4Addr,
    port: u16,
    body: Bytes,
}

#[derive(Clone)]
enum EndpointSocket {
    Listener(Arc<TcpListener>),
    Datagram(Arc<UdpSocket>),
}

/// A listener / datagram / multicast socket with a dedicated worker task.
///
/// In [`EndpointMode::Connection`] it accepts inbound sockets and hands
/// fully-formed (but not yet processing) [`NetworkConnection`] instances to
/// the owner; in the datagram modes it pumps unicast or multicast datagrams.
///
/// Dropping the handle tears the endpoint down; call
/// [`close`](NetworkEndpoint::close) to do so deterministically.
pub struct NetworkEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    state: RwLock<EndpointState>,
    state_change: Notify,
    stop_worker: AtomicBool,
    diagnostics: DiagnosticsSender,
    config: EndpointConfig,
}

struct EndpointState {
    socket: Option<EndpointSocket>,
    mode: EndpointMode,
    port: u16,
    handler: Option<Arc<dyn EndpointHandler>>,
    output_queue: VecDeque<QueuedPacket>,
    worker: Option<JoinHandle<()>>,
}

impl NetworkEndpoint {
    pub fn new() -> NetworkEndpoint {
        NetworkEndpoint::with_config(EndpointConfig::default())
    }

    pub fn with_config(config: EndpointConfig) -> NetworkEndpoint {
        NetworkEndpoint {
            inner: Arc::new(EndpointInner {
                state: RwLock::new(EndpointState {
                    socket: None,
                    mode: EndpointMode::Datagram,
                    port: 0,
                    handler: None,
                    output_queue: VecDeque::new(),
                    worker: None,
                }),
                state_change: Notify::new(),
                stop_worker: AtomicBool::new(false),
                diagnostics: DiagnosticsSender::new("NetworkEndPoint"),
                config,
            }),
        }
    }

    /// Opens the endpoint in the given mode, closing any prior session
    /// first.
    ///
    /// `local_address` selects the interface to bind (`0.0.0.0` for any);
    /// for [`EndpointMode::MulticastSend`] it selects the outgoing
    /// interface, and for [`EndpointMode::MulticastReceive`] the group is
    /// joined on every interface that is up and the socket is bound to
    /// `0.0.0.0`. `port` may be 0 to bind ephemerally; the actual port is
    /// read back for every mode except multicast receive, which keeps the
    /// group port it was given.
    ///
    /// On success the worker task is running; any failure closes cleanly,
    /// publishes an ERROR diagnostic naming the failing call, and leaves
    /// the endpoint reusable.
    pub async fn open(
        &self,
        handler: Arc<dyn EndpointHandler>,
        mode: EndpointMode,
        local_address: Ipv4Addr,
        group_address: Ipv4Addr,
        port: u16,
    ) -> anyhow::Result<()> {
        self.close().await;

        let diagnostics = &self.inner.diagnostics;
        let (socket, actual_port) = match mode {
            EndpointMode::Connection => {
                let socket = TcpSocket::new_v4()
                    .map_err(|e| publish_error(diagnostics, "error creating socket", e))?;
                socket
                    .bind(SocketAddr::V4(SocketAddrV4::new(local_address, port)))
                    .map_err(|e| publish_error(diagnostics, "error in bind", e))?;
                let listener = socket
                    .listen(self.inner.config.listen_backlog)
                    .map_err(|e| publish_error(diagnostics, "error in listen", e))?;
                let actual_port = match listener.local_addr() {
                    Ok(SocketAddr::V4(address)) => address.port(),
                    _ => port,
                };
                (EndpointSocket::Listener(Arc::new(listener)), actual_port)
            }
            EndpointMode::Datagram
            | EndpointMode::MulticastSend
            | EndpointMode::MulticastReceive => {
                let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
                    .map_err(|e| publish_error(diagnostics, "error creating socket", e))?;
                if mode == EndpointMode::MulticastSend {
                    socket.set_multicast_if_v4(&local_address).map_err(|e| {
                        publish_error(diagnostics, "error setting socket option IP_MULTICAST_IF", e)
                    })?;
                }
                if mode == EndpointMode::MulticastReceive {
                    socket.set_reuse_address(true).map_err(|e| {
                        publish_error(diagnostics, "error setting socket option SO_REUSEADDR", e)
                    })?;
                }
                let bind_address = match mode {
                    // multicast sockets bind the wildcard address; the
                    //  outgoing interface is already pinned for sends, and
                    //  receives must see group traffic from any interface
                    EndpointMode::MulticastSend | EndpointMode::MulticastReceive => {
                        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)
                    }
                    _ => SocketAddrV4::new(local_address, port),
                };
                socket
                    .bind(&SockAddr::from(bind_address))
                    .map_err(|e| publish_error(diagnostics, "error in bind", e))?;

                let mut actual_port = port;
                if mode == EndpointMode::MulticastReceive {
                    for interface_address in interface_addresses() {
                        socket
                            .join_multicast_v4(&group_address, &interface_address)
                            .map_err(|e| {
                                publish_error(
                                    diagnostics,
                                    &format!(
                                        "error setting socket option IP_ADD_MEMBERSHIP for local interface {}",
                                        interface_address
                                    ),
                                    e,
                                )
                            })?;
                    }
                } else {
                    let local = socket
                        .local_addr()
                        .map_err(|e| publish_error(diagnostics, "error in getsockname", e))?;
                    if let Some(address) = local.as_socket_ipv4() {
                        actual_port = address.port();
                    }
                }

                socket
                    .set_nonblocking(true)
                    .map_err(|e| publish_error(diagnostics, "error making socket non-blocking", e))?;
                let socket = UdpSocket::from_std(socket.into())
                    .map_err(|e| publish_error(diagnostics, "error registering socket", e))?;
                (EndpointSocket::Datagram(Arc::new(socket)), actual_port)
            }
        };

        let mut state = self.inner.state.write().await;
        state.mode = mode;
        state.port = actual_port;
        state.handler = Some(handler);
        state.socket = Some(socket);
        self.inner.stop_worker.store(false, Ordering::Release);
        diagnostics.publish(0, format!("endpoint opened for port {}", state.port));
        state.worker = Some(tokio::spawn(run_worker(self.inner.clone())));
        Ok(())
    }

    /// Queues a datagram for the worker to send and wakes it. Never fails
    /// locally; send failures are published as diagnostics.
    pub async fn send_packet(&self, address: Ipv4Addr, port: u16, body: impl Into<Bytes> + Send) {
        let mut state = self.inner.state.write().await;
        state.output_queue.push_back(QueuedPacket {
            address,
            port,
            body: body.into(),
        });
        self.inner.state_change.notify_one();
    }

    /// Stops the worker, discards queued outbound datagrams and closes the
    /// socket.
    pub async fn close(&self) {
        self.inner.stop_worker.store(true, Ordering::Release);
        self.inner.state_change.notify_one();

        let worker = self.inner.state.write().await.worker.take();
        if let Some(worker) = worker {
            if tokio::task::try_id() == Some(worker.id()) {
                drop(worker);
            } else {
                let _ = worker.await;
            }
        }

        let mut state = self.inner.state.write().await;
        state.output_queue.clear();
        close_socket_now(&mut state, &self.inner.diagnostics);
    }

    /// The port the endpoint is bound to. For multicast receive this is the
    /// group port passed to [`open`](NetworkEndpoint::open); for every other
    /// mode it is the actual (possibly ephemeral) port read back after bind.
    pub async fn bound_port(&self) -> u16 {
        self.inner.state.read().await.port
    }

    pub async fn is_open(&self) -> bool {
        self.inner.state.read().await.socket.is_some()
    }

    pub fn subscribe_diagnostics(
        &self,
        delegate: DiagnosticDelegate,
        min_level: usize,
    ) -> SubscriptionHandle {
        self.inner.diagnostics.subscribe(delegate, min_level)
    }
}

impl Default for NetworkEndpoint {
    fn default() -> NetworkEndpoint {
        NetworkEndpoint::new()
    }
}

impl Drop for NetworkEndpoint {
    fn drop(&mut self) {
        self.inner.stop_worker.store(true, Ordering::Release);
        self.inner.state_change.notify_one();
    }
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

fn close_socket_now(state: &mut EndpointState, diagnostics: &DiagnosticsSender) {
    if state.socket.take().is_some() {
        diagnostics.publish(0, format!("closing endpoint for port {}", state.port));
    }
}


async fn run_worker(inner: Arc<EndpointInner>) {
    let diagnostics = inner.diagnostics.clone();
    let max_read_size = inner.config.max_read_size;
    let mut wait = true;

    loop {
        if inner.stop_worker.load(Ordering::Acquire) {
            break;
        }
        let (socket, mode) = {
            let state = inner.state.read().await;
            let Some(socket) = state.socket.clone() else {
                break;
            };
            (socket, state.mode)
        };

        match &socket {
            EndpointSocket::Listener(listener) => {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                accept_connection(&inner, &diagnostics, stream, peer).await;
                            }
                            Err(e) => {
                                diagnostics.publish(
                                    LEVEL_WARNING,
                                    format!("error in accept ({})", e),
                                );
                            }
                        }
                    }
                    _ = inner.state_change.notified() => {}
                }
            }
            EndpointSocket::Datagram(udp) => {
                let receiving = matches!(
                    mode,
                    EndpointMode::Datagram | EndpointMode::MulticastReceive
                );
                if wait {
                    let mut interest = if receiving {
                        Some(Interest::READABLE)
                    } else {
                        None
                    };
                    if !inner.state.read().await.output_queue.is_empty() {
                        interest = Some(match interest {
                            Some(interest) => interest | Interest::WRITABLE,
                            None => Interest::WRITABLE,
                        });
                    }
                    match interest {
                        Some(interest) => {
                            tokio::select! {
                                _ = udp.ready(interest) => {}
                                _ = inner.state_change.notified() => {}
                            }
                        }
                        None => inner.state_change.notified().await,
                    }
                }
                wait = true;
                if inner.stop_worker.load(Ordering::Acquire) {
                    break;
                }

                let mut state = inner.state.write().await;
                if state.socket.is_none() {
                    break;
                }

                if receiving {
                    let mut buffer = BytesMut::zeroed(max_read_size);
                    match udp.try_recv_from(&mut buffer) {
                        Ok((received, SocketAddr::V4(peer))) if received > 0 => {
                            buffer.truncate(received);
                            let handler = state.handler.clone();
                            drop(state);
                            if let Some(handler) = handler {
                                handler
                                    .on_packet(*peer.ip(), peer.port(), buffer.freeze())
                                    .await;
                            }
                            state = inner.state.write().await;
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            diagnostics
                                .publish(LEVEL_ERROR, format!("error in recvfrom ({})", e));
                            close_socket_now(&mut state, &diagnostics);
                            break;
                        }
                    }
                }

                if let Some(packet) = state.output_queue.front() {
                    let target = SocketAddr::V4(SocketAddrV4::new(packet.address, packet.port));
                    let body_len = packet.body.len();
                    match udp.try_send_to(&packet.body, target) {
                        Ok(sent) => {
                            if sent != body_len {
                                diagnostics.publish(
                                    LEVEL_ERROR,
                                    format!("send truncated ({} < {})", sent, body_len),
                                );
                            }
                            state.output_queue.pop_front();
                            if !state.output_queue.is_empty() {
                                wait = false;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            diagnostics.publish(LEVEL_ERROR, format!("error in sendto ({})", e));
                            close_socket_now(&mut state, &diagnostics);
                            break;
                        }
                    }
                }
            }
        }
    }
    diagnostics.publish(0, "worker stopping");
}

/// Configures an accepted socket for abortive close, reads its endpoints and
/// hands a fully-formed (not yet processing) connection to the owner.
async fn accept_connection(
    inner: &Arc<EndpointInner>,
    diagnostics: &DiagnosticsSender,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) {
    let SocketAddr::V4(peer) = peer else {
        return;
    };
    let _ = SockRef::from(&stream).set_linger(Some(Duration::from_secs(0)));
    let bound = match stream.local_addr() {
        Ok(SocketAddr::V4(address)) => address,
        _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    };
    diagnostics.publish(
        1,
        format!("accepted connection from {}:{}", peer.ip(), peer.port()),
    );
    let connection = NetworkConnection::from_accepted(stream, bound, peer);
    let handler = inner.state.read().await.handler.clone();
    if let Some(handler) = handler {
        handler.on_new_connection(connection).await;
    }
}


#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use crate::test_util::EndpointRecorder;

    use super::*;

    #[tokio::test]
    async fn test_datagram_receiving() {
        let endpoint = NetworkEndpoint::new();
        let owner = EndpointRecorder::new();
        endpoint
            .open(
                owner.clone(),
                EndpointMode::Datagram,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                0,
            )
            .await
            .unwrap();
        let endpoint_port = endpoint.bound_port().await;
        assert_ne!(0, endpoint_port);

        let foreign = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let foreign_port = foreign.local_addr().unwrap().port();
        let body = vec![0x12u8, 0x34, 0x56, 0x78];
        foreign
            .send_to(&body, ("127.0.0.1", endpoint_port))
            .await
            .unwrap();

        assert!(owner.await_packet().await);
        let packets = owner.packets();
        assert_eq!(1, packets.len());
        assert_eq!(Ipv4Addr::from(0x7F000001), packets[0].address);
        assert_eq!(foreign_port, packets[0].port);
        assert_eq!(body, packets[0].body);
    }

    #[tokio::test]
    async fn test_datagram_sending() {
        let endpoint = NetworkEndpoint::new();
        let owner = EndpointRecorder::new();
        endpoint
            .open(
                owner.clone(),
                EndpointMode::Datagram,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                0,
            )
            .await
            .unwrap();
        let endpoint_port = endpoint.bound_port().await;

        let foreign = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let foreign_port = foreign.local_addr().unwrap().port();
        let body = vec![1u8, 2, 3, 4, 5];
        endpoint
            .send_packet(Ipv4Addr::LOCALHOST, foreign_port, body.clone())
            .await;

        let mut buffer = [0u8; 65536];
        let (received, from) = timeout(Duration::from_secs(5), foreign.recv_from(&mut buffer))
            .await
            .expect("datagram should arrive")
            .unwrap();
        // the datagram must carry the endpoint's bound port as its source
        assert_eq!(endpoint_port, from.port());
        assert_eq!(body.as_slice(), &buffer[..received]);
    }

    #[tokio::test]
    async fn test_datagrams_sent_in_enqueue_order() {
        let endpoint = NetworkEndpoint::new();
        let owner = EndpointRecorder::new();
        endpoint
            .open(
                owner.clone(),
                EndpointMode::Datagram,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                0,
            )
            .await
            .unwrap();

        let foreign = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let foreign_port = foreign.local_addr().unwrap().port();
        for i in 0u8..5 {
            endpoint
                .send_packet(Ipv4Addr::LOCALHOST, foreign_port, vec![i])
                .await;
        }

        let mut buffer = [0u8; 16];
        for i in 0u8..5 {
            let (received, _) = timeout(Duration::from_secs(5), foreign.recv_from(&mut buffer))
                .await
                .expect("datagram should arrive")
                .unwrap();
            assert_eq!(&[i][..], &buffer[..received]);
        }
    }

    #[tokio::test]
    async fn test_multicast_send_leaves_socket_open() {
        let endpoint = NetworkEndpoint::new();
        let owner = EndpointRecorder::new();
        endpoint
            .open(
                owner.clone(),
                EndpointMode::MulticastSend,
                Ipv4Addr::LOCALHOST,
                Ipv4Addr::new(239, 255, 0, 1),
                0,
            )
            .await
            .unwrap();
        assert!(endpoint.is_open().await);
        assert_ne!(0, endpoint.bound_port().await);
    }

    #[tokio::test]
    async fn test_endpoint_is_reusable_after_close() {
        let endpoint = NetworkEndpoint::new();
        let owner = EndpointRecorder::new();
        endpoint
            .open(
                owner.clone(),
                EndpointMode::Datagram,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                0,
            )
            .await
            .unwrap();
        assert!(endpoint.is_open().await);

        endpoint.close().await;
        assert!(!endpoint.is_open().await);

        endpoint
            .open(
                owner.clone(),
                EndpointMode::Datagram,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                0,
            )
            .await
            .unwrap();
        assert!(endpoint.is_open().await);
        assert_ne!(0, endpoint.bound_port().await);
    }
}
