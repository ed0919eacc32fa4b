//! Asynchronous IPv4 network endpoints for building higher-level protocols on
//! top of raw bytes.
//!
//! The crate has two tightly coupled cores:
//!
//! * [`net::connection::NetworkConnection`] - a full-duplex, reliable TCP
//!   byte-stream session with a dedicated I/O worker task, a back-pressured
//!   outbound queue and graceful / abrupt shutdown semantics
//! * [`net::endpoint::NetworkEndpoint`] - a listener / datagram / multicast
//!   socket that accepts inbound sessions (producing connections) or pumps
//!   unicast and multicast datagrams under the same worker discipline
//!
//! Both publish through [`diagnostics::sender::DiagnosticsSender`], a named
//! publish/subscribe bus with per-subscriber level filtering, and the
//! connection send path is backed by [`util::byte_queue::ByteQueue`], whose
//! zero-copy whole-segment transfer is load-bearing.

pub mod diagnostics;
pub mod net;
pub mod test_util;
pub mod util;
