/// Tuning knobs for a [`crate::net::connection::NetworkConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum number of bytes read from the socket in one call.
    pub max_read_size: usize,

    /// Maximum number of bytes handed to the socket in one call. The
    ///  outbound queue is peeked up to this size and only the bytes the
    ///  socket actually accepted are dropped from it.
    pub max_write_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            max_read_size: 65536,
            max_write_size: 65536,
        }
    }
}


/// Tuning knobs for a [`crate::net::endpoint::NetworkEndpoint`].
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum number of bytes received from the socket in one call.
    pub max_read_size: usize,

    /// Backlog passed to `listen` in connection mode.
    pub listen_backlog: u32,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            max_read_size: 65536,
            listen_backlog: 1024,
        }
    }
}
