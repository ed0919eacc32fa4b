use std::net::Ipv4Addr;

use tracing::warn;


/// Returns the IPv4 addresses of all network interfaces that are up.
///
/// Used by multicast-receive endpoints to join a group on every interface,
/// and by callers that want to bind to a specific local address.
pub fn interface_addresses() -> Vec<Ipv4Addr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter_map(|interface| match interface.addr {
                if_addrs::IfAddr::V4(v4) => Some(v4.ip),
                if_addrs::IfAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            warn!("error enumerating network interfaces: {}", e);
            Vec::new()
        }
    }
}
