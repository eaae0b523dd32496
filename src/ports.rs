//! Ephemeral loopback port selection.
//!
//! The returned numbers are hints: the listener is closed before the caller
//! binds again, so another process can grab the port in between. Callers
//! must handle `AddrInUse` and retry.

use std::net::{Ipv4Addr, TcpListener};

/// Bind `127.0.0.1:0`, read the assigned port, release it.
pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Pick `count` distinct ports. All listeners stay open until every port is
/// assigned, so the numbers cannot collide with each other.
pub fn pick_free_ports(count: usize) -> std::io::Result<Vec<u16>> {
    let listeners = (0..count)
        .map(|_| TcpListener::bind((Ipv4Addr::LOCALHOST, 0)))
        .collect::<std::io::Result<Vec<_>>>()?;
    listeners
        .iter()
        .map(|l| l.local_addr().map(|addr| addr.port()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn picked_port_is_bindable() {
        let port = pick_free_port().unwrap();
        assert!(port > 0);
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn batch_ports_are_distinct() {
        let ports = pick_free_ports(4).unwrap();
        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn rapid_calls_mostly_distinct() {
        let ports: HashSet<u16> = (0..100).map(|_| pick_free_port().unwrap()).collect();
        assert!(ports.len() >= 90, "only {} distinct ports", ports.len());
    }
}
