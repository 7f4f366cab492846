//! Helpers for tests that run real servers on the loopback interface.

#![allow(missing_docs)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use tokio::net::TcpStream;

pub fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// A random high port that was free a moment ago.
pub fn pick_unused_port() -> u16 {
    let start = rand::random::<u16>() & 0x7fff;
    for low_bits in start..start + 50 {
        let port = (low_bits & 0x7fff) | 0x8000;
        if TcpListener::bind(localhost(port)).is_ok() {
            return port;
        }
    }
    panic!("Cannot find a free TCP port");
}

/// Give a freshly spawned server a couple of seconds to start accepting.
pub async fn wait_until_serving(addr: &SocketAddr) {
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_ok() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn picked_port_can_be_served() {
        let addr = localhost(pick_unused_port());
        assert!(addr.port() >= 0x8000);
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        wait_until_serving(&addr).await;
        assert!(TcpStream::connect(addr).await.is_ok());
    }
}
