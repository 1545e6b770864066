use lemonade_common::{Error, Result};
use tokio::net::TcpListener;

const MAX_SCAN_ATTEMPTS: u16 = 1024;

/// Find a free loopback TCP port, scanning upward from `seed`. The probe
/// listener is dropped before returning so the caller can bind the port.
pub async fn find_free_port(seed: u16) -> Result<u16> {
    for offset in 0..MAX_SCAN_ATTEMPTS {
        let port = match seed.checked_add(offset) {
            Some(port) => port,
            None => break,
        };
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            drop(listener);
            return Ok(port);
        }
    }
    Err(Error::NoFreePort { seed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finds_port_at_or_after_seed() {
        let port = find_free_port(23500).await.expect("free port");
        assert!(port >= 23500);

        // The probe bind is released: we can take the port ourselves
        let listener = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn test_skips_occupied_port() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let held = holder.local_addr().expect("addr").port();

        let port = find_free_port(held).await.expect("free port");
        assert!(port > held);
    }
}
