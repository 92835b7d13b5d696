use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::CfshareError;
use crate::error::Result;

const PROBE_TIMEOUT: Duration = Duration::from_millis(1_200);

/// Ask the OS for an ephemeral TCP port on 127.0.0.1, then immediately drop
/// the probe listener so the caller can bind it again.
pub async fn find_free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| CfshareError::Internal(format!("port_allocation_failed: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| CfshareError::Internal(format!("port_allocation_failed: {e}")))?
        .port();
    drop(listener);
    Ok(port)
}

/// Non-blocking connect with a 1.2s timeout; true iff something is
/// listening on 127.0.0.1:port.
pub async fn probe_local_port(port: u16) -> bool {
    let addr: SocketAddr = match format!("127.0.0.1:{port}").parse() {
        Ok(addr) => addr,
        Err(_) => return false,
    };
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_port_is_reusable() {
        let port = find_free_port().await.expect("port");
        let listener = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn probe_detects_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        assert!(probe_local_port(port).await);
    }

    #[tokio::test]
    async fn probe_rejects_closed_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        assert!(!probe_local_port(port).await);
    }
}
