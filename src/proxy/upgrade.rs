// src/proxy/upgrade.rs
use hyper::header::{HeaderMap, CONNECTION, UPGRADE};
use metrics::counter;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Bytes moved in each direction by a finished splice.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpliceStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    /// The second direction had to be cut off after the close grace.
    pub forced_close: bool,
}

pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(UPGRADE)
}

/// Copy bytes both ways until one side closes, then give the other direction
/// `grace` to drain before both streams are dropped.
pub async fn splice<C, U>(client: C, upstream: U, grace: Duration) -> SpliceStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let outbound = async {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied.unwrap_or(0)
    };
    let inbound = async {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied.unwrap_or(0)
    };
    tokio::pin!(outbound);
    tokio::pin!(inbound);

    let mut stats = SpliceStats::default();
    tokio::select! {
        sent = &mut outbound => {
            stats.client_to_upstream = sent;
            tracing::debug!("Client closed upgraded connection");
            match timeout(grace, &mut inbound).await {
                Ok(received) => stats.upstream_to_client = received,
                Err(_) => stats.forced_close = true,
            }
        }
        received = &mut inbound => {
            stats.upstream_to_client = received;
            tracing::debug!("Upstream closed upgraded connection");
            match timeout(grace, &mut outbound).await {
                Ok(sent) => stats.client_to_upstream = sent,
                Err(_) => stats.forced_close = true,
            }
        }
    }

    if stats.forced_close {
        counter!("gateway.upgrade.forced_close", 1);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn detects_websocket_handshake() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&headers));

        headers.remove(UPGRADE);
        assert!(!is_upgrade_request(&headers));
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let (client, mut client_peer) = duplex(64);
        let (upstream, mut upstream_peer) = duplex(64);
        let task = tokio::spawn(splice(client, upstream, Duration::from_secs(1)));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client_peer);
        // upstream sees EOF once the client side is gone
        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();
        drop(upstream_peer);

        let stats = task.await.unwrap();
        assert_eq!(stats.client_to_upstream, 4);
        assert_eq!(stats.upstream_to_client, 5);
        assert!(!stats.forced_close);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_upstream_is_cut_after_grace() {
        let (client, client_peer) = duplex(64);
        let (upstream, mut upstream_peer) = duplex(64);
        let task = tokio::spawn(splice(client, upstream, Duration::from_secs(5)));

        drop(client_peer);
        // the upstream never closes its side
        let stats = task.await.unwrap();
        assert!(stats.forced_close);

        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
