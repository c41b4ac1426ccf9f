// Bootstrap: dial a fixed set of well-known peers at startup

use crate::transport::{RelayPeer, Transport, TransportError};
use futures::future::join_all;
use libp2p::Multiaddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("No bootstrap peers configured")]
    NoPeers,
    #[error("Bootstrap address has no /p2p/<peer-id>: {0}")]
    MissingPeerId(Multiaddr),
    #[error("Failed to bootstrap: all {attempted} dials failed, last error: {last}")]
    AllFailed {
        attempted: usize,
        last: TransportError,
    },
}

/// Dial every bootstrap peer concurrently.
///
/// Succeeds with the number of peers reached as long as at least one dial
/// works; individual failures are only logged.
pub async fn bootstrap_connect<T: Transport + ?Sized>(
    transport: &T,
    peers: &[Multiaddr],
) -> Result<usize, BootstrapError> {
    if peers.is_empty() {
        return Err(BootstrapError::NoPeers);
    }

    let targets = peers
        .iter()
        .map(|addr| {
            RelayPeer::from_multiaddr(addr.clone())
                .ok_or_else(|| BootstrapError::MissingPeerId(addr.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let dials = targets.iter().map(|peer| async move {
        tracing::info!(peer = %peer.peer_id, addr = %peer.address, "Bootstrap dial");
        let result = transport
            .connect(peer.peer_id, vec![peer.address.clone()])
            .await;
        if let Err(e) = &result {
            tracing::warn!(peer = %peer.peer_id, error = %e, "Bootstrap dial failed");
        }
        result
    });
    let results = join_all(dials).await;

    let connected = results.iter().filter(|r| r.is_ok()).count();
    if connected == 0 {
        let last = results
            .into_iter()
            .filter_map(Result::err)
            .last()
            .unwrap_or(TransportError::NotRunning);
        return Err(BootstrapError::AllFailed {
            attempted: peers.len(),
            last,
        });
    }

    tracing::info!(connected, total = peers.len(), "Bootstrap complete");
    Ok(connected)
}
