//! TCP accept loop for the relay protocol.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rate_limit::RateLimiter;
use crate::router::Router;
use crate::session::{run_session, SessionSettings};

/// Accept connections until `shutdown` fires, one session task each.
pub async fn run(
    listener: TcpListener,
    router: Arc<Router>,
    settings: SessionSettings,
    limiter: RateLimiter,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Relay listening");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        if !limiter.check(peer.ip()) {
            warn!(%peer, "Connection rate limit exceeded");
            continue;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Could not set TCP_NODELAY");
        }

        debug!(%peer, "Accepted connection");
        tokio::spawn(run_session(
            stream,
            peer,
            router.clone(),
            settings.clone(),
            shutdown.clone(),
        ));
    }

    info!("Relay listener stopped");
}
