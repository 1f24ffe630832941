//! One task per TCP connection.
//!
//! The session owns the socket. It decodes requests, hands each to the
//! [`Router`] in arrival order, writes the reply, and interleaves frames
//! that other sessions route to it through its outbound queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_shared::protocol::{Request, ServerFrame};
use courier_shared::{CodecError, FrameCodec, RelayError};

use crate::config::ServerConfig;
use crate::router::{Reply, Router, SessionState};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_frame_size: usize,
    pub outbound_queue: usize,
    pub idle_timeout: Duration,
    /// Bound on any single socket write.
    pub write_timeout: Duration,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            outbound_queue: config.outbound_queue,
            idle_timeout: config.idle_timeout,
            write_timeout: config.delivery_timeout,
        }
    }
}

/// Serve one connection until the peer leaves, the session is evicted or
/// stalled, it idles out, or the server shuts down.
///
/// Whatever way it ends, durable frames still queued for the session go
/// back to the user's mailbox.
pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, FrameCodec::new(settings.max_frame_size));
    let (tx, mut rx) = mpsc::channel(settings.outbound_queue);
    let cancel = shutdown.child_token();
    let mut state = SessionState::new(tx, cancel.clone());
    let mut unwritten = None;

    let idle = tokio::time::sleep(settings.idle_timeout);
    tokio::pin!(idle);

    debug!(%peer, session = %state.id(), "Session started");

    let outcome: Result<(), CodecError> = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                // Evicted, stalled or shutting down: pass on what is already
                // queued (a FORCED_LOGOUT among it) if the peer is still there.
                unwritten = flush_queued(&mut framed, &mut rx, settings.write_timeout).await;
                break Ok(());
            }

            Some(frame) = rx.recv() => {
                match write(&mut framed, &frame, settings.write_timeout).await {
                    Ok(()) => {}
                    Err(CodecError::FrameTooLarge { size, max }) => {
                        error!(%peer, size, max, "Routed frame cannot fit on the wire, dropping it");
                    }
                    Err(e) => {
                        unwritten = Some(frame);
                        break Err(e);
                    }
                }
            }

            _ = &mut idle => {
                info!(%peer, user = ?state.user(), "Closing idle session");
                break Ok(());
            }

            inbound = framed.next() => {
                let body = match inbound {
                    Some(Ok(body)) => body,
                    Some(Err(e)) => {
                        // The stream is no longer in sync; say why and hang up.
                        let frame = ServerFrame::error(&RelayError::Protocol(e.to_string()));
                        let _ = write(&mut framed, &frame, settings.write_timeout).await;
                        break Err(e);
                    }
                    None => break Ok(()),
                };
                idle.as_mut().reset(Instant::now() + settings.idle_timeout);

                let reply = match Request::decode(&body) {
                    Ok(request) => router.handle(&mut state, request).await,
                    Err(e) => {
                        debug!(%peer, error = %e, "Undecodable request");
                        Reply {
                            frames: vec![ServerFrame::error(&e)],
                            ..Reply::default()
                        }
                    }
                };

                let close = reply.close;
                if let Err(e) = write_reply(&mut framed, reply, &settings).await {
                    break Err(e);
                }
                if close {
                    break Ok(());
                }
            }
        }
    };

    router.disconnect(&mut state, &mut rx, unwritten).await;

    match outcome {
        Ok(()) => debug!(%peer, session = %state.id(), "Session closed"),
        Err(e) => debug!(%peer, session = %state.id(), error = %e, "Session ended"),
    }
}

/// Write the reply frames, then hand off the mailbox snapshot batch by
/// batch. A batch is only committed once written, so an interrupted
/// hand-off leaves the rest for the next login.
///
/// A reply too large for one frame is answered with an `ERROR` instead.
/// The codec refuses it before anything reaches the write buffer, so the
/// stream stays in sync and the session carries on.
async fn write_reply<S>(
    framed: &mut Framed<S, FrameCodec>,
    reply: Reply,
    settings: &SessionSettings,
) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for frame in &reply.frames {
        match write(framed, frame, settings.write_timeout).await {
            Err(CodecError::FrameTooLarge { size, max }) => {
                warn!(size, max, "Reply does not fit in one frame");
                let refusal = ServerFrame::error(&RelayError::InvalidInput(format!(
                    "reply of {size} bytes exceeds the {max} byte frame limit"
                )));
                write(framed, &refusal, settings.write_timeout).await?;
            }
            other => other?,
        }
    }

    let Some(drain) = reply.drain else {
        return Ok(());
    };

    // Leave room for the frame's own envelope around the entries.
    let budget = settings.max_frame_size / 2;
    let mut delivered = 0;
    for batch in drain.batches(budget) {
        let frame = ServerFrame::OfflineMessages {
            entries: batch.to_vec(),
        };
        match write(framed, &frame, settings.write_timeout).await {
            Ok(()) => {}
            Err(CodecError::FrameTooLarge { size, max }) => {
                warn!(size, max, "Mailbox entry too large to hand off");
                break;
            }
            Err(e) => return Err(e),
        }
        if drain.commit(batch).await.is_err() {
            // Logged by the mailbox. The entries come again next login.
            break;
        }
        delivered += batch.len();
    }
    debug!(delivered, pending = drain.len() - delivered, "Mailbox handed off");
    Ok(())
}

async fn write<S>(
    framed: &mut Framed<S, FrameCodec>,
    frame: &ServerFrame,
    limit: Duration,
) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(limit, framed.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "socket write timed out",
        ))),
    }
}

/// Write out what is already queued. Stops at the first failed write and
/// returns that frame; it and everything behind it are left for the
/// router to reclaim.
async fn flush_queued<S>(
    framed: &mut Framed<S, FrameCodec>,
    rx: &mut mpsc::Receiver<ServerFrame>,
    limit: Duration,
) -> Option<ServerFrame>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(frame) = rx.try_recv() {
        if let Err(e) = write(framed, &frame, limit).await {
            debug!(error = %e, "Peer gone while flushing");
            return Some(frame);
        }
    }
    None
}
