//! Accept loop and per-connection sessions
//!
//! ```text
//!  SOCKS client ──► listener ──► session ──► ClientFactory::dial ──► bridge
//!                                  │
//!                         copy_bidirectional
//! ```

use crate::args::PtArgs;
use crate::controller::{TransportEvents, notify};
use crate::dialer::Dialer;
use crate::socks5::{ReplyCode, SocksConn};
use crate::transport::{ClientFactory, TransportId};
use crate::{Error, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pause before accepting again when the process is out of descriptors
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(50);

/// SessionContext is what every connection of one running transport shares
pub struct SessionContext {
    pub method: TransportId,
    pub factory: Arc<dyn ClientFactory>,
    pub dialer: Dialer,
    /// Static arguments merged into every connection
    pub extra_args: PtArgs,
    pub events: Option<Arc<dyn TransportEvents>>,
    pub shutdown: CancellationToken,
}

/// accept_loop hands every inbound connection to its own session until
/// shutdown fires or the listener fails for good. The listener is closed
/// when this returns.
pub async fn accept_loop(listener: TcpListener, ctx: Arc<SessionContext>, sessions: TaskTracker) -> Result<()> {
    let method = ctx.method;

    loop {
        let accepted = tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                debug!("{} accept loop shutting down", method);
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) if is_transient(&e) => {
                warn!("{} accept failed, retrying: {}", method, e);
                if is_exhausted(&e) {
                    tokio::time::sleep(EXHAUSTED_BACKOFF).await;
                }
                continue;
            }
            Err(e) => {
                error!("{} accept failed: {}", method, e);
                return Err(e.into());
            }
        };

        // DEBUG
        debug!("{} new connection from {}", method, peer);

        stream.set_nodelay(true).ok();
        let ctx = ctx.clone();
        sessions.spawn(client_handler(stream, peer, ctx));
    }
}

/// client_handler serves one SOCKS connection from handshake to close
pub async fn client_handler<S>(stream: S, peer: SocketAddr, ctx: Arc<SessionContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let method = ctx.method;

    let outcome = tokio::select! {
        _ = ctx.shutdown.cancelled() => Outcome::Closed,
        outcome = serve(stream, &ctx) => outcome,
    };

    match outcome {
        Outcome::Handshake(e) => warn!("{} SOCKS handshake with {} failed: {}", method, peer, e),
        Outcome::Closed => {
            debug!("{} session from {} closed", method, peer);
            notify(&ctx.events, move |ev| ev.stopped(method, None));
        }
        Outcome::Failed(e) => {
            notify(&ctx.events, move |ev| ev.stopped(method, Some(e)));
        }
    }
}

enum Outcome {
    /// The client never got as far as a request; nothing to report
    Handshake(Error),
    /// Relay finished cleanly or was shut down
    Closed,
    Failed(Error),
}

async fn serve<S>(stream: S, ctx: &SessionContext) -> Outcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let method = ctx.method;

    // Step 1: SOCKS5 handshake
    let mut conn = match SocksConn::accept(stream).await {
        Ok(conn) => conn,
        Err(e) => return Outcome::Handshake(e),
    };

    // Step 2: static arguments
    let mut args = conn.req.args.clone();
    args.merge_defaults(&ctx.extra_args);

    // Step 3: arguments snapshot
    let parsed = match ctx.factory.parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("{} error parsing PT args: {}", method, e);
            conn.reject(ReplyCode::ServerFailure).await.ok();
            return Outcome::Failed(e);
        }
    };

    // Step 4: dial the bridge
    let target = conn.req.target.clone();
    let mut remote = match ctx.factory.dial(&target, &ctx.dialer, parsed).await {
        Ok(remote) => remote,
        Err(e) => {
            error!("{} error dialing {}: {}", method, target, e);
            conn.reject(reply_for(&e)).await.ok();
            return Outcome::Failed(e);
        }
    };

    // Step 5: grant
    if let Err(e) = conn.grant().await {
        error!("{} grant failed: {}", method, e);
        return Outcome::Failed(e);
    }
    if method == TransportId::Snowflake {
        notify(&ctx.events, move |ev| ev.connected(method));
    }

    // DEBUG
    info!("{} relaying to {}", method, target);

    // Step 6: relay until either side closes
    let mut client = conn.into_inner();
    match copy_bidirectional(&mut client, &mut remote).await {
        Ok((up, down)) => {
            debug!("{} copy loop ended ({} bytes up, {} bytes down)", method, up, down);
            Outcome::Closed
        }
        Err(e) => {
            warn!("{} copy loop failed: {}", method, e);
            Outcome::Failed(e.into())
        }
    }
}

/// reply_for picks the SOCKS reply describing a failed dial
fn reply_for(e: &Error) -> ReplyCode {
    match e {
        Error::Io(io) => ReplyCode::from_io_error(io),
        Error::InvalidArgument { .. } => ReplyCode::ServerFailure,
        Error::Dial(msg) | Error::Socks(msg) => {
            if msg.contains(ReplyCode::ConnectionRefused.message()) {
                ReplyCode::ConnectionRefused
            } else if msg.contains(ReplyCode::HostUnreachable.message()) {
                ReplyCode::HostUnreachable
            } else if msg.contains(ReplyCode::NetworkUnreachable.message()) {
                ReplyCode::NetworkUnreachable
            } else {
                ReplyCode::ServerFailure
            }
        }
        _ => ReplyCode::ServerFailure,
    }
}

/// Errors a listener recovers from: the connection was lost before we got
/// to it, or the process ran out of resources for a moment
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_exhausted(e)
}

#[cfg(unix)]
fn is_exhausted(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_exhausted(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));

        #[cfg(unix)]
        {
            let emfile = io::Error::from_raw_os_error(libc::EMFILE);
            assert!(is_transient(&emfile));
            assert!(is_exhausted(&emfile));
        }
    }

    #[test]
    fn test_reply_for_dial_errors() {
        let refused = Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(reply_for(&refused), ReplyCode::ConnectionRefused);

        let upstream = Error::dial("SOCKS5 CONNECT to 192.0.2.1:80 failed: host unreachable");
        assert_eq!(reply_for(&upstream), ReplyCode::HostUnreachable);

        assert_eq!(reply_for(&Error::proxy("nope")), ReplyCode::ServerFailure);
    }
}
