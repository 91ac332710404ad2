//! Server entry point.
//!
//! Binds the listening socket, loads the user store, spawns the worker
//! pool, and runs the accept loop until SIGINT, at which point it drains
//! in-flight connections and tears everything down in order. Grounded on
//! `original_source/robin/src/robin.c`'s `main` (listen/accept/dispatch
//! loop) and `lib/socket.c`'s `socket_open_listen`/`socket_set_keepalive`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpListener;

use crate::cips::CipLog;
use crate::config::{self, Args, Limits};
use crate::pool::WorkerPool;
use crate::users::UserStore;

/// Runs the server to completion: binds, serves, and shuts down cleanly on
/// Ctrl-C. Returns once every connection has been drained.
pub async fn run(args: Args) -> Result<(), io::Error> {
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let users = Arc::new(UserStore::load(&args.users_file).map_err(|e| {
        io::Error::new(io::ErrorKind::Other, format!("loading user store: {e}"))
    })?);
    let cips = Arc::new(CipLog::new());
    let limits = Limits::default();

    let listener = bind_listener(addr)?;
    info!(target: "cips::server", "listening on {addr}, {} users loaded", users.count());

    let mut pool = WorkerPool::spawn(args.workers, users.clone(), cips.clone(), limits);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!(target: "cips::server", "signal received, shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        apply_keepalive(&stream);
                        pool.dispatch(stream, peer.to_string()).await;
                    }
                    Err(e) => warn!(target: "cips::server", "accept failed: {e}"),
                }
            }
        }
    }

    pool.close().await;
    users.shutdown();
    cips.shutdown();
    info!(target: "cips::server", "shutdown complete");
    Ok(())
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, io::Error> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?
    } else {
        socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None)?
    };
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config::LISTEN_BACKLOG as i32)?;

    TcpListener::from_std(socket.into())
}

/// Tunes idle/interval/retry counts beyond what `tokio::net::TcpStream`
/// exposes directly. A failure here is non-fatal — the
/// connection still works, just without tuned keepalive — so we log and
/// move on rather than drop the socket.
fn apply_keepalive(stream: &tokio::net::TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(config::KEEPALIVE_IDLE_SECS))
        .with_interval(Duration::from_secs(config::KEEPALIVE_INTERVAL_SECS));
    #[cfg(not(target_os = "windows"))]
    let keepalive = keepalive.with_retries(config::KEEPALIVE_RETRIES);

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        error!(target: "cips::server", "failed to set keepalive: {e}");
    }
}
