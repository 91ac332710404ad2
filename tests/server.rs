//! End-to-end tests driving a live server over real TCP sockets: register/
//! login/logout, duplicate registration, exclusive login, a follow-then-
//! read flow with hashtags, an oversized-command flood, an unknown
//! command, and graceful shutdown with an idle connection outstanding.
//! Each test binds its own server on an ephemeral port against a fresh
//! temp-file user store so tests don't interfere with each other.

use std::sync::Arc;
use std::time::Duration;

use cips::cips::CipLog;
use cips::config::Limits;
use cips::frame;
use cips::pool::WorkerPool;
use cips::users::UserStore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Spawns a server (listener + 2-worker pool) on an ephemeral port and
/// returns the address to connect to, plus a handle to the pool so tests
/// can drive `close()` themselves (graceful-shutdown tests need it; the
/// others just let the runtime tear down with the test).
async fn spawn_server() -> (std::net::SocketAddr, Arc<Mutex<WorkerPool>>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.txt");
    std::mem::forget(dir); // keep the tempdir alive for the test's duration

    let users = Arc::new(UserStore::load(&path).unwrap());
    let cips = Arc::new(CipLog::new());
    let limits = Limits::default();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let pool = Arc::new(Mutex::new(WorkerPool::spawn(2, users, cips, limits)));
    let accept_pool = pool.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            accept_pool.lock().await.dispatch(stream, peer.to_string()).await;
        }
    });

    (addr, pool)
}

async fn connect(addr: std::net::SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

async fn send(stream: &mut TcpStream, cmd: &str) {
    frame::send(stream, cmd.as_bytes()).await.unwrap();
}

async fn recv_line(stream: &mut TcpStream) -> String {
    let bytes = frame::recv(stream, frame::DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap()
        .unwrap();
    String::from_utf8(bytes).unwrap()
}

async fn recv_block(stream: &mut TcpStream) -> Vec<String> {
    let header = recv_line(stream).await;
    let count: i64 = header.split_whitespace().next().unwrap().parse().unwrap();
    let mut lines = vec![header];
    for _ in 0..count.max(0) {
        lines.push(recv_line(stream).await);
    }
    lines
}

#[tokio::test]
async fn register_login_logout_roundtrip() {
    let (addr, _pool) = spawn_server().await;
    let mut c = connect(addr).await;

    send(&mut c, r#"register "a@x.com" "hunter2""#).await;
    assert!(recv_line(&mut c).await.starts_with('0'));

    send(&mut c, r#"login "a@x.com" "hunter2""#).await;
    assert!(recv_line(&mut c).await.starts_with('0'));

    send(&mut c, "logout").await;
    assert!(recv_line(&mut c).await.starts_with('0'));
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let (addr, _pool) = spawn_server().await;
    let mut c = connect(addr).await;

    send(&mut c, r#"register "dup@x.com" "pw""#).await;
    assert!(recv_line(&mut c).await.starts_with('0'));

    send(&mut c, r#"register "dup@x.com" "pw2""#).await;
    assert!(recv_line(&mut c).await.starts_with("-3"));
}

#[tokio::test]
async fn second_login_while_active_is_rejected() {
    let (addr, _pool) = spawn_server().await;

    let mut owner = connect(addr).await;
    send(&mut owner, r#"register "busy@x.com" "pw""#).await;
    recv_line(&mut owner).await;
    send(&mut owner, r#"login "busy@x.com" "pw""#).await;
    assert!(recv_line(&mut owner).await.starts_with('0'));

    let mut intruder = connect(addr).await;
    send(&mut intruder, r#"login "busy@x.com" "pw""#).await;
    assert!(recv_line(&mut intruder).await.starts_with("-3"));
}

#[tokio::test]
async fn follow_then_read_cips_and_hashtags() {
    let (addr, _pool) = spawn_server().await;

    let mut alice = connect(addr).await;
    send(&mut alice, r#"register "alice@x.com" "pw""#).await;
    recv_line(&mut alice).await;
    send(&mut alice, r#"login "alice@x.com" "pw""#).await;
    recv_line(&mut alice).await;

    let mut bob = connect(addr).await;
    send(&mut bob, r#"register "bob@x.com" "pw""#).await;
    recv_line(&mut bob).await;
    send(&mut bob, r#"login "bob@x.com" "pw""#).await;
    recv_line(&mut bob).await;

    send(&mut alice, r#"follow "bob@x.com""#).await;
    let reply = recv_block(&mut alice).await;
    assert_eq!(reply.len(), 2);
    assert!(reply[1].starts_with("bob@x.com 0"));

    send(&mut bob, r#"cip "hello #rust #world""#).await;
    assert!(recv_line(&mut bob).await.starts_with('0'));

    send(&mut alice, "cips_since 0").await;
    let reply = recv_block(&mut alice).await;
    assert_eq!(reply.len(), 2);
    assert!(reply[1].contains("bob@x.com"));
    assert!(reply[1].contains("hello #rust #world"));

    send(&mut alice, "hashtags_since 0").await;
    let reply = recv_block(&mut alice).await;
    assert_eq!(reply.len(), 3); // header + 2 tags
}

#[tokio::test]
async fn oversized_flood_disconnects_the_client() {
    let (addr, _pool) = spawn_server().await;
    let mut c = connect(addr).await;

    let oversized = "x".repeat(400);
    for _ in 0..cips::config::OVERSIZED_THRESHOLD {
        send(&mut c, &oversized).await;
        let line = recv_line(&mut c).await;
        assert!(line.starts_with("-1"));
    }

    // The connection should now be closed by the server.
    let result = frame::recv(&mut c, frame::DEFAULT_MAX_FRAME_LEN).await;
    assert!(matches!(result, Ok(None) | Err(_)));
}

#[tokio::test]
async fn unknown_command_is_rejected_without_closing_connection() {
    let (addr, _pool) = spawn_server().await;
    let mut c = connect(addr).await;

    send(&mut c, "bogus").await;
    assert!(recv_line(&mut c).await.starts_with("-1"));

    // Connection survives a non-fatal error: a follow-up command still works.
    send(&mut c, "help").await;
    let reply = recv_block(&mut c).await;
    assert!(reply.len() > 1);
}

#[tokio::test]
async fn shutdown_completes_promptly_with_an_idle_connection_outstanding() {
    let (addr, pool) = spawn_server().await;

    // Never send this connection anything: its worker is parked in
    // `frame::recv` with nothing to read, the scenario that used to hang
    // `pool.close()` forever.
    let mut idle = connect(addr).await;

    tokio::time::timeout(Duration::from_secs(2), pool.lock().await.close())
        .await
        .expect("pool.close() must return promptly even with an idle connection open");

    // The server closed its end once the worker was cancelled out of its
    // blocked read.
    let result = frame::recv(&mut idle, frame::DEFAULT_MAX_FRAME_LEN).await;
    assert!(matches!(result, Ok(None) | Err(_)));
}
