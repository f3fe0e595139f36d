//! Stream server lifecycle tests
//!
//! Covers graceful shutdown against a deadline, hard close, panic recovery,
//! filtered listeners, accept-error backoff and unix socket cleanup.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use relay_proxy::net::{Accepted, Incoming, UnixStreamListener};
use relay_proxy::{
    stream_handler_fn, Connection, Context, FilterListener, Listener, NetAddr, ProxyError,
    ServerOptions, StreamServer,
};

fn echo_server(options: ServerOptions) -> StreamServer {
    StreamServer::with_options(
        "127.0.0.1:0",
        stream_handler_fn(|_ctx, mut conn: Connection| async move {
            let mut buf = [0u8; 256];
            while let Ok(n) = conn.read(&mut buf).await {
                if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }),
        options,
    )
}

async fn spawn_tcp(server: &StreamServer) -> (SocketAddr, JoinHandle<relay_proxy::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = server.clone();
    let serving = tokio::spawn(async move { server.serve(listener).await });
    (addr, serving)
}

async fn wait_for_connections(server: &StreamServer, count: usize) {
    time::timeout(Duration::from_secs(5), async {
        while server.active_connections() != count {
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Test that shutdown reports the deadline while a connection is open, and
/// close then releases it
#[tokio::test]
async fn test_shutdown_deadline_then_close() {
    let server = echo_server(ServerOptions::new());
    let (addr, serving) = spawn_tcp(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    let started = Instant::now();
    let ctx = Context::with_timeout(Duration::from_millis(50));
    let err = server.shutdown(&ctx).await.unwrap_err();
    assert!(matches!(err, ProxyError::DeadlineExceeded));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(server.active_connections(), 1);
    assert_eq!(server.active_listeners(), 0);

    // The accept loop stopped as soon as shutdown began
    assert!(serving.await.unwrap().unwrap_err().is_server_closed());

    server.close().unwrap();
    assert_eq!(server.active_connections(), 0);
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
}

/// Server whose handler keeps the connection and never returns on its own
fn holding_server() -> StreamServer {
    StreamServer::new(
        "127.0.0.1:0",
        stream_handler_fn(|_ctx, conn: Connection| async move {
            let _held = conn;
            time::sleep(Duration::from_secs(3600)).await;
        }),
    )
}

/// Test that close ends a connection the handler is still holding
#[tokio::test]
async fn test_close_ends_held_tcp_connection() {
    let server = holding_server();
    let (addr, _serving) = spawn_tcp(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_for_connections(&server, 1).await;

    server.close().unwrap();
    assert_eq!(server.active_connections(), 0);

    let mut buf = [0u8; 1];
    let n = time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("peer should see the connection end")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

/// Test that close ends a held unix connection
#[tokio::test]
async fn test_close_ends_held_unix_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("held.sock");

    let server = holding_server();
    let listener = UnixStreamListener::bind(path.to_str().unwrap()).unwrap();
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await });
    }

    let mut client = UnixStream::connect(&path).await.unwrap();
    wait_for_connections(&server, 1).await;

    server.close().unwrap();
    let mut buf = [0u8; 1];
    let n = time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("peer should see the connection end")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

/// Test that shutdown returns once every connection has ended
#[tokio::test]
async fn test_shutdown_completes_when_idle() {
    let server = echo_server(ServerOptions::new());
    let (addr, _serving) = spawn_tcp(&server).await;

    let client = TcpStream::connect(addr).await.unwrap();
    wait_for_connections(&server, 1).await;
    drop(client);

    let ctx = Context::with_timeout(Duration::from_secs(5));
    server.shutdown(&ctx).await.unwrap();
    assert_eq!(server.active_connections(), 0);
}

/// Test that serving after close fails without binding
#[tokio::test]
async fn test_serve_after_close_fails() {
    let server = echo_server(ServerOptions::new());
    server.close().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    assert!(server.serve(listener).await.unwrap_err().is_server_closed());
    assert!(server.listen_and_serve().await.unwrap_err().is_server_closed());
    assert_eq!(server.active_listeners(), 0);
}

/// Test that a panicking handler does not take the server down
#[tokio::test]
async fn test_panic_hook_keeps_server_alive() {
    let panics = Arc::new(AtomicUsize::new(0));
    let options = {
        let panics = panics.clone();
        ServerOptions::new().with_panic_hook(move |_payload, _local, _peer| {
            panics.fetch_add(1, Ordering::SeqCst);
        })
    };
    let server = StreamServer::with_options(
        "127.0.0.1:0",
        stream_handler_fn(|_ctx, mut conn: Connection| async move {
            let mut buf = [0u8; 1];
            if conn.read_exact(&mut buf).await.is_ok() && buf[0] == b'!' {
                panic!("handler failure");
            }
            let _ = conn.write_all(b"ok").await;
        }),
        options,
    );
    let (addr, _serving) = spawn_tcp(&server).await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(b"!").await.unwrap();
    let mut buf = [0u8; 2];
    assert_eq!(first.read(&mut buf).await.unwrap_or(0), 0);

    let mut second = TcpStream::connect(addr).await.unwrap();
    second.write_all(b"?").await.unwrap();
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");

    wait_for_connections(&server, 0).await;
    assert_eq!(panics.load(Ordering::SeqCst), 1);
    server.close().unwrap();
}

/// Test that a filtered connection is closed without running the handler
#[tokio::test]
async fn test_filter_listener_skips_denied_peers() {
    let served = Arc::new(AtomicUsize::new(0));
    let server = {
        let served = served.clone();
        StreamServer::new(
            "127.0.0.1:0",
            stream_handler_fn(move |_ctx, _conn| {
                served.fetch_add(1, Ordering::SeqCst);
                async {}
            }),
        )
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let filtered = FilterListener::new(listener, |_ip, _port| false);
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve(filtered).await });
    }

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(served.load(Ordering::SeqCst), 0);
    assert_eq!(server.active_connections(), 0);
    server.close().unwrap();
}

/// Test that the connection count returns to zero as clients leave
#[tokio::test]
async fn test_connection_count_returns_to_zero() {
    let server = echo_server(ServerOptions::new());
    let (addr, _serving) = spawn_tcp(&server).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    wait_for_connections(&server, 3).await;

    clients.clear();
    wait_for_connections(&server, 0).await;
    server.close().unwrap();
}

/// Listener that replays a script of accept outcomes, then blocks
struct ScriptedListener {
    script: Mutex<Vec<bool>>,
    calls: Arc<Mutex<Vec<Instant>>>,
    exhausted: Arc<Notify>,
}

impl Listener for ScriptedListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<Incoming>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(Instant::now());
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    None
                } else {
                    Some(script.remove(0))
                }
            };
            match next {
                Some(true) => {
                    let (stream, _peer) = tokio::io::duplex(64);
                    let addr = NetAddr::Unix("@scripted".to_string());
                    Ok(Incoming::Accepted(Accepted::new(stream, addr.clone(), addr)))
                }
                Some(false) => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "aborted")),
                None => {
                    self.exhausted.notify_one();
                    future::pending().await
                }
            }
        })
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        Ok(NetAddr::Unix("@scripted".to_string()))
    }
}

/// Test that temporary accept errors back off exponentially and a success
/// resets the delay
#[tokio::test(start_paused = true)]
async fn test_accept_error_backoff() {
    let exhausted = Arc::new(Notify::new());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let listener = ScriptedListener {
        script: Mutex::new(vec![false, false, false, true, false]),
        calls: calls.clone(),
        exhausted: exhausted.clone(),
    };
    let server = StreamServer::new("@scripted", stream_handler_fn(|_ctx, _conn| async {}));
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await });
    }

    exhausted.notified().await;
    let calls = calls.lock().unwrap().clone();
    let deltas: Vec<u128> = calls.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
    assert_eq!(deltas, vec![1, 2, 4, 0, 1]);
    server.close().unwrap();
}

/// Test that closing a unix listener removes its socket file
#[tokio::test]
async fn test_unix_socket_file_removed_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.sock");
    let path_str = path.to_str().unwrap().to_string();

    let server = echo_server(ServerOptions::new());
    let listener = UnixStreamListener::bind(&path_str).unwrap();
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let mut client = UnixStream::connect(&path).await.unwrap();
    client.write_all(b"unix").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"unix");
    assert!(path.exists());

    server.close().unwrap();
    assert!(serving.await.unwrap().unwrap_err().is_server_closed());
    assert!(!path.exists());
}
