#![allow(clippy::unwrap_used)]

use axum::Router;
use axum::routing::get;
use molt_pidfd::ProcessHandle;
use molt_server::listener;
use molt_server::shutdown::ServeTask;
use molt_server::shutdown::drain;
use molt_server::shutdown::spawn_serve;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

// The handler must be invocable identically whether the socket was freshly
// bound or duplicated from another process; here the duplicate even outlives
// the original descriptor.
#[tokio::test]
async fn adopted_socket_serves_after_the_original_closes() {
    let bound = listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = bound.local_addr().unwrap();

    let me = ProcessHandle::open(std::process::id()).unwrap();
    let duplicated = me.duplicate_fd(bound.fd).unwrap();
    let adopted = listener::from_duplicated(duplicated).unwrap();
    assert_ne!(adopted.fd, bound.fd);
    drop(bound);

    let app = Router::new().route("/", get(|| async { "hello from the duplicate" }));
    let token = CancellationToken::new();
    let ServeTask { mut handle, ready } = spawn_serve(adopted, app, token.clone());
    ready.await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(response.contains("hello from the duplicate"));

    token.cancel();
    drain(&mut handle, Duration::from_secs(1)).await.unwrap();
}
