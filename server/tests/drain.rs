#![allow(clippy::unwrap_used)]

use axum::Router;
use axum::routing::get;
use molt_server::UpgradeError;
use molt_server::listener;
use molt_server::shutdown::ServeTask;
use molt_server::shutdown::drain;
use molt_server::shutdown::spawn_serve;
use std::time::Duration;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn drain_deadline_forces_exit() {
    let bound = listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = bound.local_addr().unwrap();
    let app = Router::new().route(
        "/slow",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "slow"
        }),
    );
    let token = CancellationToken::new();
    let ServeTask { mut handle, ready } = spawn_serve(bound, app, token.clone());
    ready.await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nhost: localhost\r\n\r\n")
        .await
        .unwrap();
    // Give the request time to reach the handler so it counts as in flight.
    tokio::time::sleep(Duration::from_millis(200)).await;

    token.cancel();
    let started = Instant::now();
    let deadline = Duration::from_millis(300);
    match drain(&mut handle, deadline).await {
        Err(UpgradeError::DrainTimeout { deadline: reported }) => {
            assert_eq!(reported, deadline);
        }
        other => panic!("expected DrainTimeout, got {other:?}"),
    }
    // Deadline + epsilon, never an indefinite hang.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn drain_completes_cleanly_without_in_flight_work() {
    let bound = listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let app = Router::new().route("/", get(|| async { "ok" }));
    let token = CancellationToken::new();
    let ServeTask { mut handle, ready } = spawn_serve(bound, app, token.clone());
    ready.await.unwrap();

    token.cancel();
    drain(&mut handle, Duration::from_secs(1)).await.unwrap();
}
