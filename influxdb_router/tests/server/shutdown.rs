use std::time::Duration;

use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::server::{TestServer, gzip};

#[test_log::test(tokio::test)]
async fn sigterm_drains_then_exits() {
    let mut server = TestServer::configure()
        .with_tenant("acme", "acme-secret-key")
        .with_wait_before_shutdown(3)
        .spawn()
        .await;
    assert_eq!(server.health().await, StatusCode::OK);

    server.terminate();
    // the signal is handled asynchronously
    let mut draining = false;
    for _ in 0..100 {
        if server.health().await == StatusCode::SERVICE_UNAVAILABLE {
            draining = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(draining, "health probe never failed after SIGTERM");

    // still draining, writes are accepted until the listener closes
    assert_eq!(server.health().await, StatusCode::SERVICE_UNAVAILABLE);
    let resp = server
        .write(Some("acme-secret-key"), gzip("cpu usage=1 1\n"))
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    assert!(server.wait_for_exit(Duration::from_secs(15)).await);
}

#[test_log::test(tokio::test)]
async fn sigterm_while_waiting_for_backend() {
    // nothing listens on the discard port, the backend never becomes ready
    let mut server_process = {
        use assert_cmd::cargo::CommandCargoExt;
        std::process::Command::cargo_bin("influxdb_router")
            .unwrap()
            .arg("serve")
            .args(["--listen-addr", "127.0.0.1"])
            .args(["--listen-http-port", "0"])
            .args(["--backend-url", "http://127.0.0.1:9"])
            .args(["--wait-before-shutdown", "0"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap()
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(server_process.try_wait().unwrap().is_none());

    let rc = unsafe { libc::kill(server_process.id() as i32, libc::SIGTERM) };
    assert_eq!(rc, 0);

    let mut status = None;
    for _ in 0..300 {
        status = server_process.try_wait().unwrap();
        if status.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let _ = server_process.kill();
    assert!(status.expect("process exited").success());
}

#[test_log::test(tokio::test)]
async fn stalled_client_does_not_delay_exit() {
    let mut server = TestServer::configure()
        .with_tenant("acme", "acme-secret-key")
        .with_wait_before_shutdown(1)
        .spawn()
        .await;

    // announce 100 body bytes but only send 10 of them
    let mut stalled = TcpStream::connect(server.bind_addr()).await.unwrap();
    stalled
        .write_all(
            b"POST /write HTTP/1.1\r\n\
              Host: localhost\r\n\
              Service-API-Key: acme-secret-key\r\n\
              Content-Encoding: gzip\r\n\
              Content-Length: 100\r\n\
              \r\n\
              0123456789",
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    server.terminate();
    assert!(server.wait_for_exit(Duration::from_secs(4)).await);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(1),
        "exited before the grace period ended: {elapsed:?}"
    );
    drop(stalled);
}
