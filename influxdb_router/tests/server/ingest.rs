use pretty_assertions::assert_eq;
use reqwest::StatusCode;

use crate::server::{API_KEY_HEADER, TestServer, gzip};

#[test_log::test(tokio::test)]
async fn accepted_batch() {
    let server = TestServer::spawn().await;

    let resp = server
        .write(
            Some("acme-secret-key"),
            gzip("cpu,host=a usage=0.5 1\ncpu,host=b usage=0.7 1\n"),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let request_id = resp
        .headers()
        .get("x-request-id")
        .expect("request id echoed")
        .to_str()
        .unwrap()
        .to_string();
    assert!(!request_id.is_empty());
    assert!(resp.text().await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn unknown_or_missing_key_is_unauthorized() {
    let server = TestServer::spawn().await;

    for key in [Some("not-a-tenant-key"), None] {
        let resp = server.write(key, gzip("cpu usage=1 1\n")).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "key: {key:?}");
    }
}

#[test_log::test(tokio::test)]
async fn uncompressed_body_is_bad_request() {
    let server = TestServer::spawn().await;

    let resp = server
        .http_client()
        .post(format!("{base}/write", base = server.client_addr()))
        .header(API_KEY_HEADER, "acme-secret-key")
        .body("cpu usage=1 1\n")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .http_client()
        .post(format!("{base}/write", base = server.client_addr()))
        .header(API_KEY_HEADER, "acme-secret-key")
        .header("Content-Encoding", "deflate")
        .body("cpu usage=1 1\n")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[test_log::test(tokio::test)]
async fn oversized_body_is_rejected() {
    let server = TestServer::configure()
        .with_tenant("acme", "acme-secret-key")
        .with_max_http_request_size(64)
        .spawn()
        .await;

    let resp = server
        .write(Some("acme-secret-key"), vec![0x1f; 1024])
        .await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let resp = server
        .write(Some("acme-secret-key"), vec![0x1f; 32])
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[test_log::test(tokio::test)]
async fn every_request_gets_its_own_id() {
    let server = TestServer::configure()
        .with_tenant("acme", "acme-secret-key")
        .with_tenant("globex", "globex-secret-key")
        .spawn()
        .await;

    let mut ids = Vec::new();
    for key in ["acme-secret-key", "globex-secret-key", "acme-secret-key"] {
        let resp = server.write(Some(key), gzip("mem free=1 1\n")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        ids.push(
            resp.headers()
                .get("x-request-id")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string(),
        );
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[test_log::test(tokio::test)]
async fn unknown_routes() {
    let server = TestServer::spawn().await;
    let client = server.http_client();

    let resp = client
        .get(format!("{base}/query", base = server.client_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .get(format!("{base}/write", base = server.client_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}
