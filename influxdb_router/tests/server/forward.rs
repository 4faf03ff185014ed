use std::time::Duration;

use mockito::{Matcher, Server};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;

use crate::server::{TestServer, gzip};

#[test_log::test(tokio::test)]
async fn accepted_batches_reach_the_tenant_database() {
    let mut backend = Server::new_async().await;
    backend
        .mock("GET", "/ping")
        .with_status(204)
        .create_async()
        .await;

    let lp = "cpu,host=a usage=0.5 1\n";
    let body = gzip(lp);
    let write = backend
        .mock("POST", "/write")
        .match_query(Matcher::UrlEncoded("db".into(), "globex".into()))
        .match_header("content-encoding", "gzip")
        .match_body(Matcher::from(body.clone()))
        .with_status(204)
        .create_async()
        .await;

    let server = TestServer::configure()
        .with_tenant("acme", "acme-secret-key")
        .with_tenant("globex", "globex-secret-key")
        .with_backend_url(backend.url())
        .spawn()
        .await;

    let resp = server.write(Some("globex-secret-key"), body).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let mut attempts = 0;
    while !write.matched_async().await {
        attempts += 1;
        assert!(attempts < 500, "batch was not forwarded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_log::test(tokio::test)]
async fn forwarded_batch_carries_a_request_id() {
    let mut backend = Server::new_async().await;
    backend
        .mock("GET", "/ping")
        .with_status(204)
        .create_async()
        .await;
    let write = backend
        .mock("POST", "/write")
        .match_header(
            "x-request-id",
            Matcher::Regex(
                "^[0-9a-f]{8}-[0-9a-f]{4}-7[0-9a-f]{3}-[0-9a-f]{4}-[0-9a-f]{12}$".to_string(),
            ),
        )
        .with_status(204)
        .create_async()
        .await;

    let server = TestServer::configure()
        .with_tenant("acme", "acme-secret-key")
        .with_backend_url(backend.url())
        .spawn()
        .await;

    let resp = server
        .write(Some("acme-secret-key"), gzip("mem free=1 1\n"))
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let mut attempts = 0;
    while !write.matched_async().await {
        attempts += 1;
        assert!(attempts < 500, "batch was not forwarded with a request id");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_log::test(tokio::test)]
async fn backend_rejection_does_not_affect_the_agent() {
    let mut backend = Server::new_async().await;
    backend
        .mock("GET", "/ping")
        .with_status(204)
        .create_async()
        .await;
    let write = backend
        .mock("POST", "/write")
        .with_status(500)
        .with_body("internal error")
        .expect_at_least(1)
        .create_async()
        .await;

    let server = TestServer::configure()
        .with_tenant("acme", "acme-secret-key")
        .with_backend_url(backend.url())
        .spawn()
        .await;

    for _ in 0..3 {
        let resp = server
            .write(Some("acme-secret-key"), gzip("mem free=1 1\n"))
            .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    let mut attempts = 0;
    while !write.matched_async().await {
        attempts += 1;
        assert!(attempts < 500, "batch was not forwarded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.health().await, StatusCode::OK);
}

#[test_log::test(tokio::test)]
async fn backend_token_is_presented() {
    let mut backend = Server::new_async().await;
    let ping = backend
        .mock("GET", "/ping")
        .match_header("authorization", "Token backend-s3cret")
        .with_status(204)
        .expect_at_least(1)
        .create_async()
        .await;
    let write = backend
        .mock("POST", "/write")
        .match_query(Matcher::Any)
        .match_header("authorization", "Token backend-s3cret")
        .with_status(204)
        .create_async()
        .await;

    let server = TestServer::configure()
        .with_tenant("acme", "acme-secret-key")
        .with_backend_url(backend.url())
        .with_backend_token("backend-s3cret")
        .spawn()
        .await;
    ping.assert_async().await;

    let resp = server
        .write(Some("acme-secret-key"), gzip("mem free=1 1\n"))
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let mut attempts = 0;
    while !write.matched_async().await {
        attempts += 1;
        assert!(attempts < 500, "batch was not forwarded with the backend token");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
