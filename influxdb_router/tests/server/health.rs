use pretty_assertions::assert_eq;
use reqwest::StatusCode;

use crate::server::TestServer;

#[test_log::test(tokio::test)]
async fn health_while_serving() {
    let server = TestServer::spawn().await;

    let resp = server
        .http_client()
        .get(format!("{base}/health", base = server.client_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "Ok");

    // probes do not need a tenant key
    let resp = server
        .http_client()
        .head(format!("{base}/health", base = server.client_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
