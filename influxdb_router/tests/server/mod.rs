use std::{
    io::Write,
    path::PathBuf,
    process::{Child, Command, Stdio},
    time::Duration,
};

use assert_cmd::cargo::CommandCargoExt;
use flate2::{Compression, write::GzEncoder};
use reqwest::{Response, StatusCode};
use tempfile::TempDir;

mod forward;
mod health;
mod ingest;
mod shutdown;

pub const API_KEY_HEADER: &str = "Service-API-Key";

/// Configuration for a [`TestServer`]
#[derive(Debug, Default)]
pub struct TestConfig {
    tenants: Vec<(String, String)>,
    backend_url: Option<String>,
    wait_before_shutdown: Option<u64>,
    max_http_request_size: Option<usize>,
    backend_token: Option<String>,
}

impl TestConfig {
    pub fn with_tenant(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.tenants.push((name.into(), key.into()));
        self
    }

    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = Some(url.into());
        self
    }

    pub fn with_wait_before_shutdown(mut self, secs: u64) -> Self {
        self.wait_before_shutdown = Some(secs);
        self
    }

    pub fn with_backend_token(mut self, token: impl Into<String>) -> Self {
        self.backend_token = Some(token.into());
        self
    }

    pub fn with_max_http_request_size(mut self, bytes: usize) -> Self {
        self.max_http_request_size = Some(bytes);
        self
    }

    /// Convert this to a set of command line arguments for `influxdb_router serve`
    fn as_args(&self) -> Vec<String> {
        let mut args = vec![];
        if !self.tenants.is_empty() {
            let tenants = self
                .tenants
                .iter()
                .map(|(name, key)| format!("{name}={key}"))
                .collect::<Vec<_>>()
                .join(",");
            args.append(&mut vec!["--tenant".to_string(), tenants]);
        }
        if let Some(url) = &self.backend_url {
            args.append(&mut vec!["--backend-url".to_string(), url.to_owned()]);
        }
        if let Some(token) = &self.backend_token {
            args.append(&mut vec!["--backend-token".to_string(), token.to_owned()]);
        }
        if let Some(secs) = self.wait_before_shutdown {
            args.append(&mut vec![
                "--wait-before-shutdown".to_string(),
                secs.to_string(),
            ]);
        }
        if let Some(bytes) = self.max_http_request_size {
            args.append(&mut vec![
                "--max-http-request-size".to_string(),
                bytes.to_string(),
            ]);
        }
        args
    }

    /// Spawn a new [`TestServer`] with this configuration
    pub async fn spawn(&self) -> TestServer {
        TestServer::spawn_inner(self).await
    }
}

/// A running instance of the `influxdb_router serve` process
///
/// Logs of the spawned process are only shown when `TEST_LOG` is set, its value is forwarded
/// to the process as `LOG_FILTER`.
#[derive(Debug)]
pub struct TestServer {
    bind_addr: String,
    server_process: Child,
    http_client: reqwest::Client,
    _tmp_dir: TempDir,
}

impl TestServer {
    /// Spawn a router with a single `acme` tenant and no backend
    pub async fn spawn() -> Self {
        Self::configure()
            .with_tenant("acme", "acme-secret-key")
            .spawn()
            .await
    }

    /// Configure a [`TestServer`] before spawning
    pub fn configure() -> TestConfig {
        TestConfig::default()
    }

    async fn spawn_inner(config: &TestConfig) -> Self {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let addr_file = tmp_dir.path().join("router.addr");

        let mut command =
            Command::cargo_bin("influxdb_router").expect("create the influxdb_router command");
        let command = command
            .arg("serve")
            // bind to port 0 to get a random port assigned:
            .args(["--listen-addr", "127.0.0.1"])
            .args(["--listen-http-port", "0"])
            .args(["--statsd-server", "127.0.0.1:8125"])
            .arg("--tcp-listener-file-path")
            .arg(&addr_file)
            .args(config.as_args())
            .current_dir(tmp_dir.path());

        match std::env::var("TEST_LOG") {
            Ok(filter) if !filter.is_empty() => {
                command.env("LOG_FILTER", filter);
            }
            Ok(_) => {
                command.env("LOG_FILTER", "info");
            }
            Err(_) => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let server_process = command
            .spawn()
            .expect("spawn the influxdb_router server process");

        let bind_addr = wait_for_address_file(addr_file).await;

        let server = Self {
            bind_addr,
            server_process,
            http_client: reqwest::Client::new(),
            _tmp_dir: tmp_dir,
        };
        server.wait_until_ready().await;
        server
    }

    /// Get the URL of the running service for use with an HTTP client
    pub fn client_addr(&self) -> String {
        format!("http://{}", self.bind_addr)
    }

    /// The `host:port` the server listens on, for raw TCP clients
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn pid(&self) -> i32 {
        self.server_process.id() as i32
    }

    pub fn kill(&mut self) {
        // the process may have exited on its own already
        let _ = self.server_process.kill();
    }

    /// Send SIGTERM to the process, as an orchestrator would before stopping it
    pub fn terminate(&self) {
        let rc = unsafe { libc::kill(self.pid(), libc::SIGTERM) };
        assert_eq!(rc, 0, "send SIGTERM to the server process");
    }

    /// Wait for the process to exit on its own and return whether it exited successfully
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self
                .server_process
                .try_wait()
                .expect("check process status")
            {
                return status.success();
            }
            if tokio::time::Instant::now() > deadline {
                panic!("server did not exit within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn wait_until_ready(&self) {
        let mut count = 0;
        while self
            .http_client
            .get(format!("{base}/health", base = self.client_addr()))
            .send()
            .await
            .is_err()
        {
            if count > 500 {
                panic!("server failed to start");
            } else {
                count += 1;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.kill();
    }
}

impl TestServer {
    /// POST a compressed batch to `/write`
    pub async fn write(&self, api_key: Option<&str>, body: Vec<u8>) -> Response {
        let mut req = self
            .http_client
            .post(format!("{base}/write", base = self.client_addr()))
            .header("Content-Encoding", "gzip")
            .body(body);
        if let Some(key) = api_key {
            req = req.header(API_KEY_HEADER, key);
        }
        req.send().await.expect("send /write request")
    }

    pub async fn health(&self) -> StatusCode {
        self.http_client
            .get(format!("{base}/health", base = self.client_addr()))
            .send()
            .await
            .expect("send /health request")
            .status()
    }
}

/// Compress line protocol the way agents send it
pub fn gzip(lp: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(lp.as_bytes()).expect("compress batch");
    encoder.finish().expect("finish compression")
}

async fn wait_for_address_file(path: PathBuf) -> String {
    for _ in 0..1000 {
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            if contents.parse::<std::net::SocketAddr>().is_ok() {
                return contents;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server did not write its address to {}", path.display());
}
