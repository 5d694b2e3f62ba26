//! Shared helpers for integration tests: a fake orchestrator, a gateway
//! harness bound to an ephemeral port, and a minimal HTTP client speaking
//! over raw TCP.

use async_trait::async_trait;
use hakoniwa::auth::AuthService;
use hakoniwa::catalog::Catalog;
use hakoniwa::config::{Config, OidcConfig};
use hakoniwa::gateway::GatewayServer;
use hakoniwa::instance::{Instance, InstanceStatus};
use hakoniwa::kubernetes::Orchestrator;
use hakoniwa::services::Services;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Default catalog used by the harness: two types on port 3000
pub const TEMPLATE: &str = r#"
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: Pod
    metadata:
      name: webtop
      annotations:
        hakoniwa.aplulu.me/display-name: "Linux Desktop"
    spec:
      containers:
        - name: webtop
          image: lscr.io/linuxserver/webtop:latest
  - apiVersion: v1
    kind: Pod
    metadata:
      name: code
      annotations:
        hakoniwa.aplulu.me/display-name: "Code Server"
    spec:
      containers:
        - name: code
          image: lscr.io/linuxserver/code-server:latest
"#;

/// Catalog template whose single type targets the given backend port
pub fn template_with_port(port: u16) -> String {
    format!(
        r#"
apiVersion: v1
kind: Pod
metadata:
  name: webtop
  annotations:
    hakoniwa.aplulu.me/display-name: "Linux Desktop"
    hakoniwa.aplulu.me/port: "{}"
spec:
  containers:
    - name: webtop
      image: lscr.io/linuxserver/webtop:latest
"#,
        port
    )
}

/// In-memory stand-in for the cluster
#[derive(Default)]
pub struct FakeOrchestrator {
    pods: Mutex<HashMap<String, Instance>>,
    pub fail_create: AtomicBool,
    pub fail_delete: AtomicBool,
    delete_calls: Mutex<Vec<String>>,
}

impl FakeOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_ready(&self, instance_id: &str, ip: &str) {
        let mut pods = self.pods.lock();
        for pod in pods.values_mut() {
            if pod.instance_id == instance_id {
                pod.status = InstanceStatus::Running;
                pod.pod_ip = Some(ip.to_string());
            }
        }
    }

    pub fn lose_pod(&self, pod_name: &str) {
        self.pods.lock().remove(pod_name);
    }

    pub fn seed_pod(&self, instance: Instance) {
        self.pods.lock().insert(instance.pod_name.clone(), instance);
    }

    pub fn pod_count(&self) -> usize {
        self.pods.lock().len()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().clone()
    }

    pub fn deletes_for(&self, pod_name: &str) -> usize {
        self.delete_calls
            .lock()
            .iter()
            .filter(|p| p.as_str() == pod_name)
            .count()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn create_instance_pod(&self, instance: &Instance, _template: &[u8]) -> anyhow::Result<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("injected create failure");
        }
        let mut pod = instance.clone();
        pod.status = InstanceStatus::Pending;
        self.pods.lock().insert(pod.pod_name.clone(), pod);
        Ok(())
    }

    async fn get_pod_status(&self, pod_name: &str) -> anyhow::Result<(InstanceStatus, Option<String>)> {
        match self.pods.lock().get(pod_name) {
            Some(pod) => Ok((pod.status, pod.pod_ip.clone())),
            None => Ok((InstanceStatus::Terminating, None)),
        }
    }

    async fn list_instance_pods(&self) -> anyhow::Result<Vec<Instance>> {
        Ok(self
            .pods
            .lock()
            .values()
            .map(|pod| {
                let mut inst = pod.clone();
                inst.last_active_at = Instant::now();
                inst
            })
            .collect())
    }

    async fn delete_pod(&self, pod_name: &str) -> anyhow::Result<()> {
        self.delete_calls.lock().push(pod_name.to_string());
        if self.fail_delete.load(Ordering::SeqCst) {
            anyhow::bail!("injected delete failure");
        }
        self.pods.lock().remove(pod_name);
        Ok(())
    }
}

pub fn test_config(static_dir: PathBuf) -> Config {
    Config {
        listen: "127.0.0.1".to_string(),
        port: 0,
        kubeconfig: String::new(),
        kubernetes_namespace: "default".to_string(),
        swagger_ui_enabled: true,
        instance_inactivity_timeout: Duration::from_secs(60),
        max_pod_count: 100,
        max_instances_per_user: 2,
        max_instances_per_user_per_type: 1,
        pod_template_path: None,
        static_dir,
        title: "Hakoniwa".to_string(),
        message: "On-Demand Cloud Workspace Environment".to_string(),
        logo_url: "/_hakoniwa/img/hakoniwa_logo.webp".to_string(),
        terms_of_service_url: None,
        privacy_policy_url: None,
        auth_methods: vec!["anonymous".to_string()],
        auth_auto_login: false,
        jwt_secret: "integration-test-secret".to_string(),
        session_expiration: Duration::from_secs(86400),
        enable_persistence: true,
        oidc: OidcConfig {
            issuer_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: String::new(),
            name: "OpenID Connect".to_string(),
            scopes: vec!["openid".to_string(), "profile".to_string()],
        },
    }
}

/// A gateway running against a fake cluster on an ephemeral port
pub struct TestGateway {
    pub addr: SocketAddr,
    pub services: Arc<Services>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub shutdown_tx: watch::Sender<bool>,
    _static_dir: tempfile::TempDir,
}

pub async fn start_gateway() -> TestGateway {
    start_gateway_with(TEMPLATE, |_| {}).await
}

pub async fn start_gateway_with(
    template: &str,
    configure: impl FnOnce(&mut Config),
) -> TestGateway {
    let static_dir = tempfile::tempdir().unwrap();
    std::fs::write(static_dir.path().join("index.html"), "<html>Dashboard</html>").unwrap();

    let mut config = test_config(static_dir.path().to_path_buf());
    configure(&mut config);

    let catalog = Catalog::from_yaml(template.as_bytes()).unwrap();
    let orchestrator = FakeOrchestrator::new();
    let auth = AuthService::new(&config);
    let services = Services::new(
        config,
        catalog,
        Arc::clone(&orchestrator) as Arc<dyn Orchestrator>,
        auth,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let gateway = GatewayServer::new(addr, Arc::clone(&services), shutdown_rx);
    tokio::spawn(async move {
        let _ = gateway.serve(listener).await;
    });

    TestGateway {
        addr,
        services,
        orchestrator,
        shutdown_tx,
        _static_dir: static_dir,
    }
}

/// Parsed HTTP response from the raw-TCP client
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| n.to_lowercase() == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named(&self, name: &str) -> Vec<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .filter(|(n, _)| n.to_lowercase() == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Pull a cookie value out of the Set-Cookie headers
    pub fn cookie(&self, name: &str) -> Option<String> {
        for set_cookie in self.headers_named("set-cookie") {
            if let Some(rest) = set_cookie.strip_prefix(&format!("{}=", name)) {
                return Some(rest.split(';').next().unwrap_or("").to_string());
            }
        }
        None
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("response body is JSON")
    }
}

/// Send one HTTP/1.1 request over a fresh connection and read the response
pub async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.expect("connect to gateway");

    let mut head = format!("{} {} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n", method, path);
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    if let Some(body) = body {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        head.push_str("Content-Type: application/json\r\n");
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await.unwrap();
    if let Some(body) = body {
        stream.write_all(body.as_bytes()).await.unwrap();
    }

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    parse_response(&raw)
}

pub async fn get(addr: SocketAddr, path: &str, cookie: Option<&str>) -> HttpResponse {
    match cookie {
        Some(c) => request(addr, "GET", path, &[("Cookie", c)], None).await,
        None => request(addr, "GET", path, &[], None).await,
    }
}

pub async fn post_json(
    addr: SocketAddr,
    path: &str,
    cookie: Option<&str>,
    body: &str,
) -> HttpResponse {
    match cookie {
        Some(c) => request(addr, "POST", path, &[("Cookie", c)], Some(body)).await,
        None => request(addr, "POST", path, &[], Some(body)).await,
    }
}

pub async fn delete(addr: SocketAddr, path: &str, cookie: Option<&str>) -> HttpResponse {
    match cookie {
        Some(c) => request(addr, "DELETE", path, &[("Cookie", c)], None).await,
        None => request(addr, "DELETE", path, &[], None).await,
    }
}

fn parse_response(raw: &[u8]) -> HttpResponse {
    let text = String::from_utf8_lossy(raw).to_string();
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text.as_str(), ""));

    let mut lines = head.lines();
    let status_line = lines.next().expect("response has a status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("response has a status code");

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    // Strip chunked-encoding framing if present; bodies in these tests are
    // single-chunk JSON or HTML.
    let body = if body.contains("\r\n") && body.trim_start().starts_with(|c: char| c.is_ascii_hexdigit()) {
        body.split("\r\n")
            .skip(1)
            .step_by(2)
            .collect::<Vec<_>>()
            .join("")
    } else {
        body.to_string()
    };

    HttpResponse {
        status,
        headers,
        body,
    }
}

/// Backend that answers every request with a JSON echo of what it saw
pub async fn spawn_echo_backend() -> SocketAddr {
    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string()
                    };
                    let body = serde_json::json!({
                        "host": header("host"),
                        "path": req.uri().path(),
                    })
                    .to_string();
                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .header("Content-Type", "application/json")
                            .body(Full::new(Bytes::from(body)))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    addr
}

/// Raw-TCP backend that accepts WebSocket upgrades, reports the request
/// headers it saw in the 101 response, then echoes every byte back.
pub async fn spawn_ws_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                // Read the request head
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte).await {
                        Ok(1) => head.push(byte[0]),
                        _ => return,
                    }
                }
                let head = String::from_utf8_lossy(&head);
                let header = |name: &str| {
                    head.lines()
                        .find_map(|line| {
                            let (n, v) = line.split_once(':')?;
                            (n.trim().to_lowercase() == name).then(|| v.trim().to_string())
                        })
                        .unwrap_or_default()
                };

                let response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     X-Seen-Host: {}\r\n\
                     X-Seen-Upgrade: {}\r\n\
                     X-Seen-Connection: {}\r\n\r\n",
                    header("host"),
                    header("upgrade"),
                    header("connection"),
                );
                if stream.write_all(response.as_bytes()).await.is_err() {
                    return;
                }

                // Echo bytes until the peer goes away
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}
