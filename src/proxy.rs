//! Reverse proxy with activity tracking
//!
//! Forwards gateway traffic to an instance's pod and treats every byte that
//! moves as proof of life. Plain requests go through a pooled HTTP client
//! and the response body is wrapped so each data frame pings the activity
//! tracker. Upgrade (WebSocket) requests are replayed over a raw TCP
//! connection to the backend; once both sides are hijacked the backend
//! stream is wrapped so every non-zero read and write pings the tracker.
//!
//! The tracker itself is debounced: at most one registry touch per
//! ACTIVITY_DEBOUNCE window per instance, dispatched on a spawned task so
//! the data path never waits on the registry.

use crate::error::{json_error_response, ErrorCode, GatewayBody};
use crate::lifecycle::InstanceService;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Minimum interval between two activity touches for one connection
pub const ACTIVITY_DEBOUNCE: Duration = Duration::from_secs(10);

/// Debounced activity callback shared by everything observing one proxied
/// request or hijacked connection.
pub struct ActivityTracker {
    debounce: Duration,
    last_update: Mutex<Option<Instant>>,
    touch: Box<dyn Fn() + Send + Sync>,
}

impl ActivityTracker {
    /// Tracker that refreshes the instance's activity timestamp off the hot
    /// path.
    pub fn new(service: Arc<InstanceService>, instance_id: String) -> Arc<Self> {
        Self::with_debounce(ACTIVITY_DEBOUNCE, move || {
            let service = Arc::clone(&service);
            let instance_id = instance_id.clone();
            tokio::spawn(async move {
                service.touch_activity(&instance_id);
            });
        })
    }

    pub fn with_debounce(debounce: Duration, touch: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            debounce,
            last_update: Mutex::new(None),
            touch: Box::new(touch),
        })
    }

    /// Record traffic. Calls through to the touch callback at most once per
    /// debounce window.
    pub fn ping(&self) {
        {
            let mut last = self.last_update.lock();
            if let Some(prev) = *last {
                if prev.elapsed() < self.debounce {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        (self.touch)();
    }
}

/// Response body wrapper that pings the tracker on every non-empty frame
struct TrackedBody {
    inner: GatewayBody,
    tracker: Arc<ActivityTracker>,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if frame.data_ref().map(|d| !d.is_empty()).unwrap_or(false) {
                    this.tracker.ping();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

/// Stream wrapper that pings the tracker on every non-zero read and write.
/// Wrapping the backend side of a hijacked connection observes traffic in
/// both directions.
pub struct TrackedIo<S> {
    inner: S,
    tracker: Arc<ActivityTracker>,
}

impl<S> TrackedIo<S> {
    pub fn new(inner: S, tracker: Arc<ActivityTracker>) -> Self {
        Self { inner, tracker }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.tracker.ping();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.tracker.ping();
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Forwards requests to instance pods
pub struct ProxyHandler {
    service: Arc<InstanceService>,
    client: Client<HttpConnector, Incoming>,
}

impl ProxyHandler {
    pub fn new(service: Arc<InstanceService>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self { service, client }
    }

    /// Forward a request to `target` (e.g. `http://10.0.0.5:3000`) on behalf
    /// of the given instance. The proxy never retries; backend transport
    /// failures surface as 502.
    pub async fn forward(
        &self,
        instance_id: &str,
        target: &str,
        req: Request<Incoming>,
    ) -> Response<GatewayBody> {
        let target_uri: hyper::Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                error!(target = %target, error = %e, "Failed to parse proxy target URL");
                return json_error_response(ErrorCode::InternalError, "Internal Server Error");
            }
        };
        let Some(authority) = target_uri.authority().map(|a| a.to_string()) else {
            error!(target = %target, "Proxy target URL has no authority");
            return json_error_response(ErrorCode::InternalError, "Internal Server Error");
        };

        let tracker = ActivityTracker::new(Arc::clone(&self.service), instance_id.to_string());

        if is_upgrade_request(&req) {
            return self.forward_upgrade(req, &authority, instance_id, tracker).await;
        }

        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri: hyper::Uri = match format!("{}{}", target, path).parse() {
            Ok(uri) => uri,
            Err(e) => {
                error!(target = %target, error = %e, "Failed to build backend URI");
                return json_error_response(ErrorCode::InternalError, "Internal Server Error");
            }
        };

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (name, value) in parts.headers.iter() {
            if name == hyper::header::HOST {
                continue;
            }
            builder = builder.header(name, value);
        }
        // The backend sees its own authority, not the gateway's
        builder = builder.header(hyper::header::HOST, authority.as_str());

        let backend_req = match builder.body(body) {
            Ok(req) => req,
            Err(e) => {
                error!(target = %target, error = %e, "Failed to build backend request");
                return json_error_response(ErrorCode::InternalError, "Internal Server Error");
            }
        };

        match self.client.request(backend_req).await {
            Ok(response) => {
                tracker.ping();
                let (parts, body) = response.into_parts();
                let tracked = TrackedBody {
                    inner: body.boxed(),
                    tracker,
                };
                Response::from_parts(parts, BodyExt::boxed(tracked))
            }
            Err(e) => {
                error!(
                    target = %target,
                    instance_id = %instance_id,
                    error = %e,
                    "Failed to forward request to backend"
                );
                json_error_response(ErrorCode::BadGateway, "Bad Gateway")
            }
        }
    }

    /// Handle a WebSocket/HTTP upgrade request by replaying it over a raw
    /// TCP connection to the backend.
    async fn forward_upgrade(
        &self,
        req: Request<Incoming>,
        authority: &str,
        instance_id: &str,
        tracker: Arc<ActivityTracker>,
    ) -> Response<GatewayBody> {
        let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
        debug!(instance_id, authority, upgrade_type, "Handling upgrade request");

        let raw_request = build_upgrade_request(&req, authority);

        let mut backend_stream = match TcpStream::connect(authority).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(authority, instance_id, error = %e, "Failed to connect to backend for upgrade");
                return json_error_response(ErrorCode::BadGateway, "Bad Gateway");
            }
        };

        if let Err(e) = backend_stream.write_all(&raw_request).await {
            error!(authority, instance_id, error = %e, "Failed to send upgrade request to backend");
            return json_error_response(ErrorCode::BadGateway, "Bad Gateway");
        }

        let mut response_buf = vec![0u8; 4096];
        let n = match backend_stream.read(&mut response_buf).await {
            Ok(n) if n > 0 => n,
            Ok(_) => {
                error!(authority, instance_id, "Backend closed connection before responding to upgrade");
                return json_error_response(ErrorCode::BadGateway, "Bad Gateway");
            }
            Err(e) => {
                error!(authority, instance_id, error = %e, "Failed to read upgrade response from backend");
                return json_error_response(ErrorCode::BadGateway, "Bad Gateway");
            }
        };

        let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
            error!(authority, instance_id, "Failed to parse backend upgrade response");
            return json_error_response(ErrorCode::BadGateway, "Bad Gateway");
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(authority, instance_id, status = %status, "Backend rejected upgrade request");
            // Relay the backend's non-101 response as-is
            let mut response = Response::builder().status(status);
            for (name, value) in &response_headers {
                if let Ok(hv) = HeaderValue::from_str(value) {
                    response = response.header(name.as_str(), hv);
                }
            }
            return response
                .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
                .expect("valid response builder");
        }

        info!(authority, instance_id, upgrade_type, "WebSocket upgrade successful");

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &response_headers {
            // Skip hop-by-hop headers that hyper handles
            let name_lower = name.to_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let response = response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");

        let instance_id = instance_id.to_string();
        let authority = authority.to_string();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client_io = TokioIo::new(upgraded);
                    let mut backend_io = TrackedIo::new(backend_stream, tracker);
                    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
                        Ok((to_backend, to_client)) => {
                            debug!(
                                authority,
                                instance_id,
                                to_backend,
                                to_client,
                                "WebSocket connection closed normally"
                            );
                        }
                        Err(e) => {
                            debug!(authority, instance_id, error = %e, "WebSocket connection closed with error");
                        }
                    }
                }
                Err(e) => {
                    error!(authority, instance_id, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }
}

/// Check if a request is a WebSocket/HTTP upgrade request
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Build the raw HTTP upgrade request to replay to the backend. All request
/// headers are forwarded verbatim except Host, which is rewritten to the
/// backend authority.
fn build_upgrade_request<B>(req: &Request<B>, authority: &str) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", authority));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's response head, looking for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}
