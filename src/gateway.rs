//! Gateway router
//!
//! The single HTTP entry point. Every request is dispatched to one of:
//! the health check, the docs subtree, the JSON API, the static dashboard
//! assets, or the reverse proxy toward the user's selected instance. A
//! session middleware step runs first and attaches the verified user; when
//! verification hands back a slid-forward token, the eventual response gets
//! the refreshed session cookie appended.

use crate::api;
use crate::assets;
use crate::auth::{
    clear_instance_cookie, cookie_value, session_cookie, INSTANCE_COOKIE, SESSION_COOKIE,
};
use crate::docs;
use crate::error::{full_body, GatewayBody};
use crate::instance::{InstanceStatus, User};
use crate::proxy::ProxyHandler;
use crate::services::Services;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, COOKIE, LOCATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Default backend port when the instance type does not name one
const DEFAULT_TARGET_PORT: &str = "3000";

/// The main gateway server
pub struct GatewayServer {
    bind_addr: SocketAddr,
    services: Arc<Services>,
    proxy: Arc<ProxyHandler>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(bind_addr: SocketAddr, services: Arc<Services>, shutdown_rx: watch::Receiver<bool>) -> Self {
        let proxy = Arc::new(ProxyHandler::new(Arc::clone(&services.instances)));
        Self {
            bind_addr,
            services,
            proxy,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let services = Arc::clone(&self.services);
                            let proxy = Arc::clone(&self.proxy);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let services = Arc::clone(&services);
                                    let proxy = Arc::clone(&proxy);
                                    async move { handle_request(req, services, proxy).await }
                                });

                                // auto::Builder negotiates HTTP/1.1 and h2c;
                                // upgrades keep WebSockets working on HTTP/1.1
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection_with_upgrades(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    services: Arc<Services>,
    proxy: Arc<ProxyHandler>,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let path = req.uri().path().to_string();

    // Reserved paths bypass the router entirely
    if path == "/healthz" {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .body(full_body("ok"))
            .expect("valid response builder"));
    }
    if let Some(rest) = path.strip_prefix("/_hakoniwa/docs") {
        return Ok(docs::handle(rest, services.config.swagger_ui_enabled));
    }

    // Session middleware: look up the session cookie and verify it. A
    // failure just means no user in context; downstream decides.
    let cookie_header = req
        .headers()
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let session = cookie_value(&cookie_header, SESSION_COOKIE)
        .and_then(|token| services.auth.verify_session(&token).ok());
    let (user, refreshed_token) = match session {
        Some(session) => (Some(session.user), session.refreshed_token),
        None => (None, None),
    };

    let mut response = route(req, &path, &cookie_header, user.as_ref(), &services, &proxy).await;

    // Sliding session: carry the renewed token back on whatever response
    if let Some(token) = refreshed_token {
        let cookie = session_cookie(&token, services.auth.session_expiration());
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }

    Ok(response)
}

async fn route(
    req: Request<Incoming>,
    path: &str,
    cookie_header: &str,
    user: Option<&User>,
    services: &Arc<Services>,
    proxy: &Arc<ProxyHandler>,
) -> Response<GatewayBody> {
    // 1. API subtree
    if let Some(rest) = path.strip_prefix("/_hakoniwa/api") {
        return api::handle(req, rest, user, services).await;
    }

    // 2. Static assets are always reachable; the dashboard itself handles
    // login. This prefix also captures the exact /_hakoniwa/dashboard path,
    // so the deselect branch below stays inert and the frontend clears the
    // instance cookie itself (it is not HttpOnly).
    if let Some(rest) = path.strip_prefix("/_hakoniwa/") {
        return assets::serve(&services.config.static_dir, rest).await;
    }

    // 3. Everything beyond this point needs a user
    let Some(user) = user else {
        return redirect_to_dashboard();
    };

    // 4. Explicit dashboard access deselects the active instance
    if path == "/_hakoniwa/dashboard" {
        let mut response = redirect_to_dashboard();
        if let Ok(value) = HeaderValue::from_str(&clear_instance_cookie()) {
            response.headers_mut().append(SET_COOKIE, value);
        }
        return response;
    }

    // 5. Route to the selected instance when the cookie points at a live,
    // owned, running pod
    if let Some(instance_id) = cookie_value(cookie_header, INSTANCE_COOKIE) {
        match services.instances.get_instance(&instance_id) {
            Some(instance) if instance.user_id == user.id => {
                if instance.status == InstanceStatus::Running {
                    if let Some(pod_ip) = &instance.pod_ip {
                        let port = services
                            .catalog
                            .get(&instance.type_id)
                            .map(|t| t.target_port.clone())
                            .unwrap_or_else(|| DEFAULT_TARGET_PORT.to_string());
                        let target = format!("http://{}:{}", pod_ip, port);
                        return proxy.forward(&instance.instance_id, &target, req).await;
                    }
                }
            }
            Some(_) => {
                debug!(instance_id = %instance_id, user = %user.id, "Instance cookie points at a foreign instance");
            }
            None => {
                debug!(instance_id = %instance_id, "Instance cookie points at an unknown instance");
            }
        }
    }

    // 6. Default: the dashboard
    redirect_to_dashboard()
}

/// Redirect to the dashboard with caching disabled, so stale instance views
/// never stick in the browser.
fn redirect_to_dashboard() -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, "/_hakoniwa/")
        .header(
            "Cache-Control",
            "no-store, no-cache, must-revalidate, proxy-revalidate",
        )
        .header("Pragma", "no-cache")
        .header("Expires", "0")
        .body(full_body(""))
        .expect("valid response with StatusCode enum and static headers")
}
