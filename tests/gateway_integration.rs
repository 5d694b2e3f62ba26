//! Integration tests driving the full gateway over TCP against a fake
//! cluster: routing, authentication, the instance API, and the proxy.

mod common;

use common::*;
use hakoniwa::reconciler::Reconciler;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Log in anonymously and return the session cookie pair ("name=value")
async fn login(gw: &TestGateway) -> String {
    let response = post_json(gw.addr, "/_hakoniwa/api/auth/anonymous", None, "{}").await;
    assert_eq!(response.status, 200);
    let token = response.cookie("hakoniwa_session").expect("session cookie set");
    format!("hakoniwa_session={}", token)
}

/// Create an instance and return its id
async fn create_instance(gw: &TestGateway, cookie: &str, type_id: &str) -> String {
    let response = post_json(
        gw.addr,
        "/_hakoniwa/api/instances",
        Some(cookie),
        &format!(r#"{{"type":"{}"}}"#, type_id),
    )
    .await;
    assert_eq!(response.status, 201, "create failed: {}", response.body);
    response.json()["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_healthz() {
    let gw = start_gateway().await;
    let response = get(gw.addr, "/healthz", None).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "ok");
}

#[tokio::test]
async fn test_unauthenticated_root_redirects_with_no_cache() {
    let gw = start_gateway().await;
    let response = get(gw.addr, "/", None).await;

    assert_eq!(response.status, 302);
    assert_eq!(response.header("location"), Some("/_hakoniwa/"));
    assert_eq!(
        response.header("cache-control"),
        Some("no-store, no-cache, must-revalidate, proxy-revalidate")
    );
    assert_eq!(response.header("pragma"), Some("no-cache"));
    assert_eq!(response.header("expires"), Some("0"));
}

#[tokio::test]
async fn test_static_assets_served_without_auth() {
    let gw = start_gateway().await;
    let response = get(gw.addr, "/_hakoniwa/", None).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "<html>Dashboard</html>");
}

#[tokio::test]
async fn test_docs_subtree_respects_flag() {
    let gw = start_gateway().await;
    assert_eq!(get(gw.addr, "/_hakoniwa/docs/", None).await.status, 200);
    assert_eq!(get(gw.addr, "/_hakoniwa/docs/openapi.yaml", None).await.status, 200);

    let gw = start_gateway_with(TEMPLATE, |c| c.swagger_ui_enabled = false).await;
    assert_eq!(get(gw.addr, "/_hakoniwa/docs/", None).await.status, 404);
}

#[tokio::test]
async fn test_anonymous_login_and_me() {
    let gw = start_gateway().await;

    // No session: 401
    let response = get(gw.addr, "/_hakoniwa/api/auth/me", None).await;
    assert_eq!(response.status, 401);

    let cookie = login(&gw).await;
    let response = get(gw.addr, "/_hakoniwa/api/auth/me", Some(&cookie)).await;
    assert_eq!(response.status, 200);

    let user = &response.json()["user"];
    assert!(user["id"].as_str().unwrap().starts_with("anon-"));
    assert_eq!(user["type"], "anonymous");
}

#[tokio::test]
async fn test_logout_clears_cookies() {
    let gw = start_gateway().await;
    let cookie = login(&gw).await;

    let response = post_json(gw.addr, "/_hakoniwa/api/auth/logout", Some(&cookie), "{}").await;
    assert_eq!(response.status, 204);

    let cleared = response.headers_named("set-cookie");
    assert!(cleared.iter().any(|c| c.starts_with("hakoniwa_session=;") && c.contains("Max-Age=0")));
    assert!(cleared
        .iter()
        .any(|c| c.starts_with("hakoniwa_instance_id=;") && c.contains("Max-Age=0")));
}

#[tokio::test]
async fn test_instance_create_list_delete() {
    let gw = start_gateway().await;
    let cookie = login(&gw).await;

    let response = post_json(
        gw.addr,
        "/_hakoniwa/api/instances",
        Some(&cookie),
        r#"{"type":"webtop"}"#,
    )
    .await;
    assert_eq!(response.status, 201);
    let created = response.json();
    assert_eq!(created["type"], "webtop");
    assert_eq!(created["name"], "Linux Desktop");
    assert_eq!(created["status"], "pending");
    let id = created["id"].as_str().unwrap().to_string();

    let response = get(gw.addr, "/_hakoniwa/api/instances", Some(&cookie)).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.json().as_array().unwrap().len(), 1);

    let response = delete(
        gw.addr,
        &format!("/_hakoniwa/api/instances/{}", id),
        Some(&cookie),
    )
    .await;
    assert_eq!(response.status, 204);
    assert_eq!(gw.orchestrator.deletes_for(&format!("hakoniwa-{}", id)), 1);

    let response = get(gw.addr, "/_hakoniwa/api/instances", Some(&cookie)).await;
    assert!(response.json().as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_type_quota_surfaces_as_503() {
    let gw = start_gateway().await;
    let cookie = login(&gw).await;

    create_instance(&gw, &cookie, "webtop").await;

    let response = post_json(
        gw.addr,
        "/_hakoniwa/api/instances",
        Some(&cookie),
        r#"{"type":"webtop"}"#,
    )
    .await;
    assert_eq!(response.status, 503);
    assert_eq!(response.header("x-hakoniwa-error"), Some("TYPE_QUOTA_EXCEEDED"));
    assert_eq!(gw.services.registry.count(), 1);
}

#[tokio::test]
async fn test_unknown_type_surfaces_as_400() {
    let gw = start_gateway().await;
    let cookie = login(&gw).await;

    let response = post_json(
        gw.addr,
        "/_hakoniwa/api/instances",
        Some(&cookie),
        r#"{"type":"warp-drive"}"#,
    )
    .await;
    assert_eq!(response.status, 400);
    assert_eq!(response.header("x-hakoniwa-error"), Some("UNKNOWN_TYPE"));
}

#[tokio::test]
async fn test_persistence_disabled_surfaces_as_400() {
    let gw = start_gateway_with(TEMPLATE, |c| c.enable_persistence = false).await;
    let cookie = login(&gw).await;

    let response = post_json(
        gw.addr,
        "/_hakoniwa/api/instances",
        Some(&cookie),
        r#"{"type":"webtop","persistent":true}"#,
    )
    .await;
    assert_eq!(response.status, 400);
    assert_eq!(response.header("x-hakoniwa-error"), Some("PERSISTENCE_DISABLED"));
}

#[tokio::test]
async fn test_foreign_delete_is_obfuscated() {
    let gw = start_gateway().await;
    let cookie1 = login(&gw).await;
    let cookie2 = login(&gw).await;

    let id = create_instance(&gw, &cookie1, "webtop").await;

    let response = delete(
        gw.addr,
        &format!("/_hakoniwa/api/instances/{}", id),
        Some(&cookie2),
    )
    .await;
    assert_eq!(response.status, 404);

    // Still present for the owner, and the cluster never saw a delete
    let response = get(gw.addr, "/_hakoniwa/api/instances", Some(&cookie1)).await;
    assert_eq!(response.json().as_array().unwrap().len(), 1);
    assert!(gw.orchestrator.delete_calls().is_empty());
}

#[tokio::test]
async fn test_dashboard_path_is_served_as_static_asset() {
    let gw = start_gateway().await;
    let cookie = login(&gw).await;

    // The /_hakoniwa/ prefix wins over the exact dashboard match, so this
    // hits the static file server (a miss here) and the server never
    // clears the instance cookie; the frontend owns deselection.
    let response = get(gw.addr, "/_hakoniwa/dashboard", Some(&cookie)).await;
    assert_eq!(response.status, 404);
    assert!(!response
        .headers_named("set-cookie")
        .iter()
        .any(|c| c.starts_with("hakoniwa_instance_id=")));
}

#[tokio::test]
async fn test_pending_instance_falls_back_to_dashboard() {
    let gw = start_gateway().await;
    let cookie = login(&gw).await;
    let id = create_instance(&gw, &cookie, "webtop").await;

    // Pod not ready yet: the gateway sends the user back to the dashboard
    let both = format!("{}; hakoniwa_instance_id={}", cookie, id);
    let response = get(gw.addr, "/", Some(&both)).await;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("location"), Some("/_hakoniwa/"));
}

#[tokio::test]
async fn test_proxy_routes_to_running_instance() {
    let backend = spawn_echo_backend().await;
    let gw = start_gateway_with(&template_with_port(backend.port()), |_| {}).await;
    let cookie = login(&gw).await;
    let id = create_instance(&gw, &cookie, "webtop").await;

    // Reconcile the ready pod into the registry
    gw.orchestrator.set_ready(&id, "127.0.0.1");
    let mut reconciler = Reconciler::new(
        Arc::clone(&gw.services.registry),
        Arc::clone(&gw.services.orchestrator),
    );
    reconciler.sync_once().await.unwrap();

    let both = format!("{}; hakoniwa_instance_id={}", cookie, id);
    let response = get(gw.addr, "/some/app/path", Some(&both)).await;
    assert_eq!(response.status, 200, "body: {}", response.body);

    let echo = response.json();
    assert_eq!(echo["path"], "/some/app/path");
    // The backend sees its own authority as Host
    assert_eq!(echo["host"], format!("127.0.0.1:{}", backend.port()));
}

#[tokio::test]
async fn test_proxy_foreign_instance_cookie_falls_back() {
    let backend = spawn_echo_backend().await;
    let gw = start_gateway_with(&template_with_port(backend.port()), |_| {}).await;
    let cookie1 = login(&gw).await;
    let cookie2 = login(&gw).await;
    let id = create_instance(&gw, &cookie1, "webtop").await;

    gw.orchestrator.set_ready(&id, "127.0.0.1");
    let mut reconciler = Reconciler::new(
        Arc::clone(&gw.services.registry),
        Arc::clone(&gw.services.orchestrator),
    );
    reconciler.sync_once().await.unwrap();

    // Another user presenting the same instance cookie is not proxied
    let both = format!("{}; hakoniwa_instance_id={}", cookie2, id);
    let response = get(gw.addr, "/", Some(&both)).await;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("location"), Some("/_hakoniwa/"));
}

#[tokio::test]
async fn test_unreachable_backend_is_502() {
    // Grab a port that nothing listens on
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let gw = start_gateway_with(&template_with_port(dead_port), |_| {}).await;
    let cookie = login(&gw).await;
    let id = create_instance(&gw, &cookie, "webtop").await;

    gw.orchestrator.set_ready(&id, "127.0.0.1");
    let mut reconciler = Reconciler::new(
        Arc::clone(&gw.services.registry),
        Arc::clone(&gw.services.orchestrator),
    );
    reconciler.sync_once().await.unwrap();

    let both = format!("{}; hakoniwa_instance_id={}", cookie, id);
    let response = get(gw.addr, "/", Some(&both)).await;
    assert_eq!(response.status, 502);
    assert_eq!(response.header("x-hakoniwa-error"), Some("BAD_GATEWAY"));
}

#[tokio::test]
async fn test_websocket_upgrade_reaches_backend_verbatim() {
    let backend = spawn_ws_echo_backend().await;
    let gw = start_gateway_with(&template_with_port(backend.port()), |_| {}).await;
    let cookie = login(&gw).await;
    let id = create_instance(&gw, &cookie, "webtop").await;

    gw.orchestrator.set_ready(&id, "127.0.0.1");
    let mut reconciler = Reconciler::new(
        Arc::clone(&gw.services.registry),
        Arc::clone(&gw.services.orchestrator),
    );
    reconciler.sync_once().await.unwrap();

    // Hand-rolled upgrade request so the connection stays ours afterwards
    let mut stream = TcpStream::connect(gw.addr).await.unwrap();
    let request = format!(
        "GET /websockify HTTP/1.1\r\n\
         Host: gateway.test\r\n\
         Cookie: {}; hakoniwa_instance_id={}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        cookie, id
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // Read the response head
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();

    assert!(head.starts_with("HTTP/1.1 101"), "head: {}", head);
    // The backend saw the upgrade headers verbatim and its own Host
    assert!(head.contains(&format!("x-seen-host: 127.0.0.1:{}", backend.port()))
        || head.contains(&format!("X-Seen-Host: 127.0.0.1:{}", backend.port())));
    assert!(head.to_lowercase().contains("x-seen-upgrade: websocket"));
    assert!(head.to_lowercase().contains("x-seen-connection: upgrade"));

    // Bytes flow both ways through the hijacked connection
    stream.write_all(b"ping-1").await.unwrap();
    let mut echo = [0u8; 6];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ping-1");
}
