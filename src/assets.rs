//! Static dashboard assets
//!
//! Serves files beneath the configured static directory. Paths are resolved
//! against the root only after rejecting traversal segments, and directory
//! requests fall back to index.html.

use crate::error::{full_body, GatewayBody};
use hyper::{Response, StatusCode};
use std::path::Path;
use tracing::debug;

/// Serve a file relative to `root`. `raw_path` has already had the
/// /_hakoniwa/ prefix stripped.
pub async fn serve(root: &Path, raw_path: &str) -> Response<GatewayBody> {
    let rel = raw_path.trim_start_matches('/');

    if rel
        .split('/')
        .any(|segment| segment == ".." || segment.contains('\\'))
    {
        return not_found();
    }

    let mut path = root.join(rel);
    if rel.is_empty() || path.is_dir() {
        path = path.join("index.html");
    }

    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Static asset not found");
            return not_found();
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", content_type(&path))
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

fn not_found() -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "text/plain")
        .body(full_body("not found"))
        .expect("valid response builder")
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
