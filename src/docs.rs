//! SwaggerUI and the OpenAPI document, served under /_hakoniwa/docs

use crate::error::{full_body, GatewayBody};
use hyper::{Response, StatusCode};

const OPENAPI_YAML: &str = include_str!("../api/openapi.yaml");

const SWAGGER_UI_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Hakoniwa API</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      SwaggerUIBundle({
        url: "/_hakoniwa/docs/openapi.yaml",
        dom_id: "#swagger-ui",
      });
    };
  </script>
</body>
</html>
"##;

/// Serve the docs subtree. `path` is relative to /_hakoniwa/docs.
pub fn handle(path: &str, enabled: bool) -> Response<GatewayBody> {
    if !enabled {
        return status_response(StatusCode::NOT_FOUND, "not found");
    }

    match path {
        "" | "/" => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(full_body(SWAGGER_UI_HTML))
            .expect("valid response builder"),
        "/openapi.yaml" => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/yaml")
            .body(full_body(OPENAPI_YAML))
            .expect("valid response builder"),
        _ => status_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn status_response(status: StatusCode, body: &'static str) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(body))
        .expect("valid response builder")
}
