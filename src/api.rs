//! JSON API subtree, served under /_hakoniwa/api
//!
//! Hand-routed over hyper. The gateway strips the prefix before dispatching
//! here and appends any refreshed session cookie afterwards; login and
//! logout handlers write their own Set-Cookie headers, which is the response
//! mutation capability the dashboard relies on.

use crate::auth::{clear_instance_cookie, clear_session_cookie, session_cookie};
use crate::error::{domain_error_response, full_body, json_error_response, Error, ErrorCode, GatewayBody};
use crate::instance::{Instance, User};
use crate::services::Services;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, LOCATION, SET_COOKIE};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Serialize)]
struct UserDto<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Debug, Serialize)]
struct AuthStatusDto<'a> {
    user: UserDto<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceDto {
    id: String,
    name: String,
    #[serde(rename = "type")]
    type_id: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pod_ip: Option<String>,
    persistent: bool,
}

impl From<&Instance> for InstanceDto {
    fn from(instance: &Instance) -> Self {
        Self {
            id: instance.instance_id.clone(),
            name: instance.display_name.clone(),
            type_id: instance.type_id.clone(),
            status: instance.status.to_string(),
            pod_ip: instance.pod_ip.clone(),
            persistent: instance.persistent,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceTypeDto {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logo_url: Option<String>,
    persistable: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigurationDto {
    title: String,
    message: String,
    logo_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    terms_of_service_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    privacy_policy_url: Option<String>,
    auth_methods: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    oidc_name: Option<String>,
    auth_auto_login: bool,
    persistence_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct CreateInstanceRequest {
    #[serde(rename = "type")]
    type_id: String,
    #[serde(default)]
    persistent: bool,
}

/// Dispatch an API request. `path` is relative to /_hakoniwa/api.
pub async fn handle(
    req: Request<Incoming>,
    path: &str,
    user: Option<&User>,
    services: &Arc<Services>,
) -> Response<GatewayBody> {
    let method = req.method().as_str().to_string();

    match (method.as_str(), path) {
        ("GET", "/auth/me") => auth_me(user),
        ("POST", "/auth/anonymous") => login_anonymous(services),
        ("GET", "/auth/oidc/authorize") => oidc_authorize(services),
        ("GET", "/auth/oidc/callback") => oidc_callback(req, services).await,
        ("POST", "/auth/logout") => logout(),
        ("GET", "/instances") => list_instances(user, services),
        ("POST", "/instances") => create_instance(req, user, services).await,
        ("DELETE", _) if path.starts_with("/instances/") => {
            let instance_id = path.trim_start_matches("/instances/").to_string();
            delete_instance(&instance_id, user, services).await
        }
        ("GET", "/instance-types") => list_instance_types(services),
        ("GET", "/configuration") => configuration(services),
        _ => json_error_response(ErrorCode::NotFound, "not found"),
    }
}

fn json_response(status: StatusCode, value: &impl Serialize) -> Response<GatewayBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(full_body(body))
            .expect("valid response with StatusCode enum and static headers"),
        Err(e) => {
            error!(error = %e, "Failed to serialize API response");
            json_error_response(ErrorCode::InternalError, "failed to serialize response")
        }
    }
}

fn redirect(location: &str) -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .body(full_body(""))
        .expect("valid response builder")
}

fn auth_status(user: &User, status: StatusCode) -> Response<GatewayBody> {
    json_response(
        status,
        &AuthStatusDto {
            user: UserDto {
                id: &user.id,
                kind: user.kind.as_str(),
            },
        },
    )
}

fn auth_me(user: Option<&User>) -> Response<GatewayBody> {
    match user {
        Some(user) => auth_status(user, StatusCode::OK),
        None => json_error_response(ErrorCode::Unauthorized, "unauthorized"),
    }
}

fn login_anonymous(services: &Arc<Services>) -> Response<GatewayBody> {
    let (token, user) = match services.auth.login_anonymous() {
        Ok(ok) => ok,
        Err(_) => return json_error_response(ErrorCode::NotFound, "anonymous login is disabled"),
    };

    let mut response = auth_status(&user, StatusCode::OK);
    set_cookie(&mut response, &session_cookie(&token, services.auth.session_expiration()));
    response
}

fn oidc_authorize(services: &Arc<Services>) -> Response<GatewayBody> {
    let Some(oidc) = services.auth.oidc() else {
        return json_error_response(ErrorCode::NotFound, "OIDC login is disabled");
    };
    match oidc.authorize_url() {
        Ok(url) => redirect(&url),
        Err(e) => {
            error!(error = %e, "Failed to build OIDC authorize URL");
            json_error_response(ErrorCode::InternalError, "failed to start OIDC login")
        }
    }
}

async fn oidc_callback(req: Request<Incoming>, services: &Arc<Services>) -> Response<GatewayBody> {
    let Some(oidc) = services.auth.oidc() else {
        return json_error_response(ErrorCode::NotFound, "OIDC login is disabled");
    };

    let query: Vec<(String, String)> = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let param = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    // The IdP reported an error: hand it to the dashboard
    if let Some(e) = param("error") {
        return redirect(&format!("/?error={}", e));
    }

    let (Some(code), Some(state)) = (param("code"), param("state")) else {
        return redirect("/?error=login_failed");
    };

    match oidc.exchange_code(code, state).await {
        Ok(user) => match services.auth.create_token(&user) {
            Ok(token) => {
                let mut response = redirect("/");
                set_cookie(
                    &mut response,
                    &session_cookie(&token, services.auth.session_expiration()),
                );
                response
            }
            Err(e) => {
                error!(error = %e, "Failed to sign session token after OIDC login");
                redirect("/?error=login_failed")
            }
        },
        Err(e) => {
            warn!(error = %e, "OIDC callback rejected");
            redirect("/?error=login_failed")
        }
    }
}

fn logout() -> Response<GatewayBody> {
    let mut response = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(full_body(""))
        .expect("valid response builder");
    set_cookie(&mut response, &clear_session_cookie());
    set_cookie(&mut response, &clear_instance_cookie());
    response
}

fn list_instances(user: Option<&User>, services: &Arc<Services>) -> Response<GatewayBody> {
    let Some(user) = user else {
        return json_error_response(ErrorCode::Unauthorized, "unauthorized");
    };
    let instances: Vec<InstanceDto> = services
        .instances
        .list_instances(&user.id)
        .iter()
        .map(InstanceDto::from)
        .collect();
    json_response(StatusCode::OK, &instances)
}

async fn create_instance(
    req: Request<Incoming>,
    user: Option<&User>,
    services: &Arc<Services>,
) -> Response<GatewayBody> {
    let Some(user) = user else {
        return json_error_response(ErrorCode::Unauthorized, "unauthorized");
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_error_response(ErrorCode::BadRequest, format!("failed to read body: {}", e))
        }
    };
    let request: CreateInstanceRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return json_error_response(ErrorCode::BadRequest, format!("invalid request body: {}", e))
        }
    };

    match services
        .instances
        .create_instance(user, &request.type_id, request.persistent)
        .await
    {
        Ok(instance) => json_response(StatusCode::CREATED, &InstanceDto::from(&instance)),
        Err(e) => {
            if matches!(e, Error::Orchestrator(_)) {
                error!(user = %user.id, instance_type = %request.type_id, error = %e, "Instance creation failed");
            }
            domain_error_response(&e)
        }
    }
}

async fn delete_instance(
    instance_id: &str,
    user: Option<&User>,
    services: &Arc<Services>,
) -> Response<GatewayBody> {
    let Some(user) = user else {
        return json_error_response(ErrorCode::Unauthorized, "unauthorized");
    };

    match services.instances.delete_instance(user, instance_id).await {
        Ok(()) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(full_body(""))
            .expect("valid response builder"),
        Err(e) => domain_error_response(&e),
    }
}

fn list_instance_types(services: &Arc<Services>) -> Response<GatewayBody> {
    let types: Vec<InstanceTypeDto> = services
        .catalog
        .list()
        .into_iter()
        .map(|t| InstanceTypeDto {
            id: t.id.clone(),
            name: t.display_name.clone(),
            description: t.description.clone(),
            logo_url: t.logo_url.clone(),
            persistable: t.persistable,
        })
        .collect();
    json_response(StatusCode::OK, &types)
}

fn configuration(services: &Arc<Services>) -> Response<GatewayBody> {
    let config = &services.config;
    json_response(
        StatusCode::OK,
        &ConfigurationDto {
            title: config.title.clone(),
            message: config.message.clone(),
            logo_url: config.logo_url.clone(),
            terms_of_service_url: config.terms_of_service_url.clone(),
            privacy_policy_url: config.privacy_policy_url.clone(),
            auth_methods: config.auth_methods.clone(),
            oidc_name: config.oidc_enabled().then(|| config.oidc.name.clone()),
            auth_auto_login: config.auth_auto_login,
            persistence_enabled: config.enable_persistence,
        },
    )
}

fn set_cookie(response: &mut Response<GatewayBody>, cookie: &str) {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(SET_COOKIE, value);
    }
}
