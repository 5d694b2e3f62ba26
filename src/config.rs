//! Environment-driven configuration
//!
//! All settings are read from the process environment at startup. A `.env`
//! file is honored in development. Every key has a documented default; a
//! malformed value is a fatal startup error.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// OpenID Connect settings, only consulted when `oidc` is in AUTH_METHODS
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// OIDC issuer URL (discovery is performed against it)
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    /// Display name for the login button
    pub name: String,
    pub scopes: Vec<String>,
}

/// Global gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (empty means all interfaces)
    pub listen: String,
    /// Listen port
    pub port: u16,

    /// Path to a kubeconfig file; empty means in-cluster configuration
    pub kubeconfig: String,
    /// Kubernetes namespace instances are created in
    pub kubernetes_namespace: String,

    /// Serve SwaggerUI and the OpenAPI document under /_hakoniwa/docs
    pub swagger_ui_enabled: bool,

    /// Idle time after which an instance is evicted
    pub instance_inactivity_timeout: Duration,

    /// Global pod limit
    pub max_pod_count: usize,
    /// Per-user instance limit
    pub max_instances_per_user: usize,
    /// Per-user-per-type instance limit
    pub max_instances_per_user_per_type: usize,

    /// Path to the pod template catalog; empty uses the built-in template
    pub pod_template_path: Option<PathBuf>,
    /// Root directory for static dashboard assets
    pub static_dir: PathBuf,

    /// Application title shown on the dashboard
    pub title: String,
    /// Welcome message displayed below the title
    pub message: String,
    /// URL to the application logo
    pub logo_url: String,
    pub terms_of_service_url: Option<String>,
    pub privacy_policy_url: Option<String>,

    /// Enabled authentication methods ("anonymous", "oidc")
    pub auth_methods: Vec<String>,
    /// Automatically log in when only one auth method is enabled
    pub auth_auto_login: bool,

    /// Secret key for signing session JWTs
    pub jwt_secret: String,
    /// Session validity window
    pub session_expiration: Duration,

    /// Allow persistent volumes globally
    pub enable_persistence: bool,

    pub oidc: OidcConfig,
}

impl Config {
    /// Load the configuration from environment variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            listen: env_or("LISTEN", ""),
            port: env_or("PORT", "8080")
                .parse()
                .context("PORT must be a valid port number")?,
            kubeconfig: env_or("KUBECONFIG", ""),
            kubernetes_namespace: env_or("KUBERNETES_NAMESPACE", "default"),
            swagger_ui_enabled: env_bool("SWAGGER_UI_ENABLED", true)?,
            instance_inactivity_timeout: env_duration("INSTANCE_INACTIVITY_TIMEOUT", "1m")?,
            max_pod_count: env_usize("MAX_POD_COUNT", 100)?,
            max_instances_per_user: env_usize("MAX_INSTANCES_PER_USER", 2)?,
            max_instances_per_user_per_type: env_usize("MAX_INSTANCES_PER_USER_PER_TYPE", 1)?,
            pod_template_path: {
                let path = env_or("POD_TEMPLATE_PATH", "");
                if path.is_empty() { None } else { Some(PathBuf::from(path)) }
            },
            static_dir: PathBuf::from(env_or("STATIC_DIR", "./static")),
            title: env_or("TITLE", "Hakoniwa"),
            message: env_or("MESSAGE", "On-Demand Cloud Workspace Environment"),
            logo_url: env_or("LOGO_URL", "/_hakoniwa/img/hakoniwa_logo.webp"),
            terms_of_service_url: env_opt("TERMS_OF_SERVICE_URL"),
            privacy_policy_url: env_opt("PRIVACY_POLICY_URL"),
            auth_methods: env_csv("AUTH_METHODS", "anonymous"),
            auth_auto_login: env_bool("AUTH_AUTO_LOGIN", false)?,
            jwt_secret: env_or("JWT_SECRET", "hakoniwa-secret-key"),
            session_expiration: env_duration("SESSION_EXPIRATION", "24h")?,
            enable_persistence: env_bool("ENABLE_PERSISTENCE", true)?,
            oidc: OidcConfig {
                issuer_url: env_or("OIDC_ISSUER_URL", ""),
                client_id: env_or("OIDC_CLIENT_ID", ""),
                client_secret: env_or("OIDC_CLIENT_SECRET", ""),
                redirect_url: env_or("OIDC_REDIRECT_URL", ""),
                name: env_or("OIDC_NAME", "OpenID Connect"),
                scopes: env_csv("OIDC_SCOPES", "openid,profile"),
            },
        })
    }

    /// Socket address string for the listener
    pub fn bind_addr(&self) -> String {
        let host = if self.listen.is_empty() {
            "0.0.0.0"
        } else {
            &self.listen
        };
        format!("{}:{}", host, self.port)
    }

    pub fn oidc_enabled(&self) -> bool {
        self.auth_methods.iter().any(|m| m == "oidc")
    }

    pub fn anonymous_enabled(&self) -> bool {
        self.auth_methods.iter().any(|m| m == "anonymous")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_csv(key: &str, default: &str) -> Vec<String> {
    env_or(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{} must be true or false", key)),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{} must be a non-negative integer", key)),
        Err(_) => Ok(default),
    }
}

fn env_duration(key: &str, default: &str) -> Result<Duration> {
    let raw = env_or(key, default);
    parse_duration(&raw).with_context(|| format!("{} must be a duration like 30s, 1m, 24h", key))
}

/// Parse a duration string such as `300ms`, `30s`, `5m`, `24h`, or `1h30m`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration");
    }

    let mut total = Duration::ZERO;
    let mut chars = s.char_indices().peekable();
    let mut consumed_any = false;

    while chars.peek().is_some() {
        let start = chars.peek().map(|(i, _)| *i).unwrap_or(0);
        let mut end = start;
        while let Some((i, c)) = chars.peek() {
            if c.is_ascii_digit() || *c == '.' {
                end = *i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let number: f64 = s[start..end]
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid duration: {}", input))?;

        let unit_start = end;
        let mut unit_end = unit_start;
        while let Some((i, c)) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit_end = *i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let multiplier = match &s[unit_start..unit_end] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => anyhow::bail!("invalid duration unit in: {}", input),
        };

        total += Duration::from_secs_f64(number * multiplier);
        consumed_any = true;
    }

    if !consumed_any {
        anyhow::bail!("invalid duration: {}", input);
    }
    Ok(total)
}

/// A fully-populated configuration for tests
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        listen: String::new(),
        port: 8080,
        kubeconfig: String::new(),
        kubernetes_namespace: "default".to_string(),
        swagger_ui_enabled: true,
        instance_inactivity_timeout: Duration::from_secs(60),
        max_pod_count: 100,
        max_instances_per_user: 2,
        max_instances_per_user_per_type: 1,
        pod_template_path: None,
        static_dir: PathBuf::from("./static"),
        title: "Hakoniwa".to_string(),
        message: "On-Demand Cloud Workspace Environment".to_string(),
        logo_url: "/_hakoniwa/img/hakoniwa_logo.webp".to_string(),
        terms_of_service_url: None,
        privacy_policy_url: None,
        auth_methods: vec!["anonymous".to_string()],
        auth_auto_login: false,
        jwt_secret: "hakoniwa-secret-key".to_string(),
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
