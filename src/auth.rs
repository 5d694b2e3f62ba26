//! Sessions and login
//!
//! Sessions are HS256 JWTs carried in the `hakoniwa_session` cookie and
//! renewed on a sliding window: when less than half the session lifetime
//! remains, verification hands back a fresh token for the caller to re-set.
//! Anonymous logins mint a throwaway user id. OIDC logins run the
//! authorization-code flow with a server-side `state` store, so callbacks
//! with an unknown or expired state are rejected outright.

use crate::config::Config;
use crate::error::Error;
use crate::instance::{User, UserKind};
use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Session cookie name (HttpOnly, holds the JWT)
pub const SESSION_COOKIE: &str = "hakoniwa_session";
/// Instance selection cookie name (set by the frontend, cleared by us)
pub const INSTANCE_COOKIE: &str = "hakoniwa_instance_id";

/// Token issuer claim
const ISSUER: &str = "hakoniwa";
/// How long an OIDC state stays redeemable
const STATE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub user_type: String,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub iss: String,
}

/// Result of verifying a session token
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    pub user: User,
    /// A fresh token when the old one had less than half its life left
    pub refreshed_token: Option<String>,
}

pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    session_expiration: Duration,
    anonymous_enabled: bool,
    oidc: Option<OidcClient>,
}

impl AuthService {
    /// Auth service without OIDC discovery (anonymous + session verification)
    pub fn new(config: &Config) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            session_expiration: config.session_expiration,
            anonymous_enabled: config.anonymous_enabled(),
            oidc: None,
        }
    }

    /// Auth service with OIDC discovery performed when enabled. Discovery
    /// failure is fatal: a misconfigured issuer is better caught at startup.
    pub async fn with_oidc(config: &Config) -> Result<Self> {
        let mut service = Self::new(config);
        if config.oidc_enabled() {
            let client = OidcClient::discover(config).await?;
            info!(issuer = %config.oidc.issuer_url, "OIDC provider discovered");
            service.oidc = Some(client);
        }
        Ok(service)
    }

    pub fn oidc(&self) -> Option<&OidcClient> {
        self.oidc.as_ref()
    }

    pub fn session_expiration(&self) -> Duration {
        self.session_expiration
    }

    /// Sign a session token for the user
    pub fn create_token(&self, user: &User) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user.id.clone(),
            user_type: user.kind.as_str().to_string(),
            exp: now + self.session_expiration.as_secs() as i64,
            iat: now,
            nbf: now,
            iss: ISSUER.to_string(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
    }

    /// Verify a session token, sliding the window when it is half-spent.
    pub fn verify_session(&self, token: &str) -> Result<VerifiedSession, Error> {
        if token.is_empty() {
            return Err(Error::Unauthorized);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);

        let data =
            decode::<Claims>(token, &self.decoding_key, &validation).map_err(|_| Error::Unauthorized)?;
        let kind = UserKind::parse(&data.claims.user_type).ok_or(Error::Unauthorized)?;
        let user = User {
            id: data.claims.sub.clone(),
            kind,
        };

        let remaining = data.claims.exp - Utc::now().timestamp();
        let refreshed_token = if remaining < (self.session_expiration.as_secs() as i64) / 2 {
            match self.create_token(&user) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(error = %e, "Failed to renew session token");
                    None
                }
            }
        } else {
            None
        };

        Ok(VerifiedSession {
            user,
            refreshed_token,
        })
    }

    /// Mint an anonymous user and its session token
    pub fn login_anonymous(&self) -> Result<(String, User), Error> {
        if !self.anonymous_enabled {
            return Err(Error::NotFound);
        }
        let user = User {
            id: format!("anon-{}", uuid::Uuid::new_v4()),
            kind: UserKind::Anonymous,
        };
        let token = self.create_token(&user).map_err(|_| Error::Unauthorized)?;
        Ok((token, user))
    }
}

/// Session cookie carrying a fresh token
pub fn session_cookie(token: &str, max_age: Duration) -> String {
    format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        SESSION_COOKIE,
        token,
        max_age.as_secs()
    )
}

/// Expired session cookie (logout)
pub fn clear_session_cookie() -> String {
    format!("{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax", SESSION_COOKIE)
}

/// Expired instance-selection cookie. Not HttpOnly: the frontend sets it.
pub fn clear_instance_cookie() -> String {
    format!("{}=; Path=/; Max-Age=0", INSTANCE_COOKIE)
}

/// Extract a cookie value from a Cookie header
pub fn cookie_value(cookie_header: &str, name: &str) -> Option<String> {
    for cookie in cookie_header.split(';') {
        let cookie = cookie.trim();
        if let Some(value) = cookie.strip_prefix(name) {
            if let Some(value) = value.strip_prefix('=') {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// OIDC provider endpoints resolved by discovery
#[derive(Debug, Deserialize)]
struct Discovery {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
}

/// OpenID Connect authorization-code client
pub struct OidcClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    scopes: Vec<String>,
    discovery: Discovery,
    /// Pending authorize states, pruned on use
    states: DashMap<String, Instant>,
}

impl OidcClient {
    pub async fn discover(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build OIDC HTTP client")?;

        let url = format!(
            "{}/.well-known/openid-configuration",
            config.oidc.issuer_url.trim_end_matches('/')
        );
        let discovery: Discovery = http
            .get(&url)
            .send()
            .await
            .context("failed to fetch OIDC discovery document")?
            .error_for_status()
            .context("OIDC discovery request failed")?
            .json()
            .await
            .context("failed to decode OIDC discovery document")?;

        Ok(Self {
            http,
            client_id: config.oidc.client_id.clone(),
            client_secret: config.oidc.client_secret.clone(),
            redirect_url: config.oidc.redirect_url.clone(),
            scopes: config.oidc.scopes.clone(),
            discovery,
            states: DashMap::new(),
        })
    }

    /// Authorization URL with a fresh state recorded for later verification
    pub fn authorize_url(&self) -> Result<String> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let state = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

        self.states.retain(|_, created| created.elapsed() < STATE_TTL);
        self.states.insert(state.clone(), Instant::now());

        let url = url::Url::parse_with_params(
            &self.discovery.authorization_endpoint,
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_url.as_str()),
                ("scope", self.scopes.join(" ").as_str()),
                ("state", state.as_str()),
            ],
        )
        .context("failed to build authorization URL")?;

        Ok(url.into())
    }

    /// Redeem a state exactly once, rejecting unknown and expired ones
    fn take_state(&self, state: &str) -> bool {
        match self.states.remove(state) {
            Some((_, created)) => created.elapsed() < STATE_TTL,
            None => false,
        }
    }

    /// Exchange the callback code for an ID token and verify it against the
    /// provider's JWKS. The state must match one we issued.
    pub async fn exchange_code(&self, code: &str, state: &str) -> Result<User> {
        if !self.take_state(state) {
            anyhow::bail!("unknown or expired OIDC state");
        }

        let token: TokenResponse = self
            .http
            .post(&self.discovery.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_url.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .context("failed to call OIDC token endpoint")?
            .error_for_status()
            .context("OIDC token exchange failed")?
            .json()
            .await
            .context("failed to decode OIDC token response")?;

        let sub = self.verify_id_token(&token.id_token).await?;
        Ok(User {
            id: format!("oidc:{}", sub),
            kind: UserKind::Oidc,
        })
    }

    async fn verify_id_token(&self, id_token: &str) -> Result<String> {
        let header = jsonwebtoken::decode_header(id_token).context("failed to decode ID token header")?;

        let jwks: JwkSet = self
            .http
            .get(&self.discovery.jwks_uri)
            .send()
            .await
            .context("failed to fetch JWKS")?
            .error_for_status()
            .context("JWKS request failed")?
            .json()
            .await
            .context("failed to decode JWKS")?;

        let key = jwks
            .keys
            .iter()
            .find(|k| header.kid.is_none() || k.kid == header.kid)
            .context("no matching key in JWKS")?;
        let (n, e) = match (&key.n, &key.e) {
            (Some(n), Some(e)) => (n, e),
            _ => anyhow::bail!("JWKS key is not an RSA key"),
        };
        let decoding_key =
            DecodingKey::from_rsa_components(n, e).context("failed to build key from JWKS")?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&[&self.discovery.issuer]);

        let data = decode::<IdTokenClaims>(id_token, &decoding_key, &validation)
            .context("failed to verify ID token")?;
        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn auth() -> AuthService {
        AuthService::new(&test_config())
    }

    fn anon_user(id: &str) -> User {
        User {
            id: id.to_string(),
            kind: UserKind::Anonymous,
        }
    }

    #[test]
    fn test_create_and_verify_token() {
        let auth = auth();
        let token = auth.create_token(&anon_user("anon-123")).unwrap();

        let session = auth.verify_session(&token).unwrap();
        assert_eq!(session.user.id, "anon-123");
        assert_eq!(session.user.kind, UserKind::Anonymous);
        // A fresh token has its whole life ahead: no renewal
        assert!(session.refreshed_token.is_none());
    }

    #[test]
    fn test_invalid_and_empty_tokens_rejected() {
        let auth = auth();
        assert!(matches!(auth.verify_session(""), Err(Error::Unauthorized)));
        assert!(matches!(
            auth.verify_session("invalid.token.here"),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let auth1 = auth();
        let token = auth1.create_token(&anon_user("u")).unwrap();

        let mut config = test_config();
        config.jwt_secret = "a-different-secret".to_string();
        let auth2 = AuthService::new(&config);
        assert!(matches!(auth2.verify_session(&token), Err(Error::Unauthorized)));
    }

    #[test]
    fn test_sliding_session_renews_half_spent_token() {
        let mut config = test_config();
        config.session_expiration = Duration::from_secs(3600);
        let long = AuthService::new(&config);

        // Issue a token from a service with a short expiration, verify with
        // the long one: remaining lifetime is far below half of an hour.
        config.session_expiration = Duration::from_secs(60);
        let short = AuthService::new(&config);

        let token = short.create_token(&anon_user("u")).unwrap();
        let session = long.verify_session(&token).unwrap();
        assert!(session.refreshed_token.is_some());

        let renewed = session.refreshed_token.unwrap();
        assert!(long.verify_session(&renewed).is_ok());
    }

    #[test]
    fn test_login_anonymous() {
        let (token, user) = auth().login_anonymous().unwrap();
        assert!(user.id.starts_with("anon-"));
        assert_eq!(user.kind, UserKind::Anonymous);

        let session = auth().verify_session(&token).unwrap();
        assert_eq!(session.user.id, user.id);
    }

    #[test]
    fn test_login_anonymous_disabled() {
        let mut config = test_config();
        config.auth_methods = vec!["oidc".to_string()];
        let auth = AuthService::new(&config);
        assert!(auth.login_anonymous().is_err());
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("tok123", Duration::from_secs(86400));
        assert!(cookie.starts_with("hakoniwa_session=tok123"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
    }

    #[test]
    fn test_clear_cookies() {
        let session = clear_session_cookie();
        assert!(session.contains("hakoniwa_session="));
        assert!(session.contains("Max-Age=0"));
        assert!(session.contains("HttpOnly"));

        let instance = clear_instance_cookie();
        assert!(instance.contains("hakoniwa_instance_id="));
        assert!(instance.contains("Max-Age=0"));
        // The frontend writes this cookie, so it must stay readable
        assert!(!instance.contains("HttpOnly"));
    }

    #[test]
    fn test_cookie_value_extraction() {
        let header = "hakoniwa_session=abc123; hakoniwa_instance_id=i-9";
        assert_eq!(cookie_value(header, SESSION_COOKIE).as_deref(), Some("abc123"));
        assert_eq!(cookie_value(header, INSTANCE_COOKIE).as_deref(), Some("i-9"));
        assert_eq!(cookie_value(header, "other"), None);
        assert_eq!(cookie_value("hakoniwa_session=", SESSION_COOKIE), None);
        assert_eq!(cookie_value("", SESSION_COOKIE), None);
    }
}
