//! Authentication boundary.
//!
//! Sign-in itself happens elsewhere; the gateway only verifies the bearer token
//! it is handed and extracts the caller's identity.

use crate::config::{AuthConfig, Environment};
use crate::error::GatewayError;
use crate::proxy::is_upgrade_request;
use hyper::header::{HeaderMap, AUTHORIZATION};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

const DEVELOPMENT_SECRET: &str = "development-only-secret";
pub const TOKEN_PARAM: &str = "token";

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

/// Outcome of inspecting a request's credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Missing,
    Valid(Identity),
    Invalid(String),
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap, query: Option<&str>) -> Credentials;
}

impl Credentials {
    /// Resolve credentials against a route's auth requirement.
    ///
    /// On public routes and local endpoints an invalid token is treated as no
    /// token at all, so a stale token never fails a liveness check.
    pub fn require(self, required: bool) -> Result<Option<Identity>, GatewayError> {
        match self {
            Credentials::Valid(identity) => Ok(Some(identity)),
            Credentials::Invalid(reason) if required => Err(GatewayError::Forbidden { reason }),
            Credentials::Invalid(reason) => {
                tracing::debug!(%reason, "Ignoring invalid token on a public path");
                Ok(None)
            }
            Credentials::Missing if required => Err(GatewayError::Unauthorized {
                reason: "Provide a bearer token in the Authorization header".to_string(),
            }),
            Credentials::Missing => Ok(None),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    #[serde(alias = "userId")]
    user_id: Option<String>,
    id: Option<serde_json::Value>,
    email: Option<String>,
}

/// HS256 JWT verification.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn from_config(config: &AuthConfig, environment: Environment) -> Self {
        match &config.jwt_secret {
            Some(secret) => Self::new(secret),
            None => {
                // production configs without a secret are rejected by validation
                tracing::warn!(?environment, "JWT_SECRET not set; using the development secret");
                Self::new(DEVELOPMENT_SECRET)
            }
        }
    }

    fn token<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> Option<&'a str> {
        let from_header = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
            .map(str::trim)
            .filter(|t| !t.is_empty());

        // browsers cannot set headers on a websocket handshake
        if from_header.is_some() || !is_upgrade_request(headers) {
            return from_header;
        }
        query?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == TOKEN_PARAM)
            .map(|(_, v)| v)
            .filter(|t| !t.is_empty())
    }
}

/// Query string with every `token` parameter removed; `None` when nothing is
/// left.
pub fn strip_token_param(query: &str) -> Option<String> {
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split_once('=').map_or(*pair, |(k, _)| k) != TOKEN_PARAM)
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, headers: &HeaderMap, query: Option<&str>) -> Credentials {
        let token = match Self::token(headers, query) {
            Some(token) => token,
            None => return Credentials::Missing,
        };

        let claims = match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => data.claims,
            Err(e) => return Credentials::Invalid(e.to_string()),
        };

        let id_claim = claims.id.map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        match claims.user_id.or(id_claim).or(claims.sub) {
            Some(user_id) if !user_id.is_empty() => Credentials::Valid(Identity {
                user_id,
                email: claims.email,
            }),
            _ => Credentials::Invalid("token carries no user id".to_string()),
        }
    }
}
