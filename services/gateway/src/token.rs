//! Bearer token verification and identity propagation
//!
//! Tokens are HMAC-signed JWTs issued by the identity service. Verification
//! checks the signature, the algorithm family and `exp`; the decoded claims
//! are then normalised so that nothing loosely typed leaves this module.

use anyhow::{Context, Result};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

use crate::config::AuthConfig;
use crate::error::{AuthFailure, GatewayError};

/// Subject identity set on requests forwarded after verification
pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");
/// Comma-joined roles set on requests forwarded after verification
pub const USER_ROLES_HEADER: HeaderName = HeaderName::from_static("x-user-roles");

const BEARER_PREFIX: &str = "Bearer ";

/// Roles as they may appear in a token
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RolesClaim {
    List(Vec<Value>),
    Joined(String),
    Other(Value),
}

impl RolesClaim {
    fn into_roles(self) -> Vec<String> {
        match self {
            Self::List(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(role) if !role.trim().is_empty() => Some(role.trim().to_string()),
                    _ => None,
                })
                .collect(),
            Self::Joined(joined) => split_roles(&joined),
            Self::Other(_) => Vec::new(),
        }
    }
}

/// Split a comma-joined role list, dropping blanks
#[must_use]
pub fn split_roles(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    roles: Option<RolesClaim>,
    #[serde(default)]
    exp: Option<u64>,
}

/// Verified identity extracted from a bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject identifier, from `id` or else `sub`, coerced to a string
    pub subject: Option<String>,
    /// Role names; empty when the token carries none
    pub roles: Vec<String>,
    pub expires_at: Option<u64>,
}

impl Claims {
    fn from_raw(raw: RawClaims) -> Self {
        let subject = raw
            .id
            .and_then(scalar_to_string)
            .or_else(|| raw.sub.and_then(scalar_to_string));

        Self {
            subject,
            roles: raw.roles.map(RolesClaim::into_roles).unwrap_or_default(),
            expires_at: raw.exp,
        }
    }

    /// Whether the caller holds one of `required`, or any of `admin_roles`
    #[must_use]
    pub fn has_any_role(&self, required: &[String], admin_roles: &[String]) -> bool {
        self.roles
            .iter()
            .any(|role| admin_roles.contains(role) || required.contains(role))
    }

    /// Write identity headers for the upstream. Blank subject or empty roles
    /// leave the corresponding header unset.
    pub fn apply_to(&self, headers: &mut HeaderMap) -> Result<(), GatewayError> {
        if let Some(subject) = &self.subject {
            let value = HeaderValue::from_str(subject)
                .map_err(|_| GatewayError::Unauthenticated(AuthFailure::UnrepresentableClaims))?;
            headers.insert(USER_ID_HEADER, value);
        }
        if !self.roles.is_empty() {
            let value = HeaderValue::from_str(&self.roles.join(","))
                .map_err(|_| GatewayError::Unauthenticated(AuthFailure::UnrepresentableClaims))?;
            headers.insert(USER_ROLES_HEADER, value);
        }
        Ok(())
    }
}

fn scalar_to_string(value: Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Remove identity headers a client may have supplied itself
pub fn strip_identity_headers(headers: &mut HeaderMap) {
    headers.remove(USER_ID_HEADER);
    headers.remove(USER_ROLES_HEADER);
}

/// Verifies HMAC-signed bearer tokens against the shared secret
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let algorithms = config
            .allowed_algorithms
            .iter()
            .map(|name| {
                Algorithm::from_str(name).with_context(|| format!("unknown algorithm {name}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let first = *algorithms
            .first()
            .context("at least one token algorithm is required")?;

        let mut validation = Validation::new(first);
        validation.algorithms = algorithms;
        validation.leeway = config.leeway_seconds;
        validation.validate_exp = true;
        validation.validate_aud = false;
        // Tokens without `exp` are accepted; expired ones are not
        validation.required_spec_claims.clear();

        Ok(Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        })
    }

    /// Verify the raw `Authorization` header value
    pub fn verify_header(&self, header: Option<&str>) -> Result<Claims, GatewayError> {
        let token = header
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(GatewayError::Unauthenticated(AuthFailure::MissingToken))?;
        self.verify(token)
    }

    /// Verify a bare token
    pub fn verify(&self, token: &str) -> Result<Claims, GatewayError> {
        decode::<RawClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| Claims::from_raw(data.claims))
            .map_err(|e| {
                let failure = match e.kind() {
                    ErrorKind::ExpiredSignature => AuthFailure::Expired,
                    ErrorKind::InvalidAlgorithm => AuthFailure::UnexpectedAlgorithm,
                    _ => AuthFailure::Invalid(e.to_string()),
                };
                GatewayError::Unauthenticated(failure)
            })
    }
}
