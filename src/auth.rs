//! Bearer token check run before any job is admitted.
//!
//! Tokens are HS256 JWTs issued by the identity service; this module only
//! verifies them (signature, algorithm and expiry).

use std::fmt;
use std::future::{Ready, ready};

use actix_web::dev::Payload;
use actix_web::error::InternalError;
use actix_web::{FromRequest, HttpRequest, HttpResponse, http::header, web};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::routes::ErrorResponse;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

/// Claims as issued by the identity service's login endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Expiration (Unix timestamp)
    pub exp: u64,
}

/// The authenticated caller of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub username: Option<String>,
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(name) => write!(f, "{name} ({})", self.subject),
            None => f.write_str(&self.subject),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Access denied. No token provided.")]
    MissingToken,
    #[error("Invalid token.")]
    Malformed,
    #[error("Invalid token.")]
    BadSignature,
    #[error("Unsupported token algorithm.")]
    UnsupportedAlgorithm,
    #[error("Token expired.")]
    Expired,
}

/// Decides whether a request may submit a job
pub trait AccessGate: Send + Sync {
    /// `authorization` is the raw `Authorization` header value, if any
    fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, AuthError>;
}

/// Verifies HS256 bearer tokens against a shared secret
pub struct JwtGate {
    secret: Vec<u8>,
    leeway_secs: u64,
}

impl JwtGate {
    pub fn new(secret: impl Into<Vec<u8>>, leeway_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            leeway_secs,
        }
    }

    fn verify(&self, token: &str, now: u64) -> Result<Claims, AuthError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| AuthError::Malformed)?;
        let header: JwtHeader =
            serde_json::from_slice(&header_bytes).map_err(|_| AuthError::Malformed)?;
        if header.alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::BadSignature)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature).map_err(|_| AuthError::BadSignature)?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::Malformed)?;

        if claims.exp.saturating_add(self.leeway_secs) <= now {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

impl AccessGate for JwtGate {
    fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, AuthError> {
        let token = extract_bearer_token(authorization).ok_or(AuthError::MissingToken)?;
        let claims = self.verify(token, unix_now())?;

        let subject = claims
            .sub
            .or_else(|| {
                claims.id.map(|id| match id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
            })
            .or_else(|| claims.username.clone())
            .unwrap_or_else(|| "anonymous".to_string());

        Ok(Principal {
            subject,
            username: claims.username,
        })
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(authorization: Option<&str>) -> Option<&str> {
    authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Encode claims to an HS256 JWT
pub fn sign_token(claims: &Claims, secret: &[u8]) -> anyhow::Result<String> {
    let header = JwtHeader {
        alg: "HS256".to_string(),
        typ: Some("JWT".to_string()),
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header_b64}.{payload_b64}");

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| anyhow::anyhow!("HMAC error: {e}"))?;
    mac.update(signing_input.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature_b64}"))
}

fn rejection(err: AuthError) -> actix_web::Error {
    let response = match err {
        AuthError::MissingToken => HttpResponse::Unauthorized().json(ErrorResponse {
            success: false,
            reason: "ERR_UNAUTHENTICATED",
            code: 2,
            error_log: err.to_string(),
        }),
        _ => HttpResponse::Forbidden().json(ErrorResponse {
            success: false,
            reason: "ERR_FORBIDDEN",
            code: 3,
            error_log: err.to_string(),
        }),
    };
    InternalError::from_response(err, response).into()
}

impl FromRequest for Principal {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let Some(gate) = req.app_data::<web::Data<dyn AccessGate>>() else {
            log::error!("No access gate configured, rejecting request");
            return ready(Err(actix_web::error::ErrorInternalServerError(
                "access gate missing",
            )));
        };

        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        ready(gate.authenticate(authorization).map_err(|e| {
            log::info!("Rejected request to {}: {e:?}", req.path());
            rejection(e)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test-secret-key-at-least-32-bytes-long";

    fn claims(exp: u64) -> Claims {
        Claims {
            id: Some(serde_json::json!(42)),
            username: Some("alice".to_string()),
            exp,
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_token_is_accepted() {
        let gate = JwtGate::new(TEST_SECRET, 0);
        let token = sign_token(&claims(unix_now() + 3600), TEST_SECRET).unwrap();

        let principal = gate
            .authenticate(Some(&format!("Bearer {token}")))
            .unwrap();
        assert_eq!(principal.subject, "42");
        assert_eq!(principal.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_missing_or_malformed_header() {
        let gate = JwtGate::new(TEST_SECRET, 0);
        assert_eq!(gate.authenticate(None), Err(AuthError::MissingToken));
        assert_eq!(gate.authenticate(Some("Basic abc")), Err(AuthError::MissingToken));
        assert_eq!(gate.authenticate(Some("Bearer ")), Err(AuthError::MissingToken));
        assert_eq!(gate.authenticate(Some("Bearer abc")), Err(AuthError::Malformed));
        assert_eq!(gate.authenticate(Some("Bearer a.b.c.d")), Err(AuthError::Malformed));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let gate = JwtGate::new(TEST_SECRET, 0);
        let token = sign_token(&claims(unix_now() + 3600), b"wrong-secret").unwrap();
        assert_eq!(
            gate.authenticate(Some(&format!("Bearer {token}"))),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let gate = JwtGate::new(TEST_SECRET, 0);
        let token = sign_token(&claims(unix_now() + 3600), TEST_SECRET).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims {
                username: Some("mallory".to_string()),
                ..claims(unix_now() + 3600)
            })
            .unwrap(),
        );
        let tampered = format!("{}.{}.{}", parts[0], forged, parts[2]);
        assert_eq!(
            gate.authenticate(Some(&format!("Bearer {tampered}"))),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let now = unix_now();
        let token = sign_token(&claims(now - 10), TEST_SECRET).unwrap();

        assert_eq!(
            JwtGate::new(TEST_SECRET, 0).verify(&token, now).unwrap_err(),
            AuthError::Expired
        );
        assert!(JwtGate::new(TEST_SECRET, 60).verify(&token, now).is_ok());
    }

    #[test]
    fn test_none_algorithm_is_rejected() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims(unix_now() + 60)).unwrap());
        let token = format!("{header}.{payload}.");
        assert_eq!(
            JwtGate::new(TEST_SECRET, 0).verify(&token, unix_now()),
            Err(AuthError::UnsupportedAlgorithm)
        );
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token(Some("Bearer abc123")), Some("abc123"));
        assert_eq!(extract_bearer_token(Some("abc123")), None);
        assert_eq!(extract_bearer_token(None), None);
    }
}
