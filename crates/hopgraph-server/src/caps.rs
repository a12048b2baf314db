//! Capability tokens: `kid.payload.sig`, base64url without padding, where
//! `sig` is HMAC-SHA256 over the raw JSON payload. Claims bind a caller to
//! tenants and verbs:
//!
//! ```json
//! {"tenants": ["u1"], "verbs": ["search", "plan"], "exp": 1767225600, "max_qps": 20, "jti": "t-1"}
//! ```
//!
//! With no keys configured every request is allowed.

use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as b64, Engine};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Instant;

pub type Rejection = (StatusCode, Json<JsonValue>);

/// Scope used for endpoints that are not tied to a tenant.
pub const ADMIN_SCOPE: &str = "admin://global";

fn reject(status: StatusCode, msg: &str) -> Rejection {
    (status, Json(json!({ "error": msg })))
}

#[derive(Clone, Default)]
pub struct CapKeys {
    // kid -> secret; active and next keys may both be live during rotation
    keys: Vec<(String, String)>,
}

impl CapKeys {
    pub fn from_env() -> Self {
        let mut keys = Vec::new();
        if let Ok(secret) = std::env::var("CAP_KEY_ACTIVE") {
            let kid = std::env::var("CAP_KEY_ACTIVE_ID").unwrap_or_else(|_| "active".into());
            keys.push((kid, secret));
        }
        if let Ok(secret) = std::env::var("CAP_KEY_NEXT") {
            let kid = std::env::var("CAP_KEY_NEXT_ID").unwrap_or_else(|_| "next".into());
            keys.push((kid, secret));
        }
        Self { keys }
    }

    pub fn with_key(mut self, kid: &str, secret: &str) -> Self {
        self.keys.push((kid.to_string(), secret.to_string()));
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    fn secret(&self, kid: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|(k, _)| k == kid)
            .map(|(_, s)| s.as_str())
    }

    /// Verify the bearer token and check it grants `verb` on `scope`.
    pub fn enforce(&self, headers: &HeaderMap, scope: &str, verb: &str) -> Result<JsonValue, Rejection> {
        if !self.is_enabled() {
            return Ok(json!({}));
        }
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "missing token"))?;
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(reject(StatusCode::UNAUTHORIZED, "bad token"));
        }
        let kid = parts[0];
        let payload = b64
            .decode(parts[1])
            .map_err(|_| reject(StatusCode::UNAUTHORIZED, "bad b64"))?;
        let sig = b64
            .decode(parts[2])
            .map_err(|_| reject(StatusCode::UNAUTHORIZED, "bad b64"))?;
        let secret = self
            .secret(kid)
            .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "unknown kid"))?;
        let mut mac = <Hmac<Sha256>>::new_from_slice(secret.as_bytes())
            .map_err(|_| reject(StatusCode::INTERNAL_SERVER_ERROR, "bad key"))?;
        mac.update(&payload);
        mac.verify_slice(&sig)
            .map_err(|_| reject(StatusCode::UNAUTHORIZED, "bad sig"))?;

        let mut claims: JsonValue = serde_json::from_slice(&payload)
            .map_err(|_| reject(StatusCode::UNAUTHORIZED, "bad claims"))?;
        if let JsonValue::Object(map) = &mut claims {
            map.insert("kid".into(), JsonValue::String(kid.to_string()));
        }

        if let Some(exp) = claims.get("exp").and_then(|v| v.as_i64()) {
            if exp < chrono::Utc::now().timestamp() {
                return Err(reject(StatusCode::UNAUTHORIZED, "expired"));
            }
        }
        // admin tokens carry the admin verb instead of a tenant list
        if scope != ADMIN_SCOPE {
            let allowed = claims
                .get("tenants")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().any(|v| v.as_str() == Some(scope)))
                .unwrap_or(false);
            if !allowed {
                return Err(reject(StatusCode::FORBIDDEN, "tenant denied"));
            }
        }
        // a missing verb list grants every tenant verb, never admin
        let granted = match claims.get("verbs").and_then(|v| v.as_array()) {
            Some(arr) => arr.iter().any(|v| v.as_str() == Some(verb)),
            None => scope != ADMIN_SCOPE,
        };
        if !granted {
            return Err(reject(StatusCode::FORBIDDEN, "verb denied"));
        }
        Ok(claims)
    }
}

/// Token bucket per `kid:jti`, refilled at the token's `max_qps` with a burst of twice that.
#[derive(Default)]
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, (f64, Instant)>>,
}

impl RateLimiter {
    pub fn check(&self, claims: &JsonValue) -> Result<(), Rejection> {
        let Some(max_qps) = claims.get("max_qps").and_then(|v| v.as_u64()) else {
            return Ok(());
        };
        let kid = claims.get("kid").and_then(|v| v.as_str()).unwrap_or("active");
        let jti = claims.get("jti").and_then(|v| v.as_str()).unwrap_or("");
        let key = format!("{kid}:{jti}");
        let burst = (max_qps * 2) as f64;
        let now = Instant::now();
        let mut map = self.buckets.write();
        let entry = map.entry(key).or_insert((burst, now));
        let elapsed = now.duration_since(entry.1).as_secs_f64();
        entry.0 = (entry.0 + elapsed * max_qps as f64).min(burst);
        entry.1 = now;
        if entry.0 >= 1.0 {
            entry.0 -= 1.0;
            Ok(())
        } else {
            Err(reject(StatusCode::TOO_MANY_REQUESTS, "rate_limited"))
        }
    }
}

#[cfg(test)]
pub(crate) fn sign(kid: &str, secret: &str, claims: &JsonValue) -> String {
    let payload = serde_json::to_vec(claims).unwrap();
    let mut mac = <Hmac<Sha256>>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(&payload);
    let sig = mac.finalize().into_bytes();
    format!("{kid}.{}.{}", b64.encode(&payload), b64.encode(sig))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(token: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        h
    }

    fn keys() -> CapKeys {
        CapKeys::default().with_key("active", "s3cret").with_key("next", "rotated")
    }

    #[test]
    fn disabled_without_keys() {
        assert!(CapKeys::default()
            .enforce(&HeaderMap::new(), "u1", "search")
            .is_ok());
    }

    #[test]
    fn tenant_binding() {
        let token = sign("active", "s3cret", &json!({"tenants": ["u1"], "verbs": ["search"]}));
        let k = keys();
        assert!(k.enforce(&headers(&token), "u1", "search").is_ok());
        assert_eq!(
            k.enforce(&headers(&token), "u2", "search").unwrap_err().0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            k.enforce(&headers(&token), "u1", "plan").unwrap_err().0,
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn rotated_key_and_bad_signatures() {
        let k = keys();
        let next = sign("next", "rotated", &json!({"tenants": ["u1"]}));
        assert!(k.enforce(&headers(&next), "u1", "plan").is_ok());
        let forged = sign("active", "wrong", &json!({"tenants": ["u1"]}));
        assert_eq!(
            k.enforce(&headers(&forged), "u1", "plan").unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
        assert!(k.enforce(&HeaderMap::new(), "u1", "plan").is_err());
    }

    #[test]
    fn admin_needs_the_admin_verb() {
        let k = keys();
        let tenant = sign("active", "s3cret", &json!({"tenants": ["u1"]}));
        assert!(k.enforce(&headers(&tenant), ADMIN_SCOPE, "admin").is_err());
        let admin = sign("active", "s3cret", &json!({"verbs": ["admin"]}));
        assert!(k.enforce(&headers(&admin), ADMIN_SCOPE, "admin").is_ok());
    }

    #[test]
    fn expired_tokens() {
        let token = sign("active", "s3cret", &json!({"tenants": ["u1"], "exp": 1}));
        assert_eq!(
            keys().enforce(&headers(&token), "u1", "search").unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn rate_limit_burst() {
        let limiter = RateLimiter::default();
        let claims = json!({"kid": "active", "jti": "t", "max_qps": 1});
        assert!(limiter.check(&claims).is_ok());
        assert!(limiter.check(&claims).is_ok());
        assert!(limiter.check(&claims).is_err());
        assert!(limiter.check(&json!({})).is_ok());
    }
}
