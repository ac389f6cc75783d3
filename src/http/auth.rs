//! OAuth bearer validation for the HTTP transport.
//!
//! Tokens are RS256 JWTs verified against the tenant's JWKS, fetched once
//! per process and cached. The verifier sits behind a trait so tests (and
//! other identity providers) can substitute their own.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::OnceCell;

use super::rpc::{rpc_error, CODE_AUTH};
use super::AppState;

const AUTH_FAILED_MESSAGE: &str = "Invalid or expired token";

pub trait TokenVerifier: Send + Sync + 'static {
    /// Verify a bearer token, returning its claims. The error string is
    /// what the client sees in the 401 body.
    fn verify<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send + 'a>>;
}

/// Verified JWT claims, attached to the request for handlers that want them.
#[derive(Clone, Debug)]
pub struct AuthClaims(pub Value);

pub struct Auth0JwksVerifier {
    domain: String,
    audience: String,
    http: reqwest::Client,
    /// One JWKS fetch per process lifetime, keyed implicitly by the domain
    /// this verifier was constructed for.
    keys: OnceCell<HashMap<String, DecodingKey>>,
}

impl Auth0JwksVerifier {
    pub fn new(domain: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            audience: audience.into(),
            http: reqwest::Client::new(),
            keys: OnceCell::new(),
        }
    }

    async fn decoding_keys(&self) -> Result<&HashMap<String, DecodingKey>, String> {
        self.keys
            .get_or_try_init(|| async {
                let url = format!("https://{}/.well-known/jwks.json", self.domain);
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| format!("JWKS fetch failed: {e}"))?;
                let document: Value = response
                    .json()
                    .await
                    .map_err(|e| format!("JWKS parse failed: {e}"))?;
                let keys = parse_jwks(&document);
                if keys.is_empty() {
                    return Err(format!("JWKS at {url} contains no usable RSA keys"));
                }
                Ok(keys)
            })
            .await
    }

    async fn verify_token(&self, token: &str) -> Result<Value, String> {
        let header = decode_header(token).map_err(|_| AUTH_FAILED_MESSAGE.to_string())?;
        if header.alg != Algorithm::RS256 {
            return Err(AUTH_FAILED_MESSAGE.to_string());
        }
        let keys = self.decoding_keys().await.map_err(|e| {
            tracing::error!("{}", e);
            AUTH_FAILED_MESSAGE.to_string()
        })?;
        let key = match &header.kid {
            Some(kid) => keys.get(kid),
            None => keys.values().next(),
        }
        .ok_or_else(|| AUTH_FAILED_MESSAGE.to_string())?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_issuer(&[format!("https://{}/", self.domain)]);

        decode::<Value>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(|_| AUTH_FAILED_MESSAGE.to_string())
    }
}

impl TokenVerifier for Auth0JwksVerifier {
    fn verify<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send + 'a>> {
        Box::pin(self.verify_token(token))
    }
}

/// `{keys: [{kty: "RSA", kid, n, e}, ...]}` → kid-keyed decoding keys.
/// Non-RSA entries and malformed components are skipped.
fn parse_jwks(document: &Value) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();
    let Some(entries) = document.get("keys").and_then(|k| k.as_array()) else {
        return keys;
    };
    for entry in entries {
        if entry.get("kty").and_then(|v| v.as_str()) != Some("RSA") {
            continue;
        }
        let (Some(n), Some(e)) = (
            entry.get("n").and_then(|v| v.as_str()),
            entry.get("e").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        let kid = entry
            .get("kid")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        match DecodingKey::from_rsa_components(n, e) {
            Ok(key) => {
                keys.insert(kid, key);
            }
            Err(err) => tracing::warn!("skipping malformed JWKS entry: {}", err),
        }
    }
    keys
}

pub(crate) fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string()
}

fn www_authenticate_value(host: &str) -> String {
    format!(
        "Bearer realm=\"mcp\", \
         resource_metadata=\"https://{host}/.well-known/oauth-protected-resource\", \
         scope=\"openid profile email\""
    )
}

fn unauthorized(host: &str, message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, www_authenticate_value(host))],
        Json(rpc_error(Value::Null, CODE_AUTH, message)),
    )
        .into_response()
}

/// Bearer middleware for `/mcp`. A no-op when auth mode is `none`.
pub async fn bearer_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(verifier) = state.auth.clone() else {
        return next.run(request).await;
    };
    let host = request_host(request.headers());

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let Some(token) = token else {
        return unauthorized(&host, "Missing bearer token");
    };

    match verifier.verify(&token).await {
        Ok(claims) => {
            request.extensions_mut().insert(AuthClaims(claims));
            next.run(request).await
        }
        Err(message) => unauthorized(&host, &message),
    }
}

/// RFC 9728 protected-resource metadata, served at both well-known paths.
pub async fn resource_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<Value> {
    let host = request_host(&headers);
    let domain = state.config.http.auth0_domain.clone().unwrap_or_default();
    let mut document = json!({
        "resource": format!("https://{host}/mcp"),
        "authorization_servers": [format!("https://{domain}/")],
        "scopes_supported": ["openid", "profile", "email"],
        "bearer_methods_supported": ["header"],
    });
    if let Some(docs) = &state.config.http.resource_documentation {
        document["resource_documentation"] = Value::String(docs.clone());
    }
    Json(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn www_authenticate_names_the_resource_metadata() {
        let value = www_authenticate_value("example.com:3000");
        assert!(value.starts_with("Bearer realm=\"mcp\""));
        assert!(value.contains(
            "resource_metadata=\"https://example.com:3000/.well-known/oauth-protected-resource\""
        ));
        assert!(value.contains("scope=\"openid profile email\""));
    }

    #[test]
    fn parse_jwks_keeps_rsa_keys_only() {
        // Modulus is any valid base64url blob; jsonwebtoken defers real
        // validation until decode time.
        let document = json!({
            "keys": [
                { "kty": "RSA", "kid": "key-1", "n": "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1Wl",
                  "e": "AQAB" },
                { "kty": "EC", "kid": "key-2", "crv": "P-256" },
                { "kty": "RSA", "kid": "key-3" }
            ]
        });
        let keys = parse_jwks(&document);
        assert!(keys.contains_key("key-1"));
        assert!(!keys.contains_key("key-2"), "EC keys are skipped");
        assert!(!keys.contains_key("key-3"), "keys without components are skipped");
    }

    #[test]
    fn parse_jwks_tolerates_missing_keys_field() {
        assert!(parse_jwks(&json!({})).is_empty());
        assert!(parse_jwks(&json!({"keys": "nope"})).is_empty());
    }

    #[test]
    fn request_host_falls_back_to_localhost() {
        let headers = HeaderMap::new();
        assert_eq!(request_host(&headers), "localhost");
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "mcp.example.com".parse().unwrap());
        assert_eq!(request_host(&headers), "mcp.example.com");
    }
}
