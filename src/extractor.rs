use std::sync::Arc;

use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Client,
    /// The billing system calling its hooks.
    System,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i32,
    role: Role,
    exp: usize,
}

/// Secret shared with the billing system, installed as a router extension.
#[derive(Clone)]
pub struct JwtSecret(pub Arc<String>);

impl JwtSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Arc::new(secret.into()))
    }
}

/// Authenticated caller. For clients `subject` is the billing client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub subject: i32,
    pub role: Role,
}

impl Caller {
    pub fn admin(subject: i32) -> Self {
        Self {
            subject,
            role: Role::Admin,
        }
    }

    pub fn client(subject: i32) -> Self {
        Self {
            subject,
            role: Role::Client,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub fn issue_token(
    secret: &str,
    subject: i32,
    role: Role,
    ttl: chrono::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let exp = (chrono::Utc::now() + ttl).timestamp().max(0) as usize;
    encode(
        &Header::default(),
        &Claims {
            sub: subject,
            role,
            exp,
        },
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = if let Some(authz) = parts.headers.get(axum::http::header::AUTHORIZATION) {
            authz
                .to_str()
                .ok()
                .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.trim().to_string()))
        } else if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
            let cookies = cookie_header.to_str().unwrap_or("");
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix("auth_token=").map(|s| s.to_string())
            })
        } else {
            None
        };
        let token = token.ok_or(AppError::Unauthorized)?;
        let secret = parts
            .extensions
            .get::<JwtSecret>()
            .cloned()
            .ok_or_else(|| AppError::Internal("caller authentication is not configured".into()))?;
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.0.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::Unauthorized)?;
        Ok(Caller {
            subject: decoded.claims.sub,
            role: decoded.claims.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with(token: &str, secret: Option<&str>) -> Parts {
        let mut request = Request::builder()
            .header("Authorization", format!("Bearer {token}"))
            .body(axum::body::Body::empty())
            .unwrap();
        if let Some(secret) = secret {
            request.extensions_mut().insert(JwtSecret::new(secret));
        }
        request.into_parts().0
    }

    #[tokio::test]
    async fn token_parsed_from_header() {
        let token = issue_token("secret", 7, Role::Client, chrono::Duration::minutes(5)).unwrap();
        let mut parts = parts_with(&token, Some("secret"));
        let caller = Caller::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(caller, Caller::client(7));
    }

    #[tokio::test]
    async fn wrong_secret_rejected() {
        let token = issue_token("other", 1, Role::Admin, chrono::Duration::minutes(5)).unwrap();
        let mut parts = parts_with(&token, Some("secret"));
        let res = Caller::from_request_parts(&mut parts, &()).await;
        assert!(matches!(res, Err(AppError::Unauthorized)));
    }

    #[tokio::test]
    async fn invalid_token_rejected() {
        let mut parts = parts_with("invalid", Some("secret"));
        let res = Caller::from_request_parts(&mut parts, &()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn unknown_role_rejected() {
        let claims = serde_json::json!({"sub": 3, "role": "root", "exp": 9999999999u64});
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let mut parts = parts_with(&token, Some("secret"));
        assert!(Caller::from_request_parts(&mut parts, &()).await.is_err());
    }
}
