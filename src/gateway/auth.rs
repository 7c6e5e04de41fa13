//! Gateway authentication
//!
//! The gateway is the sole ingress: it verifies the HMAC-signed bearer
//! token once and forwards the verified identity in-process via request
//! extensions. Handlers trust the extension precisely because nothing else
//! can reach them.

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core_types::UserId;

use super::state::AppState;
use super::types::ApiResponse;

/// Bearer token claims.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// User id
    pub sub: UserId,
    pub email: String,
    pub role: String,
    pub tenant: String,
    pub exp: usize,
    #[serde(default)]
    pub iat: usize,
}

pub struct AuthVerifier {
    decoding: DecodingKey,
}

impl AuthVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

type AuthRejection = (StatusCode, Json<ApiResponse<()>>);

fn unauthorized(message: &str) -> AuthRejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiResponse::<()>::error("UNAUTHORIZED", message)),
    )
}

pub async fn jwt_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthRejection> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| unauthorized("Missing Authorization header"))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized("Invalid token format"))?;

    match state.auth.verify(token) {
        Ok(claims) => {
            request.extensions_mut().insert(claims);
            Ok(next.run(request).await)
        }
        Err(_) => Err(unauthorized("Invalid or expired token")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    pub(crate) fn mint_token(secret: &str, user: UserId) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user,
            email: "user@example.com".into(),
            role: "customer".into(),
            tenant: "main".into(),
            exp: (now + 3600) as usize,
            iat: now as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_verify_roundtrip() {
        let user = Uuid::new_v4();
        let token = mint_token("secret", user);
        let claims = AuthVerifier::new("secret").verify(&token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.role, "customer");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = mint_token("secret", Uuid::new_v4());
        assert!(AuthVerifier::new("other").verify(&token).is_err());
    }
}
