use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::rbac::{Identity, Role};
use crate::AppState;

/// Bearer token claims. `sub` is the user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub exp: i64,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Identity::new(claims.sub, claims.role, claims.scopes)
    }
}

/// Mint an HS256 token for `identity`, valid for `ttl`.
pub fn issue_token(
    secret: &str,
    identity: &Identity,
    ttl: chrono::Duration,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: identity.user_id.clone(),
        role: identity.role.clone(),
        scopes: identity.scopes.clone(),
        exp: (chrono::Utc::now() + ttl).timestamp(),
    };
    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

pub fn verify_token(secret: &str, token: &str) -> anyhow::Result<Identity> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims.into())
}

/// Middleware: validates the bearer token and attaches the caller's
/// [`Identity`] to the request. Returns 401 if missing or invalid.
pub async fn require_identity(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim());

    let Some(token) = token else {
        tracing::warn!("missing bearer token");
        return Err(StatusCode::UNAUTHORIZED);
    };

    match verify_token(&state.config.jwt_secret, token) {
        Ok(identity) => {
            tracing::debug!(user_id = %identity.user_id, role = identity.role.as_str(), "authenticated");
            req.extensions_mut().insert(identity);
            Ok(next.run(req).await)
        }
        Err(e) => {
            tracing::warn!(error = %e, "invalid bearer token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
