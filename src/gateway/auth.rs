//! Bearer-token authentication for the role-scoped nests

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::response::{ApiResponse, error_codes};
use super::state::AppState;
use crate::core_types::{PrincipalId, Role};
use crate::error::{LedgerError, LedgerResult};

/// JWT claims carried by every authenticated request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: PrincipalId,
    /// Numeric role id, see [`Role::id`]
    pub user_type: i16,
    pub exp: usize,
}

impl Claims {
    pub fn role(&self) -> Option<Role> {
        Role::from_id(self.user_type)
    }
}

pub fn issue_token(secret: &str, user_id: PrincipalId, role: Role, ttl_secs: i64) -> LedgerResult<String> {
    let claims = Claims {
        user_id,
        user_type: role.id(),
        exp: (Utc::now().timestamp() + ttl_secs).max(0) as usize,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| LedgerError::Internal(format!("token encode: {}", e)))
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)?;
    Ok(data.claims)
}

type Rejection = (StatusCode, Json<ApiResponse<()>>);

fn reject(code: i32, message: &str) -> Rejection {
    // business errors ride on 200
    (StatusCode::OK, Json(ApiResponse::error(code, message)))
}

/// Verify the bearer token and require the nest's role.
///
/// On success the [`Claims`] are inserted as a request extension.
pub async fn jwt_role_middleware(
    State((state, role)): State<(Arc<AppState>, Role)>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Rejection> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| reject(error_codes::UNAUTHENTICATED, "missing bearer token"))?;

    let claims = verify_token(&state.jwt_secret, token)
        .map_err(|_| reject(error_codes::UNAUTHENTICATED, "invalid or expired token"))?;

    if claims.role() != Some(role) {
        tracing::debug!(user_id = claims.user_id, user_type = claims.user_type, required = %role, "Role mismatch");
        return Err(reject(error_codes::FORBIDDEN, "role not permitted"));
    }

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip_and_tamper() {
        let token = issue_token("secret", 1_000_001, Role::ShopOwner, 3600).unwrap();
        let claims = verify_token("secret", &token).unwrap();
        assert_eq!(claims.user_id, 1_000_001);
        assert_eq!(claims.role(), Some(Role::ShopOwner));

        assert!(verify_token("other", &token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = issue_token("secret", 7, Role::Platform, -3600).unwrap();
        assert!(verify_token("secret", &token).is_err());
    }
}
