//! Bearer-token authentication middleware

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use linedesk_shared::RoleLevel;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::jwt::JwtManager;
use crate::error::ApiError;

/// State needed by the auth middleware
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub pool: PgPool,
}

/// Authenticated user, inserted into request extensions by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role: RoleLevel,
    pub role_name: String,
    pub line_id: Option<Uuid>,
}

impl AuthUser {
    pub fn require_supervisor(&self) -> Result<(), ApiError> {
        if self.role.can_supervise() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.role.can_administer() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

#[derive(Debug, FromRow)]
struct AuthUserRow {
    id: Uuid,
    email: String,
    full_name: String,
    role_name: String,
    line_id: Option<Uuid>,
    is_active: bool,
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Resolve a validated access token to an active user
pub async fn authenticate(state: &AuthState, token: &str) -> Result<AuthUser, ApiError> {
    let claims = state
        .jwt_manager
        .validate_access_token(token)
        .map_err(|e| {
            tracing::debug!(error = %e, "Access token rejected");
            ApiError::InvalidToken
        })?;

    // Role and active flag are read fresh so deactivation takes effect immediately
    let row = sqlx::query_as::<_, AuthUserRow>(
        r#"
        SELECT u.id, u.email, u.full_name, r.name AS role_name, u.line_id, u.is_active
        FROM users u
        JOIN roles r ON r.id = u.role_id
        WHERE u.id = $1
        "#,
    )
    .bind(claims.sub)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::InvalidToken)?;

    if !row.is_active {
        tracing::warn!(user_id = %row.id, "Deactivated user presented a valid token");
        return Err(ApiError::Unauthorized);
    }

    Ok(AuthUser {
        user_id: row.id,
        email: row.email,
        full_name: row.full_name,
        role: RoleLevel::from_role_name(&row.role_name),
        role_name: row.role_name,
        line_id: row.line_id,
    })
}

/// Require a valid access token on every request
pub async fn require_auth(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(bearer_token)
        .ok_or(ApiError::Unauthorized)?
        .to_string();

    let auth_user = authenticate(&state, &token).await?;
    request.extensions_mut().insert(auth_user);

    Ok(next.run(request).await)
}
