use std::sync::Arc;

use axum::{
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
    body::Body,
};

use shared_models::auth::User;
use shared_models::error::AppError;
use shared_config::AppConfig;

use crate::jwt::{bearer_token, validate_token};

/// Validates the bearer token and stores the resulting `User` in the request
/// extensions for handlers to pick up with `Extension<User>`.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let auth_value = request
        .headers()
        .get("Authorization")
        .ok_or_else(|| AppError::Auth("Missing authorization header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Auth("Invalid authorization header format".to_string()))?;

    let token = bearer_token(auth_value)
        .ok_or_else(|| AppError::Auth("Invalid authorization header format".to_string()))?;

    let user = user_from_token(token, &config)?;
    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

/// Token check for transports that cannot carry headers (websocket upgrades
/// from browsers pass the token as a query parameter).
pub fn user_from_token(token: &str, config: &AppConfig) -> Result<User, AppError> {
    validate_token(token, &config.supabase_jwt_secret).map_err(AppError::Auth)
}

pub fn is_admin(user: &User) -> bool {
    user.role.as_deref() == Some("admin")
}
