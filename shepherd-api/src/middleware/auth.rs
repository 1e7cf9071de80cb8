//! Authentication middleware
//!
//! Resolves the bearer token of each API request to an [`Actor`] and stores
//! it in the request extensions for the handlers.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use shepherd_common::auth::Actor;

use crate::auth::bearer_token;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);

    let actor: Actor = match token.and_then(|t| state.accounts.authenticate(t)) {
        Some(actor) => actor,
        None => {
            tracing::debug!(
                path = %request.uri().path(),
                has_token = token.is_some(),
                "Rejected unauthenticated request"
            );
            return Err(ApiError::AuthenticationFailed);
        }
    };

    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}
