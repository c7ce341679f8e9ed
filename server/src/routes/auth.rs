//! Bearer-token extractor for the REST surface.
//!
//! DESIGN
//! ======
//! REST endpoints authenticate per request from the `Authorization: Bearer`
//! header, through the same [`TokenVerifier`] the websocket uses for its
//! in-band authenticate envelope. One verifier, two transports.
//!
//! [`TokenVerifier`]: crate::services::identity::TokenVerifier

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use tracing::error;
use uuid::Uuid;

use crate::services::identity::IdentityError;
use crate::state::AppState;

/// The authenticated caller, extracted from the Authorization header.
pub struct AuthUser {
    pub user_id: Uuid,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or((StatusCode::UNAUTHORIZED, "bearer token required"))?;

        match state.verifier.verify(token).await {
            Ok(identity) => Ok(Self { user_id: identity.user_id }),
            Err(IdentityError::InvalidToken) => {
                Err((StatusCode::UNAUTHORIZED, "invalid or expired token"))
            }
            Err(e) => {
                error!(error = %e, "token verification failed");
                Err((StatusCode::INTERNAL_SERVER_ERROR, "token verification error"))
            }
        }
    }
}
