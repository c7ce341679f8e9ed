//! Identity service — token verification behind a trait seam.
//!
//! ARCHITECTURE
//! ============
//! The live channel authenticates with an opaque bearer token issued by the
//! managed auth layer (token issuance is out of scope here). Verification is
//! a trait object so tests can substitute a static verifier; production uses
//! the `api_tokens` table.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::ErrorCode;

/// Verified identity attached to a connection or HTTP request.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub claims: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for IdentityError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "E_INVALID_TOKEN",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token. Rejects with `InvalidToken` on unknown or
    /// expired tokens; never partially authenticates.
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError>;
}

/// Production verifier backed by the `api_tokens` table.
pub struct DbTokenVerifier {
    pool: PgPool,
}

impl DbTokenVerifier {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TokenVerifier for DbTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::InvalidToken);
        }

        let row = sqlx::query(
            r"SELECT u.id, u.email, t.claims
              FROM api_tokens t
              JOIN users u ON u.id = t.user_id
              WHERE t.token = $1 AND t.expires_at > now()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(IdentityError::InvalidToken);
        };

        Ok(Identity {
            user_id: row.get("id"),
            email: row.get("email"),
            claims: row.get("claims"),
        })
    }
}

#[cfg(test)]
#[path = "identity_test.rs"]
mod tests;
