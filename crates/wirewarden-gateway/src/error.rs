use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use crate::db::acl::AclError;
use crate::db::firewall::FirewallStoreError;
use crate::db::peers::PeerStoreError;
use crate::db::routes::RouteError;
use crate::firewall::FirewallError;
use crate::identity::IdentityError;

/// The seven error kinds from the error-handling design (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream gateway error: {0}")]
    UpstreamGateway(String),

    #[error("internal server error")]
    Internal,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if let Self::RateLimited { retry_after_secs } = self {
            builder.insert_header(("Retry-After", retry_after_secs.to_string()));
        }
        builder.json(serde_json::json!({ "error": self.to_string() }))
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database error");
        Self::Internal
    }
}

impl From<PeerStoreError> for ApiError {
    fn from(err: PeerStoreError) -> Self {
        match err {
            PeerStoreError::DuplicateAddress => {
                Self::Conflict("peer address already in use".into())
            }
            PeerStoreError::NotFound => Self::NotFound,
            PeerStoreError::CidrExhausted => {
                Self::Validation("no available addresses in the peer CIDR".into())
            }
            PeerStoreError::Encryption => {
                tracing::error!("peer key encryption failed");
                Self::Internal
            }
            PeerStoreError::Database(e) => e.into(),
        }
    }
}

impl From<FirewallError> for ApiError {
    fn from(err: FirewallError) -> Self {
        match err {
            FirewallError::Database(e) => e.into(),
            FirewallError::Validation(msg) => Self::Validation(msg),
        }
    }
}

impl From<FirewallStoreError> for ApiError {
    fn from(err: FirewallStoreError) -> Self {
        match err {
            FirewallStoreError::Database(e) => e.into(),
            FirewallStoreError::Validation(msg) => Self::Validation(msg),
        }
    }
}

impl From<AclError> for ApiError {
    fn from(err: AclError) -> Self {
        match err {
            AclError::Database(e) => e.into(),
            AclError::Validation(msg) => Self::Validation(msg),
        }
    }
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::Database(e) => e.into(),
            RouteError::Validation(msg) => Self::Validation(msg),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Unauthorized => Self::Unauthorized,
            IdentityError::Upstream(msg) => Self::UpstreamGateway(msg),
        }
    }
}
