use std::{error::Error as StdError, sync::Arc, time::Duration};

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

/// Outcome taxonomy shared by the registry, provisioner, resolver and the HTTP layer.
///
/// `Clone` so a single provisioning result can be handed to every caller
/// waiting on the same in-flight attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TenantError {
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("provisioning failed for tenant {tenant}: {reason}")]
    ProvisioningFailed { tenant: Uuid, reason: String },

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("{0}")]
    InvalidInput(String),

    #[error("tenant {0} is inactive")]
    Inactive(Uuid),

    #[error("database error: {0}")]
    Database(#[source] Arc<sqlx::Error>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TenantError {
    pub fn provisioning_in_progress(tenant: Uuid) -> Self {
        Self::Unavailable(format!("tenant {tenant} is being provisioned, retry shortly"))
    }

    pub fn tenant_not_found(tenant: Uuid) -> Self {
        Self::NotFound(format!("tenant not found: {tenant}"))
    }

    /// Stable machine-readable code for API clients and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::ProvisioningFailed { .. } => "provisioning_failed",
            Self::Timeout { .. } => "timeout",
            Self::InvalidInput(_) => "invalid_input",
            Self::Inactive(_) => "inactive",
            Self::Database(_) | Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) | Self::ProvisioningFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Inactive(_) => StatusCode::FORBIDDEN,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for TenantError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                Self::Unavailable("connection pool exhausted, retry shortly".into())
            }
            other => Self::Database(Arc::new(other)),
        }
    }
}

impl IntoResponse for TenantError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            // Driver details stay in the logs.
            Self::Database(_) | Self::Internal(_) => {
                tracing::error!(error = %error_chain(&self), "request failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({ "error": message, "code": self.code() }));

        if matches!(self, Self::Unavailable(_)) {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Renders an error and all of its sources as `outer: inner: root`.
pub fn error_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}
