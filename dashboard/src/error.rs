//! Error taxonomy for the billing dashboard
//!
//! Wallet codes, contract reverts and backend status codes are classified into
//! [`BillingError`] at the boundary where they occur.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BillingError {
    #[error("Authentication expired: {0}")]
    AuthenticationExpired(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Wrong network: expected chain {expected}, wallet is on {actual}")]
    WrongNetwork { expected: u64, actual: u64 },

    #[error("No wallet account selected")]
    NoAccountSelected,

    #[error("Account {0} is not registered on the billing contract")]
    UserNotRegistered(String),

    #[error("Contract call failed: {0}")]
    ContractCallFailed(String),

    #[error("RPC node unavailable: {0}")]
    RpcUnavailable(String),

    #[error("Request timed out after {0} seconds")]
    RequestTimeout(u64),

    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("Ledgers diverged: {committed} write succeeded but the follow-up failed: {reason}")]
    DivergentLedger { committed: String, reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BillingError::ValidationError(msg.into())
    }

    /// Stable identifier used in JSON bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::AuthenticationExpired(_) => "authentication_expired",
            BillingError::Forbidden(_) => "forbidden",
            BillingError::WrongNetwork { .. } => "wrong_network",
            BillingError::NoAccountSelected => "no_account_selected",
            BillingError::UserNotRegistered(_) => "user_not_registered",
            BillingError::ContractCallFailed(_) => "contract_call_failed",
            BillingError::RpcUnavailable(_) => "rpc_unavailable",
            BillingError::RequestTimeout(_) => "request_timeout",
            BillingError::ValidationError(_) => "validation_error",
            BillingError::DivergentLedger { .. } => "divergent_ledger",
            BillingError::Backend(_) => "backend_error",
            BillingError::Internal(_) => "internal_error",
        }
    }

    /// Whether re-triggering the same action can succeed without someone
    /// else acting first. Nothing is ever retried automatically.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BillingError::UserNotRegistered(_)
                | BillingError::ValidationError(_)
                | BillingError::Forbidden(_)
        )
    }

    /// Login has to happen again before anything else will work.
    pub fn requires_login(&self) -> bool {
        matches!(self, BillingError::AuthenticationExpired(_))
    }

    /// Message suitable for a dismissible banner.
    pub fn user_message(&self) -> String {
        match self {
            BillingError::AuthenticationExpired(_) => {
                "Session expired. Please log in again.".to_string()
            }
            BillingError::Forbidden(detail) => format!("Access denied: {}", detail),
            BillingError::WrongNetwork { expected, .. } => {
                format!("Please switch your wallet to chain {}.", expected)
            }
            BillingError::NoAccountSelected => {
                "Please connect your wallet and select an account.".to_string()
            }
            BillingError::UserNotRegistered(_) => {
                "User not registered on blockchain. \
                 Please contact your ISP to register your account."
                    .to_string()
            }
            BillingError::ContractCallFailed(_) => {
                "Contract call failed (possible revert or user not registered).".to_string()
            }
            BillingError::RpcUnavailable(_) => {
                "Cannot reach the blockchain node. Please try again.".to_string()
            }
            BillingError::RequestTimeout(secs) => {
                format!("Request timed out after {} seconds.", secs)
            }
            BillingError::DivergentLedger { .. } => format!(
                "{}. The records were saved but are not yet on chain; \
                 an operator must reconcile them.",
                self
            ),
            BillingError::ValidationError(msg) | BillingError::Backend(msg) => msg.clone(),
            BillingError::Internal(_) => "Something went wrong. Please try again.".to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            BillingError::AuthenticationExpired(_) => StatusCode::UNAUTHORIZED,
            BillingError::Forbidden(_) => StatusCode::FORBIDDEN,
            BillingError::WrongNetwork { .. } => StatusCode::CONFLICT,
            BillingError::NoAccountSelected => StatusCode::PRECONDITION_REQUIRED,
            BillingError::UserNotRegistered(_) => StatusCode::FORBIDDEN,
            BillingError::ContractCallFailed(_) => StatusCode::BAD_GATEWAY,
            BillingError::RpcUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BillingError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BillingError::ValidationError(_) => StatusCode::BAD_REQUEST,
            BillingError::DivergentLedger { .. } => StatusCode::MULTI_STATUS,
            BillingError::Backend(_) => StatusCode::BAD_GATEWAY,
            BillingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let BillingError::Internal(ref detail) = self {
            tracing::error!("internal error: {}", detail);
        }

        let body = Json(json!({
            "error": self.user_message(),
            "kind": self.kind(),
            "code": status.as_u16(),
            "retryable": self.is_retryable(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_gate_is_not_retryable() {
        assert!(!BillingError::UserNotRegistered("0xabc".into()).is_retryable());
        assert!(!BillingError::validation("bad").is_retryable());
        assert!(BillingError::RpcUnavailable("down".into()).is_retryable());
    }

    #[test]
    fn expired_auth_maps_to_unauthorized() {
        let err = BillingError::AuthenticationExpired("token rejected".into());
        assert!(err.requires_login());
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn wrong_role_keeps_session() {
        let detail = "User does not have the required role: wifi_provider";
        let err = BillingError::Forbidden(detail.to_string());
        assert!(!err.requires_login());
        assert!(!err.is_retryable());
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }
}
