//! HTTP client for the billing backend
//!
//! Every authenticated call reads the bearer token from the shared
//! [`TokenStore`]. A 401 clears the store and surfaces as
//! `AuthenticationExpired`; a 403 is `Forbidden` and leaves the session alone.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

use crate::auth::TokenStore;
use crate::error::BillingError;
use crate::models::*;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend calls used by the session, usage, ledger, plan and ISP views.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn update_wallet(&self, wallet_address: &str) -> Result<(), BillingError>;
    async fn usage_entries(&self) -> Result<Vec<UsageEntry>, BillingError>;
    async fn record_usage(&self, amount_mb: u64) -> Result<(), BillingError>;
    async fn isp_usage(&self) -> Result<Vec<AggregateUsageEntry>, BillingError>;
    async fn isp_record_usage(&self, username: &str, amount_mb: u64) -> Result<(), BillingError>;
    async fn users(&self) -> Result<Vec<BackendUser>, BillingError>;
    async fn plan_purchases(&self) -> Result<Vec<PlanPurchase>, BillingError>;
    async fn plans(&self) -> Result<Vec<PlanRecord>, BillingError>;
    async fn create_plan(&self, draft: &PlanDraft) -> Result<(), BillingError>;
    async fn update_plan(&self, plan_id: u64, draft: &PlanDraft) -> Result<(), BillingError>;
    async fn delete_plan(&self, plan_id: u64) -> Result<(), BillingError>;
    async fn pending_registrations(&self) -> Result<Vec<PendingRegistration>, BillingError>;
    async fn confirm_registration(&self, registration_id: u64) -> Result<(), BillingError>;
    async fn reject_registration(
        &self,
        registration_id: u64,
        reason: &str,
    ) -> Result<(), BillingError>;
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    tokens: TokenStore,
    login_timeout: Duration,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        tokens: TokenStore,
        login_timeout: Duration,
    ) -> Result<Self, BillingError> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Internal(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            login_timeout,
        })
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, BillingError> {
        let token = self.tokens.bearer().ok_or_else(|| {
            BillingError::AuthenticationExpired(
                "No authentication token found. Please log in again.".to_string(),
            )
        })?;
        Ok(request.bearer_auth(token))
    }

    fn transport_error(&self, err: reqwest::Error, timeout: Duration) -> BillingError {
        if err.is_timeout() {
            BillingError::RequestTimeout(timeout.as_secs())
        } else if err.is_connect() {
            BillingError::Backend("Cannot connect to the server.".to_string())
        } else {
            BillingError::Backend(err.to_string())
        }
    }

    /// Sends the request and maps non-2xx statuses. `session` marks calls made
    /// with the access token, where 401 means the session is gone.
    async fn dispatch(
        &self,
        request: RequestBuilder,
        session: bool,
        timeout: Duration,
    ) -> Result<Response, BillingError> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e, timeout))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = error_detail(response).await;
        if session && status == StatusCode::UNAUTHORIZED {
            tracing::warn!("Backend rejected session: {}", detail);
            self.tokens.clear();
            return Err(BillingError::AuthenticationExpired(detail));
        }
        if status == StatusCode::FORBIDDEN {
            tracing::warn!("Backend refused access: {}", detail);
            return Err(BillingError::Forbidden(detail));
        }

        tracing::debug!("Backend returned {}: {}", status, detail);
        Err(BillingError::Backend(detail))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BillingError> {
        let request = self.authorized(self.client.get(self.url(path)))?;
        let response = self.dispatch(request, true, DEFAULT_REQUEST_TIMEOUT).await?;
        decode(response).await
    }

    async fn send_json(&self, request: RequestBuilder, body: Value) -> Result<Value, BillingError> {
        let request = self.authorized(request.json(&body))?;
        let response = self.dispatch(request, true, DEFAULT_REQUEST_TIMEOUT).await?;
        Ok(response.json::<Value>().await.unwrap_or(Value::Null))
    }

    // -- authentication ---------------------------------------------------

    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, BillingError> {
        let builder = self.client.post(self.url("/login")).json(request);
        let response = self.dispatch(builder, false, self.login_timeout).await?;
        decode(response).await
    }

    pub async fn verify_otp(
        &self,
        temp_token: &str,
        otp: &str,
    ) -> Result<TokenResponse, BillingError> {
        let builder = self
            .client
            .post(self.url("/verify-otp"))
            .bearer_auth(temp_token)
            .json(&json!({ "otp": otp.trim() }));
        let response = self.dispatch(builder, false, self.login_timeout).await?;
        decode(response).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<Value, BillingError> {
        let builder = self.client.post(self.url("/register")).json(request);
        let response = self.dispatch(builder, false, self.login_timeout).await?;
        decode(response).await
    }

    pub async fn verify_token(&self) -> Result<VerifiedToken, BillingError> {
        let request = self.authorized(self.client.post(self.url("/verify-token")))?;
        let response = self.dispatch(request, true, DEFAULT_REQUEST_TIMEOUT).await?;
        decode(response).await
    }

    pub async fn request_registration(&self, wallet_address: &str) -> Result<(), BillingError> {
        self.send_json(
            self.client.post(self.url("/request-registration")),
            json!({ "wallet_address": wallet_address }),
        )
        .await
        .map(|_| ())
    }

    // -- support ----------------------------------------------------------

    pub async fn submit_help(&self, subject: &str, message: &str) -> Result<(), BillingError> {
        self.send_json(
            self.client.post(self.url("/help")),
            json!({ "subject": subject, "message": message }),
        )
        .await
        .map(|_| ())
    }

    pub async fn my_help_requests(&self) -> Result<Vec<HelpTicket>, BillingError> {
        self.get_json("/help").await
    }

    pub async fn help_requests(&self) -> Result<Vec<HelpTicket>, BillingError> {
        self.get_json("/isp/help-requests").await
    }

    /// Feedback may be left without logging in.
    pub async fn submit_feedback(&self, feedback: &str) -> Result<(), BillingError> {
        let builder = self
            .client
            .post(self.url("/feedback"))
            .json(&json!({ "feedback": feedback }));
        self.dispatch(builder, false, DEFAULT_REQUEST_TIMEOUT).await.map(|_| ())
    }

    pub async fn feedback(&self) -> Result<Vec<FeedbackTicket>, BillingError> {
        self.get_json("/feedback").await
    }

    pub async fn feedback_requests(&self) -> Result<Vec<FeedbackTicket>, BillingError> {
        self.get_json("/isp/feedback-requests").await
    }

    pub async fn reply_feedback(&self, request_id: u64, reply: &str) -> Result<(), BillingError> {
        self.send_json(
            self.client
                .post(self.url(&format!("/isp/feedback-requests/{}/reply", request_id))),
            json!({ "reply": reply }),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn update_wallet(&self, wallet_address: &str) -> Result<(), BillingError> {
        self.send_json(
            self.client.post(self.url("/update-wallet")),
            json!({ "wallet_address": wallet_address }),
        )
        .await?;
        tracing::info!("Wallet address updated in backend: {}", wallet_address);
        Ok(())
    }

    async fn usage_entries(&self) -> Result<Vec<UsageEntry>, BillingError> {
        self.get_json("/data-usage").await
    }

    async fn record_usage(&self, amount_mb: u64) -> Result<(), BillingError> {
        self.send_json(
            self.client.post(self.url("/data-usage")),
            json!({ "usage_mb": amount_mb }),
        )
        .await
        .map(|_| ())
    }

    async fn isp_usage(&self) -> Result<Vec<AggregateUsageEntry>, BillingError> {
        self.get_json("/isp/data-usage").await
    }

    async fn isp_record_usage(&self, username: &str, amount_mb: u64) -> Result<(), BillingError> {
        self.send_json(
            self.client.post(self.url("/isp/log-data-usage")),
            json!({ "username": username, "usage_mb": amount_mb }),
        )
        .await
        .map(|_| ())
    }

    async fn users(&self) -> Result<Vec<BackendUser>, BillingError> {
        self.get_json("/isp/users").await
    }

    async fn plan_purchases(&self) -> Result<Vec<PlanPurchase>, BillingError> {
        self.get_json("/isp/plan-purchases").await
    }

    /// Providers read the managed catalog, everyone else the public one.
    async fn plans(&self) -> Result<Vec<PlanRecord>, BillingError> {
        match self.tokens.role() {
            Some(BackendRole::WifiProvider) => self.get_json("/isp/wifi-plans").await,
            _ => self.get_json("/wifi-plans").await,
        }
    }

    async fn create_plan(&self, draft: &PlanDraft) -> Result<(), BillingError> {
        let body = serde_json::to_value(draft).map_err(|e| BillingError::Internal(e.to_string()))?;
        self.send_json(self.client.post(self.url("/isp/wifi-plans")), body)
            .await
            .map(|_| ())
    }

    async fn update_plan(&self, plan_id: u64, draft: &PlanDraft) -> Result<(), BillingError> {
        let body = serde_json::to_value(draft).map_err(|e| BillingError::Internal(e.to_string()))?;
        self.send_json(
            self.client.put(self.url(&format!("/isp/wifi-plans/{}", plan_id))),
            body,
        )
        .await
        .map(|_| ())
    }

    async fn delete_plan(&self, plan_id: u64) -> Result<(), BillingError> {
        let request = self.authorized(
            self.client
                .delete(self.url(&format!("/isp/wifi-plans/{}", plan_id))),
        )?;
        self.dispatch(request, true, DEFAULT_REQUEST_TIMEOUT).await.map(|_| ())
    }

    async fn pending_registrations(&self) -> Result<Vec<PendingRegistration>, BillingError> {
        self.get_json("/isp/pending-registrations").await
    }

    async fn confirm_registration(&self, registration_id: u64) -> Result<(), BillingError> {
        self.send_json(
            self.client.post(self.url("/isp/confirm-registration")),
            json!({ "registration_id": registration_id }),
        )
        .await
        .map(|_| ())
    }

    async fn reject_registration(
        &self,
        registration_id: u64,
        reason: &str,
    ) -> Result<(), BillingError> {
        self.send_json(
            self.client.post(self.url("/isp/reject-registration")),
            json!({ "registration_id": registration_id, "reason": reason }),
        )
        .await
        .map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BillingError> {
    response
        .json::<T>()
        .await
        .map_err(|e| BillingError::Backend(format!("Malformed backend response: {}", e)))
}

/// Extracts FastAPI-style `detail`, which is either a string or a list of
/// validation errors.
async fn error_detail(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    parse_detail(&text).unwrap_or_else(|| {
        if text.is_empty() {
            format!("Request failed with status {}", status)
        } else {
            text
        }
    })
}

fn parse_detail(text: &str) -> Option<String> {
    let body: Value = serde_json::from_str(text).ok()?;
    match body.get("detail")? {
        Value::String(detail) => Some(detail.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| item.get("msg").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; "),
        ),
        other => Some(other.to_string()),
    }
}
