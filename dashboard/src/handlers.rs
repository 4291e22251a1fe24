//! HTTP handlers for the dashboard service

use alloy::primitives::Address;
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::Services;
use crate::auth::{parse_address, Credentials, PasswordStrength};
use crate::error::BillingError;
use crate::isp::Subscriber;
use crate::ledger::LedgerReport;
use crate::models::*;
use crate::plans::{quote, PlanListing, PlanPurchaseReceipt};
use crate::refresh::{load_all, DashboardData, Fetched, Poller};
use crate::report::UsageSources;
use crate::session::{ConnectOutcome, Freshness, SessionSummary};
use crate::usage::{PaymentReceipt, RecordedUsage};
use crate::window::WindowKind;

type Refresh = (Poller, watch::Receiver<Option<Arc<DashboardData>>>);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    refresh: Arc<Mutex<Option<Refresh>>>,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            services: Arc::new(services),
            refresh: Arc::new(Mutex::new(None)),
        }
    }

    fn start_refresh(&self) {
        let period = Duration::from_secs(self.services.config.poll_interval_secs);
        let refresh = Poller::dashboard(self.services.clone(), period);
        *self.refresh.lock().unwrap_or_else(|e| e.into_inner()) = Some(refresh);
    }

    fn stop_refresh(&self) {
        self.refresh.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn latest(&self) -> Option<Arc<DashboardData>> {
        let guard = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(|(_, rx)| rx.borrow().clone())
    }
}

fn parse_window(raw: &str) -> Result<WindowKind, BillingError> {
    WindowKind::from_str(raw).map_err(BillingError::ValidationError)
}

fn fetched_json<T: Serialize>(fetched: &Fetched<T>) -> Value {
    match fetched {
        Ok(value) => json!({ "ok": value }),
        Err(err) => json!({
            "error": err.user_message(),
            "kind": err.kind(),
            "retryable": err.is_retryable(),
        }),
    }
}

fn optional_json<T: Serialize>(fetched: &Option<Fetched<T>>) -> Value {
    fetched.as_ref().map(fetched_json).unwrap_or(Value::Null)
}

// -- health and session -------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub chain_id: u64,
    pub network: String,
    pub contract: String,
    pub authenticated: bool,
    pub session: SessionSummary,
    pub version: String,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let config = &state.services.config;
    Json(HealthResponse {
        status: "healthy".to_string(),
        chain_id: config.chain_id,
        network: config.network_name.clone(),
        contract: config.contract_address.clone(),
        authenticated: state.services.tokens.is_authenticated(),
        session: state.services.session.state().summary(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn session(State(state): State<AppState>) -> Json<SessionSummary> {
    Json(state.services.session.state().summary())
}

pub async fn connect(State(state): State<AppState>) -> Result<Json<ConnectOutcome>, BillingError> {
    Ok(Json(state.services.session.connect().await?))
}

pub async fn disconnect(State(state): State<AppState>) -> Json<SessionSummary> {
    state.services.session.disconnect();
    Json(state.services.session.state().summary())
}

#[derive(Debug, Deserialize)]
pub struct SelectAccount {
    pub account: String,
}

/// Switches the built-in wallet's account. The session follows through
/// the wallet's account-change notification.
pub async fn select_account(
    State(state): State<AppState>,
    Json(request): Json<SelectAccount>,
) -> Result<Json<Value>, BillingError> {
    let wallet = state
        .services
        .local_wallet
        .as_ref()
        .ok_or_else(|| {
            BillingError::validation("Account selection is not available for this wallet")
        })?;
    let account = parse_address(&request.account)?;
    wallet.select(account)?;
    Ok(Json(json!({ "selected": account.to_checksum(None) })))
}

// -- authentication -----------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Json<Value>, BillingError> {
    let role = state
        .services
        .auth
        .login(&body.username, &body.password, &body.email)
        .await?;
    Ok(Json(json!({ "otp_required": true, "role": role.as_str() })))
}

#[derive(Debug, Deserialize)]
pub struct OtpBody {
    pub otp: String,
}

pub async fn verify_otp(
    State(state): State<AppState>,
    Json(body): Json<OtpBody>,
) -> Result<Json<Value>, BillingError> {
    let Credentials { role, .. } = state.services.auth.verify_otp(&body.otp).await?;
    state.start_refresh();
    Ok(Json(json!({ "role": role.as_str() })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub username: String,
    pub password: String,
    pub email: String,
    pub wallet_address: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<Value>, BillingError> {
    state
        .services
        .auth
        .register(&body.username, &body.password, &body.email, &body.wallet_address)
        .await?;
    Ok(Json(json!({ "registered": true })))
}

#[derive(Debug, Deserialize)]
pub struct PasswordBody {
    pub password: String,
}

pub async fn password_strength(Json(body): Json<PasswordBody>) -> Json<PasswordStrength> {
    Json(crate::auth::password_strength(&body.password))
}

#[derive(Debug, Deserialize)]
pub struct WalletBody {
    pub wallet_address: String,
}

pub async fn request_registration(
    State(state): State<AppState>,
    Json(body): Json<WalletBody>,
) -> Result<Json<Value>, BillingError> {
    state.services.auth.request_registration(&body.wallet_address).await?;
    Ok(Json(json!({ "requested": true })))
}

pub async fn logout(State(state): State<AppState>) -> Json<Value> {
    state.stop_refresh();
    state.services.auth.logout(&state.services.session);
    Json(json!({ "logged_out": true }))
}

// -- usage and billing --------------------------------------------------

pub async fn rate(State(state): State<AppState>) -> Json<ExchangeRate> {
    Json(state.services.rate().await)
}

pub async fn usage(State(state): State<AppState>) -> Result<Json<Value>, BillingError> {
    let services = &state.services;
    let off_chain = services.usage.load_from_backend().await?;

    let on_chain = match services.session.signer() {
        Ok(signer) => match services.usage.load_from_contract(signer.account).await? {
            Freshness::Current(history) => Some(history),
            Freshness::Stale => None,
        },
        Err(_) => None,
    };

    Ok(Json(json!({ "off_chain": off_chain, "on_chain": on_chain })))
}

#[derive(Debug, Deserialize)]
pub struct UsageBody {
    pub amount_mb: i64,
}

pub async fn record_usage(
    State(state): State<AppState>,
    Json(body): Json<UsageBody>,
) -> Result<Json<Value>, BillingError> {
    let RecordedUsage {
        amount_mb,
        on_chain_tx,
    } = state.services.usage.record_usage(body.amount_mb).await?;
    Ok(Json(json!({ "amount_mb": amount_mb, "on_chain_tx": on_chain_tx })))
}

pub async fn billing(State(state): State<AppState>) -> Result<Json<BillingSnapshot>, BillingError> {
    let signer = state.services.session.signer()?;
    let rate = state.services.rate().await;
    Ok(Json(state.services.usage.billing_snapshot(signer.account, &rate).await?))
}

pub async fn pay(State(state): State<AppState>) -> Result<Json<PaymentReceipt>, BillingError> {
    let signer = state.services.session.signer()?;
    let rate = state.services.rate().await;
    let snapshot = state.services.usage.billing_snapshot(signer.account, &rate).await?;
    Ok(Json(state.services.usage.make_payment(&snapshot).await?))
}

pub async fn token_balance(State(state): State<AppState>) -> Result<Json<Value>, BillingError> {
    let signer = state.services.session.signer()?;
    let balance = state.services.usage.token_balance(signer.account).await?;
    Ok(Json(json!({ "account": signer.account.to_checksum(None), "balance": balance.to_string() })))
}

#[derive(Debug, Deserialize)]
pub struct MintBody {
    pub amount: i64,
}

pub async fn mint_tokens(
    State(state): State<AppState>,
    Json(body): Json<MintBody>,
) -> Result<Json<Value>, BillingError> {
    let tx_hash = state.services.usage.mint_tokens(body.amount).await?;
    Ok(Json(json!({ "tx_hash": tx_hash, "amount": body.amount })))
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub window: Option<String>,
}

pub async fn transactions(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<LedgerReport>, BillingError> {
    let services = &state.services;
    let rate = services.rate().await;

    let report = match services.ledger.load(&rate).await? {
        Freshness::Current(report) => report,
        Freshness::Stale => return Err(BillingError::NoAccountSelected),
    };

    let report = match query.window.as_deref() {
        Some(window) => report.filtered(
            parse_window(window)?,
            Utc::now(),
            services.config.report.unparsable_timestamps,
        ),
        None => report,
    };
    Ok(Json(report))
}

// -- plans --------------------------------------------------------------

pub async fn plans(State(state): State<AppState>) -> Result<Json<PlanListing>, BillingError> {
    Ok(Json(state.services.plans.list().await?))
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(draft): Json<PlanDraft>,
) -> Result<Json<Value>, BillingError> {
    state.services.plans.create(&draft).await?;
    Ok(Json(json!({ "created": draft.name })))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<u64>,
    Json(draft): Json<PlanDraft>,
) -> Result<Json<Value>, BillingError> {
    state.services.plans.update(plan_id, &draft).await?;
    Ok(Json(json!({ "updated": plan_id })))
}

pub async fn delete_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<u64>,
) -> Result<Json<Value>, BillingError> {
    state.services.plans.delete(plan_id).await?;
    Ok(Json(json!({ "deleted": plan_id })))
}

pub async fn quote_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<u64>,
) -> Result<Json<PlanQuote>, BillingError> {
    let listing = state.services.plans.list().await?;
    let plan = listing
        .plans
        .into_iter()
        .find(|listed| listed.plan.id == plan_id)
        .ok_or_else(|| BillingError::validation(format!("Plan {} not found", plan_id)))?;
    let rate = state.services.rate().await;
    Ok(Json(quote(&plan.plan, &rate)?))
}

pub async fn purchase_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<i64>,
) -> Result<Json<PlanPurchaseReceipt>, BillingError> {
    let rate = state.services.rate().await;
    Ok(Json(state.services.plans.purchase(plan_id, &rate).await?))
}

pub async fn purchased_plans(
    State(state): State<AppState>,
) -> Result<Json<Vec<PurchasedPlan>>, BillingError> {
    Ok(Json(state.services.plans.purchased_plans().await?))
}

// -- provider console ---------------------------------------------------

pub async fn subscribers(
    State(state): State<AppState>,
) -> Result<Json<Vec<Subscriber>>, BillingError> {
    let rate = state.services.rate().await;
    Ok(Json(state.services.isp.subscribers(&rate).await?))
}

pub async fn pending_registrations(
    State(state): State<AppState>,
) -> Result<Json<Vec<PendingRegistration>>, BillingError> {
    Ok(Json(state.services.isp.pending_registrations().await?))
}

pub async fn confirm_registration(
    State(state): State<AppState>,
    Path(registration_id): Path<u64>,
) -> Result<Json<Value>, BillingError> {
    let pending = state.services.isp.pending_registrations().await?;
    let request = pending
        .into_iter()
        .find(|r| r.id == registration_id)
        .ok_or_else(|| {
            BillingError::validation(format!("No pending registration {}", registration_id))
        })?;
    let tx_hash = state.services.isp.confirm_registration(&request).await?;
    Ok(Json(json!({ "confirmed": registration_id, "tx_hash": tx_hash })))
}

#[derive(Debug, Deserialize)]
pub struct RejectBody {
    pub reason: String,
}

pub async fn reject_registration(
    State(state): State<AppState>,
    Path(registration_id): Path<u64>,
    Json(body): Json<RejectBody>,
) -> Result<Json<Value>, BillingError> {
    state
        .services
        .isp
        .reject_registration(registration_id, &body.reason)
        .await?;
    Ok(Json(json!({ "rejected": registration_id })))
}

#[derive(Debug, Deserialize)]
pub struct IspUsageBody {
    pub username: String,
    pub wallet_address: String,
    pub amount_mb: i64,
}

pub async fn log_usage_for(
    State(state): State<AppState>,
    Json(body): Json<IspUsageBody>,
) -> Result<Json<Value>, BillingError> {
    let recorded = state
        .services
        .isp
        .log_usage_for(&body.username, &body.wallet_address, body.amount_mb)
        .await?;
    Ok(Json(json!({
        "username": body.username,
        "amount_mb": recorded.amount_mb,
        "on_chain_tx": recorded.on_chain_tx,
    })))
}

#[derive(Debug, Deserialize)]
pub struct IspMintBody {
    pub wallet_address: String,
    pub amount: i64,
}

pub async fn mint_for(
    State(state): State<AppState>,
    Json(body): Json<IspMintBody>,
) -> Result<Json<Value>, BillingError> {
    let tx_hash = state.services.isp.mint_for(&body.wallet_address, body.amount).await?;
    Ok(Json(json!({
        "wallet_address": body.wallet_address,
        "amount": body.amount,
        "tx_hash": tx_hash,
    })))
}

pub async fn aggregate_usage(
    State(state): State<AppState>,
) -> Result<Json<UsageHistory>, BillingError> {
    Ok(Json(state.services.isp.aggregate_usage().await?))
}

// -- support ------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HelpBody {
    pub subject: String,
    pub message: String,
}

pub async fn submit_help(
    State(state): State<AppState>,
    Json(body): Json<HelpBody>,
) -> Result<Json<Value>, BillingError> {
    state.services.support.submit_help(&body.subject, &body.message).await?;
    Ok(Json(json!({ "submitted": true })))
}

pub async fn my_help_requests(
    State(state): State<AppState>,
) -> Result<Json<Vec<HelpTicket>>, BillingError> {
    Ok(Json(state.services.support.my_help_requests().await?))
}

pub async fn help_requests(
    State(state): State<AppState>,
) -> Result<Json<Vec<HelpTicket>>, BillingError> {
    Ok(Json(state.services.support.help_requests().await?))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub feedback: String,
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    Json(body): Json<FeedbackBody>,
) -> Result<Json<Value>, BillingError> {
    state.services.support.submit_feedback(&body.feedback).await?;
    Ok(Json(json!({ "submitted": true })))
}

pub async fn my_feedback(
    State(state): State<AppState>,
) -> Result<Json<Vec<FeedbackTicket>>, BillingError> {
    Ok(Json(state.services.support.my_feedback().await?))
}

pub async fn feedback_requests(
    State(state): State<AppState>,
) -> Result<Json<Vec<FeedbackTicket>>, BillingError> {
    Ok(Json(state.services.support.feedback_requests().await?))
}

#[derive(Debug, Deserialize)]
pub struct ReplyBody {
    pub reply: String,
}

pub async fn reply_feedback(
    State(state): State<AppState>,
    Path(request_id): Path<u64>,
    Json(body): Json<ReplyBody>,
) -> Result<Json<Value>, BillingError> {
    state.services.support.reply_feedback(request_id, &body.reply).await?;
    Ok(Json(json!({ "replied": request_id })))
}

// -- dashboard and report -----------------------------------------------

fn dashboard_json(data: &DashboardData) -> Value {
    json!({
        "role": data.role.map(|r| r.as_str()),
        "rate": data.rate,
        "loaded_at": data.loaded_at,
        "subscribers": optional_json(&data.subscribers),
        "transactions": optional_json(&data.transactions),
        "usage": fetched_json(&data.usage),
        "on_chain_usage": optional_json(&data.on_chain_usage),
        "plans": fetched_json(&data.plans),
        "pending_registrations": optional_json(&data.pending_registrations),
        "purchases_error": data
            .purchases_error
            .as_ref()
            .map(|err| fetched_json::<()>(&Err(err.clone()))),
        "requires_login": data.requires_login(),
    })
}

/// Latest polled snapshot, or a fresh load when polling has not produced one.
pub async fn dashboard(State(state): State<AppState>) -> Result<Json<Value>, BillingError> {
    if let Some(data) = state.latest() {
        return Ok(Json(dashboard_json(&data)));
    }
    if !state.services.tokens.is_authenticated() {
        return Err(BillingError::AuthenticationExpired(
            "No authentication token found. Please log in again.".to_string(),
        ));
    }
    let rate = state.services.rate().await;
    let data = load_all(&state.services, &rate).await;
    Ok(Json(dashboard_json(&data)))
}

/// Downloadable report of the current views for one window.
pub async fn report(
    State(state): State<AppState>,
    Path(window): Path<String>,
) -> Result<impl IntoResponse, BillingError> {
    let window = parse_window(&window)?;
    let services = &state.services;
    let rate = services.rate().await;
    let data = load_all(services, &rate).await;

    let off_chain = match &data.usage {
        Ok(history) => history.entries.as_slice(),
        Err(err) => return Err(err.clone()),
    };
    let on_chain = match &data.on_chain_usage {
        Some(Ok(history)) => Some(history.entries.as_slice()),
        Some(Err(err)) => {
            tracing::warn!("Report without on-chain usage: {}", err);
            None
        }
        None => None,
    };
    let transactions = match &data.transactions {
        Some(Ok(ledger)) => ledger.all(),
        Some(Err(err)) => {
            tracing::warn!("Report without transactions: {}", err);
            Vec::new()
        }
        None => Vec::new(),
    };

    let usage = UsageSources { off_chain, on_chain };
    let document = services.reports.export(usage, &transactions, window, Utc::now());

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", document.filename),
            ),
            (header::ETAG, format!("\"{}\"", document.fingerprint)),
        ],
        document.to_bytes(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct AccountQuery {
    pub account: String,
}

/// On-chain transactions of any account, for the provider's drill-down.
pub async fn account_transactions(
    State(state): State<AppState>,
    Query(query): Query<AccountQuery>,
) -> Result<Json<Vec<TransactionRecord>>, BillingError> {
    let account: Address = parse_address(&query.account)?;
    let rate = state.services.rate().await;
    match state.services.ledger.load_contract_transactions(account, &rate).await? {
        Freshness::Current(records) => Ok(Json(records)),
        Freshness::Stale => Err(BillingError::NoAccountSelected),
    }
}

/// Routes of the dashboard service.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health))

        // Authentication
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/verify-otp", post(verify_otp))
        .route("/api/v1/auth/register", post(register))
        .route("/api/v1/auth/password-strength", post(password_strength))
        .route("/api/v1/auth/request-registration", post(request_registration))
        .route("/api/v1/auth/logout", post(logout))

        // Wallet session
        .route("/api/v1/session", get(session))
        .route("/api/v1/session/connect", post(connect))
        .route("/api/v1/session/disconnect", post(disconnect))
        .route("/api/v1/session/account", post(select_account))

        // Usage, billing and transactions
        .route("/api/v1/rate", get(rate))
        .route("/api/v1/usage", get(usage).post(record_usage))
        .route("/api/v1/billing", get(billing))
        .route("/api/v1/billing/pay", post(pay))
        .route("/api/v1/tokens", get(token_balance))
        .route("/api/v1/tokens/mint", post(mint_tokens))
        .route("/api/v1/transactions", get(transactions))
        .route("/api/v1/transactions/account", get(account_transactions))

        // Plans
        .route("/api/v1/plans", get(plans).post(create_plan))
        .route("/api/v1/plans/purchased", get(purchased_plans))
        .route("/api/v1/plans/:id", put(update_plan).delete(delete_plan))
        .route("/api/v1/plans/:id/quote", get(quote_plan))
        .route("/api/v1/plans/:id/purchase", post(purchase_plan))

        // Provider console
        .route("/api/v1/isp/subscribers", get(subscribers))
        .route("/api/v1/isp/registrations", get(pending_registrations))
        .route("/api/v1/isp/registrations/:id/confirm", post(confirm_registration))
        .route("/api/v1/isp/registrations/:id/reject", post(reject_registration))
        .route("/api/v1/isp/usage", get(aggregate_usage).post(log_usage_for))
        .route("/api/v1/isp/tokens/mint", post(mint_for))
        .route("/api/v1/isp/help-requests", get(help_requests))
        .route("/api/v1/isp/feedback-requests", get(feedback_requests))
        .route("/api/v1/isp/feedback-requests/:id/reply", post(reply_feedback))

        // Support
        .route("/api/v1/help", get(my_help_requests).post(submit_help))
        .route("/api/v1/feedback", get(my_feedback).post(submit_feedback))

        // Dashboard and reports
        .route("/api/v1/dashboard", get(dashboard))
        .route("/api/v1/report/:window", get(report))

        // State
        .with_state(state)

        // Middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}
