mod common;

use alloy::primitives::{Address, U256};
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use common::*;
use wifi_billing::auth::{AuthClient, TokenStore};
use wifi_billing::config::{Config, ReportConfig, DEFAULT_FALLBACK_RATE};
use wifi_billing::handlers::{router, AppState};
use wifi_billing::models::{BackendRole, BackendUser, RateSource, UsageEntry};
use wifi_billing::refresh::load_all;
use wifi_billing::services::contract::{OnChainTransaction, OnChainUsage};
use wifi_billing::services::backend::{Backend, HttpBackend};
use wifi_billing::services::exchange_rate::ExchangeRateProvider;
use wifi_billing::window::UnparsablePolicy;
use wifi_billing::{BillingError, Services};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn verify_otp(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let bearer = headers.get("authorization").and_then(|v| v.to_str().ok());
    if bearer != Some("Bearer temp-1") || body["otp"] != "123456" {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "Invalid OTP" })));
    }
    (StatusCode::OK, Json(json!({ "access_token": "access-1", "role": "wifi_provider" })))
}

fn fake_backend_server() -> Router {
    Router::new()
        .route(
            "/login",
            post(|| async { Json(json!({ "temp_token": "temp-1", "role": "wifi_provider" })) }),
        )
        .route("/verify-otp", post(verify_otp))
        .route(
            "/data-usage",
            get(|| async {
                (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "Token expired" })))
            }),
        )
        .route(
            "/wifi-plans",
            get(|| async {
                Json(json!([{
                    "id": 1,
                    "name": "Day pass",
                    "duration": "daily",
                    "price_kes": 50.0,
                    "data_mb": 1024
                }]))
            }),
        )
        .route(
            "/isp/wifi-plans",
            get(|| async {
                let detail = "User does not have the required role: wifi_provider";
                (StatusCode::FORBIDDEN, Json(json!({ "detail": detail })))
            }),
        )
        .route(
            "/isp/users",
            get(|| async {
                let detail = "User does not have the required role: wifi_provider";
                (StatusCode::FORBIDDEN, Json(json!({ "detail": detail })))
            }),
        )
        .route(
            "/slow/login",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "temp_token": "late", "role": "user" }))
            }),
        )
}

#[tokio::test]
async fn price_feed_outage_uses_fallback() {
    let feed = Router::new().route("/spot", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    let base = serve(feed).await;

    let rate = ExchangeRateProvider::new(&format!("{}/spot", base), DEFAULT_FALLBACK_RATE)
        .get_rate()
        .await;

    assert_eq!(rate.fiat_per_native, 247_789.20);
    assert_eq!(rate.source, RateSource::Fallback);
}

#[tokio::test]
async fn price_feed_is_parsed() {
    let base = serve(Router::new().route(
        "/spot",
        get(|| async {
            Json(json!({ "data": { "base": "ETH", "currency": "KES", "amount": "412345.67" } }))
        }),
    ))
    .await;

    let rate = ExchangeRateProvider::new(&format!("{}/spot", base), DEFAULT_FALLBACK_RATE)
        .get_rate()
        .await;

    assert_eq!(rate.fiat_per_native, 412_345.67);
    assert_eq!(rate.source, RateSource::Live);
}

#[tokio::test]
async fn password_then_otp_stores_credentials() {
    let base = serve(fake_backend_server()).await;
    let tokens = TokenStore::new();
    let backend = HttpBackend::new(&base, tokens.clone(), Duration::from_secs(5)).unwrap();
    let auth = AuthClient::new(backend);

    let role = auth.login("isp", "Sup3r!Secret", "isp@example.com").await.unwrap();
    assert_eq!(role, BackendRole::WifiProvider);
    assert!(!tokens.is_authenticated());

    let credentials = auth.verify_otp(" 123456 ").await.unwrap();
    assert_eq!(credentials.token, "access-1");
    assert_eq!(tokens.bearer().as_deref(), Some("access-1"));
    assert_eq!(tokens.role(), Some(BackendRole::WifiProvider));
}

#[tokio::test]
async fn weak_password_is_refused_locally() {
    let tokens = TokenStore::new();
    // Nothing listens here; validation must fail first.
    let backend = HttpBackend::new("http://127.0.0.1:9", tokens, Duration::from_secs(1)).unwrap();
    let auth = AuthClient::new(backend);

    let err = auth.login("alice", "password", "").await.unwrap_err();
    assert!(matches!(err, BillingError::ValidationError(_)));
}

#[tokio::test]
async fn rejected_session_clears_token() {
    let base = serve(fake_backend_server()).await;
    let tokens = TokenStore::with_credentials("access-1", BackendRole::User);
    let backend = HttpBackend::new(&base, tokens.clone(), Duration::from_secs(5)).unwrap();

    let err = backend.usage_entries().await.unwrap_err();

    assert!(matches!(
        err,
        BillingError::AuthenticationExpired(ref detail) if detail == "Token expired"
    ));
    assert!(!tokens.is_authenticated());
}

#[tokio::test]
async fn wrong_role_keeps_token() {
    let base = serve(fake_backend_server()).await;
    let tokens = TokenStore::with_credentials("access-1", BackendRole::User);
    let backend = HttpBackend::new(&base, tokens.clone(), Duration::from_secs(5)).unwrap();

    let err = backend.users().await.unwrap_err();

    assert!(matches!(err, BillingError::Forbidden(ref detail) if detail.contains("wifi_provider")));
    assert!(!err.requires_login());
    assert!(tokens.is_authenticated());
    assert_eq!(tokens.bearer().as_deref(), Some("access-1"));
}

#[tokio::test]
async fn user_lists_public_plans() {
    let base = serve(fake_backend_server()).await;
    let tokens = TokenStore::with_credentials("access-1", BackendRole::User);
    let backend = HttpBackend::new(&base, tokens.clone(), Duration::from_secs(5)).unwrap();

    let plans = backend.plans().await.unwrap();

    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].name, "Day pass");
    assert!(tokens.is_authenticated());
}

#[tokio::test]
async fn provider_plan_listing_refused_as_forbidden() {
    let base = serve(fake_backend_server()).await;
    let tokens = TokenStore::with_credentials("access-1", BackendRole::WifiProvider);
    let backend = HttpBackend::new(&base, tokens.clone(), Duration::from_secs(5)).unwrap();

    let err = backend.plans().await.unwrap_err();

    assert!(matches!(err, BillingError::Forbidden(_)));
    assert!(tokens.is_authenticated());
}

#[tokio::test]
async fn slow_login_times_out() {
    let base = serve(fake_backend_server()).await;
    let slow = format!("{}/slow", base);
    let backend = HttpBackend::new(&slow, TokenStore::new(), Duration::from_millis(200)).unwrap();
    let auth = AuthClient::new(backend);

    let err = auth.login("alice", "Sup3r!Secret", "").await.unwrap_err();
    assert!(matches!(err, BillingError::RequestTimeout(_)));
}

// -- dashboard service ----------------------------------------------------

fn config() -> Config {
    Config {
        port: 0,
        chain_id: CHAIN_ID,
        network_name: "Sepolia".to_string(),
        rpc_url: "http://127.0.0.1:8545".to_string(),
        contract_address: format!("{:?}", provider()),
        backend_url: "http://127.0.0.1:9".to_string(),
        exchange_rate_url: "http://127.0.0.1:9/spot".to_string(),
        fallback_rate: DEFAULT_FALLBACK_RATE,
        login_timeout_secs: 1,
        poll_interval_secs: 30,
        wallet_keys: Vec::new(),
        report: ReportConfig {
            rows_per_page: 20,
            unparsable_timestamps: UnparsablePolicy::TreatAsNow,
        },
    }
}

fn services(role: BackendRole, backend: Arc<FakeBackend>, wallet: FakeWallet) -> Services {
    let config = config();
    let tokens = TokenStore::with_credentials("access-1", role);
    let http = HttpBackend::new(&config.backend_url, tokens, Duration::from_secs(1)).unwrap();
    let backend: Arc<dyn Backend> = backend;
    Services::assemble(config, http, backend, Arc::new(wallet)).unwrap()
}

fn app_with(backend: Arc<FakeBackend>, contract: FakeContract, accounts: Vec<Address>) -> Router {
    let wallet = FakeWallet::new(accounts, Arc::new(contract));
    router(AppState::new(services(BackendRole::User, backend, wallet)))
}

fn app(accounts: Vec<Address>) -> Router {
    let contract = FakeContract::new(provider()).with_registered(&accounts);
    app_with(Arc::default(), contract, accounts)
}

async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn health_reports_network_and_session() {
    let (status, body) = call(app(vec![alice()]), "GET", "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["chain_id"], CHAIN_ID);
    assert_eq!(body["authenticated"], true);
}

#[tokio::test]
async fn billing_without_wallet_asks_for_account() {
    let (status, body) = call(app(vec![alice()]), "GET", "/api/v1/billing").await;

    assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);
    assert!(body.is_object());
}

#[tokio::test]
async fn connect_endpoint_returns_session() {
    let (status, body) = call(app(vec![alice()]), "POST", "/api/v1/session/connect").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "connected");
    assert_eq!(body["role"], "regular_user");
}

#[tokio::test]
async fn connect_endpoint_reports_missing_account() {
    let (status, _) = call(app(Vec::new()), "POST", "/api/v1/session/connect").await;
    assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);
}

#[tokio::test]
async fn unknown_report_window_is_bad_request() {
    let (status, _) = call(app(vec![alice()]), "GET", "/api/v1/report/fortnightly").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn report_lists_both_usage_ledgers() {
    let now = Utc::now();
    let backend = Arc::new(FakeBackend::default());
    backend.usage.lock().unwrap().push(UsageEntry {
        usage_mb: 4242.0,
        timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
    });
    let contract = FakeContract::new(provider()).with_registered(&[alice()]);
    contract.usage.lock().unwrap().push(OnChainUsage {
        usage_mb: 7,
        timestamp: now.timestamp() as u64,
    });
    let app = app_with(backend, contract, vec![alice()]);

    let (status, _) = call(app.clone(), "POST", "/api/v1/session/connect").await;
    assert_eq!(status, StatusCode::OK);

    let (status, bytes) = send(app, "GET", "/api/v1/report/yearly").await;
    let text = String::from_utf8(bytes).unwrap();

    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("Off-chain usage in window: 4242 MB"), "{}", text);
    assert!(text.contains("On-chain usage in window: 7 MB"), "{}", text);
}

#[tokio::test]
async fn report_without_wallet_has_backend_usage_only() {
    let backend = Arc::new(FakeBackend::default());
    backend.usage.lock().unwrap().push(UsageEntry {
        usage_mb: 12.0,
        timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    });
    let contract = FakeContract::new(provider()).with_registered(&[alice()]);
    let app = app_with(backend, contract, vec![alice()]);

    let (status, bytes) = send(app, "GET", "/api/v1/report/yearly").await;
    let text = String::from_utf8(bytes).unwrap();

    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("Off-chain usage in window: 12 MB"));
    assert!(!text.contains("On-chain usage"));
}

#[tokio::test]
async fn token_balance_endpoint_reads_contract() {
    let contract = FakeContract::new(provider())
        .with_registered(&[alice()])
        .with_balance(alice(), 640);
    let app = app_with(Arc::default(), contract, vec![alice()]);

    call(app.clone(), "POST", "/api/v1/session/connect").await;
    let (status, body) = call(app, "GET", "/api/v1/tokens").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], "640");
    assert_eq!(body["account"], alice().to_checksum(None));
}

#[tokio::test]
async fn pay_endpoint_reports_top_up() {
    let mut contract = FakeContract::new(provider()).with_registered(&[alice()]);
    contract.report.total_usage_mb = 50;
    let app = app_with(Arc::default(), contract, vec![alice()]);

    call(app.clone(), "POST", "/api/v1/session/connect").await;
    let (status, body) = call(app, "POST", "/api/v1/billing/pay").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paid_mb"], 50);
    assert_eq!(body["cost_tokens"], "100");
    assert_eq!(body["minted_tokens"], "200");
}

#[tokio::test]
async fn failed_backend_usage_leaves_other_fetches_intact() {
    let backend = Arc::new(FakeBackend {
        fail_usage: true,
        ..Default::default()
    });
    let contract = FakeContract::new(provider()).with_registered(&[alice()]);
    contract.usage.lock().unwrap().push(OnChainUsage {
        usage_mb: 9,
        timestamp: 1_718_409_600,
    });
    let wallet = FakeWallet::new(vec![alice()], Arc::new(contract));
    let services = services(BackendRole::User, backend, wallet);
    services.session.connect().await.unwrap();

    let data = load_all(&services, &services.rate().await).await;

    assert!(matches!(data.usage, Err(BillingError::Backend(_))));
    let on_chain = data.on_chain_usage.as_ref().unwrap().as_ref().unwrap();
    assert_eq!(on_chain.total_mb, 9);
    assert!(data.plans.is_ok());
    assert!(matches!(data.transactions, Some(Ok(_))));
    assert_eq!(data.errors().len(), 1);
    assert!(!data.requires_login());
}

#[tokio::test]
async fn failed_purchase_list_keeps_on_chain_transactions() {
    let backend = Arc::new(FakeBackend {
        fail_purchases: true,
        ..Default::default()
    });
    backend.users.lock().unwrap().push(BackendUser {
        id: 1,
        username: "alice".to_string(),
        email: None,
        wallet_address: Some(alice().to_checksum(None)),
    });
    let contract = FakeContract::new(provider()).with_registered(&[provider(), alice()]);
    contract.transactions.lock().unwrap().push(OnChainTransaction {
        id: 1,
        amount_wei: U256::from(2_000_000_000_000_000u64),
        timestamp: 1_718_409_600,
        status: "Paid".to_string(),
    });
    let wallet = FakeWallet::new(vec![provider()], Arc::new(contract));
    let services = services(BackendRole::WifiProvider, backend, wallet);
    services.session.connect().await.unwrap();

    let data = load_all(&services, &services.rate().await).await;

    let ledger = data.transactions.unwrap().unwrap();
    assert!(ledger.backend.is_empty());
    assert_eq!(ledger.on_chain.len(), 1);
    assert_eq!(ledger.on_chain[0].username.as_deref(), Some("alice"));
    assert!(matches!(data.purchases_error, Some(BillingError::Backend(_))));
    assert!(data.subscribers.unwrap().is_ok());
}
