//! Data models for the dashboard views and the backend's request/response contract

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    RegularUser,
    ServiceProvider,
}

/// Role string issued by the backend alongside the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendRole {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "wifi_provider", alias = "isp")]
    WifiProvider,
}

impl BackendRole {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "user" => Some(BackendRole::User),
            "wifi_provider" | "isp" => Some(BackendRole::WifiProvider),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendRole::User => "user",
            BackendRole::WifiProvider => "wifi_provider",
        }
    }
}

// ---------------------------------------------------------------------------
// Usage and billing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    OffChain,
    OnChain,
}

/// One usage entry with its running total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsagePoint {
    pub amount_mb: u64,
    pub cumulative_mb: u64,
    /// Timestamp as reported by the source.
    pub timestamp: String,
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Usage log of a single source, in source order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageHistory {
    pub source: RecordSource,
    pub entries: Vec<UsagePoint>,
    pub total_mb: u64,
}

/// Authoritative amount owed, straight from the contract's billing report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingSnapshot {
    pub account: String,
    pub total_usage_mb: u64,
    pub total_cost_wei: String,
    pub total_cost_native: f64,
    pub total_cost_fiat: f64,
    pub rate: ExchangeRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    Live,
    Fallback,
}

/// Fiat (KES) per one unit of the native currency (ETH).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExchangeRate {
    pub fiat_per_native: f64,
    pub source: RateSource,
}

impl ExchangeRate {
    pub fn live(fiat_per_native: f64) -> Self {
        Self { fiat_per_native, source: RateSource::Live }
    }

    pub fn fallback(fiat_per_native: f64) -> Self {
        Self { fiat_per_native, source: RateSource::Fallback }
    }

    pub fn to_fiat(&self, native: f64) -> f64 {
        native * self.fiat_per_native
    }

    pub fn to_native(&self, fiat: f64) -> f64 {
        fiat / self.fiat_per_native
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationClass {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl std::str::FromStr for DurationClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(DurationClass::Hourly),
            "daily" => Ok(DurationClass::Daily),
            "weekly" => Ok(DurationClass::Weekly),
            "monthly" => Ok(DurationClass::Monthly),
            other => Err(format!("unknown plan duration: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub id: u64,
    pub name: String,
    #[serde(rename = "duration")]
    pub duration_class: DurationClass,
    #[serde(rename = "price_kes")]
    pub price_fiat: f64,
    pub data_mb: u64,
}

/// Body of plan create/update requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub name: String,
    pub duration: DurationClass,
    pub price_kes: f64,
    pub data_mb: i64,
}

/// Plan price at a given exchange rate. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanQuote {
    pub plan_id: u64,
    pub price_fiat: f64,
    pub price_native: f64,
    pub price_wei: String,
    pub rate: ExchangeRate,
}

/// Plan as recorded on chain after purchase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurchasedPlan {
    pub id: u64,
    pub name: String,
    pub duration: String,
    pub price_fiat: f64,
    pub data_mb: u64,
    pub purchased_at: String,
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    /// Status labels are free text on both sources.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "pending" | "processing" => TxStatus::Pending,
            "failed" | "reverted" | "rejected" | "cancelled" => TxStatus::Failed,
            _ => TxStatus::Confirmed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub id: String,
    pub account: String,
    pub username: Option<String>,
    pub plan_id: Option<u64>,
    pub amount_native: f64,
    pub amount_fiat: f64,
    pub timestamp: String,
    pub recorded_at: Option<DateTime<Utc>>,
    pub status: TxStatus,
    pub source: RecordSource,
}

// ---------------------------------------------------------------------------
// Backend wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub temp_token: String,
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: String,
    pub wallet_address: String,
    pub role: BackendRole,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedToken {
    pub role: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    pub usage_mb: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateUsageEntry {
    pub timestamp: String,
    pub total_usage_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendUser {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub wallet_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPurchase {
    pub id: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub plan_id: Option<u64>,
    pub price_kes: f64,
    #[serde(alias = "purchase_date", alias = "timestamp")]
    pub purchased_at: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub wallet_address: String,
    #[serde(default)]
    pub requested_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpTicket {
    pub id: u64,
    #[serde(default)]
    pub username: Option<String>,
    pub subject: String,
    pub message: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackTicket {
    pub id: u64,
    pub feedback: String,
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub replied_at: Option<String>,
}
