//! Provider console: subscribers, registrations and usage logged on a
//! subscriber's behalf

use alloy::primitives::{Address, U256};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;

use crate::auth::parse_address;
use crate::error::BillingError;
use crate::ledger::{from_chain, wei_to_native};
use crate::models::{
    BackendUser, ExchangeRate, PendingRegistration, TransactionRecord, UsageHistory,
};
use crate::services::backend::Backend;
use crate::services::contract::BillingContract;
use crate::session::{SignerHandle, WalletSession};
use crate::usage::{history_from_aggregate, positive_mb, positive_tokens, RecordedUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Registered,
    NotRegistered,
    NoWallet,
    Error,
    NoContract,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscriber {
    pub user: BackendUser,
    pub status: SubscriberStatus,
    pub total_usage_mb: Option<u64>,
    pub total_cost_native: Option<f64>,
    pub total_cost_fiat: Option<f64>,
    /// WiFiToken balance, as a decimal string.
    pub token_balance: Option<String>,
    pub detail: Option<String>,
}

impl Subscriber {
    fn bare(user: BackendUser, status: SubscriberStatus, detail: Option<String>) -> Self {
        Self {
            user,
            status,
            total_usage_mb: None,
            total_cost_native: None,
            total_cost_fiat: None,
            token_balance: None,
            detail,
        }
    }

    pub fn address(&self) -> Option<Address> {
        self.user.wallet_address.as_deref().and_then(|a| a.parse().ok())
    }
}

async fn billing_status(
    contract: &dyn BillingContract,
    user: BackendUser,
    rate: &ExchangeRate,
) -> Subscriber {
    let Some(raw) = user.wallet_address.clone().filter(|a| !a.trim().is_empty()) else {
        return Subscriber::bare(user, SubscriberStatus::NoWallet, None);
    };
    let account = match parse_address(&raw) {
        Ok(account) => account,
        Err(err) => return Subscriber::bare(user, SubscriberStatus::Error, Some(err.to_string())),
    };

    match contract.is_user_registered(account).await {
        Ok(true) => {}
        Ok(false) | Err(BillingError::ContractCallFailed(_)) => {
            return Subscriber::bare(user, SubscriberStatus::NotRegistered, None);
        }
        Err(err) => return Subscriber::bare(user, SubscriberStatus::Error, Some(err.to_string())),
    }

    match contract.generate_billing_report(account).await {
        Ok(report) => {
            let native = wei_to_native(report.total_cost_wei);
            let token_balance = match contract.token_balance(account).await {
                Ok(balance) => Some(balance.to_string()),
                Err(err) => {
                    tracing::warn!("Token balance for {} failed: {}", user.username, err);
                    None
                }
            };
            Subscriber {
                user,
                status: SubscriberStatus::Registered,
                total_usage_mb: Some(report.total_usage_mb),
                total_cost_native: Some(native),
                total_cost_fiat: Some(rate.to_fiat(native)),
                token_balance,
                detail: None,
            }
        }
        Err(err) => {
            tracing::warn!("Billing report for {} failed: {}", user.username, err);
            let detail = format!("Unable to fetch billing data for {}: {}", user.username, err);
            Subscriber::bare(user, SubscriberStatus::Error, Some(detail))
        }
    }
}

pub struct IspConsole {
    backend: Arc<dyn Backend>,
    session: Arc<WalletSession>,
}

impl IspConsole {
    pub fn new(backend: Arc<dyn Backend>, session: Arc<WalletSession>) -> Self {
        Self { backend, session }
    }

    /// Every backend user with their on-chain billing status. One user's
    /// failure is recorded on that user only.
    pub async fn subscribers(&self, rate: &ExchangeRate) -> Result<Vec<Subscriber>, BillingError> {
        let users = self.backend.users().await?;

        let contract = match self.session.signer() {
            Ok(signer) => match signer.contract.is_deployed().await {
                Ok(true) => Some(signer.contract),
                Ok(false) => None,
                Err(err) => {
                    tracing::warn!("Contract lookup failed: {}", err);
                    None
                }
            },
            Err(_) => None,
        };

        let Some(contract) = contract else {
            return Ok(users
                .into_iter()
                .map(|user| {
                    let detail = Some("Billing contract unavailable".to_string());
                    Subscriber::bare(user, SubscriberStatus::NoContract, detail)
                })
                .collect());
        };

        Ok(join_all(
            users
                .into_iter()
                .map(|user| billing_status(contract.as_ref(), user, rate)),
        )
        .await)
    }

    pub async fn pending_registrations(&self) -> Result<Vec<PendingRegistration>, BillingError> {
        self.backend.pending_registrations().await
    }

    fn provider_signer(&self) -> Result<SignerHandle, BillingError> {
        let signer = self.session.signer()?;
        if signer.role != crate::models::Role::ServiceProvider {
            return Err(BillingError::validation("Connected account is not the service provider"));
        }
        Ok(signer)
    }

    /// Confirms in the backend, then registers the wallet on chain.
    pub async fn confirm_registration(
        &self,
        request: &PendingRegistration,
    ) -> Result<String, BillingError> {
        let account = parse_address(&request.wallet_address)?;
        let signer = self.provider_signer()?;

        self.backend.confirm_registration(request.id).await?;
        tracing::info!("Registration {} confirmed in backend for {}", request.id, request.username);

        match signer.contract.register_user(account).await {
            Ok(tx) => Ok(format!("{:?}", tx)),
            Err(err) => {
                tracing::error!(
                    "{} confirmed in backend but not registered on chain: {}",
                    request.username,
                    err
                );
                Err(BillingError::DivergentLedger {
                    committed: "backend registration".to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    pub async fn reject_registration(
        &self,
        registration_id: u64,
        reason: &str,
    ) -> Result<(), BillingError> {
        if reason.trim().is_empty() {
            return Err(BillingError::validation("A rejection reason is required"));
        }
        self.backend.reject_registration(registration_id, reason.trim()).await?;
        tracing::info!("Registration {} rejected", registration_id);
        Ok(())
    }

    /// Same two-phase write as a user's own usage, made by the provider.
    pub async fn log_usage_for(
        &self,
        username: &str,
        account: &str,
        amount_mb: i64,
    ) -> Result<RecordedUsage, BillingError> {
        let amount_mb = positive_mb(amount_mb)?;
        if username.trim().is_empty() {
            return Err(BillingError::validation("Username is required"));
        }
        let account = parse_address(account)?;
        let signer = self.provider_signer()?;

        self.backend.isp_record_usage(username, amount_mb).await?;
        tracing::info!("Logged {} MB for {} in backend", amount_mb, username);

        match signer.contract.log_data_usage_by_isp(account, amount_mb).await {
            Ok(tx) => Ok(RecordedUsage {
                amount_mb,
                on_chain_tx: Some(format!("{:?}", tx)),
            }),
            Err(err) => Err(BillingError::DivergentLedger {
                committed: format!("backend usage log for {}", username),
                reason: err.to_string(),
            }),
        }
    }

    /// Mints tokens to a subscriber's wallet.
    pub async fn mint_for(&self, account: &str, amount: i64) -> Result<String, BillingError> {
        let amount: U256 = positive_tokens(amount)?;
        let account = parse_address(account)?;
        let signer = self.provider_signer()?;
        let tx = signer.contract.mint_tokens(account, amount).await?;
        tracing::info!("Minted {} tokens to {}", amount, account);
        Ok(format!("{:?}", tx))
    }

    /// On-chain transactions of every registered subscriber, fetched
    /// concurrently. Failed lookups are logged and skipped.
    pub async fn all_transactions(
        &self,
        subscribers: &[Subscriber],
        rate: &ExchangeRate,
    ) -> Result<Vec<TransactionRecord>, BillingError> {
        let signer = self.session.signer()?;

        let lookups = subscribers
            .iter()
            .filter(|s| s.status == SubscriberStatus::Registered)
            .filter_map(|s| s.address().map(|a| (s.user.username.clone(), a)))
            .map(|(username, account)| {
                let contract = signer.contract.clone();
                async move {
                    match contract.get_transactions(account).await {
                        Ok(txs) => txs
                            .iter()
                            .map(|tx| {
                                let mut record = from_chain(account, tx, rate);
                                record.username = Some(username.clone());
                                record
                            })
                            .collect(),
                        Err(err) => {
                            tracing::warn!("Transactions for {} unavailable: {}", username, err);
                            Vec::new()
                        }
                    }
                }
            });

        Ok(join_all(lookups).await.into_iter().flatten().collect())
    }

    pub async fn aggregate_usage(&self) -> Result<UsageHistory, BillingError> {
        let entries = self.backend.isp_usage().await?;
        Ok(history_from_aggregate(&entries))
    }
}
