//! Usage reconciliation between the backend log and the on-chain log
//!
//! The two logs are kept side by side, each with its own running total.
//! What is owed always comes from the contract's billing report.

use alloy::primitives::utils::{format_ether, parse_ether};
use alloy::primitives::{Address, U256};
use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::error::BillingError;
use crate::models::{
    AggregateUsageEntry, BillingSnapshot, ExchangeRate, RecordSource, UsageEntry, UsageHistory,
    UsagePoint,
};
use crate::services::backend::Backend;
use crate::services::contract::OnChainUsage;
use crate::session::{Freshness, WalletSession};
use crate::window::{from_unix_seconds, parse_timestamp};

/// Tokens minted on top of a shortfall before paying.
pub const TOP_UP_MARGIN: u64 = 100;

/// Running totals: `cumulative[i] = amounts[0] + .. + amounts[i]`.
pub fn cumulative_sums(amounts: &[u64]) -> Vec<u64> {
    amounts
        .iter()
        .scan(0u64, |total, amount| {
            *total = total.saturating_add(*amount);
            Some(*total)
        })
        .collect()
}

/// Whole megabytes. Negative and non-finite values count as zero.
pub fn whole_mb(amount: f64) -> u64 {
    if amount.is_finite() && amount > 0.0 {
        amount.floor() as u64
    } else {
        0
    }
}

fn history(
    source: RecordSource,
    rows: Vec<(u64, String, Option<chrono::DateTime<chrono::Utc>>)>,
) -> UsageHistory {
    let amounts: Vec<u64> = rows.iter().map(|(amount, _, _)| *amount).collect();
    let cumulative = cumulative_sums(&amounts);
    let total_mb = cumulative.last().copied().unwrap_or(0);

    let entries = rows
        .into_iter()
        .zip(cumulative)
        .map(|((amount_mb, timestamp, recorded_at), cumulative_mb)| UsagePoint {
            amount_mb,
            cumulative_mb,
            timestamp,
            recorded_at,
        })
        .collect();

    UsageHistory {
        source,
        entries,
        total_mb,
    }
}

/// Off-chain history in server order.
pub fn history_from_backend(entries: &[UsageEntry]) -> UsageHistory {
    history(
        RecordSource::OffChain,
        entries
            .iter()
            .map(|e| (whole_mb(e.usage_mb), e.timestamp.clone(), parse_timestamp(&e.timestamp)))
            .collect(),
    )
}

/// ISP-wide aggregate series, floored and accumulated the same way.
pub fn history_from_aggregate(entries: &[AggregateUsageEntry]) -> UsageHistory {
    history(
        RecordSource::OffChain,
        entries
            .iter()
            .map(|e| {
                let recorded_at = parse_timestamp(&e.timestamp);
                (whole_mb(e.total_usage_mb), e.timestamp.clone(), recorded_at)
            })
            .collect(),
    )
}

pub fn history_from_chain(entries: &[OnChainUsage]) -> UsageHistory {
    history(
        RecordSource::OnChain,
        entries
            .iter()
            .map(|e| {
                let (timestamp, recorded_at) = from_unix_seconds(e.timestamp);
                (e.usage_mb, timestamp, recorded_at)
            })
            .collect(),
    )
}

/// Latest loaded histories, one slot per source.
#[derive(Debug, Clone, Default)]
pub struct UsageView {
    pub off_chain: Option<UsageHistory>,
    pub on_chain: Option<UsageHistory>,
}

/// Outcome of a usage write that reached at least the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUsage {
    pub amount_mb: u64,
    /// `None` when no wallet session was connected.
    pub on_chain_tx: Option<String>,
}

/// A settled payment and the top-up minted to cover it, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentReceipt {
    pub tx_hash: String,
    pub paid_mb: u64,
    /// `cost_per_mb * paid_mb`, in WiFiToken units.
    pub cost_tokens: String,
    pub minted_tokens: Option<String>,
}

/// Tokens to mint so `balance` covers `cost`, or `None` when it already does.
pub fn top_up(balance: U256, cost: U256) -> Option<U256> {
    (balance < cost).then(|| cost - balance + U256::from(TOP_UP_MARGIN))
}

pub struct UsageReconciler {
    backend: Arc<dyn Backend>,
    session: Arc<WalletSession>,
    view: RwLock<UsageView>,
}

impl UsageReconciler {
    pub fn new(backend: Arc<dyn Backend>, session: Arc<WalletSession>) -> Self {
        Self {
            backend,
            session,
            view: RwLock::new(UsageView::default()),
        }
    }

    pub fn view(&self) -> UsageView {
        self.view.read().map(|v| v.clone()).unwrap_or_default()
    }

    fn store(&self, update: impl FnOnce(&mut UsageView)) {
        let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
        update(&mut view);
    }

    /// Authenticated user's stored usage entries.
    pub async fn load_from_backend(&self) -> Result<UsageHistory, BillingError> {
        let entries = self.backend.usage_entries().await?;
        let history = history_from_backend(&entries);
        tracing::debug!(
            "Loaded {} off-chain usage entries ({} MB)",
            history.entries.len(),
            history.total_mb
        );
        self.store(|view| view.off_chain = Some(history.clone()));
        Ok(history)
    }

    /// On-chain usage log for `account`. Requires a connected session; a
    /// response that arrives after the session moved on is returned as stale
    /// and not stored.
    pub async fn load_from_contract(
        &self,
        account: Address,
    ) -> Result<Freshness<UsageHistory>, BillingError> {
        let signer = self.session.signer()?;

        if !signer.contract.is_user_registered(account).await? {
            return Err(BillingError::ContractCallFailed(format!(
                "{} is not registered on the billing contract",
                account.to_checksum(None)
            )));
        }

        let entries = signer.contract.get_data_usage(account).await?;
        let history = history_from_chain(&entries);

        Ok(self.session.guard_and(signer.epoch, history, |history| {
            let count = history.entries.len();
            tracing::debug!("Loaded {} on-chain usage entries for {}", count, account);
            self.store(|view| view.on_chain = Some(history.clone()));
        }))
    }

    /// Amount owed straight from the contract's billing report.
    pub async fn billing_snapshot(
        &self,
        account: Address,
        rate: &ExchangeRate,
    ) -> Result<BillingSnapshot, BillingError> {
        let signer = self.session.signer()?;
        let report = signer.contract.generate_billing_report(account).await?;

        let total_cost_native: f64 = format_ether(report.total_cost_wei).parse().unwrap_or(0.0);
        Ok(BillingSnapshot {
            account: account.to_checksum(None),
            total_usage_mb: report.total_usage_mb,
            total_cost_wei: report.total_cost_wei.to_string(),
            total_cost_native,
            total_cost_fiat: rate.to_fiat(total_cost_native),
            rate: *rate,
        })
    }

    /// Backend first, then the contract when a session is connected. A
    /// contract failure after the backend accepted the entry is reported as
    /// `DivergentLedger` and left for an operator.
    pub async fn record_usage(&self, amount_mb: i64) -> Result<RecordedUsage, BillingError> {
        let amount_mb = positive_mb(amount_mb)?;

        self.backend.record_usage(amount_mb).await?;
        tracing::info!("Usage of {} MB recorded in backend", amount_mb);

        let Ok(signer) = self.session.signer() else {
            return Ok(RecordedUsage {
                amount_mb,
                on_chain_tx: None,
            });
        };

        match signer.contract.log_data_usage(amount_mb).await {
            Ok(tx) => Ok(RecordedUsage {
                amount_mb,
                on_chain_tx: Some(format!("{:?}", tx)),
            }),
            Err(err) => {
                tracing::error!("Usage in backend but not on chain ({} MB): {}", amount_mb, err);
                Err(BillingError::DivergentLedger {
                    committed: "backend usage log".to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// WiFiToken balance of `account`.
    pub async fn token_balance(&self, account: Address) -> Result<U256, BillingError> {
        self.session.signer()?.contract.token_balance(account).await
    }

    /// Mints tokens to the connected account.
    pub async fn mint_tokens(&self, amount: i64) -> Result<String, BillingError> {
        let amount = positive_tokens(amount)?;
        let signer = self.session.signer()?;
        let tx = signer.contract.mint_tokens(signer.account, amount).await?;
        tracing::info!("Minted {} tokens to {}", amount, signer.account);
        Ok(format!("{:?}", tx))
    }

    /// Pays for the usage in `snapshot`, priced at the contract's per-MB
    /// cost. A balance short of the cost is topped up first. Zero usage is
    /// refused before any contract call.
    pub async fn make_payment(
        &self,
        snapshot: &BillingSnapshot,
    ) -> Result<PaymentReceipt, BillingError> {
        if snapshot.total_usage_mb == 0 {
            return Err(BillingError::validation("No data usage to pay for"));
        }
        let signer = self.session.signer()?;

        let cost_per_mb = signer.contract.cost_per_mb().await?;
        let cost = cost_per_mb.saturating_mul(U256::from(snapshot.total_usage_mb));
        let balance = signer.contract.token_balance(signer.account).await?;
        tracing::debug!(
            "Payment of {} MB costs {} tokens; balance {}",
            snapshot.total_usage_mb,
            cost,
            balance
        );

        let minted = top_up(balance, cost);
        if let Some(amount) = minted {
            signer.contract.mint_tokens(signer.account, amount).await?;
            tracing::info!("Minted {} tokens to {} to cover payment", amount, signer.account);
        }

        let tx = signer.contract.make_payment(snapshot.total_usage_mb).await?;
        tracing::info!(
            "Payment for {} MB submitted by {}",
            snapshot.total_usage_mb,
            signer.account
        );
        Ok(PaymentReceipt {
            tx_hash: format!("{:?}", tx),
            paid_mb: snapshot.total_usage_mb,
            cost_tokens: cost.to_string(),
            minted_tokens: minted.map(|amount| amount.to_string()),
        })
    }
}

pub(crate) fn positive_mb(amount_mb: i64) -> Result<u64, BillingError> {
    u64::try_from(amount_mb)
        .ok()
        .filter(|amount| *amount > 0)
        .ok_or_else(|| BillingError::validation("Usage must be a positive whole number of MB"))
}

pub(crate) fn positive_tokens(amount: i64) -> Result<U256, BillingError> {
    u64::try_from(amount)
        .ok()
        .filter(|amount| *amount > 0)
        .map(U256::from)
        .ok_or_else(|| BillingError::validation("Token amount must be a positive whole number"))
}

/// Native amount in wei, for payable calls and quotes.
pub(crate) fn native_to_wei(native: f64) -> Result<alloy::primitives::U256, BillingError> {
    if !native.is_finite() || native < 0.0 {
        return Err(BillingError::validation(format!("Invalid native amount: {}", native)));
    }
    parse_ether(&format!("{:.18}", native)).map_err(|e| BillingError::validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_is_running_total() {
        assert_eq!(cumulative_sums(&[5, 0, 3, 10]), vec![5, 5, 8, 18]);
        assert!(cumulative_sums(&[]).is_empty());
    }

    #[test]
    fn backend_amounts_are_floored() {
        let entries = vec![
            UsageEntry { usage_mb: 10.9, timestamp: "2024-06-15 08:00:00".into() },
            UsageEntry { usage_mb: -4.0, timestamp: "2024-06-15 09:00:00".into() },
            UsageEntry { usage_mb: 2.2, timestamp: "garbled".into() },
        ];
        let history = history_from_backend(&entries);

        let amounts: Vec<u64> = history.entries.iter().map(|e| e.amount_mb).collect();
        let cumulative: Vec<u64> = history.entries.iter().map(|e| e.cumulative_mb).collect();
        assert_eq!(amounts, vec![10, 0, 2]);
        assert_eq!(cumulative, vec![10, 10, 12]);
        assert_eq!(history.total_mb, 12);
        assert!(history.entries[2].recorded_at.is_none());
    }

    #[test]
    fn chain_timestamps_are_formatted() {
        let history = history_from_chain(&[OnChainUsage { usage_mb: 7, timestamp: 1_718_409_600 }]);
        assert_eq!(history.entries[0].timestamp, "2024-06-15 00:00:00");
        assert_eq!(history.source, RecordSource::OnChain);
    }

    #[test]
    fn usage_amount_must_be_positive() {
        assert!(positive_mb(0).is_err());
        assert!(positive_mb(-3).is_err());
        assert_eq!(positive_mb(25).unwrap(), 25);
    }

    #[test]
    fn shortfall_is_topped_up_with_margin() {
        assert_eq!(top_up(U256::from(30), U256::from(120)), Some(U256::from(190)));
        assert_eq!(top_up(U256::from(120), U256::from(120)), None);
        assert_eq!(top_up(U256::from(500), U256::from(120)), None);
    }

    #[test]
    fn wei_conversion() {
        assert_eq!(native_to_wei(0.002).unwrap().to_string(), "2000000000000000");
        assert!(native_to_wei(f64::NAN).is_err());
    }
}
