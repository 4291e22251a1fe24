//! Transaction ledger view
//!
//! Backend purchases and on-chain transactions are normalized into
//! [`TransactionRecord`]s but reported as two separate lists. There is no
//! identity shared between the sources, so nothing is merged or deduplicated.

use alloy::primitives::utils::format_ether;
use alloy::primitives::Address;
use serde::Serialize;
use std::sync::Arc;

use crate::auth::TokenStore;
use crate::error::BillingError;
use crate::models::{
    BackendRole, ExchangeRate, PlanPurchase, RecordSource, TransactionRecord, TxStatus,
};
use crate::services::backend::Backend;
use crate::services::contract::OnChainTransaction;
use crate::session::{Freshness, WalletSession};
use crate::window::{
    filter_by_window, from_unix_seconds, parse_timestamp, UnparsablePolicy, WindowKind,
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerReport {
    pub backend: Vec<TransactionRecord>,
    pub on_chain: Vec<TransactionRecord>,
}

impl LedgerReport {
    pub fn filtered(
        &self,
        kind: WindowKind,
        now: chrono::DateTime<chrono::Utc>,
        policy: UnparsablePolicy,
    ) -> Self {
        Self {
            backend: filter_by_window(&self.backend, kind, now, policy),
            on_chain: filter_by_window(&self.on_chain, kind, now, policy),
        }
    }

    /// Both lists back to back, backend first.
    pub fn all(&self) -> Vec<TransactionRecord> {
        self.backend.iter().chain(self.on_chain.iter()).cloned().collect()
    }
}

pub fn wei_to_native(wei: alloy::primitives::U256) -> f64 {
    format_ether(wei).parse().unwrap_or(0.0)
}

pub fn from_purchase(purchase: &PlanPurchase, rate: &ExchangeRate) -> TransactionRecord {
    TransactionRecord {
        id: format!("db-{}", purchase.id),
        account: purchase.wallet_address.clone().unwrap_or_default(),
        username: purchase.username.clone(),
        plan_id: purchase.plan_id,
        amount_native: rate.to_native(purchase.price_kes),
        amount_fiat: purchase.price_kes,
        timestamp: purchase.purchased_at.clone(),
        recorded_at: parse_timestamp(&purchase.purchased_at),
        status: purchase
            .status
            .as_deref()
            .map(TxStatus::from_label)
            .unwrap_or(TxStatus::Confirmed),
        source: RecordSource::OffChain,
    }
}

pub fn from_chain(
    account: Address,
    tx: &OnChainTransaction,
    rate: &ExchangeRate,
) -> TransactionRecord {
    let amount_native = wei_to_native(tx.amount_wei);
    let (timestamp, recorded_at) = from_unix_seconds(tx.timestamp);
    TransactionRecord {
        id: format!("chain-{}", tx.id),
        account: account.to_checksum(None),
        username: None,
        plan_id: None,
        amount_native,
        amount_fiat: rate.to_fiat(amount_native),
        timestamp,
        recorded_at,
        status: TxStatus::from_label(&tx.status),
        source: RecordSource::OnChain,
    }
}

pub struct TransactionLedgerView {
    backend: Arc<dyn Backend>,
    session: Arc<WalletSession>,
    tokens: TokenStore,
}

impl TransactionLedgerView {
    pub fn new(backend: Arc<dyn Backend>, session: Arc<WalletSession>, tokens: TokenStore) -> Self {
        Self {
            backend,
            session,
            tokens,
        }
    }

    /// Provider-recorded plan purchases for every user. Regular users get
    /// an empty list; they only see their on-chain transactions.
    pub async fn load_backend_purchases(
        &self,
        rate: &ExchangeRate,
    ) -> Result<Vec<TransactionRecord>, BillingError> {
        if self.tokens.role() != Some(BackendRole::WifiProvider) {
            return Ok(Vec::new());
        }
        let purchases = self.backend.plan_purchases().await?;
        Ok(purchases.iter().map(|p| from_purchase(p, rate)).collect())
    }

    pub async fn load_contract_transactions(
        &self,
        account: Address,
        rate: &ExchangeRate,
    ) -> Result<Freshness<Vec<TransactionRecord>>, BillingError> {
        let signer = self.session.signer()?;
        let txs = signer.contract.get_transactions(account).await?;
        let records = txs.iter().map(|tx| from_chain(account, tx, rate)).collect();
        Ok(self.session.guard(signer.epoch, records))
    }

    /// Both sources for the connected account. A failure on one side is
    /// logged and leaves that side empty.
    pub async fn load(&self, rate: &ExchangeRate) -> Result<Freshness<LedgerReport>, BillingError> {
        let signer = self.session.signer()?;

        let (backend, on_chain) = tokio::join!(
            self.load_backend_purchases(rate),
            self.load_contract_transactions(signer.account, rate)
        );

        let backend = backend.unwrap_or_else(|e| {
            tracing::warn!("Backend purchases unavailable: {}", e);
            Vec::new()
        });
        let on_chain = match on_chain {
            Ok(Freshness::Current(records)) => records,
            Ok(Freshness::Stale) => return Ok(Freshness::Stale),
            Err(e) => {
                tracing::warn!("On-chain transactions unavailable: {}", e);
                Vec::new()
            }
        };

        Ok(self.session.guard(signer.epoch, LedgerReport { backend, on_chain }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    #[test]
    fn chain_transaction_converts_wei() {
        let account: Address = "0x609E600Ff6d549685b8E5B71d20616390A5B5e0D".parse().unwrap();
        let tx = OnChainTransaction {
            id: 3,
            amount_wei: U256::from(2_000_000_000_000_000u64),
            timestamp: 1_718_409_600,
            status: "Completed".into(),
        };
        let record = from_chain(account, &tx, &ExchangeRate::live(250_000.0));

        assert_eq!(record.id, "chain-3");
        assert_eq!(record.amount_native, 0.002);
        assert_eq!(record.amount_fiat, 500.0);
        assert_eq!(record.status, TxStatus::Confirmed);
        assert_eq!(record.timestamp, "2024-06-15 00:00:00");
    }

    #[test]
    fn purchase_keeps_backend_identity() {
        let purchase = PlanPurchase {
            id: 9,
            username: Some("alice".into()),
            wallet_address: None,
            plan_id: Some(2),
            price_kes: 500.0,
            purchased_at: "2024-06-15 09:30:00".into(),
            status: None,
        };
        let record = from_purchase(&purchase, &ExchangeRate::live(250_000.0));

        assert_eq!(record.id, "db-9");
        assert_eq!(record.amount_native, 0.002);
        assert_eq!(record.source, RecordSource::OffChain);
        assert!(record.recorded_at.is_some());
    }
}
