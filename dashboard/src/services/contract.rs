//! WiFiBilling contract client using Alloy
//!
//! Reads go through a shared HTTP provider. Writes build a signing provider
//! from the wallet bound to the handle and wait for the receipt.

use alloy::{
    network::EthereumWallet,
    primitives::{Address, TxHash, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    sol,
    transports::{
        http::{reqwest::Url, Client, Http},
        RpcError, TransportError,
    },
};
use async_trait::async_trait;
use std::sync::Arc;

use crate::error::BillingError;

sol! {
    #[sol(rpc)]
    contract WiFiBilling {
        struct DataUsage {
            uint256 usageMB;
            uint256 timestamp;
        }

        struct BillingTx {
            uint256 id;
            address user;
            uint256 amount;
            uint256 timestamp;
            string status;
        }

        struct WifiPlan {
            uint256 id;
            string name;
            string duration;
            uint256 priceKes;
            uint256 dataMb;
            uint256 purchaseDate;
            bool active;
        }

        function isp() external view returns (address);
        function isUserRegistered(address user) external view returns (bool);
        function registerISP() external;
        function registerUser(address user) external;
        function logDataUsage(uint256 usageMB) external;
        function logDataUsageByISP(address user, uint256 usageMB) external;
        function getDataUsage(address user) external view returns (DataUsage[] memory);
        function generateBillingReport(address user)
            external
            view
            returns (uint256 totalUsage, uint256 totalCost);
        function makePayment(uint256 amountMB) external;
        function purchasePlan(uint256 planId, uint256 priceWei) external payable;
        function getTransactions(address user) external view returns (BillingTx[] memory);
        function getPurchasedPlans(address user) external view returns (WifiPlan[] memory);
        function getActivePlans() external view returns (WifiPlan[] memory);
        function costPerMB() external view returns (uint256);
        function tokenBalances(address user) external view returns (uint256);
        function mintTokens(address user, uint256 amount) external;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainUsage {
    pub usage_mb: u64,
    /// Unix seconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainTransaction {
    pub id: u64,
    pub amount_wei: U256,
    pub timestamp: u64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainPlan {
    pub id: u64,
    pub name: String,
    pub duration: String,
    pub price_fiat: u64,
    pub data_mb: u64,
    pub purchase_date: u64,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingReport {
    pub total_usage_mb: u64,
    pub total_cost_wei: U256,
}

/// Read/write surface of the billing contract, bound to one signer.
#[async_trait]
pub trait BillingContract: Send + Sync {
    /// Whether code is deployed at the contract address.
    async fn is_deployed(&self) -> Result<bool, BillingError>;
    async fn isp(&self) -> Result<Address, BillingError>;
    async fn is_user_registered(&self, account: Address) -> Result<bool, BillingError>;
    async fn register_isp(&self) -> Result<TxHash, BillingError>;
    async fn register_user(&self, account: Address) -> Result<TxHash, BillingError>;
    async fn log_data_usage(&self, amount_mb: u64) -> Result<TxHash, BillingError>;
    async fn log_data_usage_by_isp(
        &self,
        account: Address,
        amount_mb: u64,
    ) -> Result<TxHash, BillingError>;
    async fn get_data_usage(&self, account: Address) -> Result<Vec<OnChainUsage>, BillingError>;
    async fn generate_billing_report(
        &self,
        account: Address,
    ) -> Result<BillingReport, BillingError>;
    async fn make_payment(&self, amount_mb: u64) -> Result<TxHash, BillingError>;
    async fn purchase_plan(&self, plan_id: u64, price_wei: U256) -> Result<TxHash, BillingError>;
    async fn get_transactions(
        &self,
        account: Address,
    ) -> Result<Vec<OnChainTransaction>, BillingError>;
    async fn get_purchased_plans(&self, account: Address) -> Result<Vec<OnChainPlan>, BillingError>;
    async fn get_active_plans(&self) -> Result<Vec<OnChainPlan>, BillingError>;
    /// WiFiToken units charged per megabyte by `makePayment`.
    async fn cost_per_mb(&self) -> Result<U256, BillingError>;
    async fn token_balance(&self, account: Address) -> Result<U256, BillingError>;
    async fn mint_tokens(&self, account: Address, amount: U256) -> Result<TxHash, BillingError>;
}

/// Reverts and decode failures become `ContractCallFailed`; a node that
/// cannot be reached becomes `RpcUnavailable`.
pub fn classify_call_error(err: alloy::contract::Error) -> BillingError {
    match err {
        alloy::contract::Error::TransportError(err) => classify_transport_error(err),
        other => BillingError::ContractCallFailed(other.to_string()),
    }
}

pub fn classify_transport_error(err: TransportError) -> BillingError {
    match err {
        RpcError::Transport(kind) => BillingError::RpcUnavailable(kind.to_string()),
        other => BillingError::ContractCallFailed(other.to_string()),
    }
}

/// Sends a state-changing call through a signing provider and awaits the receipt.
macro_rules! submit {
    ($self:ident, $label:literal, |$contract:ident| $call:expr) => {{
        let wallet = $self.wallet.as_ref().ok_or_else(|| {
            BillingError::Internal("No signer bound to this contract handle".to_string())
        })?;
        let signing_provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet.clone())
            .on_http($self.rpc_url.clone());
        let $contract = WiFiBilling::new($self.address, &signing_provider);

        let call = $call;
        let pending = call.send().await.map_err(classify_call_error)?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(classify_transport_error)?;

        if !receipt.status() {
            return Err(BillingError::ContractCallFailed(format!(
                "{} reverted in {:?}",
                $label, receipt.transaction_hash
            )));
        }

        tracing::info!("{} confirmed: tx={:?}", $label, receipt.transaction_hash);
        Ok(receipt.transaction_hash)
    }};
}

pub struct AlloyBillingContract {
    provider: Arc<RootProvider<Http<Client>>>,
    wallet: Option<EthereumWallet>,
    rpc_url: Url,
    address: Address,
}

impl AlloyBillingContract {
    pub fn new(
        provider: Arc<RootProvider<Http<Client>>>,
        rpc_url: Url,
        address: Address,
        wallet: Option<EthereumWallet>,
    ) -> Self {
        Self {
            provider,
            wallet,
            rpc_url,
            address,
        }
    }

    fn reader(
        &self,
    ) -> WiFiBilling::WiFiBillingInstance<Http<Client>, &RootProvider<Http<Client>>> {
        WiFiBilling::new(self.address, &*self.provider)
    }
}

fn plan_from_chain(plan: WiFiBilling::WifiPlan) -> OnChainPlan {
    OnChainPlan {
        id: plan.id.saturating_to(),
        name: plan.name,
        duration: plan.duration,
        price_fiat: plan.priceKes.saturating_to(),
        data_mb: plan.dataMb.saturating_to(),
        purchase_date: plan.purchaseDate.saturating_to(),
        active: plan.active,
    }
}

#[async_trait]
impl BillingContract for AlloyBillingContract {
    async fn is_deployed(&self) -> Result<bool, BillingError> {
        let code = self
            .provider
            .get_code_at(self.address)
            .await
            .map_err(classify_transport_error)?;
        Ok(!code.is_empty())
    }

    async fn isp(&self) -> Result<Address, BillingError> {
        Ok(self.reader().isp().call().await.map_err(classify_call_error)?._0)
    }

    async fn is_user_registered(&self, account: Address) -> Result<bool, BillingError> {
        Ok(self
            .reader()
            .isUserRegistered(account)
            .call()
            .await
            .map_err(classify_call_error)?
            ._0)
    }

    async fn register_isp(&self) -> Result<TxHash, BillingError> {
        submit!(self, "registerISP", |contract| contract.registerISP())
    }

    async fn register_user(&self, account: Address) -> Result<TxHash, BillingError> {
        submit!(self, "registerUser", |contract| contract.registerUser(account))
    }

    async fn log_data_usage(&self, amount_mb: u64) -> Result<TxHash, BillingError> {
        submit!(self, "logDataUsage", |contract| contract
            .logDataUsage(U256::from(amount_mb)))
    }

    async fn log_data_usage_by_isp(
        &self,
        account: Address,
        amount_mb: u64,
    ) -> Result<TxHash, BillingError> {
        submit!(self, "logDataUsageByISP", |contract| contract
            .logDataUsageByISP(account, U256::from(amount_mb)))
    }

    async fn get_data_usage(&self, account: Address) -> Result<Vec<OnChainUsage>, BillingError> {
        let entries = self
            .reader()
            .getDataUsage(account)
            .call()
            .await
            .map_err(classify_call_error)?
            ._0;

        Ok(entries
            .into_iter()
            .map(|entry| OnChainUsage {
                usage_mb: entry.usageMB.saturating_to(),
                timestamp: entry.timestamp.saturating_to(),
            })
            .collect())
    }

    async fn generate_billing_report(
        &self,
        account: Address,
    ) -> Result<BillingReport, BillingError> {
        let report = self
            .reader()
            .generateBillingReport(account)
            .call()
            .await
            .map_err(classify_call_error)?;

        Ok(BillingReport {
            total_usage_mb: report.totalUsage.saturating_to(),
            total_cost_wei: report.totalCost,
        })
    }

    async fn make_payment(&self, amount_mb: u64) -> Result<TxHash, BillingError> {
        submit!(self, "makePayment", |contract| contract
            .makePayment(U256::from(amount_mb)))
    }

    async fn purchase_plan(&self, plan_id: u64, price_wei: U256) -> Result<TxHash, BillingError> {
        submit!(self, "purchasePlan", |contract| contract
            .purchasePlan(U256::from(plan_id), price_wei)
            .value(price_wei))
    }

    async fn get_transactions(
        &self,
        account: Address,
    ) -> Result<Vec<OnChainTransaction>, BillingError> {
        let txs = self
            .reader()
            .getTransactions(account)
            .call()
            .await
            .map_err(classify_call_error)?
            ._0;

        Ok(txs
            .into_iter()
            .map(|tx| OnChainTransaction {
                id: tx.id.saturating_to(),
                amount_wei: tx.amount,
                timestamp: tx.timestamp.saturating_to(),
                status: tx.status,
            })
            .collect())
    }

    async fn get_purchased_plans(
        &self,
        account: Address,
    ) -> Result<Vec<OnChainPlan>, BillingError> {
        let plans = self
            .reader()
            .getPurchasedPlans(account)
            .call()
            .await
            .map_err(classify_call_error)?
            ._0;
        Ok(plans.into_iter().map(plan_from_chain).collect())
    }

    async fn get_active_plans(&self) -> Result<Vec<OnChainPlan>, BillingError> {
        let plans = self
            .reader()
            .getActivePlans()
            .call()
            .await
            .map_err(classify_call_error)?
            ._0;
        Ok(plans.into_iter().map(plan_from_chain).collect())
    }

    async fn cost_per_mb(&self) -> Result<U256, BillingError> {
        Ok(self
            .reader()
            .costPerMB()
            .call()
            .await
            .map_err(classify_call_error)?
            ._0)
    }

    async fn token_balance(&self, account: Address) -> Result<U256, BillingError> {
        Ok(self
            .reader()
            .tokenBalances(account)
            .call()
            .await
            .map_err(classify_call_error)?
            ._0)
    }

    async fn mint_tokens(&self, account: Address, amount: U256) -> Result<TxHash, BillingError> {
        submit!(self, "mintTokens", |contract| contract.mintTokens(account, amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::transports::TransportErrorKind;

    #[test]
    fn unreachable_node_is_rpc_unavailable() {
        let err = classify_transport_error(RpcError::Transport(TransportErrorKind::BackendGone));
        assert!(matches!(err, BillingError::RpcUnavailable(_)));
    }

    #[test]
    fn revert_is_contract_call_failure() {
        let unknown = alloy::contract::Error::UnknownFunction("tokenBalances".into());
        let err = classify_call_error(unknown);
        assert!(matches!(err, BillingError::ContractCallFailed(_)));

        let err = classify_transport_error(RpcError::NullResp);
        assert!(matches!(err, BillingError::ContractCallFailed(_)));
    }
}
