//! In-memory backend, contract and wallet for driving the views without a
//! node or an HTTP server.

#![allow(dead_code)]

use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use wifi_billing::models::*;
use wifi_billing::services::backend::Backend;
use wifi_billing::services::contract::{
    BillingContract, BillingReport, OnChainPlan, OnChainTransaction, OnChainUsage,
};
use wifi_billing::services::wallet::{NetworkParams, WalletError, WalletProvider};
use wifi_billing::session::WalletSession;
use wifi_billing::BillingError;

pub const CHAIN_ID: u64 = 11155111;

pub fn provider() -> Address {
    Address::repeat_byte(0x11)
}

pub fn alice() -> Address {
    Address::repeat_byte(0xa1)
}

pub fn bob() -> Address {
    Address::repeat_byte(0xb0)
}

pub fn network() -> NetworkParams {
    NetworkParams {
        chain_id: CHAIN_ID,
        name: "Sepolia".to_string(),
        rpc_url: "http://127.0.0.1:8545".to_string(),
    }
}

/// Holds a call until the test releases it, after telling the test it arrived.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeBackend {
    pub usage: Mutex<Vec<UsageEntry>>,
    pub recorded: Mutex<Vec<u64>>,
    pub wallet_updates: Mutex<Vec<String>>,
    pub fail_wallet_update: bool,
    pub purchases: Mutex<Vec<PlanPurchase>>,
    pub purchase_reads: Mutex<usize>,
    pub plans: Mutex<Vec<PlanRecord>>,
    pub users: Mutex<Vec<BackendUser>>,
    pub confirmed: Mutex<Vec<u64>>,
    pub fail_usage: bool,
    pub fail_purchases: bool,
}

#[async_trait]
impl Backend for FakeBackend {
    async fn update_wallet(&self, wallet_address: &str) -> Result<(), BillingError> {
        if self.fail_wallet_update {
            return Err(BillingError::Backend("Wallet address already in use".to_string()));
        }
        self.wallet_updates.lock().unwrap().push(wallet_address.to_string());
        Ok(())
    }

    async fn usage_entries(&self) -> Result<Vec<UsageEntry>, BillingError> {
        if self.fail_usage {
            return Err(BillingError::Backend("Usage service unavailable".to_string()));
        }
        Ok(self.usage.lock().unwrap().clone())
    }

    async fn record_usage(&self, amount_mb: u64) -> Result<(), BillingError> {
        self.recorded.lock().unwrap().push(amount_mb);
        Ok(())
    }

    async fn isp_usage(&self) -> Result<Vec<AggregateUsageEntry>, BillingError> {
        Ok(Vec::new())
    }

    async fn isp_record_usage(&self, _username: &str, amount_mb: u64) -> Result<(), BillingError> {
        self.recorded.lock().unwrap().push(amount_mb);
        Ok(())
    }

    async fn users(&self) -> Result<Vec<BackendUser>, BillingError> {
        Ok(self.users.lock().unwrap().clone())
    }

    async fn plan_purchases(&self) -> Result<Vec<PlanPurchase>, BillingError> {
        *self.purchase_reads.lock().unwrap() += 1;
        if self.fail_purchases {
            return Err(BillingError::Backend("Purchase history unavailable".to_string()));
        }
        Ok(self.purchases.lock().unwrap().clone())
    }

    async fn plans(&self) -> Result<Vec<PlanRecord>, BillingError> {
        Ok(self.plans.lock().unwrap().clone())
    }

    async fn create_plan(&self, _draft: &PlanDraft) -> Result<(), BillingError> {
        Ok(())
    }

    async fn update_plan(&self, _plan_id: u64, _draft: &PlanDraft) -> Result<(), BillingError> {
        Ok(())
    }

    async fn delete_plan(&self, _plan_id: u64) -> Result<(), BillingError> {
        Ok(())
    }

    async fn pending_registrations(&self) -> Result<Vec<PendingRegistration>, BillingError> {
        Ok(Vec::new())
    }

    async fn confirm_registration(&self, registration_id: u64) -> Result<(), BillingError> {
        self.confirmed.lock().unwrap().push(registration_id);
        Ok(())
    }

    async fn reject_registration(
        &self,
        _registration_id: u64,
        _reason: &str,
    ) -> Result<(), BillingError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

pub struct FakeContract {
    pub isp: Address,
    pub registered: Mutex<HashSet<Address>>,
    pub fail_writes: bool,
    pub calls: Mutex<Vec<String>>,
    pub usage: Mutex<Vec<OnChainUsage>>,
    pub report: BillingReport,
    pub usage_gate: Option<Arc<Gate>>,
    pub transactions: Mutex<Vec<OnChainTransaction>>,
    pub balances: Mutex<HashMap<Address, U256>>,
    pub cost_per_mb: U256,
    pub minted: Mutex<Vec<(Address, U256)>>,
}

impl FakeContract {
    pub fn new(isp: Address) -> Self {
        Self {
            isp,
            registered: Mutex::new(HashSet::new()),
            fail_writes: false,
            calls: Mutex::new(Vec::new()),
            usage: Mutex::new(Vec::new()),
            report: BillingReport {
                total_usage_mb: 0,
                total_cost_wei: U256::ZERO,
            },
            usage_gate: None,
            transactions: Mutex::new(Vec::new()),
            balances: Mutex::new(HashMap::new()),
            cost_per_mb: U256::from(2),
            minted: Mutex::new(Vec::new()),
        }
    }

    pub fn with_balance(self, account: Address, balance: u64) -> Self {
        self.balances.lock().unwrap().insert(account, U256::from(balance));
        self
    }

    pub fn with_registered(self, accounts: &[Address]) -> Self {
        self.registered.lock().unwrap().extend(accounts.iter().copied());
        self
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == name)
    }

    fn write(&self, name: &str) -> Result<TxHash, BillingError> {
        self.calls.lock().unwrap().push(name.to_string());
        if self.fail_writes {
            return Err(BillingError::ContractCallFailed(format!("{} reverted", name)));
        }
        Ok(TxHash::repeat_byte(0x42))
    }
}

#[async_trait]
impl BillingContract for FakeContract {
    async fn is_deployed(&self) -> Result<bool, BillingError> {
        Ok(true)
    }

    async fn isp(&self) -> Result<Address, BillingError> {
        Ok(self.isp)
    }

    async fn is_user_registered(&self, account: Address) -> Result<bool, BillingError> {
        Ok(self.registered.lock().unwrap().contains(&account))
    }

    async fn register_isp(&self) -> Result<TxHash, BillingError> {
        let tx = self.write("register_isp")?;
        self.registered.lock().unwrap().insert(self.isp);
        Ok(tx)
    }

    async fn register_user(&self, account: Address) -> Result<TxHash, BillingError> {
        let tx = self.write("register_user")?;
        self.registered.lock().unwrap().insert(account);
        Ok(tx)
    }

    async fn log_data_usage(&self, _amount_mb: u64) -> Result<TxHash, BillingError> {
        self.write("log_data_usage")
    }

    async fn log_data_usage_by_isp(
        &self,
        _account: Address,
        _amount_mb: u64,
    ) -> Result<TxHash, BillingError> {
        self.write("log_data_usage_by_isp")
    }

    async fn get_data_usage(&self, _account: Address) -> Result<Vec<OnChainUsage>, BillingError> {
        if let Some(gate) = &self.usage_gate {
            gate.pass().await;
        }
        Ok(self.usage.lock().unwrap().clone())
    }

    async fn generate_billing_report(
        &self,
        _account: Address,
    ) -> Result<BillingReport, BillingError> {
        Ok(self.report)
    }

    async fn make_payment(&self, _amount_mb: u64) -> Result<TxHash, BillingError> {
        self.write("make_payment")
    }

    async fn purchase_plan(&self, _plan_id: u64, _price_wei: U256) -> Result<TxHash, BillingError> {
        self.write("purchase_plan")
    }

    async fn get_transactions(
        &self,
        _account: Address,
    ) -> Result<Vec<OnChainTransaction>, BillingError> {
        Ok(self.transactions.lock().unwrap().clone())
    }

    async fn get_purchased_plans(
        &self,
        _account: Address,
    ) -> Result<Vec<OnChainPlan>, BillingError> {
        Ok(Vec::new())
    }

    async fn get_active_plans(&self) -> Result<Vec<OnChainPlan>, BillingError> {
        Ok(Vec::new())
    }

    async fn cost_per_mb(&self) -> Result<U256, BillingError> {
        Ok(self.cost_per_mb)
    }

    async fn token_balance(&self, account: Address) -> Result<U256, BillingError> {
        Ok(self.balances.lock().unwrap().get(&account).copied().unwrap_or(U256::ZERO))
    }

    async fn mint_tokens(&self, account: Address, amount: U256) -> Result<TxHash, BillingError> {
        let tx = self.write("mint_tokens")?;
        self.minted.lock().unwrap().push((account, amount));
        *self.balances.lock().unwrap().entry(account).or_insert(U256::ZERO) += amount;
        Ok(tx)
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

pub struct FakeWallet {
    pub accounts: Mutex<Vec<Address>>,
    pub chain_id: Mutex<u64>,
    /// Error returned by `switch_chain`; `None` switches successfully.
    pub switch_error: Option<WalletError>,
    /// Whether `add_chain` moves the wallet onto the requested chain.
    pub add_chain_works: bool,
    pub accounts_error: Option<WalletError>,
    pub accounts_gate: Option<Arc<Gate>>,
    pub contract: Arc<FakeContract>,
}

impl FakeWallet {
    pub fn new(accounts: Vec<Address>, contract: Arc<FakeContract>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            chain_id: Mutex::new(CHAIN_ID),
            switch_error: None,
            add_chain_works: false,
            accounts_error: None,
            accounts_gate: None,
            contract,
        }
    }
}

#[async_trait]
impl WalletProvider for FakeWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        if let Some(gate) = &self.accounts_gate {
            gate.pass().await;
        }
        if let Some(err) = &self.accounts_error {
            return Err(err.clone());
        }
        Ok(self.accounts.lock().unwrap().clone())
    }

    async fn chain_id(&self) -> Result<u64, WalletError> {
        Ok(*self.chain_id.lock().unwrap())
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<(), WalletError> {
        if let Some(err) = &self.switch_error {
            return Err(err.clone());
        }
        *self.chain_id.lock().unwrap() = chain_id;
        Ok(())
    }

    async fn add_chain(&self, network: &NetworkParams) -> Result<(), WalletError> {
        if !self.add_chain_works {
            return Err(WalletError::other("add chain refused"));
        }
        *self.chain_id.lock().unwrap() = network.chain_id;
        Ok(())
    }

    fn signer(&self, _account: Address) -> Result<Arc<dyn BillingContract>, WalletError> {
        Ok(self.contract.clone())
    }
}

pub fn session(wallet: FakeWallet, backend: Arc<FakeBackend>) -> Arc<WalletSession> {
    Arc::new(WalletSession::new(Arc::new(wallet), backend, network()))
}
