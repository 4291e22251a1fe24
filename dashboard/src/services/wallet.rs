//! Signing wallet boundary
//!
//! [`WalletProvider`] mirrors what a browser wallet extension offers: account
//! access, chain switching and a signer bound to one account. Account and
//! network changes arrive as [`WalletEvent`]s on a channel.

use alloy::{
    network::EthereumWallet,
    primitives::Address,
    providers::{Provider, ProviderBuilder, RootProvider},
    signers::local::PrivateKeySigner,
    transports::http::{reqwest::Url, Client, Http},
};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::error::BillingError;
use crate::services::contract::{AlloyBillingContract, BillingContract};

/// EIP-1193 user rejection.
pub const CODE_USER_REJECTED: i64 = 4001;
/// Chain not known to the wallet.
pub const CODE_UNRECOGNIZED_CHAIN: i64 = 4902;
/// Internal JSON-RPC error.
pub const CODE_INTERNAL_RPC: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkParams {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
}

/// Raw error from the wallet, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletError {
    pub code: Option<i64>,
    pub message: String,
}

impl WalletError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.code == Some(CODE_USER_REJECTED)
    }

    pub fn is_unrecognized_chain(&self) -> bool {
        self.code == Some(CODE_UNRECOGNIZED_CHAIN)
    }
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl From<WalletError> for BillingError {
    fn from(err: WalletError) -> Self {
        match err.code {
            Some(CODE_USER_REJECTED) => BillingError::ContractCallFailed(format!(
                "Request rejected in wallet: {}",
                err.message
            )),
            Some(CODE_INTERNAL_RPC) | None => BillingError::RpcUnavailable(err.to_string()),
            Some(_) => BillingError::ContractCallFailed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Asks the wallet for account access; the selected account comes first.
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError>;
    async fn chain_id(&self) -> Result<u64, WalletError>;
    async fn switch_chain(&self, chain_id: u64) -> Result<(), WalletError>;
    async fn add_chain(&self, network: &NetworkParams) -> Result<(), WalletError>;
    /// Contract handle that signs as `account`.
    fn signer(&self, account: Address) -> Result<Arc<dyn BillingContract>, WalletError>;
}

/// Wallet over locally held keys, talking to one RPC node.
pub struct LocalWallet {
    signers: Vec<PrivateKeySigner>,
    selected: RwLock<usize>,
    provider: Arc<RootProvider<Http<Client>>>,
    rpc_url: Url,
    contract_address: Address,
    events: mpsc::UnboundedSender<WalletEvent>,
}

impl LocalWallet {
    pub fn new(
        keys: &[String],
        rpc_url: &str,
        contract_address: Address,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WalletEvent>), BillingError> {
        let signers = keys
            .iter()
            .map(|key| {
                key.trim()
                    .parse::<PrivateKeySigner>()
                    .map_err(|_| BillingError::validation("Invalid wallet private key"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let rpc_url: Url = rpc_url
            .parse()
            .map_err(|_| BillingError::validation(format!("Invalid RPC URL: {}", rpc_url)))?;
        let provider = ProviderBuilder::new().on_http(rpc_url.clone());
        let (events, rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                signers,
                selected: RwLock::new(0),
                provider: Arc::new(provider),
                rpc_url,
                contract_address,
                events,
            },
            rx,
        ))
    }

    fn ordered_accounts(&self) -> Vec<Address> {
        let selected = self.selected.read().map(|s| *s).unwrap_or(0);
        let mut accounts: Vec<Address> = self.signers.iter().map(|s| s.address()).collect();
        if selected < accounts.len() {
            accounts.swap(0, selected);
        }
        accounts
    }

    /// Switches the selected account and notifies subscribers.
    pub fn select(&self, account: Address) -> Result<(), BillingError> {
        let index = self
            .signers
            .iter()
            .position(|s| s.address() == account)
            .ok_or_else(|| {
                BillingError::validation(format!("Account {} is not held by this wallet", account))
            })?;

        if let Ok(mut selected) = self.selected.write() {
            *selected = index;
        }
        let _ = self.events.send(WalletEvent::AccountsChanged(self.ordered_accounts()));
        Ok(())
    }
}

#[async_trait]
impl WalletProvider for LocalWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        Ok(self.ordered_accounts())
    }

    async fn chain_id(&self) -> Result<u64, WalletError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| WalletError::new(CODE_INTERNAL_RPC, e.to_string()))
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<(), WalletError> {
        // The node decides the chain; switching only succeeds if it already matches.
        let current = self.chain_id().await?;
        if current == chain_id {
            Ok(())
        } else {
            Err(WalletError::new(
                CODE_UNRECOGNIZED_CHAIN,
                format!("Node at {} serves chain {}, not {}", self.rpc_url, current, chain_id),
            ))
        }
    }

    async fn add_chain(&self, network: &NetworkParams) -> Result<(), WalletError> {
        Err(WalletError::new(
            CODE_USER_REJECTED,
            format!("Local wallet cannot add network {} ({})", network.name, network.chain_id),
        ))
    }

    fn signer(&self, account: Address) -> Result<Arc<dyn BillingContract>, WalletError> {
        let signer = self
            .signers
            .iter()
            .find(|s| s.address() == account)
            .ok_or_else(|| WalletError::other(format!("No key held for {}", account)))?;

        Ok(Arc::new(AlloyBillingContract::new(
            self.provider.clone(),
            self.rpc_url.clone(),
            self.contract_address,
            Some(EthereumWallet::from(signer.clone())),
        )))
    }
}
