//! Wallet session: account, network, role and the signer bound to them
//!
//! State is published on a `watch` channel. Every transition bumps the
//! session epoch; views capture the epoch of the signer they used and drop
//! responses once the epoch has moved on.

use alloy::primitives::{Address, TxHash};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::BillingError;
use crate::models::{ConnectionState, Role};
use crate::services::backend::Backend;
use crate::services::contract::BillingContract;
use crate::services::wallet::{NetworkParams, WalletEvent, WalletProvider};

/// Contract handle bound to one account, chain and session epoch.
#[derive(Clone)]
pub struct SignerHandle {
    pub account: Address,
    pub chain_id: u64,
    pub epoch: u64,
    pub role: Role,
    pub contract: Arc<dyn BillingContract>,
}

impl fmt::Debug for SignerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerHandle")
            .field("account", &self.account)
            .field("chain_id", &self.chain_id)
            .field("epoch", &self.epoch)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// `signer` is `Some` exactly when `connection` is `Connected`.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub account: Option<Address>,
    pub chain_id: Option<u64>,
    pub role: Option<Role>,
    pub epoch: u64,
    signer: Option<SignerHandle>,
}

impl SessionState {
    fn disconnected(epoch: u64) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            account: None,
            chain_id: None,
            role: None,
            epoch,
            signer: None,
        }
    }

    pub fn signer(&self) -> Option<&SignerHandle> {
        self.signer.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            connection: self.connection.clone(),
            account: self.account.map(|a| a.to_checksum(None)),
            chain_id: self.chain_id,
            role: self.role,
            epoch: self.epoch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub connection: ConnectionState,
    pub account: Option<String>,
    pub chain_id: Option<u64>,
    pub role: Option<Role>,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectedSession {
    pub account: String,
    pub chain_id: u64,
    pub role: Role,
    pub epoch: u64,
    /// Set when the provider registered itself during this connect.
    pub provider_registration: Option<String>,
    /// The backend wallet update failed; the connection stands regardless.
    pub wallet_sync_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConnectOutcome {
    Connected(ConnectedSession),
    /// Another connect was already running; this request did nothing.
    InProgress,
    /// A disconnect or wallet event replaced this attempt before it finished.
    Superseded,
}

/// Result of a read made against a particular session epoch.
#[derive(Debug, Clone, PartialEq)]
pub enum Freshness<T> {
    Current(T),
    Stale,
}

impl<T> Freshness<T> {
    pub fn current(self) -> Option<T> {
        match self {
            Freshness::Current(value) => Some(value),
            Freshness::Stale => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Freshness::Stale)
    }
}

pub struct WalletSession {
    wallet: Arc<dyn WalletProvider>,
    backend: Arc<dyn Backend>,
    network: NetworkParams,
    state: watch::Sender<SessionState>,
}

impl WalletSession {
    pub fn new(
        wallet: Arc<dyn WalletProvider>,
        backend: Arc<dyn Backend>,
        network: NetworkParams,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::disconnected(0));
        Self {
            wallet,
            backend,
            network,
            state,
        }
    }

    pub fn network(&self) -> &NetworkParams {
        &self.network
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state.borrow().epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        let state = self.state.borrow();
        state.epoch == epoch && state.is_connected()
    }

    /// The active signer, or `NoAccountSelected` when not connected.
    pub fn signer(&self) -> Result<SignerHandle, BillingError> {
        self.state
            .borrow()
            .signer
            .clone()
            .ok_or(BillingError::NoAccountSelected)
    }

    /// Wraps `value` as current only if `epoch` is still the live session.
    pub fn guard<T>(&self, epoch: u64, value: T) -> Freshness<T> {
        self.guard_and(epoch, value, |_| {})
    }

    /// Like [`guard`](Self::guard), but runs `commit` on a current value
    /// while the session state is still borrowed, so no transition can land
    /// between the epoch check and the commit. `commit` must not touch the
    /// session.
    pub fn guard_and<T>(&self, epoch: u64, value: T, commit: impl FnOnce(&T)) -> Freshness<T> {
        let state = self.state.borrow();
        if state.epoch == epoch && state.is_connected() {
            commit(&value);
            Freshness::Current(value)
        } else {
            tracing::debug!("Discarding response for superseded session epoch {}", epoch);
            Freshness::Stale
        }
    }

    /// Enters `Connecting`. Without `force`, refuses when a sequence is
    /// already running; with it, the running sequence is superseded.
    fn begin(&self, force: bool) -> Option<u64> {
        let mut attempt = None;
        self.state.send_if_modified(|state| {
            if state.connection == ConnectionState::Connecting && !force {
                return false;
            }
            let epoch = state.epoch + 1;
            let account = state.account;
            *state = SessionState::disconnected(epoch);
            state.connection = ConnectionState::Connecting;
            state.account = account;
            attempt = Some(epoch);
            true
        });
        attempt
    }

    pub async fn connect(&self) -> Result<ConnectOutcome, BillingError> {
        let Some(attempt) = self.begin(false) else {
            tracing::debug!("Connect requested while another connect is running");
            return Ok(ConnectOutcome::InProgress);
        };
        self.run_attempt(attempt, None).await
    }

    async fn run_attempt(
        &self,
        attempt: u64,
        preferred: Option<Address>,
    ) -> Result<ConnectOutcome, BillingError> {
        match self.establish(attempt, preferred).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.fail(attempt, &err);
                Err(err)
            }
        }
    }

    /// Clears the signer, account and role. Wallet permissions are left alone.
    pub fn disconnect(&self) {
        self.state.send_modify(|state| {
            let epoch = state.epoch + 1;
            *state = SessionState::disconnected(epoch);
        });
        tracing::info!("Wallet session disconnected");
    }

    fn fail(&self, attempt: u64, err: &BillingError) {
        let recoverable = matches!(
            err,
            BillingError::NoAccountSelected
                | BillingError::WrongNetwork { .. }
                | BillingError::UserNotRegistered(_)
        );
        self.state.send_if_modified(|state| {
            if state.epoch != attempt {
                return false;
            }
            let epoch = state.epoch + 1;
            *state = SessionState::disconnected(epoch);
            if !recoverable {
                state.connection = ConnectionState::Error(err.user_message());
            }
            true
        });
        tracing::warn!("Wallet connection failed: {}", err);
    }

    async fn ensure_network(&self) -> Result<u64, BillingError> {
        let expected = self.network.chain_id;
        if let Err(err) = self.wallet.switch_chain(expected).await {
            if err.is_unrecognized_chain() {
                tracing::info!(
                    "Chain {} unknown to wallet, proposing {}",
                    expected,
                    self.network.name
                );
                if let Err(err) = self.wallet.add_chain(&self.network).await {
                    tracing::warn!("Adding network {} failed: {}", self.network.name, err);
                }
            } else {
                tracing::warn!("Switching to chain {} failed: {}", expected, err);
            }
        }

        let actual = self.wallet.chain_id().await?;
        if actual != expected {
            return Err(BillingError::WrongNetwork { expected, actual });
        }
        Ok(actual)
    }

    async fn select_account(&self, preferred: Option<Address>) -> Result<Address, BillingError> {
        let accounts = match self.wallet.request_accounts().await {
            Ok(accounts) => accounts,
            Err(err) if err.is_rejection() => {
                tracing::info!("Account access rejected: {}", err);
                return Err(BillingError::NoAccountSelected);
            }
            Err(err) => return Err(err.into()),
        };

        preferred
            .filter(|account| accounts.contains(account))
            .or_else(|| accounts.first().copied())
            .ok_or(BillingError::NoAccountSelected)
    }

    /// Registration reads that revert count as "not registered".
    async fn registered(
        contract: &dyn BillingContract,
        account: Address,
    ) -> Result<bool, BillingError> {
        match contract.is_user_registered(account).await {
            Ok(registered) => Ok(registered),
            Err(BillingError::ContractCallFailed(reason)) => {
                tracing::debug!(
                    "isUserRegistered({}) reverted, treating as unregistered: {}",
                    account,
                    reason
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn establish(
        &self,
        attempt: u64,
        preferred: Option<Address>,
    ) -> Result<ConnectOutcome, BillingError> {
        let chain_id = self.ensure_network().await?;
        let account = self.select_account(preferred).await?;
        let contract = self.wallet.signer(account)?;

        if !contract.is_deployed().await? {
            return Err(BillingError::ContractCallFailed(
                "No contract deployed at the configured address".to_string(),
            ));
        }

        let provider = contract.isp().await?;
        let mut provider_registration: Option<TxHash> = None;
        let role = if provider == account {
            if !Self::registered(contract.as_ref(), account).await? {
                tracing::info!("Provider {} not registered, registering", account);
                provider_registration = Some(contract.register_isp().await?);
            }
            Role::ServiceProvider
        } else {
            if !Self::registered(contract.as_ref(), account).await? {
                return Err(BillingError::UserNotRegistered(account.to_checksum(None)));
            }
            Role::RegularUser
        };

        let mut committed = None;
        self.state.send_if_modified(|state| {
            if state.epoch != attempt {
                return false;
            }
            let epoch = state.epoch + 1;
            state.connection = ConnectionState::Connected;
            state.account = Some(account);
            state.chain_id = Some(chain_id);
            state.role = Some(role);
            state.epoch = epoch;
            state.signer = Some(SignerHandle {
                account,
                chain_id,
                epoch,
                role,
                contract: contract.clone(),
            });
            committed = Some(epoch);
            true
        });

        let Some(epoch) = committed else {
            tracing::debug!("Connect attempt {} superseded before commit", attempt);
            return Ok(ConnectOutcome::Superseded);
        };
        tracing::info!("Wallet connected: {} as {:?} on chain {}", account, role, chain_id);

        let checksummed = account.to_checksum(None);
        let wallet_sync_error = match self.backend.update_wallet(&checksummed).await {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!("Backend wallet update failed for {}: {}", checksummed, err);
                Some(err.user_message())
            }
        };

        Ok(ConnectOutcome::Connected(ConnectedSession {
            account: checksummed,
            chain_id,
            role,
            epoch,
            provider_registration: provider_registration.map(|tx| format!("{:?}", tx)),
            wallet_sync_error,
        }))
    }

    fn has_session(&self) -> bool {
        let state = self.state.borrow();
        state.account.is_some() || state.connection != ConnectionState::Disconnected
    }

    /// Re-runs the full sequence; any failure leaves the session disconnected.
    async fn reestablish(&self, preferred: Option<Address>) {
        let Some(attempt) = self.begin(true) else {
            return;
        };
        match self.run_attempt(attempt, preferred).await {
            Ok(_) => {}
            Err(err) => {
                tracing::warn!("Re-establishing session failed, disconnecting: {}", err);
                self.disconnect();
            }
        }
    }

    pub async fn handle_event(&self, event: WalletEvent) {
        match event {
            WalletEvent::AccountsChanged(accounts) => {
                let Some(next) = accounts.first().copied() else {
                    tracing::info!("Wallet exposes no accounts");
                    self.disconnect();
                    return;
                };
                if !self.has_session() {
                    return;
                }
                let unchanged = {
                    let state = self.state.borrow();
                    state.account == Some(next) && state.is_connected()
                };
                if unchanged {
                    return;
                }
                tracing::info!("Account changed to {}", next);
                self.reestablish(Some(next)).await;
            }
            WalletEvent::ChainChanged(chain_id) => {
                if chain_id != self.network.chain_id {
                    tracing::warn!(
                        "Wallet moved to chain {}, expected {}",
                        chain_id,
                        self.network.chain_id
                    );
                    if self.has_session() {
                        self.disconnect();
                    }
                } else {
                    let active = {
                        let state = self.state.borrow();
                        state.is_connected().then_some(state.account).flatten()
                    };
                    if let Some(account) = active {
                        self.reestablish(Some(account)).await;
                    }
                }
            }
        }
    }

    /// Feeds wallet notifications into the session until the channel closes.
    pub fn run_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<WalletEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle_event(event).await;
            }
            tracing::debug!("Wallet event channel closed");
        })
    }
}
