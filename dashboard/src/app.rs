//! Wiring of the views over one backend, one wallet session and one rate

use alloy::primitives::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};

use crate::auth::{AuthClient, TokenStore};
use crate::config::Config;
use crate::error::BillingError;
use crate::isp::IspConsole;
use crate::ledger::TransactionLedgerView;
use crate::models::ExchangeRate;
use crate::plans::PlanCatalog;
use crate::report::ReportExporter;
use crate::services::backend::{Backend, HttpBackend};
use crate::services::exchange_rate::ExchangeRateProvider;
use crate::services::wallet::{LocalWallet, WalletEvent, WalletProvider};
use crate::session::WalletSession;
use crate::support::SupportDesk;
use crate::usage::UsageReconciler;

pub struct Services {
    pub config: Config,
    pub tokens: TokenStore,
    pub auth: AuthClient,
    pub support: SupportDesk,
    pub session: Arc<WalletSession>,
    pub usage: UsageReconciler,
    pub ledger: TransactionLedgerView,
    pub plans: PlanCatalog,
    pub isp: IspConsole,
    pub reports: ReportExporter,
    /// Set when the wallet is the built-in key wallet.
    pub local_wallet: Option<Arc<LocalWallet>>,
    rates: ExchangeRateProvider,
    rate: OnceCell<ExchangeRate>,
}

impl Services {
    /// Assembles the views. `backend` is usually `http` itself.
    pub fn assemble(
        config: Config,
        http: HttpBackend,
        backend: Arc<dyn Backend>,
        wallet: Arc<dyn WalletProvider>,
    ) -> Result<Self, BillingError> {
        let tokens = http.tokens().clone();
        let session = Arc::new(WalletSession::new(wallet, backend.clone(), config.network()));
        let reports = ReportExporter::new(
            config.report.rows_per_page,
            config.report.unparsable_timestamps,
        )?;
        let rates = ExchangeRateProvider::new(&config.exchange_rate_url, config.fallback_rate);

        Ok(Self {
            auth: AuthClient::new(http.clone()),
            support: SupportDesk::new(http),
            usage: UsageReconciler::new(backend.clone(), session.clone()),
            ledger: TransactionLedgerView::new(backend.clone(), session.clone(), tokens.clone()),
            plans: PlanCatalog::new(backend.clone(), session.clone(), tokens.clone()),
            isp: IspConsole::new(backend, session.clone()),
            session,
            reports,
            local_wallet: None,
            rates,
            rate: OnceCell::new(),
            tokens,
            config,
        })
    }

    /// Real collaborators from configuration: HTTP backend and a local
    /// wallet over the configured keys.
    pub fn from_config(
        config: Config,
        tokens: TokenStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WalletEvent>), BillingError> {
        let contract: Address = config
            .contract_address
            .parse()
            .map_err(|_| BillingError::validation("Invalid contract address"))?;

        let http = HttpBackend::new(
            &config.backend_url,
            tokens,
            Duration::from_secs(config.login_timeout_secs),
        )?;
        let (wallet, events) = LocalWallet::new(&config.wallet_keys, &config.rpc_url, contract)?;

        let wallet = Arc::new(wallet);

        let backend: Arc<dyn Backend> = Arc::new(http.clone());
        let mut services = Self::assemble(config, http, backend, wallet.clone())?;
        services.local_wallet = Some(wallet);
        Ok((services, events))
    }

    /// Exchange rate, fetched on first use and held afterwards.
    pub async fn rate(&self) -> ExchangeRate {
        *self.rate.get_or_init(|| self.rates.get_rate()).await
    }
}
