//! Dashboard refresh: one concurrent "load all" cycle and the poller that
//! repeats it

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::app::Services;
use crate::auth::TokenStore;
use crate::error::BillingError;
use crate::isp::Subscriber;
use crate::ledger::LedgerReport;
use crate::models::{BackendRole, ExchangeRate, PendingRegistration, UsageHistory};
use crate::plans::PlanListing;
use crate::session::Freshness;

/// Outcome of one sub-fetch. Failures stay local to their field.
pub type Fetched<T> = Result<T, BillingError>;

/// Everything one refresh cycle produced. `None` marks a fetch that does
/// not apply to the role, or whose response belonged to a superseded session.
#[derive(Debug, Clone)]
pub struct DashboardData {
    pub role: Option<BackendRole>,
    pub rate: ExchangeRate,
    pub loaded_at: DateTime<Utc>,
    pub subscribers: Option<Fetched<Vec<Subscriber>>>,
    pub transactions: Option<Fetched<LedgerReport>>,
    pub usage: Fetched<UsageHistory>,
    pub on_chain_usage: Option<Fetched<UsageHistory>>,
    pub plans: Fetched<PlanListing>,
    pub pending_registrations: Option<Fetched<Vec<PendingRegistration>>>,
    /// Provider only: the backend purchase list failed while the on-chain
    /// side of `transactions` still loaded.
    pub purchases_error: Option<BillingError>,
}

impl DashboardData {
    pub fn errors(&self) -> Vec<&BillingError> {
        let mut errors = Vec::new();
        if let Some(Err(e)) = &self.subscribers {
            errors.push(e);
        }
        if let Some(Err(e)) = &self.transactions {
            errors.push(e);
        }
        if let Err(e) = &self.usage {
            errors.push(e);
        }
        if let Some(Err(e)) = &self.on_chain_usage {
            errors.push(e);
        }
        if let Err(e) = &self.plans {
            errors.push(e);
        }
        if let Some(Err(e)) = &self.pending_registrations {
            errors.push(e);
        }
        if let Some(e) = &self.purchases_error {
            errors.push(e);
        }
        errors
    }

    /// Any sub-fetch found the session gone.
    pub fn requires_login(&self) -> bool {
        self.errors().iter().any(|e| e.requires_login())
    }
}

fn fresh<T>(result: Result<Freshness<T>, BillingError>) -> Option<Fetched<T>> {
    match result {
        Ok(Freshness::Current(value)) => Some(Ok(value)),
        Ok(Freshness::Stale) => None,
        Err(err) => Some(Err(err)),
    }
}

/// Issues every fetch for the logged-in role at once and joins them.
pub async fn load_all(services: &Services, rate: &ExchangeRate) -> DashboardData {
    let role = services.tokens.role();
    let loaded_at = Utc::now();

    if role == Some(BackendRole::WifiProvider) {
        let (subscribers, purchases, usage, plans, pending) = tokio::join!(
            services.isp.subscribers(rate),
            services.ledger.load_backend_purchases(rate),
            services.isp.aggregate_usage(),
            services.plans.list(),
            services.isp.pending_registrations(),
        );

        let (backend, purchases_error) = match purchases {
            Ok(backend) => (backend, None),
            Err(err) => {
                tracing::warn!("Backend purchases unavailable: {}", err);
                (Vec::new(), Some(err))
            }
        };
        let on_chain = match &subscribers {
            Ok(subscribers) => match services.isp.all_transactions(subscribers, rate).await {
                Ok(records) => records,
                Err(err) => {
                    tracing::debug!("On-chain transactions skipped: {}", err);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        return DashboardData {
            role,
            rate: *rate,
            loaded_at,
            subscribers: Some(subscribers),
            transactions: Some(Ok(LedgerReport { backend, on_chain })),
            usage,
            on_chain_usage: None,
            plans,
            pending_registrations: Some(pending),
            purchases_error,
        };
    }

    let signer = services.session.signer().ok();
    let (usage, plans, on_chain_usage, transactions) = tokio::join!(
        services.usage.load_from_backend(),
        services.plans.list(),
        async {
            match &signer {
                Some(signer) => fresh(services.usage.load_from_contract(signer.account).await),
                None => None,
            }
        },
        async {
            match &signer {
                Some(_) => fresh(services.ledger.load(rate).await),
                None => None,
            }
        },
    );

    DashboardData {
        role,
        rate: *rate,
        loaded_at,
        subscribers: None,
        transactions,
        usage,
        on_chain_usage,
        plans,
        pending_registrations: None,
        purchases_error: None,
    }
}

/// Repeats a load on a fixed period. Stops when dropped, or at the first
/// tick that finds no authentication token.
pub struct Poller {
    handle: JoinHandle<()>,
}

impl Poller {
    pub fn spawn<T, F, Fut>(
        tokens: TokenStore,
        period: Duration,
        mut load: F,
    ) -> (Self, watch::Receiver<Option<Arc<T>>>)
    where
        T: Send + Sync + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !tokens.is_authenticated() {
                    tracing::info!("No authentication token, stopping refresh");
                    break;
                }
                let value = load().await;
                if tx.send(Some(Arc::new(value))).is_err() {
                    tracing::debug!("Refresh has no listeners, stopping");
                    break;
                }
            }
        });

        (Self { handle }, rx)
    }

    /// Polls [`load_all`] with the services' held exchange rate.
    pub fn dashboard(
        services: Arc<Services>,
        period: Duration,
    ) -> (Self, watch::Receiver<Option<Arc<DashboardData>>>) {
        let tokens = services.tokens.clone();
        Self::spawn(tokens, period, move || {
            let services = services.clone();
            async move {
                let rate = services.rate().await;
                load_all(&services, &rate).await
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
