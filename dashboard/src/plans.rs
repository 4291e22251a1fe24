//! WiFi plan catalog, quotes and purchases

use serde::Serialize;
use std::sync::Arc;

use crate::auth::TokenStore;
use crate::error::BillingError;
use crate::models::{BackendRole, ExchangeRate, PlanDraft, PlanQuote, PlanRecord, PurchasedPlan};
use crate::services::backend::Backend;
use crate::services::contract::OnChainPlan;
use crate::session::WalletSession;
use crate::usage::native_to_wei;
use crate::window::from_unix_seconds;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListedPlan {
    #[serde(flatten)]
    pub plan: PlanRecord,
    /// `None` when the contract was not consulted.
    pub active_on_chain: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanListing {
    pub plans: Vec<ListedPlan>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanPurchaseReceipt {
    pub quote: PlanQuote,
    pub tx_hash: String,
}

/// Price of `plan` at `rate`. Recomputed on every call.
pub fn quote(plan: &PlanRecord, rate: &ExchangeRate) -> Result<PlanQuote, BillingError> {
    let price_native = rate.to_native(plan.price_fiat);
    let price_wei = native_to_wei(price_native)?;
    Ok(PlanQuote {
        plan_id: plan.id,
        price_fiat: plan.price_fiat,
        price_native,
        price_wei: price_wei.to_string(),
        rate: *rate,
    })
}

pub fn validate_draft(draft: &PlanDraft) -> Result<(), BillingError> {
    if draft.name.trim().is_empty() {
        return Err(BillingError::validation("Plan name is required"));
    }
    if draft.data_mb <= 0 {
        return Err(BillingError::validation("Data (MB) must be a positive integer"));
    }
    if !draft.price_kes.is_finite() || draft.price_kes <= 0.0 {
        return Err(BillingError::validation("Price must be a positive number"));
    }
    Ok(())
}

fn purchased_from_chain(plan: OnChainPlan) -> PurchasedPlan {
    let (purchased_at, _) = from_unix_seconds(plan.purchase_date);
    PurchasedPlan {
        id: plan.id,
        name: plan.name,
        duration: plan.duration,
        price_fiat: plan.price_fiat as f64,
        data_mb: plan.data_mb,
        purchased_at,
    }
}

pub struct PlanCatalog {
    backend: Arc<dyn Backend>,
    session: Arc<WalletSession>,
    tokens: TokenStore,
}

impl PlanCatalog {
    pub fn new(backend: Arc<dyn Backend>, session: Arc<WalletSession>, tokens: TokenStore) -> Self {
        Self {
            backend,
            session,
            tokens,
        }
    }

    fn require_provider(&self) -> Result<(), BillingError> {
        match self.tokens.role() {
            Some(BackendRole::WifiProvider) => Ok(()),
            Some(BackendRole::User) => {
                Err(BillingError::validation("Only the WiFi provider can manage plans"))
            }
            None => Err(BillingError::AuthenticationExpired(
                "No authentication token found. Please log in again.".to_string(),
            )),
        }
    }

    /// Backend plans, cross-checked against the contract's active plans
    /// when a session is connected.
    pub async fn list(&self) -> Result<PlanListing, BillingError> {
        let plans = self.backend.plans().await?;

        let Ok(signer) = self.session.signer() else {
            return Ok(PlanListing {
                plans: plans
                    .into_iter()
                    .map(|plan| ListedPlan { plan, active_on_chain: None })
                    .collect(),
                warning: None,
            });
        };

        match signer.contract.get_active_plans().await {
            Ok(active) => Ok(PlanListing {
                plans: plans
                    .into_iter()
                    .map(|plan| {
                        let on_chain = active.iter().any(|a| a.id == plan.id && a.active);
                        ListedPlan {
                            plan,
                            active_on_chain: Some(on_chain),
                        }
                    })
                    .collect(),
                warning: None,
            }),
            Err(err) => {
                tracing::warn!("Active plan cross-check failed: {}", err);
                Ok(PlanListing {
                    plans: plans
                        .into_iter()
                        .map(|plan| ListedPlan { plan, active_on_chain: None })
                        .collect(),
                    warning: Some(format!(
                        "Could not verify plans on chain: {}",
                        err.user_message()
                    )),
                })
            }
        }
    }

    pub async fn create(&self, draft: &PlanDraft) -> Result<(), BillingError> {
        self.require_provider()?;
        validate_draft(draft)?;
        self.backend.create_plan(draft).await?;
        tracing::info!("Plan '{}' created", draft.name);
        Ok(())
    }

    pub async fn update(&self, plan_id: u64, draft: &PlanDraft) -> Result<(), BillingError> {
        self.require_provider()?;
        if plan_id == 0 {
            return Err(BillingError::validation("Invalid plan id"));
        }
        validate_draft(draft)?;
        self.backend.update_plan(plan_id, draft).await?;
        tracing::info!("Plan {} updated", plan_id);
        Ok(())
    }

    pub async fn delete(&self, plan_id: u64) -> Result<(), BillingError> {
        self.require_provider()?;
        if plan_id == 0 {
            return Err(BillingError::validation("Invalid plan id"));
        }
        self.backend.delete_plan(plan_id).await?;
        tracing::info!("Plan {} deleted", plan_id);
        Ok(())
    }

    /// Pays for a plan through the payable `purchasePlan` call. The plan
    /// must exist in the backend catalog and be active on chain.
    pub async fn purchase(
        &self,
        plan_id: i64,
        rate: &ExchangeRate,
    ) -> Result<PlanPurchaseReceipt, BillingError> {
        let plan_id = u64::try_from(plan_id)
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| BillingError::validation("Invalid plan id"))?;
        let signer = self.session.signer()?;

        let active = signer.contract.get_active_plans().await?;
        if !active.iter().any(|p| p.id == plan_id && p.active) {
            return Err(BillingError::validation(format!("Plan {} is not active", plan_id)));
        }

        let plan = self
            .backend
            .plans()
            .await?
            .into_iter()
            .find(|p| p.id == plan_id)
            .ok_or_else(|| BillingError::validation(format!("Plan {} not found", plan_id)))?;

        let quote = quote(&plan, rate)?;
        let price_wei = native_to_wei(quote.price_native)?;
        let tx = signer.contract.purchase_plan(plan_id, price_wei).await?;
        tracing::info!(
            "Plan {} purchased by {} for {} wei",
            plan_id,
            signer.account,
            quote.price_wei
        );

        Ok(PlanPurchaseReceipt {
            quote,
            tx_hash: format!("{:?}", tx),
        })
    }

    pub async fn purchased_plans(&self) -> Result<Vec<PurchasedPlan>, BillingError> {
        let signer = self.session.signer()?;
        let plans = signer.contract.get_purchased_plans(signer.account).await?;
        Ok(plans.into_iter().map(purchased_from_chain).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DurationClass;

    fn plan(price: f64) -> PlanRecord {
        PlanRecord {
            id: 1,
            name: "Daily 1GB".into(),
            duration_class: DurationClass::Daily,
            price_fiat: price,
            data_mb: 1024,
        }
    }

    #[test]
    fn quote_is_idempotent() {
        let rate = ExchangeRate::live(250_000.0);
        let first = quote(&plan(500.0), &rate).unwrap();
        let second = quote(&plan(500.0), &rate).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.price_native, 0.002);
        assert_eq!(first.price_wei, "2000000000000000");
    }

    #[test]
    fn quote_follows_rate() {
        let cheap = quote(&plan(500.0), &ExchangeRate::live(500_000.0)).unwrap();
        assert_eq!(cheap.price_native, 0.001);
    }

    #[test]
    fn draft_validation() {
        let mut draft = PlanDraft {
            name: "Weekly".into(),
            duration: DurationClass::Weekly,
            price_kes: 300.0,
            data_mb: 5000,
        };
        assert!(validate_draft(&draft).is_ok());

        draft.data_mb = 0;
        assert!(validate_draft(&draft).is_err());

        draft.data_mb = 10;
        draft.price_kes = -1.0;
        assert!(validate_draft(&draft).is_err());
    }
}
