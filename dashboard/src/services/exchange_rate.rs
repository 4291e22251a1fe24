//! Live ETH/KES spot price with a fixed fallback

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::ExchangeRate;

#[derive(Debug, Deserialize)]
struct SpotResponse {
    data: SpotPrice,
}

#[derive(Debug, Deserialize)]
struct SpotPrice {
    amount: String,
}

pub struct ExchangeRateProvider {
    client: Client,
    url: String,
    fallback: f64,
}

impl ExchangeRateProvider {
    pub fn new(url: &str, fallback: f64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: url.to_string(),
            fallback,
        }
    }

    /// One read of the price feed. Any failure yields the fallback rate;
    /// callers fetch once and hold the result.
    pub async fn get_rate(&self) -> ExchangeRate {
        match self.fetch().await {
            Ok(rate) => {
                tracing::info!("Exchange rate: 1 ETH = {:.2} KES", rate);
                ExchangeRate::live(rate)
            }
            Err(e) => {
                tracing::warn!(
                    "Exchange rate fetch failed, using fallback {}: {:#}",
                    self.fallback,
                    e
                );
                ExchangeRate::fallback(self.fallback)
            }
        }
    }

    async fn fetch(&self) -> Result<f64> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            bail!("price feed returned {}", response.status());
        }

        let spot: SpotResponse = response.json().await.context("malformed price payload")?;
        let rate: f64 = spot.data.amount.trim().parse().context("non-numeric price")?;
        if !rate.is_finite() || rate <= 0.0 {
            bail!("implausible price {}", rate);
        }
        Ok(rate)
    }
}
