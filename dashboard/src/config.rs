//! Configuration management

use anyhow::{ensure, Context, Result};
use config::{Config as ConfigFile, Environment, File};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::report::MIN_ROWS_PER_PAGE;
use crate::services::wallet::NetworkParams;
use crate::window::UnparsablePolicy;

pub const DEFAULT_EXCHANGE_RATE_URL: &str = "https://api.coinbase.com/v2/prices/ETH-KES/spot";
pub const DEFAULT_FALLBACK_RATE: f64 = 247_789.20;

#[derive(Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub chain_id: u64,
    pub network_name: String,
    pub rpc_url: String,
    pub contract_address: String,
    pub backend_url: String,
    pub exchange_rate_url: String,
    pub fallback_rate: f64,
    pub login_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Hex private keys for the local wallet; the first one is selected.
    #[serde(default)]
    pub wallet_keys: Vec<String>,
    pub report: ReportConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReportConfig {
    pub rows_per_page: usize,
    pub unparsable_timestamps: UnparsablePolicy,
}

impl Config {
    /// Layered load: `default.toml`, `{RUN_MODE}.toml`, `local.toml`, then
    /// `WIFI_BILLING__*` environment variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = PathBuf::from("./config");
                if !path.exists() {
                    path = PathBuf::from("../config");
                }
                path
            });

        tracing::debug!("Loading configuration from {} ({})", config_dir.display(), run_mode);

        let config: Config = ConfigFile::builder()
            .set_default("port", 8080)?
            .set_default("chain_id", 1337)?
            .set_default("network_name", "Ganache")?
            .set_default("rpc_url", "http://127.0.0.1:7545")?
            .set_default("contract_address", "0x609E600Ff6d549685b8E5B71d20616390A5B5e0D")?
            .set_default("backend_url", "http://127.0.0.1:8000")?
            .set_default("exchange_rate_url", DEFAULT_EXCHANGE_RATE_URL)?
            .set_default("fallback_rate", DEFAULT_FALLBACK_RATE)?
            .set_default("login_timeout_secs", 20)?
            .set_default("poll_interval_secs", 10)?
            .set_default("report.rows_per_page", 40)?
            .set_default("report.unparsable_timestamps", "treat_as_now")?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", run_mode))).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("WIFI_BILLING")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("wallet_keys"),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.contract_address
            .parse::<alloy::primitives::Address>()
            .context("Invalid contract_address")?;
        self.rpc_url
            .parse::<alloy::transports::http::reqwest::Url>()
            .context("Invalid rpc_url")?;
        self.backend_url
            .parse::<reqwest::Url>()
            .context("Invalid backend_url")?;
        ensure!(
            self.fallback_rate.is_finite() && self.fallback_rate > 0.0,
            "fallback_rate must be a positive number"
        );
        ensure!(self.poll_interval_secs > 0, "poll_interval_secs must be positive");
        ensure!(
            self.report.rows_per_page >= MIN_ROWS_PER_PAGE,
            "report.rows_per_page must be at least {}",
            MIN_ROWS_PER_PAGE
        );
        Ok(())
    }

    pub fn network(&self) -> NetworkParams {
        NetworkParams {
            chain_id: self.chain_id,
            name: self.network_name.clone(),
            rpc_url: self.rpc_url.clone(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("contract_address", &self.contract_address)
            .field("backend_url", &self.backend_url)
            .field("exchange_rate_url", &self.exchange_rate_url)
            .field("fallback_rate", &self.fallback_rate)
            .field("wallet_keys", &format_args!("[{} redacted]", self.wallet_keys.len()))
            .field("report", &self.report)
            .finish()
    }
}
