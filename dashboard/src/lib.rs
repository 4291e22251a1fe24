//! WiFi billing dashboard core
//!
//! Wallet session handling, reconciliation of the backend and on-chain usage
//! ledgers, transaction views and windowed report export, plus the HTTP
//! service that exposes them.

pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod isp;
pub mod ledger;
pub mod models;
pub mod plans;
pub mod refresh;
pub mod report;
pub mod services;
pub mod session;
pub mod support;
pub mod usage;
pub mod window;

pub use app::Services;
pub use config::Config;
pub use error::BillingError;
