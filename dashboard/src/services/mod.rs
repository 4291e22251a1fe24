//! Clients for the collaborators: billing backend, billing contract, wallet
//! and the price feed.

pub mod backend;
pub mod contract;
pub mod exchange_rate;
pub mod wallet;
