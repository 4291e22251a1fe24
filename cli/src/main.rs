//! Command line client for the WiFi billing dashboard
//!
//! Drives the same library as the dashboard service: login with OTP,
//! wallet connect, usage, billing, plans, provider administration and
//! report export.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use wifi_billing::auth::{password_strength, Credentials, TokenStore};
use wifi_billing::models::{BackendRole, DurationClass, PlanDraft, UsageHistory};
use wifi_billing::refresh::load_all;
use wifi_billing::report::UsageSources;
use wifi_billing::session::ConnectOutcome;
use wifi_billing::window::WindowKind;
use wifi_billing::{Config, Services};

#[derive(Parser)]
#[command(name = "wifi-billing")]
#[command(about = "WiFi billing dashboard client")]
struct Cli {
    /// Access token from a previous login
    #[arg(long, env = "WIFI_BILLING_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with password and OTP, printing the access token
    Login {
        #[arg(short, long)]
        username: String,

        #[arg(short, long, default_value = "")]
        email: String,

        #[arg(long, env = "WIFI_BILLING_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Create a user account
    Register {
        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        email: String,

        /// Wallet address to bill
        #[arg(short, long)]
        wallet: String,

        #[arg(long, env = "WIFI_BILLING_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Rate a password without sending it anywhere
    Strength { password: String },

    /// Ask the provider to register a wallet on chain
    RequestRegistration { wallet: String },

    /// Connect the wallet and show the resolved role
    Connect,

    /// Current ETH/KES rate
    Rate,

    /// Usage history from the backend and, when connected, the contract
    Usage,

    /// Record usage in the backend and on chain
    LogUsage {
        /// Whole megabytes
        amount_mb: i64,
    },

    /// Amount owed according to the contract
    Bill,

    /// Pay for all recorded usage, minting tokens to cover any shortfall
    Pay,

    /// WiFiToken balance of the connected account
    Tokens,

    /// Mint WiFiTokens to the connected account
    Mint { amount: i64 },

    /// List plans
    Plans,

    /// Price a plan at the current rate
    Quote { plan_id: u64 },

    /// Buy a plan
    Purchase { plan_id: i64 },

    /// Plans bought by the connected account
    Purchased,

    /// Transactions, optionally limited to a window
    Transactions {
        #[arg(short, long)]
        window: Option<String>,
    },

    /// Export a report for a window (daily, weekly, monthly, yearly)
    Report {
        window: String,

        /// Output file; defaults to the generated file name
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Ask the provider for help
    Support { subject: String, message: String },

    /// Leave feedback
    Feedback { text: String },

    /// Provider administration
    #[command(subcommand)]
    Isp(IspCommands),
}

#[derive(Subcommand)]
enum IspCommands {
    /// Users with their on-chain billing status
    Subscribers,

    /// Registrations waiting for approval
    Pending,

    /// Approve a registration and register the wallet on chain
    Confirm { id: u64 },

    /// Reject a registration
    Reject { id: u64, reason: String },

    /// Record usage for a subscriber
    LogUsage {
        username: String,
        wallet: String,
        amount_mb: i64,
    },

    /// Usage across all subscribers
    Usage,

    /// Mint WiFiTokens to a subscriber's wallet
    Mint { wallet: String, amount: i64 },

    /// Create a plan
    AddPlan {
        name: String,
        duration: String,
        price_kes: f64,
        data_mb: i64,
    },

    /// Delete a plan
    RemovePlan { id: u64 },

    /// Help requests from all users
    HelpRequests,

    /// Reply to feedback
    Reply { id: u64, reply: String },
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn print_history(label: &str, history: &UsageHistory) {
    println!("{} ({} MB total)", label, history.total_mb);
    println!("{:<22} {:>12} {:>16}", "Timestamp", "Usage (MB)", "Cumulative (MB)");
    println!("{}", "-".repeat(52));
    for entry in &history.entries {
        println!("{:<22} {:>12} {:>16}", entry.timestamp, entry.amount_mb, entry.cumulative_mb);
    }
    println!();
}

async fn connect(services: &Services) -> Result<()> {
    match services.session.connect().await? {
        ConnectOutcome::Connected(session) => {
            println!(
                "Connected {} as {:?} on chain {}",
                session.account, session.role, session.chain_id
            );
            if let Some(tx) = session.provider_registration {
                println!("  Provider registered on chain: {}", tx);
            }
            if let Some(err) = session.wallet_sync_error {
                println!("  Warning: wallet address not saved in backend: {}", err);
            }
            Ok(())
        }
        ConnectOutcome::InProgress | ConnectOutcome::Superseded => {
            bail!("Wallet connection did not complete")
        }
    }
}

/// Restores the session token, asking the backend which role it carries.
async fn restore_token(services: &Services, token: Option<String>) -> Result<()> {
    let Some(token) = token else {
        return Ok(());
    };
    services.tokens.set(Credentials { token: token.clone(), role: BackendRole::User });
    let role = services.auth.verify_token().await.context("Stored token rejected")?;
    services.tokens.set(Credentials { token, role });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load()?;
    let (services, _events) = Services::from_config(config, TokenStore::new())?;
    restore_token(&services, cli.token).await?;

    match cli.command {
        Commands::Login { username, email, password } => {
            let role = services.auth.login(&username, &password, &email).await?;
            println!("Password accepted ({}). An OTP was sent to your email.", role.as_str());
            let otp = prompt("OTP")?;
            let credentials = services.auth.verify_otp(&otp).await?;
            println!("Logged in as {}.", credentials.role.as_str());
            println!("export WIFI_BILLING_TOKEN={}", credentials.token);
        }

        Commands::Register { username, email, wallet, password } => {
            services.auth.register(&username, &password, &email, &wallet).await?;
            println!("Registered {}. Log in to continue.", username);
        }

        Commands::Strength { password } => {
            println!("{:?}", password_strength(&password));
        }

        Commands::RequestRegistration { wallet } => {
            services.auth.request_registration(&wallet).await?;
            println!("Registration requested for {}", wallet);
        }

        Commands::Connect => connect(&services).await?,

        Commands::Rate => {
            let rate = services.rate().await;
            println!("1 ETH = {:.2} KES ({:?})", rate.fiat_per_native, rate.source);
        }

        Commands::Usage => {
            print_history("Off-chain usage", &services.usage.load_from_backend().await?);
            connect(&services).await?;
            let signer = services.session.signer()?;
            let fresh = services.usage.load_from_contract(signer.account).await?;
            if let Some(history) = fresh.current() {
                print_history("On-chain usage", &history);
            }
        }

        Commands::LogUsage { amount_mb } => {
            if let Err(err) = connect(&services).await {
                println!("Wallet not connected ({}); recording in backend only", err);
            }
            let recorded = services.usage.record_usage(amount_mb).await?;
            println!("Recorded {} MB", recorded.amount_mb);
            if let Some(tx) = recorded.on_chain_tx {
                println!("  On chain: {}", tx);
            }
        }

        Commands::Bill => {
            connect(&services).await?;
            let signer = services.session.signer()?;
            let rate = services.rate().await;
            let bill = services.usage.billing_snapshot(signer.account, &rate).await?;
            println!("Account:     {}", bill.account);
            println!("Usage:       {} MB", bill.total_usage_mb);
            println!("Cost:        {:.6} ETH", bill.total_cost_native);
            println!("Cost (KES):  {:.2}", bill.total_cost_fiat);
        }

        Commands::Pay => {
            connect(&services).await?;
            let signer = services.session.signer()?;
            let rate = services.rate().await;
            let bill = services.usage.billing_snapshot(signer.account, &rate).await?;
            let receipt = services.usage.make_payment(&bill).await?;
            if let Some(minted) = &receipt.minted_tokens {
                println!("Minted {} tokens to cover the payment", minted);
            }
            println!(
                "Paid {} tokens for {} MB: {}",
                receipt.cost_tokens, receipt.paid_mb, receipt.tx_hash
            );
        }

        Commands::Tokens => {
            connect(&services).await?;
            let signer = services.session.signer()?;
            let balance = services.usage.token_balance(signer.account).await?;
            println!("{}: {} WiFiTokens", signer.account, balance);
        }

        Commands::Mint { amount } => {
            connect(&services).await?;
            let tx = services.usage.mint_tokens(amount).await?;
            println!("Minted {} WiFiTokens: {}", amount, tx);
        }

        Commands::Plans => {
            if let Err(err) = connect(&services).await {
                tracing::debug!("Listing plans without wallet: {}", err);
            }
            let listing = services.plans.list().await?;
            println!(
                "{:<6} {:<24} {:<10} {:>10} {:>10} {:<10}",
                "ID", "Name", "Duration", "KES", "MB", "On chain"
            );
            println!("{}", "-".repeat(76));
            for listed in listing.plans {
                let on_chain = match listed.active_on_chain {
                    Some(true) => "active",
                    Some(false) => "inactive",
                    None => "-",
                };
                println!(
                    "{:<6} {:<24} {:<10} {:>10.2} {:>10} {:<10}",
                    listed.plan.id,
                    listed.plan.name,
                    format!("{:?}", listed.plan.duration_class).to_lowercase(),
                    listed.plan.price_fiat,
                    listed.plan.data_mb,
                    on_chain
                );
            }
            if let Some(warning) = listing.warning {
                println!("\nWarning: {}", warning);
            }
        }

        Commands::Quote { plan_id } => {
            let listing = services.plans.list().await?;
            let plan = listing
                .plans
                .into_iter()
                .find(|listed| listed.plan.id == plan_id)
                .with_context(|| format!("Plan {} not found", plan_id))?;
            let quote = wifi_billing::plans::quote(&plan.plan, &services.rate().await)?;
            println!(
                "Plan {}: {:.2} KES = {:.6} ETH ({} wei)",
                quote.plan_id, quote.price_fiat, quote.price_native, quote.price_wei
            );
        }

        Commands::Purchase { plan_id } => {
            connect(&services).await?;
            let rate = services.rate().await;
            let receipt = services.plans.purchase(plan_id, &rate).await?;
            println!(
                "Purchased plan {} for {:.6} ETH: {}",
                receipt.quote.plan_id, receipt.quote.price_native, receipt.tx_hash
            );
        }

        Commands::Purchased => {
            connect(&services).await?;
            for plan in services.plans.purchased_plans().await? {
                println!(
                    "{:<6} {:<24} {:<10} {:>10.2} KES  {}",
                    plan.id, plan.name, plan.duration, plan.price_fiat, plan.purchased_at
                );
            }
        }

        Commands::Transactions { window } => {
            connect(&services).await?;
            let rate = services.rate().await;
            let Some(mut ledger) = services.ledger.load(&rate).await?.current() else {
                bail!("Session changed while loading transactions");
            };
            if let Some(window) = window {
                let window: WindowKind = window.parse().map_err(anyhow::Error::msg)?;
                let policy = services.config.report.unparsable_timestamps;
                ledger = ledger.filtered(window, chrono::Utc::now(), policy);
            }
            println!(
                "{:<12} {:<44} {:>12} {:>12} {:<10} {:<20}",
                "ID", "Account", "ETH", "KES", "Status", "Timestamp"
            );
            println!("{}", "-".repeat(116));
            for tx in ledger.all() {
                println!(
                    "{:<12} {:<44} {:>12.6} {:>12.2} {:<10} {:<20}",
                    tx.id,
                    tx.username.as_deref().unwrap_or(&tx.account),
                    tx.amount_native,
                    tx.amount_fiat,
                    format!("{:?}", tx.status),
                    tx.timestamp
                );
            }
        }

        Commands::Report { window, out } => {
            let window: WindowKind = window.parse().map_err(anyhow::Error::msg)?;
            if let Err(err) = connect(&services).await {
                println!("Wallet not connected ({}); report covers backend data only", err);
            }
            let rate = services.rate().await;
            let data = load_all(&services, &rate).await;

            let off_chain = match &data.usage {
                Ok(history) => history.entries.as_slice(),
                Err(err) => bail!("Usage unavailable: {}", err.user_message()),
            };
            let on_chain = match &data.on_chain_usage {
                Some(Ok(history)) => Some(history.entries.as_slice()),
                _ => None,
            };
            let transactions = match &data.transactions {
                Some(Ok(ledger)) => ledger.all(),
                _ => Vec::new(),
            };

            let usage = UsageSources { off_chain, on_chain };
            let document =
                services.reports.export(usage, &transactions, window, chrono::Utc::now());
            let path = out.unwrap_or_else(|| PathBuf::from(&document.filename));
            std::fs::write(&path, document.to_bytes())
                .with_context(|| format!("Writing {}", path.display()))?;
            println!(
                "Wrote {} ({} pages, SHA-256 {})",
                path.display(),
                document.page_count(),
                document.fingerprint
            );
        }

        Commands::Support { subject, message } => {
            services.support.submit_help(&subject, &message).await?;
            println!("Help request sent.");
        }

        Commands::Feedback { text } => {
            services.support.submit_feedback(&text).await?;
            println!("Thanks for the feedback.");
        }

        Commands::Isp(command) => run_isp(&services, command).await?,
    }

    Ok(())
}

async fn run_isp(services: &Services, command: IspCommands) -> Result<()> {
    match command {
        IspCommands::Subscribers => {
            if let Err(err) = connect(services).await {
                println!("Wallet not connected ({}); on-chain status unavailable", err);
            }
            let rate = services.rate().await;
            println!(
                "{:<16} {:<44} {:<16} {:>10} {:>12} {:>12}",
                "User", "Wallet", "Status", "MB", "KES", "Tokens"
            );
            println!("{}", "-".repeat(115));
            for subscriber in services.isp.subscribers(&rate).await? {
                let dash = || "-".to_string();
                println!(
                    "{:<16} {:<44} {:<16} {:>10} {:>12} {:>12}",
                    subscriber.user.username,
                    subscriber.user.wallet_address.as_deref().unwrap_or("-"),
                    format!("{:?}", subscriber.status),
                    subscriber.total_usage_mb.map(|mb| mb.to_string()).unwrap_or_else(dash),
                    subscriber
                        .total_cost_fiat
                        .map(|kes| format!("{:.2}", kes))
                        .unwrap_or_else(dash),
                    subscriber.token_balance.unwrap_or_else(dash),
                );
            }
        }

        IspCommands::Pending => {
            for request in services.isp.pending_registrations().await? {
                println!("{:<6} {:<16} {}", request.id, request.username, request.wallet_address);
            }
        }

        IspCommands::Confirm { id } => {
            connect(services).await?;
            let request = services
                .isp
                .pending_registrations()
                .await?
                .into_iter()
                .find(|r| r.id == id)
                .with_context(|| format!("No pending registration {}", id))?;
            let tx = services.isp.confirm_registration(&request).await?;
            println!("Registered {} on chain: {}", request.username, tx);
        }

        IspCommands::Reject { id, reason } => {
            services.isp.reject_registration(id, &reason).await?;
            println!("Rejected registration {}", id);
        }

        IspCommands::LogUsage { username, wallet, amount_mb } => {
            connect(services).await?;
            let recorded = services.isp.log_usage_for(&username, &wallet, amount_mb).await?;
            println!("Logged {} MB for {}", recorded.amount_mb, username);
        }

        IspCommands::Mint { wallet, amount } => {
            connect(services).await?;
            let tx = services.isp.mint_for(&wallet, amount).await?;
            println!("Minted {} WiFiTokens to {}: {}", amount, wallet, tx);
        }

        IspCommands::Usage => {
            print_history("All subscribers", &services.isp.aggregate_usage().await?)
        }

        IspCommands::AddPlan { name, duration, price_kes, data_mb } => {
            let duration: DurationClass = duration.parse().map_err(anyhow::Error::msg)?;
            let draft = PlanDraft { name, duration, price_kes, data_mb };
            services.plans.create(&draft).await?;
            println!("Created plan {}", draft.name);
        }

        IspCommands::RemovePlan { id } => {
            services.plans.delete(id).await?;
            println!("Deleted plan {}", id);
        }

        IspCommands::HelpRequests => {
            for ticket in services.support.help_requests().await? {
                println!(
                    "#{} {} [{}]: {}",
                    ticket.id,
                    ticket.subject,
                    ticket.username.as_deref().unwrap_or("unknown"),
                    ticket.message
                );
            }
        }

        IspCommands::Reply { id, reply } => {
            services.support.reply_feedback(id, &reply).await?;
            println!("Replied to feedback {}", id);
        }
    }
    Ok(())
}
