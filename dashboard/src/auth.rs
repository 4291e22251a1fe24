//! Login, OTP verification and the in-memory token store

use alloy::primitives::Address;
use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::error::BillingError;
use crate::models::{BackendRole, LoginRequest, RegisterRequest};
use crate::services::backend::HttpBackend;
use crate::session::WalletSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub role: BackendRole,
}

#[derive(Debug, Default)]
struct TokenState {
    access: Option<Credentials>,
    /// Temporary token between password login and OTP verification.
    pending_otp: Option<String>,
}

/// Token and role for the lifetime of the process. Nothing is written to disk.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    inner: Arc<RwLock<TokenState>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(token: impl Into<String>, role: BackendRole) -> Self {
        let store = Self::new();
        store.set(Credentials { token: token.into(), role });
        store
    }

    fn read<R>(&self, f: impl FnOnce(&TokenState) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut TokenState) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn set(&self, credentials: Credentials) {
        self.write(|state| {
            state.access = Some(credentials);
            state.pending_otp = None;
        });
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.read(|state| state.access.clone())
    }

    pub fn bearer(&self) -> Option<String> {
        self.read(|state| state.access.as_ref().map(|c| c.token.clone()))
    }

    pub fn role(&self) -> Option<BackendRole> {
        self.read(|state| state.access.as_ref().map(|c| c.role))
    }

    pub fn is_authenticated(&self) -> bool {
        self.read(|state| state.access.is_some())
    }

    pub fn clear(&self) {
        self.write(|state| *state = TokenState::default());
    }

    fn set_pending(&self, temp_token: String) {
        self.write(|state| state.pending_otp = Some(temp_token));
    }

    fn pending(&self) -> Option<String> {
        self.read(|state| state.pending_otp.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PasswordStrength {
    Weak,
    Moderate,
    Strong,
}

const SPECIAL_CHARS: &str = "!@#$%^&*(),.?\":{}|<>";

pub fn password_strength(password: &str) -> PasswordStrength {
    let criteria = [
        password.chars().count() >= 8,
        password.chars().any(|c| c.is_ascii_uppercase()),
        password.chars().any(|c| c.is_ascii_lowercase()),
        password.chars().any(|c| c.is_ascii_digit()),
        password.chars().any(|c| SPECIAL_CHARS.contains(c)),
    ];

    match criteria.iter().filter(|met| **met).count() {
        0 | 1 => PasswordStrength::Weak,
        2 | 3 => PasswordStrength::Moderate,
        _ => PasswordStrength::Strong,
    }
}

fn require_strong(password: &str) -> Result<(), BillingError> {
    match password_strength(password) {
        PasswordStrength::Strong => Ok(()),
        other => Err(BillingError::validation(format!(
            "Password strength is {:?}; use at least 8 characters mixing upper and lower case, \
             digits and symbols",
            other
        ))),
    }
}

fn parse_role(label: &str) -> Result<BackendRole, BillingError> {
    BackendRole::from_label(label)
        .ok_or_else(|| BillingError::validation(format!("Unknown role received: {}", label)))
}

pub fn parse_address(raw: &str) -> Result<Address, BillingError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|_| BillingError::validation(format!("Invalid Ethereum address: {}", raw)))
}

/// Two-step login: password, then OTP.
#[derive(Clone)]
pub struct AuthClient {
    backend: HttpBackend,
    tokens: TokenStore,
}

impl AuthClient {
    pub fn new(backend: HttpBackend) -> Self {
        let tokens = backend.tokens().clone();
        Self { backend, tokens }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// First step. Keeps the temporary token for [`AuthClient::verify_otp`].
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<BackendRole, BillingError> {
        if username.trim().is_empty() {
            return Err(BillingError::validation("Username is required"));
        }
        require_strong(password)?;

        let response = self
            .backend
            .login(&LoginRequest {
                username: username.trim().to_string(),
                password: password.to_string(),
                email: email.trim().to_string(),
            })
            .await?;

        let role = parse_role(&response.role)?;
        self.tokens.set_pending(response.temp_token);
        tracing::info!("Password accepted for {}, awaiting OTP", username);
        Ok(role)
    }

    pub async fn verify_otp(&self, otp: &str) -> Result<Credentials, BillingError> {
        let otp = otp.trim();
        if otp.is_empty() {
            return Err(BillingError::validation("OTP is required"));
        }
        let temp_token = self.tokens.pending().ok_or_else(|| {
            BillingError::AuthenticationExpired(
                "No pending login. Please log in again.".to_string(),
            )
        })?;

        let response = self.backend.verify_otp(&temp_token, otp).await?;
        let credentials = Credentials {
            token: response.access_token,
            role: parse_role(&response.role)?,
        };
        self.tokens.set(credentials.clone());
        tracing::info!("Logged in as {}", credentials.role.as_str());
        Ok(credentials)
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
        wallet_address: &str,
    ) -> Result<(), BillingError> {
        if username.trim().is_empty() {
            return Err(BillingError::validation("Username is required"));
        }
        if !email.contains('@') {
            return Err(BillingError::validation("A valid email address is required"));
        }
        require_strong(password)?;
        let wallet = parse_address(wallet_address)?;

        self.backend
            .register(&RegisterRequest {
                username: username.trim().to_string(),
                password: password.to_string(),
                email: email.trim().to_string(),
                wallet_address: wallet.to_checksum(None),
                role: BackendRole::User,
            })
            .await?;
        Ok(())
    }

    pub async fn verify_token(&self) -> Result<BackendRole, BillingError> {
        let verified = self.backend.verify_token().await?;
        parse_role(&verified.role)
    }

    pub async fn request_registration(&self, wallet_address: &str) -> Result<(), BillingError> {
        let wallet = parse_address(wallet_address)?;
        self.backend.request_registration(&wallet.to_checksum(None)).await
    }

    /// Drops the token and the wallet session. Wallet permissions stay granted.
    pub fn logout(&self, session: &WalletSession) {
        self.tokens.clear();
        session.disconnect();
        tracing::info!("Logged out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strength_levels() {
        assert_eq!(password_strength("abc"), PasswordStrength::Weak);
        assert_eq!(password_strength("abcdefgh1"), PasswordStrength::Moderate);
        assert_eq!(password_strength("Abcdefg1"), PasswordStrength::Strong);
        assert_eq!(password_strength("Abcdef1!"), PasswordStrength::Strong);
    }

    #[test]
    fn token_store_round_trip() {
        let store = TokenStore::new();
        assert!(!store.is_authenticated());

        store.set_pending("temp".into());
        assert_eq!(store.pending().as_deref(), Some("temp"));

        store.set(Credentials { token: "abc".into(), role: BackendRole::User });
        assert_eq!(store.pending(), None);
        assert_eq!(store.bearer().as_deref(), Some("abc"));

        let shared = store.clone();
        shared.clear();
        assert!(!store.is_authenticated());
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!(matches!(parse_role("admin"), Err(BillingError::ValidationError(_))));
        assert_eq!(parse_role("wifi_provider").unwrap(), BackendRole::WifiProvider);
    }
}
