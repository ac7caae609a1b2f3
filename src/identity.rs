//! Account identity source
//!
//! The pub/sub client only needs the account code and device id; the REST
//! calls also need the access token, and outcomes echo the username.

use crate::config::AccountSection;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub account_code: String,
    pub device_id: String,
    pub access_token: String,
    pub username: String,
}

impl fmt::Debug for AccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountIdentity")
            .field("account_code", &"***")
            .field("device_id", &"***")
            .field("access_token", &"***")
            .field("username", &self.username)
            .finish()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Account data not available: {0} is not set")]
    Missing(String),
    #[error("Identity provider failed: {0}")]
    Provider(String),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_identity(&self) -> Result<AccountIdentity, IdentityError>;
}

/// Reads the identity from the environment variables named in `[account]`
#[derive(Debug, Clone)]
pub struct EnvIdentityProvider {
    names: AccountSection,
}

impl EnvIdentityProvider {
    pub fn new(names: AccountSection) -> Self {
        Self { names }
    }

    fn read(name: &str) -> Result<String, IdentityError> {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| IdentityError::Missing(name.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for EnvIdentityProvider {
    async fn current_identity(&self) -> Result<AccountIdentity, IdentityError> {
        Ok(AccountIdentity {
            account_code: Self::read(&self.names.account_code_env)?,
            device_id: Self::read(&self.names.device_id_env)?,
            access_token: Self::read(&self.names.access_token_env)?,
            username: Self::read(&self.names.username_env)?,
        })
    }
}
