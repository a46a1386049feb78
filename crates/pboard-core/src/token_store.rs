use keyring::Entry;
use thiserror::Error;
use tracing::warn;

const SERVICE_NAME: &str = "com.pulseboard.app";
const ACCOUNT_PREFIX: &str = "pulseboard-refresh-";

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("keyring operation failed: {0}")]
    Keyring(String),
}

/// Refresh-token persistence in the host OS keyring, one entry per user.
///
/// Every operation here is best-effort from the caller's point of view: a
/// missing keyring never blocks sign-in, it only costs the user a fresh
/// browser round-trip next launch.
#[derive(Debug, Clone, Default)]
pub struct TokenStore;

impl TokenStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(user_id: &str) -> Result<Entry, TokenStoreError> {
        let account = format!("{ACCOUNT_PREFIX}{user_id}");
        Entry::new(SERVICE_NAME, &account)
            .map_err(|err| TokenStoreError::Keyring(err.to_string()))
    }

    pub fn store(&self, user_id: &str, refresh_token: &str) -> Result<(), TokenStoreError> {
        let trimmed = refresh_token.trim();
        if trimmed.is_empty() {
            // Implicit-flow sign-ins carry no refresh token; nothing to keep.
            return Ok(());
        }
        Self::entry(user_id)?
            .set_password(trimmed)
            .map_err(|err| TokenStoreError::Keyring(err.to_string()))
    }

    pub fn load(&self, user_id: &str) -> Result<Option<String>, TokenStoreError> {
        match Self::entry(user_id)?.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(TokenStoreError::Keyring(err.to_string())),
        }
    }

    pub fn delete(&self, user_id: &str) -> Result<(), TokenStoreError> {
        match Self::entry(user_id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(TokenStoreError::Keyring(err.to_string())),
        }
    }

    /// Delete variant for sign-out paths where failure should only warn.
    pub fn delete_best_effort(&self, user_id: &str) {
        if let Err(err) = self.delete(user_id) {
            warn!(%err, user_id, "failed to delete stored refresh token");
        }
    }
}
