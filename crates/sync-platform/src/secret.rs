use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretStoreError {
    #[error("no secret stored in this slot")]
    NotFound,
    #[error("secret storage is not reachable: {0}")]
    Unavailable(String),
    #[error("secret storage rejected the request: {0}")]
    Backend(String),
}

/// Address of one secret: a service name plus an account within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretSlot {
    pub service: String,
    pub account: String,
}

impl SecretSlot {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }
}

impl fmt::Display for SecretSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.account)
    }
}

/// Secret storage addressed by [`SecretSlot`].
pub trait SecretStore: Send + Sync {
    fn read(&self, slot: &SecretSlot) -> Result<String, SecretStoreError>;

    fn write(&self, slot: &SecretSlot, secret: &str) -> Result<(), SecretStoreError>;

    /// Remove the secret. `NotFound` when the slot was empty.
    fn erase(&self, slot: &SecretSlot) -> Result<(), SecretStoreError>;
}

impl<S: SecretStore + ?Sized> SecretStore for Arc<S> {
    fn read(&self, slot: &SecretSlot) -> Result<String, SecretStoreError> {
        S::read(self, slot)
    }

    fn write(&self, slot: &SecretSlot, secret: &str) -> Result<(), SecretStoreError> {
        S::write(self, slot, secret)
    }

    fn erase(&self, slot: &SecretSlot) -> Result<(), SecretStoreError> {
        S::erase(self, slot)
    }
}

/// Process-local store; clones share the same slots.
#[derive(Debug, Clone, Default)]
pub struct InMemorySecretStore {
    slots: Arc<Mutex<HashMap<SecretSlot, String>>>,
}

impl InMemorySecretStore {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<SecretSlot, String>> {
        // Single-statement updates cannot leave the map half-written.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SecretStore for InMemorySecretStore {
    fn read(&self, slot: &SecretSlot) -> Result<String, SecretStoreError> {
        self.slots()
            .get(slot)
            .cloned()
            .ok_or(SecretStoreError::NotFound)
    }

    fn write(&self, slot: &SecretSlot, secret: &str) -> Result<(), SecretStoreError> {
        self.slots().insert(slot.clone(), secret.to_owned());
        Ok(())
    }

    fn erase(&self, slot: &SecretSlot) -> Result<(), SecretStoreError> {
        match self.slots().remove(slot) {
            Some(_) => Ok(()),
            None => Err(SecretStoreError::NotFound),
        }
    }
}

/// Secrets kept in the platform keychain.
#[cfg(feature = "os-keyring")]
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeyringSecretStore;

#[cfg(feature = "os-keyring")]
impl OsKeyringSecretStore {
    fn entry(slot: &SecretSlot) -> Result<keyring::Entry, SecretStoreError> {
        keyring::Entry::new(&slot.service, &slot.account).map_err(map_keyring_error)
    }
}

#[cfg(feature = "os-keyring")]
fn map_keyring_error(err: keyring::Error) -> SecretStoreError {
    match err {
        keyring::Error::NoEntry => SecretStoreError::NotFound,
        keyring::Error::PlatformFailure(inner) | keyring::Error::NoStorageAccess(inner) => {
            SecretStoreError::Unavailable(inner.to_string())
        }
        other => SecretStoreError::Backend(other.to_string()),
    }
}

#[cfg(feature = "os-keyring")]
impl SecretStore for OsKeyringSecretStore {
    fn read(&self, slot: &SecretSlot) -> Result<String, SecretStoreError> {
        Self::entry(slot)?.get_password().map_err(map_keyring_error)
    }

    fn write(&self, slot: &SecretSlot, secret: &str) -> Result<(), SecretStoreError> {
        Self::entry(slot)?
            .set_password(secret)
            .map_err(map_keyring_error)
    }

    fn erase(&self, slot: &SecretSlot) -> Result<(), SecretStoreError> {
        Self::entry(slot)?
            .delete_credential()
            .map_err(map_keyring_error)
    }
}

/// Access to the session token used by the realtime identify handshake.
pub trait TokenProvider: Send + Sync {
    /// `Ok(None)` when no token has been stored.
    fn get_token(&self) -> Result<Option<String>, SecretStoreError>;

    fn set_token(&self, token: &str) -> Result<(), SecretStoreError>;

    /// Forget the token. Clearing an absent token succeeds.
    fn clear_token(&self) -> Result<(), SecretStoreError>;
}

/// [`TokenProvider`] bound to one slot of a [`SecretStore`].
#[derive(Debug, Clone)]
pub struct CredentialVault<S: SecretStore> {
    store: S,
    slot: SecretSlot,
}

impl<S: SecretStore> CredentialVault<S> {
    pub fn new(store: S, service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            store,
            slot: SecretSlot::new(service, account),
        }
    }

    pub fn slot(&self) -> &SecretSlot {
        &self.slot
    }
}

impl<S: SecretStore> TokenProvider for CredentialVault<S> {
    fn get_token(&self) -> Result<Option<String>, SecretStoreError> {
        match self.store.read(&self.slot) {
            Ok(token) => Ok(Some(token)),
            Err(SecretStoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn set_token(&self, token: &str) -> Result<(), SecretStoreError> {
        self.store.write(&self.slot, token)
    }

    fn clear_token(&self) -> Result<(), SecretStoreError> {
        match self.store.erase(&self.slot) {
            Err(SecretStoreError::NotFound) => Ok(()),
            other => other,
        }
    }
}
