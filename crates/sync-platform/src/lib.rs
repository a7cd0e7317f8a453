//! Platform collaborators injected into the sync client: token storage and
//! persisted preferences.

pub mod preferences;
pub mod secret;

#[cfg(feature = "os-keyring")]
pub use secret::OsKeyringSecretStore;
pub use preferences::{
    InMemoryPreferences, JsonFilePreferences, LastOpened, PreferencesError, PreferencesStore,
};
pub use secret::{
    CredentialVault, InMemorySecretStore, SecretSlot, SecretStore, SecretStoreError, TokenProvider,
};
