//! Keyring operations for secure credential storage
//!
//! Uses the system keyring (Secret Service on Linux) to store and retrieve
//! bearer tokens. Each key becomes one keyring entry under the service name.

use crate::error::StorageError;
use crate::storage::KeyValueStore;
use keyring::Entry;

/// Default keyring service name
pub const KEYRING_SERVICE: &str = "skiff-vpn";

#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StorageError> {
        Entry::new(&self.service, key).map_err(|_| StorageError::ServiceUnavailable)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(_) => Err(StorageError::ReadFailed {
                key: key.to_string(),
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|_| StorageError::WriteFailed {
                key: key.to_string(),
            })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(_) => Err(StorageError::WriteFailed {
                key: key.to_string(),
            }),
        }
    }
}
