//! src/keyring.rs
//!
//! Bookkeeping for the gossip encryption keyring (§4.13's install-key/
//! use-key/remove-key/list-keys commands). Actual message encryption is out
//! of scope; this module exists purely so those RPC commands and the
//! `_serf_list-keys` internal query have real state to report against.

use crate::error::{Error, Result};
use std::sync::RwLock;

#[derive(Clone, Debug, Default)]
pub struct Keyring {
    primary_key: Vec<u8>,
    keys: Vec<Vec<u8>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary_key(&self) -> Vec<u8> {
        self.primary_key.clone()
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.keys.clone()
    }

    pub fn install(&mut self, key: Vec<u8>) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    /// Promotes `key` to primary, installing it first if it wasn't already
    /// known. The very first call also seeds `primary_key` with no prior
    /// installation needed.
    pub fn use_key(&mut self, key: Vec<u8>) {
        self.install(key.clone());
        self.primary_key = key;
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        if key == self.primary_key.as_slice() {
            return Err(Error::Rpc("cannot remove the primary key".into()));
        }
        self.keys.retain(|k| k.as_slice() != key);
        Ok(())
    }
}

/// Thread-safe handle shared between the RPC server, `Serf`, and the
/// delegate's internal-query dispatch.
pub type SharedKeyring = std::sync::Arc<RwLock<Keyring>>;

pub fn shared() -> SharedKeyring {
    std::sync::Arc::new(RwLock::new(Keyring::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn use_key_installs_and_promotes() {
        let mut kr = Keyring::new();
        kr.use_key(b"k1".to_vec());
        assert_eq!(kr.primary_key(), b"k1".to_vec());
        assert_eq!(kr.keys(), vec![b"k1".to_vec()]);
    }

    #[test]
    fn cannot_remove_the_primary_key() {
        let mut kr = Keyring::new();
        kr.use_key(b"k1".to_vec());
        assert!(kr.remove(b"k1").is_err());
    }

    #[test]
    fn remove_drops_a_secondary_key() {
        let mut kr = Keyring::new();
        kr.use_key(b"k1".to_vec());
        kr.install(b"k2".to_vec());
        kr.remove(b"k2").unwrap();
        assert_eq!(kr.keys(), vec![b"k1".to_vec()]);
    }
}
