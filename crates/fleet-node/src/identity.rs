//! Transport key -- the Ed25519 key the QUIC certificate is derived from.
//!
//! Stored as PKCS#8 DER next to the config so a node keeps the same
//! certificate fingerprint across restarts.

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use sha2::{Digest, Sha256};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid transport key: {0}")]
    InvalidKey(String),
}

pub struct TransportKey {
    keypair: Ed25519KeyPair,
    pkcs8_doc: Vec<u8>,
}

impl TransportKey {
    pub fn generate() -> Result<Self, IdentityError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        Self::from_pkcs8_bytes(pkcs8.as_ref().to_vec())
    }

    pub fn from_file(path: &Path) -> Result<Self, IdentityError> {
        Self::from_pkcs8_bytes(std::fs::read(path)?)
    }

    /// Load the key at `path`, generating and saving one if missing.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            return Self::from_file(path);
        }
        let key = Self::generate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &key.pkcs8_doc)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(path = %path.display(), "generated transport key");
        Ok(key)
    }

    fn from_pkcs8_bytes(pkcs8_doc: Vec<u8>) -> Result<Self, IdentityError> {
        let keypair = Ed25519KeyPair::from_pkcs8(&pkcs8_doc)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        Ok(Self { keypair, pkcs8_doc })
    }

    pub fn public_key(&self) -> &[u8] {
        self.keypair.public_key().as_ref()
    }

    /// Hex SHA-256 of the public key, for logs and `fleet-node key`.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.public_key()))
    }

    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_is_stable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("keys/transport.key");

        let created = TransportKey::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = TransportKey::load_or_create(&path).unwrap();
        assert_eq!(created.public_key(), loaded.public_key());
        assert_eq!(created.fingerprint(), loaded.fingerprint());
        assert_eq!(created.fingerprint().len(), 64);
    }

    #[test]
    fn test_garbage_key_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("transport.key");
        std::fs::write(&path, b"not a key").unwrap();
        assert!(matches!(
            TransportKey::from_file(&path),
            Err(IdentityError::InvalidKey(_))
        ));
    }
}
