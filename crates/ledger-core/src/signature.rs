//! Ed25519 key pairs and a named key store.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LedgerError, Result};
use crate::sha256_hex_bytes;

/// Length of an address in hex characters.
const ADDRESS_HEX_LEN: usize = 40;

#[derive(Clone, Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
}

/// Exportable form of a key pair.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyExport {
    pub private_key: String,
    pub public_key: String,
    pub address: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret)
            .map_err(|e| LedgerError::validation(format!("private key is not hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| LedgerError::validation("private key must be 32 bytes"))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn address(&self) -> String {
        let digest = sha256_hex_bytes(self.signing_key.verifying_key().as_bytes());
        digest[..ADDRESS_HEX_LEN].to_string()
    }

    /// Hex-encoded Ed25519 signature over `message`.
    pub fn sign(&self, message: &str) -> String {
        let signature = self.signing_key.sign(message.as_bytes());
        debug!(address = %self.address(), "message signed");
        hex::encode(signature.to_bytes())
    }

    /// Returns false for malformed keys or signatures rather than erroring.
    pub fn verify(message: &str, signature: &str, public_key: &str) -> bool {
        let Ok(key_bytes) = hex::decode(public_key) else {
            return false;
        };
        let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        verifying_key.verify(message.as_bytes(), &signature).is_ok()
    }

    pub fn export(&self) -> KeyExport {
        KeyExport {
            private_key: hex::encode(self.signing_key.to_bytes()),
            public_key: self.public_key_hex(),
            address: self.address(),
        }
    }
}

/// Named key pairs held by a node.
#[derive(Debug, Default)]
pub struct KeyManager {
    keys: RwLock<BTreeMap<String, KeyPair>>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_key(&self, name: &str) -> KeyPair {
        let key = KeyPair::generate();
        self.keys.write().insert(name.to_string(), key.clone());
        info!(name, address = %key.address(), "key created");
        key
    }

    pub fn import_key(&self, name: &str, private_key: &str) -> Result<KeyPair> {
        let key = KeyPair::from_secret_hex(private_key)?;
        self.keys.write().insert(name.to_string(), key.clone());
        info!(name, "key imported");
        Ok(key)
    }

    pub fn get_key(&self, name: &str) -> Option<KeyPair> {
        self.keys.read().get(name).cloned()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.keys.read().keys().cloned().collect()
    }

    pub fn export_key(&self, name: &str) -> Option<KeyExport> {
        self.keys.read().get(name).map(KeyPair::export)
    }

    pub fn delete_key(&self, name: &str) -> bool {
        let removed = self.keys.write().remove(name).is_some();
        if removed {
            info!(name, "key deleted");
        }
        removed
    }
}
