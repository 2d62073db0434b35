//! Device credentials and their resolution against a key store.

use crate::config::{KeystoreSettings, TransportProtocol};
use crate::device::AuthMethod;
use crate::error::CredentialError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const NONCE_LEN: usize = 12;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Credentials {
    LoginPassword {
        username: String,
        password: String,
    },
    /// Password stored as hex of `nonce || ciphertext` under the keystore key.
    LoginPasswordEncrypted {
        username: String,
        encrypted_password: String,
    },
    KeyPair {
        username: String,
        key_id: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
    TransportSecured {
        key_id: String,
    },
}

impl Credentials {
    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::LoginPassword { .. } => "login-password",
            Credentials::LoginPasswordEncrypted { .. } => "login-password-encrypted",
            Credentials::KeyPair { .. } => "key-pair",
            Credentials::TransportSecured { .. } => "transport-secured",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::LoginPassword { username, .. }
            | Credentials::LoginPasswordEncrypted { username, .. } => f
                .debug_struct(self.kind())
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::KeyPair {
                username, key_id, ..
            } => f
                .debug_struct(self.kind())
                .field("username", username)
                .field("key_id", key_id)
                .finish_non_exhaustive(),
            Credentials::TransportSecured { key_id } => f
                .debug_struct(self.kind())
                .field("key_id", key_id)
                .finish(),
        }
    }
}

/// External store holding decryption and private key material.
pub trait CredentialStore: Send + Sync {
    fn decrypt(&self, encrypted: &str) -> Result<String, CredentialError>;
    fn private_key(&self, key_id: &str) -> Result<String, CredentialError>;
}

pub struct KeystoreCredentialStore {
    cipher: Option<Aes256Gcm>,
    private_keys: RwLock<BTreeMap<String, String>>,
}

impl KeystoreCredentialStore {
    pub fn new(master_key: &[u8; 32]) -> Self {
        Self {
            cipher: Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(master_key))),
            private_keys: RwLock::new(BTreeMap::new()),
        }
    }

    /// Store without a master key; encrypted passwords cannot be resolved.
    pub fn without_master_key() -> Self {
        Self {
            cipher: None,
            private_keys: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_hex(master_key: &str) -> Result<Self, CredentialError> {
        let bytes = hex::decode(master_key.trim())
            .map_err(|err| CredentialError::Encoding(err.to_string()))?;
        let key: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            CredentialError::Encoding(format!("master key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(&key))
    }

    pub fn from_settings(settings: &KeystoreSettings) -> Result<Self, CredentialError> {
        let store = match &settings.master_key {
            Some(master_key) => Self::from_hex(master_key)?,
            None => Self::without_master_key(),
        };
        for (key_id, material) in &settings.private_keys {
            store.add_private_key(key_id, material);
        }
        Ok(store)
    }

    pub fn add_private_key(&self, key_id: impl Into<String>, material: impl Into<String>) {
        self.private_keys
            .write()
            .insert(key_id.into(), material.into());
    }

    /// Produces the at-rest form accepted by [`CredentialStore::decrypt`].
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CredentialError::Encoding("encryption failed".into()))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(hex::encode(blob))
    }

    fn cipher(&self) -> Result<&Aes256Gcm, CredentialError> {
        self.cipher
            .as_ref()
            .ok_or_else(|| CredentialError::Decrypt("keystore has no master key".into()))
    }
}

impl CredentialStore for KeystoreCredentialStore {
    fn decrypt(&self, encrypted: &str) -> Result<String, CredentialError> {
        let cipher = self.cipher()?;
        let blob = hex::decode(encrypted.trim())
            .map_err(|err| CredentialError::Encoding(err.to_string()))?;
        if blob.len() <= NONCE_LEN {
            return Err(CredentialError::Encoding("encrypted blob too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt("authentication tag mismatch".into()))?;
        String::from_utf8(plaintext).map_err(|err| CredentialError::Decrypt(err.to_string()))
    }

    fn private_key(&self, key_id: &str) -> Result<String, CredentialError> {
        self.private_keys
            .read()
            .get(key_id)
            .cloned()
            .ok_or_else(|| CredentialError::UnknownKey(key_id.to_string()))
    }
}

/// Turns configured credentials into connector input. TLS only accepts
/// transport-secured credentials, which in turn require TLS.
pub fn resolve(
    credentials: &Credentials,
    protocol: TransportProtocol,
    store: &dyn CredentialStore,
) -> Result<AuthMethod, CredentialError> {
    let transport_secured = matches!(credentials, Credentials::TransportSecured { .. });
    if transport_secured != (protocol == TransportProtocol::Tls) {
        return Err(CredentialError::Unsupported {
            protocol: protocol.to_string(),
            credentials: credentials.kind().to_string(),
        });
    }
    match credentials {
        Credentials::LoginPassword { username, password } => Ok(AuthMethod::Password {
            username: username.clone(),
            password: password.clone(),
        }),
        Credentials::LoginPasswordEncrypted {
            username,
            encrypted_password,
        } => Ok(AuthMethod::Password {
            username: username.clone(),
            password: store.decrypt(encrypted_password)?,
        }),
        Credentials::KeyPair {
            username,
            key_id,
            passphrase,
        } => Ok(AuthMethod::PublicKey {
            username: username.clone(),
            private_key: store.private_key(key_id)?,
            passphrase: passphrase.clone(),
        }),
        Credentials::TransportSecured { key_id } => Ok(AuthMethod::TransportSecured {
            key_id: key_id.clone(),
            private_key: store.private_key(key_id)?,
        }),
    }
}
