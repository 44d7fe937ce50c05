//! At-rest encryption secret
//!
//! One 256-bit secret per installation, generated on first use and kept in
//! a protected store. It only ever encrypts the local sample store; network
//! authentication uses the device token instead.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::db::PayloadCipher;
use crate::error::{Error, Result};

/// Secret length in bytes (256 bits)
pub const SECRET_LEN: usize = 32;

/// The installation's at-rest encryption key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionSecret([u8; SECRET_LEN]);

impl EncryptionSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn from_hex(encoded: &str) -> Result<Self> {
        let decoded = hex::decode(encoded.trim())
            .map_err(|e| Error::Secret(format!("stored secret is not hex: {}", e)))?;
        let bytes: [u8; SECRET_LEN] = decoded.try_into().map_err(|v: Vec<u8>| {
            Error::Secret(format!(
                "stored secret has {} bytes, expected {}",
                v.len(),
                SECRET_LEN
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for EncryptionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionSecret(<redacted>)")
    }
}

/// Where the encoded secret lives.
pub trait SecretStore: Send + Sync {
    fn load(&self) -> Result<Option<String>>;

    fn save(&self, encoded: &str) -> Result<()>;
}

/// Secret kept in a file readable only by the owner.
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretStore for FileSecretStore {
    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Secret(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn save(&self, encoded: &str) -> Result<()> {
        use std::io::Write;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path).map_err(|e| {
            Error::Secret(format!("failed to create {}: {}", self.path.display(), e))
        })?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Secret kept in memory only.
#[derive(Default)]
pub struct MemorySecretStore {
    value: Mutex<Option<String>>,
}

impl SecretStore for MemorySecretStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.value.lock().unwrap().clone())
    }

    fn save(&self, encoded: &str) -> Result<()> {
        *self.value.lock().unwrap() = Some(encoded.to_string());
        Ok(())
    }
}

/// Lazily provisions the installation secret.
pub struct SecretManager {
    store: Box<dyn SecretStore>,
    cached: Mutex<Option<EncryptionSecret>>,
}

impl SecretManager {
    pub fn new(store: Box<dyn SecretStore>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// Return the installation secret, creating and persisting it on first use.
    pub fn get_or_create_secret(&self) -> Result<EncryptionSecret> {
        let mut cached = self.cached.lock().unwrap();
        if let Some(secret) = cached.as_ref() {
            return Ok(secret.clone());
        }

        let secret = match self.store.load()? {
            Some(encoded) => EncryptionSecret::from_hex(&encoded)?,
            None => {
                let secret = EncryptionSecret::generate();
                self.store.save(&secret.to_hex())?;
                tracing::info!("Provisioned new at-rest encryption secret");
                secret
            }
        };

        *cached = Some(secret.clone());
        Ok(secret)
    }

    /// Cipher for the sample store, or `None` when the secret is unavailable.
    ///
    /// Losing access to the protected store degrades to plaintext storage
    /// instead of refusing to capture.
    pub fn open_store_cipher(&self) -> Option<PayloadCipher> {
        match self.get_or_create_secret() {
            Ok(secret) => Some(PayloadCipher::new(&secret)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Encryption secret unavailable, sample store will be unencrypted"
                );
                None
            }
        }
    }
}
