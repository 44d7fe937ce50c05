//! Device credential resolution
//!
//! The pairing flow has stored `device_id` / `device_token` under several
//! namespace names over time. [`CredentialProvider`] probes an ordered list
//! of sources and takes the first value found for each field on its own,
//! so an id from one namespace can pair with a token from another.

use std::sync::Arc;

use crate::error::Result;
use crate::prefs::{Namespace, Preferences};
use crate::types::Credentials;

/// Key holding the device id
pub const DEVICE_ID_KEY: &str = "device_id";

/// Key holding the shared device token
pub const DEVICE_TOKEN_KEY: &str = "device_token";

/// Namespaces probed by default, oldest storage location last.
pub const DEFAULT_NAMESPACES: &[&str] = &[
    "capacitor.preferences",
    "CapacitorPreferences",
    "CapacitorStorage",
    "preferences",
    "default",
];

/// Namespace the pairing command writes to.
pub const PAIRING_NAMESPACE: &str = "CapacitorStorage";

/// Environment variables read by [`EnvSource`]
pub const DEVICE_ID_ENV: &str = "OFFSYNC_DEVICE_ID";
pub const DEVICE_TOKEN_ENV: &str = "OFFSYNC_DEVICE_TOKEN";

/// One place credentials may be stored.
pub trait CredentialSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    fn device_id(&self) -> Result<Option<String>>;

    fn device_token(&self) -> Result<Option<String>>;
}

/// Credentials read from a key-value namespace.
pub struct NamespaceSource {
    namespace: Arc<dyn Namespace>,
}

impl NamespaceSource {
    pub fn new(namespace: Arc<dyn Namespace>) -> Self {
        Self { namespace }
    }
}

impl CredentialSource for NamespaceSource {
    fn name(&self) -> &str {
        self.namespace.name()
    }

    fn device_id(&self) -> Result<Option<String>> {
        self.namespace.get(DEVICE_ID_KEY)
    }

    fn device_token(&self) -> Result<Option<String>> {
        self.namespace.get(DEVICE_TOKEN_KEY)
    }
}

/// Credentials read from `OFFSYNC_DEVICE_ID` / `OFFSYNC_DEVICE_TOKEN`.
pub struct EnvSource;

impl CredentialSource for EnvSource {
    fn name(&self) -> &str {
        "env"
    }

    fn device_id(&self) -> Result<Option<String>> {
        Ok(std::env::var(DEVICE_ID_ENV).ok())
    }

    fn device_token(&self) -> Result<Option<String>> {
        Ok(std::env::var(DEVICE_TOKEN_ENV).ok())
    }
}

/// First-non-empty-wins resolution over an ordered list of sources.
pub struct CredentialProvider {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl CredentialProvider {
    pub fn new(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self { sources }
    }

    /// Provider probing [`DEFAULT_NAMESPACES`] under `prefs`.
    pub fn with_default_namespaces(prefs: &Preferences) -> Self {
        let sources = DEFAULT_NAMESPACES
            .iter()
            .map(|name| {
                Box::new(NamespaceSource::new(Arc::new(prefs.namespace(name))))
                    as Box<dyn CredentialSource>
            })
            .collect();
        Self { sources }
    }

    /// Put a source ahead of all others.
    pub fn prepend(mut self, source: Box<dyn CredentialSource>) -> Self {
        self.sources.insert(0, source);
        self
    }

    /// Resolve each field from the first source that has it.
    ///
    /// Missing fields are not an error; uploads go out unsigned or
    /// unidentified. A source that fails to read is logged and skipped.
    pub fn resolve_credentials(&self) -> Credentials {
        let mut creds = Credentials::default();

        for source in &self.sources {
            if creds.device_id.is_none() {
                creds.device_id = probe(source.as_ref(), DEVICE_ID_KEY, source.device_id());
            }
            if creds.device_token.is_none() {
                creds.device_token =
                    probe(source.as_ref(), DEVICE_TOKEN_KEY, source.device_token());
            }
            if creds.is_complete() {
                break;
            }
        }

        if !creds.is_complete() {
            tracing::debug!(
                has_device_id = creds.device_id.is_some(),
                has_device_token = creds.device_token.is_some(),
                "Credentials incomplete"
            );
        }
        creds
    }
}

fn probe(
    source: &dyn CredentialSource,
    field: &str,
    value: Result<Option<String>>,
) -> Option<String> {
    match value {
        Ok(value) => value.filter(|v| !v.is_empty()),
        Err(e) => {
            tracing::warn!(source = source.name(), field, error = %e, "Credential source unreadable");
            None
        }
    }
}

/// Store credentials where the default provider will find them.
pub fn store_credentials(prefs: &Preferences, device_id: &str, device_token: &str) -> Result<()> {
    let ns = prefs.namespace(PAIRING_NAMESPACE);
    ns.set(DEVICE_ID_KEY, device_id)?;
    ns.set(DEVICE_TOKEN_KEY, device_token)?;
    tracing::info!(namespace = PAIRING_NAMESPACE, device_id, "Device credentials stored");
    Ok(())
}
