//! Local key-value namespaces
//!
//! Small string maps persisted as one JSON file per namespace under
//! [`Config::prefs_dir`](crate::Config::prefs_dir). The pairing flow writes
//! device credentials into one of them, the settings side writes the
//! server URL override into another.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::{SyncConfig, DEFAULT_SERVER_URL};
use crate::error::{Error, Result};

/// Namespace holding app-level runtime settings.
pub const APP_PREFS_NAMESPACE: &str = "app_prefs";

/// Key of the runtime server URL override inside [`APP_PREFS_NAMESPACE`].
pub const SERVER_URL_KEY: &str = "runtime_offsync_server_url";

/// A string-to-string store.
pub trait Namespace: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Namespace persisted as a JSON object on disk.
///
/// A missing file reads as an empty namespace.
pub struct FileNamespace {
    name: String,
    path: PathBuf,
    // Serializes read-modify-write cycles from this process
    write_lock: Mutex<()>,
}

impl FileNamespace {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so readers never see a half-written file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(map)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Namespace for FileNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

/// In-process namespace, for tests and embedding hosts that own persistence.
#[derive(Default)]
pub struct MemoryNamespace {
    name: String,
    values: Mutex<HashMap<String, String>>,
}

impl MemoryNamespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_entry(self, key: &str, value: &str) -> Self {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self
    }
}

impl Namespace for MemoryNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Directory of file-backed namespaces.
#[derive(Debug, Clone)]
pub struct Preferences {
    dir: PathBuf,
}

impl Preferences {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open the namespace stored at `<dir>/<name>.json`.
    pub fn namespace(&self, name: &str) -> FileNamespace {
        FileNamespace::new(name, self.dir.join(format!("{}.json", name)))
    }
}

/// Runtime-settable server URL, persisted so a rebuild is not needed to
/// point the client at another ingest server.
#[derive(Clone)]
pub struct ServerUrlSetting {
    store: Arc<dyn Namespace>,
}

impl ServerUrlSetting {
    pub fn new(store: Arc<dyn Namespace>) -> Self {
        Self { store }
    }

    /// The stored override, if any. Empty strings count as unset.
    pub fn get(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(SERVER_URL_KEY)?
            .filter(|url| !url.trim().is_empty()))
    }

    pub fn set(&self, url: &str) -> Result<()> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "server URL must be an http(s) URL, got {:?}",
                url
            )));
        }
        self.store.set(SERVER_URL_KEY, url)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(SERVER_URL_KEY)
    }

    /// Effective base URL: override, then config, then the build-time default.
    ///
    /// A failing override store falls back rather than blocking uploads.
    pub fn resolve(&self, config: &SyncConfig) -> String {
        let runtime = match self.get() {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read server URL override, using fallback");
                None
            }
        };
        runtime
            .or_else(|| config.server_url.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
            .trim_end_matches('/')
            .to_string()
    }
}
