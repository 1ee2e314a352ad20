use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Arc,
};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::BridgeError;

/// Key under which the last known-good bridge port is persisted.
pub const PORT_STORAGE_KEY: &str = "rose_bridge_port";

/// Durable string key/value storage provided by the host.
pub trait PortStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct MemoryPortStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryPortStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(key: &str, value: &str) -> Self {
        let store = Self::new();
        store.set(key, value);
        store
    }
}

impl PortStore for MemoryPortStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// A JSON object on disk. Reads tolerate a missing or corrupt file; write
/// failures are logged and otherwise ignored.
#[derive(Debug)]
pub struct FilePortStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FilePortStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> Map<String, Value> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!(target = "bridge.discovery", path = %self.path.display(), error = %error, "failed to read port store");
                }
                return Map::new();
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!(target = "bridge.discovery", path = %self.path.display(), "port store is not a JSON object; ignoring it");
                Map::new()
            }
        }
    }

    fn write_map(&self, map: &Map<String, Value>) -> Result<(), BridgeError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(map)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, text)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut Map<String, Value>)) {
        let _guard = self.lock.lock();
        let mut map = self.read_map();
        apply(&mut map);
        if let Err(error) = self.write_map(&map) {
            warn!(target = "bridge.discovery", path = %self.path.display(), error = %error, "failed to write port store");
        }
    }
}

impl PortStore for FilePortStore {
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock();
        match self.read_map().get(key) {
            Some(Value::String(value)) => Some(value.clone()),
            Some(Value::Number(value)) => Some(value.to_string()),
            _ => None,
        }
    }

    fn set(&self, key: &str, value: &str) {
        self.update(|map| {
            map.insert(key.to_string(), Value::String(value.to_string()));
        });
    }

    fn remove(&self, key: &str) {
        self.update(|map| {
            map.remove(key);
        });
    }
}

/// Typed view of the persisted port entry.
#[derive(Clone)]
pub struct PortCache {
    store: Arc<dyn PortStore>,
}

impl PortCache {
    pub fn new(store: Arc<dyn PortStore>) -> Self {
        Self { store }
    }

    /// Returns the cached port if one is stored and valid. An invalid entry is
    /// removed so it is not consulted again.
    pub fn load(&self) -> Option<u16> {
        let raw = self.store.get(PORT_STORAGE_KEY)?;
        match parse_port(&raw) {
            Some(port) => Some(port),
            None => {
                debug!(target = "bridge.discovery", value = %raw, "discarding unparseable cached port");
                self.invalidate();
                None
            }
        }
    }

    pub fn store(&self, port: u16) {
        self.store.set(PORT_STORAGE_KEY, &port.to_string());
    }

    pub fn invalidate(&self) {
        self.store.remove(PORT_STORAGE_KEY);
    }
}

/// A port is a trimmed base-10 integer strictly greater than zero that fits
/// in a TCP port number.
pub fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|port| *port > 0)
}
