//! Runtime properties.
//!
//! A [`ConfigStore`] is filled from the command line, an optional properties
//! file and programmatic `set` calls, then frozen before a
//! [`CommunicationContext`](crate::CommunicationContext) is built from it.
//! After freezing the store is shared read-only behind an `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Property names understood by the runtime.
pub mod props {
    /// Log dispatch failures at warn level (`1`, default) or not (`0`).
    pub const WARN_DISPATCH: &str = "Ice.Warn.Dispatch";
    /// Log connection closures at warn level (`1`) or debug level (`0`, default).
    pub const WARN_CONNECTIONS: &str = "Ice.Warn.Connections";
    /// Milliseconds allowed for connect plus connection validation.
    pub const CONNECT_TIMEOUT: &str = "Ice.Override.ConnectTimeout";
    /// Milliseconds to wait for a shutdown acknowledgement and for in-flight drain.
    pub const SHUTDOWN_TIMEOUT: &str = "Ice.Shutdown.Timeout";
    /// Comma-separated list of properties files loaded by `parse_command_line`.
    pub const CONFIG_FILE: &str = "Ice.Config";
    /// Suffix appended to an adapter name to find its listen endpoint.
    pub const ENDPOINTS_SUFFIX: &str = "Endpoints";
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: expected 'key = value'")]
    Parse { path: PathBuf, line: usize },
}

/// Key/value runtime properties, immutable once frozen.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    properties: HashMap<String, String>,
    frozen: bool,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an unfrozen store from key/value pairs. Later pairs win.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut store = Self::new();
        for (key, value) in pairs {
            store.set(key, value);
        }
        store
    }

    /// Set a property, overwriting any previous value.
    ///
    /// Ignored (with a warning) once the store is frozen.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        if self.frozen {
            tracing::warn!(%key, "Ignoring property update on frozen config");
            return self;
        }
        self.properties.insert(key, value.into());
        self
    }

    /// Set a property only if it has no value yet.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        if !self.properties.contains_key(&key) {
            self.set(key, value);
        }
        self
    }

    pub fn get<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.properties.get(key).map(String::as_str).unwrap_or(default)
    }

    pub fn get_opt(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.properties.get(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(%key, value = %raw, default, "Property is not an integer, using default");
                default
            }),
            None => default,
        }
    }

    /// Integer property interpreted as a flag: any non-zero value is true.
    pub fn get_flag(&self, key: &str, default: bool) -> bool {
        self.get_int(key, i64::from(default)) != 0
    }

    /// Integer property interpreted as milliseconds. Negative values fall back to the default.
    pub fn get_duration_ms(&self, key: &str, default: Duration) -> Duration {
        if self.get_opt(key).is_none() {
            return default;
        }
        let fallback = i64::try_from(default.as_millis()).unwrap_or(i64::MAX);
        u64::try_from(self.get_int(key, fallback))
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// All properties whose key starts with `prefix`, sorted by key.
    pub fn properties_for_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.properties
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Freeze the store. Idempotent and irreversible.
    pub fn freeze(&mut self) {
        if !self.frozen {
            tracing::debug!(properties = self.properties.len(), "Config frozen");
        }
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Consume `--Key.Name=Value` arguments and return the rest in order.
    ///
    /// `--Key.Name` without a value sets `1`. Only arguments whose key
    /// contains a `.` are treated as properties, so ordinary flags such as
    /// `--help` pass through. Files named by `Ice.Config` are loaded first
    /// and command-line values override them.
    pub fn parse_command_line<I, S>(&mut self, args: I) -> Result<Vec<String>, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut remaining = Vec::new();
        let mut pairs = Vec::new();

        for arg in args {
            let arg = arg.into();
            match parse_property_arg(&arg) {
                Some((key, value)) => pairs.push((key, value)),
                None => remaining.push(arg),
            }
        }

        if let Some((_, files)) = pairs.iter().rev().find(|(k, _)| k == props::CONFIG_FILE) {
            for file in files.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                self.load_file(file)?;
            }
        }

        for (key, value) in pairs {
            self.set(key, value);
        }

        Ok(remaining)
    }

    /// Load `key = value` lines from a file. Blank lines and `#` comments are skipped.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        for (index, raw) in text.lines().enumerate() {
            let line = match raw.split_once('#') {
                Some((before, _)) => before,
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    line: index + 1,
                });
            }
            self.set(key, value.trim());
        }

        tracing::debug!(path = %path.display(), "Loaded properties file");
        Ok(())
    }
}

fn parse_property_arg(arg: &str) -> Option<(String, String)> {
    let body = arg.strip_prefix("--")?;
    let (key, value) = match body.split_once('=') {
        Some((k, v)) => (k, v),
        None => (body, "1"),
    };
    if key.is_empty() || !key.contains('.') {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}
