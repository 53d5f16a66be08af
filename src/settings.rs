//! Persisted configuration for proximity thresholds and timers.
//!
//! Values live in a [`SettingsStore`] as named integers. [`Settings`] layers
//! typed accessors on top, registers the documented defaults and clamps
//! threshold writes to the valid signal range.

use crate::card_data::SentinelMode;
use crate::signal::Rssi;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const AUTO_CONNECT_THRESHOLD: &str = "auto_connect_threshold";
pub const AUTO_DISCONNECT_THRESHOLD: &str = "auto_disconnect_threshold";
pub const AUTO_DISCONNECT_INTERVAL: &str = "auto_disconnect_interval";
pub const SCAN_TIMEOUT_INTERVAL: &str = "scan_timeout_interval";
pub const SENTINEL_MODE: &str = "sentinel_mode";

/// Lowest accepted threshold value in dBm.
pub const THRESHOLD_MIN: Rssi = -100;
/// Highest accepted threshold value. Zero disables the feature.
pub const THRESHOLD_MAX: Rssi = 0;

/// Default values registered with every store.
pub const DEFAULTS: [(&str, i64); 5] = [
    (AUTO_CONNECT_THRESHOLD, -45),
    (AUTO_DISCONNECT_THRESHOLD, -70),
    (AUTO_DISCONNECT_INTERVAL, 1),
    (SCAN_TIMEOUT_INTERVAL, 0),
    (SENTINEL_MODE, 2),
];

/// Errors returned by settings stores.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A key-value store of named integer settings.
pub trait SettingsStore: Send {
    /// Return the stored value, else the registered default, else `default`.
    fn get_int(&self, key: &str, default: i64) -> i64;

    fn set_int(&mut self, key: &str, value: i64) -> Result<(), SettingsError>;

    /// Register fallback values used when a key has never been written.
    fn register_defaults(&mut self, defaults: &[(&str, i64)]);
}

/// Settings held only for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: HashMap<String, i64>,
    defaults: HashMap<String, i64>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .or_else(|| self.defaults.get(key))
            .copied()
            .unwrap_or(default)
    }

    fn set_int(&mut self, key: &str, value: i64) -> Result<(), SettingsError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn register_defaults(&mut self, defaults: &[(&str, i64)]) {
        for (key, value) in defaults {
            self.defaults.insert((*key).to_string(), *value);
        }
    }
}

/// Settings persisted as a flat `key = integer` TOML table.
///
/// The file is read once when opened and rewritten on every `set_int`.
/// Registered defaults are never written to disk.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    values: BTreeMap<String, i64>,
    defaults: HashMap<String, i64>,
}

impl FileSettings {
    /// Open the settings file at `path`. A missing file yields an empty store.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| SettingsError::Io {
                path: path.clone(),
                source,
            })?;
            toml::from_str(&content)?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), keys = values.len(), "opened settings file");
        Ok(Self {
            path,
            values,
            defaults: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, content).map_err(io_err)
    }
}

impl SettingsStore for FileSettings {
    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .or_else(|| self.defaults.get(key))
            .copied()
            .unwrap_or(default)
    }

    fn set_int(&mut self, key: &str, value: i64) -> Result<(), SettingsError> {
        self.values.insert(key.to_string(), value);
        self.save()
    }

    fn register_defaults(&mut self, defaults: &[(&str, i64)]) {
        for (key, value) in defaults {
            self.defaults.insert((*key).to_string(), *value);
        }
    }
}

/// Typed view over a [`SettingsStore`].
pub struct Settings {
    store: Box<dyn SettingsStore>,
}

impl Settings {
    /// Wrap `store`, registering the default values.
    pub fn new(mut store: Box<dyn SettingsStore>) -> Self {
        store.register_defaults(&DEFAULTS);
        Self { store }
    }

    /// Settings backed by a fresh [`MemorySettings`].
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemorySettings::new()))
    }

    fn default_of(key: &str) -> i64 {
        DEFAULTS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    fn get(&self, key: &str) -> i64 {
        self.store.get_int(key, Self::default_of(key))
    }

    fn threshold(&self, key: &str) -> Rssi {
        clamp_threshold(self.get(key))
    }

    /// Filtered signal above which a discovered beacon is connected. 0 = off.
    pub fn auto_connect_threshold(&self) -> Rssi {
        self.threshold(AUTO_CONNECT_THRESHOLD)
    }

    /// Store a new auto-connect threshold, clamped to `[-100, 0]`.
    ///
    /// # Returns
    /// The value actually stored.
    pub fn set_auto_connect_threshold(&mut self, value: i64) -> Result<Rssi, SettingsError> {
        let clamped = clamp_threshold(value);
        self.store.set_int(AUTO_CONNECT_THRESHOLD, i64::from(clamped))?;
        Ok(clamped)
    }

    /// Filtered signal below which a connected beacon is disconnected. 0 = off.
    pub fn auto_disconnect_threshold(&self) -> Rssi {
        self.threshold(AUTO_DISCONNECT_THRESHOLD)
    }

    pub fn set_auto_disconnect_threshold(&mut self, value: i64) -> Result<Rssi, SettingsError> {
        let clamped = clamp_threshold(value);
        self.store.set_int(AUTO_DISCONNECT_THRESHOLD, i64::from(clamped))?;
        Ok(clamped)
    }

    /// How long a beacon must stay below the disconnect threshold.
    pub fn auto_disconnect_interval(&self) -> Duration {
        seconds(self.get(AUTO_DISCONNECT_INTERVAL))
    }

    pub fn set_auto_disconnect_interval(
        &mut self,
        interval: Duration,
    ) -> Result<(), SettingsError> {
        self.store.set_int(AUTO_DISCONNECT_INTERVAL, whole_seconds(interval))
    }

    /// Scan duration before falling back to inactive. Zero scans forever.
    pub fn scan_timeout(&self) -> Duration {
        seconds(self.get(SCAN_TIMEOUT_INTERVAL))
    }

    pub fn set_scan_timeout(&mut self, timeout: Duration) -> Result<(), SettingsError> {
        self.store.set_int(SCAN_TIMEOUT_INTERVAL, whole_seconds(timeout))
    }

    pub fn sentinel_mode(&self) -> SentinelMode {
        SentinelMode::from_code(self.get(SENTINEL_MODE))
    }

    pub fn set_sentinel_mode(&mut self, mode: SentinelMode) -> Result<(), SettingsError> {
        self.store.set_int(SENTINEL_MODE, mode.code())
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("auto_connect_threshold", &self.auto_connect_threshold())
            .field("auto_disconnect_threshold", &self.auto_disconnect_threshold())
            .field("auto_disconnect_interval", &self.auto_disconnect_interval())
            .field("scan_timeout", &self.scan_timeout())
            .field("sentinel_mode", &self.sentinel_mode())
            .finish()
    }
}

fn clamp_threshold(value: i64) -> Rssi {
    value.clamp(i64::from(THRESHOLD_MIN), i64::from(THRESHOLD_MAX)) as Rssi
}

fn seconds(value: i64) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}

/// Round up to whole seconds so a sub-second interval never stores as zero.
fn whole_seconds(duration: Duration) -> i64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use beacon_link::settings::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit, millis_per_unit) = if let Some(num) = src.strip_suffix("ms") {
        (num, "milliseconds", 1)
    } else if let Some(num) = src.strip_suffix('h') {
        (num, "hours", 3_600_000)
    } else if let Some(num) = src.strip_suffix('m') {
        (num, "minutes", 60_000)
    } else if let Some(num) = src.strip_suffix('s') {
        (num, "seconds", 1000)
    } else {
        (src, "duration", 1000)
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid {}: {}", unit, num))?;
    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration out of range: {}", src))
}
