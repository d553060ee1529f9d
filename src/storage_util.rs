//! Shared plumbing for the per-device configuration stores.
//!
//! Every device document lives in its own JSON file named by address inside
//! the devices directory. Writes are staged through a temp file and renamed
//! so readers never observe a half-written document. Lightweight
//! names-only metadata uses the `.metadata.json` suffix and is excluded
//! from device listings.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Suffix for names-only metadata files.
pub const METADATA_SUFFIX: &str = ".metadata.json";

/// Errors raised by the configuration stores and document validators.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),
    #[error("device '{0}' not found")]
    DeviceNotFound(String),
    #[error("configuration '{0}' not found")]
    ConfigurationNotFound(String),
    #[error("could not parse device file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

/// Validate an `HH:MM` time string and return it as minutes since midnight.
pub fn time_to_minutes(value: &str) -> Result<u32, ConfigError> {
    let bad = || ConfigError::invalid(format!("invalid HH:MM time string '{value}'"));
    let (h, m) = value.split_once(':').ok_or_else(bad)?;
    if h.len() != 2 || m.len() != 2 {
        return Err(bad());
    }
    let hours: u32 = h.parse().map_err(|_| bad())?;
    let minutes: u32 = m.parse().map_err(|_| bad())?;
    if hours > 23 || minutes > 59 {
        return Err(bad());
    }
    Ok(hours * 60 + minutes)
}

/// Check a sequence for duplicates, naming the offender in the error.
pub fn ensure_unique<T: std::fmt::Display + PartialEq>(
    values: &[T],
    what: &str,
) -> Result<(), ConfigError> {
    for (i, value) in values.iter().enumerate() {
        if values[..i].contains(value) {
            return Err(ConfigError::invalid(format!("duplicate {what}: {value}")));
        }
    }
    Ok(())
}

/// Current ISO-8601 timestamp with second precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// List device JSON files in a storage directory, excluding metadata files.
pub fn filter_device_json_files(storage_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = fs::read_dir(storage_dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".json") && !name.ends_with(METADATA_SUFFIX) {
            files.push(path);
        }
    }
    files.sort();
    files
}

/// Write a serializable value to `path` atomically (temp file + rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Unwrap a stored device file into its inner document value.
///
/// Files come in two shapes: the current envelope
/// `{device_type, device_id, last_updated, device_data}` and the legacy bare
/// document. Returns `None` when the envelope names a different device type.
pub fn unwrap_device_envelope(data: Value, expected_type: &str) -> Option<Value> {
    match data {
        Value::Object(mut map) if map.contains_key("device_type") => {
            if map.get("device_type").and_then(Value::as_str) != Some(expected_type) {
                return None;
            }
            match map.remove("device_data") {
                Some(inner) => Some(inner),
                None => Some(Value::Object(map)),
            }
        }
        other => Some(other),
    }
}

/// Wrap a device document in the current storage envelope.
pub fn wrap_device_envelope(device_type: &str, device_id: &str, device_data: Value) -> Value {
    serde_json::json!({
        "device_type": device_type,
        "device_id": device_id,
        "last_updated": now_iso(),
        "device_data": device_data,
    })
}
