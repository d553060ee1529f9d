//! Runtime configuration from environment variables.
//!
//! Every setting has a current `AQUA_BLE_*` name and a legacy `CHIHIROS_*`
//! fallback kept for existing deployments; a deprecation warning is logged
//! the first time a legacy name is used.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Environment variable pairs: current name, legacy fallback.
const ENV_FALLBACKS: &[(&str, &str)] = &[
    ("AQUA_BLE_SERVICE_HOST", "CHIHIROS_SERVICE_HOST"),
    ("AQUA_BLE_SERVICE_PORT", "CHIHIROS_SERVICE_PORT"),
    ("AQUA_BLE_AUTO_RECONNECT", "CHIHIROS_AUTO_RECONNECT"),
    ("AQUA_BLE_AUTO_DISCOVER", "CHIHIROS_AUTO_DISCOVER_ON_START"),
    ("AQUA_BLE_STATUS_WAIT", "CHIHIROS_STATUS_CAPTURE_WAIT"),
    ("AQUA_BLE_LOG_LEVEL", "CHIHIROS_LOG_LEVEL"),
    ("AQUA_BLE_AUTO_SAVE", "CHIHIROS_AUTO_SAVE_CONFIG"),
    ("AQUA_BLE_CONFIG_DIR", "CHIHIROS_CONFIG_DIR"),
];

static LEGACY_WARNING_LOGGED: AtomicBool = AtomicBool::new(false);

/// Read an environment variable, falling back to its legacy name.
pub fn env_with_fallback(name: &str) -> Option<String> {
    if let Ok(value) = std::env::var(name) {
        return Some(value);
    }
    let legacy = ENV_FALLBACKS
        .iter()
        .find(|(new, _)| *new == name)
        .map(|(_, old)| *old)?;
    let value = std::env::var(legacy).ok()?;
    if !LEGACY_WARNING_LOGGED.swap(true, Ordering::Relaxed) {
        tracing::warn!(
            "using deprecated environment variable '{legacy}'; please update to '{name}'"
        );
    }
    Some(value)
}

/// Parse a boolean setting; accepts `1/0/true/false/yes/no/on/off`.
pub fn env_bool(name: &str, default: bool) -> bool {
    let Some(raw) = env_with_fallback(name) else {
        return default;
    };
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "" => default,
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        other => other.parse::<i64>().map(|n| n != 0).unwrap_or(default),
    }
}

/// Parse a float setting, keeping the default on malformed input.
pub fn env_f64(name: &str, default: f64) -> f64 {
    let Some(raw) = env_with_fallback(name) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("invalid float value for {name}: '{raw}'; using default {default}");
            default
        }
    }
}

/// Parse an integer setting, keeping the default on malformed input.
pub fn env_u64(name: &str, default: u64) -> u64 {
    let Some(raw) = env_with_fallback(name) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("invalid integer value for {name}: '{raw}'; using default {default}");
            default
        }
    }
}

/// Resolved runtime settings for the daemon.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for persisted state and device configurations.
    pub config_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub auto_reconnect: bool,
    pub auto_discover_on_start: bool,
    pub auto_save_config: bool,
    /// How long to wait after a status request before reading `last_status`.
    pub status_capture_wait: Duration,
    /// Message-id session limits (see the device driver).
    pub msg_id_reset_hours: f64,
    pub msg_id_max_commands: u64,
}

impl Settings {
    /// Load settings from the environment.
    pub fn from_env() -> Settings {
        let config_dir = env_with_fallback("AQUA_BLE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_config_dir);
        let port = env_u64("AQUA_BLE_SERVICE_PORT", 8000).min(u64::from(u16::MAX)) as u16;

        Settings {
            config_dir,
            host: env_with_fallback("AQUA_BLE_SERVICE_HOST")
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            auto_reconnect: env_bool("AQUA_BLE_AUTO_RECONNECT", true),
            auto_discover_on_start: env_bool("AQUA_BLE_AUTO_DISCOVER", false),
            auto_save_config: env_bool("AQUA_BLE_AUTO_SAVE", true),
            status_capture_wait: Duration::from_secs_f64(
                env_f64("AQUA_BLE_STATUS_WAIT", 1.5).max(0.0),
            ),
            msg_id_reset_hours: env_f64("AQUA_MSG_ID_RESET_HOURS", 24.0),
            msg_id_max_commands: env_u64("AQUA_MSG_ID_MAX_COMMANDS", 1000),
        }
    }

    /// Log level string for the tracing filter.
    pub fn log_level() -> String {
        env_with_fallback("AQUA_BLE_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
    }

    pub fn state_path(&self) -> PathBuf {
        self.config_dir.join("state.json")
    }

    pub fn devices_dir(&self) -> PathBuf {
        self.config_dir.join("devices")
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            config_dir: default_config_dir(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            auto_reconnect: true,
            auto_discover_on_start: false,
            auto_save_config: true,
            status_capture_wait: Duration::from_secs_f64(1.5),
            msg_id_reset_hours: 24.0,
            msg_id_max_commands: 1000,
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".aqua-ble")
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-global, so these tests use unique
    // variable names instead of the real setting names.

    #[test]
    fn test_bool_parsing_accepted_spellings() {
        for (raw, expected) in [
            ("1", true),
            ("true", true),
            ("YES", true),
            ("on", true),
            ("0", false),
            ("false", false),
            ("No", false),
            ("off", false),
        ] {
            std::env::set_var("AQUA_TEST_BOOL", raw);
            assert_eq!(env_bool("AQUA_TEST_BOOL", !expected), expected, "raw={raw}");
        }
        std::env::remove_var("AQUA_TEST_BOOL");
        assert!(env_bool("AQUA_TEST_BOOL", true));
        assert!(!env_bool("AQUA_TEST_BOOL", false));
    }

    #[test]
    fn test_bool_parsing_garbage_keeps_default() {
        std::env::set_var("AQUA_TEST_BOOL_GARBAGE", "maybe");
        assert!(env_bool("AQUA_TEST_BOOL_GARBAGE", true));
        assert!(!env_bool("AQUA_TEST_BOOL_GARBAGE", false));
        std::env::remove_var("AQUA_TEST_BOOL_GARBAGE");
    }

    #[test]
    fn test_float_parsing() {
        std::env::set_var("AQUA_TEST_FLOAT", "2.25");
        assert_eq!(env_f64("AQUA_TEST_FLOAT", 1.5), 2.25);
        std::env::set_var("AQUA_TEST_FLOAT", "junk");
        assert_eq!(env_f64("AQUA_TEST_FLOAT", 1.5), 1.5);
        std::env::remove_var("AQUA_TEST_FLOAT");
    }

    #[test]
    fn test_legacy_fallback_used_when_new_name_missing() {
        std::env::remove_var("AQUA_BLE_STATUS_WAIT");
        std::env::set_var("CHIHIROS_STATUS_CAPTURE_WAIT", "3.5");
        assert_eq!(env_f64("AQUA_BLE_STATUS_WAIT", 1.5), 3.5);

        // The new name wins when both are set.
        std::env::set_var("AQUA_BLE_STATUS_WAIT", "2.0");
        assert_eq!(env_f64("AQUA_BLE_STATUS_WAIT", 1.5), 2.0);
        std::env::remove_var("AQUA_BLE_STATUS_WAIT");
        std::env::remove_var("CHIHIROS_STATUS_CAPTURE_WAIT");
    }

    #[test]
    fn test_default_settings_paths() {
        let settings = Settings::default();
        assert!(settings.state_path().ends_with("state.json"));
        assert!(settings.devices_dir().ends_with("devices"));
    }
}
