//! Persistent profile documents for light devices.
//!
//! Same revisioned envelope as the pump store: a device owns named
//! configurations, each a contiguous chain of revisions. A light revision
//! carries one tagged profile (manual levels, custom curve, or auto
//! programs), validated against the device's declared channels.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::doser_storage::{read_stored_document, Weekday};
use crate::storage_util::{
    ensure_unique, filter_device_json_files, now_iso, time_to_minutes, wrap_device_envelope,
    write_json_atomic, ConfigError,
};

/// Per-channel level values keyed by channel key.
pub type ChannelLevels = BTreeMap<String, u32>;

/// Definition of a color/level channel exposed by a light device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelDef {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub min: u32,
    #[serde(default = "default_channel_max")]
    pub max: u32,
    #[serde(default = "default_channel_step")]
    pub step: u32,
}

fn default_channel_max() -> u32 {
    100
}

fn default_channel_step() -> u32 {
    1
}

impl ChannelDef {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.key.is_empty() {
            return Err(ConfigError::invalid("channel key cannot be empty"));
        }
        if self.max < self.min {
            return Err(ConfigError::invalid(
                "channel max must be greater than or equal to min",
            ));
        }
        if self.step == 0 {
            return Err(ConfigError::invalid("channel step must be a positive integer"));
        }
        Ok(())
    }
}

/// A timed level point within a custom profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomPoint {
    pub time: String,
    pub levels: ChannelLevels,
}

/// Interpolation between custom profile points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Step,
    Linear,
}

/// An auto program describing a sunrise/sunset transition for given days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AutoProgram {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub enabled: bool,
    pub days: Vec<Weekday>,
    pub sunrise: String,
    pub sunset: String,
    pub ramp_minutes: u32,
    pub levels: ChannelLevels,
}

impl AutoProgram {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::invalid("auto program id cannot be empty"));
        }
        if self.days.is_empty() {
            return Err(ConfigError::invalid(
                "auto program must include at least one day",
            ));
        }
        ensure_unique(&self.days, "day")?;
        if time_to_minutes(&self.sunset)? <= time_to_minutes(&self.sunrise)? {
            return Err(ConfigError::invalid("sunset must be after sunrise"));
        }
        Ok(())
    }
}

/// Tagged profile variants for a light revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Profile {
    Manual {
        levels: ChannelLevels,
    },
    Custom {
        interpolation: Interpolation,
        points: Vec<CustomPoint>,
    },
    Auto {
        programs: Vec<AutoProgram>,
    },
}

impl Profile {
    fn validate(&self, channels: &BTreeMap<String, ChannelDef>) -> Result<(), ConfigError> {
        match self {
            Profile::Manual { levels } => validate_levels_for_channels(levels, channels),
            Profile::Custom {
                interpolation: _,
                points,
            } => {
                if points.is_empty() {
                    return Err(ConfigError::invalid(
                        "custom profile requires at least one point",
                    ));
                }
                if points.len() > 24 {
                    return Err(ConfigError::invalid(
                        "custom profile cannot contain more than 24 points",
                    ));
                }
                let mut times = Vec::with_capacity(points.len());
                for point in points {
                    times.push(time_to_minutes(&point.time)?);
                    validate_levels_for_channels(&point.levels, channels)?;
                }
                if times.windows(2).any(|w| w[1] <= w[0]) {
                    return Err(ConfigError::invalid(
                        "custom profile point times must be strictly increasing",
                    ));
                }
                Ok(())
            }
            Profile::Auto { programs } => {
                if programs.len() > 7 {
                    return Err(ConfigError::invalid(
                        "auto profile cannot include more than 7 programs",
                    ));
                }
                for program in programs {
                    program.validate()?;
                    validate_levels_for_channels(&program.levels, channels)?;
                }
                Ok(())
            }
        }
    }
}

fn validate_levels_for_channels(
    levels: &ChannelLevels,
    channels: &BTreeMap<String, ChannelDef>,
) -> Result<(), ConfigError> {
    for key in channels.keys() {
        if !levels.contains_key(key) {
            return Err(ConfigError::invalid(format!(
                "missing level for channel '{key}'"
            )));
        }
    }
    for (key, &value) in levels {
        let Some(definition) = channels.get(key) else {
            return Err(ConfigError::invalid(format!(
                "unexpected channel level provided: '{key}'"
            )));
        };
        if value < definition.min || value > definition.max {
            return Err(ConfigError::invalid(format!(
                "channel '{key}' level {value} outside of range {}-{}",
                definition.min, definition.max
            )));
        }
        if (value - definition.min) % definition.step != 0 {
            return Err(ConfigError::invalid(format!(
                "channel '{key}' level {value} must align with step {} from {}",
                definition.step, definition.min
            )));
        }
    }
    Ok(())
}

/// A revision of a light device profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LightProfileRevision {
    pub revision: u32,
    pub saved_at: String,
    pub profile: Profile,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub saved_by: Option<String>,
}

/// A named configuration containing profile revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LightConfiguration {
    pub id: String,
    pub name: String,
    pub revisions: Vec<LightProfileRevision>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl LightConfiguration {
    fn validate(&mut self, channels: &BTreeMap<String, ChannelDef>) -> Result<(), ConfigError> {
        if self.revisions.is_empty() {
            return Err(ConfigError::invalid(
                "configuration must include at least one revision",
            ));
        }
        self.revisions.sort_by_key(|revision| revision.revision);
        let numbers: Vec<u32> = self.revisions.iter().map(|r| r.revision).collect();
        ensure_unique(&numbers, "revision number")?;
        if numbers[0] != 1 {
            return Err(ConfigError::invalid("configuration revisions must start at 1"));
        }
        for pair in numbers.windows(2) {
            if pair[1] != pair[0] + 1 {
                return Err(ConfigError::invalid(
                    "configuration revisions must increase sequentially",
                ));
            }
        }
        for revision in &self.revisions {
            revision.profile.validate(channels)?;
        }
        Ok(())
    }

    /// The most recent profile revision for this configuration.
    pub fn latest_revision(&self) -> &LightProfileRevision {
        self.revisions.last().expect("validated configuration has revisions")
    }
}

/// Top-level light device document: declared channels plus configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LightDevice {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub timezone: String,
    pub channels: Vec<ChannelDef>,
    pub configurations: Vec<LightConfiguration>,
    #[serde(default)]
    pub active_configuration_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl LightDevice {
    /// Validate device invariants; defaults the active configuration to the
    /// first one when unset.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::invalid(
                "light device must define at least one channel",
            ));
        }
        let keys: Vec<String> = self.channels.iter().map(|c| c.key.clone()).collect();
        ensure_unique(&keys, "channel key")?;
        let mut channel_map = BTreeMap::new();
        for channel in &self.channels {
            channel.validate()?;
            channel_map.insert(channel.key.clone(), channel.clone());
        }

        if self.configurations.is_empty() {
            return Err(ConfigError::invalid(
                "light device must have at least one configuration",
            ));
        }
        let ids: Vec<String> = self.configurations.iter().map(|c| c.id.clone()).collect();
        ensure_unique(&ids, "configuration id")?;
        match &self.active_configuration_id {
            None => self.active_configuration_id = Some(ids[0].clone()),
            Some(active) => {
                if !ids.contains(active) {
                    return Err(ConfigError::invalid(
                        "active configuration id does not match any configuration",
                    ));
                }
            }
        }
        for configuration in &mut self.configurations {
            configuration.validate(&channel_map)?;
        }
        Ok(())
    }

    pub fn get_configuration(
        &self,
        configuration_id: &str,
    ) -> Result<&LightConfiguration, ConfigError> {
        self.configurations
            .iter()
            .find(|c| c.id == configuration_id)
            .ok_or_else(|| ConfigError::ConfigurationNotFound(configuration_id.to_string()))
    }

    /// The currently active configuration.
    pub fn active_configuration(&self) -> Result<&LightConfiguration, ConfigError> {
        let id = self
            .active_configuration_id
            .as_deref()
            .ok_or_else(|| ConfigError::invalid("device has no active configuration"))?;
        self.get_configuration(id)
    }
}

/// JSON-file-backed store for light device profiles, one file per address.
pub struct LightStorage {
    base_path: PathBuf,
}

impl LightStorage {
    const DEVICE_TYPE: &'static str = "light";

    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let base_path = path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(LightStorage { base_path })
    }

    fn device_file_path(&self, device_id: &str) -> PathBuf {
        self.base_path.join(format!("{device_id}.json"))
    }

    fn read_device_file(&self, device_id: &str) -> Result<Option<LightDevice>, ConfigError> {
        let path = self.device_file_path(device_id);
        read_stored_document(&path, Self::DEVICE_TYPE)?
            .map(|value| {
                let mut device: LightDevice =
                    serde_json::from_value(value).map_err(|e| ConfigError::Parse {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                device.validate()?;
                Ok(device)
            })
            .transpose()
    }

    /// All persisted light devices; unparsable files are logged and skipped.
    pub fn list_devices(&self) -> Vec<LightDevice> {
        let mut devices = Vec::new();
        for file in filter_device_json_files(&self.base_path) {
            let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_device_file(stem) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("could not load light device from {}: {err}", file.display());
                }
            }
        }
        devices
    }

    pub fn get_device(&self, device_id: &str) -> Result<Option<LightDevice>, ConfigError> {
        self.read_device_file(device_id)
    }

    fn require_device(&self, device_id: &str) -> Result<LightDevice, ConfigError> {
        self.get_device(device_id)?
            .ok_or_else(|| ConfigError::DeviceNotFound(device_id.to_string()))
    }

    /// Validate and persist a device document.
    pub fn upsert_device(&self, mut device: LightDevice) -> Result<LightDevice, ConfigError> {
        device.validate()?;
        let data = wrap_device_envelope(
            Self::DEVICE_TYPE,
            &device.id,
            serde_json::to_value(&device).expect("device serializes"),
        );
        write_json_atomic(&self.device_file_path(&device.id), &data)?;
        Ok(device)
    }

    pub fn delete_device(&self, device_id: &str) -> Result<bool, ConfigError> {
        let path = self.device_file_path(device_id);
        if path.exists() {
            std::fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn list_configurations(
        &self,
        device_id: &str,
    ) -> Result<Vec<LightConfiguration>, ConfigError> {
        Ok(self.require_device(device_id)?.configurations)
    }

    pub fn get_configuration(
        &self,
        device_id: &str,
        configuration_id: &str,
    ) -> Result<LightConfiguration, ConfigError> {
        let device = self.require_device(device_id)?;
        device.get_configuration(configuration_id).cloned()
    }

    /// Append a new profile revision to an existing configuration.
    pub fn add_revision(
        &self,
        device_id: &str,
        configuration_id: &str,
        profile: Profile,
        note: Option<String>,
        saved_by: Option<String>,
    ) -> Result<LightProfileRevision, ConfigError> {
        let mut device = self.require_device(device_id)?;
        let timestamp = now_iso();

        let configuration = device
            .configurations
            .iter_mut()
            .find(|c| c.id == configuration_id)
            .ok_or_else(|| ConfigError::ConfigurationNotFound(configuration_id.to_string()))?;

        let next_revision = configuration
            .revisions
            .iter()
            .map(|r| r.revision)
            .max()
            .unwrap_or(0)
            + 1;
        let revision = LightProfileRevision {
            revision: next_revision,
            saved_at: timestamp.clone(),
            profile,
            note,
            saved_by,
        };
        configuration.revisions.push(revision.clone());
        configuration.updated_at = timestamp.clone();
        device.updated_at = Some(timestamp);

        self.upsert_device(device)?;
        Ok(revision)
    }

    /// Point the device at a different stored configuration.
    pub fn set_active_configuration(
        &self,
        device_id: &str,
        configuration_id: &str,
    ) -> Result<LightConfiguration, ConfigError> {
        let mut device = self.require_device(device_id)?;
        let configuration = device.get_configuration(configuration_id)?.clone();
        device.active_configuration_id = Some(configuration.id.clone());
        device.updated_at = Some(now_iso());
        self.upsert_device(device)?;
        Ok(configuration)
    }
}

/// Build a fresh light document around a single profile revision.
pub fn new_light_device(
    address: &str,
    name: Option<String>,
    timezone: String,
    channels: Vec<ChannelDef>,
    profile: Profile,
) -> LightDevice {
    let timestamp = now_iso();
    let configuration_id = Uuid::new_v4().to_string();
    LightDevice {
        id: address.to_string(),
        name,
        timezone,
        channels,
        configurations: vec![LightConfiguration {
            id: configuration_id.clone(),
            name: "Default Configuration".to_string(),
            description: None,
            created_at: timestamp.clone(),
            updated_at: timestamp.clone(),
            revisions: vec![LightProfileRevision {
                revision: 1,
                saved_at: timestamp.clone(),
                profile,
                note: None,
                saved_by: None,
            }],
        }],
        active_configuration_id: Some(configuration_id),
        created_at: Some(timestamp.clone()),
        updated_at: Some(timestamp),
    }
}

#[cfg(test)]
pub(crate) fn sample_light(address: &str) -> LightDevice {
    let channels = vec![
        ChannelDef {
            key: "red".into(),
            label: None,
            min: 0,
            max: 100,
            step: 1,
        },
        ChannelDef {
            key: "green".into(),
            label: None,
            min: 0,
            max: 100,
            step: 1,
        },
    ];
    let mut levels = ChannelLevels::new();
    levels.insert("red".into(), 80);
    levels.insert("green".into(), 40);
    let mut device = new_light_device(
        address,
        Some("Test Light".into()),
        "UTC".into(),
        channels,
        Profile::Manual { levels },
    );
    device.validate().unwrap();
    device
}
