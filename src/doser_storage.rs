//! Persistent configuration documents for dosing pumps.
//!
//! Each device owns an ordered list of named configurations; a configuration
//! is a contiguous chain of immutable revisions, and every revision snapshots
//! one to four head definitions. Documents are stored one-per-device as
//! `devices/<address>.json` and validated on every load and store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::storage_util::{
    ensure_unique, filter_device_json_files, now_iso, time_to_minutes, unwrap_device_envelope,
    wrap_device_envelope, write_json_atomic, ConfigError, METADATA_SUFFIX,
};

/// Three-letter weekday names used in stored recurrence lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl std::fmt::Display for Weekday {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Weekday::Mon => "Mon",
            Weekday::Tue => "Tue",
            Weekday::Wed => "Wed",
            Weekday::Thu => "Thu",
            Weekday::Fri => "Fri",
            Weekday::Sat => "Sat",
            Weekday::Sun => "Sun",
        };
        f.write_str(name)
    }
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];

    pub fn from_short_name(name: &str) -> Option<Weekday> {
        Weekday::ALL.iter().copied().find(|d| d.to_string() == name)
    }
}

/// The weekdays a schedule runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recurrence {
    pub days: Vec<Weekday>,
}

impl Recurrence {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.days.is_empty() {
            return Err(ConfigError::invalid(
                "recurrence must include at least one day",
            ));
        }
        ensure_unique(&self.days, "weekday")
    }
}

/// Container volume tracking metadata for a dosing head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VolumeTracking {
    pub enabled: bool,
    #[serde(default)]
    pub capacity_ml: Option<f64>,
    #[serde(default)]
    pub current_ml: Option<f64>,
    #[serde(default)]
    pub low_threshold_ml: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl VolumeTracking {
    fn validate(&self) -> Result<(), ConfigError> {
        for (label, value) in [
            ("capacityMl", self.capacity_ml),
            ("currentMl", self.current_ml),
            ("lowThresholdMl", self.low_threshold_ml),
        ] {
            if let Some(v) = value {
                if v < 0.0 {
                    return Err(ConfigError::invalid(format!(
                        "{label} must be non-negative"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Calibration mapping seconds of pumping to millilitres. Stored verbatim;
/// no calibration math happens in the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Calibration {
    pub ml_per_second: f64,
    pub last_calibrated_at: String,
}

impl Calibration {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.ml_per_second <= 0.0 {
            return Err(ConfigError::invalid("mlPerSecond must be positive"));
        }
        Ok(())
    }
}

/// Runtime statistics for a dosing head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DoserHeadStats {
    #[serde(default)]
    pub doses_today: Option<u32>,
    #[serde(default)]
    pub ml_dispensed_today: Option<f64>,
}

/// A single period within a custom-periods schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CustomPeriod {
    pub start_time: String,
    pub end_time: String,
    pub doses: u32,
}

/// A timed single dose within a timer schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimerDose {
    pub time: String,
    pub quantity_ml: f64,
}

/// Tagged schedule variants for a dosing head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Schedule {
    Single {
        daily_dose_ml: f64,
        start_time: String,
    },
    EveryHour {
        daily_dose_ml: f64,
        start_time: String,
    },
    CustomPeriods {
        daily_dose_ml: f64,
        periods: Vec<CustomPeriod>,
    },
    Timer {
        doses: Vec<TimerDose>,
        #[serde(default)]
        default_dose_quantity_ml: Option<f64>,
        #[serde(default)]
        daily_dose_ml: Option<f64>,
    },
}

impl Schedule {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Schedule::Single {
                daily_dose_ml,
                start_time,
            }
            | Schedule::EveryHour {
                daily_dose_ml,
                start_time,
            } => {
                if *daily_dose_ml <= 0.0 {
                    return Err(ConfigError::invalid("dailyDoseMl must be positive"));
                }
                time_to_minutes(start_time)?;
                Ok(())
            }
            Schedule::CustomPeriods {
                daily_dose_ml,
                periods,
            } => {
                if *daily_dose_ml <= 0.0 {
                    return Err(ConfigError::invalid("dailyDoseMl must be positive"));
                }
                if periods.is_empty() {
                    return Err(ConfigError::invalid(
                        "custom periods schedule requires at least one period",
                    ));
                }
                let mut total = 0u32;
                for period in periods {
                    time_to_minutes(&period.start_time)?;
                    time_to_minutes(&period.end_time)?;
                    if period.doses < 1 {
                        return Err(ConfigError::invalid(
                            "each custom period requires at least one dose",
                        ));
                    }
                    total += period.doses;
                }
                if total > 24 {
                    return Err(ConfigError::invalid(
                        "custom periods schedule cannot exceed 24 doses in total",
                    ));
                }
                Ok(())
            }
            Schedule::Timer {
                doses,
                default_dose_quantity_ml,
                daily_dose_ml,
            } => {
                if doses.is_empty() {
                    return Err(ConfigError::invalid(
                        "timer schedule requires at least one dose",
                    ));
                }
                if doses.len() > 24 {
                    return Err(ConfigError::invalid(
                        "timer schedule cannot include more than 24 doses",
                    ));
                }
                for dose in doses {
                    time_to_minutes(&dose.time)?;
                    if dose.quantity_ml <= 0.0 {
                        return Err(ConfigError::invalid("dose quantityMl must be positive"));
                    }
                }
                for value in [default_dose_quantity_ml, daily_dose_ml].into_iter().flatten() {
                    if *value <= 0.0 {
                        return Err(ConfigError::invalid(
                            "timer schedule volumes must be positive",
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

/// A dosing head: schedule, recurrence, calibration and stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DoserHead {
    pub index: u8,
    #[serde(default)]
    pub label: Option<String>,
    pub active: bool,
    pub schedule: Schedule,
    pub recurrence: Recurrence,
    pub missed_dose_compensation: bool,
    #[serde(default)]
    pub volume_tracking: Option<VolumeTracking>,
    pub calibration: Calibration,
    #[serde(default)]
    pub stats: Option<DoserHeadStats>,
}

impl DoserHead {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=4).contains(&self.index) {
            return Err(ConfigError::invalid(format!(
                "head index must be 1-4, got {}",
                self.index
            )));
        }
        self.schedule.validate()?;
        self.recurrence.validate()?;
        self.calibration.validate()?;
        if let Some(tracking) = &self.volume_tracking {
            tracking.validate()?;
        }
        Ok(())
    }
}

/// A single revision snapshot of head definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigurationRevision {
    pub revision: u32,
    pub saved_at: String,
    pub heads: Vec<DoserHead>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub saved_by: Option<String>,
}

impl ConfigurationRevision {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.revision < 1 {
            return Err(ConfigError::invalid("revision numbers start at 1"));
        }
        if self.heads.is_empty() {
            return Err(ConfigError::invalid(
                "configuration revision must include at least one head",
            ));
        }
        if self.heads.len() > 4 {
            return Err(ConfigError::invalid(
                "configuration revision cannot have more than four heads",
            ));
        }
        let indices: Vec<u8> = self.heads.iter().map(|h| h.index).collect();
        ensure_unique(&indices, "head index")?;
        for head in &self.heads {
            head.validate()?;
        }
        Ok(())
    }
}

/// A named configuration made of sequential revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceConfiguration {
    pub id: String,
    pub name: String,
    pub revisions: Vec<ConfigurationRevision>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl DeviceConfiguration {
    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.revisions.is_empty() {
            return Err(ConfigError::invalid(
                "device configuration must include at least one revision",
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
                    "configuration revision numbers must increase sequentially",
                ));
            }
        }
        for revision in &self.revisions {
            revision.validate()?;
        }
        Ok(())
    }

    /// The most recent revision in this configuration.
    pub fn latest_revision(&self) -> &ConfigurationRevision {
        self.revisions.last().expect("validated configuration has revisions")
    }

    pub fn latest_revision_mut(&mut self) -> &mut ConfigurationRevision {
        self.revisions.last_mut().expect("validated configuration has revisions")
    }
}

/// Top-level document for a dosing pump, keyed by device address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DoserDevice {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub timezone: String,
    pub configurations: Vec<DeviceConfiguration>,
    #[serde(default)]
    pub active_configuration_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl DoserDevice {
    /// Validate document invariants; also defaults the active configuration
    /// to the first one when unset.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.configurations.is_empty() {
            return Err(ConfigError::invalid(
                "a doser device must have at least one configuration",
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
            configuration.validate()?;
        }
        Ok(())
    }

    pub fn get_configuration(&self, configuration_id: &str) -> Result<&DeviceConfiguration, ConfigError> {
        self.configurations
            .iter()
            .find(|c| c.id == configuration_id)
            .ok_or_else(|| ConfigError::ConfigurationNotFound(configuration_id.to_string()))
    }

    /// The currently active configuration.
    pub fn active_configuration(&self) -> Result<&DeviceConfiguration, ConfigError> {
        let id = self
            .active_configuration_id
            .as_deref()
            .ok_or_else(|| ConfigError::invalid("device has no active configuration"))?;
        self.get_configuration(id)
    }

    pub fn active_configuration_mut(&mut self) -> Result<&mut DeviceConfiguration, ConfigError> {
        let id = self
            .active_configuration_id
            .clone()
            .ok_or_else(|| ConfigError::invalid("device has no active configuration"))?;
        self.configurations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(ConfigError::ConfigurationNotFound(id))
    }
}

/// Names-only device metadata for server-side storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceMetadata {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub head_names: Option<BTreeMap<u8, String>>,
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Extra knobs for [`DoserStorage::create_configuration`].
#[derive(Debug, Default)]
pub struct NewConfiguration {
    pub description: Option<String>,
    pub configuration_id: Option<String>,
    pub saved_by: Option<String>,
    pub note: Option<String>,
    pub saved_at: Option<String>,
    pub set_active: bool,
}

/// JSON-file-backed store for dosing pump configurations, one file per
/// device address.
pub struct DoserStorage {
    base_path: PathBuf,
}

impl DoserStorage {
    const DEVICE_TYPE: &'static str = "doser";

    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let base_path = path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(DoserStorage { base_path })
    }

    fn device_file_path(&self, device_id: &str) -> PathBuf {
        self.base_path.join(format!("{device_id}.json"))
    }

    fn read_device_file(&self, device_id: &str) -> Result<Option<DoserDevice>, ConfigError> {
        let path = self.device_file_path(device_id);
        read_stored_document(&path, Self::DEVICE_TYPE)?
            .map(|value| {
                let mut device: DoserDevice =
                    serde_json::from_value(value).map_err(|e| ConfigError::Parse {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                device.validate()?;
                Ok(device)
            })
            .transpose()
    }

    fn write_device_file(&self, device: &DoserDevice) -> Result<(), ConfigError> {
        let path = self.device_file_path(&device.id);
        let data = wrap_device_envelope(
            Self::DEVICE_TYPE,
            &device.id,
            serde_json::to_value(device).expect("device serializes"),
        );
        write_json_atomic(&path, &data)?;
        Ok(())
    }

    /// All persisted devices; unparsable files are logged and skipped.
    pub fn list_devices(&self) -> Vec<DoserDevice> {
        let mut devices = Vec::new();
        for file in filter_device_json_files(&self.base_path) {
            let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_device_file(stem) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("could not load device from {}: {err}", file.display());
                }
            }
        }
        devices
    }

    pub fn get_device(&self, device_id: &str) -> Result<Option<DoserDevice>, ConfigError> {
        self.read_device_file(device_id)
    }

    fn require_device(&self, device_id: &str) -> Result<DoserDevice, ConfigError> {
        self.get_device(device_id)?
            .ok_or_else(|| ConfigError::DeviceNotFound(device_id.to_string()))
    }

    /// Validate and persist a device document.
    pub fn upsert_device(&self, mut device: DoserDevice) -> Result<DoserDevice, ConfigError> {
        device.validate()?;
        self.write_device_file(&device)?;
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
    ) -> Result<Vec<DeviceConfiguration>, ConfigError> {
        Ok(self.require_device(device_id)?.configurations)
    }

    pub fn get_configuration(
        &self,
        device_id: &str,
        configuration_id: &str,
    ) -> Result<DeviceConfiguration, ConfigError> {
        let device = self.require_device(device_id)?;
        device.get_configuration(configuration_id).cloned()
    }

    /// Create and append a new named configuration for a device.
    pub fn create_configuration(
        &self,
        device_id: &str,
        name: &str,
        heads: Vec<DoserHead>,
        options: NewConfiguration,
    ) -> Result<DeviceConfiguration, ConfigError> {
        let mut device = self.require_device(device_id)?;

        let new_id = options
            .configuration_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if device.configurations.iter().any(|c| c.id == new_id) {
            return Err(ConfigError::invalid(format!(
                "configuration '{new_id}' already exists for device '{device_id}'"
            )));
        }

        let timestamp = options.saved_at.unwrap_or_else(now_iso);
        let configuration = DeviceConfiguration {
            id: new_id.clone(),
            name: name.to_string(),
            description: options.description,
            created_at: timestamp.clone(),
            updated_at: timestamp.clone(),
            revisions: vec![ConfigurationRevision {
                revision: 1,
                saved_at: timestamp.clone(),
                heads,
                note: options.note,
                saved_by: options.saved_by,
            }],
        };
        device.configurations.push(configuration.clone());
        device.updated_at = Some(timestamp);
        if options.set_active || device.active_configuration_id.is_none() {
            device.active_configuration_id = Some(new_id);
        }

        self.upsert_device(device)?;
        Ok(configuration)
    }

    /// Append a new revision to an existing configuration.
    pub fn add_revision(
        &self,
        device_id: &str,
        configuration_id: &str,
        heads: Vec<DoserHead>,
        note: Option<String>,
        saved_by: Option<String>,
    ) -> Result<ConfigurationRevision, ConfigError> {
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
        let revision = ConfigurationRevision {
            revision: next_revision,
            saved_at: timestamp.clone(),
            heads,
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
    ) -> Result<DeviceConfiguration, ConfigError> {
        let mut device = self.require_device(device_id)?;
        let configuration = device.get_configuration(configuration_id)?.clone();
        device.active_configuration_id = Some(configuration.id.clone());
        device.updated_at = Some(now_iso());
        self.upsert_device(device)?;
        Ok(configuration)
    }

    /// Names-only metadata derived from the stored document, if present.
    pub fn get_device_metadata(&self, device_id: &str) -> Result<Option<DeviceMetadata>, ConfigError> {
        let Some(device) = self.get_device(device_id)? else {
            return Ok(None);
        };

        let mut head_names = BTreeMap::new();
        if let Some(configuration) = device.configurations.last() {
            if let Some(revision) = configuration.revisions.last() {
                for head in &revision.heads {
                    if let Some(label) = &head.label {
                        head_names.insert(head.index, label.clone());
                    }
                }
            }
        }

        Ok(Some(DeviceMetadata {
            id: device.id,
            name: device.name,
            timezone: device.timezone,
            head_names: (!head_names.is_empty()).then_some(head_names),
            auto_reconnect: false,
            created_at: device.created_at,
            updated_at: device.updated_at,
        }))
    }

    /// Store metadata: merged into the full document when one exists,
    /// otherwise written as a lightweight `.metadata.json` file.
    pub fn upsert_device_metadata(
        &self,
        mut metadata: DeviceMetadata,
    ) -> Result<DeviceMetadata, ConfigError> {
        let timestamp = now_iso();
        metadata.updated_at = Some(timestamp.clone());

        if let Some(mut device) = self.get_device(&metadata.id)? {
            device.name = metadata.name.clone();
            device.timezone = metadata.timezone.clone();
            device.updated_at = Some(timestamp);
            if let Some(head_names) = &metadata.head_names {
                if let Some(configuration) = device.configurations.last_mut() {
                    if let Some(revision) = configuration.revisions.last_mut() {
                        for head in &mut revision.heads {
                            if let Some(label) = head_names.get(&head.index) {
                                head.label = Some(label.clone());
                            }
                        }
                    }
                }
            }
            self.upsert_device(device)?;
        } else {
            if metadata.created_at.is_none() {
                metadata.created_at = Some(timestamp);
            }
            let path = self
                .base_path
                .join(format!("{}{METADATA_SUFFIX}", metadata.id));
            write_json_atomic(&path, &metadata)?;
        }
        Ok(metadata)
    }

    /// Metadata for every known device, from full documents and
    /// metadata-only files alike.
    pub fn list_device_metadata(&self) -> Vec<DeviceMetadata> {
        let mut all = Vec::new();
        for device in self.list_devices() {
            if let Ok(Some(metadata)) = self.get_device_metadata(&device.id) {
                all.push(metadata);
            }
        }
        let Ok(entries) = std::fs::read_dir(&self.base_path) else {
            return all;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(METADATA_SUFFIX) {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(metadata) = serde_json::from_str::<DeviceMetadata>(&text) else {
                continue;
            };
            if !all.iter().any(|m: &DeviceMetadata| m.id == metadata.id) {
                all.push(metadata);
            }
        }
        all
    }
}

/// Read and envelope-unwrap a stored document; `None` when the file is
/// missing, empty, or for another device type.
pub(crate) fn read_stored_document(
    path: &Path,
    expected_type: &str,
) -> Result<Option<Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let data: Value = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(unwrap_device_envelope(data, expected_type))
}

/// A minimal valid head used as the template for defaults and tests.
pub fn default_head(index: u8, timestamp: &str) -> DoserHead {
    DoserHead {
        index,
        label: Some(format!("Head {index}")),
        active: false,
        schedule: Schedule::Single {
            daily_dose_ml: 10.0,
            start_time: "09:00".to_string(),
        },
        recurrence: Recurrence {
            days: Weekday::ALL.to_vec(),
        },
        missed_dose_compensation: false,
        volume_tracking: None,
        calibration: Calibration {
            ml_per_second: 0.1,
            last_calibrated_at: timestamp.to_string(),
        },
        stats: Some(DoserHeadStats {
            doses_today: Some(0),
            ml_dispensed_today: Some(0.0),
        }),
    }
}

#[cfg(test)]
pub(crate) fn sample_device(address: &str) -> DoserDevice {
    let timestamp = now_iso();
    DoserDevice {
        id: address.to_string(),
        name: Some("Test Doser".to_string()),
        timezone: "UTC".to_string(),
        configurations: vec![DeviceConfiguration {
            id: "default".to_string(),
            name: "Default Configuration".to_string(),
            description: None,
            created_at: timestamp.clone(),
            updated_at: timestamp.clone(),
            revisions: vec![ConfigurationRevision {
                revision: 1,
                saved_at: timestamp.clone(),
                heads: (1..=4).map(|i| default_head(i, &timestamp)).collect(),
                note: None,
                saved_by: None,
            }],
        }],
        active_configuration_id: Some("default".to_string()),
        created_at: Some(timestamp.clone()),
        updated_at: Some(timestamp),
    }
}
