//! Copy-on-write mutators for configuration documents.
//!
//! Every helper takes a document by reference and returns a freshly built
//! one; the input is never modified. The returned document is re-validated
//! before it is handed back, so a mutation either yields a consistent
//! document or an error and no partial state.

use crate::doser_storage::{
    default_head, ConfigurationRevision, DeviceConfiguration, DeviceMetadata, DoserDevice,
    DoserHead, Schedule, Weekday,
};
use crate::light_storage::{
    new_light_device, AutoProgram, ChannelDef, ChannelLevels, LightDevice, Profile,
};
use crate::protocol::{LightWeekday, PumpWeekday};
use crate::storage_util::{now_iso, ConfigError};

fn format_time(hour: u8, minute: u8) -> String {
    format!("{hour:02}:{minute:02}")
}

fn pump_weekdays_to_days(weekdays: &[PumpWeekday]) -> Vec<Weekday> {
    let mut days = Vec::new();
    for weekday in weekdays {
        for name in weekday.short_names() {
            if let Some(day) = Weekday::from_short_name(name) {
                if !days.contains(&day) {
                    days.push(day);
                }
            }
        }
    }
    days
}

fn light_weekdays_to_days(weekdays: &[LightWeekday]) -> Vec<Weekday> {
    let mut days = Vec::new();
    for weekday in weekdays {
        for name in weekday.short_names() {
            if let Some(day) = Weekday::from_short_name(name) {
                if !days.contains(&day) {
                    days.push(day);
                }
            }
        }
    }
    days
}

/// Atomically update a dosing head's schedule in the active configuration's
/// latest revision. `head_index` is the document index (1-4).
pub fn atomic_update_doser_schedule(
    device: &DoserDevice,
    head_index: u8,
    volume_tenths_ml: u16,
    hour: u8,
    minute: u8,
    weekdays: Option<&[PumpWeekday]>,
) -> Result<DoserDevice, ConfigError> {
    let mut updated = device.clone();
    let timestamp = now_iso();

    let configuration = updated.active_configuration_mut()?;
    let revision = configuration.latest_revision_mut();
    let head = revision
        .heads
        .iter_mut()
        .find(|head| head.index == head_index)
        .ok_or_else(|| {
            ConfigError::invalid(format!(
                "head {head_index} not found in device {} configuration",
                device.id
            ))
        })?;

    head.active = true;
    head.schedule = Schedule::Single {
        daily_dose_ml: f64::from(volume_tenths_ml) / 10.0,
        start_time: format_time(hour, minute),
    };
    if let Some(weekdays) = weekdays {
        let days = pump_weekdays_to_days(weekdays);
        if !days.is_empty() {
            head.recurrence.days = days;
        }
    }

    configuration.updated_at = timestamp.clone();
    updated.updated_at = Some(timestamp);
    updated.validate()?;
    Ok(updated)
}

/// Atomically overwrite the non-null fields of a metadata record.
pub fn atomic_update_device_metadata(
    metadata: &DeviceMetadata,
    name: Option<String>,
    timezone: Option<String>,
    head_names: Option<std::collections::BTreeMap<u8, String>>,
) -> DeviceMetadata {
    let mut updated = metadata.clone();
    if let Some(name) = name {
        updated.name = Some(name);
    }
    if let Some(timezone) = timezone {
        updated.timezone = timezone;
    }
    if let Some(head_names) = head_names {
        updated.head_names = Some(head_names);
    }
    updated.updated_at = Some(now_iso());
    updated
}

/// Atomically append a new revision with the given heads to the active
/// configuration.
pub fn atomic_create_new_revision(
    device: &DoserDevice,
    heads: Vec<DoserHead>,
    note: Option<String>,
    saved_by: Option<String>,
) -> Result<DoserDevice, ConfigError> {
    let mut updated = device.clone();
    let timestamp = now_iso();

    let configuration = updated.active_configuration_mut()?;
    let next_revision = configuration.latest_revision().revision + 1;
    configuration.revisions.push(ConfigurationRevision {
        revision: next_revision,
        saved_at: timestamp.clone(),
        heads,
        note,
        saved_by,
    });
    configuration.updated_at = timestamp.clone();
    updated.updated_at = Some(timestamp);
    updated.validate()?;
    Ok(updated)
}

/// Build a fresh doser document from the arguments of a schedule command.
///
/// All four heads are created from the default template, with the commanded
/// head configured and active.
pub fn create_doser_config_from_command(
    address: &str,
    timezone: String,
    head_index: u8,
    volume_tenths_ml: u16,
    hour: u8,
    minute: u8,
    weekdays: Option<&[PumpWeekday]>,
) -> Result<DoserDevice, ConfigError> {
    let timestamp = now_iso();
    let heads: Vec<DoserHead> = (1..=4).map(|i| default_head(i, &timestamp)).collect();

    let mut device = DoserDevice {
        id: address.to_string(),
        name: Some(format!("Doser {}", short_address(address))),
        timezone,
        configurations: vec![DeviceConfiguration {
            id: "default".to_string(),
            name: "Default Configuration".to_string(),
            description: Some("Created from schedule command".to_string()),
            created_at: timestamp.clone(),
            updated_at: timestamp.clone(),
            revisions: vec![ConfigurationRevision {
                revision: 1,
                saved_at: timestamp.clone(),
                heads,
                note: Some("Created from schedule command".to_string()),
                saved_by: Some("system".to_string()),
            }],
        }],
        active_configuration_id: Some("default".to_string()),
        created_at: Some(timestamp.clone()),
        updated_at: Some(timestamp),
    };
    device.validate()?;
    atomic_update_doser_schedule(&device, head_index, volume_tenths_ml, hour, minute, weekdays)
}

/// Trailing address fragment used in generated device names.
fn short_address(address: &str) -> &str {
    let len = address.len();
    &address[len.saturating_sub(8)..]
}

/// Channel definitions derived from a model's color map.
pub fn channels_from_color_map(colors: &[(&str, u8)]) -> Vec<ChannelDef> {
    let mut sorted: Vec<_> = colors.to_vec();
    sorted.sort_by_key(|&(_, index)| index);
    sorted.dedup_by_key(|&mut (_, index)| index);
    sorted
        .into_iter()
        .map(|(name, _)| ChannelDef {
            key: name.to_string(),
            label: None,
            min: 0,
            max: 100,
            step: 1,
        })
        .collect()
}

fn manual_levels(channels: &[ChannelDef], value_for: impl Fn(&str) -> u32) -> ChannelLevels {
    channels
        .iter()
        .map(|channel| (channel.key.clone(), value_for(&channel.key)))
        .collect()
}

/// Atomically rewrite the latest revision of the active configuration with a
/// manual profile where `channel_key` is set to `brightness` and the other
/// channels keep their previous manual levels (zero when the previous
/// profile was not manual).
pub fn atomic_update_light_brightness(
    device: &LightDevice,
    channel_key: &str,
    brightness: u32,
) -> Result<LightDevice, ConfigError> {
    let mut updated = device.clone();
    let timestamp = now_iso();

    if !updated.channels.iter().any(|c| c.key == channel_key) {
        return Err(ConfigError::invalid(format!(
            "channel '{channel_key}' not defined for device {}",
            device.id
        )));
    }

    let previous: Option<ChannelLevels> = match &updated.active_configuration()?.latest_revision().profile {
        Profile::Manual { levels } => Some(levels.clone()),
        _ => None,
    };
    let levels = manual_levels(&updated.channels, |key| {
        if key == channel_key {
            brightness
        } else {
            previous.as_ref().and_then(|l| l.get(key).copied()).unwrap_or(0)
        }
    });

    let active_id = updated
        .active_configuration_id
        .clone()
        .ok_or_else(|| ConfigError::invalid("device has no active configuration"))?;
    let configuration = updated
        .configurations
        .iter_mut()
        .find(|c| c.id == active_id)
        .ok_or(ConfigError::ConfigurationNotFound(active_id))?;
    let revision = configuration
        .revisions
        .last_mut()
        .ok_or_else(|| ConfigError::invalid("configuration has no revisions"))?;
    revision.profile = Profile::Manual { levels };
    configuration.updated_at = timestamp.clone();
    updated.updated_at = Some(timestamp);
    updated.validate()?;
    Ok(updated)
}

/// Atomically append an auto program to the latest revision of the active
/// configuration, converting it to an auto profile when necessary.
pub fn atomic_add_light_auto_program(
    device: &LightDevice,
    sunrise: &str,
    sunset: &str,
    brightness: u32,
    ramp_minutes: u32,
    weekdays: Option<&[LightWeekday]>,
) -> Result<LightDevice, ConfigError> {
    let mut updated = device.clone();
    let timestamp = now_iso();

    let days = match weekdays {
        Some(weekdays) if !weekdays.is_empty() => light_weekdays_to_days(weekdays),
        _ => Weekday::ALL.to_vec(),
    };
    let levels = manual_levels(&updated.channels, |_| brightness);
    let program = AutoProgram {
        id: uuid::Uuid::new_v4().to_string(),
        label: None,
        enabled: true,
        days,
        sunrise: sunrise.to_string(),
        sunset: sunset.to_string(),
        ramp_minutes,
        levels,
    };

    let active_id = updated
        .active_configuration_id
        .clone()
        .ok_or_else(|| ConfigError::invalid("device has no active configuration"))?;
    let configuration = updated
        .configurations
        .iter_mut()
        .find(|c| c.id == active_id)
        .ok_or(ConfigError::ConfigurationNotFound(active_id))?;
    let revision = configuration
        .revisions
        .last_mut()
        .ok_or_else(|| ConfigError::invalid("configuration has no revisions"))?;
    match &mut revision.profile {
        Profile::Auto { programs } => {
            if programs.len() >= 7 {
                return Err(ConfigError::invalid(
                    "auto profile cannot include more than 7 programs",
                ));
            }
            programs.push(program);
        }
        other => {
            *other = Profile::Auto {
                programs: vec![program],
            };
        }
    }
    configuration.updated_at = timestamp.clone();
    updated.updated_at = Some(timestamp);
    updated.validate()?;
    Ok(updated)
}

/// Build a fresh light document from a brightness command.
pub fn create_light_config_from_brightness(
    address: &str,
    timezone: String,
    colors: &[(&str, u8)],
    channel_key: &str,
    brightness: u32,
) -> Result<LightDevice, ConfigError> {
    let channels = fallback_channels(colors);
    let levels = manual_levels(&channels, |key| if key == channel_key { brightness } else { 0 });
    let mut device = new_light_device(
        address,
        Some(format!("Light {}", short_address(address))),
        timezone,
        channels,
        Profile::Manual { levels },
    );
    device.validate()?;
    Ok(device)
}

/// Build a fresh light document from an add-auto-setting command.
pub fn create_light_config_from_auto_program(
    address: &str,
    timezone: String,
    colors: &[(&str, u8)],
    sunrise: &str,
    sunset: &str,
    brightness: u32,
    ramp_minutes: u32,
    weekdays: Option<&[LightWeekday]>,
) -> Result<LightDevice, ConfigError> {
    let channels = fallback_channels(colors);
    let levels = manual_levels(&channels, |_| 0);
    let device = new_light_device(
        address,
        Some(format!("Light {}", short_address(address))),
        timezone,
        channels,
        Profile::Manual { levels },
    );
    atomic_add_light_auto_program(&device, sunrise, sunset, brightness, ramp_minutes, weekdays)
}

fn fallback_channels(colors: &[(&str, u8)]) -> Vec<ChannelDef> {
    let channels = channels_from_color_map(colors);
    if channels.is_empty() {
        vec![ChannelDef {
            key: "white".to_string(),
            label: None,
            min: 0,
            max: 100,
            step: 1,
        }]
    } else {
        channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doser_storage::sample_device;
    use crate::light_storage::sample_light;

    #[test]
    fn test_update_doser_schedule_preserves_input() {
        let device = sample_device("AA:BB");
        let before = serde_json::to_string(&device).unwrap();

        let updated = atomic_update_doser_schedule(
            &device,
            1,
            250,
            14,
            30,
            Some(&[PumpWeekday::Monday, PumpWeekday::Friday]),
        )
        .unwrap();

        // Input untouched.
        assert_eq!(serde_json::to_string(&device).unwrap(), before);

        let head = &updated.configurations[0].revisions[0].heads[0];
        assert!(head.active);
        match &head.schedule {
            Schedule::Single {
                daily_dose_ml,
                start_time,
            } => {
                assert!((daily_dose_ml - 25.0).abs() < f64::EPSILON);
                assert_eq!(start_time, "14:30");
            }
            other => panic!("expected single schedule, got {other:?}"),
        }
        assert!(head.recurrence.days.contains(&Weekday::Mon));
        assert!(head.recurrence.days.contains(&Weekday::Fri));
    }

    #[test]
    fn test_update_doser_schedule_missing_head() {
        let mut device = sample_device("AA:BB");
        device.configurations[0].revisions[0].heads.truncate(2);
        device.validate().unwrap();
        let err = atomic_update_doser_schedule(&device, 4, 100, 9, 0, None).unwrap_err();
        assert!(err.to_string().contains("head 4 not found"));
    }

    #[test]
    fn test_update_doser_schedule_everyday() {
        let device = sample_device("AA:BB");
        let updated =
            atomic_update_doser_schedule(&device, 2, 100, 9, 0, Some(&[PumpWeekday::Everyday]))
                .unwrap();
        let head = &updated.configurations[0].revisions[0].heads[1];
        assert_eq!(head.recurrence.days.len(), 7);
    }

    #[test]
    fn test_create_new_revision_appends() {
        let device = sample_device("AA:BB");
        let timestamp = now_iso();
        let heads: Vec<DoserHead> = (1..=2).map(|i| default_head(i, &timestamp)).collect();

        let updated =
            atomic_create_new_revision(&device, heads, Some("note".into()), Some("me".into()))
                .unwrap();

        assert_eq!(device.configurations[0].revisions.len(), 1);
        assert_eq!(updated.configurations[0].revisions.len(), 2);
        let latest = updated.configurations[0].latest_revision();
        assert_eq!(latest.revision, 2);
        assert_eq!(latest.note.as_deref(), Some("note"));
        assert_eq!(latest.saved_by.as_deref(), Some("me"));
    }

    #[test]
    fn test_update_metadata_overwrites_non_null_fields() {
        let metadata = DeviceMetadata {
            id: "AA:BB".into(),
            name: Some("Old".into()),
            timezone: "UTC".into(),
            head_names: None,
            auto_reconnect: false,
            created_at: None,
            updated_at: None,
        };
        let updated =
            atomic_update_device_metadata(&metadata, Some("New".into()), None, None);
        assert_eq!(updated.name.as_deref(), Some("New"));
        assert_eq!(updated.timezone, "UTC");
        assert!(updated.updated_at.is_some());
        assert_eq!(metadata.name.as_deref(), Some("Old"));
    }

    #[test]
    fn test_create_doser_config_from_command() {
        let device =
            create_doser_config_from_command("AA:BB:CC:DD:EE:FF", "UTC".into(), 2, 150, 8, 15, None)
                .unwrap();
        assert_eq!(device.configurations.len(), 1);
        let heads = &device.configurations[0].revisions[0].heads;
        assert_eq!(heads.len(), 4);
        assert!(heads[1].active);
        assert!(!heads[0].active);
        match &heads[1].schedule {
            Schedule::Single {
                daily_dose_ml,
                start_time,
            } => {
                assert!((daily_dose_ml - 15.0).abs() < f64::EPSILON);
                assert_eq!(start_time, "08:15");
            }
            other => panic!("expected single schedule, got {other:?}"),
        }
    }

    #[test]
    fn test_update_light_brightness_keeps_other_channels() {
        let device = sample_light("AA:BB");
        let before = serde_json::to_string(&device).unwrap();

        let updated = atomic_update_light_brightness(&device, "red", 55).unwrap();
        assert_eq!(serde_json::to_string(&device).unwrap(), before);

        match &updated.configurations[0].revisions[0].profile {
            Profile::Manual { levels } => {
                assert_eq!(levels["red"], 55);
                assert_eq!(levels["green"], 40);
            }
            other => panic!("expected manual profile, got {other:?}"),
        }
    }

    #[test]
    fn test_update_light_brightness_unknown_channel() {
        let device = sample_light("AA:BB");
        assert!(atomic_update_light_brightness(&device, "violet", 10).is_err());
    }

    #[test]
    fn test_add_light_auto_program_converts_profile() {
        let device = sample_light("AA:BB");
        let updated = atomic_add_light_auto_program(
            &device,
            "08:00",
            "18:00",
            80,
            30,
            Some(&[LightWeekday::Monday]),
        )
        .unwrap();
        match &updated.configurations[0].revisions[0].profile {
            Profile::Auto { programs } => {
                assert_eq!(programs.len(), 1);
                assert_eq!(programs[0].sunrise, "08:00");
                assert_eq!(programs[0].days, vec![Weekday::Mon]);
                assert_eq!(programs[0].levels["red"], 80);
            }
            other => panic!("expected auto profile, got {other:?}"),
        }

        // A second program appends rather than replaces.
        let twice = atomic_add_light_auto_program(&updated, "09:00", "19:00", 60, 0, None).unwrap();
        match &twice.configurations[0].revisions[0].profile {
            Profile::Auto { programs } => assert_eq!(programs.len(), 2),
            other => panic!("expected auto profile, got {other:?}"),
        }
    }

    #[test]
    fn test_channels_from_color_map_sorted_and_deduped() {
        let channels = channels_from_color_map(&[("white", 0), ("red", 0), ("green", 1), ("blue", 2)]);
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0].key, "white");
        assert_eq!(channels[1].key, "green");
        assert_eq!(channels[2].key, "blue");
    }
}
