//! Command execution service.
//!
//! Turns client command requests into validated, per-device-serialized,
//! timeout-guarded operations against the orchestrator, recording every
//! outcome in the bounded per-device history. Successful configuration-
//! bearing commands also update the persisted device configuration.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::atomic_config::{
    atomic_add_light_auto_program, atomic_update_doser_schedule, atomic_update_light_brightness,
    create_doser_config_from_command, create_light_config_from_brightness,
    create_light_config_from_auto_program,
};
use crate::device::ColorSelector;
use crate::error::ServiceError;
use crate::protocol::{LightWeekday, PumpWeekday};
use crate::service::{BleService, BrightnessArg};
use crate::storage_util::time_to_minutes;

/// Default and bounds for the per-command timeout, in seconds.
const DEFAULT_TIMEOUT_SECS: f64 = 10.0;
const MIN_TIMEOUT_SECS: f64 = 1.0;
const MAX_TIMEOUT_SECS: f64 = 30.0;

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Incoming command request from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    /// Optional client idempotency token.
    #[serde(default)]
    pub id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub args: Option<Value>,
    /// Timeout in seconds, clamped to 1-30.
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Success
                | CommandStatus::Failed
                | CommandStatus::TimedOut
                | CommandStatus::Cancelled
        )
    }
}

/// Persistent record of one command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: String,
    pub address: String,
    pub action: String,
    pub args: Option<Value>,
    pub status: CommandStatus,
    pub attempts: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub timeout: f64,
}

impl CommandRecord {
    fn new(address: &str, request: &CommandRequest, timeout: f64) -> CommandRecord {
        CommandRecord {
            id: request
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            address: address.to_string(),
            action: request.action.clone(),
            args: request.args.clone(),
            status: CommandStatus::Pending,
            attempts: 0,
            result: None,
            error: None,
            created_at: epoch_now(),
            started_at: None,
            completed_at: None,
            timeout,
        }
    }

    fn mark_started(&mut self) {
        self.status = CommandStatus::Running;
        self.started_at = Some(epoch_now());
        self.attempts += 1;
    }

    fn mark_success(&mut self, result: Option<Value>) {
        self.status = CommandStatus::Success;
        self.result = result;
        self.completed_at = Some(epoch_now());
    }

    fn mark_failed(&mut self, error: String) {
        self.status = CommandStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(epoch_now());
    }

    fn mark_timeout(&mut self) {
        self.status = CommandStatus::TimedOut;
        self.error = Some("Command execution timed out".to_string());
        self.completed_at = Some(epoch_now());
    }
}

fn default_confirm() -> bool {
    true
}

fn default_wait_seconds() -> f64 {
    2.0
}

/// Closed union of supported command actions with their typed arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", content = "args", rename_all = "snake_case")]
pub enum CommandAction {
    TurnOn,
    TurnOff,
    SetBrightness {
        brightness: u8,
        color: Value,
    },
    SetManualMultiChannelBrightness {
        channels: Vec<u8>,
    },
    EnableAutoMode,
    SetManualMode,
    ResetAutoSettings,
    AddAutoSetting {
        sunrise: String,
        sunset: String,
        #[serde(default)]
        brightness: Option<u8>,
        #[serde(default)]
        channels: Option<BTreeMap<String, u8>>,
        #[serde(default)]
        ramp_up_minutes: u8,
        #[serde(default)]
        weekdays: Option<Vec<LightWeekday>>,
    },
    SetSchedule {
        head_index: u8,
        volume_tenths_ml: u16,
        hour: u8,
        minute: u8,
        #[serde(default)]
        weekdays: Option<Vec<PumpWeekday>>,
        #[serde(default = "default_confirm")]
        confirm: bool,
        #[serde(default = "default_wait_seconds")]
        wait_seconds: f64,
    },
}

fn check_weekday_list<T: PartialEq + Copy>(
    weekdays: &Option<Vec<T>>,
    everyday: T,
) -> Result<(), String> {
    let Some(days) = weekdays else {
        return Ok(());
    };
    if days.is_empty() {
        return Err("weekdays list cannot be empty".to_string());
    }
    if days.contains(&everyday) && days.len() > 1 {
        return Err("cannot combine 'everyday' with specific weekdays".to_string());
    }
    for (i, day) in days.iter().enumerate() {
        if days[..i].contains(day) {
            return Err("duplicate weekdays not allowed".to_string());
        }
    }
    Ok(())
}

impl CommandAction {
    /// Parse a request into the typed union.
    pub fn from_request(request: &CommandRequest) -> Result<CommandAction, String> {
        let value = json!({
            "action": request.action,
            "args": request.args,
        });
        let value = match &request.args {
            Some(_) => value,
            // Adjacently tagged unit variants want the content key absent.
            None => json!({ "action": request.action }),
        };
        serde_json::from_value(value)
            .map_err(|err| format!("Invalid arguments for '{}': {err}", request.action))
    }

    /// Range and cross-field validation beyond what types enforce.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            CommandAction::TurnOn
            | CommandAction::TurnOff
            | CommandAction::EnableAutoMode
            | CommandAction::SetManualMode
            | CommandAction::ResetAutoSettings => Ok(()),
            CommandAction::SetBrightness { brightness, color } => {
                if *brightness > 100 {
                    return Err(format!("brightness must be 0-100, got {brightness}"));
                }
                if ColorSelector::from_json(color).is_none() {
                    return Err("color must be a channel index or color name".to_string());
                }
                Ok(())
            }
            CommandAction::SetManualMultiChannelBrightness { channels } => {
                if channels.is_empty() || channels.len() > 4 {
                    return Err("channels must contain between 1 and 4 values".to_string());
                }
                for (i, &brightness) in channels.iter().enumerate() {
                    if brightness > 100 {
                        return Err(format!(
                            "channel {i} brightness must be 0-100, got {brightness}"
                        ));
                    }
                }
                Ok(())
            }
            CommandAction::AddAutoSetting {
                sunrise,
                sunset,
                brightness,
                channels,
                ramp_up_minutes,
                weekdays,
            } => {
                let sunrise_min =
                    time_to_minutes(sunrise).map_err(|e| e.to_string())?;
                let sunset_min = time_to_minutes(sunset).map_err(|e| e.to_string())?;
                if sunset_min <= sunrise_min {
                    return Err(format!(
                        "sunset ({sunset}) must be after sunrise ({sunrise})"
                    ));
                }
                match (brightness, channels) {
                    (None, None) => {
                        return Err("either 'brightness' or 'channels' must be provided".to_string())
                    }
                    (Some(_), Some(_)) => {
                        return Err("cannot specify both 'brightness' and 'channels'".to_string())
                    }
                    (Some(value), None) => {
                        if *value > 100 {
                            return Err(format!("brightness must be 0-100, got {value}"));
                        }
                    }
                    (None, Some(map)) => {
                        if map.is_empty() {
                            return Err("channels cannot be empty".to_string());
                        }
                        for (key, &value) in map {
                            if value > 100 {
                                return Err(format!(
                                    "channel '{key}' brightness must be 0-100, got {value}"
                                ));
                            }
                        }
                    }
                }
                let span = sunset_min - sunrise_min;
                if u32::from(*ramp_up_minutes) > span {
                    return Err(format!(
                        "ramp up time ({ramp_up_minutes} minutes) cannot exceed sunrise-sunset span ({span} minutes)"
                    ));
                }
                check_weekday_list(weekdays, LightWeekday::Everyday)
            }
            CommandAction::SetSchedule {
                head_index,
                hour,
                minute,
                weekdays,
                wait_seconds,
                ..
            } => {
                if *head_index > 3 {
                    return Err(format!(
                        "head index must be 0-3 for 4-head doser devices, got {head_index}"
                    ));
                }
                if *hour > 23 {
                    return Err(format!("hour must be 0-23, got {hour}"));
                }
                if *minute > 59 {
                    return Err(format!("minute must be 0-59, got {minute}"));
                }
                if !(0.5..=10.0).contains(wait_seconds) {
                    return Err(format!(
                        "wait_seconds must be between 0.5 and 10, got {wait_seconds}"
                    ));
                }
                check_weekday_list(weekdays, PumpWeekday::Everyday)
            }
        }
    }
}

/// Executes commands on devices through the BLE service.
pub struct CommandExecutor {
    service: Arc<BleService>,
    device_locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CommandExecutor {
    pub fn new(service: Arc<BleService>) -> CommandExecutor {
        CommandExecutor {
            service,
            device_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn device_lock(&self, address: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.device_locks.lock().expect("lock map");
        Arc::clone(
            locks
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Execute a command synchronously and return its record. Never errors:
    /// failures are reported through the record.
    pub async fn execute_command(&self, address: &str, request: CommandRequest) -> CommandRecord {
        // Idempotency: re-submitting a completed command id returns the
        // prior outcome.
        if let Some(id) = &request.id {
            if let Some(existing) = self.service.get_command(address, id) {
                if let Ok(record) = serde_json::from_value::<CommandRecord>(existing) {
                    if record.status.is_terminal() {
                        return record;
                    }
                }
            }
        }

        let timeout = request
            .timeout
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        let mut record = CommandRecord::new(address, &request, timeout);

        let action = match CommandAction::from_request(&request).and_then(|action| {
            action.validate().map(|()| action)
        }) {
            Ok(action) => action,
            Err(message) => {
                record.mark_failed(message);
                self.persist_record(&record).await;
                return record;
            }
        };

        let lock = self.device_lock(address);
        let _guard = lock.lock().await;
        record.mark_started();

        let outcome = tokio::time::timeout(
            Duration::from_secs_f64(timeout),
            self.run_action(address, &action),
        )
        .await;
        match outcome {
            Ok(Ok(result)) => {
                record.mark_success(Some(result));
                self.save_config_for(address, &action).await;
            }
            Ok(Err(err)) => {
                record.mark_failed(format!("HTTP {}: {err}", err.status_code()));
                tracing::error!("command {} failed for device {address}: {err}", request.action);
            }
            Err(_) => {
                record.mark_timeout();
                tracing::warn!(
                    "command {} timed out for device {address} after {timeout} seconds",
                    request.action
                );
            }
        }
        drop(_guard);

        self.persist_record(&record).await;
        record
    }

    async fn persist_record(&self, record: &CommandRecord) {
        match serde_json::to_value(record) {
            Ok(value) => {
                self.service.save_command(&record.address, value);
                self.service.save_state().await;
            }
            Err(err) => tracing::error!("failed to serialize command record: {err}"),
        }
    }

    /// Dispatch the action to the matching orchestrator operation.
    async fn run_action(
        &self,
        address: &str,
        action: &CommandAction,
    ) -> Result<Value, ServiceError> {
        let status = match action {
            CommandAction::TurnOn => self.service.turn_light_on(address).await?,
            CommandAction::TurnOff => self.service.turn_light_off(address).await?,
            CommandAction::EnableAutoMode => self.service.enable_auto_mode(address).await?,
            CommandAction::SetManualMode => self.service.set_manual_mode(address).await?,
            CommandAction::ResetAutoSettings => self.service.reset_auto_settings(address).await?,
            CommandAction::SetBrightness { brightness, color } => {
                let selector = ColorSelector::from_json(color)
                    .unwrap_or(ColorSelector::Index(0));
                self.service
                    .set_light_brightness(address, *brightness, &selector)
                    .await?
            }
            CommandAction::SetManualMultiChannelBrightness { channels } => {
                self.service
                    .set_multi_channel_brightness(address, channels)
                    .await?
            }
            CommandAction::AddAutoSetting {
                sunrise,
                sunset,
                brightness,
                channels,
                ramp_up_minutes,
                weekdays,
            } => {
                let brightness_arg = auto_setting_brightness(brightness, channels)
                    .map_err(ServiceError::InvalidArgs)?;
                self.service
                    .add_light_auto_setting(
                        address,
                        parse_time_pair(sunrise)?,
                        parse_time_pair(sunset)?,
                        brightness_arg,
                        *ramp_up_minutes,
                        weekdays.as_deref(),
                    )
                    .await?
            }
            CommandAction::SetSchedule {
                head_index,
                volume_tenths_ml,
                hour,
                minute,
                weekdays,
                confirm,
                wait_seconds,
            } => {
                self.service
                    .set_doser_schedule(
                        address,
                        *head_index,
                        *volume_tenths_ml,
                        *hour,
                        *minute,
                        weekdays.as_deref(),
                        *confirm,
                        Duration::from_secs_f64(*wait_seconds),
                    )
                    .await?
            }
        };
        Ok(self.service.status_to_dto(&status).await)
    }

    /// Configuration write-back for configuration-bearing actions. Never
    /// fails the command; problems are logged.
    async fn save_config_for(&self, address: &str, action: &CommandAction) {
        if !self.service.settings().auto_save_config {
            tracing::debug!("auto-save config disabled, skipping");
            return;
        }
        let result = match action {
            CommandAction::SetSchedule {
                head_index,
                volume_tenths_ml,
                hour,
                minute,
                weekdays,
                ..
            } => {
                self.save_doser_schedule(
                    address,
                    *head_index,
                    *volume_tenths_ml,
                    *hour,
                    *minute,
                    weekdays.as_deref(),
                )
                .await
            }
            CommandAction::SetBrightness { brightness, color } => {
                self.save_light_brightness(address, *brightness, color).await
            }
            CommandAction::AddAutoSetting {
                sunrise,
                sunset,
                brightness,
                channels,
                ramp_up_minutes,
                weekdays,
            } => {
                self.save_light_auto_setting(
                    address,
                    sunrise,
                    sunset,
                    brightness,
                    channels,
                    *ramp_up_minutes,
                    weekdays.as_deref(),
                )
                .await
            }
            _ => return,
        };
        if let Err(err) = result {
            tracing::error!("failed to save configuration for {address}: {err}");
        }
    }

    async fn save_doser_schedule(
        &self,
        address: &str,
        head_index: u8,
        volume_tenths_ml: u16,
        hour: u8,
        minute: u8,
        weekdays: Option<&[PumpWeekday]>,
    ) -> Result<(), ServiceError> {
        let storage = self.service.doser_storage();
        // Protocol heads are 0-based; document heads are 1-based.
        let document_head = head_index + 1;
        let device = match storage.get_device(address)? {
            Some(existing) => atomic_update_doser_schedule(
                &existing,
                document_head,
                volume_tenths_ml,
                hour,
                minute,
                weekdays,
            )?,
            None => {
                tracing::info!("creating new configuration for doser {address} from schedule command");
                create_doser_config_from_command(
                    address,
                    self.service.display_timezone(),
                    document_head,
                    volume_tenths_ml,
                    hour,
                    minute,
                    weekdays,
                )?
            }
        };
        storage.upsert_device(device)?;
        tracing::info!("saved doser configuration for {address}, head {document_head}");
        Ok(())
    }

    async fn save_light_brightness(
        &self,
        address: &str,
        brightness: u8,
        color: &Value,
    ) -> Result<(), ServiceError> {
        let storage = self.service.light_storage();
        let colors = self.service.device_colors(address).await.unwrap_or(&[]);
        let channel_key = resolve_channel_key(colors, color);

        let device = match storage.get_device(address)? {
            Some(existing) => {
                atomic_update_light_brightness(&existing, &channel_key, u32::from(brightness))?
            }
            None => {
                tracing::info!("creating new profile for light {address} from brightness command");
                create_light_config_from_brightness(
                    address,
                    self.service.display_timezone(),
                    colors,
                    &channel_key,
                    u32::from(brightness),
                )?
            }
        };
        storage.upsert_device(device)?;
        tracing::info!("saved light configuration for {address}, brightness={brightness}");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn save_light_auto_setting(
        &self,
        address: &str,
        sunrise: &str,
        sunset: &str,
        brightness: &Option<u8>,
        channels: &Option<BTreeMap<String, u8>>,
        ramp_up_minutes: u8,
        weekdays: Option<&[LightWeekday]>,
    ) -> Result<(), ServiceError> {
        let storage = self.service.light_storage();
        let colors = self.service.device_colors(address).await.unwrap_or(&[]);
        let level = brightness
            .map(u32::from)
            .or_else(|| {
                channels
                    .as_ref()
                    .and_then(|map| map.values().max().map(|&v| u32::from(v)))
            })
            .unwrap_or(0);

        let device = match storage.get_device(address)? {
            Some(existing) => atomic_add_light_auto_program(
                &existing,
                sunrise,
                sunset,
                level,
                u32::from(ramp_up_minutes),
                weekdays,
            )?,
            None => {
                tracing::info!("creating new profile for light {address} from auto program command");
                create_light_config_from_auto_program(
                    address,
                    self.service.display_timezone(),
                    colors,
                    sunrise,
                    sunset,
                    level,
                    u32::from(ramp_up_minutes),
                    weekdays,
                )?
            }
        };
        storage.upsert_device(device)?;
        tracing::info!("saved light auto program for {address}, {sunrise}-{sunset}");
        Ok(())
    }
}

/// Parse `HH:MM` into an `(hour, minute)` byte pair.
fn parse_time_pair(value: &str) -> Result<(u8, u8), ServiceError> {
    let minutes = time_to_minutes(value)
        .map_err(|e| ServiceError::InvalidArgs(e.to_string()))?;
    Ok(((minutes / 60) as u8, (minutes % 60) as u8))
}

/// Map auto-setting brightness arguments onto the device call shape.
fn auto_setting_brightness(
    brightness: &Option<u8>,
    channels: &Option<BTreeMap<String, u8>>,
) -> Result<BrightnessArg, String> {
    if let Some(value) = brightness {
        return Ok(BrightnessArg::Single(*value));
    }
    let Some(map) = channels else {
        return Err("either 'brightness' or 'channels' must be provided".to_string());
    };
    let values: Vec<u8> = map.values().copied().collect();
    match values.as_slice() {
        [single] => Ok(BrightnessArg::Single(*single)),
        [r, g, b] => Ok(BrightnessArg::Rgb(*r, *g, *b)),
        _ => Err("channels must map one or three channels for auto settings".to_string()),
    }
}

/// Pick the document channel key named by a brightness command's color
/// argument.
fn resolve_channel_key(colors: &[(&str, u8)], color: &Value) -> String {
    match ColorSelector::from_json(color) {
        Some(ColorSelector::Name(name)) => name,
        Some(ColorSelector::Index(index)) => colors
            .iter()
            .find(|&&(_, i)| i == index)
            .map(|&(name, _)| name.to_string())
            .unwrap_or_else(|| "white".to_string()),
        None => "white".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::device::testutil::MockTransport;
    use crate::service::testutil::{
        doser_status_payload, light_status_payload, mock_service, mock_service_with_wait,
    };
    use crate::transport::BleTransport;

    const DOSER_ADDR: &str = "AA:BB:CC:DD:EE:01";
    const LIGHT_ADDR: &str = "AA:BB:CC:DD:EE:02";

    fn devices() -> Vec<(String, Option<String>)> {
        vec![
            (DOSER_ADDR.to_string(), Some("DYDOSE-1".to_string())),
            (LIGHT_ADDR.to_string(), Some("DYNCRGP-2".to_string())),
        ]
    }

    fn request(action: &str, args: Value) -> CommandRequest {
        CommandRequest {
            id: None,
            action: action.to_string(),
            args: if args.is_null() { None } else { Some(args) },
            timeout: None,
        }
    }

    /// Keep feeding status notifications so refreshes succeed.
    fn keep_notifying(transport: &Arc<MockTransport>, payload: Vec<u8>) {
        let transport = Arc::clone(transport);
        tokio::spawn(async move {
            for _ in 0..200 {
                transport.notify(&payload);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    #[tokio::test]
    async fn test_invalid_args_fail_without_side_effects() {
        let (transport, service, _dir) = mock_service(devices());
        let executor = CommandExecutor::new(Arc::clone(&service));

        let record = executor
            .execute_command(LIGHT_ADDR, request("set_brightness", json!({"brightness": 150, "color": 0})))
            .await;
        assert_eq!(record.status, CommandStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("brightness"));
        assert!(transport.written().is_empty());
        assert!(record.started_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_action_fails() {
        let (_, service, _dir) = mock_service(devices());
        let executor = CommandExecutor::new(Arc::clone(&service));
        let record = executor
            .execute_command(LIGHT_ADDR, request("self_destruct", Value::Null))
            .await;
        assert_eq!(record.status, CommandStatus::Failed);
    }

    #[tokio::test]
    async fn test_schedule_validation() {
        let (_, service, _dir) = mock_service(devices());
        let executor = CommandExecutor::new(Arc::clone(&service));

        let record = executor
            .execute_command(
                DOSER_ADDR,
                request(
                    "set_schedule",
                    json!({"head_index": 7, "volume_tenths_ml": 100, "hour": 9, "minute": 0}),
                ),
            )
            .await;
        assert_eq!(record.status, CommandStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("head index"));

        let record = executor
            .execute_command(
                DOSER_ADDR,
                request(
                    "set_schedule",
                    json!({
                        "head_index": 0, "volume_tenths_ml": 100, "hour": 9, "minute": 0,
                        "weekdays": ["everyday", "monday"]
                    }),
                ),
            )
            .await;
        assert_eq!(record.status, CommandStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("everyday"));
    }

    #[tokio::test]
    async fn test_auto_setting_cross_field_validation() {
        let (_, service, _dir) = mock_service(devices());
        let executor = CommandExecutor::new(Arc::clone(&service));

        let record = executor
            .execute_command(
                LIGHT_ADDR,
                request(
                    "add_auto_setting",
                    json!({"sunrise": "18:00", "sunset": "08:00", "brightness": 50}),
                ),
            )
            .await;
        assert_eq!(record.status, CommandStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("sunset"));

        let record = executor
            .execute_command(
                LIGHT_ADDR,
                request(
                    "add_auto_setting",
                    json!({"sunrise": "08:00", "sunset": "09:00", "brightness": 50, "ramp_up_minutes": 120}),
                ),
            )
            .await;
        assert_eq!(record.status, CommandStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("ramp"));

        let record = executor
            .execute_command(
                LIGHT_ADDR,
                request(
                    "add_auto_setting",
                    json!({"sunrise": "08:00", "sunset": "18:00"}),
                ),
            )
            .await;
        assert_eq!(record.status, CommandStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_marks_record_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::with_devices(devices());
        let settings = Settings {
            config_dir: dir.path().to_path_buf(),
            // Make every refresh slower than the command timeout.
            status_capture_wait: Duration::from_secs(5),
            ..Settings::default()
        };
        let service = Arc::new(
            crate::service::BleService::new(transport as Arc<dyn BleTransport>, settings).unwrap(),
        );
        let executor = CommandExecutor::new(Arc::clone(&service));

        let mut req = request("turn_on", Value::Null);
        req.timeout = Some(1.0);
        let record = executor.execute_command(LIGHT_ADDR, req).await;

        assert_eq!(record.status, CommandStatus::TimedOut);
        assert!(record.error.is_some());
        let started = record.started_at.unwrap();
        let completed = record.completed_at.unwrap();
        assert!(completed - started < 1.5, "timed out late: {}", completed - started);
    }

    #[tokio::test]
    async fn test_timeout_clamped_to_bounds() {
        let (_, service, _dir) = mock_service(devices());
        let executor = CommandExecutor::new(Arc::clone(&service));
        let mut req = request("bogus_action", Value::Null);
        req.timeout = Some(500.0);
        let record = executor.execute_command(LIGHT_ADDR, req).await;
        assert_eq!(record.timeout, MAX_TIMEOUT_SECS);
    }

    #[tokio::test]
    async fn test_successful_command_records_result_and_history() {
        let (transport, service, _dir) =
            mock_service_with_wait(devices(), Duration::from_millis(50));
        let executor = CommandExecutor::new(Arc::clone(&service));
        keep_notifying(&transport, light_status_payload());

        let record = executor
            .execute_command(LIGHT_ADDR, request("turn_on", Value::Null))
            .await;
        assert_eq!(record.status, CommandStatus::Success, "error: {:?}", record.error);
        let result = record.result.as_ref().unwrap();
        assert_eq!(result["device_type"], "light");
        assert_eq!(result["connected"], true);

        let history = service.get_commands(LIGHT_ADDR, 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["status"], "success");
    }

    #[tokio::test]
    async fn test_idempotent_replay_returns_prior_outcome() {
        let (transport, service, _dir) =
            mock_service_with_wait(devices(), Duration::from_millis(50));
        let executor = CommandExecutor::new(Arc::clone(&service));
        keep_notifying(&transport, light_status_payload());

        let mut req = request("turn_on", Value::Null);
        req.id = Some("same-token".to_string());
        let first = executor.execute_command(LIGHT_ADDR, req.clone()).await;
        assert_eq!(first.status, CommandStatus::Success);
        let frames_after_first = transport.written().len();

        let second = executor.execute_command(LIGHT_ADDR, req).await;
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, first.attempts);
        // No new device traffic for the replay.
        assert_eq!(transport.written().len(), frames_after_first);
    }

    #[tokio::test]
    async fn test_per_device_commands_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::with_devices(devices());
        let settings = Settings {
            config_dir: dir.path().to_path_buf(),
            status_capture_wait: Duration::from_millis(50),
            ..Settings::default()
        };
        let service = Arc::new(
            crate::service::BleService::new(
                transport.clone() as Arc<dyn BleTransport>,
                settings,
            )
            .unwrap(),
        );
        let executor = Arc::new(CommandExecutor::new(Arc::clone(&service)));
        keep_notifying(&transport, light_status_payload());

        let a = Arc::clone(&executor);
        let b = Arc::clone(&executor);
        let (first, second) = tokio::join!(
            a.execute_command(LIGHT_ADDR, request("turn_on", Value::Null)),
            b.execute_command(LIGHT_ADDR, request("turn_off", Value::Null)),
        );
        assert_eq!(first.status, CommandStatus::Success);
        assert_eq!(second.status, CommandStatus::Success);

        // The two execution windows must not overlap.
        let (s1, c1) = (first.started_at.unwrap(), first.completed_at.unwrap());
        let (s2, c2) = (second.started_at.unwrap(), second.completed_at.unwrap());
        assert!(c1 <= s2 || c2 <= s1, "command windows overlap");
    }

    #[tokio::test]
    async fn test_set_schedule_auto_saves_configuration() {
        let (transport, service, _dir) =
            mock_service_with_wait(devices(), Duration::from_millis(50));
        let executor = CommandExecutor::new(Arc::clone(&service));
        keep_notifying(&transport, doser_status_payload());

        assert!(service.doser_storage().get_device(DOSER_ADDR).unwrap().is_none());

        let record = executor
            .execute_command(
                DOSER_ADDR,
                request(
                    "set_schedule",
                    json!({
                        "head_index": 0, "volume_tenths_ml": 250, "hour": 14, "minute": 30,
                        "confirm": false
                    }),
                ),
            )
            .await;
        assert_eq!(record.status, CommandStatus::Success, "error: {:?}", record.error);

        // A configuration document appeared with the commanded head active.
        let device = service.doser_storage().get_device(DOSER_ADDR).unwrap().unwrap();
        assert_eq!(device.configurations.len(), 1);
        let head = &device.configurations[0].revisions[0].heads[0];
        assert!(head.active);
        match &head.schedule {
            crate::doser_storage::Schedule::Single {
                daily_dose_ml,
                start_time,
            } => {
                assert!((daily_dose_ml - 25.0).abs() < f64::EPSILON);
                assert_eq!(start_time, "14:30");
            }
            other => panic!("expected single schedule, got {other:?}"),
        }
        let first_updated = device.updated_at.clone();

        // A second command updates the existing head in place.
        let record = executor
            .execute_command(
                DOSER_ADDR,
                request(
                    "set_schedule",
                    json!({
                        "head_index": 0, "volume_tenths_ml": 500, "hour": 9, "minute": 0,
                        "confirm": false
                    }),
                ),
            )
            .await;
        assert_eq!(record.status, CommandStatus::Success);
        let device = service.doser_storage().get_device(DOSER_ADDR).unwrap().unwrap();
        assert_eq!(device.configurations.len(), 1);
        assert_eq!(device.configurations[0].revisions.len(), 1);
        let head = &device.configurations[0].revisions[0].heads[0];
        match &head.schedule {
            crate::doser_storage::Schedule::Single { daily_dose_ml, .. } => {
                assert!((daily_dose_ml - 50.0).abs() < f64::EPSILON);
            }
            other => panic!("expected single schedule, got {other:?}"),
        }
        assert!(device.updated_at >= first_updated);
    }

    #[tokio::test]
    async fn test_set_brightness_auto_saves_light_profile() {
        let (transport, service, _dir) =
            mock_service_with_wait(devices(), Duration::from_millis(50));
        let executor = CommandExecutor::new(Arc::clone(&service));
        keep_notifying(&transport, light_status_payload());

        let record = executor
            .execute_command(
                LIGHT_ADDR,
                request("set_brightness", json!({"brightness": 70, "color": "red"})),
            )
            .await;
        assert_eq!(record.status, CommandStatus::Success, "error: {:?}", record.error);

        let device = service.light_storage().get_device(LIGHT_ADDR).unwrap().unwrap();
        match &device.configurations[0].revisions[0].profile {
            crate::light_storage::Profile::Manual { levels } => {
                assert_eq!(levels["red"], 70);
            }
            other => panic!("expected manual profile, got {other:?}"),
        }
    }

    #[test]
    fn test_action_parsing_shapes() {
        let action = CommandAction::from_request(&request("turn_on", Value::Null)).unwrap();
        assert!(matches!(action, CommandAction::TurnOn));

        let action = CommandAction::from_request(&request(
            "set_schedule",
            json!({"head_index": 1, "volume_tenths_ml": 100, "hour": 8, "minute": 0}),
        ))
        .unwrap();
        match action {
            CommandAction::SetSchedule {
                confirm,
                wait_seconds,
                ..
            } => {
                assert!(confirm);
                assert_eq!(wait_seconds, 2.0);
            }
            other => panic!("unexpected action {other:?}"),
        }

        assert!(CommandAction::from_request(&request("explode", Value::Null)).is_err());
        // Missing required args for a struct variant.
        assert!(CommandAction::from_request(&request("set_brightness", Value::Null)).is_err());
    }
}
