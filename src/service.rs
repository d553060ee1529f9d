//! BLE orchestration service.
//!
//! The process-wide singleton owning every live device driver, the in-memory
//! status cache, per-device command history, and the configuration stores.
//! Persists its state across restarts as a single `state.json` and runs the
//! auto-discover / auto-reconnect background workers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::device::{model_for_name, ColorSelector, Device, DeviceKind, SessionLimits};
use crate::doser_storage::DoserStorage;
use crate::error::{ServiceError, ServiceResult};
use crate::light_storage::LightStorage;
use crate::protocol::{encode_light_weekdays, LightWeekday, PumpWeekday};
use crate::timezone::{is_valid_iana_timezone, system_timezone};
use crate::transport::BleTransport;

/// How many command records are retained per device address.
const COMMAND_HISTORY_LIMIT: usize = 50;

/// Scan window used by discovery sweeps.
const DISCOVER_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// A channel exposed by a light model, as served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub index: u8,
}

/// Serialized status snapshot kept per address and persisted across
/// restarts.
#[derive(Debug, Clone)]
pub struct CachedStatus {
    pub address: String,
    pub device_type: DeviceKind,
    pub raw_payload: Option<String>,
    pub parsed: Option<Value>,
    pub updated_at: f64,
    pub model_name: Option<String>,
    pub channels: Option<Vec<ChannelInfo>>,
}

impl CachedStatus {
    /// The persisted / API shape, minus the `connected` flag.
    fn to_value(&self) -> Value {
        json!({
            "device_type": self.device_type,
            "raw_payload": self.raw_payload,
            "parsed": self.parsed,
            "updated_at": self.updated_at,
            "model_name": self.model_name,
            "channels": self.channels,
        })
    }

    fn from_value(address: &str, value: &Value) -> Option<CachedStatus> {
        let device_type = value
            .get("device_type")
            .and_then(Value::as_str)
            .and_then(DeviceKind::parse)?;
        Some(CachedStatus {
            address: address.to_string(),
            device_type,
            raw_payload: value
                .get("raw_payload")
                .and_then(Value::as_str)
                .map(str::to_string),
            parsed: value.get("parsed").filter(|v| !v.is_null()).cloned(),
            updated_at: value.get("updated_at").and_then(Value::as_f64).unwrap_or(0.0),
            model_name: value
                .get("model_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            channels: value
                .get("channels")
                .filter(|v| !v.is_null())
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        })
    }

    /// API response shape: the cached record plus whether this address is
    /// currently the live primary for its kind.
    pub fn to_dto(&self, connected: bool) -> Value {
        let mut value = self.to_value();
        if let Value::Object(map) = &mut value {
            map.insert("address".to_string(), json!(self.address));
            map.insert("connected".to_string(), json!(connected));
        }
        value
    }
}

/// A device found by a scan that maps to a known model.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub address: String,
    pub name: Option<String>,
    pub product: String,
    pub device_type: DeviceKind,
}

/// Single-brightness or RGB argument for auto programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrightnessArg {
    Single(u8),
    Rgb(u8, u8, u8),
}

#[derive(Default)]
struct Registry {
    devices: HashMap<DeviceKind, HashMap<String, Arc<Device>>>,
    primary: HashMap<DeviceKind, String>,
}

impl Registry {
    fn insert(&mut self, device: Arc<Device>) {
        let kind = device.kind();
        let address = device.address().to_string();
        self.devices.entry(kind).or_default().insert(address.clone(), device);
        self.primary.insert(kind, address);
    }

    fn primary_device(&self, kind: DeviceKind) -> Option<(String, Arc<Device>)> {
        let address = self.primary.get(&kind)?;
        let device = self.devices.get(&kind)?.get(address)?;
        Some((address.clone(), Arc::clone(device)))
    }

    fn find_by_address(&self, address: &str) -> Option<Arc<Device>> {
        self.devices
            .values()
            .find_map(|by_address| by_address.get(address))
            .cloned()
    }
}

/// Manages BLE devices, the status cache, and persistence.
pub struct BleService {
    transport: Arc<dyn BleTransport>,
    settings: Settings,
    registry: Mutex<Registry>,
    cache: StdMutex<HashMap<String, CachedStatus>>,
    commands: StdMutex<HashMap<String, VecDeque<Value>>>,
    display_timezone: StdMutex<String>,
    doser_storage: DoserStorage,
    light_storage: LightStorage,
    discover_task: StdMutex<Option<JoinHandle<()>>>,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl BleService {
    pub fn new(transport: Arc<dyn BleTransport>, settings: Settings) -> ServiceResult<BleService> {
        std::fs::create_dir_all(&settings.config_dir)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let devices_dir = settings.devices_dir();
        let doser_storage = DoserStorage::new(&devices_dir)?;
        let light_storage = LightStorage::new(&devices_dir)?;
        tracing::info!("configuration storage initialized at {}", devices_dir.display());

        let display_timezone = system_timezone();
        tracing::info!("display timezone initialized: {display_timezone}");

        Ok(BleService {
            transport,
            settings,
            registry: Mutex::new(Registry::default()),
            cache: StdMutex::new(HashMap::new()),
            commands: StdMutex::new(HashMap::new()),
            display_timezone: StdMutex::new(display_timezone),
            doser_storage,
            light_storage,
            discover_task: StdMutex::new(None),
            reconnect_task: StdMutex::new(None),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn doser_storage(&self) -> &DoserStorage {
        &self.doser_storage
    }

    pub fn light_storage(&self) -> &LightStorage {
        &self.light_storage
    }

    pub fn display_timezone(&self) -> String {
        self.display_timezone.lock().expect("timezone lock").clone()
    }

    /// Set the display timezone, validating the IANA identifier format.
    pub fn set_display_timezone(&self, timezone: &str) -> ServiceResult<()> {
        if !is_valid_iana_timezone(timezone) {
            return Err(ServiceError::InvalidArgs(format!(
                "Invalid IANA timezone identifier: {timezone}"
            )));
        }
        *self.display_timezone.lock().expect("timezone lock") = timezone.to_string();
        tracing::info!("display timezone updated to: {timezone}");
        Ok(())
    }

    /// Current primary address for a kind, if any.
    pub async fn current_device_address(&self, kind: DeviceKind) -> Option<String> {
        self.registry.lock().await.primary.get(&kind).cloned()
    }

    /// Color map of a registered device, used for configuration write-back.
    pub async fn device_colors(&self, address: &str) -> Option<&'static [(&'static str, u8)]> {
        self.registry
            .lock()
            .await
            .find_by_address(address)
            .map(|device| device.colors())
    }

    /// Render a status as its API DTO, resolving the `connected` flag.
    pub async fn status_to_dto(&self, status: &CachedStatus) -> Value {
        let connected = self
            .current_device_address(status.device_type)
            .await
            .as_deref()
            == Some(status.address.as_str());
        status.to_dto(connected)
    }

    /// Resolve (or create) the driver for an address, enforcing the
    /// requested kind.
    async fn ensure_device(
        &self,
        address: &str,
        expected_kind: Option<DeviceKind>,
    ) -> ServiceResult<Arc<Device>> {
        let mut registry = self.registry.lock().await;
        if let Some(kind) = expected_kind {
            if let Some(device) = registry.devices.get(&kind).and_then(|m| m.get(address)) {
                return Ok(Arc::clone(device));
            }
        }

        let discovered = self
            .transport
            .resolve(address)
            .await
            .map_err(|_| ServiceError::DeviceNotFound(expected_kind))?;
        let name = discovered
            .name
            .clone()
            .ok_or(ServiceError::DeviceNotFound(expected_kind))?;
        let model =
            model_for_name(&name).ok_or(ServiceError::DeviceNotFound(expected_kind))?;
        if let Some(expected) = expected_kind {
            if model.kind != expected {
                return Err(ServiceError::WrongKind(expected));
            }
        }

        let device = Device::new(
            address.to_string(),
            name,
            model,
            Arc::clone(&self.transport),
            SessionLimits {
                reset_hours: self.settings.msg_id_reset_hours,
                max_commands: self.settings.msg_id_max_commands,
            },
        );
        registry.insert(Arc::clone(&device));
        Ok(device)
    }

    /// Connect to a device by address and return its refreshed status. Also
    /// loads any saved configuration (existing documents only; nothing is
    /// auto-created here).
    pub async fn connect_device(
        &self,
        address: &str,
        device_type: Option<DeviceKind>,
    ) -> ServiceResult<CachedStatus> {
        let device = self.ensure_device(address, device_type).await?;
        let kind = device.kind();
        self.load_device_configuration(address, kind);
        self.refresh_device_status(kind, true).await
    }

    fn load_device_configuration(&self, address: &str, kind: DeviceKind) {
        match kind {
            DeviceKind::Doser => match self.doser_storage.get_device(address) {
                Ok(Some(config)) => tracing::info!(
                    "loaded saved configuration for doser {address} with {} configuration(s)",
                    config.configurations.len()
                ),
                Ok(None) => tracing::debug!("no saved configuration found for doser {address}"),
                Err(err) => tracing::warn!("failed to load configuration for {address}: {err}"),
            },
            DeviceKind::Light => match self.light_storage.get_device(address) {
                Ok(Some(profile)) => tracing::info!(
                    "loaded saved profile for light {address} with {} configuration(s)",
                    profile.configurations.len()
                ),
                Ok(None) => tracing::debug!("no saved profile found for light {address}"),
                Err(err) => tracing::warn!("failed to load profile for {address}: {err}"),
            },
        }
    }

    /// Request a fresh status from the primary device of a kind, wait for
    /// the capture window, and serialize the result into the cache.
    pub async fn refresh_device_status(
        &self,
        kind: DeviceKind,
        persist: bool,
    ) -> ServiceResult<CachedStatus> {
        let (address, device) = {
            let registry = self.registry.lock().await;
            registry
                .primary_device(kind)
                .ok_or(ServiceError::NotConnected(kind))?
        };

        tracing::debug!("requesting {kind} status from {address}");
        device.request_status().await?;
        tokio::time::sleep(self.settings.status_capture_wait).await;

        let status = device
            .last_status()
            .ok_or(ServiceError::NoStatusReceived(kind))?;
        let cached = CachedStatus {
            address: address.clone(),
            device_type: kind,
            raw_payload: Some(hex::encode(status.raw_payload())),
            parsed: Some(status.to_json()),
            updated_at: epoch_now(),
            model_name: Some(device.model_name().to_string()),
            channels: build_channels(&device),
        };
        if persist {
            self.cache
                .lock()
                .expect("cache lock")
                .insert(address, cached.clone());
            self.save_state().await;
        }
        Ok(cached)
    }

    /// Scan for BLE devices and keep those matching known models.
    pub async fn scan_devices(&self, timeout: Duration) -> ServiceResult<Vec<ScanResult>> {
        let discovered = self
            .transport
            .scan(timeout)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Ok(discovered
            .into_iter()
            .filter_map(|device| {
                let name = device.name?;
                let model = model_for_name(&name)?;
                Some(ScanResult {
                    address: device.address,
                    name: Some(name),
                    product: model.model_name.to_string(),
                    device_type: model.kind,
                })
            })
            .collect())
    }

    /// Status for one address: reconnects through the cached kind, or
    /// resolves and infers the kind for unknown addresses.
    pub async fn request_status(&self, address: &str) -> ServiceResult<CachedStatus> {
        tracing::info!("manual status request for {address}");
        let cached_kind = self
            .cache
            .lock()
            .expect("cache lock")
            .get(address)
            .map(|status| status.device_type);
        if let Some(kind) = cached_kind {
            return self.connect_device(address, Some(kind)).await;
        }

        let discovered = self
            .transport
            .resolve(address)
            .await
            .map_err(|_| ServiceError::DeviceNotFound(None))?;
        let kind = discovered
            .name
            .as_deref()
            .and_then(model_for_name)
            .map(|model| model.kind)
            .ok_or(ServiceError::DeviceNotFound(None))?;
        self.connect_device(address, Some(kind)).await
    }

    /// Disconnect a device and drop it from the registry, promoting any
    /// remaining peer of the same kind to primary.
    pub async fn disconnect_device(&self, address: &str) -> ServiceResult<()> {
        let mut guard = self.registry.lock().await;
        let registry = &mut *guard;

        let mut removed: Option<(DeviceKind, Arc<Device>)> = None;
        for (kind, by_address) in registry.devices.iter_mut() {
            if let Some(device) = by_address.remove(address) {
                removed = Some((*kind, device));
                break;
            }
        }
        let Some((kind, device)) = removed else {
            return Ok(());
        };

        device.disconnect().await;
        if registry.primary.get(&kind).map(String::as_str) == Some(address) {
            let replacement = registry
                .devices
                .get(&kind)
                .and_then(|by_address| by_address.keys().next().cloned());
            match replacement {
                Some(peer) => {
                    registry.primary.insert(kind, peer);
                }
                None => {
                    registry.primary.remove(&kind);
                }
            }
        }
        registry.devices.retain(|_, by_address| !by_address.is_empty());
        Ok(())
    }

    /// In-memory copy of the cached statuses.
    pub fn get_status_snapshot(&self) -> HashMap<String, CachedStatus> {
        self.cache.lock().expect("cache lock").clone()
    }

    /// DTO map for the HTTP layer, with `connected` flags resolved.
    pub async fn status_dtos(&self) -> HashMap<String, Value> {
        let snapshot = self.get_status_snapshot();
        let mut result = HashMap::new();
        for (address, status) in snapshot {
            let connected = self
                .current_device_address(status.device_type)
                .await
                .as_deref()
                == Some(address.as_str());
            result.insert(address, status.to_dto(connected));
        }
        result
    }

    // Domain operations. Each resolves the driver, performs the device
    // operation, then refreshes and persists the kind's status.

    #[allow(clippy::too_many_arguments)]
    pub async fn set_doser_schedule(
        &self,
        address: &str,
        head_index: u8,
        volume_tenths_ml: u16,
        hour: u8,
        minute: u8,
        weekdays: Option<&[PumpWeekday]>,
        confirm: bool,
        wait: Duration,
    ) -> ServiceResult<CachedStatus> {
        let device = self.ensure_device(address, Some(DeviceKind::Doser)).await?;
        device
            .set_daily_dose(head_index, volume_tenths_ml, hour, minute, weekdays, confirm, wait)
            .await?;
        self.refresh_device_status(DeviceKind::Doser, true).await
    }

    pub async fn set_light_brightness(
        &self,
        address: &str,
        brightness: u8,
        color: &ColorSelector,
    ) -> ServiceResult<CachedStatus> {
        let device = self.ensure_device(address, Some(DeviceKind::Light)).await?;
        device.set_color_brightness(brightness, color).await?;
        self.refresh_device_status(DeviceKind::Light, true).await
    }

    pub async fn set_multi_channel_brightness(
        &self,
        address: &str,
        levels: &[u8],
    ) -> ServiceResult<CachedStatus> {
        let device = self.ensure_device(address, Some(DeviceKind::Light)).await?;
        device.set_multi_channel_brightness(levels).await?;
        self.refresh_device_status(DeviceKind::Light, true).await
    }

    pub async fn turn_light_on(&self, address: &str) -> ServiceResult<CachedStatus> {
        let device = self.ensure_device(address, Some(DeviceKind::Light)).await?;
        device.turn_on().await?;
        self.refresh_device_status(DeviceKind::Light, true).await
    }

    pub async fn turn_light_off(&self, address: &str) -> ServiceResult<CachedStatus> {
        let device = self.ensure_device(address, Some(DeviceKind::Light)).await?;
        device.turn_off().await?;
        self.refresh_device_status(DeviceKind::Light, true).await
    }

    pub async fn enable_auto_mode(&self, address: &str) -> ServiceResult<CachedStatus> {
        let device = self.ensure_device(address, Some(DeviceKind::Light)).await?;
        device.enable_auto_mode().await?;
        self.refresh_device_status(DeviceKind::Light, true).await
    }

    pub async fn set_manual_mode(&self, address: &str) -> ServiceResult<CachedStatus> {
        let device = self.ensure_device(address, Some(DeviceKind::Light)).await?;
        device.set_manual_mode().await?;
        self.refresh_device_status(DeviceKind::Light, true).await
    }

    pub async fn reset_auto_settings(&self, address: &str) -> ServiceResult<CachedStatus> {
        let device = self.ensure_device(address, Some(DeviceKind::Light)).await?;
        device.reset_auto_settings().await?;
        self.refresh_device_status(DeviceKind::Light, true).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_light_auto_setting(
        &self,
        address: &str,
        sunrise: (u8, u8),
        sunset: (u8, u8),
        brightness: BrightnessArg,
        ramp_up_minutes: u8,
        weekdays: Option<&[LightWeekday]>,
    ) -> ServiceResult<CachedStatus> {
        let device = self.ensure_device(address, Some(DeviceKind::Light)).await?;
        let mask = encode_light_weekdays(weekdays.unwrap_or(&[LightWeekday::Everyday]));
        match brightness {
            BrightnessArg::Single(value) => {
                device
                    .add_auto_setting(sunrise, sunset, value, ramp_up_minutes, mask)
                    .await?
            }
            BrightnessArg::Rgb(r, g, b) => {
                device
                    .add_rgb_auto_setting(sunrise, sunset, (r, g, b), ramp_up_minutes, mask)
                    .await?
            }
        }
        self.refresh_device_status(DeviceKind::Light, true).await
    }

    /// Live non-persistent refresh across kinds. Missing connections are
    /// filtered silently; other failures are reported as strings.
    pub async fn get_live_statuses(&self) -> (Vec<CachedStatus>, Vec<String>) {
        let mut results = Vec::new();
        let mut errors = Vec::new();
        for kind in [DeviceKind::Doser, DeviceKind::Light] {
            match self.refresh_device_status(kind, false).await {
                Ok(status) => results.push(status),
                Err(err) if err.status_code() == 400 => {}
                Err(err) => errors.push(err.to_string()),
            }
        }
        (results, errors)
    }

    // Lifecycle

    /// Load persisted state and schedule the background workers.
    pub async fn start(self: &Arc<Self>) {
        self.load_state().await;
        let cache_len = self.cache.lock().expect("cache lock").len();
        tracing::info!("service start: loaded {cache_len} cached devices");
        tracing::info!(
            "settings: auto_discover_on_start={}, auto_reconnect={}, capture_wait={:?}",
            self.settings.auto_discover_on_start,
            self.settings.auto_reconnect,
            self.settings.status_capture_wait
        );

        let mut discover_scheduled = false;
        if cache_len == 0 && self.settings.auto_discover_on_start {
            tracing::info!("auto-discover enabled; scheduling background scan");
            let service = Arc::clone(self);
            *self.discover_task.lock().expect("task lock") = Some(tokio::spawn(async move {
                service.auto_discover_worker().await;
            }));
            discover_scheduled = true;
        }
        if self.settings.auto_reconnect {
            if discover_scheduled {
                tracing::info!("auto-reconnect will be decided by the auto-discover worker");
            } else {
                tracing::info!("auto-reconnect enabled; attempting reconnect to cached devices");
                let service = Arc::clone(self);
                *self.reconnect_task.lock().expect("task lock") = Some(tokio::spawn(async move {
                    service.reconnect_and_refresh().await;
                }));
            }
        }
    }

    /// Scan once and connect everything supported; chains the reconnect
    /// worker when nothing was found.
    async fn auto_discover_worker(self: Arc<Self>) {
        tracing::info!("auto-discover worker: scanning for supported devices");
        let connected_any = self.auto_discover_and_connect().await;
        if connected_any {
            self.save_state().await;
            tracing::info!("auto-discover worker: saved discovered devices");
        } else if self.settings.auto_reconnect {
            tracing::info!("auto-discover found no devices; scheduling reconnect worker");
            let service = Arc::clone(&self);
            *self.reconnect_task.lock().expect("task lock") = Some(tokio::spawn(async move {
                service.reconnect_and_refresh().await;
            }));
        }
    }

    pub(crate) async fn auto_discover_and_connect(&self) -> bool {
        let supported = match self.scan_devices(DISCOVER_SCAN_TIMEOUT).await {
            Ok(supported) => supported,
            Err(err) => {
                tracing::warn!("auto-discover scan failed: {err}");
                return false;
            }
        };
        if supported.is_empty() {
            tracing::info!("no supported devices discovered");
            return false;
        }
        tracing::info!("discovered {} supported devices", supported.len());
        let mut connected_any = false;
        for found in supported {
            match self.connect_device(&found.address, Some(found.device_type)).await {
                Ok(status) => {
                    tracing::info!("connected to {} ({})", found.address, status.device_type);
                    connected_any = true;
                }
                Err(err) => {
                    tracing::warn!("connect failed for {}: {err}", found.address);
                }
            }
        }
        connected_any
    }

    /// Reconnect every cached address; per-entry failures never abort the
    /// sweep.
    async fn reconnect_and_refresh(self: Arc<Self>) {
        let entries: Vec<(String, DeviceKind)> = self
            .cache
            .lock()
            .expect("cache lock")
            .iter()
            .map(|(address, status)| (address.clone(), status.device_type))
            .collect();
        for (address, kind) in entries {
            tracing::info!("attempting reconnect to {address} (type={kind})");
            match self.connect_device(&address, Some(kind)).await {
                Ok(_) => tracing::info!("refreshed {kind} {address}"),
                Err(err) => {
                    tracing::warn!("reconnect failed for {address}: {err}");
                    continue;
                }
            }
        }
        self.save_state().await;
    }

    /// Cancel workers, persist, and disconnect everything.
    pub async fn stop(&self) {
        for slot in [&self.reconnect_task, &self.discover_task] {
            let handle = slot.lock().expect("task lock").take();
            if let Some(handle) = handle {
                handle.abort();
                let _ = handle.await;
            }
        }
        self.save_state().await;
        let mut registry = self.registry.lock().await;
        for by_address in registry.devices.values() {
            for device in by_address.values() {
                device.disconnect().await;
            }
        }
        registry.devices.clear();
        registry.primary.clear();
    }

    // Persistence

    async fn load_state(&self) {
        let path = self.settings.state_path();
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return;
        };
        let Ok(data) = serde_json::from_str::<Value>(&raw) else {
            tracing::warn!("ignoring unparsable state file {}", path.display());
            return;
        };

        if let Some(devices) = data.get("devices").and_then(Value::as_object) {
            let mut cache = self.cache.lock().expect("cache lock");
            for (address, payload) in devices {
                if let Some(status) = CachedStatus::from_value(address, payload) {
                    cache.insert(address.clone(), status);
                }
            }
        }
        if let Some(commands) = data.get("commands").and_then(Value::as_object) {
            let mut history = self.commands.lock().expect("commands lock");
            for (address, records) in commands {
                if let Some(list) = records.as_array() {
                    history.insert(address.clone(), list.iter().cloned().collect());
                }
            }
        }
        match data.get("display_timezone").and_then(Value::as_str) {
            Some(timezone) => {
                if let Err(err) = self.set_display_timezone(timezone) {
                    tracing::warn!("ignoring persisted timezone: {err}");
                }
            }
            None => {
                tracing::warn!("no saved timezone found, using system default");
            }
        }
    }

    /// Persist cache, command history and timezone in one atomic replace.
    pub async fn save_state(&self) {
        let devices: serde_json::Map<String, Value> = {
            let cache = self.cache.lock().expect("cache lock");
            cache
                .iter()
                .map(|(address, status)| (address.clone(), status.to_value()))
                .collect()
        };
        let commands: serde_json::Map<String, Value> = {
            let history = self.commands.lock().expect("commands lock");
            history
                .iter()
                .map(|(address, records)| {
                    (address.clone(), Value::Array(records.iter().cloned().collect()))
                })
                .collect()
        };
        let data = json!({
            "devices": devices,
            "commands": commands,
            "display_timezone": self.display_timezone(),
        });
        if let Err(err) = crate::storage_util::write_json_atomic(&self.settings.state_path(), &data)
        {
            tracing::error!("failed to persist state: {err}");
        }
    }

    // Command history

    /// Record (or update, by id) a command in the per-device bounded bucket.
    pub fn save_command(&self, address: &str, record: Value) {
        let mut history = self.commands.lock().expect("commands lock");
        let bucket = history.entry(address.to_string()).or_default();
        let id = record.get("id").and_then(Value::as_str).map(str::to_string);
        if let Some(id) = id {
            if let Some(existing) = bucket
                .iter_mut()
                .find(|entry| entry.get("id").and_then(Value::as_str) == Some(id.as_str()))
            {
                *existing = record;
                return;
            }
        }
        bucket.push_back(record);
        while bucket.len() > COMMAND_HISTORY_LIMIT {
            bucket.pop_front();
        }
    }

    /// Most recent commands for a device, oldest first. A zero limit
    /// returns the whole bucket.
    pub fn get_commands(&self, address: &str, limit: usize) -> Vec<Value> {
        let history = self.commands.lock().expect("commands lock");
        let Some(bucket) = history.get(address) else {
            return Vec::new();
        };
        let skip = if limit == 0 {
            0
        } else {
            bucket.len().saturating_sub(limit)
        };
        bucket.iter().skip(skip).cloned().collect()
    }

    pub fn get_command(&self, address: &str, command_id: &str) -> Option<Value> {
        let history = self.commands.lock().expect("commands lock");
        history.get(address)?.iter().find(|entry| {
            entry.get("id").and_then(Value::as_str) == Some(command_id)
        }).cloned()
    }
}

fn build_channels(device: &Arc<Device>) -> Option<Vec<ChannelInfo>> {
    if device.kind() != DeviceKind::Light {
        return None;
    }
    let colors = device.colors();
    if colors.is_empty() {
        return None;
    }
    let mut channels: Vec<ChannelInfo> = colors
        .iter()
        .map(|&(name, index)| ChannelInfo {
            name: name.to_string(),
            index,
        })
        .collect();
    channels.sort_by_key(|channel| channel.index);
    Some(channels)
}
