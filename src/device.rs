//! Per-peripheral device driver.
//!
//! A `Device` owns the live BLE connection for one peripheral and everything
//! that must be serialized against it: the rolling message-id session, the
//! idle-disconnect timer, frame writes, and the latest parsed status fed by
//! the notification sink. Model identification maps advertised name
//! prefixes onto the known pump and light models.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::doser_status::{parse_doser_payload, DoserStatus};
use crate::error::{ServiceError, ServiceResult};
use crate::light_status::{parse_light_payload, ParsedLightStatus};
use crate::protocol::{self, MessageId, PumpWeekday};
use crate::transport::{BleConnection, BleTransport, NotificationSink, TransportError};

/// Idle time before a connection is dropped.
const DISCONNECT_DELAY: Duration = Duration::from_secs(120);

/// Back-off before surfacing a failed write.
const WRITE_BACKOFF: Duration = Duration::from_millis(250);

/// Connection attempts before giving up.
const CONNECT_ATTEMPTS: u32 = 3;

/// The two device families this daemon drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Doser,
    Light,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Doser => "doser",
            DeviceKind::Light => "light",
        })
    }
}

impl DeviceKind {
    pub fn parse(value: &str) -> Option<DeviceKind> {
        match value.to_ascii_lowercase().as_str() {
            "doser" => Some(DeviceKind::Doser),
            "light" => Some(DeviceKind::Light),
            _ => None,
        }
    }
}

/// Static description of a supported model.
pub struct DeviceModel {
    pub model_name: &'static str,
    /// Advertised-name prefixes that identify this model.
    pub model_codes: &'static [&'static str],
    pub kind: DeviceKind,
    /// Color/channel map: name to protocol channel index.
    pub colors: &'static [(&'static str, u8)],
}

/// Every model the daemon knows how to drive.
pub static MODELS: &[DeviceModel] = &[
    DeviceModel {
        model_name: "Dosing Pump",
        model_codes: &["DYDOSE"],
        kind: DeviceKind::Doser,
        colors: &[],
    },
    DeviceModel {
        model_name: "C II",
        model_codes: &["DYNC2N"],
        kind: DeviceKind::Light,
        colors: &[("white", 0)],
    },
    DeviceModel {
        model_name: "C II RGB",
        model_codes: &["DYNCRGP"],
        kind: DeviceKind::Light,
        colors: &[("red", 0), ("green", 1), ("blue", 2)],
    },
    DeviceModel {
        model_name: "Commander 1",
        model_codes: &["DYCOM"],
        kind: DeviceKind::Light,
        colors: &[("white", 0), ("red", 0), ("green", 1), ("blue", 2)],
    },
    DeviceModel {
        model_name: "Commander 4",
        model_codes: &["DYLED"],
        kind: DeviceKind::Light,
        colors: &[("white", 0), ("red", 0), ("green", 1), ("blue", 2)],
    },
    DeviceModel {
        model_name: "WRGB II",
        model_codes: &["DYNWRGB", "DYNW30", "DYNW45", "DYNW60", "DYNW90", "DYNW12P"],
        kind: DeviceKind::Light,
        colors: &[("red", 0), ("green", 1), ("blue", 2)],
    },
    DeviceModel {
        model_name: "WRGB II Slim",
        model_codes: &["DYSILN"],
        kind: DeviceKind::Light,
        colors: &[("red", 0), ("green", 1), ("blue", 2)],
    },
    DeviceModel {
        model_name: "Z Light TINY",
        model_codes: &["DYSSD", "DYZSD"],
        kind: DeviceKind::Light,
        colors: &[("white", 0), ("warm", 1)],
    },
    DeviceModel {
        model_name: "Tiny Terrarium Egg",
        model_codes: &["DYDD"],
        kind: DeviceKind::Light,
        colors: &[("red", 0), ("green", 1)],
    },
    DeviceModel {
        model_name: "Universal WRGB",
        model_codes: &[
            "DYU550", "DYU600", "DYU700", "DYU800", "DYU920", "DYU1000", "DYU1200", "DYU1500",
        ],
        kind: DeviceKind::Light,
        colors: &[("red", 0), ("green", 1), ("blue", 2), ("white", 3)],
    },
];

/// Look up the model for an advertised device name by prefix.
pub fn model_for_name(name: &str) -> Option<&'static DeviceModel> {
    MODELS.iter().find(|model| {
        model
            .model_codes
            .iter()
            .any(|code| name.starts_with(code))
    })
}

/// Latest parsed status, tagged by family.
#[derive(Debug, Clone)]
pub enum DeviceStatus {
    Doser(DoserStatus),
    Light(ParsedLightStatus),
}

impl DeviceStatus {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DeviceStatus::Doser(status) => status.to_json(),
            DeviceStatus::Light(status) => status.to_json(),
        }
    }

    pub fn raw_payload(&self) -> &[u8] {
        match self {
            DeviceStatus::Doser(status) => &status.raw_payload,
            DeviceStatus::Light(status) => &status.raw_payload,
        }
    }
}

/// Message-id session state: the current id plus the wall-clock age and
/// command count that trigger a reset.
struct MsgIdSession {
    current: MessageId,
    started: Instant,
    count: u64,
}

/// Limits for a message-id session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub reset_hours: f64,
    pub max_commands: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        SessionLimits {
            reset_hours: 24.0,
            max_commands: 1000,
        }
    }
}

/// Driver for one connected peripheral.
pub struct Device {
    address: String,
    name: String,
    model: &'static DeviceModel,
    transport: Arc<dyn BleTransport>,
    limits: SessionLimits,
    /// Serializes connect/disconnect and guards the live connection handle.
    connection: Mutex<Option<Box<dyn BleConnection>>>,
    /// Serializes frame writes so batches never interleave.
    operation_lock: Mutex<()>,
    session: StdMutex<MsgIdSession>,
    last_status: StdMutex<Option<DeviceStatus>>,
    disconnect_timer: StdMutex<Option<JoinHandle<()>>>,
}

impl Device {
    pub fn new(
        address: String,
        name: String,
        model: &'static DeviceModel,
        transport: Arc<dyn BleTransport>,
        limits: SessionLimits,
    ) -> Arc<Device> {
        Arc::new(Device {
            address,
            name,
            model,
            transport,
            limits,
            connection: Mutex::new(None),
            operation_lock: Mutex::new(()),
            session: StdMutex::new(MsgIdSession {
                current: protocol::reset_message_id(),
                started: Instant::now(),
                count: 0,
            }),
            last_status: StdMutex::new(None),
            disconnect_timer: StdMutex::new(None),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.model.kind
    }

    pub fn model_name(&self) -> &'static str {
        self.model.model_name
    }

    pub fn colors(&self) -> &'static [(&'static str, u8)] {
        self.model.colors
    }

    pub fn last_status(&self) -> Option<DeviceStatus> {
        self.last_status.lock().expect("status lock").clone()
    }

    /// Draw a fresh message id, resetting the session when it has aged out,
    /// run out of commands, or neared the end of the id space.
    pub fn next_msg_id(&self) -> MessageId {
        let mut session = self.session.lock().expect("session lock");
        let age_hours = session.started.elapsed().as_secs_f64() / 3600.0;
        if age_hours >= self.limits.reset_hours
            || session.count >= self.limits.max_commands
            || protocol::is_message_id_exhausted(session.current)
        {
            tracing::info!(
                "{}: message id session reset after {:.1}h and {} commands",
                self.name,
                age_hours,
                session.count
            );
            session.current = protocol::reset_message_id();
            session.started = Instant::now();
            session.count = 0;
        }
        session.count += 1;
        session.current = match protocol::next_message_id(session.current) {
            Ok(next) => next,
            Err(_) => protocol::reset_message_id(),
        };
        session.current
    }

    /// Route an incoming UART notification by device family.
    pub fn handle_notification(&self, payload: &[u8]) {
        match self.kind() {
            DeviceKind::Light => {
                if payload.first() == Some(&0x5B) && payload.len() >= 6 {
                    match payload[5] {
                        0xFE => {
                            let parsed = parse_light_payload(payload);
                            tracing::debug!("{}: status payload: {}", self.name, hex::encode(payload));
                            *self.last_status.lock().expect("status lock") =
                                Some(DeviceStatus::Light(parsed));
                            return;
                        }
                        0x0A => {
                            tracing::debug!("{}: handshake ack: {}", self.name, hex::encode(payload));
                            return;
                        }
                        _ => {}
                    }
                }
                tracing::debug!("{}: notification received: {}", self.name, hex::encode(payload));
            }
            DeviceKind::Doser => match parse_doser_payload(payload) {
                Ok(parsed) => {
                    *self.last_status.lock().expect("status lock") =
                        Some(DeviceStatus::Doser(parsed));
                }
                Err(err) => {
                    // Keep the previous status rather than serving a
                    // partial view of a malformed frame.
                    tracing::debug!(
                        "{}: unparsable notification ({err}): {}",
                        self.name,
                        hex::encode(payload)
                    );
                }
            },
        }
    }

    fn notification_sink(self: &Arc<Self>) -> NotificationSink {
        let weak: Weak<Device> = Arc::downgrade(self);
        Arc::new(move |payload: Vec<u8>| {
            if let Some(device) = weak.upgrade() {
                device.handle_notification(&payload);
            }
        })
    }

    /// Ensure a live connection, arming the idle-disconnect timer.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            if connection.is_connected().await {
                drop(guard);
                self.reset_disconnect_timer();
                return Ok(());
            }
            *guard = None;
        }

        let sink = self.notification_sink();
        let mut last_error = TransportError::NotFound;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.transport.connect(&self.address, sink.clone()).await {
                Ok(connection) => {
                    tracing::debug!("{}: connected (attempt {attempt})", self.name);
                    *guard = Some(connection);
                    drop(guard);
                    self.reset_disconnect_timer();
                    return Ok(());
                }
                Err(TransportError::NotFound) => return Err(TransportError::NotFound),
                Err(err) => {
                    tracing::debug!("{}: connect attempt {attempt} failed: {err}", self.name);
                    last_error = err;
                    tokio::time::sleep(WRITE_BACKOFF).await;
                }
            }
        }
        Err(last_error)
    }

    /// Send a batch of frames, in order, with no interleaving from other
    /// callers on this device. A transport error forces a disconnect and is
    /// surfaced; the retry decision belongs to the caller.
    pub async fn send_command(self: &Arc<Self>, frames: &[Vec<u8>]) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        let _operation = self.operation_lock.lock().await;
        tracing::debug!(
            "{}: sending {} frame(s): {:?}",
            self.name,
            frames.len(),
            frames.iter().map(hex::encode).collect::<Vec<_>>()
        );

        let result = {
            let guard = self.connection.lock().await;
            let Some(connection) = guard.as_ref() else {
                return Err(TransportError::NotFound);
            };
            let mut outcome = Ok(());
            for frame in frames {
                if let Err(err) = connection.write(frame).await {
                    outcome = Err(err);
                    break;
                }
            }
            outcome
        };

        match result {
            Ok(()) => {
                self.reset_disconnect_timer();
                Ok(())
            }
            Err(err) => {
                tracing::debug!(
                    "{}: write failed ({err}); backing off {:?} and disconnecting",
                    self.name,
                    WRITE_BACKOFF
                );
                tokio::time::sleep(WRITE_BACKOFF).await;
                self.disconnect().await;
                Err(err)
            }
        }
    }

    fn reset_disconnect_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_DELAY).await;
            if let Some(device) = weak.upgrade() {
                tracing::debug!(
                    "{}: disconnecting after {:?} idle",
                    device.name,
                    DISCONNECT_DELAY
                );
                device.disconnect().await;
            }
        });
        let mut timer = self.disconnect_timer.lock().expect("timer lock");
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }

    /// Drop the connection and cancel the idle timer.
    pub async fn disconnect(&self) {
        if let Some(timer) = self.disconnect_timer.lock().expect("timer lock").take() {
            timer.abort();
        }
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            connection.close().await;
            tracing::debug!("{}: disconnected", self.name);
        }
    }

    pub async fn is_connected(&self) -> bool {
        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(connection) => connection.is_connected().await,
            None => false,
        }
    }

    fn map_transport(&self, err: TransportError) -> ServiceError {
        ServiceError::from_transport(err, self.kind())
    }

    /// Ask the device to report its status.
    pub async fn request_status(self: &Arc<Self>) -> ServiceResult<()> {
        let frame = protocol::create_status_request_command(self.next_msg_id())?;
        self.send_command(&[frame])
            .await
            .map_err(|err| self.map_transport(err))
    }

    /// Write the five-frame daily-dose batch, optionally confirming with a
    /// status round-trip.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_daily_dose(
        self: &Arc<Self>,
        head_index: u8,
        volume_tenths_ml: u16,
        hour: u8,
        minute: u8,
        weekdays: Option<&[PumpWeekday]>,
        confirm: bool,
        wait: Duration,
    ) -> ServiceResult<Option<DoserStatus>> {
        let mask = protocol::encode_pump_weekdays(weekdays);
        let frames = vec![
            protocol::create_prepare_command(self.next_msg_id(), 0x04)?,
            protocol::create_prepare_command(self.next_msg_id(), 0x05)?,
            protocol::create_head_select_command(self.next_msg_id(), head_index)?,
            protocol::create_head_dose_command(self.next_msg_id(), head_index, volume_tenths_ml, mask)?,
            protocol::create_head_schedule_command(self.next_msg_id(), head_index, hour, minute)?,
        ];
        self.send_command(&frames)
            .await
            .map_err(|err| self.map_transport(err))?;

        if !confirm {
            return Ok(None);
        }
        self.request_status().await?;
        tokio::time::sleep(wait).await;
        Ok(match self.last_status() {
            Some(DeviceStatus::Doser(status)) => Some(status),
            _ => None,
        })
    }

    /// Resolve a color argument (name or channel index) against the model's
    /// color map.
    fn resolve_color(&self, color: &ColorSelector) -> Option<u8> {
        match color {
            ColorSelector::Index(index) => self
                .model
                .colors
                .iter()
                .any(|&(_, i)| i == *index)
                .then_some(*index),
            ColorSelector::Name(name) => self
                .model
                .colors
                .iter()
                .find(|&&(n, _)| n == name.as_str())
                .map(|&(_, i)| i),
        }
    }

    /// Channel indices declared by the model, deduplicated and ordered.
    fn channel_indices(&self) -> Vec<u8> {
        let mut indices: Vec<u8> = self.model.colors.iter().map(|&(_, i)| i).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Set brightness on one channel. Unknown colors are logged and ignored,
    /// matching the device's tolerant behavior.
    pub async fn set_color_brightness(
        self: &Arc<Self>,
        brightness: u8,
        color: &ColorSelector,
    ) -> ServiceResult<()> {
        let Some(color_id) = self.resolve_color(color) else {
            tracing::warn!("{}: color not supported: {:?}", self.name, color);
            return Ok(());
        };
        let frame = protocol::create_manual_setting_command(self.next_msg_id(), color_id, brightness)?;
        self.send_command(&[frame])
            .await
            .map_err(|err| self.map_transport(err))
    }

    /// Set every channel's brightness in one batch.
    pub async fn set_multi_channel_brightness(self: &Arc<Self>, levels: &[u8]) -> ServiceResult<()> {
        if levels.is_empty() || levels.len() > 4 {
            return Err(ServiceError::InvalidArgs(
                "channels must contain between 1 and 4 values".to_string(),
            ));
        }
        let mut frames = Vec::with_capacity(levels.len());
        for (index, &brightness) in levels.iter().enumerate() {
            frames.push(protocol::create_manual_setting_command(
                self.next_msg_id(),
                index as u8,
                brightness,
            )?);
        }
        self.send_command(&frames)
            .await
            .map_err(|err| self.map_transport(err))
    }

    /// All channels to full brightness.
    pub async fn turn_on(self: &Arc<Self>) -> ServiceResult<()> {
        self.set_all_channels(100).await
    }

    /// All channels dark.
    pub async fn turn_off(self: &Arc<Self>) -> ServiceResult<()> {
        self.set_all_channels(0).await
    }

    async fn set_all_channels(self: &Arc<Self>, brightness: u8) -> ServiceResult<()> {
        let mut frames = Vec::new();
        for index in self.channel_indices() {
            frames.push(protocol::create_manual_setting_command(
                self.next_msg_id(),
                index,
                brightness,
            )?);
        }
        if frames.is_empty() {
            return Err(ServiceError::InvalidArgs(
                "device declares no channels".to_string(),
            ));
        }
        self.send_command(&frames)
            .await
            .map_err(|err| self.map_transport(err))
    }

    /// Add an auto program (single brightness applied to the first channel
    /// triplet slot).
    pub async fn add_auto_setting(
        self: &Arc<Self>,
        sunrise: (u8, u8),
        sunset: (u8, u8),
        brightness: u8,
        ramp_up_minutes: u8,
        weekday_mask: u8,
    ) -> ServiceResult<()> {
        let frame = protocol::create_add_auto_setting_command(
            self.next_msg_id(),
            sunrise,
            sunset,
            (brightness, 255, 255),
            ramp_up_minutes,
            weekday_mask,
        )?;
        self.send_command(&[frame])
            .await
            .map_err(|err| self.map_transport(err))
    }

    /// Add an auto program with a full RGB brightness triplet.
    pub async fn add_rgb_auto_setting(
        self: &Arc<Self>,
        sunrise: (u8, u8),
        sunset: (u8, u8),
        brightness: (u8, u8, u8),
        ramp_up_minutes: u8,
        weekday_mask: u8,
    ) -> ServiceResult<()> {
        let frame = protocol::create_add_auto_setting_command(
            self.next_msg_id(),
            sunrise,
            sunset,
            brightness,
            ramp_up_minutes,
            weekday_mask,
        )?;
        self.send_command(&[frame])
            .await
            .map_err(|err| self.map_transport(err))
    }

    /// Delete one auto program.
    pub async fn remove_auto_setting(
        self: &Arc<Self>,
        sunrise: (u8, u8),
        sunset: (u8, u8),
        ramp_up_minutes: u8,
        weekday_mask: u8,
    ) -> ServiceResult<()> {
        let frame = protocol::create_delete_auto_setting_command(
            self.next_msg_id(),
            sunrise,
            sunset,
            ramp_up_minutes,
            weekday_mask,
        )?;
        self.send_command(&[frame])
            .await
            .map_err(|err| self.map_transport(err))
    }

    /// Remove all auto programs.
    pub async fn reset_auto_settings(self: &Arc<Self>) -> ServiceResult<()> {
        let frame = protocol::create_reset_auto_settings_command(self.next_msg_id())?;
        self.send_command(&[frame])
            .await
            .map_err(|err| self.map_transport(err))
    }

    /// Switch into auto mode and sync the device clock.
    pub async fn enable_auto_mode(self: &Arc<Self>) -> ServiceResult<()> {
        let switch = protocol::create_switch_to_auto_mode_command(self.next_msg_id())?;
        let set_time =
            protocol::create_set_time_command(self.next_msg_id(), Local::now().naive_local())?;
        self.send_command(&[switch]).await.map_err(|err| self.map_transport(err))?;
        self.send_command(&[set_time]).await.map_err(|err| self.map_transport(err))
    }

    /// Back to manual control: all channels to full brightness.
    pub async fn set_manual_mode(self: &Arc<Self>) -> ServiceResult<()> {
        self.set_all_channels(100).await
    }
}

/// A color argument from the API: either a channel index or a color name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorSelector {
    Index(u8),
    Name(String),
}

impl ColorSelector {
    /// Parse the loose JSON shapes clients send: integers, numeric strings,
    /// or color names.
    pub fn from_json(value: &serde_json::Value) -> Option<ColorSelector> {
        match value {
            serde_json::Value::Number(n) => {
                n.as_u64().map(|i| ColorSelector::Index(i.min(255) as u8))
            }
            serde_json::Value::String(s) => {
                let trimmed = s.trim();
                match trimmed.parse::<u8>() {
                    Ok(index) => Some(ColorSelector::Index(index)),
                    Err(_) => Some(ColorSelector::Name(trimmed.to_string())),
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! In-process transport fake shared by driver and orchestrator tests.

    use super::*;
    use crate::transport::DiscoveredDevice;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct MockState {
        pub written: Vec<Vec<u8>>,
        pub sink: Option<NotificationSink>,
        pub fail_writes: bool,
        pub fail_connects: bool,
        pub connect_count: u32,
        pub devices: Vec<(String, Option<String>)>,
    }

    /// Transport fake: records writes, exposes the notification sink, and
    /// serves a scripted scan list.
    #[derive(Default)]
    pub struct MockTransport {
        pub state: Arc<StdMutex<MockState>>,
    }

    impl MockTransport {
        pub fn with_devices(devices: Vec<(String, Option<String>)>) -> Arc<Self> {
            let transport = MockTransport::default();
            transport.state.lock().unwrap().devices = devices;
            Arc::new(transport)
        }

        pub fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().written.clone()
        }

        pub fn notify(&self, payload: &[u8]) {
            let sink = self.state.lock().unwrap().sink.clone();
            if let Some(sink) = sink {
                sink(payload.to_vec());
            }
        }
    }

    pub struct MockConnection {
        state: Arc<StdMutex<MockState>>,
        open: Arc<StdMutex<bool>>,
    }

    #[async_trait]
    impl BleTransport for MockTransport {
        async fn scan(&self, _timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .devices
                .iter()
                .map(|(address, name)| DiscoveredDevice {
                    address: address.clone(),
                    name: name.clone(),
                })
                .collect())
        }

        async fn resolve(&self, address: &str) -> Result<DiscoveredDevice, TransportError> {
            self.state
                .lock()
                .unwrap()
                .devices
                .iter()
                .find(|(a, _)| a == address)
                .map(|(address, name)| DiscoveredDevice {
                    address: address.clone(),
                    name: name.clone(),
                })
                .ok_or(TransportError::NotFound)
        }

        async fn connect(
            &self,
            address: &str,
            sink: NotificationSink,
        ) -> Result<Box<dyn BleConnection>, TransportError> {
            let mut state = self.state.lock().unwrap();
            state.connect_count += 1;
            if state.fail_connects {
                return Err(TransportError::NotFound);
            }
            if !state.devices.iter().any(|(a, _)| a == address) {
                return Err(TransportError::NotFound);
            }
            state.sink = Some(sink);
            Ok(Box::new(MockConnection {
                state: Arc::clone(&self.state),
                open: Arc::new(StdMutex::new(true)),
            }))
        }
    }

    #[async_trait]
    impl BleConnection for MockConnection {
        async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_writes {
                return Err(TransportError::Io("write failed".to_string()));
            }
            state.written.push(frame.to_vec());
            Ok(())
        }

        async fn close(&self) {
            *self.open.lock().unwrap() = false;
        }

        async fn is_connected(&self) -> bool {
            *self.open.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::MockTransport;
    use super::*;

    fn doser_model() -> &'static DeviceModel {
        model_for_name("DYDOSE-1234").unwrap()
    }

    fn light_model() -> &'static DeviceModel {
        model_for_name("DYNCRGP-77").unwrap()
    }

    fn mock_device(model: &'static DeviceModel) -> (Arc<MockTransport>, Arc<Device>) {
        let transport =
            MockTransport::with_devices(vec![("AA:BB:CC:DD:EE:FF".to_string(), None)]);
        let device = Device::new(
            "AA:BB:CC:DD:EE:FF".to_string(),
            "test-device".to_string(),
            model,
            transport.clone() as Arc<dyn BleTransport>,
            SessionLimits::default(),
        );
        (transport, device)
    }

    #[test]
    fn test_model_lookup_by_prefix() {
        assert_eq!(model_for_name("DYDOSE-5E0A").unwrap().kind, DeviceKind::Doser);
        assert_eq!(model_for_name("DYNW60 tank").unwrap().model_name, "WRGB II");
        assert_eq!(model_for_name("DYNW12P-7").unwrap().model_name, "WRGB II");
        assert_eq!(
            model_for_name("DYSSD123").unwrap().model_name,
            "Z Light TINY"
        );
        assert_eq!(
            model_for_name("DYU1200-01").unwrap().model_name,
            "Universal WRGB"
        );
        assert!(model_for_name("Samsung TV").is_none());
    }

    #[test]
    fn test_universal_wrgb_declares_four_channels() {
        let model = model_for_name("DYU920").unwrap();
        assert_eq!(model.colors.len(), 4);
        assert!(model.colors.contains(&("white", 3)));
    }

    #[test]
    fn test_device_kind_parse_and_display() {
        assert_eq!(DeviceKind::parse("doser"), Some(DeviceKind::Doser));
        assert_eq!(DeviceKind::parse("LIGHT"), Some(DeviceKind::Light));
        assert_eq!(DeviceKind::parse("toaster"), None);
        assert_eq!(DeviceKind::Doser.to_string(), "doser");
    }

    #[test]
    fn test_msg_id_session_advances_and_resets_on_count() {
        let transport = MockTransport::with_devices(vec![]);
        let device = Device::new(
            "AA".into(),
            "d".into(),
            doser_model(),
            transport as Arc<dyn BleTransport>,
            SessionLimits {
                reset_hours: 24.0,
                max_commands: 3,
            },
        );
        assert_eq!(device.next_msg_id(), (0, 2));
        assert_eq!(device.next_msg_id(), (0, 3));
        assert_eq!(device.next_msg_id(), (0, 4));
        // Fourth draw exceeds the session command limit and resets first.
        assert_eq!(device.next_msg_id(), (0, 2));
    }

    #[tokio::test]
    async fn test_send_command_writes_frames_in_order() {
        let (transport, device) = mock_device(doser_model());
        let frames = vec![vec![1u8, 2, 3], vec![4u8, 5, 6]];
        device.send_command(&frames).await.unwrap();
        assert_eq!(transport.written(), frames);
        assert!(device.is_connected().await);
        device.disconnect().await;
        assert!(!device.is_connected().await);
    }

    #[tokio::test]
    async fn test_write_failure_forces_disconnect() {
        let (transport, device) = mock_device(doser_model());
        device.ensure_connected().await.unwrap();
        transport.state.lock().unwrap().fail_writes = true;
        let err = device.send_command(&[vec![1, 2, 3]]).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert!(!device.is_connected().await);
    }

    #[tokio::test]
    async fn test_set_daily_dose_emits_five_frame_batch() {
        let (transport, device) = mock_device(doser_model());
        device
            .set_daily_dose(1, 200, 8, 30, None, false, Duration::ZERO)
            .await
            .unwrap();

        let written = transport.written();
        assert_eq!(written.len(), 5);
        // prepare(0x04), prepare(0x05), head select, head dose, schedule
        assert_eq!((written[0][0], written[0][5]), (0xA5, 0x04));
        assert_eq!(written[0][6], 0x04);
        assert_eq!(written[1][6], 0x05);
        assert_eq!((written[2][0], written[2][5]), (0xA5, 0x20));
        assert_eq!((written[3][0], written[3][5]), (0xA5, 0x1B));
        assert_eq!((written[4][0], written[4][5]), (0xA5, 0x15));
    }

    #[tokio::test]
    async fn test_set_daily_dose_confirm_returns_parsed_status() {
        let (transport, device) = mock_device(doser_model());
        // Connect first so the notification sink is registered, then feed a
        // status before the confirm wait elapses.
        device.ensure_connected().await.unwrap();
        let mut payload = vec![0x5B, 0x18, 0x30, 0x00, 0x01, 0xFE, 0x04, 0x0C, 0x38];
        payload.extend_from_slice(&[0x00, 0x0C, 0x37, 0x11, 0x22, 0x33, 0x44, 0x01, 0x2C]);
        payload.extend_from_slice(&[0x10, 0x20, 0x30, 0x40, 0x55]);
        transport.notify(&payload);

        let status = device
            .set_daily_dose(0, 100, 9, 0, None, true, Duration::ZERO)
            .await
            .unwrap();
        assert!(status.is_some());
        assert_eq!(status.unwrap().heads.len(), 1);
    }

    #[tokio::test]
    async fn test_light_notification_routing() {
        let (transport, device) = mock_device(light_model());
        device.ensure_connected().await.unwrap();

        // Handshake ack is ignored.
        transport.notify(&[0x5B, 0x00, 0x00, 0x00, 0x01, 0x0A]);
        assert!(device.last_status().is_none());

        // A status frame is parsed and stored.
        let mut payload = vec![0x5B, 0x18, 0x30, 0x00, 0x01, 0xFE, 0x03, 0x0D, 0x2A];
        payload.extend_from_slice(&[0x08, 0x00, 0x32]);
        payload.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
        transport.notify(&payload);
        match device.last_status() {
            Some(DeviceStatus::Light(parsed)) => assert_eq!(parsed.keyframes.len(), 1),
            other => panic!("expected light status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_doser_parse_failure_keeps_previous_status() {
        let (transport, device) = mock_device(doser_model());
        device.ensure_connected().await.unwrap();

        let mut payload = vec![0x5B, 0x18, 0x30, 0x00, 0x01, 0xFE, 0x04, 0x0C, 0x38];
        payload.extend_from_slice(&[0x00, 0x0C, 0x38, 0x11, 0x22, 0x33, 0x44, 0x01, 0x2C]);
        payload.extend_from_slice(&[0x10, 0x20, 0x30, 0x40, 0x55]);
        transport.notify(&payload);
        assert!(device.last_status().is_some());

        // Truncated garbage must not clobber the good snapshot.
        transport.notify(&[0x5B, 0x01]);
        match device.last_status() {
            Some(DeviceStatus::Doser(status)) => assert_eq!(status.heads.len(), 1),
            other => panic!("expected doser status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_turn_on_dedupes_channel_indices() {
        let transport = MockTransport::with_devices(vec![("AA".to_string(), None)]);
        let device = Device::new(
            "AA".into(),
            "commander".into(),
            model_for_name("DYCOM-1").unwrap(),
            transport.clone() as Arc<dyn BleTransport>,
            SessionLimits::default(),
        );
        device.turn_on().await.unwrap();
        // Commander 1 maps white and red to channel 0; three unique channels.
        let written = transport.written();
        assert_eq!(written.len(), 3);
        let channels: Vec<u8> = written.iter().map(|f| f[6]).collect();
        assert_eq!(channels, vec![0, 1, 2]);
        assert!(written.iter().all(|f| f[7] == 100));
    }

    #[tokio::test]
    async fn test_auto_setting_add_and_remove_frames() {
        let (transport, device) = mock_device(light_model());
        device
            .add_auto_setting((8, 0), (18, 30), 80, 15, 0x7F)
            .await
            .unwrap();
        device
            .remove_auto_setting((8, 0), (18, 30), 15, 0x7F)
            .await
            .unwrap();

        let written = transport.written();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|f| f[0] == 0xA5 && f[5] == 0x19));
        // The add carries the brightness; the delete carries the sentinel.
        assert_eq!(written[0][12], 80);
        assert_eq!(written[1][12..15], [255, 255, 255]);
    }

    #[tokio::test]
    async fn test_enable_auto_mode_sends_switch_then_time() {
        let (transport, device) = mock_device(light_model());
        device.enable_auto_mode().await.unwrap();
        let written = transport.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0][5], 0x05);
        assert_eq!(written[1][5], 0x09);
    }

    #[tokio::test]
    async fn test_unknown_color_is_ignored() {
        let (transport, device) = mock_device(light_model());
        device
            .set_color_brightness(50, &ColorSelector::Name("violet".into()))
            .await
            .unwrap();
        assert!(transport.written().is_empty());

        device
            .set_color_brightness(50, &ColorSelector::Name("red".into()))
            .await
            .unwrap();
        assert_eq!(transport.written().len(), 1);
    }

    #[tokio::test]
    async fn test_multi_channel_brightness_bounds() {
        let (_, device) = mock_device(light_model());
        assert!(device.set_multi_channel_brightness(&[]).await.is_err());
        assert!(device
            .set_multi_channel_brightness(&[1, 2, 3, 4, 5])
            .await
            .is_err());
    }

    #[test]
    fn test_color_selector_from_json() {
        assert_eq!(
            ColorSelector::from_json(&serde_json::json!(2)),
            Some(ColorSelector::Index(2))
        );
        assert_eq!(
            ColorSelector::from_json(&serde_json::json!("3")),
            Some(ColorSelector::Index(3))
        );
        assert_eq!(
            ColorSelector::from_json(&serde_json::json!("red")),
            Some(ColorSelector::Name("red".into()))
        );
        assert_eq!(ColorSelector::from_json(&serde_json::json!(null)), None);
    }
}
