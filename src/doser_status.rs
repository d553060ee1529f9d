//! Parser for dosing pump status notifications.
//!
//! The pump answers a status request with a `0x5B ... 0xFE ...` frame whose
//! body carries up to four 9-byte per-head records and a 5-byte tail of
//! configured daily targets. A second frame shape (response modes `0x1E` and
//! `0x22`) reports lifetime dispensed totals instead of head records.

use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::MessageId;

/// Frame sentinel that opens a full UART status frame.
const FRAME_START: u8 = 0x5B;

/// Response modes that carry lifetime totals instead of head records.
const LIFETIME_MODES: [u8; 2] = [0x1E, 0x22];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusParseError {
    #[error("payload too short")]
    TooShort,
}

/// Decoded information for a single head in the status frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadSnapshot {
    pub mode: u8,
    pub hour: u8,
    pub minute: u8,
    pub extra: [u8; 4],
    pub dosed_tenths_ml: u16,
    pub lifetime_tenths_ml: Option<u16>,
}

impl HeadSnapshot {
    /// Human friendly mode name if known.
    pub fn mode_label(&self) -> String {
        match self.mode {
            0x00 => "daily".into(),
            0x01 => "24h".into(),
            0x02 => "custom".into(),
            0x03 => "timer".into(),
            0x04 => "disabled".into(),
            other => format!("{other:#04X}"),
        }
    }

    /// Millilitres already dispensed today.
    pub fn dosed_ml(&self) -> f64 {
        f64::from(self.dosed_tenths_ml) / 10.0
    }
}

/// High level representation of a pump status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoserStatus {
    pub message_id: Option<MessageId>,
    pub response_mode: Option<u8>,
    pub weekday: Option<u8>,
    pub hour: Option<u8>,
    pub minute: Option<u8>,
    pub heads: Vec<HeadSnapshot>,
    pub tail_targets: Vec<u8>,
    pub tail_flag: Option<u8>,
    pub tail_raw: Vec<u8>,
    pub lifetime_totals_tenths_ml: Vec<u16>,
    pub raw_payload: Vec<u8>,
}

impl DoserStatus {
    /// Lifetime totals converted to millilitres.
    pub fn lifetime_totals_ml(&self) -> Vec<f64> {
        self.lifetime_totals_tenths_ml
            .iter()
            .map(|&t| f64::from(t) / 10.0)
            .collect()
    }

    /// JSON-safe view used by the status cache and the HTTP API.
    pub fn to_json(&self) -> Value {
        json!({
            "message_id": self.message_id.map(|(hi, lo)| vec![hi, lo]),
            "response_mode": self.response_mode,
            "weekday": self.weekday,
            "hour": self.hour,
            "minute": self.minute,
            "heads": self
                .heads
                .iter()
                .map(|head| {
                    json!({
                        "mode": head.mode,
                        "mode_label": head.mode_label(),
                        "hour": head.hour,
                        "minute": head.minute,
                        "extra": hex::encode(head.extra),
                        "dosed_tenths_ml": head.dosed_tenths_ml,
                        "dosed_ml": head.dosed_ml(),
                        "lifetime_tenths_ml": head.lifetime_tenths_ml,
                    })
                })
                .collect::<Vec<_>>(),
            "tail_targets": self.tail_targets,
            "tail_flag": self.tail_flag,
            "tail_raw": hex::encode(&self.tail_raw),
            "lifetime_totals_tenths_ml": self.lifetime_totals_tenths_ml,
            "lifetime_totals_ml": self.lifetime_totals_ml(),
        })
    }
}

/// True when the first three body bytes look like the `(weekday, hour,
/// minute)` triplet the pump embeds ahead of its head records. The device
/// clock can drift while the frame is assembled, so a ±1 minute difference
/// from the header time is accepted.
fn is_body_time_triplet(chunk: &[u8], weekday: u8, hour: u8, minute: u8) -> bool {
    if chunk.len() < 3 {
        return false;
    }
    let (wd, h, m) = (chunk[0], chunk[1], chunk[2]);
    if wd != weekday || !(1..=7).contains(&wd) || h > 23 || m > 59 {
        return false;
    }
    let header_minutes = i32::from(hour) * 60 + i32::from(minute);
    let body_minutes = i32::from(h) * 60 + i32::from(m);
    (header_minutes - body_minutes).abs() <= 1
}

/// Parse a `0xFE` status notification from the pump.
///
/// Accepts either the full UART frame (starting with `0x5B`) or the trimmed
/// body whose first three bytes are the weekday/hour/minute triplet.
pub fn parse_doser_payload(payload: &[u8]) -> Result<DoserStatus, StatusParseError> {
    if payload.is_empty() {
        return Err(StatusParseError::TooShort);
    }

    let mut message_id = None;
    let mut response_mode = None;
    let mut weekday = None;
    let mut hour = None;
    let mut minute = None;

    let body: &[u8];
    if payload[0] == FRAME_START {
        if payload.len() < 6 {
            return Err(StatusParseError::TooShort);
        }
        message_id = Some((payload[3], payload[4]));
        let mode = payload[5];
        response_mode = Some(mode);

        if LIFETIME_MODES.contains(&mode) {
            // Lifetime frames carry no time triplet; the counters follow the
            // six-byte header directly, optionally behind a 0x01 marker.
            let mut counters = &payload[6..];
            if counters.first() == Some(&0x01) {
                counters = &counters[1..];
            }
            let lifetime: Vec<u16> = counters
                .chunks_exact(2)
                .take(4)
                .map(|pair| u16::from(pair[0]) << 8 | u16::from(pair[1]))
                .collect();
            return Ok(DoserStatus {
                message_id,
                response_mode,
                weekday: None,
                hour: None,
                minute: None,
                heads: Vec::new(),
                tail_targets: Vec::new(),
                tail_flag: None,
                tail_raw: Vec::new(),
                lifetime_totals_tenths_ml: lifetime,
                raw_payload: payload.to_vec(),
            });
        }

        if payload.len() < 9 {
            return Err(StatusParseError::TooShort);
        }
        weekday = Some(payload[6]);
        hour = Some(payload[7]);
        minute = Some(payload[8]);
        body = &payload[9..];
    } else {
        if payload.len() < 3 {
            return Err(StatusParseError::TooShort);
        }
        weekday = Some(payload[0]);
        hour = Some(payload[1]);
        minute = Some(payload[2]);
        body = &payload[3..];
    }

    // The configured daily targets ride in the last five bytes.
    let (mut head_bytes, tail_raw) = if body.len() >= 5 {
        (&body[..body.len() - 5], &body[body.len() - 5..])
    } else {
        (body, &[][..])
    };

    // Skip zeroed padding triplets, then consume the embedded body time
    // triplet when it agrees with the header within one minute.
    if let (Some(wd), Some(h), Some(m)) = (weekday, hour, minute) {
        while head_bytes.len() >= 3 && head_bytes[..3] == [0, 0, 0] {
            head_bytes = &head_bytes[3..];
        }
        if is_body_time_triplet(head_bytes, wd, h, m) {
            head_bytes = &head_bytes[3..];
        }
    }

    let heads: Vec<HeadSnapshot> = head_bytes
        .chunks_exact(9)
        .take(4)
        .map(|chunk| HeadSnapshot {
            mode: chunk[0],
            hour: chunk[1],
            minute: chunk[2],
            extra: [chunk[3], chunk[4], chunk[5], chunk[6]],
            dosed_tenths_ml: u16::from(chunk[7]) << 8 | u16::from(chunk[8]),
            lifetime_tenths_ml: None,
        })
        .collect();

    let tail_targets = tail_raw.iter().take(4).copied().collect();
    let tail_flag = tail_raw.get(4).copied();

    Ok(DoserStatus {
        message_id,
        response_mode,
        weekday,
        hour,
        minute,
        heads,
        tail_targets,
        tail_flag,
        tail_raw: tail_raw.to_vec(),
        lifetime_totals_tenths_ml: Vec::new(),
        raw_payload: payload.to_vec(),
    })
}
