//! Parser for light status notifications.
//!
//! A light status body is an ordered run of `(hour, minute, value)`
//! keyframes, interleaved with `00 02 HH MM` time markers (the device's
//! current clock) and zeroed padding triples. Parsing stops once a keyframe
//! time runs backwards; whatever follows is a trailing artifact and is kept
//! in `tail` alongside the final five body bytes.

use serde_json::{json, Value};

use crate::protocol::MessageId;

/// Frame sentinel that opens a full UART status frame.
const FRAME_START: u8 = 0x5B;

/// A single scheduled point (hour, minute, intensity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightKeyframe {
    pub hour: u8,
    pub minute: u8,
    pub value: u8,
}

impl LightKeyframe {
    pub fn as_time(&self) -> String {
        format!("{:02}:{:02}", self.hour, self.minute)
    }

    fn total_minutes(&self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }

    /// Brightness as a percentage; raw values above 100 are treated as a
    /// 0-255 scale.
    pub fn percent(&self) -> u8 {
        if self.value <= 100 {
            self.value
        } else {
            ((f64::from(self.value) / 255.0) * 100.0).round() as u8
        }
    }
}

/// Decoded view of a light status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLightStatus {
    pub message_id: Option<MessageId>,
    pub response_mode: Option<u8>,
    pub weekday: Option<u8>,
    pub current_hour: Option<u8>,
    pub current_minute: Option<u8>,
    pub keyframes: Vec<LightKeyframe>,
    pub time_markers: Vec<(u8, u8)>,
    pub tail: Vec<u8>,
    pub raw_payload: Vec<u8>,
}

impl ParsedLightStatus {
    /// JSON-safe view used by the status cache and the HTTP API.
    pub fn to_json(&self) -> Value {
        json!({
            "message_id": self.message_id.map(|(hi, lo)| vec![hi, lo]),
            "response_mode": self.response_mode,
            "weekday": self.weekday,
            "current_hour": self.current_hour,
            "current_minute": self.current_minute,
            "keyframes": self
                .keyframes
                .iter()
                .map(|frame| {
                    json!({
                        "hour": frame.hour,
                        "minute": frame.minute,
                        "value": frame.value,
                        "percent": frame.percent(),
                    })
                })
                .collect::<Vec<_>>(),
            "time_markers": self.time_markers.iter().map(|&(h, m)| vec![h, m]).collect::<Vec<_>>(),
            "tail": hex::encode(&self.tail),
            "raw_payload": hex::encode(&self.raw_payload),
        })
    }
}

/// Decode a light status payload into keyframes and markers.
///
/// Accepts either the full `0x5B` frame or a bare body; header fields are
/// `None` when absent. This parser never fails: malformed regions simply end
/// up in `tail`/`raw_payload`.
pub fn parse_light_payload(payload: &[u8]) -> ParsedLightStatus {
    let mut message_id = None;
    let mut response_mode = None;
    let mut weekday = None;
    let mut current_hour = None;
    let mut current_minute = None;

    let body = if !payload.is_empty() && payload[0] == FRAME_START && payload.len() >= 9 {
        message_id = Some((payload[3], payload[4]));
        response_mode = Some(payload[5]);
        weekday = Some(payload[6]);
        current_hour = Some(payload[7]);
        current_minute = Some(payload[8]);
        &payload[9..]
    } else {
        payload
    };

    let (body_bytes, tail) = if body.len() >= 5 {
        (&body[..body.len() - 5], &body[body.len() - 5..])
    } else {
        (body, &[][..])
    };

    let mut keyframes = Vec::new();
    let mut time_markers = Vec::new();
    let mut last_time: Option<u16> = None;

    // Some firmware revisions echo the header's weekday/hour/minute triplet
    // inside the body before the keyframe run. Resume parsing after the
    // first echo so the prefix noise is not mistaken for keyframes.
    let start = match (weekday, current_hour, current_minute) {
        (Some(wd), Some(h), Some(m)) => body_bytes
            .windows(3)
            .position(|w| w == [wd, h, m])
            .map(|p| p + 3)
            .unwrap_or(0),
        _ => 0,
    };

    let mut i = start;
    while i < body_bytes.len() {
        let remaining = body_bytes.len() - i;

        // `00 02 HH MM` marks the controller's current clock, not a keyframe.
        if remaining >= 4 && body_bytes[i] == 0x00 && body_bytes[i + 1] == 0x02 {
            time_markers.push((body_bytes[i + 2], body_bytes[i + 3]));
            i += 4;
            continue;
        }

        if remaining < 3 {
            break;
        }

        let frame = LightKeyframe {
            hour: body_bytes[i],
            minute: body_bytes[i + 1],
            value: body_bytes[i + 2],
        };

        if (frame.hour, frame.minute, frame.value) == (0, 0, 0) {
            // padding / unused slot
            i += 3;
            continue;
        }

        if let Some(last) = last_time {
            if frame.total_minutes() < last {
                // Remaining entries are artifacts; stop here.
                break;
            }
        }

        last_time = Some(frame.total_minutes());
        keyframes.push(frame);
        i += 3;
    }

    ParsedLightStatus {
        message_id,
        response_mode,
        weekday,
        current_hour,
        current_minute,
        keyframes,
        time_markers,
        tail: tail.to_vec(),
        raw_payload: payload.to_vec(),
    }
}
