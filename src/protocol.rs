//! UART protocol codec for aquarium BLE peripherals.
//!
//! Both device families (dosing pumps and lights) speak the same
//! Nordic-UART-style framing over BLE:
//!
//! ```text
//! cmd_id | 0x01 | len(params)+5 | msg_hi | msg_lo | mode | params... | checksum
//! ```
//!
//! The checksum is the XOR of every byte from index 1 through the last
//! parameter. `0x5A` is reserved as a frame sentinel: it must never appear in
//! message-id bytes, parameter bytes (rewritten to `0x59`), or the checksum
//! (the message id is advanced and the frame rebuilt).

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved frame sentinel, forbidden outside the command-id position.
pub const RESERVED_BYTE: u8 = 0x5A;

/// Parameter bytes equal to the sentinel are rewritten to this value.
const SANITIZED_BYTE: u8 = 0x59;

/// How many times the frame builder will bump the message id to escape a
/// checksum collision before giving up.
const MAX_CHECKSUM_ATTEMPTS: u8 = 8;

/// Two-byte rolling message identifier `(hi, lo)`.
pub type MessageId = (u8, u8);

/// Errors produced while encoding command frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message id cannot contain reserved value 0x5A")]
    ReservedMessageId,
    #[error("checksum collision persisted after {MAX_CHECKSUM_ATTEMPTS} message id bumps")]
    ChecksumCollision,
    #[error("{0}")]
    InvalidArgument(String),
}

fn invalid(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidArgument(msg.into())
}

/// Return the next message id pair, skipping the reserved `0x5A` in both
/// positions.
///
/// The high byte is preserved while the low byte advances; when the low byte
/// wraps, the high byte advances (also skipping `0x5A`), and the full wrap
/// restarts the sequence at `(0, 1)`.
pub fn next_message_id(current: MessageId) -> Result<MessageId, ProtocolError> {
    let (hi, lo) = current;
    if hi == RESERVED_BYTE || lo == RESERVED_BYTE {
        return Err(ProtocolError::ReservedMessageId);
    }
    Ok(if lo == 255 {
        match hi {
            255 => (0, 1),
            89 => (91, 0),
            _ => (hi + 1, 0),
        }
    } else if lo == 89 {
        (hi, 91)
    } else {
        (hi, lo + 1)
    })
}

/// The message id a fresh session starts from.
pub fn reset_message_id() -> MessageId {
    (0, 1)
}

/// True once the id has entered the last ~10% of its space, signalling that
/// the session should be reset opportunistically.
pub fn is_message_id_exhausted(id: MessageId) -> bool {
    id.0 >= 230
}

/// XOR checksum over every byte except the leading command id.
fn calculate_checksum(frame: &[u8]) -> u8 {
    frame[1..].iter().fold(0, |acc, b| acc ^ b)
}

/// Assemble a UART frame for the given command, mode and parameters.
///
/// Parameter bytes equal to `0x5A` are sanitized to `0x59` before framing.
/// If the resulting checksum lands on `0x5A` the message id is advanced and
/// the frame rebuilt, bounded by [`MAX_CHECKSUM_ATTEMPTS`].
pub fn encode_uart_command(
    cmd_id: u8,
    mode: u8,
    msg_id: MessageId,
    params: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if msg_id.0 == RESERVED_BYTE || msg_id.1 == RESERVED_BYTE {
        return Err(ProtocolError::ReservedMessageId);
    }
    if params.len() > (u8::MAX as usize) - 5 {
        return Err(invalid("too many parameters for a single frame"));
    }

    let mut msg_id = msg_id;
    for _ in 0..MAX_CHECKSUM_ATTEMPTS {
        let mut frame = Vec::with_capacity(params.len() + 7);
        frame.push(cmd_id);
        frame.push(0x01);
        frame.push(params.len() as u8 + 5);
        frame.push(msg_id.0);
        frame.push(msg_id.1);
        frame.push(mode);
        frame.extend(params.iter().map(|&b| {
            if b == RESERVED_BYTE {
                SANITIZED_BYTE
            } else {
                b
            }
        }));

        let checksum = calculate_checksum(&frame);
        if checksum == RESERVED_BYTE {
            msg_id = next_message_id(msg_id)?;
            continue;
        }
        frame.push(checksum);
        return Ok(frame);
    }
    Err(ProtocolError::ChecksumCollision)
}

/// Build a set-time frame from an explicit timestamp.
///
/// The weekday byte is the ISO weekday (Monday = 1).
pub fn create_set_time_command(
    msg_id: MessageId,
    ts: NaiveDateTime,
) -> Result<Vec<u8>, ProtocolError> {
    let params = [
        (ts.year() - 2000).clamp(0, 255) as u8,
        ts.month() as u8,
        ts.weekday().number_from_monday() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
    ];
    encode_uart_command(0x5A, 0x09, msg_id, &params)
}

/// Manual color/brightness frame for a single channel.
pub fn create_manual_setting_command(
    msg_id: MessageId,
    color: u8,
    brightness: u8,
) -> Result<Vec<u8>, ProtocolError> {
    if brightness > 100 {
        return Err(invalid(format!("brightness must be 0-100, got {brightness}")));
    }
    encode_uart_command(0x5A, 0x07, msg_id, &[color, brightness])
}

/// Add an auto program (sunrise/sunset ramp) to a light.
pub fn create_add_auto_setting_command(
    msg_id: MessageId,
    sunrise: (u8, u8),
    sunset: (u8, u8),
    brightness: (u8, u8, u8),
    ramp_up_minutes: u8,
    weekdays: u8,
) -> Result<Vec<u8>, ProtocolError> {
    let params = [
        sunrise.0,
        sunrise.1,
        sunset.0,
        sunset.1,
        ramp_up_minutes,
        weekdays,
        brightness.0,
        brightness.1,
        brightness.2,
        255,
        255,
        255,
        255,
        255,
    ];
    encode_uart_command(0xA5, 0x19, msg_id, &params)
}

/// Delete an auto program; the device recognizes the all-255 brightness
/// triplet as a deletion.
pub fn create_delete_auto_setting_command(
    msg_id: MessageId,
    sunrise: (u8, u8),
    sunset: (u8, u8),
    ramp_up_minutes: u8,
    weekdays: u8,
) -> Result<Vec<u8>, ProtocolError> {
    create_add_auto_setting_command(
        msg_id,
        sunrise,
        sunset,
        (255, 255, 255),
        ramp_up_minutes,
        weekdays,
    )
}

/// Reset all auto settings on the device.
pub fn create_reset_auto_settings_command(msg_id: MessageId) -> Result<Vec<u8>, ProtocolError> {
    encode_uart_command(0x5A, 0x05, msg_id, &[5, 255, 255])
}

/// Switch the light into auto mode.
pub fn create_switch_to_auto_mode_command(msg_id: MessageId) -> Result<Vec<u8>, ProtocolError> {
    encode_uart_command(0x5A, 0x05, msg_id, &[18, 255, 255])
}

/// Ask the device to report its current status.
pub fn create_status_request_command(msg_id: MessageId) -> Result<Vec<u8>, ProtocolError> {
    encode_uart_command(0x5A, 0x04, msg_id, &[0x01])
}

/// The `0xA5`/`0x04` command sent before pump configuration writes.
pub fn create_prepare_command(msg_id: MessageId, stage: u8) -> Result<Vec<u8>, ProtocolError> {
    if stage != 0x04 && stage != 0x05 {
        return Err(invalid(format!("stage must be 0x04 or 0x05, got {stage:#04X}")));
    }
    encode_uart_command(0xA5, 0x04, msg_id, &[stage])
}

/// Select the dosing head that subsequent frames will modify.
pub fn create_head_select_command(
    msg_id: MessageId,
    head_index: u8,
) -> Result<Vec<u8>, ProtocolError> {
    if head_index > 3 {
        return Err(invalid(format!("head index must be 0-3, got {head_index}")));
    }
    encode_uart_command(0xA5, 0x20, msg_id, &[head_index, 0x00, 0x01])
}

/// Set weekday mask and daily dose volume for a head.
///
/// Volumes up to 255 tenths use the legacy one-byte mode `0x1B`; larger
/// volumes use the two-byte big-endian mode `0x1C` (up to 6553.5 mL).
pub fn create_head_dose_command(
    msg_id: MessageId,
    head_index: u8,
    volume_tenths_ml: u16,
    weekday_mask: u8,
) -> Result<Vec<u8>, ProtocolError> {
    if head_index > 3 {
        return Err(invalid(format!("head index must be 0-3, got {head_index}")));
    }
    if weekday_mask > 0x7F {
        return Err(invalid("weekday mask must be a 7-bit value"));
    }
    const SCHEDULE_MODE: u8 = 0x01;
    const REPEAT_FLAG: u8 = 0x01;
    const RESERVED: u8 = 0x00;
    if volume_tenths_ml <= 0xFF {
        encode_uart_command(
            0xA5,
            0x1B,
            msg_id,
            &[
                head_index,
                weekday_mask,
                SCHEDULE_MODE,
                REPEAT_FLAG,
                RESERVED,
                volume_tenths_ml as u8,
            ],
        )
    } else {
        encode_uart_command(
            0xA5,
            0x1C,
            msg_id,
            &[
                head_index,
                weekday_mask,
                SCHEDULE_MODE,
                REPEAT_FLAG,
                RESERVED,
                (volume_tenths_ml >> 8) as u8,
                (volume_tenths_ml & 0xFF) as u8,
            ],
        )
    }
}

/// Set the daily schedule time for a head.
pub fn create_head_schedule_command(
    msg_id: MessageId,
    head_index: u8,
    hour: u8,
    minute: u8,
) -> Result<Vec<u8>, ProtocolError> {
    if head_index > 3 {
        return Err(invalid(format!("head index must be 0-3, got {head_index}")));
    }
    if hour > 23 {
        return Err(invalid(format!("hour must be 0-23, got {hour}")));
    }
    if minute > 59 {
        return Err(invalid(format!("minute must be 0-59, got {minute}")));
    }
    encode_uart_command(
        0xA5,
        0x15,
        msg_id,
        &[head_index, 0x00, hour, minute, 0x00, 0x00],
    )
}

/// Weekday selection for light auto programs.
///
/// The light protocol maps Monday to bit 6 down to Sunday at bit 0; the pump
/// uses a different ordering (see [`PumpWeekday`]). The two enums are kept
/// separate so a mask can never be built with the wrong ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightWeekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
    Everyday,
}

impl LightWeekday {
    fn bit(self) -> u8 {
        match self {
            LightWeekday::Monday => 64,
            LightWeekday::Tuesday => 32,
            LightWeekday::Wednesday => 16,
            LightWeekday::Thursday => 8,
            LightWeekday::Friday => 4,
            LightWeekday::Saturday => 2,
            LightWeekday::Sunday => 1,
            LightWeekday::Everyday => 0x7F,
        }
    }

    /// Three-letter abbreviations used in stored configuration documents.
    pub fn short_names(self) -> &'static [&'static str] {
        match self {
            LightWeekday::Monday => &["Mon"],
            LightWeekday::Tuesday => &["Tue"],
            LightWeekday::Wednesday => &["Wed"],
            LightWeekday::Thursday => &["Thu"],
            LightWeekday::Friday => &["Fri"],
            LightWeekday::Saturday => &["Sat"],
            LightWeekday::Sunday => &["Sun"],
            LightWeekday::Everyday => &["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"],
        }
    }
}

/// Encode a light weekday selection into the 7-bit light mask.
pub fn encode_light_weekdays(selection: &[LightWeekday]) -> u8 {
    if selection.contains(&LightWeekday::Everyday) {
        return 0x7F;
    }
    selection.iter().fold(0, |mask, day| mask | day.bit())
}

/// Weekday selection for pump schedules: Saturday is the LSB through Friday
/// at bit 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpWeekday {
    Saturday,
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Everyday,
}

impl PumpWeekday {
    fn bit(self) -> u8 {
        match self {
            PumpWeekday::Saturday => 1 << 0,
            PumpWeekday::Sunday => 1 << 1,
            PumpWeekday::Monday => 1 << 2,
            PumpWeekday::Tuesday => 1 << 3,
            PumpWeekday::Wednesday => 1 << 4,
            PumpWeekday::Thursday => 1 << 5,
            PumpWeekday::Friday => 1 << 6,
            PumpWeekday::Everyday => 0x7F,
        }
    }

    /// Three-letter abbreviations used in stored configuration documents.
    pub fn short_names(self) -> &'static [&'static str] {
        match self {
            PumpWeekday::Monday => &["Mon"],
            PumpWeekday::Tuesday => &["Tue"],
            PumpWeekday::Wednesday => &["Wed"],
            PumpWeekday::Thursday => &["Thu"],
            PumpWeekday::Friday => &["Fri"],
            PumpWeekday::Saturday => &["Sat"],
            PumpWeekday::Sunday => &["Sun"],
            PumpWeekday::Everyday => &["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"],
        }
    }
}

/// Encode a pump weekday selection into the pump's bitmask. `None` selects
/// every day.
pub fn encode_pump_weekdays(weekdays: Option<&[PumpWeekday]>) -> u8 {
    match weekdays {
        None => 0x7F,
        Some(days) => days.iter().fold(0, |mask, day| mask | day.bit()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_next_message_id_basic_increment() {
        assert_eq!(next_message_id((0, 0)).unwrap(), (0, 1));
        assert_eq!(next_message_id((0, 1)).unwrap(), (0, 2));
        assert_eq!(next_message_id((0, 88)).unwrap(), (0, 89));
        assert_eq!(next_message_id((0, 89)).unwrap(), (0, 91));
        assert_eq!(next_message_id((0, 91)).unwrap(), (0, 92));
    }

    #[test]
    fn test_next_message_id_preserves_high_byte() {
        assert_eq!(next_message_id((5, 0)).unwrap(), (5, 1));
        assert_eq!(next_message_id((5, 88)).unwrap(), (5, 89));
        assert_eq!(next_message_id((5, 89)).unwrap(), (5, 91));
        assert_eq!(next_message_id((10, 254)).unwrap(), (10, 255));
    }

    #[test]
    fn test_next_message_id_high_byte_increment() {
        assert_eq!(next_message_id((0, 255)).unwrap(), (1, 0));
        assert_eq!(next_message_id((5, 255)).unwrap(), (6, 0));
        assert_eq!(next_message_id((89, 255)).unwrap(), (91, 0));
    }

    #[test]
    fn test_next_message_id_wraparound() {
        assert_eq!(next_message_id((255, 255)).unwrap(), (0, 1));
    }

    #[test]
    fn test_next_message_id_rejects_reserved() {
        assert_eq!(
            next_message_id((90, 0)).unwrap_err(),
            ProtocolError::ReservedMessageId
        );
        assert_eq!(
            next_message_id((0, 90)).unwrap_err(),
            ProtocolError::ReservedMessageId
        );
    }

    #[test]
    fn test_message_id_never_contains_reserved_byte() {
        // Walk a large stretch of the id space and check the exclusion
        // invariant on every value produced.
        let mut id = reset_message_id();
        for _ in 0..70_000 {
            id = next_message_id(id).unwrap();
            assert_ne!(id.0, RESERVED_BYTE);
            assert_ne!(id.1, RESERVED_BYTE);
        }
    }

    #[test]
    fn test_reset_and_exhaustion() {
        assert_eq!(reset_message_id(), (0, 1));
        assert!(!is_message_id_exhausted((0, 0)));
        assert!(!is_message_id_exhausted((229, 255)));
        assert!(is_message_id_exhausted((230, 0)));
        assert!(is_message_id_exhausted((255, 255)));
    }

    #[test]
    fn test_set_time_frame_layout() {
        let ts = NaiveDate::from_ymd_opt(2025, 10, 4)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        let frame = create_set_time_command((0, 1), ts).unwrap();
        assert_eq!(frame.len(), 12);
        assert_eq!(frame[0], 0x5A);
        assert_eq!(frame[2], 11);
        assert_eq!((frame[3], frame[4]), (0, 1));
        assert_eq!(frame[5], 0x09);
        // 2025-10-04 is a Saturday (ISO weekday 6).
        assert_eq!(&frame[6..11], &[25, 10, 6, 8, 30]);
        assert_eq!(frame[11], calculate_checksum(&frame[..11]));
        assert!(frame[1..].iter().all(|&b| b != RESERVED_BYTE));
    }

    #[test]
    fn test_checksum_matches_xor_of_interior_bytes() {
        let frame = encode_uart_command(0x5A, 0x09, (0, 1), &[25, 10, 4, 8, 30, 0]).unwrap();
        assert_eq!(frame.len(), 12);
        assert_eq!(frame[2], 11);
        assert_eq!((frame[3], frame[4]), (0, 1));
        let expected = frame[1..frame.len() - 1].iter().fold(0u8, |a, b| a ^ b);
        assert_eq!(*frame.last().unwrap(), expected);
        assert_ne!(*frame.last().unwrap(), RESERVED_BYTE);
    }

    #[test]
    fn test_sanitization_replaces_reserved_bytes() {
        let frame = encode_uart_command(0xA5, 0x04, (0, 1), &[0x5A, 0x10, 0x5A]).unwrap();
        let payload = &frame[6..frame.len() - 1];
        assert_eq!(payload, &[0x59, 0x10, 0x59]);
        assert!(frame[1..].iter().all(|&b| b != RESERVED_BYTE));
    }

    #[test]
    fn test_checksum_collision_bumps_message_id() {
        // Find a one-byte parameter whose raw frame checksums to 0x5A, then
        // check the builder escaped the collision by advancing the id.
        let cmd_id = 0xA5;
        let mode = 0x04;
        let initial = (0, 0);
        for p0 in 0u8..=255 {
            let raw = [cmd_id, 0x01, 6, initial.0, initial.1, mode, p0];
            if calculate_checksum(&raw) != RESERVED_BYTE {
                continue;
            }
            let frame = encode_uart_command(cmd_id, mode, initial, &[p0]).unwrap();
            assert_ne!(*frame.last().unwrap(), RESERVED_BYTE);
            assert_eq!(
                (frame[3], frame[4]),
                next_message_id(initial).unwrap(),
                "collision should advance the message id once"
            );
            return;
        }
        panic!("no one-byte checksum collision found");
    }

    #[test]
    fn test_head_dose_small_volume_uses_one_byte_mode() {
        let frame = create_head_dose_command((0, 1), 0, 200, 0x04).unwrap();
        assert_eq!(frame[5], 0x1B);
        assert_eq!(frame[6..frame.len() - 1], [0, 0x04, 0x01, 0x01, 0x00, 0xC8]);
    }

    #[test]
    fn test_head_dose_large_volume_uses_two_byte_mode() {
        let frame = create_head_dose_command((0, 1), 0, 1000, 0x04).unwrap();
        assert_eq!(frame[5], 0x1C);
        assert_eq!(
            frame[6..frame.len() - 1],
            [0, 0x04, 0x01, 0x01, 0x00, 0x03, 0xE8]
        );
    }

    #[test]
    fn test_head_dose_rejects_bad_arguments() {
        assert!(create_head_dose_command((0, 1), 4, 10, 0x7F).is_err());
        assert!(create_head_dose_command((0, 1), 0, 10, 0x80).is_err());
    }

    #[test]
    fn test_prepare_command_stages() {
        assert!(create_prepare_command((0, 1), 0x04).is_ok());
        assert!(create_prepare_command((0, 1), 0x05).is_ok());
        assert!(create_prepare_command((0, 1), 0x06).is_err());
    }

    #[test]
    fn test_head_schedule_command_layout() {
        let frame = create_head_schedule_command((0, 1), 2, 14, 30).unwrap();
        assert_eq!(frame[5], 0x15);
        assert_eq!(frame[6..frame.len() - 1], [2, 0x00, 14, 30, 0x00, 0x00]);
        assert!(create_head_schedule_command((0, 1), 0, 24, 0).is_err());
        assert!(create_head_schedule_command((0, 1), 0, 0, 60).is_err());
    }

    #[test]
    fn test_light_weekday_mask_ordering() {
        assert_eq!(encode_light_weekdays(&[LightWeekday::Monday]), 64);
        assert_eq!(encode_light_weekdays(&[LightWeekday::Sunday]), 1);
        assert_eq!(
            encode_light_weekdays(&[LightWeekday::Monday, LightWeekday::Friday]),
            68
        );
        assert_eq!(encode_light_weekdays(&[LightWeekday::Everyday]), 0x7F);
        assert_eq!(
            encode_light_weekdays(&[LightWeekday::Monday, LightWeekday::Everyday]),
            0x7F
        );
    }

    #[test]
    fn test_pump_weekday_mask_ordering() {
        assert_eq!(encode_pump_weekdays(None), 0x7F);
        assert_eq!(encode_pump_weekdays(Some(&[PumpWeekday::Saturday])), 1);
        assert_eq!(encode_pump_weekdays(Some(&[PumpWeekday::Friday])), 64);
        assert_eq!(
            encode_pump_weekdays(Some(&[PumpWeekday::Monday, PumpWeekday::Friday])),
            0b0100_0100
        );
        assert_eq!(encode_pump_weekdays(Some(&[PumpWeekday::Everyday])), 0x7F);
    }

    #[test]
    fn test_add_auto_setting_frame_layout() {
        let frame = create_add_auto_setting_command((0, 1), (8, 0), (18, 30), (80, 255, 255), 15, 0x7F)
            .unwrap();
        assert_eq!(frame[0], 0xA5);
        assert_eq!(frame[5], 0x19);
        assert_eq!(
            frame[6..frame.len() - 1],
            [8, 0, 18, 30, 15, 0x7F, 80, 255, 255, 255, 255, 255, 255, 255]
        );
    }

    #[test]
    fn test_delete_auto_setting_is_add_with_sentinel_brightness() {
        let deleted =
            create_delete_auto_setting_command((0, 1), (8, 0), (18, 30), 15, 0x7F).unwrap();
        let added =
            create_add_auto_setting_command((0, 1), (8, 0), (18, 30), (255, 255, 255), 15, 0x7F)
                .unwrap();
        assert_eq!(deleted, added);
        assert_eq!(deleted[12..15], [255, 255, 255]);
    }

    #[test]
    fn test_mode_switch_frames() {
        let reset = create_reset_auto_settings_command((0, 1)).unwrap();
        assert_eq!(reset[6..reset.len() - 1], [5, 255, 255]);
        let auto = create_switch_to_auto_mode_command((0, 1)).unwrap();
        assert_eq!(auto[6..auto.len() - 1], [18, 255, 255]);
        let status = create_status_request_command((0, 1)).unwrap();
        assert_eq!((status[0], status[5]), (0x5A, 0x04));
        assert_eq!(status[6..status.len() - 1], [0x01]);
    }

    #[test]
    fn test_manual_setting_rejects_overrange_brightness() {
        assert!(create_manual_setting_command((0, 1), 0, 100).is_ok());
        assert!(create_manual_setting_command((0, 1), 0, 101).is_err());
    }
}
