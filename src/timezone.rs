//! System timezone detection and IANA identifier validation.
//!
//! The display timezone is only echoed back to clients for UI time
//! formatting, so validation is format-level: `Area/Location` (optionally
//! three segments) with sane characters, plus the `UTC`/`GMT` shorthands.

use std::path::Path;

/// Detect the system timezone as an IANA identifier.
///
/// Probes, in order: the `TZ` environment variable, `/etc/timezone`
/// (Debian-style), and the `/etc/localtime` symlink (RHEL-style). Falls back
/// to `UTC` when nothing usable is found.
pub fn system_timezone() -> String {
    if let Ok(tz) = std::env::var("TZ") {
        if is_valid_iana_timezone(&tz) {
            return tz;
        }
    }

    if let Ok(contents) = std::fs::read_to_string("/etc/timezone") {
        let tz = contents.trim();
        if is_valid_iana_timezone(tz) {
            return tz.to_string();
        }
    }

    if let Ok(target) = std::fs::read_link("/etc/localtime") {
        if let Some(tz) = timezone_from_zoneinfo_path(&target) {
            if is_valid_iana_timezone(&tz) {
                return tz;
            }
        }
    }

    "UTC".to_string()
}

/// Extract the timezone name from a path like
/// `/usr/share/zoneinfo/America/New_York`.
fn timezone_from_zoneinfo_path(path: &Path) -> Option<String> {
    let text = path.to_str()?;
    let (_, tz) = text.split_once("zoneinfo/")?;
    Some(tz.to_string())
}

/// Check that a string looks like a valid IANA timezone identifier.
pub fn is_valid_iana_timezone(timezone: &str) -> bool {
    if timezone.is_empty() {
        return false;
    }
    if timezone == "UTC" || timezone == "GMT" {
        return true;
    }

    let parts: Vec<&str> = timezone.split('/').collect();
    if !(2..=3).contains(&parts.len()) {
        return false;
    }
    parts.iter().all(|part| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '+')
    })
}
