//! Station identity.
//!
//! Resolved once at startup and passed explicitly to the collector and the
//! sinks. Resolution order: explicit override, device-tree serial number,
//! `Serial` line of `/proc/cpuinfo`, kernel host name, `UNKNOWN_STATION`.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

/// Identity used when nothing else is available.
pub const UNKNOWN_STATION: &str = "UNKNOWN_STATION";

const DEVICE_TREE_SERIAL: &str = "/sys/firmware/devicetree/base/serial-number";
const CPUINFO: &str = "/proc/cpuinfo";
const KERNEL_HOSTNAME: &str = "/proc/sys/kernel/hostname";

/// Resolve the station id.
pub fn station_id(override_id: Option<&str>) -> String {
    if let Some(id) = override_id.map(str::trim).filter(|id| !id.is_empty()) {
        info!(station_id = id, "Using configured station id");
        return id.to_string();
    }

    if let Some(serial) = read_trimmed(DEVICE_TREE_SERIAL) {
        info!(station_id = %serial, "Station id from device tree");
        return serial;
    }

    if let Some(serial) = fs::read_to_string(CPUINFO)
        .ok()
        .and_then(|content| cpu_serial(&content))
    {
        info!(station_id = %serial, "Station id from cpuinfo");
        return serial;
    }

    if let Some(host) = read_trimmed(KERNEL_HOSTNAME) {
        warn!(station_id = %host, "No hardware serial found, using host name");
        return host;
    }

    warn!("No station identity available, using {}", UNKNOWN_STATION);
    UNKNOWN_STATION.to_string()
}

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let value = raw.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    (!value.is_empty()).then(|| value.to_string())
}

/// Extract the hexadecimal serial from `/proc/cpuinfo` content.
///
/// An all-zero serial (reported by emulators and some boards) does not count.
pub fn cpu_serial(cpuinfo: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "Serial" {
            return None;
        }
        let value = value.trim();
        let valid = !value.is_empty()
            && value.chars().all(|c| c.is_ascii_hexdigit())
            && value.chars().any(|c| c != '0');
        valid.then(|| value.to_lowercase())
    })
}
