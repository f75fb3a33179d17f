//! Configuration loading (spec §6 "Config surface").
//!
//! The original system reads an INI file via Python's
//! `configparser.ExtendedInterpolation()`; the closest ecosystem
//! equivalent here is the `ini` crate, with its section/key access
//! wrapped into the same kind of serde-derived structs the rest of this
//! crate uses for typed data. The health-specific `max_current` /
//! `ramp_down_trip_time` document is loaded separately as JSON, matching
//! its own file in the original layout.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use ini::Ini;
use serde::{Deserialize, Serialize};

use crate::supervisor::health::{CurrentLimit, HealthConfig};

/// One script's INI-sourced cadence/enable settings (spec §6).
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSection {
    /// Whether the manager should start this script.
    pub enable: bool,
    /// Tick cadence, in seconds.
    pub repeat_every: f64,
    /// Relax/reducer: fraction applied to `target_voltage` during a dip.
    pub voltage_modifier: Option<f64>,
    /// Relax/reducer: the operator's nominal target voltage.
    pub target_voltage: Option<f64>,
    /// Reducer: length of the active dip phase, seconds.
    pub reducing_period: Option<f64>,
    /// Health: `M <= low_voltage_mlt` counts as the low-voltage condition.
    pub low_voltage_mlt: Option<f64>,
}

fn read_f64(ini: &Ini, section: &str, key: &str) -> Option<f64> {
    ini.get_from(Some(section), key).and_then(|v| v.parse().ok())
}

fn read_bool(ini: &Ini, section: &str, key: &str, default: bool) -> bool {
    ini.get_from(Some(section), key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn read_section(ini: &Ini, section: &str) -> ScriptSection {
    ScriptSection {
        enable: read_bool(ini, section, "enable", false),
        repeat_every: read_f64(ini, section, "repeat_every").unwrap_or(1.0),
        voltage_modifier: read_f64(ini, section, "voltage_modifier"),
        target_voltage: read_f64(ini, section, "target_voltage"),
        reducing_period: read_f64(ini, section, "reducing_period"),
        low_voltage_mlt: read_f64(ini, section, "low_voltage_mlt"),
    }
}

/// `[ws]` — the façade's bind address.
#[derive(Debug, Clone, PartialEq)]
pub struct WsConfig {
    /// Address the façade HTTP server binds.
    pub bind_addr: String,
}

/// `[device]` — the device backend's address.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Address `device_backend` binds or registers at.
    pub addr: String,
}

/// `[monitor]` — the monitor worker's address and snapshot files.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorIniConfig {
    /// Address `monitor` binds or registers at.
    pub addr: String,
    /// Path to the telemetry snapshot file.
    pub param_file: String,
    /// Path to the status snapshot file.
    pub status_file: String,
    /// SQLite database path.
    pub db_path: String,
    /// Run a rotation sweep every this many inserts.
    pub rotate_every: u64,
}

/// `[check]` — broker addresses the supervisor dials as a client.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckConfig {
    /// `device_backend` endpoint the supervisor's `AsyncClient` dials.
    pub device_backend_addr: String,
    /// `monitor` endpoint the supervisor's `AsyncClient` dials.
    pub monitor_addr: String,
    /// Interlock source connection string (`postgresql://`, `tcp://`, `fake://`).
    pub interlock_url: String,
    /// Manager tick cadence, in seconds.
    pub manager_tick_every: f64,
    /// Address the `system_check` API worker binds (spec §6 wire identities).
    pub system_check_addr: String,
}

/// `[check.mchs]` — the MChS UDP sink address and this client's identity.
#[derive(Debug, Clone, PartialEq)]
pub struct MchsConfig {
    /// Destination host/IP.
    pub udp_ip: String,
    /// Destination port.
    pub udp_port: u16,
    /// Identifier embedded in the ACK/NACK payload.
    pub client_id: String,
}

/// The fully parsed INI configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// `[ws]`.
    pub ws: WsConfig,
    /// `[device]`.
    pub device: DeviceConfig,
    /// `[monitor]`.
    pub monitor: MonitorIniConfig,
    /// `[check]`.
    pub check: CheckConfig,
    /// `[check.health]`.
    pub health: ScriptSection,
    /// `[check.autopilot.relax]`.
    pub relax: ScriptSection,
    /// `[check.autopilot.reducer]`.
    pub reducer: ScriptSection,
    /// `[check.autopilot.ramp_guard]`.
    pub ramp_guard: ScriptSection,
    /// `[check.interlock]`.
    pub interlock: ScriptSection,
    /// `[check.loader]`.
    pub loader: ScriptSection,
    /// `[check.mchs]`.
    pub mchs: MchsConfig,
}

impl Config {
    /// Loads and parses an INI file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path).with_context(|| format!("loading config {}", path.display()))?;

        let ws = WsConfig {
            bind_addr: ini.get_from(Some("ws"), "bind_addr").unwrap_or("127.0.0.1:8080").to_string(),
        };
        let device = DeviceConfig {
            addr: ini.get_from(Some("device"), "addr").context("[device] addr is required")?.to_string(),
        };
        let monitor = MonitorIniConfig {
            addr: ini.get_from(Some("monitor"), "addr").context("[monitor] addr is required")?.to_string(),
            param_file: ini.get_from(Some("monitor"), "param_file").unwrap_or("param_file.json").to_string(),
            status_file: ini.get_from(Some("monitor"), "status_file").unwrap_or("status_file.json").to_string(),
            db_path: ini.get_from(Some("monitor"), "db_path").unwrap_or("monitor.sqlite3").to_string(),
            rotate_every: ini
                .get_from(Some("monitor"), "rotate_every")
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
        };
        let check = CheckConfig {
            device_backend_addr: ini
                .get_from(Some("check"), "device_backend_addr")
                .context("[check] device_backend_addr is required")?
                .to_string(),
            monitor_addr: ini.get_from(Some("check"), "monitor_addr").context("[check] monitor_addr is required")?.to_string(),
            interlock_url: ini.get_from(Some("check"), "interlock_url").context("[check] interlock_url is required")?.to_string(),
            manager_tick_every: read_f64(&ini, "check", "manager_tick_every").unwrap_or(1.0),
            system_check_addr: ini
                .get_from(Some("check"), "system_check_addr")
                .unwrap_or("127.0.0.1:5557")
                .to_string(),
        };
        let mchs = MchsConfig {
            udp_ip: ini.get_from(Some("check.mchs"), "udp_ip").unwrap_or("127.0.0.1").to_string(),
            udp_port: ini.get_from(Some("check.mchs"), "udp_port").and_then(|v| v.parse().ok()).unwrap_or(9999),
            client_id: ini.get_from(Some("check.mchs"), "client_id").unwrap_or("hv").to_string(),
        };

        Ok(Self {
            ws,
            device,
            monitor,
            check,
            health: read_section(&ini, "check.health"),
            relax: read_section(&ini, "check.autopilot.relax"),
            reducer: read_section(&ini, "check.autopilot.reducer"),
            ramp_guard: read_section(&ini, "check.autopilot.ramp_guard"),
            interlock: read_section(&ini, "check.interlock"),
            loader: read_section(&ini, "check.loader"),
            mchs,
        })
    }
}

/// On-disk shape of the health config JSON document (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HealthConfigDocument {
    max_current: HashMap<String, CurrentLimitDocument>,
    ramp_down_trip_time: HashMap<String, f64>,
    #[serde(default)]
    low_voltage_mlt: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CurrentLimitDocument {
    steady: f64,
    volt_change: f64,
}

/// Loads the `max_current` / `ramp_down_trip_time` JSON document into a
/// [`HealthConfig`].
pub fn load_health_config(path: &Path) -> Result<HealthConfig> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading health config {}", path.display()))?;
    let doc: HealthConfigDocument = serde_json::from_str(&contents).with_context(|| format!("parsing health config {}", path.display()))?;

    let max_currents = doc
        .max_current
        .into_iter()
        .map(|(alias, limit)| (alias, CurrentLimit { steady: limit.steady, volt_change: limit.volt_change }))
        .collect();

    Ok(HealthConfig {
        max_currents,
        ramp_down_trip_time: doc.ramp_down_trip_time,
        low_voltage_mlt: doc.low_voltage_mlt.unwrap_or(0.1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_minimal_ini_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(
            &path,
            "[device]\naddr = 127.0.0.1:5001\n\n\
             [monitor]\naddr = 127.0.0.1:5002\n\n\
             [check]\ndevice_backend_addr = 127.0.0.1:5001\nmonitor_addr = 127.0.0.1:5002\ninterlock_url = fake:///tmp/interlock\n\n\
             [check.health]\nenable = true\nrepeat_every = 1.0\nlow_voltage_mlt = 0.1\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.device.addr, "127.0.0.1:5001");
        assert!(config.health.enable);
        assert_eq!(config.health.low_voltage_mlt, Some(0.1));
    }

    #[test]
    fn loads_health_config_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.json");
        std::fs::write(
            &path,
            r#"{"max_current": {"ch0": {"steady": 5.0, "volt_change": 8.0}}, "ramp_down_trip_time": {"ch0": 5.0}}"#,
        )
        .unwrap();

        let config = load_health_config(&path).unwrap();
        assert_eq!(config.max_currents["ch0"].steady, 5.0);
        assert_eq!(config.ramp_down_trip_time["ch0"], 5.0);
    }
}
