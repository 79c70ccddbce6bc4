use serde_derive::{Deserialize, Serialize};
use std::fmt;

use crate::error::DecodeError;

/// Wifi status string RPC devices report once they have an address.
/// Legacy devices are mapped onto the same sentinel.
pub const WIFI_CONNECTED_STATUS: &str = "got ip";
const WIFI_DISCONNECTED_STATUS: &str = "disconnected";

/// Which endpoint a body came from. The body is never sniffed to guess this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// `GET /rpc/Shelly.GetStatus` on Gen2+ devices
    Rpc,
    /// `GET /status` on Gen1 devices
    Legacy,
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Rpc => f.write_str("rpc"),
            Schema::Legacy => f.write_str("legacy"),
        }
    }
}

/// Canonical reading of one device.
///
/// Field names follow the RPC wire shape so RPC bodies decode directly. Every
/// field defaults to zero/empty when the device does not report it.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSnapshot {
    pub sys: SystemStatus,
    pub wifi: WifiStatus,
    pub cloud: ConnectionStatus,
    pub mqtt: ConnectionStatus,
    #[serde(rename = "temperature:0")]
    pub temperature: TemperatureReading,
    #[serde(rename = "em:0")]
    pub em: EnergyMeter,
    #[serde(rename = "emdata:0")]
    pub emdata: EnergyTotals,
    #[serde(deserialize_with = "null_as_default")]
    pub serial: String,
    pub overtemperature: bool,
    pub relays: Vec<RelayState>,
    pub meters: Vec<MeterReading>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemStatus {
    #[serde(deserialize_with = "null_as_default")]
    pub mac: String,
    pub uptime: u64,
    pub ram_size: u64,
    pub ram_free: u64,
    pub fs_size: u64,
    pub fs_free: u64,
    pub available_updates: AvailableUpdates,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailableUpdates {
    pub stable: FirmwareVersion,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareVersion {
    #[serde(deserialize_with = "null_as_default")]
    pub version: String,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiStatus {
    #[serde(deserialize_with = "null_as_default")]
    pub sta_ip: String,
    #[serde(deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(deserialize_with = "null_as_default")]
    pub ssid: String,
    #[serde(deserialize_with = "null_as_default")]
    pub rssi: i64,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionStatus {
    pub connected: bool,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureReading {
    #[serde(rename = "tC", deserialize_with = "null_as_default")]
    pub celsius: f64,
    #[serde(rename = "tF", deserialize_with = "null_as_default")]
    pub fahrenheit: f64,
}

/// Instantaneous three phase readings (`em:0`).
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyMeter {
    pub a_act_power: f64,
    pub b_act_power: f64,
    pub c_act_power: f64,
    pub total_act_power: f64,
    pub a_voltage: f64,
    pub b_voltage: f64,
    pub c_voltage: f64,
    pub a_current: f64,
    pub b_current: f64,
    pub c_current: f64,
    pub total_current: f64,
}

/// Cumulative counters in watt-hours (`emdata:0`).
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyTotals {
    pub a_total_act_energy: f64,
    pub b_total_act_energy: f64,
    pub c_total_act_energy: f64,
    pub total_act: f64,
    pub total_act_ret: f64,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayState {
    pub ison: bool,
    pub overpower: bool,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterReading {
    pub power: f64,
    pub total: f64,
}

/// Devices send `null` for values they do not have, e.g. the wifi block of a
/// device on Ethernet.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + serde::Deserialize<'de>,
{
    <Option<T> as serde::Deserialize>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl StatusSnapshot {
    pub fn wifi_connected(&self) -> bool {
        self.wifi.status == WIFI_CONNECTED_STATUS
    }

    pub fn update_available(&self) -> bool {
        !self.sys.available_updates.stable.version.is_empty()
    }

    /// Power used for cost and category totals: the larger of the total
    /// active power and the first single meter. A missing meter reads as 0
    /// and power fed back to the grid counts as 0.
    pub fn effective_power(&self) -> f64 {
        let meter = self.meters.first().map_or(0.0, |meter| meter.power);
        self.em.total_act_power.max(meter).max(0.0)
    }
}

/// `GET /status` body of Gen1 devices.
#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
struct LegacyStatus {
    wifi_sta: LegacyWifi,
    cloud: ConnectionStatus,
    mqtt: ConnectionStatus,
    mac: String,
    uptime: u64,
    ram_size: u64,
    ram_free: u64,
    fs_size: u64,
    fs_free: u64,
    temperature: f64,
    overtemperature: bool,
    update: LegacyUpdate,
    relays: Vec<LegacyRelay>,
    meters: Vec<LegacyMeter>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
struct LegacyWifi {
    connected: bool,
    ssid: String,
    ip: String,
    rssi: i64,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
struct LegacyUpdate {
    has_update: bool,
    new_version: String,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
struct LegacyRelay {
    ison: bool,
    overpower: bool,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
struct LegacyMeter {
    power: f64,
    total: f64,
}

impl From<LegacyStatus> for StatusSnapshot {
    fn from(legacy: LegacyStatus) -> Self {
        let mut snapshot = StatusSnapshot {
            sys: SystemStatus {
                mac: legacy.mac,
                uptime: legacy.uptime,
                ram_size: legacy.ram_size,
                ram_free: legacy.ram_free,
                fs_size: legacy.fs_size,
                fs_free: legacy.fs_free,
                available_updates: AvailableUpdates::default(),
            },
            wifi: WifiStatus {
                sta_ip: legacy.wifi_sta.ip,
                status: if legacy.wifi_sta.connected {
                    WIFI_CONNECTED_STATUS.to_string()
                } else {
                    WIFI_DISCONNECTED_STATUS.to_string()
                },
                ssid: legacy.wifi_sta.ssid,
                rssi: legacy.wifi_sta.rssi,
            },
            cloud: legacy.cloud,
            mqtt: legacy.mqtt,
            temperature: TemperatureReading {
                celsius: legacy.temperature,
                ..Default::default()
            },
            overtemperature: legacy.overtemperature,
            ..Default::default()
        };

        if legacy.update.has_update {
            snapshot.sys.available_updates.stable.version = legacy.update.new_version;
        }

        // Single relay, single meter. The meter counts once: phase A and total.
        if let Some(relay) = legacy.relays.into_iter().next() {
            snapshot.relays.push(RelayState {
                ison: relay.ison,
                overpower: relay.overpower,
            });
        }
        if let Some(meter) = legacy.meters.into_iter().next() {
            snapshot.em.a_act_power = meter.power;
            snapshot.em.total_act_power = meter.power;
            snapshot.emdata.total_act = meter.total;
            snapshot.meters.push(MeterReading {
                power: meter.power,
                total: meter.total,
            });
        }

        snapshot
    }
}

/// Converts a raw device body into the canonical snapshot.
pub fn normalize(schema: Schema, body: &[u8]) -> Result<StatusSnapshot, DecodeError> {
    let decoded = match schema {
        Schema::Rpc => serde_json::from_slice::<StatusSnapshot>(body),
        Schema::Legacy => serde_json::from_slice::<LegacyStatus>(body).map(StatusSnapshot::from),
    };
    decoded.map_err(|source| DecodeError { schema, source })
}
