use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Gauge,
    Counter,
}

/// Static description of a metric family.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
    pub kind: Kind,
}

/// Every metric the exporter can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    DeviceUp,
    DeviceInfo,
    WifiConnected,
    WifiRssi,
    CloudConnected,
    MqttConnected,
    RelayState,
    RelayOverpower,
    PowerWatts,
    VoltageVolts,
    CurrentAmperes,
    EnergyTotal,
    EnergyReturnedTotal,
    Temperature,
    Overtemperature,
    Uptime,
    RamFree,
    RamSize,
    FilesystemFree,
    FilesystemSize,
    UpdateAvailable,
    DeviceCategory,
    CostPerHour,
    DailyCost,
    HeatingPercentage,
}

const DEVICE: &[&str] = &["device"];
const DEVICE_INFO: &[&str] = &["device", "mac", "serial", "firmware"];
const WIFI: &[&str] = &["device", "ssid", "ip"];
const RELAY: &[&str] = &["device", "relay"];
const METER: &[&str] = &["device", "meter"];
const PHASE: &[&str] = &["device", "phase"];
const CATEGORY_INFO: &[&str] = &["device", "name", "category", "description"];
const COST: &[&str] = &["device", "category"];

impl Family {
    pub fn descriptor(self) -> Descriptor {
        use Kind::*;
        let (name, help, labels, kind) = match self {
            Family::DeviceUp => (
                "shelly_device_up",
                "Whether the Shelly device is responding",
                DEVICE,
                Gauge,
            ),
            Family::DeviceInfo => (
                "shelly_device_info",
                "Information about the Shelly device",
                DEVICE_INFO,
                Gauge,
            ),
            Family::WifiConnected => (
                "shelly_wifi_connected",
                "Whether the Shelly device is connected to WiFi",
                WIFI,
                Gauge,
            ),
            Family::WifiRssi => ("shelly_wifi_rssi_dbm", "WiFi signal strength in dBm", DEVICE, Gauge),
            Family::CloudConnected => (
                "shelly_cloud_connected",
                "Whether the device is connected to Shelly Cloud",
                DEVICE,
                Gauge,
            ),
            Family::MqttConnected => (
                "shelly_mqtt_connected",
                "Whether the device is connected to MQTT",
                DEVICE,
                Gauge,
            ),
            Family::RelayState => (
                "shelly_relay_state",
                "State of the relay (1 = on, 0 = off)",
                RELAY,
                Gauge,
            ),
            Family::RelayOverpower => (
                "shelly_relay_overpower",
                "Whether the relay is overpowered",
                RELAY,
                Gauge,
            ),
            Family::PowerWatts => (
                "shelly_power_watts",
                "Current power consumption in watts",
                METER,
                Gauge,
            ),
            Family::VoltageVolts => (
                "shelly_voltage_volts",
                "Phase voltage in volts",
                PHASE,
                Gauge,
            ),
            Family::CurrentAmperes => (
                "shelly_current_amperes",
                "Phase current in amperes",
                PHASE,
                Gauge,
            ),
            Family::EnergyTotal => (
                "shelly_energy_total_watthours",
                "Total energy consumption in watt-hours",
                METER,
                Counter,
            ),
            Family::EnergyReturnedTotal => (
                "shelly_energy_returned_total_watthours",
                "Total energy returned to the grid in watt-hours",
                DEVICE,
                Counter,
            ),
            Family::Temperature => (
                "shelly_temperature_celsius",
                "Device temperature in Celsius",
                DEVICE,
                Gauge,
            ),
            Family::Overtemperature => (
                "shelly_overtemperature",
                "Whether the device is overtemperature",
                DEVICE,
                Gauge,
            ),
            Family::Uptime => ("shelly_uptime_seconds", "Device uptime in seconds", DEVICE, Counter),
            Family::RamFree => ("shelly_ram_free_bytes", "Free RAM in bytes", DEVICE, Gauge),
            Family::RamSize => ("shelly_ram_size_bytes", "Total RAM size in bytes", DEVICE, Gauge),
            Family::FilesystemFree => (
                "shelly_filesystem_free_bytes",
                "Free filesystem space in bytes",
                DEVICE,
                Gauge,
            ),
            Family::FilesystemSize => (
                "shelly_filesystem_size_bytes",
                "Total filesystem size in bytes",
                DEVICE,
                Gauge,
            ),
            Family::UpdateAvailable => (
                "shelly_update_available",
                "Whether a firmware update is available",
                DEVICE,
                Gauge,
            ),
            Family::DeviceCategory => (
                "shelly_device_category",
                "Device category information",
                CATEGORY_INFO,
                Gauge,
            ),
            Family::CostPerHour => (
                "shelly_cost_per_hour_eur",
                "Current cost per hour in EUR",
                COST,
                Gauge,
            ),
            Family::DailyCost => (
                "shelly_daily_cost_eur",
                "Daily cost in EUR",
                COST,
                Gauge,
            ),
            Family::HeatingPercentage => (
                "shelly_heating_percentage",
                "Percentage of total consumption that is heating (0-100)",
                DEVICE,
                Gauge,
            ),
        };
        Descriptor {
            name,
            help,
            labels,
            kind,
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

/// One labeled measurement produced during a cycle. Label values are in the
/// order of the family's label names.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub family: Family,
    pub labels: Vec<String>,
    pub value: f64,
}

impl Sample {
    pub fn new<const N: usize>(family: Family, labels: [&str; N], value: f64) -> Self {
        debug_assert_eq!(family.descriptor().labels.len(), N, "{family:?} label count");
        Self {
            family,
            labels: labels.iter().map(|label| label.to_string()).collect(),
            value,
        }
    }

    pub fn flag<const N: usize>(family: Family, labels: [&str; N], flag: bool) -> Self {
        Self::new(family, labels, if flag { 1.0 } else { 0.0 })
    }

    /// Value of the label called `name`, if the family has one.
    pub fn label(&self, name: &str) -> Option<&str> {
        let position = self
            .family
            .descriptor()
            .labels
            .iter()
            .position(|label| *label == name)?;
        self.labels.get(position).map(String::as_str)
    }
}

enum Vector {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

impl Vector {
    fn register(family: Family, registry: &Registry) -> prometheus::Result<Self> {
        let descriptor = family.descriptor();
        let opts = Opts::new(descriptor.name, descriptor.help);
        let vector = match descriptor.kind {
            Kind::Gauge => {
                let gauge = GaugeVec::new(opts, descriptor.labels)?;
                registry.register(Box::new(gauge.clone()))?;
                Vector::Gauge(gauge)
            }
            Kind::Counter => {
                let counter = CounterVec::new(opts, descriptor.labels)?;
                registry.register(Box::new(counter.clone()))?;
                Vector::Counter(counter)
            }
        };
        Ok(vector)
    }

    fn set(&self, family: Family, labels: &[&str], value: f64) -> prometheus::Result<()> {
        match self {
            Vector::Gauge(gauge) => gauge.get_metric_with_label_values(labels)?.set(value),
            Vector::Counter(counter) => {
                if value < 0.0 {
                    debug!(metric = family.name(), ?labels, value, "Negative counter value clamped to 0");
                }
                // A repeated label set replaces the earlier value, same as gauges
                let counter = counter.get_metric_with_label_values(labels)?;
                counter.reset();
                counter.inc_by(value.max(0.0));
            }
        }
        Ok(())
    }
}

/// Renders one cycle's samples in the Prometheus text exposition format.
///
/// A fresh registry is built for every call so concurrent scrapes never see
/// each other's values.
pub fn render(samples: &[Sample]) -> prometheus::Result<String> {
    let registry = Registry::new();
    let mut vectors: HashMap<Family, Vector> = HashMap::new();

    for sample in samples {
        let vector = match vectors.entry(sample.family) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(Vector::register(sample.family, &registry)?)
            }
        };
        let labels: Vec<&str> = sample.labels.iter().map(String::as_str).collect();
        vector.set(sample.family, &labels, sample.value)?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Content type of [`render`]'s output.
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}
