use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{Config, CostConfig, DeviceEndpoint};
use crate::error::AcquisitionError;
use crate::exposition::{Family, Sample};
use crate::rate::current_rate;
use crate::shelly_client::ShellyClient;
use crate::status::StatusSnapshot;

pub const HEATING_CATEGORY: &str = "heating";
pub const UNKNOWN_CATEGORY: &str = "unknown";

/// Outcome of one device in one cycle.
#[derive(Debug)]
pub struct DeviceResult {
    pub endpoint: DeviceEndpoint,
    pub status: Result<StatusSnapshot, AcquisitionError>,
}

/// Power summed over the devices that answered in a cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleTotals {
    pub by_category: HashMap<String, f64>,
    pub grand_total: f64,
}

impl CycleTotals {
    pub fn add(&mut self, category: &str, power: f64) {
        *self.by_category.entry(category.to_string()).or_default() += power;
        self.grand_total += power;
    }

    pub fn category(&self, category: &str) -> f64 {
        self.by_category.get(category).copied().unwrap_or_default()
    }

    /// Heating power as a percentage of the grand total, 0 when nothing draws
    /// power.
    pub fn heating_share(&self) -> f64 {
        if self.grand_total > 0.0 {
            (100.0 * self.category(HEATING_CATEGORY) / self.grand_total).clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

/// Everything one collection cycle produced. Dropped once rendered.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub samples: Vec<Sample>,
    pub devices: Vec<DeviceResult>,
    pub totals: CycleTotals,
}

impl CycleReport {
    pub fn up_count(&self) -> usize {
        self.devices.iter().filter(|d| d.status.is_ok()).count()
    }
}

struct Device {
    endpoint: DeviceEndpoint,
    client: ShellyClient,
}

/// Polls every configured device once per cycle and derives the cross-device
/// metrics. Holds no state between cycles, so concurrent scrapes can share it.
pub struct Collector {
    devices: Vec<Device>,
    cost: CostConfig,
    timeout: Duration,
    concurrency: usize,
}

impl Collector {
    pub fn new(
        endpoints: Vec<DeviceEndpoint>,
        http: reqwest::Client,
        cost: CostConfig,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        let devices = endpoints
            .into_iter()
            .map(|endpoint| Device {
                client: ShellyClient::new(endpoint.url.clone(), http.clone()),
                endpoint,
            })
            .collect();
        Self {
            devices,
            cost,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        Self::new(
            config.endpoints(),
            http,
            config.cost_calculation.clone(),
            config.scrape_timeout,
            config.scrape_concurrency,
        )
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &DeviceEndpoint> {
        self.devices.iter().map(|device| &device.endpoint)
    }

    /// Runs one cycle. `minute` is the local time of day used to pick the
    /// electricity rate.
    ///
    /// Devices are queried with bounded fan-out but their samples are emitted
    /// in configured order. A failing device only yields `shelly_device_up 0`.
    pub async fn collect(&self, minute: u16) -> CycleReport {
        let started = Instant::now();
        let rate = current_rate(&self.cost, minute);
        let mut report = CycleReport::default();

        let fetches: Vec<_> = self
            .devices
            .iter()
            .map(|device| {
                let status = device.client.get_status(self.timeout);
                async move { (device, status.await) }
            })
            .collect();
        let mut results = stream::iter(fetches).buffered(self.concurrency);

        while let Some((device, status)) = results.next().await {
            let endpoint = &device.endpoint;
            match &status {
                Ok(snapshot) => {
                    push_device_samples(&mut report.samples, endpoint, snapshot);
                    if self.cost.enabled {
                        push_cost_samples(&mut report.samples, endpoint, snapshot, rate);
                    }
                    report.totals.add(
                        endpoint.category().unwrap_or(UNKNOWN_CATEGORY),
                        snapshot.effective_power(),
                    );
                }
                Err(e) => {
                    warn!(device = %endpoint.url, error = %e, "Failed to get device status");
                    report
                        .samples
                        .push(Sample::flag(Family::DeviceUp, [&endpoint.url], false));
                }
            }
            report.devices.push(DeviceResult {
                endpoint: endpoint.clone(),
                status,
            });
        }

        if self.cost.enabled {
            let share = report.totals.heating_share();
            for endpoint in self.endpoints().filter(|e| e.metadata.is_some()) {
                report
                    .samples
                    .push(Sample::new(Family::HeatingPercentage, [&endpoint.url], share));
            }
        }

        debug!(
            devices = report.devices.len(),
            up = report.up_count(),
            total_power = report.totals.grand_total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collection cycle finished"
        );
        report
    }
}

fn push_device_samples(out: &mut Vec<Sample>, endpoint: &DeviceEndpoint, status: &StatusSnapshot) {
    let device = endpoint.url.as_str();
    let sys = &status.sys;
    let em = &status.em;
    let emdata = &status.emdata;

    out.push(Sample::flag(Family::DeviceUp, [device], true));
    out.push(Sample::new(
        Family::DeviceInfo,
        [
            device,
            &sys.mac,
            &status.serial,
            &sys.available_updates.stable.version,
        ],
        1.0,
    ));

    out.push(Sample::flag(
        Family::WifiConnected,
        [device, &status.wifi.ssid, &status.wifi.sta_ip],
        status.wifi_connected(),
    ));
    out.push(Sample::new(Family::WifiRssi, [device], status.wifi.rssi as f64));
    out.push(Sample::flag(Family::CloudConnected, [device], status.cloud.connected));
    out.push(Sample::flag(Family::MqttConnected, [device], status.mqtt.connected));

    for (i, relay) in status.relays.iter().enumerate() {
        let relay_name = format!("relay_{i}");
        out.push(Sample::flag(Family::RelayState, [device, &relay_name], relay.ison));
        out.push(Sample::flag(
            Family::RelayOverpower,
            [device, &relay_name],
            relay.overpower,
        ));
    }

    for (meter, power) in [
        ("phase_a", em.a_act_power),
        ("phase_b", em.b_act_power),
        ("phase_c", em.c_act_power),
        ("total", em.total_act_power),
    ] {
        out.push(Sample::new(Family::PowerWatts, [device, meter], power));
    }
    for (phase, voltage, current) in [
        ("a", em.a_voltage, em.a_current),
        ("b", em.b_voltage, em.b_current),
        ("c", em.c_voltage, em.c_current),
    ] {
        out.push(Sample::new(Family::VoltageVolts, [device, phase], voltage));
        out.push(Sample::new(Family::CurrentAmperes, [device, phase], current));
    }
    for (meter, energy) in [
        ("phase_a", emdata.a_total_act_energy),
        ("phase_b", emdata.b_total_act_energy),
        ("phase_c", emdata.c_total_act_energy),
        ("total", emdata.total_act),
    ] {
        out.push(Sample::new(Family::EnergyTotal, [device, meter], energy));
    }
    out.push(Sample::new(
        Family::EnergyReturnedTotal,
        [device],
        emdata.total_act_ret,
    ));

    out.push(Sample::new(
        Family::Temperature,
        [device],
        status.temperature.celsius,
    ));
    out.push(Sample::flag(
        Family::Overtemperature,
        [device],
        status.overtemperature,
    ));

    out.push(Sample::new(Family::Uptime, [device], sys.uptime as f64));
    out.push(Sample::new(Family::RamFree, [device], sys.ram_free as f64));
    out.push(Sample::new(Family::RamSize, [device], sys.ram_size as f64));
    out.push(Sample::new(Family::FilesystemFree, [device], sys.fs_free as f64));
    out.push(Sample::new(Family::FilesystemSize, [device], sys.fs_size as f64));
    out.push(Sample::flag(
        Family::UpdateAvailable,
        [device],
        status.update_available(),
    ));

    if let Some(meta) = &endpoint.metadata {
        out.push(Sample::new(
            Family::DeviceCategory,
            [device, &meta.name, &meta.category, &meta.description],
            1.0,
        ));
    }
}

fn push_cost_samples(
    out: &mut Vec<Sample>,
    endpoint: &DeviceEndpoint,
    status: &StatusSnapshot,
    rate: f64,
) {
    let device = endpoint.url.as_str();
    let category = endpoint.category().unwrap_or(UNKNOWN_CATEGORY);

    // Watts times price per kWh
    let cost_per_hour = status.effective_power() * rate / 1000.0;
    out.push(Sample::new(Family::CostPerHour, [device, category], cost_per_hour));
    out.push(Sample::new(
        Family::DailyCost,
        [device, category],
        cost_per_hour * 24.0,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceMetadata, RateRule};

    fn rpc_body(total_power: f64) -> String {
        format!(
            r#"{{
                "sys": {{ "mac": "AABBCC", "uptime": 100, "ram_free": 1000, "ram_size": 2000 }},
                "wifi": {{ "sta_ip": "10.0.0.2", "status": "got ip", "ssid": "home", "rssi": -50 }},
                "cloud": {{ "connected": true }},
                "temperature:0": {{ "tC": 30.5 }},
                "em:0": {{ "a_act_power": {total_power}, "total_act_power": {total_power} }},
                "emdata:0": {{ "total_act": 5000.0 }}
            }}"#
        )
    }

    async fn rpc_device(server: &mut mockito::Server, total_power: f64) {
        server
            .mock("GET", "/rpc/Shelly.GetStatus")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(rpc_body(total_power))
            .create_async()
            .await;
    }

    fn tagged(url: String, category: &str) -> DeviceEndpoint {
        DeviceEndpoint {
            url,
            metadata: Some(DeviceMetadata {
                name: format!("{category}_device"),
                category: category.to_string(),
                description: String::new(),
            }),
        }
    }

    fn cost_enabled() -> CostConfig {
        CostConfig {
            enabled: true,
            default_rate: 0.15,
            rates: vec![RateRule {
                time: "06:00-22:00".to_string(),
                rate: 0.20,
            }],
        }
    }

    fn collector(endpoints: Vec<DeviceEndpoint>, cost: CostConfig) -> Collector {
        Collector::new(
            endpoints,
            reqwest::Client::new(),
            cost,
            Duration::from_secs(2),
            4,
        )
    }

    fn find<'a>(samples: &'a [Sample], family: Family, device: &str) -> Vec<&'a Sample> {
        samples
            .iter()
            .filter(|s| s.family == family && s.label("device") == Some(device))
            .collect()
    }

    fn value(samples: &[Sample], family: Family, device: &str) -> f64 {
        let found = find(samples, family, device);
        assert_eq!(found.len(), 1, "{family:?} for {device}: {found:?}");
        found[0].value
    }

    #[test]
    fn test_heating_share_zero_when_no_power() {
        let mut totals = CycleTotals::default();
        totals.add(HEATING_CATEGORY, 0.0);
        totals.add("general", 0.0);
        assert_eq!(totals.heating_share(), 0.0);
        assert_eq!(CycleTotals::default().heating_share(), 0.0);
    }

    #[test]
    fn test_heating_share_ratio() {
        let mut totals = CycleTotals::default();
        totals.add(HEATING_CATEGORY, 300.0);
        totals.add("general", 100.0);
        totals.add(HEATING_CATEGORY, 100.0);
        assert_eq!(totals.category(HEATING_CATEGORY), 400.0);
        assert_eq!(totals.grand_total, 500.0);
        assert_eq!(totals.heating_share(), 80.0);
    }

    #[tokio::test]
    async fn test_single_device_full_record_set() {
        let mut server = mockito::Server::new_async().await;
        rpc_device(&mut server, 150.5).await;
        let url = server.url();

        let report = collector(vec![DeviceEndpoint::bare(url.clone())], CostConfig::default())
            .collect(12 * 60)
            .await;

        let samples = &report.samples;
        assert_eq!(value(samples, Family::DeviceUp, &url), 1.0);
        assert_eq!(value(samples, Family::WifiConnected, &url), 1.0);
        assert_eq!(value(samples, Family::WifiRssi, &url), -50.0);
        assert_eq!(value(samples, Family::CloudConnected, &url), 1.0);
        assert_eq!(value(samples, Family::MqttConnected, &url), 0.0);
        assert_eq!(value(samples, Family::Temperature, &url), 30.5);
        assert_eq!(value(samples, Family::Uptime, &url), 100.0);
        assert_eq!(value(samples, Family::RamFree, &url), 1000.0);
        assert_eq!(value(samples, Family::UpdateAvailable, &url), 0.0);
        assert_eq!(find(samples, Family::PowerWatts, &url).len(), 4);
        assert!(find(samples, Family::RelayState, &url).is_empty());
        assert!(find(samples, Family::DeviceCategory, &url).is_empty());
        assert!(find(samples, Family::CostPerHour, &url).is_empty());
        assert!(find(samples, Family::HeatingPercentage, &url).is_empty());

        let total = find(samples, Family::PowerWatts, &url)
            .into_iter()
            .find(|s| s.label("meter") == Some("total"))
            .unwrap();
        assert_eq!(total.value, 150.5);
        assert_eq!(report.up_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_device_only_reports_down() {
        let mut good = mockito::Server::new_async().await;
        rpc_device(&mut good, 100.0).await;
        let mut bad = mockito::Server::new_async().await;
        bad.mock("GET", mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let endpoints = vec![
            DeviceEndpoint::bare(bad.url()),
            DeviceEndpoint::bare(good.url()),
        ];
        let report = collector(endpoints, CostConfig::default()).collect(0).await;

        let bad_samples: Vec<&Sample> = report
            .samples
            .iter()
            .filter(|s| s.label("device") == Some(bad.url().as_str()))
            .collect();
        assert_eq!(bad_samples.len(), 1);
        assert_eq!(bad_samples[0].family, Family::DeviceUp);
        assert_eq!(bad_samples[0].value, 0.0);

        assert_eq!(value(&report.samples, Family::DeviceUp, &good.url()), 1.0);
        assert!(report.devices[0].status.is_err());
        assert!(report.devices[1].status.is_ok());
        assert_eq!(report.totals.grand_total, 100.0);
    }

    #[tokio::test]
    async fn test_samples_follow_configured_order() {
        let mut first = mockito::Server::new_async().await;
        rpc_device(&mut first, 1.0).await;
        let mut second = mockito::Server::new_async().await;
        rpc_device(&mut second, 2.0).await;

        let endpoints = vec![
            DeviceEndpoint::bare(second.url()),
            DeviceEndpoint::bare(first.url()),
        ];
        let report = collector(endpoints, CostConfig::default()).collect(0).await;

        let order: Vec<&str> = report
            .samples
            .iter()
            .filter(|s| s.family == Family::DeviceUp)
            .filter_map(|s| s.label("device"))
            .collect();
        assert_eq!(order, vec![second.url().as_str(), first.url().as_str()]);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_collect_future_is_send() {
        let collector = collector(vec![], CostConfig::default());
        let cycle = collector.collect(0);
        assert_send(&cycle);
    }

    #[test]
    fn test_heating_share_stays_within_bounds() {
        let mut totals = CycleTotals::default();
        totals.add(HEATING_CATEGORY, 500.0);
        totals.add("general", -400.0);
        assert_eq!(totals.heating_share(), 100.0);

        let mut totals = CycleTotals::default();
        totals.add(HEATING_CATEGORY, 100.0);
        totals.add("general", -300.0);
        assert_eq!(totals.heating_share(), 0.0);
    }

    #[tokio::test]
    async fn test_exporting_device_counts_as_zero_power() {
        let mut heat_pump = mockito::Server::new_async().await;
        rpc_device(&mut heat_pump, 500.0).await;
        let mut solar = mockito::Server::new_async().await;
        rpc_device(&mut solar, -400.0).await;

        let endpoints = vec![
            tagged(heat_pump.url(), HEATING_CATEGORY),
            tagged(solar.url(), "general"),
        ];
        let report = collector(endpoints, cost_enabled()).collect(12 * 60).await;
        let samples = &report.samples;

        assert_eq!(report.totals.grand_total, 500.0);
        for url in [heat_pump.url(), solar.url()] {
            let share = value(samples, Family::HeatingPercentage, &url);
            assert!((0.0..=100.0).contains(&share), "{share}");
        }
        assert_eq!(value(samples, Family::CostPerHour, &solar.url()), 0.0);
        assert_eq!(value(samples, Family::DailyCost, &solar.url()), 0.0);
    }

    #[tokio::test]
    async fn test_slow_device_is_reported_down() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let collector = Collector::new(
            vec![DeviceEndpoint::bare(url.clone())],
            reqwest::Client::new(),
            CostConfig::default(),
            Duration::from_millis(200),
            1,
        );
        let report = collector.collect(0).await;

        assert!(matches!(
            report.devices[0].status,
            Err(AcquisitionError::Timeout { .. })
        ));
        assert_eq!(value(&report.samples, Family::DeviceUp, &url), 0.0);
        assert_eq!(report.samples.len(), 1);
    }

    #[tokio::test]
    async fn test_cost_and_heating_share() {
        let mut heat_pump = mockito::Server::new_async().await;
        rpc_device(&mut heat_pump, 3000.0).await;
        let mut general = mockito::Server::new_async().await;
        rpc_device(&mut general, 1000.0).await;
        let mut untagged = mockito::Server::new_async().await;
        rpc_device(&mut untagged, 0.0).await;

        let endpoints = vec![
            DeviceEndpoint::bare(untagged.url()),
            tagged(heat_pump.url(), HEATING_CATEGORY),
            tagged(general.url(), "general"),
        ];
        // 12:00 falls in the 0.20 day rate
        let report = collector(endpoints, cost_enabled()).collect(12 * 60).await;
        let samples = &report.samples;

        let heat_cost = find(samples, Family::CostPerHour, &heat_pump.url());
        assert_eq!(heat_cost.len(), 1);
        assert_eq!(heat_cost[0].label("category"), Some(HEATING_CATEGORY));
        assert!((heat_cost[0].value - 0.6).abs() < 1e-9);
        assert!((value(samples, Family::DailyCost, &heat_pump.url()) - 14.4).abs() < 1e-9);

        let untagged_cost = find(samples, Family::CostPerHour, &untagged.url());
        assert_eq!(untagged_cost[0].label("category"), Some(UNKNOWN_CATEGORY));
        assert_eq!(untagged_cost[0].value, 0.0);

        assert_eq!(value(samples, Family::HeatingPercentage, &heat_pump.url()), 75.0);
        assert_eq!(value(samples, Family::HeatingPercentage, &general.url()), 75.0);
        assert!(find(samples, Family::HeatingPercentage, &untagged.url()).is_empty());
        assert_eq!(value(samples, Family::DeviceCategory, &heat_pump.url()), 1.0);
    }

    #[tokio::test]
    async fn test_heating_share_zero_when_all_devices_idle() {
        let mut heat_pump = mockito::Server::new_async().await;
        rpc_device(&mut heat_pump, 0.0).await;

        let endpoints = vec![tagged(heat_pump.url(), HEATING_CATEGORY)];
        let report = collector(endpoints, cost_enabled()).collect(0).await;

        let share = value(&report.samples, Family::HeatingPercentage, &heat_pump.url());
        assert_eq!(share, 0.0);
        assert!(!share.is_nan());
    }

    #[tokio::test]
    async fn test_down_devices_are_left_out_of_totals() {
        let mut heat_pump = mockito::Server::new_async().await;
        rpc_device(&mut heat_pump, 500.0).await;
        let mut general = mockito::Server::new_async().await;
        general
            .mock("GET", mockito::Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let endpoints = vec![
            tagged(heat_pump.url(), HEATING_CATEGORY),
            tagged(general.url(), "general"),
        ];
        let report = collector(endpoints, cost_enabled()).collect(0).await;

        assert_eq!(report.totals.grand_total, 500.0);
        assert_eq!(value(&report.samples, Family::HeatingPercentage, &general.url()), 100.0);
        assert!(find(&report.samples, Family::CostPerHour, &general.url()).is_empty());
    }
}
