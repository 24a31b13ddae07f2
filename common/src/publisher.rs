use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::PublishFlags,
    connectivity::{BrokerClient, ConnectivityManager, NetworkLink},
    topics::{discovery_topic, state_topic, unique_id},
    types::{Metric, Reading},
};

pub const DEVICE_MODEL: &str = "Ultrasonic Tank Level Monitor";
pub const DEVICE_MANUFACTURER: &str = "DIY";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to serialize discovery document: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait MessageSink {
    fn is_ready(&self) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool;
}

impl<N: NetworkLink, B: BrokerClient> MessageSink for ConnectivityManager<N, B> {
    fn is_ready(&self) -> bool {
        self.is_broker_up()
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool {
        ConnectivityManager::publish(self, topic, payload, retain)
    }
}

#[derive(Debug, Serialize)]
struct DeviceInfo<'a> {
    identifiers: [String; 1],
    name: &'a str,
    model: &'static str,
    manufacturer: &'static str,
    sw_version: &'static str,
}

#[derive(Debug, Serialize)]
struct DiscoveryDocument<'a> {
    name: &'static str,
    unique_id: String,
    state_topic: String,
    unit_of_measurement: &'static str,
    device_class: &'static str,
    state_class: &'static str,
    icon: &'static str,
    device: DeviceInfo<'a>,
}

pub fn discovery_payload(device: &str, metric: Metric) -> Result<Vec<u8>, DiscoveryError> {
    let (unit, device_class, icon) = match metric {
        Metric::Distance => ("cm", "distance", "mdi:arrow-expand-vertical"),
        Metric::WaterLevel => ("cm", "distance", "mdi:waves-arrow-up"),
        Metric::Volume => ("L", "volume_storage", "mdi:water"),
    };

    let document = DiscoveryDocument {
        name: metric.label(),
        unique_id: unique_id(device, metric),
        state_topic: state_topic(device, metric),
        unit_of_measurement: unit,
        device_class,
        state_class: "measurement",
        icon,
        device: DeviceInfo {
            identifiers: [device.replace('-', "_")],
            name: device,
            model: DEVICE_MODEL,
            manufacturer: DEVICE_MANUFACTURER,
            sw_version: env!("CARGO_PKG_VERSION"),
        },
    };
    Ok(serde_json::to_vec(&document)?)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: u8,
    pub failed: u8,
    pub skipped_disabled: u8,
    pub discovery_sent: bool,
    pub broker_down: bool,
}

#[derive(Debug, Clone)]
pub struct Publisher {
    device: String,
    discovery_done: bool,
    published_total: u64,
    dropped_total: u64,
}

impl Publisher {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            discovery_done: false,
            published_total: 0,
            dropped_total: 0,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn discovery_done(&self) -> bool {
        self.discovery_done
    }

    pub fn published_total(&self) -> u64 {
        self.published_total
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    pub fn on_tick(
        &mut self,
        reading: &Reading,
        flags: &PublishFlags,
        sink: &mut impl MessageSink,
    ) -> PublishReport {
        let mut report = PublishReport::default();
        if !sink.is_ready() {
            report.broker_down = true;
            return report;
        }

        if !self.discovery_done {
            self.publish_discovery(sink);
            self.discovery_done = true;
            report.discovery_sent = true;
        }

        for metric in Metric::ALL {
            if !metric.enabled(flags) {
                report.skipped_disabled += 1;
                continue;
            }

            let topic = state_topic(&self.device, metric);
            let payload = reading.payload(metric);
            if sink.publish(&topic, payload.as_bytes(), false) {
                report.published += 1;
                self.published_total = self.published_total.saturating_add(1);
            } else {
                warn!("dropped publish to {topic}");
                report.failed += 1;
                self.dropped_total = self.dropped_total.saturating_add(1);
            }
        }

        debug!(
            "published {} state message(s), {} dropped",
            report.published, report.failed
        );
        report
    }

    fn publish_discovery(&mut self, sink: &mut impl MessageSink) {
        for metric in Metric::ALL {
            let topic = discovery_topic(&self.device, metric);
            let payload = match discovery_payload(&self.device, metric) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("skipping discovery for {}: {err}", metric.key());
                    continue;
                }
            };

            if sink.publish(&topic, &payload, true) {
                info!("published discovery config to {topic}");
            } else {
                warn!("discovery publish to {topic} dropped");
            }
        }
    }
}
