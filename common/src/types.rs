use serde::{Deserialize, Serialize};

use crate::config::{PublishFlags, TankGeometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawSample {
    Distance(u16),
    NoEcho,
}

impl RawSample {
    pub fn centimeters(self) -> Option<u16> {
        match self {
            Self::Distance(cm) => Some(cm),
            Self::NoEcho => None,
        }
    }

    pub fn is_no_echo(self) -> bool {
        matches!(self, Self::NoEcho)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStatus {
    ConnectionTimeout,
    ConnectionLost,
    ConnectFailed,
    Disconnected,
    Connected,
    BadProtocol,
    BadClientId,
    Unavailable,
    BadCredentials,
    Unauthorized,
}

impl BrokerStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::ConnectionTimeout => -4,
            Self::ConnectionLost => -3,
            Self::ConnectFailed => -2,
            Self::Disconnected => -1,
            Self::Connected => 0,
            Self::BadProtocol => 1,
            Self::BadClientId => 2,
            Self::Unavailable => 3,
            Self::BadCredentials => 4,
            Self::Unauthorized => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionTimeout => "connection timeout",
            Self::ConnectionLost => "connection lost",
            Self::ConnectFailed => "connect failed",
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::BadProtocol => "bad protocol",
            Self::BadClientId => "bad client id",
            Self::Unavailable => "server unavailable",
            Self::BadCredentials => "bad credentials",
            Self::Unauthorized => "unauthorized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Distance,
    WaterLevel,
    Volume,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Distance, Metric::WaterLevel, Metric::Volume];

    pub fn key(self) -> &'static str {
        match self {
            Self::Distance => "distance",
            Self::WaterLevel => "water_level",
            Self::Volume => "volume",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Distance => "Distance",
            Self::WaterLevel => "Water Level",
            Self::Volume => "Volume",
        }
    }

    pub fn enabled(self, flags: &PublishFlags) -> bool {
        match self {
            Self::Distance => flags.distance,
            Self::WaterLevel => flags.level,
            Self::Volume => flags.volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub raw: RawSample,
    pub distance_cm: f32,
    pub level_cm: f32,
    pub volume_l: u32,
    pub at_ms: u64,
}

impl Reading {
    pub fn payload(&self, metric: Metric) -> String {
        match metric {
            Metric::Distance => format!("{:.1}", self.distance_cm),
            Metric::WaterLevel => format!("{:.2}", self.level_cm),
            Metric::Volume => self.volume_l.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub distance: f32,
    #[serde(rename = "waterLevel")]
    pub water_level: f32,
    pub volume: u32,
    #[serde(rename = "wifiStrength")]
    pub wifi_strength: Option<i8>,
    #[serde(rename = "mqttStatus")]
    pub mqtt_status: String,
    #[serde(rename = "ipAddress")]
    pub ip_address: Option<String>,
    #[serde(rename = "rawDistance")]
    pub raw_distance: Option<u16>,
    #[serde(rename = "noEcho")]
    pub no_echo: bool,
    #[serde(rename = "networkState")]
    pub network_state: &'static str,
    #[serde(rename = "brokerState")]
    pub broker_state: &'static str,
    #[serde(rename = "brokerStatusCode")]
    pub broker_status_code: i32,
    #[serde(rename = "capacityLiters")]
    pub capacity_liters: u32,
    #[serde(rename = "capacityCeilingLiters")]
    pub capacity_ceiling_liters: u32,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    pub tank: TankGeometry,
    pub publish: PublishFlags,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            distance: 0.0,
            water_level: 0.0,
            volume: 0,
            wifi_strength: None,
            mqtt_status: BrokerStatus::Disconnected.as_str().to_string(),
            ip_address: None,
            raw_distance: None,
            no_echo: false,
            network_state: LinkState::Disconnected.as_str(),
            broker_state: LinkState::Disconnected.as_str(),
            broker_status_code: BrokerStatus::Disconnected.code(),
            capacity_liters: 0,
            capacity_ceiling_liters: 0,
            uptime_ms: 0,
            tank: TankGeometry::default(),
            publish: PublishFlags::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_use_metric_precision() {
        let reading = Reading {
            raw: RawSample::Distance(61),
            distance_cm: 60.46,
            level_cm: 59.544,
            volume_l: 1190,
            at_ms: 0,
        };

        assert_eq!(reading.payload(Metric::Distance), "60.5");
        assert_eq!(reading.payload(Metric::WaterLevel), "59.54");
        assert_eq!(reading.payload(Metric::Volume), "1190");
    }

    #[test]
    fn metric_flags_map_one_to_one() {
        let flags = PublishFlags {
            distance: true,
            level: false,
            volume: true,
        };

        let enabled: Vec<_> = Metric::ALL
            .into_iter()
            .filter(|metric| metric.enabled(&flags))
            .collect();
        assert_eq!(enabled, vec![Metric::Distance, Metric::Volume]);
    }
}
