use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoEchoPolicy {
    Zero,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmUp {
    Partial,
    ZeroPrimed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub device_name: String,
    pub sample_interval_ms: u64,
    pub window_size: usize,
    pub max_distance_cm: u16,
    pub broker_retry_cooldown_ms: u64,
    pub network_poll_delay_ms: u64,
    pub wifi_reassociate_ms: u64,
    pub capacity_ceiling_l: u32,
    pub no_echo: NoEchoPolicy,
    pub warm_up: WarmUp,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device_name: "water-tank".to_string(),
            sample_interval_ms: 1_000,
            window_size: 10,
            max_distance_cm: 400,
            broker_retry_cooldown_ms: 5_000,
            network_poll_delay_ms: 500,
            wifi_reassociate_ms: 10_000,
            capacity_ceiling_l: 2_000,
            no_echo: NoEchoPolicy::Zero,
            warm_up: WarmUp::Partial,
        }
    }
}

impl MonitorConfig {
    pub fn sanitize(&mut self) {
        self.window_size = self.window_size.clamp(1, 255);
        self.sample_interval_ms = self.sample_interval_ms.max(50);
        self.max_distance_cm = self.max_distance_cm.clamp(2, 500);
        self.network_poll_delay_ms = self.network_poll_delay_ms.max(10);
        self.wifi_reassociate_ms = self.wifi_reassociate_ms.max(1_000);

        let device_name = self.device_name.trim();
        if device_name.is_empty() || device_name.contains(['/', '+', '#']) {
            self.device_name = "water-tank".to_string();
        } else if device_name.len() != self.device_name.len() {
            self.device_name = device_name.to_string();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TankGeometry {
    pub height: f32,
    pub length: f32,
    pub width: f32,
    pub sensor_offset: f32,
}

impl Default for TankGeometry {
    fn default() -> Self {
        Self {
            height: 100.0,
            length: 200.0,
            width: 100.0,
            sensor_offset: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishFlags {
    pub distance: bool,
    pub level: bool,
    pub volume: bool,
}

impl Default for PublishFlags {
    fn default() -> Self {
        Self {
            distance: true,
            level: true,
            volume: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub ota_password: String,
    pub use_static_ip: bool,
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            ota_password: String::new(),
            use_static_ip: false,
            static_ip: None,
            gateway: None,
            subnet: None,
            dns: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

impl NetworkConfig {
    pub fn broker(&self) -> BrokerSettings {
        BrokerSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            user: self.mqtt_user.clone(),
            pass: self.mqtt_pass.clone(),
        }
    }

    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub tank: TankGeometry,
    #[serde(default)]
    pub publish: PublishFlags,
    #[serde(default)]
    pub network: NetworkConfig,
}
