pub mod config;
pub mod connectivity;
pub mod filter;
pub mod geometry;
pub mod monitor;
pub mod publisher;
pub mod sampler;
pub mod settings;
pub mod topics;
pub mod types;

pub use config::{
    BrokerSettings, MonitorConfig, NetworkConfig, NoEchoPolicy, PublishFlags, RuntimeConfig,
    TankGeometry, WarmUp,
};
pub use connectivity::{BrokerAttempt, BrokerClient, ConnectivityManager, NetworkLink};
pub use filter::MovingAverage;
pub use geometry::{capacity_liters, to_level, to_volume};
pub use monitor::TankMonitor;
pub use publisher::{discovery_payload, DiscoveryError, MessageSink, PublishReport, Publisher};
pub use sampler::{DistanceSensor, EchoTiming, US_ROUNDTRIP_CM};
pub use settings::{FieldValue, SettingsError, SettingsOutcome, SettingsUpdate};
pub use topics::*;
pub use types::{BrokerStatus, LinkState, Metric, RawSample, Reading, StatusSnapshot};
