use log::{debug, info, warn};

use crate::{
    config::{MonitorConfig, NetworkConfig, PublishFlags, RuntimeConfig, TankGeometry},
    connectivity::{BrokerClient, ConnectivityManager, NetworkLink},
    filter::MovingAverage,
    geometry::{capacity_liters, to_level, to_volume},
    publisher::{PublishReport, Publisher},
    sampler::DistanceSensor,
    settings::{SettingsOutcome, SettingsUpdate},
    types::{RawSample, Reading, StatusSnapshot},
};

pub struct TankMonitor<S, N, B> {
    config: MonitorConfig,
    tank: TankGeometry,
    publish: PublishFlags,
    network: NetworkConfig,

    sensor: S,
    filter: MovingAverage,
    link: ConnectivityManager<N, B>,
    publisher: Publisher,

    last_cycle_ms: Option<u64>,
    last_reading: Option<Reading>,
    last_report: Option<PublishReport>,
    no_echo_streak: u32,
    now_ms: u64,
}

impl<S, N, B> TankMonitor<S, N, B>
where
    S: DistanceSensor,
    N: NetworkLink,
    B: BrokerClient,
{
    pub fn new(mut runtime: RuntimeConfig, sensor: S, network: N, broker: B) -> Self {
        runtime.monitor.sanitize();
        let config = runtime.monitor;
        let filter = MovingAverage::new(config.window_size, config.no_echo, config.warm_up);
        let link = ConnectivityManager::new(
            network,
            broker,
            runtime.network.clone(),
            config.device_name.clone(),
            config.broker_retry_cooldown_ms,
        )
        .with_reassociate_interval(config.wifi_reassociate_ms);
        let publisher = Publisher::new(config.device_name.clone());

        Self {
            config,
            tank: runtime.tank,
            publish: runtime.publish,
            network: runtime.network,
            sensor,
            filter,
            link,
            publisher,
            last_cycle_ms: None,
            last_reading: None,
            last_report: None,
            no_echo_streak: 0,
            now_ms: 0,
        }
    }

    pub fn boot(&mut self, delay: impl FnMut(u64)) {
        info!(
            "tank monitor `{}` starting: {}x{}x{} cm, offset {} cm",
            self.config.device_name,
            self.tank.length,
            self.tank.width,
            self.tank.height,
            self.tank.sensor_offset
        );
        self.link
            .wait_for_network(self.config.network_poll_delay_ms, delay);
    }

    pub fn service(&mut self, now_ms: u64) -> Option<Reading> {
        self.now_ms = now_ms;
        self.link.pump();
        self.link.maintain(now_ms);

        let due = self
            .last_cycle_ms
            .map(|last| now_ms.saturating_sub(last) >= self.config.sample_interval_ms)
            .unwrap_or(true);
        if !due {
            return None;
        }

        self.last_cycle_ms = Some(now_ms);
        Some(self.run_cycle(now_ms))
    }

    fn run_cycle(&mut self, now_ms: u64) -> Reading {
        let raw = self.sensor.sample();
        self.track_echo(raw);

        let distance_cm = self.filter.push(raw);
        let level_cm = to_level(distance_cm, &self.tank);
        let volume_l = to_volume(level_cm, &self.tank, self.config.capacity_ceiling_l);

        let reading = Reading {
            raw,
            distance_cm,
            level_cm,
            volume_l,
            at_ms: now_ms,
        };
        debug!(
            "raw {:?}, distance {:.1} cm, level {:.2} cm, volume {} L",
            raw, distance_cm, level_cm, volume_l
        );

        let report = self
            .publisher
            .on_tick(&reading, &self.publish, &mut self.link);
        self.last_report = Some(report);
        self.last_reading = Some(reading);
        reading
    }

    fn track_echo(&mut self, raw: RawSample) {
        match raw {
            RawSample::NoEcho => {
                self.no_echo_streak = self.no_echo_streak.saturating_add(1);
                if self.no_echo_streak == self.filter.window() as u32 {
                    warn!(
                        "no echo for {} consecutive samples; check sensor wiring and range",
                        self.no_echo_streak
                    );
                }
            }
            RawSample::Distance(_) => {
                if self.no_echo_streak >= self.filter.window() as u32 {
                    info!("sensor echo restored after {} misses", self.no_echo_streak);
                }
                self.no_echo_streak = 0;
            }
        }
    }

    pub fn apply_settings(&mut self, update: &SettingsUpdate) -> SettingsOutcome {
        let outcome = update.apply(&mut self.tank, &mut self.publish, &mut self.network);

        for rejected in &outcome.rejected {
            warn!("settings field ignored: {rejected}");
        }
        if outcome.tank_changed {
            info!(
                "tank geometry updated: {}x{}x{} cm, offset {} cm",
                self.tank.length, self.tank.width, self.tank.height, self.tank.sensor_offset
            );
        }
        if outcome.publish_changed {
            info!(
                "publish flags updated: distance={} level={} volume={}",
                self.publish.distance, self.publish.level, self.publish.volume
            );
        }
        if outcome.broker_changed {
            self.link.reconfigure_broker(self.network.broker());
        }

        outcome
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let reading = self.last_reading;
        let broker_status = self.link.broker_status();
        let mqtt_status = if self.link.is_broker_up() {
            broker_status.as_str().to_string()
        } else {
            format!("{} (rc={})", broker_status.as_str(), broker_status.code())
        };

        StatusSnapshot {
            distance: reading.map(|r| r.distance_cm).unwrap_or(0.0),
            water_level: reading.map(|r| r.level_cm).unwrap_or(0.0),
            volume: reading.map(|r| r.volume_l).unwrap_or(0),
            wifi_strength: self.link.signal_strength(),
            mqtt_status,
            ip_address: self.link.local_address().map(|ip| ip.to_string()),
            raw_distance: reading.and_then(|r| r.raw.centimeters()),
            no_echo: reading.map(|r| r.raw.is_no_echo()).unwrap_or(false),
            network_state: self.link.network_state().as_str(),
            broker_state: self.link.broker_state().as_str(),
            broker_status_code: broker_status.code(),
            capacity_liters: capacity_liters(&self.tank),
            capacity_ceiling_liters: self.config.capacity_ceiling_l,
            uptime_ms: self.now_ms,
            tank: self.tank,
            publish: self.publish,
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            monitor: self.config.clone(),
            tank: self.tank,
            publish: self.publish,
            network: self.network.clone(),
        }
    }

    pub fn tank(&self) -> &TankGeometry {
        &self.tank
    }

    pub fn publish_flags(&self) -> &PublishFlags {
        &self.publish
    }

    pub fn last_reading(&self) -> Option<&Reading> {
        self.last_reading.as_ref()
    }

    pub fn last_report(&self) -> Option<&PublishReport> {
        self.last_report.as_ref()
    }

    pub fn connectivity(&self) -> &ConnectivityManager<N, B> {
        &self.link
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }
}
