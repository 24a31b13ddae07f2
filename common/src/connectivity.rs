use std::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::{
    config::{BrokerSettings, NetworkConfig},
    types::{BrokerStatus, LinkState},
};

pub trait NetworkLink {
    fn begin(&mut self, config: &NetworkConfig) -> bool;
    fn is_up(&self) -> bool;
    fn rssi(&self) -> Option<i8>;
    fn local_address(&self) -> Option<Ipv4Addr>;
}

pub trait BrokerClient {
    fn configure(&mut self, settings: &BrokerSettings);
    fn connect(&mut self, client_id: &str, user: &str, pass: &str) -> bool;
    fn connected(&self) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool;
    fn pump(&mut self);
    fn state(&self) -> BrokerStatus;
    fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAttempt {
    Skipped,
    Connected,
    Failed(BrokerStatus),
}

const DEFAULT_REASSOCIATE_MS: u64 = 10_000;

pub struct ConnectivityManager<N, B> {
    network: N,
    broker: B,
    network_config: NetworkConfig,
    broker_settings: BrokerSettings,
    client_id: String,
    cooldown_ms: u64,
    reassociate_ms: u64,

    network_state: LinkState,
    last_begin_ms: Option<u64>,
    broker_state: LinkState,
    last_attempt_ms: Option<u64>,
    last_failure: Option<BrokerStatus>,
    attempts: u64,
    failures: u64,
}

impl<N: NetworkLink, B: BrokerClient> ConnectivityManager<N, B> {
    pub fn new(
        network: N,
        mut broker: B,
        network_config: NetworkConfig,
        client_id: impl Into<String>,
        cooldown_ms: u64,
    ) -> Self {
        let broker_settings = network_config.broker();
        broker.configure(&broker_settings);
        Self {
            network,
            broker,
            network_config,
            broker_settings,
            client_id: client_id.into(),
            cooldown_ms,
            reassociate_ms: DEFAULT_REASSOCIATE_MS,
            network_state: LinkState::Disconnected,
            last_begin_ms: None,
            broker_state: LinkState::Disconnected,
            last_attempt_ms: None,
            last_failure: None,
            attempts: 0,
            failures: 0,
        }
    }

    pub fn with_reassociate_interval(mut self, reassociate_ms: u64) -> Self {
        self.reassociate_ms = reassociate_ms;
        self
    }

    // Boot only; blocks until the station link is up.
    pub fn wait_for_network(&mut self, poll_delay_ms: u64, mut delay: impl FnMut(u64)) {
        info!("connecting to wifi `{}`", self.network_config.wifi_ssid);
        self.begin_network(0);

        let mut waited_ms = 0_u64;
        while !self.network.is_up() {
            delay(poll_delay_ms);
            waited_ms = waited_ms.saturating_add(poll_delay_ms);
            if waited_ms % 10_000 < poll_delay_ms {
                debug!("still waiting for wifi after {}s", waited_ms / 1_000);
            }
            if self.reassociation_due(waited_ms) {
                self.begin_network(waited_ms);
            }
        }

        // The boot wait counts its own time; runtime uses the loop clock.
        self.network_state = LinkState::Connected;
        self.last_begin_ms = None;
        match self.network.local_address() {
            Some(ip) => info!("wifi connected, ip address {ip}"),
            None => info!("wifi connected"),
        }
    }

    pub fn pump(&mut self) {
        if self.broker_state == LinkState::Connected {
            self.broker.pump();
        }
    }

    pub fn maintain(&mut self, now_ms: u64) -> BrokerAttempt {
        self.maintain_network(now_ms);
        if self.network_state != LinkState::Connected {
            return BrokerAttempt::Skipped;
        }

        if self.broker_state == LinkState::Connected {
            if self.broker.connected() {
                return BrokerAttempt::Skipped;
            }
            let status = self.broker.state();
            warn!("mqtt session lost (rc={})", status.code());
            self.broker_state = LinkState::Disconnected;
            self.last_failure = Some(status);
        }

        if !self.retry_due(now_ms) {
            return BrokerAttempt::Skipped;
        }
        self.attempt_broker(now_ms)
    }

    pub fn reconfigure_broker(&mut self, settings: BrokerSettings) {
        if settings == self.broker_settings {
            return;
        }

        info!(
            "mqtt broker changed to {}:{}; reconnecting",
            settings.host, settings.port
        );
        if self.broker_state != LinkState::Disconnected {
            self.broker.disconnect();
        }
        self.broker.configure(&settings);
        self.network_config.mqtt_host = settings.host.clone();
        self.network_config.mqtt_port = settings.port;
        self.network_config.mqtt_user = settings.user.clone();
        self.network_config.mqtt_pass = settings.pass.clone();
        self.broker_settings = settings;
        self.broker_state = LinkState::Disconnected;
        self.last_attempt_ms = None;
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool {
        if self.broker_state != LinkState::Connected {
            return false;
        }
        self.broker.publish(topic, payload, retain)
    }

    pub fn is_network_up(&self) -> bool {
        self.network_state == LinkState::Connected
    }

    pub fn is_broker_up(&self) -> bool {
        self.broker_state == LinkState::Connected
    }

    pub fn network_state(&self) -> LinkState {
        self.network_state
    }

    pub fn broker_state(&self) -> LinkState {
        self.broker_state
    }

    pub fn signal_strength(&self) -> Option<i8> {
        if self.is_network_up() {
            self.network.rssi()
        } else {
            None
        }
    }

    pub fn local_address(&self) -> Option<Ipv4Addr> {
        if self.is_network_up() {
            self.network.local_address()
        } else {
            None
        }
    }

    pub fn broker_status(&self) -> BrokerStatus {
        if self.is_broker_up() {
            BrokerStatus::Connected
        } else {
            self.last_failure.unwrap_or(BrokerStatus::Disconnected)
        }
    }

    pub fn broker_settings(&self) -> &BrokerSettings {
        &self.broker_settings
    }

    pub fn connect_attempts(&self) -> u64 {
        self.attempts
    }

    pub fn connect_failures(&self) -> u64 {
        self.failures
    }

    pub fn cooldown_remaining_ms(&self, now_ms: u64) -> u64 {
        match self.last_attempt_ms {
            Some(last) if !self.is_broker_up() => {
                self.cooldown_ms.saturating_sub(now_ms.saturating_sub(last))
            }
            _ => 0,
        }
    }

    fn begin_network(&mut self, now_ms: u64) {
        self.last_begin_ms = Some(now_ms);
        if self.network.begin(&self.network_config) {
            self.network_state = LinkState::Connecting;
        } else {
            warn!("wifi association could not be started");
            self.network_state = LinkState::Disconnected;
        }
    }

    fn reassociation_due(&self, now_ms: u64) -> bool {
        match self.network_state {
            LinkState::Connected => false,
            LinkState::Disconnected => true,
            LinkState::Connecting => self
                .last_begin_ms
                .map(|last| now_ms.saturating_sub(last) >= self.reassociate_ms)
                .unwrap_or(true),
        }
    }

    fn maintain_network(&mut self, now_ms: u64) {
        let up = self.network.is_up();
        match (self.network_state, up) {
            (LinkState::Connected, true) => {}
            (LinkState::Connected, false) => {
                warn!("wifi link lost");
                self.network_state = LinkState::Disconnected;
                if self.broker_state != LinkState::Disconnected {
                    self.broker.disconnect();
                    self.broker_state = LinkState::Disconnected;
                    self.last_failure = Some(BrokerStatus::ConnectionLost);
                }
            }
            (_, true) => {
                info!("wifi link up");
                self.network_state = LinkState::Connected;
                self.last_begin_ms = None;
            }
            (_, false) => {
                if self.reassociation_due(now_ms) {
                    if self.network_state == LinkState::Connecting {
                        info!(
                            "wifi still not associated after {}ms; retrying",
                            self.reassociate_ms
                        );
                    }
                    self.begin_network(now_ms);
                }
            }
        }
    }

    fn retry_due(&self, now_ms: u64) -> bool {
        self.last_attempt_ms
            .map(|last| now_ms.saturating_sub(last) >= self.cooldown_ms)
            .unwrap_or(true)
    }

    fn attempt_broker(&mut self, now_ms: u64) -> BrokerAttempt {
        self.last_attempt_ms = Some(now_ms);
        self.attempts = self.attempts.saturating_add(1);
        self.broker_state = LinkState::Connecting;

        info!(
            "connecting to mqtt broker {}:{} as `{}`",
            self.broker_settings.host, self.broker_settings.port, self.client_id
        );
        let ok = self.broker.connect(
            &self.client_id,
            &self.broker_settings.user,
            &self.broker_settings.pass,
        );

        if ok {
            info!("mqtt connected");
            self.broker_state = LinkState::Connected;
            self.last_failure = None;
            BrokerAttempt::Connected
        } else {
            let status = self.broker.state();
            warn!(
                "mqtt connect failed (rc={}, {}); next attempt in {}ms",
                status.code(),
                status.as_str(),
                self.cooldown_ms
            );
            self.broker_state = LinkState::Disconnected;
            self.last_failure = Some(status);
            self.failures = self.failures.saturating_add(1);
            BrokerAttempt::Failed(status)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};

    const COOLDOWN: u64 = 5_000;

    fn manager(
        network: &FakeNetwork,
        broker: &FakeBroker,
    ) -> ConnectivityManager<FakeNetwork, FakeBroker> {
        ConnectivityManager::new(
            network.clone(),
            broker.clone(),
            NetworkConfig::default(),
            "water-tank",
            COOLDOWN,
        )
    }

    #[test]
    fn boot_waits_for_association() {
        let network = FakeNetwork::default();
        network.0.borrow_mut().up_after_begins = Some(1);
        let broker = FakeBroker::accepting();
        let mut link = manager(&network, &broker);

        assert_eq!(link.network_state(), LinkState::Disconnected);
        let mut delays = 0;
        link.wait_for_network(500, |_| delays += 1);

        assert_eq!(delays, 0);
        assert!(link.is_network_up());
        assert_eq!(link.signal_strength(), Some(-61));
    }

    #[test]
    fn boot_polls_with_fixed_delay() {
        let network = FakeNetwork::default();
        let broker = FakeBroker::accepting();
        let mut link = manager(&network, &broker);

        let shared = network.clone();
        let mut waited = Vec::new();
        link.wait_for_network(500, |ms| {
            waited.push(ms);
            if waited.len() == 4 {
                shared.0.borrow_mut().up = true;
            }
        });

        assert_eq!(waited, vec![500; 4]);
        // Still inside the first association window.
        assert_eq!(network.0.borrow().begins, 1);
    }

    #[test]
    fn boot_reissues_begin_when_association_stalls() {
        let network = FakeNetwork::default();
        network.0.borrow_mut().up_after_begins = Some(3);
        let broker = FakeBroker::accepting();
        let mut link = manager(&network, &broker).with_reassociate_interval(2_000);

        let mut polls = 0;
        link.wait_for_network(500, |_| polls += 1);

        assert_eq!(network.0.borrow().begins, 3);
        assert_eq!(polls, 8);
        assert!(link.is_network_up());
    }

    #[test]
    fn stalled_association_is_retried_at_runtime() {
        let network = FakeNetwork::default();
        network.0.borrow_mut().up_after_begins = Some(3);
        let broker = FakeBroker::accepting();
        let mut link = manager(&network, &broker).with_reassociate_interval(3_000);

        let mut connected_at = None;
        for now_ms in (0..10_000).step_by(100) {
            if link.maintain(now_ms) == BrokerAttempt::Connected {
                connected_at = Some(now_ms);
            }
        }

        // begin() at 0, 3000 and 6000; the link is seen up on the next tick.
        assert_eq!(network.0.borrow().begins, 3);
        assert_eq!(connected_at, Some(6_100));
        assert!(link.is_network_up());
        assert_eq!(broker.0.borrow().connects, 1);
    }

    #[test]
    fn reassociation_after_link_loss_keeps_retrying() {
        let network = FakeNetwork::default();
        network.0.borrow_mut().up = true;
        let broker = FakeBroker::accepting();
        let mut link = manager(&network, &broker).with_reassociate_interval(5_000);
        link.maintain(0);

        network.0.borrow_mut().up = false;
        for now_ms in (1_000..600_000).step_by(1_000) {
            link.maintain(now_ms);
        }

        // Lost at 1000, begin() from 2000 every 5s until 597000.
        assert_eq!(network.0.borrow().begins, 120);
        assert_eq!(link.network_state(), LinkState::Connecting);
    }

    #[test]
    fn broker_attempts_respect_cooldown() {
        let network = FakeNetwork::default();
        network.0.borrow_mut().up = true;
        let broker = FakeBroker::default();
        broker.0.borrow_mut().refuse_with = Some(BrokerStatus::Unavailable);
        let mut link = manager(&network, &broker);

        // Loop iterations every 10ms for 60 simulated seconds.
        let mut attempt_times = Vec::new();
        for now_ms in (0..60_000).step_by(10) {
            if link.maintain(now_ms) != BrokerAttempt::Skipped {
                attempt_times.push(now_ms);
            }
        }

        assert_eq!(attempt_times.len(), 12);
        for pair in attempt_times.windows(2) {
            assert!(pair[1] - pair[0] >= COOLDOWN);
        }
        assert_eq!(broker.0.borrow().connects, 12);
        assert_eq!(link.broker_status(), BrokerStatus::Unavailable);
        assert_eq!(link.connect_failures(), 12);
    }

    #[test]
    fn failed_attempt_then_recovery() {
        let network = FakeNetwork::default();
        network.0.borrow_mut().up = true;
        let broker = FakeBroker::default();
        broker.0.borrow_mut().scripted.extend([false, true]);
        let mut link = manager(&network, &broker);

        assert_eq!(
            link.maintain(0),
            BrokerAttempt::Failed(BrokerStatus::ConnectFailed)
        );
        assert!(!link.is_broker_up());
        assert_eq!(link.maintain(4_999), BrokerAttempt::Skipped);
        assert_eq!(link.cooldown_remaining_ms(4_000), 1_000);
        assert_eq!(link.maintain(5_000), BrokerAttempt::Connected);
        assert!(link.is_broker_up());
        assert_eq!(link.broker_status(), BrokerStatus::Connected);
    }

    #[test]
    fn lost_session_retries_after_cooldown_from_last_attempt() {
        let network = FakeNetwork::default();
        network.0.borrow_mut().up = true;
        let broker = FakeBroker::accepting();
        let mut link = manager(&network, &broker);

        assert_eq!(link.maintain(0), BrokerAttempt::Connected);
        broker.drop_session();

        // The cooldown runs from the last attempt, which was long ago.
        assert_eq!(link.maintain(2_000), BrokerAttempt::Skipped);
        assert!(!link.is_broker_up());
        assert_eq!(link.maintain(6_000), BrokerAttempt::Connected);
    }

    #[test]
    fn no_broker_attempts_while_network_down() {
        let network = FakeNetwork::default();
        let broker = FakeBroker::accepting();
        let mut link = manager(&network, &broker);

        for now_ms in (0..30_000).step_by(1_000) {
            assert_eq!(link.maintain(now_ms), BrokerAttempt::Skipped);
        }
        assert_eq!(broker.0.borrow().connects, 0);
        assert_eq!(network.0.borrow().begins, 3);
        assert_eq!(link.network_state(), LinkState::Connecting);
    }

    #[test]
    fn network_loss_drops_broker_and_reassociates() {
        let network = FakeNetwork::default();
        network.0.borrow_mut().up = true;
        let broker = FakeBroker::accepting();
        let mut link = manager(&network, &broker);
        link.maintain(0);
        assert!(link.is_broker_up());

        network.0.borrow_mut().up = false;
        link.maintain(100);
        assert_eq!(link.network_state(), LinkState::Disconnected);
        assert!(!link.is_broker_up());
        assert_eq!(link.broker_status(), BrokerStatus::ConnectionLost);
        assert_eq!(link.signal_strength(), None);

        link.maintain(200);
        assert_eq!(link.network_state(), LinkState::Connecting);
        assert_eq!(network.0.borrow().begins, 1);

        network.0.borrow_mut().up = true;
        assert_eq!(link.maintain(5_000), BrokerAttempt::Connected);
    }

    #[test]
    fn reconfigure_allows_immediate_attempt() {
        let network = FakeNetwork::default();
        network.0.borrow_mut().up = true;
        let broker = FakeBroker::accepting();
        let mut link = manager(&network, &broker);
        link.maintain(0);

        let mut settings = link.broker_settings().clone();
        link.reconfigure_broker(settings.clone());
        assert_eq!(broker.0.borrow().disconnects, 0);

        settings.host = "10.0.0.5".to_string();
        link.reconfigure_broker(settings);
        assert_eq!(broker.0.borrow().disconnects, 1);
        assert!(!link.is_broker_up());

        assert_eq!(link.maintain(100), BrokerAttempt::Connected);
        let log = broker.0.borrow();
        assert_eq!(log.configured.last().unwrap().host, "10.0.0.5");
    }

    #[test]
    fn publish_requires_session() {
        let network = FakeNetwork::default();
        network.0.borrow_mut().up = true;
        let broker = FakeBroker::accepting();
        let mut link = manager(&network, &broker);

        assert!(!link.publish("water-tank/volume/state", b"10", false));
        link.maintain(0);
        assert!(link.publish("water-tank/volume/state", b"10", false));
        link.pump();
        assert_eq!(broker.0.borrow().pumps, 1);
    }
}
