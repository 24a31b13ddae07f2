use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    mqtt::client::{EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyInputPin, AnyOutputPin, Input, InputPin, Output, OutputPin, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::EspWifi,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use watertank_common::{
    BrokerClient, BrokerSettings, BrokerStatus, DistanceSensor, EchoTiming, NetworkConfig,
    NetworkLink, RawSample, RuntimeConfig, SettingsOutcome, SettingsUpdate, StatusSnapshot,
    TankMonitor,
};

use crate::web::{settings_page, status_page, SettingsResponse};

const NVS_NAMESPACE: &str = "watertank";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const TRIGGER_PIN: i32 = 5;
const ECHO_PIN: i32 = 18;

const MAX_HTTP_BODY: usize = 4096;
const OTA_CHUNK_SIZE: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const LOOP_DELAY_MS: u64 = 10;
const SETTINGS_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_CONNECT_POLL: Duration = Duration::from_millis(50);
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const OTA_REBOOT_DELAY_MS: u64 = 800;

/// HC-SR04 on two GPIOs, busy-waiting on the echo line.
struct HcSr04 {
    trigger: PinDriver<'static, AnyOutputPin, Output>,
    echo: PinDriver<'static, AnyInputPin, Input>,
    timing: EchoTiming,
}

struct EspNetworkLink {
    wifi: EspWifi<'static>,
    configured: bool,
    last_begin: Option<Instant>,
    warned_missing_credentials: bool,
}

/// ESP-IDF MQTT client. The IDF task owns the socket; a receiver thread
/// mirrors its session events into the flags below.
struct EspMqttBroker {
    url: String,
    client: Option<EspMqttClient<'static>>,
    session: Arc<SessionFlags>,
    status: BrokerStatus,
}

#[derive(Default)]
struct SessionFlags {
    connected: AtomicBool,
    errored: AtomicBool,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct SettingsRequest {
    update: SettingsUpdate,
    reply: mpsc::SyncSender<SettingsOutcome>,
}

#[derive(Clone)]
struct SharedState {
    snapshot: Arc<Mutex<StatusSnapshot>>,
    runtime: Arc<Mutex<RuntimeConfig>>,
    settings: mpsc::Sender<SettingsRequest>,
    ota: Arc<Mutex<OtaProgress>>,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OtaProgress {
    in_progress: bool,
    reboot_pending: bool,
    bytes_written: u64,
    total_bytes: Option<u64>,
    last_error: Option<String>,
    last_sha256: Option<String>,
}

#[derive(Debug, Serialize)]
struct OtaStatus {
    supported: bool,
    #[serde(flatten)]
    progress: OtaProgress,
}

#[derive(Debug, Deserialize)]
struct OtaRequest {
    url: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

enum OtaRejection {
    Invalid(&'static str),
    WrongPassword,
    Busy,
    Spawn(String),
}

/// Restarts the device after the station link has been down too long.
#[derive(Default)]
struct WifiWatch {
    down_since: Option<Instant>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let sensor = HcSr04::new(
        pins.gpio5.downgrade_output(),
        pins.gpio18.downgrade_input(),
        EchoTiming::new(runtime.monitor.max_distance_cm),
    )
    .context("failed to initialize ultrasonic sensor")?;
    let network = EspNetworkLink::new(modem, sys_loop, nvs_partition, &runtime.network)
        .context("failed to initialize wifi")?;

    let mut monitor = TankMonitor::new(runtime, sensor, network, EspMqttBroker::new());
    monitor.boot(|ms| thread::sleep(Duration::from_millis(ms)));

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    start_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let (settings_tx, settings_rx) = mpsc::channel();
    let state = SharedState {
        snapshot: Arc::new(Mutex::new(monitor.snapshot())),
        runtime: Arc::new(Mutex::new(monitor.runtime_config())),
        settings: settings_tx,
        ota: Arc::new(Mutex::new(OtaProgress::default())),
    };
    let server = create_http_server(state.clone())?;

    let mut wifi_watch = WifiWatch::default();
    loop {
        feed_watchdog();

        if lock(&state.ota).reboot_pending {
            info!("OTA image applied; leaving monitor loop to reboot");
            break;
        }

        while let Ok(request) = settings_rx.try_recv() {
            let outcome = monitor.apply_settings(&request.update);
            if outcome.changed() {
                let runtime = monitor.runtime_config();
                if let Err(err) = nvs_store.save_runtime_config(&runtime) {
                    warn!("failed to persist settings to NVS: {err:#}");
                }
                *lock(&state.runtime) = runtime;
                *lock(&state.snapshot) = monitor.snapshot();
            }
            let _ = request.reply.send(outcome);
        }

        if monitor.service(monotonic_ms()).is_some() {
            *lock(&state.snapshot) = monitor.snapshot();
        }

        if wifi_watch.restart_due(monitor.connectivity().is_network_up()) {
            warn!(
                "wifi down for {}s; restarting",
                WIFI_RESTART_GRACE_MS / 1_000
            );
            thread::sleep(Duration::from_millis(100));
            restart();
        }
        thread::sleep(Duration::from_millis(LOOP_DELAY_MS));
    }

    drop(server);
    thread::sleep(Duration::from_millis(OTA_REBOOT_DELAY_MS));
    restart();
    Ok(())
}

impl HcSr04 {
    fn new(trigger: AnyOutputPin, echo: AnyInputPin, timing: EchoTiming) -> anyhow::Result<Self> {
        let mut trigger = PinDriver::output(trigger)?;
        trigger.set_low()?;

        let mut echo = PinDriver::input(echo)?;
        echo.set_pull(Pull::Down)?;

        info!(
            "HC-SR04 on trigger GPIO{} / echo GPIO{}, range {} cm",
            TRIGGER_PIN,
            ECHO_PIN,
            timing.max_distance_cm()
        );
        Ok(Self {
            trigger,
            echo,
            timing,
        })
    }

    fn measure_echo_us(&mut self) -> Option<u32> {
        self.trigger.set_low().ok()?;
        Ets::delay_us(2);
        self.trigger.set_high().ok()?;
        Ets::delay_us(10);
        self.trigger.set_low().ok()?;

        let max_wait = Duration::from_micros(u64::from(self.timing.max_echo_us()));

        let waiting = Instant::now();
        while self.echo.is_low() {
            if waiting.elapsed() > max_wait {
                return None;
            }
        }

        let rising = Instant::now();
        while self.echo.is_high() {
            if rising.elapsed() > max_wait {
                return None;
            }
        }
        rising.elapsed().as_micros().try_into().ok()
    }
}

impl DistanceSensor for HcSr04 {
    fn sample(&mut self) -> RawSample {
        let echo_us = self.measure_echo_us();
        self.timing.from_echo_us(echo_us)
    }
}

impl EspNetworkLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

        match static_ip_netif(network) {
            Ok(Some(conf)) => {
                let sta_netif =
                    EspNetif::new_with_conf(&conf).context("failed to create static IP netif")?;
                wifi.swap_netif_sta(sta_netif)
                    .context("failed to apply static IP netif configuration")?;
            }
            Ok(None) => {}
            Err(err) => warn!("invalid static IP configuration ({err:#}); using DHCP"),
        }

        Ok(Self {
            wifi,
            configured: false,
            last_begin: None,
            warned_missing_credentials: false,
        })
    }

    fn start_station(&mut self, network: &NetworkConfig) -> anyhow::Result<()> {
        if !self.configured {
            let auth_method = if network.wifi_pass.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            };

            self.wifi
                .set_configuration(&Configuration::Client(ClientConfiguration {
                    ssid: network
                        .wifi_ssid
                        .as_str()
                        .try_into()
                        .map_err(|_| anyhow!("wifi ssid too long"))?,
                    password: network
                        .wifi_pass
                        .as_str()
                        .try_into()
                        .map_err(|_| anyhow!("wifi password too long"))?,
                    auth_method,
                    ..Default::default()
                }))?;
            self.wifi.start()?;
            disable_wifi_power_save();
            self.configured = true;
            info!("wifi started, connecting to `{}`", network.wifi_ssid);
        } else if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect before reassociation failed: {err:?}");
        }

        self.wifi.connect()?;
        Ok(())
    }
}

impl NetworkLink for EspNetworkLink {
    fn begin(&mut self, config: &NetworkConfig) -> bool {
        if !config.has_station_credentials() {
            if !self.warned_missing_credentials {
                warn!("wifi credentials missing; build with WIFI_SSID and WIFI_PASS set");
                self.warned_missing_credentials = true;
            }
            return false;
        }

        // An association is already in flight; let it finish.
        if let Some(last) = self.last_begin {
            if (last.elapsed().as_millis() as u64) < WIFI_RETRY_DELAY_MS {
                return true;
            }
        }
        self.last_begin = Some(Instant::now());

        match self.start_station(config) {
            Ok(()) => true,
            Err(err) => {
                warn!("wifi connect request failed: {err:#}");
                false
            }
        }
    }

    fn is_up(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.is_up().unwrap_or(false)
    }

    fn rssi(&self) -> Option<i8> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info.rssi)
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        let info = self.wifi.sta_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then_some(info.ip)
    }
}

impl EspMqttBroker {
    fn new() -> Self {
        Self {
            url: String::new(),
            client: None,
            session: Arc::new(SessionFlags::default()),
            status: BrokerStatus::Disconnected,
        }
    }

    fn drop_client(&mut self, status: BrokerStatus) {
        if self.client.take().is_some() {
            self.session.connected.store(false, Ordering::Relaxed);
        }
        self.status = status;
    }
}

impl BrokerClient for EspMqttBroker {
    fn configure(&mut self, settings: &BrokerSettings) {
        self.url = format!("mqtt://{}:{}", settings.host, settings.port);
    }

    fn connect(&mut self, client_id: &str, user: &str, pass: &str) -> bool {
        self.drop_client(BrokerStatus::Disconnected);

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: if user.is_empty() { None } else { Some(user) },
            password: if pass.is_empty() { None } else { Some(pass) },
            ..Default::default()
        };

        let (client, connection) = match EspMqttClient::new(self.url.as_str(), &conf) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("failed to create mqtt client for {}: {err:?}", self.url);
                self.status = BrokerStatus::ConnectFailed;
                return false;
            }
        };

        let session = Arc::new(SessionFlags::default());
        if let Err(err) = spawn_mqtt_receiver(connection, session.clone()) {
            warn!("{err:#}");
            self.status = BrokerStatus::ConnectFailed;
            return false;
        }

        let started = Instant::now();
        while started.elapsed() < MQTT_CONNECT_TIMEOUT {
            if session.connected.load(Ordering::Relaxed) {
                self.client = Some(client);
                self.session = session;
                self.status = BrokerStatus::Connected;
                return true;
            }
            if session.errored.load(Ordering::Relaxed) {
                self.status = BrokerStatus::ConnectFailed;
                return false;
            }
            feed_watchdog();
            thread::sleep(MQTT_CONNECT_POLL);
        }

        self.status = BrokerStatus::ConnectionTimeout;
        false
    }

    fn connected(&self) -> bool {
        self.client.is_some() && self.session.connected.load(Ordering::Relaxed)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        match client.publish(topic, QoS::AtMostOnce, retain, payload) {
            Ok(_) => true,
            Err(err) => {
                warn!("mqtt publish to {topic} failed: {err:?}");
                false
            }
        }
    }

    /// The IDF MQTT task services the socket itself.
    fn pump(&mut self) {}

    fn state(&self) -> BrokerStatus {
        if self.client.is_some() && !self.session.connected.load(Ordering::Relaxed) {
            BrokerStatus::ConnectionLost
        } else {
            self.status
        }
    }

    fn disconnect(&mut self) {
        self.drop_client(BrokerStatus::Disconnected);
    }
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    session: Arc<SessionFlags>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            // Ends when the owning client is dropped.
            while let Ok(event) = conn.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        session.connected.store(true, Ordering::Relaxed);
                    }
                    EventPayload::Disconnected => {
                        session.connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Error(err) => {
                        warn!("mqtt error event: {err:?}");
                        session.errored.store(true, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
            session.connected.store(false, Ordering::Relaxed);
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            let page = status_page(&lock(&state.snapshot));
            write_html(req, 200, &page)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/data", Method::Get, move |req| {
            let snapshot = lock(&state.snapshot).clone();
            write_json(req, &snapshot)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/settings", Method::Get, move |req| {
            let page = settings_page(&lock(&state.runtime), None);
            write_html(req, 200, &page)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/settings", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let body = core::str::from_utf8(&body).context("settings form is not utf-8")?;
            let update = parse_settings_form(body)?;

            match submit_settings(&state, update) {
                Ok(outcome) => {
                    let page = settings_page(&lock(&state.runtime), Some(&outcome));
                    write_html(req, 200, &page)
                }
                Err(err) => write_error(req, 503, &err.to_string()),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/settings", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: SettingsUpdate =
                serde_json::from_slice(&body).context("invalid settings payload")?;

            match submit_settings(&state, update) {
                Ok(outcome) => write_json(req, &SettingsResponse::from(&outcome)),
                Err(err) => write_error(req, 503, &err.to_string()),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/ota/status", Method::Get, move |req| {
            let status = OtaStatus {
                supported: true,
                progress: lock(&state.ota).clone(),
            };
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/apply", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let request: OtaRequest =
                serde_json::from_slice(&body).context("invalid ota payload")?;

            match start_ota(&state, request) {
                Ok(()) => write_json(req, &serde_json::json!({ "accepted": true })),
                Err(rejection) => {
                    let (status, message) = rejection.describe();
                    write_error(req, status, &message)
                }
            }
        })?;
    }

    Ok(server)
}

/// Hands an update to the monitor loop and waits for its verdict.
fn submit_settings(state: &SharedState, update: SettingsUpdate) -> anyhow::Result<SettingsOutcome> {
    let (reply, outcome) = mpsc::sync_channel(1);
    state
        .settings
        .send(SettingsRequest { update, reply })
        .map_err(|_| anyhow!("monitor loop is not running"))?;
    outcome
        .recv_timeout(SETTINGS_REPLY_TIMEOUT)
        .map_err(|_| anyhow!("timed out waiting for the monitor loop"))
}

/// Decodes an `application/x-www-form-urlencoded` body. Every value arrives
/// as text; [`SettingsUpdate`] does the typing.
fn parse_settings_form(body: &str) -> anyhow::Result<SettingsUpdate> {
    let mut fields = serde_json::Map::new();
    for pair in body.split('&').filter(|pair| !pair.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        fields.insert(
            decode_form_component(name)?,
            serde_json::Value::String(decode_form_component(value)?),
        );
    }
    serde_json::from_value(serde_json::Value::Object(fields)).context("invalid settings form")
}

fn decode_form_component(raw: &str) -> anyhow::Result<String> {
    let mut bytes = Vec::with_capacity(raw.len());
    let mut iter = raw.bytes();
    while let Some(byte) = iter.next() {
        match byte {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hex = [
                    iter.next().ok_or_else(|| anyhow!("truncated escape in form"))?,
                    iter.next().ok_or_else(|| anyhow!("truncated escape in form"))?,
                ];
                let hex = core::str::from_utf8(&hex)?;
                bytes.push(u8::from_str_radix(hex, 16).context("bad escape in form")?);
            }
            _ => bytes.push(byte),
        }
    }
    Ok(String::from_utf8(bytes)?)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_html(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    status_code: u16,
    body: &str,
) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/html; charset=utf-8")],
    )?
    .write_all(body.as_bytes())?;
    Ok(())
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
}

fn static_ip_netif(network: &NetworkConfig) -> anyhow::Result<Option<NetifConfiguration>> {
    if !network.use_static_ip {
        return Ok(None);
    }
    let (Some(ip), Some(gateway), Some(subnet)) =
        (network.static_ip, network.gateway, network.subnet)
    else {
        return Err(anyhow!("static ip needs address, gateway and subnet"));
    };

    let mask = Mask::try_from(Ipv4Addr::from(subnet))
        .map_err(|_| anyhow!("invalid subnet mask {}", Ipv4Addr::from(subnet)))?;
    let settings = IpClientSettings {
        ip: Ipv4Addr::from(ip),
        subnet: Subnet {
            gateway: Ipv4Addr::from(gateway),
            mask,
        },
        dns: network.dns.map(Ipv4Addr::from),
        secondary_dns: None,
    };

    let mut conf = NetifConfiguration::wifi_default_client();
    conf.key = "WIFI_STA_STATIC"
        .try_into()
        .map_err(|_| anyhow!("netif key too long"))?;
    conf.ip_configuration = Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
        settings,
    )));
    Ok(Some(conf))
}

impl OtaRejection {
    fn describe(&self) -> (u16, String) {
        match self {
            Self::Invalid(reason) => (400, (*reason).to_string()),
            Self::WrongPassword => (403, "invalid OTA password".to_string()),
            Self::Busy => (409, "an update is already running".to_string()),
            Self::Spawn(err) => (500, format!("failed to start update: {err}")),
        }
    }
}

impl OtaRequest {
    /// Returns the expected digest, lowercased, when one was supplied.
    fn check(&self) -> Result<Option<String>, OtaRejection> {
        let url = self.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(OtaRejection::Invalid("url must be http:// or https://"));
        }
        match self.sha256.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(hex) if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
                Ok(Some(hex.to_ascii_lowercase()))
            }
            Some(_) => Err(OtaRejection::Invalid("sha256 must be 64 hex characters")),
        }
    }
}

/// Validates the request and flashes the image on a background thread. A
/// verified image sets `reboot_pending`, which ends the monitor loop.
fn start_ota(state: &SharedState, request: OtaRequest) -> Result<(), OtaRejection> {
    let expected_sha = request.check()?;
    let password = lock(&state.runtime).network.ota_password.clone();
    if !password.is_empty() && request.password.as_deref() != Some(password.as_str()) {
        return Err(OtaRejection::WrongPassword);
    }

    {
        let mut ota = lock(&state.ota);
        if ota.in_progress {
            return Err(OtaRejection::Busy);
        }
        *ota = OtaProgress {
            in_progress: true,
            ..OtaProgress::default()
        };
    }

    let progress = state.ota.clone();
    let url = request.url.trim().to_string();
    thread::Builder::new()
        .name("ota".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            let result = flash_image(&progress, &url, expected_sha.as_deref());
            let mut ota = lock(&progress);
            ota.in_progress = false;
            match result {
                Ok(digest) => {
                    info!("update flashed ({} bytes, sha256 {digest})", ota.bytes_written);
                    ota.last_sha256 = Some(digest);
                    ota.reboot_pending = true;
                }
                Err(err) => {
                    warn!("update failed: {err:#}");
                    ota.last_error = Some(format!("{err:#}"));
                }
            }
        })
        .map(|_| ())
        .map_err(|err| {
            let mut ota = lock(&state.ota);
            ota.in_progress = false;
            ota.last_error = Some(err.to_string());
            OtaRejection::Spawn(err.to_string())
        })
}

/// Streams the image into the next OTA slot and returns its SHA-256.
fn flash_image(
    progress: &Mutex<OtaProgress>,
    url: &str,
    expected_sha: Option<&str>,
) -> anyhow::Result<String> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let mut response = client
        .request(Method::Get, url, &[])?
        .submit()
        .map_err(|err| anyhow!("{err:?}"))?;
    if !(200..300).contains(&response.status()) {
        return Err(anyhow!("download failed with HTTP {}", response.status()));
    }
    lock(progress).total_bytes = response
        .header("Content-Length")
        .and_then(|value| value.parse().ok());

    let mut ota = EspOta::new().map_err(|err| anyhow!("ota unavailable: {err:?}"))?;
    let mut slot = ota
        .initiate_update()
        .map_err(|err| anyhow!("cannot start update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];
    loop {
        let read = response.read(&mut chunk).map_err(|err| anyhow!("{err:?}"))?;
        if read == 0 {
            break;
        }
        slot.write(&chunk[..read])
            .map_err(|err| anyhow!("flash write failed: {err:?}"))?;
        hasher.update(&chunk[..read]);
        written += read as u64;
        lock(progress).bytes_written = written;
    }
    if written == 0 {
        return Err(anyhow!("empty image"));
    }

    let digest: String = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    if let Some(expected) = expected_sha {
        if digest != expected {
            return Err(anyhow!("sha256 mismatch: expected {expected}, got {digest}"));
        }
    }

    slot.complete()
        .map_err(|err| anyhow!("cannot finalize image: {err:?}"))?;
    Ok(digest)
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

/// A handler that panicked mid-update leaves plain data behind; keep serving it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn start_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1_000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    // ESP_ERR_INVALID_STATE: already initialized or subscribed.
    for (what, rc) in [
        ("esp_task_wdt_init", unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) }),
        ("esp_task_wdt_add", unsafe {
            esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut())
        }),
    ] {
        if rc != esp_idf_svc::sys::ESP_OK && rc != esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
            return Err(anyhow!("{what} failed with code {rc}"));
        }
    }
    Ok(())
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

impl WifiWatch {
    fn restart_due(&mut self, network_up: bool) -> bool {
        if network_up {
            self.down_since = None;
            return false;
        }
        let since = *self.down_since.get_or_insert_with(Instant::now);
        since.elapsed() >= Duration::from_millis(WIFI_RESTART_GRACE_MS)
    }
}

fn restart() {
    unsafe { esp_idf_svc::sys::esp_restart() };
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
