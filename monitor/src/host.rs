use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    runtime::{Handle, Runtime},
    sync::{mpsc, oneshot, watch},
};
use tracing::{info, warn};

use watertank_common::{
    BrokerClient, BrokerSettings, BrokerStatus, DistanceSensor, EchoTiming, NetworkConfig,
    NetworkLink, RawSample, RuntimeConfig, SettingsOutcome, SettingsUpdate, StatusSnapshot,
    TankGeometry, TankMonitor,
};

use crate::web::{settings_page, status_page, SettingsResponse};

const LOOP_DELAY: Duration = Duration::from_millis(10);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const MQTT_CHANNEL_CAPACITY: usize = 32;
const SETTINGS_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// One simulated fill/drain cycle, in samples.
const SIM_PERIOD_SAMPLES: u64 = 600;
const SIM_NO_ECHO_EVERY: u64 = 97;

#[derive(Clone)]
struct AppState {
    snapshot: watch::Receiver<StatusSnapshot>,
    runtime: watch::Receiver<RuntimeConfig>,
    settings: mpsc::Sender<SettingsRequest>,
}

struct SettingsRequest {
    update: SettingsUpdate,
    reply: oneshot::Sender<SettingsOutcome>,
}

struct AppStore {
    runtime_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct OtaStatusResponse {
    supported: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
    #[serde(rename = "lastError")]
    last_error: Option<String>,
}

/// Tank that drains and refills over [`SIM_PERIOD_SAMPLES`] with a little
/// jitter and a periodic lost echo.
struct SimulatedSensor {
    tick: u64,
    tank: TankGeometry,
    timing: EchoTiming,
}

#[derive(Default)]
struct HostNetwork {
    address: Option<Ipv4Addr>,
}

/// rumqttc client whose event loop runs as a task on the http runtime. The
/// task mirrors session health into [`SessionFlags`] and exits on the first
/// error; reconnecting is left to the connectivity manager.
struct RumqttBroker {
    runtime: Handle,
    host: String,
    port: u16,
    keep_alive: Duration,
    session: Option<MqttSession>,
    status: BrokerStatus,
}

struct MqttSession {
    client: AsyncClient,
    flags: Arc<SessionFlags>,
}

#[derive(Default)]
struct SessionFlags {
    connected: AtomicBool,
    closing: AtomicBool,
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime.network);

    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
    let (runtime_tx, runtime_rx) = watch::channel(runtime.clone());
    let (settings_tx, mut settings_rx) = mpsc::channel(8);
    let shutdown = Arc::new(AtomicBool::new(false));

    let port = std::env::var("MONITOR_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let app_state = AppState {
        snapshot: snapshot_rx,
        runtime: runtime_rx,
        settings: settings_tx,
    };
    let http_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to build http runtime")?;
    let broker = RumqttBroker::new(http_runtime.handle().clone());
    let _server = spawn_http_server(http_runtime, app_state, port, shutdown.clone())?;

    let sensor = SimulatedSensor::new(&runtime);
    let mut monitor = TankMonitor::new(runtime, sensor, HostNetwork::default(), broker);
    monitor.boot(|ms| thread::sleep(Duration::from_millis(ms)));
    snapshot_tx.send_replace(monitor.snapshot());

    while !shutdown.load(Ordering::Relaxed) {
        while let Ok(request) = settings_rx.try_recv() {
            let outcome = monitor.apply_settings(&request.update);
            if outcome.changed() {
                let runtime = monitor.runtime_config();
                if let Err(err) = store.save_runtime_config(&runtime) {
                    warn!("failed to persist settings: {err:#}");
                }
                runtime_tx.send_replace(runtime);
                snapshot_tx.send_replace(monitor.snapshot());
            }
            let _ = request.reply.send(outcome);
        }

        if monitor.service(monotonic_ms()).is_some() {
            snapshot_tx.send_replace(monitor.snapshot());
        }
        thread::sleep(LOOP_DELAY);
    }

    info!("shutdown requested; stopping monitor loop");
    Ok(())
}

/// Runs the web surface on its own tokio runtime so the monitor loop stays
/// synchronous.
fn spawn_http_server(
    runtime: Runtime,
    app_state: AppState,
    port: u16,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = runtime
        .block_on(TcpListener::bind(addr))
        .with_context(|| format!("failed to bind monitor server at {addr}"))?;
    info!("monitor listening on http://{addr}");

    let app = Router::new()
        .route("/", get(handle_get_index))
        .route("/data", get(handle_get_data))
        .route(
            "/settings",
            get(handle_get_settings).post(handle_post_settings),
        )
        .route("/api/settings", post(handle_post_settings_json))
        .route("/api/ota/status", get(handle_get_ota_status))
        .route("/api/ota/apply", post(handle_post_ota_apply))
        .with_state(app_state);

    thread::Builder::new()
        .name("http".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        shutdown.store(true, Ordering::Relaxed);
                    }
                });
                if let Err(err) = axum::serve(listener, app).await {
                    warn!("monitor http server stopped: {err}");
                }
            });
        })
        .context("failed to spawn http thread")
}

async fn handle_get_index(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.snapshot.borrow().clone();
    Html(status_page(&snapshot))
}

async fn handle_get_data(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.snapshot.borrow().clone();
    Json(snapshot)
}

async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    let runtime = state.runtime.borrow().clone();
    Html(settings_page(&runtime, None))
}

async fn handle_post_settings(
    State(state): State<AppState>,
    Form(update): Form<SettingsUpdate>,
) -> Response {
    match submit_settings(&state, update).await {
        Ok(outcome) => {
            let runtime = state.runtime.borrow().clone();
            Html(settings_page(&runtime, Some(&outcome))).into_response()
        }
        Err(response) => response,
    }
}

async fn handle_post_settings_json(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Response {
    match submit_settings(&state, update).await {
        Ok(outcome) => Json(SettingsResponse::from(&outcome)).into_response(),
        Err(response) => response,
    }
}

async fn submit_settings(
    state: &AppState,
    update: SettingsUpdate,
) -> Result<SettingsOutcome, Response> {
    let (reply, outcome) = oneshot::channel();
    state
        .settings
        .send(SettingsRequest { update, reply })
        .await
        .map_err(|_| {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Monitor loop is not running")
        })?;

    match tokio::time::timeout(SETTINGS_REPLY_TIMEOUT, outcome).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(_)) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Monitor loop dropped the settings request",
        )),
        Err(_) => Err(error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "Timed out waiting for the monitor loop",
        )),
    }
}

async fn handle_get_ota_status() -> impl IntoResponse {
    Json(OtaStatusResponse {
        supported: false,
        in_progress: false,
        last_error: Some("OTA apply is only available in ESP32 builds".to_string()),
    })
}

async fn handle_post_ota_apply() -> impl IntoResponse {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "OTA apply is only available in ESP32 builds",
    )
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("WATERTANK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.watertank"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match std::fs::read(&self.runtime_path) {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw).with_context(|| {
                format!("invalid runtime config at {}", self.runtime_path.display())
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        if let Some(parent) = self.runtime_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        std::fs::write(&self.runtime_path, payload)
            .with_context(|| format!("failed to write {}", self.runtime_path.display()))?;
        Ok(())
    }
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

impl SimulatedSensor {
    fn new(runtime: &RuntimeConfig) -> Self {
        Self {
            tick: 0,
            tank: runtime.tank,
            timing: EchoTiming::new(runtime.monitor.max_distance_cm),
        }
    }
}

impl DistanceSensor for SimulatedSensor {
    fn sample(&mut self) -> RawSample {
        self.tick = self.tick.wrapping_add(1);
        if self.tick % SIM_NO_ECHO_EVERY == 0 {
            return self.timing.from_echo_us(None);
        }

        // Triangle wave between 10% and 90% full.
        let phase = self.tick % SIM_PERIOD_SAMPLES;
        let half = SIM_PERIOD_SAMPLES / 2;
        let rising = if phase < half { phase } else { SIM_PERIOD_SAMPLES - phase };
        let fill = 0.1 + 0.8 * (rising as f32 / half as f32);
        let jitter = (self.tick % 3) as f32 - 1.0;

        let distance_cm =
            self.tank.sensor_offset + self.tank.height * (1.0 - fill) + jitter;
        let echo_us = (distance_cm.max(0.0) * watertank_common::US_ROUNDTRIP_CM as f32) as u32;
        self.timing.from_echo_us(Some(echo_us))
    }
}

impl NetworkLink for HostNetwork {
    fn begin(&mut self, _config: &NetworkConfig) -> bool {
        self.address = detect_local_address();
        true
    }

    fn is_up(&self) -> bool {
        true
    }

    fn rssi(&self) -> Option<i8> {
        None
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.address
    }
}

/// Address of the interface that routes outward. UDP connect sends nothing.
fn detect_local_address() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

impl RumqttBroker {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            host: String::new(),
            port: 1883,
            keep_alive: MQTT_KEEP_ALIVE,
            session: None,
            status: BrokerStatus::Disconnected,
        }
    }

    fn drop_session(&mut self, status: BrokerStatus) {
        if let Some(session) = self.session.take() {
            session.flags.closing.store(true, Ordering::Relaxed);
            session.flags.connected.store(false, Ordering::Relaxed);
            let _ = session.client.try_disconnect();
        }
        self.status = status;
    }
}

impl BrokerClient for RumqttBroker {
    fn configure(&mut self, settings: &BrokerSettings) {
        self.host = settings.host.clone();
        self.port = settings.port;
    }

    fn connect(&mut self, client_id: &str, user: &str, pass: &str) -> bool {
        self.drop_session(BrokerStatus::Disconnected);

        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        if !user.is_empty() {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);
        let flags = Arc::new(SessionFlags::default());
        let (handshake_tx, handshake_rx) = std_mpsc::sync_channel(1);
        self.runtime
            .spawn(drive_session(eventloop, flags.clone(), handshake_tx));

        self.status = handshake_rx
            .recv_timeout(MQTT_CONNECT_TIMEOUT)
            .unwrap_or(BrokerStatus::ConnectionTimeout);
        if self.status != BrokerStatus::Connected {
            flags.closing.store(true, Ordering::Relaxed);
            return false;
        }

        self.session = Some(MqttSession { client, flags });
        true
    }

    fn connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.flags.connected.load(Ordering::Relaxed))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        match session
            .client
            .try_publish(topic, QoS::AtMostOnce, retain, payload.to_vec())
        {
            Ok(()) => true,
            Err(err) => {
                warn!("mqtt publish to {topic} failed: {err}");
                false
            }
        }
    }

    fn pump(&mut self) {
        if self.session.is_some() && !self.connected() {
            self.drop_session(BrokerStatus::ConnectionLost);
        }
    }

    fn state(&self) -> BrokerStatus {
        match &self.session {
            Some(session) if !session.flags.connected.load(Ordering::Relaxed) => {
                BrokerStatus::ConnectionLost
            }
            _ => self.status,
        }
    }

    fn disconnect(&mut self) {
        self.drop_session(BrokerStatus::Disconnected);
    }
}

/// Polls one session until it ends. The handshake result goes to `connect`;
/// any later error or broker DISCONNECT clears `connected`.
async fn drive_session(
    mut eventloop: EventLoop,
    flags: Arc<SessionFlags>,
    handshake: std_mpsc::SyncSender<BrokerStatus>,
) {
    let mut handshake = Some(handshake);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let status = status_from_code(ack.code);
                let accepted = status == BrokerStatus::Connected;
                flags.connected.store(accepted, Ordering::Relaxed);
                if let Some(tx) = handshake.take() {
                    let _ = tx.send(status);
                }
                if !accepted {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                flags.connected.store(false, Ordering::Relaxed);
                if !flags.closing.load(Ordering::Relaxed) {
                    warn!("mqtt broker closed the session");
                }
                return;
            }
            Ok(_) => {}
            Err(err) => {
                flags.connected.store(false, Ordering::Relaxed);
                match handshake.take() {
                    Some(tx) => {
                        let _ = tx.send(status_from_error(&err));
                    }
                    None if !flags.closing.load(Ordering::Relaxed) => {
                        warn!("mqtt connection error: {err}");
                    }
                    None => {}
                }
                return;
            }
        }
    }
}

fn status_from_code(code: ConnectReturnCode) -> BrokerStatus {
    match code {
        ConnectReturnCode::Success => BrokerStatus::Connected,
        ConnectReturnCode::RefusedProtocolVersion => BrokerStatus::BadProtocol,
        ConnectReturnCode::BadClientId => BrokerStatus::BadClientId,
        ConnectReturnCode::ServiceUnavailable => BrokerStatus::Unavailable,
        ConnectReturnCode::BadUserNamePassword => BrokerStatus::BadCredentials,
        ConnectReturnCode::NotAuthorized => BrokerStatus::Unauthorized,
    }
}

fn status_from_error(err: &ConnectionError) -> BrokerStatus {
    match err {
        ConnectionError::ConnectionRefused(code) => status_from_code(*code),
        ConnectionError::NetworkTimeout => BrokerStatus::ConnectionTimeout,
        _ => BrokerStatus::ConnectFailed,
    }
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

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener as StdTcpListener, TcpStream},
    };

    use super::*;

    const CONNECT: u8 = 0x10;
    const PINGREQ: u8 = 0xc0;

    fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let mut header = [0_u8; 1];
        stream.read_exact(&mut header)?;

        let mut remaining = 0_usize;
        let mut shift = 0;
        loop {
            let mut byte = [0_u8; 1];
            stream.read_exact(&mut byte)?;
            remaining |= usize::from(byte[0] & 0x7f) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0; remaining];
        stream.read_exact(&mut body)?;
        Ok((header[0] & 0xf0, body))
    }

    fn accept_session(listener: &StdTcpListener, return_code: u8) -> TcpStream {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (kind, _) = read_packet(&mut stream).unwrap();
        assert_eq!(kind, CONNECT);
        stream.write_all(&[0x20, 0x02, 0x00, return_code]).unwrap();
        stream
    }

    fn test_runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn loopback_broker(runtime: &Runtime, port: u16) -> RumqttBroker {
        let mut broker = RumqttBroker::new(runtime.handle().clone());
        broker.keep_alive = Duration::from_secs(1);
        broker.configure(&BrokerSettings {
            host: "127.0.0.1".to_string(),
            port,
            user: String::new(),
            pass: String::new(),
        });
        broker
    }

    #[test]
    fn idle_session_sends_keep_alive_pings() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let mut stream = accept_session(&listener, 0);
            let (kind, _) = read_packet(&mut stream).unwrap();
            stream.write_all(&[0xd0, 0x00]).unwrap();
            (kind, stream)
        });

        let runtime = test_runtime();
        let mut broker = loopback_broker(&runtime, port);
        assert!(broker.connect("water-tank", "", ""));

        let (kind, _stream) = server.join().unwrap();
        assert_eq!(kind, PINGREQ);
        assert!(broker.connected());
        assert_eq!(broker.state(), BrokerStatus::Connected);
    }

    #[test]
    fn broker_side_close_ends_session() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let stream = accept_session(&listener, 0);
            thread::sleep(Duration::from_millis(200));
            drop(stream);
        });

        let runtime = test_runtime();
        let mut broker = loopback_broker(&runtime, port);
        assert!(broker.connect("water-tank", "", ""));
        server.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while broker.connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!broker.connected());
        assert_eq!(broker.state(), BrokerStatus::ConnectionLost);

        broker.pump();
        assert!(broker.session.is_none());
        assert_eq!(broker.state(), BrokerStatus::ConnectionLost);
    }

    #[test]
    fn refused_connack_maps_to_status() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || accept_session(&listener, 5));

        let runtime = test_runtime();
        let mut broker = loopback_broker(&runtime, port);
        assert!(!broker.connect("water-tank", "", ""));
        let _stream = server.join().unwrap();

        assert!(!broker.connected());
        assert_eq!(broker.state(), BrokerStatus::Unauthorized);
    }
}
