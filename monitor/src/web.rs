use std::fmt::Write as _;

use serde::Serialize;

use watertank_common::{RuntimeConfig, SettingsOutcome, StatusSnapshot};

const STYLE_CSS: &str = r#"
    body{font-family:Arial,sans-serif;max-width:760px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input,select{width:100%;padding:.5rem;box-sizing:border-box}
    .row{display:flex;gap:1rem}.row>div{flex:1}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    .big{font-size:2rem;margin:.2rem 0}
    button{padding:.55rem .9rem;margin-top:.8rem}
    p{margin:.35rem 0}
"#;

const STATUS_SCRIPT: &str = r#"
    const q=(id)=>document.getElementById(id);
    async function refresh(){
      try{
        const r=await fetch('/data');const d=await r.json();
        q('distance').textContent=d.distance.toFixed(1);
        q('waterLevel').textContent=d.waterLevel.toFixed(2);
        q('volume').textContent=String(d.volume);
        q('wifiStrength').textContent=d.wifiStrength==null?'--':d.wifiStrength+' dBm';
        q('mqttStatus').textContent=d.mqttStatus;
        q('ipAddress').textContent=d.ipAddress||'--';
        q('noEcho').textContent=d.noEcho?'no echo':'ok';
      }catch(_){}
    }
    setInterval(refresh,2000);
"#;

/// JSON reply for a settings update.
#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub changed: bool,
    #[serde(rename = "brokerChanged")]
    pub broker_changed: bool,
    pub rejected: Vec<String>,
}

impl From<&SettingsOutcome> for SettingsResponse {
    fn from(outcome: &SettingsOutcome) -> Self {
        Self {
            changed: outcome.changed(),
            broker_changed: outcome.broker_changed,
            rejected: outcome.rejected.iter().map(ToString::to_string).collect(),
        }
    }
}

pub fn status_page(snapshot: &StatusSnapshot) -> String {
    let wifi = snapshot
        .wifi_strength
        .map(|rssi| format!("{rssi} dBm"))
        .unwrap_or_else(|| "--".to_string());
    let ip = snapshot.ip_address.as_deref().unwrap_or("--");
    let echo = if snapshot.no_echo { "no echo" } else { "ok" };

    format!(
        r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Water Tank Monitor</title>
  <style>{STYLE_CSS}</style>
</head>
<body>
  <h1>Water Tank Monitor</h1>
  <div class="card">
    <div class="row">
      <div><p class="muted">Water level (cm)</p><p class="big" id="waterLevel">{level:.2}</p></div>
      <div><p class="muted">Volume (L)</p><p class="big" id="volume">{volume}</p></div>
    </div>
    <p>Distance: <span id="distance">{distance:.1}</span> cm (sensor <span id="noEcho">{echo}</span>)</p>
    <p class="muted">Capacity {capacity} L, reported up to {ceiling} L</p>
  </div>
  <div class="card">
    <p>WiFi: <span id="wifiStrength">{wifi}</span></p>
    <p>IP address: <span id="ipAddress">{ip}</span></p>
    <p>MQTT: <span id="mqttStatus">{mqtt}</span></p>
  </div>
  <p><a href="/settings">Settings</a> | <a href="/data">/data</a></p>
  <script>{STATUS_SCRIPT}</script>
</body>
</html>
"#,
        level = snapshot.water_level,
        volume = snapshot.volume,
        distance = snapshot.distance,
        capacity = snapshot.capacity_liters,
        ceiling = snapshot.capacity_ceiling_liters,
        ip = escape_html(ip),
        mqtt = escape_html(&snapshot.mqtt_status),
    )
}

pub fn settings_page(runtime: &RuntimeConfig, outcome: Option<&SettingsOutcome>) -> String {
    let network = &runtime.network;
    let tank = &runtime.tank;
    let publish = &runtime.publish;

    let mut notice = String::new();
    if let Some(outcome) = outcome {
        if outcome.rejected.is_empty() {
            notice.push_str(r#"<p class="ok">Settings saved.</p>"#);
        } else {
            notice.push_str(r#"<div class="err"><p>Some fields were not applied:</p><ul>"#);
            for rejected in &outcome.rejected {
                let _ = write!(notice, "<li>{}</li>", escape_html(&rejected.to_string()));
            }
            notice.push_str("</ul></div>");
        }
    }

    format!(
        r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Water Tank Settings</title>
  <style>{STYLE_CSS}</style>
</head>
<body>
  <h1>Settings</h1>
  {notice}
  <form method="post" action="/settings">
    <div class="card">
      <h2>MQTT</h2>
      <div class="row">
        <div><label>Server</label><input name="mqtt_server" type="text" value="{host}"></div>
        <div><label>Port</label><input name="mqtt_port" type="number" min="1" max="65535" value="{port}"></div>
      </div>
      <label>Username</label><input name="mqtt_user" type="text" value="{user}">
      <label>Password (leave blank to keep current)</label><input name="mqtt_password" type="password">
    </div>
    <div class="card">
      <h2>Tank (cm)</h2>
      <div class="row">
        <div><label>Height</label><input name="tank_height" type="number" step="0.1" value="{height}"></div>
        <div><label>Sensor offset</label><input name="sensor_offset" type="number" step="0.1" value="{offset}"></div>
      </div>
      <div class="row">
        <div><label>Length</label><input name="tank_length" type="number" step="0.1" value="{length}"></div>
        <div><label>Width</label><input name="tank_width" type="number" step="0.1" value="{width}"></div>
      </div>
    </div>
    <div class="card">
      <h2>Publish</h2>
      <div class="row">
        <div><label>Distance</label>{distance}</div>
        <div><label>Water level</label>{level}</div>
        <div><label>Volume</label>{volume}</div>
      </div>
    </div>
    <button type="submit">Save</button>
  </form>
  <p><a href="/">Back</a></p>
</body>
</html>
"#,
        host = escape_html(&network.mqtt_host),
        port = network.mqtt_port,
        user = escape_html(&network.mqtt_user),
        height = tank.height,
        offset = tank.sensor_offset,
        length = tank.length,
        width = tank.width,
        distance = flag_select("publish_distance", publish.distance),
        level = flag_select("publish_level", publish.level),
        volume = flag_select("publish_volume", publish.volume),
    )
}

fn flag_select(name: &str, enabled: bool) -> String {
    let (on, off) = if enabled {
        (" selected", "")
    } else {
        ("", " selected")
    };
    format!(
        r#"<select name="{name}"><option value="on"{on}>on</option><option value="off"{off}>off</option></select>"#
    )
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
