use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::config::{NetworkConfig, PublishFlags, TankGeometry};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    fn as_f32(&self) -> Option<f32> {
        let value = match self {
            Self::Number(value) => *value as f32,
            Self::Text(text) => text.trim().parse::<f32>().ok()?,
            Self::Flag(_) => return None,
        };
        value.is_finite().then_some(value)
    }

    fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(value) => Some(*value),
            Self::Number(value) if *value == 1.0 => Some(true),
            Self::Number(value) if *value == 0.0 => Some(false),
            Self::Number(_) => None,
            Self::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "on" | "true" | "1" | "yes" => Some(true),
                "off" | "false" | "0" | "no" => Some(false),
                _ => None,
            },
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text.trim().to_string()),
            Self::Number(value) => Some(value.to_string()),
            Self::Flag(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(value) => write!(f, "{value}"),
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingsError {
    #[error("{field}: `{value}` is not a number")]
    NotANumber { field: &'static str, value: String },
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
    #[error("{field} cannot be negative")]
    Negative { field: &'static str },
    #[error("{field}: `{value}` is not on/off")]
    NotAFlag { field: &'static str, value: String },
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("{field} must be between 1 and 65535")]
    PortOutOfRange { field: &'static str },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub mqtt_server: Option<FieldValue>,
    pub mqtt_port: Option<FieldValue>,
    pub mqtt_user: Option<FieldValue>,
    pub mqtt_password: Option<FieldValue>,
    pub tank_height: Option<FieldValue>,
    pub tank_length: Option<FieldValue>,
    pub tank_width: Option<FieldValue>,
    pub sensor_offset: Option<FieldValue>,
    pub publish_distance: Option<FieldValue>,
    pub publish_level: Option<FieldValue>,
    pub publish_volume: Option<FieldValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsOutcome {
    pub tank_changed: bool,
    pub publish_changed: bool,
    pub broker_changed: bool,
    pub rejected: Vec<SettingsError>,
}

impl SettingsOutcome {
    pub fn changed(&self) -> bool {
        self.tank_changed || self.publish_changed || self.broker_changed
    }
}

#[derive(Clone, Copy)]
enum Bound {
    Positive,
    NonNegative,
}

impl SettingsUpdate {
    pub fn apply(
        &self,
        tank: &mut TankGeometry,
        publish: &mut PublishFlags,
        network: &mut NetworkConfig,
    ) -> SettingsOutcome {
        let mut outcome = SettingsOutcome::default();
        let rejected = &mut outcome.rejected;

        let before = *tank;
        set_dimension(&self.tank_height, "tank_height", Bound::Positive, &mut tank.height, rejected);
        set_dimension(&self.tank_length, "tank_length", Bound::Positive, &mut tank.length, rejected);
        set_dimension(&self.tank_width, "tank_width", Bound::Positive, &mut tank.width, rejected);
        set_dimension(
            &self.sensor_offset,
            "sensor_offset",
            Bound::NonNegative,
            &mut tank.sensor_offset,
            rejected,
        );
        outcome.tank_changed = before != *tank;

        let before = *publish;
        set_flag(&self.publish_distance, "publish_distance", &mut publish.distance, rejected);
        set_flag(&self.publish_level, "publish_level", &mut publish.level, rejected);
        set_flag(&self.publish_volume, "publish_volume", &mut publish.volume, rejected);
        outcome.publish_changed = before != *publish;

        let before = network.broker();
        if let Some(value) = &self.mqtt_server {
            match value.as_text() {
                Some(host) if !host.is_empty() => network.mqtt_host = host,
                _ => rejected.push(SettingsError::Empty { field: "mqtt_server" }),
            }
        }
        if let Some(value) = &self.mqtt_port {
            match value.as_f32() {
                Some(port) if port >= 1.0 && port <= 65_535.0 && port.fract() == 0.0 => {
                    network.mqtt_port = port as u16;
                }
                Some(_) => rejected.push(SettingsError::PortOutOfRange { field: "mqtt_port" }),
                None => rejected.push(SettingsError::NotANumber {
                    field: "mqtt_port",
                    value: value.to_string(),
                }),
            }
        }
        if let Some(user) = self.mqtt_user.as_ref().and_then(FieldValue::as_text) {
            network.mqtt_user = user;
        }
        // Blank password keeps the stored one.
        if let Some(pass) = self.mqtt_password.as_ref().and_then(FieldValue::as_text) {
            if !pass.is_empty() {
                network.mqtt_pass = pass;
            }
        }
        outcome.broker_changed = before != network.broker();

        outcome
    }
}

fn set_dimension(
    value: &Option<FieldValue>,
    field: &'static str,
    bound: Bound,
    target: &mut f32,
    rejected: &mut Vec<SettingsError>,
) {
    let Some(value) = value else {
        return;
    };
    let Some(parsed) = value.as_f32() else {
        rejected.push(SettingsError::NotANumber {
            field,
            value: value.to_string(),
        });
        return;
    };

    match bound {
        Bound::Positive if parsed <= 0.0 => rejected.push(SettingsError::NotPositive { field }),
        Bound::NonNegative if parsed < 0.0 => rejected.push(SettingsError::Negative { field }),
        _ => *target = parsed,
    }
}

fn set_flag(
    value: &Option<FieldValue>,
    field: &'static str,
    target: &mut bool,
    rejected: &mut Vec<SettingsError>,
) {
    let Some(value) = value else {
        return;
    };
    match value.as_flag() {
        Some(flag) => *target = flag,
        None => rejected.push(SettingsError::NotAFlag {
            field,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn text(value: &str) -> Option<FieldValue> {
        Some(FieldValue::Text(value.to_string()))
    }

    fn apply(
        update: &SettingsUpdate,
    ) -> (TankGeometry, PublishFlags, NetworkConfig, SettingsOutcome) {
        let mut tank = TankGeometry::default();
        let mut publish = PublishFlags::default();
        let mut network = NetworkConfig::default();
        let outcome = update.apply(&mut tank, &mut publish, &mut network);
        (tank, publish, network, outcome)
    }

    #[test]
    fn empty_update_changes_nothing() {
        let (tank, publish, network, outcome) = apply(&SettingsUpdate::default());

        assert_eq!(tank, TankGeometry::default());
        assert_eq!(publish, PublishFlags::default());
        assert_eq!(network, NetworkConfig::default());
        assert!(!outcome.changed());
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn partial_geometry_update() {
        let update = SettingsUpdate {
            tank_height: text("120"),
            sensor_offset: Some(FieldValue::Number(15.0)),
            ..SettingsUpdate::default()
        };
        let (tank, _, _, outcome) = apply(&update);

        assert_eq!(
            tank,
            TankGeometry {
                height: 120.0,
                sensor_offset: 15.0,
                ..TankGeometry::default()
            }
        );
        assert!(outcome.tank_changed);
        assert!(!outcome.broker_changed);
    }

    #[test]
    fn malformed_fields_are_left_unchanged() {
        let update = SettingsUpdate {
            tank_height: text("tall"),
            tank_length: text("0"),
            tank_width: text("-3"),
            sensor_offset: text("-1"),
            mqtt_port: text("70000"),
            mqtt_server: text("   "),
            publish_volume: text("maybe"),
            ..SettingsUpdate::default()
        };
        let (tank, publish, network, outcome) = apply(&update);

        assert_eq!(tank, TankGeometry::default());
        assert_eq!(publish, PublishFlags::default());
        assert_eq!(network, NetworkConfig::default());
        assert_eq!(
            outcome.rejected,
            vec![
                SettingsError::NotANumber {
                    field: "tank_height",
                    value: "tall".to_string()
                },
                SettingsError::NotPositive {
                    field: "tank_length"
                },
                SettingsError::NotPositive { field: "tank_width" },
                SettingsError::Negative {
                    field: "sensor_offset"
                },
                SettingsError::NotAFlag {
                    field: "publish_volume",
                    value: "maybe".to_string()
                },
                SettingsError::Empty {
                    field: "mqtt_server"
                },
                SettingsError::PortOutOfRange { field: "mqtt_port" },
            ]
        );
    }

    #[test]
    fn flags_accept_form_and_json_spellings() {
        let update = SettingsUpdate {
            publish_distance: text("off"),
            publish_level: Some(FieldValue::Flag(false)),
            publish_volume: text("on"),
            ..SettingsUpdate::default()
        };
        let (_, publish, _, outcome) = apply(&update);

        assert_eq!(
            publish,
            PublishFlags {
                distance: false,
                level: false,
                volume: true,
            }
        );
        assert!(outcome.publish_changed);
    }

    #[test]
    fn blank_password_keeps_stored_secret() {
        let mut network = NetworkConfig {
            mqtt_pass: "secret".to_string(),
            ..NetworkConfig::default()
        };
        let update = SettingsUpdate {
            mqtt_server: text("broker.lan"),
            mqtt_user: text("tank"),
            mqtt_password: text(""),
            ..SettingsUpdate::default()
        };
        let outcome = update.apply(
            &mut TankGeometry::default(),
            &mut PublishFlags::default(),
            &mut network,
        );

        assert!(outcome.broker_changed);
        assert_eq!(network.mqtt_host, "broker.lan");
        assert_eq!(network.mqtt_user, "tank");
        assert_eq!(network.mqtt_pass, "secret");
    }

    #[test]
    fn deserializes_from_json_with_mixed_types() {
        let update: SettingsUpdate = serde_json::from_str(
            r#"{"tank_height":"150","tank_width":80,"publish_level":false,"extra":1}"#,
        )
        .unwrap();

        assert_eq!(update.tank_height, text("150"));
        assert_eq!(update.tank_width, Some(FieldValue::Number(80.0)));
        assert_eq!(update.publish_level, Some(FieldValue::Flag(false)));
        assert_eq!(update.tank_length, None);
    }

    #[test]
    fn error_messages_name_the_field() {
        let err = SettingsError::NotANumber {
            field: "tank_height",
            value: "tall".to_string(),
        };
        assert_eq!(err.to_string(), "tank_height: `tall` is not a number");
    }
}
