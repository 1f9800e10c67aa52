use std::{path::Path, path::PathBuf, time::Duration};

use rumqttc::mqttbytes::valid_topic;
use serde::Deserialize;

use crate::modbus::{transport, Unit, UnitId};
use crate::Error;

#[cfg(test)]
use pretty_assertions::assert_eq;

pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyACM0";
pub const DEFAULT_SLAVE_ID: UnitId = 1;
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_TOPIC_PREFIX: &str = "chint/dtsu666";
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const DEFAULT_DEVICE_ID: &str = "dtsu666_meter";
pub const DEFAULT_DEVICE_NAME: &str = "Chint DTSU666";

/// Everything the bridge needs, validated once at startup.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default, alias = "modbus")]
    pub device: DeviceConfig,

    pub mqtt: MqttConfig,

    /// Where to write the UNIX time of the last successful poll, for external health probes.
    #[serde(default)]
    pub heartbeat_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceConfig {
    #[serde(alias = "tty", default = "default_serial_port")]
    pub serial_port: String,

    #[serde(alias = "slave", alias = "unit", default = "default_slave_id")]
    pub slave_id: UnitId,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_modbus_data_bits")]
    pub data_bits: tokio_serial::DataBits,

    #[serde(default = "default_modbus_stop_bits")]
    pub stop_bits: tokio_serial::StopBits,

    #[serde(default = "default_modbus_parity")]
    pub parity: tokio_serial::Parity,

    /// Upper bound on a single request/response exchange
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    #[serde(default = "default_retries")]
    pub retries: u8,

    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,

    #[serde(
        with = "humantime_serde",
        default = "default_poll_interval",
        alias = "interval",
        alias = "period"
    )]
    pub poll_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial_port: default_serial_port(),
            slave_id: default_slave_id(),
            baud_rate: default_baud_rate(),
            data_bits: default_modbus_data_bits(),
            stop_bits: default_modbus_stop_bits(),
            parity: default_modbus_parity(),
            timeout: default_timeout(),
            retries: default_retries(),
            retry_delay: default_retry_delay(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MqttConfig {
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default, alias = "user")]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// State topics live at `<topic_prefix>/<field>`
    #[serde(default = "default_topic_prefix", alias = "prefix")]
    pub topic_prefix: String,

    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,

    /// Bound on connecting to and flushing messages through the broker
    #[serde(with = "humantime_serde", default = "default_mqtt_timeout")]
    pub timeout: Duration,
}

impl MqttConfig {
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            host: host.into(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            topic_prefix: default_topic_prefix(),
            discovery_prefix: default_discovery_prefix(),
            device_id: default_device_id(),
            device_name: default_device_name(),
            keep_alive: default_keep_alive(),
            timeout: default_mqtt_timeout(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Reject configurations the bridge could only fail on later. Called once at startup.
    pub fn validate(&self) -> crate::Result<()> {
        let device = &self.device;
        if !Unit(device.slave_id).is_single_device() {
            return Err(invalid(format!(
                "slave id {} is outside 1..=247",
                device.slave_id
            )));
        }
        if device.baud_rate == 0 {
            return Err(invalid("baud rate must be positive"));
        }
        if device.timeout.is_zero() {
            return Err(invalid("Modbus timeout must be positive"));
        }
        if device.poll_interval.is_zero() {
            return Err(invalid("poll interval must be positive"));
        }

        let mqtt = &self.mqtt;
        if mqtt.host.is_empty() {
            return Err(invalid("MQTT host is required"));
        }
        if mqtt.keep_alive < Duration::from_secs(1) {
            return Err(invalid("MQTT keep alive must be at least one second"));
        }
        if mqtt.username.is_none() && mqtt.password.is_some() {
            return Err(invalid("MQTT password given without a username"));
        }
        for (what, topic) in [
            ("topic prefix", &mqtt.topic_prefix),
            ("discovery prefix", &mqtt.discovery_prefix),
        ] {
            if topic.is_empty() || topic.ends_with('/') || !valid_topic(topic) {
                return Err(invalid(format!("{} {:?} is not a valid topic", what, topic)));
            }
        }
        let bad_segment_char = |c: char| matches!(c, '/' | '+' | '#') || c.is_whitespace();
        if mqtt.device_id.is_empty() || mqtt.device_id.contains(bad_segment_char) {
            return Err(invalid(format!(
                "device id {:?} must be a non-empty topic segment",
                mqtt.device_id
            )));
        }
        if mqtt.client_id.is_empty() {
            return Err(invalid("MQTT client id must not be empty"));
        }

        Ok(())
    }
}

fn invalid<S: Into<std::borrow::Cow<'static, str>>>(reason: S) -> Error {
    Error::InvalidConfig(reason.into())
}

pub(crate) fn default_serial_port() -> String {
    DEFAULT_SERIAL_PORT.to_owned()
}

pub(crate) fn default_slave_id() -> UnitId {
    DEFAULT_SLAVE_ID
}

pub(crate) fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

pub(crate) fn default_modbus_data_bits() -> tokio_serial::DataBits {
    tokio_serial::DataBits::Eight
}

pub(crate) fn default_modbus_stop_bits() -> tokio_serial::StopBits {
    tokio_serial::StopBits::One
}

pub(crate) fn default_modbus_parity() -> tokio_serial::Parity {
    tokio_serial::Parity::None
}

pub(crate) fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

pub(crate) fn default_retries() -> u8 {
    transport::DEFAULT_RETRIES
}

pub(crate) fn default_retry_delay() -> Duration {
    transport::DEFAULT_RETRY_DELAY
}

pub(crate) fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

pub(crate) fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

pub(crate) fn default_client_id() -> String {
    env!("CARGO_PKG_NAME").to_owned()
}

pub(crate) fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_owned()
}

pub(crate) fn default_discovery_prefix() -> String {
    DEFAULT_DISCOVERY_PREFIX.to_owned()
}

pub(crate) fn default_device_id() -> String {
    DEFAULT_DEVICE_ID.to_owned()
}

pub(crate) fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_owned()
}

pub(crate) fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

pub(crate) fn default_mqtt_timeout() -> Duration {
    Duration::from_secs(5)
}

#[test]
fn parse_minimal_config() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "mqtt": { "host": "192.168.10.63" }
    }))
    .unwrap();

    use tokio_serial::*;
    assert!(matches!(
        config.device,
        DeviceConfig {
            ref serial_port,
            slave_id: 1,
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            retries: 3,
            ..
        } if serial_port == "/dev/ttyACM0"
    ));
    assert_eq!(config.device.poll_interval, Duration::from_secs(5));
    assert_eq!(config.mqtt.port, 1883);
    assert_eq!(config.mqtt.topic_prefix, "chint/dtsu666");
    assert_eq!(config.mqtt.device_id, "dtsu666_meter");
    assert!(config.heartbeat_file.is_none());
    config.validate().unwrap();
}

#[test]
fn parse_complete_config() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "modbus": {
            "tty": "/dev/ttyUSB0",
            "slave": 3,
            "baud_rate": 19200,
            "data_bits": "Seven",
            "stop_bits": "Two",
            "parity": "Even",
            "timeout": "500ms",
            "retries": 1,
            "retry_delay": "250ms",
            "interval": "10s",
        },
        "mqtt": {
            "host": "broker.local",
            "port": 1882,
            "user": "user1",
            "password": "secret",
            "prefix": "meters/garage",
            "device_id": "garage_meter",
            "device_name": "Garage meter",
            "keep_alive": "30s",
        },
        "heartbeat_file": "/tmp/dtsu666.heartbeat",
    }))
    .unwrap();

    use tokio_serial::*;
    assert!(matches!(
        config.device,
        DeviceConfig {
            ref serial_port,
            slave_id: 3,
            baud_rate: 19200,
            data_bits: DataBits::Seven,
            stop_bits: StopBits::Two,
            parity: Parity::Even,
            retries: 1,
            ..
        } if serial_port == "/dev/ttyUSB0"
    ));
    assert_eq!(config.device.timeout, Duration::from_millis(500));
    assert_eq!(config.device.retry_delay, Duration::from_millis(250));
    assert_eq!(config.device.poll_interval, Duration::from_secs(10));
    assert_eq!(config.mqtt.username.as_deref(), Some("user1"));
    assert_eq!(config.mqtt.topic_prefix, "meters/garage");
    assert_eq!(config.mqtt.keep_alive, Duration::from_secs(30));
    assert_eq!(
        config.heartbeat_file.as_deref(),
        Some(Path::new("/tmp/dtsu666.heartbeat"))
    );
    config.validate().unwrap();
}

#[test]
fn missing_mqtt_section_is_rejected() {
    use serde_json::json;
    assert!(serde_json::from_value::<Config>(json!({ "device": {} })).is_err());
}

#[test]
fn validation_rejects_bad_values() {
    fn config() -> Config {
        Config {
            device: DeviceConfig::default(),
            mqtt: MqttConfig::new("localhost"),
            heartbeat_file: None,
        }
    }
    config().validate().unwrap();

    let cases: Vec<Box<dyn Fn(&mut Config)>> = vec![
        Box::new(|c: &mut Config| c.device.slave_id = 0),
        Box::new(|c: &mut Config| c.device.slave_id = 248),
        Box::new(|c: &mut Config| c.device.baud_rate = 0),
        Box::new(|c: &mut Config| c.device.timeout = Duration::ZERO),
        Box::new(|c: &mut Config| c.device.poll_interval = Duration::ZERO),
        Box::new(|c: &mut Config| c.mqtt.host.clear()),
        Box::new(|c: &mut Config| c.mqtt.password = Some("x".into())),
        Box::new(|c: &mut Config| c.mqtt.topic_prefix = "chint/#".into()),
        Box::new(|c: &mut Config| c.mqtt.topic_prefix = "chint/".into()),
        Box::new(|c: &mut Config| c.mqtt.discovery_prefix = "".into()),
        Box::new(|c: &mut Config| c.mqtt.device_id = "my meter".into()),
        Box::new(|c: &mut Config| c.mqtt.client_id.clear()),
        Box::new(|c: &mut Config| c.mqtt.keep_alive = Duration::from_millis(500)),
    ];
    for (i, mutate) in cases.iter().enumerate() {
        let mut c = config();
        mutate(&mut c);
        assert!(
            matches!(c.validate(), Err(Error::InvalidConfig(_))),
            "case {i} passed validation"
        );
    }
}

#[test]
fn validation_accepts_the_whole_unicast_range() {
    for slave_id in [1, 2, 246, 247] {
        let config = Config {
            device: DeviceConfig {
                slave_id,
                ..Default::default()
            },
            mqtt: MqttConfig::new("localhost"),
            heartbeat_file: None,
        };
        config.validate().unwrap();
    }
}
