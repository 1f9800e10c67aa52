use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use dtsu666_mqtt::{
    config::{Config, DeviceConfig, MqttConfig},
    health, server, Result,
};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

fn parse_duration(
    value: &str,
) -> std::result::Result<Duration, humantime_serde::re::humantime::DurationError> {
    humantime_serde::re::humantime::parse_duration(value)
}

#[derive(Parser, Debug)]
#[clap(
    name = "dtsu666-mqtt",
    version,
    author,
    about = "Publishes Chint DTSU666 meter readings from Modbus RTU to MQTT"
)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Command>,

    /// JSON configuration file. Flags and environment variables override its values.
    #[clap(short = 'c', long, env = "DTSU666_CONFIG")]
    config: Option<PathBuf>,

    #[clap(long, env = "MODBUS_PORT", value_hint = clap::ValueHint::FilePath)]
    serial_port: Option<String>,

    #[clap(long, env = "MODBUS_SLAVE")]
    slave: Option<u8>,

    #[clap(long, env = "MODBUS_BAUD_RATE")]
    baud_rate: Option<u32>,

    #[clap(long, env = "MODBUS_TIMEOUT", value_parser = parse_duration)]
    timeout: Option<Duration>,

    #[clap(long, env = "MODBUS_RETRIES")]
    retries: Option<u8>,

    #[clap(short = 'i', long, env = "POLL_INTERVAL", value_parser = parse_duration)]
    interval: Option<Duration>,

    #[clap(short = 'H', long, env = "MQTT_HOST")]
    mqtt_host: Option<String>,

    #[clap(short = 'p', long, env = "MQTT_PORT")]
    mqtt_port: Option<u16>,

    #[clap(short = 'u', long, env = "MQTT_USER")]
    mqtt_user: Option<String>,

    #[clap(short = 'P', long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    // Where state topics are published
    #[clap(short = 't', long, env = "MQTT_TOPIC_PREFIX")]
    mqtt_topic_prefix: Option<String>,

    #[clap(long, env = "DEVICE_ID")]
    device_id: Option<String>,

    #[clap(long, env = "DEVICE_NAME")]
    device_name: Option<String>,

    #[clap(long, env = "HEARTBEAT_FILE")]
    heartbeat_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exit with status 0 if the last successful poll is at most `max_age` old, 1 otherwise
    Health {
        #[clap(long, env = "HEARTBEAT_FILE")]
        file: PathBuf,

        #[clap(long, default_value = "60s", value_parser = parse_duration)]
        max_age: Duration,
    },
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => {
                let host = self
                    .mqtt_host
                    .clone()
                    .ok_or("an MQTT host is required (--mqtt-host or MQTT_HOST)")?;
                Config {
                    device: DeviceConfig::default(),
                    mqtt: MqttConfig::new(host),
                    heartbeat_file: None,
                }
            }
        };

        let device = &mut config.device;
        if let Some(serial_port) = self.serial_port {
            device.serial_port = serial_port;
        }
        if let Some(slave) = self.slave {
            device.slave_id = slave;
        }
        if let Some(baud_rate) = self.baud_rate {
            device.baud_rate = baud_rate;
        }
        if let Some(timeout) = self.timeout {
            device.timeout = timeout;
        }
        if let Some(retries) = self.retries {
            device.retries = retries;
        }
        if let Some(interval) = self.interval {
            device.poll_interval = interval;
        }

        let mqtt = &mut config.mqtt;
        if let Some(host) = self.mqtt_host {
            mqtt.host = host;
        }
        if let Some(port) = self.mqtt_port {
            mqtt.port = port;
        }
        if self.mqtt_user.is_some() {
            mqtt.username = self.mqtt_user;
        }
        if self.mqtt_password.is_some() {
            mqtt.password = self.mqtt_password;
        }
        if let Some(prefix) = self.mqtt_topic_prefix {
            mqtt.topic_prefix = prefix;
        }
        if let Some(device_id) = self.device_id {
            mqtt.device_id = device_id;
        }
        if let Some(device_name) = self.device_name {
            mqtt.device_name = device_name;
        }

        if self.heartbeat_file.is_some() {
            config.heartbeat_file = self.heartbeat_file;
        }

        Ok(config)
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                warn!(%error, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Some(Command::Health { file, max_age }) = cli.command {
        if health::check(&file, max_age)? {
            return Ok(());
        }
        error!(path = %file.display(), ?max_age, "No successful poll recently");
        std::process::exit(1);
    }

    let config = cli.into_config()?;
    server::run(config, shutdown_signal()).await
}
