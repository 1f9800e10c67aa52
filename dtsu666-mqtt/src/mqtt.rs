use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Publish, QoS};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::error::PublishError;
use crate::homeassistant::{self, Discovery, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use crate::modbus::RegisterMap;
use crate::sampler::Reading;

/// Requests rumqttc buffers between us and its event loop. We never queue more than one message before polling.
const REQUEST_CAPACITY: usize = 10;

/// How long an idle session is polled for pending packets before control goes back to the poll loop.
const IDLE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The broker side of the publisher. Every call completes its network I/O before returning.
#[async_trait]
pub trait Link: Send {
    async fn connect(&mut self) -> Result<(), PublishError>;

    /// Deliver `messages` in order on the current session.
    async fn send(&mut self, messages: Vec<Publish>) -> Result<(), PublishError>;

    /// Service an idle session: read pending packets and ping the broker when the keep alive is due. Fails when the
    /// session turns out to be gone.
    async fn keep_alive(&mut self) -> Result<(), PublishError>;

    /// Announce that we are going away and end the session.
    async fn close(&mut self) -> Result<(), PublishError>;
}

struct Session {
    client: AsyncClient,
    events: EventLoop,
}

/// A [`Link`] to a real broker through rumqttc, polling its event loop by hand instead of from a background task.
pub struct Broker {
    options: MqttOptions,
    availability_topic: String,
    timeout: Duration,
    session: Option<Session>,
}

impl Broker {
    pub fn new(config: &MqttConfig) -> Self {
        let availability_topic = homeassistant::availability_topic(&config.topic_prefix);

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }
        options.set_keep_alive(config.keep_alive);
        options.set_last_will(LastWill::new(
            &availability_topic,
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        Self {
            options,
            availability_topic,
            timeout: config.timeout,
            session: None,
        }
    }

    #[cfg(test)]
    fn options(&self) -> &MqttOptions {
        &self.options
    }

    /// Poll the event loop until `done` matches an event. A poll error means the session is gone.
    async fn drive(
        events: &mut EventLoop,
        done: impl Fn(&Event) -> bool,
    ) -> Result<(), rumqttc::ConnectionError> {
        loop {
            let event = events.poll().await?;
            debug!(?event, "MQTT event");
            if done(&event) {
                return Ok(());
            }
        }
    }

    async fn deliver(session: &mut Session, messages: Vec<Publish>) -> Result<(), PublishError> {
        for Publish {
            topic,
            qos,
            retain,
            payload,
            ..
        } in messages
        {
            session
                .client
                .publish_bytes(topic, qos, retain, payload)
                .await?;
            Self::drive(&mut session.events, |event| {
                matches!(event, Event::Outgoing(Outgoing::Publish(_)))
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Link for Broker {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn connect(&mut self) -> Result<(), PublishError> {
        self.session = None;
        let (client, mut events) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);

        let connack = Self::drive(&mut events, |event| {
            matches!(event, Event::Incoming(rumqttc::Incoming::ConnAck(_)))
        });
        match timeout(self.timeout, connack).await {
            Ok(Ok(())) => {
                self.session = Some(Session { client, events });
                Ok(())
            }
            Ok(Err(error)) => Err(PublishError::ConnectFailed(error.to_string().into())),
            Err(_) => Err(PublishError::ConnectFailed(
                format!("no CONNACK within {:?}", self.timeout).into(),
            )),
        }
    }

    async fn send(&mut self, messages: Vec<Publish>) -> Result<(), PublishError> {
        let mut session = self
            .session
            .take()
            .ok_or(PublishError::SessionLost("not connected".into()))?;

        match timeout(self.timeout, Self::deliver(&mut session, messages)).await {
            Ok(Ok(())) => {
                self.session = Some(session);
                Ok(())
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(PublishError::SessionLost(
                format!("publish not flushed within {:?}", self.timeout).into(),
            )),
        }
    }

    async fn keep_alive(&mut self) -> Result<(), PublishError> {
        let mut session = self
            .session
            .take()
            .ok_or(PublishError::SessionLost("not connected".into()))?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match timeout(IDLE_WINDOW, session.events.poll()).await {
                Ok(Ok(event)) => {
                    debug!(?event, "MQTT event");
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                }
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => break,
            }
        }

        self.session = Some(session);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PublishError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let offline = retained(&self.availability_topic, PAYLOAD_OFFLINE);
        let goodbye = async {
            Self::deliver(&mut session, vec![offline]).await?;
            session.client.disconnect().await?;
            Self::drive(&mut session.events, |event| {
                matches!(event, Event::Outgoing(Outgoing::Disconnect))
            })
            .await?;
            Ok::<(), PublishError>(())
        };
        match timeout(self.timeout, goodbye).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::SessionLost("disconnect timed out".into())),
        }
    }
}

fn retained(topic: &str, payload: impl Into<Vec<u8>>) -> Publish {
    let mut publish = Publish::new(topic, QoS::AtLeastOnce, payload);
    publish.retain = true;
    publish
}

/// Publishes readings and Home Assistant discovery, connecting lazily.
///
/// All broker I/O happens inside [`Publisher::publish`] and [`Publisher::close`]. A failed connection or a lost
/// session only skips the current cycle; the next call reconnects and announces discovery again.
pub struct Publisher<L> {
    link: L,
    state: ConnectionState,
    discovery_published: bool,
    topic_prefix: String,
    /// Retained discovery configs for every register, followed by the `online` availability message.
    announcements: Vec<Publish>,
}

impl<L: Link> Publisher<L> {
    pub fn new(link: L, config: &MqttConfig, map: &RegisterMap) -> crate::Result<Self> {
        let mut announcements = map
            .iter()
            .map(|spec| -> crate::Result<Publish> {
                let topic = homeassistant::config_topic(
                    &config.discovery_prefix,
                    &config.device_id,
                    &spec.name,
                );
                let payload = serde_json::to_vec(&Discovery::new(config, spec))?;
                Ok(retained(&topic, payload))
            })
            .collect::<crate::Result<Vec<_>>>()?;
        announcements.push(retained(
            &homeassistant::availability_topic(&config.topic_prefix),
            PAYLOAD_ONLINE,
        ));

        Ok(Self {
            link,
            state: ConnectionState::Disconnected,
            discovery_published: false,
            topic_prefix: config.topic_prefix.clone(),
            announcements,
        })
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn discovery_published(&self) -> bool {
        self.discovery_published
    }

    #[cfg(test)]
    pub(crate) fn link(&self) -> &L {
        &self.link
    }

    /// Publish every present value of `reading`, returning how many went out. Never fails: broker trouble is logged
    /// and the reading is dropped.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn publish(&mut self, reading: &Reading) -> usize {
        if self.state != ConnectionState::Connected {
            self.state = ConnectionState::Connecting;
            match self.link.connect().await {
                Ok(()) => {
                    info!("Connected to MQTT broker");
                    self.state = ConnectionState::Connected;
                    self.discovery_published = false;
                }
                Err(error) => {
                    warn!(%error, "Skipping publish");
                    self.state = ConnectionState::Disconnected;
                    return 0;
                }
            }
        }

        let mut messages = vec![];
        let announcing = !self.discovery_published;
        if announcing {
            messages.extend(self.announcements.iter().cloned());
        }
        let values: Vec<Publish> = reading
            .present()
            .map(|(name, value)| {
                Publish::new(
                    homeassistant::state_topic(&self.topic_prefix, name),
                    QoS::AtMostOnce,
                    value.to_string(),
                )
            })
            .collect();
        let published = values.len();
        messages.extend(values);

        if messages.is_empty() {
            // Nothing to say this cycle, but the session still needs its pings and its dead-socket detection
            if let Err(error) = self.link.keep_alive().await {
                warn!(%error, "Lost MQTT session, reconnecting on next publish");
                self.state = ConnectionState::Disconnected;
            }
            return 0;
        }

        match self.link.send(messages).await {
            Ok(()) => {
                if announcing {
                    debug!(sensors = self.announcements.len() - 1, "Published discovery");
                    self.discovery_published = true;
                }
                debug!(values = published, "Published reading");
                published
            }
            Err(error) => {
                warn!(%error, "Lost MQTT session, reconnecting on next publish");
                self.state = ConnectionState::Disconnected;
                0
            }
        }
    }

    /// Mark the meter offline and disconnect.
    pub async fn close(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Err(error) = self.link.close().await {
            warn!(%error, "Could not disconnect cleanly");
        }
        self.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sampler::{Fault, Value};
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use std::time::SystemTime;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Records what a publisher sends, failing connects, sends or keep alives on demand.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub connects: usize,
        pub fail_connects: usize,
        pub fail_sends: usize,
        pub keep_alives: usize,
        pub fail_keep_alives: usize,
        pub sent: Vec<Publish>,
        pub closed: bool,
    }

    impl Recorder {
        pub fn topics(&self) -> Vec<&str> {
            self.sent.iter().map(|p| p.topic.as_str()).collect()
        }

        pub fn discovery_count(&self) -> usize {
            self.sent
                .iter()
                .filter(|p| p.topic.starts_with("homeassistant/"))
                .count()
        }
    }

    #[async_trait]
    impl Link for Recorder {
        async fn connect(&mut self) -> Result<(), PublishError> {
            self.connects += 1;
            if self.fail_connects > 0 {
                self.fail_connects -= 1;
                return Err(PublishError::ConnectFailed("connection refused".into()));
            }
            Ok(())
        }

        async fn send(&mut self, messages: Vec<Publish>) -> Result<(), PublishError> {
            if self.fail_sends > 0 {
                self.fail_sends -= 1;
                return Err(PublishError::SessionLost("broker went away".into()));
            }
            self.sent.extend(messages);
            Ok(())
        }

        async fn keep_alive(&mut self) -> Result<(), PublishError> {
            self.keep_alives += 1;
            if self.fail_keep_alives > 0 {
                self.fail_keep_alives -= 1;
                return Err(PublishError::SessionLost("keep alive timed out".into()));
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), PublishError> {
            self.closed = true;
            Ok(())
        }
    }

    fn reading(values: &[(&str, Option<Decimal>)]) -> Reading {
        let mut reading = Reading::new(SystemTime::now());
        for (name, value) in values {
            let value = match value {
                Some(value) => Value::Present(*value),
                None => Value::Absent(Fault::Transport {
                    kind: "timeout",
                    message: "no response".into(),
                }),
            };
            reading.values.insert(name.to_string(), value);
        }
        reading
    }

    fn publisher(recorder: Recorder) -> Publisher<Recorder> {
        Publisher::new(recorder, &MqttConfig::new("localhost"), &RegisterMap::dtsu666()).unwrap()
    }

    #[tokio::test]
    async fn discovery_published_once_per_session() {
        let mut publisher = publisher(Recorder::default());
        let reading = reading(&[("Voltage_A", Some(Decimal::new(2301, 1)))]);

        assert_eq!(publisher.publish(&reading).await, 1);
        assert_eq!(publisher.publish(&reading).await, 1);

        let link = publisher.link();
        assert_eq!(link.connects, 1);
        assert_eq!(link.discovery_count(), 13);
        assert!(publisher.discovery_published());

        let mut discovery: Vec<&str> = link
            .topics()
            .into_iter()
            .filter(|t| t.starts_with("homeassistant/"))
            .collect();
        discovery.sort();
        discovery.dedup();
        assert_eq!(discovery.len(), 13);
        assert!(discovery.contains(&"homeassistant/sensor/dtsu666_meter_Energy_Export/config"));
    }

    #[tokio::test]
    async fn announcements_precede_values() {
        let mut publisher = publisher(Recorder::default());
        publisher
            .publish(&reading(&[("Frequency", Some(Decimal::new(5001, 2)))]))
            .await;

        let sent = &publisher.link().sent;
        assert_eq!(sent.len(), 15);
        assert!(sent[..13].iter().all(|p| p.retain && p.qos == QoS::AtLeastOnce));
        assert_eq!(sent[13].topic, "chint/dtsu666/status");
        assert_eq!(&sent[13].payload[..], b"online");
        assert!(sent[13].retain);
        assert_eq!(sent[14].topic, "chint/dtsu666/Frequency");
        assert_eq!(&sent[14].payload[..], b"50.01");
        assert!(!sent[14].retain);
        assert_eq!(sent[14].qos, QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn discovery_payload_is_json() {
        let mut publisher = publisher(Recorder::default());
        publisher.publish(&reading(&[])).await;

        let config = publisher
            .link()
            .sent
            .iter()
            .find(|p| p.topic == "homeassistant/sensor/dtsu666_meter_Power_Total/config")
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&config.payload).unwrap();
        assert_eq!(json["unique_id"], "dtsu666_meter_Power_Total");
        assert_eq!(json["state_topic"], "chint/dtsu666/Power_Total");
        assert_eq!(json["unit_of_measurement"], "W");
    }

    #[tokio::test]
    async fn failed_connect_skips_cycle() {
        let mut publisher = publisher(Recorder {
            fail_connects: 1,
            ..Default::default()
        });
        let reading = reading(&[("Voltage_A", Some(Decimal::new(2301, 1)))]);

        assert_eq!(publisher.publish(&reading).await, 0);
        assert_eq!(publisher.state(), ConnectionState::Disconnected);
        assert!(publisher.link().sent.is_empty());

        assert_eq!(publisher.publish(&reading).await, 1);
        assert_eq!(publisher.state(), ConnectionState::Connected);
        assert_eq!(publisher.link().connects, 2);
    }

    #[tokio::test]
    async fn lost_session_reconnects_and_announces_again() {
        let mut publisher = publisher(Recorder::default());
        let reading = reading(&[("Voltage_A", Some(Decimal::new(2301, 1)))]);

        publisher.publish(&reading).await;
        publisher.link.fail_sends = 1;
        assert_eq!(publisher.publish(&reading).await, 0);
        assert_eq!(publisher.state(), ConnectionState::Disconnected);

        assert_eq!(publisher.publish(&reading).await, 1);
        assert_eq!(publisher.link().connects, 2);
        assert_eq!(publisher.link().discovery_count(), 26);
    }

    #[tokio::test]
    async fn publishes_decimal_string_and_skips_absent() {
        let mut publisher = publisher(Recorder::default());
        let words = Decimal::from(0x0898) * Decimal::new(1, 1);
        let reading = reading(&[("Voltage_A", Some(words)), ("Voltage_B", None)]);

        assert_eq!(publisher.publish(&reading).await, 1);
        let values: Vec<(&str, &[u8])> = publisher
            .link()
            .sent
            .iter()
            .filter(|p| !p.retain)
            .map(|p| (p.topic.as_str(), &p.payload[..]))
            .collect();
        assert_eq!(values, vec![("chint/dtsu666/Voltage_A", &b"220.0"[..])]);
    }

    #[tokio::test]
    async fn close_only_when_connected() {
        let mut publisher = publisher(Recorder::default());
        publisher.close().await;
        assert!(!publisher.link().closed);

        publisher.publish(&reading(&[])).await;
        publisher.close().await;
        assert!(publisher.link().closed);
        assert_eq!(publisher.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn broker_options_carry_last_will_and_credentials() {
        let mut config = MqttConfig::new("broker.local");
        config.username = Some("user1".into());
        let broker = Broker::new(&config);
        let options = broker.options();

        assert_eq!(options.broker_address(), ("broker.local".to_owned(), 1883));
        assert_eq!(
            options.credentials(),
            Some(("user1".to_owned(), "".to_owned()))
        );
        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "chint/dtsu666/status");
        assert_eq!(&will.message[..], b"offline");
        assert!(will.retain);
    }

    #[tokio::test]
    async fn idle_session_is_kept_alive_and_dropped_when_dead() {
        let mut publisher = publisher(Recorder::default());
        let voltage = reading(&[("Voltage_A", Some(Decimal::new(2301, 1)))]);
        let nothing = reading(&[("Voltage_A", None)]);

        assert_eq!(publisher.publish(&voltage).await, 1);
        assert_eq!(publisher.publish(&nothing).await, 0);
        assert_eq!(publisher.link().keep_alives, 1);
        assert_eq!(publisher.state(), ConnectionState::Connected);

        publisher.link.fail_keep_alives = 1;
        assert_eq!(publisher.publish(&nothing).await, 0);
        assert_eq!(publisher.state(), ConnectionState::Disconnected);

        assert_eq!(publisher.publish(&voltage).await, 1);
        assert_eq!(publisher.link().connects, 2);
        assert_eq!(publisher.link().discovery_count(), 26);
    }

    /// A single-session MQTT 3.1.1 broker: acknowledges CONNECT, QoS 1 PUBLISH and PINGREQ, and returns every
    /// PUBLISH it saw as `(topic, payload, retain)` once the client disconnects.
    async fn fake_broker(listener: TcpListener) -> Vec<(String, String, bool)> {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut seen = vec![];

        while let Some((header, body)) = read_packet(&mut socket).await {
            match header >> 4 {
                1 => socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap(),
                3 => {
                    let qos = (header >> 1) & 0x03;
                    let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                    let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
                    let mut rest = 2 + topic_len;
                    if qos > 0 {
                        let pkid = [body[rest], body[rest + 1]];
                        socket.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await.unwrap();
                        rest += 2;
                    }
                    let payload = String::from_utf8(body[rest..].to_vec()).unwrap();
                    seen.push((topic, payload, header & 0x01 == 1));
                }
                12 => socket.write_all(&[0xD0, 0x00]).await.unwrap(),
                14 => break,
                _ => {}
            }
        }
        seen
    }

    async fn read_packet(socket: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = socket.read_u8().await.ok()?;
        let mut length = 0usize;
        for shift in (0..28).step_by(7) {
            let byte = socket.read_u8().await.ok()?;
            length |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
        }
        let mut body = vec![0; length];
        socket.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    fn local_config(port: u16) -> MqttConfig {
        let mut config = MqttConfig::new("127.0.0.1");
        config.port = port;
        config.timeout = Duration::from_secs(2);
        config
    }

    #[tokio::test]
    async fn refused_connection_fails_within_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = local_config(port);
        let mut broker = Broker::new(&config);
        let started = std::time::Instant::now();

        assert!(matches!(
            broker.connect().await,
            Err(PublishError::ConnectFailed(_))
        ));
        assert!(started.elapsed() < config.timeout);
        assert!(matches!(
            broker.keep_alive().await,
            Err(PublishError::SessionLost(_))
        ));
    }

    #[tokio::test]
    async fn broker_sees_discovery_then_online_then_values() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(listener.local_addr().unwrap().port());
        let server = tokio::spawn(fake_broker(listener));

        let mut publisher =
            Publisher::new(Broker::new(&config), &config, &RegisterMap::dtsu666()).unwrap();
        let voltage = reading(&[("Voltage_A", Some(Decimal::new(2301, 1)))]);
        assert_eq!(publisher.publish(&voltage).await, 1);
        publisher.close().await;

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 16);
        assert!(seen[..13].iter().all(|(topic, _, retain)| {
            *retain && topic.starts_with("homeassistant/sensor/dtsu666_meter_")
        }));
        let tail: Vec<(&str, &str, bool)> = seen[13..]
            .iter()
            .map(|(topic, payload, retain)| (topic.as_str(), payload.as_str(), *retain))
            .collect();
        assert_eq!(
            tail,
            vec![
                ("chint/dtsu666/status", "online", true),
                ("chint/dtsu666/Voltage_A", "230.1", false),
                ("chint/dtsu666/status", "offline", true),
            ]
        );
    }

    #[tokio::test]
    async fn keep_alive_notices_a_dropped_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(listener.local_addr().unwrap().port());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_packet(&mut socket).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        });

        let mut broker = Broker::new(&config);
        broker.connect().await.unwrap();
        server.await.unwrap();

        assert!(matches!(
            broker.keep_alive().await,
            Err(PublishError::SessionLost(_))
        ));
    }
}
