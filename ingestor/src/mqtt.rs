use crate::config::MqttConfig;
use crate::errors::{Error, Result};
use crate::handlers::Ingestor;
use parking_lot::RwLock;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, Transport,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 1000;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Connection summary served by `/api/mqtt/status` and `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub username: Option<String>,
}

/// QoS and retain flag for one publish. Defaults to QoS 1, not retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

/// The live connection to the message bus.
///
/// Requests are handed to the client and return immediately: `Ok` means the
/// request was accepted for sending, not that the broker acknowledged it.
/// Every request fails with [`Error::NotConnected`] unless the session is
/// [`ConnectionState::Connected`].
pub trait BrokerSession: Send + Sync {
    fn state(&self) -> ConnectionState;
    fn status(&self) -> SessionStatus;
    fn publish(&self, topic: &str, payload: Vec<u8>, delivery: Delivery) -> Result<()>;
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;
    fn unsubscribe(&self, topic: &str) -> Result<()>;
}

/// [`BrokerSession`] backed by a rumqttc client. The matching [`EventLoop`]
/// is driven by [`run_mqtt`].
///
/// Filters subscribed at runtime are remembered and sent again after every
/// reconnect, together with the default topics.
pub struct MqttSession {
    client: AsyncClient,
    state: Arc<RwLock<ConnectionState>>,
    subscriptions: RwLock<Vec<(String, QoS)>>,
    host: String,
    port: u16,
    protocol: String,
    username: Option<String>,
}

impl MqttSession {
    pub fn new(config: &MqttConfig) -> (Self, EventLoop) {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(true);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(user, password);
        }
        if config.use_tls() {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let session = Self {
            client,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            subscriptions: RwLock::new(Vec::new()),
            host: config.host.clone(),
            port: config.port,
            protocol: config.protocol.clone(),
            username: config.username.clone(),
        };
        (session, eventloop)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("MQTT connection state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state().is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn send_subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.client.try_subscribe(topic, qos).map_err(|e| {
            error!("Failed to subscribe to topic \"{}\": {}", topic, e);
            Error::Mqtt(e)
        })?;
        info!("Subscribed to topic \"{}\" with {:?}", topic, qos);
        Ok(())
    }

    /// Subscribe to the defaults plus every runtime filter. Returns the
    /// filters that were queued.
    fn resubscribe(&self, default_topics: &[String]) -> Vec<String> {
        let mut topics: Vec<(String, QoS)> = default_topics
            .iter()
            .map(|topic| (topic.clone(), QoS::AtLeastOnce))
            .collect();
        for (topic, qos) in self.subscriptions.read().iter() {
            if !topics.iter().any(|(t, _)| t == topic) {
                topics.push((topic.clone(), *qos));
            }
        }

        topics
            .into_iter()
            .filter_map(|(topic, qos)| match self.send_subscribe(&topic, qos) {
                Ok(()) => Some(topic),
                Err(e) => {
                    error!("Re-subscribe to {} failed: {}", topic, e);
                    None
                }
            })
            .collect()
    }

    /// Ask the client to send DISCONNECT. Best effort.
    fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("MQTT disconnect request failed: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("MQTT client disconnected");
    }
}

impl BrokerSession for MqttSession {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn status(&self) -> SessionStatus {
        let state = self.state();
        SessionStatus {
            connected: state.is_connected(),
            state,
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol.clone(),
            username: self.username.as_ref().map(|_| "***".to_string()),
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, delivery: Delivery) -> Result<()> {
        self.ensure_connected()?;
        self.client
            .try_publish(topic, delivery.qos, delivery.retain, payload)
            .map_err(|e| {
                error!("Failed to publish to topic \"{}\": {}", topic, e);
                Error::Mqtt(e)
            })?;
        debug!("Published to topic \"{}\"", topic);
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.ensure_connected()?;
        self.send_subscribe(topic, qos)?;

        let mut subscriptions = self.subscriptions.write();
        match subscriptions.iter_mut().find(|(t, _)| t == topic) {
            Some(entry) => entry.1 = qos,
            None => subscriptions.push((topic.to_string(), qos)),
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ensure_connected()?;
        self.client.try_unsubscribe(topic).map_err(|e| {
            error!("Failed to unsubscribe from topic \"{}\": {}", topic, e);
            Error::Mqtt(e)
        })?;
        self.subscriptions.write().retain(|(t, _)| t != topic);
        info!("Unsubscribed from topic \"{}\"", topic);
        Ok(())
    }
}

/// Effect of one event loop notification on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transition {
    Connected { resubscribed: Vec<String> },
    Refused(ConnectReturnCode),
    Delivered,
    BrokerDisconnect,
    Lost,
    Idle,
}

/// Drive the MQTT event loop until `shutdown` flips to `true`.
///
/// Every inbound publish is handled inline, so messages are processed one at
/// a time in delivery order. Connection errors drop the session to
/// `Disconnected`; the next poll after `reconnect_interval` reconnects, with
/// no backoff growth and no retry limit.
pub async fn run_mqtt(
    session: Arc<MqttSession>,
    mut eventloop: EventLoop,
    default_topics: Vec<String>,
    reconnect_interval: Duration,
    ingestor: Ingestor,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        "Connecting to MQTT broker at {}:{}",
        session.host, session.port
    );
    session.set_state(ConnectionState::Connecting);

    loop {
        let notification = tokio::select! {
            notification = eventloop.poll() => notification,
            _ = shutdown.changed() => {
                info!("MQTT event loop stopping");
                session.disconnect();
                flush_disconnect(&mut eventloop).await;
                return Ok(());
            }
        };

        let transition = apply_notification(&session, &ingestor, &default_topics, notification);
        if transition == Transition::Lost
            && !wait_reconnect(&session, reconnect_interval, &mut shutdown).await
        {
            info!("MQTT event loop stopping while disconnected");
            session.set_state(ConnectionState::Disconnected);
            return Ok(());
        }
    }
}

/// Apply one poll result to the session state.
pub(crate) fn apply_notification(
    session: &MqttSession,
    ingestor: &Ingestor,
    default_topics: &[String],
    notification: std::result::Result<Event, ConnectionError>,
) -> Transition {
    match notification {
        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
            if ack.code != ConnectReturnCode::Success {
                warn!("MQTT connection refused: {:?}", ack.code);
                return Transition::Refused(ack.code);
            }
            session.set_state(ConnectionState::Connected);
            info!("MQTT client connected");

            Transition::Connected {
                resubscribed: session.resubscribe(default_topics),
            }
        }
        Ok(Event::Incoming(Packet::Publish(publish))) => {
            ingestor.handle_message(&publish.topic, &publish.payload);
            Transition::Delivered
        }
        Ok(Event::Incoming(Packet::Disconnect)) => {
            warn!("MQTT broker sent disconnect");
            session.set_state(ConnectionState::Disconnected);
            Transition::BrokerDisconnect
        }
        Ok(_) => Transition::Idle,
        Err(e) => {
            error!("MQTT connection error: {}", e);
            session.set_state(ConnectionState::Disconnected);
            Transition::Lost
        }
    }
}

/// Sleep out the reconnect delay, then mark the session `Connecting`.
/// Returns `false` if shutdown was requested first.
async fn wait_reconnect(
    session: &MqttSession,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {
            info!("MQTT reconnecting...");
            session.set_state(ConnectionState::Connecting);
            true
        }
        _ = shutdown.changed() => false,
    }
}

/// Poll until the queued DISCONNECT has gone out, giving up after a short wait.
async fn flush_disconnect(eventloop: &mut EventLoop) {
    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(DISCONNECT_TIMEOUT, drain).await.is_err() {
        debug!("Timed out waiting for MQTT disconnect to flush");
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::Forwarder;
    use crate::store::DeviceStore;
    use rumqttc::{ConnAck, Publish};
    use std::io;
    use tokio::sync::mpsc;

    // the event loop is kept alive so the request queue stays open
    fn session() -> (MqttSession, EventLoop) {
        let config = MqttConfig {
            host: "localhost".to_string(),
            port: 1883,
            protocol: "mqtt".to_string(),
            username: Some("hub".to_string()),
            password: Some("secret".to_string()),
            client_id: "test-hub".to_string(),
            default_topics: vec![],
            reconnect_interval: Duration::from_millis(1000),
            keep_alive: Duration::from_secs(30),
        };
        MqttSession::new(&config)
    }

    fn ingestor() -> (Ingestor, Arc<DeviceStore>) {
        let store = Arc::new(DeviceStore::new());
        let (tx, _rx) = mpsc::channel(16);
        (Ingestor::new(Arc::clone(&store), Forwarder::new(tx)), store)
    }

    fn defaults() -> Vec<String> {
        vec!["irrig/+/status".to_string(), "irrig/+/telemetry".to_string()]
    }

    fn connack(code: ConnectReturnCode) -> std::result::Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        })))
    }

    fn connection_reset() -> std::result::Result<Event, ConnectionError> {
        Err(ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }

    #[test]
    fn test_new_session_starts_disconnected() {
        let (session, _eventloop) = session();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.status().connected);
    }

    #[test]
    fn test_requests_fail_fast_when_disconnected() {
        let (session, _eventloop) = session();

        assert!(matches!(
            session.publish("irrig/DEV1/cmd", b"{}".to_vec(), Delivery::default()),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            session.subscribe("irrig/+/status", QoS::AtLeastOnce),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            session.unsubscribe("irrig/+/status"),
            Err(Error::NotConnected)
        ));
        assert!(session.subscriptions.read().is_empty());
    }

    #[test]
    fn test_requests_fail_fast_while_connecting() {
        let (session, _eventloop) = session();
        session.set_state(ConnectionState::Connecting);

        assert!(matches!(
            session.publish("irrig/DEV1/cmd", b"{}".to_vec(), Delivery::default()),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_requests_accepted_when_connected() {
        let (session, _eventloop) = session();
        session.set_state(ConnectionState::Connected);

        // nothing polls the event loop, requests stay queued
        let retained = Delivery {
            qos: QoS::AtMostOnce,
            retain: true,
        };
        assert!(session
            .publish("irrig/DEV1/cmd", br#"{"water_ms":0}"#.to_vec(), retained)
            .is_ok());
        assert!(session.subscribe("irrig/+/telemetry", QoS::AtLeastOnce).is_ok());
    }

    #[test]
    fn test_status_masks_username() {
        let (session, _eventloop) = session();
        let status = session.status();
        assert_eq!(status.username.as_deref(), Some("***"));
        assert_eq!(status.host, "localhost");
        assert_eq!(status.port, 1883);
    }

    #[test]
    fn test_connack_connects_and_subscribes_defaults() {
        let (session, _eventloop) = session();
        let (ingestor, _store) = ingestor();
        session.set_state(ConnectionState::Connecting);

        let transition = apply_notification(
            &session,
            &ingestor,
            &defaults(),
            connack(ConnectReturnCode::Success),
        );

        assert_eq!(
            transition,
            Transition::Connected {
                resubscribed: defaults()
            }
        );
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_refused_connack_stays_out_of_connected() {
        let (session, _eventloop) = session();
        let (ingestor, _store) = ingestor();
        session.set_state(ConnectionState::Connecting);

        let transition = apply_notification(
            &session,
            &ingestor,
            &defaults(),
            connack(ConnectReturnCode::NotAuthorized),
        );

        assert_eq!(
            transition,
            Transition::Refused(ConnectReturnCode::NotAuthorized)
        );
        assert!(!session.state().is_connected());
    }

    #[test]
    fn test_runtime_subscriptions_survive_reconnect() {
        let (session, _eventloop) = session();
        let (ingestor, _store) = ingestor();

        let success = connack(ConnectReturnCode::Success);
        apply_notification(&session, &ingestor, &defaults(), success);
        session.subscribe("garden/+/valve", QoS::AtMostOnce).unwrap();
        // subscribing to a default again does not duplicate it
        session.subscribe("irrig/+/status", QoS::AtLeastOnce).unwrap();

        let lost = apply_notification(&session, &ingestor, &defaults(), connection_reset());
        assert_eq!(lost, Transition::Lost);

        let transition = apply_notification(
            &session,
            &ingestor,
            &defaults(),
            connack(ConnectReturnCode::Success),
        );
        assert_eq!(
            transition,
            Transition::Connected {
                resubscribed: vec![
                    "irrig/+/status".to_string(),
                    "irrig/+/telemetry".to_string(),
                    "garden/+/valve".to_string(),
                ]
            }
        );

        session.unsubscribe("garden/+/valve").unwrap();
        let transition = apply_notification(
            &session,
            &ingestor,
            &defaults(),
            connack(ConnectReturnCode::Success),
        );
        assert_eq!(
            transition,
            Transition::Connected {
                resubscribed: defaults()
            }
        );
    }

    #[test]
    fn test_publish_is_handed_to_ingestor() {
        let (session, _eventloop) = session();
        let (ingestor, store) = ingestor();
        let publish = Publish::new("irrig/DEV1/status", QoS::AtLeastOnce, "online");

        let transition = apply_notification(
            &session,
            &ingestor,
            &defaults(),
            Ok(Event::Incoming(Packet::Publish(publish))),
        );

        assert_eq!(transition, Transition::Delivered);
        assert_eq!(store.get("DEV1").unwrap().status.as_str(), "online");
    }

    #[test]
    fn test_broker_disconnect_marks_disconnected() {
        let (session, _eventloop) = session();
        let (ingestor, _store) = ingestor();
        session.set_state(ConnectionState::Connected);

        let transition = apply_notification(
            &session,
            &ingestor,
            &defaults(),
            Ok(Event::Incoming(Packet::Disconnect)),
        );

        assert_eq!(transition, Transition::BrokerDisconnect);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_lost_connection_reconnects_after_interval() {
        tokio_test::block_on(async {
            let (session, _eventloop) = session();
            let (ingestor, _store) = ingestor();
            session.set_state(ConnectionState::Connected);
            let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

            let transition =
                apply_notification(&session, &ingestor, &defaults(), connection_reset());
            assert_eq!(transition, Transition::Lost);
            assert_eq!(session.state(), ConnectionState::Disconnected);

            let resumed =
                wait_reconnect(&session, Duration::from_millis(10), &mut shutdown_rx).await;

            assert!(resumed);
            assert_eq!(session.state(), ConnectionState::Connecting);
        });
    }

    #[test]
    fn test_shutdown_interrupts_reconnect_wait() {
        tokio_test::block_on(async {
            let (session, _eventloop) = session();
            let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
            shutdown_tx.send(true).unwrap();

            let started = std::time::Instant::now();
            let resumed =
                wait_reconnect(&session, Duration::from_secs(60), &mut shutdown_rx).await;

            assert!(!resumed);
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(session.state(), ConnectionState::Disconnected);
        });
    }
}
