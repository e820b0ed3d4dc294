//! Per-topic MQTT connection state machine
//!
//! [`ConnectionTracker`] holds the pure state transitions and the measurement
//! window. [`BrokerConnection`] owns a tracker behind a mutex and drives it
//! from a rumqttc event loop running in its own task.

use super::window::MeasurementWindow;
use crate::config::Topic;
use crate::topic_span;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Request channel capacity between the client handle and its event loop
const CLIENT_CHANNEL_CAPACITY: usize = 10;

/// Lifecycle of one topic subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or the last attempt failed
    Idle,
    /// Connect issued, waiting for CONNACK
    Connecting,
    /// Broker accepted the connection and the subscription was sent
    Subscribed,
    /// Connection was lost after being subscribed
    Disconnected,
}

/// Settings shared by every connection of a supervisor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionSettings {
    pub keep_alive: Duration,
    /// Give up on a pending CONNACK after this long
    pub connect_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(5),
            connect_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// State and measurement window of one topic
///
/// Every event carries the attempt number it belongs to; events from an
/// older attempt are ignored.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    state: ConnectionState,
    attempt: u64,
    window: MeasurementWindow,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            window: MeasurementWindow::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn window(&self) -> &MeasurementWindow {
        &self.window
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.attempt == attempt
    }

    /// Claim a new connection attempt
    ///
    /// Returns the attempt number, or `None` while an attempt is in flight
    /// or the topic is already subscribed.
    pub fn begin_connect(&mut self) -> Option<u64> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Subscribed => None,
            ConnectionState::Idle | ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                self.attempt += 1;
                self.window.clear();
                Some(self.attempt)
            }
        }
    }

    /// CONNACK received; returns true when measurement started
    pub fn on_connack(&mut self, attempt: u64, accepted: bool, now: Instant) -> bool {
        if !self.is_current(attempt) || self.state != ConnectionState::Connecting {
            return false;
        }
        if accepted {
            self.state = ConnectionState::Subscribed;
            self.window.start(now);
        } else {
            self.state = ConnectionState::Idle;
        }
        accepted
    }

    pub fn on_message(&mut self, attempt: u64) {
        if self.is_current(attempt) && self.state == ConnectionState::Subscribed {
            self.window.record_message();
        }
    }

    /// Network loop ended, either by broker disconnect or by an error
    pub fn on_connection_lost(&mut self, attempt: u64, now: Instant) {
        if !self.is_current(attempt) {
            return;
        }
        match self.state {
            ConnectionState::Subscribed => {
                self.state = ConnectionState::Disconnected;
                self.window.stop(now);
            }
            ConnectionState::Connecting => self.state = ConnectionState::Idle,
            ConnectionState::Idle | ConnectionState::Disconnected => {}
        }
    }

    /// No CONNACK within the connect timeout
    pub fn on_connect_timeout(&mut self, attempt: u64) -> bool {
        if self.is_current(attempt) && self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Idle;
            return true;
        }
        false
    }

    pub fn take_rate(&mut self, now: Instant, keep_alive: Duration) -> Option<f64> {
        self.window.take_rate(now, keep_alive)
    }
}

/// Routing decisions for rumqttc events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged { code: ConnectReturnCode },
    MessageReceived,
    Disconnected,
    SubscriptionConfirmed { rejected: bool },
    Ignored,
}

/// Map an event loop event onto the state machine
pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            EventRoute::ConnectionAcknowledged { code: ack.code }
        }
        Event::Incoming(Packet::Publish(_)) => EventRoute::MessageReceived,
        Event::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
        Event::Incoming(Packet::SubAck(ack)) => EventRoute::SubscriptionConfirmed {
            rejected: ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure)),
        },
        Event::Incoming(_) | Event::Outgoing(_) => EventRoute::Ignored,
    }
}

/// Build client options for one connection attempt
pub fn configure_mqtt_options(topic: &Topic, attempt: u64, keep_alive: Duration) -> MqttOptions {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let client_id = format!(
        "transit-monitor-{}-{timestamp}-{attempt}",
        std::process::id()
    );

    let mut options = MqttOptions::new(client_id, topic.address.clone(), topic.port);
    options.set_keep_alive(keep_alive);
    options.set_clean_session(true);
    options
}

/// One subscription to one broker/topic pair
pub struct BrokerConnection {
    topic: Topic,
    settings: ConnectionSettings,
    tracker: Arc<Mutex<ConnectionTracker>>,
}

impl BrokerConnection {
    pub fn new(topic: Topic, settings: ConnectionSettings) -> Self {
        Self {
            topic,
            settings,
            tracker: Arc::new(Mutex::new(ConnectionTracker::new())),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub async fn state(&self) -> ConnectionState {
        self.tracker.lock().await.state()
    }

    /// Start a connection attempt unless one is in flight or already subscribed
    ///
    /// The state moves to `Connecting` before the network task is spawned.
    /// Returns whether a new attempt was started.
    pub async fn start(&self) -> bool {
        let attempt = match self.tracker.lock().await.begin_connect() {
            Some(attempt) => attempt,
            None => {
                debug!(
                    topic = %self.topic.key(),
                    "MQTT client is already connecting or connected to {}",
                    self.topic.broker_address()
                );
                return false;
            }
        };

        let options = configure_mqtt_options(&self.topic, attempt, self.settings.keep_alive);
        let (client, event_loop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);

        info!(
            "Connecting to MQTT broker at {} (attempt {attempt})",
            self.topic.broker_address()
        );

        let span = topic_span!(topic = %self.topic.key(), attempt);
        tokio::spawn(
            run_event_loop(
                self.topic.clone(),
                self.tracker.clone(),
                attempt,
                client,
                event_loop,
                self.settings.connect_timeout,
            )
            .instrument(span),
        );
        true
    }

    /// Rate since the last read, re-arming the window
    pub async fn take_rate(&self, now: Instant) -> Option<f64> {
        let rate = self
            .tracker
            .lock()
            .await
            .take_rate(now, self.settings.keep_alive);
        if rate.is_none() {
            info!(
                topic = %self.topic.key(),
                "No data was measured for {} on topic {}",
                self.topic.broker_address(),
                self.topic.name
            );
        }
        rate
    }

    /// Copy of the tracker, for inspection
    pub async fn snapshot(&self) -> ConnectionTracker {
        self.tracker.lock().await.clone()
    }

    /// Drive the tracker directly, without a network task
    #[cfg(test)]
    pub(crate) async fn with_tracker<R>(
        &self,
        f: impl FnOnce(&mut ConnectionTracker) -> R,
    ) -> R {
        f(&mut *self.tracker.lock().await)
    }
}

/// Poll the event loop until the connection ends
///
/// Dropping the event loop on return closes the socket; the supervisor
/// creates a fresh client for the next attempt.
async fn run_event_loop(
    topic: Topic,
    tracker: Arc<Mutex<ConnectionTracker>>,
    attempt: u64,
    client: AsyncClient,
    mut event_loop: EventLoop,
    connect_timeout: Option<Duration>,
) {
    let connect_deadline = connect_timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let awaiting_connack = tracker.lock().await.state() == ConnectionState::Connecting;

        let polled = match connect_deadline {
            Some(deadline) if awaiting_connack => {
                match tokio::time::timeout_at(deadline, event_loop.poll()).await {
                    Ok(polled) => polled,
                    Err(_) => {
                        if tracker.lock().await.on_connect_timeout(attempt) {
                            warn!(
                                "No CONNACK from {} within {:?}, giving up on this attempt",
                                topic.broker_address(),
                                connect_timeout.unwrap_or_default()
                            );
                        }
                        break;
                    }
                }
            }
            _ => event_loop.poll().await,
        };

        match polled {
            Ok(event) => match route_event(&event) {
                EventRoute::ConnectionAcknowledged { code } => {
                    let accepted = code == ConnectReturnCode::Success;
                    if !tracker
                        .lock()
                        .await
                        .on_connack(attempt, accepted, Instant::now())
                    {
                        warn!(
                            "Error on connecting to {} ({code:?}), is our IP allow-listed for the topic?",
                            topic.broker_address()
                        );
                        break;
                    }
                    info!("Connected to MQTT broker at {}", topic.broker_address());
                    if let Err(e) = client.try_subscribe(topic.name.clone(), QoS::AtMostOnce) {
                        warn!("Failed to subscribe to {}: {}", topic.name, e);
                    }
                }
                EventRoute::MessageReceived => tracker.lock().await.on_message(attempt),
                EventRoute::Disconnected => {
                    tracker
                        .lock()
                        .await
                        .on_connection_lost(attempt, Instant::now());
                    info!("Disconnected from {} by broker", topic.broker_address());
                    break;
                }
                EventRoute::SubscriptionConfirmed { rejected } => {
                    if rejected {
                        warn!("Broker refused subscription to {}", topic.name);
                    } else {
                        debug!("Subscribed to {}", topic.name);
                    }
                }
                EventRoute::Ignored => {}
            },
            Err(ConnectionError::ConnectionRefused(code)) => {
                tracker
                    .lock()
                    .await
                    .on_connection_lost(attempt, Instant::now());
                warn!(
                    "Error on connecting to {} ({code:?}), is our IP allow-listed for the topic?",
                    topic.broker_address()
                );
                break;
            }
            Err(e) => {
                tracker
                    .lock()
                    .await
                    .on_connection_lost(attempt, Instant::now());
                warn!("Disconnected from {}: {}", topic.broker_address(), e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish, SubAck};

    const KEEP_ALIVE: Duration = Duration::from_secs(5);

    fn subscribed_tracker(now: Instant) -> (ConnectionTracker, u64) {
        let mut tracker = ConnectionTracker::new();
        let attempt = tracker.begin_connect().unwrap();
        assert!(tracker.on_connack(attempt, true, now));
        (tracker, attempt)
    }

    #[test]
    fn test_begin_connect_guards_in_flight_attempt() {
        let mut tracker = ConnectionTracker::new();
        assert_eq!(tracker.begin_connect(), Some(1));
        assert_eq!(tracker.state(), ConnectionState::Connecting);
        assert_eq!(tracker.begin_connect(), None);
        assert_eq!(tracker.attempt(), 1);
    }

    #[test]
    fn test_subscribed_topic_is_not_reconnected() {
        let (mut tracker, _) = subscribed_tracker(Instant::now());
        assert_eq!(tracker.begin_connect(), None);
        assert_eq!(tracker.state(), ConnectionState::Subscribed);
    }

    #[test]
    fn test_connack_accepted_starts_measuring() {
        let now = Instant::now();
        let (tracker, _) = subscribed_tracker(now);
        assert_eq!(tracker.state(), ConnectionState::Subscribed);
        assert_eq!(tracker.window().started_at(), Some(now));
        assert_eq!(tracker.window().stopped_at(), None);
    }

    #[test]
    fn test_connack_rejected_returns_to_idle() {
        let mut tracker = ConnectionTracker::new();
        let attempt = tracker.begin_connect().unwrap();
        assert!(!tracker.on_connack(attempt, false, Instant::now()));
        assert_eq!(tracker.state(), ConnectionState::Idle);
        assert_eq!(tracker.window().started_at(), None);
        assert_eq!(tracker.begin_connect(), Some(2));
    }

    #[test]
    fn test_messages_counted_only_while_subscribed() {
        let mut tracker = ConnectionTracker::new();
        let attempt = tracker.begin_connect().unwrap();
        tracker.on_message(attempt);
        assert_eq!(tracker.window().message_count(), 0);

        tracker.on_connack(attempt, true, Instant::now());
        tracker.on_message(attempt);
        tracker.on_message(attempt);
        assert_eq!(tracker.window().message_count(), 2);
    }

    #[test]
    fn test_disconnect_records_stop_and_keeps_count() {
        let start = Instant::now();
        let (mut tracker, attempt) = subscribed_tracker(start);
        for _ in 0..100 {
            tracker.on_message(attempt);
        }
        let lost_at = start + Duration::from_secs(60);
        tracker.on_connection_lost(attempt, lost_at);

        assert_eq!(tracker.state(), ConnectionState::Disconnected);
        assert_eq!(tracker.window().stopped_at(), Some(lost_at));
        assert_eq!(tracker.window().message_count(), 100);

        let rate = tracker
            .take_rate(lost_at + Duration::from_secs(5), KEEP_ALIVE)
            .unwrap();
        assert!((rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_connect_returns_to_idle() {
        let mut tracker = ConnectionTracker::new();
        let attempt = tracker.begin_connect().unwrap();
        tracker.on_connection_lost(attempt, Instant::now());
        assert_eq!(tracker.state(), ConnectionState::Idle);
        assert_eq!(tracker.window().stopped_at(), None);
    }

    #[test]
    fn test_connect_timeout_only_applies_while_connecting() {
        let mut tracker = ConnectionTracker::new();
        let attempt = tracker.begin_connect().unwrap();
        assert!(tracker.on_connect_timeout(attempt));
        assert_eq!(tracker.state(), ConnectionState::Idle);

        let (mut tracker, attempt) = subscribed_tracker(Instant::now());
        assert!(!tracker.on_connect_timeout(attempt));
        assert_eq!(tracker.state(), ConnectionState::Subscribed);
    }

    #[test]
    fn test_events_from_previous_attempt_are_ignored() {
        let start = Instant::now();
        let (mut tracker, first) = subscribed_tracker(start);
        tracker.on_connection_lost(first, start + Duration::from_secs(60));
        let second = tracker.begin_connect().unwrap();

        tracker.on_message(first);
        tracker.on_connection_lost(first, start);
        assert!(!tracker.on_connack(first, true, start));
        assert_eq!(tracker.state(), ConnectionState::Connecting);

        assert!(tracker.on_connack(second, true, start));
        assert_eq!(tracker.window().message_count(), 0);
    }

    #[test]
    fn test_reconnect_clears_previous_window() {
        let start = Instant::now();
        let (mut tracker, attempt) = subscribed_tracker(start);
        tracker.on_message(attempt);
        tracker.on_connection_lost(attempt, start + Duration::from_secs(1));
        tracker.begin_connect().unwrap();
        assert_eq!(*tracker.window(), MeasurementWindow::new());
    }

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        }));
        assert_eq!(
            route_event(&event),
            EventRoute::ConnectionAcknowledged {
                code: ConnectReturnCode::NotAuthorized
            }
        );
    }

    #[test]
    fn test_route_publish_and_disconnect() {
        let publish = Publish::new("/hfp/v2/journey", QoS::AtMostOnce, "payload");
        assert_eq!(
            route_event(&Event::Incoming(Packet::Publish(publish))),
            EventRoute::MessageReceived
        );
        assert_eq!(
            route_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            route_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::Ignored
        );
    }

    #[test]
    fn test_route_suback() {
        let ok = SubAck {
            pkid: 1,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        };
        let refused = SubAck {
            pkid: 2,
            return_codes: vec![SubscribeReasonCode::Failure],
        };
        assert_eq!(
            route_event(&Event::Incoming(Packet::SubAck(ok))),
            EventRoute::SubscriptionConfirmed { rejected: false }
        );
        assert_eq!(
            route_event(&Event::Incoming(Packet::SubAck(refused))),
            EventRoute::SubscriptionConfirmed { rejected: true }
        );
    }

    #[test]
    fn test_mqtt_options() {
        let topic = Topic::new("localhost", "/hfp/#", 1883);
        let options = configure_mqtt_options(&topic, 3, KEEP_ALIVE);
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert!(options.client_id().ends_with("-3"));
    }

    #[tokio::test]
    async fn test_start_moves_to_connecting_and_guards_second_start() {
        // Nothing listens on port 1; the spawned task fails on its own time
        let connection = BrokerConnection::new(
            Topic::new("127.0.0.1", "/test", 1),
            ConnectionSettings::default(),
        );
        assert_eq!(connection.state().await, ConnectionState::Idle);
        assert!(connection.start().await);
        assert_eq!(connection.state().await, ConnectionState::Connecting);
        assert!(!connection.start().await);
        assert_eq!(connection.snapshot().await.attempt(), 1);
    }
}
