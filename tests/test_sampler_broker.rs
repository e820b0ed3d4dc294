//! Sampler tests against a minimal in-process MQTT 3.1.1 broker
//!
//! The broker accepts one connection, acknowledges it, pushes a few QoS 0
//! publishes and then either closes the socket or stays silent.

use bytes::BytesMut;
use rumqttc::{ConnAck, ConnectReturnCode, Publish, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use transit_monitor::config::Topic;
use transit_monitor::metrics::EmitRetryPolicy;
use transit_monitor::sampler::{
    BrokerConnection, ConnectionSettings, ConnectionState, ConnectionTracker, TopicSupervisor,
};
use transit_monitor::testing::MockEmitter;

const TOPIC: &str = "/hfp/v2/journey";

fn connack_packet(code: ConnectReturnCode) -> BytesMut {
    let mut buf = BytesMut::new();
    ConnAck::new(code, false).write(&mut buf).unwrap();
    buf
}

fn publish_packet(topic: &str, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    Publish::new(topic, QoS::AtMostOnce, payload.to_vec())
        .write(&mut buf)
        .unwrap();
    buf
}

async fn accept_and_connack(listener: &TcpListener, code: ConnectReturnCode) -> TcpStream {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 512];
    // CONNECT
    let read = socket.read(&mut buf).await.unwrap();
    assert!(read > 0 && buf[0] == 0x10, "expected CONNECT");
    socket.write_all(&connack_packet(code)).await.unwrap();
    socket
}

async fn wait_for<F>(connection: &BrokerConnection, condition: F)
where
    F: Fn(&ConnectionTracker) -> bool,
{
    for _ in 0..250 {
        if condition(&connection.snapshot().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5 seconds");
}

async fn local_topic(listener: &TcpListener) -> Topic {
    let port = listener.local_addr().unwrap().port();
    Topic::new("127.0.0.1", TOPIC, port)
}

#[tokio::test]
async fn test_messages_are_counted_until_broker_disconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let topic = local_topic(&listener).await;
    let (close_tx, close_rx) = oneshot::channel::<()>();

    let broker = tokio::spawn(async move {
        let mut socket = accept_and_connack(&listener, ConnectReturnCode::Success).await;
        // The last payload needs a two-byte remaining length
        for payload in [&b"{}"[..], &[b'x'; 64][..], &[b'y'; 300][..]] {
            socket
                .write_all(&publish_packet(TOPIC, payload))
                .await
                .unwrap();
        }
        let _ = close_rx.await;
        drop(socket);
    });

    let connection = BrokerConnection::new(topic, ConnectionSettings::default());
    assert!(connection.start().await);

    wait_for(&connection, |t| t.window().message_count() == 3).await;
    let tracker = connection.snapshot().await;
    assert_eq!(tracker.state(), ConnectionState::Subscribed);
    assert!(tracker.window().started_at().is_some());

    close_tx.send(()).unwrap();
    broker.await.unwrap();

    wait_for(&connection, |t| t.state() == ConnectionState::Disconnected).await;
    let tracker = connection.snapshot().await;
    assert!(tracker.window().stopped_at().is_some());
    // The count survives the disconnect for the next read
    assert_eq!(tracker.window().message_count(), 3);
}

#[tokio::test]
async fn test_refused_connection_returns_to_idle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let topic = local_topic(&listener).await;

    let broker = tokio::spawn(async move {
        let socket = accept_and_connack(&listener, ConnectReturnCode::NotAuthorized).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(socket);
    });

    let connection = BrokerConnection::new(topic, ConnectionSettings::default());
    assert!(connection.start().await);

    wait_for(&connection, |t| t.state() == ConnectionState::Idle).await;
    assert_eq!(connection.snapshot().await.window().started_at(), None);
    broker.await.unwrap();
}

#[tokio::test]
async fn test_silent_broker_hits_connect_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let topic = local_topic(&listener).await;

    // Accept but never answer the CONNECT
    let broker = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(socket);
    });

    let settings = ConnectionSettings {
        keep_alive: Duration::from_secs(5),
        connect_timeout: Some(Duration::from_millis(300)),
    };
    let connection = BrokerConnection::new(topic, settings);
    assert!(connection.start().await);
    assert_eq!(connection.state().await, ConnectionState::Connecting);

    wait_for(&connection, |t| t.state() == ConnectionState::Idle).await;

    // Eligible for the next retry
    assert!(connection.start().await);
    assert_eq!(connection.snapshot().await.attempt(), 2);
    broker.abort();
}

#[tokio::test]
async fn test_supervisor_reconnects_after_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let topic = local_topic(&listener).await;
    let (first_closed_tx, first_closed_rx) = oneshot::channel::<()>();

    let broker = tokio::spawn(async move {
        let first = accept_and_connack(&listener, ConnectReturnCode::Success).await;
        drop(first);
        let _ = first_closed_tx.send(());
        // Second attempt stays subscribed
        let second = accept_and_connack(&listener, ConnectReturnCode::Success).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(second);
    });

    let emitter = Arc::new(MockEmitter::new());
    let supervisor = TopicSupervisor::new(
        vec![topic],
        ConnectionSettings::default(),
        Duration::from_secs(60),
        emitter.clone(),
        EmitRetryPolicy::default(),
    );

    assert_eq!(supervisor.restart_stopped().await, 1);
    first_closed_rx.await.unwrap();

    let connection = &supervisor.connections()[0];
    wait_for(connection, |t| t.state() == ConnectionState::Disconnected).await;

    // Window too short for a rate, so nothing is emitted
    let emission = supervisor.run_cycle().await;
    assert!(!emission.await.unwrap());
    assert_eq!(emitter.attempts(), 0);

    wait_for(connection, |t| t.state() == ConnectionState::Subscribed).await;
    assert_eq!(connection.snapshot().await.attempt(), 2);
    broker.abort();
}
