//! Session lifecycle tests
//!
//! Pairing, certificate renewal, the CONNACK-timeout verification path,
//! the resync performed on a fresh broker session and inbound routing.

mod test_helpers;

use astarte_transport::pairing::PairingState;
use astarte_transport::protocol::topics::decode_producer_properties;
use astarte_transport::protocol::{AstarteValue, Qos};
use astarte_transport::testing::{AdapterCall, RecordingAdapter};
use astarte_transport::transport::mqtt::ConnectionStatus;
use astarte_transport::retry::RetryPolicy;
use astarte_transport::transport::{PublishRequest, TransportOptions};
use std::time::Duration;
use test_helpers::{Fixture, COMMANDS, CONFIGURATION, ROOT, SETTINGS};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

const REGISTRATION_PATH: &str = "/pairing/v1/test/agent/devices";

#[tokio::test]
async fn test_provisioned_device_connects_without_pairing() {
    let fixture = Fixture::new().await;
    let certificate = fixture.provision(90);
    let mut transport = fixture.transport();

    fixture.connect(&mut transport, false).await;

    assert_eq!(transport.status(), ConnectionStatus::Connected);
    assert_eq!(transport.root_topic(), Some(ROOT));
    assert_eq!(fixture.broker.client_ids(), vec![ROOT.to_string()]);
    assert_eq!(fixture.broker.certificates(), vec![certificate.into_bytes()]);
    assert_eq!(fixture.requests_to(&fixture.credentials_path()).await, 0);
}

#[tokio::test]
async fn test_pairing_is_retried_until_it_succeeds() {
    // Arrange: registration fails three times, signing twice
    let fixture = Fixture::new().await;
    Mock::given(method("POST"))
        .and(path(REGISTRATION_PATH))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&fixture.server)
        .await;
    fixture.mount_registration().await;
    Mock::given(method("POST"))
        .and(path(fixture.credentials_path()))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&fixture.server)
        .await;
    let certificate = fixture.mount_certificate().await;
    let mut transport = fixture.transport();

    // Act
    transport.connect(false).await;

    // Assert
    assert_eq!(transport.pairing().state(), PairingState::Paired);
    assert!(transport.pairing().has_secret());
    assert_eq!(
        std::fs::read_to_string(fixture.credentials_dir().join("credentials_secret")).unwrap(),
        "issued-secret"
    );
    assert_eq!(fixture.requests_to(REGISTRATION_PATH).await, 4);
    assert_eq!(fixture.requests_to(&fixture.credentials_path()).await, 3);
    assert_eq!(fixture.broker.certificates(), vec![certificate.into_bytes()]);
    assert_eq!(fixture.broker.connect_calls(), 1);
}

#[tokio::test]
async fn test_certificate_close_to_expiry_is_renewed_before_connecting() {
    let fixture = Fixture::new().await;
    let expiring = fixture.provision(5);
    let renewed = fixture.mount_certificate().await;
    let mut transport = fixture.transport();

    transport.connect(false).await;

    assert_eq!(fixture.requests_to(&fixture.credentials_path()).await, 1);
    assert_eq!(fixture.requests_to(REGISTRATION_PATH).await, 0);
    let certificates = fixture.broker.certificates();
    assert_eq!(certificates, vec![renewed.into_bytes()]);
    assert_ne!(certificates[0], expiring.into_bytes());
    assert_eq!(fixture.broker.connect_calls(), 1);
}

#[tokio::test]
async fn test_connack_timeout_with_revoked_certificate_pairs_again() {
    let fixture = Fixture::new().await;
    fixture.provision(90);
    fixture.mount_verify(false).await;
    let renewed = fixture.mount_certificate().await;
    let mut transport = fixture.transport();
    transport.connect(false).await;

    fixture.broker.connack_timeout();
    transport.process_pending_events().await;

    assert_eq!(fixture.requests_to(&format!("{}/verify", fixture.credentials_path())).await, 1);
    assert_eq!(fixture.broker.disconnect_calls(), 1);
    assert_eq!(fixture.broker.client_ids().len(), 2);
    assert_eq!(fixture.broker.certificates()[1], renewed.into_bytes());
    assert_eq!(fixture.broker.connect_calls(), 2);
}

#[tokio::test]
async fn test_connack_timeout_with_valid_certificate_keeps_session() {
    let fixture = Fixture::new().await;
    fixture.provision(90);
    fixture.mount_verify(true).await;
    let mut transport = fixture.transport();
    transport.connect(false).await;

    fixture.broker.connack_timeout();
    transport.process_pending_events().await;

    assert_eq!(fixture.broker.client_ids().len(), 1);
    assert_eq!(fixture.broker.disconnect_calls(), 0);
    assert_eq!(fixture.requests_to(&fixture.credentials_path()).await, 0);
}

#[tokio::test]
async fn test_fresh_session_receives_full_resync() {
    // Arrange: one confirmed property from an earlier session
    let fixture = Fixture::new().await;
    fixture.provision(90);
    let mut transport = fixture.transport();
    fixture.connect(&mut transport, false).await;
    transport
        .publish(PublishRequest::new(SETTINGS, "/foo", AstarteValue::String("bar".into())))
        .await
        .unwrap();
    fixture.confirm_all(&mut transport).await;
    let property_topic = format!("{ROOT}/{SETTINGS}/foo");
    let property_payload = fixture.broker.published_to(&property_topic)[0].payload.clone();
    fixture.broker.clear_history();

    // Act: the broker comes back without the session
    fixture.broker.drop_connection();
    fixture.broker.accept_connection(false);
    transport.process_pending_events().await;

    // Assert: subscriptions
    let subscriptions = fixture.broker.subscriptions();
    assert_eq!(
        subscriptions,
        vec![
            format!("{ROOT}/control/#"),
            format!("{ROOT}/{COMMANDS}"),
            format!("{ROOT}/{COMMANDS}/#"),
            format!("{ROOT}/{CONFIGURATION}"),
            format!("{ROOT}/{CONFIGURATION}/#"),
        ]
    );

    // Assert: introspection, emptyCache and producer properties
    let introspection = fixture.broker.published_to(ROOT);
    assert_eq!(introspection.len(), 1);
    assert_eq!(
        String::from_utf8(introspection[0].payload.clone()).unwrap(),
        "org.example.Commands:1:1;org.example.Configuration:2:0;\
         org.example.Sensors:1:0;org.example.Settings:0:2"
    );
    let empty_cache = fixture.broker.published_to(&format!("{ROOT}/control/emptyCache"));
    assert_eq!(empty_cache.len(), 1);
    assert_eq!(empty_cache[0].payload, b"1".to_vec());
    assert_eq!(empty_cache[0].qos, Qos::ExactlyOnce);

    let producer = fixture
        .broker
        .published_to(&format!("{ROOT}/control/producer/properties"));
    assert_eq!(producer.len(), 1);
    assert_eq!(
        decode_producer_properties(&producer[0].payload).unwrap(),
        vec![format!("{SETTINGS}/foo")]
    );

    // Assert: the cached property is republished as is and tracked
    let republished = fixture.broker.published_to(&property_topic);
    assert_eq!(republished.len(), 1);
    assert_eq!(republished[0].payload, property_payload);
    assert_eq!(transport.cache().in_flight_ids(), vec![republished[0].id]);

    // Assert: synced only once the broker confirmed the resync
    assert!(!transport.is_synced());
    fixture.confirm_all(&mut transport).await;
    assert!(transport.is_synced());
    assert!(transport.cache().in_flight_ids().is_empty());
    assert_eq!(transport.cache().durable_message_count(), 0);
}

#[tokio::test]
async fn test_resync_interrupted_before_confirmation_is_repeated() {
    // Arrange: a synced session with one cached property
    let fixture = Fixture::new().await;
    fixture.provision(90);
    let mut transport = fixture.transport();
    fixture.connect(&mut transport, false).await;
    transport
        .publish(PublishRequest::new(SETTINGS, "/foo", AstarteValue::String("bar".into())))
        .await
        .unwrap();
    fixture.confirm_all(&mut transport).await;
    assert!(transport.is_synced());

    // Act: a fresh session starts a resync, then drops before any confirmation
    fixture.broker.drop_connection();
    fixture.broker.accept_connection(false);
    transport.process_pending_events().await;
    assert!(!transport.is_synced());
    fixture.broker.drop_connection();
    transport.process_pending_events().await;

    // Assert: the property republish went back to the retry queue
    assert!(!transport.is_synced());
    assert!(transport.cache().in_flight_ids().is_empty());
    assert_eq!(transport.cache().all_retry_ids().len(), 1);

    // Act: the broker now claims to have kept the session
    fixture.broker.clear_history();
    fixture.broker.accept_connection(true);
    transport.process_pending_events().await;

    // Assert: the resync is sent again, the property once
    assert_eq!(fixture.broker.published_to(ROOT).len(), 1);
    assert_eq!(
        fixture
            .broker
            .published_to(&format!("{ROOT}/control/emptyCache"))
            .len(),
        1
    );
    assert_eq!(
        fixture
            .broker
            .published_to(&format!("{ROOT}/{SETTINGS}/foo"))
            .len(),
        1
    );
    assert!(transport.cache().all_retry_ids().is_empty());

    fixture.confirm_all(&mut transport).await;
    assert!(transport.is_synced());
    assert_eq!(transport.cache().durable_message_count(), 0);
}

#[tokio::test]
async fn test_broker_without_mqtt_v1_is_retried_at_endpoint_interval() {
    // Arrange: discovery offers only an unknown protocol twice
    let fixture = Fixture::without_broker_info().await;
    fixture.provision(90);
    Mock::given(method("GET"))
        .and(path(fixture.broker_info_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {
                "version": "2.0.0",
                "protocols": {"astarte_mqtt_v2": {"broker_url": "mqtts://broker.example.com:8883"}}
            }
        })))
        .up_to_n_times(2)
        .mount(&fixture.server)
        .await;
    fixture.mount_broker_info("astarte_mqtt_v1").await;
    let mut transport = fixture.transport().with_options(TransportOptions {
        pairing_retry: RetryPolicy::new(Duration::from_secs(300), 0.0),
        endpoint_retry: RetryPolicy::new(Duration::from_millis(5), 0.0),
        reboot_retry: None,
    });

    // Act
    tokio::time::timeout(Duration::from_secs(10), transport.connect(false))
        .await
        .expect("broker info retried at the pairing interval");

    // Assert
    assert_eq!(fixture.requests_to(&fixture.broker_info_path()).await, 3);
    assert_eq!(fixture.broker.connect_calls(), 1);
}

#[tokio::test]
async fn test_resumed_session_skips_resync_once_synced() {
    let fixture = Fixture::new().await;
    fixture.provision(90);
    let mut transport = fixture.transport();

    // Never synced: a resumed session still gets the resync
    fixture.connect(&mut transport, true).await;
    fixture.confirm_all(&mut transport).await;
    assert!(transport.is_synced());
    assert_eq!(fixture.broker.published_to(ROOT).len(), 1);

    fixture.broker.clear_history();
    fixture.broker.drop_connection();
    fixture.broker.accept_connection(true);
    transport.process_pending_events().await;

    assert!(fixture.broker.published().is_empty());
    assert!(fixture.broker.subscriptions().is_empty());
}

#[tokio::test]
async fn test_sync_flag_survives_restart() {
    let fixture = Fixture::new().await;
    fixture.provision(90);
    {
        let mut transport = fixture.transport();
        fixture.connect(&mut transport, false).await;
        fixture.confirm_all(&mut transport).await;
        assert!(transport.is_synced());
    }
    fixture.broker.clear_history();

    let mut transport = fixture.transport();
    assert!(transport.is_synced());
    fixture.connect(&mut transport, true).await;

    assert!(fixture.broker.published().is_empty());
}

#[tokio::test]
async fn test_inbound_messages_are_routed_to_adapters() {
    let fixture = Fixture::new().await;
    fixture.provision(90);
    let mut transport = fixture.transport();
    let commands = RecordingAdapter::new();
    let configuration = RecordingAdapter::new();
    transport.register_adapter(COMMANDS, commands.clone());
    transport.register_adapter(CONFIGURATION, configuration.clone());
    fixture.connect(&mut transport, false).await;

    fixture
        .broker
        .deliver(&format!("{ROOT}/{COMMANDS}/led/state"), b"on");
    fixture
        .broker
        .deliver(&format!("{ROOT}/{CONFIGURATION}/threshold"), b"");
    fixture
        .broker
        .deliver(&format!("{ROOT}/control/consumer/properties"), b"\0\0\0\0");
    fixture
        .broker
        .deliver(&format!("other/device/{COMMANDS}/led/state"), b"off");
    fixture
        .broker
        .deliver(&format!("{ROOT}/org.example.Unknown/x"), b"1");
    let handled = transport.process_pending_events().await;

    assert_eq!(handled, 5);
    assert_eq!(
        commands.calls(),
        vec![AdapterCall::Receive {
            interface: COMMANDS.to_string(),
            path: "/led/state".to_string(),
            payload: b"on".to_vec(),
        }]
    );
    assert_eq!(
        configuration.calls(),
        vec![AdapterCall::Unset {
            interface: CONFIGURATION.to_string(),
            path: "/threshold".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_pairing_state_is_observable() {
    let fixture = Fixture::new().await;
    fixture.mount_registration().await;
    fixture.mount_certificate().await;
    let mut transport = fixture.transport();
    let state = transport.pairing().subscribe_state();
    assert_eq!(*state.borrow(), PairingState::Unpaired);

    transport.connect(false).await;

    assert_eq!(*state.borrow(), PairingState::Paired);
    assert!(transport.snapshot().paired);
}
