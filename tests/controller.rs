//! Controller lifecycle tests

mod common;

use common::{harness, settle, state_dir};
use ptproxy::ports::FixedPorts;
use ptproxy::{Controller, ControllerConfig, Error, PortPolicy, TransportId, TransportRegistry};
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;

/// Test starting a running transport hands back the same listener
#[tokio::test]
async fn test_start_is_idempotent() {
    let h = harness("idempotent", |c| c);

    let first = h.controller.start(TransportId::Obfs4, None).await.unwrap();
    let second = h.controller.start(TransportId::Obfs4, None).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.probe.launches.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.local_address(TransportId::Obfs4), Some(first));
    assert_eq!(h.controller.port(TransportId::Obfs4), Some(first.port()));
    assert!(first.ip().is_loopback());

    h.controller.stop(TransportId::Obfs4).await;
}

/// Test stopping a transport that never started
#[tokio::test]
async fn test_stop_not_running() {
    let h = harness("stopnoop", |c| c);

    h.controller.stop(TransportId::Snowflake).await;
    assert!(!h.controller.is_running(TransportId::Snowflake));
    assert!(h.events.stopped.lock().is_empty());
}

/// Test address and port are cleared by stop and a restart binds anew
#[tokio::test]
async fn test_address_cleared_after_stop() {
    let h = harness("cleared", |c| c);

    h.controller.start(TransportId::MeekLite, None).await.unwrap();
    h.controller.stop(TransportId::MeekLite).await;

    assert_eq!(h.controller.local_address(TransportId::MeekLite), None);
    assert_eq!(h.controller.port(TransportId::MeekLite), None);
    assert!(!h.controller.is_running(TransportId::MeekLite));

    let again = h.controller.start(TransportId::MeekLite, None).await.unwrap();
    assert!(h.controller.is_running(TransportId::MeekLite));
    assert_eq!(h.probe.launches.load(Ordering::SeqCst), 2);
    assert!(again.ip().is_loopback());

    h.controller.stop_all().await;
    assert!(h.controller.running().is_empty());
}

/// Test a state directory that cannot be used is refused up front
#[tokio::test]
async fn test_unwritable_state_dir() {
    // A regular file stands in for an unusable directory, even as root
    let path = state_dir("notadir");
    std::fs::write(&path, b"x").unwrap();

    let result = Controller::new(ControllerConfig::new(&path), TransportRegistry::new(), None);
    let err = result.err().expect("state dir accepted");
    assert!(matches!(err, Error::StateDir { .. }));
    assert!(err.to_string().contains("writable directory"));

    std::fs::remove_file(&path).ok();
}

/// Test a malformed proxy URL fails start before anything is bound
#[tokio::test]
async fn test_bad_proxy_url() {
    let h = harness("badproxy", |c| c);

    for proxy in ["not a url", "ftp://127.0.0.1:21"] {
        let err = h.controller.start(TransportId::Obfs4, Some(proxy)).await.unwrap_err();
        assert!(matches!(err, Error::ProxyUrl { .. }), "{err}");
        assert!(err.is_configuration());
    }

    assert!(!h.controller.is_running(TransportId::Obfs4));
    assert_eq!(h.probe.launches.load(Ordering::SeqCst), 0);
}

/// Test unknown transports are refused
#[tokio::test]
async fn test_unregistered_transport() {
    let controller = Controller::new(ControllerConfig::new(state_dir("unknown")), TransportRegistry::new(), None).unwrap();

    let err = controller.start(TransportId::Obfs4, None).await.unwrap_err();
    assert!(matches!(err, Error::UnknownTransport(_)));
    assert!(!controller.is_running(TransportId::Obfs4));
}

/// Test fixed ports skip an occupied candidate and keep their order
#[tokio::test]
async fn test_fixed_ports_increment() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = occupied.local_addr().unwrap().port();

    let ports = FixedPorts::default()
        .with_base(TransportId::MeekLite, base)
        .with_base(TransportId::Obfs4, base);
    let h = harness("fixed", |c| c.with_ports(PortPolicy::Fixed(ports)));

    let meek = h.controller.start(TransportId::MeekLite, None).await.unwrap();
    assert!(meek.port() > base);

    let obfs4 = h.controller.start(TransportId::Obfs4, None).await.unwrap();
    assert!(obfs4.port() > meek.port());

    h.controller.stop_all().await;
}

/// Test connected fires on start for transports other than snowflake
#[tokio::test]
async fn test_connected_on_start() {
    let h = harness("connected", |c| c);

    h.controller.start(TransportId::Obfs3, None).await.unwrap();
    h.controller.start(TransportId::Snowflake, None).await.unwrap();
    settle().await;

    assert_eq!(h.events.connected.lock().clone(), vec![TransportId::Obfs3]);
    h.controller.stop_all().await;
}

/// Test the state directory is created with the controller
#[tokio::test]
async fn test_state_dir_created() {
    let dir = state_dir("created").join("nested");
    let controller = Controller::new(ControllerConfig::new(&dir), TransportRegistry::new(), None).unwrap();

    assert!(dir.is_dir());
    assert_eq!(controller.state_dir(), dir.as_path());
}
