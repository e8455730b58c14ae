mod common;

use common::{eventually, quiet_config, EchoService, Harness};
use hopwire_client::{ClientError, ConnectionConfig, ErrorKind};
use hopwire_proto::auth::{AUTH_SERVICE, LOGON, LOGON_FAULT};
use hopwire_proto::properties::{PASSWORD, USER};
use hopwire_proto::Properties;
use hopwire_test_utils::{ECHO_INTERFACE, REJECTED_USER};
use std::time::Duration;
use tokio::task::JoinSet;

#[tokio::test]
async fn test_construction_exhaustion_lists_every_endpoint_in_order() {
    let harness = Harness::new(0);

    let err = harness
        .connect_to("hopwire://gamma:3,alpha:1,beta:2", true, quiet_config())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Exhaustion);
    match &err {
        ClientError::Exhausted { attempts } => assert_eq!(attempts.len(), 3),
        other => panic!("Expected exhaustion, got {:?}", other),
    }

    let message = err.to_string();
    let gamma = message.find("gamma:3").unwrap();
    let alpha = message.find("alpha:1").unwrap();
    let beta = message.find("beta:2").unwrap();
    assert!(gamma < alpha && alpha < beta, "{}", message);
}

#[tokio::test]
async fn test_construction_skips_dead_endpoints() {
    let harness = Harness::new(3);
    harness.cluster.kill(&harness.endpoints[0]);
    harness.cluster.set_silent(&harness.endpoints[1], true);

    let connection = harness.connect(false, quiet_config()).await.unwrap();

    assert_eq!(
        connection.current_endpoint().await,
        Some(harness.endpoints[2].clone())
    );
    let echo: EchoService = connection.get_service();
    assert_eq!(echo.whoami().await.unwrap(), "s2:3");
}

#[tokio::test]
async fn test_rejected_logon_aborts_construction() {
    let harness = Harness::new(2);
    let mut props = Properties::new().with(USER, REJECTED_USER);

    let err = hopwire_client::Connection::connect(
        &harness.url(),
        &mut props,
        harness.factory.clone(),
        quiet_config(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.remote_fault().unwrap().type_name, LOGON_FAULT);
    assert!(!err.is_connection_class());
    assert_eq!(
        harness
            .cluster
            .request_count(&harness.endpoints[1], AUTH_SERVICE, LOGON),
        0
    );
    assert_eq!(harness.factory.pooled_count().await, 0);
}

#[tokio::test]
async fn test_single_connection_failure_is_retried_transparently() {
    let harness = Harness::new(2);
    let connection = harness.connect(true, quiet_config()).await.unwrap();
    let echo: EchoService = connection.get_service();
    assert_eq!(echo.echo("one").await.unwrap(), "one");

    harness.cluster.drop_next_requests(&harness.endpoints[0], 1);

    assert_eq!(echo.echo("two").await.unwrap(), "two");
    assert_eq!(
        connection.current_endpoint().await,
        Some(harness.endpoints[1].clone())
    );
    assert_eq!(
        harness
            .cluster
            .request_count(&harness.endpoints[0], ECHO_INTERFACE, "echo"),
        2
    );
    assert_eq!(
        harness
            .cluster
            .request_count(&harness.endpoints[1], ECHO_INTERFACE, "echo"),
        1
    );
}

#[tokio::test]
async fn test_failover_wraps_back_to_recovered_endpoint() {
    let harness = Harness::new(2);
    let connection = harness.connect(true, quiet_config()).await.unwrap();
    let echo: EchoService = connection.get_service();

    // Move to s1, with s0 down meanwhile
    harness.cluster.kill(&harness.endpoints[0]);
    let proxy = &echo;
    assert!(eventually(Duration::from_secs(2), move || async move {
        proxy.whoami().await.ok().as_deref() == Some("s1:2")
    })
    .await);

    harness.cluster.revive(&harness.endpoints[0]);
    harness.cluster.kill(&harness.endpoints[1]);

    assert_eq!(echo.whoami().await.unwrap(), "s0:1");
}

#[tokio::test]
async fn test_second_consecutive_failure_propagates() {
    let harness = Harness::new(1);
    let connection = harness.connect(true, quiet_config()).await.unwrap();
    let echo: EchoService = connection.get_service();

    // The call and the reconnect logon are both cut off
    harness.cluster.drop_next_requests(&harness.endpoints[0], 2);

    let err = echo.echo("lost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exhaustion);
    assert!(err.to_string().contains("s0:1"));
    assert_eq!(connection.current_endpoint().await, None);

    // The next call reconnects from scratch
    assert_eq!(echo.echo("back").await.unwrap(), "back");
    assert_eq!(
        connection.current_endpoint().await,
        Some(harness.endpoints[0].clone())
    );
}

#[tokio::test]
async fn test_concurrent_callers_share_one_failover() {
    let harness = Harness::new(3);
    let connection = harness.connect(true, quiet_config()).await.unwrap();
    let proxies: Vec<EchoService> = (0..10).map(|_| connection.get_service()).collect();

    harness.cluster.kill(&harness.endpoints[0]);

    let mut calls = JoinSet::new();
    for (i, echo) in proxies.into_iter().enumerate() {
        calls.spawn(async move { echo.echo(&format!("call-{}", i)).await });
    }
    let mut answered = 0;
    while let Some(result) = calls.join_next().await {
        assert!(result.unwrap().unwrap().starts_with("call-"));
        answered += 1;
    }

    assert_eq!(answered, 10);
    assert_eq!(
        connection.current_endpoint().await,
        Some(harness.endpoints[1].clone())
    );
    assert_eq!(
        harness
            .cluster
            .request_count(&harness.endpoints[1], AUTH_SERVICE, LOGON),
        1
    );
    assert_eq!(harness.cluster.connection_count(&harness.endpoints[2]), 0);
}

#[tokio::test]
async fn test_caller_and_ping_race_into_one_failover() {
    let harness = Harness::new(2);
    let connection = harness.connect(true, quiet_config()).await.unwrap();
    let echo: EchoService = connection.get_service();

    harness.cluster.kill(&harness.endpoints[0]);

    let (call, ping) = tokio::join!(echo.echo("racing"), connection.ping());
    assert_eq!(call.unwrap(), "racing");
    ping.unwrap();

    assert_eq!(
        connection.current_endpoint().await,
        Some(harness.endpoints[1].clone())
    );
    assert_eq!(
        harness
            .cluster
            .request_count(&harness.endpoints[1], AUTH_SERVICE, LOGON),
        1
    );
    assert_eq!(harness.factory.session_count(&harness.endpoints[1]).await, 1);
}

#[tokio::test]
async fn test_failover_disabled_fails_immediately() {
    let harness = Harness::new(2);
    let connection = harness.connect(false, quiet_config()).await.unwrap();
    let echo: EchoService = connection.get_service();

    harness.cluster.drop_next_requests(&harness.endpoints[0], 1);

    let err = echo.echo("x").await.unwrap_err();
    assert!(err.is_connection_class());
    assert_eq!(harness.cluster.connection_count(&harness.endpoints[1]), 0);

    let err = echo.echo("y").await.unwrap_err();
    assert!(err.is_connection_class());
    assert_eq!(harness.cluster.connection_count(&harness.endpoints[1]), 0);
}

#[tokio::test]
async fn test_application_fault_is_not_retried() {
    let harness = Harness::new(2);
    let connection = harness.connect(true, quiet_config()).await.unwrap();
    let echo: EchoService = connection.get_service();

    let err = echo.fail("bad input").await.unwrap_err();
    match err {
        ClientError::Remote(fault) => assert_eq!(fault.message, "bad input"),
        other => panic!("Expected declared fault, got {:?}", other),
    }
    assert_eq!(
        harness
            .cluster
            .request_count(&harness.endpoints[0], ECHO_INTERFACE, "fail"),
        1
    );
    assert_eq!(harness.cluster.connection_count(&harness.endpoints[1]), 0);
}

#[tokio::test]
async fn test_call_timeout_is_not_retried() {
    let harness = Harness::new(2);
    let connection = harness.connect(true, quiet_config()).await.unwrap();
    let echo: EchoService = connection.get_service();

    harness.cluster.set_unresponsive(&harness.endpoints[0], true);

    let err = echo.echo("slow").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(harness.cluster.connection_count(&harness.endpoints[1]), 0);
    assert_eq!(
        connection.current_endpoint().await,
        Some(harness.endpoints[0].clone())
    );
}

#[tokio::test]
async fn test_background_ping_fails_over_dead_instance() {
    let harness = Harness::new(2);
    let config = ConnectionConfig {
        ping_interval: Duration::from_millis(50),
        ..ConnectionConfig::default()
    };
    let connection = harness.connect(true, config).await.unwrap();

    harness.cluster.kill(&harness.endpoints[0]);

    let handle = &connection;
    let target = &harness.endpoints[1];
    let moved = eventually(Duration::from_secs(3), move || async move {
        handle.current_endpoint().await.as_ref() == Some(target)
    })
    .await;
    assert!(moved, "ping task never failed over");

    let echo: EchoService = connection.get_service();
    assert_eq!(echo.whoami().await.unwrap(), "s1:2");
    connection.close().await;
}

#[tokio::test]
async fn test_ping_timeout_counts_as_dead_instance() {
    let harness = Harness::new(2);
    let connection = harness.connect(true, quiet_config()).await.unwrap();

    harness.cluster.set_unresponsive(&harness.endpoints[0], true);

    connection.ping().await.unwrap();
    assert_eq!(
        connection.current_endpoint().await,
        Some(harness.endpoints[1].clone())
    );
}

#[tokio::test]
async fn test_authenticate_uses_updated_properties() {
    let harness = Harness::new(1);
    let connection = harness.connect(false, quiet_config()).await.unwrap();
    let first = connection.session_id().await.unwrap();

    connection.set_property(USER, "bob").await;
    connection.set_property(PASSWORD, "hunter2").await;
    let logon = connection.authenticate().await.unwrap();

    assert_eq!(logon.user_name, "bob");
    assert_ne!(logon.session_id, first);
    assert_eq!(connection.session_id().await, Some(logon.session_id));
    assert_eq!(harness.factory.session_count(&harness.endpoints[0]).await, 1);

    let seen = harness
        .cluster
        .last_logon_properties(&harness.endpoints[0])
        .unwrap();
    assert_eq!(seen.get(PASSWORD), Some("hunter2"));
}
