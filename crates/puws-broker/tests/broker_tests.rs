//! Session broker integration tests against an in-memory engine.

use std::sync::Arc;

use puws_broker::broker::{SessionBroker, SessionStatus};
use puws_broker::credential::derive_password;
use puws_broker::seed::Seed;

mod common;
use common::{BrokenHost, DesktopOutput, FakeHost, FakeRuntime, TEST_SEED, test_broker};

fn broker_with(runtime: &Arc<FakeRuntime>) -> SessionBroker {
    test_broker(Arc::clone(runtime), Arc::new(FakeHost::default()))
}

#[tokio::test]
async fn test_new_user_gets_lowest_free_port() {
    let runtime = Arc::new(
        FakeRuntime::new(DesktopOutput::Ready)
            .with_running("desktop-ann", 5901)
            .with_running("desktop-ben", 5902)
            .with_running("desktop-cat", 5903),
    );
    let broker = broker_with(&runtime);

    let session = broker.connect_or_start("alice").await.unwrap();
    assert_eq!(session.port, 5904);
    assert_eq!(session.status, SessionStatus::Ready);
    assert!(session.created);
    assert_eq!(runtime.creates(), 1);

    let config = runtime.last_config().unwrap();
    assert_eq!(config.name.as_deref(), Some("desktop-alice"));
    assert_eq!(config.exposed_ports, vec![5904]);
    assert_eq!(config.command.last().map(String::as_str), Some("4"));
}

#[tokio::test]
async fn test_second_call_reuses_session() {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::Ready));
    let broker = broker_with(&runtime);

    let first = broker.connect_or_start("alice").await.unwrap();
    let second = broker.connect_or_start("alice").await.unwrap();

    assert!(!second.created);
    assert_eq!(first.port, second.port);
    assert_eq!(first.password.as_str(), second.password.as_str());
    assert_eq!(first.container_id, second.container_id);
    assert_eq!(runtime.creates(), 1);
}

#[tokio::test]
async fn test_existing_container_is_rediscovered() {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::Ready).with_running("desktop-alice", 5911));
    let host = Arc::new(FakeHost::default());
    let broker = test_broker(Arc::clone(&runtime), host.clone());

    let session = broker.connect_or_start("alice").await.unwrap();
    assert_eq!(session.port, 5911);
    assert!(!session.created);
    assert_eq!(runtime.creates(), 0);
    assert_eq!(host.calls(), 0);

    // Password depends on seed and username only, not on the port.
    let expected = derive_password(&Seed::from_bytes(TEST_SEED.to_vec()), "alice").unwrap();
    assert_eq!(session.password.as_str(), expected.as_str());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_create_one_container() {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::Ready));
    let broker = Arc::new(broker_with(&runtime));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.connect_or_start("alice").await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(runtime.creates(), 1);
    assert_eq!(results.iter().filter(|s| s.created).count(), 1);
    for session in &results {
        assert_eq!(session.port, results[0].port);
        assert_eq!(session.password.as_str(), results[0].password.as_str());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_users_get_distinct_ports() {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::Ready));
    let broker = Arc::new(broker_with(&runtime));

    let handles: Vec<_> = ["alice", "bob", "carol", "dave"]
        .into_iter()
        .map(|user| {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.connect_or_start(user).await })
        })
        .collect();

    let mut ports = Vec::new();
    for handle in handles {
        ports.push(handle.await.unwrap().unwrap().port);
    }
    ports.sort_unstable();
    assert_eq!(ports, vec![5901, 5902, 5903, 5904]);
    assert_eq!(runtime.creates(), 4);
}

#[tokio::test]
async fn test_full_range_is_capacity_error() {
    let mut runtime = FakeRuntime::new(DesktopOutput::Ready);
    for port in 5901..=5920 {
        runtime = runtime.with_running(&format!("desktop-u{port}"), port);
    }
    let runtime = Arc::new(runtime);
    let broker = broker_with(&runtime);

    let err = broker.connect_or_start("alice").await.unwrap_err();
    assert_eq!(err.error_code(), "no_free_sessions");
    assert_eq!(runtime.creates(), 0);

    // Existing users are still served.
    let session = broker.connect_or_start("u5907").await.unwrap();
    assert_eq!(session.port, 5907);
}

#[tokio::test]
async fn test_desktop_exiting_early_is_readiness_failure() {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::ExitsEarly));
    let broker = broker_with(&runtime);

    let err = broker.connect_or_start("alice").await.unwrap_err();
    assert_eq!(err.error_code(), "readiness_failed");
    assert!(err.to_string().contains("alice"));

    // The container is left running for operators to inspect.
    let sessions = broker.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].username, "alice");
}

#[tokio::test(start_paused = true)]
async fn test_silent_desktop_times_out() {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::Silent));
    let broker = broker_with(&runtime);

    let err = broker.connect_or_start("alice").await.unwrap_err();
    assert_eq!(err.error_code(), "readiness_timeout");
}

#[tokio::test]
async fn test_host_failure_creates_nothing() {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::Ready));
    let broker = test_broker(Arc::clone(&runtime), Arc::new(BrokenHost));

    let err = broker.connect_or_start("alice").await.unwrap_err();
    assert_eq!(err.error_code(), "identity_provisioning_failed");
    assert!(err.to_string().contains("alice"));
    assert_eq!(runtime.creates(), 0);
}

#[tokio::test]
async fn test_invalid_username_never_reaches_engine() {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::Ready));
    let broker = broker_with(&runtime);

    for name in ["", "../root", "-rf", "a b"] {
        let err = broker.connect_or_start(name).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_username", "{name:?}");
    }
    assert_eq!(runtime.creates(), 0);
}

#[tokio::test]
async fn test_start_failure_leaves_created_container() {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::Ready).failing_start());
    let broker = broker_with(&runtime);

    let err = broker.connect_or_start("alice").await.unwrap_err();
    assert_eq!(err.error_code(), "engine_error");
    let message = err.to_string();
    assert!(
        message.contains(&format!("start container {:064x}", 1)),
        "{message}"
    );

    // No retry and no cleanup.
    assert_eq!(runtime.creates(), 1);
    assert_eq!(runtime.container_count(), 1);
    assert!(broker.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_session_started_while_waiting_is_reused() {
    let runtime = Arc::new(
        FakeRuntime::new(DesktopOutput::Ready).appearing_on_second_list("desktop-alice", 5907),
    );
    let host = Arc::new(FakeHost::default());
    let broker = test_broker(Arc::clone(&runtime), host.clone());

    let session = broker.connect_or_start("alice").await.unwrap();
    assert!(!session.created);
    assert_eq!(session.port, 5907);
    assert_eq!(runtime.lists(), 2);
    assert_eq!(runtime.creates(), 0);
    assert_eq!(host.calls(), 0);
}

#[tokio::test]
async fn test_inventory_failure_creates_nothing() {
    let runtime = Arc::new(FakeRuntime::new(DesktopOutput::Ready).failing_list());
    let broker = broker_with(&runtime);

    let err = broker.connect_or_start("alice").await.unwrap_err();
    assert_eq!(err.error_code(), "engine_error");
    assert_eq!(runtime.creates(), 0);
}
