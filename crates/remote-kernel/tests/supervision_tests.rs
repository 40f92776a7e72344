//! Tunnel health and keep-alive behaviour.

#![cfg(feature = "mock")]

use std::sync::Arc;
use std::time::Duration;

use remote_kernel::mock::{MockSpawner, MockTransport, ScriptedCredentials};
use remote_kernel::{
    ConnectionInfo, InteractiveSession, LogContext, RemoteError, SessionSupervisor,
    SupervisorState, TunnelHealth, TunnelHop, TunnelSet,
};

fn info() -> ConnectionInfo {
    ConnectionInfo {
        hb_port: 10001,
        shell_port: 10002,
        iopub_port: 10003,
        stdin_port: 10004,
        control_port: 10005,
        ..ConnectionInfo::default()
    }
}

fn tunnel_set(spawner: &MockSpawner, credentials: ScriptedCredentials) -> TunnelSet {
    let hop = TunnelHop::new(&["gw".to_string()], "node7", &info()).expect("hop");
    TunnelSet::new(
        hop,
        Arc::new(spawner.clone()),
        Arc::new(credentials),
        &LogContext::disabled(),
    )
    .with_auth_window(Duration::from_millis(50))
    .with_stop_grace(Duration::from_millis(50))
}

fn remote_session(transport: &MockTransport) -> InteractiveSession {
    InteractiveSession::from_transport(
        Box::new(transport.clone()),
        "srun bash -i",
        Arc::new(ScriptedCredentials::default()),
        &LogContext::disabled(),
    )
    .with_grace(Duration::from_millis(10))
}

#[tokio::test]
async fn ensure_alive_is_idempotent_on_a_live_tunnel() {
    let spawner = MockSpawner::new();
    spawner
        .push(MockTransport::new().exit_on("exit"))
        .push(MockTransport::new());
    let mut tunnels = tunnel_set(&spawner, ScriptedCredentials::default());
    tunnels.establish().await.expect("establish");

    for _ in 0..3 {
        assert_eq!(tunnels.ensure_alive().await.expect("check"), TunnelHealth::Alive);
    }
    assert_eq!(spawner.spawn_count(), 2);
    assert_eq!(tunnels.rebuilds(), 0);
}

#[tokio::test]
async fn dead_tunnel_is_rebuilt_with_fresh_credentials() {
    let spawner = MockSpawner::new();
    let first = MockTransport::new();
    let second = MockTransport::new()
        .with_output("carol@gw's password: ")
        .on_line("hunter2", "\r\n");
    spawner
        .push(MockTransport::new().exit_on("exit"))
        .push(first.clone())
        .push(second.clone());
    let credentials = ScriptedCredentials::new(["hunter2"]);
    let mut tunnels = tunnel_set(&spawner, credentials.clone());
    tunnels.establish().await.expect("establish");

    first.kill();
    assert_eq!(tunnels.ensure_alive().await.expect("rebuild"), TunnelHealth::Rebuilt);
    assert!(tunnels.is_alive());
    assert!(second.alive());
    assert_eq!(second.written_lines(), vec!["hunter2"]);
    assert_eq!(credentials.prompts(), vec!["carol@gw's password:"]);
    assert_eq!(tunnels.rebuilds(), 1);

    // The host key is only accepted once.
    assert_eq!(spawner.spawn_count(), 3);
    assert!(spawner.commands()[2].contains("-S none"));
}

#[tokio::test]
async fn failed_rebuild_reports_tunnel_down() {
    let spawner = MockSpawner::new();
    let first = MockTransport::new();
    spawner
        .push(MockTransport::new().exit_on("exit"))
        .push(first.clone())
        .push_failure();
    let mut tunnels = tunnel_set(&spawner, ScriptedCredentials::default());
    tunnels.establish().await.expect("establish");

    first.kill();
    let err = tunnels.ensure_alive().await.expect_err("no process left");
    assert!(matches!(err, RemoteError::TunnelDown { ref host, .. } if host == "node7"));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn supervisor_restores_tunnel_within_one_tick() {
    let spawner = MockSpawner::new();
    let first = MockTransport::new();
    let second = MockTransport::new();
    spawner
        .push(MockTransport::new().exit_on("exit"))
        .push(first.clone())
        .push(second.clone());
    let mut tunnels = tunnel_set(&spawner, ScriptedCredentials::default());
    tunnels.establish().await.expect("establish");

    let remote = MockTransport::new();
    let mut supervisor =
        SessionSupervisor::new(remote_session(&remote), Some(tunnels), &LogContext::disabled());
    assert_eq!(supervisor.tick().await, SupervisorState::Running);

    first.kill();
    assert_eq!(supervisor.tick().await, SupervisorState::Running);
    assert_eq!(
        supervisor.history(),
        [
            SupervisorState::Running,
            SupervisorState::TunnelDown,
            SupervisorState::Running
        ]
    );
    assert!(second.alive());
    assert_eq!(supervisor.tunnels().map(TunnelSet::rebuilds), Some(1));
}

#[tokio::test]
async fn supervisor_retries_a_failed_rebuild() {
    let spawner = MockSpawner::new();
    let first = MockTransport::new();
    let third = MockTransport::new();
    spawner
        .push(MockTransport::new().exit_on("exit"))
        .push(first.clone())
        .push_failure()
        .push(third.clone());
    let mut tunnels = tunnel_set(&spawner, ScriptedCredentials::default());
    tunnels.establish().await.expect("establish");

    let remote = MockTransport::new();
    let mut supervisor =
        SessionSupervisor::new(remote_session(&remote), Some(tunnels), &LogContext::disabled());

    first.kill();
    assert_eq!(supervisor.tick().await, SupervisorState::TunnelDown);
    assert_eq!(supervisor.tick().await, SupervisorState::Running);
    assert!(third.alive());
}

#[tokio::test]
async fn remote_exit_wins_over_tunnel_checks() {
    let spawner = MockSpawner::new();
    let first = MockTransport::new();
    spawner
        .push(MockTransport::new().exit_on("exit"))
        .push(first.clone());
    let mut tunnels = tunnel_set(&spawner, ScriptedCredentials::default());
    tunnels.establish().await.expect("establish");

    let remote = MockTransport::new();
    let mut supervisor =
        SessionSupervisor::new(remote_session(&remote), Some(tunnels), &LogContext::disabled());

    remote.push_output("KeyboardInterrupt\n");
    remote.kill();
    first.kill();
    assert_eq!(supervisor.tick().await, SupervisorState::RemoteExited);
    assert_eq!(spawner.spawn_count(), 2);

    assert!(!supervisor.interrupt().await.expect("ignored"));
    assert!(remote.raw_input().is_empty());
}

#[tokio::test]
async fn stop_closes_tunnel_and_session() {
    let spawner = MockSpawner::new();
    let tunnel = MockTransport::new();
    spawner
        .push(MockTransport::new().exit_on("exit"))
        .push(tunnel.clone());
    let mut tunnels = tunnel_set(&spawner, ScriptedCredentials::default());
    tunnels.establish().await.expect("establish");

    let remote = MockTransport::new().exit_on("exit");
    let mut supervisor =
        SessionSupervisor::new(remote_session(&remote), Some(tunnels), &LogContext::disabled())
            .with_stop_grace(Duration::from_millis(50));

    supervisor.stop().await.expect("stop");
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(!tunnel.alive());
    assert!(!remote.alive());
}
