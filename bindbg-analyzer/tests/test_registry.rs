//! セッションレジストリのテスト

mod common;

use bindbg_analyzer::{AnalyzerError, DebuggerLauncher, SessionRegistry};
use bindbg_core::transport::memory::{pair, MemoryTransport};
use bindbg_core::{Connector, Message, Transport};
use common::*;
use std::sync::{Arc, Mutex};

struct Fixture {
    registry: SessionRegistry,
    log: Arc<Mutex<LaunchLog>>,
    peer: MemoryTransport,
}

/// デバッガが1つ待ち受けている環境
fn fixture() -> Fixture {
    let (local, peer) = pair();
    let slot: Slot = Arc::new(Mutex::new(Some(local)));
    let log = Arc::new(Mutex::new(LaunchLog::default()));

    let connector_slot = Arc::clone(&slot);
    let launcher_slot = Arc::clone(&slot);
    let launcher_log = Arc::clone(&log);
    let registry = SessionRegistry::new(
        fast_config(),
        Box::new(move |_endpoint: &str| -> Box<dyn Connector> {
            Box::new(SlotConnector(Arc::clone(&connector_slot)))
        }),
        Box::new(move || -> Box<dyn DebuggerLauncher> {
            Box::new(MockLauncher {
                log: Arc::clone(&launcher_log),
                slot: Arc::clone(&launcher_slot),
                ready: None,
            })
        }),
    );
    registry.open("app", Arc::new(MockHost::default()), "/opt/app/app", "app-pipe");
    Fixture { registry, log, peer }
}

fn not_debugged(result: anyhow::Result<()>) -> bool {
    matches!(
        result.unwrap_err().downcast_ref::<AnalyzerError>(),
        Some(AnalyzerError::NotDebugged(context)) if context == "app"
    )
}

#[test]
fn test_actions_without_session_report_not_debugged() {
    let fixture = fixture();
    let registry = &fixture.registry;

    assert!(not_debugged(registry.set_bp("app", BASE + 0x10)));
    assert!(not_debugged(registry.delete_bp("app", BASE + 0x10)));
    assert!(not_debugged(registry.set_ip("app", BASE + 0x10)));
    assert!(not_debugged(registry.run_to("app", BASE + 0x10)));
    assert!(not_debugged(registry.interrupt("app")));
    assert!(not_debugged(registry.step_in("app")));
    assert!(not_debugged(registry.step_over("app")));
    assert!(not_debugged(registry.step_out("app")));
    assert!(not_debugged(registry.sync("app")));
    assert!(not_debugged(registry.stop("app")));

    let err = registry.session("app").err().unwrap();
    assert_eq!(err.to_string(), "app is not being debugged");
}

#[test]
fn test_go_starts_missing_session() {
    let fixture = fixture();
    let registry = &fixture.registry;

    registry.go("app").unwrap();
    let session = registry.session("app").unwrap();
    assert!(wait_until(|| session.is_connected()));
    assert_eq!(expect_message(&fixture.peer), Message::Sync);

    // 2回目のgoは実行継続として送られる
    registry.go("app").unwrap();
    assert_eq!(expect_message(&fixture.peer), Message::Go);

    let err = registry.start("app").err().unwrap();
    assert_eq!(
        err.downcast_ref::<AnalyzerError>(),
        Some(&AnalyzerError::AlreadyDebugged("app".to_string()))
    );
}

#[test]
fn test_stop_deregisters_session() {
    let fixture = fixture();
    let registry = &fixture.registry;

    let session = registry.start("app").unwrap();
    assert!(wait_until(|| session.is_connected()));
    registry.stop("app").unwrap();

    assert!(session.is_stopped());
    assert!(registry.session("app").is_err());
    assert!(fixture.peer.is_closed());
}

#[test]
fn test_lost_connection_deregisters_session() {
    let Fixture { registry, peer, .. } = fixture();

    let session = registry.start("app").unwrap();
    assert!(wait_until(|| session.is_connected()));
    drop(peer);

    assert!(wait_until(|| registry.session("app").is_err()));
}

#[test]
fn test_process_args_reach_launch_request() {
    let fixture = fixture();
    let registry = &fixture.registry;
    drop(fixture.peer);

    registry.open("other", Arc::new(MockHost::default()), "/srv/other/bin/tool", "other-pipe");
    registry
        .set_args("other", vec!["-c".to_string(), "conf".to_string()])
        .unwrap();
    assert_eq!(registry.args("other"), Some(vec!["-c".to_string(), "conf".to_string()]));

    // 待ち受けている接続を先に使い切り、次のセッションでは起動させる
    let first = registry.start("app").unwrap();
    assert!(wait_until(|| first.is_stopped()));

    let session = registry.start("other").unwrap();
    assert!(wait_until(|| fixture.log.lock().unwrap().requests.len() == 1));
    {
        let log = fixture.log.lock().unwrap();
        assert_eq!(log.requests[0].endpoint, "other-pipe");
        assert_eq!(log.requests[0].args, vec!["-c".to_string(), "conf".to_string()]);
        assert_eq!(log.requests[0].cwd, std::path::PathBuf::from("/srv/other/bin"));
    }
    registry.stop("other").unwrap();
    assert!(session.is_stopped());
    assert_eq!(fixture.log.lock().unwrap().closes, 1);
}

#[test]
fn test_unknown_context_is_rejected() {
    let fixture = fixture();
    let err = fixture.registry.start("missing").err().unwrap();
    assert_eq!(
        err.downcast_ref::<AnalyzerError>(),
        Some(&AnalyzerError::UnknownContext("missing".to_string()))
    );
    assert!(fixture.registry.set_args("missing", Vec::new()).is_err());
}

#[test]
fn test_close_context_stops_session() {
    let fixture = fixture();
    let session = fixture.registry.start("app").unwrap();
    assert!(wait_until(|| session.is_connected()));

    fixture.registry.close("app");
    assert!(session.is_stopped());
    assert!(fixture.registry.start("app").is_err());
}
