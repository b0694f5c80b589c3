//! デバッガ側セッションのテスト

mod common;

use bindbg_core::transport::memory::{pair, MemoryTransport};
use bindbg_core::{InstrKind, Message, Transport};
use bindbg_debugger::{DebuggerSession, ExecutionStatus, SessionEnd};
use common::{fast_config, MockBackend, BASE, SIZE};
use std::time::Duration;

const SHORT: Duration = Duration::from_millis(5);

fn session(backend: &mut MockBackend) -> (DebuggerSession<'_, MockBackend>, MemoryTransport) {
    let (local, peer) = pair();
    let session = DebuggerSession::new(backend, Box::new(local), fast_config()).unwrap();
    (session, peer)
}

/// 届いているメッセージをすべて受け取る
fn drain(peer: &MemoryTransport) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Some(message) = peer.poll(SHORT).unwrap() {
        messages.push(message);
    }
    messages
}

#[test]
fn test_sync_sends_ip_then_every_breakpoint() {
    let mut backend = MockBackend::new().with_breakpoints(&[0x20, 0x10]);
    let (mut session, peer) = session(&mut backend);

    peer.send(&Message::Sync).unwrap();
    assert_eq!(session.tick(), None);

    let messages = drain(&peer);
    assert_eq!(messages.len(), 3);
    match &messages[0] {
        Message::SetIp { ip, regs } => {
            assert_eq!(*ip, 0x100);
            assert_eq!(regs.as_ref().unwrap()["rip"], BASE + 0x100);
        }
        other => panic!("expected set_ip, got {:?}", other),
    }
    assert_eq!(messages[1], Message::SetBp { addr: 0x10 });
    assert_eq!(messages[2], Message::SetBp { addr: 0x20 });
}

#[test]
fn test_breakpoint_commands_converge_without_echo() {
    let mut backend = MockBackend::new().with_breakpoints(&[0x10, 0x20]);
    let (mut session, peer) = session(&mut backend);
    assert_eq!(session.tick(), None);
    drain(&peer);

    for message in [
        Message::SetBp { addr: 0x30 },
        Message::DeleteBp { addr: 0x10 },
        Message::SetBp { addr: 0x30 },
        Message::DeleteBp { addr: 0x40 },
    ] {
        peer.send(&message).unwrap();
        assert_eq!(session.tick(), None);
    }

    let expected = [BASE + 0x20, BASE + 0x30];
    assert!(session.tracked().iter().eq(expected.iter()));
    assert!(session.backend().breakpoints.iter().eq(expected.iter()));
    assert!(drain(&peer).is_empty());

    // 同じアドレスへの重複した設定はネイティブ側に1回だけ届く
    let adds = session
        .backend()
        .calls
        .iter()
        .filter(|call| call.starts_with("add_breakpoint"))
        .count();
    assert_eq!(adds, 1);
}

#[test]
fn test_native_breakpoint_changes_are_reported() {
    let mut backend = MockBackend::new().with_breakpoints(&[0x20]);
    let (mut session, peer) = session(&mut backend);
    session.tick();
    drain(&peer);

    session.backend_mut().breakpoints.remove(&(BASE + 0x20));
    session.backend_mut().breakpoints.insert(BASE + 0x50);
    session.backend_mut().breakpoints.insert(BASE + 0x60);
    session.tick();

    assert_eq!(
        drain(&peer),
        vec![
            Message::SetBp { addr: 0x50 },
            Message::SetBp { addr: 0x60 },
            Message::DeleteBp { addr: 0x20 },
        ]
    );
}

#[test]
fn test_out_of_module_addresses_are_dropped() {
    let mut backend = MockBackend::new();
    let (mut session, peer) = session(&mut backend);
    session.tick();
    drain(&peer);

    for message in [
        Message::SetBp { addr: SIZE as i64 },
        Message::SetBp { addr: -4 },
        Message::SetIp { ip: SIZE as i64 + 0x10, regs: None },
        Message::RunTo { addr: -1 },
    ] {
        peer.send(&message).unwrap();
        assert_eq!(session.tick(), None);
    }

    assert!(session.tracked().is_empty());
    assert!(session.backend().breakpoints.is_empty());
    assert_eq!(session.backend().ip, BASE + 0x100);
    assert!(session.backend().calls.is_empty());
    assert!(drain(&peer).is_empty());
}

#[test]
fn test_ip_changes_report_set_ip_or_bp_hit() {
    let mut backend = MockBackend::new().with_breakpoints(&[0x200]);
    let (mut session, peer) = session(&mut backend);
    session.tick();
    assert!(matches!(drain(&peer)[..], [Message::SetIp { ip: 0x100, .. }]));

    // 変化がなければ何も送らない
    session.tick();
    assert!(drain(&peer).is_empty());

    session.backend_mut().ip = BASE + 0x200;
    session.tick();
    assert!(matches!(drain(&peer)[..], [Message::BpHit { addr: 0x200, .. }]));
}

#[test]
fn test_set_ip_from_peer_is_not_echoed() {
    let mut backend = MockBackend::new();
    let (mut session, peer) = session(&mut backend);
    session.tick();
    drain(&peer);

    peer.send(&Message::SetIp { ip: 0x400, regs: None }).unwrap();
    session.tick();
    session.tick();

    assert_eq!(session.backend().ip, BASE + 0x400);
    assert!(drain(&peer).is_empty());
}

#[test]
fn test_set_ip_from_peer_reports_vtable_reference() {
    let mut backend = MockBackend::new();
    let ip = BASE + 0x400;
    let vtable = BASE + 0x3000;
    backend
        .listings
        .insert(ip, format!("{:016x} ff5008 call qword ptr [rax + 8]", ip));
    backend.set_reg("rax", vtable);
    backend.write_pointer(vtable + 8, BASE + 0x1500);
    let (mut session, peer) = session(&mut backend);
    session.tick();
    drain(&peer);

    peer.send(&Message::SetIp { ip: 0x400, regs: None }).unwrap();
    session.tick();
    session.tick();

    assert_eq!(
        drain(&peer),
        vec![Message::Vtable {
            ip: 0x400,
            target: 0x1500,
            object: None,
            instr: InstrKind::Call,
        }]
    );
}

#[test]
fn test_message_while_running_interrupts_and_resumes() {
    let mut backend = MockBackend::new();
    backend.status = ExecutionStatus::Running;
    let (mut session, peer) = session(&mut backend);

    peer.send(&Message::SetBp { addr: 0x30 }).unwrap();
    assert_eq!(session.tick(), None);

    assert_eq!(
        session.backend().calls,
        vec!["interrupt".to_string(), format!("add_breakpoint {:#x}", BASE + 0x30), "go".to_string()]
    );
    assert_eq!(session.backend().status, ExecutionStatus::Running);
    // 実行を再開したティックでは状態を報告しない
    assert!(drain(&peer).is_empty());
}

#[test]
fn test_break_leaves_target_stopped() {
    let mut backend = MockBackend::new();
    backend.status = ExecutionStatus::Running;
    let (mut session, peer) = session(&mut backend);

    peer.send(&Message::Break).unwrap();
    session.tick();

    assert_eq!(session.backend().calls, vec!["interrupt".to_string()]);
    assert_eq!(session.backend().status, ExecutionStatus::Stopped);
    assert!(matches!(drain(&peer)[..], [Message::SetIp { ip: 0x100, .. }]));
}

#[test]
fn test_execution_commands_reach_backend() {
    let mut backend = MockBackend::new();
    let (mut session, peer) = session(&mut backend);
    session.tick();
    drain(&peer);

    for message in [Message::StepIn, Message::StepOver, Message::StepOut, Message::RunTo { addr: 0x300 }, Message::Go] {
        peer.send(&message).unwrap();
        session.tick();
    }

    assert_eq!(
        session.backend().calls,
        vec![
            "step_in".to_string(),
            "step_over".to_string(),
            "step_out".to_string(),
            format!("run_to {:#x}", BASE + 0x300),
            // run_toで走り出しているので、goの前に一度止める
            "interrupt".to_string(),
            "go".to_string(),
        ]
    );
}

#[test]
fn test_native_failure_is_reported_as_print() {
    let mut backend = MockBackend::new();
    backend.fail_registers = true;
    let (mut session, peer) = session(&mut backend);

    assert_eq!(session.tick(), None);
    match &drain(&peer)[..] {
        [Message::Print { message }] => assert!(message.contains("register read failed")),
        other => panic!("expected a print, got {:?}", other),
    }

    // 次のティックで同じ命令ポインタを送り直す
    session.backend_mut().fail_registers = false;
    assert_eq!(session.tick(), None);
    assert!(matches!(drain(&peer)[..], [Message::SetIp { ip: 0x100, .. }]));
}

#[test]
fn test_vtable_event_is_module_relative() {
    let mut backend = MockBackend::new();
    let ip = BASE + 0x100;
    let vtable = BASE + 0x3000;
    backend
        .listings
        .insert(ip, format!("{:016x} ff5008 call qword ptr [rax + 8]", ip));
    backend.set_reg("rax", vtable);
    backend.write_pointer(vtable + 8, BASE + 0x1500);
    let (mut session, peer) = session(&mut backend);

    session.tick();
    let messages = drain(&peer);
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[1],
        Message::Vtable {
            ip: 0x100,
            target: 0x1500,
            object: None,
            instr: InstrKind::Call,
        }
    );
}

#[test]
fn test_lost_connection_ends_session_once() {
    let mut backend = MockBackend::new();
    let (mut session, peer) = session(&mut backend);
    drop(peer);

    let end = session.tick();
    assert!(matches!(end, Some(SessionEnd::Disconnected(_))));

    session.stop(SessionEnd::TargetTerminated);
    assert_eq!(session.ended(), end.as_ref());
    assert_eq!(session.tick(), end);
}

#[test]
fn test_target_exit_ends_session() {
    let mut backend = MockBackend::new();
    backend.status = ExecutionStatus::Terminated;
    let (mut session, peer) = session(&mut backend);

    assert_eq!(session.run(), SessionEnd::TargetTerminated);
    assert_eq!(session.tick(), Some(SessionEnd::TargetTerminated));
    assert!(peer.is_closed());
}
