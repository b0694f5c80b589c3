//! ローカルソケット上のトランスポートのテスト

#![cfg(unix)]

use bindbg_core::transport::{Acceptor, Connector, Endpoint, Transport};
use bindbg_core::{Message, TransportError};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn endpoint(tag: &str) -> Endpoint {
    Endpoint::new(format!("test-{}-{}", tag, std::process::id()))
}

#[test]
fn test_connect_without_listener_fails_fast() {
    let mut endpoint = endpoint("nolistener");
    assert!(endpoint.connect().is_err());
}

#[test]
fn test_round_trip_over_socket() {
    let endpoint = endpoint("roundtrip");
    let mut listener = endpoint.listen().expect("Failed to listen");

    let mut client_endpoint = endpoint.clone();
    let client = thread::spawn(move || {
        let transport = client_endpoint.connect().expect("Failed to connect");
        transport.send(&Message::Sync).unwrap();
        transport.send(&Message::RunTo { addr: 0x42 }).unwrap();
        let reply = transport.poll(WAIT).unwrap();
        transport.close();
        reply
    });

    let server = listener.accept().expect("Failed to accept");
    assert_eq!(server.poll(WAIT).unwrap(), Some(Message::Sync));
    assert_eq!(server.poll(WAIT).unwrap(), Some(Message::RunTo { addr: 0x42 }));
    server.send(&Message::print("ok")).unwrap();

    assert_eq!(client.join().unwrap(), Some(Message::print("ok")));

    // ピアが閉じたら、こちらのpollは失敗する
    let mut result = server.poll(WAIT);
    while let Ok(None) = result {
        result = server.poll(WAIT);
    }
    assert!(matches!(result, Err(TransportError::Closed)));
}

#[test]
fn test_local_close_is_idempotent() {
    let endpoint = endpoint("close");
    let mut listener = endpoint.listen().expect("Failed to listen");
    let mut client_endpoint = endpoint.clone();
    let client = thread::spawn(move || client_endpoint.connect().expect("Failed to connect"));

    let server = listener.accept().expect("Failed to accept");
    let client = client.join().unwrap();

    server.close();
    server.close();
    assert!(server.is_closed());
    assert!(matches!(server.send(&Message::Go), Err(TransportError::Closed)));
    assert!(matches!(server.poll(WAIT), Err(TransportError::Closed)));
    drop(client);
}
