//! プロセス内トランスポート
//!
//! 2つの端点をチャネルで結びます。テストや、両サイドを同じプロセスで動かす場合に使います。

use super::Transport;
use crate::{Message, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// プロセス内トランスポートの端点
pub struct MemoryTransport {
    tx: Mutex<Sender<Message>>,
    rx: Mutex<Receiver<Message>>,
    /// 両端で共有する切断フラグ
    closed: Arc<AtomicBool>,
}

/// 互いに接続された端点のペアを作成する
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    let closed = Arc::new(AtomicBool::new(false));

    let a = MemoryTransport {
        tx: Mutex::new(a_tx),
        rx: Mutex::new(a_rx),
        closed: Arc::clone(&closed),
    };
    let b = MemoryTransport {
        tx: Mutex::new(b_tx),
        rx: Mutex::new(b_rx),
        closed,
    };
    (a, b)
}

impl Transport for MemoryTransport {
    fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(message.clone())
            .map_err(|_| TransportError::Closed)
    }

    fn poll(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        match rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
