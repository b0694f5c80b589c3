//! メッセージトランスポート
//!
//! 名前付きのローカルIPCエンドポイント上の双方向チャネルです。
//! 片方が待ち受け、もう片方が接続します。メッセージは丸ごと、順序通りに届きます。

pub mod frame;
pub mod memory;
#[cfg(unix)]
pub mod socket;

use crate::{Message, TransportError};
use std::time::Duration;

pub use memory::MemoryTransport;
#[cfg(unix)]
pub use socket::{Endpoint, Listener, SocketTransport};

/// 双方向メッセージチャネル
///
/// ループのスレッドとUIのスレッドから同時に使えるよう、すべて `&self` で操作します。
pub trait Transport: Send + Sync {
    /// メッセージを1つ送信する
    fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// 最大 `timeout` だけ受信を待つ
    ///
    /// タイムアウトした場合は `Ok(None)` を返します。
    /// 閉じられた接続は `Err(TransportError::Closed)` になります。
    fn poll(&self, timeout: Duration) -> Result<Option<Message>, TransportError>;

    /// 接続を閉じる。何度呼んでもよい
    fn close(&self);

    /// 接続が閉じられているか
    fn is_closed(&self) -> bool;
}

/// 接続する側
pub trait Connector: Send {
    /// 既存のエンドポイントへの接続を1回だけ試みる
    fn connect(&mut self) -> Result<Box<dyn Transport>, TransportError>;
}

/// 待ち受ける側
pub trait Acceptor {
    /// 次のピアを受け入れる
    fn accept(&mut self) -> Result<Box<dyn Transport>, TransportError>;
}
