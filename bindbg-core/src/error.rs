//! 同期処理のエラー

use crate::RelativeAddress;
use thiserror::Error;

/// トランスポート層のエラー
///
/// どの種類もセッションにとって致命的です。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Framing(String),
    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
}

/// リコンシリエーションループが扱うエラー
#[derive(Debug, Error)]
pub enum SyncError {
    /// 通信路の障害。セッションを終了させる
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// デバッガのネイティブAPIの失敗。相手に報告して次のティックで再試行する
    #[error("{0:#}")]
    NativeQuery(anyhow::Error),
    /// モジュール範囲外のアドレス。黙って破棄する
    #[error("address {addr:#x} is outside the module (size {size:#x})")]
    ProtocolViolation { addr: RelativeAddress, size: u64 },
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::NativeQuery(err)
    }
}
