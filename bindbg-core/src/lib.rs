//! bindbg 同期プロトコルのコア
//!
//! このクレートは、解析ツール側とデバッガ側の間でやり取りするメッセージ、
//! モジュール相対アドレスへの正規化、トランスポート、条件分岐の分岐先解決を提供します。

pub mod address;
pub mod branch;
pub mod config;
pub mod error;
pub mod message;
pub mod parse;
pub mod transport;

pub use address::{ModuleRange, RelativeAddress};
pub use branch::{resolve_branch_target, Condition, Flags};
pub use config::SyncConfig;
pub use error::{SyncError, TransportError};
pub use message::{InstrKind, Message, RegisterSnapshot};
pub use transport::{Acceptor, Connector, Transport};

/// コア機能の結果型
pub type Result<T> = anyhow::Result<T>;
