//! bindbg 解析ツール側
//!
//! 静的解析ツール（ホスト）とデバッガ側を同期させるセッションを提供します。
//! ホストはハイライトやコメントを表示し、ユーザー操作をデバッガ側に転送します。

pub mod command;
pub mod comment;
pub mod error;
pub mod host;
pub mod launcher;
pub mod registry;
pub mod session;

pub use command::Action;
pub use comment::vtable_comment;
pub use error::AnalyzerError;
pub use host::{AnalysisHost, Highlight, HostInstruction};
pub use launcher::{ChildLauncher, DebuggerLauncher, LaunchRequest};
pub use registry::{ConnectorFactory, LauncherFactory, SessionRegistry};
pub use session::{AnalyzerSession, SessionState};

/// 解析ツール側の結果型
pub type Result<T> = anyhow::Result<T>;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// ロックを取る。パニックしたスレッドが残した状態もそのまま使う
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
