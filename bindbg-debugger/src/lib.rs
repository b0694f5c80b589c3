//! bindbg デバッガ側
//!
//! デバッガのネイティブ状態（ブレークポイント、命令ポインタ）を監視して解析ツール側へ送り、
//! 解析ツール側からのコマンドをデバッガに適用します。

pub mod backend;
pub mod listing;
pub mod server;
pub mod session;
pub mod vtable;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;

pub use backend::{DebuggerBackend, ExecutionStatus, SymbolInfo};
pub use listing::{ListingLine, ListingParser, Operand};
pub use server::serve;
pub use session::{DebuggerSession, SessionEnd};
pub use vtable::{VtableEvent, VtableReference, VtableResolver};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use ptrace::PtraceBackend;

/// デバッガ側の結果型
pub type Result<T> = anyhow::Result<T>;
