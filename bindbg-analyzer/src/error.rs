//! 解析ツール側のエラー

use thiserror::Error;

/// ユーザー操作が受け付けられなかった理由
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalyzerError {
    #[error("{0} is not being debugged")]
    NotDebugged(String),

    #[error("{0} is already being debugged")]
    AlreadyDebugged(String),

    #[error("Unknown analysis context '{0}'")]
    UnknownContext(String),

    #[error("Not connected to the debugger yet")]
    NotConnected,

    #[error("Address 0x{0:x} is outside the analyzed module")]
    OutsideModule(u64),
}
