//! デバッガ側のサーバ
//!
//! エンドポイントで待ち受け、接続ごとにセッションを実行します。
//! セッションが切断で終わると、再び待ち受けます。

use crate::backend::DebuggerBackend;
use crate::session::{DebuggerSession, SessionEnd};
use crate::Result;
use bindbg_core::{Acceptor, SyncConfig};
use tracing::{info, warn};

/// ターゲットが終了するまで接続を受け付ける
pub fn serve<B: DebuggerBackend + ?Sized>(
    acceptor: &mut dyn Acceptor,
    backend: &mut B,
    config: &SyncConfig,
) -> Result<()> {
    loop {
        let transport = acceptor.accept()?;
        info!("Connected to analyzer");

        let mut session = match DebuggerSession::new(&mut *backend, transport, *config) {
            Ok(session) => session,
            Err(e) => {
                // 接続はドロップで閉じられる
                warn!("failed to start session: {:#}", e);
                continue;
            }
        };

        match session.run() {
            SessionEnd::Disconnected(_) => continue,
            SessionEnd::TargetTerminated => return Ok(()),
        }
    }
}
