//! 同期ループの設定

use std::time::Duration;

/// ポーリング間隔の既定値
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 割り込み後に停止が反映されるまで待つ時間の既定値
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// デバッガ起動待ちの再接続間隔の既定値
pub const DEFAULT_CONNECT_RETRY: Duration = Duration::from_secs(2);

/// 両サイドのループ設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// 受信待ちの最大時間（1ティック）
    pub poll_interval: Duration,
    /// 割り込み後の待ち時間
    ///
    /// デバッガAPIは実際に止まる前に「停止」を報告することがあります。
    pub settle_delay: Duration,
    /// 接続失敗時の再試行間隔
    pub connect_retry: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            connect_retry: DEFAULT_CONNECT_RETRY,
        }
    }
}
