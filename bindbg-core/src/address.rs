//! アドレス正規化
//!
//! ワイヤ上のアドレスは常にモジュールのロードベースからのオフセットです。
//! ベースは各サイドがローカルに計算し、送信されることはありません。

use crate::SyncError;

/// モジュール相対アドレス（ロードベースからの符号付きオフセット）
///
/// ヒープ上のオブジェクトなどはモジュールより下位にあり得るため符号付きです。
pub type RelativeAddress = i64;

/// 解析対象モジュールのロード範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRange {
    base: u64,
    size: u64,
}

impl ModuleRange {
    /// ロードベースとサイズから範囲を作成する
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// ロードベースを取得する
    pub fn base(&self) -> u64 {
        self.base
    }

    /// モジュールのサイズを取得する
    pub fn size(&self) -> u64 {
        self.size
    }

    /// プロセス絶対アドレスをモジュール相対アドレスに変換する
    pub fn to_relative(&self, addr: u64) -> RelativeAddress {
        addr.wrapping_sub(self.base) as i64
    }

    /// モジュール相対アドレスをプロセス絶対アドレスに変換する
    pub fn to_absolute(&self, rel: RelativeAddress) -> u64 {
        self.base.wrapping_add(rel as u64)
    }

    /// 相対アドレスが `[0, size)` に収まるか
    pub fn contains_relative(&self, rel: RelativeAddress) -> bool {
        rel >= 0 && (rel as u64) < self.size
    }

    /// 絶対アドレスがモジュール内にあるか
    pub fn contains(&self, addr: u64) -> bool {
        self.contains_relative(self.to_relative(addr))
    }

    /// 範囲内の相対アドレスだけを絶対アドレスに変換する
    ///
    /// 範囲外のアドレスは古いセッションや別モジュールからのメッセージとみなし、
    /// `ProtocolViolation` を返します。
    pub fn checked_absolute(&self, rel: RelativeAddress) -> Result<u64, SyncError> {
        if self.contains_relative(rel) {
            Ok(self.to_absolute(rel))
        } else {
            Err(SyncError::ProtocolViolation {
                addr: rel,
                size: self.size,
            })
        }
    }
}
