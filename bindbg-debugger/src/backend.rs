//! デバッガのネイティブAPI
//!
//! セッションはこのトレイトを通してのみデバッガを操作します。
//! アドレスはすべてプロセス絶対アドレスです。

use crate::Result;
use bindbg_core::{ModuleRange, RegisterSnapshot};

/// ターゲットの実行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    Stopped,
    /// ターゲットプロセスが終了した
    Terminated,
}

/// アドレスに対応するシンボル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    pub address: u64,
    /// インポート（外部モジュールの関数）への参照か
    pub is_import: bool,
}

/// デバッガのバックエンド
pub trait DebuggerBackend {
    /// 現在の実行状態を取得する
    fn status(&mut self) -> Result<ExecutionStatus>;

    /// 実行を再開する
    fn go(&mut self) -> Result<()>;

    /// 実行中のターゲットを停止させる
    fn interrupt(&mut self) -> Result<()>;

    /// 1命令実行する（呼び出し先に入る）
    fn step_in(&mut self) -> Result<()>;

    /// 1命令実行する（呼び出しは飛び越す）
    fn step_over(&mut self) -> Result<()>;

    /// 現在の関数から戻るまで実行する
    fn step_out(&mut self) -> Result<()>;

    /// 指定アドレスまで実行する
    fn run_to(&mut self, addr: u64) -> Result<()>;

    /// 命令ポインタを取得する
    fn ip(&mut self) -> Result<u64>;

    /// 命令ポインタを設定する
    fn set_ip(&mut self, addr: u64) -> Result<()>;

    /// 全レジスタのスナップショットを取得する
    fn registers(&mut self) -> Result<RegisterSnapshot>;

    /// レジスタ値を名前で取得する
    fn register(&mut self, name: &str) -> Result<u64>;

    /// レジスタ値を名前で設定する
    fn set_register(&mut self, name: &str, value: u64) -> Result<()>;

    /// ブレークポイントの数
    fn breakpoint_count(&mut self) -> Result<usize>;

    /// ブレークポイントのアドレス一覧
    fn breakpoints(&mut self) -> Result<Vec<u64>>;

    /// ブレークポイントを設定する。既にあれば何もしない
    fn add_breakpoint(&mut self, addr: u64) -> Result<()>;

    /// ブレークポイントを削除する。なければ何もしない
    fn remove_breakpoint(&mut self, addr: u64) -> Result<()>;

    /// 1命令分の逆アセンブル結果を、デバッガの表示形式のまま返す
    fn disassemble(&mut self, addr: u64) -> Result<String>;

    /// ポインタサイズの値を読む
    fn read_pointer(&mut self, addr: u64) -> Result<u64>;

    /// アドレスが読み取り可能か
    fn is_valid(&mut self, addr: u64) -> bool;

    /// アドレスのシンボルを引く
    fn symbol_at(&mut self, addr: u64) -> Option<SymbolInfo>;

    /// 解析対象モジュールのロード範囲
    fn module(&mut self) -> Result<ModuleRange>;
}
