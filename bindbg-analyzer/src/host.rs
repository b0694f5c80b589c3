//! 解析ツール（ホスト）とのインターフェース

use bindbg_core::ModuleRange;

/// 命令に付けるハイライト
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Highlight {
    #[default]
    None,
    /// 現在の命令ポインタ
    InstructionPointer,
    /// 有効なブレークポイント
    Breakpoint,
    /// 停止したブレークポイント
    BreakpointHit,
    /// 条件分岐の実際の分岐先
    BranchTarget,
}

impl Highlight {
    /// 表示色
    pub fn color(&self) -> &'static str {
        match self {
            Highlight::None => "none",
            Highlight::InstructionPointer => "yellow",
            Highlight::Breakpoint => "red",
            Highlight::BreakpointHit => "orange",
            Highlight::BranchTarget => "green",
        }
    }
}

/// ホストが解析済みの1命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInstruction {
    pub mnemonic: String,
    /// オペランドの表記（分岐先の解析に使う）
    pub operands: String,
    pub length: u64,
}

/// 静的解析ツール
///
/// セッションのスレッドとUIのスレッドの両方から呼ばれるため、すべて `&self` で操作します。
/// アドレスはすべて解析ツール上の絶対アドレスです。
pub trait AnalysisHost: Send + Sync {
    /// 解析中のモジュールのロードベースとサイズ
    fn module(&self) -> ModuleRange;

    /// 解析対象に含まれるアドレスか
    fn is_valid(&self, addr: u64) -> bool;

    /// `addr` を含む関数の開始アドレス
    fn containing_function(&self, addr: u64) -> Option<u64>;

    fn highlight(&self, addr: u64, highlight: Highlight);

    fn set_comment(&self, addr: u64, comment: &str);

    /// 表示位置を移動する
    fn navigate(&self, addr: u64);

    /// `addr` にあるシンボルの完全な名前
    fn symbol_at(&self, addr: u64) -> Option<String>;

    fn instruction(&self, addr: u64) -> Option<HostInstruction>;
}
