//! ユーザー操作

/// 解析ツール側のユーザー操作
///
/// 位置は未解決の文字列（シンボル名またはアドレス）のまま保持します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// セッションを開始
    Start,
    /// セッションを終了
    Stop,
    /// ブレークポイントを設定
    SetBreakpoint(String),
    /// ブレークポイントを削除
    DeleteBreakpoint(String),
    /// 命令ポインタを移動
    SetIp(String),
    /// 指定位置まで実行
    RunTo(String),
    /// 実行継続
    Go,
    /// 実行を中断
    Break,
    StepIn,
    StepOver,
    StepOut,
    /// デバッガ側の状態を取り直す
    Sync,
    /// デバッグ対象に渡す引数を設定
    SetArgs(Vec<String>),
    /// ハイライトとコメントの一覧
    Show,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Action {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let (&name, rest) = parts.split_first()?;
        let location = || {
            if rest.is_empty() {
                None
            } else {
                Some(rest.join(" "))
            }
        };

        match name {
            "start" => Some(Action::Start),
            "stop" => Some(Action::Stop),
            "break" | "b" => location().map(Action::SetBreakpoint),
            "delete" | "d" => location().map(Action::DeleteBreakpoint),
            "setip" | "ip" => location().map(Action::SetIp),
            "until" | "u" => location().map(Action::RunTo),
            "go" | "g" | "continue" | "c" => Some(Action::Go),
            "pause" | "interrupt" => Some(Action::Break),
            "step" | "s" => Some(Action::StepIn),
            "next" | "n" => Some(Action::StepOver),
            "finish" | "f" => Some(Action::StepOut),
            "sync" => Some(Action::Sync),
            "args" => Some(Action::SetArgs(rest.iter().map(|s| s.to_string()).collect())),
            "show" => Some(Action::Show),
            "help" | "h" | "?" => Some(Action::Help),
            "quit" | "q" | "exit" => Some(Action::Quit),
            _ => None,
        }
    }
}
