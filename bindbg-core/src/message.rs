//! 同期メッセージ
//!
//! ワイヤ上の形は `{"command": "...", "params": {...}}` です。
//! アドレスはすべてモジュール相対アドレスで運ばれます。

use crate::RelativeAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// レジスタ名 -> 値
pub type RegisterSnapshot = BTreeMap<String, u64>;

/// vtable参照を生んだ命令の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrKind {
    Call,
    Mov,
    Lea,
}

impl InstrKind {
    /// ニーモニック表記
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrKind::Call => "call",
            InstrKind::Mov => "mov",
            InstrKind::Lea => "lea",
        }
    }
}

/// 同期メッセージ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum Message {
    /// 相手側に現在の状態をすべて送らせる
    Sync,
    SetBp {
        addr: RelativeAddress,
    },
    DeleteBp {
        addr: RelativeAddress,
    },
    /// 命令ポインタの移動
    SetIp {
        ip: RelativeAddress,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regs: Option<RegisterSnapshot>,
    },
    /// ブレークポイントで停止した
    BpHit {
        addr: RelativeAddress,
        #[serde(default)]
        regs: RegisterSnapshot,
    },
    Go,
    Break,
    StepIn,
    StepOver,
    StepOut,
    RunTo {
        addr: RelativeAddress,
    },
    /// 推定された仮想呼び出し先
    Vtable {
        ip: RelativeAddress,
        target: RelativeAddress,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        object: Option<RelativeAddress>,
        instr: InstrKind,
    },
    /// 相手側のログに表示するテキスト
    Print {
        message: String,
    },
}

impl Message {
    /// コマンド名を取得する
    pub fn command(&self) -> &'static str {
        match self {
            Message::Sync => "sync",
            Message::SetBp { .. } => "set_bp",
            Message::DeleteBp { .. } => "delete_bp",
            Message::SetIp { .. } => "set_ip",
            Message::BpHit { .. } => "bp_hit",
            Message::Go => "go",
            Message::Break => "break",
            Message::StepIn => "step_in",
            Message::StepOver => "step_over",
            Message::StepOut => "step_out",
            Message::RunTo { .. } => "run_to",
            Message::Vtable { .. } => "vtable",
            Message::Print { .. } => "print",
        }
    }

    /// `print` メッセージを作成する
    pub fn print(message: impl Into<String>) -> Self {
        Message::Print {
            message: message.into(),
        }
    }
}
