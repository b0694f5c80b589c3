//! vtable参照のコメント表記

use crate::host::AnalysisHost;
use bindbg_core::InstrKind;

/// 呼び出し元に付けるコメントを作る
///
/// - 参照先のみ: `Foo::bar`
/// - オブジェクト付き: `Foo::bar (from Foo object)`
/// - `lea` の場合は先頭に `(ptr)` を付ける
///
/// 名前の無いアドレスは16進数で表記します。
pub fn vtable_comment(host: &dyn AnalysisHost, target: u64, object: Option<u64>, instr: InstrKind) -> String {
    let target_name = host.symbol_at(target).unwrap_or_else(|| format!("0x{:x}", target));

    let Some(object) = object else {
        return target_name;
    };

    let class = match host.symbol_at(object) {
        Some(name) => class_name(&name).to_string(),
        None => format!("0x{:x}", object),
    };
    let comment = format!("{} (from {} object)", target_name, class);
    if instr == InstrKind::Lea {
        format!("(ptr){}", comment)
    } else {
        comment
    }
}

/// vtableシンボルからクラス名を取り出す（先頭の `::` 区切りの要素）
fn class_name(symbol: &str) -> &str {
    let symbol = symbol.strip_prefix("vtable for ").unwrap_or(symbol);
    symbol.split("::").next().unwrap_or(symbol)
}
