//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use bindbg_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e))
    } else {
        s.parse::<u64>()
            .or_else(|_| {
                // 10進数でもダメなら16進数として解釈を試みる
                u64::from_str_radix(s, 16)
            })
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
    }
}

/// 逆アセンブル表記の数値リテラルをパース
///
/// 逆アセンブラの出力では数値は常に16進数です。
/// `0x30`、`30h`、`00401000`（WinDbg形式）のいずれも受け付けます。
///
/// # Examples
/// ```
/// use bindbg_core::parse::parse_hex_literal;
///
/// assert_eq!(parse_hex_literal("30h"), Some(0x30));
/// assert_eq!(parse_hex_literal("0x8"), Some(8));
/// assert_eq!(parse_hex_literal("00401000"), Some(0x401000));
/// ```
pub fn parse_hex_literal(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits = if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        rest
    } else if let Some(rest) = s.strip_suffix('h').or_else(|| s.strip_suffix('H')) {
        rest
    } else {
        s
    };

    // WinDbgは64ビットアドレスを `00007ff6`0040a000` のように区切る
    let digits: String = digits.chars().filter(|&c| c != '`').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(&digits, 16).ok()
}
