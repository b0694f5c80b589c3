//! 条件分岐の分岐先解決
//!
//! 命令アドレス、ニーモニック、フラグのスナップショットから、
//! 実行が次に進むアドレスを計算します。

use crate::parse::parse_hex_literal;
use crate::RegisterSnapshot;

const CF_BIT: u64 = 1 << 0;
const PF_BIT: u64 = 1 << 2;
const ZF_BIT: u64 = 1 << 6;
const SF_BIT: u64 = 1 << 7;
const OF_BIT: u64 = 1 << 11;

/// フラグレジスタ全体を表すレジスタ名（WinDbgは `efl`）
const FLAGS_WORD_NAMES: &[&str] = &["efl", "eflags", "rflags"];

/// x86の分岐条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Overflow,
    NotOverflow,
    Sign,
    NotSign,
    Zero,
    NotZero,
    Below,
    AboveOrEqual,
    BelowOrEqual,
    Above,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
    Parity,
    NotParity,
    /// `jcxz`: 下位16ビット
    CxZero,
    /// `jecxz`: 下位32ビット
    EcxZero,
    /// `jrcxz`: 64ビット全体
    RcxZero,
    /// `loop`: デクリメント後のカウンタが非ゼロ
    Loop,
    LoopWhileZero,
    LoopWhileNotZero,
}

impl Condition {
    /// ニーモニックから分岐条件を引く
    ///
    /// 条件分岐でないニーモニックは `None` になります。
    pub fn from_mnemonic(mnemonic: &str) -> Option<Self> {
        let condition = match mnemonic.trim().to_ascii_lowercase().as_str() {
            "jo" => Condition::Overflow,
            "jno" => Condition::NotOverflow,
            "js" => Condition::Sign,
            "jns" => Condition::NotSign,
            "je" | "jz" => Condition::Zero,
            "jne" | "jnz" => Condition::NotZero,
            "jb" | "jnae" | "jc" => Condition::Below,
            "jnb" | "jae" | "jnc" => Condition::AboveOrEqual,
            "jbe" | "jna" => Condition::BelowOrEqual,
            "ja" | "jnbe" => Condition::Above,
            "jl" | "jnge" => Condition::Less,
            "jge" | "jnl" => Condition::GreaterOrEqual,
            "jle" | "jng" => Condition::LessOrEqual,
            "jg" | "jnle" => Condition::Greater,
            "jp" | "jpe" => Condition::Parity,
            "jnp" | "jpo" => Condition::NotParity,
            "jcxz" => Condition::CxZero,
            "jecxz" => Condition::EcxZero,
            "jrcxz" => Condition::RcxZero,
            "loop" => Condition::Loop,
            "loope" | "loopz" => Condition::LoopWhileZero,
            "loopne" | "loopnz" => Condition::LoopWhileNotZero,
            _ => return None,
        };
        Some(condition)
    }

    /// 条件が成立するか（分岐するか）を判定する
    pub fn holds(self, flags: &Flags) -> bool {
        // loop系は判定前にカウンタを1減らす
        let counter_after_loop = flags.rcx.wrapping_sub(1) != 0;

        match self {
            Condition::Overflow => flags.of,
            Condition::NotOverflow => !flags.of,
            Condition::Sign => flags.sf,
            Condition::NotSign => !flags.sf,
            Condition::Zero => flags.zf,
            Condition::NotZero => !flags.zf,
            Condition::Below => flags.cf,
            Condition::AboveOrEqual => !flags.cf,
            Condition::BelowOrEqual => flags.cf || flags.zf,
            Condition::Above => !flags.cf && !flags.zf,
            Condition::Less => flags.sf != flags.of,
            Condition::GreaterOrEqual => flags.sf == flags.of,
            Condition::LessOrEqual => flags.zf || flags.sf != flags.of,
            Condition::Greater => !flags.zf && flags.sf == flags.of,
            Condition::Parity => flags.pf,
            Condition::NotParity => !flags.pf,
            Condition::CxZero => flags.rcx & 0xffff == 0,
            Condition::EcxZero => flags.rcx & 0xffff_ffff == 0,
            Condition::RcxZero => flags.rcx == 0,
            Condition::Loop => counter_after_loop,
            Condition::LoopWhileZero => counter_after_loop && flags.zf,
            Condition::LoopWhileNotZero => counter_after_loop && !flags.zf,
        }
    }
}

/// 分岐判定に使うフラグとカウントレジスタ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub cf: bool,
    pub pf: bool,
    pub zf: bool,
    pub sf: bool,
    pub of: bool,
    /// カウントレジスタ。取得できた最も広い幅の値
    pub rcx: u64,
}

impl Flags {
    /// レジスタスナップショットからフラグを取り出す
    ///
    /// 個別の疑似レジスタ（`zf` など）があればそれを優先し、
    /// なければフラグレジスタ全体（`efl` / `eflags` / `rflags`）のビットを読みます。
    pub fn from_snapshot(regs: &RegisterSnapshot) -> Self {
        let word = FLAGS_WORD_NAMES
            .iter()
            .find_map(|name| regs.get(*name).copied());
        let flag = |name: &str, bit: u64| match regs.get(name) {
            Some(value) => *value != 0,
            None => word.map(|w| w & bit != 0).unwrap_or(false),
        };

        let rcx = ["rcx", "ecx", "cx"]
            .iter()
            .find_map(|name| regs.get(*name).copied())
            .unwrap_or(0);

        Self {
            cf: flag("cf", CF_BIT),
            pf: flag("pf", PF_BIT),
            zf: flag("zf", ZF_BIT),
            sf: flag("sf", SF_BIT),
            of: flag("of", OF_BIT),
            rcx,
        }
    }
}

/// 分岐命令のオペランド表記から分岐先アドレスを取り出す
///
/// `0x401000`、`short 00401000`、`app!main+0x10 (00401010)` などを受け付けます。
pub fn parse_branch_target(operands: &str) -> Option<u64> {
    if let (Some(open), Some(close)) = (operands.rfind('('), operands.rfind(')')) {
        if open < close {
            if let Some(addr) = parse_hex_literal(&operands[open + 1..close]) {
                return Some(addr);
            }
        }
    }
    operands
        .split_whitespace()
        .last()
        .and_then(parse_hex_literal)
}

/// 実行が次に進むアドレスを計算する
///
/// 条件分岐以外の命令、レジスタが無い場合、条件不成立、分岐先が読めない場合は
/// いずれも `address + length`（フォールスルー）を返します。
pub fn resolve_branch_target(
    address: u64,
    mnemonic: &str,
    operands: &str,
    length: u64,
    regs: Option<&RegisterSnapshot>,
) -> u64 {
    let fall_through = address.wrapping_add(length);

    let Some(regs) = regs else {
        return fall_through;
    };
    let Some(condition) = Condition::from_mnemonic(mnemonic) else {
        return fall_through;
    };

    if condition.holds(&Flags::from_snapshot(regs)) {
        parse_branch_target(operands).unwrap_or(fall_through)
    } else {
        fall_through
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: u64 = 0x401000;
    const LEN: u64 = 2;
    const TARGET: u64 = 0x401080;

    fn regs(pairs: &[(&str, u64)]) -> RegisterSnapshot {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn resolve(mnemonic: &str, snapshot: &RegisterSnapshot) -> u64 {
        resolve_branch_target(ADDR, mnemonic, "0x401080", LEN, Some(snapshot))
    }

    fn taken(mnemonic: &str, snapshot: &RegisterSnapshot) -> bool {
        resolve(mnemonic, snapshot) == TARGET
    }

    #[test]
    fn test_je_truth_table() {
        assert_eq!(resolve("je", &regs(&[("zf", 1)])), TARGET);
        assert_eq!(resolve("je", &regs(&[("zf", 0)])), ADDR + LEN);
        assert_eq!(resolve("jz", &regs(&[("zf", 1)])), TARGET);
        assert_eq!(resolve("jne", &regs(&[("zf", 0)])), TARGET);
        assert_eq!(resolve("jnz", &regs(&[("zf", 1)])), ADDR + LEN);
    }

    #[test]
    fn test_single_flag_conditions() {
        let table: &[(&str, &str, bool)] = &[
            ("jo", "of", true),
            ("jno", "of", false),
            ("js", "sf", true),
            ("jns", "sf", false),
            ("jb", "cf", true),
            ("jnae", "cf", true),
            ("jc", "cf", true),
            ("jnb", "cf", false),
            ("jae", "cf", false),
            ("jnc", "cf", false),
            ("jp", "pf", true),
            ("jpe", "pf", true),
            ("jnp", "pf", false),
            ("jpo", "pf", false),
        ];
        for &(mnemonic, flag, taken_when_set) in table {
            assert_eq!(taken(mnemonic, &regs(&[(flag, 1)])), taken_when_set, "{mnemonic} {flag}=1");
            assert_eq!(taken(mnemonic, &regs(&[(flag, 0)])), !taken_when_set, "{mnemonic} {flag}=0");
        }
    }

    #[test]
    fn test_unsigned_compound_conditions() {
        for cf in 0..2u64 {
            for zf in 0..2u64 {
                let snapshot = regs(&[("cf", cf), ("zf", zf)]);
                let below_or_equal = cf == 1 || zf == 1;
                assert_eq!(taken("jbe", &snapshot), below_or_equal);
                assert_eq!(taken("jna", &snapshot), below_or_equal);
                assert_eq!(taken("ja", &snapshot), !below_or_equal);
                assert_eq!(taken("jnbe", &snapshot), !below_or_equal);
            }
        }
    }

    #[test]
    fn test_signed_compound_conditions() {
        for sf in 0..2u64 {
            for of in 0..2u64 {
                for zf in 0..2u64 {
                    let snapshot = regs(&[("sf", sf), ("of", of), ("zf", zf)]);
                    let less = sf != of;
                    let less_or_equal = zf == 1 || less;
                    assert_eq!(taken("jl", &snapshot), less);
                    assert_eq!(taken("jnge", &snapshot), less);
                    assert_eq!(taken("jge", &snapshot), !less);
                    assert_eq!(taken("jnl", &snapshot), !less);
                    assert_eq!(taken("jle", &snapshot), less_or_equal);
                    assert_eq!(taken("jng", &snapshot), less_or_equal);
                    assert_eq!(taken("jg", &snapshot), !less_or_equal);
                    assert_eq!(taken("jnle", &snapshot), !less_or_equal);
                }
            }
        }
    }

    #[test]
    fn test_count_register_widths() {
        // 上位ビットが立っていても、jcxzは下位16ビットだけを見る
        let snapshot = regs(&[("rcx", 0x1_0000)]);
        assert!(taken("jcxz", &snapshot));
        assert!(!taken("jecxz", &snapshot));
        assert!(!taken("jrcxz", &snapshot));

        let snapshot = regs(&[("rcx", 0x1_0000_0000)]);
        assert!(taken("jecxz", &snapshot));
        assert!(!taken("jrcxz", &snapshot));

        // 32ビットのスナップショットではecxを使う
        assert!(taken("jecxz", &regs(&[("ecx", 0)])));
        assert!(!taken("jcxz", &regs(&[("cx", 3)])));
    }

    #[test]
    fn test_loop_family() {
        assert!(taken("loop", &regs(&[("ecx", 2)])));
        assert!(!taken("loop", &regs(&[("ecx", 1)])));
        assert!(taken("loope", &regs(&[("ecx", 5), ("zf", 1)])));
        assert!(!taken("loopz", &regs(&[("ecx", 5), ("zf", 0)])));
        assert!(taken("loopne", &regs(&[("ecx", 5), ("zf", 0)])));
        assert!(!taken("loopnz", &regs(&[("ecx", 1), ("zf", 0)])));
    }

    #[test]
    fn test_flags_from_flags_word() {
        // ZF | CF
        let snapshot = regs(&[("efl", 0x41)]);
        let flags = Flags::from_snapshot(&snapshot);
        assert!(flags.zf && flags.cf);
        assert!(!flags.sf && !flags.of && !flags.pf);
        assert!(taken("jbe", &snapshot));

        // OFだけ
        let snapshot = regs(&[("rflags", 0x800)]);
        assert!(taken("jl", &snapshot));
    }

    #[test]
    fn test_fall_through_cases() {
        let snapshot = regs(&[("zf", 1)]);
        // 無条件分岐・非分岐命令
        assert_eq!(resolve_branch_target(ADDR, "jmp", "0x401080", 5, Some(&snapshot)), ADDR + 5);
        assert_eq!(resolve_branch_target(ADDR, "mov", "eax, ebx", 2, Some(&snapshot)), ADDR + 2);
        // 未知の条件ニーモニック
        assert_eq!(resolve_branch_target(ADDR, "jzz", "0x401080", 2, Some(&snapshot)), ADDR + 2);
        // レジスタなし
        assert_eq!(resolve_branch_target(ADDR, "je", "0x401080", 2, None), ADDR + 2);
        // 分岐先が読めない
        assert_eq!(resolve_branch_target(ADDR, "je", "qword ptr [rax]", 2, Some(&snapshot)), ADDR + 2);
    }

    #[test]
    fn test_parse_branch_target_forms() {
        assert_eq!(parse_branch_target("0x401080"), Some(0x401080));
        assert_eq!(parse_branch_target("short 00401080"), Some(0x401080));
        assert_eq!(parse_branch_target("app!main+0x10 (00401010)"), Some(0x401010));
        assert_eq!(parse_branch_target("eax"), None);
    }

    #[test]
    fn test_mnemonic_is_case_insensitive() {
        assert_eq!(Condition::from_mnemonic("JE"), Some(Condition::Zero));
        assert_eq!(Condition::from_mnemonic("call"), None);
    }
}
