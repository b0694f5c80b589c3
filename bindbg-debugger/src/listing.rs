//! 逆アセンブル表示の解析
//!
//! デバッガが表示する1行を、ニーモニック・オペランド・注釈に分解します。
//! WinDbg形式とcapstone形式の両方を受け付けます。
//!
//! ```text
//! 00401234 ff5004          call    dword ptr [eax+4] ds:0023:00345678={app!Foo::bar (00401300)}
//! 00005555555551a9 ff5008 call qword ptr [rax + 8]
//! ```

use crate::Result;
use bindbg_core::parse::parse_hex_literal;
use regex::Regex;
use thiserror::Error;

/// 命令プレフィックス（ニーモニックの前に付くもの）
const PREFIXES: &[&str] = &["lock", "rep", "repe", "repz", "repne", "repnz", "notrack", "bnd"];

/// 行を解析できなかった理由
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListingError {
    #[error("empty disassembly line")]
    Empty,
    #[error("unbalanced brackets in '{0}'")]
    Unbalanced(String),
    #[error("empty term in expression '{0}'")]
    EmptyTerm(String),
}

/// 解析済みの1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingLine {
    /// 行頭のアドレス列
    pub address: Option<u64>,
    /// 命令バイト列の長さ
    pub length: Option<u64>,
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    pub annotation: Option<Annotation>,
}

impl ListingLine {
    /// `index` 番目のオペランドがメモリ参照なら返す
    pub fn memory_operand(&self, index: usize) -> Option<&MemoryOperand> {
        match self.operands.get(index)? {
            Operand::Memory(memory) => Some(memory),
            _ => None,
        }
    }
}

/// オペランド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Register(String),
    Immediate(u64),
    /// `app!main (00401000)` のようなシンボル
    Symbol { name: String, addr: Option<u64> },
    Memory(MemoryOperand),
}

/// `dword ptr ds:[eax+4]` のようなメモリ参照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOperand {
    pub size: Option<String>,
    pub segment: Option<String>,
    pub expr: Expression,
}

/// 角括弧の中の式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub terms: Vec<Term>,
    /// デバッガが式全体の値を `(addr)` として添えている場合の値
    pub resolved: Option<u64>,
}

/// 符号付きの項
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub negative: bool,
    pub kind: TermKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermKind {
    Register { name: String, scale: u64 },
    Literal(u64),
    Symbol { name: String, addr: Option<u64> },
}

/// オブジェクトのアドレスの求め方
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectBase {
    Address(u64),
    Register(String),
}

impl Expression {
    /// 算術を含むか（項が複数あるか）
    pub fn has_arithmetic(&self) -> bool {
        self.terms.len() > 1
    }

    /// 参照元のオブジェクトのアドレスを推定する
    ///
    /// シンボルがあればオフセットを除いたシンボルのアドレス、算術があれば最初のレジスタ、
    /// 単独のリテラルやレジスタならそれ自身です。正確な型推定ではありません。
    pub fn object_base(&self) -> Option<ObjectBase> {
        let symbol = self.terms.iter().find_map(|term| match &term.kind {
            TermKind::Symbol { addr, .. } => Some(*addr),
            _ => None,
        });

        if let Some(addr) = symbol {
            if let Some(addr) = addr {
                return Some(ObjectBase::Address(addr));
            }
            // 式全体の値からオフセットを引いてシンボルのアドレスを得る
            let resolved = self.resolved?;
            let offset = self.terms.iter().try_fold(0u64, |acc, term| match term.kind {
                TermKind::Literal(v) if term.negative => Some(acc.wrapping_sub(v)),
                TermKind::Literal(v) => Some(acc.wrapping_add(v)),
                TermKind::Symbol { .. } => Some(acc),
                TermKind::Register { .. } => None,
            })?;
            return Some(ObjectBase::Address(resolved.wrapping_sub(offset)));
        }

        if self.has_arithmetic() {
            return self.terms.iter().find_map(|term| match &term.kind {
                TermKind::Register { name, .. } => Some(ObjectBase::Register(name.clone())),
                _ => None,
            });
        }

        match &self.terms.first()?.kind {
            TermKind::Literal(v) => Some(ObjectBase::Address(*v)),
            TermKind::Register { name, .. } => Some(ObjectBase::Register(name.clone())),
            TermKind::Symbol { .. } => None,
        }
    }
}

/// デバッガの注釈（オペランドの後ろの `location=value`）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// 参照されたメモリのアドレス
    pub location: Option<u64>,
    pub value: AnnotatedValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotatedValue {
    /// `={app!Foo::bar (00401300)}`：読み出し済みの値をシンボルで表示したもの
    Symbol { name: String, addr: u64 },
    /// `=00402100`
    Value(u64),
}

impl AnnotatedValue {
    pub fn addr(&self) -> u64 {
        match self {
            AnnotatedValue::Symbol { addr, .. } => *addr,
            AnnotatedValue::Value(v) => *v,
        }
    }
}

/// x86のレジスタ名か
pub fn is_register(name: &str) -> bool {
    const NAMES: &[&str] = &[
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "rip", "eax", "ebx", "ecx", "edx",
        "esi", "edi", "ebp", "esp", "eip", "ax", "bx", "cx", "dx", "si", "di", "bp", "sp", "ip",
        "al", "bl", "cl", "dl", "ah", "bh", "ch", "dh", "sil", "dil", "bpl", "spl", "cs", "ds",
        "es", "fs", "gs", "ss",
    ];
    let name = name.to_ascii_lowercase();
    if NAMES.contains(&name.as_str()) {
        return true;
    }
    // r8〜r15 と、その d/w/b 部分レジスタ
    name.strip_prefix('r')
        .map(|rest| rest.trim_end_matches(['d', 'w', 'b']))
        .and_then(|num| num.parse::<u8>().ok())
        .map_or(false, |num| (8..=15).contains(&num))
}

/// 逆アセンブル行のパーサ
pub struct ListingParser {
    /// 行末の `ds:0023:00345678=...` 注釈
    annotation_pattern: Regex,
    /// `dword ptr ds:[...]` 形式のメモリ参照
    memory_pattern: Regex,
    /// `name (00401000)` 形式のシンボル
    symbol_pattern: Regex,
}

impl ListingParser {
    /// パーサを作成する
    pub fn new() -> Result<Self> {
        let annotation_pattern = Regex::new(
            r"(?i)\s(?:[a-z]s:(?:[0-9a-f]{4}:)?)?([0-9a-f`]+)=(\{[^{}]*\}|[0-9a-f`]+)\s*$",
        )?;
        let memory_pattern = Regex::new(
            r"(?i)^(?:([a-z]+)\s+ptr\s+)?(?:([a-z]s):)?\[(.*)\]$",
        )?;
        let symbol_pattern = Regex::new(r"^(.*?)\s*\(([0-9a-fA-F`]+)\)$")?;

        Ok(Self {
            annotation_pattern,
            memory_pattern,
            symbol_pattern,
        })
    }

    /// 1行を解析する
    pub fn parse(&self, line: &str) -> std::result::Result<ListingLine, ListingError> {
        let mut rest = line.trim();

        let mut annotation = None;
        if let Some(caps) = self.annotation_pattern.captures(rest) {
            annotation = self.parse_annotation(&caps[1], &caps[2]);
            if let Some(whole) = caps.get(0) {
                rest = rest[..whole.start()].trim_end();
            }
        }

        let tokens: Vec<&str> = rest.split_whitespace().collect();
        let mut index = 0;
        let mut address = None;
        let mut length = None;

        // 行頭の「アドレス 命令バイト列」
        if tokens.len() >= 3 && is_bytes(tokens[1]) {
            if let Some(addr) = parse_hex_literal(tokens[0]) {
                address = Some(addr);
                length = Some(tokens[1].len() as u64 / 2);
                index = 2;
            }
        }

        while index + 1 < tokens.len() && PREFIXES.contains(&tokens[index].to_ascii_lowercase().as_str()) {
            index += 1;
        }
        let mnemonic = tokens.get(index).ok_or(ListingError::Empty)?.to_ascii_lowercase();

        // ニーモニック以降をオペランドとして取り出す
        let operand_text = tokens[index + 1..].join(" ");
        let operands = split_top_level(&operand_text)?
            .into_iter()
            .map(|text| self.parse_operand(text))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ListingLine {
            address,
            length,
            mnemonic,
            operands,
            annotation,
        })
    }

    fn parse_annotation(&self, location: &str, value: &str) -> Option<Annotation> {
        let location = parse_hex_literal(location);
        let value = match value.strip_prefix('{').and_then(|v| v.strip_suffix('}')) {
            Some(inner) => {
                let (name, addr) = self.split_symbol(inner.trim())?;
                AnnotatedValue::Symbol { name, addr }
            }
            None => AnnotatedValue::Value(parse_hex_literal(value)?),
        };
        Some(Annotation { location, value })
    }

    /// `name (addr)` を分解する
    fn split_symbol(&self, text: &str) -> Option<(String, u64)> {
        let caps = self.symbol_pattern.captures(text)?;
        let addr = parse_hex_literal(&caps[2])?;
        Some((caps[1].trim().to_string(), addr))
    }

    fn parse_operand(&self, text: &str) -> std::result::Result<Operand, ListingError> {
        let text = text.trim();
        if let Some(caps) = self.memory_pattern.captures(text) {
            return Ok(Operand::Memory(MemoryOperand {
                size: caps.get(1).map(|m| m.as_str().to_ascii_lowercase()),
                segment: caps.get(2).map(|m| m.as_str().to_ascii_lowercase()),
                expr: self.parse_expression(&caps[3])?,
            }));
        }
        if text.contains(['[', ']']) {
            return Err(ListingError::Unbalanced(text.to_string()));
        }
        // "ah" などは16進数としても読めるため、レジスタを先に判定する
        if is_register(text) {
            return Ok(Operand::Register(text.to_ascii_lowercase()));
        }
        if let Some(value) = parse_hex_literal(text) {
            return Ok(Operand::Immediate(value));
        }
        Ok(match self.split_symbol(text) {
            Some((name, addr)) => Operand::Symbol { name, addr: Some(addr) },
            None => Operand::Symbol {
                name: text.to_string(),
                addr: None,
            },
        })
    }

    fn parse_expression(&self, text: &str) -> std::result::Result<Expression, ListingError> {
        let mut text = text.trim();
        let mut resolved = None;
        if let Some((name, addr)) = self.split_symbol(text) {
            resolved = Some(addr);
            let end = name.len();
            text = text[..end].trim_end();
        }

        let mut terms = Vec::new();
        let mut negative = false;
        let mut start = 0;
        for (i, c) in text.char_indices() {
            if c == '+' || c == '-' {
                let token = text[start..i].trim();
                if !token.is_empty() {
                    terms.push(self.parse_term(token, negative)?);
                } else if !terms.is_empty() || c == '+' {
                    return Err(ListingError::EmptyTerm(text.to_string()));
                }
                negative = c == '-';
                start = i + 1;
            }
        }
        let last = text[start..].trim();
        if last.is_empty() {
            return Err(ListingError::EmptyTerm(text.to_string()));
        }
        terms.push(self.parse_term(last, negative)?);

        Ok(Expression { terms, resolved })
    }

    fn parse_term(&self, token: &str, negative: bool) -> std::result::Result<Term, ListingError> {
        let kind = if let Some((lhs, rhs)) = token.split_once('*') {
            let (lhs, rhs) = (lhs.trim(), rhs.trim());
            let (name, scale) = if is_register(lhs) { (lhs, rhs) } else { (rhs, lhs) };
            match parse_hex_literal(scale) {
                Some(scale) if is_register(name) => TermKind::Register {
                    name: name.to_ascii_lowercase(),
                    scale,
                },
                _ => return Err(ListingError::EmptyTerm(token.to_string())),
            }
        } else if is_register(token) {
            TermKind::Register {
                name: token.to_ascii_lowercase(),
                scale: 1,
            }
        } else if let Some(value) = parse_hex_literal(token) {
            TermKind::Literal(value)
        } else {
            match self.split_symbol(token) {
                Some((name, addr)) => TermKind::Symbol { name, addr: Some(addr) },
                None => TermKind::Symbol {
                    name: token.to_string(),
                    addr: None,
                },
            }
        };
        Ok(Term { negative, kind })
    }
}

/// 命令バイト列の列か（偶数桁の16進数）
fn is_bytes(token: &str) -> bool {
    !token.is_empty() && token.len() % 2 == 0 && token.chars().all(|c| c.is_ascii_hexdigit())
}

/// 括弧の外側にあるカンマでオペランドを分ける
fn split_top_level(text: &str) -> std::result::Result<Vec<&str>, ListingError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' | '(' | '{' | '<' => depth += 1,
            ']' | ')' | '}' | '>' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
        if depth < 0 {
            return Err(ListingError::Unbalanced(text.to_string()));
        }
    }
    if depth != 0 {
        return Err(ListingError::Unbalanced(text.to_string()));
    }
    parts.push(text[start..].trim());
    Ok(parts)
}
