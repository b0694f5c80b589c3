//! 端末上の解析ツール
//!
//! 実行ファイルのシンボルと逆アセンブルを使ってホストの役割を果たし、
//! ハイライトとコメントを記録してログに出します。

use anyhow::{Context, Result};
use bindbg_analyzer::{AnalysisHost, Highlight, HostInstruction};
use bindbg_core::parse::parse_address;
use bindbg_core::ModuleRange;
use bindbg_target::disasm::MAX_INSTRUCTION_LEN;
use bindbg_target::{Decoder, ModuleImage};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 端末上のホスト
pub struct ConsoleHost {
    image: ModuleImage,
    highlights: Mutex<BTreeMap<u64, Highlight>>,
    comments: Mutex<BTreeMap<u64, String>>,
    cursor: Mutex<Option<u64>>,
}

impl ConsoleHost {
    /// 実行ファイルを読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let image = ModuleImage::load(path)?;
        Ok(Self::new(image))
    }

    pub fn new(image: ModuleImage) -> Self {
        Self {
            image,
            highlights: Mutex::new(BTreeMap::new()),
            comments: Mutex::new(BTreeMap::new()),
            cursor: Mutex::new(None),
        }
    }

    pub fn image(&self) -> &ModuleImage {
        &self.image
    }

    /// シンボル名またはアドレスを解決する
    pub fn resolve_location(&self, location: &str) -> Result<u64> {
        if let Some(addr) = self.image.resolve(location) {
            return Ok(addr);
        }
        parse_address(location).with_context(|| format!("Unknown symbol or address '{}'", location))
    }

    /// `symbol+0x10` 形式の表記
    pub fn describe(&self, addr: u64) -> String {
        match self.image.symbol_at(addr) {
            Some(symbol) if symbol.address == addr => format!("0x{:x} <{}>", addr, symbol.display_name()),
            Some(symbol) => format!(
                "0x{:x} <{}+0x{:x}>",
                addr,
                symbol.display_name(),
                addr - symbol.address
            ),
            None => format!("0x{:x}", addr),
        }
    }

    /// 1命令の表示
    pub fn disassemble(&self, addr: u64) -> String {
        match self.instruction(addr) {
            Some(insn) if insn.operands.is_empty() => insn.mnemonic,
            Some(insn) => format!("{} {}", insn.mnemonic, insn.operands),
            None => "??".to_string(),
        }
    }

    pub fn highlights(&self) -> Vec<(u64, Highlight)> {
        lock(&self.highlights).iter().map(|(addr, h)| (*addr, *h)).collect()
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        lock(&self.comments).iter().map(|(addr, c)| (*addr, c.clone())).collect()
    }

    pub fn cursor(&self) -> Option<u64> {
        *lock(&self.cursor)
    }
}

impl AnalysisHost for ConsoleHost {
    fn module(&self) -> ModuleRange {
        self.image.range()
    }

    fn is_valid(&self, addr: u64) -> bool {
        self.image.range().contains(addr)
    }

    fn containing_function(&self, addr: u64) -> Option<u64> {
        match self.image.function_containing(addr) {
            Some(symbol) => Some(symbol.address),
            // シンボルの無いバイナリでもコード上なら扱う
            None => self.image.code_at(addr, 1).map(|_| addr),
        }
    }

    fn highlight(&self, addr: u64, highlight: Highlight) {
        let mut highlights = lock(&self.highlights);
        if highlight == Highlight::None {
            highlights.remove(&addr);
        } else {
            highlights.insert(addr, highlight);
        }
        debug!("{} -> {}", self.describe(addr), highlight.color());
    }

    fn set_comment(&self, addr: u64, comment: &str) {
        lock(&self.comments).insert(addr, comment.to_string());
        info!("{}: ; {}", self.describe(addr), comment);
    }

    fn navigate(&self, addr: u64) {
        *lock(&self.cursor) = Some(addr);
        info!("=> {}: {}", self.describe(addr), self.disassemble(addr));
    }

    fn symbol_at(&self, addr: u64) -> Option<String> {
        self.image
            .named_at(addr)
            .map(|symbol| symbol.display_name().to_string())
    }

    fn instruction(&self, addr: u64) -> Option<HostInstruction> {
        let code = self.image.code_at(addr, MAX_INSTRUCTION_LEN)?;
        // Capstoneはスレッド間で共有できないため呼び出しごとに作る
        let decoded = Decoder::x86_64().and_then(|decoder| decoder.decode(code, addr));
        match decoded {
            Ok(insn) => insn.map(|insn| HostInstruction {
                mnemonic: insn.mnemonic,
                operands: insn.operands,
                length: insn.length,
            }),
            Err(e) => {
                debug!("cannot decode at 0x{:x}: {:#}", addr, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_host() -> ConsoleHost {
        let exe = std::env::current_exe().unwrap();
        ConsoleHost::load(&exe).unwrap()
    }

    #[test]
    fn test_highlights_are_recorded() {
        let host = own_host();
        let addr = host.image().entry();

        host.highlight(addr, Highlight::Breakpoint);
        assert_eq!(host.highlights(), vec![(addr, Highlight::Breakpoint)]);
        host.highlight(addr, Highlight::None);
        assert!(host.highlights().is_empty());

        host.set_comment(addr, "Foo::bar");
        assert_eq!(host.comments(), vec![(addr, "Foo::bar".to_string())]);
        host.navigate(addr);
        assert_eq!(host.cursor(), Some(addr));
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_entry_point_decodes() {
        let host = own_host();
        let entry = host.image().entry();
        assert!(host.is_valid(entry));
        assert!(host.containing_function(entry).is_some());

        let insn = host.instruction(entry).unwrap();
        assert!(!insn.mnemonic.is_empty());
        assert!(insn.length > 0 && insn.length <= MAX_INSTRUCTION_LEN as u64);
    }

    #[test]
    fn test_resolve_location() {
        let host = own_host();
        assert_eq!(host.resolve_location("0x1234").unwrap(), 0x1234);
        assert!(host.resolve_location("no_such_symbol_anywhere").is_err());
    }
}
