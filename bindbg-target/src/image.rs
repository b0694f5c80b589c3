//! 実行ファイルのイメージ
//!
//! ELFを読み込み、シンボル、コードセクション、インポートスタブの範囲を保持します。
//! 読み込み後はファイルの内容を借用しないため、スレッド間で共有できます。

use crate::Result;
use bindbg_core::ModuleRange;
use object::{Object, ObjectKind, ObjectSection, ObjectSegment, ObjectSymbol, SectionKind, SymbolKind};
use std::fs;
use std::path::{Path, PathBuf};

const PAGE_SIZE: u64 = 0x1000;

/// インポートスタブとインポートの参照先テーブルを含むセクション
const IMPORT_SECTIONS: &[&str] = &[".plt", ".plt.sec", ".plt.got", ".got", ".got.plt"];

/// シンボル情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
    pub is_function: bool,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64, is_function: bool) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
            is_function,
        }
    }

    /// 表示用の名前を取得する
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }

    /// アドレスがシンボルの範囲内にあるか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address.saturating_add(self.size)
    }
}

/// シンボル名をデマングルする
///
/// RustとC++（Itanium ABI）のシンボルに対応し、それ以外はそのまま返します。
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    if let Ok(symbol) = cpp_demangle::Symbol::new(name.as_bytes()) {
        if let Ok(demangled) = symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
            return demangled;
        }
    }
    name.to_string()
}

/// 読み込まれた実行ファイル
#[derive(Debug, Clone)]
pub struct ModuleImage {
    path: PathBuf,
    /// 最初のロードセグメントのページ境界
    base: u64,
    /// ロードセグメント全体の終端
    end: u64,
    is_pie: bool,
    entry: u64,
    /// アドレス順のシンボル
    symbols: Vec<Symbol>,
    import_ranges: Vec<(u64, u64)>,
    /// 実行可能セクションの (アドレス, 内容)
    code: Vec<(u64, Vec<u8>)>,
}

impl ModuleImage {
    /// ファイルから読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;
        Self::parse(&data, path)
    }

    /// メモリ上のファイル内容を解析する
    pub fn parse(data: &[u8], path: &Path) -> Result<Self> {
        let file = object::File::parse(data)
            .map_err(|e| anyhow::anyhow!("Failed to parse executable {:?}: {}", path, e))?;

        let (base, end) = file
            .segments()
            .filter(|segment| segment.size() > 0)
            .fold(None, |span: Option<(u64, u64)>, segment| {
                let start = segment.address();
                let stop = start.saturating_add(segment.size());
                Some(match span {
                    None => (start, stop),
                    Some((lo, hi)) => (lo.min(start), hi.max(stop)),
                })
            })
            .ok_or_else(|| anyhow::anyhow!("{:?} has no loadable segments", path))?;
        let base = base & !(PAGE_SIZE - 1);

        let mut symbols: Vec<Symbol> = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter(|symbol| !symbol.is_undefined() && symbol.address() != 0)
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some(Symbol::new(
                    name.to_string(),
                    symbol.address(),
                    symbol.size(),
                    symbol.kind() == SymbolKind::Text,
                ))
            })
            .collect();
        symbols.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.name.cmp(&b.name)));
        symbols.dedup_by(|a, b| a.address == b.address && a.name == b.name);

        let mut import_ranges = Vec::new();
        let mut code = Vec::new();
        for section in file.sections() {
            let name = section.name().unwrap_or("");
            if IMPORT_SECTIONS.contains(&name) {
                import_ranges.push((section.address(), section.address() + section.size()));
            }
            if section.kind() == SectionKind::Text {
                if let Ok(bytes) = section.data() {
                    code.push((section.address(), bytes.to_vec()));
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            base,
            end,
            is_pie: matches!(file.kind(), ObjectKind::Dynamic),
            entry: file.entry(),
            symbols,
            import_ranges,
            code,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 最初のロードセグメントのアドレス
    pub fn base(&self) -> u64 {
        self.base
    }

    /// ロードされる範囲の大きさ
    pub fn size(&self) -> u64 {
        self.end - self.base
    }

    /// イメージ上のアドレス空間としての範囲
    pub fn range(&self) -> ModuleRange {
        ModuleRange::new(self.base, self.size())
    }

    /// PIE（Position Independent Executable）かどうか
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// エントリポイントのアドレス
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// すべてのシンボルを取得する
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    /// シンボル名からアドレスを解決する。マングル名とデマングル名の両方で探す
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|s| s.name == name || s.demangled_name == name)
            .map(|s| s.address)
    }

    /// パターンを含むシンボルを検索する
    pub fn find_symbols(&self, pattern: &str) -> Vec<&Symbol> {
        self.symbols
            .iter()
            .filter(|s| s.name.contains(pattern) || s.demangled_name.contains(pattern))
            .collect()
    }

    /// アドレスからシンボルを解決する（最も近い手前のシンボルを返す）
    pub fn symbol_at(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.symbols.partition_point(|s| s.address <= addr);
        let before = &self.symbols[..idx];
        // サイズ情報がない場合は単純に最も近いシンボルを返す
        before
            .iter()
            .rev()
            .find(|s| s.contains(addr))
            .or_else(|| before.last().filter(|s| s.size == 0))
    }

    /// アドレスを名前で呼べるシンボル
    ///
    /// 関数は先頭アドレスだけ、データ（vtableなど）は範囲内のどこでも一致します。
    /// C++のvtableポインタは `_ZTV...` の先頭ではなく途中を指すためです。
    pub fn named_at(&self, addr: u64) -> Option<&Symbol> {
        self.symbol_at(addr)
            .filter(|s| s.address == addr || (!s.is_function && s.contains(addr)))
    }

    /// アドレスを含む関数を取得する
    pub fn function_containing(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.symbols.partition_point(|s| s.address <= addr);
        self.symbols[..idx]
            .iter()
            .rev()
            .find(|s| s.is_function && s.contains(addr))
    }

    /// アドレスがインポートスタブ（PLT）内にあるか
    pub fn is_import(&self, addr: u64) -> bool {
        self.import_ranges.iter().any(|&(start, end)| addr >= start && addr < end)
    }

    /// 実行可能セクションから `addr` 以降のバイト列を最大 `len` バイト取得する
    pub fn code_at(&self, addr: u64, len: usize) -> Option<&[u8]> {
        self.code.iter().find_map(|(start, bytes)| {
            let offset = addr.checked_sub(*start)? as usize;
            if offset >= bytes.len() {
                return None;
            }
            let stop = (offset + len).min(bytes.len());
            Some(&bytes[offset..stop])
        })
    }
}
