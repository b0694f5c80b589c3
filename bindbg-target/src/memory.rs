//! メモリアクセス機能

use crate::Result;
use nix::errno::Errno;
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

/// ポインタのサイズ（x86_64）
pub const POINTER_SIZE: usize = 8;

/// メモリマッピング情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub offset: u64,
    /// マップされたファイル（匿名マッピングや `[stack]` などはそのまま）
    pub path: Option<PathBuf>,
}

impl MemoryMapping {
    /// アドレスがこのマッピング内にあるか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// /proc/pid/maps の1行を解析する
    ///
    /// 例: `7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so`
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let (start, end) = parts.next()?.split_once('-')?;
        let perms = parts.next()?.as_bytes();
        let offset = parts.next()?;
        let _dev = parts.next()?;
        let _inode = parts.next()?;
        let path = parts.collect::<Vec<_>>().join(" ");

        Some(Self {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            offset: u64::from_str_radix(offset, 16).ok()?,
            path: if path.is_empty() { None } else { Some(PathBuf::from(path)) },
        })
    }
}

/// マッピング一覧のうち、指定したファイルが占める範囲を `(start, end)` で返す
pub fn file_span(mappings: &[MemoryMapping], path: &Path) -> Option<(u64, u64)> {
    mappings
        .iter()
        .filter(|m| m.path.as_deref() == Some(path))
        .fold(None, |span, m| match span {
            None => Some((m.start, m.end)),
            Some((start, end)) => Some((start.min(m.start), end.max(m.end))),
        })
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    fn proc_path(&self, entry: &str) -> String {
        format!("/proc/{}/{}", self.pid, entry)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/mem を使い、EIOになった場合はPTRACE_PEEKDATAで読み直します。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => self.read_via_ptrace(addr, size),
            Err(e) => Err(anyhow::anyhow!("Failed to read {} bytes at 0x{:x}: {}", size, addr, e)),
        }
    }

    fn read_via_proc_mem(&self, addr: u64, size: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(self.proc_path("mem"))?;
        file.seek(SeekFrom::Start(addr))?;
        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let word_size = std::mem::size_of::<nix::libc::c_long>();
        let mut data = Vec::with_capacity(size + word_size);
        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr + offset as u64) as ptrace::AddressType;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", addr + offset as u64, e)
            })?;
            data.extend_from_slice(&word.to_ne_bytes());
        }
        data.truncate(size);
        Ok(data)
    }

    /// メモリにデータを書き込む
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let path = self.proc_path("mem");
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", path, e))?;
        file.seek(SeekFrom::Start(addr))?;
        file.write_all(data)
            .map_err(|e| anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e))?;
        Ok(())
    }

    /// 1バイト読み取る
    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        Ok(self.read(addr, 1)?[0])
    }

    /// 1バイト書き込む
    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    /// ポインタサイズの値を読み取る（リトルエンディアン）
    pub fn read_pointer(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, POINTER_SIZE)?;
        let array: [u8; POINTER_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Short read of {} bytes at 0x{:x}", bytes.len(), addr))?;
        Ok(u64::from_le_bytes(array))
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        let path = self.proc_path("maps");
        let text = fs::read_to_string(&path).map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path, e))?;
        Ok(text.lines().filter_map(MemoryMapping::parse).collect())
    }

    /// アドレスが読み取り可能なマッピング内にあるか
    pub fn is_readable(&self, addr: u64) -> Result<bool> {
        Ok(self.mappings()?.iter().any(|m| m.readable && m.contains(addr)))
    }

    /// 実行ファイルのパスを取得する
    pub fn executable_path(&self) -> Result<PathBuf> {
        let path = self.proc_path("exe");
        fs::read_link(&path).map_err(|e| anyhow::anyhow!("Failed to resolve {}: {}", path, e))
    }

    /// 実行ファイルがマップされている範囲を `(start, end)` で取得する
    pub fn executable_span(&self) -> Result<(u64, u64)> {
        let exe = self.executable_path()?;
        file_span(&self.mappings()?, &exe)
            .ok_or_else(|| anyhow::anyhow!("Could not find {} in memory mappings", exe.display()))
    }
}
