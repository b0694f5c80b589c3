//! レジスタアクセス機能
//!
//! 64ビットのレジスタに加え、`eax` や `al` のような部分レジスタと、
//! `zf` などのフラグを名前で読み書きできます。

use crate::Result;
use bindbg_core::RegisterSnapshot;
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

/// スナップショットに含める汎用レジスタ
const SNAPSHOT_REGISTERS: &[&str] = &[
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip",
];

/// フラグの名前とEFLAGS内のビット位置
const FLAG_BITS: &[(&str, u32)] = &[
    ("cf", 0),
    ("pf", 2),
    ("af", 4),
    ("zf", 6),
    ("sf", 7),
    ("df", 10),
    ("of", 11),
];

/// 名前で指定されたレジスタの位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    /// 64ビットレジスタの一部（シフト量とマスク）
    Slice { full: &'static str, shift: u32, mask: u64 },
    /// EFLAGSの1ビット
    Flag(u32),
}

const FULL: u64 = u64::MAX;
const LOW32: u64 = 0xffff_ffff;
const LOW16: u64 = 0xffff;
const LOW8: u64 = 0xff;

fn slice(full: &'static str, shift: u32, mask: u64) -> Option<Location> {
    Some(Location::Slice { full, shift, mask })
}

/// レジスタ名を64ビットレジスタ上の位置に解決する
fn locate(name: &str) -> Option<Location> {
    const LEGACY: &[(&str, &str)] = &[
        ("ax", "rax"),
        ("bx", "rbx"),
        ("cx", "rcx"),
        ("dx", "rdx"),
        ("si", "rsi"),
        ("di", "rdi"),
        ("bp", "rbp"),
        ("sp", "rsp"),
    ];
    const NUMBERED: &[&str] = &["r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15"];

    let name = name.to_ascii_lowercase();
    if let Some(&(_, bit)) = FLAG_BITS.iter().find(|(flag, _)| *flag == name) {
        return Some(Location::Flag(bit));
    }

    match name.as_str() {
        "rip" => return slice("rip", 0, FULL),
        "eip" => return slice("rip", 0, LOW32),
        "efl" | "eflags" | "rflags" => return slice("eflags", 0, FULL),
        "al" => return slice("rax", 0, LOW8),
        "bl" => return slice("rbx", 0, LOW8),
        "cl" => return slice("rcx", 0, LOW8),
        "dl" => return slice("rdx", 0, LOW8),
        "ah" => return slice("rax", 8, LOW8),
        "bh" => return slice("rbx", 8, LOW8),
        "ch" => return slice("rcx", 8, LOW8),
        "dh" => return slice("rdx", 8, LOW8),
        "sil" => return slice("rsi", 0, LOW8),
        "dil" => return slice("rdi", 0, LOW8),
        "bpl" => return slice("rbp", 0, LOW8),
        "spl" => return slice("rsp", 0, LOW8),
        _ => {}
    }

    for &(short, full) in LEGACY {
        if name == short {
            return slice(full, 0, LOW16);
        }
        if name == full {
            return slice(full, 0, FULL);
        }
        if name.strip_prefix('e') == Some(short) {
            return slice(full, 0, LOW32);
        }
    }

    for &full in NUMBERED {
        if let Some(suffix) = name.strip_prefix(full) {
            return match suffix {
                "" => slice(full, 0, FULL),
                "d" => slice(full, 0, LOW32),
                "w" => slice(full, 0, LOW16),
                "b" => slice(full, 0, LOW8),
                _ => None,
            };
        }
    }
    None
}

fn field(regs: &user_regs_struct, full: &str) -> u64 {
    match full {
        "rax" => regs.rax,
        "rbx" => regs.rbx,
        "rcx" => regs.rcx,
        "rdx" => regs.rdx,
        "rsi" => regs.rsi,
        "rdi" => regs.rdi,
        "rbp" => regs.rbp,
        "rsp" => regs.rsp,
        "r8" => regs.r8,
        "r9" => regs.r9,
        "r10" => regs.r10,
        "r11" => regs.r11,
        "r12" => regs.r12,
        "r13" => regs.r13,
        "r14" => regs.r14,
        "r15" => regs.r15,
        "rip" => regs.rip,
        _ => regs.eflags,
    }
}

fn field_mut<'a>(regs: &'a mut user_regs_struct, full: &str) -> &'a mut u64 {
    match full {
        "rax" => &mut regs.rax,
        "rbx" => &mut regs.rbx,
        "rcx" => &mut regs.rcx,
        "rdx" => &mut regs.rdx,
        "rsi" => &mut regs.rsi,
        "rdi" => &mut regs.rdi,
        "rbp" => &mut regs.rbp,
        "rsp" => &mut regs.rsp,
        "r8" => &mut regs.r8,
        "r9" => &mut regs.r9,
        "r10" => &mut regs.r10,
        "r11" => &mut regs.r11,
        "r12" => &mut regs.r12,
        "r13" => &mut regs.r13,
        "r14" => &mut regs.r14,
        "r15" => &mut regs.r15,
        "rip" => &mut regs.rip,
        _ => &mut regs.eflags,
    }
}

/// レジスタ値を名前で取得する
pub fn value_of(regs: &user_regs_struct, name: &str) -> Option<u64> {
    match locate(name)? {
        Location::Slice { full, shift, mask } => Some((field(regs, full) >> shift) & mask),
        Location::Flag(bit) => Some((regs.eflags >> bit) & 1),
    }
}

/// レジスタ値を名前で書き換える。部分レジスタは該当ビットだけを置き換える
pub fn assign(regs: &mut user_regs_struct, name: &str, value: u64) -> Option<()> {
    match locate(name)? {
        Location::Slice { full, shift, mask } => {
            let slot = field_mut(regs, full);
            *slot = (*slot & !(mask << shift)) | ((value & mask) << shift);
        }
        Location::Flag(bit) => {
            if value != 0 {
                regs.eflags |= 1 << bit;
            } else {
                regs.eflags &= !(1 << bit);
            }
        }
    }
    Some(())
}

/// レジスタの読み取り結果をスナップショットにする
pub fn snapshot_of(regs: &user_regs_struct) -> RegisterSnapshot {
    let mut snapshot: RegisterSnapshot = SNAPSHOT_REGISTERS
        .iter()
        .map(|name| (name.to_string(), field(regs, name)))
        .collect();
    snapshot.insert("efl".to_string(), regs.eflags);
    for &(flag, bit) in FLAG_BITS {
        snapshot.insert(flag.to_string(), (regs.eflags >> bit) & 1);
    }
    snapshot
}

/// レジスタ情報
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        Ok(nix::sys::ptrace::getregs(self.pid)?)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        Ok(self.read()?.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }

    /// 名前でレジスタ値を取得する
    pub fn get(&self, name: &str) -> Result<u64> {
        value_of(&self.read()?, name).ok_or_else(|| anyhow::anyhow!("Unknown register '{}'", name))
    }

    /// 名前でレジスタ値を設定する
    pub fn set(&self, name: &str, value: u64) -> Result<()> {
        let mut regs = self.read()?;
        assign(&mut regs, name, value).ok_or_else(|| anyhow::anyhow!("Unknown register '{}'", name))?;
        self.write(regs)
    }

    /// 全レジスタのスナップショットを取得する
    pub fn snapshot(&self) -> Result<RegisterSnapshot> {
        Ok(snapshot_of(&self.read()?))
    }
}
