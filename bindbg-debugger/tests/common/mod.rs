//! テスト用のデバッガバックエンド

#![allow(dead_code)]

use bindbg_core::{ModuleRange, RegisterSnapshot, SyncConfig};
use bindbg_debugger::{DebuggerBackend, ExecutionStatus, SymbolInfo};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::time::Duration;

pub const BASE: u64 = 0x5555_5555_4000;
pub const SIZE: u64 = 0x10000;

/// テスト用の短い間隔
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(10),
        settle_delay: Duration::from_millis(1),
        connect_retry: Duration::from_millis(10),
    }
}

/// メモリ上のデバッガを模したバックエンド
pub struct MockBackend {
    pub status: ExecutionStatus,
    pub ip: u64,
    pub regs: RegisterSnapshot,
    pub breakpoints: BTreeSet<u64>,
    /// ポインタの値
    pub memory: HashMap<u64, u64>,
    /// 読み取り可能な範囲
    pub readable: Vec<Range<u64>>,
    /// アドレスごとの逆アセンブル結果
    pub listings: HashMap<u64, String>,
    pub symbols: HashMap<u64, SymbolInfo>,
    pub module: ModuleRange,
    /// 呼ばれた操作の記録
    pub calls: Vec<String>,
    pub fail_registers: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            status: ExecutionStatus::Stopped,
            ip: BASE + 0x100,
            regs: RegisterSnapshot::new(),
            breakpoints: BTreeSet::new(),
            memory: HashMap::new(),
            readable: vec![BASE..BASE + SIZE],
            listings: HashMap::new(),
            symbols: HashMap::new(),
            module: ModuleRange::new(BASE, SIZE),
            calls: Vec::new(),
            fail_registers: false,
        }
    }

    pub fn with_breakpoints(mut self, offsets: &[u64]) -> Self {
        self.breakpoints = offsets.iter().map(|off| BASE + off).collect();
        self
    }

    pub fn set_reg(&mut self, name: &str, value: u64) {
        self.regs.insert(name.to_string(), value);
    }

    pub fn write_pointer(&mut self, addr: u64, value: u64) {
        self.memory.insert(addr, value);
    }

    pub fn import(&mut self, addr: u64) {
        self.symbols.insert(
            addr,
            SymbolInfo {
                name: "puts".to_string(),
                address: addr,
                is_import: true,
            },
        );
    }

    fn record(&mut self, call: impl Into<String>) {
        self.calls.push(call.into());
    }
}

impl DebuggerBackend for MockBackend {
    fn status(&mut self) -> anyhow::Result<ExecutionStatus> {
        Ok(self.status)
    }

    fn go(&mut self) -> anyhow::Result<()> {
        self.record("go");
        self.status = ExecutionStatus::Running;
        Ok(())
    }

    fn interrupt(&mut self) -> anyhow::Result<()> {
        self.record("interrupt");
        self.status = ExecutionStatus::Stopped;
        Ok(())
    }

    fn step_in(&mut self) -> anyhow::Result<()> {
        self.record("step_in");
        self.ip += 1;
        Ok(())
    }

    fn step_over(&mut self) -> anyhow::Result<()> {
        self.record("step_over");
        self.ip += 2;
        Ok(())
    }

    fn step_out(&mut self) -> anyhow::Result<()> {
        self.record("step_out");
        Ok(())
    }

    fn run_to(&mut self, addr: u64) -> anyhow::Result<()> {
        self.record(format!("run_to {:#x}", addr));
        self.status = ExecutionStatus::Running;
        Ok(())
    }

    fn ip(&mut self) -> anyhow::Result<u64> {
        Ok(self.ip)
    }

    fn set_ip(&mut self, addr: u64) -> anyhow::Result<()> {
        self.record(format!("set_ip {:#x}", addr));
        self.ip = addr;
        Ok(())
    }

    fn registers(&mut self) -> anyhow::Result<RegisterSnapshot> {
        if self.fail_registers {
            return Err(anyhow::anyhow!("register read failed"));
        }
        let mut regs = self.regs.clone();
        regs.insert("rip".to_string(), self.ip);
        Ok(regs)
    }

    fn register(&mut self, name: &str) -> anyhow::Result<u64> {
        self.regs
            .get(name)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown register '{}'", name))
    }

    fn set_register(&mut self, name: &str, value: u64) -> anyhow::Result<()> {
        self.set_reg(name, value);
        Ok(())
    }

    fn breakpoint_count(&mut self) -> anyhow::Result<usize> {
        Ok(self.breakpoints.len())
    }

    fn breakpoints(&mut self) -> anyhow::Result<Vec<u64>> {
        Ok(self.breakpoints.iter().copied().collect())
    }

    fn add_breakpoint(&mut self, addr: u64) -> anyhow::Result<()> {
        self.record(format!("add_breakpoint {:#x}", addr));
        self.breakpoints.insert(addr);
        Ok(())
    }

    fn remove_breakpoint(&mut self, addr: u64) -> anyhow::Result<()> {
        self.record(format!("remove_breakpoint {:#x}", addr));
        self.breakpoints.remove(&addr);
        Ok(())
    }

    fn disassemble(&mut self, addr: u64) -> anyhow::Result<String> {
        Ok(self.listings.get(&addr).cloned().unwrap_or_else(|| "nop".to_string()))
    }

    fn read_pointer(&mut self, addr: u64) -> anyhow::Result<u64> {
        if !self.is_valid(addr) {
            return Err(anyhow::anyhow!("Memory access error at {:#x}", addr));
        }
        Ok(self.memory.get(&addr).copied().unwrap_or(0))
    }

    fn is_valid(&mut self, addr: u64) -> bool {
        self.readable.iter().any(|range| range.contains(&addr))
    }

    fn symbol_at(&mut self, addr: u64) -> Option<SymbolInfo> {
        self.symbols.get(&addr).cloned()
    }

    fn module(&mut self) -> anyhow::Result<ModuleRange> {
        Ok(self.module)
    }
}
