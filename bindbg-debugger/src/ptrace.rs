//! ptraceによるバックエンド（Linux x86_64）

use crate::backend::{DebuggerBackend, ExecutionStatus, SymbolInfo};
use crate::Result;
use bindbg_core::{ModuleRange, RegisterSnapshot};
use bindbg_target::disasm::MAX_INSTRUCTION_LEN;
use bindbg_target::{Decoder, Instruction, Memory, ModuleImage, Process, Registers, SoftwareBreakpoint, StopReason};
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 停止待ちのポーリング間隔
const WAIT_POLL: Duration = Duration::from_millis(10);

const PAGE_SIZE: u64 = 0x1000;

/// ptraceで制御するデバッガ
pub struct PtraceBackend {
    process: Process,
    memory: Memory,
    registers: Registers,
    decoder: Decoder,
    image: Option<ModuleImage>,
    module: ModuleRange,
    breakpoints: BTreeMap<u64, SoftwareBreakpoint>,
    /// run_to / step_over 用の一時ブレークポイント。次の停止で消える
    temporary: Option<SoftwareBreakpoint>,
    status: ExecutionStatus,
    /// 次の再開時に配送するシグナル
    pending_signal: Option<Signal>,
    /// 割り込みのSIGSTOPが別の停止に追い越され、まだ届いていない
    stray_stop: bool,
    /// Ctrl-Cなど別スレッドからの停止要求
    break_requested: Arc<AtomicBool>,
}

impl PtraceBackend {
    /// プログラムを起動してデバッグする
    pub fn launch(program: &Path, args: &[String], cwd: Option<&Path>) -> Result<Self> {
        Self::from_process(Process::spawn(program, args, cwd)?)
    }

    /// 実行中のプロセスにアタッチする
    pub fn attach(pid: i32) -> Result<Self> {
        Self::from_process(Process::attach(pid)?)
    }

    fn from_process(process: Process) -> Result<Self> {
        let memory = Memory::new(process.pid());
        let registers = Registers::new(process.pid());

        let exe = memory.executable_path()?;
        let (start, end) = memory.executable_span()?;
        let module = ModuleRange::new(start, end - start);
        let image = match ModuleImage::load(&exe) {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("symbols unavailable for {}: {:#}", exe.display(), e);
                None
            }
        };
        info!(
            "debugging pid {} ({}), module at {:#x}..{:#x}",
            process.pid(),
            exe.display(),
            start,
            end
        );

        Ok(Self {
            process,
            memory,
            registers,
            decoder: Decoder::x86_64()?,
            image,
            module,
            breakpoints: BTreeMap::new(),
            temporary: None,
            status: ExecutionStatus::Stopped,
            pending_signal: None,
            stray_stop: false,
            break_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// ターゲットのプロセスID
    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    /// 別スレッドから停止を要求するためのフラグ
    ///
    /// `true` にすると、次に状態を調べたときにターゲットを停止させます。
    pub fn break_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.break_requested)
    }

    fn ensure_stopped(&self) -> Result<()> {
        match self.status {
            ExecutionStatus::Stopped => Ok(()),
            ExecutionStatus::Running => Err(anyhow::anyhow!("Target is running")),
            ExecutionStatus::Terminated => Err(anyhow::anyhow!("Target process has exited")),
        }
    }

    /// 実行中なら停止イベントを確認する
    fn poll_stop(&mut self) -> Result<()> {
        if self.status != ExecutionStatus::Running {
            return Ok(());
        }
        if self.break_requested.swap(false, Ordering::SeqCst) {
            return self.interrupt();
        }
        if let Some(reason) = self.process.try_wait()? {
            if self.stray_stop && reason == StopReason::Signal(Signal::SIGSTOP) {
                // 前回の割り込みの残り
                self.stray_stop = false;
                self.process.cont(None)?;
                return Ok(());
            }
            self.on_stop(reason)?;
        }
        Ok(())
    }

    /// 実行中に起きた停止を処理する
    fn on_stop(&mut self, reason: StopReason) -> Result<()> {
        self.break_requested.store(false, Ordering::SeqCst);
        match reason {
            StopReason::Exited(code) => {
                info!("target exited with status {}", code);
                self.status = ExecutionStatus::Terminated;
                return Ok(());
            }
            StopReason::Killed(signal) => {
                info!("target killed by {}", signal);
                self.status = ExecutionStatus::Terminated;
                return Ok(());
            }
            StopReason::Trap => {
                // INT3の実行後はRIPが1バイト先を指している
                let pc = self.registers.get_pc()?;
                let hit = pc.wrapping_sub(1);
                if self.int3_at(hit) {
                    self.registers.set_pc(hit)?;
                    debug!("breakpoint hit at {:#x}", hit);
                }
            }
            StopReason::Signal(Signal::SIGSTOP | Signal::SIGINT) => {}
            StopReason::Signal(signal) => {
                debug!("target stopped by {}", signal);
                self.pending_signal = Some(signal);
            }
        }
        self.clear_temporary()?;
        self.status = ExecutionStatus::Stopped;
        Ok(())
    }

    /// 1命令実行した後の処理
    fn after_step(&mut self, reason: StopReason) -> Result<()> {
        match reason {
            StopReason::Trap => Ok(()),
            other => {
                self.status = ExecutionStatus::Running;
                self.on_stop(other)
            }
        }
    }

    /// アドレスに有効なINT3が置かれているか
    fn int3_at(&self, addr: u64) -> bool {
        self.breakpoints.get(&addr).map_or(false, |bp| bp.is_enabled())
            || self
                .temporary
                .as_ref()
                .map_or(false, |bp| bp.address() == addr && bp.is_enabled())
    }

    fn set_int3(&mut self, addr: u64, enabled: bool) -> Result<()> {
        let temporary = self.temporary.as_mut().filter(|bp| bp.address() == addr);
        for bp in self.breakpoints.get_mut(&addr).into_iter().chain(temporary) {
            if enabled {
                bp.enable(&self.memory)?;
            } else {
                bp.disable(&self.memory)?;
            }
        }
        Ok(())
    }

    fn clear_temporary(&mut self) -> Result<()> {
        if let Some(mut bp) = self.temporary.take() {
            bp.disable(&self.memory)?;
        }
        Ok(())
    }

    /// 現在の命令ポインタのINT3を避けて1命令実行する
    fn single_step(&mut self) -> Result<StopReason> {
        let pc = self.registers.get_pc()?;
        if !self.int3_at(pc) {
            return self.process.step();
        }
        self.set_int3(pc, false)?;
        let reason = self.process.step()?;
        if !reason.is_terminated() {
            self.set_int3(pc, true)?;
        }
        Ok(reason)
    }

    /// 停止するまで待つ。停止要求があれば割り込む
    fn wait_until_stopped(&mut self) -> Result<()> {
        loop {
            self.poll_stop()?;
            if self.status != ExecutionStatus::Running {
                return Ok(());
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// ブレークポイントを除いた命令バイト列を読む
    fn read_code(&self, addr: u64) -> Result<Vec<u8>> {
        let mut bytes = match self.memory.read(addr, MAX_INSTRUCTION_LEN) {
            Ok(bytes) => bytes,
            Err(_) => {
                // 次のページがマップされていない場合はページ末尾まで
                let len = (PAGE_SIZE - (addr % PAGE_SIZE)).min(MAX_INSTRUCTION_LEN as u64);
                self.memory.read(addr, len as usize)?
            }
        };
        for bp in self.breakpoints.values().chain(self.temporary.as_ref()) {
            bp.unpatch(&mut bytes, addr);
        }
        Ok(bytes)
    }

    fn decode_at(&self, addr: u64) -> Result<(Instruction, Vec<u8>)> {
        let bytes = self.read_code(addr)?;
        let insn = self
            .decoder
            .decode(&bytes, addr)?
            .ok_or_else(|| anyhow::anyhow!("Invalid instruction at {:#x}", addr))?;
        Ok((insn, bytes))
    }
}

impl DebuggerBackend for PtraceBackend {
    fn status(&mut self) -> Result<ExecutionStatus> {
        self.poll_stop()?;
        Ok(self.status)
    }

    fn go(&mut self) -> Result<()> {
        match self.status {
            ExecutionStatus::Running => return Ok(()),
            ExecutionStatus::Terminated => return Err(anyhow::anyhow!("Target process has exited")),
            ExecutionStatus::Stopped => {}
        }
        // ブレークポイント上から再開する場合は、先に1命令進める
        let pc = self.registers.get_pc()?;
        if self.int3_at(pc) {
            let reason = self.single_step()?;
            if reason != StopReason::Trap {
                return self.after_step(reason);
            }
        }
        self.process.cont(self.pending_signal.take())?;
        self.status = ExecutionStatus::Running;
        Ok(())
    }

    fn interrupt(&mut self) -> Result<()> {
        if self.status != ExecutionStatus::Running {
            return Ok(());
        }
        self.process.interrupt()?;
        let reason = self.process.wait()?;
        if reason != StopReason::Signal(Signal::SIGSTOP) {
            self.stray_stop = !reason.is_terminated();
        }
        self.on_stop(reason)
    }

    fn step_in(&mut self) -> Result<()> {
        self.ensure_stopped()?;
        let reason = self.single_step()?;
        self.after_step(reason)
    }

    fn step_over(&mut self) -> Result<()> {
        self.ensure_stopped()?;
        let pc = self.registers.get_pc()?;
        let (insn, _) = self.decode_at(pc)?;
        if insn.is_call() {
            self.run_to(insn.next_address())
        } else {
            self.step_in()
        }
    }

    fn step_out(&mut self) -> Result<()> {
        self.ensure_stopped()?;
        loop {
            let pc = self.registers.get_pc()?;
            let (insn, _) = self.decode_at(pc)?;
            if insn.is_ret() {
                return self.step_in();
            }

            if insn.is_call() {
                self.run_to(insn.next_address())?;
                self.wait_until_stopped()?;
            } else {
                self.step_in()?;
            }
            if self.status != ExecutionStatus::Stopped {
                return Ok(());
            }

            // 途中のブレークポイントや停止要求ではそこで止まる
            let now = self.registers.get_pc()?;
            if (insn.is_call() && now != insn.next_address())
                || self.breakpoints.contains_key(&now)
                || self.break_requested.swap(false, Ordering::SeqCst)
            {
                return Ok(());
            }
        }
    }

    fn run_to(&mut self, addr: u64) -> Result<()> {
        self.ensure_stopped()?;
        if !self.breakpoints.contains_key(&addr) {
            self.clear_temporary()?;
            let mut bp = SoftwareBreakpoint::new(addr);
            bp.enable(&self.memory)?;
            self.temporary = Some(bp);
        }
        self.go()
    }

    fn ip(&mut self) -> Result<u64> {
        self.registers.get_pc()
    }

    fn set_ip(&mut self, addr: u64) -> Result<()> {
        self.ensure_stopped()?;
        self.registers.set_pc(addr)
    }

    fn registers(&mut self) -> Result<RegisterSnapshot> {
        self.registers.snapshot()
    }

    fn register(&mut self, name: &str) -> Result<u64> {
        self.registers.get(name)
    }

    fn set_register(&mut self, name: &str, value: u64) -> Result<()> {
        self.ensure_stopped()?;
        self.registers.set(name, value)
    }

    fn breakpoint_count(&mut self) -> Result<usize> {
        Ok(self.breakpoints.len())
    }

    fn breakpoints(&mut self) -> Result<Vec<u64>> {
        Ok(self.breakpoints.keys().copied().collect())
    }

    fn add_breakpoint(&mut self, addr: u64) -> Result<()> {
        if self.breakpoints.contains_key(&addr) {
            return Ok(());
        }
        // 同じアドレスに2つのINT3を重ねない
        if self.temporary.as_ref().map_or(false, |bp| bp.address() == addr) {
            self.clear_temporary()?;
        }
        let mut bp = SoftwareBreakpoint::new(addr);
        bp.enable(&self.memory)?;
        self.breakpoints.insert(addr, bp);
        debug!("breakpoint set at {:#x}", addr);
        Ok(())
    }

    fn remove_breakpoint(&mut self, addr: u64) -> Result<()> {
        if let Some(mut bp) = self.breakpoints.remove(&addr) {
            bp.disable(&self.memory)?;
            debug!("breakpoint removed at {:#x}", addr);
        }
        Ok(())
    }

    fn disassemble(&mut self, addr: u64) -> Result<String> {
        let (insn, bytes) = self.decode_at(addr)?;
        let raw: String = bytes[..insn.length as usize]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Ok(format!("{:016x} {} {}", addr, raw, insn.text()))
    }

    fn read_pointer(&mut self, addr: u64) -> Result<u64> {
        self.memory.read_pointer(addr)
    }

    fn is_valid(&mut self, addr: u64) -> bool {
        self.memory.is_readable(addr).unwrap_or(false)
    }

    fn symbol_at(&mut self, addr: u64) -> Option<SymbolInfo> {
        if !self.module.contains(addr) {
            return None;
        }
        let image = self.image.as_ref()?;
        let image_addr = addr - self.module.base() + image.base();
        let is_import = image.is_import(image_addr);
        match image.symbol_at(image_addr) {
            Some(symbol) => Some(SymbolInfo {
                name: symbol.display_name().to_string(),
                address: symbol.address.wrapping_sub(image.base()).wrapping_add(self.module.base()),
                is_import,
            }),
            None if is_import => Some(SymbolInfo {
                name: format!("{:#x}", addr),
                address: addr,
                is_import,
            }),
            None => None,
        }
    }

    fn module(&mut self) -> Result<ModuleRange> {
        Ok(self.module)
    }
}
