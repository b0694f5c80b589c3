//! デバッガ側のセッション
//!
//! 1つの接続について、受信したコマンドをデバッガに適用し、
//! デバッガ上の変化（命令ポインタ、ブレークポイント）を相手に送ります。

use crate::backend::{DebuggerBackend, ExecutionStatus};
use crate::vtable::VtableResolver;
use crate::Result;
use bindbg_core::{Message, ModuleRange, SyncConfig, SyncError, Transport};
use std::collections::BTreeSet;
use std::thread;
use tracing::{debug, info, warn};

/// セッションが終わった理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// 接続が切れた。サーバは次の接続を待つ
    Disconnected(String),
    /// ターゲットプロセスが終了した
    TargetTerminated,
}

/// デバッガ側のセッション
pub struct DebuggerSession<'a, B: DebuggerBackend + ?Sized> {
    backend: &'a mut B,
    transport: Box<dyn Transport>,
    config: SyncConfig,
    module: ModuleRange,
    /// 相手と同期済みのブレークポイント（絶対アドレス）
    tracked: BTreeSet<u64>,
    /// 最後に観測した命令ポインタ
    ip: Option<u64>,
    resolver: VtableResolver,
    ended: Option<SessionEnd>,
}

impl<'a, B: DebuggerBackend + ?Sized> DebuggerSession<'a, B> {
    /// セッションを作成する
    ///
    /// 既存のブレークポイントを同期済みとして取り込み、最初の `sync` で送れるようにします。
    pub fn new(backend: &'a mut B, transport: Box<dyn Transport>, config: SyncConfig) -> Result<Self> {
        let module = backend.module()?;
        let tracked = backend.breakpoints()?.into_iter().collect();
        Ok(Self {
            backend,
            transport,
            config,
            module,
            tracked,
            ip: None,
            resolver: VtableResolver::new()?,
            ended: None,
        })
    }

    /// バックエンドを取得する
    pub fn backend(&self) -> &B {
        self.backend
    }

    /// バックエンドを可変で取得する
    pub fn backend_mut(&mut self) -> &mut B {
        self.backend
    }

    /// 同期済みのブレークポイント
    pub fn tracked(&self) -> &BTreeSet<u64> {
        &self.tracked
    }

    /// 終了していれば理由を返す
    pub fn ended(&self) -> Option<&SessionEnd> {
        self.ended.as_ref()
    }

    /// セッションが終わるまでティックを繰り返す
    pub fn run(&mut self) -> SessionEnd {
        loop {
            if let Some(end) = self.tick() {
                return end;
            }
        }
    }

    /// 1ティック実行する。セッションが終わった場合はその理由を返す
    pub fn tick(&mut self) -> Option<SessionEnd> {
        if let Some(end) = &self.ended {
            return Some(end.clone());
        }

        match self.try_tick() {
            Ok(()) => {}
            Err(SyncError::Transport(e)) => {
                self.stop(SessionEnd::Disconnected(format!("Lost connection to analyzer: {}", e)));
            }
            Err(SyncError::NativeQuery(e)) => {
                warn!("debugger query failed: {:#}", e);
                if let Err(e) = self.send(Message::print(format!("{:#}. Try again", e))) {
                    self.stop(SessionEnd::Disconnected(format!("Lost connection to analyzer: {}", e)));
                }
            }
            Err(e @ SyncError::ProtocolViolation { .. }) => debug!("dropping message: {}", e),
        }
        self.ended.clone()
    }

    /// セッションを終了する。何度呼んでもよい
    pub fn stop(&mut self, reason: SessionEnd) {
        if self.ended.is_some() {
            return;
        }
        self.transport.close();
        match &reason {
            SessionEnd::Disconnected(message) => info!("{}", message),
            SessionEnd::TargetTerminated => info!("Target process exited"),
        }
        self.ended = Some(reason);
    }

    fn try_tick(&mut self) -> std::result::Result<(), SyncError> {
        if let Some(message) = self.transport.poll(self.config.poll_interval)? {
            debug!(command = message.command(), "received {:?}", message);

            let interrupted = if self.backend.status()? == ExecutionStatus::Running {
                self.backend.interrupt()?;
                // 停止の報告が実際の停止より先に返ることがある
                thread::sleep(self.config.settle_delay);
                true
            } else {
                false
            };

            let resume = match self.apply(message) {
                Ok(resume) => resume,
                Err(e @ SyncError::ProtocolViolation { .. }) => {
                    debug!("dropping message: {}", e);
                    true
                }
                Err(e) => return Err(e),
            };

            if interrupted && resume && self.backend.status()? == ExecutionStatus::Stopped {
                self.backend.go()?;
                return Ok(());
            }
        }

        match self.backend.status()? {
            ExecutionStatus::Running => return Ok(()),
            ExecutionStatus::Terminated => {
                let _ = self.send(Message::print("Target process exited"));
                self.stop(SessionEnd::TargetTerminated);
                return Ok(());
            }
            ExecutionStatus::Stopped => {}
        }

        let ip = self.backend.ip()?;
        if self.ip != Some(ip) {
            // 送れなかった場合は次のティックでやり直す
            self.report_ip(ip)?;
            self.ip = Some(ip);
            self.report_vtable(ip)?;
        }

        if self.backend.breakpoint_count()? != self.tracked.len() {
            self.reconcile_breakpoints()?;
        }
        Ok(())
    }

    /// メッセージを適用する。実行を止めたままにする場合は `false` を返す
    fn apply(&mut self, message: Message) -> std::result::Result<bool, SyncError> {
        match message {
            Message::Sync => {
                let ip = self.backend.ip()?;
                let regs = self.backend.registers()?;
                self.send(Message::SetIp {
                    ip: self.module.to_relative(ip),
                    regs: Some(regs),
                })?;
                let tracked: Vec<u64> = self.tracked.iter().copied().collect();
                for addr in tracked {
                    self.send(Message::SetBp {
                        addr: self.module.to_relative(addr),
                    })?;
                }
                if self.ip != Some(ip) {
                    self.ip = Some(ip);
                    self.report_vtable(ip)?;
                }
            }
            Message::SetBp { addr } => {
                let addr = self.module.checked_absolute(addr)?;
                if !self.tracked.contains(&addr) {
                    self.backend.add_breakpoint(addr)?;
                    self.tracked.insert(addr);
                }
            }
            Message::DeleteBp { addr } => {
                let addr = self.module.checked_absolute(addr)?;
                if self.tracked.contains(&addr) {
                    self.backend.remove_breakpoint(addr)?;
                    self.tracked.remove(&addr);
                }
            }
            Message::SetIp { ip, .. } => {
                let ip = self.module.checked_absolute(ip)?;
                self.backend.set_ip(ip)?;
                // 相手が知っている値なので送り返さない
                if self.ip != Some(ip) {
                    self.ip = Some(ip);
                    self.report_vtable(ip)?;
                }
            }
            Message::Go => self.backend.go()?,
            Message::Break => {
                if self.backend.status()? == ExecutionStatus::Running {
                    self.backend.interrupt()?;
                }
                return Ok(false);
            }
            Message::StepIn => self.backend.step_in()?,
            Message::StepOver => self.backend.step_over()?,
            Message::StepOut => self.backend.step_out()?,
            Message::RunTo { addr } => {
                let addr = self.module.checked_absolute(addr)?;
                self.backend.run_to(addr)?;
            }
            Message::Print { message } => info!("analyzer: {}", message),
            Message::BpHit { .. } | Message::Vtable { .. } => {
                debug!("ignoring {} from analyzer", message.command());
            }
        }
        Ok(true)
    }

    fn report_ip(&mut self, ip: u64) -> std::result::Result<(), SyncError> {
        let regs = self.backend.registers()?;
        let rel = self.module.to_relative(ip);
        if self.tracked.contains(&ip) {
            self.send(Message::BpHit { addr: rel, regs })
        } else {
            self.send(Message::SetIp {
                ip: rel,
                regs: Some(regs),
            })
        }
    }

    fn report_vtable(&mut self, ip: u64) -> std::result::Result<(), SyncError> {
        if let Some(event) = self.resolver.resolve(&mut *self.backend, ip)? {
            self.send(Message::Vtable {
                ip: self.module.to_relative(event.ip),
                target: self.module.to_relative(event.target),
                object: event.object.map(|object| self.module.to_relative(object)),
                instr: event.instr,
            })?;
        }
        Ok(())
    }

    /// デバッガ上で直接追加・削除されたブレークポイントを相手に送る
    fn reconcile_breakpoints(&mut self) -> std::result::Result<(), SyncError> {
        let native: BTreeSet<u64> = self.backend.breakpoints()?.into_iter().collect();

        let added: Vec<u64> = native.difference(&self.tracked).copied().collect();
        let removed: Vec<u64> = self.tracked.difference(&native).copied().collect();

        for addr in added {
            self.tracked.insert(addr);
            self.send(Message::SetBp {
                addr: self.module.to_relative(addr),
            })?;
        }
        for addr in removed {
            self.tracked.remove(&addr);
            self.send(Message::DeleteBp {
                addr: self.module.to_relative(addr),
            })?;
        }
        Ok(())
    }

    fn send(&self, message: Message) -> std::result::Result<(), SyncError> {
        self.transport.send(&message)?;
        Ok(())
    }
}
