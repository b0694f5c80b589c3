//! 解析ツール側のセッション
//!
//! 1つの解析コンテキストについて、デバッガ側との接続、ブレークポイントと命令ポインタの
//! 状態、ホスト上のハイライトを管理します。受信ループは専用スレッドで動き、
//! ユーザー操作はUIスレッドから直接呼ばれます。

use crate::comment::vtable_comment;
use crate::error::AnalyzerError;
use crate::host::{AnalysisHost, Highlight};
use crate::launcher::{DebuggerLauncher, LaunchRequest};
use crate::{lock, Result};
use bindbg_core::{
    resolve_branch_target, Condition, Connector, Message, ModuleRange, RegisterSnapshot, RelativeAddress,
    SyncConfig, SyncError, Transport,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// セッション終了時に呼ばれるフック（レジストリからの登録解除）
pub type StopHook = Box<dyn FnOnce() + Send>;

/// 解析ツール側が把握している状態（解析ツール上の絶対アドレス）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub breakpoints: BTreeSet<u64>,
    pub ip: Option<u64>,
    /// 命令ポインタがブレークポイントで止まった結果か
    pub hit: bool,
    /// 条件分岐の実際の分岐先
    pub branch_target: Option<u64>,
}

impl SessionState {
    /// 状態から決まるハイライト
    ///
    /// 命令ポインタ、分岐先、ブレークポイントの順に優先します。
    pub fn highlight_at(&self, addr: u64) -> Highlight {
        if self.ip == Some(addr) {
            if self.hit && self.breakpoints.contains(&addr) {
                Highlight::BreakpointHit
            } else {
                Highlight::InstructionPointer
            }
        } else if self.branch_target == Some(addr) {
            Highlight::BranchTarget
        } else if self.breakpoints.contains(&addr) {
            Highlight::Breakpoint
        } else {
            Highlight::None
        }
    }

    /// ハイライトが付いているアドレス
    fn marked(&self) -> BTreeSet<u64> {
        let mut marked = self.breakpoints.clone();
        marked.extend(self.ip);
        marked.extend(self.branch_target);
        marked
    }
}

/// 解析ツール側のセッション
pub struct AnalyzerSession {
    context: String,
    host: Arc<dyn AnalysisHost>,
    module: ModuleRange,
    config: SyncConfig,
    request: LaunchRequest,
    launcher: Mutex<Box<dyn DebuggerLauncher>>,
    /// このセッションが起動したデバッガのプロセスID
    launched: Mutex<Option<u32>>,
    state: Mutex<SessionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    stopped: AtomicBool,
    on_stop: Mutex<Option<StopHook>>,
}

impl AnalyzerSession {
    /// セッションを作成する。接続は `spawn` で始まる
    pub fn new(
        context: impl Into<String>,
        host: Arc<dyn AnalysisHost>,
        request: LaunchRequest,
        launcher: Box<dyn DebuggerLauncher>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let module = host.module();
        Arc::new(Self {
            context: context.into(),
            host,
            module,
            config,
            request,
            launcher: Mutex::new(launcher),
            launched: Mutex::new(None),
            state: Mutex::new(SessionState::default()),
            transport: Mutex::new(None),
            stopped: AtomicBool::new(false),
            on_stop: Mutex::new(None),
        })
    }

    /// 終了時のフックを設定する
    pub fn set_stop_hook(&self, hook: StopHook) {
        *lock(&self.on_stop) = Some(hook);
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// 現在の状態のコピー
    pub fn state(&self) -> SessionState {
        lock(&self.state).clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.transport).is_some()
    }

    /// このセッションが起動したデバッガのプロセスID
    pub fn launched_pid(&self) -> Option<u32> {
        *lock(&self.launched)
    }

    /// 受信ループを専用スレッドで開始する
    pub fn spawn(self: &Arc<Self>, connector: Box<dyn Connector>) -> Result<JoinHandle<()>> {
        let session = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("bindbg-{}", self.context))
            .spawn(move || session.run(connector))?;
        Ok(handle)
    }

    /// 接続し、セッションが終わるまで受信を続ける
    pub fn run(&self, mut connector: Box<dyn Connector>) {
        let Some(transport) = self.establish(connector.as_mut()) else {
            return;
        };

        *lock(&self.transport) = Some(Arc::clone(&transport));
        if self.is_stopped() {
            // 接続中にstopされた
            transport.close();
            return;
        }

        info!("Connected to debugger");
        if let Err(e) = self.send(Message::Sync) {
            warn!("Failed to request sync: {:#}", e);
        }

        loop {
            match transport.poll(self.config.poll_interval) {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle(message) {
                        debug!("dropping message: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.stop(&format!("Lost connection to debugger: {}", e));
                    return;
                }
            }
            if self.is_stopped() {
                return;
            }
        }
    }

    /// 既存のデバッガに接続する。居なければ起動して、接続できるまで待つ
    fn establish(&self, connector: &mut dyn Connector) -> Option<Arc<dyn Transport>> {
        match connector.connect() {
            Ok(transport) => return Some(Arc::from(transport)),
            Err(e) => debug!("no debugger on '{}': {}", self.request.endpoint, e),
        }

        if self.is_stopped() {
            return None;
        }
        if let Err(e) = self.launch() {
            self.stop(&format!("Failed to start debugger: {:#}", e));
            return None;
        }

        loop {
            thread::sleep(self.config.connect_retry);
            if self.is_stopped() {
                return None;
            }
            match connector.connect() {
                Ok(transport) => return Some(Arc::from(transport)),
                Err(e) => debug!("debugger not ready on '{}': {}", self.request.endpoint, e),
            }
        }
    }

    fn launch(&self) -> Result<()> {
        let pid = lock(&self.launcher).launch(&self.request)?;
        *lock(&self.launched) = Some(pid);
        // 起動中にstopされた場合は、stopが見逃したプロセスをここで閉じる
        if self.is_stopped() && lock(&self.launched).take().is_some() {
            lock(&self.launcher).close()?;
        }
        Ok(())
    }

    /// 受信したメッセージを適用する
    pub fn handle(&self, message: Message) -> std::result::Result<(), SyncError> {
        debug!(command = message.command(), "received {:?}", message);

        match message {
            Message::SetBp { addr } => {
                let addr = self.inbound(addr)?;
                let mut state = lock(&self.state);
                if self.is_stopped() {
                    return Ok(());
                }
                state.breakpoints.insert(addr);
                self.paint(&state, addr);
            }
            Message::DeleteBp { addr } => {
                let addr = self.inbound(addr)?;
                let mut state = lock(&self.state);
                if self.is_stopped() {
                    return Ok(());
                }
                if state.breakpoints.remove(&addr) {
                    self.paint(&state, addr);
                }
            }
            Message::SetIp { ip, regs } => {
                let ip = self.inbound(ip)?;
                self.show_ip(ip, regs.as_ref(), false);
            }
            Message::BpHit { addr, regs } => {
                let addr = self.inbound(addr)?;
                self.show_ip(addr, Some(&regs), true);
            }
            Message::Vtable {
                ip,
                target,
                object,
                instr,
            } => {
                let ip = self.inbound(ip)?;
                let target = self.module.to_absolute(target);
                let object = object.map(|object| self.module.to_absolute(object));
                let comment = vtable_comment(self.host.as_ref(), target, object, instr);
                if self.is_stopped() {
                    return Ok(());
                }
                if self.host.containing_function(ip).is_some() {
                    self.host.set_comment(ip, &comment);
                } else {
                    trace!("no function contains 0x{:x}, skipping comment '{}'", ip, comment);
                }
            }
            Message::Print { message } => info!("debugger: {}", message),
            other => debug!("ignoring {} from debugger", other.command()),
        }
        Ok(())
    }

    /// 受信したアドレスを解析ツール上の絶対アドレスにする
    fn inbound(&self, rel: RelativeAddress) -> std::result::Result<u64, SyncError> {
        let addr = self.module.checked_absolute(rel)?;
        if !self.host.is_valid(addr) {
            return Err(SyncError::ProtocolViolation {
                addr: rel,
                size: self.module.size(),
            });
        }
        Ok(addr)
    }

    /// 送信するアドレスをモジュール相対にする
    fn outbound(&self, addr: u64) -> Result<RelativeAddress> {
        if !self.module.contains(addr) || !self.host.is_valid(addr) {
            return Err(AnalyzerError::OutsideModule(addr).into());
        }
        Ok(self.module.to_relative(addr))
    }

    fn show_ip(&self, ip: u64, regs: Option<&RegisterSnapshot>, hit: bool) {
        let target = regs.and_then(|regs| self.branch_target(ip, regs));

        let mut state = lock(&self.state);
        if self.is_stopped() {
            return;
        }
        let previous = [state.ip, state.branch_target];
        state.ip = Some(ip);
        state.hit = hit;
        state.branch_target = target;

        for addr in previous.into_iter().flatten() {
            self.paint(&state, addr);
        }
        self.paint(&state, ip);
        if let Some(target) = target {
            self.paint(&state, target);
        }
        drop(state);

        self.host.navigate(ip);
    }

    /// 条件分岐なら実際に進む先を求める
    fn branch_target(&self, ip: u64, regs: &RegisterSnapshot) -> Option<u64> {
        let instruction = self.host.instruction(ip)?;
        Condition::from_mnemonic(&instruction.mnemonic)?;
        Some(resolve_branch_target(
            ip,
            &instruction.mnemonic,
            &instruction.operands,
            instruction.length,
            Some(regs),
        ))
    }

    /// 状態に合わせてハイライトし直す
    fn paint(&self, state: &SessionState, addr: u64) {
        self.paint_as(addr, state.highlight_at(addr));
    }

    fn paint_as(&self, addr: u64, highlight: Highlight) {
        if self.host.containing_function(addr).is_some() {
            self.host.highlight(addr, highlight);
        } else {
            trace!("no function contains 0x{:x}", addr);
        }
    }

    fn connected(&self) -> Result<Arc<dyn Transport>> {
        lock(&self.transport)
            .clone()
            .ok_or_else(|| AnalyzerError::NotConnected.into())
    }

    /// メッセージを送る。送れなかった場合はセッションを終了する
    pub fn send(&self, message: Message) -> Result<()> {
        let transport = self.connected()?;
        self.forward(transport.as_ref(), &message);
        Ok(())
    }

    fn forward(&self, transport: &dyn Transport, message: &Message) {
        debug!(command = message.command(), "sending {:?}", message);
        if let Err(e) = transport.send(message) {
            self.stop(&format!("Lost connection to debugger: {}", e));
        }
    }

    /// ブレークポイントを設定する
    pub fn set_bp(&self, addr: u64) -> Result<()> {
        let rel = self.outbound(addr)?;
        let transport = self.connected()?;
        {
            let mut state = lock(&self.state);
            if self.is_stopped() {
                return Err(AnalyzerError::NotConnected.into());
            }
            state.breakpoints.insert(addr);
            self.paint(&state, addr);
        }
        self.forward(transport.as_ref(), &Message::SetBp { addr: rel });
        Ok(())
    }

    /// ブレークポイントを削除する。設定されていなければ何もしない
    pub fn delete_bp(&self, addr: u64) -> Result<()> {
        let rel = self.outbound(addr)?;
        let transport = self.connected()?;
        {
            let mut state = lock(&self.state);
            if self.is_stopped() {
                return Err(AnalyzerError::NotConnected.into());
            }
            if !state.breakpoints.remove(&addr) {
                return Ok(());
            }
            self.paint(&state, addr);
        }
        self.forward(transport.as_ref(), &Message::DeleteBp { addr: rel });
        Ok(())
    }

    /// 命令ポインタを移動する
    pub fn set_ip(&self, addr: u64) -> Result<()> {
        let rel = self.outbound(addr)?;
        let transport = self.connected()?;
        self.show_ip(addr, None, false);
        self.forward(transport.as_ref(), &Message::SetIp { ip: rel, regs: None });
        Ok(())
    }

    /// 指定位置まで実行する
    pub fn run_to(&self, addr: u64) -> Result<()> {
        let rel = self.outbound(addr)?;
        self.send(Message::RunTo { addr: rel })
    }

    pub fn go(&self) -> Result<()> {
        self.send(Message::Go)
    }

    pub fn step_in(&self) -> Result<()> {
        self.send(Message::StepIn)
    }

    pub fn step_over(&self) -> Result<()> {
        self.send(Message::StepOver)
    }

    pub fn step_out(&self) -> Result<()> {
        self.send(Message::StepOut)
    }

    pub fn sync(&self) -> Result<()> {
        self.send(Message::Sync)
    }

    /// 実行を中断する
    ///
    /// 自分で起動したデバッガにはシグナルで、それ以外には `break` メッセージで伝えます。
    pub fn interrupt(&self) -> Result<()> {
        if self.launched_pid().is_some() {
            return lock(&self.launcher).interrupt();
        }
        self.send(Message::Break)
    }

    /// セッションを終了する。何度呼んでもよい
    ///
    /// 停止フラグは状態のロック中に立てるので、受信ループが処理中のメッセージは
    /// 消した状態を書き戻せません。
    pub fn stop(&self, reason: &str) {
        let marked = {
            let mut state = lock(&self.state);
            if self.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            let marked = state.marked();
            *state = SessionState::default();
            marked
        };

        if let Some(transport) = lock(&self.transport).take() {
            transport.close();
        }
        for addr in marked {
            self.paint_as(addr, Highlight::None);
        }

        if lock(&self.launched).take().is_some() {
            if let Err(e) = lock(&self.launcher).close() {
                warn!("Failed to close debugger: {:#}", e);
            }
        }

        let hook = lock(&self.on_stop).take();
        if let Some(hook) = hook {
            hook();
        }

        info!("{}", reason);
    }
}
