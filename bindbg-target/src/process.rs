//! プロセス制御機能

use crate::Result;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execv, fork, ForkResult, Pid};
use std::ffi::CString;
use std::path::Path;
use tracing::debug;

/// 停止イベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// SIGTRAPによる停止（ブレークポイントまたはステップ）
    Trap,
    /// その他のシグナルによる停止
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// シグナルによる強制終了
    Killed(Signal),
}

impl StopReason {
    /// プロセスがもう存在しないか
    pub fn is_terminated(&self) -> bool {
        matches!(self, StopReason::Exited(_) | StopReason::Killed(_))
    }
}

/// waitpidの結果を停止イベントに変換する
///
/// まだ停止していない場合は `None` を返します。
fn stop_reason(status: WaitStatus) -> Option<StopReason> {
    match status {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => Some(StopReason::Trap),
        WaitStatus::Stopped(_, signal) => Some(StopReason::Signal(signal)),
        WaitStatus::PtraceEvent(..) | WaitStatus::PtraceSyscall(_) => Some(StopReason::Trap),
        WaitStatus::Exited(_, code) => Some(StopReason::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(StopReason::Killed(signal)),
        WaitStatus::Continued(_) | WaitStatus::StillAlive => None,
    }
}

/// デバッグ対象のプロセス
pub struct Process {
    pid: Pid,
    /// 自分で起動したプロセスか（ドロップ時に終了させる）
    spawned: bool,
}

impl Process {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// 子プロセスは作業ディレクトリを移動し、PTRACE_TRACEMEを設定してからexecします。
    /// exec直後の停止状態で返されます。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String], cwd: Option<&Path>) -> Result<Self> {
        let program = program.as_ref();
        let program_path = program
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid program path {:?}", program))?;
        let program_cstring = CString::new(program_path)?;

        let mut argv = vec![program_cstring.clone()];
        for arg in args {
            argv.push(CString::new(arg.as_str())?);
        }

        // fork後は確保を避けるため、先にすべて用意しておく
        let cwd = cwd.map(|dir| dir.to_path_buf());

        match unsafe { fork()? } {
            ForkResult::Child => {
                if let Some(dir) = &cwd {
                    if chdir(dir.as_path()).is_err() {
                        unsafe { nix::libc::_exit(126) };
                    }
                }
                if ptrace::traceme().is_err() {
                    unsafe { nix::libc::_exit(126) };
                }
                let _ = execv(&program_cstring, &argv);
                unsafe { nix::libc::_exit(127) }
            }
            ForkResult::Parent { child } => match waitpid(child, None)? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    ptrace::setoptions(child, ptrace::Options::PTRACE_O_EXITKILL)?;
                    debug!("spawned {} as pid {}", program.display(), child);
                    Ok(Self { pid: child, spawned: true })
                }
                WaitStatus::Exited(_, code) => Err(anyhow::anyhow!(
                    "Failed to start {}: exited with status {}",
                    program.display(),
                    code
                )),
                status => Err(anyhow::anyhow!("Unexpected wait status after exec: {:?}", status)),
            },
        }
    }

    /// 既存のプロセスにアタッチする
    ///
    /// アタッチ後、プロセスが停止するまで待ちます。
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid)?;
        waitpid(pid, None)?;
        Ok(Self { pid, spawned: false })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// プロセスを実行継続する
    ///
    /// `signal` を指定すると、そのシグナルを配送しながら再開します。
    pub fn cont(&self, signal: Option<Signal>) -> Result<()> {
        ptrace::cont(self.pid, signal)?;
        Ok(())
    }

    /// 1命令だけ実行して停止を待つ
    pub fn step(&self) -> Result<StopReason> {
        ptrace::step(self.pid, None)?;
        self.wait()
    }

    /// 次の停止イベントまでブロックする
    pub fn wait(&self) -> Result<StopReason> {
        loop {
            if let Some(reason) = stop_reason(waitpid(self.pid, None)?) {
                return Ok(reason);
            }
        }
    }

    /// 停止イベントがあれば返す。実行中なら `None`
    pub fn try_wait(&self) -> Result<Option<StopReason>> {
        let status = waitpid(self.pid, Some(WaitPidFlag::WNOHANG))?;
        Ok(stop_reason(status))
    }

    /// 実行中のプロセスに停止を要求する
    ///
    /// 実際の停止は `wait` で `Signal(SIGSTOP)` として観測されます。
    pub fn interrupt(&self) -> Result<()> {
        signal::kill(self.pid, Signal::SIGSTOP)?;
        Ok(())
    }

    /// プロセスを強制終了する
    pub fn kill(&self) -> Result<()> {
        signal::kill(self.pid, Signal::SIGKILL)?;
        let _ = waitpid(self.pid, None);
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.spawned {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        } else {
            let _ = ptrace::detach(self.pid, None);
        }
    }
}
