//! デバッガ側プロセスの起動

use crate::Result;
use anyhow::{bail, Context};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use tracing::{debug, info};

/// デバッガ側の起動要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// デバッグ対象の実行ファイル
    pub program: PathBuf,
    /// デバッグ対象に渡す引数
    pub args: Vec<String>,
    /// 接続に使うエンドポイント名
    pub endpoint: String,
    /// 作業ディレクトリ（実行ファイルのディレクトリ）
    pub cwd: PathBuf,
}

impl LaunchRequest {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, endpoint: impl Into<String>) -> Self {
        let program = program.into();
        let cwd = match program.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self {
            program,
            args,
            endpoint: endpoint.into(),
            cwd,
        }
    }

    /// `bindbg serve` に渡す起動引数
    pub fn serve_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "serve".into(),
            "--pipe".into(),
            self.endpoint.clone().into(),
            self.program.clone().into(),
        ];
        args.extend(self.args.iter().map(OsString::from));
        args
    }
}

/// デバッガ側プロセスの管理
pub trait DebuggerLauncher: Send {
    /// デバッガ側を起動し、プロセスIDを返す
    fn launch(&mut self, request: &LaunchRequest) -> Result<u32>;

    /// 起動したプロセスにブレークを送る
    fn interrupt(&mut self) -> Result<()>;

    /// 起動したプロセスを終了させる。起動していなければ何もしない
    fn close(&mut self) -> Result<()>;
}

/// 子プロセスとして `bindbg serve` を起動するランチャ
pub struct ChildLauncher {
    debugger: PathBuf,
    child: Option<Child>,
}

impl ChildLauncher {
    /// `debugger` を起動するランチャを作成する
    pub fn new(debugger: impl Into<PathBuf>) -> Self {
        Self {
            debugger: debugger.into(),
            child: None,
        }
    }

    pub fn debugger(&self) -> &Path {
        &self.debugger
    }
}

impl DebuggerLauncher for ChildLauncher {
    fn launch(&mut self, request: &LaunchRequest) -> Result<u32> {
        if let Some(child) = &self.child {
            bail!("Debugger already launched (pid {})", child.id());
        }

        let child = Command::new(&self.debugger)
            .args(request.serve_args())
            .current_dir(&request.cwd)
            .spawn()
            .with_context(|| format!("Failed to launch {}", self.debugger.display()))?;
        let pid = child.id();
        info!("Launched debugger (pid {}) for {}", pid, request.program.display());
        self.child = Some(child);
        Ok(pid)
    }

    #[cfg(unix)]
    fn interrupt(&mut self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(child) = &self.child else {
            bail!("Debugger was not launched from here");
        };
        kill(Pid::from_raw(child.id() as i32), Signal::SIGINT)
            .with_context(|| format!("Failed to interrupt debugger (pid {})", child.id()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> Result<()> {
        bail!("Interrupting the debugger process is not supported on this platform")
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            debug!("closing debugger (pid {})", child.id());
            child.kill().context("Failed to close debugger")?;
        }
        child.wait()?;
        Ok(())
    }
}

impl Drop for ChildLauncher {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
