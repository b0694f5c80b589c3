//! 解析コンテキストごとのセッション管理
//!
//! 解析コンテキスト（解析中のバイナリ1つ）につきセッションは最大1つです。
//! ユーザー操作はコンテキスト名で受け付け、セッションが無ければ
//! [`AnalyzerError::NotDebugged`] を返します。

use crate::error::AnalyzerError;
use crate::host::AnalysisHost;
use crate::launcher::{DebuggerLauncher, LaunchRequest};
use crate::session::AnalyzerSession;
use crate::{lock, Result};
use bindbg_core::{Connector, SyncConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// エンドポイント名から接続器を作る
pub type ConnectorFactory = Box<dyn Fn(&str) -> Box<dyn Connector> + Send + Sync>;

/// デバッガのランチャを作る
pub type LauncherFactory = Box<dyn Fn() -> Box<dyn DebuggerLauncher> + Send + Sync>;

type Sessions = Arc<Mutex<HashMap<String, Arc<AnalyzerSession>>>>;

/// 解析コンテキストの設定
struct AnalysisContext {
    host: Arc<dyn AnalysisHost>,
    program: PathBuf,
    pipe: String,
    args: Vec<String>,
}

/// セッションのレジストリ
pub struct SessionRegistry {
    contexts: Mutex<HashMap<String, AnalysisContext>>,
    sessions: Sessions,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: SyncConfig,
    connectors: ConnectorFactory,
    launchers: LauncherFactory,
}

impl SessionRegistry {
    pub fn new(config: SyncConfig, connectors: ConnectorFactory, launchers: LauncherFactory) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            threads: Mutex::new(Vec::new()),
            config,
            connectors,
            launchers,
        }
    }

    /// 解析コンテキストを登録する
    pub fn open(&self, context: impl Into<String>, host: Arc<dyn AnalysisHost>, program: impl Into<PathBuf>, pipe: impl Into<String>) {
        lock(&self.contexts).insert(
            context.into(),
            AnalysisContext {
                host,
                program: program.into(),
                pipe: pipe.into(),
                args: Vec::new(),
            },
        );
    }

    /// 解析コンテキストを閉じる。セッションがあれば終了する
    pub fn close(&self, context: &str) {
        if let Ok(session) = self.session(context) {
            session.stop("Analysis context closed");
        }
        lock(&self.contexts).remove(context);
    }

    /// 次に起動するデバッグ対象の引数を設定する
    pub fn set_args(&self, context: &str, args: Vec<String>) -> Result<()> {
        let mut contexts = lock(&self.contexts);
        let entry = contexts
            .get_mut(context)
            .ok_or_else(|| AnalyzerError::UnknownContext(context.to_string()))?;
        entry.args = args;
        Ok(())
    }

    pub fn args(&self, context: &str) -> Option<Vec<String>> {
        lock(&self.contexts).get(context).map(|entry| entry.args.clone())
    }

    /// セッションを取得する
    pub fn session(&self, context: &str) -> Result<Arc<AnalyzerSession>> {
        lock(&self.sessions)
            .get(context)
            .cloned()
            .ok_or_else(|| AnalyzerError::NotDebugged(context.to_string()).into())
    }

    /// セッションを開始する
    pub fn start(&self, context: &str) -> Result<Arc<AnalyzerSession>> {
        let (host, request) = {
            let contexts = lock(&self.contexts);
            let entry = contexts
                .get(context)
                .ok_or_else(|| AnalyzerError::UnknownContext(context.to_string()))?;
            let request = LaunchRequest::new(entry.program.clone(), entry.args.clone(), entry.pipe.clone());
            (Arc::clone(&entry.host), request)
        };

        let connector = (self.connectors)(&request.endpoint);
        let session = AnalyzerSession::new(context, host, request, (self.launchers)(), self.config);

        {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(context) {
                return Err(AnalyzerError::AlreadyDebugged(context.to_string()).into());
            }
            sessions.insert(context.to_string(), Arc::clone(&session));
        }

        let sessions = Arc::downgrade(&self.sessions);
        let this = Arc::downgrade(&session);
        let name = context.to_string();
        session.set_stop_hook(Box::new(move || {
            let Some(sessions) = sessions.upgrade() else {
                return;
            };
            let mut sessions = lock(&sessions);
            // 同じ名前で作り直されたセッションは消さない
            if sessions.get(&name).map_or(false, |s| std::ptr::eq(Arc::as_ptr(s), this.as_ptr())) {
                sessions.remove(&name);
            }
        }));

        match session.spawn(connector) {
            Ok(handle) => lock(&self.threads).push(handle),
            Err(e) => {
                session.stop("Failed to start session thread");
                return Err(e);
            }
        }
        info!("Started session for {}", context);
        Ok(session)
    }

    /// セッションを終了する
    pub fn stop(&self, context: &str) -> Result<()> {
        self.session(context)?.stop("Session closed by user");
        Ok(())
    }

    pub fn set_bp(&self, context: &str, addr: u64) -> Result<()> {
        self.session(context)?.set_bp(addr)
    }

    pub fn delete_bp(&self, context: &str, addr: u64) -> Result<()> {
        self.session(context)?.delete_bp(addr)
    }

    pub fn set_ip(&self, context: &str, addr: u64) -> Result<()> {
        self.session(context)?.set_ip(addr)
    }

    pub fn run_to(&self, context: &str, addr: u64) -> Result<()> {
        self.session(context)?.run_to(addr)
    }

    /// 実行を継続する。セッションが無ければ開始する
    pub fn go(&self, context: &str) -> Result<()> {
        match self.session(context) {
            Ok(session) => session.go(),
            Err(_) => self.start(context).map(|_| ()),
        }
    }

    pub fn interrupt(&self, context: &str) -> Result<()> {
        self.session(context)?.interrupt()
    }

    pub fn step_in(&self, context: &str) -> Result<()> {
        self.session(context)?.step_in()
    }

    pub fn step_over(&self, context: &str) -> Result<()> {
        self.session(context)?.step_over()
    }

    pub fn step_out(&self, context: &str) -> Result<()> {
        self.session(context)?.step_out()
    }

    pub fn sync(&self, context: &str) -> Result<()> {
        self.session(context)?.sync()
    }

    /// すべてのセッションを終了し、受信ループの終了を待つ
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<AnalyzerSession>> = lock(&self.sessions).values().cloned().collect();
        for session in sessions {
            session.stop("Shutting down");
        }
        let threads: Vec<JoinHandle<()>> = lock(&self.threads).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!("session thread panicked");
            }
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
