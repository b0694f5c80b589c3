//! テスト用のホスト、ランチャ、接続器

#![allow(dead_code)]

use bindbg_analyzer::{AnalysisHost, DebuggerLauncher, Highlight, HostInstruction, LaunchRequest};
use bindbg_core::transport::memory::MemoryTransport;
use bindbg_core::{Connector, ModuleRange, SyncConfig, Transport, TransportError};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const BASE: u64 = 0x40_0000;
pub const SIZE: u64 = 0x1_0000;

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(10),
        settle_delay: Duration::from_millis(1),
        connect_retry: Duration::from_millis(10),
    }
}

/// 条件が成り立つまで待つ
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// 相手から届くメッセージを1つ待つ
pub fn expect_message(peer: &MemoryTransport) -> bindbg_core::Message {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(message) = peer.poll(Duration::from_millis(20)).unwrap() {
            return message;
        }
    }
    panic!("no message arrived");
}

/// 表示内容を記録するホスト
#[derive(Default)]
pub struct MockHost {
    pub highlights: Mutex<HashMap<u64, Highlight>>,
    pub comments: Mutex<HashMap<u64, String>>,
    pub navigated: Mutex<Vec<u64>>,
    pub symbols: HashMap<u64, String>,
    pub instructions: HashMap<u64, HostInstruction>,
}

impl MockHost {
    pub fn highlight_of(&self, addr: u64) -> Highlight {
        self.highlights.lock().unwrap().get(&addr).copied().unwrap_or_default()
    }

    pub fn comment_of(&self, addr: u64) -> Option<String> {
        self.comments.lock().unwrap().get(&addr).cloned()
    }

    /// `None` 以外のハイライトが付いたアドレスの数
    pub fn painted(&self) -> usize {
        self.highlights
            .lock()
            .unwrap()
            .values()
            .filter(|h| **h != Highlight::None)
            .count()
    }
}

impl AnalysisHost for MockHost {
    fn module(&self) -> ModuleRange {
        ModuleRange::new(BASE, SIZE)
    }

    fn is_valid(&self, addr: u64) -> bool {
        // 末尾の1ページは解析対象外
        addr >= BASE && addr < BASE + SIZE - 0x1000
    }

    fn containing_function(&self, addr: u64) -> Option<u64> {
        self.is_valid(addr).then_some(addr & !0xff)
    }

    fn highlight(&self, addr: u64, highlight: Highlight) {
        self.highlights.lock().unwrap().insert(addr, highlight);
    }

    fn set_comment(&self, addr: u64, comment: &str) {
        self.comments.lock().unwrap().insert(addr, comment.to_string());
    }

    fn navigate(&self, addr: u64) {
        self.navigated.lock().unwrap().push(addr);
    }

    fn symbol_at(&self, addr: u64) -> Option<String> {
        self.symbols.get(&addr).cloned()
    }

    fn instruction(&self, addr: u64) -> Option<HostInstruction> {
        self.instructions.get(&addr).cloned()
    }
}

/// 待ち受け中のエンドポイントを模した置き場
pub type Slot = Arc<Mutex<Option<MemoryTransport>>>;

/// 置き場にトランスポートがあれば接続できる接続器
pub struct SlotConnector(pub Slot);

impl Connector for SlotConnector {
    fn connect(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        match self.0.lock().unwrap().take() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(TransportError::Io(io::Error::from(io::ErrorKind::NotFound))),
        }
    }
}

/// ランチャの呼び出し記録
#[derive(Default)]
pub struct LaunchLog {
    pub requests: Vec<LaunchRequest>,
    pub interrupts: usize,
    pub closes: usize,
}

/// 起動すると置き場にトランスポートを置くランチャ
pub struct MockLauncher {
    pub log: Arc<Mutex<LaunchLog>>,
    pub slot: Slot,
    /// 起動時に置くトランスポート
    pub ready: Option<MemoryTransport>,
}

impl DebuggerLauncher for MockLauncher {
    fn launch(&mut self, request: &LaunchRequest) -> anyhow::Result<u32> {
        self.log.lock().unwrap().requests.push(request.clone());
        if let Some(transport) = self.ready.take() {
            *self.slot.lock().unwrap() = Some(transport);
        }
        Ok(4242)
    }

    fn interrupt(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().interrupts += 1;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().closes += 1;
        Ok(())
    }
}
