//! Unixドメインソケットによる名前付きエンドポイント

use super::{frame, Acceptor, Connector, Transport};
use crate::{Message, TransportError};
use std::io::{BufReader, ErrorKind};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// ユーザーが指定した名前で識別されるエンドポイント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    path: PathBuf,
}

impl Endpoint {
    /// 名前からエンドポイントを作成する
    ///
    /// ソケットファイルは一時ディレクトリの `bindbg-<name>.sock` に置かれます。
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let path = std::env::temp_dir().join(format!("bindbg-{}.sock", name));
        Self { name, path }
    }

    /// ソケットファイルの場所を明示して作成する
    pub fn with_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// エンドポイント名を取得する
    pub fn name(&self) -> &str {
        &self.name
    }

    /// ソケットファイルのパスを取得する
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// エンドポイントで待ち受ける
    ///
    /// 前回のプロセスが残したソケットファイルは削除してから作り直します。
    pub fn listen(&self) -> Result<Listener, TransportError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed stale socket {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let inner = UnixListener::bind(&self.path)?;
        Ok(Listener {
            inner,
            path: self.path.clone(),
        })
    }
}

impl Connector for Endpoint {
    fn connect(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        let stream = UnixStream::connect(&self.path)?;
        Ok(Box::new(SocketTransport::new(stream)?))
    }
}

/// 待ち受け中のエンドポイント
///
/// ドロップ時にソケットファイルを削除します。
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
}

impl Acceptor for Listener {
    fn accept(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, _addr) = self.inner.accept()?;
        Ok(Box::new(SocketTransport::new(stream)?))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// ソケット上のトランスポート
///
/// 受信は専用スレッドがフレームを読み、チャネル経由で `poll` に渡します。
pub struct SocketTransport {
    writer: Mutex<UnixStream>,
    inbox: Mutex<Receiver<Result<Message, TransportError>>>,
    /// 受信スレッドを止めるためのハンドル
    control: UnixStream,
    closed: AtomicBool,
}

impl SocketTransport {
    /// 接続済みのストリームからトランスポートを作成する
    pub fn new(stream: UnixStream) -> Result<Self, TransportError> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("bindbg-reader".to_string())
            .spawn(move || read_loop(reader, tx))?;

        Ok(Self {
            writer: Mutex::new(stream),
            inbox: Mutex::new(rx),
            control,
            closed: AtomicBool::new(false),
        })
    }
}

/// フレームを読み続け、受信箱に積む
///
/// 壊れたメッセージは読み飛ばします（フレーム境界は保たれているため）。
fn read_loop(stream: UnixStream, tx: Sender<Result<Message, TransportError>>) {
    let mut reader = BufReader::new(stream);
    loop {
        let payload = match frame::read_frame(&mut reader) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        match frame::decode(&payload) {
            Ok(message) => {
                if tx.send(Ok(message)).is_err() {
                    return;
                }
            }
            Err(e) => warn!("dropping undecodable message: {}", e),
        }
    }
}

impl Transport for SocketTransport {
    fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        frame::write_frame(&mut *writer, message)
    }

    fn poll(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        match inbox.recv_timeout(timeout) {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}
