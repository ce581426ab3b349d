//! TCP 链路
//!
//! 两种端点:
//! - `Listen`: 被动端，同一时间只服务一个对端
//! - `Dial`: 主动端，断开后每秒重连直到关闭
//!
//! 连接建立后双方先交换身份帧，然后发出 `Connected` 事件。
//! 写入经由独立的写任务完成，`send_packet` 不会阻塞调用方。

use crate::connection::frame::{Frame, read_frame, write_frame};
use crate::connection::{ConnectionEvent, ConnectionSession, PacketSink, PeerConfig};
use crate::error::TransferError;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// 链路端点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Listen(SocketAddr),
    Dial(SocketAddr),
}

/// 链路任务与句柄共享的状态
#[derive(Default)]
struct Shared {
    writer: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// TCP 连接会话
pub struct TcpConnection {
    endpoint: Endpoint,
    config: PeerConfig,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    shared: Arc<Shared>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl TcpConnection {
    /// 创建连接会话，返回会话和事件接收端
    ///
    /// 创建后需要调用 `open()` 才会开始监听或拨号。
    pub fn new(
        endpoint: Endpoint,
        config: PeerConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            endpoint,
            config,
            events_tx,
            shared: Arc::new(Shared::default()),
            cancel: Mutex::new(None),
        });
        (connection, events_rx)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// 监听端实际绑定的地址（监听开始后可用）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    /// 是否有已识别的对端
    pub fn is_connected(&self) -> bool {
        lock(&self.shared.writer).is_some()
    }
}

impl PacketSink for TcpConnection {
    fn send_packet(&self, packet: Vec<u8>) -> Result<(), TransferError> {
        let writer = lock(&self.shared.writer);
        match writer.as_ref() {
            Some(tx) => tx
                .send(packet)
                .map_err(|_| TransferError::Transport("Link closed".to_string())),
            None => Err(TransferError::Transport("Not connected".to_string())),
        }
    }
}

impl ConnectionSession for TcpConnection {
    fn local_config(&self) -> &PeerConfig {
        &self.config
    }

    fn open(&self) -> Result<(), TransferError> {
        let mut cancel = lock(&self.cancel);
        if cancel.is_some() {
            debug!("Socket already open, not starting");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransferError::Transport(format!("No async runtime: {}", e)))?;

        let token = CancellationToken::new();
        let task = LinkTask {
            endpoint: self.endpoint,
            config: self.config.clone(),
            events_tx: self.events_tx.clone(),
            shared: self.shared.clone(),
            cancel: token.clone(),
        };
        runtime.spawn(task.run());

        info!("Open socket ({:?})", self.endpoint);
        *cancel = Some(token);
        Ok(())
    }

    fn close(&self) {
        if let Some(token) = lock(&self.cancel).take() {
            info!("Close socket ({:?})", self.endpoint);
            token.cancel();
        }
    }

    fn is_open(&self) -> bool {
        lock(&self.cancel).is_some()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// 后台链路任务
struct LinkTask {
    endpoint: Endpoint,
    config: PeerConfig,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl LinkTask {
    async fn run(self) {
        match self.endpoint {
            Endpoint::Listen(addr) => {
                if let Err(e) = self.listen(addr).await {
                    error!("Listener on {} failed: {}", addr, e);
                }
            }
            Endpoint::Dial(addr) => self.dial(addr).await,
        }
        *lock(&self.shared.local_addr) = None;
    }

    async fn listen(&self, addr: SocketAddr) -> Result<(), TransferError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        *lock(&self.shared.local_addr) = Some(local);
        info!("Listening on {}", local);

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!("Accepted connection from {}", peer);
                    self.serve(stream).await;
                }
                Err(e) => warn!("Accept failed: {}", e),
            }

            if self.cancel.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn dial(&self, addr: SocketAddr) {
        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return,
                attempt = TcpStream::connect(addr) => attempt,
            };

            match attempt {
                Ok(stream) => {
                    info!("Connected to {}", addr);
                    self.serve(stream).await;
                }
                Err(e) => debug!("Connect to {} failed: {}", addr, e),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
            }
        }
    }

    /// 服务单个对端直到断开
    async fn serve(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Unable to set TCP_NODELAY: {}", e);
        }
        let (mut reader, mut writer) = stream.into_split();

        let handshake = tokio::select! {
            _ = self.cancel.cancelled() => return,
            handshake = self.handshake(&mut reader, &mut writer) => handshake,
        };
        let remote = match handshake {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Handshake failed: {}", e);
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *lock(&self.shared.writer) = Some(tx);

        let mut writer_task = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                write_frame(&mut writer, &Frame::RawData(packet)).await?;
            }
            Ok::<(), TransferError>(())
        });

        info!(
            "Peer identified: {} ({}, protocol v{})",
            remote.name,
            remote.device_kind.name(),
            remote.protocol_version
        );
        let _ = self.events_tx.send(ConnectionEvent::Connected(remote.clone()));

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break None,
                written = &mut writer_task => {
                    break Some(match written {
                        Ok(Ok(())) => "Writer closed".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => e.to_string(),
                    });
                }
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some(Frame::RawData(packet))) => {
                        let _ = self.events_tx.send(ConnectionEvent::Packet(packet));
                    }
                    Ok(Some(Frame::Identification(_))) => {
                        warn!("Ignoring repeated identification from {}", remote.name);
                    }
                    Ok(None) => break None,
                    Err(e) => break Some(e.to_string()),
                },
            }
        };

        lock(&self.shared.writer).take();
        writer_task.abort();

        info!("Connection to {} ended: {:?}", remote.name, reason);
        let _ = self.events_tx.send(ConnectionEvent::Disconnected(reason));
    }

    async fn handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<PeerConfig, TransferError> {
        write_frame(writer, &Frame::Identification(self.config.clone())).await?;

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(reader)).await {
            Err(_) => Err(TransferError::Protocol(
                "Timed out waiting for identification".to_string(),
            )),
            Ok(Ok(Some(Frame::Identification(remote)))) => Ok(remote),
            Ok(Ok(Some(Frame::RawData(_)))) => Err(TransferError::Protocol(
                "Expected identification frame".to_string(),
            )),
            Ok(Ok(None)) => Err(TransferError::Transport(
                "Closed during identification".to_string(),
            )),
            Ok(Err(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DeviceKind;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    async fn wait_for_listener(connection: &TcpConnection) -> SocketAddr {
        for _ in 0..200 {
            if let Some(addr) = connection.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("listener did not start");
    }

    #[tokio::test]
    async fn test_send_without_peer_fails() {
        let (connection, _events) = TcpConnection::new(
            Endpoint::Listen("127.0.0.1:0".parse().unwrap()),
            PeerConfig::new("host", DeviceKind::Host),
        );

        let result = connection.send_packet(vec![1]);
        assert!(matches!(result, Err(TransferError::Transport(_))));
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_listen_and_dial() {
        let (host, mut host_events) = TcpConnection::new(
            Endpoint::Listen("127.0.0.1:0".parse().unwrap()),
            PeerConfig::new("host", DeviceKind::Host),
        );
        host.open().unwrap();
        // 重复打开无副作用
        host.open().unwrap();
        let addr = wait_for_listener(&host).await;

        let (app, mut app_events) = TcpConnection::new(
            Endpoint::Dial(addr),
            PeerConfig::new("phone", DeviceKind::App),
        );
        app.open().unwrap();

        match next_event(&mut host_events).await {
            ConnectionEvent::Connected(remote) => assert_eq!(remote.name, "phone"),
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut app_events).await {
            ConnectionEvent::Connected(remote) => {
                assert_eq!(remote.name, "host");
                assert_eq!(remote.device_kind, DeviceKind::Host);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        app.send_packet(vec![7, 8, 9]).unwrap();
        assert_eq!(
            next_event(&mut host_events).await,
            ConnectionEvent::Packet(vec![7, 8, 9])
        );

        host.send_packet(vec![1]).unwrap();
        assert_eq!(
            next_event(&mut app_events).await,
            ConnectionEvent::Packet(vec![1])
        );

        app.close();
        assert!(matches!(
            next_event(&mut app_events).await,
            ConnectionEvent::Disconnected(_)
        ));
        assert!(matches!(
            next_event(&mut host_events).await,
            ConnectionEvent::Disconnected(_)
        ));
        assert!(!app.is_open());

        host.close();
    }
}
