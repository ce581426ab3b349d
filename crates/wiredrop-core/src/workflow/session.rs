//! 传输会话
//!
//! 每个会话一个控制任务，独占协调器。用户命令、链路事件和看门狗触发
//! 都经由通道进入该任务，操作之间不会交错。

use crate::codec::{CodecFactory, FragmentCodecFactory};
use crate::connection::{ConnectionEvent, ConnectionSession, ConnectionVersion, PacketSink};
use crate::error::TransferError;
use crate::export::Exporter;
use crate::transfer::watchdog::{DEFAULT_WATCHDOG_DURATION, DEFAULT_WATCHDOG_LEEWAY, WatchdogTick};
use crate::transfer::{
    CoordinatorOptions, PublishedTransferStatus, TransferCoordinator, TransferItem,
    TransferNotice,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// 应用生命周期事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// 回到前台，打开链路
    BecameActive,
    /// 即将失去焦点，仅记录
    WillResignActive,
    /// 进入后台，关闭链路
    EnteredBackground,
}

/// 会话选项
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// 空闲看门狗超时（仅 Host）
    pub watchdog_duration: Duration,
    pub watchdog_leeway: Duration,
    /// 分片大小
    pub fragment_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            watchdog_duration: DEFAULT_WATCHDOG_DURATION,
            watchdog_leeway: DEFAULT_WATCHDOG_LEEWAY,
            fragment_size: crate::codec::DEFAULT_FRAGMENT_SIZE,
        }
    }
}

enum SessionCommand {
    SendItems {
        items: Vec<Box<dyn TransferItem>>,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    PrepareForNewTransfer,
    ExportDidComplete,
    Lifecycle(LifecycleEvent),
    Terminate {
        reply: oneshot::Sender<()>,
    },
}

/// 传输会话句柄
pub struct TransferSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<PublishedTransferStatus>,
    notices: broadcast::Receiver<TransferNotice>,
}

impl TransferSession {
    /// 使用默认分片编解码器启动会话
    pub fn start(
        connection: Arc<dyn ConnectionSession>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        exporter: Arc<dyn Exporter>,
        options: SessionOptions,
    ) -> Result<Self, TransferError> {
        let factory = Arc::new(FragmentCodecFactory {
            fragment_size: options.fragment_size,
        });
        Self::start_with_codec(connection, events, exporter, options, factory)
    }

    /// 使用自定义编解码器启动会话
    ///
    /// 启动控制任务并打开链路，需要在 tokio 运行时中调用。
    pub fn start_with_codec(
        connection: Arc<dyn ConnectionSession>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        exporter: Arc<dyn Exporter>,
        options: SessionOptions,
        factory: Arc<dyn CodecFactory>,
    ) -> Result<Self, TransferError> {
        let device_kind = connection.local_config().device_kind;
        let link: Arc<dyn PacketSink> = connection.clone();

        let mut coordinator = TransferCoordinator::new(
            CoordinatorOptions {
                device_kind,
                watchdog_duration: options.watchdog_duration,
                watchdog_leeway: options.watchdog_leeway,
            },
            link,
            factory,
            exporter,
        );
        let status = coordinator.subscribe();
        let notices = coordinator.subscribe_notices();
        let ticks = coordinator
            .take_watchdog_ticks()
            .ok_or_else(|| TransferError::Protocol("Watchdog already taken".to_string()))?;

        connection.open()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = SessionTask {
            coordinator,
            connection,
            commands: commands_rx,
            events,
            ticks,
        };
        tokio::spawn(task.run());

        info!("Transfer session started as {}", device_kind.name());
        Ok(Self {
            commands: commands_tx,
            status,
            notices,
        })
    }

    /// 发送条目：一个条目单独发送，多个条目使用批量传输
    pub async fn send_items(
        &self,
        items: Vec<Box<dyn TransferItem>>,
    ) -> Result<(), TransferError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SendItems { items, reply })?;
        rx.await.map_err(|_| TransferError::Terminated)?
    }

    pub fn prepare_for_new_transfer(&self) -> Result<(), TransferError> {
        self.send(SessionCommand::PrepareForNewTransfer)
    }

    /// 导出界面已关闭
    pub fn export_did_complete(&self) -> Result<(), TransferError> {
        self.send(SessionCommand::ExportDidComplete)
    }

    pub fn lifecycle(&self, event: LifecycleEvent) -> Result<(), TransferError> {
        self.send(SessionCommand::Lifecycle(event))
    }

    /// 结束会话：断开协调器、关闭链路、停止控制任务
    ///
    /// 重复调用无副作用。
    pub async fn terminate(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(SessionCommand::Terminate { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.commands.is_closed()
    }

    /// 订阅发布状态
    pub fn subscribe(&self) -> watch::Receiver<PublishedTransferStatus> {
        self.status.clone()
    }

    pub fn status(&self) -> PublishedTransferStatus {
        *self.status.borrow()
    }

    /// 订阅传输通知
    pub fn notices(&self) -> broadcast::Receiver<TransferNotice> {
        self.notices.resubscribe()
    }

    fn send(&self, command: SessionCommand) -> Result<(), TransferError> {
        self.commands
            .send(command)
            .map_err(|_| TransferError::Terminated)
    }
}

/// 控制任务
struct SessionTask {
    coordinator: TransferCoordinator,
    connection: Arc<dyn ConnectionSession>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ticks: mpsc::UnboundedReceiver<WatchdogTick>,
}

impl SessionTask {
    async fn run(mut self) {
        let mut events_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("Session handle dropped, shutting down");
                        self.shutdown();
                        break;
                    };
                    if let SessionCommand::Terminate { reply } = command {
                        self.commands.close();
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    self.handle_command(command).await;
                }
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.handle_connection_event(event).await,
                    None => {
                        warn!("Connection event stream closed");
                        events_open = false;
                        self.coordinator.on_disconnect();
                    }
                },
                Some(tick) = self.ticks.recv() => self.coordinator.on_watchdog_tick(tick),
            }
        }

        info!("Transfer session terminated");
    }

    fn shutdown(&mut self) {
        self.coordinator.on_disconnect();
        self.connection.close();
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendItems { items, reply } => {
                let result = self.send_items(items).await;
                let _ = reply.send(result);
            }
            SessionCommand::PrepareForNewTransfer => self.coordinator.prepare_for_new_transfer(),
            SessionCommand::ExportDidComplete => self.coordinator.export_did_complete(),
            SessionCommand::Lifecycle(event) => self.handle_lifecycle(event),
            SessionCommand::Terminate { .. } => {}
        }
    }

    async fn send_items(&mut self, items: Vec<Box<dyn TransferItem>>) -> Result<(), TransferError> {
        if items.is_empty() {
            return Err(TransferError::InvalidTotal(0));
        }
        let busy = self.coordinator.file_track().state.is_active();
        if busy && !self.coordinator.device_kind().may_always_send() {
            warn!("Transfer already in progress, not sending");
            return Err(TransferError::NotAllowed);
        }

        self.coordinator.prepare_for_new_transfer();
        if items.len() == 1 {
            self.coordinator.send_files(items, false).await
        } else {
            self.coordinator.start_bulk_transfer(items).await
        }
    }

    fn handle_lifecycle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::BecameActive => {
                if self.connection.is_open() {
                    return;
                }
                if let Err(e) = self.connection.open() {
                    error!("Failed to open connection: {}", e);
                }
            }
            LifecycleEvent::WillResignActive => debug!("Will resign active"),
            LifecycleEvent::EnteredBackground => {
                info!("Entered background, closing connection");
                self.connection.close();
            }
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(remote) => {
                info!(
                    "Connected to {} ({})",
                    remote.name,
                    remote.device_kind.name()
                );
                let version = ConnectionVersion::between(self.connection.local_config(), &remote);
                self.coordinator.on_connect(version);
            }
            ConnectionEvent::Disconnected(reason) => {
                match reason {
                    Some(reason) => info!("Disconnected: {}", reason),
                    None => info!("Disconnected"),
                }
                self.coordinator.on_disconnect();
            }
            ConnectionEvent::Packet(packet) => self.coordinator.on_packet(&packet).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{DeviceKind, MemoryConnection, PeerConfig};
    use crate::export::ReceivedFile;
    use crate::transfer::{MemoryItem, TransferState};
    use async_trait::async_trait;

    struct NullExporter;

    #[async_trait]
    impl Exporter for NullExporter {
        async fn export_single(&self, _file: ReceivedFile) -> Result<(), TransferError> {
            Ok(())
        }

        async fn export_batch(&self, _files: Vec<ReceivedFile>) -> Result<(), TransferError> {
            Ok(())
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<PublishedTransferStatus>,
        mut done: impl FnMut(&PublishedTransferStatus) -> bool,
    ) -> PublishedTransferStatus {
        let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| done(s)))
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed");
        *status
    }

    #[tokio::test]
    async fn test_send_items_validation() {
        let ((conn, events), _other) = MemoryConnection::pair(
            PeerConfig::new("host", DeviceKind::Host),
            PeerConfig::new("app", DeviceKind::App),
        );
        let session =
            TransferSession::start(conn, events, Arc::new(NullExporter), SessionOptions::default())
                .unwrap();

        let err = session.send_items(Vec::new()).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidTotal(0)));

        session.terminate().await;
        session.terminate().await;
        assert!(session.is_terminated());

        let err = session
            .send_items(vec![Box::new(MemoryItem::named("a", "a"))])
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Terminated));
        assert!(matches!(
            session.prepare_for_new_transfer(),
            Err(TransferError::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_controls_connection() {
        let ((host, host_events), (app, mut app_events)) = MemoryConnection::pair(
            PeerConfig::new("host", DeviceKind::Host),
            PeerConfig::new("app", DeviceKind::App),
        );
        app.open().unwrap();

        let session = TransferSession::start(
            host.clone(),
            host_events,
            Arc::new(NullExporter),
            SessionOptions::default(),
        )
        .unwrap();
        let mut status = session.subscribe();
        wait_for(&mut status, |s| s.connected).await;
        assert!(matches!(
            app_events.recv().await,
            Some(ConnectionEvent::Connected(_))
        ));

        session.lifecycle(LifecycleEvent::WillResignActive).unwrap();
        session.lifecycle(LifecycleEvent::EnteredBackground).unwrap();
        let s = wait_for(&mut status, |s| !s.connected).await;
        assert_eq!(s.state, TransferState::None);
        assert!(!host.is_open());

        session.lifecycle(LifecycleEvent::BecameActive).unwrap();
        wait_for(&mut status, |s| s.connected).await;
        assert!(host.is_open());

        session.terminate().await;
        assert!(!host.is_open());
    }
}
