//! 传输协调器
//!
//! 负责:
//! - 顺序发送：第 n 个文件确认送达后才交给编解码器第 n+1 个
//! - 批量握手：先等待对端接受，文件发完后发送结束握手
//! - 接收事件转发到状态存储，批量接收时缓存文件，成功后一次性导出
//! - 传输结束后启动空闲看门狗（仅 `Host`）
//!
//! 发送队列只有一个等待槽位，编解码器事件在 `process` 中循环处理，不会递归。

use crate::codec::{CodecEvent, CodecFactory, Direction, FileDescriptor, ProtocolCodec};
use crate::connection::{ConnectionVersion, DeviceKind, PacketSink};
use crate::error::TransferError;
use crate::export::{Exporter, ReceivedFile};
use crate::transfer::item::TransferItem;
use crate::transfer::progress::checked_calculate;
use crate::transfer::state::{
    PublishedTransferStatus, TransferState, TransferStateStore, TransferTrack,
};
use crate::transfer::watchdog::{
    DEFAULT_WATCHDOG_DURATION, DEFAULT_WATCHDOG_LEEWAY, IdleWatchdog, WatchdogTick,
};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// 协调器选项
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// 本端设备类型
    pub device_kind: DeviceKind,
    /// 空闲看门狗超时
    pub watchdog_duration: Duration,
    /// 空闲看门狗容差
    pub watchdog_leeway: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            device_kind: DeviceKind::Host,
            watchdog_duration: DEFAULT_WATCHDOG_DURATION,
            watchdog_leeway: DEFAULT_WATCHDOG_LEEWAY,
        }
    }
}

/// 传输通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferNotice {
    /// 一次传输已被接受，`total` 为文件数
    Started { total: u32 },
}

/// 批量接收缓存
struct BulkContext {
    total_files: u32,
    bulk_id: i32,
    received_files: Vec<ReceivedFile>,
}

/// 发送队列当前等待的回复
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    BulkAcceptance,
    FileDelivery,
    BulkEnd,
}

/// 待发送批次
struct OutboundBatch {
    items: VecDeque<Box<dyn TransferItem>>,
    total: u32,
    next_index: u32,
    bulk: bool,
    pending: Option<Pending>,
}

impl OutboundBatch {
    fn new(items: Vec<Box<dyn TransferItem>>, total: u32, bulk: bool) -> Self {
        Self {
            items: items.into(),
            total,
            next_index: 0,
            bulk,
            pending: None,
        }
    }
}

/// 传输协调器
pub struct TransferCoordinator {
    options: CoordinatorOptions,
    link: Arc<dyn PacketSink>,
    factory: Arc<dyn CodecFactory>,
    codec: Box<dyn ProtocolCodec>,
    exporter: Arc<dyn Exporter>,
    store: TransferStateStore,
    watchdog: IdleWatchdog,
    watchdog_ticks: Option<mpsc::UnboundedReceiver<WatchdogTick>>,
    notices: broadcast::Sender<TransferNotice>,
    bulk_context: Option<BulkContext>,
    outbound: Option<OutboundBatch>,
}

impl TransferCoordinator {
    pub fn new(
        options: CoordinatorOptions,
        link: Arc<dyn PacketSink>,
        factory: Arc<dyn CodecFactory>,
        exporter: Arc<dyn Exporter>,
    ) -> Self {
        let codec = factory.create(link.clone(), options.device_kind);
        let (watchdog, watchdog_ticks) =
            IdleWatchdog::new(options.watchdog_duration, options.watchdog_leeway);
        let (notices, _) = broadcast::channel(16);

        Self {
            options,
            link,
            factory,
            codec,
            exporter,
            store: TransferStateStore::new(),
            watchdog,
            watchdog_ticks: Some(watchdog_ticks),
            notices,
            bulk_context: None,
            outbound: None,
        }
    }

    pub fn device_kind(&self) -> DeviceKind {
        self.options.device_kind
    }

    /// 取出看门狗触发接收端（只能取一次）
    pub fn take_watchdog_ticks(&mut self) -> Option<mpsc::UnboundedReceiver<WatchdogTick>> {
        self.watchdog_ticks.take()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishedTransferStatus> {
        self.store.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<TransferNotice> {
        self.notices.subscribe()
    }

    pub fn status(&self) -> PublishedTransferStatus {
        self.store.status()
    }

    pub fn file_track(&self) -> TransferTrack {
        self.store.file_track()
    }

    pub fn bulk_track(&self) -> TransferTrack {
        self.store.bulk_track()
    }

    pub fn is_watchdog_armed(&self) -> bool {
        self.watchdog.is_armed()
    }

    /// 是否允许发起新传输
    pub fn is_transfer_allowed(&self) -> bool {
        self.store.file_track().state == TransferState::None
            || self.options.device_kind.may_always_send()
    }

    /// 是否有进行中的传输
    pub fn has_active_transfer(&self) -> bool {
        self.store.file_track().state.is_active()
            || self.store.bulk_track().state.is_active()
            || self.outbound.is_some()
    }

    // ------------------------------------------------------------------
    // 发送
    // ------------------------------------------------------------------

    /// 顺序发送文件
    ///
    /// `force` 为 true 时跳过"是否允许发送"检查。
    pub async fn send_files(
        &mut self,
        items: Vec<Box<dyn TransferItem>>,
        force: bool,
    ) -> Result<(), TransferError> {
        let total = Self::check_total(items.len())?;
        if !force && !self.is_transfer_allowed() {
            warn!(
                "Transfer not allowed: file transfer is {}",
                self.store.file_track().state
            );
            return Err(TransferError::NotAllowed);
        }

        self.watchdog.stop();
        self.replace_outbound(OutboundBatch::new(items, total, false));
        self.process(Vec::new()).await;
        Ok(())
    }

    /// 发起批量传输，对端接受后才开始发送文件
    pub async fn start_bulk_transfer(
        &mut self,
        items: Vec<Box<dyn TransferItem>>,
    ) -> Result<(), TransferError> {
        let total = Self::check_total(items.len())?;
        if !self.is_transfer_allowed() {
            warn!(
                "Bulk transfer not allowed: file transfer is {}",
                self.store.file_track().state
            );
            return Err(TransferError::NotAllowed);
        }

        self.watchdog.stop();
        let mut batch = OutboundBatch::new(items, total, true);
        batch.pending = Some(Pending::BulkAcceptance);
        self.replace_outbound(batch);

        info!("Requesting bulk transfer of {} files", total);
        self.store.set_bulk_state(TransferState::Waiting);
        let events = self.codec.start_bulk_transfer(total);
        self.process(events).await;
        Ok(())
    }

    fn check_total(len: usize) -> Result<u32, TransferError> {
        match u32::try_from(len) {
            Ok(total) if total > 0 => Ok(total),
            _ => Err(TransferError::InvalidTotal(len)),
        }
    }

    fn replace_outbound(&mut self, batch: OutboundBatch) {
        if let Some(previous) = self.outbound.replace(batch) {
            debug!(
                "Discarding unfinished outbound batch ({} items left)",
                previous.items.len()
            );
        }
    }

    // ------------------------------------------------------------------
    // 连接事件
    // ------------------------------------------------------------------

    /// 收到数据包
    pub async fn on_packet(&mut self, packet: &[u8]) {
        let events = self.codec.feed(packet);
        self.process(events).await;
    }

    /// 处理单个编解码器事件
    pub async fn handle_event(&mut self, event: CodecEvent) {
        self.process(vec![event]).await;
    }

    pub fn on_connect(&mut self, version: ConnectionVersion) {
        info!("Connected (remote protocol v{})", version.remote_version);
        self.store.reset();
        self.store.set_connected(true);
        self.codec.set_connection_version(version);
    }

    /// 断开连接，可重复调用
    pub fn on_disconnect(&mut self) {
        if let Some(context) = self.bulk_context.take() {
            info!(
                "Discarding {} of {} buffered files from bulk {}",
                context.received_files.len(),
                context.total_files,
                context.bulk_id
            );
        }
        self.outbound = None;
        self.watchdog.stop();
        self.store.reset();
        self.store.set_connected(false);
        self.codec = self
            .factory
            .create(self.link.clone(), self.options.device_kind);
    }

    /// 为新传输做准备：重置轨道并丢弃未完成的批次
    pub fn prepare_for_new_transfer(&mut self) {
        self.store.reset();
        if self.bulk_context.take().is_some() {
            debug!("Discarding bulk receive buffer");
        }
        self.outbound = None;
    }

    /// 导出界面已关闭
    pub fn export_did_complete(&mut self) {
        self.store.reset();
    }

    /// 看门狗触发：只复位两条轨道，不触碰发送队列和链路
    pub fn on_watchdog_tick(&mut self, tick: WatchdogTick) {
        if self.watchdog.accept(tick) {
            info!("Idle watchdog fired, resetting transfer state");
            self.store.reset();
        }
    }

    // ------------------------------------------------------------------
    // 事件处理
    // ------------------------------------------------------------------

    async fn process(&mut self, events: Vec<CodecEvent>) {
        let mut queue: VecDeque<CodecEvent> = events.into();
        loop {
            while let Some(event) = queue.pop_front() {
                let follow_up = self.apply_event(event).await;
                queue.extend(follow_up);
            }
            match self.step_outbound().await {
                Some(events) => queue.extend(events),
                None => break,
            }
        }
    }

    /// 推进发送队列一步，无事可做时返回 `None`
    async fn step_outbound(&mut self) -> Option<Vec<CodecEvent>> {
        let batch = self.outbound.as_mut()?;
        if batch.pending.is_some() {
            return None;
        }

        let Some(item) = batch.items.pop_front() else {
            if batch.bulk {
                batch.pending = Some(Pending::BulkEnd);
                debug!("All files sent, ending bulk transfer");
                return Some(self.codec.end_bulk_transfer(false));
            }
            debug!("Outbound batch finished");
            self.outbound = None;
            return Some(Vec::new());
        };

        let index = batch.next_index;
        batch.next_index += 1;
        let total = batch.total;

        let loaded = match item.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Aborting transfer: {}", e);
                self.store.set_file_state(TransferState::Failed);
                return Some(self.abort_outbound());
            }
        };

        if let Some(batch) = self.outbound.as_mut() {
            batch.pending = Some(Pending::FileDelivery);
        }
        debug!(
            "Sending {} ({}/{}, {} bytes)",
            item.display_name(),
            index + 1,
            total,
            loaded.data.len()
        );
        self.store.set_file_state(TransferState::Waiting);
        Some(self.codec.send_file(FileDescriptor {
            data: loaded.data,
            filename: loaded.filename,
            index,
            total_in_batch: total,
        }))
    }

    /// 中止发送队列，批量传输进行中时发送中止握手
    fn abort_outbound(&mut self) -> Vec<CodecEvent> {
        match self.outbound.as_mut() {
            Some(batch) if batch.bulk && batch.pending != Some(Pending::BulkAcceptance) => {
                batch.items.clear();
                batch.pending = Some(Pending::BulkEnd);
                self.codec.end_bulk_transfer(true)
            }
            _ => {
                self.outbound = None;
                Vec::new()
            }
        }
    }

    fn outbound_pending(&self) -> Option<Pending> {
        self.outbound.as_ref().and_then(|b| b.pending)
    }

    fn clear_pending(&mut self) {
        if let Some(batch) = self.outbound.as_mut() {
            batch.pending = None;
        }
    }

    fn start_watchdog(&mut self) {
        if self.options.device_kind.uses_idle_watchdog() {
            self.watchdog.start();
        }
    }

    fn notify(&self, notice: TransferNotice) {
        // 没有订阅者时发送失败，忽略
        let _ = self.notices.send(notice);
    }

    async fn apply_event(&mut self, event: CodecEvent) -> Vec<CodecEvent> {
        match event {
            CodecEvent::FragmentProgress {
                fragment,
                fragments,
                file_no,
                total_files,
                ..
            } => {
                let Some(progress) = checked_calculate(fragment, fragments, file_no, total_files)
                else {
                    warn!(
                        "Dropping progress event with zero total ({}/{}, file {}/{})",
                        fragment, fragments, file_no, total_files
                    );
                    return Vec::new();
                };
                self.store.set_file_progress(progress.file);
                self.store.set_bulk_progress(progress.bulk);
            }

            CodecEvent::FileAccepted {
                direction,
                file_id,
                file_no,
                total,
            } => {
                debug!(
                    "{:?} file {} accepted ({}/{})",
                    direction,
                    file_id,
                    file_no + 1,
                    total
                );
                self.store.set_file_state(TransferState::Sending);
                self.watchdog.stop();
                if file_no == 0 && total == 1 {
                    self.store.reset_progress();
                    self.notify(TransferNotice::Started { total });
                }
            }

            CodecEvent::FileCompleted { direction, file_id } => {
                debug!("{:?} file {} completed", direction, file_id);
                self.store.set_file_state(TransferState::Complete);
                if !self.store.is_bulk_transfer() {
                    self.start_watchdog();
                }
                if direction == Direction::Outbound
                    && self.outbound_pending() == Some(Pending::FileDelivery)
                {
                    self.clear_pending();
                }
            }

            CodecEvent::FileFailed {
                direction,
                file_id,
                reason,
            } => {
                warn!("{:?} file {} failed: {}", direction, file_id, reason);
                self.store.set_file_state(TransferState::Failed);
                if direction == Direction::Outbound
                    && self.outbound_pending() == Some(Pending::FileDelivery)
                {
                    return self.abort_outbound();
                }
            }

            CodecEvent::FileReceived { payload, filename } => {
                let file = ReceivedFile {
                    data: payload,
                    filename,
                };
                match self.bulk_context.as_mut() {
                    Some(context) => {
                        debug!(
                            "Buffered file {} of bulk {}",
                            context.received_files.len() + 1,
                            context.bulk_id
                        );
                        context.received_files.push(file);
                    }
                    None => {
                        if let Err(e) = self.exporter.export_single(file).await {
                            error!("Export failed: {}", e);
                        }
                    }
                }
            }

            CodecEvent::BulkAccepted {
                direction,
                accepted,
                bulk_id,
                total,
            } => {
                info!(
                    "{:?} bulk {} {} ({} files)",
                    direction,
                    bulk_id,
                    if accepted { "accepted" } else { "rejected" },
                    total
                );
                self.store.set_bulk_state(if accepted {
                    TransferState::Sending
                } else {
                    TransferState::Failed
                });
                self.store.reset_progress();
                self.watchdog.stop();

                match direction {
                    Direction::Inbound if accepted => {
                        self.bulk_context = Some(BulkContext {
                            total_files: total,
                            bulk_id,
                            received_files: Vec::with_capacity(total as usize),
                        });
                    }
                    Direction::Inbound => {}
                    Direction::Outbound => {
                        if self.outbound_pending() == Some(Pending::BulkAcceptance) {
                            if accepted {
                                self.clear_pending();
                            } else {
                                self.outbound = None;
                            }
                        }
                    }
                }

                if accepted {
                    self.notify(TransferNotice::Started { total });
                }
            }

            CodecEvent::BulkEnded {
                direction,
                success,
                bulk_id,
            } => {
                info!(
                    "{:?} bulk {} ended ({})",
                    direction,
                    bulk_id,
                    if success { "success" } else { "failure" }
                );
                // 先导出再发布完成状态
                match direction {
                    Direction::Inbound => self.finish_inbound_bulk(success, bulk_id).await,
                    Direction::Outbound => {
                        if self.outbound_pending() == Some(Pending::BulkEnd) {
                            self.outbound = None;
                        }
                    }
                }

                self.store.set_bulk_state(if success {
                    TransferState::Complete
                } else {
                    TransferState::Failed
                });
                self.start_watchdog();
            }
        }

        Vec::new()
    }

    async fn finish_inbound_bulk(&mut self, success: bool, bulk_id: i32) {
        let Some(context) = self.bulk_context.take() else {
            debug!("No receive buffer for bulk {}", bulk_id);
            return;
        };
        if context.bulk_id != bulk_id {
            warn!(
                "Bulk {} ended but buffer belongs to bulk {}, discarding",
                bulk_id, context.bulk_id
            );
            return;
        }
        if !success {
            info!(
                "Discarding {} buffered files from failed bulk {}",
                context.received_files.len(),
                bulk_id
            );
            return;
        }

        if let Err(e) = self.exporter.export_batch(context.received_files).await {
            error!("Batch export failed: {}", e);
        }
    }
}
