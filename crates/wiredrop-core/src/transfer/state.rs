//! 传输状态存储
//!
//! 内部维护两条轨道（单文件、批量），对外只发布一个状态：
//! - 批量轨道非 `None` 时，发布状态跟随批量轨道，单文件轨道的修改不发布
//! - 否则由单文件轨道驱动发布
//!
//! 发布通过 `watch` 通道完成，值未变化时不通知订阅者。

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// 传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferState {
    #[default]
    None,
    Waiting,
    Sending,
    Complete,
    Failed,
}

impl TransferState {
    /// 是否为终态（本次传输结束）
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed)
    }

    /// 是否为进行中
    pub fn is_active(&self) -> bool {
        matches!(self, TransferState::Waiting | TransferState::Sending)
    }

    pub fn is_progress_bar_hidden(&self) -> bool {
        matches!(
            self,
            TransferState::None | TransferState::Complete | TransferState::Failed
        )
    }

    /// 发送端标题
    pub fn sender_title(&self) -> &'static str {
        match self {
            TransferState::None => "",
            TransferState::Waiting => "等待对方接收...",
            TransferState::Sending => "正在发送",
            TransferState::Complete => "发送完成",
            TransferState::Failed => "发送失败",
        }
    }

    /// 接收端标题
    pub fn receiver_title(&self) -> &'static str {
        match self {
            TransferState::None => "",
            TransferState::Waiting => "等待传输...",
            TransferState::Sending => "正在接收",
            TransferState::Complete => "接收完成",
            TransferState::Failed => "接收失败",
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferState::None => "none",
            TransferState::Waiting => "waiting",
            TransferState::Sending => "sending",
            TransferState::Complete => "complete",
            TransferState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 单条轨道
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransferTrack {
    pub state: TransferState,
    pub progress: f64,
}

/// 对外发布的传输状态
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PublishedTransferStatus {
    pub state: TransferState,
    pub progress: f64,
    pub progress_bar_hidden: bool,
    pub connected: bool,
}

impl PublishedTransferStatus {
    fn initial() -> Self {
        Self {
            progress_bar_hidden: true,
            ..Default::default()
        }
    }
}

/// 传输状态存储
pub struct TransferStateStore {
    file: TransferTrack,
    bulk: TransferTrack,
    tx: watch::Sender<PublishedTransferStatus>,
}

impl Default for TransferStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStateStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PublishedTransferStatus::initial());
        Self {
            file: TransferTrack::default(),
            bulk: TransferTrack::default(),
            tx,
        }
    }

    /// 订阅发布状态
    pub fn subscribe(&self) -> watch::Receiver<PublishedTransferStatus> {
        self.tx.subscribe()
    }

    /// 当前发布状态
    pub fn status(&self) -> PublishedTransferStatus {
        *self.tx.borrow()
    }

    pub fn file_track(&self) -> TransferTrack {
        self.file
    }

    pub fn bulk_track(&self) -> TransferTrack {
        self.bulk
    }

    /// 批量轨道是否在驱动发布
    pub fn is_bulk_transfer(&self) -> bool {
        self.bulk.state != TransferState::None
    }

    pub fn set_file_state(&mut self, state: TransferState) {
        self.file.state = state;
        if !self.is_bulk_transfer() {
            self.publish_state(state);
        }
    }

    pub fn set_bulk_state(&mut self, state: TransferState) {
        let previous = self.bulk.state;
        self.bulk.state = state;
        if previous != TransferState::None || state != TransferState::None {
            self.publish_state(state);
        }
    }

    pub fn set_file_progress(&mut self, progress: f64) {
        self.file.progress = progress.clamp(0.0, 1.0);
        if !self.is_bulk_transfer() {
            self.publish_progress(self.file.progress);
        }
    }

    pub fn set_bulk_progress(&mut self, progress: f64) {
        self.bulk.progress = progress.clamp(0.0, 1.0);
        if self.is_bulk_transfer() {
            self.publish_progress(self.bulk.progress);
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.tx.send_if_modified(|status| {
            let changed = status.connected != connected;
            status.connected = connected;
            changed
        });
    }

    /// 两条轨道都回到 `{None, 0}`
    pub fn reset(&mut self) {
        self.set_file_state(TransferState::None);
        self.set_bulk_state(TransferState::None);
        self.set_file_progress(0.0);
        self.set_bulk_progress(0.0);
    }

    /// 批量进度清零（批量握手被接受时）
    pub fn reset_progress(&mut self) {
        self.set_file_progress(0.0);
        self.set_bulk_progress(0.0);
    }

    fn publish_state(&self, state: TransferState) {
        self.tx.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            status.progress_bar_hidden = state.is_progress_bar_hidden();
            changed
        });
    }

    fn publish_progress(&self, progress: f64) {
        self.tx.send_if_modified(|status| {
            let changed = status.progress != progress;
            status.progress = progress;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_file_track_publishes_without_bulk() {
        let mut store = TransferStateStore::new();
        store.set_file_state(TransferState::Waiting);
        assert_eq!(store.status().state, TransferState::Waiting);
        assert!(!store.status().progress_bar_hidden);

        store.set_file_progress(0.5);
        assert_eq!(store.status().progress, 0.5);

        store.set_file_state(TransferState::Complete);
        assert_eq!(store.status().state, TransferState::Complete);
        assert!(store.status().progress_bar_hidden);
    }

    #[test]
    fn test_bulk_track_takes_precedence() {
        let mut store = TransferStateStore::new();
        store.set_bulk_state(TransferState::Sending);
        store.set_bulk_progress(0.3);

        // 文件轨道内部更新但不发布
        store.set_file_state(TransferState::Complete);
        store.set_file_progress(1.0);
        assert_eq!(store.status().state, TransferState::Sending);
        assert_eq!(store.status().progress, 0.3);
        assert_eq!(store.file_track().state, TransferState::Complete);
        assert_eq!(store.file_track().progress, 1.0);
    }

    #[test]
    fn test_bulk_none_to_none_not_published() {
        let mut store = TransferStateStore::new();
        store.set_file_state(TransferState::Sending);
        store.set_bulk_state(TransferState::None);
        assert_eq!(store.status().state, TransferState::Sending);
    }

    #[test]
    fn test_bulk_end_returns_control_to_file_track() {
        let mut store = TransferStateStore::new();
        store.set_bulk_state(TransferState::Complete);
        store.set_bulk_state(TransferState::None);
        assert_eq!(store.status().state, TransferState::None);

        store.set_file_state(TransferState::Waiting);
        assert_eq!(store.status().state, TransferState::Waiting);
    }

    #[test]
    fn test_reset() {
        let mut store = TransferStateStore::new();
        store.set_bulk_state(TransferState::Sending);
        store.set_bulk_progress(0.7);
        store.set_file_state(TransferState::Sending);
        store.set_file_progress(0.4);

        store.reset();
        assert_eq!(store.file_track(), TransferTrack::default());
        assert_eq!(store.bulk_track(), TransferTrack::default());
        assert_eq!(store.status().state, TransferState::None);
        assert_eq!(store.status().progress, 0.0);
        assert!(store.status().progress_bar_hidden);
    }

    #[tokio::test]
    async fn test_subscribers_not_notified_for_same_value() {
        let mut store = TransferStateStore::new();
        let mut rx = store.subscribe();

        store.set_file_state(TransferState::None);
        store.set_file_progress(0.0);
        assert!(!rx.has_changed().unwrap());

        store.set_connected(true);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().connected);

        store.set_connected(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_titles() {
        assert_eq!(TransferState::Sending.sender_title(), "正在发送");
        assert_eq!(TransferState::Complete.receiver_title(), "接收完成");
        assert!(TransferState::Failed.is_terminal());
        assert!(!TransferState::Waiting.is_terminal());
    }

    #[derive(Debug, Clone, Copy)]
    enum Write {
        File(TransferState),
        Bulk(TransferState),
    }

    fn any_state() -> impl Strategy<Value = TransferState> {
        prop_oneof![
            Just(TransferState::None),
            Just(TransferState::Waiting),
            Just(TransferState::Sending),
            Just(TransferState::Complete),
            Just(TransferState::Failed),
        ]
    }

    fn any_write() -> impl Strategy<Value = Write> {
        prop_oneof![
            any_state().prop_map(Write::File),
            any_state().prop_map(Write::Bulk),
        ]
    }

    proptest! {
        #[test]
        fn prop_track_precedence(writes in proptest::collection::vec(any_write(), 0..64)) {
            let mut store = TransferStateStore::new();

            for write in writes {
                let before = store.status().state;
                let bulk_before = store.bulk_track().state;
                match write {
                    Write::File(state) => {
                        store.set_file_state(state);
                        prop_assert_eq!(store.file_track().state, state);
                        if bulk_before == TransferState::None {
                            prop_assert_eq!(store.status().state, state);
                        } else {
                            prop_assert_eq!(store.status().state, before);
                        }
                    }
                    Write::Bulk(state) => {
                        store.set_bulk_state(state);
                        prop_assert_eq!(store.bulk_track().state, state);
                        if bulk_before == TransferState::None && state == TransferState::None {
                            prop_assert_eq!(store.status().state, before);
                        } else {
                            prop_assert_eq!(store.status().state, state);
                        }
                    }
                }
                prop_assert_eq!(
                    store.status().progress_bar_hidden,
                    store.status().state.is_progress_bar_hidden()
                );
            }
        }
    }
}
