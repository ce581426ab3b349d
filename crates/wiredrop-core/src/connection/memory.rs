//! 进程内链路
//!
//! 成对创建，两端都 `open()` 后视为已连接，一端 `close()` 时双方都收到 `Disconnected`。
//! 用于嵌入和测试。

use crate::connection::{ConnectionEvent, ConnectionSession, PacketSink, PeerConfig};
use crate::error::TransferError;
use log::debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// 一端连接及其事件接收端
pub type MemoryEnd = (
    Arc<MemoryConnection>,
    mpsc::UnboundedReceiver<ConnectionEvent>,
);

struct EndState {
    config: PeerConfig,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    open: bool,
}

struct PairState {
    ends: [EndState; 2],
}

impl PairState {
    fn connected(&self) -> bool {
        self.ends[0].open && self.ends[1].open
    }
}

/// 进程内连接会话
pub struct MemoryConnection {
    config: PeerConfig,
    side: usize,
    state: Arc<Mutex<PairState>>,
}

impl MemoryConnection {
    /// 创建一对互联的连接
    pub fn pair(a: PeerConfig, b: PeerConfig) -> (MemoryEnd, MemoryEnd) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let state = Arc::new(Mutex::new(PairState {
            ends: [
                EndState {
                    config: a.clone(),
                    events_tx: a_tx,
                    open: false,
                },
                EndState {
                    config: b.clone(),
                    events_tx: b_tx,
                    open: false,
                },
            ],
        }));

        let first = Arc::new(Self {
            config: a,
            side: 0,
            state: state.clone(),
        });
        let second = Arc::new(Self {
            config: b,
            side: 1,
            state,
        });

        ((first, a_rx), (second, b_rx))
    }

    fn lock(&self) -> MutexGuard<'_, PairState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn other(&self) -> usize {
        1 - self.side
    }

    /// 两端是否都已打开
    pub fn is_connected(&self) -> bool {
        self.lock().connected()
    }
}

impl PacketSink for MemoryConnection {
    fn send_packet(&self, packet: Vec<u8>) -> Result<(), TransferError> {
        let state = self.lock();
        if !state.connected() {
            return Err(TransferError::Transport("Not connected".to_string()));
        }
        state.ends[self.other()]
            .events_tx
            .send(ConnectionEvent::Packet(packet))
            .map_err(|_| TransferError::Transport("Peer dropped".to_string()))
    }
}

impl ConnectionSession for MemoryConnection {
    fn local_config(&self) -> &PeerConfig {
        &self.config
    }

    fn open(&self) -> Result<(), TransferError> {
        let mut state = self.lock();
        if state.ends[self.side].open {
            return Ok(());
        }
        state.ends[self.side].open = true;

        if state.connected() {
            let me = &state.ends[self.side];
            let peer = &state.ends[self.other()];
            debug!("Memory link connected: {} <-> {}", me.config.name, peer.config.name);
            let _ = me
                .events_tx
                .send(ConnectionEvent::Connected(peer.config.clone()));
            let _ = peer
                .events_tx
                .send(ConnectionEvent::Connected(me.config.clone()));
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = self.lock();
        if !state.ends[self.side].open {
            return;
        }
        let was_connected = state.connected();
        state.ends[self.side].open = false;

        if was_connected {
            debug!("Memory link closed by {}", self.config.name);
            for end in &state.ends {
                let _ = end.events_tx.send(ConnectionEvent::Disconnected(None));
            }
        }
    }

    fn is_open(&self) -> bool {
        self.lock().ends[self.side].open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DeviceKind;

    #[test]
    fn test_pair_connects_when_both_open() {
        let ((host, mut host_rx), (app, mut app_rx)) = MemoryConnection::pair(
            PeerConfig::new("host", DeviceKind::Host),
            PeerConfig::new("app", DeviceKind::App),
        );

        host.open().unwrap();
        assert!(!host.is_connected());
        assert!(host_rx.try_recv().is_err());
        assert!(host.send_packet(vec![1]).is_err());

        app.open().unwrap();
        match host_rx.try_recv().unwrap() {
            ConnectionEvent::Connected(remote) => assert_eq!(remote.name, "app"),
            other => panic!("unexpected event: {:?}", other),
        }
        match app_rx.try_recv().unwrap() {
            ConnectionEvent::Connected(remote) => assert_eq!(remote.name, "host"),
            other => panic!("unexpected event: {:?}", other),
        }

        app.send_packet(vec![4, 2]).unwrap();
        assert_eq!(host_rx.try_recv().unwrap(), ConnectionEvent::Packet(vec![4, 2]));
    }

    #[test]
    fn test_close_notifies_both_ends_once() {
        let ((host, mut host_rx), (app, mut app_rx)) = MemoryConnection::pair(
            PeerConfig::new("host", DeviceKind::Host),
            PeerConfig::new("app", DeviceKind::App),
        );
        host.open().unwrap();
        app.open().unwrap();
        let _ = host_rx.try_recv();
        let _ = app_rx.try_recv();

        app.close();
        app.close();
        assert_eq!(host_rx.try_recv().unwrap(), ConnectionEvent::Disconnected(None));
        assert_eq!(app_rx.try_recv().unwrap(), ConnectionEvent::Disconnected(None));
        assert!(host_rx.try_recv().is_err());
        assert!(!app.is_open());
        assert!(host.is_open());
    }
}
