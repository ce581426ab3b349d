//! 协议编解码模块
//!
//! 编解码器负责分片、重组和握手，命令的结果以带方向的事件异步返回。
//! 协调器只依赖 `ProtocolCodec` trait，默认实现见 [`fragment::FragmentCodec`]。

pub mod fragment;
pub mod wire;

pub use fragment::{DEFAULT_FRAGMENT_SIZE, FragmentCodec, FragmentCodecFactory};

use crate::connection::{ConnectionVersion, DeviceKind, PacketSink};
use std::sync::Arc;

/// 事件方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 本端发出的传输
    Outbound,
    /// 对端发来的传输
    Inbound,
}

/// 待发送文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub data: Vec<u8>,
    pub filename: Option<String>,
    /// 在批次中的序号（从 0 开始）
    pub index: u32,
    pub total_in_batch: u32,
}

/// 编解码器事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecEvent {
    /// 分片已发送/已接收，`fragment` 从 1 开始
    FragmentProgress {
        direction: Direction,
        fragment: u32,
        fragments: u32,
        file_no: u32,
        total_files: u32,
    },
    FileAccepted {
        direction: Direction,
        file_id: u32,
        file_no: u32,
        total: u32,
    },
    FileCompleted {
        direction: Direction,
        file_id: u32,
    },
    FileFailed {
        direction: Direction,
        file_id: u32,
        reason: String,
    },
    /// 收到完整文件
    FileReceived {
        payload: Vec<u8>,
        filename: Option<String>,
    },
    BulkAccepted {
        direction: Direction,
        accepted: bool,
        bulk_id: i32,
        total: u32,
    },
    BulkEnded {
        direction: Direction,
        success: bool,
        bulk_id: i32,
    },
}

impl CodecEvent {
    pub fn direction(&self) -> Direction {
        match self {
            CodecEvent::FragmentProgress { direction, .. }
            | CodecEvent::FileAccepted { direction, .. }
            | CodecEvent::FileCompleted { direction, .. }
            | CodecEvent::FileFailed { direction, .. }
            | CodecEvent::BulkAccepted { direction, .. }
            | CodecEvent::BulkEnded { direction, .. } => *direction,
            CodecEvent::FileReceived { .. } => Direction::Inbound,
        }
    }
}

/// 协议编解码器
///
/// 命令方法返回同步产生的事件（例如链路发送失败），其余事件由 `feed` 返回。
pub trait ProtocolCodec: Send {
    /// 连接建立时设置版本快照
    fn set_connection_version(&mut self, version: ConnectionVersion);

    fn send_file(&mut self, file: FileDescriptor) -> Vec<CodecEvent>;

    fn start_bulk_transfer(&mut self, total: u32) -> Vec<CodecEvent>;

    fn end_bulk_transfer(&mut self, aborted: bool) -> Vec<CodecEvent>;

    /// 处理一个收到的数据包
    fn feed(&mut self, packet: &[u8]) -> Vec<CodecEvent>;
}

/// 编解码器工厂，断开连接后协调器会重建编解码器
pub trait CodecFactory: Send + Sync {
    fn create(&self, link: Arc<dyn PacketSink>, device_kind: DeviceKind)
    -> Box<dyn ProtocolCodec>;
}

impl<F> CodecFactory for F
where
    F: Fn(Arc<dyn PacketSink>, DeviceKind) -> Box<dyn ProtocolCodec> + Send + Sync,
{
    fn create(
        &self,
        link: Arc<dyn PacketSink>,
        device_kind: DeviceKind,
    ) -> Box<dyn ProtocolCodec> {
        self(link, device_kind)
    }
}
