//! 传输错误类型
//!
//! 错误分为四类：
//! - 传输错误（链路发送/连接失败）：吸收进轨道状态 `Failed`
//! - 协议拒绝（对端拒绝文件或批量握手）：轨道进入 `Failed`，缓存的批量文件丢弃
//! - 源不可读（本地载荷加载失败）：中止当前批次
//! - 编程错误（总数为零、传输进行中再次发起）：调用时立即返回，不会触达网络

/// 传输协调层错误
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Peer rejected {what} (reason: {reason})")]
    Rejected { what: &'static str, reason: String },

    #[error("Incompatible protocol version: local {local}, remote {remote}")]
    IncompatibleVersion { local: u32, remote: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unable to load {name}: {reason}")]
    UnreadableSource { name: String, reason: String },

    #[error("Transfer not allowed while another transfer is in progress")]
    NotAllowed,

    #[error("Invalid transfer total: {0}")]
    InvalidTotal(usize),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Session has been terminated")]
    Terminated,
}

impl TransferError {
    /// 是否属于编程错误（同步拒绝，不会改变轨道状态）
    pub fn is_programming_error(&self) -> bool {
        matches!(self, TransferError::NotAllowed | TransferError::InvalidTotal(_))
    }

    /// 是否属于链路层错误
    pub fn is_transport_error(&self) -> bool {
        matches!(self, TransferError::Transport(_) | TransferError::Io(_))
    }
}
