//! 连接会话模块
//!
//! 包含:
//! - 设备身份 (`PeerConfig`) 和协议版本快照 (`ConnectionVersion`)
//! - 链路抽象 (`PacketSink` / `ConnectionSession`)
//! - 帧格式 (`frame`)
//! - TCP 实现 (`tcp`) 和进程内实现 (`memory`)

pub mod frame;
pub mod memory;
pub mod tcp;

pub use memory::MemoryConnection;
pub use tcp::{Endpoint, TcpConnection};

use crate::error::TransferError;
use serde::{Deserialize, Serialize};

/// 当前协议版本
///
/// 0: 初始版本
pub const PROTOCOL_VERSION: u32 = 0;

/// 支持的最低协议版本
pub const MIN_SUPPORTED_PROTOCOL_VERSION: u32 = 0;

/// 默认端口
pub const DEFAULT_PORT: u16 = 2431;

/// 设备类型
///
/// `Host` 是被动端（桌面），始终允许（重新）发送，并负责运行空闲看门狗。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeviceKind {
    #[default]
    Host = 0,
    App = 1,
    Extension = 2,
}

impl DeviceKind {
    /// 获取显示名称
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Host => "Host",
            DeviceKind::App => "App",
            DeviceKind::Extension => "Extension",
        }
    }

    /// 从 ID 值创建
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(DeviceKind::Host),
            1 => Some(DeviceKind::App),
            2 => Some(DeviceKind::Extension),
            _ => None,
        }
    }

    /// 获取 ID 值
    pub fn id(&self) -> u32 {
        *self as u32
    }

    /// 是否无视当前传输状态始终允许发送
    pub fn may_always_send(&self) -> bool {
        matches!(self, DeviceKind::Host)
    }

    /// 是否需要空闲看门狗自我恢复
    pub fn uses_idle_watchdog(&self) -> bool {
        matches!(self, DeviceKind::Host)
    }
}

/// 设备身份，连接建立时双方交换
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    pub identifier: String,
    pub name: String,
    pub hardware_model: String,
    pub protocol_version: u32,
    pub min_supported_protocol_version: u32,
    pub device_kind: DeviceKind,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>, device_kind: DeviceKind) -> Self {
        Self {
            identifier: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            hardware_model: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            protocol_version: PROTOCOL_VERSION,
            min_supported_protocol_version: MIN_SUPPORTED_PROTOCOL_VERSION,
            device_kind,
        }
    }
}

/// 连接建立时的版本快照，交给编解码器做兼容性判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionVersion {
    pub local_version: u32,
    pub local_min_version: u32,
    pub remote_version: u32,
    pub remote_min_version: u32,
}

impl ConnectionVersion {
    pub fn between(local: &PeerConfig, remote: &PeerConfig) -> Self {
        Self {
            local_version: local.protocol_version,
            local_min_version: local.min_supported_protocol_version,
            remote_version: remote.protocol_version,
            remote_min_version: remote.min_supported_protocol_version,
        }
    }
}

/// 链路事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// 对端已识别
    Connected(PeerConfig),
    /// 连接断开
    Disconnected(Option<String>),
    /// 收到原始数据包
    Packet(Vec<u8>),
}

/// 原始数据包发送
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, packet: Vec<u8>) -> Result<(), TransferError>;
}

/// 物理链路生命周期
pub trait ConnectionSession: PacketSink {
    /// 本地设备身份
    fn local_config(&self) -> &PeerConfig;

    /// 开始监听或拨号，已打开时无操作
    fn open(&self) -> Result<(), TransferError>;

    /// 关闭链路，已关闭时无操作
    fn close(&self);

    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind() {
        assert_eq!(DeviceKind::App.id(), 1);
        assert_eq!(DeviceKind::from_id(2), Some(DeviceKind::Extension));
        assert_eq!(DeviceKind::from_id(9), None);
        assert!(DeviceKind::Host.may_always_send());
        assert!(!DeviceKind::App.may_always_send());
        assert!(DeviceKind::Host.uses_idle_watchdog());
        assert!(!DeviceKind::Extension.uses_idle_watchdog());
    }

    #[test]
    fn test_peer_config_serialization() {
        let config = PeerConfig::new("desk", DeviceKind::Host);
        let json = serde_json::to_string(&config).unwrap();

        // 验证 camelCase 命名
        assert!(json.contains("\"protocolVersion\":"));
        assert!(json.contains("\"minSupportedProtocolVersion\":"));
        assert!(json.contains("\"deviceKind\":\"Host\""));

        let parsed: PeerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_connection_version_snapshot() {
        let mut local = PeerConfig::new("a", DeviceKind::Host);
        let mut remote = PeerConfig::new("b", DeviceKind::App);
        local.protocol_version = 3;
        local.min_supported_protocol_version = 1;
        remote.protocol_version = 2;
        remote.min_supported_protocol_version = 2;

        let version = ConnectionVersion::between(&local, &remote);
        assert_eq!(version.local_version, 3);
        assert_eq!(version.local_min_version, 1);
        assert_eq!(version.remote_version, 2);
        assert_eq!(version.remote_min_version, 2);
    }
}
