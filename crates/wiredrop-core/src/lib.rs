//! WireDrop Core Library
//!
//! 两台配对设备之间的点对点文件传输，核心是传输协调层
//!
//! # 模块
//!
//! - **connection**: 设备身份、帧格式、TCP / 进程内链路
//! - **codec**: 分片、重组与握手
//! - **transfer**: 双轨道状态存储、进度计算、空闲看门狗、传输协调器
//! - **export**: 接收文件导出
//! - **workflow**: 面向界面的传输会话
//! - **config**: 应用设置
//!
//! # 使用示例
//!
//! ## 接收文件
//!
//! ```ignore
//! use wiredrop_core::{AppSettings, DirectoryExporter, Endpoint, TcpConnection, TransferSession};
//!
//! let settings = AppSettings::load();
//! let (connection, events) =
//!     TcpConnection::new(Endpoint::Listen(settings.listen_addr.parse()?), settings.peer_config());
//! let exporter = Arc::new(DirectoryExporter::new(&settings.download_dir));
//! let session = TransferSession::start(connection, events, exporter, settings.session_options())?;
//!
//! let mut status = session.subscribe();
//! while status.changed().await.is_ok() {
//!     println!("{:?}", *status.borrow());
//! }
//! ```
//!
//! ## 发送文件
//!
//! ```ignore
//! let (connection, events) = TcpConnection::new(Endpoint::Dial(addr), settings.peer_config());
//! let session = TransferSession::start(connection, events, exporter, settings.session_options())?;
//! session.send_items(vec![Box::new(PathItem::new("photo.jpg"))]).await?;
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod export;
pub mod transfer;
pub mod workflow;

// Connection re-exports
pub use connection::{
    ConnectionEvent, ConnectionSession, ConnectionVersion, DEFAULT_PORT, DeviceKind, Endpoint,
    MemoryConnection, PacketSink, PeerConfig, TcpConnection,
};

// Codec re-exports
pub use codec::{
    CodecEvent, CodecFactory, Direction, FileDescriptor, FragmentCodec, FragmentCodecFactory,
    ProtocolCodec,
};

// Transfer re-exports
pub use transfer::{
    CoordinatorOptions, MemoryItem, PathItem, PublishedTransferStatus, TransferCoordinator,
    TransferItem, TransferNotice, TransferState,
};

pub use config::AppSettings;
pub use error::TransferError;
pub use export::{DirectoryExporter, Exporter, ReceivedFile};
pub use workflow::{LifecycleEvent, SessionOptions, TransferSession};
