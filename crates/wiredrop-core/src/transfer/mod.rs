//! 传输协调模块
//!
//! - `state`: 双轨道状态存储与发布
//! - `progress`: 进度计算
//! - `watchdog`: 空闲看门狗
//! - `item`: 待发送条目
//! - `coordinator`: 传输协调器

pub mod coordinator;
pub mod item;
pub mod progress;
pub mod state;
pub mod watchdog;

pub use coordinator::{CoordinatorOptions, TransferCoordinator, TransferNotice};
pub use item::{LoadedItem, MemoryItem, PathItem, TransferItem};
pub use progress::Progress;
pub use state::{PublishedTransferStatus, TransferState, TransferStateStore, TransferTrack};
pub use watchdog::{IdleWatchdog, WatchdogTick};
