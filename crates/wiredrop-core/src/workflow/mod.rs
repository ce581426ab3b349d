//! 工作流模块
//!
//! 提供面向界面的会话 API，封装协调器与链路的生命周期

pub mod session;

pub use session::{LifecycleEvent, SessionOptions, TransferSession};
