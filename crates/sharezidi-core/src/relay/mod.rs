//! 中继核心
//!
//! 依赖顺序（从叶子开始）:
//! - **registry**: 在线设备及其出站通道
//! - **tracker**: 每个传输的进度、位图与状态机
//! - **router**: 按消息类型分发并转发给对端
//! - **supervisor**: 定时检测卡顿传输并驱动恢复

pub mod registry;
pub mod router;
pub mod supervisor;
pub mod tracker;

pub use registry::{ConnectionRegistry, MessageSink};
pub use router::Relay;
pub use supervisor::{RecoveryAction, Supervisor};
pub use tracker::{AckOutcome, ChunkBitmap, Transfer, TransferStatus, TransferTracker};

use std::time::{SystemTime, UNIX_EPOCH};

/// 当前 Unix 毫秒时间戳
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
