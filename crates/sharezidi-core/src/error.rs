//! 中继错误类型

use crate::transfer::TransferId;

/// 路由与传输跟踪过程中的错误
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// 同一 (发送端, 接收端, 文件) 组合已存在
    #[error("Duplicate transfer: {0}")]
    DuplicateTransfer(TransferId),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(TransferId),

    #[error("Invalid chunk index {index} (total {total})")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("Chunk count mismatch: expected {expected}, got {actual}")]
    ChunkCountMismatch { expected: u32, actual: u32 },

    /// 状态机不允许的迁移
    #[error("Invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TransferId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Invalid file info: {0}")]
    InvalidFileInfo(String),

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid device id: {0:?}")]
    InvalidDeviceId(String),

    #[error("Invalid transfer id: {0:?}")]
    InvalidTransferId(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
