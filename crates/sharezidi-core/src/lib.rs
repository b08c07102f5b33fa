//! ShareZidi Core Library
//!
//! 实时文件中继协议的核心实现：设备通过 WebSocket 接入，服务器在发送端与
//! 接收端之间转发分块，并跟踪双方进度、重复分块与卡顿恢复。
//!
//! # 模块
//!
//! - **relay**: 连接注册表、传输跟踪器、消息路由与恢复监督器
//! - **transfer**: 线协议、WebSocket 服务器与 HTTP 状态接口
//! - **config**: 中继配置（TOML）
//! - **logging**: 日志级别
//!
//! # 使用示例
//!
//! ```ignore
//! use sharezidi_core::{Relay, RelayConfig, RelayServer, Supervisor};
//!
//! let config = RelayConfig::load();
//! let relay = Arc::new(Relay::new(config.clone()));
//! let shutdown = CancellationToken::new();
//!
//! // 1. 接受设备连接
//! let server = RelayServer::bind(&config.ws_addr, relay.clone()).await?;
//! server.spawn(shutdown.clone());
//!
//! // 2. 卡顿检测与设备清理
//! tokio::spawn(Supervisor::new(relay.clone()).run(shutdown.clone()));
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod relay;
pub mod transfer;

pub use config::{RecoveryPolicy, RelayConfig};
pub use error::{RelayError, Result};
pub use logging::LogLevel;

// Relay re-exports
pub use relay::{
    AckOutcome, ChunkBitmap, ConnectionRegistry, MessageSink, RecoveryAction, Relay, Supervisor,
    Transfer, TransferStatus, TransferTracker,
};

// Transfer re-exports
pub use transfer::{
    ChunkAckStatus, ClientMessage, DeviceId, FileInfo, RelayServer, ServerMessage, SyncStatus,
    TransferId, start_http_server,
};
