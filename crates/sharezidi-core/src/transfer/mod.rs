//! 传输层与线协议
//!
//! 包含:
//! - JSON 消息格式 (`type` 字段区分消息种类)
//! - WebSocket 中继服务器 (每个设备一条连接)
//! - HTTP 状态接口 (`/health`, `/stats`)

pub mod http_server;
pub mod protocol;
pub mod websocket_handler;

pub use http_server::start_http_server;
pub use protocol::{ChunkAckStatus, ClientMessage, ServerMessage, SyncStatus};
pub use websocket_handler::RelayServer;

use crate::error::{RelayError, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_DEVICE_ID_LEN: usize = 64;
const GENERATED_ID_LEN: usize = 8;

/// 设备 ID
///
/// 由传输层分配的短字符串，只允许 `[A-Za-z0-9_-]`，因此可以安全地
/// 作为 [`TransferId`] 的分隔片段。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_DEVICE_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(id))
        } else {
            Err(RelayError::InvalidDeviceId(id))
        }
    }

    /// 生成随机 8 位字母数字 ID（客户端未自带 ID 时使用）
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// 传输 ID: `(发送端, 接收端, 文件 ID)` 组合键
///
/// 线格式为 `sender:receiver:fileId`，文件 ID 可以包含 `:`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransferId {
    pub sender: DeviceId,
    pub receiver: DeviceId,
    pub file_id: String,
}

impl TransferId {
    pub fn new(sender: DeviceId, receiver: DeviceId, file_id: impl Into<String>) -> Self {
        Self {
            sender,
            receiver,
            file_id: file_id.into(),
        }
    }

    /// 设备是否为该传输的参与方
    pub fn involves(&self, device: &DeviceId) -> bool {
        &self.sender == device || &self.receiver == device
    }

    /// 获取另一方设备
    pub fn peer_of(&self, device: &DeviceId) -> Option<&DeviceId> {
        if &self.sender == device {
            Some(&self.receiver)
        } else if &self.receiver == device {
            Some(&self.sender)
        } else {
            None
        }
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.sender, self.receiver, self.file_id)
    }
}

impl FromStr for TransferId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(sender), Some(receiver), Some(file_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RelayError::InvalidTransferId(s.to_string()));
        };
        if file_id.is_empty() {
            return Err(RelayError::InvalidTransferId(s.to_string()));
        }
        let invalid = |_| RelayError::InvalidTransferId(s.to_string());
        Ok(Self {
            sender: DeviceId::new(sender).map_err(invalid)?,
            receiver: DeviceId::new(receiver).map_err(invalid)?,
            file_id: file_id.to_string(),
        })
    }
}

impl TryFrom<String> for TransferId {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TransferId> for String {
    fn from(id: TransferId) -> Self {
        id.to_string()
    }
}

/// 文件信息（传输创建后不可变）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

impl FileInfo {
    /// 进入路由前的边界校验
    pub fn validate(&self) -> Result<()> {
        if self.total_chunks == 0 {
            return Err(RelayError::InvalidFileInfo(
                "totalChunks must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(RelayError::InvalidFileInfo(
                "chunkSize must be at least 1".to_string(),
            ));
        }
        // 空文件也占一个分块
        let expected = self.size.div_ceil(self.chunk_size).max(1);
        if u64::from(self.total_chunks) != expected {
            return Err(RelayError::InvalidFileInfo(format!(
                "{} bytes in {}-byte chunks needs {expected} chunks, got {}",
                self.size, self.chunk_size, self.total_chunks
            )));
        }
        Ok(())
    }
}
