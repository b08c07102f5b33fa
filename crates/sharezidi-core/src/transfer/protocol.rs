//! 中继 WebSocket 消息格式
//!
//! 每个文本帧是一个 JSON 对象，`type` 字段标明消息种类:
//!
//! ```json
//! { "type": "file-chunk", "toUserId": "B", "fileId": "f1", "chunkIndex": 0, ... }
//! ```
//!
//! 入站消息在 [`ClientMessage::parse`] 中完成反序列化与校验，路由层只处理
//! 已经类型化的结构。分块载荷在 JSON 中以 base64 字符串传输。

use crate::error::Result;
use crate::transfer::{DeviceId, FileInfo, TransferId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 分块确认状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkAckStatus {
    /// 服务器已转发（本地确认，不代表已送达）
    Forwarded,
    Received,
    Duplicate,
}

/// 设备发往服务器的消息
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Register,
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },
    TransferRequest {
        to_user_id: DeviceId,
        file_info: FileInfo,
        file_id: String,
    },
    TransferResponse {
        to_user_id: DeviceId,
        accepted: bool,
        file_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    FileChunk {
        /// 缺省时按 (发送端, fileId) 查找唯一的活动传输
        #[serde(default)]
        to_user_id: Option<DeviceId>,
        file_id: String,
        chunk_index: u32,
        total_chunks: u32,
        #[serde(with = "chunk_bytes")]
        chunk: Vec<u8>,
    },
    ChunkAck {
        to_user_id: DeviceId,
        file_id: String,
        chunk_index: u32,
        status: ChunkAckStatus,
    },
    TransferComplete {
        to_user_id: DeviceId,
        file_id: String,
    },
    ResumeTransfer {
        to_user_id: DeviceId,
        file_id: String,
        #[serde(default)]
        from_chunk: Option<u32>,
        #[serde(default)]
        missing_chunks: Option<Vec<u32>>,
    },
    CancelTransfer {
        transfer_id: TransferId,
        #[serde(default)]
        reason: Option<String>,
    },
    /// 透明转发的信令（例如 WebRTC offer/answer/ICE）
    Signal {
        to_user_id: DeviceId,
        payload: Value,
    },
}

impl ClientMessage {
    /// 解析并校验一条入站文本帧
    pub fn parse(text: &str) -> Result<Self> {
        let msg: Self = serde_json::from_str(text)?;
        if let Self::TransferRequest { file_info, .. } = &msg {
            file_info.validate()?;
        }
        Ok(msg)
    }

    /// 消息种类名称（用于日志）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Ping { .. } => "ping",
            Self::TransferRequest { .. } => "transfer-request",
            Self::TransferResponse { .. } => "transfer-response",
            Self::FileChunk { .. } => "file-chunk",
            Self::ChunkAck { .. } => "chunk-ack",
            Self::TransferComplete { .. } => "transfer-complete",
            Self::ResumeTransfer { .. } => "resume-transfer",
            Self::CancelTransfer { .. } => "cancel-transfer",
            Self::Signal { .. } => "signal",
        }
    }
}

/// 双方进度的同步快照（每次 chunk-ack 后广播给两端）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub transfer_id: TransferId,
    pub sender_id: DeviceId,
    pub receiver_id: DeviceId,
    pub file_id: String,
    pub sender_progress: f64,
    pub receiver_progress: f64,
    pub sync_lag: f64,
    pub duplicates_rejected: u64,
    /// Unix 毫秒时间戳，尚无分块时为 0
    pub last_chunk_time: u64,
    /// 同步滞后或重复分块过多
    pub degraded: bool,
}

/// 服务器发往设备的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Devices {
        devices: Vec<DeviceId>,
    },
    DeviceAssigned {
        device_id: DeviceId,
    },
    Pong {
        timestamp: Option<Value>,
        server_time: u64,
    },
    TransferRequest {
        from_user_id: DeviceId,
        transfer_id: TransferId,
        file_id: String,
        file_info: FileInfo,
    },
    TransferAccepted {
        from_user_id: DeviceId,
        transfer_id: TransferId,
        file_id: String,
    },
    TransferRejected {
        from_user_id: DeviceId,
        transfer_id: TransferId,
        file_id: String,
        reason: String,
    },
    FileChunk {
        from_user_id: DeviceId,
        transfer_id: TransferId,
        file_id: String,
        chunk_index: u32,
        total_chunks: u32,
        sent_progress: f64,
        #[serde(with = "chunk_bytes")]
        chunk: Vec<u8>,
    },
    ChunkAck {
        from_user_id: DeviceId,
        transfer_id: TransferId,
        file_id: String,
        chunk_index: u32,
        status: ChunkAckStatus,
    },
    SyncStatus(SyncStatus),
    TransferComplete {
        from_user_id: DeviceId,
        transfer_id: TransferId,
        file_id: String,
    },
    ResumeTransfer {
        from_user_id: DeviceId,
        transfer_id: TransferId,
        file_id: String,
        from_chunk: Option<u32>,
        missing_chunks: Vec<u32>,
    },
    TransferError {
        transfer_id: Option<TransferId>,
        file_id: Option<String>,
        reason: String,
    },
    TransferFailed {
        transfer_id: TransferId,
        file_id: String,
        reason: String,
    },
    Signal {
        from_user_id: DeviceId,
        payload: Value,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Devices { .. } => "devices",
            Self::DeviceAssigned { .. } => "device-assigned",
            Self::Pong { .. } => "pong",
            Self::TransferRequest { .. } => "transfer-request",
            Self::TransferAccepted { .. } => "transfer-accepted",
            Self::TransferRejected { .. } => "transfer-rejected",
            Self::FileChunk { .. } => "file-chunk",
            Self::ChunkAck { .. } => "chunk-ack",
            Self::SyncStatus(_) => "sync-status",
            Self::TransferComplete { .. } => "transfer-complete",
            Self::ResumeTransfer { .. } => "resume-transfer",
            Self::TransferError { .. } => "transfer-error",
            Self::TransferFailed { .. } => "transfer-failed",
            Self::Signal { .. } => "signal",
        }
    }

    /// 传输失败通知
    pub fn transfer_failed(id: &TransferId, reason: &str) -> Self {
        Self::TransferFailed {
            transfer_id: id.clone(),
            file_id: id.file_id.clone(),
            reason: reason.to_string(),
        }
    }

    /// 传输错误通知（可能没有对应的传输）
    pub fn transfer_error(id: Option<&TransferId>, file_id: Option<&str>, reason: &str) -> Self {
        Self::TransferError {
            transfer_id: id.cloned(),
            file_id: file_id
                .map(str::to_string)
                .or_else(|| id.map(|id| id.file_id.clone())),
            reason: reason.to_string(),
        }
    }
}

/// 分块载荷的 base64 编解码
mod chunk_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    #[test]
    fn test_parse_transfer_request() {
        let text = json!({
            "type": "transfer-request",
            "toUserId": "B",
            "fileId": "f1",
            "fileInfo": {"name": "a.txt", "size": 300, "type": "text/plain", "totalChunks": 3, "chunkSize": 100}
        })
        .to_string();

        let msg = ClientMessage::parse(&text).unwrap();
        let ClientMessage::TransferRequest {
            to_user_id,
            file_info,
            file_id,
        } = msg
        else {
            panic!("unexpected variant");
        };
        assert_eq!(to_user_id, dev("B"));
        assert_eq!(file_id, "f1");
        assert_eq!(file_info.total_chunks, 3);
        assert_eq!(file_info.mime_type, "text/plain");
    }

    #[test]
    fn test_parse_rejects_bad_file_info() {
        let text = json!({
            "type": "transfer-request",
            "toUserId": "B",
            "fileId": "f1",
            "fileInfo": {"name": "a.txt", "size": 300, "totalChunks": 0, "chunkSize": 100}
        })
        .to_string();
        assert!(ClientMessage::parse(&text).is_err());
    }

    #[test]
    fn test_parse_rejects_inflated_chunk_count() {
        let text = json!({
            "type": "transfer-request",
            "toUserId": "B",
            "fileId": "f1",
            "fileInfo": {"name": "a.txt", "size": 1, "totalChunks": u32::MAX, "chunkSize": 1}
        })
        .to_string();
        assert!(ClientMessage::parse(&text).is_err());
    }

    #[test]
    fn test_parse_chunk_decodes_base64() {
        let text = r#"{"type":"file-chunk","fileId":"f1","chunkIndex":1,"totalChunks":3,"chunk":"aGVsbG8="}"#;
        let msg = ClientMessage::parse(text).unwrap();
        let ClientMessage::FileChunk {
            to_user_id, chunk, ..
        } = msg
        else {
            panic!("unexpected variant");
        };
        assert!(to_user_id.is_none());
        assert_eq!(chunk, b"hello");
    }

    #[test]
    fn test_parse_unknown_type() {
        assert!(ClientMessage::parse(r#"{"type":"explode"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_device_id() {
        let text = r#"{"type":"transfer-complete","toUserId":"B:C","fileId":"f1"}"#;
        assert!(ClientMessage::parse(text).is_err());
    }

    #[test]
    fn test_parse_register_and_cancel() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"register"}"#).unwrap(),
            ClientMessage::Register
        );

        let msg =
            ClientMessage::parse(r#"{"type":"cancel-transfer","transferId":"A:B:f1"}"#).unwrap();
        let ClientMessage::CancelTransfer {
            transfer_id,
            reason,
        } = msg
        else {
            panic!("unexpected variant");
        };
        assert_eq!(transfer_id.file_id, "f1");
        assert!(reason.is_none());
    }

    #[test]
    fn test_server_message_wire_format() {
        let id = TransferId::new(dev("A"), dev("B"), "f1");
        let msg = ServerMessage::ChunkAck {
            from_user_id: dev("B"),
            transfer_id: id,
            file_id: "f1".to_string(),
            chunk_index: 2,
            status: ChunkAckStatus::Duplicate,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "chunk-ack");
        assert_eq!(value["fromUserId"], "B");
        assert_eq!(value["transferId"], "A:B:f1");
        assert_eq!(value["status"], "duplicate");
    }

    #[test]
    fn test_sync_status_is_flat() {
        let id = TransferId::new(dev("A"), dev("B"), "f1");
        let msg = ServerMessage::SyncStatus(SyncStatus {
            transfer_id: id,
            sender_id: dev("A"),
            receiver_id: dev("B"),
            file_id: "f1".to_string(),
            sender_progress: 50.0,
            receiver_progress: 25.0,
            sync_lag: 25.0,
            duplicates_rejected: 0,
            last_chunk_time: 1,
            degraded: true,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "sync-status");
        assert_eq!(value["syncLag"], 25.0);
        assert_eq!(value["degraded"], true);
    }

    #[test]
    fn test_transfer_error_falls_back_to_transfer_file_id() {
        let id = TransferId::new(dev("A"), dev("B"), "f9");
        let ServerMessage::TransferError { file_id, .. } =
            ServerMessage::transfer_error(Some(&id), None, "peer unavailable")
        else {
            panic!("unexpected variant");
        };
        assert_eq!(file_id.as_deref(), Some("f9"));
    }
}
