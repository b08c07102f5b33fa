//! 消息路由
//!
//! 接收已类型化的入站消息，更新传输跟踪器，并通过连接注册表转发给对端。
//! 所有转发都是非阻塞的；转发失败时传输立即失败，并向发起方发送
//! `transfer-error`。
//!
//! # 协议
//!
//! ```text
//! Sender (A)                 Relay                  Receiver (B)
//!     |-- transfer-request ---->|-- transfer-request ---->|
//!     |<-- transfer-accepted ---|<-- transfer-response ---|
//!     |-- file-chunk ---------->|-- file-chunk ---------->|
//!     |<-- chunk-ack(forwarded)-|                         |
//!     |<-- chunk-ack -----------|<-- chunk-ack -----------|
//!     |<-- sync-status ---------|-- sync-status --------->|
//!     |-- transfer-complete --->|-- transfer-complete --->|
//! ```

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::registry::{ConnectionRegistry, MessageSink};
use crate::relay::tracker::{AckOutcome, TransferStatus, TransferTracker};
use crate::relay::unix_millis;
use crate::transfer::{
    ChunkAckStatus, ClientMessage, DeviceId, FileInfo, ServerMessage, TransferId,
};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

pub const REASON_PEER_DISCONNECTED: &str = "peer disconnected";
pub const REASON_PEER_UNAVAILABLE: &str = "peer unavailable";
pub const REASON_RECOVERY_EXHAUSTED: &str = "recovery exhausted";

/// 中继：持有注册表与跟踪器，并负责消息分发
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<TransferTracker>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            tracker: Arc::new(TransferTracker::new()),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<TransferTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// 设备上线
    pub async fn connect(&self, device: DeviceId, sink: Arc<dyn MessageSink>) -> u64 {
        self.registry.register(device, sink).await
    }

    /// 设备下线，级联失败其参与的所有传输，返回失败的传输数
    pub async fn disconnect(&self, device: &DeviceId, connection: Option<u64>) -> usize {
        if !self.registry.unregister(device, connection).await {
            return 0;
        }
        self.fail_transfers_of(device).await
    }

    /// 清理静默设备（丢失断开通知时回收资源）
    pub async fn sweep_stale_devices(&self, now: Instant) -> Vec<DeviceId> {
        let stale = self
            .registry
            .sweep_stale(self.config.liveness_timeout(), now)
            .await;
        for device in &stale {
            self.fail_transfers_of(device).await;
        }
        stale
    }

    async fn fail_transfers_of(&self, device: &DeviceId) -> usize {
        let failed = self
            .tracker
            .fail_for_device(device, REASON_PEER_DISCONNECTED)
            .await;
        for transfer in &failed {
            if let Some(peer) = transfer.id.peer_of(device) {
                self.registry
                    .send(
                        peer,
                        ServerMessage::transfer_failed(&transfer.id, REASON_PEER_DISCONNECTED),
                    )
                    .await;
            }
        }
        if !failed.is_empty() {
            info!(
                "Device {device} gone: {} transfer(s) failed",
                failed.len()
            );
        }
        failed.len()
    }

    /// 让传输失败并通知双方
    pub async fn fail_transfer(&self, id: &TransferId, reason: &str) -> bool {
        match self.tracker.mark_failed(id, reason).await {
            Ok(_) => {
                let notice = ServerMessage::transfer_failed(id, reason);
                self.registry.send(&id.sender, notice.clone()).await;
                self.registry.send(&id.receiver, notice).await;
                true
            }
            Err(e) => {
                debug!("Cannot fail transfer {id}: {e}");
                false
            }
        }
    }

    /// 处理一条原始文本帧；无法解析的消息记录后丢弃
    pub async fn handle_text(&self, from: &DeviceId, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle(from, message).await,
            Err(e) => {
                self.registry.touch(from).await;
                warn!("Dropping malformed message from {from}: {e}");
            }
        }
    }

    /// 分发一条已校验的消息
    pub async fn handle(&self, from: &DeviceId, message: ClientMessage) {
        self.registry.touch(from).await;
        debug!("{from} -> {}", message.kind());

        match message {
            ClientMessage::Register => self.registry.broadcast_devices().await,
            ClientMessage::Ping { timestamp } => {
                let pong = ServerMessage::Pong {
                    timestamp,
                    server_time: unix_millis(),
                };
                self.registry.send(from, pong).await;
            }
            ClientMessage::TransferRequest {
                to_user_id,
                file_info,
                file_id,
            } => {
                self.on_transfer_request(from, to_user_id, file_info, file_id)
                    .await;
            }
            ClientMessage::TransferResponse {
                to_user_id,
                accepted,
                file_id,
                reason,
            } => {
                let id = TransferId::new(to_user_id, from.clone(), file_id);
                self.on_transfer_response(&id, accepted, reason).await;
            }
            ClientMessage::FileChunk {
                to_user_id,
                file_id,
                chunk_index,
                total_chunks,
                chunk,
            } => {
                let id = match to_user_id {
                    Some(to) => Some(TransferId::new(from.clone(), to, file_id)),
                    None => self.tracker.find_by_sender(from, &file_id).await,
                };
                match id {
                    Some(id) => self.on_file_chunk(&id, chunk_index, total_chunks, chunk).await,
                    None => debug!("Dropping chunk {chunk_index} from {from}: no transfer"),
                }
            }
            ClientMessage::ChunkAck {
                to_user_id,
                file_id,
                chunk_index,
                status,
            } => {
                let id = TransferId::new(to_user_id, from.clone(), file_id);
                self.on_chunk_ack(&id, chunk_index, status).await;
            }
            ClientMessage::TransferComplete {
                to_user_id,
                file_id,
            } => {
                let id = TransferId::new(from.clone(), to_user_id, file_id);
                self.on_transfer_complete(&id).await;
            }
            ClientMessage::ResumeTransfer {
                to_user_id,
                file_id,
                from_chunk,
                missing_chunks,
            } => {
                let id = TransferId::new(to_user_id, from.clone(), file_id);
                self.on_resume_transfer(&id, from_chunk, missing_chunks.unwrap_or_default())
                    .await;
            }
            ClientMessage::CancelTransfer {
                transfer_id,
                reason,
            } => self.on_cancel(from, &transfer_id, reason).await,
            ClientMessage::Signal {
                to_user_id,
                payload,
            } => self.on_signal(from, &to_user_id, payload).await,
        }
    }

    /// 转发给目标设备；失败则让传输失败并通知发起方
    async fn forward_or_fail(
        &self,
        id: &TransferId,
        origin: &DeviceId,
        target: &DeviceId,
        message: ServerMessage,
    ) -> bool {
        if self.registry.send(target, message).await {
            return true;
        }
        warn!("Transfer {id}: {target} unreachable");
        if self
            .tracker
            .mark_failed(id, REASON_PEER_UNAVAILABLE)
            .await
            .is_err()
        {
            debug!("Transfer {id} already gone");
        }
        self.registry
            .send(
                origin,
                ServerMessage::transfer_error(Some(id), None, REASON_PEER_UNAVAILABLE),
            )
            .await;
        false
    }

    async fn on_transfer_request(
        &self,
        from: &DeviceId,
        to: DeviceId,
        file_info: FileInfo,
        file_id: String,
    ) {
        if &to == from {
            self.registry
                .send(
                    from,
                    ServerMessage::transfer_error(None, Some(&file_id), "cannot send to self"),
                )
                .await;
            return;
        }
        if file_info.total_chunks > self.config.max_total_chunks {
            warn!(
                "Transfer request from {from} with {} chunks exceeds limit {}",
                file_info.total_chunks, self.config.max_total_chunks
            );
            self.registry
                .send(
                    from,
                    ServerMessage::transfer_error(None, Some(&file_id), "file too large"),
                )
                .await;
            return;
        }
        if !self.registry.is_reachable(&to).await {
            info!("Transfer request from {from} to unknown device {to}");
            self.registry
                .send(
                    from,
                    ServerMessage::transfer_error(None, Some(&file_id), "receiver unavailable"),
                )
                .await;
            return;
        }

        let id = match self
            .tracker
            .create_transfer(from.clone(), to.clone(), &file_id, file_info.clone())
            .await
        {
            Ok(id) => id,
            Err(RelayError::DuplicateTransfer(id)) => {
                warn!("Duplicate transfer request {id}");
                self.registry
                    .send(
                        from,
                        ServerMessage::transfer_error(Some(&id), None, "duplicate transfer"),
                    )
                    .await;
                return;
            }
            Err(e) => {
                warn!("Cannot create transfer from {from}: {e}");
                return;
            }
        };

        let request = ServerMessage::TransferRequest {
            from_user_id: from.clone(),
            transfer_id: id.clone(),
            file_id,
            file_info,
        };
        self.forward_or_fail(&id, from, &to, request).await;
    }

    async fn on_transfer_response(&self, id: &TransferId, accepted: bool, reason: Option<String>) {
        match self.tracker.status(id).await {
            Some(TransferStatus::Pending) => {}
            Some(status) => {
                warn!("Ignoring response for {id}: transfer is {status}");
                return;
            }
            None => {
                debug!("Ignoring response for unknown transfer {id}");
                return;
            }
        }

        if accepted {
            if let Err(e) = self.tracker.activate(id).await {
                warn!("Cannot activate {id}: {e}");
                return;
            }
            let notice = ServerMessage::TransferAccepted {
                from_user_id: id.receiver.clone(),
                transfer_id: id.clone(),
                file_id: id.file_id.clone(),
            };
            self.forward_or_fail(id, &id.receiver, &id.sender, notice)
                .await;
        } else {
            self.tracker.remove(id).await;
            let reason = reason.unwrap_or_else(|| "rejected".to_string());
            info!("Transfer {id} rejected: {reason}");
            let notice = ServerMessage::TransferRejected {
                from_user_id: id.receiver.clone(),
                transfer_id: id.clone(),
                file_id: id.file_id.clone(),
                reason,
            };
            self.registry.send(&id.sender, notice).await;
        }
    }

    async fn on_file_chunk(
        &self,
        id: &TransferId,
        chunk_index: u32,
        total_chunks: u32,
        chunk: Vec<u8>,
    ) {
        // 取消之后仍在路上的分块直接丢弃
        if self.tracker.status(id).await != Some(TransferStatus::Active) {
            debug!("Dropping chunk {chunk_index} for inactive transfer {id}");
            return;
        }
        if chunk.len() > self.config.max_chunk_bytes {
            warn!(
                "Dropping chunk {chunk_index} for {id}: {} bytes exceeds limit",
                chunk.len()
            );
            return;
        }

        let sent_progress = match self
            .tracker
            .record_chunk_sent(id, chunk_index, total_chunks)
            .await
        {
            Ok(progress) => progress,
            Err(e) => {
                warn!("Dropping chunk for {id}: {e}");
                return;
            }
        };

        let forward = ServerMessage::FileChunk {
            from_user_id: id.sender.clone(),
            transfer_id: id.clone(),
            file_id: id.file_id.clone(),
            chunk_index,
            total_chunks,
            sent_progress,
            chunk,
        };
        if !self
            .forward_or_fail(id, &id.sender, &id.receiver, forward)
            .await
        {
            return;
        }

        let local_ack = ServerMessage::ChunkAck {
            from_user_id: id.receiver.clone(),
            transfer_id: id.clone(),
            file_id: id.file_id.clone(),
            chunk_index,
            status: ChunkAckStatus::Forwarded,
        };
        self.registry.send(&id.sender, local_ack).await;
    }

    async fn on_chunk_ack(&self, id: &TransferId, chunk_index: u32, status: ChunkAckStatus) {
        if status == ChunkAckStatus::Forwarded {
            warn!("Ignoring forwarded-status ack from {} for {id}", id.receiver);
            return;
        }
        let Some(total_chunks) = self
            .tracker
            .update(id, |t| t.file_info.total_chunks)
            .await
        else {
            debug!("Ignoring ack for unknown transfer {id}");
            return;
        };

        let outcome = match self
            .tracker
            .record_chunk_ack(
                id,
                chunk_index,
                total_chunks,
                status == ChunkAckStatus::Duplicate,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Dropping ack for {id}: {e}");
                return;
            }
        };

        let verdict = match outcome {
            AckOutcome::Accepted { .. } => ChunkAckStatus::Received,
            AckOutcome::Duplicate => ChunkAckStatus::Duplicate,
        };
        let ack = ServerMessage::ChunkAck {
            from_user_id: id.receiver.clone(),
            transfer_id: id.clone(),
            file_id: id.file_id.clone(),
            chunk_index,
            status: verdict,
        };
        if self
            .forward_or_fail(id, &id.receiver, &id.sender, ack)
            .await
        {
            self.broadcast_sync_status(id).await;
        }
    }

    /// 向双方广播同步状态
    pub async fn broadcast_sync_status(&self, id: &TransferId) {
        let Some(mut status) = self.tracker.sync_status(id).await else {
            return;
        };
        status.degraded = self.config.recovery.is_degraded(&status);
        if status.degraded {
            debug!(
                "Transfer {id} degraded: lag {:.1}, duplicates {}",
                status.sync_lag, status.duplicates_rejected
            );
        }
        let message = ServerMessage::SyncStatus(status);
        self.registry.send(&id.sender, message.clone()).await;
        self.registry.send(&id.receiver, message).await;
    }

    async fn on_transfer_complete(&self, id: &TransferId) {
        match self.tracker.mark_complete(id).await {
            Ok(true) => {
                let notice = ServerMessage::TransferComplete {
                    from_user_id: id.sender.clone(),
                    transfer_id: id.clone(),
                    file_id: id.file_id.clone(),
                };
                if !self.registry.send(&id.receiver, notice).await {
                    warn!("Transfer {id} completed but receiver was not notified");
                }
            }
            Ok(false) => debug!("Transfer {id} already completed"),
            Err(e) => warn!("Cannot complete transfer: {e}"),
        }
    }

    async fn on_resume_transfer(
        &self,
        id: &TransferId,
        from_chunk: Option<u32>,
        missing_chunks: Vec<u32>,
    ) {
        let directive = ServerMessage::ResumeTransfer {
            from_user_id: id.receiver.clone(),
            transfer_id: id.clone(),
            file_id: id.file_id.clone(),
            from_chunk,
            missing_chunks,
        };
        if self.tracker.status(id).await.is_some() {
            self.forward_or_fail(id, &id.receiver, &id.sender, directive)
                .await;
        } else if !self.registry.send(&id.sender, directive).await {
            self.registry
                .send(
                    &id.receiver,
                    ServerMessage::transfer_error(Some(id), None, REASON_PEER_UNAVAILABLE),
                )
                .await;
        }
    }

    async fn on_cancel(&self, from: &DeviceId, id: &TransferId, reason: Option<String>) {
        if !id.involves(from) {
            warn!("{from} tried to cancel foreign transfer {id}");
            return;
        }
        if self.tracker.remove(id).await.is_some() {
            info!(
                "Transfer {id} cancelled by {from}: {}",
                reason.as_deref().unwrap_or("no reason")
            );
        }
    }

    async fn on_signal(&self, from: &DeviceId, to: &DeviceId, payload: Value) {
        let message = ServerMessage::Signal {
            from_user_id: from.clone(),
            payload,
        };
        if !self.registry.send(to, message).await {
            self.registry
                .send(
                    from,
                    ServerMessage::transfer_error(None, None, REASON_PEER_UNAVAILABLE),
                )
                .await;
        }
    }
}
