//! 传输跟踪器
//!
//! 独占持有所有传输的状态（进度、分块位图、重复计数、恢复计数）。
//! 外层映射只在插入/删除时短暂加锁，每个传输各自持有一把锁，
//! 互不相关的传输不会相互阻塞。
//!
//! # 状态机
//!
//! ```text
//! pending ──accept──> active ──complete──> completed
//!    │                  │
//!    └──────fail────────┴──> failed
//! ```

use crate::error::{RelayError, Result};
use crate::relay::unix_millis;
use crate::transfer::{DeviceId, FileInfo, SyncStatus, TransferId};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// 传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn name(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Active => "active",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 定长分块位图
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    len: u32,
    count: u32,
}

impl ChunkBitmap {
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0; len.div_ceil(64) as usize],
            len,
            count: 0,
        }
    }

    /// 置位，返回该位此前是否未被设置
    pub fn insert(&mut self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = (index as usize / 64, index % 64);
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.count += 1;
        true
    }

    pub fn contains(&self, index: u32) -> bool {
        index < self.len && self.words[index as usize / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.len
    }

    /// 所有未置位的下标（升序）
    pub fn missing(&self) -> Vec<u32> {
        self.missing_iter().collect()
    }

    /// 按序惰性遍历缺失分块
    pub fn missing_iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| !self.contains(i))
    }
}

/// 卡顿恢复状态（由监督器维护）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryState {
    /// 连续的无进展恢复尝试次数
    pub attempts: u32,
    pub last_attempt_at: Option<Instant>,
    /// 上次尝试时观察到的最后分块时间
    pub observed_chunk_at: Option<Instant>,
}

/// 分块确认的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// 新分块；`advanced` 表示推进了高水位
    Accepted { advanced: bool },
    Duplicate,
}

/// 单个传输
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub file_info: FileInfo,
    pub status: TransferStatus,
    pub sent_progress: f64,
    pub received_progress: f64,
    pub duplicate_chunks: u64,
    pub sent_high_water: Option<u32>,
    pub received_high_water: Option<u32>,
    pub received: ChunkBitmap,
    pub last_chunk_at: Option<Instant>,
    /// Unix 毫秒，随 `last_chunk_at` 一起更新
    pub last_chunk_time: u64,
    pub completed_at: Option<Instant>,
    pub recovery: RecoveryState,
}

impl Transfer {
    fn new(id: TransferId, file_info: FileInfo) -> Self {
        let received = ChunkBitmap::new(file_info.total_chunks);
        Self {
            id,
            file_info,
            status: TransferStatus::Pending,
            sent_progress: 0.0,
            received_progress: 0.0,
            duplicate_chunks: 0,
            sent_high_water: None,
            received_high_water: None,
            received,
            last_chunk_at: None,
            last_chunk_time: 0,
            completed_at: None,
            recovery: RecoveryState::default(),
        }
    }

    pub fn sync_lag(&self) -> f64 {
        (self.sent_progress - self.received_progress).max(0.0)
    }

    /// 双方进度快照（`degraded` 由监督策略另行标记）
    pub fn sync_status(&self) -> SyncStatus {
        SyncStatus {
            transfer_id: self.id.clone(),
            sender_id: self.id.sender.clone(),
            receiver_id: self.id.receiver.clone(),
            file_id: self.id.file_id.clone(),
            sender_progress: self.sent_progress,
            receiver_progress: self.received_progress,
            sync_lag: self.sync_lag(),
            duplicates_rejected: self.duplicate_chunks,
            last_chunk_time: self.last_chunk_time,
            degraded: false,
        }
    }

    fn touch_chunk_time(&mut self) {
        self.last_chunk_at = Some(Instant::now());
        self.last_chunk_time = unix_millis();
    }

    fn check_index(&self, chunk_index: u32, total_chunks: u32) -> Result<()> {
        let expected = self.file_info.total_chunks;
        if total_chunks != expected {
            return Err(RelayError::ChunkCountMismatch {
                expected,
                actual: total_chunks,
            });
        }
        if chunk_index >= expected {
            return Err(RelayError::InvalidChunkIndex {
                index: chunk_index,
                total: expected,
            });
        }
        Ok(())
    }

    fn transition_error(&self, to: TransferStatus) -> RelayError {
        RelayError::InvalidTransition {
            id: self.id.clone(),
            from: self.status.name(),
            to: to.name(),
        }
    }
}

fn progress_of(chunk_index: u32, total_chunks: u32) -> f64 {
    f64::from(chunk_index + 1) / f64::from(total_chunks) * 100.0
}

/// 传输跟踪器
#[derive(Default)]
pub struct TransferTracker {
    transfers: RwLock<HashMap<TransferId, Arc<Mutex<Transfer>>>>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: &TransferId) -> Result<Arc<Mutex<Transfer>>> {
        self.transfers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::UnknownTransfer(id.clone()))
    }

    /// 创建传输（状态为 pending）
    pub async fn create_transfer(
        &self,
        sender: DeviceId,
        receiver: DeviceId,
        file_id: &str,
        file_info: FileInfo,
    ) -> Result<TransferId> {
        let id = TransferId::new(sender, receiver, file_id);
        let mut transfers = self.transfers.write().await;
        if transfers.contains_key(&id) {
            return Err(RelayError::DuplicateTransfer(id));
        }
        info!(
            "Transfer {id} created: {} ({} bytes, {} chunks)",
            file_info.name, file_info.size, file_info.total_chunks
        );
        transfers.insert(
            id.clone(),
            Arc::new(Mutex::new(Transfer::new(id.clone(), file_info))),
        );
        Ok(id)
    }

    /// 在传输锁内执行 `f`，传输不存在时返回 `None`
    pub async fn update<R>(
        &self,
        id: &TransferId,
        f: impl FnOnce(&mut Transfer) -> R,
    ) -> Option<R> {
        let entry = self.entry(id).await.ok()?;
        let mut transfer = entry.lock().await;
        Some(f(&mut transfer))
    }

    /// 获取传输快照
    pub async fn get(&self, id: &TransferId) -> Option<Transfer> {
        self.update(id, |t| t.clone()).await
    }

    pub async fn status(&self, id: &TransferId) -> Option<TransferStatus> {
        self.update(id, |t| t.status).await
    }

    /// pending → active
    pub async fn activate(&self, id: &TransferId) -> Result<()> {
        let entry = self.entry(id).await?;
        let mut transfer = entry.lock().await;
        if transfer.status != TransferStatus::Pending {
            return Err(transfer.transition_error(TransferStatus::Active));
        }
        transfer.status = TransferStatus::Active;
        transfer.touch_chunk_time();
        info!("Transfer {id} active");
        Ok(())
    }

    /// 记录发送端发出的分块，返回最新的发送进度
    pub async fn record_chunk_sent(
        &self,
        id: &TransferId,
        chunk_index: u32,
        total_chunks: u32,
    ) -> Result<f64> {
        let entry = match self.entry(id).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Chunk {chunk_index} sent for unknown transfer {id}");
                return Err(e);
            }
        };
        let mut transfer = entry.lock().await;
        transfer.check_index(chunk_index, total_chunks)?;

        if transfer.sent_high_water.is_none_or(|hw| chunk_index > hw) {
            transfer.sent_high_water = Some(chunk_index);
            transfer.sent_progress = progress_of(chunk_index, total_chunks);
        }
        transfer.touch_chunk_time();
        debug!(
            "Transfer {id}: chunk {}/{} sent ({:.1}%)",
            chunk_index + 1,
            total_chunks,
            transfer.sent_progress
        );
        Ok(transfer.sent_progress)
    }

    /// 记录接收端的分块确认
    ///
    /// 标记为重复的确认或位图中已存在的分块只增加重复计数；
    /// 低于高水位的新分块只补位图，不回退进度。
    pub async fn record_chunk_ack(
        &self,
        id: &TransferId,
        chunk_index: u32,
        total_chunks: u32,
        is_duplicate: bool,
    ) -> Result<AckOutcome> {
        let entry = self.entry(id).await?;
        let mut transfer = entry.lock().await;
        transfer.check_index(chunk_index, total_chunks)?;

        if is_duplicate || !transfer.received.insert(chunk_index) {
            transfer.duplicate_chunks += 1;
            debug!(
                "Transfer {id}: duplicate chunk {chunk_index} (total duplicates {})",
                transfer.duplicate_chunks
            );
            return Ok(AckOutcome::Duplicate);
        }

        let advanced = transfer
            .received_high_water
            .is_none_or(|hw| chunk_index > hw);
        if advanced {
            transfer.received_high_water = Some(chunk_index);
            transfer.received_progress = progress_of(chunk_index, total_chunks);
        }
        Ok(AckOutcome::Accepted { advanced })
    }

    /// active → completed
    ///
    /// 对已完成的传输再次调用返回 `Ok(false)`，不产生任何副作用。
    pub async fn mark_complete(&self, id: &TransferId) -> Result<bool> {
        let entry = self.entry(id).await?;
        let mut transfer = entry.lock().await;
        match transfer.status {
            TransferStatus::Active => {
                transfer.status = TransferStatus::Completed;
                transfer.completed_at = Some(Instant::now());
                info!("Transfer {id} completed");
                Ok(true)
            }
            TransferStatus::Completed => Ok(false),
            _ => Err(transfer.transition_error(TransferStatus::Completed)),
        }
    }

    /// 任意非终态 → failed，并立即从内存中移除
    ///
    /// 返回失败时的快照，供调用方通知双方。
    pub async fn mark_failed(&self, id: &TransferId, reason: &str) -> Result<Transfer> {
        let mut transfers = self.transfers.write().await;
        let entry = transfers
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::UnknownTransfer(id.clone()))?;
        let mut transfer = entry.lock().await;
        if transfer.status.is_terminal() {
            return Err(transfer.transition_error(TransferStatus::Failed));
        }
        transfer.status = TransferStatus::Failed;
        transfers.remove(id);
        warn!("Transfer {id} failed: {reason}");
        Ok(transfer.clone())
    }

    /// 直接删除传输（拒绝或取消）
    pub async fn remove(&self, id: &TransferId) -> Option<Transfer> {
        let entry = self.transfers.write().await.remove(id)?;
        let transfer = entry.lock().await.clone();
        debug!("Transfer {id} removed ({})", transfer.status);
        Some(transfer)
    }

    /// 接收端尚未确认的分块下标
    pub async fn compute_missing_chunks(&self, id: &TransferId) -> Result<Vec<u32>> {
        let entry = self.entry(id).await?;
        let missing = entry.lock().await.received.missing();
        Ok(missing)
    }

    pub async fn sync_status(&self, id: &TransferId) -> Option<SyncStatus> {
        self.update(id, |t| t.sync_status()).await
    }

    /// 让设备参与的所有非终态传输失败，返回失败快照
    pub async fn fail_for_device(&self, device: &DeviceId, reason: &str) -> Vec<Transfer> {
        let ids: Vec<TransferId> = self
            .transfers
            .read()
            .await
            .keys()
            .filter(|id| id.involves(device))
            .cloned()
            .collect();

        let mut failed = Vec::new();
        for id in ids {
            // 已完成的传输留给宽限期清理
            if let Ok(transfer) = self.mark_failed(&id, reason).await {
                failed.push(transfer);
            }
        }
        failed
    }

    /// 按 (发送端, 文件 ID) 查找唯一的非终态传输
    pub async fn find_by_sender(&self, sender: &DeviceId, file_id: &str) -> Option<TransferId> {
        let candidates: Vec<TransferId> = self
            .transfers
            .read()
            .await
            .keys()
            .filter(|id| &id.sender == sender && id.file_id == file_id)
            .cloned()
            .collect();

        let mut found = None;
        for id in candidates {
            if self.status(&id).await.is_some_and(|s| !s.is_terminal()) {
                if found.is_some() {
                    debug!("Ambiguous chunk target for {sender}/{file_id}");
                    return None;
                }
                found = Some(id);
            }
        }
        found
    }

    pub async fn ids(&self) -> Vec<TransferId> {
        self.transfers.read().await.keys().cloned().collect()
    }

    pub async fn snapshots(&self) -> Vec<Transfer> {
        let entries: Vec<Arc<Mutex<Transfer>>> =
            self.transfers.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.lock().await.clone());
        }
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.transfers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transfers.read().await.is_empty()
    }

    /// 清理已过宽限期的已完成传输
    pub async fn purge_completed(&self, now: Instant, grace: Duration) -> Vec<TransferId> {
        let mut transfers = self.transfers.write().await;
        let mut purged = Vec::new();
        for (id, entry) in transfers.iter() {
            let transfer = entry.lock().await;
            let expired = transfer.status == TransferStatus::Completed
                && transfer
                    .completed_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= grace);
            if expired {
                purged.push(id.clone());
            }
        }
        for id in &purged {
            transfers.remove(id);
            debug!("Transfer {id} purged after grace period");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn info(total_chunks: u32) -> FileInfo {
        FileInfo {
            name: "a.txt".to_string(),
            size: u64::from(total_chunks) * 100,
            mime_type: "text/plain".to_string(),
            total_chunks,
            chunk_size: 100,
        }
    }

    async fn active_transfer(tracker: &TransferTracker, total: u32) -> TransferId {
        let id = tracker
            .create_transfer(dev("A"), dev("B"), "f1", info(total))
            .await
            .unwrap();
        tracker.activate(&id).await.unwrap();
        id
    }

    #[test]
    fn test_bitmap() {
        let mut bitmap = ChunkBitmap::new(130);
        assert!(bitmap.insert(0));
        assert!(bitmap.insert(129));
        assert!(!bitmap.insert(129));
        assert!(!bitmap.insert(130));
        assert_eq!(bitmap.count(), 2);
        assert_eq!(bitmap.missing().len(), 128);
        assert!(!bitmap.missing().contains(&129));
        assert!(!bitmap.is_complete());
    }

    #[tokio::test]
    async fn test_duplicate_transfer_rejected() {
        let tracker = TransferTracker::new();
        tracker
            .create_transfer(dev("A"), dev("B"), "f1", info(3))
            .await
            .unwrap();
        let err = tracker
            .create_transfer(dev("A"), dev("B"), "f1", info(3))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DuplicateTransfer(_)));
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_for_any_order() {
        let orders: [[u32; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];
        for order in orders {
            let tracker = TransferTracker::new();
            let id = active_transfer(&tracker, 4).await;
            let (mut sent, mut received) = (0.0, 0.0);
            for index in order {
                tracker.record_chunk_sent(&id, index, 4).await.unwrap();
                tracker.record_chunk_ack(&id, index, 4, false).await.unwrap();
                let t = tracker.get(&id).await.unwrap();
                assert!(t.sent_progress >= sent);
                assert!(t.received_progress >= received);
                sent = t.sent_progress;
                received = t.received_progress;
            }
            assert!((sent - 100.0).abs() < f64::EPSILON);
            assert!((received - 100.0).abs() < f64::EPSILON);
        }
    }

    #[tokio::test]
    async fn test_duplicate_ack_only_counts() {
        let tracker = TransferTracker::new();
        let id = active_transfer(&tracker, 4).await;
        tracker.record_chunk_ack(&id, 1, 4, false).await.unwrap();
        let before = tracker.get(&id).await.unwrap().received_progress;

        let outcome = tracker.record_chunk_ack(&id, 3, 4, true).await.unwrap();
        assert_eq!(outcome, AckOutcome::Duplicate);
        // 服务器端也能识别重复
        let outcome = tracker.record_chunk_ack(&id, 1, 4, false).await.unwrap();
        assert_eq!(outcome, AckOutcome::Duplicate);

        let t = tracker.get(&id).await.unwrap();
        assert_eq!(t.duplicate_chunks, 2);
        assert!((t.received_progress - before).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalid_index_does_not_mutate() {
        let tracker = TransferTracker::new();
        let id = active_transfer(&tracker, 3).await;
        assert!(matches!(
            tracker.record_chunk_sent(&id, 3, 3).await,
            Err(RelayError::InvalidChunkIndex { .. })
        ));
        assert!(matches!(
            tracker.record_chunk_ack(&id, 0, 4, false).await,
            Err(RelayError::ChunkCountMismatch { .. })
        ));
        let t = tracker.get(&id).await.unwrap();
        assert_eq!(t.sent_high_water, None);
        assert_eq!(t.received.count(), 0);
    }

    #[tokio::test]
    async fn test_mark_complete_is_idempotent() {
        let tracker = TransferTracker::new();
        let id = tracker
            .create_transfer(dev("A"), dev("B"), "f1", info(1))
            .await
            .unwrap();
        assert!(tracker.mark_complete(&id).await.is_err());

        tracker.activate(&id).await.unwrap();
        assert!(tracker.mark_complete(&id).await.unwrap());
        let first = tracker.get(&id).await.unwrap().completed_at;
        assert!(!tracker.mark_complete(&id).await.unwrap());
        assert_eq!(tracker.get(&id).await.unwrap().completed_at, first);
        assert!(tracker.mark_failed(&id, "late").await.is_err());
    }

    #[tokio::test]
    async fn test_mark_failed_removes_entry() {
        let tracker = TransferTracker::new();
        let id = active_transfer(&tracker, 3).await;
        let snapshot = tracker.mark_failed(&id, "peer unavailable").await.unwrap();
        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert!(tracker.get(&id).await.is_none());
        assert!(tracker.mark_failed(&id, "again").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_chunks_sees_gaps_below_high_water() {
        let tracker = TransferTracker::new();
        let id = active_transfer(&tracker, 5).await;
        for index in [0, 2, 4] {
            tracker.record_chunk_ack(&id, index, 5, false).await.unwrap();
        }
        assert_eq!(tracker.compute_missing_chunks(&id).await.unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_fail_for_device_only_touches_participants() {
        let tracker = TransferTracker::new();
        let ab = tracker
            .create_transfer(dev("A"), dev("B"), "f1", info(2))
            .await
            .unwrap();
        let ca = tracker
            .create_transfer(dev("C"), dev("A"), "f2", info(2))
            .await
            .unwrap();
        let cd = tracker
            .create_transfer(dev("C"), dev("D"), "f3", info(2))
            .await
            .unwrap();
        tracker.activate(&ab).await.unwrap();

        let failed = tracker.fail_for_device(&dev("A"), "peer disconnected").await;
        assert_eq!(failed.len(), 2);
        assert!(tracker.get(&ab).await.is_none());
        assert!(tracker.get(&ca).await.is_none());
        assert!(tracker.get(&cd).await.is_some());
    }

    #[tokio::test]
    async fn test_purge_completed_after_grace() {
        let tracker = TransferTracker::new();
        let id = active_transfer(&tracker, 1).await;
        tracker.mark_complete(&id).await.unwrap();

        let grace = Duration::from_secs(30);
        let now = Instant::now();
        assert!(tracker.purge_completed(now, grace).await.is_empty());
        assert_eq!(
            tracker.purge_completed(now + grace, grace).await,
            vec![id.clone()]
        );
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn test_find_by_sender() {
        let tracker = TransferTracker::new();
        let id = active_transfer(&tracker, 2).await;
        assert_eq!(tracker.find_by_sender(&dev("A"), "f1").await, Some(id));
        assert_eq!(tracker.find_by_sender(&dev("B"), "f1").await, None);

        tracker
            .create_transfer(dev("A"), dev("C"), "f1", info(2))
            .await
            .unwrap();
        assert_eq!(tracker.find_by_sender(&dev("A"), "f1").await, None);
    }
}
