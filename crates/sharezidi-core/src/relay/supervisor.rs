//! 同步与恢复监督器
//!
//! 定时扫描活动传输：超过卡顿超时没有新分块时，向发送端发送带缺失分块列表的
//! `resume-transfer`；连续多次尝试都没有进展则判定失败。
//! 同时负责清理过期设备和宽限期已过的已完成传输。

use crate::config::RecoveryPolicy;
use crate::relay::router::{REASON_PEER_UNAVAILABLE, REASON_RECOVERY_EXHAUSTED, Relay};
use crate::relay::tracker::{RecoveryState, Transfer, TransferStatus};
use crate::transfer::{ServerMessage, TransferId};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// 一次卡顿检查得出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 请求发送端重发缺失分块
    Resume {
        id: TransferId,
        missing: Vec<u32>,
        attempt: u32,
    },
    /// 恢复次数耗尽
    GiveUp { id: TransferId },
}

/// 在传输锁内评估是否卡顿，并更新恢复计数
///
/// 第 n 次尝试在距最后分块 `n * stall_timeout` 时触发，与检查周期无关。
pub fn evaluate(
    transfer: &mut Transfer,
    policy: &RecoveryPolicy,
    now: Instant,
) -> Option<RecoveryAction> {
    if transfer.status != TransferStatus::Active {
        return None;
    }

    // 上次尝试后有新分块，重新计数
    if transfer.recovery.attempts > 0
        && transfer.recovery.observed_chunk_at != transfer.last_chunk_at
    {
        debug!("Transfer {} made progress, recovery reset", transfer.id);
        transfer.recovery = RecoveryState::default();
    }

    let silence = now.saturating_duration_since(transfer.last_chunk_at?);
    if silence < policy.stall_timeout() * (transfer.recovery.attempts + 1) {
        return None;
    }

    let recovery = &mut transfer.recovery;
    recovery.attempts += 1;
    recovery.last_attempt_at = Some(now);
    recovery.observed_chunk_at = transfer.last_chunk_at;

    if recovery.attempts >= policy.max_attempts.max(1) {
        return Some(RecoveryAction::GiveUp {
            id: transfer.id.clone(),
        });
    }

    let missing: Vec<u32> = transfer
        .received
        .missing_iter()
        .take(policy.max_resume_chunks.max(1))
        .collect();
    if missing.is_empty() {
        debug!("Transfer {} stalled with nothing missing", transfer.id);
        return None;
    }
    Some(RecoveryAction::Resume {
        id: transfer.id.clone(),
        missing,
        attempt: transfer.recovery.attempts,
    })
}

/// 监督器
pub struct Supervisor {
    relay: Arc<Relay>,
}

impl Supervisor {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }

    /// 检查所有活动传输并执行恢复动作
    pub async fn check_stalls(&self, now: Instant) -> Vec<RecoveryAction> {
        let policy = &self.relay.config().recovery;
        let tracker = self.relay.tracker();

        let mut actions = Vec::new();
        for id in tracker.ids().await {
            if let Some(Some(action)) = tracker.update(&id, |t| evaluate(t, policy, now)).await {
                actions.push(action);
            }
        }

        for action in &actions {
            self.apply(action).await;
        }
        actions
    }

    async fn apply(&self, action: &RecoveryAction) {
        match action {
            RecoveryAction::Resume { id, missing, attempt } => {
                info!(
                    "Transfer {id} stalled, requesting {} chunk(s) (attempt {attempt})",
                    missing.len()
                );
                let directive = ServerMessage::ResumeTransfer {
                    from_user_id: id.receiver.clone(),
                    transfer_id: id.clone(),
                    file_id: id.file_id.clone(),
                    from_chunk: missing.first().copied(),
                    missing_chunks: missing.clone(),
                };
                if !self.relay.registry().send(&id.sender, directive).await {
                    self.relay.fail_transfer(id, REASON_PEER_UNAVAILABLE).await;
                }
            }
            RecoveryAction::GiveUp { id } => {
                warn!("Transfer {id}: giving up after repeated stalls");
                self.relay.fail_transfer(id, REASON_RECOVERY_EXHAUSTED).await;
            }
        }
    }

    /// 清理宽限期已过的已完成传输
    pub async fn purge_completed(&self, now: Instant) -> Vec<TransferId> {
        let grace = self.relay.config().recovery.completed_grace();
        self.relay.tracker().purge_completed(now, grace).await
    }

    /// 运行定时任务，直到 `shutdown` 被触发
    pub async fn run(self, shutdown: CancellationToken) {
        let mut check = interval(self.relay.config().recovery.check_interval());
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval(self.relay.config().sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Supervisor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = check.tick() => {
                    let now = Instant::now();
                    self.check_stalls(now).await;
                    let purged = self.purge_completed(now).await;
                    if !purged.is_empty() {
                        debug!("Purged {} completed transfer(s)", purged.len());
                    }
                }
                _ = sweep.tick() => {
                    self.relay.sweep_stale_devices(Instant::now()).await;
                }
            }
        }
        info!("Supervisor stopped");
    }
}
