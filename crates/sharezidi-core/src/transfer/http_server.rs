//! HTTP 状态接口
//!
//! - `GET /health`: 存活检查与计数
//! - `GET /stats`: 在线设备与每个传输的同步状态

use crate::relay::{Relay, TransferStatus, unix_millis};
use crate::transfer::{DeviceId, TransferId};
use axum::{Json, Router, extract::State, routing::get};
use log::{error, info};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub active_connections: usize,
    pub active_transfers: usize,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    pub sender_progress: f64,
    pub receiver_progress: f64,
    pub sync_lag: f64,
    pub duplicates_rejected: u64,
    pub degraded: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_connections: usize,
    pub devices: Vec<DeviceId>,
    pub transfers: Vec<TransferStats>,
}

pub async fn health(relay: &Relay) -> Health {
    Health {
        status: "healthy",
        active_connections: relay.registry().len().await,
        active_transfers: relay.tracker().len().await,
        timestamp: unix_millis(),
    }
}

pub async fn stats(relay: &Relay) -> Stats {
    let devices = relay.registry().device_ids().await;
    let mut transfers: Vec<TransferStats> = relay
        .tracker()
        .snapshots()
        .await
        .into_iter()
        .map(|t| {
            let sync = t.sync_status();
            TransferStats {
                degraded: relay.config().recovery.is_degraded(&sync),
                transfer_id: t.id,
                status: t.status,
                sender_progress: sync.sender_progress,
                receiver_progress: sync.receiver_progress,
                sync_lag: sync.sync_lag,
                duplicates_rejected: sync.duplicates_rejected,
            }
        })
        .collect();
    transfers.sort_by(|a, b| a.transfer_id.to_string().cmp(&b.transfer_id.to_string()));

    Stats {
        total_connections: devices.len(),
        devices,
        transfers,
    }
}

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .with_state(relay)
}

/// 启动 HTTP 状态接口，直到 `shutdown` 被触发
pub async fn start_http_server(
    listener: TcpListener,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("HTTP status server listening on {}", listener.local_addr()?);
    let app = router(relay);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        error!("HTTP server error: {e}");
        return Err(e.into());
    }
    Ok(())
}

async fn handle_health(State(relay): State<Arc<Relay>>) -> Json<Health> {
    Json(health(&relay).await)
}

async fn handle_stats(State(relay): State<Arc<Relay>>) -> Json<Stats> {
    Json(stats(&relay).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::transfer::FileInfo;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_health_and_stats() {
        let relay = Relay::new(RelayConfig::default());
        let a = DeviceId::new("A").unwrap();
        let b = DeviceId::new("B").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        relay.connect(a.clone(), Arc::new(tx)).await;
        let info = FileInfo {
            name: "a.bin".to_string(),
            size: 10,
            mime_type: String::new(),
            total_chunks: 1,
            chunk_size: 10,
        };
        relay
            .tracker()
            .create_transfer(a.clone(), b, "f1", info)
            .await
            .unwrap();

        let health = health(&relay).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.active_connections, 1);
        assert_eq!(health.active_transfers, 1);

        let stats = stats(&relay).await;
        assert_eq!(stats.devices, vec![a]);
        assert_eq!(stats.transfers.len(), 1);
        assert_eq!(stats.transfers[0].status, TransferStatus::Pending);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalConnections"], 1);
        assert_eq!(json["transfers"][0]["transferId"], "A:B:f1");
        assert_eq!(json["transfers"][0]["status"], "pending");
    }
}
