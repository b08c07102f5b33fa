//! Relay Service - WebSocket/HTTP/Supervisor 管理

use anyhow::Result;
use sharezidi_core::{Relay, RelayConfig, RelayServer, Supervisor, start_http_server};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub async fn run_service(config: RelayConfig, shutdown: CancellationToken) -> Result<()> {
    tracing::info!(
        "中继服务初始化: ws={}, http={}",
        config.ws_addr,
        config.http_addr
    );

    let relay = Arc::new(Relay::new(config.clone()));

    let ws_server = RelayServer::bind(&config.ws_addr, relay.clone()).await?;
    let http_listener = TcpListener::bind(&config.http_addr).await?;

    let ws_handle = ws_server.spawn(shutdown.clone());
    let supervisor_handle = tokio::spawn(Supervisor::new(relay.clone()).run(shutdown.clone()));

    let http_result = start_http_server(http_listener, relay, shutdown.clone()).await;

    // HTTP 服务器退出时一并停止其余任务
    shutdown.cancel();
    let _ = tokio::join!(ws_handle, supervisor_handle);
    tracing::info!("中继服务已停止");

    http_result
}
