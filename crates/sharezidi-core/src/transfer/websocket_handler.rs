//! WebSocket 中继服务器
//!
//! 设备通过 `ws://<addr>/ws/<deviceId>` 接入；只连接 `/ws` 时由服务器分配 ID，
//! 并先发送一条 `device-assigned`。每个连接有独立的写任务按 FIFO 顺序发送
//! 出站消息，读循环把文本帧交给 [`Relay`]。

use crate::error::RelayError;
use crate::relay::{MessageSink, Relay};
use crate::transfer::{DeviceId, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

const WS_PATH: &str = "/ws";

/// 从握手路径解析设备 ID
///
/// `/ws` 与 `/ws/` 返回 `Ok(None)`，表示由服务器分配。
pub fn device_from_path(path: &str) -> Result<Option<DeviceId>, RelayError> {
    let Some(rest) = path.strip_prefix(WS_PATH) else {
        return Err(RelayError::InvalidDeviceId(path.to_string()));
    };
    match rest.strip_prefix('/') {
        None if rest.is_empty() => Ok(None),
        Some("") => Ok(None),
        Some(id) => DeviceId::new(id).map(Some),
        None => Err(RelayError::InvalidDeviceId(path.to_string())),
    }
}

/// WebSocket 中继服务器
pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl RelayServer {
    pub async fn bind(addr: &str, relay: Arc<Relay>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay WebSocket server listening on {}", listener.local_addr()?);
        Ok(Self { listener, relay })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到 `shutdown` 被触发
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Relay WebSocket server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    let relay = self.relay.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, relay).await {
                            debug!("Connection {peer} ended: {e}");
                        }
                    });
                }
            }
        }
    }

    /// 在后台运行
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(shutdown).await {
                error!("Relay WebSocket server error: {e}");
            }
        })
    }
}

fn refuse(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// 处理单个 WebSocket 连接
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    relay: Arc<Relay>,
) -> anyhow::Result<()> {
    let mut requested: Option<Option<DeviceId>> = None;
    let callback = |request: &Request, response: Response| {
        match device_from_path(request.uri().path()) {
            Ok(device) => {
                requested = Some(device);
                Ok(response)
            }
            Err(e) => {
                warn!("Refusing WebSocket from {peer}: {e}");
                Err(refuse(StatusCode::BAD_REQUEST, "invalid device id"))
            }
        }
    };
    let ws_stream = accept_hdr_async(stream, callback).await?;
    let (device, assigned) = match requested.flatten() {
        Some(device) => (device, false),
        None => (DeviceId::generate(), true),
    };

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(relay.config().outbound_queue.max(1));

    // 写任务：注册表丢弃发送端后自然结束
    let writer_device = device.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {}: {e}", message.kind());
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text)).await {
                debug!("Write to {writer_device} failed: {e}");
                break;
            }
        }
        let _ = write.close().await;
    });

    if assigned {
        let notice = ServerMessage::DeviceAssigned {
            device_id: device.clone(),
        };
        if !tx.deliver(notice) {
            warn!("Could not send assigned id to {peer}");
        }
    }
    let sink: Arc<dyn MessageSink> = Arc::new(tx);
    let connection = relay.connect(device.clone(), sink).await;
    info!("Device {device} connected from {peer}");

    while let Some(frame) = read.next().await {
        // 同一设备已重新连接，旧连接的帧不再处理
        if !relay.registry().is_current(&device, connection).await {
            info!("Connection {connection} of {device} was superseded, closing");
            break;
        }
        match frame {
            Ok(Message::Text(text)) => relay.handle_text(&device, &text).await,
            Ok(Message::Ping(_) | Message::Pong(_)) => relay.registry().touch(&device).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => debug!("Ignoring non-text frame from {device}"),
            Err(e) => {
                warn!("WebSocket read error from {device}: {e}");
                break;
            }
        }
    }

    let failed = relay.disconnect(&device, Some(connection)).await;
    info!("Device {device} disconnected ({failed} transfer(s) failed)");
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_from_path() {
        assert_eq!(device_from_path("/ws").unwrap(), None);
        assert_eq!(device_from_path("/ws/").unwrap(), None);
        assert_eq!(
            device_from_path("/ws/phone-1").unwrap(),
            Some(DeviceId::new("phone-1").unwrap())
        );
        assert!(device_from_path("/ws/bad id").is_err());
        assert!(device_from_path("/wsx").is_err());
        assert!(device_from_path("/other/A").is_err());
    }
}
