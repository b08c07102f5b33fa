//! 连接注册表
//!
//! 维护 设备 ID → 出站消息通道 的映射。同一设备 ID 重复注册时后注册者生效，
//! 旧连接在之后关闭时不会注销新连接（通过连接序号区分）。

use crate::transfer::{DeviceId, ServerMessage};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};

/// 设备的出站消息通道
///
/// `deliver` 不得阻塞，失败（设备已断开或队列已满）返回 `false`。
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: ServerMessage) -> bool;
}

impl MessageSink for mpsc::Sender<ServerMessage> {
    fn deliver(&self, message: ServerMessage) -> bool {
        self.try_send(message).is_ok()
    }
}

impl MessageSink for mpsc::UnboundedSender<ServerMessage> {
    fn deliver(&self, message: ServerMessage) -> bool {
        self.send(message).is_ok()
    }
}

struct DeviceEntry {
    sink: Arc<dyn MessageSink>,
    connection: u64,
    last_seen: Instant,
}

/// 连接注册表
pub struct ConnectionRegistry {
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
    next_connection: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// 注册设备，返回本次连接的序号
    ///
    /// 已存在的同名设备会被替换，随后向所有设备广播设备列表。
    pub async fn register(&self, id: DeviceId, sink: Arc<dyn MessageSink>) -> u64 {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let replaced = {
            let mut devices = self.devices.write().await;
            devices
                .insert(
                    id.clone(),
                    DeviceEntry {
                        sink,
                        connection,
                        last_seen: Instant::now(),
                    },
                )
                .is_some()
        };

        if replaced {
            info!("Device {id} re-registered (connection #{connection}), previous sink dropped");
        } else {
            info!("Device {id} registered (connection #{connection})");
        }

        self.broadcast_devices().await;
        connection
    }

    /// 注销设备
    ///
    /// 指定 `connection` 时只有序号一致才会移除，避免旧连接关闭时误删新连接。
    /// 返回是否真的移除了设备。
    pub async fn unregister(&self, id: &DeviceId, connection: Option<u64>) -> bool {
        let removed = {
            let mut devices = self.devices.write().await;
            match devices.get(id) {
                Some(entry) if connection.is_none_or(|c| c == entry.connection) => {
                    devices.remove(id);
                    true
                }
                Some(_) => {
                    debug!("Ignoring unregister of {id}: connection superseded");
                    false
                }
                None => false,
            }
        };

        if removed {
            info!("Device {id} unregistered");
            self.broadcast_devices().await;
        }
        removed
    }

    /// 更新设备最后活跃时间
    pub async fn touch(&self, id: &DeviceId) {
        if let Some(entry) = self.devices.write().await.get_mut(id) {
            entry.last_seen = Instant::now();
        }
    }

    /// 向设备发送消息，设备不存在或通道不可写时返回 `false`
    pub async fn send(&self, id: &DeviceId, message: ServerMessage) -> bool {
        let devices = self.devices.read().await;
        let Some(entry) = devices.get(id) else {
            debug!("Cannot send {} to {id}: not registered", message.kind());
            return false;
        };
        let kind = message.kind();
        let delivered = entry.sink.deliver(message);
        if !delivered {
            warn!("Failed to deliver {kind} to {id}");
        }
        delivered
    }

    pub async fn is_reachable(&self, id: &DeviceId) -> bool {
        self.devices.read().await.contains_key(id)
    }

    /// 连接序号是否仍是该设备的当前连接
    pub async fn is_current(&self, id: &DeviceId, connection: u64) -> bool {
        self.devices
            .read()
            .await
            .get(id)
            .is_some_and(|entry| entry.connection == connection)
    }

    /// 当前在线设备（排序后）
    pub async fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// 移除超过 `timeout` 未活跃的设备，返回被移除的设备 ID
    pub async fn sweep_stale(&self, timeout: Duration, now: Instant) -> Vec<DeviceId> {
        let stale: Vec<DeviceId> = {
            let mut devices = self.devices.write().await;
            let stale: Vec<DeviceId> = devices
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                devices.remove(id);
            }
            stale
        };

        if !stale.is_empty() {
            info!("Swept {} stale device(s): {:?}", stale.len(), stale);
            self.broadcast_devices().await;
        }
        stale
    }

    /// 向所有设备广播当前设备列表
    pub async fn broadcast_devices(&self) {
        let devices = self.devices.read().await;
        let mut ids: Vec<DeviceId> = devices.keys().cloned().collect();
        ids.sort();

        for (id, entry) in devices.iter() {
            let message = ServerMessage::Devices {
                devices: ids.clone(),
            };
            if !entry.sink.deliver(message) {
                warn!("Failed to send device list to {id}");
            }
        }
    }
}
