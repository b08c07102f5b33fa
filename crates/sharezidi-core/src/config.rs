//! 中继配置和持久化
//!
//! 配置文件位于 `<config_dir>/sharezidi/relay.toml`，缺失或无法解析时使用默认值。

use crate::logging::LogLevel;
use crate::transfer::SyncStatus;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 卡顿检测与恢复策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// 活动传输的检查周期
    pub check_interval_secs: u64,
    /// 超过该时长没有新分块即视为卡顿
    pub stall_timeout_secs: u64,
    /// 连续无进展的恢复尝试上限
    pub max_attempts: u32,
    /// 单条恢复指令最多携带的缺失分块数
    pub max_resume_chunks: usize,
    /// 完成后保留的宽限期
    pub completed_grace_secs: u64,
    /// 同步滞后告警阈值（百分点）
    pub sync_lag_threshold: f64,
    /// 重复分块告警阈值
    pub duplicate_threshold: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            stall_timeout_secs: 15,
            max_attempts: 5,
            max_resume_chunks: 1024,
            completed_grace_secs: 30,
            sync_lag_threshold: 10.0,
            duplicate_threshold: 100,
        }
    }
}

impl RecoveryPolicy {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn completed_grace(&self) -> Duration {
        Duration::from_secs(self.completed_grace_secs)
    }

    /// 同步滞后或重复分块过多（不影响状态机）
    pub fn is_degraded(&self, status: &SyncStatus) -> bool {
        status.sync_lag > self.sync_lag_threshold
            || status.duplicates_rejected > self.duplicate_threshold
    }
}

/// 中继设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket 监听地址
    pub ws_addr: String,
    /// HTTP 状态接口监听地址
    pub http_addr: String,
    /// 设备静默超过该时长即被清理
    pub liveness_timeout_secs: u64,
    /// 设备清理周期
    pub sweep_interval_secs: u64,
    /// 每个设备的出站队列深度
    pub outbound_queue: usize,
    /// 单个分块解码后的最大字节数
    pub max_chunk_bytes: usize,
    /// 单个文件允许的最大分块数
    pub max_total_chunks: u32,
    pub log_level: LogLevel,
    pub recovery: RecoveryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ws_addr: "0.0.0.0:8003".to_string(),
            http_addr: "0.0.0.0:8004".to_string(),
            liveness_timeout_secs: 60,
            sweep_interval_secs: 30,
            outbound_queue: 1024,
            max_chunk_bytes: 1024 * 1024,
            max_total_chunks: 1 << 20,
            log_level: LogLevel::Info,
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// 默认配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sharezidi");
        config_dir.join("relay.toml")
    }

    /// 从默认路径加载
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// 从指定路径加载（文件不存在或无效时使用默认值）
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        debug!("Loaded relay config from {path:?}");
                        return config;
                    }
                    Err(e) => {
                        warn!("Failed to parse relay config: {e}, using defaults");
                    }
                },
                Err(e) => {
                    warn!("Failed to read relay config: {e}, using defaults");
                }
            }
        }
        Self::default()
    }

    /// 保存到指定路径
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved relay config to {path:?}");
        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{DeviceId, TransferId};

    fn status(sync_lag: f64, duplicates_rejected: u64) -> SyncStatus {
        let a = DeviceId::new("A").unwrap();
        let b = DeviceId::new("B").unwrap();
        SyncStatus {
            transfer_id: TransferId::new(a.clone(), b.clone(), "f"),
            sender_id: a,
            receiver_id: b,
            file_id: "f".to_string(),
            sender_progress: sync_lag,
            receiver_progress: 0.0,
            sync_lag,
            duplicates_rejected,
            last_chunk_time: 0,
            degraded: false,
        }
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.liveness_timeout(), Duration::from_secs(60));
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.recovery.stall_timeout(), Duration::from_secs(15));
        assert_eq!(config.recovery.max_attempts, 5);
        assert_eq!(config.max_total_chunks, 1 << 20);
        assert_eq!(config.recovery.max_resume_chunks, 1024);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            ws_addr = "127.0.0.1:9000"
            log_level = "Debug"

            [recovery]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.ws_addr, "127.0.0.1:9000");
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.recovery.max_attempts, 2);
        assert_eq!(config.recovery.stall_timeout_secs, 15);
        assert_eq!(config.http_addr, "0.0.0.0:8004");
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("sharezidi-test-{}", std::process::id()))
            .join("relay.toml");
        let config = RelayConfig {
            outbound_queue: 7,
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(RelayConfig::load_from(&path), config);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = RelayConfig::load_from(Path::new("/nonexistent/sharezidi/relay.toml"));
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_degraded_thresholds() {
        let policy = RecoveryPolicy::default();
        assert!(!policy.is_degraded(&status(10.0, 100)));
        assert!(policy.is_degraded(&status(10.5, 0)));
        assert!(policy.is_degraded(&status(0.0, 101)));
    }
}
