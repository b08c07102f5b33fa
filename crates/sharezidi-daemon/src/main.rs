//! ShareZidi Relay Daemon
//!
//! 中继守护进程，负责：
//! - WebSocket 设备接入与消息转发
//! - HTTP 状态接口 (`/health`, `/stats`)
//! - 卡顿恢复与过期设备清理

mod service;

use anyhow::Result;
use clap::Parser;
use sharezidi_core::{LogLevel, RelayConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sharezidi-daemon", version, about = "ShareZidi 实时文件中继服务")]
struct Args {
    /// 配置文件路径 (默认: <config_dir>/sharezidi/relay.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// WebSocket 监听地址，覆盖配置文件
    #[arg(long)]
    ws_addr: Option<String>,
    /// HTTP 状态接口监听地址，覆盖配置文件
    #[arg(long)]
    http_addr: Option<String>,
    /// 输出 debug 日志
    #[arg(short, long)]
    verbose: bool,
    /// 写入默认配置后退出
    #[arg(long)]
    write_default_config: bool,
}

impl Args {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(RelayConfig::config_path)
    }

    fn resolve_config(&self) -> RelayConfig {
        let mut config = RelayConfig::load_from(&self.config_path());
        if let Some(addr) = &self.ws_addr {
            config.ws_addr.clone_from(addr);
        }
        if let Some(addr) = &self.http_addr {
            config.http_addr.clone_from(addr);
        }
        if self.verbose {
            config.log_level = config.log_level.max(LogLevel::Debug);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.write_default_config {
        let path = args.config_path();
        RelayConfig::default().save_to(&path)?;
        println!("默认配置已写入 {}", path.display());
        return Ok(());
    }

    // 桥接 log crate（sharezidi-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let config = args.resolve_config();

    // 初始化日志，RUST_LOG 优先
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.filter_directive())),
        )
        .try_init();

    tracing::info!("ShareZidi relay starting...");

    let shutdown = CancellationToken::new();
    let mut service_handle = tokio::spawn(service::run_service(config, shutdown.clone()));

    // 等待 Ctrl-C 或服务自行退出
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("Failed to listen for ctrl-c: {e}");
            }
            tracing::info!("Shutting down...");
            shutdown.cancel();
        }
        res = &mut service_handle => {
            tracing::error!("Relay service exited: {:?}", res);
            return res?;
        }
    }

    service_handle.await?
}
