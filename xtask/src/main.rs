use anyhow::Result;
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

const SERVICE: &str = "sharezidi-relay.service";

#[derive(Parser)]
#[command(name = "xtask", about = "ShareZidi 开发任务自动化")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建中继守护进程 (release)
    Build,
    /// 运行守护进程 (开发模式)
    Dev {
        /// 日志级别 (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "debug")]
        log_level: String,
    },
    /// 安装 systemd 服务
    Install,
    /// 卸载 systemd 服务
    Uninstall,
    /// 打包发布 (tar.gz)
    Dist,
    /// 运行测试
    Test,
    /// 运行测试并生成覆盖率报告
    Coverage,
    /// 清理构建产物
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // 确保在项目根目录执行
    let project_root = match std::env::var("CARGO_MANIFEST_DIR")
        .map(std::path::PathBuf::from)
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
    {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    sh.change_dir(&project_root);

    match cli.command {
        Commands::Build => build(&sh)?,
        Commands::Dev { log_level } => dev(&sh, &log_level)?,
        Commands::Install => install(&sh)?,
        Commands::Uninstall => uninstall(&sh)?,
        Commands::Dist => dist(&sh)?,
        Commands::Test => test(&sh)?,
        Commands::Coverage => coverage(&sh)?,
        Commands::Clean => clean(&sh)?,
    }

    Ok(())
}

fn build(sh: &Shell) -> Result<()> {
    println!("🔨 构建中继...");
    cmd!(sh, "cargo build --release -p sharezidi-daemon").run()?;
    println!("✅ 构建完成");
    Ok(())
}

fn dev(sh: &Shell, log_level: &str) -> Result<()> {
    println!("🚀 启动开发模式中继 (ws://127.0.0.1:8003/ws)...");
    let rust_log = format!("{log_level},sharezidi_core={log_level}");
    cmd!(
        sh,
        "cargo run -p sharezidi-daemon -- --ws-addr 127.0.0.1:8003 --http-addr 127.0.0.1:8004"
    )
    .env("RUST_LOG", rust_log)
    .run()?;
    Ok(())
}

fn install(sh: &Shell) -> Result<()> {
    println!("📦 安装 ShareZidi 中继服务...");

    build(sh)?;

    // 先停止已运行的服务（如果存在）
    println!("⏹️  停止现有服务...");
    let _ = cmd!(sh, "sudo systemctl stop {SERVICE}").run();

    std::thread::sleep(std::time::Duration::from_millis(500));

    println!("📋 复制二进制文件...");
    cmd!(sh, "sudo cp target/release/sharezidi-daemon /usr/local/bin/").run()?;
    cmd!(sh, "sudo cp assets/{SERVICE} /etc/systemd/system/").run()?;

    cmd!(sh, "sudo systemctl daemon-reload").run()?;
    cmd!(sh, "sudo systemctl enable --now {SERVICE}").run()?;

    println!("✅ 服务安装完成");
    println!("   使用 'systemctl status sharezidi-relay' 查看服务状态");
    println!("   使用 'curl http://127.0.0.1:8004/health' 检查中继状态");
    Ok(())
}

fn uninstall(sh: &Shell) -> Result<()> {
    println!("🗑️  卸载 ShareZidi 中继服务...");

    let _ = cmd!(sh, "sudo systemctl stop {SERVICE}").run();
    let _ = cmd!(sh, "sudo systemctl disable {SERVICE}").run();

    let _ = cmd!(sh, "sudo rm /etc/systemd/system/{SERVICE}").run();
    let _ = cmd!(sh, "sudo rm /usr/local/bin/sharezidi-daemon").run();

    cmd!(sh, "sudo systemctl daemon-reload").run()?;

    println!("✅ 卸载完成");
    Ok(())
}

fn dist(sh: &Shell) -> Result<()> {
    println!("📦 打包发布...");

    build(sh)?;

    let version = env!("CARGO_PKG_VERSION");
    let dist_name = format!("sharezidi-relay-{version}-linux-x86_64");

    cmd!(sh, "mkdir -p dist/{dist_name}").run()?;
    cmd!(sh, "cp target/release/sharezidi-daemon dist/{dist_name}/").run()?;
    cmd!(sh, "cp assets/{SERVICE} dist/{dist_name}/").run()?;

    sh.change_dir("dist");
    cmd!(sh, "tar -czvf {dist_name}.tar.gz {dist_name}").run()?;

    println!("✅ 打包完成: dist/{dist_name}.tar.gz");
    Ok(())
}

fn test(sh: &Shell) -> Result<()> {
    println!("🧪 运行测试...");
    cmd!(sh, "cargo test --workspace").run()?;
    println!("✅ 测试完成");
    Ok(())
}

fn coverage(sh: &Shell) -> Result<()> {
    println!("📊 运行测试覆盖率分析...");

    // 检查 cargo-tarpaulin 是否安装
    if cmd!(sh, "cargo tarpaulin --version").run().is_err() {
        println!("📦 安装 cargo-tarpaulin...");
        cmd!(sh, "cargo install cargo-tarpaulin").run()?;
    }

    println!("🔍 分析中...");
    cmd!(
        sh,
        "cargo tarpaulin --packages sharezidi-core --out Html --output-dir target/coverage"
    )
    .run()?;

    println!("✅ 覆盖率报告已生成");
    println!("   HTML 报告: target/coverage/tarpaulin-report.html");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("🧹 清理构建产物...");
    cmd!(sh, "cargo clean").run()?;
    cmd!(sh, "rm -rf dist").run()?;
    println!("✅ 清理完成");
    Ok(())
}
