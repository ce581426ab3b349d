//! WireDrop CLI
//!
//! 命令行前端：
//! - `listen`: 作为 Host 等待对端连接并把收到的文件写入下载目录
//! - `send`: 作为 App 连接对端并发送文件
//! - `config`: 查看或初始化设置

mod listen;
mod send;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wiredrop_core::AppSettings;

#[derive(Parser)]
#[command(name = "wiredrop", version, about = "WireDrop - 点对点文件传输工具")]
struct Cli {
    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 等待对端连接并接收文件
    Listen {
        /// 监听地址 (默认使用设置中的 listen_addr)
        #[arg(short, long)]
        bind: Option<String>,
        /// 保存目录 (默认使用设置中的 download_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 发送文件
    Send {
        /// 对端地址，例如 192.168.1.10:2431
        #[arg(short, long)]
        peer: String,
        /// 要发送的文件路径
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// 等待连接的超时时间 (秒)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// 传输过程中状态无变化的最长等待时间 (秒)
        #[arg(long, default_value = "30")]
        idle_timeout: u64,
    },
    /// 查看当前设置
    Config {
        /// 写入默认设置
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = AppSettings::load();

    init_logging(cli.verbose || settings.verbose);

    match cli.command {
        Commands::Listen { bind, output } => listen::run(settings, bind, output).await,
        Commands::Send {
            peer,
            files,
            timeout,
            idle_timeout,
        } => send::run(settings, &peer, files, timeout, idle_timeout).await,
        Commands::Config { init } => config(settings, init),
    }
}

fn init_logging(verbose: bool) {
    // 桥接 log crate（wiredrop-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = if verbose {
        "debug"
    } else {
        "info,wiredrop_core=debug"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();
}

fn config(settings: AppSettings, init: bool) -> Result<()> {
    let path = AppSettings::config_path();

    let settings = if init {
        let defaults = AppSettings::default();
        defaults.save_to(&path)?;
        println!("✅ 已写入默认设置: {}", path.display());
        defaults
    } else {
        settings
    };

    println!("⚙️  设置文件: {}", path.display());
    println!("   设备名称: {}", settings.device_name);
    println!("   设备类型: {}", settings.device_kind.name());
    println!("   监听地址: {}", settings.listen_addr);
    println!("   下载目录: {}", settings.download_dir.display());
    println!(
        "   空闲超时: {} ms (容差 {} ms)",
        settings.watchdog_ms, settings.watchdog_leeway_ms
    );
    println!("   分片大小: {} 字节", settings.fragment_size);
    println!("   详细日志: {}", settings.verbose);
    Ok(())
}
