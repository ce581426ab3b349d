use anyhow::Result;
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "WireDrop 开发任务自动化")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建所有组件 (release)
    Build,
    /// 以接收模式运行 CLI (开发模式)
    Listen {
        /// 日志级别 (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "debug")]
        log_level: String,
        /// 监听地址
        #[arg(short, long, default_value = "127.0.0.1:2431")]
        bind: String,
        /// 保存目录 (默认 /tmp/wiredrop)
        #[arg(short, long, default_value = "/tmp/wiredrop")]
        output: String,
    },
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
        Commands::Listen {
            log_level,
            bind,
            output,
        } => listen(&sh, &log_level, &bind, &output)?,
        Commands::Test => test(&sh)?,
        Commands::Coverage => coverage(&sh)?,
        Commands::Clean => clean(&sh)?,
    }

    Ok(())
}

fn build(sh: &Shell) -> Result<()> {
    println!("🔨 构建所有组件...");
    cmd!(sh, "cargo build --release -p wiredrop-cli").run()?;
    println!("✅ 构建完成");
    println!("   可执行文件: target/release/wiredrop");
    Ok(())
}

fn listen(sh: &Shell, log_level: &str, bind: &str, output: &str) -> Result<()> {
    println!("📥 启动接收模式...");
    println!("   日志级别: {}", log_level);
    println!("   监听地址: {}", bind);
    println!("   保存目录: {}", output);
    println!();
    println!("💡 提示: 在另一个终端运行以下命令发送文件:");
    println!("   cargo run -p wiredrop-cli -- send --peer {} <文件>", bind);
    println!();

    sh.create_dir(output)?;

    let rust_log = format!("{level},wiredrop_core={level}", level = log_level);
    let _env = sh.push_env("RUST_LOG", rust_log);
    cmd!(
        sh,
        "cargo run -p wiredrop-cli -- listen --bind {bind} --output {output}"
    )
    .run()?;
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
        "cargo tarpaulin --packages wiredrop-core --out Html --output-dir target/coverage"
    )
    .run()?;

    println!("✅ 覆盖率报告已生成");
    println!("   HTML 报告: target/coverage/tarpaulin-report.html");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("🧹 清理构建产物...");
    cmd!(sh, "cargo clean").run()?;
    cmd!(sh, "rm -rf target/coverage").run()?;
    println!("✅ 清理完成");
    Ok(())
}
