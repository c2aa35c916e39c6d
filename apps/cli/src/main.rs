//! # CAN Bus CLI
//!
//! CAN 总线控制器核心的命令行工具。
//!
//! ```bash
//! # 列出波特率预设
//! canbus-cli presets
//!
//! # 校验配置文件
//! canbus-cli check bus.toml
//!
//! # 虚拟总线回环自检
//! canbus-cli selftest --count 1000
//!
//! # Bus-Off 演练
//! canbus-cli drill
//!
//! # 两个虚拟节点互发，实时打印告警和统计
//! canbus-cli --log-level debug monitor --seconds 10
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{CheckCommand, DrillCommand, MonitorCommand, PresetsCommand, SelftestCommand};

/// CAN Bus CLI - 总线控制器命令行工具
#[derive(Parser, Debug)]
#[command(name = "canbus-cli")]
#[command(about = "Command-line interface for the CAN bus controller core", long_about = None)]
#[command(version)]
struct Cli {
    /// 默认日志级别（RUST_LOG 优先）
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 列出波特率预设及其位时序
    Presets(PresetsCommand),

    /// 加载并校验配置文件
    Check(CheckCommand),

    /// 虚拟总线回环自检
    Selftest(SelftestCommand),

    /// Bus-Off 进入与恢复演练
    Drill(DrillCommand),

    /// 两个虚拟节点互发帧，打印告警和统计
    Monitor(MonitorCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    canbus_sdk::init_logger_with_level(&cli.log_level);

    match cli.command {
        Commands::Presets(cmd) => cmd.execute(),
        Commands::Check(cmd) => cmd.execute(),
        Commands::Selftest(cmd) => cmd.execute(),
        Commands::Drill(cmd) => cmd.execute(),
        Commands::Monitor(cmd) => cmd.execute(),
    }
}
