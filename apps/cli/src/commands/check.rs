//! 配置文件校验

use anyhow::{Context, Result};
use canbus_sdk::BusConfig;
use clap::Args;
use std::path::PathBuf;

/// 配置校验参数
#[derive(Args, Debug)]
pub struct CheckCommand {
    /// TOML 配置文件
    pub config: PathBuf,

    /// 校验通过后打印规范化的配置
    #[arg(long)]
    pub print: bool,
}

impl CheckCommand {
    pub fn execute(&self) -> Result<()> {
        let config = BusConfig::load(&self.config)
            .with_context(|| format!("invalid configuration {}", self.config.display()))?;

        let timing = config.bit_timing()?;
        println!("✅ {} is valid", self.config.display());
        println!(
            "  {} bit/s (brp={}, tseg1={}, tseg2={}, sjw={}, sample point {:.1}%)",
            timing.bitrate(),
            timing.brp,
            timing.tseg1,
            timing.tseg2,
            timing.sjw,
            timing.sample_point_percent()
        );
        println!("  mode: {:?}", config.mode);
        println!(
            "  queues: tx={}, rx={}",
            config.tx_queue_depth, config.rx_queue_depth
        );
        println!("  filters: {} rule(s)", config.filters.len());
        println!("  alerts armed: {:?}", config.alert_mask);
        if let Some(pins) = config.pins {
            println!("  pins: tx={}, rx={}", pins.tx, pins.rx);
        }

        if self.print {
            println!();
            print!("{}", config.to_toml_string()?);
        }
        Ok(())
    }
}
