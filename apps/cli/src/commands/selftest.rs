//! 回环自检
//!
//! 在虚拟总线上以回环模式启动控制器，发送随机帧并逐帧核对回显。

use anyhow::{Context, Result, bail};
use canbus_sdk::prelude::*;
use clap::Args;
use rand::Rng;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// 自检参数
#[derive(Args, Debug)]
pub struct SelftestCommand {
    /// 可选的 TOML 配置（模式会被强制改为 loopback）
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 发送帧数
    #[arg(short = 'n', long, default_value_t = 100)]
    pub count: usize,

    /// 以 JSON 输出统计
    #[arg(long)]
    pub json: bool,
}

impl SelftestCommand {
    pub fn execute(&self) -> Result<()> {
        let mut config = match &self.config {
            Some(path) => BusConfig::load(path)
                .with_context(|| format!("invalid configuration {}", path.display()))?,
            None => BusConfig::default(),
        };
        config.mode = OperatingMode::Loopback;
        // 自检需要看到每一帧
        config.filters.clear();

        let bus = VirtualBus::new();
        let controller = BusControllerBuilder::new()
            .hardware(bus.attach())
            .config(config)
            .build()?;
        controller.start()?;

        let mut rng = rand::thread_rng();
        let begin = Instant::now();
        for i in 0..self.count {
            let frame = random_frame(&mut rng)?;
            controller.send(frame, Duration::from_millis(100))?;
            let echoed = controller
                .receive(Duration::from_secs(1))
                .with_context(|| format!("frame #{} ({}) was not echoed", i, frame))?;
            if !echoed.same_content(&frame) {
                bail!("frame #{} mismatch: sent {}, received {}", i, frame, echoed);
            }
        }
        let elapsed = begin.elapsed();
        let stats = controller.statistics();
        controller.stop()?;

        if !self.json {
            println!(
                "✅ {} frame(s) echoed in {:.1} ms",
                self.count,
                elapsed.as_secs_f64() * 1000.0
            );
        }
        super::print_statistics(&stats, self.json)
    }
}

fn random_frame(rng: &mut impl Rng) -> Result<CanFrame> {
    let len = rng.gen_range(0..=8);
    let mut data = [0u8; 8];
    rng.fill(&mut data[..len]);
    let frame = if rng.gen_bool(0.5) {
        CanFrame::new_standard(rng.gen_range(0..=0x7FF), &data[..len])?
    } else {
        CanFrame::new_extended(rng.gen_range(0..=0x1FFF_FFFF), &data[..len])?
    };
    Ok(frame)
}
