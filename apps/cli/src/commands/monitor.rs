//! 虚拟总线流量监控
//!
//! 两个虚拟节点挂在同一条总线上：`talker` 按固定速率发送随机帧，
//! `listener` 接收并记录。每秒打印一次告警和统计，直到 Ctrl+C 或超时。

use anyhow::{Result, bail};
use canbus_sdk::prelude::*;
use clap::Args;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 监控参数
#[derive(Args, Debug)]
pub struct MonitorCommand {
    /// 运行时长（秒），0 表示直到 Ctrl+C
    #[arg(short, long, default_value_t = 0)]
    pub seconds: u64,

    /// 发送速率（帧/秒）
    #[arg(short, long, default_value_t = 200)]
    pub rate: u32,

    /// 波特率
    #[arg(short, long, default_value_t = 500_000)]
    pub bitrate: u32,

    /// 以 JSON 输出统计
    #[arg(long)]
    pub json: bool,
}

impl MonitorCommand {
    pub fn execute(&self) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        {
            let running = running.clone();
            ctrlc::set_handler(move || {
                eprintln!("\nReceived interrupt signal. Shutting down...");
                running.store(false, Ordering::Release);
            })?;
        }
        self.run(running)
    }

    fn run(&self, running: Arc<AtomicBool>) -> Result<()> {
        if self.rate == 0 {
            bail!("--rate must be at least 1");
        }
        let config = BusConfig {
            timing: TimingSpec::Preset(BaudRate::from_bitrate(self.bitrate)?),
            ..BusConfig::default()
        };

        let bus = VirtualBus::new();
        let talker = Arc::new(
            BusControllerBuilder::new()
                .hardware(bus.attach())
                .config(config.clone())
                .build()?,
        );
        let listener = Arc::new(
            BusControllerBuilder::new()
                .hardware(bus.attach())
                .config(BusConfig {
                    rx_queue_depth: canbus_sdk::driver::MAX_QUEUE_DEPTH,
                    ..config
                })
                .build()?,
        );
        listener.start()?;
        talker.start()?;
        println!(
            "📡 monitoring {} bit/s virtual bus, {} frame(s)/s (Ctrl+C to stop)",
            self.bitrate, self.rate
        );

        let sender = {
            let talker = talker.clone();
            let running = running.clone();
            let period = Duration::from_secs(1) / self.rate;
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut seq: u64 = 0;
                while running.load(Ordering::Acquire) {
                    let id: u16 = rng.gen_range(0x100..=0x1FF);
                    let frame = match CanFrame::new_standard(id, &seq.to_le_bytes()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("failed to build frame: {}", e);
                            break;
                        },
                    };
                    match talker.send(frame, Duration::from_millis(10)) {
                        Ok(()) => seq += 1,
                        Err(DriverError::NotRunning) => break,
                        Err(e) => debug!("send failed: {}", e),
                    }
                    spin_sleep::sleep(period);
                }
            })
        };

        let drainer = {
            let listener = listener.clone();
            thread::spawn(move || {
                let mut received = 0u64;
                loop {
                    match listener.receive_batch(32, Duration::from_millis(50)) {
                        Ok(frames) => received += frames.len() as u64,
                        Err(DriverError::Timeout) => {},
                        Err(_) => break,
                    }
                }
                received
            })
        };

        let begin = Instant::now();
        let deadline = (self.seconds > 0).then(|| begin + Duration::from_secs(self.seconds));
        while running.load(Ordering::Acquire) && deadline.is_none_or(|d| Instant::now() < d) {
            match listener.read_alerts(Duration::from_secs(1)) {
                Ok(alerts) => println!("  [{:>6.1}s] alerts: {:?}", begin.elapsed().as_secs_f64(), alerts),
                Err(DriverError::Timeout) => {},
                Err(e) => bail!("listener stopped unexpectedly: {}", e),
            }
            let stats = listener.statistics();
            let diag = talker.diagnostics();
            println!(
                "  [{:>6.1}s] rx={} load={:.2}% talker: {} tec={}",
                begin.elapsed().as_secs_f64(),
                stats.frames_received,
                stats.utilization_percent,
                diag.state,
                diag.tec
            );
        }

        running.store(false, Ordering::Release);
        let _ = sender.join();
        talker.stop()?;
        listener.stop()?;
        let received = drainer.join().unwrap_or_default();

        println!("✅ listener consumed {} frame(s)", received);
        println!("talker:");
        super::print_statistics(&talker.statistics(), self.json)?;
        println!("listener:");
        super::print_statistics(&listener.statistics(), self.json)
    }
}
