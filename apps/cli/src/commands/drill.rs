//! Bus-Off 演练
//!
//! 向虚拟控制器注入发送错误，逐级经过 ErrorWarning / ErrorPassive 进入 Bus-Off，
//! 然后执行恢复，打印沿途的状态迁移与告警。

use anyhow::{Result, bail};
use canbus_sdk::hal::{BusErrorKind, MemorySink};
use canbus_sdk::prelude::*;
use clap::Args;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 演练参数
#[derive(Args, Debug)]
pub struct DrillCommand {
    /// 每一步注入的发送错误数（每次 TEC +8）
    #[arg(long, default_value_t = 4)]
    pub step: usize,

    /// 第一次恢复故意失败（复位失败）
    #[arg(long)]
    pub fail_first_recovery: bool,
}

impl DrillCommand {
    pub fn execute(&self) -> Result<()> {
        if self.step == 0 {
            bail!("--step must be at least 1");
        }

        let sink = Arc::new(MemorySink::new());
        let bus = VirtualBus::new();
        let node = bus.attach();
        let faults = node.fault_injector();
        let controller = BusControllerBuilder::new()
            .hardware(node)
            .diagnostic_sink(sink.clone())
            .config(BusConfig {
                alert_mask: AlertFlags::ALL_ERRORS
                    | AlertFlags::ABOVE_ERR_WARN
                    | AlertFlags::BUS_RECOVERED
                    | AlertFlags::RECOVERY_IN_PROGRESS,
                ..BusConfig::with_mode(OperatingMode::Loopback)
            })
            .build()?;
        controller.start()?;
        print_messages(&sink);

        let mut injected = 0;
        while controller.state() != BusState::BusOff {
            faults.inject_bus_errors(BusErrorKind::Transmit, self.step);
            injected += self.step;
            settle(&controller, injected);

            let diag = controller.diagnostics();
            println!(
                "  after {:>3} tx error(s): {:<14} tec={:<3} rec={}",
                injected,
                diag.state.to_string(),
                diag.tec,
                diag.rec
            );
            print_messages(&sink);
            if injected > 1024 {
                bail!("controller never reached bus-off");
            }
        }
        println!("  alerts: {:?}", controller.read_alerts(Duration::ZERO).unwrap_or_default());

        if self.fail_first_recovery {
            faults.fail_resets(1);
            match controller.recover_from_error() {
                Err(e) => println!("⚠️  recovery attempt failed as requested: {}", e),
                Ok(()) => bail!("recovery unexpectedly succeeded"),
            }
            print_messages(&sink);
        }

        controller.recover_from_error()?;
        print_messages(&sink);
        println!("  alerts: {:?}", controller.read_alerts(Duration::ZERO).unwrap_or_default());

        let diag = controller.diagnostics();
        println!(
            "✅ recovered: state={}, tec={}, rec={}, healthy={}",
            diag.state, diag.tec, diag.rec, diag.healthy
        );

        let stats = controller.statistics();
        controller.stop()?;
        super::print_statistics(&stats, false)
    }
}

/// 等待 IO 线程处理完注入的错误
fn settle(controller: &BusController, injected: usize) {
    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        if controller.statistics().bus_errors >= injected as u64 {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn print_messages(sink: &MemorySink) {
    for (level, message) in sink.drain() {
        println!("  [{:?}] {}", level, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drill_runs() {
        DrillCommand {
            step: 8,
            fail_first_recovery: true,
        }
        .execute()
        .unwrap();
    }

    #[test]
    fn test_zero_step_rejected() {
        let cmd = DrillCommand {
            step: 0,
            fail_first_recovery: false,
        };
        assert!(cmd.execute().is_err());
    }
}
