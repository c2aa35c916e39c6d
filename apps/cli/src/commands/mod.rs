//! 命令定义和实现

pub mod check;
pub mod drill;
pub mod monitor;
pub mod presets;
pub mod selftest;

pub use check::CheckCommand;
pub use drill::DrillCommand;
pub use monitor::MonitorCommand;
pub use presets::PresetsCommand;
pub use selftest::SelftestCommand;

use canbus_sdk::StatisticsSnapshot;

/// 打印统计（人类可读或 JSON）
pub fn print_statistics(stats: &StatisticsSnapshot, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    println!("  frames sent / received : {} / {}", stats.frames_sent, stats.frames_received);
    println!("  bytes sent / received  : {} / {}", stats.bytes_sent, stats.bytes_received);
    println!(
        "  tx failed / bus errors : {} ({:.1}%) / {}",
        stats.tx_failed,
        stats.tx_failure_rate(),
        stats.bus_errors
    );
    println!(
        "  rx overflow / filtered : {} ({:.1}%) / {} ({:.1}%)",
        stats.rx_overflow,
        stats.overflow_rate(),
        stats.filtered_out,
        stats.filter_rate()
    );
    println!("  queue full events      : {}", stats.queue_full_events);
    println!(
        "  bus-off / recoveries   : {} / {}",
        stats.bus_off_events, stats.recoveries
    );
    println!(
        "  utilization            : {:.2}% of {} bit/s over {} ms",
        stats.utilization_percent, stats.bitrate, stats.uptime_ms
    );
    Ok(())
}
