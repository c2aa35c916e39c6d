//! 总线统计指标
//!
//! 原子计数器，IO 线程和应用线程都可以无锁更新/读取。
//! [`BusMetrics::snapshot`] 一次性读取所有计数器并计算派生指标（总线利用率等）。
//!
//! # 使用示例
//!
//! ```rust
//! use canbus_driver::metrics::BusMetrics;
//! use std::sync::atomic::Ordering;
//! use std::time::Duration;
//!
//! let metrics = BusMetrics::new();
//! metrics.frames_sent.fetch_add(10, Ordering::Relaxed);
//!
//! let snapshot = metrics.snapshot(Duration::from_secs(1), 500_000);
//! assert_eq!(snapshot.frames_sent, 10);
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 总线实时指标
///
/// 计数器单调递增，只有 [`BusMetrics::reset`] 会清零。
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// 发送成功的帧数
    pub frames_sent: AtomicU64,
    /// 通过过滤器并入队的帧数
    pub frames_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    /// 硬件拒绝发送请求的次数
    pub tx_errors: AtomicU64,
    /// 发送完成但失败（无应答、总线错误）的次数
    pub tx_failed: AtomicU64,
    /// 接收方向的总线错误次数
    pub rx_errors: AtomicU64,
    pub bus_errors: AtomicU64,
    pub arbitration_lost: AtomicU64,

    /// 进入 ErrorWarning 的次数（从更低等级升级）
    pub error_warning_events: AtomicU64,
    /// 进入 ErrorPassive 的次数（从更低等级升级）
    pub error_passive_events: AtomicU64,
    pub bus_off_events: AtomicU64,

    /// `send()` 发现发送队列满的次数
    pub queue_full_events: AtomicU64,
    /// 接收队列满时丢弃最旧帧的次数
    pub rx_overflow: AtomicU64,
    /// 未命中任何过滤规则的帧数
    pub filtered_out: AtomicU64,
    /// `stop()` 时仍在队列中被丢弃的帧数
    pub dropped_on_stop: AtomicU64,

    pub recoveries: AtomicU64,
    pub recovery_failures: AtomicU64,

    /// 队列最高水位
    pub tx_queue_peak: AtomicU64,
    pub rx_queue_peak: AtomicU64,

    /// 收发帧占用的总线位数（用于计算利用率）
    pub bus_bits: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_tx_queue_depth(&self, depth: usize) {
        self.tx_queue_peak.fetch_max(depth as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rx_queue_depth(&self, depth: usize) {
        self.rx_queue_peak.fetch_max(depth as u64, Ordering::Relaxed);
    }

    /// 获取指标快照
    ///
    /// 不同计数器之间可能存在微小的时间差（各自 `Relaxed` 读取）。
    ///
    /// # 参数
    ///
    /// - `uptime`: 累计运行时间
    /// - `bitrate`: 当前配置的位速率（bit/s），为 0 时利用率为 0
    pub fn snapshot(&self, uptime: Duration, bitrate: u32) -> StatisticsSnapshot {
        let bus_bits = self.bus_bits.load(Ordering::Relaxed);
        let capacity_bits = bitrate as f64 * uptime.as_secs_f64();
        let utilization_percent = if capacity_bits > 0.0 {
            (bus_bits as f64 / capacity_bits * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        StatisticsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            tx_failed: self.tx_failed.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            bus_errors: self.bus_errors.load(Ordering::Relaxed),
            arbitration_lost: self.arbitration_lost.load(Ordering::Relaxed),
            error_warning_events: self.error_warning_events.load(Ordering::Relaxed),
            error_passive_events: self.error_passive_events.load(Ordering::Relaxed),
            bus_off_events: self.bus_off_events.load(Ordering::Relaxed),
            queue_full_events: self.queue_full_events.load(Ordering::Relaxed),
            rx_overflow: self.rx_overflow.load(Ordering::Relaxed),
            filtered_out: self.filtered_out.load(Ordering::Relaxed),
            dropped_on_stop: self.dropped_on_stop.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            recovery_failures: self.recovery_failures.load(Ordering::Relaxed),
            tx_queue_peak: self.tx_queue_peak.load(Ordering::Relaxed),
            rx_queue_peak: self.rx_queue_peak.load(Ordering::Relaxed),
            bus_bits,
            uptime_ms: uptime.as_millis() as u64,
            bitrate,
            utilization_percent,
        }
    }

    /// 清零所有计数器
    pub fn reset(&self) {
        for counter in [
            &self.frames_sent,
            &self.frames_received,
            &self.bytes_sent,
            &self.bytes_received,
            &self.tx_errors,
            &self.tx_failed,
            &self.rx_errors,
            &self.bus_errors,
            &self.arbitration_lost,
            &self.error_warning_events,
            &self.error_passive_events,
            &self.bus_off_events,
            &self.queue_full_events,
            &self.rx_overflow,
            &self.filtered_out,
            &self.dropped_on_stop,
            &self.recoveries,
            &self.recovery_failures,
            &self.tx_queue_peak,
            &self.rx_queue_peak,
            &self.bus_bits,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// 统计快照（不可变，调用方持有）
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tx_errors: u64,
    pub tx_failed: u64,
    pub rx_errors: u64,
    pub bus_errors: u64,
    pub arbitration_lost: u64,
    pub error_warning_events: u64,
    pub error_passive_events: u64,
    pub bus_off_events: u64,
    pub queue_full_events: u64,
    pub rx_overflow: u64,
    pub filtered_out: u64,
    pub dropped_on_stop: u64,
    pub recoveries: u64,
    pub recovery_failures: u64,
    pub tx_queue_peak: u64,
    pub rx_queue_peak: u64,
    pub bus_bits: u64,
    /// 累计运行时间（毫秒）
    pub uptime_ms: u64,
    pub bitrate: u32,
    /// 总线利用率（0.0 ~ 100.0）
    pub utilization_percent: f64,
}

impl StatisticsSnapshot {
    pub fn uptime(&self) -> Duration {
        Duration::from_millis(self.uptime_ms)
    }

    /// 发送失败率（百分比）
    ///
    /// 没有任何发送完成时返回 0.0。
    pub fn tx_failure_rate(&self) -> f64 {
        let total = self.frames_sent + self.tx_failed;
        if total == 0 {
            return 0.0;
        }
        self.tx_failed as f64 / total as f64 * 100.0
    }

    /// 过滤掉的帧占全部接收帧的百分比
    pub fn filter_rate(&self) -> f64 {
        let total = self.frames_received + self.filtered_out;
        if total == 0 {
            return 0.0;
        }
        self.filtered_out as f64 / total as f64 * 100.0
    }

    /// 接收溢出率（百分比）
    pub fn overflow_rate(&self) -> f64 {
        if self.frames_received == 0 {
            return 0.0;
        }
        self.rx_overflow as f64 / self.frames_received as f64 * 100.0
    }
}

/// 累计运行时间
///
/// 每次 `start()` 开始计时，`stop()` 时把本次运行时间累加进去。
#[derive(Debug, Default)]
pub struct UptimeClock {
    inner: Mutex<UptimeInner>,
}

#[derive(Debug, Default)]
struct UptimeInner {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl UptimeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if inner.running_since.is_none() {
            inner.running_since = Some(Instant::now());
        }
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if let Some(since) = inner.running_since.take() {
            inner.accumulated += since.elapsed();
        }
    }

    pub fn elapsed(&self) -> Duration {
        let inner = self.inner.lock();
        inner.accumulated + inner.running_since.map_or(Duration::ZERO, |s| s.elapsed())
    }

    /// 清零（正在运行时从现在重新计时）
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.accumulated = Duration::ZERO;
        if inner.running_since.is_some() {
            inner.running_since = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_metrics_default() {
        let snapshot = BusMetrics::new().snapshot(Duration::ZERO, 500_000);
        assert_eq!(snapshot.frames_sent, 0);
        assert_eq!(snapshot.utilization_percent, 0.0);
        assert_eq!(snapshot.tx_failure_rate(), 0.0);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = BusMetrics::new();
        metrics.frames_received.fetch_add(100, Ordering::Relaxed);
        metrics.rx_overflow.fetch_add(3, Ordering::Relaxed);
        metrics.record_rx_queue_depth(7);

        metrics.reset();
        let snapshot = metrics.snapshot(Duration::from_secs(1), 125_000);
        assert_eq!(snapshot.frames_received, 0);
        assert_eq!(snapshot.rx_overflow, 0);
        assert_eq!(snapshot.rx_queue_peak, 0);
    }

    #[test]
    fn test_queue_peak_is_high_water_mark() {
        let metrics = BusMetrics::new();
        metrics.record_tx_queue_depth(3);
        metrics.record_tx_queue_depth(9);
        metrics.record_tx_queue_depth(2);
        assert_eq!(metrics.tx_queue_peak.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn test_utilization() {
        let metrics = BusMetrics::new();
        metrics.bus_bits.store(250_000, Ordering::Relaxed);

        let snapshot = metrics.snapshot(Duration::from_secs(1), 500_000);
        assert!((snapshot.utilization_percent - 50.0).abs() < 1e-9);

        // 不超过 100%
        metrics.bus_bits.store(10_000_000, Ordering::Relaxed);
        let snapshot = metrics.snapshot(Duration::from_secs(1), 500_000);
        assert_eq!(snapshot.utilization_percent, 100.0);

        // bitrate 为 0 时不除零
        let snapshot = metrics.snapshot(Duration::from_secs(1), 0);
        assert_eq!(snapshot.utilization_percent, 0.0);
    }

    #[test]
    fn test_rates() {
        let metrics = BusMetrics::new();
        metrics.frames_sent.store(90, Ordering::Relaxed);
        metrics.tx_failed.store(10, Ordering::Relaxed);
        metrics.frames_received.store(75, Ordering::Relaxed);
        metrics.filtered_out.store(25, Ordering::Relaxed);
        metrics.rx_overflow.store(15, Ordering::Relaxed);

        let snapshot = metrics.snapshot(Duration::from_secs(1), 500_000);
        assert!((snapshot.tx_failure_rate() - 10.0).abs() < 1e-9);
        assert!((snapshot.filter_rate() - 25.0).abs() < 1e-9);
        assert!((snapshot.overflow_rate() - 20.0).abs() < 1e-9);

        // 没有接收时不除零
        assert_eq!(BusMetrics::new().snapshot(Duration::ZERO, 0).overflow_rate(), 0.0);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let metrics = BusMetrics::new();
        metrics.frames_sent.store(3, Ordering::Relaxed);
        metrics.dropped_on_stop.store(2, Ordering::Relaxed);

        let snapshot = metrics.snapshot(Duration::from_millis(1500), 250_000);
        let value = serde_json::to_value(snapshot).unwrap();
        assert_eq!(value["frames_sent"], 3);
        assert_eq!(value["dropped_on_stop"], 2);
        assert_eq!(value["uptime_ms"], 1500);
        assert_eq!(value["bitrate"], 250_000);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(BusMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.frames_sent.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_uptime_accumulates_across_runs() {
        let clock = UptimeClock::new();
        assert_eq!(clock.elapsed(), Duration::ZERO);

        clock.resume();
        thread::sleep(Duration::from_millis(10));
        clock.pause();
        let first = clock.elapsed();
        assert!(first >= Duration::from_millis(10));

        // 停止期间不计时
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.elapsed(), first);

        clock.resume();
        thread::sleep(Duration::from_millis(5));
        assert!(clock.elapsed() > first);

        clock.reset();
        assert!(clock.elapsed() < first);
    }
}
