//! IO 循环（完成事件线程）
//!
//! 每个运行中的控制器有一个 IO 线程，独占 [`CanHardware`]：
//!
//! 1. 处理控制器发来的命令（更新过滤器、Bus-Off 恢复、关闭）
//! 2. 发送邮箱空闲且状态允许时，从发送队列取帧提交给硬件
//! 3. 轮询硬件事件：接收帧过滤后入接收队列，发送完成/错误事件驱动状态机
//!
//! IO 线程是接收队列唯一的生产者、发送队列唯一的消费者。

use crate::alerts::AlertFlags;
use crate::context::BusContext;
use crate::diagnostics::FaultKind;
use crate::queue::RunQueues;
use canbus_hal::{BusErrorKind, CanHardware, HalError, HardwareEvent, OperatingMode};
use canbus_protocol::FilterTable;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// IO 循环配置
///
/// # Example
///
/// ```
/// use canbus_driver::pipeline::IoLoopConfig;
/// use std::time::Duration;
///
/// let config = IoLoopConfig {
///     poll_interval: Duration::from_micros(500),
///     ..IoLoopConfig::default()
/// };
/// assert_eq!(config.max_events_per_cycle, 64);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLoopConfig {
    /// 每轮等待硬件事件的最长时间
    pub poll_interval: Duration,
    /// 每轮最多处理的事件数（之后回到命令/发送处理）
    pub max_events_per_cycle: usize,
}

impl Default for IoLoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            max_events_per_cycle: 64,
        }
    }
}

/// 发给 IO 线程的命令
#[derive(Debug)]
pub enum IoCommand {
    /// 下发新的硬件过滤器；成功后由控制器替换软件过滤表
    ApplyFilters {
        table: Arc<FilterTable>,
        reply: Sender<Result<(), HalError>>,
    },
    /// Bus-Off 恢复：复位控制器、重新下发过滤器、等待总线静默
    Recover {
        quiet: Duration,
        reply: Sender<Result<(), String>>,
    },
    /// 等待在途发送完成（最多 `drain_deadline`）后停止硬件并退出
    Shutdown { drain_deadline: Duration },
}

/// IO 线程主循环
///
/// 收到 `Shutdown` 或命令通道断开时退出，并把硬件交还给调用方。
pub fn io_loop(
    hw: Box<dyn CanHardware>,
    ctx: Arc<BusContext>,
    queues: RunQueues,
    commands: Receiver<IoCommand>,
    config: IoLoopConfig,
) -> Box<dyn CanHardware> {
    // 设置线程优先级（可选 feature）
    #[cfg(feature = "realtime")]
    {
        use thread_priority::*;

        match set_current_thread_priority(ThreadPriority::Max) {
            Ok(_) => {
                info!("CAN IO thread priority set to MAX (realtime)");
            },
            Err(e) => {
                warn!(
                    "Failed to set CAN IO thread priority: {}. \
                    On Linux, you may need to run with CAP_SYS_NICE or use rtkit.",
                    e
                );
            },
        }
    }

    let loopback = ctx.profile().mode == OperatingMode::Loopback;
    let mut worker = IoWorker {
        hw,
        ctx,
        queues,
        config,
        loopback,
        hw_error_streak: 0,
    };
    debug!("CAN IO thread started on {}", worker.hw.name());

    loop {
        match commands.try_recv() {
            Ok(IoCommand::Shutdown { drain_deadline }) => {
                worker.shutdown(drain_deadline);
                break;
            },
            Ok(IoCommand::ApplyFilters { table, reply }) => {
                let result = worker.hw.apply_filters(&table);
                if let Err(e) = &result {
                    warn!("Failed to apply hardware filters: {}", e);
                    worker.restore_filters();
                }
                let _ = reply.send(result);
            },
            Ok(IoCommand::Recover { quiet, reply }) => {
                let result = worker.recover(quiet);
                let _ = reply.send(result);
            },
            Err(TryRecvError::Empty) => {},
            Err(TryRecvError::Disconnected) => {
                warn!("CAN IO command channel disconnected, shutting down");
                worker.shutdown(Duration::ZERO);
                break;
            },
        }

        worker.pump_tx();
        worker.poll_events();
    }

    debug!("CAN IO thread exiting");
    worker.hw
}

/// IO 线程的工作状态（避免在每个函数间传递一长串参数）
struct IoWorker {
    hw: Box<dyn CanHardware>,
    ctx: Arc<BusContext>,
    queues: RunQueues,
    config: IoLoopConfig,
    /// 回环模式下每帧既产生发送完成又产生回显，总线占用只按回显计一次
    loopback: bool,
    /// 连续硬件错误次数（只记录第一次的警告日志）
    hw_error_streak: u32,
}

impl IoWorker {
    /// 把硬件过滤器恢复为当前生效的软件过滤表
    fn restore_filters(&mut self) {
        let current = self.ctx.filters.load_full();
        if let Err(e) = self.hw.apply_filters(&current) {
            error!("Failed to restore hardware filters: {}", e);
            self.ctx
                .report_fault(FaultKind::Hardware, &format!("restore filters: {}", e));
        }
    }

    /// 邮箱空闲时提交发送队列中的帧
    fn pump_tx(&mut self) {
        while self.ctx.state.load().can_transmit() && self.hw.tx_ready() {
            let Some(frame) = self.queues.tx.try_pop() else {
                break;
            };
            match self.hw.transmit(&frame) {
                Ok(()) => {
                    trace!("tx submit {}", frame);
                },
                Err(e) => {
                    self.ctx.metrics.tx_errors.fetch_add(1, Ordering::Relaxed);
                    self.ctx.report_fault(FaultKind::Hardware, &format!("transmit {}: {}", frame, e));
                    warn!("Hardware rejected transmit of {}: {}", frame, e);
                    self.ctx.raise_alerts(AlertFlags::TX_FAILED);
                },
            }
        }
    }

    /// 等待一个事件，然后非阻塞地取走后续事件
    fn poll_events(&mut self) {
        let mut timeout = self.config.poll_interval;
        for _ in 0..self.config.max_events_per_cycle {
            match self.hw.poll_event(timeout) {
                Ok(Some(event)) => {
                    self.hw_error_streak = 0;
                    self.handle_event(event);
                    timeout = Duration::ZERO;
                },
                Ok(None) => break,
                Err(e) => {
                    self.on_hardware_error(e);
                    break;
                },
            }
        }
    }

    fn on_hardware_error(&mut self, e: HalError) {
        self.hw_error_streak = self.hw_error_streak.saturating_add(1);
        if self.hw_error_streak == 1 {
            error!("CAN hardware error: {}", e);
            self.ctx.report_fault(FaultKind::Hardware, &e.to_string());
        } else {
            trace!("CAN hardware error (repeated x{}): {}", self.hw_error_streak, e);
            self.ctx.health.record_fault(FaultKind::Hardware);
        }
        // 避免硬件持续报错时空转
        spin_sleep::sleep(self.config.poll_interval);
    }

    fn handle_event(&mut self, event: HardwareEvent) {
        let ctx = &self.ctx;
        match event {
            HardwareEvent::FrameReceived(frame) => {
                ctx.metrics.bus_bits.fetch_add(u64::from(frame.bit_length()), Ordering::Relaxed);
                ctx.update_state(|m| m.record_rx_success());
                ctx.health.record_success();

                if !ctx.filters.load().accepts(&frame) {
                    ctx.metrics.filtered_out.fetch_add(1, Ordering::Relaxed);
                    trace!("rx {} filtered out", frame);
                    return;
                }

                ctx.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                ctx.metrics.bytes_received.fetch_add(frame.data().len() as u64, Ordering::Relaxed);
                ctx.hooks.read().trigger_all(&frame);

                let mut alerts = AlertFlags::RX_DATA;
                if self.queues.rx.push_evict(frame) {
                    let overflows = ctx.metrics.rx_overflow.fetch_add(1, Ordering::Relaxed) + 1;
                    ctx.health.record_fault(FaultKind::RxOverflow);
                    alerts |= AlertFlags::RX_QUEUE_FULL;
                    if overflows.is_power_of_two() {
                        warn!("CAN rx queue overflow, oldest frame dropped ({} total)", overflows);
                    }
                }
                ctx.metrics.record_rx_queue_depth(self.queues.rx.len());
                trace!("rx {}", frame);
                ctx.raise_alerts(alerts);
            },
            HardwareEvent::TransmitComplete {
                frame,
                success: true,
            } => {
                ctx.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                ctx.metrics.bytes_sent.fetch_add(frame.data().len() as u64, Ordering::Relaxed);
                if !self.loopback {
                    ctx.metrics.bus_bits.fetch_add(u64::from(frame.bit_length()), Ordering::Relaxed);
                }
                ctx.update_state(|m| m.record_tx_success());
                ctx.health.record_success();
                ctx.hooks.read().trigger_all_sent(&frame);

                let mut alerts = AlertFlags::TX_SUCCESS;
                if self.hw.in_flight() == 0 && self.queues.tx.is_empty() {
                    alerts |= AlertFlags::TX_IDLE;
                }
                ctx.raise_alerts(alerts);
            },
            HardwareEvent::TransmitComplete {
                frame,
                success: false,
            } => {
                ctx.metrics.tx_failed.fetch_add(1, Ordering::Relaxed);
                ctx.metrics.bus_errors.fetch_add(1, Ordering::Relaxed);
                ctx.health.record_fault(FaultKind::TransmitFailed);
                debug!("tx {} failed", frame);
                ctx.update_state(|m| m.record_tx_error());
                ctx.raise_alerts(AlertFlags::TX_FAILED | AlertFlags::BUS_ERROR);
            },
            HardwareEvent::ErrorCounters { tec, rec } => {
                trace!("error counters: tec={}, rec={}", tec, rec);
                ctx.update_state(|m| m.apply_hardware_counters(tec, rec));
            },
            HardwareEvent::BusError(kind) => {
                ctx.metrics.bus_errors.fetch_add(1, Ordering::Relaxed);
                ctx.health.record_fault(FaultKind::BusError);
                match kind {
                    BusErrorKind::Transmit => {
                        ctx.update_state(|m| m.record_tx_error());
                    },
                    BusErrorKind::Receive => {
                        ctx.metrics.rx_errors.fetch_add(1, Ordering::Relaxed);
                        ctx.update_state(|m| m.record_rx_error());
                    },
                }
                ctx.raise_alerts(AlertFlags::BUS_ERROR);
            },
            HardwareEvent::ArbitrationLost => {
                ctx.metrics.arbitration_lost.fetch_add(1, Ordering::Relaxed);
                ctx.update_state(|m| {
                    m.record_arbitration_lost();
                    Default::default()
                });
                ctx.raise_alerts(AlertFlags::ARB_LOST);
            },
            HardwareEvent::BusOff => {
                ctx.update_state(|m| m.force_bus_off());
            },
        }
    }

    /// Bus-Off 恢复的硬件部分
    ///
    /// 状态迁移（Recovering → Running / BusOff）由控制器根据结果完成。
    fn recover(&mut self, quiet: Duration) -> Result<(), String> {
        info!("CAN recovery: resetting {}", self.hw.name());
        self.hw
            .reset()
            .map_err(|e| format!("controller reset failed: {}", e))?;

        let filters = self.ctx.filters.load_full();
        self.hw
            .apply_filters(&filters)
            .map_err(|e| format!("re-applying filters failed: {}", e))?;

        let deadline = Instant::now() + quiet;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("CAN recovery: bus quiescent for {:?}", quiet);
                return Ok(());
            }
            match self.hw.poll_event(remaining.min(self.config.poll_interval)) {
                Ok(Some(event)) if is_error_event(&event) => {
                    return Err(format!("bus not quiescent: {:?}", event));
                },
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => {},
                Err(e) => return Err(format!("hardware error during recovery: {}", e)),
            }
        }
    }

    /// 等待在途发送完成后停止硬件
    fn shutdown(&mut self, drain_deadline: Duration) {
        let deadline = Instant::now().checked_add(drain_deadline);
        while self.hw.in_flight() > 0 {
            let remaining = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => self.config.poll_interval,
            };
            if remaining.is_zero() {
                warn!(
                    "CAN stop: {} transmission(s) still in flight after {:?}",
                    self.hw.in_flight(),
                    drain_deadline
                );
                break;
            }
            match self.hw.poll_event(remaining.min(self.config.poll_interval)) {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => {},
                Err(e) => {
                    warn!("CAN stop: hardware error while draining: {}", e);
                    break;
                },
            }
        }

        if let Err(e) = self.hw.stop() {
            error!("Failed to stop CAN hardware {}: {}", self.hw.name(), e);
            self.ctx.report_fault(FaultKind::Hardware, &format!("stop: {}", e));
        }
    }
}

/// 恢复静默期内出现即判定失败的事件
fn is_error_event(event: &HardwareEvent) -> bool {
    match event {
        HardwareEvent::BusError(_) | HardwareEvent::BusOff => true,
        HardwareEvent::TransmitComplete { success, .. } => !success,
        HardwareEvent::ErrorCounters { tec, rec } => *tec > 0 || *rec > 0,
        HardwareEvent::FrameReceived(_) | HardwareEvent::ArbitrationLost => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canbus_protocol::CanFrame;

    #[test]
    fn test_default_config() {
        let config = IoLoopConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.max_events_per_cycle, 64);
    }

    #[test]
    fn test_error_event_classification() {
        let frame = CanFrame::new_standard(0x10, &[]).unwrap();
        assert!(is_error_event(&HardwareEvent::BusOff));
        assert!(is_error_event(&HardwareEvent::BusError(BusErrorKind::Receive)));
        assert!(is_error_event(&HardwareEvent::TransmitComplete {
            frame,
            success: false
        }));
        assert!(is_error_event(&HardwareEvent::ErrorCounters { tec: 8, rec: 0 }));

        assert!(!is_error_event(&HardwareEvent::ErrorCounters { tec: 0, rec: 0 }));
        assert!(!is_error_event(&HardwareEvent::FrameReceived(frame)));
        assert!(!is_error_event(&HardwareEvent::ArbitrationLost));
    }
}
