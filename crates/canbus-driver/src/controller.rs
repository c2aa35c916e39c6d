//! CAN 总线控制器（对外 API）
//!
//! [`BusController`] 管理一个 CAN 控制器的完整生命周期：
//!
//! ```text
//! configure() ──▶ start() ──▶ send()/receive()/read_alerts() ... ──▶ stop()
//!                    │                                                  │
//!                    └───────────── configure() 可以再次调用 ◀───────────┘
//! ```
//!
//! 运行期间由后台 IO 线程（`canbus-io`）独占硬件；应用线程通过有界队列
//! 与 IO 线程交互，生命周期操作（configure/start/stop/恢复/过滤器）由一把
//! 生命周期锁串行化。

use crate::alerts::AlertFlags;
use crate::config::{BusConfig, PinAssignment, filter_error};
use crate::context::BusContext;
use crate::diagnostics::DiagnosticsSnapshot;
use crate::error::DriverError;
use crate::hooks::{AlertCallback, FrameCallback};
use crate::metrics::StatisticsSnapshot;
use crate::pipeline::{IoCommand, IoLoopConfig, io_loop};
use crate::queue::{PushError, RunQueues};
use crate::state::{BusState, Transitions};
use canbus_hal::{
    CanHardware, DeviceError, DeviceErrorKind, DiagnosticSink, HalError, HardwareSettings, NoPins,
    OperatingMode, PinProvider, SinkLevel, TracingSink,
};
use canbus_protocol::{CanFrame, FilterRule, FilterTable};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{JoinHandle, spawn};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 等待 IO 线程回复命令的最长时间
const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// IO 线程在排空期限之外额外允许的退出时间
const JOIN_GRACE: Duration = Duration::from_secs(2);

/// IO 线程自身的故障（崩溃、无法退出、句柄丢失）按硬件故障上报
fn io_thread_fault(message: impl Into<String>) -> DriverError {
    DriverError::HardwareFault(HalError::Device(DeviceError::new(
        DeviceErrorKind::Backend,
        message,
    )))
}

/// Extension trait for timeout-capable thread joins
trait JoinTimeout<T> {
    fn join_timeout(self, timeout: Duration) -> Result<T, DriverError>;
}

impl<T: Send + 'static> JoinTimeout<T> for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> Result<T, DriverError> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();

        // 看门狗线程负责 join，本线程带超时等待结果
        spawn(move || {
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(io_thread_fault("IO thread panicked")),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(io_thread_fault(format!(
                "IO thread did not exit within {:?}",
                timeout
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(io_thread_fault("Thread panicked during join"))
            },
        }
    }
}

/// 一次运行期间应用线程需要的句柄（`send`/`receive` 只克隆 `Arc`）
struct RunChannels {
    queues: RunQueues,
    /// 停止时对应的 Sender 被丢弃，所有等待者被唤醒
    stop_rx: Receiver<()>,
    mode: OperatingMode,
}

impl RunChannels {
    /// `stop()` 已经开始
    fn is_stopping(&self) -> bool {
        matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// 运行中的 IO 线程
struct ActiveRun {
    stop_tx: Sender<()>,
    commands: Sender<IoCommand>,
    io_thread: JoinHandle<Box<dyn CanHardware>>,
    pins: Option<PinAssignment>,
}

struct Lifecycle {
    config: Option<BusConfig>,
    /// 停止状态下由控制器持有；运行期间移交给 IO 线程
    hardware: Option<Box<dyn CanHardware>>,
    active: Option<ActiveRun>,
}

/// CAN 总线控制器
///
/// # Example
///
/// ```
/// use canbus_driver::{BusConfig, BusController};
/// use canbus_hal::{OperatingMode, VirtualBus};
/// use canbus_protocol::CanFrame;
/// use std::time::Duration;
///
/// let bus = VirtualBus::new();
/// let controller = BusController::new(bus.attach());
///
/// controller.configure(BusConfig::with_mode(OperatingMode::Loopback)).unwrap();
/// controller.start().unwrap();
///
/// let frame = CanFrame::new_standard(0x123, &[0xDE, 0xAD]).unwrap();
/// controller.send(frame, Duration::from_millis(10)).unwrap();
///
/// let echoed = controller.receive(Duration::from_secs(1)).unwrap();
/// assert_eq!(echoed.data(), &[0xDE, 0xAD]);
///
/// controller.stop().unwrap();
/// ```
pub struct BusController {
    ctx: Arc<BusContext>,
    pins: Arc<dyn PinProvider>,
    io_config: IoLoopConfig,
    lifecycle: Mutex<Lifecycle>,
    run: RwLock<Option<Arc<RunChannels>>>,
}

impl BusController {
    /// 使用默认协作者（无引脚管理、`tracing` 诊断输出）创建控制器
    pub fn new<H: CanHardware + 'static>(hardware: H) -> Self {
        Self::from_parts(
            Box::new(hardware),
            Arc::new(NoPins),
            Arc::new(TracingSink),
            IoLoopConfig::default(),
        )
    }

    pub(crate) fn from_parts(
        hardware: Box<dyn CanHardware>,
        pins: Arc<dyn PinProvider>,
        sink: Arc<dyn DiagnosticSink>,
        io_config: IoLoopConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(BusContext::new(sink)),
            pins,
            io_config,
            lifecycle: Mutex::new(Lifecycle {
                config: None,
                hardware: Some(hardware),
                active: None,
            }),
            run: RwLock::new(None),
        }
    }

    /// 校验并保存配置（不访问硬件）
    ///
    /// # 错误
    ///
    /// - `AlreadyRunning`: 控制器正在运行（需要先 `stop()`）
    /// - `InvalidConfiguration`: 波特率、队列深度、引脚等非法
    /// - `InvalidFilter`: 初始过滤规则非法
    pub fn configure(&self, config: BusConfig) -> Result<(), DriverError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.active.is_some() {
            return Err(DriverError::AlreadyRunning);
        }

        config.validate()?;
        config.validate_pins(self.pins.as_ref())?;
        let filters = config.filter_table()?;

        self.ctx.apply_config(&config, filters);
        debug!(
            "CAN bus configured: {} bit/s, {:?} mode, queues tx={} rx={}, {} filter rule(s)",
            self.ctx.profile().bitrate,
            config.mode,
            config.tx_queue_depth,
            config.rx_queue_depth,
            config.filters.len()
        );
        lifecycle.config = Some(config);
        Ok(())
    }

    /// Stopped → Running
    ///
    /// 申请引脚、启动硬件、下发过滤器、创建队列并启动 IO 线程。
    /// 任何一步失败都会回滚到 Stopped。
    ///
    /// # 错误
    ///
    /// - `InvalidConfiguration`: 尚未 `configure()`
    /// - `AlreadyRunning`: 已在运行
    /// - `HardwareFault`: 引脚申请或硬件启动失败
    pub fn start(&self) -> Result<(), DriverError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.active.is_some() {
            return Err(DriverError::AlreadyRunning);
        }
        let config = lifecycle.config.clone().ok_or_else(|| {
            DriverError::InvalidConfiguration("controller not configured".to_string())
        })?;
        let timing = config.bit_timing()?;
        let mut hardware = lifecycle
            .hardware
            .take()
            .ok_or_else(|| io_thread_fault("hardware handle lost after a failed stop"))?;

        if let Some(pins) = config.pins
            && let Err(e) = self.claim_pins(pins)
        {
            lifecycle.hardware = Some(hardware);
            return Err(e);
        }

        let settings = HardwareSettings {
            timing,
            mode: config.mode,
        };
        let filters = self.ctx.filters.load_full();
        if let Err(e) = hardware
            .start(&settings)
            .and_then(|_| hardware.apply_filters(&filters))
        {
            error!("Failed to start CAN hardware {}: {}", hardware.name(), e);
            self.ctx
                .emit(SinkLevel::Error, &format!("hardware start failed: {}", e));
            let _ = hardware.stop();
            if let Some(pins) = config.pins {
                self.release_pins(pins);
            }
            lifecycle.hardware = Some(hardware);
            return Err(DriverError::HardwareFault(e));
        }

        let queues = RunQueues::new(config.tx_queue_depth, config.rx_queue_depth);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (cmd_tx, cmd_rx) = bounded::<IoCommand>(8);

        // 上一次运行残留的告警不带入新的运行
        self.ctx.alerts.take();
        self.ctx.health.reset();
        self.ctx.update_state(|m| m.start().unwrap_or_else(|_| Transitions::new()));

        let ctx = self.ctx.clone();
        let io_queues = queues.clone();
        let io_config = self.io_config;
        let name = hardware.name().to_string();
        let io_thread = std::thread::Builder::new()
            .name("canbus-io".to_string())
            .spawn(move || io_loop(hardware, ctx, io_queues, cmd_rx, io_config))
            .map_err(|e| {
                self.ctx.update_state(|m| m.stop());
                if let Some(pins) = config.pins {
                    self.release_pins(pins);
                }
                error!("Failed to spawn CAN IO thread: {}", e);
                DriverError::HardwareFault(HalError::Io(e))
            })?;

        *self.run.write() = Some(Arc::new(RunChannels {
            queues,
            stop_rx,
            mode: config.mode,
        }));
        lifecycle.active = Some(ActiveRun {
            stop_tx,
            commands: cmd_tx,
            io_thread,
            pins: config.pins,
        });

        info!(
            "CAN bus started on {}: {} bit/s, {:?} mode",
            name,
            timing.bitrate(),
            config.mode
        );
        self.ctx.emit(
            SinkLevel::Info,
            &format!("started: {} bit/s, {:?} mode", timing.bitrate(), config.mode),
        );
        Ok(())
    }

    /// 任意运行状态 → Stopped
    ///
    /// 唤醒所有阻塞在 `send`/`receive`/`read_alerts` 的线程（返回 `NotRunning`），
    /// 等待在途发送完成（最多 `drain_timeout_ms`），队列中剩余的帧计入
    /// `dropped_on_stop`，释放引脚。未运行时直接返回 `Ok`。
    pub fn stop(&self) -> Result<(), DriverError> {
        let mut lifecycle = self.lifecycle.lock();
        let Some(active) = lifecycle.active.take() else {
            return Ok(());
        };
        let run = self.run.write().take();
        drop(active.stop_tx);

        let drain_deadline = lifecycle
            .config
            .as_ref()
            .map(BusConfig::drain_timeout)
            .unwrap_or_default();
        let _ = active.commands.send(IoCommand::Shutdown { drain_deadline });

        match active.io_thread.join_timeout(drain_deadline + JOIN_GRACE) {
            Ok(hardware) => lifecycle.hardware = Some(hardware),
            Err(e) => {
                error!("CAN IO thread failed to shut down: {}", e);
                self.ctx.emit(SinkLevel::Error, &e.to_string());
            },
        }

        if let Some(run) = run {
            let dropped = run.queues.tx.drain() + run.queues.rx.drain();
            if dropped > 0 {
                self.ctx
                    .metrics
                    .dropped_on_stop
                    .fetch_add(dropped as u64, Ordering::Relaxed);
                info!("CAN stop: {} queued frame(s) discarded", dropped);
            }
        }

        // 在途发送排空、剩余帧计数之后才进入 Stopped
        self.ctx.update_state(|m| m.stop());

        if let Some(pins) = active.pins {
            self.release_pins(pins);
        }

        info!("CAN bus stopped");
        self.ctx.emit(SinkLevel::Info, "stopped");
        Ok(())
    }

    /// 发送一帧（入发送队列）
    ///
    /// # 参数
    ///
    /// - `timeout`: 队列满时的最长等待；零表示不等待，[`crate::WAIT_FOREVER`] 表示一直等待
    ///
    /// # 错误
    ///
    /// - `NotRunning`: 未运行，或状态不是 Running / ErrorWarning / ErrorPassive
    /// - `ListenOnly`: 只听模式
    /// - `QueueFull`: 超时后队列仍然满
    pub fn send(&self, frame: CanFrame, timeout: Duration) -> Result<(), DriverError> {
        let run = self.current_run()?;
        if !run.mode.can_transmit() {
            return Err(DriverError::ListenOnly);
        }
        if !self.ctx.state.load().can_transmit() {
            return Err(DriverError::NotRunning);
        }

        match run.queues.tx.push_wait(frame, timeout, &run.stop_rx) {
            // 等待期间控制器被停止：帧会随队列一起丢弃
            Ok(()) if run.is_stopping() => Err(DriverError::NotRunning),
            Ok(()) => {
                self.ctx.metrics.record_tx_queue_depth(run.queues.tx.len());
                trace!("tx queued {}", frame);
                Ok(())
            },
            Err(PushError::Full) => {
                self.ctx
                    .metrics
                    .queue_full_events
                    .fetch_add(1, Ordering::Relaxed);
                self.ctx.raise_alerts(AlertFlags::TX_QUEUE_FULL);
                debug!("tx queue full, rejected {}", frame);
                Err(DriverError::QueueFull)
            },
            Err(PushError::Stopped) => Err(DriverError::NotRunning),
        }
    }

    /// 批量发送
    ///
    /// 按顺序入队，遇到第一帧无法入队时停止，返回已入队的帧数。`timeout`
    /// 是整个批次的总时限。部分成功不是错误；只有第一帧就因非瞬时错误
    /// （如 `NotRunning`）失败时才返回错误。
    pub fn send_batch(
        &self,
        frames: impl IntoIterator<Item = CanFrame>,
        timeout: Duration,
    ) -> Result<usize, DriverError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut sent = 0;
        for frame in frames {
            let remaining = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            match self.send(frame, remaining) {
                Ok(()) => sent += 1,
                Err(e) if sent == 0 && !e.is_transient() => return Err(e),
                Err(e) => {
                    debug!("send_batch stopped after {} frame(s): {}", sent, e);
                    break;
                },
            }
        }
        Ok(sent)
    }

    /// 接收一帧（接收队列中最旧的帧）
    ///
    /// # 错误
    ///
    /// - `Timeout`: 超时前没有帧
    /// - `NotRunning`: 未运行，或等待期间被停止
    pub fn receive(&self, timeout: Duration) -> Result<CanFrame, DriverError> {
        let run = self.current_run()?;
        run.queues.rx.pop_wait(timeout, &run.stop_rx)
    }

    /// 批量接收
    ///
    /// 等待第一帧（最多 `timeout`），之后非阻塞地取走其余的帧，最多 `max_count` 帧。
    pub fn receive_batch(
        &self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<CanFrame>, DriverError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let run = self.current_run()?;
        let first = run.queues.rx.pop_wait(timeout, &run.stop_rx)?;

        let mut frames = Vec::with_capacity(max_count.min(run.queues.rx.capacity() + 1));
        frames.push(first);
        while frames.len() < max_count {
            match run.queues.rx.try_pop() {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        Ok(frames)
    }

    /// 整体替换过滤表
    ///
    /// 新规则立即对之后收到的帧生效；已在接收队列中的帧不受影响。
    /// 运行中先把规则下发给硬件，硬件接受后才替换软件过滤表和保存的配置；
    /// 任何失败都保留原来的过滤表。
    ///
    /// # 错误
    ///
    /// - `InvalidFilter`: 规则非法
    /// - `HardwareFault`: 硬件拒绝过滤器
    /// - `Timeout`: IO 线程没有按时确认
    pub fn configure_filter(&self, rules: Vec<FilterRule>) -> Result<(), DriverError> {
        let table = Arc::new(FilterTable::new(rules.clone()).map_err(filter_error)?);

        let mut lifecycle = self.lifecycle.lock();
        if let Some(active) = lifecycle.active.as_ref() {
            let (reply_tx, reply_rx) = bounded(1);
            active
                .commands
                .send(IoCommand::ApplyFilters {
                    table: table.clone(),
                    reply: reply_tx,
                })
                .map_err(|_| io_thread_fault("IO thread not running"))?;
            match reply_rx.recv_timeout(COMMAND_REPLY_TIMEOUT) {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    warn!("CAN filter update rejected by hardware: {}", e);
                    return Err(DriverError::HardwareFault(e));
                },
                Err(_) => {
                    // IO 线程稍后仍可能下发新表，排队一条命令把硬件恢复为当前表
                    let (restore_tx, _) = bounded(1);
                    let _ = active.commands.try_send(IoCommand::ApplyFilters {
                        table: self.ctx.filters.load_full(),
                        reply: restore_tx,
                    });
                    return Err(DriverError::Timeout);
                },
            }
        }

        self.ctx.filters.store(table.clone());
        if let Some(config) = lifecycle.config.as_mut() {
            config.filters = rules;
        }

        info!("CAN filter table replaced ({} rule(s))", table.len());
        Ok(())
    }

    /// 等待并取走告警
    ///
    /// 返回自上次读取以来锁存的全部已启用告警。未运行时只返回已锁存的告警。
    ///
    /// # 错误
    ///
    /// - `Timeout`: 超时前没有告警
    /// - `NotRunning`: 控制器未运行（或等待期间被停止）且没有锁存的告警
    pub fn read_alerts(&self, timeout: Duration) -> Result<AlertFlags, DriverError> {
        let run = self.run.read().clone();
        match run {
            Some(run) => self.ctx.alerts.wait(timeout, &run.stop_rx),
            None => {
                let flags = self.ctx.alerts.take();
                if flags.is_empty() {
                    Err(DriverError::NotRunning)
                } else {
                    Ok(flags)
                }
            },
        }
    }

    /// 重新设置启用的告警
    pub fn set_alert_mask(&self, mask: AlertFlags) {
        self.ctx.alerts.set_armed(mask);
        if let Some(config) = self.lifecycle.lock().config.as_mut() {
            config.alert_mask = mask;
        }
    }

    /// 从 Bus-Off 恢复
    ///
    /// 不处于 Bus-Off 时什么也不做，直接返回 `Ok`（计数不变）。
    /// 否则：BusOff → Recovering，IO 线程复位控制器、重新下发过滤器并等待
    /// 总线静默 `recovery_quiet_ms`；成功后清零错误计数进入 Running。
    ///
    /// # 错误
    ///
    /// - `RecoveryFailed`: 复位失败、静默期内出现错误、或超过 `recovery_timeout_ms`；
    ///   状态保持 BusOff
    pub fn recover_from_error(&self) -> Result<(), DriverError> {
        let lifecycle = self.lifecycle.lock();
        if self.ctx.state.load() != BusState::BusOff {
            return Ok(());
        }
        let (Some(active), Some(config)) = (lifecycle.active.as_ref(), lifecycle.config.as_ref())
        else {
            return Ok(());
        };

        if self.ctx.update_state(|m| m.begin_recovery()).is_empty() {
            return Ok(());
        }
        info!("CAN bus-off recovery started");

        let (reply_tx, reply_rx) = bounded(1);
        let result = match active.commands.send(IoCommand::Recover {
            quiet: config.recovery_quiet(),
            reply: reply_tx,
        }) {
            Ok(()) => match reply_rx.recv_timeout(config.recovery_timeout()) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(format!(
                    "bus did not become quiescent within {:?}",
                    config.recovery_timeout()
                )),
                Err(RecvTimeoutError::Disconnected) => {
                    Err("IO thread exited during recovery".to_string())
                },
            },
            Err(_) => Err("IO thread not running".to_string()),
        };

        match result {
            Ok(()) => {
                self.ctx.update_state(|m| m.complete_recovery());
                info!("CAN bus-off recovery complete");
                Ok(())
            },
            Err(reason) => {
                self.ctx.update_state(|m| m.abort_recovery());
                warn!("CAN bus-off recovery failed: {}", reason);
                self.ctx
                    .emit(SinkLevel::Error, &format!("recovery failed: {}", reason));
                Err(DriverError::RecoveryFailed(reason))
            },
        }
    }

    /// 当前状态（无锁）
    pub fn state(&self) -> BusState {
        self.ctx.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.run.read().is_some()
    }

    /// 当前配置
    pub fn config(&self) -> Option<BusConfig> {
        self.lifecycle.lock().config.clone()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.ctx.statistics()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let run = self.run.read().clone();
        self.ctx.diagnostics(run.as_ref().map(|r| &r.queues))
    }

    /// 清零统计计数（不影响错误计数和状态）
    pub fn reset_statistics(&self) {
        self.ctx.reset_statistics();
    }

    /// 注册帧回调（在 IO 线程中调用）
    pub fn add_frame_callback(&self, callback: Arc<dyn FrameCallback>) {
        self.ctx.hooks.write().add_callback(callback);
    }

    /// 注册告警回调（在锁存告警的线程中调用）
    pub fn add_alert_callback(&self, callback: Arc<dyn AlertCallback>) {
        self.ctx.hooks.write().add_alert_callback(callback);
    }

    fn current_run(&self) -> Result<Arc<RunChannels>, DriverError> {
        self.run.read().clone().ok_or(DriverError::NotRunning)
    }

    fn claim_pins(&self, pins: PinAssignment) -> Result<(), DriverError> {
        self.pins
            .request(pins.tx)
            .map_err(|e| DriverError::HardwareFault(HalError::Pin(e)))?;
        if let Err(e) = self.pins.request(pins.rx) {
            let _ = self.pins.release(pins.tx);
            return Err(DriverError::HardwareFault(HalError::Pin(e)));
        }
        debug!("CAN pins claimed: tx={}, rx={}", pins.tx, pins.rx);
        Ok(())
    }

    fn release_pins(&self, pins: PinAssignment) {
        for pin in [pins.tx, pins.rx] {
            if let Err(e) = self.pins.release(pin) {
                warn!("Failed to release {}: {}", pin, e);
            }
        }
    }
}

impl Drop for BusController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Failed to stop CAN bus controller on drop: {}", e);
        }
    }
}

impl std::fmt::Debug for BusController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusController")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canbus_hal::VirtualBus;

    fn loopback_controller() -> BusController {
        let bus = VirtualBus::new();
        let controller = BusController::new(bus.attach());
        controller
            .configure(BusConfig::with_mode(OperatingMode::Loopback))
            .unwrap();
        controller
    }

    #[test]
    fn test_start_requires_configuration() {
        let controller = BusController::new(VirtualBus::new().attach());
        assert!(matches!(
            controller.start(),
            Err(DriverError::InvalidConfiguration(_))
        ));
        assert_eq!(controller.state(), BusState::Stopped);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let controller = loopback_controller();
        controller.start().unwrap();
        assert!(matches!(controller.start(), Err(DriverError::AlreadyRunning)));
        assert!(matches!(
            controller.configure(BusConfig::default()),
            Err(DriverError::AlreadyRunning)
        ));
        controller.stop().unwrap();
    }

    #[test]
    fn test_operations_require_running() {
        let controller = loopback_controller();
        let frame = CanFrame::new_standard(0x1, &[]).unwrap();
        assert!(matches!(
            controller.send(frame, Duration::ZERO),
            Err(DriverError::NotRunning)
        ));
        assert!(matches!(
            controller.receive(Duration::ZERO),
            Err(DriverError::NotRunning)
        ));
        assert!(matches!(
            controller.read_alerts(Duration::ZERO),
            Err(DriverError::NotRunning)
        ));
        // 未运行时 stop 是空操作
        controller.stop().unwrap();
    }

    #[test]
    fn test_restart_after_stop() {
        let controller = loopback_controller();
        for _ in 0..3 {
            controller.start().unwrap();
            assert_eq!(controller.state(), BusState::Running);
            controller.stop().unwrap();
            assert_eq!(controller.state(), BusState::Stopped);
        }
    }

    #[test]
    fn test_hardware_start_failure_rolls_back() {
        let bus = VirtualBus::new();
        let node = bus.attach();
        let faults = node.fault_injector();
        let controller = BusController::new(node);
        controller
            .configure(BusConfig::with_mode(OperatingMode::Loopback))
            .unwrap();

        faults.fail_next_start();
        assert!(matches!(
            controller.start(),
            Err(DriverError::HardwareFault(_))
        ));
        assert_eq!(controller.state(), BusState::Stopped);
        assert!(!controller.is_running());

        // 硬件句柄已归还，可以再次启动
        controller.start().unwrap();
        controller.stop().unwrap();
    }

    #[test]
    fn test_join_timeout_returns_value() {
        let handle = spawn(|| 42u32);
        assert_eq!(handle.join_timeout(Duration::from_secs(1)).unwrap(), 42);

        let slow = spawn(|| std::thread::sleep(Duration::from_millis(200)));
        assert!(matches!(
            slow.join_timeout(Duration::from_millis(10)),
            Err(DriverError::HardwareFault(HalError::Device(_)))
        ));
    }
}
