//! 控制器共享上下文
//!
//! IO 线程与应用线程共享的全部运行时状态：
//!
//! - 热数据（每帧访问）：过滤表 `ArcSwap`、原子状态、原子计数器
//! - 温数据（状态迁移）：`Mutex<BusStateMachine>`，短临界区
//! - 冷数据（配置相关）：`RwLock<BusProfile>`、`RwLock<HookManager>`
//!
//! 状态迁移的副作用（计数、日志、诊断输出、告警、回调）在状态机锁释放后执行。

use crate::alerts::{AlertCenter, AlertFlags};
use crate::config::BusConfig;
use crate::diagnostics::{DiagnosticsSnapshot, FaultKind, HealthMonitor};
use crate::hooks::HookManager;
use crate::metrics::{BusMetrics, StatisticsSnapshot, UptimeClock};
use crate::queue::RunQueues;
use crate::state::{AtomicBusState, BusState, BusStateMachine, ErrorCounters, Transition, Transitions};
use arc_swap::ArcSwap;
use canbus_hal::{DiagnosticSink, OperatingMode, SinkLevel};
use canbus_protocol::FilterTable;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

/// 当前配置的摘要（统计和诊断使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusProfile {
    pub bitrate: u32,
    pub mode: OperatingMode,
    pub tx_queue_depth: usize,
    pub rx_queue_depth: usize,
}

impl Default for BusProfile {
    fn default() -> Self {
        Self::from_config(&BusConfig::default())
    }
}

impl BusProfile {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            bitrate: config.bit_timing().map(|t| t.bitrate()).unwrap_or(0),
            mode: config.mode,
            tx_queue_depth: config.tx_queue_depth,
            rx_queue_depth: config.rx_queue_depth,
        }
    }
}

/// 控制器上下文
pub struct BusContext {
    machine: Mutex<BusStateMachine>,
    /// 当前状态（状态机锁内写入，无锁读取）
    pub state: AtomicBusState,
    pub metrics: BusMetrics,
    pub alerts: AlertCenter,
    /// 当前过滤表（IO 线程每帧 `load()`）
    pub filters: ArcSwap<FilterTable>,
    pub hooks: RwLock<HookManager>,
    pub health: HealthMonitor,
    pub uptime: UptimeClock,
    profile: RwLock<BusProfile>,
    sink: Arc<dyn DiagnosticSink>,
}

impl BusContext {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        let config = BusConfig::default();
        Self {
            machine: Mutex::new(BusStateMachine::new(config.thresholds)),
            state: AtomicBusState::default(),
            metrics: BusMetrics::new(),
            alerts: AlertCenter::new(config.alert_mask),
            filters: ArcSwap::from_pointee(FilterTable::accept_all()),
            hooks: RwLock::new(HookManager::new()),
            health: HealthMonitor::new(config.health_error_threshold),
            uptime: UptimeClock::new(),
            profile: RwLock::new(BusProfile::from_config(&config)),
            sink,
        }
    }

    /// 应用一份已校验的配置（只在 Stopped 时调用）
    pub fn apply_config(&self, config: &BusConfig, filters: FilterTable) {
        self.machine.lock().set_thresholds(config.thresholds);
        self.alerts.set_armed(config.alert_mask);
        self.health.set_threshold(config.health_error_threshold);
        self.filters.store(Arc::new(filters));
        *self.profile.write() = BusProfile::from_config(config);
    }

    pub fn profile(&self) -> BusProfile {
        *self.profile.read()
    }

    pub fn counters(&self) -> ErrorCounters {
        self.machine.lock().counters()
    }

    /// 在状态机锁内执行一次变更，锁外处理产生的迁移
    pub fn update_state<F>(&self, f: F) -> Transitions
    where
        F: FnOnce(&mut BusStateMachine) -> Transitions,
    {
        let transitions = {
            let mut machine = self.machine.lock();
            let transitions = f(&mut machine);
            if !transitions.is_empty() {
                self.state.store(machine.state());
            }
            transitions
        };
        self.apply_transitions(&transitions);
        transitions
    }

    fn apply_transitions(&self, transitions: &[Transition]) {
        if transitions.is_empty() {
            return;
        }

        let mut alerts = AlertFlags::empty();
        for t in transitions {
            self.count_transition(t);
            self.log_transition(t);
            alerts |= AlertFlags::for_transition(t.from, t.to);
        }
        self.raise_alerts(alerts);
    }

    fn count_transition(&self, t: &Transition) {
        use BusState::*;
        let metrics = &self.metrics;
        match (t.from, t.to) {
            (Running, ErrorWarning) => {
                metrics.error_warning_events.fetch_add(1, Ordering::Relaxed);
            },
            (ErrorWarning, ErrorPassive) => {
                metrics.error_passive_events.fetch_add(1, Ordering::Relaxed);
            },
            (ErrorPassive, BusOff) => {
                metrics.bus_off_events.fetch_add(1, Ordering::Relaxed);
                self.health.record_fault(FaultKind::BusOff);
            },
            (Recovering, Running) => {
                metrics.recoveries.fetch_add(1, Ordering::Relaxed);
                self.health.reset();
            },
            (Recovering, BusOff) => {
                metrics.recovery_failures.fetch_add(1, Ordering::Relaxed);
            },
            (Stopped, Running) => self.uptime.resume(),
            (_, Stopped) => self.uptime.pause(),
            _ => {},
        }
    }

    fn log_transition(&self, t: &Transition) {
        use BusState::*;
        let (level, message) = match (t.from, t.to) {
            (_, BusOff) => {
                error!("CAN bus-off: {}", t);
                (SinkLevel::Error, format!("bus-off entered ({})", t))
            },
            (Running, ErrorWarning) | (ErrorWarning, ErrorPassive) => {
                warn!("CAN error state escalated: {}", t);
                (SinkLevel::Warn, format!("error state escalated: {}", t))
            },
            (ErrorPassive, ErrorWarning) | (ErrorWarning, Running) => {
                info!("CAN error state recovered: {}", t);
                (SinkLevel::Info, format!("error state recovered: {}", t))
            },
            _ => {
                info!("CAN state: {}", t);
                (SinkLevel::Info, format!("state {}", t))
            },
        };
        self.sink.emit(level, &message);
    }

    /// 锁存告警并触发告警回调
    ///
    /// 回调在调用线程上执行（通常是 IO 线程，`send()` 队列满时是应用线程）。
    pub fn raise_alerts(&self, flags: AlertFlags) -> AlertFlags {
        let latched = self.alerts.raise(flags);
        if !latched.is_empty() {
            self.hooks.read().trigger_alerts(latched);
        }
        latched
    }

    /// 记录故障并输出诊断消息
    pub fn report_fault(&self, kind: FaultKind, detail: &str) {
        self.health.record_fault(kind);
        self.sink.emit(SinkLevel::Warn, &format!("{}: {}", kind, detail));
    }

    pub fn emit(&self, level: SinkLevel, message: &str) {
        self.sink.emit(level, message);
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        let bitrate = self.profile.read().bitrate;
        self.metrics.snapshot(self.uptime.elapsed(), bitrate)
    }

    pub fn reset_statistics(&self) {
        self.metrics.reset();
        self.uptime.reset();
    }

    /// 诊断快照；未运行时队列长度为 0，容量取配置值
    pub fn diagnostics(&self, queues: Option<&RunQueues>) -> DiagnosticsSnapshot {
        let (state, counters) = {
            let machine = self.machine.lock();
            (machine.state(), machine.counters())
        };
        let profile = self.profile();
        let last_error = self.health.last_error();

        let (tx_queue_len, tx_queue_capacity, rx_queue_len, rx_queue_capacity) = match queues {
            Some(q) => (q.tx.len(), q.tx.capacity(), q.rx.len(), q.rx.capacity()),
            None => (0, profile.tx_queue_depth, 0, profile.rx_queue_depth),
        };

        DiagnosticsSnapshot {
            state,
            mode: profile.mode,
            tec: counters.tec,
            rec: counters.rec,
            arbitration_lost: counters.arbitration_lost,
            bus_errors: counters.bus_errors,
            consecutive_errors: self.health.consecutive_errors(),
            healthy: self.health.is_healthy(state),
            tx_queue_len,
            tx_queue_capacity,
            rx_queue_len,
            rx_queue_capacity,
            last_error: last_error.map(|(kind, _)| kind),
            last_error_age_ms: last_error.map(|(_, age)| age.as_millis() as u64),
        }
    }
}

impl std::fmt::Debug for BusContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusContext")
            .field("state", &self.state.load())
            .field("profile", &self.profile())
            .field("alerts", &self.alerts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canbus_hal::MemorySink;
    use std::sync::atomic::AtomicU32;

    fn context() -> (BusContext, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let ctx = BusContext::new(sink.clone());
        ctx.apply_config(&BusConfig::default(), FilterTable::accept_all());
        (ctx, sink)
    }

    #[test]
    fn test_escalation_counts_events_and_raises_alerts() {
        let (ctx, sink) = context();
        ctx.update_state(|m| m.start().unwrap_or_default());
        assert_eq!(ctx.state.load(), BusState::Running);

        ctx.update_state(|m| m.apply_hardware_counters(256, 0));
        assert_eq!(ctx.state.load(), BusState::BusOff);

        let stats = ctx.statistics();
        assert_eq!(stats.error_warning_events, 1);
        assert_eq!(stats.error_passive_events, 1);
        assert_eq!(stats.bus_off_events, 1);

        // ABOVE_ERR_WARN | ERR_PASS | BUS_OFF 都在默认启用集合中
        let alerts = ctx.alerts.take();
        assert!(alerts.contains(AlertFlags::ABOVE_ERR_WARN | AlertFlags::ERR_PASS | AlertFlags::BUS_OFF));

        assert!(sink.contains("bus-off entered"));
        assert_eq!(ctx.health.last_error().unwrap().0, FaultKind::BusOff);
    }

    #[test]
    fn test_de_escalation_does_not_count_events() {
        let (ctx, _sink) = context();
        ctx.update_state(|m| m.start().unwrap_or_default());
        ctx.update_state(|m| m.apply_hardware_counters(130, 0));
        ctx.update_state(|m| m.apply_hardware_counters(0, 0));
        ctx.update_state(|m| m.apply_hardware_counters(100, 0));

        let stats = ctx.statistics();
        assert_eq!(stats.error_warning_events, 2);
        assert_eq!(stats.error_passive_events, 1);
    }

    #[test]
    fn test_recovery_counts() {
        let (ctx, _sink) = context();
        ctx.update_state(|m| m.start().unwrap_or_default());
        ctx.update_state(|m| m.force_bus_off());

        ctx.update_state(|m| m.begin_recovery());
        ctx.update_state(|m| m.abort_recovery());
        ctx.update_state(|m| m.begin_recovery());
        ctx.update_state(|m| m.complete_recovery());

        let stats = ctx.statistics();
        assert_eq!(stats.recoveries, 1);
        assert_eq!(stats.recovery_failures, 1);
        assert_eq!(ctx.counters(), ErrorCounters::default());
    }

    #[test]
    fn test_alert_callback_sees_only_armed_bits() {
        let (ctx, _sink) = context();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_cb = seen.clone();
        ctx.hooks.write().add_alert_callback(Arc::new(move |flags: AlertFlags| {
            seen_cb.fetch_or(flags.bits(), Ordering::Relaxed);
        }));

        // RX_DATA 默认未启用
        ctx.raise_alerts(AlertFlags::RX_DATA);
        assert_eq!(seen.load(Ordering::Relaxed), 0);

        ctx.raise_alerts(AlertFlags::RX_DATA | AlertFlags::ARB_LOST);
        assert_eq!(seen.load(Ordering::Relaxed), AlertFlags::ARB_LOST.bits());
    }

    #[test]
    fn test_diagnostics_when_stopped() {
        let (ctx, _sink) = context();
        let diag = ctx.diagnostics(None);
        assert_eq!(diag.state, BusState::Stopped);
        assert_eq!(diag.tx_queue_capacity, 10);
        assert_eq!(diag.tx_queue_len, 0);
        assert!(diag.healthy);
        assert!(diag.last_error.is_none());
    }
}
