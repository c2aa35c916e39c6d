//! 总线状态机
//!
//! 跟踪控制器状态与错误计数（ISO 11898 简化模型）：
//!
//! ```text
//!            Start()                 TEC/REC ≥ 96          TEC/REC ≥ 128          TEC ≥ 256
//! Stopped ──────────▶ Running ◀────────────▶ ErrorWarning ◀────────────▶ ErrorPassive ──────────▶ BusOff
//!                        ▲                                                                           │
//!                        │              RecoverFromError(): 复位 + 静默等待                           │
//!                        └──────────────────────────── Recovering ◀──────────────────────────────────┘
//! ```
//!
//! - 一次发送错误 TEC += 8，一次接收错误 REC += 1
//! - 一次成功发送 TEC -= 1，一次成功接收 REC -= 1
//! - 状态每次只移动一级，计数跳变时依次产生每个中间迁移
//! - Bus-Off 不会自动退出，只能通过恢复流程回到 Running
//!
//! 状态机本身不加锁，由 [`BusContext`](crate::context) 以短临界区的 `Mutex` 保护；
//! 只读方通过 [`AtomicBusState`] 无锁读取当前状态。

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 一次发送错误对 TEC 的增量
pub const TX_ERROR_INCREMENT: u16 = 8;

/// REC 上限（REC 不会导致 Bus-Off）
pub const REC_LIMIT: u16 = 255;

/// 控制器状态
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, IntoPrimitive, TryFromPrimitive, Serialize,
)]
#[repr(u8)]
pub enum BusState {
    /// 未启动（初始状态）
    #[default]
    Stopped = 0,
    /// 正常运行（error-active）
    Running = 1,
    /// 错误计数超过警告阈值，仍可正常收发
    ErrorWarning = 2,
    /// 错误被动：不再发送主动错误帧
    ErrorPassive = 3,
    /// 已离线，需要显式恢复
    BusOff = 4,
    /// 恢复中（复位控制器并等待总线静默）
    Recovering = 5,
}

impl BusState {
    /// 允许发送的状态（Running / ErrorWarning / ErrorPassive）
    pub fn can_transmit(self) -> bool {
        matches!(
            self,
            BusState::Running | BusState::ErrorWarning | BusState::ErrorPassive
        )
    }

    /// 错误等级（只对 Running..=BusOff 有定义）
    fn level(self) -> Option<u8> {
        match self {
            BusState::Running => Some(0),
            BusState::ErrorWarning => Some(1),
            BusState::ErrorPassive => Some(2),
            BusState::BusOff => Some(3),
            BusState::Stopped | BusState::Recovering => None,
        }
    }

    fn from_level(level: u8) -> Self {
        match level {
            0 => BusState::Running,
            1 => BusState::ErrorWarning,
            2 => BusState::ErrorPassive,
            _ => BusState::BusOff,
        }
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusState::Stopped => "stopped",
            BusState::Running => "running",
            BusState::ErrorWarning => "error-warning",
            BusState::ErrorPassive => "error-passive",
            BusState::BusOff => "bus-off",
            BusState::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

/// 总线状态（原子版本，用于线程间共享）
///
/// 状态机在锁内迁移后写入，读方（`send()`、统计、IO 线程发送判定）无锁读取。
#[derive(Debug, Default)]
pub struct AtomicBusState {
    inner: AtomicU8,
}

impl AtomicBusState {
    pub fn new(state: BusState) -> Self {
        Self {
            inner: AtomicU8::new(state.into()),
        }
    }

    pub fn load(&self) -> BusState {
        BusState::try_from(self.inner.load(Ordering::Acquire)).unwrap_or(BusState::Stopped)
    }

    pub fn store(&self, state: BusState) {
        self.inner.store(state.into(), Ordering::Release);
    }
}

/// 错误阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorThresholds {
    pub warning: u16,
    pub passive: u16,
    pub bus_off: u16,
}

impl Default for ErrorThresholds {
    fn default() -> Self {
        Self {
            warning: 96,
            passive: 128,
            bus_off: 256,
        }
    }
}

impl ErrorThresholds {
    /// 要求 `0 < warning < passive < bus_off`
    pub fn validate(&self) -> Result<(), String> {
        if self.warning == 0 || self.warning >= self.passive || self.passive >= self.bus_off {
            return Err(format!(
                "error thresholds must satisfy 0 < warning < passive < bus_off (got {} / {} / {})",
                self.warning, self.passive, self.bus_off
            ));
        }
        Ok(())
    }
}

/// 错误计数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ErrorCounters {
    /// 发送错误计数（TEC）
    pub tec: u16,
    /// 接收错误计数（REC）
    pub rec: u16,
    /// 仲裁失败次数
    pub arbitration_lost: u32,
    /// 总线错误次数
    pub bus_errors: u32,
}

/// 一次状态迁移（附带迁移时的计数）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BusState,
    pub to: BusState,
    pub tec: u16,
    pub rec: u16,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (tec={}, rec={})",
            self.from, self.to, self.tec, self.rec
        )
    }
}

/// 一次操作产生的迁移序列（通常 0~3 个）
pub type Transitions = SmallVec<[Transition; 4]>;

/// 总线状态机
#[derive(Debug, Clone)]
pub struct BusStateMachine {
    state: BusState,
    counters: ErrorCounters,
    thresholds: ErrorThresholds,
}

impl Default for BusStateMachine {
    fn default() -> Self {
        Self::new(ErrorThresholds::default())
    }
}

impl BusStateMachine {
    pub fn new(thresholds: ErrorThresholds) -> Self {
        Self {
            state: BusState::Stopped,
            counters: ErrorCounters::default(),
            thresholds,
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn counters(&self) -> ErrorCounters {
        self.counters
    }

    pub fn thresholds(&self) -> ErrorThresholds {
        self.thresholds
    }

    /// 只在 Stopped 状态下生效
    pub fn set_thresholds(&mut self, thresholds: ErrorThresholds) -> bool {
        if self.state != BusState::Stopped {
            return false;
        }
        self.thresholds = thresholds;
        true
    }

    /// Stopped → Running，计数清零
    ///
    /// # 错误
    ///
    /// 当前不是 Stopped 时返回当前状态。
    pub fn start(&mut self) -> Result<Transitions, BusState> {
        if self.state != BusState::Stopped {
            return Err(self.state);
        }
        self.counters = ErrorCounters::default();
        Ok(self.jump(BusState::Running))
    }

    /// 任意状态 → Stopped
    pub fn stop(&mut self) -> Transitions {
        if self.state == BusState::Stopped {
            return Transitions::new();
        }
        self.jump(BusState::Stopped)
    }

    /// 发送错误：TEC += 8
    pub fn record_tx_error(&mut self) -> Transitions {
        if !self.state.can_transmit() {
            return Transitions::new();
        }
        self.counters.bus_errors = self.counters.bus_errors.saturating_add(1);
        self.counters.tec = self
            .counters
            .tec
            .saturating_add(TX_ERROR_INCREMENT)
            .min(self.thresholds.bus_off);
        self.settle()
    }

    /// 接收错误：REC += 1
    pub fn record_rx_error(&mut self) -> Transitions {
        if !self.state.can_transmit() {
            return Transitions::new();
        }
        self.counters.bus_errors = self.counters.bus_errors.saturating_add(1);
        self.counters.rec = self.counters.rec.saturating_add(1).min(REC_LIMIT);
        self.settle()
    }

    /// 成功发送：TEC -= 1
    pub fn record_tx_success(&mut self) -> Transitions {
        if !self.state.can_transmit() || self.counters.tec == 0 {
            return Transitions::new();
        }
        self.counters.tec -= 1;
        self.settle()
    }

    /// 成功接收：REC -= 1
    pub fn record_rx_success(&mut self) -> Transitions {
        if !self.state.can_transmit() || self.counters.rec == 0 {
            return Transitions::new();
        }
        self.counters.rec -= 1;
        self.settle()
    }

    /// 仲裁失败只计数，不影响错误计数
    pub fn record_arbitration_lost(&mut self) {
        if self.state.can_transmit() {
            self.counters.arbitration_lost = self.counters.arbitration_lost.saturating_add(1);
        }
    }

    /// 采用控制器报告的绝对计数
    pub fn apply_hardware_counters(&mut self, tec: u16, rec: u16) -> Transitions {
        if !self.state.can_transmit() {
            return Transitions::new();
        }
        self.counters.tec = tec.min(self.thresholds.bus_off);
        self.counters.rec = rec.min(REC_LIMIT);
        self.settle()
    }

    /// 控制器直接报告 Bus-Off
    pub fn force_bus_off(&mut self) -> Transitions {
        self.apply_hardware_counters(self.thresholds.bus_off, self.counters.rec)
    }

    /// BusOff → Recovering
    pub fn begin_recovery(&mut self) -> Transitions {
        if self.state != BusState::BusOff {
            return Transitions::new();
        }
        self.jump(BusState::Recovering)
    }

    /// Recovering → Running，清零所有错误计数
    pub fn complete_recovery(&mut self) -> Transitions {
        if self.state != BusState::Recovering {
            return Transitions::new();
        }
        self.counters = ErrorCounters::default();
        self.jump(BusState::Running)
    }

    /// Recovering → BusOff
    pub fn abort_recovery(&mut self) -> Transitions {
        if self.state != BusState::Recovering {
            return Transitions::new();
        }
        self.jump(BusState::BusOff)
    }

    /// 由计数决定的目标状态
    fn classify(&self) -> BusState {
        let ErrorCounters { tec, rec, .. } = self.counters;
        let t = &self.thresholds;
        if tec >= t.bus_off {
            BusState::BusOff
        } else if tec >= t.passive || rec >= t.passive {
            BusState::ErrorPassive
        } else if tec >= t.warning || rec >= t.warning {
            BusState::ErrorWarning
        } else {
            BusState::Running
        }
    }

    /// 逐级移动到目标状态
    fn settle(&mut self) -> Transitions {
        let mut out = Transitions::new();
        let target = self.classify();
        let Some(target_level) = target.level() else {
            return out;
        };

        while self.state != target {
            let Some(current) = self.state.level() else {
                break;
            };
            // Bus-Off 只能由恢复流程退出
            if self.state == BusState::BusOff {
                break;
            }
            let next = if target_level > current {
                current + 1
            } else {
                current - 1
            };
            out.extend(self.jump(BusState::from_level(next)));
        }
        out
    }

    fn jump(&mut self, to: BusState) -> Transitions {
        let transition = Transition {
            from: self.state,
            to,
            tec: self.counters.tec,
            rec: self.counters.rec,
        };
        self.state = to;
        let mut out = Transitions::new();
        out.push(transition);
        out
    }
}
