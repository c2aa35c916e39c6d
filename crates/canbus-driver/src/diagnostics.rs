//! 健康诊断
//!
//! 连续错误计数 + 最近一次故障；与状态机、队列深度一起组成
//! [`DiagnosticsSnapshot`]。

use crate::state::BusState;
use canbus_hal::OperatingMode;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// 故障分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// 发送完成但失败
    TransmitFailed,
    /// 总线错误
    BusError,
    /// 硬件接口返回错误
    Hardware,
    /// 进入 Bus-Off
    BusOff,
    /// 接收队列溢出
    RxOverflow,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::TransmitFailed => "transmit failed",
            FaultKind::BusError => "bus error",
            FaultKind::Hardware => "hardware fault",
            FaultKind::BusOff => "bus-off",
            FaultKind::RxOverflow => "rx overflow",
        };
        f.write_str(name)
    }
}

/// 连续错误跟踪
#[derive(Debug)]
pub struct HealthMonitor {
    consecutive_errors: AtomicU32,
    threshold: AtomicU32,
    last_error: Mutex<Option<(FaultKind, Instant)>>,
}

impl HealthMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_errors: AtomicU32::new(0),
            threshold: AtomicU32::new(threshold),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_threshold(&self, threshold: u32) {
        self.threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn threshold(&self) -> u32 {
        self.threshold.load(Ordering::Relaxed)
    }

    /// 记录一次故障
    ///
    /// 只有错误类故障（发送失败、总线错误、硬件故障）计入连续错误；
    /// Bus-Off 和溢出只更新最近故障。
    pub fn record_fault(&self, kind: FaultKind) {
        if matches!(
            kind,
            FaultKind::TransmitFailed | FaultKind::BusError | FaultKind::Hardware
        ) {
            self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_error.lock() = Some((kind, Instant::now()));
    }

    /// 任意一次成功的收发都会清零连续错误计数
    #[inline]
    pub fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<(FaultKind, Duration)> {
        self.last_error.lock().map(|(kind, at)| (kind, at.elapsed()))
    }

    /// 健康判定：不处于 ErrorPassive / BusOff，且连续错误低于阈值
    pub fn is_healthy(&self, state: BusState) -> bool {
        !matches!(state, BusState::ErrorPassive | BusState::BusOff)
            && self.consecutive_errors() < self.threshold()
    }

    pub fn reset(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
        *self.last_error.lock() = None;
    }
}

/// 诊断快照
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub state: BusState,
    pub mode: OperatingMode,
    pub tec: u16,
    pub rec: u16,
    pub arbitration_lost: u32,
    pub bus_errors: u32,
    pub consecutive_errors: u32,
    pub healthy: bool,
    pub tx_queue_len: usize,
    pub tx_queue_capacity: usize,
    pub rx_queue_len: usize,
    pub rx_queue_capacity: usize,
    pub last_error: Option<FaultKind>,
    /// 距最近一次故障的时间（毫秒）
    pub last_error_age_ms: Option<u64>,
}
