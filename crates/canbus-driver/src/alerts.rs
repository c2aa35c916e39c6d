//! 告警（Alert）
//!
//! 告警是一组位标志。驱动在事件发生时调用 [`AlertCenter::raise`]，
//! 只有已启用（armed）的位会被锁存到待读取集合中；[`AlertCenter::wait`]
//! 阻塞直到有待读取的告警，然后一次性取走并清空。
//!
//! 状态迁移对应的告警见 [`AlertFlags::for_transition`]。

use crate::error::DriverError;
use crate::state::BusState;
use crossbeam_channel::{Receiver, Sender, bounded, select};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// 告警位集合
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertFlags(u32);

impl AlertFlags {
    /// 发送队列已清空且无在途发送
    pub const TX_IDLE: Self = Self(0x0001);
    /// 一帧发送成功
    pub const TX_SUCCESS: Self = Self(0x0002);
    /// 接收队列中有新帧
    pub const RX_DATA: Self = Self(0x0004);
    /// 一帧发送失败
    pub const TX_FAILED: Self = Self(0x0008);
    /// 从 ErrorPassive 回到 ErrorWarning（重新 error-active）
    pub const ERR_ACTIVE: Self = Self(0x0010);
    /// 进入 ErrorWarning
    pub const ABOVE_ERR_WARN: Self = Self(0x0020);
    /// 从 ErrorWarning 回到 Running
    pub const BELOW_ERR_WARN: Self = Self(0x0040);
    /// 进入 ErrorPassive
    pub const ERR_PASS: Self = Self(0x0080);
    /// 进入 Bus-Off
    pub const BUS_OFF: Self = Self(0x0100);
    /// Bus-Off 恢复完成
    pub const BUS_RECOVERED: Self = Self(0x0200);
    /// 仲裁失败
    pub const ARB_LOST: Self = Self(0x0400);
    /// 总线错误
    pub const BUS_ERROR: Self = Self(0x0800);
    /// 接收队列溢出（最旧帧被丢弃）
    pub const RX_QUEUE_FULL: Self = Self(0x1000);
    /// 开始 Bus-Off 恢复
    pub const RECOVERY_IN_PROGRESS: Self = Self(0x2000);
    /// 发送队列满，`send()` 被拒绝
    pub const TX_QUEUE_FULL: Self = Self(0x4000);

    /// 所有错误类告警
    pub const ALL_ERRORS: Self = Self(0x1F88);
    /// 默认启用的告警
    pub const DEFAULT_ARMED: Self = Self(0x5FA8);
    pub const ALL: Self = Self(0x7FFF);

    const NAMES: [(Self, &'static str); 15] = [
        (Self::TX_IDLE, "TX_IDLE"),
        (Self::TX_SUCCESS, "TX_SUCCESS"),
        (Self::RX_DATA, "RX_DATA"),
        (Self::TX_FAILED, "TX_FAILED"),
        (Self::ERR_ACTIVE, "ERR_ACTIVE"),
        (Self::ABOVE_ERR_WARN, "ABOVE_ERR_WARN"),
        (Self::BELOW_ERR_WARN, "BELOW_ERR_WARN"),
        (Self::ERR_PASS, "ERR_PASS"),
        (Self::BUS_OFF, "BUS_OFF"),
        (Self::BUS_RECOVERED, "BUS_RECOVERED"),
        (Self::ARB_LOST, "ARB_LOST"),
        (Self::BUS_ERROR, "BUS_ERROR"),
        (Self::RX_QUEUE_FULL, "RX_QUEUE_FULL"),
        (Self::RECOVERY_IN_PROGRESS, "RECOVERY_IN_PROGRESS"),
        (Self::TX_QUEUE_FULL, "TX_QUEUE_FULL"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// 丢弃未定义的位
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// 已置位的告警名
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
    }

    /// 状态迁移对应的告警
    pub fn for_transition(from: BusState, to: BusState) -> Self {
        use BusState::*;
        match (from, to) {
            (Running, ErrorWarning) => Self::ABOVE_ERR_WARN,
            (ErrorWarning, ErrorPassive) => Self::ERR_PASS,
            (ErrorPassive, BusOff) => Self::BUS_OFF,
            (ErrorPassive, ErrorWarning) => Self::ERR_ACTIVE,
            (ErrorWarning, Running) => Self::BELOW_ERR_WARN,
            (BusOff, Recovering) => Self::RECOVERY_IN_PROGRESS,
            (Recovering, Running) => Self::BUS_RECOVERED,
            (Recovering, BusOff) => Self::BUS_OFF,
            _ => Self::empty(),
        }
    }
}

impl BitOr for AlertFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AlertFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AlertFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for AlertFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("AlertFlags(empty)");
        }
        f.write_str("AlertFlags(")?;
        for (i, name) in self.names().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
        }
        f.write_str(")")
    }
}

/// 告警锁存与等待
///
/// `raise()` 可在任意线程调用（通常是 IO 线程），`wait()` 由应用线程调用。
/// 唤醒通道容量为 1：多次 `raise()` 合并成一次唤醒，实际内容始终以
/// `pending` 为准。
pub struct AlertCenter {
    armed: AtomicU32,
    pending: AtomicU32,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl AlertCenter {
    pub fn new(armed: AlertFlags) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            armed: AtomicU32::new(armed.bits()),
            pending: AtomicU32::new(0),
            wake_tx,
            wake_rx,
        }
    }

    pub fn armed(&self) -> AlertFlags {
        AlertFlags::from_bits_truncate(self.armed.load(Ordering::Acquire))
    }

    pub fn set_armed(&self, armed: AlertFlags) {
        self.armed.store(armed.bits(), Ordering::Release);
    }

    /// 锁存已启用的位，返回实际锁存的部分
    pub fn raise(&self, flags: AlertFlags) -> AlertFlags {
        let latched = flags & self.armed();
        if latched.is_empty() {
            return latched;
        }
        self.pending.fetch_or(latched.bits(), Ordering::AcqRel);
        let _ = self.wake_tx.try_send(());
        latched
    }

    /// 当前待读取的告警（不清空）
    pub fn peek(&self) -> AlertFlags {
        AlertFlags::from_bits_truncate(self.pending.load(Ordering::Acquire))
    }

    /// 取走并清空待读取的告警
    pub fn take(&self) -> AlertFlags {
        AlertFlags::from_bits_truncate(self.pending.swap(0, Ordering::AcqRel))
    }

    /// 等待告警
    ///
    /// # 参数
    ///
    /// - `timeout`: 零表示不阻塞，[`crate::WAIT_FOREVER`] 表示无限等待
    /// - `stop_rx`: 控制器停止时断开的通道
    ///
    /// # 错误
    ///
    /// - `Timeout`: 超时前没有任何告警
    /// - `NotRunning`: 等待期间控制器被停止且没有待读取的告警
    pub fn wait(&self, timeout: Duration, stop_rx: &Receiver<()>) -> Result<AlertFlags, DriverError> {
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let flags = self.take();
            if !flags.is_empty() {
                return Ok(flags);
            }

            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(DriverError::Timeout);
                    }
                    select! {
                        recv(self.wake_rx) -> _ => {},
                        recv(stop_rx) -> _ => return self.take_or_stopped(),
                        default(remaining) => return self.take_or_timeout(),
                    }
                },
                None => {
                    select! {
                        recv(self.wake_rx) -> _ => {},
                        recv(stop_rx) -> _ => return self.take_or_stopped(),
                    }
                },
            }
        }
    }

    fn take_or_stopped(&self) -> Result<AlertFlags, DriverError> {
        let flags = self.take();
        if flags.is_empty() {
            Err(DriverError::NotRunning)
        } else {
            Ok(flags)
        }
    }

    fn take_or_timeout(&self) -> Result<AlertFlags, DriverError> {
        let flags = self.take();
        if flags.is_empty() {
            Err(DriverError::Timeout)
        } else {
            Ok(flags)
        }
    }
}

impl fmt::Debug for AlertCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertCenter")
            .field("armed", &self.armed())
            .field("pending", &self.peek())
            .finish()
    }
}
