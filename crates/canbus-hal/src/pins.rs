//! 引脚协作者接口
//!
//! CAN 控制器需要两根引脚（TX / RX）。引脚由 GPIO 服务统一管理，
//! 驱动层只持有不透明的 [`PinHandle`]，在启动时申请、停止时释放。

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// 不透明引脚句柄（由 GPIO 服务分配）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct PinHandle(u32);

impl PinHandle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO{}", self.0)
    }
}

/// 引脚服务错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    #[error("{0} is not a valid pin")]
    Invalid(PinHandle),
    #[error("{0} is already in use")]
    InUse(PinHandle),
    #[error("{0} is not claimed")]
    NotClaimed(PinHandle),
}

/// 引脚服务（GPIO 协作者）
pub trait PinProvider: Send + Sync {
    /// 检查句柄是否指向可用于 CAN 的引脚（不占用）
    fn validate(&self, pin: PinHandle) -> Result<(), PinError>;

    /// 占用引脚
    fn request(&self, pin: PinHandle) -> Result<(), PinError>;

    /// 释放引脚
    fn release(&self, pin: PinHandle) -> Result<(), PinError>;
}

/// 引脚池：固定的合法引脚集合 + 占用表
///
/// # 示例
///
/// ```
/// use canbus_hal::{GpioPool, PinHandle, PinProvider};
///
/// let pool = GpioPool::new(0..=39);
/// let tx = PinHandle::new(21);
/// pool.request(tx).unwrap();
/// assert!(pool.request(tx).is_err());
/// pool.release(tx).unwrap();
/// ```
#[derive(Debug)]
pub struct GpioPool {
    valid: BTreeSet<u32>,
    claimed: Mutex<BTreeSet<PinHandle>>,
}

impl GpioPool {
    pub fn new(pins: impl IntoIterator<Item = u32>) -> Self {
        Self {
            valid: pins.into_iter().collect(),
            claimed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn is_claimed(&self, pin: PinHandle) -> bool {
        self.claimed.lock().contains(&pin)
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.lock().len()
    }
}

impl PinProvider for GpioPool {
    fn validate(&self, pin: PinHandle) -> Result<(), PinError> {
        if self.valid.contains(&pin.raw()) {
            Ok(())
        } else {
            Err(PinError::Invalid(pin))
        }
    }

    fn request(&self, pin: PinHandle) -> Result<(), PinError> {
        self.validate(pin)?;
        if !self.claimed.lock().insert(pin) {
            return Err(PinError::InUse(pin));
        }
        Ok(())
    }

    fn release(&self, pin: PinHandle) -> Result<(), PinError> {
        if !self.claimed.lock().remove(&pin) {
            return Err(PinError::NotClaimed(pin));
        }
        Ok(())
    }
}

/// 无引脚管理的平台（如 SocketCAN、虚拟总线）：所有操作直接成功
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPins;

impl PinProvider for NoPins {
    fn validate(&self, _pin: PinHandle) -> Result<(), PinError> {
        Ok(())
    }

    fn request(&self, _pin: PinHandle) -> Result<(), PinError> {
        Ok(())
    }

    fn release(&self, _pin: PinHandle) -> Result<(), PinError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_request_release() {
        let pool = GpioPool::new([4, 5]);
        let pin = PinHandle::new(4);

        pool.request(pin).unwrap();
        assert!(pool.is_claimed(pin));
        assert_eq!(pool.request(pin), Err(PinError::InUse(pin)));

        pool.release(pin).unwrap();
        assert_eq!(pool.release(pin), Err(PinError::NotClaimed(pin)));
        assert_eq!(pool.claimed_count(), 0);
    }

    #[test]
    fn test_pool_rejects_unknown_pin() {
        let pool = GpioPool::new(0..=3);
        let pin = PinHandle::new(40);
        assert_eq!(pool.validate(pin), Err(PinError::Invalid(pin)));
        assert_eq!(pool.request(pin), Err(PinError::Invalid(pin)));
    }
}
