//! 驱动层错误类型定义

use canbus_hal::HalError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 配置非法（波特率、队列深度、引脚、阈值等）
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// 控制器已在运行（或尚未停止）
    #[error("Bus controller already running")]
    AlreadyRunning,

    /// 控制器未运行，或当前状态不允许该操作（如 Bus-Off 时发送）
    #[error("Bus controller not running")]
    NotRunning,

    /// 底层硬件故障（包括 IO 线程无法启动或退出）
    #[error("Hardware fault: {0}")]
    HardwareFault(#[from] HalError),

    /// 发送队列已满且等待超时
    #[error("Transmit queue full")]
    QueueFull,

    /// 操作超时
    #[error("Operation timeout")]
    Timeout,

    /// Bus-Off 恢复失败，状态保持 Bus-Off
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// 过滤规则非法
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// 只听模式下不允许发送
    #[error("Controller is in listen-only mode")]
    ListenOnly,
}

impl DriverError {
    /// 调用方可以直接重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::QueueFull | DriverError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::DriverError;
    use canbus_hal::{DeviceError, DeviceErrorKind, HalError};

    #[test]
    fn test_driver_error_display() {
        assert_eq!(DriverError::QueueFull.to_string(), "Transmit queue full");
        assert_eq!(DriverError::Timeout.to_string(), "Operation timeout");
        assert_eq!(
            DriverError::NotRunning.to_string(),
            "Bus controller not running"
        );

        let msg = DriverError::RecoveryFailed("bus not quiescent".to_string()).to_string();
        assert!(msg.contains("Recovery failed") && msg.contains("bus not quiescent"));

        let msg = DriverError::InvalidConfiguration("tx_queue_depth must be > 0".into()).to_string();
        assert!(msg.contains("tx_queue_depth"));
    }

    #[test]
    fn test_from_hal_error() {
        let hal = HalError::Device(DeviceError::new(DeviceErrorKind::NotFound, "can9"));
        let err: DriverError = hal.into();
        match err {
            DriverError::HardwareFault(HalError::Device(e)) => {
                assert_eq!(e.kind, DeviceErrorKind::NotFound)
            },
            other => panic!("Expected HardwareFault, got {:?}", other),
        }
    }

    #[test]
    fn test_transient_errors() {
        assert!(DriverError::QueueFull.is_transient());
        assert!(DriverError::Timeout.is_transient());
        assert!(!DriverError::NotRunning.is_transient());
        assert!(!DriverError::RecoveryFailed(String::new()).is_transient());
    }
}
