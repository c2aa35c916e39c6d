//! # CAN Hardware Abstraction Layer
//!
//! CAN 控制器硬件抽象层。驱动层只通过 [`CanHardware`] 与控制器交互：
//! 提交发送请求、轮询硬件完成事件（收到帧、发送完成、错误计数变化等）。
//!
//! 同时提供驱动层依赖的两个外部协作者接口：
//!
//! - [`PinProvider`]：TX/RX 引脚的申请与释放
//! - [`DiagnosticSink`]：即发即弃的诊断消息输出
//!
//! 以及一个进程内的虚拟总线 [`VirtualBus`]（带故障注入），用于测试和自检。

use std::time::Duration;
use thiserror::Error;

pub use canbus_protocol::{BitTiming, CanFrame, FilterTable};

pub mod pins;
pub mod sink;
pub mod virtual_bus;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use pins::{GpioPool, NoPins, PinError, PinHandle, PinProvider};
pub use sink::{DiagnosticSink, MemorySink, NullSink, SinkLevel, TracingSink};
pub use virtual_bus::{FaultInjector, VirtualBus, VirtualCanHardware};

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use self::socketcan::SocketCanHardware;

/// 硬件层统一错误类型
#[derive(Error, Debug)]
pub enum HalError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] DeviceError),
    #[error("Pin Error: {0}")]
    Pin(#[from] PinError),
    #[error("Operation timeout")]
    Timeout,
    #[error("Device not started")]
    NotStarted,
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// 设备错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    Unknown,
    NotFound,
    Busy,
    UnsupportedConfig,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 不可通过复位恢复的错误
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, DeviceErrorKind::NotFound | DeviceErrorKind::UnsupportedConfig)
    }
}

impl From<String> for DeviceError {
    fn from(message: String) -> Self {
        Self::new(DeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for DeviceError {
    fn from(message: &str) -> Self {
        Self::new(DeviceErrorKind::Unknown, message)
    }
}

/// 控制器工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum OperatingMode {
    /// 正常收发，需要其他节点应答
    #[default]
    Normal,
    /// 只听模式：只接收，不发送也不应答
    ListenOnly,
    /// 自检模式：发送的帧回环给自身，无需应答
    Loopback,
}

impl OperatingMode {
    pub fn can_transmit(self) -> bool {
        !matches!(self, OperatingMode::ListenOnly)
    }
}

/// 总线错误发生的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusErrorKind {
    /// 发送时检测到的错误（TEC 增加）
    Transmit,
    /// 接收时检测到的错误（REC 增加）
    Receive,
}

/// 硬件完成事件
///
/// 由控制器在中断/完成上下文中产生，驱动层的 IO 线程逐个消费。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareEvent {
    /// 收到一帧（尚未经过软件过滤）
    FrameReceived(CanFrame),
    /// 一次发送请求完成
    TransmitComplete { frame: CanFrame, success: bool },
    /// 控制器报告的绝对错误计数
    ErrorCounters { tec: u16, rec: u16 },
    /// 单次总线错误
    BusError(BusErrorKind),
    /// 仲裁失败
    ArbitrationLost,
    /// 控制器直接报告进入 Bus-Off
    BusOff,
}

/// 启动参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareSettings {
    pub timing: BitTiming,
    pub mode: OperatingMode,
}

/// CAN 控制器硬件接口
///
/// 运行期间由驱动层的 IO 线程独占（因此只要求 `Send`）。
///
/// # 约定
///
/// - `transmit()` 只在 `tx_ready()` 为 `true` 时调用
/// - 每次成功的 `transmit()` 最终产生一个 `TransmitComplete` 事件
/// - `poll_event()` 最多阻塞 `timeout`，无事件时返回 `Ok(None)`
/// - `reset()` 清空控制器内部状态和错误计数，但保持已启动
pub trait CanHardware: Send {
    /// 用于日志的设备名
    fn name(&self) -> &str {
        "can"
    }

    fn start(&mut self, settings: &HardwareSettings) -> Result<(), HalError>;

    fn stop(&mut self) -> Result<(), HalError>;

    fn reset(&mut self) -> Result<(), HalError>;

    /// 下发硬件过滤器（可选，默认全部交给软件过滤）
    fn apply_filters(&mut self, _filters: &FilterTable) -> Result<(), HalError> {
        Ok(())
    }

    /// 发送邮箱是否空闲
    fn tx_ready(&self) -> bool;

    fn transmit(&mut self, frame: &CanFrame) -> Result<(), HalError>;

    /// 已提交但尚未完成的发送数
    fn in_flight(&self) -> usize;

    fn poll_event(&mut self, timeout: Duration) -> Result<Option<HardwareEvent>, HalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hal_error_display() {
        let err = HalError::Device(DeviceError::new(DeviceErrorKind::Busy, "mailbox full"));
        assert_eq!(err.to_string(), "Device Error: Busy: mailbox full");

        let err: HalError = PinError::InUse(PinHandle::new(4)).into();
        assert!(err.to_string().contains("GPIO4"), "{}", err);

        assert_eq!(HalError::NotStarted.to_string(), "Device not started");
    }

    #[test]
    fn test_device_error_fatal() {
        assert!(DeviceError::new(DeviceErrorKind::NotFound, "can9").is_fatal());
        assert!(!DeviceError::from("transient").is_fatal());
    }

    #[test]
    fn test_listen_only_cannot_transmit() {
        assert!(OperatingMode::Normal.can_transmit());
        assert!(OperatingMode::Loopback.can_transmit());
        assert!(!OperatingMode::ListenOnly.can_transmit());
    }
}
