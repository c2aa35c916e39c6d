//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use canbus_sdk::prelude::*;
//! ```

// 控制器（推荐入口）
pub use canbus_driver::{BusConfig, BusController, BusControllerBuilder, WAIT_FOREVER};

// 状态、告警与观测
pub use canbus_driver::{AlertFlags, BusState, DiagnosticsSnapshot, StatisticsSnapshot};

// 钩子
pub use canbus_driver::{AlertCallback, FrameCallback, FrameTap};

// 帧与过滤
pub use canbus_protocol::{BaudRate, CanFrame, FilterRule, FrameScope, TimingSpec};

// 硬件与协作者
pub use canbus_hal::{CanHardware, OperatingMode, PinProvider, VirtualBus};

// 错误类型
pub use canbus_driver::DriverError;
pub use canbus_hal::HalError;
pub use canbus_protocol::ProtocolError;
