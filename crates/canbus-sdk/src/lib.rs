//! CAN Bus SDK - CAN 总线控制器核心
//!
//! 本 SDK 采用分层架构，从底层到高层：
//!
//! - **协议层** (`protocol`): CAN 帧模型、验收过滤表、位时序与波特率预设
//! - **硬件层** (`hal`): 控制器硬件抽象、虚拟总线、SocketCAN 后端、引脚与诊断输出
//! - **驱动层** (`driver`): 生命周期、故障状态机、收发队列、告警、统计与诊断
//!
//! # 快速开始
//!
//! ```rust
//! use canbus_sdk::prelude::*;
//! use std::time::Duration;
//!
//! let bus = VirtualBus::new();
//! let controller = BusControllerBuilder::new()
//!     .hardware(bus.attach())
//!     .config(BusConfig::with_mode(OperatingMode::Loopback))
//!     .build()
//!     .unwrap();
//!
//! controller.start().unwrap();
//! controller
//!     .send(CanFrame::new_standard(0x100, &[1, 2, 3]).unwrap(), Duration::from_millis(10))
//!     .unwrap();
//! let frame = controller.receive(Duration::from_secs(1)).unwrap();
//! assert_eq!(frame.id(), 0x100);
//! controller.stop().unwrap();
//! ```

pub use canbus_driver as driver;
pub use canbus_hal as hal;
pub use canbus_protocol as protocol;

// Prelude 模块
pub mod prelude;

// --- 用户以此为界 ---

// 协议层常用类型
pub use canbus_protocol::{
    BaudRate, BitTiming, CanFrame, FilterRule, FilterTable, FrameScope, ProtocolError, TimingSpec,
};

// 硬件层
pub use canbus_hal::{
    CanHardware, DiagnosticSink, HalError, OperatingMode, PinHandle, PinProvider, VirtualBus,
};

// 驱动层
pub use canbus_driver::{
    AlertFlags, BusConfig, BusController, BusControllerBuilder, BusState, DiagnosticsSnapshot,
    DriverError, StatisticsSnapshot, WAIT_FOREVER,
};

use tracing_subscriber::EnvFilter;

/// 初始化日志（默认 `info` 级别，`RUST_LOG` 优先）
///
/// 同时把 `log` crate 的日志桥接到 `tracing`。重复调用是安全的，
/// 只有第一次生效。
pub fn init_logger() {
    init_logger_with_level("info");
}

/// 初始化日志，指定默认过滤指令（如 `"debug"`、`"canbus_driver=trace"`）
///
/// 设置了 `RUST_LOG` 时以环境变量为准。
pub fn init_logger_with_level(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // 已经初始化过时忽略错误
    let _ = tracing_log::LogTracer::builder()
        .with_max_level(log::LevelFilter::Trace)
        .init();
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
