//! CAN 总线控制器核心
//!
//! 本 crate 在 [`canbus_hal::CanHardware`] 之上实现一个完整的 CAN 控制器驱动，包括：
//! - 生命周期管理（configure → start → stop，可重复）
//! - 故障限制状态机（Running / ErrorWarning / ErrorPassive / BusOff / Recovering）
//! - 有界收发队列（阻塞 / 超时 / 非阻塞）
//! - 软件验收过滤（运行中原子替换）
//! - 告警锁存与等待
//! - 统计、总线负载与健康诊断
//! - 钩子系统：帧回调、告警回调、异步抓包 [`hooks::FrameTap`]
//!
//! # 线程模型
//!
//! 运行期间由一个 IO 线程独占硬件；应用线程只接触队列与原子状态。
//! 所有公开操作都可以从多个线程并发调用。
//!
//! # 超时约定
//!
//! 所有带 `timeout` 参数的操作：`Duration::ZERO` 表示不等待，
//! [`WAIT_FOREVER`] 表示一直等待。

mod builder;
pub mod alerts;
pub mod config;
pub mod context;
mod controller;
pub mod diagnostics;
mod error;
pub mod hooks;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod state;

use std::time::Duration;

/// 无限等待
pub const WAIT_FOREVER: Duration = Duration::MAX;

pub use alerts::{AlertCenter, AlertFlags};
pub use builder::BusControllerBuilder;
pub use config::{BusConfig, DEFAULT_QUEUE_DEPTH, MAX_QUEUE_DEPTH, PinAssignment};
pub use context::{BusContext, BusProfile};
pub use controller::BusController;
pub use diagnostics::{DiagnosticsSnapshot, FaultKind, HealthMonitor};
pub use error::DriverError;
pub use hooks::{AlertCallback, FrameCallback, FrameTap, HookManager, TapDirection, TappedFrame};
pub use metrics::{BusMetrics, StatisticsSnapshot};
pub use pipeline::{IoLoopConfig, io_loop};
pub use state::{BusState, BusStateMachine, ErrorCounters, ErrorThresholds, Transition};
