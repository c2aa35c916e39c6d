//! Builder 模式实现
//!
//! 提供链式构造 [`BusController`] 的便捷方式。

use crate::config::BusConfig;
use crate::controller::BusController;
use crate::error::DriverError;
use crate::hooks::{AlertCallback, FrameCallback};
use crate::pipeline::IoLoopConfig;
use canbus_hal::{CanHardware, DiagnosticSink, NoPins, PinProvider, TracingSink};
use std::sync::Arc;
use std::time::Duration;

/// BusController Builder（链式构造）
///
/// # Example
///
/// ```
/// use canbus_driver::{BusConfig, BusControllerBuilder};
/// use canbus_hal::{GpioPool, MemorySink, OperatingMode, VirtualBus};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let bus = VirtualBus::new();
/// let sink = Arc::new(MemorySink::new());
///
/// let controller = BusControllerBuilder::new()
///     .hardware(bus.attach())
///     .pin_provider(Arc::new(GpioPool::new(0..=39)))
///     .diagnostic_sink(sink.clone())
///     .poll_interval(Duration::from_micros(500))
///     .config(BusConfig::with_mode(OperatingMode::Loopback))
///     .build()
///     .unwrap();
///
/// controller.start().unwrap();
/// controller.stop().unwrap();
/// assert!(sink.contains("started"));
/// ```
pub struct BusControllerBuilder {
    hardware: Option<Box<dyn CanHardware>>,
    pins: Arc<dyn PinProvider>,
    sink: Arc<dyn DiagnosticSink>,
    io_config: IoLoopConfig,
    config: Option<BusConfig>,
    frame_callbacks: Vec<Arc<dyn FrameCallback>>,
    alert_callbacks: Vec<Arc<dyn AlertCallback>>,
}

impl BusControllerBuilder {
    /// 创建新的 Builder（无引脚管理，诊断输出到 `tracing`）
    pub fn new() -> Self {
        Self {
            hardware: None,
            pins: Arc::new(NoPins),
            sink: Arc::new(TracingSink),
            io_config: IoLoopConfig::default(),
            config: None,
            frame_callbacks: Vec::new(),
            alert_callbacks: Vec::new(),
        }
    }

    /// 设置 CAN 硬件（必需）
    pub fn hardware<H: CanHardware + 'static>(mut self, hardware: H) -> Self {
        self.hardware = Some(Box::new(hardware));
        self
    }

    /// 设置引脚服务（可选，默认不管理引脚）
    pub fn pin_provider(mut self, pins: Arc<dyn PinProvider>) -> Self {
        self.pins = pins;
        self
    }

    /// 设置诊断输出（可选，默认 [`TracingSink`]）
    pub fn diagnostic_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// 构造时直接 `configure()`
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn frame_callback(mut self, callback: Arc<dyn FrameCallback>) -> Self {
        self.frame_callbacks.push(callback);
        self
    }

    pub fn alert_callback(mut self, callback: Arc<dyn AlertCallback>) -> Self {
        self.alert_callbacks.push(callback);
        self
    }

    /// IO 线程轮询间隔（可选，默认 1ms）
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.io_config.poll_interval = interval;
        self
    }

    pub fn io_loop_config(mut self, config: IoLoopConfig) -> Self {
        self.io_config = config;
        self
    }

    /// 构建控制器
    ///
    /// # 错误
    ///
    /// - `InvalidConfiguration`: 没有设置硬件，或 [`config`](Self::config) 校验失败
    pub fn build(self) -> Result<BusController, DriverError> {
        let hardware = self.hardware.ok_or_else(|| {
            DriverError::InvalidConfiguration("no CAN hardware provided".to_string())
        })?;
        if self.io_config.poll_interval.is_zero() || self.io_config.max_events_per_cycle == 0 {
            return Err(DriverError::InvalidConfiguration(format!(
                "invalid IO loop configuration: {:?}",
                self.io_config
            )));
        }

        let controller = BusController::from_parts(hardware, self.pins, self.sink, self.io_config);
        for callback in self.frame_callbacks {
            controller.add_frame_callback(callback);
        }
        for callback in self.alert_callbacks {
            controller.add_alert_callback(callback);
        }
        if let Some(config) = self.config {
            controller.configure(config)?;
        }
        Ok(controller)
    }
}

impl Default for BusControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertFlags;
    use canbus_hal::VirtualBus;

    #[test]
    fn test_build_requires_hardware() {
        assert!(matches!(
            BusControllerBuilder::new().build(),
            Err(DriverError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_build_rejects_zero_poll_interval() {
        let result = BusControllerBuilder::new()
            .hardware(VirtualBus::new().attach())
            .poll_interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_applies_config() {
        let config = BusConfig {
            tx_queue_depth: 3,
            alert_mask: AlertFlags::BUS_OFF,
            ..BusConfig::default()
        };
        let controller = BusControllerBuilder::new()
            .hardware(VirtualBus::new().attach())
            .config(config.clone())
            .build()
            .unwrap();
        assert_eq!(controller.config(), Some(config));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = BusControllerBuilder::new()
            .hardware(VirtualBus::new().attach())
            .config(BusConfig {
                rx_queue_depth: 0,
                ..BusConfig::default()
            })
            .build();
        assert!(matches!(result, Err(DriverError::InvalidConfiguration(_))));
    }
}
