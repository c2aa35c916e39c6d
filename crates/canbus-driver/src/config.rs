//! 总线配置
//!
//! [`BusConfig`] 在 `configure()` 时校验并保存，启动后不可修改
//! （修改模式需要 stop → configure → start）。支持从 TOML 加载：
//!
//! ```toml
//! mode = "loopback"
//! tx_queue_depth = 10
//! rx_queue_depth = 10
//!
//! [timing]
//! preset = 500000
//!
//! [[filters]]
//! kind = "mask"
//! id = 0x100
//! mask = 0x700
//! scope = "standard"
//! ```

use crate::alerts::AlertFlags;
use crate::error::DriverError;
use crate::state::ErrorThresholds;
use canbus_hal::{OperatingMode, PinHandle, PinProvider};
use canbus_protocol::{BitTiming, FilterRule, FilterTable, ProtocolError, TimingSpec};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 队列深度上限
pub const MAX_QUEUE_DEPTH: usize = 64;

/// 默认队列深度
pub const DEFAULT_QUEUE_DEPTH: usize = 10;

/// TX / RX 引脚
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PinAssignment {
    pub tx: PinHandle,
    pub rx: PinHandle,
}

/// 总线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// 波特率预设或自定义位时序
    pub timing: TimingSpec,
    pub mode: OperatingMode,
    pub tx_queue_depth: usize,
    pub rx_queue_depth: usize,
    /// 初始过滤规则（空 = 全部接收）
    pub filters: Vec<FilterRule>,
    /// 引脚分配（`None` 表示平台不需要引脚管理）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pins: Option<PinAssignment>,
    /// 启用的告警
    pub alert_mask: AlertFlags,
    pub thresholds: ErrorThresholds,
    /// 连续错误达到该值时判定为不健康
    pub health_error_threshold: u32,
    /// `stop()` 等待在途发送完成的时间
    pub drain_timeout_ms: u64,
    /// 恢复时要求的总线静默时间
    pub recovery_quiet_ms: u64,
    /// 一次恢复的总超时
    pub recovery_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            timing: TimingSpec::default(),
            mode: OperatingMode::Normal,
            tx_queue_depth: DEFAULT_QUEUE_DEPTH,
            rx_queue_depth: DEFAULT_QUEUE_DEPTH,
            filters: Vec::new(),
            pins: None,
            alert_mask: AlertFlags::DEFAULT_ARMED,
            thresholds: ErrorThresholds::default(),
            health_error_threshold: 10,
            drain_timeout_ms: 100,
            recovery_quiet_ms: 50,
            recovery_timeout_ms: 2000,
        }
    }
}

impl BusConfig {
    /// 指定工作模式的默认配置
    pub fn with_mode(mode: OperatingMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// 从 TOML 文本解析（不校验）
    pub fn from_toml_str(text: &str) -> Result<Self, DriverError> {
        toml::from_str(text).map_err(|e| DriverError::InvalidConfiguration(e.to_string()))
    }

    /// 从 TOML 文件加载并校验
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DriverError::InvalidConfiguration(format!("{}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, DriverError> {
        toml::to_string(self).map_err(|e| DriverError::InvalidConfiguration(e.to_string()))
    }

    /// 校验配置（不检查引脚，引脚由 [`BusConfig::validate_pins`] 检查）
    ///
    /// # 错误
    ///
    /// - `InvalidConfiguration`: 位时序、队列深度、阈值或超时非法
    /// - `InvalidFilter`: 过滤规则非法
    pub fn validate(&self) -> Result<(), DriverError> {
        self.bit_timing()?;

        for (name, depth) in [
            ("tx_queue_depth", self.tx_queue_depth),
            ("rx_queue_depth", self.rx_queue_depth),
        ] {
            if depth == 0 || depth > MAX_QUEUE_DEPTH {
                return Err(DriverError::InvalidConfiguration(format!(
                    "{} must be in 1..={} (got {})",
                    name, MAX_QUEUE_DEPTH, depth
                )));
            }
        }

        self.thresholds.validate().map_err(DriverError::InvalidConfiguration)?;

        if self.health_error_threshold == 0 {
            return Err(DriverError::InvalidConfiguration(
                "health_error_threshold must be > 0".to_string(),
            ));
        }
        if self.recovery_quiet_ms >= self.recovery_timeout_ms {
            return Err(DriverError::InvalidConfiguration(format!(
                "recovery_quiet_ms ({}) must be less than recovery_timeout_ms ({})",
                self.recovery_quiet_ms, self.recovery_timeout_ms
            )));
        }
        if let Some(pins) = self.pins
            && pins.tx == pins.rx
        {
            return Err(DriverError::InvalidConfiguration(format!(
                "tx and rx must be different pins (both {})",
                pins.tx
            )));
        }

        self.filter_table()?;
        Ok(())
    }

    /// 通过引脚服务检查引脚句柄
    pub fn validate_pins(&self, provider: &dyn PinProvider) -> Result<(), DriverError> {
        if let Some(pins) = self.pins {
            for pin in [pins.tx, pins.rx] {
                provider
                    .validate(pin)
                    .map_err(|e| DriverError::InvalidConfiguration(e.to_string()))?;
            }
        }
        Ok(())
    }

    pub fn bit_timing(&self) -> Result<BitTiming, DriverError> {
        self.timing
            .resolve()
            .map_err(|e| DriverError::InvalidConfiguration(e.to_string()))
    }

    pub fn filter_table(&self) -> Result<FilterTable, DriverError> {
        FilterTable::new(self.filters.clone()).map_err(filter_error)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn recovery_quiet(&self) -> Duration {
        Duration::from_millis(self.recovery_quiet_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// 过滤规则错误统一映射为 `InvalidFilter`
pub(crate) fn filter_error(err: ProtocolError) -> DriverError {
    match err {
        ProtocolError::InvalidFilter(msg) => DriverError::InvalidFilter(msg),
        other => DriverError::InvalidFilter(other.to_string()),
    }
}
