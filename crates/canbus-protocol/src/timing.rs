//! 位时序（Bit Timing）
//!
//! 控制器时钟为 80 MHz，一个位由 `1 + tseg1 + tseg2` 个时间量子组成：
//!
//! ```text
//! bitrate      = clock / (brp * (1 + tseg1 + tseg2))
//! sample_point = (tseg1 + 1) / (1 + tseg1 + tseg2)
//! ```
//!
//! 预设波特率统一使用 `tseg1 = 15, tseg2 = 4, sjw = 3`（采样点 80%），
//! 只调整预分频 `brp`。

use crate::ProtocolError;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 控制器时钟频率（Hz）
pub const CONTROLLER_CLOCK_HZ: u32 = 80_000_000;

const BRP_MAX: u32 = 16_384;
const TSEG1_RANGE: std::ops::RangeInclusive<u8> = 1..=16;
const TSEG2_RANGE: std::ops::RangeInclusive<u8> = 1..=8;
const SJW_RANGE: std::ops::RangeInclusive<u8> = 1..=4;
const MIN_BITRATE: u32 = 1_000;
const MAX_BITRATE: u32 = 1_000_000;

/// 预设波特率（bit/s）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "u32", into = "u32")
)]
pub enum BaudRate {
    Kbps1 = 1_000,
    Kbps5 = 5_000,
    Kbps10 = 10_000,
    Kbps20 = 20_000,
    Kbps25 = 25_000,
    Kbps50 = 50_000,
    Kbps100 = 100_000,
    Kbps125 = 125_000,
    Kbps250 = 250_000,
    Kbps500 = 500_000,
    Kbps800 = 800_000,
    Mbps1 = 1_000_000,
}

impl BaudRate {
    /// 全部预设，按速率升序
    pub const ALL: [BaudRate; 12] = [
        BaudRate::Kbps1,
        BaudRate::Kbps5,
        BaudRate::Kbps10,
        BaudRate::Kbps20,
        BaudRate::Kbps25,
        BaudRate::Kbps50,
        BaudRate::Kbps100,
        BaudRate::Kbps125,
        BaudRate::Kbps250,
        BaudRate::Kbps500,
        BaudRate::Kbps800,
        BaudRate::Mbps1,
    ];

    pub fn bits_per_second(self) -> u32 {
        self.into()
    }

    /// 按速率查找预设
    ///
    /// # 错误
    ///
    /// - `UnsupportedBaudRate`: 不是预设速率
    pub fn from_bitrate(bitrate: u32) -> Result<Self, ProtocolError> {
        BaudRate::try_from(bitrate).map_err(|_| ProtocolError::UnsupportedBaudRate(bitrate))
    }

    /// 预设对应的位时序
    pub fn timing(self) -> BitTiming {
        let brp = match self {
            BaudRate::Kbps1 => 4000,
            BaudRate::Kbps5 => 800,
            BaudRate::Kbps10 => 400,
            BaudRate::Kbps20 => 200,
            BaudRate::Kbps25 => 160,
            BaudRate::Kbps50 => 80,
            BaudRate::Kbps100 => 40,
            BaudRate::Kbps125 => 32,
            BaudRate::Kbps250 => 16,
            BaudRate::Kbps500 => 8,
            BaudRate::Kbps800 => 5,
            BaudRate::Mbps1 => 4,
        };
        BitTiming::new(brp, 15, 4, 3)
    }
}

/// 显式位时序参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BitTiming {
    /// 预分频（1-16384）
    pub brp: u32,
    /// 相位段 1（含传播段，1-16 TQ）
    pub tseg1: u8,
    /// 相位段 2（1-8 TQ）
    pub tseg2: u8,
    /// 同步跳转宽度（1-4 TQ，且不大于 tseg2）
    pub sjw: u8,
    /// 三次采样
    #[cfg_attr(feature = "serde", serde(default))]
    pub triple_sampling: bool,
}

impl BitTiming {
    pub const fn new(brp: u32, tseg1: u8, tseg2: u8, sjw: u8) -> Self {
        Self {
            brp,
            tseg1,
            tseg2,
            sjw,
            triple_sampling: false,
        }
    }

    /// 每位的时间量子数
    pub fn time_quanta(&self) -> u32 {
        1 + u32::from(self.tseg1) + u32::from(self.tseg2)
    }

    /// 实际波特率；`brp == 0` 时返回 0
    pub fn bitrate(&self) -> u32 {
        CONTROLLER_CLOCK_HZ
            .checked_div(self.brp.saturating_mul(self.time_quanta()))
            .unwrap_or(0)
    }

    /// 采样点（百分比）
    pub fn sample_point_percent(&self) -> f32 {
        (f32::from(self.tseg1) + 1.0) * 100.0 / self.time_quanta() as f32
    }

    /// 校验寄存器取值范围和最终波特率
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.brp == 0 || self.brp > BRP_MAX {
            return Err(ProtocolError::InvalidTiming(format!(
                "brp {} out of range 1..={}",
                self.brp, BRP_MAX
            )));
        }
        if !TSEG1_RANGE.contains(&self.tseg1) {
            return Err(ProtocolError::InvalidTiming(format!(
                "tseg1 {} out of range 1..=16",
                self.tseg1
            )));
        }
        if !TSEG2_RANGE.contains(&self.tseg2) {
            return Err(ProtocolError::InvalidTiming(format!(
                "tseg2 {} out of range 1..=8",
                self.tseg2
            )));
        }
        if !SJW_RANGE.contains(&self.sjw) || self.sjw > self.tseg2 {
            return Err(ProtocolError::InvalidTiming(format!(
                "sjw {} must be within 1..=4 and not exceed tseg2 {}",
                self.sjw, self.tseg2
            )));
        }
        let bitrate = self.bitrate();
        if !(MIN_BITRATE..=MAX_BITRATE).contains(&bitrate) {
            return Err(ProtocolError::UnsupportedBaudRate(bitrate));
        }
        Ok(())
    }
}

/// 波特率描述：预设或显式位时序
///
/// TOML 形式：`timing = { preset = 500000 }` 或
/// `timing = { custom = { brp = 8, tseg1 = 15, tseg2 = 4, sjw = 3 } }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum TimingSpec {
    Preset(BaudRate),
    Custom(BitTiming),
}

impl Default for TimingSpec {
    fn default() -> Self {
        TimingSpec::Preset(BaudRate::Kbps500)
    }
}

impl TimingSpec {
    /// 解析为经过校验的位时序
    pub fn resolve(&self) -> Result<BitTiming, ProtocolError> {
        let timing = match self {
            TimingSpec::Preset(rate) => rate.timing(),
            TimingSpec::Custom(timing) => *timing,
        };
        timing.validate()?;
        Ok(timing)
    }
}

impl From<BaudRate> for TimingSpec {
    fn from(rate: BaudRate) -> Self {
        TimingSpec::Preset(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_hit_their_bitrate() {
        for rate in BaudRate::ALL {
            let timing = rate.timing();
            assert!(timing.validate().is_ok(), "{:?}", rate);
            assert_eq!(timing.bitrate(), rate.bits_per_second(), "{:?}", rate);
            assert!((timing.sample_point_percent() - 80.0).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_from_bitrate() {
        assert_eq!(BaudRate::from_bitrate(500_000).unwrap(), BaudRate::Kbps500);
        assert_eq!(
            BaudRate::from_bitrate(333_333).unwrap_err(),
            ProtocolError::UnsupportedBaudRate(333_333)
        );
    }

    #[test]
    fn test_custom_timing_validation() {
        // 80 MHz / (10 * 16) = 500 kbit/s，采样点 75%
        let timing = BitTiming::new(10, 11, 4, 2);
        assert_eq!(timing.bitrate(), 500_000);
        assert!((timing.sample_point_percent() - 75.0).abs() < 0.01);
        assert!(timing.validate().is_ok());

        assert!(BitTiming::new(0, 15, 4, 3).validate().is_err());
        assert!(BitTiming::new(8, 17, 4, 3).validate().is_err());
        assert!(BitTiming::new(8, 15, 9, 3).validate().is_err());
        assert!(BitTiming::new(8, 15, 2, 3).validate().is_err());
        // 2 MHz 超出经典 CAN 上限
        assert!(matches!(
            BitTiming::new(2, 15, 4, 3).validate(),
            Err(ProtocolError::UnsupportedBaudRate(2_000_000))
        ));
    }

    #[test]
    fn test_zero_brp_bitrate_is_zero() {
        assert_eq!(BitTiming::new(0, 15, 4, 3).bitrate(), 0);
    }

    #[test]
    fn test_timing_spec_resolve() {
        assert_eq!(TimingSpec::default().resolve().unwrap().bitrate(), 500_000);
        let custom = TimingSpec::Custom(BitTiming::new(16, 15, 4, 3));
        assert_eq!(custom.resolve().unwrap().bitrate(), 250_000);
    }
}
