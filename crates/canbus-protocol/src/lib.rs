//! # CAN Protocol Layer
//!
//! 经典 CAN（CAN 2.0A / 2.0B）帧模型、验收过滤器与位时序定义。
//!
//! 本 crate 不做任何 I/O，只描述"一帧是什么"、"哪些帧应被接收"以及
//! "控制器以什么位时序工作"。物理层编码（CRC、ACK、位填充）由硬件负责。
//!
//! # 示例
//!
//! ```
//! use canbus_protocol::CanFrame;
//!
//! let frame = CanFrame::new_standard(0x123, &[1, 2, 3, 4]).unwrap();
//! assert_eq!(frame.id(), 0x123);
//! assert_eq!(frame.data(), &[1, 2, 3, 4]);
//!
//! // 标准帧 ID 只有 11 位
//! assert!(CanFrame::new_standard(0x800, &[]).is_err());
//! ```

pub mod filter;
pub mod timing;

pub use filter::{FilterRule, FilterTable, FrameScope, MAX_FILTER_RULES};
pub use timing::{BaudRate, BitTiming, CONTROLLER_CLOCK_HZ, TimingSpec};

use std::fmt;
use thiserror::Error;

/// 标准帧（11-bit）ID 掩码
pub const STANDARD_ID_MASK: u32 = 0x7FF;

/// 扩展帧（29-bit）ID 掩码
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// 经典 CAN 最大数据长度
pub const MAX_DATA_LEN: usize = 8;

/// 返回给定帧格式下 ID 的合法位宽掩码
pub const fn id_mask(is_extended: bool) -> u32 {
    if is_extended {
        EXTENDED_ID_MASK
    } else {
        STANDARD_ID_MASK
    }
}

/// 协议层错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid CAN ID: 0x{id:X} (extended: {extended})")]
    InvalidCanId { id: u32, extended: bool },

    #[error("Invalid frame length: max {max}, got {actual}")]
    InvalidLength { max: usize, actual: usize },

    #[error("Invalid bit timing: {0}")]
    InvalidTiming(String),

    #[error("Unsupported baud rate: {0} bit/s")]
    UnsupportedBaudRate(u32),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
}

/// 经典 CAN 帧
///
/// 构造后不可变：所有字段私有，只能通过校验过的构造器创建。
/// 接收路径可以通过 [`CanFrame::with_timestamp`] 得到一个带时间戳的副本。
///
/// # 不变量
///
/// - `id` 不超过帧格式对应的位宽（11 或 29 位）
/// - `len <= 8`
/// - 远程帧（RTR）只携带 DLC，不携带数据字节
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "FrameRepr", into = "FrameRepr")
)]
pub struct CanFrame {
    /// CAN ID（标准帧或扩展帧）
    id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    data: [u8; 8],

    /// DLC (0-8)，对数据帧即有效数据长度
    len: u8,

    /// 是否为扩展帧（29-bit ID）
    is_extended: bool,

    /// 是否为远程帧
    is_remote: bool,

    /// 接收时间戳（微秒），0 表示不可用
    timestamp_us: u64,
}

impl CanFrame {
    /// 创建标准数据帧
    ///
    /// # 错误
    ///
    /// - `InvalidCanId`: `id > 0x7FF`
    /// - `InvalidLength`: `data.len() > 8`
    pub fn new_standard(id: u16, data: &[u8]) -> Result<Self, ProtocolError> {
        Self::new_data(u32::from(id), data, false)
    }

    /// 创建扩展数据帧
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, ProtocolError> {
        Self::new_data(id, data, true)
    }

    /// 创建标准远程帧（只携带 DLC）
    pub fn new_remote_standard(id: u16, dlc: u8) -> Result<Self, ProtocolError> {
        Self::new_remote(u32::from(id), dlc, false)
    }

    /// 创建扩展远程帧（只携带 DLC）
    pub fn new_remote_extended(id: u32, dlc: u8) -> Result<Self, ProtocolError> {
        Self::new_remote(id, dlc, true)
    }

    fn new_data(id: u32, data: &[u8], is_extended: bool) -> Result<Self, ProtocolError> {
        check_id(id, is_extended)?;
        if data.len() > MAX_DATA_LEN {
            return Err(ProtocolError::InvalidLength {
                max: MAX_DATA_LEN,
                actual: data.len(),
            });
        }

        let mut fixed = [0u8; 8];
        fixed[..data.len()].copy_from_slice(data);

        Ok(Self {
            id,
            data: fixed,
            len: data.len() as u8,
            is_extended,
            is_remote: false,
            timestamp_us: 0,
        })
    }

    fn new_remote(id: u32, dlc: u8, is_extended: bool) -> Result<Self, ProtocolError> {
        check_id(id, is_extended)?;
        if usize::from(dlc) > MAX_DATA_LEN {
            return Err(ProtocolError::InvalidLength {
                max: MAX_DATA_LEN,
                actual: usize::from(dlc),
            });
        }

        Ok(Self {
            id,
            data: [0u8; 8],
            len: dlc,
            is_extended,
            is_remote: true,
            timestamp_us: 0,
        })
    }

    /// 获取 CAN ID
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    /// 数据长度码（远程帧为请求的长度）
    pub fn dlc(&self) -> u8 {
        self.len
    }

    /// 有效数据切片；远程帧恒为空
    pub fn data(&self) -> &[u8] {
        if self.is_remote {
            &[]
        } else {
            &self.data[..usize::from(self.len)]
        }
    }

    /// 接收时间戳（微秒），0 表示不可用
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// 返回带接收时间戳的副本
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// 帧在总线上的名义位数（不含位填充）
    ///
    /// 标准帧 47 位开销，扩展帧 67 位开销，外加 8 × 数据字节。
    /// 用于估算总线负载率。
    pub fn bit_length(&self) -> u32 {
        let overhead = if self.is_extended { 67 } else { 47 };
        overhead + 8 * self.data().len() as u32
    }

    /// 与另一帧的 ID、格式标志和数据是否一致（忽略时间戳）
    pub fn same_content(&self, other: &CanFrame) -> bool {
        self.id == other.id
            && self.is_extended == other.is_extended
            && self.is_remote == other.is_remote
            && self.len == other.len
            && self.data() == other.data()
    }
}

fn check_id(id: u32, is_extended: bool) -> Result<(), ProtocolError> {
    if id & !id_mask(is_extended) != 0 {
        return Err(ProtocolError::InvalidCanId { id, extended: is_extended });
    }
    Ok(())
}

/// candump 风格：`123#DEADBEEF`、`12345678#R2`
impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended {
            write!(f, "{:08X}#", self.id)?;
        } else {
            write!(f, "{:03X}#", self.id)?;
        }
        if self.is_remote {
            return write!(f, "R{}", self.len);
        }
        for byte in self.data() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// 序列化中间表示，反序列化时重新走构造器校验
#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
struct FrameRepr {
    id: u32,
    #[serde(default)]
    extended: bool,
    #[serde(default)]
    remote: bool,
    #[serde(default)]
    dlc: Option<u8>,
    #[serde(default)]
    data: Vec<u8>,
    #[serde(default)]
    timestamp_us: u64,
}

#[cfg(feature = "serde")]
impl TryFrom<FrameRepr> for CanFrame {
    type Error = ProtocolError;

    fn try_from(repr: FrameRepr) -> Result<Self, Self::Error> {
        let frame = if repr.remote {
            let dlc = repr.dlc.unwrap_or(0);
            CanFrame::new_remote(repr.id, dlc, repr.extended)?
        } else {
            CanFrame::new_data(repr.id, &repr.data, repr.extended)?
        };
        Ok(frame.with_timestamp(repr.timestamp_us))
    }
}

#[cfg(feature = "serde")]
impl From<CanFrame> for FrameRepr {
    fn from(frame: CanFrame) -> Self {
        Self {
            id: frame.id,
            extended: frame.is_extended,
            remote: frame.is_remote,
            dlc: frame.is_remote.then_some(frame.len),
            data: frame.data().to_vec(),
            timestamp_us: frame.timestamp_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_standard_frame_limits() {
        assert!(CanFrame::new_standard(0x7FF, &[]).is_ok());
        assert_eq!(
            CanFrame::new_standard(0x800, &[]).unwrap_err(),
            ProtocolError::InvalidCanId {
                id: 0x800,
                extended: false
            }
        );
    }

    #[test]
    fn test_extended_frame_limits() {
        assert!(CanFrame::new_extended(0x1FFF_FFFF, &[0; 8]).is_ok());
        assert!(CanFrame::new_extended(0x2000_0000, &[]).is_err());
    }

    #[test]
    fn test_data_too_long() {
        let err = CanFrame::new_standard(0x100, &[0; 9]).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidLength { max: 8, actual: 9 });
    }

    #[test]
    fn test_remote_frame_has_no_payload() {
        let frame = CanFrame::new_remote_standard(0x321, 4).unwrap();
        assert!(frame.is_remote());
        assert_eq!(frame.dlc(), 4);
        assert!(frame.data().is_empty());
        assert!(CanFrame::new_remote_extended(0x1234, 9).is_err());
    }

    #[test]
    fn test_bit_length() {
        let std = CanFrame::new_standard(0x1, &[0; 8]).unwrap();
        assert_eq!(std.bit_length(), 47 + 64);
        let ext = CanFrame::new_extended(0x1, &[]).unwrap();
        assert_eq!(ext.bit_length(), 67);
        let rtr = CanFrame::new_remote_standard(0x1, 8).unwrap();
        assert_eq!(rtr.bit_length(), 47);
    }

    #[test]
    fn test_display_candump_style() {
        let frame = CanFrame::new_standard(0x123, &[0xDE, 0xAD]).unwrap();
        assert_eq!(frame.to_string(), "123#DEAD");
        let frame = CanFrame::new_remote_extended(0x1ABC, 2).unwrap();
        assert_eq!(frame.to_string(), "00001ABC#R2");
    }

    #[test]
    fn test_timestamp_does_not_change_content() {
        let frame = CanFrame::new_standard(0x10, &[1, 2]).unwrap();
        let stamped = frame.with_timestamp(42);
        assert_eq!(stamped.timestamp_us(), 42);
        assert!(frame.same_content(&stamped));
        assert_ne!(frame, stamped);
    }

    proptest! {
        #[test]
        fn prop_standard_id_validation(id in 0u16..=u16::MAX, len in 0usize..=8) {
            let data = vec![0xA5; len];
            let result = CanFrame::new_standard(id, &data);
            prop_assert_eq!(result.is_ok(), u32::from(id) <= STANDARD_ID_MASK);
            if let Ok(frame) = result {
                prop_assert_eq!(frame.data(), data.as_slice());
                prop_assert_eq!(usize::from(frame.dlc()), len);
            }
        }

        #[test]
        fn prop_extended_id_validation(id in any::<u32>()) {
            let result = CanFrame::new_extended(id, &[1]);
            prop_assert_eq!(result.is_ok(), id <= EXTENDED_ID_MASK);
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_rejects_invalid_id() {
        let json = r#"{"id": 4096, "data": [1, 2]}"#;
        assert!(serde_json::from_str::<CanFrame>(json).is_err());

        let json = r#"{"id": 4095, "extended": true, "data": [1, 2]}"#;
        let frame: CanFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.id(), 4095);
        assert!(frame.is_extended());
    }
}
