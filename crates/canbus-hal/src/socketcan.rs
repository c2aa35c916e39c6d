//! SocketCAN 硬件后端
//!
//! 基于 Linux SocketCAN 子系统实现 [`CanHardware`]。
//!
//! ## 限制
//!
//! - **仅限 Linux 平台**
//! - **接口配置**：波特率、只听模式、控制器重启策略由系统工具（`ip link`）配置，
//!   不在应用层设置。`start()` 只记录期望的位时序，不修改接口
//! - **发送完成**：内核接受帧即视为发送完成（SocketCAN 不回报 ACK 结果）
//! - **reset()**：重新打开 socket；控制器级别的 Bus-Off 重启需要
//!   `ip link set canX type can restart` 或 `restart-ms`

use crate::{
    BusErrorKind, CanHardware, DeviceError, DeviceErrorKind, HalError, HardwareEvent,
    HardwareSettings, OperatingMode,
};
use canbus_protocol::{CanFrame, FilterRule, FilterTable, FrameScope};
use ::socketcan::{
    CanError as SocketCanError, CanFilter, CanFrame as SocketFrame, CanSocket, ControllerProblem,
    EmbeddedFrame, ExtendedId, Frame, Id, Socket, SocketOptions, StandardId,
};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const CAN_EFF_FLAG: u32 = 0x8000_0000;

/// SO_RCVTIMEO 为 0 表示永久阻塞，轮询超时不得低于该值
const MIN_READ_TIMEOUT: Duration = Duration::from_micros(100);

/// 错误计数的下限（控制器问题帧不一定携带计数值）
const WARNING_FLOOR: u16 = 96;
const PASSIVE_FLOOR: u16 = 128;

/// SocketCAN 控制器
///
/// # 示例
///
/// ```no_run
/// use canbus_hal::{CanHardware, HardwareSettings, OperatingMode, SocketCanHardware};
/// use canbus_protocol::BaudRate;
///
/// let mut hw = SocketCanHardware::new("can0");
/// hw.start(&HardwareSettings {
///     timing: BaudRate::Kbps500.timing(),
///     mode: OperatingMode::Normal,
/// })
/// .unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanHardware {
    interface: String,
    socket: Option<CanSocket>,
    settings: Option<HardwareSettings>,
    kernel_filters: Vec<CanFilter>,
    pending: VecDeque<HardwareEvent>,
    in_flight: usize,
}

impl SocketCanHardware {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            socket: None,
            settings: None,
            kernel_filters: Vec::new(),
            pending: VecDeque::new(),
            in_flight: 0,
        }
    }

    fn open(&self, mode: OperatingMode) -> Result<CanSocket, HalError> {
        let socket = CanSocket::open(&self.interface).map_err(|e| {
            DeviceError::new(
                DeviceErrorKind::NotFound,
                format!(
                    "Failed to open CAN interface '{}': {}. Check it exists and is UP:\n  sudo ip link set up {}",
                    self.interface, e, self.interface
                ),
            )
        })?;

        socket.set_error_filter_accept_all()?;
        if mode == OperatingMode::Loopback {
            socket.set_loopback(true)?;
            socket.set_recv_own_msgs(true)?;
        }
        if !self.kernel_filters.is_empty() {
            socket.set_filters(&self.kernel_filters)?;
        }
        Ok(socket)
    }

    fn socket(&self) -> Result<&CanSocket, HalError> {
        self.socket.as_ref().ok_or(HalError::NotStarted)
    }

    fn to_socket_frame(frame: &CanFrame) -> Result<SocketFrame, HalError> {
        let id: Option<Id> = if frame.is_extended() {
            ExtendedId::new(frame.id()).map(Id::Extended)
        } else {
            StandardId::new(frame.id() as u16).map(Id::Standard)
        };
        let id = id.ok_or_else(|| {
            DeviceError::new(
                DeviceErrorKind::InvalidFrame,
                format!("invalid CAN ID 0x{:X}", frame.id()),
            )
        })?;

        let socket_frame = if frame.is_remote() {
            SocketFrame::new_remote(id, usize::from(frame.dlc()))
        } else {
            SocketFrame::new(id, frame.data())
        };
        socket_frame.ok_or_else(|| {
            DeviceError::new(
                DeviceErrorKind::InvalidFrame,
                format!("failed to build frame {}", frame),
            )
            .into()
        })
    }

    fn from_socket_frame(frame: &SocketFrame) -> Result<CanFrame, HalError> {
        let id = frame.raw_id();
        let converted = match (frame.is_extended(), frame.is_remote_frame()) {
            (false, false) => CanFrame::new_standard(id as u16, frame.data()),
            (true, false) => CanFrame::new_extended(id, frame.data()),
            (false, true) => CanFrame::new_remote_standard(id as u16, frame.dlc() as u8),
            (true, true) => CanFrame::new_remote_extended(id, frame.dlc() as u8),
        };
        converted
            .map_err(|e| DeviceError::new(DeviceErrorKind::InvalidFrame, e.to_string()).into())
    }

    /// 将错误帧映射为硬件事件；无对应事件时返回 `None`
    fn map_error_frame(data: &[u8], error: SocketCanError) -> Option<HardwareEvent> {
        let reported_tec = u16::from(data.get(6).copied().unwrap_or(0));
        let reported_rec = u16::from(data.get(7).copied().unwrap_or(0));

        match error {
            SocketCanError::BusOff => {
                error!("CAN Bus Off error detected");
                Some(HardwareEvent::BusOff)
            },
            SocketCanError::LostArbitration(bit) => {
                trace!("Arbitration lost at bit {}", bit);
                Some(HardwareEvent::ArbitrationLost)
            },
            SocketCanError::ControllerProblem(problem) => {
                let (tec_floor, rec_floor) = match problem {
                    ControllerProblem::TransmitErrorWarning => (WARNING_FLOOR, 0),
                    ControllerProblem::ReceiveErrorWarning => (0, WARNING_FLOOR),
                    ControllerProblem::TransmitErrorPassive => (PASSIVE_FLOOR, 0),
                    ControllerProblem::ReceiveErrorPassive => (0, PASSIVE_FLOOR),
                    ControllerProblem::Active => (0, 0),
                    other => {
                        warn!("CAN Controller Problem: {}, ignoring", other);
                        return None;
                    },
                };
                Some(HardwareEvent::ErrorCounters {
                    tec: reported_tec.max(tec_floor),
                    rec: reported_rec.max(rec_floor),
                })
            },
            SocketCanError::NoAck | SocketCanError::TransmitTimeout => {
                Some(HardwareEvent::BusError(BusErrorKind::Transmit))
            },
            SocketCanError::ProtocolViolation { .. }
            | SocketCanError::TransceiverError
            | SocketCanError::BusError => Some(HardwareEvent::BusError(BusErrorKind::Receive)),
            SocketCanError::Restarted => {
                info!("CAN controller restarted");
                Some(HardwareEvent::ErrorCounters { tec: 0, rec: 0 })
            },
            other => {
                warn!("CAN Error Frame received: {}, ignoring", other);
                None
            },
        }
    }

    fn rule_to_kernel_filters(rule: &FilterRule) -> Vec<CanFilter> {
        let (format_bits, format_mask) = match rule.scope() {
            FrameScope::Standard => (0, CAN_EFF_FLAG),
            FrameScope::Extended => (CAN_EFF_FLAG, CAN_EFF_FLAG),
            FrameScope::Both => (0, 0),
        };
        match rule {
            FilterRule::Mask { id, mask, .. } => {
                vec![CanFilter::new(id | format_bits, mask | format_mask)]
            },
            FilterRule::List { ids, scope } => ids
                .iter()
                .map(|id| {
                    let width = canbus_protocol::id_mask(*scope != FrameScope::Standard);
                    CanFilter::new(id | format_bits, width | format_mask)
                })
                .collect(),
        }
    }
}

impl CanHardware for SocketCanHardware {
    fn name(&self) -> &str {
        &self.interface
    }

    fn start(&mut self, settings: &HardwareSettings) -> Result<(), HalError> {
        let socket = self.open(settings.mode)?;
        debug!(
            "SocketCAN '{}' opened; bitrate {} bit/s and {:?} mode are expected to match `ip link` configuration",
            self.interface,
            settings.timing.bitrate(),
            settings.mode
        );
        self.socket = Some(socket);
        self.settings = Some(*settings);
        self.pending.clear();
        self.in_flight = 0;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HalError> {
        self.socket = None;
        self.settings = None;
        self.pending.clear();
        self.in_flight = 0;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), HalError> {
        let settings = self.settings.ok_or(HalError::NotStarted)?;
        self.socket = None;
        self.pending.clear();
        self.in_flight = 0;
        self.socket = Some(self.open(settings.mode)?);
        info!("SocketCAN '{}' reopened", self.interface);
        Ok(())
    }

    fn apply_filters(&mut self, filters: &FilterTable) -> Result<(), HalError> {
        self.kernel_filters = filters
            .rules()
            .iter()
            .flat_map(Self::rule_to_kernel_filters)
            .collect();
        if let Some(socket) = &self.socket {
            if self.kernel_filters.is_empty() {
                socket.set_filter_accept_all()?;
            } else {
                socket.set_filters(&self.kernel_filters)?;
            }
        }
        Ok(())
    }

    fn tx_ready(&self) -> bool {
        self.socket.is_some()
    }

    fn transmit(&mut self, frame: &CanFrame) -> Result<(), HalError> {
        let settings = self.settings.ok_or(HalError::NotStarted)?;
        if !settings.mode.can_transmit() {
            return Err(HalError::Unsupported(
                "transmit in listen-only mode".to_string(),
            ));
        }
        let socket_frame = Self::to_socket_frame(frame)?;
        self.socket()?.write_frame(&socket_frame)?;

        self.in_flight += 1;
        self.pending.push_back(HardwareEvent::TransmitComplete {
            frame: *frame,
            success: true,
        });
        trace!("Sent CAN frame: {}", frame);
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn poll_event(&mut self, timeout: Duration) -> Result<Option<HardwareEvent>, HalError> {
        if let Some(event) = self.pending.pop_front() {
            if matches!(event, HardwareEvent::TransmitComplete { .. }) {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            return Ok(Some(event));
        }

        let socket = self.socket()?;
        socket.set_read_timeout(timeout.max(MIN_READ_TIMEOUT))?;
        let frame = match socket.read_frame() {
            Ok(frame) => frame,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None);
            },
            Err(e) => return Err(HalError::Io(e)),
        };

        match frame {
            SocketFrame::Error(error_frame) => {
                let data = error_frame.data().to_vec();
                Ok(Self::map_error_frame(&data, error_frame.into_error()))
            },
            other => Ok(Some(HardwareEvent::FrameReceived(
                Self::from_socket_frame(&other)?,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_to_kernel_filters() {
        let filters = SocketCanHardware::rule_to_kernel_filters(&FilterRule::list(
            vec![0x10, 0x20],
            FrameScope::Standard,
        ));
        assert_eq!(filters.len(), 2);

        let filters = SocketCanHardware::rule_to_kernel_filters(&FilterRule::mask(
            0x100,
            0x700,
            FrameScope::Both,
        ));
        assert_eq!(filters.len(), 1);
    }

    #[test]
    fn test_frame_conversion_keeps_content() {
        let frame = CanFrame::new_extended(0x1234_5678 & 0x1FFF_FFFF, &[1, 2, 3]).unwrap();
        let socket_frame = SocketCanHardware::to_socket_frame(&frame).unwrap();
        let back = SocketCanHardware::from_socket_frame(&socket_frame).unwrap();
        assert!(back.same_content(&frame));
    }

    #[test]
    fn test_error_frame_mapping() {
        let data = [0, 0, 0, 0, 0, 0, 100, 3];
        assert_eq!(
            SocketCanHardware::map_error_frame(&data, SocketCanError::BusOff),
            Some(HardwareEvent::BusOff)
        );
        assert_eq!(
            SocketCanHardware::map_error_frame(
                &data,
                SocketCanError::ControllerProblem(ControllerProblem::TransmitErrorPassive)
            ),
            Some(HardwareEvent::ErrorCounters { tec: 128, rec: 3 })
        );
        assert_eq!(
            SocketCanHardware::map_error_frame(&data, SocketCanError::NoAck),
            Some(HardwareEvent::BusError(BusErrorKind::Transmit))
        );
    }
}
