//! 进程内虚拟 CAN 总线
//!
//! 多个 [`VirtualCanHardware`] 节点挂在同一条 [`VirtualBus`] 上，行为模拟真实控制器：
//!
//! - **Normal**：帧投递给同波特率的在线节点；没有节点应答时发送失败（ACK 错误）
//! - **Loopback**：帧回环给自身，同时照常上总线，不需要应答
//! - **ListenOnly**：只接收，不发送，不应答
//!
//! 每个节点只有一个发送邮箱：上一帧的 `TransmitComplete` 被取走之前 `tx_ready()` 为 `false`。
//!
//! [`FaultInjector`] 在节点交给驱动层之前克隆出来，用于在测试中制造各种总线故障。
//!
//! # 示例
//!
//! ```
//! use canbus_hal::{CanHardware, HardwareEvent, HardwareSettings, OperatingMode, VirtualBus};
//! use canbus_protocol::{BaudRate, CanFrame};
//! use std::time::Duration;
//!
//! let bus = VirtualBus::new();
//! let mut a = bus.attach();
//! let mut b = bus.attach();
//!
//! let settings = HardwareSettings { timing: BaudRate::Kbps500.timing(), mode: OperatingMode::Normal };
//! a.start(&settings).unwrap();
//! b.start(&settings).unwrap();
//!
//! a.transmit(&CanFrame::new_standard(0x42, &[1]).unwrap()).unwrap();
//! match b.poll_event(Duration::from_millis(10)).unwrap() {
//!     Some(HardwareEvent::FrameReceived(frame)) => assert_eq!(frame.id(), 0x42),
//!     other => panic!("unexpected event: {:?}", other),
//! }
//! ```

use crate::{
    BusErrorKind, CanHardware, DeviceError, DeviceErrorKind, HalError, HardwareEvent,
    HardwareSettings, OperatingMode,
};
use canbus_protocol::CanFrame;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// 每个节点的发送邮箱数
const MAILBOX_DEPTH: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Offline,
    Online { mode: OperatingMode, bitrate: u32 },
}

#[derive(Debug)]
struct NodeSlot {
    id: usize,
    events: Sender<HardwareEvent>,
    state: NodeState,
}

#[derive(Debug)]
struct BusInner {
    nodes: Vec<NodeSlot>,
    next_id: usize,
}

/// 虚拟总线（可克隆，克隆体共享同一条总线）
#[derive(Debug, Clone)]
pub struct VirtualBus {
    inner: Arc<Mutex<BusInner>>,
    epoch: Instant,
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                nodes: Vec::new(),
                next_id: 0,
            })),
            epoch: Instant::now(),
        }
    }

    /// 挂接一个新节点（初始离线，`start()` 后上线）
    pub fn attach(&self) -> VirtualCanHardware {
        let (events_tx, events_rx) = unbounded();
        let node = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.nodes.push(NodeSlot {
                id,
                events: events_tx.clone(),
                state: NodeState::Offline,
            });
            id
        };

        VirtualCanHardware {
            node,
            name: format!("vcan-node{}", node),
            bus: self.clone(),
            events_tx: events_tx.clone(),
            events_rx,
            faults: Arc::new(FaultState::default()),
            settings: None,
            in_flight: 0,
        }
    }

    /// 当前在线节点数
    pub fn online_nodes(&self) -> usize {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| matches!(n.state, NodeState::Online { .. }))
            .count()
    }

    fn timestamp_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn set_state(&self, node: usize, state: NodeState) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.nodes.iter_mut().find(|n| n.id == node) {
            slot.state = state;
        }
    }

    fn detach(&self, node: usize) {
        self.inner.lock().nodes.retain(|n| n.id != node);
    }

    /// 把帧投递给除发送者以外的同速率在线节点，返回应答节点数
    fn deliver(&self, from: usize, bitrate: u32, frame: &CanFrame) -> usize {
        let stamped = frame.with_timestamp(self.timestamp_us());
        let inner = self.inner.lock();
        let mut acks = 0;
        for slot in inner.nodes.iter().filter(|n| n.id != from) {
            if let NodeState::Online {
                mode,
                bitrate: peer_rate,
            } = slot.state
                && peer_rate == bitrate
            {
                let _ = slot.events.send(HardwareEvent::FrameReceived(stamped));
                if mode != OperatingMode::ListenOnly {
                    acks += 1;
                }
            }
        }
        acks
    }
}

#[derive(Debug, Default)]
struct FaultState {
    hold_tx: AtomicBool,
    fail_start: AtomicBool,
    fail_resets: AtomicU32,
    transmitted: AtomicU64,
    resets: AtomicU32,
}

/// 故障注入器
///
/// 注入的事件进入节点的事件队列，与真实总线事件按顺序交错。
/// 节点 `stop()` / `reset()` 时尚未被取走的事件会被清空。
#[derive(Debug, Clone)]
pub struct FaultInjector {
    faults: Arc<FaultState>,
    events: Sender<HardwareEvent>,
}

impl FaultInjector {
    /// 挂起发送：`tx_ready()` 恒为 `false`，模拟发送邮箱一直被占用
    pub fn hold_transmissions(&self, hold: bool) {
        self.faults.hold_tx.store(hold, Ordering::Release);
    }

    pub fn inject_frame(&self, frame: CanFrame) {
        let _ = self.events.send(HardwareEvent::FrameReceived(frame));
    }

    pub fn inject_error_counters(&self, tec: u16, rec: u16) {
        let _ = self.events.send(HardwareEvent::ErrorCounters { tec, rec });
    }

    pub fn inject_bus_errors(&self, kind: BusErrorKind, count: usize) {
        for _ in 0..count {
            let _ = self.events.send(HardwareEvent::BusError(kind));
        }
    }

    pub fn inject_arbitration_lost(&self) {
        let _ = self.events.send(HardwareEvent::ArbitrationLost);
    }

    pub fn inject_bus_off(&self) {
        let _ = self.events.send(HardwareEvent::BusOff);
    }

    /// 下一次 `start()` 失败
    pub fn fail_next_start(&self) {
        self.faults.fail_start.store(true, Ordering::Release);
    }

    /// 接下来 `count` 次 `reset()` 失败
    pub fn fail_resets(&self, count: u32) {
        self.faults.fail_resets.store(count, Ordering::Release);
    }

    /// 已经上总线的帧数
    pub fn transmitted(&self) -> u64 {
        self.faults.transmitted.load(Ordering::Acquire)
    }

    /// 成功执行的 `reset()` 次数
    pub fn resets(&self) -> u32 {
        self.faults.resets.load(Ordering::Acquire)
    }
}

/// 虚拟总线上的一个控制器节点
#[derive(Debug)]
pub struct VirtualCanHardware {
    node: usize,
    name: String,
    bus: VirtualBus,
    events_tx: Sender<HardwareEvent>,
    events_rx: Receiver<HardwareEvent>,
    faults: Arc<FaultState>,
    settings: Option<HardwareSettings>,
    in_flight: usize,
}

impl VirtualCanHardware {
    pub fn fault_injector(&self) -> FaultInjector {
        FaultInjector {
            faults: self.faults.clone(),
            events: self.events_tx.clone(),
        }
    }

    fn discard_pending_events(&mut self) -> usize {
        self.in_flight = 0;
        self.events_rx.try_iter().count()
    }
}

impl CanHardware for VirtualCanHardware {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, settings: &HardwareSettings) -> Result<(), HalError> {
        if self.faults.fail_start.swap(false, Ordering::AcqRel) {
            return Err(DeviceError::new(DeviceErrorKind::Backend, "injected start failure").into());
        }
        settings.timing.validate().map_err(|e| {
            DeviceError::new(DeviceErrorKind::UnsupportedConfig, e.to_string())
        })?;

        self.discard_pending_events();
        self.settings = Some(*settings);
        self.bus.set_state(
            self.node,
            NodeState::Online {
                mode: settings.mode,
                bitrate: settings.timing.bitrate(),
            },
        );
        debug!(
            "{} online: {} bit/s, {:?}",
            self.name,
            settings.timing.bitrate(),
            settings.mode
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HalError> {
        self.settings = None;
        self.bus.set_state(self.node, NodeState::Offline);
        let discarded = self.discard_pending_events();
        debug!("{} offline ({} pending events discarded)", self.name, discarded);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), HalError> {
        if self.settings.is_none() {
            return Err(HalError::NotStarted);
        }
        let remaining = self.faults.fail_resets.load(Ordering::Acquire);
        if remaining > 0 {
            self.faults.fail_resets.store(remaining - 1, Ordering::Release);
            return Err(DeviceError::new(DeviceErrorKind::Backend, "injected reset failure").into());
        }
        self.discard_pending_events();
        self.faults.resets.fetch_add(1, Ordering::AcqRel);
        debug!("{} controller reset", self.name);
        Ok(())
    }

    fn tx_ready(&self) -> bool {
        self.settings.is_some()
            && !self.faults.hold_tx.load(Ordering::Acquire)
            && self.in_flight < MAILBOX_DEPTH
    }

    fn transmit(&mut self, frame: &CanFrame) -> Result<(), HalError> {
        let settings = self.settings.ok_or(HalError::NotStarted)?;
        if !settings.mode.can_transmit() {
            return Err(HalError::Unsupported(
                "transmit in listen-only mode".to_string(),
            ));
        }
        if self.in_flight >= MAILBOX_DEPTH {
            return Err(DeviceError::new(DeviceErrorKind::Busy, "transmit mailbox occupied").into());
        }

        let acks = self
            .bus
            .deliver(self.node, settings.timing.bitrate(), frame);
        let success = match settings.mode {
            OperatingMode::Loopback => {
                let echo = frame.with_timestamp(self.bus.timestamp_us());
                let _ = self.events_tx.send(HardwareEvent::FrameReceived(echo));
                true
            },
            _ => acks > 0,
        };
        let _ = self.events_tx.send(HardwareEvent::TransmitComplete {
            frame: *frame,
            success,
        });

        self.in_flight += 1;
        self.faults.transmitted.fetch_add(1, Ordering::AcqRel);
        trace!("{} tx {} (acks: {})", self.name, frame, acks);
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn poll_event(&mut self, timeout: Duration) -> Result<Option<HardwareEvent>, HalError> {
        if self.settings.is_none() {
            return Err(HalError::NotStarted);
        }
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => {
                if matches!(event, HardwareEvent::TransmitComplete { .. }) {
                    self.in_flight = self.in_flight.saturating_sub(1);
                }
                Ok(Some(event))
            },
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl Drop for VirtualCanHardware {
    fn drop(&mut self) {
        self.bus.detach(self.node);
    }
}
