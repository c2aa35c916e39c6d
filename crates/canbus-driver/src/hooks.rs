//! 钩子系统（Hook System）
//!
//! 在 IO 线程中，帧被接收/发送完成或告警锁存时触发用户回调。
//!
//! - **非阻塞**: 回调在 IO 线程内同步执行，必须立即返回（推荐 `try_send` 转发）
//! - **职责分离**: `HookManager` 只管理回调列表，同步由 `BusContext` 的 `RwLock` 负责
//! - **帧旁路**: [`FrameTap`] 把收发帧转发到有界通道，通道满时丢帧计数，不阻塞 IO 线程
//!
//! # 使用示例
//!
//! ```rust
//! use canbus_driver::hooks::{FrameTap, HookManager};
//! use canbus_driver::AlertFlags;
//! use std::sync::Arc;
//!
//! let mut hooks = HookManager::new();
//!
//! let (tap, _rx) = FrameTap::new(1024);
//! hooks.add_callback(Arc::new(tap));
//! hooks.add_alert_callback(Arc::new(|flags: AlertFlags| {
//!     println!("alerts: {:?}", flags);
//! }));
//!
//! assert_eq!(hooks.len(), 2);
//! ```

use crate::alerts::AlertFlags;
use canbus_protocol::CanFrame;
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 帧回调 Trait
///
/// # 性能要求
///
/// - 在 IO 线程中调用，禁止阻塞（Mutex、I/O）
/// - 推荐使用 `crossbeam_channel::Sender::try_send` 转发
pub trait FrameCallback: Send + Sync {
    /// 收到一帧且通过过滤器后调用
    fn on_frame_received(&self, frame: &CanFrame);

    /// 一帧发送成功后调用（可选）
    ///
    /// 只在控制器报告发送完成后触发，失败的帧不会出现在这里。
    fn on_frame_sent(&self, frame: &CanFrame) {
        let _ = frame;
    }
}

/// 告警回调 Trait
pub trait AlertCallback: Send + Sync {
    /// `flags` 是本次实际锁存的告警位（已按 armed 掩码过滤）
    fn on_alert(&self, flags: AlertFlags);
}

impl<F> AlertCallback for F
where
    F: Fn(AlertFlags) + Send + Sync,
{
    fn on_alert(&self, flags: AlertFlags) {
        self(flags)
    }
}

/// 钩子管理器
///
/// 回调列表本身不是线程安全的，需要外部同步（`RwLock<HookManager>`）。
#[derive(Default)]
pub struct HookManager {
    callbacks: Vec<Arc<dyn FrameCallback>>,
    alert_callbacks: Vec<Arc<dyn AlertCallback>>,
}

impl HookManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            callbacks: Vec::new(),
            alert_callbacks: Vec::new(),
        }
    }

    pub fn add_callback(&mut self, callback: Arc<dyn FrameCallback>) {
        self.callbacks.push(callback);
    }

    pub fn add_alert_callback(&mut self, callback: Arc<dyn AlertCallback>) {
        self.alert_callbacks.push(callback);
    }

    /// 移除所有回调
    pub fn clear(&mut self) {
        self.callbacks.clear();
        self.alert_callbacks.clear();
    }

    /// 触发所有接收回调（在 IO 线程中调用）
    pub fn trigger_all(&self, frame: &CanFrame) {
        for callback in self.callbacks.iter() {
            callback.on_frame_received(frame);
        }
    }

    /// 触发所有发送回调
    pub fn trigger_all_sent(&self, frame: &CanFrame) {
        for callback in self.callbacks.iter() {
            callback.on_frame_sent(frame);
        }
    }

    /// 触发所有告警回调（空集合不触发）
    pub fn trigger_alerts(&self, flags: AlertFlags) {
        if flags.is_empty() {
            return;
        }
        for callback in self.alert_callbacks.iter() {
            callback.on_alert(flags);
        }
    }

    /// 回调总数（帧回调 + 告警回调）
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len() + self.alert_callbacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.alert_callbacks.is_empty()
    }
}

impl std::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookManager")
            .field("frame_callbacks", &self.callbacks.len())
            .field("alert_callbacks", &self.alert_callbacks.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapDirection {
    Rx,
    Tx,
}

/// 旁路输出的一帧
#[derive(Debug, Clone, Copy)]
pub struct TappedFrame {
    pub direction: TapDirection,
    pub frame: CanFrame,
}

/// 基于有界通道的帧旁路
///
/// ```rust
/// use canbus_driver::hooks::{FrameCallback, FrameTap, TapDirection};
/// use canbus_protocol::CanFrame;
///
/// let (tap, rx) = FrameTap::new(16);
/// let frame = CanFrame::new_standard(0x100, &[0xAA]).unwrap();
/// tap.on_frame_received(&frame);
///
/// assert_eq!(rx.try_recv().unwrap().direction, TapDirection::Rx);
/// assert_eq!(tap.dropped_frames().load(std::sync::atomic::Ordering::Relaxed), 0);
/// ```
pub struct FrameTap {
    tx: Sender<TappedFrame>,
    dropped_frames: Arc<AtomicU64>,
    frame_counter: Arc<AtomicU64>,
    include_sent: bool,
}

impl FrameTap {
    /// 同时转发接收和发送的帧
    #[must_use]
    pub fn new(capacity: usize) -> (Self, Receiver<TappedFrame>) {
        Self::with_direction(capacity, true)
    }

    /// 只转发接收的帧
    #[must_use]
    pub fn rx_only(capacity: usize) -> (Self, Receiver<TappedFrame>) {
        Self::with_direction(capacity, false)
    }

    fn with_direction(capacity: usize, include_sent: bool) -> (Self, Receiver<TappedFrame>) {
        let (tx, rx) = bounded(capacity.max(1));
        let tap = Self {
            tx,
            dropped_frames: Arc::new(AtomicU64::new(0)),
            frame_counter: Arc::new(AtomicU64::new(0)),
            include_sent,
        };
        (tap, rx)
    }

    /// 丢帧计数（通道满）
    #[must_use]
    pub fn dropped_frames(&self) -> &Arc<AtomicU64> {
        &self.dropped_frames
    }

    /// 成功转发的帧数
    #[must_use]
    pub fn frame_counter(&self) -> &Arc<AtomicU64> {
        &self.frame_counter
    }

    fn forward(&self, direction: TapDirection, frame: &CanFrame) {
        let tapped = TappedFrame {
            direction,
            frame: *frame,
        };
        if self.tx.try_send(tapped).is_ok() {
            self.frame_counter.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl FrameCallback for FrameTap {
    #[inline]
    fn on_frame_received(&self, frame: &CanFrame) {
        self.forward(TapDirection::Rx, frame);
    }

    #[inline]
    fn on_frame_sent(&self, frame: &CanFrame) {
        if self.include_sent {
            self.forward(TapDirection::Tx, frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingCallback {
        received: AtomicU64,
        sent: AtomicU64,
    }

    impl CountingCallback {
        fn new() -> Self {
            Self {
                received: AtomicU64::new(0),
                sent: AtomicU64::new(0),
            }
        }
    }

    impl FrameCallback for CountingCallback {
        fn on_frame_received(&self, _frame: &CanFrame) {
            self.received.fetch_add(1, Ordering::Relaxed);
        }

        fn on_frame_sent(&self, _frame: &CanFrame) {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_hook_manager_triggers_every_callback() {
        let mut hooks = HookManager::new();
        let a = Arc::new(CountingCallback::new());
        let b = Arc::new(CountingCallback::new());
        hooks.add_callback(a.clone());
        hooks.add_callback(b.clone());

        let frame = CanFrame::new_standard(0x123, &[1, 2]).unwrap();
        hooks.trigger_all(&frame);
        hooks.trigger_all(&frame);
        hooks.trigger_all_sent(&frame);

        assert_eq!(a.received.load(Ordering::Relaxed), 2);
        assert_eq!(b.received.load(Ordering::Relaxed), 2);
        assert_eq!(a.sent.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_alert_closure_callback() {
        let mut hooks = HookManager::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_cb = seen.clone();
        hooks.add_alert_callback(Arc::new(move |flags: AlertFlags| {
            seen_cb.fetch_or(flags.bits(), Ordering::Relaxed);
        }));

        hooks.trigger_alerts(AlertFlags::empty());
        assert_eq!(seen.load(Ordering::Relaxed), 0);

        hooks.trigger_alerts(AlertFlags::BUS_OFF);
        assert_eq!(seen.load(Ordering::Relaxed), AlertFlags::BUS_OFF.bits());
    }

    #[test]
    fn test_clear() {
        let mut hooks = HookManager::new();
        hooks.add_callback(Arc::new(CountingCallback::new()));
        hooks.add_alert_callback(Arc::new(|_: AlertFlags| {}));
        assert_eq!(hooks.len(), 2);

        hooks.clear();
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_tap_drops_when_full() {
        let (tap, rx) = FrameTap::new(2);
        let frame = CanFrame::new_standard(0x10, &[]).unwrap();

        for _ in 0..5 {
            tap.on_frame_received(&frame);
        }

        assert_eq!(tap.frame_counter().load(Ordering::Relaxed), 2);
        assert_eq!(tap.dropped_frames().load(Ordering::Relaxed), 3);
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_rx_only_ignores_sent_frames() {
        let (tap, rx) = FrameTap::rx_only(8);
        let frame = CanFrame::new_extended(0x1234, &[1]).unwrap();

        tap.on_frame_sent(&frame);
        assert!(rx.try_recv().is_err());

        tap.on_frame_received(&frame);
        assert_eq!(rx.try_recv().unwrap().frame.id(), 0x1234);
    }

    #[test]
    fn test_sent_frames_are_tagged() {
        let (tap, rx) = FrameTap::new(8);
        let frame = CanFrame::new_standard(0x7FF, &[9]).unwrap();
        tap.on_frame_sent(&frame);
        assert_eq!(rx.try_recv().unwrap().direction, TapDirection::Tx);
    }
}
