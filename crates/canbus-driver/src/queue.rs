//! 有界帧队列
//!
//! 发送队列：应用线程 `push_wait()`，IO 线程 `try_pop()`。
//! 接收队列：IO 线程 `push_evict()`（满时丢弃最旧帧），应用线程 `pop_wait()`。
//!
//! 队列同时持有通道的两端，因此 IO 线程和应用线程都可以从任一端
//! 操作（例如接收队列溢出时由 IO 线程弹出最旧帧）。

use crate::error::DriverError;
use canbus_protocol::CanFrame;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded, select};
use std::time::{Duration, Instant};

/// 入队失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// 等待超时后仍然满
    Full,
    /// 等待期间控制器停止
    Stopped,
}

/// 有界 FIFO 帧队列
#[derive(Debug, Clone)]
pub struct FrameQueue {
    tx: Sender<CanFrame>,
    rx: Receiver<CanFrame>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// 入队，满时最多等待 `timeout`
    ///
    /// 零超时只尝试一次；[`crate::WAIT_FOREVER`] 表示一直等到有空位或停止。
    pub fn push_wait(
        &self,
        frame: CanFrame,
        timeout: Duration,
        stop_rx: &Receiver<()>,
    ) -> Result<(), PushError> {
        match self.tx.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(_)) if timeout.is_zero() => return Err(PushError::Full),
            Err(TrySendError::Full(_)) => {},
            Err(TrySendError::Disconnected(_)) => return Err(PushError::Stopped),
        }

        match Instant::now().checked_add(timeout) {
            Some(_) => {
                select! {
                    send(self.tx, frame) -> res => res.map_err(|_| PushError::Stopped),
                    recv(stop_rx) -> _ => Err(PushError::Stopped),
                    default(timeout) => Err(PushError::Full),
                }
            },
            None => {
                select! {
                    send(self.tx, frame) -> res => res.map_err(|_| PushError::Stopped),
                    recv(stop_rx) -> _ => Err(PushError::Stopped),
                }
            },
        }
    }

    /// 入队；满时丢弃最旧的一帧再入队
    ///
    /// 返回 `true` 表示发生了丢弃。只能有一个生产者（IO 线程）。
    ///
    /// 入队失败后先确认队列仍然是满的再弹出最旧帧：消费者在两次尝试之间
    /// 取走一帧时直接重试入队，不丢帧。消费者恰好在 `is_full()` 与弹出之间
    /// 取帧时仍会丢掉一帧，丢的是当时最旧的帧。
    pub fn push_evict(&self, mut frame: CanFrame) -> bool {
        let mut evicted = false;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return evicted,
                Err(TrySendError::Full(f)) => frame = f,
            }
            if self.rx.is_full() && self.rx.try_recv().is_ok() {
                evicted = true;
            }
        }
    }

    /// 非阻塞出队
    pub fn try_pop(&self) -> Option<CanFrame> {
        match self.rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// 出队，空时最多等待 `timeout`
    ///
    /// # 错误
    ///
    /// - `Timeout`: 超时前没有帧
    /// - `NotRunning`: 等待期间控制器停止
    pub fn pop_wait(&self, timeout: Duration, stop_rx: &Receiver<()>) -> Result<CanFrame, DriverError> {
        if let Some(frame) = self.try_pop() {
            return Ok(frame);
        }
        if timeout.is_zero() {
            return Err(DriverError::Timeout);
        }

        match Instant::now().checked_add(timeout) {
            Some(_) => {
                select! {
                    recv(self.rx) -> res => res.map_err(|_| DriverError::NotRunning),
                    recv(stop_rx) -> _ => Err(DriverError::NotRunning),
                    default(timeout) => Err(DriverError::Timeout),
                }
            },
            None => {
                select! {
                    recv(self.rx) -> res => res.map_err(|_| DriverError::NotRunning),
                    recv(stop_rx) -> _ => Err(DriverError::NotRunning),
                }
            },
        }
    }

    /// 清空队列，返回丢弃的帧数
    pub fn drain(&self) -> usize {
        let mut count = 0;
        while self.rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}

/// 一次运行期间的收发队列
#[derive(Debug, Clone)]
pub struct RunQueues {
    pub tx: FrameQueue,
    pub rx: FrameQueue,
}

impl RunQueues {
    pub fn new(tx_depth: usize, rx_depth: usize) -> Self {
        Self {
            tx: FrameQueue::new(tx_depth),
            rx: FrameQueue::new(rx_depth),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn frame(id: u16) -> CanFrame {
        CanFrame::new_standard(id, &[id as u8]).unwrap()
    }

    #[test]
    fn test_push_wait_zero_timeout_reports_full() {
        let queue = FrameQueue::new(2);
        let (_stop_tx, stop_rx) = bounded::<()>(0);

        assert!(queue.push_wait(frame(1), Duration::ZERO, &stop_rx).is_ok());
        assert!(queue.push_wait(frame(2), Duration::ZERO, &stop_rx).is_ok());
        assert_eq!(
            queue.push_wait(frame(3), Duration::ZERO, &stop_rx),
            Err(PushError::Full)
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_push_wait_times_out() {
        let queue = FrameQueue::new(1);
        let (_stop_tx, stop_rx) = bounded::<()>(0);
        queue.push_wait(frame(1), Duration::ZERO, &stop_rx).unwrap();

        let start = Instant::now();
        let res = queue.push_wait(frame(2), Duration::from_millis(20), &stop_rx);
        assert_eq!(res, Err(PushError::Full));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_push_wait_unblocks_when_space_frees() {
        let queue = FrameQueue::new(1);
        let (_stop_tx, stop_rx) = bounded::<()>(0);
        queue.push_wait(frame(1), Duration::ZERO, &stop_rx).unwrap();

        let consumer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            consumer.try_pop()
        });

        assert!(queue.push_wait(frame(2), Duration::from_secs(2), &stop_rx).is_ok());
        assert_eq!(handle.join().unwrap().unwrap().id(), 1);
        assert_eq!(queue.try_pop().unwrap().id(), 2);
    }

    #[test]
    fn test_push_wait_forever_returns_on_stop() {
        let queue = FrameQueue::new(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        queue.push_wait(frame(1), Duration::ZERO, &stop_rx).unwrap();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(stop_tx);
        });

        assert_eq!(
            queue.push_wait(frame(2), crate::WAIT_FOREVER, &stop_rx),
            Err(PushError::Stopped)
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_push_evict_drops_oldest() {
        let queue = FrameQueue::new(3);
        for id in 1..=3 {
            assert!(!queue.push_evict(frame(id)));
        }
        assert!(queue.push_evict(frame(4)));

        let ids: Vec<u32> = std::iter::from_fn(|| queue.try_pop()).map(|f| f.id()).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_push_evict_keeps_frames_when_consumer_frees_space() {
        let queue = FrameQueue::new(2);
        assert!(!queue.push_evict(frame(1)));
        assert!(!queue.push_evict(frame(2)));
        assert_eq!(queue.try_pop().unwrap().id(), 1);

        assert!(!queue.push_evict(frame(3)));
        let ids: Vec<u32> = std::iter::from_fn(|| queue.try_pop()).map(|f| f.id()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_push_evict_accounting_with_concurrent_consumer() {
        const FRAMES: u16 = 5_000;
        let queue = FrameQueue::new(4);
        let consumer = queue.clone();
        let done = Arc::new(AtomicBool::new(false));
        let done_reader = done.clone();

        let handle = thread::spawn(move || {
            let mut ids = Vec::new();
            loop {
                match consumer.try_pop() {
                    Some(f) => ids.push(f.id()),
                    None if done_reader.load(Ordering::Acquire) => break,
                    None => thread::yield_now(),
                }
            }
            ids.extend(std::iter::from_fn(|| consumer.try_pop()).map(|f| f.id()));
            ids
        });

        let mut evictions = 0usize;
        for i in 0..FRAMES {
            let f = CanFrame::new_standard(i & 0x7FF, &i.to_le_bytes()).unwrap();
            if queue.push_evict(f) {
                evictions += 1;
            }
        }
        done.store(true, Ordering::Release);
        let received = handle.join().unwrap();

        // 每帧要么被消费，要么被计为一次丢弃
        assert_eq!(received.len() + evictions, FRAMES as usize);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_wait_timeout_and_stop() {
        let queue = FrameQueue::new(4);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        assert!(matches!(
            queue.pop_wait(Duration::ZERO, &stop_rx),
            Err(DriverError::Timeout)
        ));
        assert!(matches!(
            queue.pop_wait(Duration::from_millis(5), &stop_rx),
            Err(DriverError::Timeout)
        ));

        drop(stop_tx);
        assert!(matches!(
            queue.pop_wait(crate::WAIT_FOREVER, &stop_rx),
            Err(DriverError::NotRunning)
        ));
    }

    #[test]
    fn test_drain_counts_frames() {
        let queue = FrameQueue::new(8);
        for id in 0..5 {
            queue.push_evict(frame(id));
        }
        assert_eq!(queue.drain(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 8);
    }
}
