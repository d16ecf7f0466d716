//! Channel
//!
//! 有界 MPMC 队列。缓冲区满时发送方挂起、空时接收方挂起，
//! 两侧等待集都是监视器，FIFO 唤醒。容量 0 为会合语义：
//! 发送与接收直接碰头，先到的一方停车等另一方

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context;
use crate::error::{ChannelClosed, SendError, TryRecvError, TrySendError};
use crate::monitor::Monitor;

/// Channel 缓冲区及关闭标记
struct Inner<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

/// Channel 本体，两端句柄共享
struct Channel<T> {
    /// 缓冲区容量（0 表示会合）
    capacity: usize,
    inner: Mutex<Inner<T>>,
    /// 缓冲区满时停车的发送方
    producers: Monitor,
    /// 缓冲区空时停车的接收方
    consumers: Monitor,
    /// 存活的发送端数量
    senders: AtomicUsize,
    /// 存活的接收端数量
    receivers: AtomicUsize,
}

impl<T: Send> Channel<T> {
    /// 发送，必要时挂起当前协程
    fn send(&self, value: T) -> Result<(), SendError<T>> {
        loop {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SendError(value));
            }

            // 有缓冲空位，或会合时对面已有人等着
            let deliverable = inner.buffer.len() < self.capacity
                || (self.capacity == 0
                    && inner.buffer.is_empty()
                    && self.consumers.has_waiters());
            if deliverable {
                inner.buffer.push_back(value);
                drop(inner);
                self.consumers.wake_one();
                return Ok(());
            }

            let co = context::current()
                .expect("channel send would block outside of coroutine context");
            co.set_checkpoint("channel send");
            // 入集后才放开状态锁，接收方不会在空档里唤醒；醒来后重试
            self.producers.wait_with(move || drop(inner));
        }
    }

    /// 接收，必要时挂起当前协程
    fn recv(&self) -> Result<T, ChannelClosed> {
        loop {
            let mut inner = self.inner.lock();
            if let Some(value) = inner.buffer.pop_front() {
                drop(inner);
                self.producers.wake_one();
                return Ok(value);
            }
            if inner.closed {
                return Err(ChannelClosed);
            }

            // 会合：先把停车的发送方叫起来，它看到我们入集后交付
            if self.capacity == 0 && self.producers.has_waiters() {
                self.producers.wake_one();
            }

            let co = context::current()
                .expect("channel receive would block outside of coroutine context");
            co.set_checkpoint("channel receive");
            self.consumers.wait_with(move || drop(inner));
        }
    }

    /// 非阻塞发送
    fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TrySendError::Closed(value));
        }
        let deliverable = inner.buffer.len() < self.capacity
            || (self.capacity == 0 && inner.buffer.is_empty() && self.consumers.has_waiters());
        if !deliverable {
            return Err(TrySendError::Full(value));
        }
        inner.buffer.push_back(value);
        drop(inner);
        self.consumers.wake_one();
        Ok(())
    }

    /// 非阻塞接收
    fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.inner.lock();
        match inner.buffer.pop_front() {
            Some(value) => {
                drop(inner);
                self.producers.wake_one();
                Ok(value)
            }
            None if inner.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// 关闭：唤醒两侧全部等待者，让它们观察到关闭
    fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.producers.wake_all();
        self.consumers.wake_all();
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }
}

/// 创建一对 Channel 端点
///
/// `capacity` 为缓冲区容量，0 表示会合 Channel。
/// 两端都可克隆；最后一个发送端或接收端被丢弃时 Channel 自动关闭
pub fn channel<T: Send + 'static>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let chan = Arc::new(Channel {
        capacity,
        inner: Mutex::new(Inner {
            buffer: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        producers: Monitor::new(),
        consumers: Monitor::new(),
        senders: AtomicUsize::new(1),
        receivers: AtomicUsize::new(1),
    });
    (
        Sender {
            chan: Arc::clone(&chan),
        },
        Receiver { chan },
    )
}

/// Channel 发送端
pub struct Sender<T: Send + 'static> {
    chan: Arc<Channel<T>>,
}

impl<T: Send + 'static> Sender<T> {
    /// 发送一个值
    ///
    /// 缓冲区满时挂起当前协程；Channel 关闭时原值随错误返回
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.chan.send(value)
    }

    /// 依次发送多个值，遇到关闭即停止
    pub fn send_all<I>(&self, values: I) -> Result<(), SendError<T>>
    where
        I: IntoIterator<Item = T>,
    {
        for value in values {
            self.chan.send(value)?;
        }
        Ok(())
    }

    /// 非阻塞发送，可在任意线程调用
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.chan.try_send(value)
    }

    /// 关闭 Channel
    pub fn close(&self) {
        self.chan.close();
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    /// 当前缓冲的值数量
    pub fn len(&self) -> usize {
        self.chan.len()
    }

    /// 缓冲区是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 缓冲区容量
    pub fn capacity(&self) -> usize {
        self.chan.capacity
    }
}

impl<T: Send + 'static> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            chan: Arc::clone(&self.chan),
        }
    }
}

impl<T: Send + 'static> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.chan.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.chan.close();
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.chan.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Channel 接收端
pub struct Receiver<T: Send + 'static> {
    chan: Arc<Channel<T>>,
}

impl<T: Send + 'static> Receiver<T> {
    /// 接收一个值
    ///
    /// 缓冲区空时挂起当前协程；关闭且排空后返回 [`ChannelClosed`]
    pub fn recv(&self) -> Result<T, ChannelClosed> {
        self.chan.recv()
    }

    /// 非阻塞接收，可在任意线程调用
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.chan.try_recv()
    }

    /// 关闭 Channel
    pub fn close(&self) {
        self.chan.close();
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    /// 当前缓冲的值数量
    pub fn len(&self) -> usize {
        self.chan.len()
    }

    /// 缓冲区是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 迭代接收，直到 Channel 关闭且排空
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { receiver: self }
    }
}

impl<T: Send + 'static> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.chan.receivers.fetch_add(1, Ordering::Relaxed);
        Self {
            chan: Arc::clone(&self.chan),
        }
    }
}

impl<T: Send + 'static> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.chan.receivers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.chan.close();
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.chan.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 接收端迭代器
pub struct Iter<'a, T: Send + 'static> {
    receiver: &'a Receiver<T>,
}

impl<T: Send + 'static> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv().ok()
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_buffered_fifo() {
        let sched = Scheduler::new(1);
        let (tx, rx) = channel::<i32>(4);
        let received = Arc::new(PlMutex::new(Vec::new()));

        {
            let received = Arc::clone(&received);
            sched
                .go(move || {
                    tx.send(1).unwrap();
                    tx.send(2).unwrap();
                    tx.send(3).unwrap();
                    for _ in 0..3 {
                        received.lock().push(rx.recv().unwrap());
                    }
                })
                .unwrap();
        }

        sched.wait();
        assert_eq!(*received.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_send_blocks_when_full() {
        let sched = Scheduler::new(2);
        let (tx, rx) = channel::<u32>(1);
        let order = Arc::new(PlMutex::new(Vec::new()));

        {
            let order = Arc::clone(&order);
            sched
                .go(move || {
                    tx.send(1).unwrap();
                    order.lock().push("first sent");
                    // 缓冲区已满，这里挂起直到接收方腾出空位
                    tx.send(2).unwrap();
                    order.lock().push("second sent");
                })
                .unwrap();
        }
        {
            let order = Arc::clone(&order);
            sched
                .go(move || {
                    assert_eq!(rx.recv().unwrap(), 1);
                    order.lock().push("first received");
                    assert_eq!(rx.recv().unwrap(), 2);
                })
                .unwrap();
        }

        sched.wait();
        let order = order.lock();
        let first_recv = order.iter().position(|s| *s == "first received").unwrap();
        let second_send = order.iter().position(|s| *s == "second sent").unwrap();
        assert!(first_recv < second_send);
    }

    #[test]
    fn test_close_after_drain_observed() {
        let sched = Scheduler::new(1);
        let (tx, rx) = channel::<i32>(4);
        let observed = Arc::new(AtomicBool::new(false));

        {
            let observed = Arc::clone(&observed);
            sched
                .go(move || {
                    tx.send(7).unwrap();
                    tx.close();
                    assert!(tx.send(8).is_err());
                    // 关闭后仍能取走已缓冲的值
                    assert_eq!(rx.recv().unwrap(), 7);
                    assert_eq!(rx.recv().unwrap_err(), ChannelClosed);
                    observed.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }

        sched.wait();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_close_wakes_parked_receiver() {
        let sched = Scheduler::new(1);
        let (tx, rx) = channel::<i32>(4);
        let observed = Arc::new(AtomicBool::new(false));

        {
            let observed = Arc::clone(&observed);
            sched
                .go(move || {
                    // 空 Channel 上停车，等关闭方唤醒
                    assert_eq!(rx.recv().unwrap_err(), ChannelClosed);
                    observed.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }
        sched
            .go(move || {
                tx.close();
            })
            .unwrap();

        sched.wait();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_last_sender_closes() {
        let sched = Scheduler::new(2);
        let (tx, rx) = channel::<u32>(8);
        let total = Arc::new(AtomicUsize::new(0));

        {
            let total = Arc::clone(&total);
            sched
                .go(move || {
                    // 发送端全部析构后迭代自然终止
                    for v in &rx {
                        total.fetch_add(v as usize, Ordering::Relaxed);
                    }
                })
                .unwrap();
        }
        sched
            .go(move || {
                tx.send_all(1..=4).unwrap();
            })
            .unwrap();

        sched.wait();
        assert_eq!(total.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_drop_receiver_fails_parked_sender() {
        let sched = Scheduler::new(2);
        let (tx, rx) = channel::<u32>(0);
        let failed = Arc::new(AtomicBool::new(false));

        {
            let failed = Arc::clone(&failed);
            sched
                .go(move || {
                    // 会合 Channel 且无接收方，停车直到接收端析构
                    failed.store(tx.send(1).is_err(), Ordering::SeqCst);
                })
                .unwrap();
        }
        sched
            .go(move || {
                crate::context::yield_now();
                drop(rx);
            })
            .unwrap();

        sched.wait();
        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_rendezvous_ping_pong() {
        let sched = Scheduler::new(2);
        let (ping_tx, ping_rx) = channel::<u32>(0);
        let (pong_tx, pong_rx) = channel::<u32>(0);
        let rounds = Arc::new(AtomicUsize::new(0));

        sched
            .go_named("ping", move || {
                for i in 0..100 {
                    ping_tx.send(i).unwrap();
                    assert_eq!(pong_rx.recv().unwrap(), i);
                }
            })
            .unwrap();
        {
            let rounds = Arc::clone(&rounds);
            sched
                .go_named("pong", move || {
                    for _ in 0..100 {
                        let v = ping_rx.recv().unwrap();
                        pong_tx.send(v).unwrap();
                        rounds.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .unwrap();
        }

        sched.wait();
        assert_eq!(rounds.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_fan_in_delivers_every_value() {
        let sched = Arc::new(Scheduler::new(4));
        let (tx, rx) = channel::<(usize, u32)>(16);
        let received = Arc::new(PlMutex::new(HashMap::<usize, Vec<u32>>::new()));

        for producer in 0..20 {
            let tx = tx.clone();
            sched
                .go(move || {
                    for v in 0..10 {
                        tx.send((producer, v)).unwrap();
                    }
                })
                .unwrap();
        }
        drop(tx);

        {
            let received = Arc::clone(&received);
            sched
                .go(move || {
                    for (producer, v) in &rx {
                        received.lock().entry(producer).or_default().push(v);
                    }
                })
                .unwrap();
        }

        sched.wait();
        let received = received.lock();
        assert_eq!(received.len(), 20);
        for producer in 0..20 {
            let mut values = received[&producer].clone();
            values.sort_unstable();
            // 单个生产者的值按发送顺序到达；排序只为断言多重集相等
            assert_eq!(values, (0..10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_per_sender_order_preserved() {
        let sched = Scheduler::new(2);
        let (tx, rx) = channel::<u32>(4);
        let seen = Arc::new(PlMutex::new(Vec::new()));

        sched
            .go(move || {
                tx.send_all(0..20).unwrap();
            })
            .unwrap();
        {
            let seen = Arc::clone(&seen);
            sched
                .go(move || {
                    for v in &rx {
                        seen.lock().push(v);
                    }
                })
                .unwrap();
        }

        sched.wait();
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_try_ops_from_plain_thread() {
        let (tx, rx) = channel::<i32>(1);

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        tx.try_send(5).unwrap();
        assert!(matches!(tx.try_send(6), Err(TrySendError::Full(6))));
        assert_eq!(rx.try_recv().unwrap(), 5);

        tx.close();
        assert!(matches!(tx.try_send(7), Err(TrySendError::Closed(7))));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
    }
}
