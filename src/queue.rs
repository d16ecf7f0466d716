//! 运行队列
//!
//! 每个处理器持有一个有界本地队列：拥有者从队首弹出、向队尾推入，
//! 窃取者从队尾成批取走；调度器另持有一个无界全局溢出队列

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::coroutine::Coroutine;

/// 本地队列默认容量
pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 256;

/// 处理器的本地运行队列
///
/// FIFO 有界队列。长度计数独立于锁维护，
/// 供调度器在不加锁的情况下挑选最忙的窃取目标
pub(crate) struct LocalQueue {
    queue: Mutex<VecDeque<Arc<Coroutine>>>,
    len: CachePadded<AtomicUsize>,
    capacity: usize,
}

impl LocalQueue {
    /// 创建指定容量的本地队列
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            len: CachePadded::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// 获取队列长度
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// 检查队列是否为空
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 剩余可容纳的协程数
    #[inline]
    pub(crate) fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// 推入单个协程（队尾）
    ///
    /// 返回 false 表示队列已满
    pub(crate) fn push(&self, co: Arc<Coroutine>) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(co);
        self.len.store(queue.len(), Ordering::Relaxed);
        true
    }

    /// 批量推入（队尾，保持顺序）
    ///
    /// 全有或全无：容量不足时整批拒绝并原样返还
    pub(crate) fn enqueue(
        &self,
        batch: Vec<Arc<Coroutine>>,
    ) -> Result<(), Vec<Arc<Coroutine>>> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut queue = self.queue.lock();
        if queue.len() + batch.len() > self.capacity {
            return Err(batch);
        }
        queue.extend(batch);
        self.len.store(queue.len(), Ordering::Relaxed);
        Ok(())
    }

    /// 弹出队首协程（仅拥有者调用）
    pub(crate) fn pop(&self) -> Option<Arc<Coroutine>> {
        let mut queue = self.queue.lock();
        let co = queue.pop_front();
        self.len.store(queue.len(), Ordering::Relaxed);
        co
    }

    /// 从队尾窃取约一半的协程，追加到 `out`（保持相对顺序）
    pub(crate) fn steal_into(&self, out: &mut Vec<Arc<Coroutine>>) {
        let mut queue = self.queue.lock();
        let n = queue.len();
        if n == 0 {
            return;
        }
        let take = (n + 1) / 2;
        let stolen = queue.split_off(n - take);
        self.len.store(queue.len(), Ordering::Relaxed);
        out.extend(stolen);
    }

    /// 取走全部协程（处理器进入阻塞调用时移交调度器）
    pub(crate) fn take_all(&self) -> Vec<Arc<Coroutine>> {
        let mut queue = self.queue.lock();
        let drained: Vec<_> = queue.drain(..).collect();
        self.len.store(0, Ordering::Relaxed);
        drained
    }
}

/// 全局溢出队列
///
/// 所有处理器队列都满时的兜底去处；饥饿的处理器优先从这里取活
pub(crate) struct GlobalQueue {
    queue: Mutex<VecDeque<Arc<Coroutine>>>,
    len: CachePadded<AtomicUsize>,
}

impl GlobalQueue {
    /// 创建空的全局队列
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// 获取队列长度
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// 检查是否为空
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 批量推入（队尾，保持顺序）
    pub(crate) fn push_batch(&self, batch: Vec<Arc<Coroutine>>) {
        if batch.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        queue.extend(batch);
        self.len.store(queue.len(), Ordering::Relaxed);
    }

    /// 从队首批量弹出，至多 `max` 个
    pub(crate) fn pop_batch(&self, max: usize) -> Vec<Arc<Coroutine>> {
        let mut queue = self.queue.lock();
        let count = queue.len().min(max);
        let batch: Vec<_> = queue.drain(..count).collect();
        self.len.store(queue.len(), Ordering::Relaxed);
        batch
    }
}
