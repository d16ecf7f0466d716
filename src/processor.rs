//! 处理器
//!
//! 一个处理器对应一条 OS 工作线程，循环执行本地运行队列里的协程。
//! 队列空了向调度器报告饥饿，协程进入外部阻塞调用时整体移交队列并转入
//! Blocked 状态，由调度器补充新处理器维持并行度

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::context;
use crate::coroutine::{Coroutine, RunOutcome};
use crate::queue::LocalQueue;
use crate::scheduler::SchedulerCore;
use crate::trace::{EventKind, ObjectKind};

/// 处理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    /// 正常调度协程
    Running = 0,
    /// 当前协程正在执行外部阻塞调用
    Blocked = 1,
    /// 调度器要求停止，排空后退出
    Stopping = 2,
    /// 线程已退出
    Stopped = 3,
}

impl From<u8> for ProcessorState {
    fn from(v: u8) -> Self {
        match v {
            0 => ProcessorState::Running,
            1 => ProcessorState::Blocked,
            2 => ProcessorState::Stopping,
            _ => ProcessorState::Stopped,
        }
    }
}

/// 处理器
pub(crate) struct Processor {
    /// 处理器 ID
    id: u64,
    /// 处理器状态
    state: AtomicU8,
    /// 本地运行队列
    queue: LocalQueue,
    /// 正在执行的协程
    ///
    /// 锁序：先取 current 锁再取 queue 锁；
    /// `stop_if_idle` 依赖这一点排除"已弹出尚未标记"的窗口
    current: Mutex<Option<Arc<Coroutine>>>,
    /// 所属调度器
    sched: Weak<SchedulerCore>,
    /// OS 线程句柄
    thread: Mutex<Option<JoinHandle<()>>>,
    /// 休眠/唤醒同步
    park_lock: Mutex<bool>,
    park_cond: Condvar,
}

impl Processor {
    /// 创建处理器（线程由 [`start`](Self::start) 启动）
    pub(crate) fn new(id: u64, queue_capacity: usize, sched: Weak<SchedulerCore>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(ProcessorState::Running as u8),
            queue: LocalQueue::new(queue_capacity),
            current: Mutex::new(None),
            sched,
            thread: Mutex::new(None),
            park_lock: Mutex::new(false),
            park_cond: Condvar::new(),
        })
    }

    /// 获取处理器 ID
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// 获取处理器状态
    #[inline]
    pub(crate) fn state(&self) -> ProcessorState {
        ProcessorState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 本地队列长度
    #[inline]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// 本地队列剩余空间
    #[inline]
    pub(crate) fn free_space(&self) -> usize {
        self.queue.free_space()
    }

    /// 启动工作线程
    pub(crate) fn start(self: &Arc<Self>) {
        let p = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("qroutine-processor-{}", self.id))
            .spawn(move || p.run_loop())
            .expect("failed to spawn processor thread");
        *self.thread.lock() = Some(handle);
    }

    /// 批量接收协程（全有或全无），成功后唤醒本处理器
    pub(crate) fn enqueue(
        &self,
        batch: Vec<Arc<Coroutine>>,
    ) -> Result<(), Vec<Arc<Coroutine>>> {
        self.queue.enqueue(batch)?;
        self.unpark();
        Ok(())
    }

    /// 协程让出后回到本地队列尾部；放不下时交调度器重新放置
    pub(crate) fn requeue(&self, co: Arc<Coroutine>) {
        if !self.queue.push(co.clone()) {
            if let Some(sched) = self.sched.upgrade() {
                sched.schedule(vec![co]);
            }
        }
    }

    /// 被窃取：从队尾移出约一半协程
    pub(crate) fn steal_into(&self, out: &mut Vec<Arc<Coroutine>>) {
        self.queue.steal_into(out);
    }

    /// 主循环
    fn run_loop(self: Arc<Self>) {
        context::set_current_processor(Some(Arc::clone(&self)));

        loop {
            if self.state() == ProcessorState::Stopping && self.queue.is_empty() {
                break;
            }

            if let Some(co) = self.next_coroutine() {
                self.run_coroutine(co);
                continue;
            }

            if self.state() == ProcessorState::Stopping {
                break;
            }

            // 队列空了，向调度器要活
            if let Some(sched) = self.sched.upgrade() {
                sched.processor_starved(&self);
            }

            if self.queue.is_empty() && self.state() == ProcessorState::Running {
                self.park();
            }
        }

        self.set_state(ProcessorState::Stopped);
        context::set_current_processor(None);
    }

    /// 弹出下一个协程并在同一临界区内标记为当前协程
    fn next_coroutine(&self) -> Option<Arc<Coroutine>> {
        let mut current = self.current.lock();
        let co = self.queue.pop()?;
        *current = Some(Arc::clone(&co));
        Some(co)
    }

    /// 执行协程直到它让出或结束
    fn run_coroutine(&self, co: Arc<Coroutine>) {
        self.trace_coroutine(&co, EventKind::Enter);
        let outcome = co.resume();
        self.trace_coroutine(&co, EventKind::Exit);

        match outcome {
            RunOutcome::Finished => {
                if let Some(sched) = self.sched.upgrade() {
                    sched.coroutine_finished(&co);
                }
            }
            RunOutcome::Yielded => {
                // 让出钩子在协程挂起之后、处理器挑选下一个协程之前执行，
                // 完成"挂起即迁移"
                match co.take_hook() {
                    Some(hook) => hook(co),
                    None => self.requeue(co),
                }
            }
        }

        // current 在钩子执行完之后才清空，期间本处理器不可被回收
        *self.current.lock() = None;
    }

    /// 休眠等待新工作或停止信号
    fn park(&self) {
        let mut ready = self.park_lock.lock();
        while !*ready && self.state() == ProcessorState::Running {
            self.park_cond.wait(&mut ready);
        }
        *ready = false;
    }

    /// 唤醒休眠中的处理器
    pub(crate) fn unpark(&self) {
        let mut ready = self.park_lock.lock();
        *ready = true;
        self.park_cond.notify_one();
    }

    /// 进入外部阻塞调用
    ///
    /// 移交整个本地队列给调度器，转入 Blocked 状态后返回，
    /// 随后的阻塞调用在调用方协程的栈上同步执行
    pub(crate) fn begin_blocking(self: &Arc<Self>) {
        assert_eq!(
            self.state(),
            ProcessorState::Running,
            "unbalanced blocking-call bracket"
        );
        self.set_state(ProcessorState::Blocked);
        self.trace_self(EventKind::Block);

        let handed = self.queue.take_all();
        if let Some(sched) = self.sched.upgrade() {
            sched.processor_blocked(self, handed);
        }
    }

    /// 外部阻塞调用结束
    pub(crate) fn end_blocking(self: &Arc<Self>) {
        assert_eq!(
            self.state(),
            ProcessorState::Blocked,
            "unbalanced blocking-call bracket"
        );
        if let Some(sched) = self.sched.upgrade() {
            sched.processor_unblocked(self);
        }
        self.set_state(ProcessorState::Running);
        self.trace_self(EventKind::Unblock);
    }

    /// 空闲时停止：队列为空且没有正在执行的协程才会成功
    pub(crate) fn stop_if_idle(&self) -> bool {
        let current = self.current.lock();
        if current.is_some() || !self.queue.is_empty() {
            return false;
        }
        if self.state() != ProcessorState::Running {
            return false;
        }
        self.set_state(ProcessorState::Stopping);
        drop(current);
        self.unpark();
        true
    }

    /// 无条件停止（调度器关闭时队列已排空）
    pub(crate) fn stop(&self) {
        self.set_state(ProcessorState::Stopping);
        self.unpark();
    }

    /// 等待工作线程退出
    pub(crate) fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn trace_coroutine(&self, co: &Arc<Coroutine>, event: EventKind) {
        if let Some(sched) = self.sched.upgrade() {
            sched.emit(ObjectKind::Coroutine, co.id(), event, None);
        }
    }

    fn trace_self(&self, event: EventKind) {
        if let Some(sched) = self.sched.upgrade() {
            sched.emit(ObjectKind::Processor, self.id, event, None);
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            ProcessorState::Running,
            ProcessorState::Blocked,
            ProcessorState::Stopping,
            ProcessorState::Stopped,
        ] {
            assert_eq!(ProcessorState::from(state as u8), state);
        }
    }

    #[test]
    fn test_stop_if_idle_requires_empty_queue() {
        let p = Processor::new(0, 4, Weak::new());
        assert!(p.stop_if_idle());
        assert_eq!(p.state(), ProcessorState::Stopping);

        let p = Processor::new(1, 4, Weak::new());
        let co = Arc::new(Coroutine::new(
            1,
            None,
            Box::new(|| {}),
            0x1000,
            Weak::new(),
        ));
        p.enqueue(vec![co]).unwrap();
        assert!(!p.stop_if_idle());
        assert_eq!(p.state(), ProcessorState::Running);
    }
}
