//! 监视器
//!
//! 协程的 FIFO 停车场。条件变量和 Channel 都建立在它之上：
//! `wait` 把当前协程挂进等待集，`wake_*` 把等待者搬回就绪队列

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context;
use crate::coroutine::Coroutine;
use crate::scheduler::SchedulerCore;

/// 协程等待集
///
/// 不变式：一个协程同一时刻至多出现在一个监视器或一个运行队列中
pub struct Monitor {
    /// 等待中的协程，按停车顺序排列
    waiting: Mutex<VecDeque<Arc<Coroutine>>>,
    /// 最近一次停车协程的调度器，供非处理器线程唤醒时投递
    sched: Mutex<Weak<SchedulerCore>>,
}

impl Monitor {
    /// 创建空的监视器
    pub fn new() -> Self {
        Self {
            waiting: Mutex::new(VecDeque::new()),
            sched: Mutex::new(Weak::new()),
        }
    }

    /// 等待者数量
    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    /// 是否有等待者
    pub fn has_waiters(&self) -> bool {
        !self.waiting.lock().is_empty()
    }

    /// 挂起当前协程，加入等待集尾部
    ///
    /// 只能在协程上下文中调用；直到其他协程唤醒才返回
    pub fn wait(&self) {
        if let Some(co) = context::current() {
            co.set_checkpoint("monitor wait");
        }
        self.wait_with(|| {});
    }

    /// 挂起当前协程，入集完成后在处理器栈上执行 `after`
    ///
    /// `after` 在协程已经安全进入等待集之后才执行，
    /// 调用方用它在停车尾声释放自己的锁，消除解锁与停车之间的唤醒窗口
    pub fn wait_with<F: FnOnce()>(&self, after: F) {
        let co = context::current().expect("monitor wait outside of coroutine context");
        *self.sched.lock() = co.sched();

        context::yield_with(|co| {
            self.waiting.lock().push_back(co);
            after();
        });
    }

    /// 唤醒最早停车的一个等待者
    pub fn wake_one(&self) {
        let co = self.waiting.lock().pop_front();
        if let Some(co) = co {
            self.dispatch(vec![co]);
        }
    }

    /// 唤醒全部等待者（保持停车顺序）
    pub fn wake_all(&self) {
        let drained: Vec<_> = {
            let mut waiting = self.waiting.lock();
            waiting.drain(..).collect()
        };
        if !drained.is_empty() {
            self.dispatch(drained);
        }
    }

    /// 把被唤醒的协程送回就绪队列
    ///
    /// 优先进当前处理器的本地队列；本地队列放不下或
    /// 调用方不是处理器线程时，交给调度器重新放置
    fn dispatch(&self, coros: Vec<Arc<Coroutine>>) {
        let coros = match context::current_processor() {
            Some(p) => match p.enqueue(coros) {
                Ok(()) => return,
                Err(rest) => rest,
            },
            None => coros,
        };

        let sched = self.sched.lock().upgrade();
        match sched {
            Some(sched) => sched.schedule(coros),
            None => panic!("monitor has waiters but their scheduler is gone"),
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        assert!(
            self.waiting.get_mut().is_empty(),
            "monitor dropped with parked coroutines"
        );
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor").field("waiting", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_monitor() {
        let monitor = Monitor::new();
        assert_eq!(monitor.len(), 0);
        assert!(!monitor.has_waiters());
        // 空集合上的唤醒是无害的
        monitor.wake_one();
        monitor.wake_all();
    }

    #[test]
    fn test_wake_order_is_park_order() {
        // 单处理器使停车顺序确定：等待者按 0、1、2 依次停车
        let sched = Scheduler::new(1);
        let monitor = Arc::new(Monitor::new());
        let woken = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3usize {
            let monitor = Arc::clone(&monitor);
            let woken = Arc::clone(&woken);
            sched
                .go(move || {
                    monitor.wait();
                    woken.lock().push(i);
                })
                .unwrap();
        }

        {
            let monitor = Arc::clone(&monitor);
            sched
                .go(move || {
                    while monitor.len() < 3 {
                        crate::context::yield_now();
                    }
                    monitor.wake_all();
                })
                .unwrap();
        }

        sched.wait();
        assert_eq!(*woken.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_wake_one_fifo() {
        let sched = Scheduler::new(1);
        let monitor = Arc::new(Monitor::new());
        let first_woken = Arc::new(AtomicUsize::new(usize::MAX));

        for i in 0..2usize {
            let monitor = Arc::clone(&monitor);
            let first_woken = Arc::clone(&first_woken);
            sched
                .go(move || {
                    monitor.wait();
                    let _ = first_woken.compare_exchange(
                        usize::MAX,
                        i,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                })
                .unwrap();
        }

        {
            let monitor = Arc::clone(&monitor);
            sched
                .go(move || {
                    while monitor.len() < 2 {
                        crate::context::yield_now();
                    }
                    monitor.wake_one();
                    monitor.wake_one();
                })
                .unwrap();
        }

        sched.wait();
        // 先停车者先被唤醒
        assert_eq!(first_woken.load(Ordering::SeqCst), 0);
    }
}
