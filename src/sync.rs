//! 协程感知的同步原语
//!
//! 互斥锁与条件变量建立在监视器之上：争用只挂起协程，
//! 不阻塞 OS 线程，与 Channel 共用同一套调度织物

use crate::context;
use crate::monitor::Monitor;

/// 协程互斥锁
///
/// 不可重入。争用时把当前协程挂进内部监视器，
/// 解锁按停车顺序唤醒一个等待者
pub struct Mutex {
    /// 是否已被持有
    state: parking_lot::Mutex<bool>,
    /// 等待加锁的协程
    waiters: Monitor,
}

impl Mutex {
    /// 创建未加锁的互斥锁
    pub fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(false),
            waiters: Monitor::new(),
        }
    }

    /// 加锁，必要时挂起当前协程
    ///
    /// 只能在协程上下文中调用
    pub fn lock(&self) {
        let co = context::current().expect("mutex lock outside of coroutine context");
        loop {
            let mut locked = self.state.lock();
            if !*locked {
                *locked = true;
                return;
            }
            co.set_checkpoint("mutex lock");
            // 状态锁在协程入集之后才释放，解锁方不会错过这个等待者
            self.waiters.wait_with(move || drop(locked));
        }
    }

    /// 尝试加锁，不挂起
    pub fn try_lock(&self) -> bool {
        let mut locked = self.state.lock();
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    /// 解锁并唤醒最早停车的等待者
    pub fn unlock(&self) {
        {
            let mut locked = self.state.lock();
            assert!(*locked, "unlock of an unlocked mutex");
            *locked = false;
        }
        self.waiters.wake_one();
    }

    /// 是否已被持有
    pub fn is_locked(&self) -> bool {
        *self.state.lock()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// 协程条件变量
///
/// 配合 [`Mutex`] 使用。`wait` 在停车尾声才释放互斥锁
/// （协程先进等待集，再解锁），通知方持锁修改谓词即不会丢失唤醒；
/// 返回前重新加锁
pub struct CondVar {
    monitor: Monitor,
}

impl CondVar {
    /// 创建条件变量
    pub fn new() -> Self {
        Self {
            monitor: Monitor::new(),
        }
    }

    /// 解锁并挂起，被唤醒后重新加锁再返回
    ///
    /// 调用方必须已持有 `lock`
    pub fn wait(&self, lock: &Mutex) {
        let co = context::current().expect("condvar wait outside of coroutine context");
        co.set_checkpoint("condvar wait");
        self.monitor.wait_with(|| lock.unlock());
        lock.lock();
    }

    /// 谓词等待：返回时 `pred()` 必定成立
    pub fn wait_until(&self, lock: &Mutex, mut pred: impl FnMut() -> bool) {
        while !pred() {
            self.wait(lock);
        }
    }

    /// 唤醒全部等待者（它们会重新争用互斥锁）
    pub fn notify_all(&self) {
        self.monitor.wake_all();
    }

    /// 唤醒最早停车的一个等待者
    pub fn notify_one(&self) {
        self.monitor.wake_one();
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CondVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CondVar")
            .field("waiting", &self.monitor.len())
            .finish()
    }
}
