//! 协程
//!
//! 调度的基本单位。每个协程包装一个 generator 提供的有栈执行体，
//! 挂起时通过让出钩子把自己迁移到新的归属（监视器等待集、运行队列）

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use generator::{Generator, Gn};
use parking_lot::Mutex;

use crate::scheduler::SchedulerCore;

/// 协程 ID 类型
pub type CoroId = u64;

/// 让出钩子
///
/// 协程挂起后在处理器栈上执行，负责把刚挂起的协程放进它的新归属。
/// 钩子自身不得再挂起
pub(crate) type Hook = Box<dyn FnOnce(Arc<Coroutine>)>;

/// 协程执行体：无输入、无产出的有栈 generator
type CoroGen = Generator<'static, (), ()>;

/// 一次 resume 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// 协程让出，钩子待执行
    Yielded,
    /// 协程执行完毕（正常返回或 panic）
    Finished,
}

/// 协程
///
/// 由调度器的注册表独占所有权；处理器和监视器只持有句柄
pub struct Coroutine {
    /// 协程唯一 ID
    id: CoroId,
    /// 调试名称
    name: Option<String>,
    /// 执行体，完成后置空
    gen: Mutex<Option<CoroGen>>,
    /// 待执行的让出钩子
    hook: Mutex<Option<Hook>>,
    /// 最后一次经过的挂起点标记
    checkpoint: Mutex<&'static str>,
    /// 所属调度器
    sched: Weak<SchedulerCore>,
}

// 让出钩子在同一次挂起周期内由同一工作线程安装并消费，
// 不会跨线程转移，其余字段均为 Send + Sync
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// 创建新协程
    ///
    /// `stack_size` 直接传给 generator 作为协程栈大小
    pub(crate) fn new(
        id: CoroId,
        name: Option<String>,
        entry: Box<dyn FnOnce() + Send>,
        stack_size: usize,
        sched: Weak<SchedulerCore>,
    ) -> Self {
        let gen = Gn::<()>::new_scoped_opt(stack_size, move |_scope| {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                // generator 自身的取消展开必须继续传播；
                // 用户 panic 只终止本协程
                if payload.downcast_ref::<generator::Error>().is_some() {
                    panic::resume_unwind(payload);
                }
            }
        });

        Self {
            id,
            name,
            gen: Mutex::new(Some(gen)),
            hook: Mutex::new(None),
            checkpoint: Mutex::new("created"),
            sched,
        }
    }

    /// 获取协程 ID
    #[inline]
    pub fn id(&self) -> CoroId {
        self.id
    }

    /// 获取调试名称
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// 最后一次经过的挂起点
    #[inline]
    pub fn checkpoint(&self) -> &'static str {
        *self.checkpoint.lock()
    }

    /// 记录挂起点
    #[inline]
    pub(crate) fn set_checkpoint(&self, tag: &'static str) {
        *self.checkpoint.lock() = tag;
    }

    /// 检查协程是否已执行完毕
    pub fn is_finished(&self) -> bool {
        self.gen.lock().is_none()
    }

    /// 安装让出钩子（随后立即挂起）
    pub(crate) fn set_hook(&self, hook: Hook) {
        let mut slot = self.hook.lock();
        assert!(slot.is_none(), "coroutine already has a pending yield hook");
        *slot = Some(hook);
    }

    /// 取出待执行的让出钩子
    pub(crate) fn take_hook(&self) -> Option<Hook> {
        self.hook.lock().take()
    }

    /// 所属调度器
    pub(crate) fn sched(&self) -> Weak<SchedulerCore> {
        Weak::clone(&self.sched)
    }

    /// 驱动协程执行到下一次让出或结束
    ///
    /// 只能由处理器线程调用；执行期间本协程即该线程的"当前协程"
    pub(crate) fn resume(self: &Arc<Self>) -> RunOutcome {
        crate::context::set_current_coroutine(Some(Arc::clone(self)));
        let outcome = {
            let mut slot = self.gen.lock();
            match slot.as_mut() {
                Some(gen) => {
                    gen.resume();
                    if gen.is_done() {
                        *slot = None;
                        RunOutcome::Finished
                    } else {
                        RunOutcome::Yielded
                    }
                }
                None => RunOutcome::Finished,
            }
        };
        crate::context::set_current_coroutine(None);
        outcome
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("checkpoint", &self.checkpoint())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// 协程句柄（外部引用）
#[derive(Clone)]
pub struct CoroutineHandle {
    inner: Arc<Coroutine>,
}

impl CoroutineHandle {
    /// 创建新的句柄
    pub(crate) fn new(co: Arc<Coroutine>) -> Self {
        Self { inner: co }
    }

    /// 获取协程 ID
    pub fn id(&self) -> CoroId {
        self.inner.id()
    }

    /// 获取调试名称
    pub fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    /// 检查协程是否已执行完毕
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl std::fmt::Debug for CoroutineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineHandle")
            .field("id", &self.id())
            .field("finished", &self.is_finished())
            .finish()
    }
}
