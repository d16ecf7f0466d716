//! 线程上下文
//!
//! 每个处理器线程通过 TLS 记录"当前处理器"和"当前协程"，
//! 协程内的让出、阻塞调用括号都从这里解析出自己的宿主

use std::cell::RefCell;
use std::mem;
use std::sync::Arc;

use crate::coroutine::{Coroutine, CoroutineHandle, Hook};
use crate::processor::Processor;

thread_local! {
    static CURRENT_PROCESSOR: RefCell<Option<Arc<Processor>>> = const { RefCell::new(None) };
    static CURRENT_COROUTINE: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

/// 绑定/解除当前线程的处理器
pub(crate) fn set_current_processor(p: Option<Arc<Processor>>) {
    CURRENT_PROCESSOR.with(|slot| *slot.borrow_mut() = p);
}

/// 获取当前线程的处理器
pub(crate) fn current_processor() -> Option<Arc<Processor>> {
    CURRENT_PROCESSOR.with(|slot| slot.borrow().clone())
}

/// 绑定/解除当前线程正在执行的协程
pub(crate) fn set_current_coroutine(co: Option<Arc<Coroutine>>) {
    CURRENT_COROUTINE.with(|slot| *slot.borrow_mut() = co);
}

/// 获取当前线程正在执行的协程
pub(crate) fn current() -> Option<Arc<Coroutine>> {
    CURRENT_COROUTINE.with(|slot| slot.borrow().clone())
}

/// 获取当前协程的句柄
///
/// 在协程上下文之外返回 None
pub fn current_coroutine() -> Option<CoroutineHandle> {
    current().map(CoroutineHandle::new)
}

/// 挂起当前协程，挂起完成后在处理器栈上执行 `hook`
///
/// 钩子收到刚挂起协程的句柄，必须把它放进新的归属
/// （监视器等待集、运行队列），且自身不得再挂起。
/// 协程上下文之外调用是致命错误
pub fn yield_with<'a, F>(hook: F)
where
    F: FnOnce(Arc<Coroutine>) + 'a,
{
    let co = current().expect("yield outside of coroutine context");
    let boxed: Box<dyn FnOnce(Arc<Coroutine>) + 'a> = Box::new(hook);
    // 挂起的协程帧在钩子执行结束前不会继续，捕获的借用在此期间保持有效
    let boxed: Hook = unsafe { mem::transmute(boxed) };
    co.set_hook(boxed);
    generator::yield_with(());
}

/// 主动让出，重新排到当前处理器的运行队列尾部
///
/// 在协程上下文之外退化为让出 OS 线程
pub fn yield_now() {
    let Some(co) = current() else {
        std::thread::yield_now();
        return;
    };
    co.set_checkpoint("yield");
    yield_with(|co| {
        let p = current_processor().expect("coroutine running without a processor");
        p.requeue(co);
    });
}

/// 宣告即将进入外部阻塞调用
///
/// 处理器把本地队列整体交还调度器并转入 Blocked 状态，
/// 调度器按需补充处理器以维持并行度；
/// 随后的阻塞系统调用在本线程上同步执行。
/// 必须与 [`end_blocking_call`] 严格配对
pub fn begin_blocking_call() {
    let p = current_processor().expect("begin_blocking_call outside of coroutine context");
    if let Some(co) = current() {
        co.set_checkpoint("blocking call");
    }
    p.begin_blocking();
}

/// 宣告外部阻塞调用结束
///
/// 处理器转回 Running 状态；多余的处理器可能被调度器回收
pub fn end_blocking_call() {
    let p = current_processor().expect("end_blocking_call outside of coroutine context");
    p.end_blocking();
}

/// 以配对保证执行一段外部阻塞调用
///
/// 等价于 `begin_blocking_call` / `end_blocking_call` 括号，
/// `f` panic 时同样保证结束配对
pub fn blocking<R>(f: impl FnOnce() -> R) -> R {
    struct Bracket(Arc<Processor>);

    impl Drop for Bracket {
        fn drop(&mut self) {
            self.0.end_blocking();
        }
    }

    let p = current_processor().expect("blocking outside of coroutine context");
    if let Some(co) = current() {
        co.set_checkpoint("blocking call");
    }
    p.begin_blocking();
    let _bracket = Bracket(p);
    f()
}
