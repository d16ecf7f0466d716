//! qroutine — M:N 有栈协程运行时
//!
//! 把大量轻量级协程复用到一小撮弹性伸缩的 OS 工作线程（处理器）上：
//!
//! - G (Coroutine): 有栈协程，挂起时通过让出钩子完成"挂起即迁移"
//! - P (Processor): 工作线程，循环执行本地运行队列里的协程
//! - Scheduler: 随机放置 + 工作窃取 + 阻塞调用时的处理器弹性补充
//!
//! 同步原语（监视器、互斥锁、条件变量、有界 Channel）全部只挂起协程，
//! 不阻塞 OS 线程；协程进入外部阻塞系统调用前用
//! [`begin_blocking_call`]/[`end_blocking_call`] 括号宣告，
//! 调度器会补充处理器维持并行度
//!
//! # 示例
//!
//! ```
//! use qroutine::Scheduler;
//!
//! let sched = Scheduler::new(2);
//! let (tx, rx) = sched.make_channel::<u32>(4);
//!
//! sched.go(move || {
//!     for i in 0..10 {
//!         tx.send(i).unwrap();
//!     }
//! }).unwrap();
//!
//! sched.go(move || {
//!     let total: u32 = rx.iter().sum();
//!     assert_eq!(total, 45);
//! }).unwrap();
//!
//! sched.wait();
//! ```

pub mod channel;
pub mod context;
pub mod coroutine;
pub mod error;
pub mod monitor;
pub mod scheduler;
pub mod sync;
pub mod trace;

mod processor;
mod queue;

pub use channel::{channel, Iter, Receiver, Sender};
pub use context::{
    begin_blocking_call, blocking, current_coroutine, end_blocking_call, yield_now, yield_with,
};
pub use coroutine::{CoroId, CoroutineHandle};
pub use error::{ChannelClosed, SendError, ShuttingDown, TryRecvError, TrySendError};
pub use monitor::Monitor;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use trace::{EventKind, ObjectKind, TraceEvent, TraceSender};
