//! 性能剖析事件
//!
//! 调度器在协程创建/上下机、处理器阻塞/解除阻塞时产出事件记录，
//! 通过 crossbeam-channel 发送给外部收集器；未配置发送端时零开销

use std::sync::atomic::{AtomicU64, Ordering};

/// 事件主体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// 处理器（工作线程）
    Processor,
    /// 协程
    Coroutine,
}

/// 事件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// 对象被创建
    Created,
    /// 协程在某个处理器上开始执行
    Enter,
    /// 协程让出或结束，离开处理器
    Exit,
    /// 处理器进入外部阻塞调用
    Block,
    /// 处理器从外部阻塞调用返回
    Unblock,
}

/// 一条剖析事件记录
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// 主体类型
    pub object_type: ObjectKind,
    /// 主体 ID（协程 ID 或处理器 ID）
    pub object_id: u64,
    /// 产生事件的 OS 线程 ID（进程内单调分配）
    pub thread_id: u64,
    /// 距调度器启动的微秒数
    pub time_ticks: u64,
    /// 事件种类
    pub event: EventKind,
    /// 附加信息（如协程名）
    pub data: Option<String>,
}

/// 剖析事件的发送端
pub type TraceSender = crossbeam_channel::Sender<TraceEvent>;

/// 线程 ID 计数器
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// 获取当前 OS 线程的运行时线程 ID
#[inline]
pub(crate) fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}
