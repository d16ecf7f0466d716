//! 调度器
//!
//! 进程级调度状态：处理器集合、全局溢出队列、饥饿处理器名单与放置用的
//! 随机源。实现随机放置 + 线性探查、工作窃取、阻塞时的处理器弹性伸缩，
//! 以及协程注册表与完成等待

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::{self, Receiver, Sender};
use crate::coroutine::{CoroId, Coroutine, CoroutineHandle};
use crate::error::ShuttingDown;
use crate::processor::Processor;
use crate::queue::{GlobalQueue, LOCAL_QUEUE_CAPACITY};
use crate::trace::{self, EventKind, ObjectKind, TraceEvent, TraceSender};

/// 调度器配置
#[derive(Clone)]
pub struct SchedulerConfig {
    /// 目标并行度：保持非阻塞状态的处理器数量（必须 ≥ 1）
    pub active_processors: usize,
    /// 每个处理器本地队列的容量
    pub local_queue_capacity: usize,
    /// 协程栈大小（透传给 generator）
    pub stack_size: usize,
    /// 剖析事件发送端；None 时不产出事件
    pub trace: Option<TraceSender>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active_processors: num_cpus::get(),
            local_queue_capacity: LOCAL_QUEUE_CAPACITY,
            stack_size: 0x8000,
            trace: None,
        }
    }
}

impl std::fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("active_processors", &self.active_processors)
            .field("local_queue_capacity", &self.local_queue_capacity)
            .field("stack_size", &self.stack_size)
            .field("trace", &self.trace.is_some())
            .finish()
    }
}

/// 处理器集合及其伴生状态，整体由一把锁保护
struct ProcSet {
    /// 全部处理器，下标即放置用的索引
    procs: Vec<Arc<Processor>>,
    /// Blocked 状态的处理器数量
    blocked: usize,
    /// 报告过"无事可做"的处理器
    starved: Vec<Arc<Processor>>,
    /// 放置用的随机源
    rng: StdRng,
}

/// 协程注册表
struct CoroRegistry {
    /// 存活的协程
    live: HashMap<CoroId, Arc<Coroutine>>,
    /// 并发存活数的高水位
    max_active: usize,
}

/// 调度器内部状态
///
/// 锁序：coros 锁在 procs 锁之前；二者都不跨越协程执行持有
pub(crate) struct SchedulerCore {
    config: SchedulerConfig,
    procs: Mutex<ProcSet>,
    coros: Mutex<CoroRegistry>,
    /// `wait` 在此等待注册表排空
    coro_cv: Condvar,
    /// 全局溢出队列；需要与处理器状态一致时在 procs 锁内访问
    global_queue: GlobalQueue,
    next_coro_id: AtomicU64,
    next_proc_id: AtomicU64,
    shutting_down: AtomicBool,
    started_at: Instant,
}

impl SchedulerCore {
    /// 产出一条剖析事件
    pub(crate) fn emit(
        &self,
        object_type: ObjectKind,
        object_id: u64,
        event: EventKind,
        data: Option<String>,
    ) {
        if let Some(tx) = &self.config.trace {
            let _ = tx.try_send(TraceEvent {
                object_type,
                object_id,
                thread_id: trace::current_thread_id(),
                time_ticks: self.started_at.elapsed().as_micros() as u64,
                event,
                data,
            });
        }
    }

    /// 创建一个处理器并启动其工作线程
    fn spawn_processor(self: &Arc<Self>, set: &mut ProcSet) {
        let id = self.next_proc_id.fetch_add(1, Ordering::Relaxed);
        let p = Processor::new(id, self.config.local_queue_capacity, Arc::downgrade(self));
        self.emit(ObjectKind::Processor, id, EventKind::Created, None);
        p.start();
        set.procs.push(p);
    }

    /// 放置一批协程
    ///
    /// 依次尝试：饥饿处理器整批接收 → 随机起点线性探查各处理器 →
    /// 全部拒绝时进全局溢出队列
    pub(crate) fn schedule(&self, batch: Vec<Arc<Coroutine>>) {
        if batch.is_empty() {
            return;
        }
        let mut set = self.procs.lock();

        if let Some(p) = set.starved.pop() {
            match p.enqueue(batch) {
                Ok(()) => return,
                Err(rest) => {
                    // 饥饿处理器放不下整批：兜底进全局队列并唤醒它来取
                    self.global_queue.push_batch(rest);
                    p.unpark();
                    return;
                }
            }
        }

        let live = (self.config.active_processors + set.blocked).min(set.procs.len());
        let mut batch = batch;
        if live > 0 {
            let mut index = set.rng.gen_range(0..live);
            for _ in 0..live {
                batch = match set.procs[index].enqueue(batch) {
                    Ok(()) => return,
                    Err(rest) => rest,
                };
                index = (index + 1) % live;
            }
        }

        self.global_queue.push_batch(batch);
    }

    /// 处理器报告本地队列已空
    ///
    /// 依次尝试：转移全局队列 → 从最忙的处理器窃取一半 →
    /// 记入饥饿名单等待后续投递
    pub(crate) fn processor_starved(&self, p: &Arc<Processor>) {
        let mut set = self.procs.lock();

        let Some(index) = set.procs.iter().position(|q| Arc::ptr_eq(q, p)) else {
            return;
        };
        // 超出放置范围的处理器是等待回收的富余，不再给活
        if index >= self.config.active_processors + set.blocked {
            return;
        }

        if !self.global_queue.is_empty() {
            let batch = self.global_queue.pop_batch(p.free_space());
            if let Err(rest) = p.enqueue(batch) {
                self.global_queue.push_batch(rest);
            }
            return;
        }

        let scan = self.config.active_processors.min(set.procs.len());
        let victim = set.procs[..scan]
            .iter()
            .filter(|q| !Arc::ptr_eq(q, p))
            .max_by_key(|q| q.queue_len())
            .cloned();
        if let Some(victim) = victim {
            let mut stolen = Vec::new();
            victim.steal_into(&mut stolen);
            if !stolen.is_empty() {
                if let Err(rest) = p.enqueue(stolen) {
                    self.global_queue.push_batch(rest);
                }
                return;
            }
        }

        if !set.starved.iter().any(|q| Arc::ptr_eq(q, p)) {
            set.starved.push(Arc::clone(p));
        }
    }

    /// 处理器进入 Blocked 状态，移交其本地队列
    ///
    /// 非阻塞处理器不足目标并行度时补充新处理器
    pub(crate) fn processor_blocked(
        self: &Arc<Self>,
        _p: &Arc<Processor>,
        handed: Vec<Arc<Coroutine>>,
    ) {
        {
            let mut set = self.procs.lock();
            set.blocked += 1;
            while set.procs.len() < self.config.active_processors + set.blocked {
                self.spawn_processor(&mut set);
            }
        }
        self.schedule(handed);
    }

    /// 处理器从 Blocked 状态返回
    pub(crate) fn processor_unblocked(self: &Arc<Self>, _p: &Arc<Processor>) {
        let mut stopped = Vec::new();
        {
            let mut set = self.procs.lock();
            assert!(set.blocked > 0, "unbalanced blocking-call bracket");
            set.blocked -= 1;
            self.remove_inactive_processors(&mut set, &mut stopped);
        }
        // 在 procs 锁外 join，退出中的线程可能正等着进 processor_starved
        for p in stopped {
            p.join();
        }
    }

    /// 回收富余的处理器
    ///
    /// 处理器总数收敛到 2·active + blocked 以内；
    /// 只回收空闲者，正在执行协程的留到下一轮
    fn remove_inactive_processors(
        &self,
        set: &mut ProcSet,
        stopped: &mut Vec<Arc<Processor>>,
    ) {
        while set.procs.len() > self.config.active_processors * 2 + set.blocked {
            let last = set.procs.last().expect("processor set is never empty");
            if !last.stop_if_idle() {
                break;
            }
            let p = set.procs.pop().expect("processor set is never empty");
            set.starved.retain(|q| !Arc::ptr_eq(q, &p));
            stopped.push(p);
        }
    }

    /// 协程执行完毕，从注册表移除
    pub(crate) fn coroutine_finished(&self, co: &Arc<Coroutine>) {
        let mut reg = self.coros.lock();
        reg.live.remove(&co.id());
        if reg.live.is_empty() {
            self.coro_cv.notify_all();
        }
    }
}

/// 调度统计信息
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    /// 存活协程数
    pub coroutines: usize,
    /// 并发存活协程数的高水位
    pub max_active_coroutines: usize,
    /// 处理器总数
    pub processors: usize,
    /// Blocked 状态的处理器数
    pub blocked_processors: usize,
    /// 饥饿名单中的处理器数
    pub starved_processors: usize,
    /// 全局溢出队列长度
    pub global_queue_len: usize,
    /// 各处理器本地队列长度
    pub local_queue_lens: Vec<usize>,
}

/// M:N 协程调度器
///
/// 构造时固定目标并行度并启动处理器池；析构时等待全部协程完成、
/// 停止并回收所有工作线程。一个进程可以同时存在多个调度器实例
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// 创建调度器，目标并行度为 `active_processors`（必须 ≥ 1）
    pub fn new(active_processors: usize) -> Self {
        Self::with_config(SchedulerConfig {
            active_processors,
            ..SchedulerConfig::default()
        })
    }

    /// 使用指定配置创建调度器
    pub fn with_config(config: SchedulerConfig) -> Self {
        assert!(
            config.active_processors >= 1,
            "scheduler needs at least one processor"
        );

        let core = Arc::new(SchedulerCore {
            procs: Mutex::new(ProcSet {
                procs: Vec::new(),
                blocked: 0,
                starved: Vec::new(),
                rng: StdRng::from_entropy(),
            }),
            coros: Mutex::new(CoroRegistry {
                live: HashMap::new(),
                max_active: 0,
            }),
            coro_cv: Condvar::new(),
            global_queue: GlobalQueue::new(),
            next_coro_id: AtomicU64::new(1),
            next_proc_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            started_at: Instant::now(),
            config,
        });

        {
            let mut set = core.procs.lock();
            for _ in 0..core.config.active_processors {
                core.spawn_processor(&mut set);
            }
        }

        Self { core }
    }

    /// 启动协程
    pub fn go<F>(&self, f: F) -> Result<CoroutineHandle, ShuttingDown>
    where
        F: FnOnce() + Send + 'static,
    {
        self.go_impl(None, Box::new(f))
    }

    /// 启动带调试名称的协程
    pub fn go_named<F>(
        &self,
        name: impl Into<String>,
        f: F,
    ) -> Result<CoroutineHandle, ShuttingDown>
    where
        F: FnOnce() + Send + 'static,
    {
        self.go_impl(Some(name.into()), Box::new(f))
    }

    fn go_impl(
        &self,
        name: Option<String>,
        f: Box<dyn FnOnce() + Send>,
    ) -> Result<CoroutineHandle, ShuttingDown> {
        let core = &self.core;
        if core.shutting_down.load(Ordering::Acquire) {
            return Err(ShuttingDown);
        }

        let id = core.next_coro_id.fetch_add(1, Ordering::Relaxed);
        let co = Arc::new(Coroutine::new(
            id,
            name,
            f,
            core.config.stack_size,
            Arc::downgrade(core),
        ));

        {
            let mut reg = core.coros.lock();
            reg.live.insert(id, Arc::clone(&co));
            reg.max_active = reg.max_active.max(reg.live.len());
        }
        core.emit(
            ObjectKind::Coroutine,
            id,
            EventKind::Created,
            co.name().map(str::to_string),
        );

        core.schedule(vec![Arc::clone(&co)]);
        Ok(CoroutineHandle::new(co))
    }

    /// 创建一对 Channel 端点
    pub fn make_channel<T: Send + 'static>(&self, capacity: usize) -> (Sender<T>, Receiver<T>) {
        channel::channel(capacity)
    }

    /// 阻塞当前线程，直到所有协程执行完毕
    pub fn wait(&self) {
        let mut reg = self.core.coros.lock();
        while !reg.live.is_empty() {
            self.core.coro_cv.wait(&mut reg);
        }
    }

    /// 关闭调度器：等待协程排空，停止并回收全部处理器
    ///
    /// 关闭后 `go` 返回 [`ShuttingDown`]；重复调用无害
    pub fn shutdown(&self) {
        self.core.shutting_down.store(true, Ordering::Release);
        self.wait();

        let procs: Vec<_> = {
            let mut set = self.core.procs.lock();
            set.starved.clear();
            set.procs.drain(..).collect()
        };
        for p in &procs {
            p.stop();
        }
        for p in &procs {
            p.join();
        }
    }

    /// 获取调度统计信息
    pub fn stats(&self) -> SchedulerStats {
        let (coroutines, max_active) = {
            let reg = self.core.coros.lock();
            (reg.live.len(), reg.max_active)
        };
        let set = self.core.procs.lock();
        SchedulerStats {
            coroutines,
            max_active_coroutines: max_active,
            processors: set.procs.len(),
            blocked_processors: set.blocked,
            starved_processors: set.starved.len(),
            global_queue_len: self.core.global_queue.len(),
            local_queue_lens: set.procs.iter().map(|p| p.queue_len()).collect(),
        }
    }

    /// 向 stderr 打印调度器内部状态快照
    pub fn debug_dump(&self) {
        let reg = self.core.coros.lock();
        let set = self.core.procs.lock();

        eprintln!("=========== scheduler debug dump ============");
        eprintln!("          active coroutines now: {}", reg.live.len());
        eprintln!("     max active coroutines seen: {}", reg.max_active);
        eprintln!("               no of processors: {}", set.procs.len());
        eprintln!("       no of blocked processors: {}", set.blocked);
        eprintln!(" Active coroutines:");
        for co in reg.live.values() {
            eprintln!(
                " * {} : {}",
                co.name().unwrap_or("<unnamed>"),
                co.checkpoint()
            );
        }
        eprintln!("=============================================");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("active_processors", &self.core.config.active_processors)
            .finish()
    }
}
