//! Bounded task scheduler.
//!
//! Workers are OS threads created lazily up to a cap and parked on a condvar
//! when the pending queue is empty. Under load a worker claims a batch of
//! tasks in one critical section instead of one at a time; a supervisor
//! thread shrinks the pool again once it has stayed idle for a while.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const THRESHOLD: usize = 2;
const IDLE_TIME: Duration = Duration::from_secs(1);
const INTERVAL: Duration = Duration::from_secs(1);

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Pending-queue depth (per worker) at which batch claiming kicks in.
    /// A threshold of 0 or 1 disables batching.
    pub threshold: usize,
    /// How long the pool must stay idle before workers are shrunk.
    pub idle_time: Duration,
    /// Supervisor check interval.
    pub interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            threshold: THRESHOLD,
            idle_time: IDLE_TIME,
            interval: INTERVAL,
        }
    }
}

impl SchedulerOptions {
    fn normalized(mut self) -> Self {
        if self.idle_time.is_zero() {
            self.idle_time = IDLE_TIME;
        }
        if self.interval.is_zero() {
            self.interval = INTERVAL;
        }
        self
    }
}

struct Worker {
    closed: AtomicBool,
}

struct State {
    pending: VecDeque<Task>,
    running: HashMap<usize, Arc<Worker>>,
    next_id: usize,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    lock: Mutex<State>,
    cond: Condvar,
    // Scheduled-but-not-finished task count.
    tasks: AtomicI64,
    workers: AtomicI64,
    max_workers: i64,
    closed: AtomicBool,
    opts: SchedulerOptions,
}

/// A bounded pool dispatching opaque tasks to worker threads.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    done_tx: flume::Sender<()>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Create a scheduler with at most `max_workers` workers.
    /// `max_workers == 0` selects the CPU count.
    #[must_use]
    pub fn new(max_workers: usize, opts: SchedulerOptions) -> Self {
        let max_workers = if max_workers == 0 {
            num_cpus::get()
        } else {
            max_workers
        };
        let inner = Arc::new(Inner {
            lock: Mutex::new(State {
                pending: VecDeque::new(),
                running: HashMap::new(),
                next_id: 0,
                handles: Vec::new(),
            }),
            cond: Condvar::new(),
            tasks: AtomicI64::new(0),
            workers: AtomicI64::new(0),
            max_workers: max_workers as i64,
            closed: AtomicBool::new(false),
            opts: opts.normalized(),
        });
        let (done_tx, done_rx) = flume::bounded(1);
        let sup_inner = inner.clone();
        let supervisor = thread::Builder::new()
            .name("coracle-scheduler".into())
            .spawn(move || supervise(&sup_inner, &done_rx))
            .expect("failed to spawn scheduler supervisor");
        Self {
            inner,
            done_tx,
            supervisor: Arc::new(Mutex::new(Some(supervisor))),
        }
    }

    /// Queue a task for execution on an idle worker.
    ///
    /// # Panics
    ///
    /// Panics when called on a closed scheduler; scheduling after close is a
    /// programming error and recovery would mask it.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        if self.inner.closed.load(Ordering::Acquire) {
            panic!("schedule tasks on a closed scheduler");
        }
        let inner = &self.inner;
        let task: Task = Box::new(task);
        let workers = inner.workers.load(Ordering::Relaxed);
        if inner.tasks.fetch_add(1, Ordering::AcqRel) + 1 > workers && workers < inner.max_workers {
            if inner.workers.fetch_add(1, Ordering::AcqRel) < inner.max_workers {
                self.spawn_worker(task);
                return;
            }
            inner.workers.fetch_sub(1, Ordering::AcqRel);
        }
        {
            let mut st = inner.lock.lock().expect("scheduler lock poisoned");
            st.pending.push_back(task);
        }
        inner.cond.notify_one();
    }

    /// The number of live workers.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.inner.workers.load(Ordering::Relaxed).max(0) as usize
    }

    /// The number of scheduled-but-not-finished tasks.
    #[must_use]
    pub fn num_tasks(&self) -> usize {
        self.inner.tasks.load(Ordering::Relaxed).max(0) as usize
    }

    /// Close the scheduler and wait for every worker to exit.
    ///
    /// Tasks submitted before close run to completion. Idempotent.
    pub fn close(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.done_tx.send(());
        }
        if let Some(h) = self
            .supervisor
            .lock()
            .expect("scheduler lock poisoned")
            .take()
        {
            let _ = h.join();
        }
        let handles = {
            let mut st = self.inner.lock.lock().expect("scheduler lock poisoned");
            std::mem::take(&mut st.handles)
        };
        for h in handles {
            let _ = h.join();
        }
    }

    fn spawn_worker(&self, task: Task) {
        let w = Arc::new(Worker {
            closed: AtomicBool::new(false),
        });
        let inner = self.inner.clone();
        let id;
        {
            let mut st = inner.lock.lock().expect("scheduler lock poisoned");
            id = st.next_id;
            st.next_id += 1;
            st.running.insert(id, w.clone());
        }
        let run_inner = inner.clone();
        let handle = thread::Builder::new()
            .name(format!("coracle-worker-{id}"))
            .spawn(move || worker_run(&run_inner, &w, task))
            .expect("failed to spawn worker thread");
        inner
            .lock
            .lock()
            .expect("scheduler lock poisoned")
            .handles
            .push(handle);
    }
}

fn worker_run(inner: &Arc<Inner>, w: &Arc<Worker>, task: Task) {
    let max_workers = inner.max_workers.max(1) as usize;
    let threshold = inner.opts.threshold;
    let mut batch: Vec<Task> = Vec::new();
    let mut task = Some(task);
    loop {
        if batch.is_empty() {
            if let Some(t) = task.take() {
                t();
                inner.tasks.fetch_sub(1, Ordering::AcqRel);
            }
        } else {
            let n = batch.len() as i64;
            for t in batch.drain(..) {
                t();
            }
            inner.tasks.fetch_sub(n, Ordering::AcqRel);
        }
        let mut st = inner.lock.lock().expect("scheduler lock poisoned");
        loop {
            if threshold > 1 && st.pending.len() > max_workers * threshold {
                let alloc = st.pending.len() / max_workers;
                batch.extend(st.pending.drain(..alloc));
                break;
            } else if let Some(t) = st.pending.pop_front() {
                task = Some(t);
                break;
            }
            st = inner.cond.wait(st).expect("scheduler lock poisoned");
            if inner.closed.load(Ordering::Acquire) || w.closed.load(Ordering::Acquire) {
                drop(st);
                inner.workers.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
        drop(st);
    }
}

fn supervise(inner: &Arc<Inner>, done: &flume::Receiver<()>) {
    let mut idle = false;
    let mut idle_since = Instant::now();
    loop {
        match done.recv_timeout(inner.opts.interval) {
            Err(flume::RecvTimeoutError::Timeout) => {
                let workers = inner.workers.load(Ordering::Relaxed);
                let tasks = inner.tasks.load(Ordering::Relaxed);
                if workers > 0 && workers > tasks {
                    if !idle {
                        idle = true;
                        idle_since = Instant::now();
                    } else if idle_since.elapsed() > inner.opts.idle_time {
                        shrink(inner);
                        idle = false;
                    }
                } else {
                    idle = false;
                }
            }
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    // Drain phase: keep waking parked workers until they have all observed
    // the closed flag.
    while inner.workers.load(Ordering::Acquire) > 0 {
        inner.cond.notify_all();
        thread::sleep(Duration::from_millis(1));
    }
}

fn shrink(inner: &Arc<Inner>) {
    let mut st = inner.lock.lock().expect("scheduler lock poisoned");
    let mut deletions = st.running.len() as i64 - st.pending.len() as i64;
    if deletions > 4 {
        deletions /= 4;
    } else if deletions > 0 {
        deletions = 1;
    }
    if deletions <= 0 {
        return;
    }
    tracing::debug!(deletions, workers = st.running.len(), "shrinking idle workers");
    let ids: Vec<usize> = st.running.keys().take(deletions as usize).copied().collect();
    for id in ids {
        if let Some(w) = st.running.remove(&id) {
            w.closed.store(true, Ordering::Release);
        }
    }
    drop(st);
    inner.cond.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_schedule_runs_every_task_once() {
        let total = 100_000;
        let s = Scheduler::new(64, SchedulerOptions::default());
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..total {
            let count = count.clone();
            s.schedule(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        while s.num_tasks() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        s.close();
        assert_eq!(count.load(Ordering::Relaxed), total);
    }

    #[test]
    fn test_single_worker() {
        let s = Scheduler::new(1, SchedulerOptions::default());
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10_000 {
            let count = count.clone();
            s.schedule(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        while s.num_tasks() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        s.close();
        assert_eq!(count.load(Ordering::Relaxed), 10_000);
        assert_eq!(s.num_workers(), 0);
    }

    #[test]
    fn test_batching_disabled() {
        let s = Scheduler::new(
            4,
            SchedulerOptions {
                threshold: 0,
                ..SchedulerOptions::default()
            },
        );
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10_000 {
            let count = count.clone();
            s.schedule(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        while s.num_tasks() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        s.close();
        assert_eq!(count.load(Ordering::Relaxed), 10_000);
    }

    #[test]
    fn test_worker_cap() {
        let s = Scheduler::new(4, SchedulerOptions::default());
        let (tx, rx) = flume::bounded::<()>(0);
        for _ in 0..64 {
            let rx = rx.clone();
            s.schedule(move || {
                let _ = rx.recv();
            });
        }
        thread::sleep(Duration::from_millis(50));
        assert!(s.num_workers() <= 4);
        drop(tx);
        while s.num_tasks() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        s.close();
    }

    #[test]
    fn test_idle_shrink() {
        let s = Scheduler::new(
            8,
            SchedulerOptions {
                threshold: 2,
                idle_time: Duration::from_millis(30),
                interval: Duration::from_millis(10),
            },
        );
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let count = count.clone();
            s.schedule(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        while s.num_tasks() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let before = s.num_workers();
        thread::sleep(Duration::from_millis(200));
        assert!(s.num_workers() < before || before == 0);
        s.close();
        assert_eq!(count.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_close_idempotent() {
        let s = Scheduler::new(2, SchedulerOptions::default());
        s.schedule(|| {});
        s.close();
        s.close();
    }

    #[test]
    #[should_panic(expected = "closed scheduler")]
    fn test_schedule_after_close_panics() {
        let s = Scheduler::new(2, SchedulerOptions::default());
        s.close();
        s.schedule(|| {});
    }
}
