// パス: runtime_native/src/pool.rs
// 役割: CPU バウンドタスク向けのワークスティーリングプールを提供する
// 意図: タスクを値としてチャネル越しに運び、共有可変状態なしで並列化する
// 関連ファイル: runtime_native/src/sched.rs, runtime_native/src/value.rs
//! ワーカープール
//!
//! - グローバル注入キュー + ワーカーごとのデックで仕事を盗み合う。
//! - ジョブは (poll 関数, コンテキスト, タスク) の値そのもので、ワーカーへ
//!   移動する。ワーカー間に共有可変状態はない。
//! - ワーカーはスレッドローカルに「現在のタスク」を差し、生成コードが
//!   `py_task_current` で自分のタスクへ結果を書けるようにする。

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::deque::{Injector, Stealer, Worker};
use crossbeam::utils::Backoff;
use once_cell::sync::Lazy;

use crate::sched::{complete, PollFn, PY_READY};
use crate::value::PyValue;

/// プールを流れるジョブ。タスクの値そのものがワーカーへ移動する。
struct Job {
    poll_fn: PollFn,
    ctx: usize,
    task: PyValue,
}

unsafe impl Send for Job {}

struct Pool {
    injector: Arc<Injector<Job>>,
    _stealers: Vec<Stealer<Job>>,
    shutdown: Arc<AtomicBool>,
}

thread_local! {
    static CURRENT_TASK: Cell<PyValue> = const { Cell::new(PyValue::null()) };
}

static POOL: Lazy<Pool> = Lazy::new(|| {
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut stealers = Vec::new();
    let mut locals = Vec::new();
    for _ in 0..workers {
        let local: Worker<Job> = Worker::new_fifo();
        stealers.push(local.stealer());
        locals.push(local);
    }
    let stealers_shared: Arc<Vec<Stealer<Job>>> =
        Arc::new(locals.iter().map(|w| w.stealer()).collect());
    for (worker_id, local) in locals.into_iter().enumerate() {
        let injector = Arc::clone(&injector);
        let stealers = Arc::clone(&stealers_shared);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name(format!("py-pool-{worker_id}"))
            .spawn(move || worker_loop(worker_id, local, injector, stealers, shutdown))
            .expect("プールスレッドの起動に失敗することはない");
    }
    Pool {
        injector,
        _stealers: stealers,
        shutdown,
    }
});

fn worker_loop(
    worker_id: usize,
    local: Worker<Job>,
    injector: Arc<Injector<Job>>,
    stealers: Arc<Vec<Stealer<Job>>>,
    shutdown: Arc<AtomicBool>,
) {
    let backoff = Backoff::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let job = local.pop().or_else(|| {
            // 自分のデックが空なら注入キュー、それも空なら他人から盗む
            injector
                .steal_batch_and_pop(&local)
                .success()
                .or_else(|| {
                    stealers
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != worker_id)
                        .find_map(|(_, s)| s.steal().success())
                })
        });
        match job {
            Some(job) => {
                backoff.reset();
                CURRENT_TASK.with(|cell| cell.set(job.task));
                let r = (job.poll_fn)(job.ctx as *mut std::ffi::c_void);
                CURRENT_TASK.with(|cell| cell.set(PyValue::null()));
                if r == PY_READY {
                    complete(job.task);
                }
            }
            None => {
                backoff.snooze();
            }
        }
    }
}

// ---- extern 面 ----

/// CPU バウンドの poll をプールへ投入し、タスクハンドルを返す。
#[no_mangle]
pub extern "C" fn py_pool_spawn(poll_fn: PollFn, ctx: *mut std::ffi::c_void) -> PyValue {
    let task = crate::sched::py_task_new(pool_noop_poll, std::ptr::null_mut());
    // イベントループには実行させず、完了はワーカーが告げる
    if let Some(crate::value::PyData::Task(cell)) = task.get().map(|b| &b.data) {
        cell.0.lock().expect("task ロックは毒化しない").poll_fn = None;
    }
    POOL.injector.push(Job {
        poll_fn,
        ctx: ctx as usize,
        task,
    });
    task
}

/// ワーカー上で実行中のタスク。生成コードが結果の書き先に使う。
#[no_mangle]
pub extern "C" fn py_task_current() -> PyValue {
    CURRENT_TASK.with(|cell| cell.get())
}

/// プール停止（プロセス終了時）。一度も使われていなければ何もしない。
pub fn shutdown() {
    if let Some(pool) = Lazy::get(&POOL) {
        pool.shutdown.store(true, Ordering::SeqCst);
    }
}

extern "C" fn pool_noop_poll(_ctx: *mut std::ffi::c_void) -> i32 {
    PY_READY
}
