// パス: runtime_native/src/sched.rs
// 役割: 協調スケジューラ（タスク・タイマー・子待ち・gather・キャンセル）を提供する
// 意図: 生成コードの状態機械がイベントループに再開されるための土台を作る
// 関連ファイル: runtime_native/src/readiness.rs, runtime_native/src/pool.rs
//! 協調スケジューラ
//!
//! - タスクは poll 関数とコンテキストを持つ。poll が PENDING を返すと中断し、
//!   待っていた事象（タイマー・子タスク完了・fd 準備）が起きたときに再び
//!   実行キューへ積まれる。
//! - 同じループ周回で ready になったタスクは FIFO 順で走る。
//! - キャンセルはフラグを立てるだけで、タスクは次の中断点で観測して巻き戻す。
//! - 実行キューが空のときはタイマーの最短締切か fd 監視で眠る。プールスレッド
//!   からの完了通知は条件変数（fd 監視中は wake パイプ）で起こす。

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::value::{alloc_value, py_retain, PyData, PyValue, TAG_TASK};

pub const PY_PENDING: i32 = 0;
pub const PY_READY: i32 = 1;

/// 生成コード側の poll 関数の型。
pub type PollFn = extern "C" fn(*mut std::ffi::c_void) -> i32;

/// タスクの実行状態。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Idle,
    Queued,
    Waiting,
    Done,
}

/// タスク 1 つ分の状態。PyBox のペイロードとして保持される。
pub struct TaskState {
    pub poll_fn: Option<PollFn>,
    /// poll に渡すコンテキスト（生ポインタをスレッド間で運ぶため usize 表現）。
    pub ctx: usize,
    pub status: TaskStatus,
    pub result: PyValue,
    pub cancelled: bool,
    /// このタスクの完了を待っている親タスク。
    pub parent: Option<PyValue>,
    /// gather 用の子タスク一覧。
    pub children: Vec<PyValue>,
}

/// TaskState を Mutex で包んだセル。
pub struct TaskCell(pub Mutex<TaskState>);

struct Sched {
    run_queue: VecDeque<PyValue>,
    timers: Vec<(Instant, PyValue)>,
}

static SCHED: Lazy<(Mutex<Sched>, Condvar)> = Lazy::new(|| {
    (
        Mutex::new(Sched {
            run_queue: VecDeque::new(),
            timers: Vec::new(),
        }),
        Condvar::new(),
    )
});

pub fn init() {
    Lazy::force(&SCHED);
    crate::readiness::init();
}

pub fn shutdown() {
    let (lock, _) = &*SCHED;
    let mut sched = lock.lock().expect("sched ロックは毒化しない");
    sched.run_queue.clear();
    sched.timers.clear();
}

fn task_cell(task: PyValue) -> Option<&'static TaskCell> {
    match task.get().map(|b| &b.data) {
        Some(PyData::Task(cell)) => Some(cell),
        _ => None,
    }
}

/// タスクを実行キューへ積む。既にキュー済み・完了済みなら何もしない。
pub fn enqueue(task: PyValue) {
    let Some(cell) = task_cell(task) else {
        return;
    };
    {
        let mut state = cell.0.lock().expect("task ロックは毒化しない");
        if state.status == TaskStatus::Queued || state.status == TaskStatus::Done {
            return;
        }
        state.status = TaskStatus::Queued;
    }
    let (lock, cvar) = &*SCHED;
    lock.lock()
        .expect("sched ロックは毒化しない")
        .run_queue
        .push_back(task);
    cvar.notify_one();
    crate::readiness::wake();
}

/// タスク完了の共通処理。結果は設定済みであること。親がいれば起こす。
pub fn complete(task: PyValue) {
    let parent = {
        let Some(cell) = task_cell(task) else {
            return;
        };
        let mut state = cell.0.lock().expect("task ロックは毒化しない");
        state.status = TaskStatus::Done;
        state.parent.take()
    };
    if let Some(parent) = parent {
        enqueue(parent);
    }
    let (_, cvar) = &*SCHED;
    cvar.notify_all();
    crate::readiness::wake();
}

fn is_done(task: PyValue) -> bool {
    task_cell(task)
        .map(|cell| {
            cell.0.lock().expect("task ロックは毒化しない").status == TaskStatus::Done
        })
        .unwrap_or(true)
}

/// 期限が来たタイマーを実行キューへ移す。次の締切を返す。
fn drain_timers(sched: &mut Sched, now: Instant) -> Option<Instant> {
    let mut due = Vec::new();
    sched.timers.retain(|(deadline, task)| {
        if *deadline <= now {
            due.push(*task);
            false
        } else {
            true
        }
    });
    for task in due {
        if let Some(cell) = task_cell(task) {
            let mut state = cell.0.lock().expect("task ロックは毒化しない");
            if state.status == TaskStatus::Waiting {
                state.status = TaskStatus::Queued;
                sched.run_queue.push_back(task);
            }
        }
    }
    sched.timers.iter().map(|(d, _)| *d).min()
}

/// イベントループ本体。指定タスクが完了するまで回し、その結果を返す。
fn event_loop(main_task: PyValue) -> PyValue {
    enqueue(main_task);
    loop {
        if is_done(main_task) {
            break;
        }
        let next = {
            let (lock, _) = &*SCHED;
            let mut sched = lock.lock().expect("sched ロックは毒化しない");
            drain_timers(&mut sched, Instant::now());
            sched.run_queue.pop_front()
        };
        match next {
            Some(task) => {
                let (poll_fn, ctx) = {
                    let Some(cell) = task_cell(task) else {
                        continue;
                    };
                    let mut state = cell.0.lock().expect("task ロックは毒化しない");
                    if state.status == TaskStatus::Done {
                        continue;
                    }
                    state.status = TaskStatus::Waiting;
                    (state.poll_fn, state.ctx)
                };
                match poll_fn {
                    Some(poll) => {
                        let r = poll(ctx as *mut std::ffi::c_void);
                        if r == PY_READY {
                            complete(task);
                        }
                        // PENDING: poll の中で待ち先が登録済み
                    }
                    None => {
                        // poll を持たないタスク（プール側が完了させる）は待つだけ
                    }
                }
            }
            None => {
                idle_wait(main_task);
            }
        }
    }
    task_cell(main_task)
        .map(|cell| cell.0.lock().expect("task ロックは毒化しない").result)
        .unwrap_or_else(PyValue::null)
}

/// 実行可能なタスクが無いときの待機。
/// タイマー締切・fd 準備・外部完了通知のいずれかまで眠る。
fn idle_wait(main_task: PyValue) {
    let (lock, cvar) = &*SCHED;
    let mut sched = lock.lock().expect("sched ロックは毒化しない");
    let now = Instant::now();
    let next_deadline = drain_timers(&mut sched, now);
    if !sched.run_queue.is_empty() {
        return;
    }
    let timeout = next_deadline
        .map(|d| d.saturating_duration_since(now))
        .unwrap_or(Duration::from_millis(50));
    if crate::readiness::has_waiters() {
        drop(sched);
        // fd 監視がある間はそちらで眠る。wake パイプが外部完了を運ぶ
        let ready = crate::readiness::wait(timeout);
        for task in ready {
            enqueue(task);
        }
        return;
    }
    if is_done(main_task) {
        return;
    }
    let _ = cvar
        .wait_timeout(sched, timeout)
        .expect("sched ロックは毒化しない");
}

// ---- extern 面 ----

/// タスクを作る。poll 関数を持たないタスクはプール側が完了させる。
#[no_mangle]
pub extern "C" fn py_task_new(poll_fn: PollFn, ctx: *mut std::ffi::c_void) -> PyValue {
    alloc_value(
        TAG_TASK,
        PyData::Task(TaskCell(Mutex::new(TaskState {
            poll_fn: Some(poll_fn),
            ctx: ctx as usize,
            status: TaskStatus::Idle,
            result: PyValue::null(),
            cancelled: false,
            parent: None,
            children: Vec::new(),
        }))),
    )
}

#[no_mangle]
pub extern "C" fn py_task_result(task: PyValue) -> PyValue {
    task_cell(task)
        .map(|cell| {
            let state = cell.0.lock().expect("task ロックは毒化しない");
            py_retain(state.result);
            state.result
        })
        .unwrap_or_else(PyValue::null)
}

#[no_mangle]
pub extern "C" fn py_task_set_result(task: PyValue, v: PyValue) {
    if let Some(cell) = task_cell(task) {
        py_retain(v);
        cell.0.lock().expect("task ロックは毒化しない").result = v;
    }
}

/// タイマー待ちを登録する。poll が PENDING を返す直前に呼ばれる。
#[no_mangle]
pub extern "C" fn py_task_wait_timer(task: PyValue, ms: i64) {
    let deadline = Instant::now() + Duration::from_millis(ms.max(0) as u64);
    if let Some(cell) = task_cell(task) {
        cell.0.lock().expect("task ロックは毒化しない").status = TaskStatus::Waiting;
    }
    let (lock, _) = &*SCHED;
    lock.lock()
        .expect("sched ロックは毒化しない")
        .timers
        .push((deadline, task));
}

/// 子タスク完了待ちを登録する。子が未開始ならキューへ積む。
#[no_mangle]
pub extern "C" fn py_task_wait_child(task: PyValue, child: PyValue) {
    if let Some(cell) = task_cell(child) {
        let mut state = cell.0.lock().expect("task ロックは毒化しない");
        if state.status == TaskStatus::Done {
            // 既に完了済みなら親をすぐ戻す
            drop(state);
            enqueue(task);
            return;
        }
        state.parent = Some(task);
    }
    if let Some(cell) = task_cell(task) {
        cell.0.lock().expect("task ロックは毒化しない").status = TaskStatus::Waiting;
    }
    enqueue(child);
}

#[no_mangle]
pub extern "C" fn py_task_cancelled(task: PyValue) -> bool {
    task_cell(task)
        .map(|cell| cell.0.lock().expect("task ロックは毒化しない").cancelled)
        .unwrap_or(false)
}

/// キャンセル要求。タスクは次の中断点でフラグを観測して巻き戻す。
#[no_mangle]
pub extern "C" fn py_task_cancel(task: PyValue) {
    if let Some(cell) = task_cell(task) {
        cell.0.lock().expect("task ロックは毒化しない").cancelled = true;
    }
    enqueue(task);
}

#[no_mangle]
pub extern "C" fn py_sched_spawn(task: PyValue) {
    enqueue(task);
}

/// イベントループを回してタスクの完了結果を返す。
#[no_mangle]
pub extern "C" fn py_sched_block_on(task: PyValue) -> PyValue {
    event_loop(task)
}

/// gather: 子がすべて完了したら結果リストで完了するタスクを作る。
#[no_mangle]
pub extern "C" fn py_sched_gather(tasks: PyValue) -> PyValue {
    let mut children = Vec::new();
    if let Some(PyData::List(items)) = tasks.get().map(|b| &b.data) {
        let items = items.lock().expect("list ロックは毒化しない");
        children.extend(items.iter().copied());
    }
    let gather = alloc_value(
        TAG_TASK,
        PyData::Task(TaskCell(Mutex::new(TaskState {
            poll_fn: Some(gather_poll),
            ctx: 0,
            status: TaskStatus::Idle,
            result: PyValue::null(),
            cancelled: false,
            parent: None,
            children: children.clone(),
        }))),
    );
    // ctx には gather タスク自身を入れる
    if let Some(cell) = task_cell(gather) {
        cell.0.lock().expect("task ロックは毒化しない").ctx = gather.0 as usize;
    }
    for child in children {
        if let Some(cell) = task_cell(child) {
            cell.0.lock().expect("task ロックは毒化しない").parent = Some(gather);
        }
        enqueue(child);
    }
    gather
}

/// gather タスクの poll。全子完了で結果リストを組み立てる。
extern "C" fn gather_poll(ctx: *mut std::ffi::c_void) -> i32 {
    let gather = PyValue(ctx as *mut crate::value::PyBox);
    let Some(cell) = task_cell(gather) else {
        return PY_READY;
    };
    let children = {
        let state = cell.0.lock().expect("task ロックは毒化しない");
        state.children.clone()
    };
    if children.iter().any(|c| !is_done(*c)) {
        // 未完了の子が残っている。子完了時に parent 連鎖で再開される
        return PY_PENDING;
    }
    let out = crate::containers::py_list_new(children.len() as i64);
    for child in children {
        let result = py_task_result(child);
        crate::containers::py_list_append(out, result);
    }
    py_task_set_result(gather, out);
    PY_READY
}
