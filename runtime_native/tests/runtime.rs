// パス: runtime_native/tests/runtime.rs
// 役割: ランタイム ABI（値・コンテナ・例外・スケジューラ・プール）の検証
// 意図: 生成コードが依存する extern 面の意味論を Rust 側から固定する
// 関連ファイル: runtime_native/src/value.rs, runtime_native/src/sched.rs

use std::ffi::c_void;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use runtime_native::*;

/// スケジューラはプロセス全体で共有されるため、イベントループを回す
/// テストは直列化する。
static SCHED_LOCK: Mutex<()> = Mutex::new(());

fn str_value(text: &str) -> PyValue {
    py_str_new(text.as_ptr(), text.len())
}

#[test]
/// 小整数 −5..=256 がインターン表の同一参照になることをテストする。
fn small_integers_are_interned() {
    py_rt_init();
    assert_eq!(py_small_int(7).0, py_small_int(7).0);
    assert_eq!(py_small_int(-5).0, py_small_int(-5).0);
    assert_eq!(py_small_int(256).0, py_small_int(256).0);
    // 範囲外は毎回新しいボックスになる
    assert_ne!(py_small_int(1000).0, py_small_int(1000).0);
    assert_eq!(py_int_unbox(py_small_int(42)), 42);
}

#[test]
/// 真偽値化の規則（空・0・None が偽）をテストする。
fn truthiness_rules() {
    py_rt_init();
    assert!(!py_truthy(py_none()));
    assert!(!py_truthy(py_small_int(0)));
    assert!(py_truthy(py_small_int(1)));
    assert!(!py_truthy(str_value("")));
    assert!(py_truthy(str_value("a")));
    let l = py_list_new(0);
    assert!(!py_truthy(l));
    py_list_append(l, py_small_int(1));
    assert!(py_truthy(l));
}

#[test]
/// 文字列の連結・繰り返し・文字数・添字をテストする。
fn string_operations() {
    py_rt_init();
    let ab = py_str_concat(str_value("a"), str_value("b"));
    assert!(py_str_eq(ab, str_value("ab")));
    let aaa = py_str_repeat(str_value("a"), 3);
    assert_eq!(py_str_len(aaa), 3);
    let ch = py_str_index(str_value("abc"), 1);
    assert!(py_str_eq(ch, str_value("b")));
    let neg = py_str_index(str_value("abc"), -1);
    assert!(py_str_eq(neg, str_value("c")));
}

#[test]
/// リストと辞書の基本操作と表示をテストする。
fn containers_and_display() {
    py_rt_init();
    let l = py_list_new(2);
    py_list_append(l, py_small_int(1));
    py_list_append(l, str_value("x"));
    assert_eq!(py_list_len(l), 2);
    assert!(py_list_contains(l, py_small_int(1)));
    assert_eq!(display_value(l), "[1, 'x']");

    let d = py_dict_new();
    py_dict_set(d, str_value("k"), py_small_int(5));
    assert!(py_dict_contains(d, str_value("k")));
    assert_eq!(py_int_unbox(py_dict_get(d, str_value("k"))), 5);
    assert_eq!(py_dict_len(d), 1);

    let t = py_tuple_new(2);
    py_tuple_set(t, 0, py_small_int(1));
    py_tuple_set(t, 1, py_small_int(2));
    assert_eq!(py_int_unbox(py_tuple_get(t, 1)), 2);
}

#[test]
/// f-string 用の文字列ビルダをテストする。
fn string_builder_concatenates() {
    py_rt_init();
    let sb = py_strbuf_new();
    py_strbuf_push(sb, str_value("count="));
    py_strbuf_push(sb, py_small_int(3));
    let out = py_strbuf_finish(sb);
    assert!(py_str_eq(out, str_value("count=3")));
}

#[test]
/// 多倍長整数の extern 面（加算・比較）をテストする。
fn bigint_extern_surface() {
    py_rt_init();
    let text = "99999999999999999999";
    let a = py_bigint_from_str(text.as_ptr(), text.len());
    let one = py_small_int(1);
    let sum = py_bigint_add(a, one);
    assert_eq!(display_value(sum), "100000000000000000000");
    assert_eq!(py_bigint_cmp(a, one), 1);
    assert_eq!(py_bigint_cmp(one, a), -1);
}

#[test]
/// 例外セルの設定・照会・クリアをテストする。
fn exception_cell_roundtrip() {
    py_rt_init();
    py_exc_clear();
    assert_eq!(py_exc_class(), 0);
    py_exc_set(EXC_VALUE_ERROR, str_value("bad"));
    assert_eq!(py_exc_class(), EXC_VALUE_ERROR);
    py_exc_set_cause(EXC_KEY_ERROR);
    py_exc_clear();
    assert_eq!(py_exc_class(), 0);
}

#[test]
/// 動的オブジェクトの属性 set / get / has の往復をテストする。
fn dynamic_object_attributes_roundtrip() {
    py_rt_init();
    let obj = py_obj_new_dynamic(101);
    assert_eq!(py_obj_tag(obj), 101);
    let name = b"x";
    assert!(!py_attr_has(obj, name.as_ptr(), 1));
    py_attr_set(obj, name.as_ptr(), 1, py_small_int(7));
    assert!(py_attr_has(obj, name.as_ptr(), 1));
    assert_eq!(py_int_unbox(py_attr_get(obj, name.as_ptr(), 1)), 7);
    // 無いままの属性は存在検査で偽になる
    let other = b"y";
    assert!(!py_attr_has(obj, other.as_ptr(), 1));
}

#[test]
/// 参照カウントの増減で解放されないことをテストする（インターン値は不滅）。
fn refcount_retain_release() {
    py_rt_init();
    let v = py_int_box(12345);
    py_retain(v);
    py_release(v);
    assert_eq!(py_int_unbox(v), 12345);
    let interned = py_small_int(1);
    py_release(interned);
    py_release(interned);
    assert_eq!(py_int_unbox(py_small_int(1)), 1);
}

// ---- スケジューラ ----

#[repr(C)]
struct TimerMachine {
    pc: u32,
    ms: i64,
    task: PyValue,
}

extern "C" fn timer_poll(ctx: *mut c_void) -> i32 {
    let m = unsafe { &mut *(ctx as *mut TimerMachine) };
    match m.pc {
        0 => {
            m.pc = 1;
            py_task_wait_timer(m.task, m.ms);
            PY_PENDING
        }
        _ => {
            py_task_set_result(m.task, py_small_int(7));
            PY_READY
        }
    }
}

#[test]
/// タイマー中断つき状態機械が期待時間内に結果を返すことをテストする。
/// （シードシナリオ 3 のランタイム側の半分。）
fn timer_state_machine_completes_within_bounds() {
    let _guard = SCHED_LOCK.lock().expect("sched lock");
    py_rt_init();
    let mut machine = Box::new(TimerMachine {
        pc: 0,
        ms: 20,
        task: PyValue::null(),
    });
    let task = py_task_new(timer_poll, &mut *machine as *mut TimerMachine as *mut c_void);
    machine.task = task;
    let start = Instant::now();
    let result = py_sched_block_on(task);
    let elapsed = start.elapsed();
    assert_eq!(py_int_unbox(result), 7);
    assert!(elapsed >= Duration::from_millis(20), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
}

#[test]
/// gather が全子タスクの結果をリストで返すことをテストする。
fn gather_collects_all_children() {
    let _guard = SCHED_LOCK.lock().expect("sched lock");
    py_rt_init();
    let mut machines: Vec<Box<TimerMachine>> = (0..3)
        .map(|i| {
            Box::new(TimerMachine {
                pc: 0,
                ms: 5 + i,
                task: PyValue::null(),
            })
        })
        .collect();
    let children = py_list_new(3);
    for m in machines.iter_mut() {
        let task = py_task_new(timer_poll, &mut **m as *mut TimerMachine as *mut c_void);
        m.task = task;
        py_list_append(children, task);
    }
    let gathered = py_sched_gather(children);
    let result = py_sched_block_on(gathered);
    assert_eq!(py_list_len(result), 3);
    assert_eq!(py_int_unbox(py_list_get(result, 0)), 7);
}

extern "C" fn cancel_aware_poll(ctx: *mut c_void) -> i32 {
    let m = unsafe { &mut *(ctx as *mut TimerMachine) };
    // キャンセルは次の中断点で観測され、巻き戻しになる
    if py_task_cancelled(m.task) {
        py_exc_set(EXC_CANCELLED, py_none());
        py_task_set_result(m.task, py_none());
        return PY_READY;
    }
    match m.pc {
        0 => {
            m.pc = 1;
            py_task_wait_timer(m.task, m.ms);
            PY_PENDING
        }
        _ => {
            py_task_set_result(m.task, py_small_int(7));
            PY_READY
        }
    }
}

#[test]
/// キャンセルフラグが次の中断点で観測されることをテストする。
fn cancellation_observed_at_suspension() {
    let _guard = SCHED_LOCK.lock().expect("sched lock");
    py_rt_init();
    py_exc_clear();
    let mut machine = Box::new(TimerMachine {
        pc: 0,
        ms: 60_000,
        task: PyValue::null(),
    });
    let task = py_task_new(cancel_aware_poll, &mut *machine as *mut TimerMachine as *mut c_void);
    machine.task = task;
    py_task_cancel(task);
    let start = Instant::now();
    let _ = py_sched_block_on(task);
    assert!(start.elapsed() < Duration::from_secs(5), "即座に戻るはず");
    assert_eq!(py_exc_class(), EXC_CANCELLED);
    py_exc_clear();
}

// ---- ワーカープール ----

#[repr(C)]
struct SumJob {
    upto: i64,
}

extern "C" fn sum_poll(ctx: *mut c_void) -> i32 {
    let job = unsafe { &*(ctx as *const SumJob) };
    let mut total = 0i64;
    for i in 0..=job.upto {
        total += i;
    }
    // 結果はワーカー上の現在タスクへ書く
    py_task_set_result(py_task_current(), py_int_box(total));
    PY_READY
}

#[test]
/// CPU タスクが値としてプールへ移動し、完了がループへ伝わることをテストする。
fn pool_task_completes_and_wakes_loop() {
    let _guard = SCHED_LOCK.lock().expect("sched lock");
    py_rt_init();
    let job = Box::new(SumJob { upto: 1000 });
    let task = py_pool_spawn(sum_poll, Box::into_raw(job) as *mut c_void);
    let result = py_sched_block_on(task);
    assert_eq!(py_int_unbox(result), 500_500);
}

// ---- fd 準備通知 ----

#[repr(C)]
struct PipeMachine {
    pc: u32,
    fd: i32,
    task: PyValue,
}

extern "C" fn pipe_poll(ctx: *mut c_void) -> i32 {
    let m = unsafe { &mut *(ctx as *mut PipeMachine) };
    match m.pc {
        0 => {
            m.pc = 1;
            py_task_wait_fd_readable(m.task, m.fd);
            PY_PENDING
        }
        _ => {
            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(m.fd, buf.as_mut_ptr() as *mut c_void, 8) };
            py_task_set_result(m.task, py_small_int(n as i64));
            PY_READY
        }
    }
}

#[test]
/// fd の読み取り準備がタスクを再開することをテストする。
fn fd_readiness_resumes_task() {
    let _guard = SCHED_LOCK.lock().expect("sched lock");
    py_rt_init();
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let payload = b"ok";
    let written = unsafe { libc::write(fds[1], payload.as_ptr() as *const c_void, 2) };
    assert_eq!(written, 2);
    let mut machine = Box::new(PipeMachine {
        pc: 0,
        fd: fds[0],
        task: PyValue::null(),
    });
    let task = py_task_new(pipe_poll, &mut *machine as *mut PipeMachine as *mut c_void);
    machine.task = task;
    let result = py_sched_block_on(task);
    assert_eq!(py_int_unbox(result), 2);
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}
