// パス: tests/emit_zig.rs
// 役割: 特性駆動のコード形状選択が生成ソースに現れることを検証する
// 意図: レジスタ表現・状態機械・ガード領域の生成形を固定する
// 関連ファイル: src/emit/zig.rs, tests/test_support.rs

mod test_support;

use pylot::emit;
use test_support::{emit_source, InferFixture};

const FIB_SRC: &str = "def fib(n):\n    if n <= 1: return n\n    return fib(n - 1) + fib(n - 2)\nprint(fib(10))\n";

#[test]
/// fib が機械整数のままの型付き関数になることをテストする。
fn fib_emits_machine_integers() {
    let src = emit_source(FIB_SRC);
    assert!(src.contains("fn py_fib(v_n: i64) i64 {"), "{src}");
    assert!(src.contains("py_fib((v_n - 1))"));
    // 整数経路にボックス化は現れない
    let fib_fn: String = src
        .lines()
        .skip_while(|l| !l.contains("fn py_fib"))
        .take_while(|l| !l.starts_with('}'))
        .collect();
    assert!(!fib_fn.contains("py_int_box"));
    // print は整数専用の出力を使う
    assert!(src.contains("py_print_int(py_fib(10))"));
}

#[test]
/// 閉じたクラスがレコード + 自由関数になり、直接呼び出しされることをテストする。
fn closed_class_emits_record_and_direct_call() {
    let src = emit_source(
        "class A:\n    def hello(self):\n        return \"A\"\nclass B(A):\n    def hello(self):\n        return \"B\"\nprint(B().hello())\n",
    );
    assert!(src.contains("const Obj_A = extern struct {"));
    assert!(src.contains("const Obj_B = extern struct {"));
    assert!(src.contains("fn py_B_hello(v_self: *Obj_B) PyObj {"));
    // vtable を経由しない直接呼び出し
    assert!(src.contains("py_B_hello("));
}

#[test]
/// async + I/O がイベントループ駆動の状態機械になることをテストする。
fn async_io_emits_state_machine() {
    let src = emit_source("async def main():\n    await sleep(0.01)\n    return 7\nprint(run(main()))\n");
    assert!(src.contains("const Task_py_main = struct {"), "{src}");
    assert!(src.contains("pc: u32"));
    assert!(src.contains("py_task_wait_timer(self.task,"));
    assert!(src.contains("return PY_PENDING;"));
    assert!(src.contains("py_task_set_result(self.task, py_small_int(7));"));
    assert!(src.contains("py_sched_block_on(py_main_task_new())"));
    // キャンセルは次の中断点で観測される
    assert!(src.contains("py_task_cancelled(self.task)"));
}

#[test]
/// ジェネレータが next() を持つ状態機械になることをテストする。
fn generator_emits_next_state_machine() {
    let src = emit_source("def gen(n):\n    yield n\n    yield n + 1\ngen(1)\n");
    assert!(src.contains("const Gen_py_gen = struct {"), "{src}");
    assert!(src.contains("fn next(self: *Gen_py_gen) ?i64 {"));
    assert!(src.contains("return null"));
}

#[test]
/// try / except がガード領域とクラス ID のマッチへ落ちることをテストする。
fn try_except_emits_guarded_region() {
    let src = emit_source(
        "def f(x):\n    if x < 0:\n        raise ValueError(\"neg\")\n    return x\ntry:\n    y = f(1)\nexcept ValueError as e:\n    y = 0\n",
    );
    assert!(src.contains("guard"), "{src}");
    assert!(src.contains("py_exc_class()"));
    assert!(src.contains("py_exc_set(2,"), "ValueError のタグは 2");
    // 一致しない例外は伝播する
    assert!(src.contains("error.PyExc"));
}

#[test]
/// can_fail 関数がエラーユニオンで返ることをテストする。
fn can_fail_emits_error_union() {
    let src = emit_source("def f(x):\n    if x < 0:\n        raise ValueError(\"neg\")\n    return x\nf(1)\n");
    assert!(src.contains("fn py_f(v_x: i64) PyErr!i64 {"), "{src}");
}

#[test]
/// リスト内包が長さ既知の容量予約つきループになることをテストする。
fn comprehension_reserves_capacity() {
    let src = emit_source("def f(items):\n    return [x * 2 for x in items]\nf([1, 2, 3])\n");
    assert!(src.contains("py_list_new(py_list_len("), "{src}");
}

#[test]
/// 小整数リテラルのボックス化がインターン参照になることをテストする。
fn small_int_literals_use_intern_table() {
    let src = emit_source("xs = [1, 300]\n");
    assert!(src.contains("py_small_int(1)"));
    assert!(src.contains("py_int_box(300)"));
}

#[test]
/// 動的属性 API がボックス表現への呼び出しへ落ちることをテストする。
/// setattr の使用でクラスが open になるため、生成は動的オブジェクト経由になる。
fn dynamic_attribute_api_lowers_to_boxed_calls() {
    let src = emit_source(
        "class A:\n    def __init__(self):\n        self.x = 1\na = A()\nsetattr(a, \"y\", 2)\nprint(getattr(a, \"y\"))\nprint(hasattr(a, \"x\"))\n",
    );
    assert!(src.contains("py_obj_new_dynamic("), "{src}");
    assert!(src.contains("py_attr_set(g_a, \"y\", 1, py_small_int(2))"), "{src}");
    assert!(src.contains("py_attr_get(g_a, \"y\", 1)"));
    assert!(src.contains("py_attr_has(g_a, \"x\", 1)"));
    // open レイアウトのレコード構造体は生成されない
    assert!(!src.contains("const Obj_A = extern struct {"));
}

#[test]
/// range ループがカウンタへ落ちることをテストする。
fn range_loop_lowers_to_counter() {
    let src = emit_source("def f(n):\n    total = 0\n    for i in range(n):\n        total += i\n    return total\nf(10)\n");
    assert!(src.contains("while (v_i < v_n) : (v_i += 1) {"), "{src}");
}

#[test]
/// f-string が文字列ビルダ呼び出しへ落ちることをテストする。
fn fstring_lowers_to_string_builder() {
    let src = emit_source("n = 1\nmsg = f\"count={n}\"\nprint(msg)\n");
    assert!(src.contains("py_strbuf_new()"));
    assert!(src.contains("py_strbuf_finish("));
}

#[test]
/// 行マップサイドカーが生成行と原文行を対応付けることをテストする。
fn line_map_sidecar_entries() {
    let fx = InferFixture::load(FIB_SRC);
    let emitted = emit::emit_module(&fx.info, "sample.py").expect("emit");
    assert!(!emitted.line_map.is_empty());
    for entry in &emitted.line_map {
        assert_eq!(entry.source_file, "sample.py");
        assert!(entry.source_line >= 1);
        assert!(entry.generated_line >= 1);
    }
    // 生成行は単調に増える
    let lines: Vec<usize> = emitted.line_map.iter().map(|e| e.generated_line).collect();
    let mut sorted = lines.clone();
    sorted.sort_unstable();
    assert_eq!(lines, sorted);
}

#[test]
/// エントリポイントがランタイムの初期化と後始末を囲むことをテストする。
fn entrypoint_wraps_runtime_lifecycle() {
    let src = emit_source("print(1)\n");
    assert!(src.contains("pub fn main() void {"));
    assert!(src.contains("py_rt_init();"));
    assert!(src.contains("defer py_rt_shutdown();"));
}
