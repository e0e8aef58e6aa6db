// パス: tests/infer_types.rs
// 役割: 型・特性推論の不動点が仕様のシナリオどおりに収束することを検証する
// 意図: 具象型がレジスタ表現へ落ちる前提と特性駆動の形状選択を固定する
// 関連ファイル: src/infer/mod.rs, src/infer/flow.rs, tests/test_support.rs

mod test_support;

use pylot::typesys::Type;
use test_support::InferFixture;

const FIB_SRC: &str = "def fib(n):\n    if n <= 1: return n\n    return fib(n - 1) + fib(n - 2)\nprint(fib(10))\n";

#[test]
/// シードシナリオ 1: fib が Int -> Int・純粋・末尾再帰でない・失敗しない。
fn fib_infers_int_to_int_pure() {
    let fx = InferFixture::load(FIB_SRC);
    assert_eq!(fx.sig_text("fib"), "int -> int");
    let traits = &fx.info.functions["fib"].traits;
    assert!(traits.is_pure);
    assert!(!traits.is_tail_recursive);
    assert!(!traits.can_fail);
    assert!(!traits.does_io);
    assert!(!traits.may_await);
    assert!(!traits.needs_allocator);
}

#[test]
/// 末尾位置の自己再帰だけなら is_tail_recursive が立つ。
fn tail_position_recursion_is_detected() {
    let src = "def loop(n):\n    if n <= 0: return 0\n    return loop(n - 1)\n";
    let fx = InferFixture::load(src);
    assert!(fx.info.functions["loop"].traits.is_tail_recursive);
}

#[test]
/// シードシナリオ 2: 継承がレイアウトを閉じ、メソッドは直接解決される。
fn class_inheritance_closes_layout() {
    let src = "class A:\n    def hello(self):\n        return \"A\"\nclass B(A):\n    def hello(self):\n        return \"B\"\nprint(B().hello())\n";
    let fx = InferFixture::load(src);
    let a = fx.info.classes.id_of("A").expect("A");
    let b = fx.info.classes.id_of("B").expect("B");
    assert!(!fx.info.classes.get(a).open);
    assert!(!fx.info.classes.get(b).open);
    assert_eq!(
        fx.info.classes.get(b).methods.get("hello").map(String::as_str),
        Some("B.hello")
    );
    assert_eq!(fx.info.functions["B.hello"].sig.ret, Type::Str);
}

#[test]
/// シードシナリオ 3: async + タイマー I/O の特性。
fn async_io_function_gets_state_machine_traits() {
    let src = "async def main():\n    await sleep(0.01)\n    return 7\nprint(run(main()))\n";
    let fx = InferFixture::load(src);
    let traits = &fx.info.functions["main"].traits;
    assert!(traits.may_await);
    assert!(traits.does_io, "sleep はタイマー I/O プリミティブ");
    assert_eq!(
        fx.info.functions["main"].sig.ret,
        Type::Coro(Box::new(Type::Int))
    );
}

#[test]
/// CPU バウンドの async（I/O なし・変異なし・失敗なし）は純粋のまま。
/// await 自体は純粋性の連言に入らない。
fn cpu_bound_async_without_io_stays_pure() {
    let src = "async def square(n):\n    return n * n\nasync def compute(n):\n    x = await square(n)\n    return x\ncompute(3)\n";
    let fx = InferFixture::load(src);
    let traits = &fx.info.functions["compute"].traits;
    assert!(traits.may_await);
    assert!(!traits.does_io);
    assert!(traits.is_pure, "await だけでは純粋性は壊れない");
    assert!(fx.info.functions["square"].traits.is_pure);
}

#[test]
/// isinstance の絞り込みが真側・偽側で効く。
fn isinstance_narrowing_splits_branches() {
    let src = "def f(x):\n    if isinstance(x, int):\n        y = x + 1\n    else:\n        y = 0\n    return y\nf(1)\nf(\"a\")\n";
    let fx = InferFixture::load(src);
    // 引数は int | str の合併で届くが、戻り値は int に定まる
    assert_eq!(fx.info.functions["f"].sig.ret, Type::Int);
}

#[test]
/// 属性への代入がクラスのレイアウトを育てる。
fn attribute_assignment_grows_layout() {
    let src = "class P:\n    def __init__(self, x, y):\n        self.x = x\n        self.y = y\nP(1, 2)\n";
    let fx = InferFixture::load(src);
    let p = fx.info.classes.id_of("P").expect("P");
    let layout = fx.info.classes.get(p);
    assert_eq!(layout.attr("x").map(|s| s.offset), Some(0));
    assert_eq!(layout.attr("y").map(|s| s.offset), Some(1));
    assert_eq!(layout.attr("x").map(|s| s.ty.clone()), Some(Type::Int));
}

#[test]
/// 閉じたクラスに無い属性の参照がコンパイル時エラーになる。
fn missing_attribute_on_closed_class_is_compile_error() {
    let src = "class A:\n    def hello(self):\n        return 1\nA().missing\n";
    let err = InferFixture::load_err(src);
    assert_eq!(err.0.code, "TYPE020");
    assert!(format!("{err}").contains("AttributeError"));
}

#[test]
/// setattr の使用がレイアウトを open へ退化させる。
fn setattr_degrades_layout_to_open() {
    let src = "class A:\n    def hello(self):\n        return 1\na = A()\nsetattr(a, \"x\", 1)\n";
    let fx = InferFixture::load(src);
    let a = fx.info.classes.id_of("A").expect("A");
    assert!(fx.info.classes.get(a).open);
}

#[test]
/// 変更系メソッドが仮引数の変異として観測される。
fn mutating_method_marks_parameter() {
    let src = "def add_item(items, v):\n    items.append(v)\n";
    let fx = InferFixture::load(src);
    let traits = &fx.info.functions["add_item"].traits;
    assert_eq!(traits.mutates_param, vec![true, false]);
    assert!(!traits.is_pure);
}

#[test]
/// raise が can_fail を立て、純粋性を壊す。
fn raise_marks_can_fail() {
    let src = "def f(x):\n    if x < 0:\n        raise ValueError(\"neg\")\n    return x\n";
    let fx = InferFixture::load(src);
    let traits = &fx.info.functions["f"].traits;
    assert!(traits.can_fail);
    assert!(!traits.is_pure);
}

#[test]
/// can_fail は呼び出しグラフを遡って伝播する。
fn can_fail_propagates_through_callers() {
    let src = "def inner(x):\n    raise ValueError(\"x\")\ndef outer(x):\n    return inner(x)\nouter(1)\n";
    let fx = InferFixture::load(src);
    assert!(fx.info.functions["outer"].traits.can_fail);
}

#[test]
/// yield を含む関数はジェネレータで、戻り値は要素型を持つ。
fn yield_makes_generator() {
    let src = "def gen(n):\n    yield n\n    yield n + 1\ngen(1)\n";
    let fx = InferFixture::load(src);
    let f = &fx.info.functions["gen"];
    assert!(f.traits.is_generator);
    assert_eq!(f.sig.ret, Type::Generator(Box::new(Type::Int)));
}

#[test]
/// 推論後に Unknown が残らない（Any へ拡大される）。
fn no_unknown_survives_inference() {
    let src = "def f(x):\n    return x\n";
    let fx = InferFixture::load(src);
    let f = &fx.info.functions["f"];
    assert!(!matches!(f.sig.params[0], Type::Unknown));
    assert!(!matches!(f.sig.ret, Type::Unknown));
    for ty in f.locals.values() {
        assert!(!matches!(ty, Type::Unknown));
    }
}

#[test]
/// 分岐の合流で Union が作られ、予算超過で Any に落ちる。
fn joins_produce_unions() {
    let src = "def f(flag):\n    if flag:\n        x = 1\n    else:\n        x = \"a\"\n    return x\nf(True)\n";
    let fx = InferFixture::load(src);
    let ret = &fx.info.functions["f"].sig.ret;
    assert!(matches!(ret, Type::Union(items) if items.len() == 2), "{ret}");
}

#[test]
/// 内包表記の要素型が反復対象とガードから決まる。
fn comprehension_infers_element_type() {
    let src = "def f(items):\n    return [x * 2 for x in items if x > 0]\nf([1, 2, 3])\n";
    let fx = InferFixture::load(src);
    assert_eq!(
        fx.info.functions["f"].sig.ret,
        Type::List(Box::new(Type::Int))
    );
}

#[test]
/// 固定幅を超えるリテラルが多倍長型へ昇格し、算術がその型を保つ。
fn bigint_literal_promotes_arithmetic() {
    let src = "def f():\n    return 123456789012345678901234567890 + 1\nf()\n";
    let fx = InferFixture::load(src);
    assert_eq!(fx.info.functions["f"].sig.ret, Type::BigInt);
}

#[test]
/// 公開シグネチャのダイジェスト素材が内容変更で変わる。
fn exported_signature_tracks_content() {
    let a = InferFixture::load("def f(n):\n    return n + 1\nf(1)\n");
    let b = InferFixture::load("def f(n):\n    return \"x\"\nf(1)\n");
    assert_ne!(a.info.exported_signature(), b.info.exported_signature());
}
