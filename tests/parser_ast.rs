// パス: tests/parser_ast.rs
// 役割: 構文解析の正規化・エラー報告・unparse 往復律を検証する
// 意図: 連鎖比較と複合代入の脱糖を仕様どおりに固定する
// 関連ファイル: src/parser/stmt.rs, src/parser/expr.rs, src/ast.rs

mod test_support;

use pylot::ast::{BinOpKind, CmpOpKind, Expr, Stmt};
use test_support::{parse, parse_err};

#[test]
/// 連鎖比較 `a < b < c` が `a < b and b < c` へ正規化されることをテストする。
fn chained_comparison_desugars_to_conjunction() {
    let module = parse("r = a < b < c\n");
    let Stmt::Assign { value, .. } = &module.body[0] else {
        panic!("代入のはず");
    };
    let Expr::BoolOp { is_and, left, right, .. } = value else {
        panic!("and 連言のはず: {value:?}");
    };
    assert!(*is_and);
    let Expr::Compare { op: op1, right: mid1, .. } = left.as_ref() else {
        panic!("左は比較のはず");
    };
    let Expr::Compare { op: op2, left: mid2, .. } = right.as_ref() else {
        panic!("右は比較のはず");
    };
    assert_eq!(*op1, CmpOpKind::Lt);
    assert_eq!(*op2, CmpOpKind::Lt);
    // 中央の b は両方の比較に現れる
    assert_eq!(format!("{mid1}"), "b");
    assert_eq!(format!("{mid2}"), "b");
}

#[test]
/// 複合代入 `x += y` が `x = x + y` へ正規化されることをテストする。
fn augmented_assign_desugars() {
    let module = parse("x += y\n");
    let Stmt::Assign { target, value, .. } = &module.body[0] else {
        panic!("代入のはず");
    };
    assert_eq!(format!("{target}"), "x");
    let Expr::BinOp { op, .. } = value else {
        panic!("二項演算のはず");
    };
    assert_eq!(*op, BinOpKind::Add);
}

#[test]
/// 添字への複合代入で添字式が 1 回だけ評価されることをテストする。
fn subscript_augmented_assign_evaluates_index_once() {
    let module = parse("a[f()] += 1\n");
    assert_eq!(module.body.len(), 2, "一時変数の導入で 2 文になる");
    let Stmt::Assign { target, value, .. } = &module.body[0] else {
        panic!("一時変数への代入のはず");
    };
    assert!(format!("{target}").starts_with("__aug"));
    assert_eq!(format!("{value}"), "f()");
    let Stmt::Assign { target, .. } = &module.body[1] else {
        panic!("本体の代入のはず");
    };
    // 本体は一時変数で添字する
    assert!(format!("{target}").contains("__aug"));
}

#[test]
/// 単純な添字への複合代入は一時変数を作らないことをテストする。
fn simple_subscript_augmented_assign_has_no_temp() {
    let module = parse("a[i] += 1\n");
    assert_eq!(module.body.len(), 1);
}

#[test]
/// 同一行スイート `if n <= 1: return n` が受理されることをテストする。
fn inline_suite_is_accepted() {
    let module = parse("def f(n):\n    if n <= 1: return n\n    return 2\n");
    let Stmt::FuncDef { body, .. } = &module.body[0] else {
        panic!("関数定義のはず");
    };
    let Stmt::If { body: then_body, .. } = &body[0] else {
        panic!("if のはず");
    };
    assert!(matches!(then_body[0], Stmt::Return { .. }));
}

#[test]
/// elif の連鎖が orelse の入れ子として表現されることをテストする。
fn elif_chain_nests_in_orelse() {
    let module = parse("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n");
    let Stmt::If { orelse, .. } = &module.body[0] else {
        panic!("if のはず");
    };
    assert_eq!(orelse.len(), 1);
    let Stmt::If { orelse: inner, .. } = &orelse[0] else {
        panic!("elif は入れ子の if のはず");
    };
    assert_eq!(inner.len(), 1);
}

#[test]
/// try / except / finally の構造が保持されることをテストする。
fn try_except_finally_structure() {
    let src = "try:\n    x = f()\nexcept ValueError as e:\n    x = 0\nfinally:\n    y = 1\n";
    let module = parse(src);
    let Stmt::Try { handlers, finally, .. } = &module.body[0] else {
        panic!("try のはず");
    };
    assert_eq!(handlers.len(), 1);
    assert_eq!(handlers[0].class_name.as_deref(), Some("ValueError"));
    assert_eq!(handlers[0].bind_name.as_deref(), Some("e"));
    assert_eq!(finally.len(), 1);
}

#[test]
/// 最初の構文エラーが位置付きで報告されることをテストする。
fn first_syntax_error_reported_with_position() {
    let err = parse_err("x = (1 +\n");
    assert!(err.0.line.is_some());
    assert!(err.0.col.is_some());
}

#[test]
/// 内包表記・ラムダ・三項式が解析されることをテストする。
fn expression_forms_parse() {
    let module = parse(
        "a = [x * 2 for x in items if x > 0]\nb = lambda n: n + 1\nc = 1 if flag else 2\n",
    );
    assert!(matches!(
        &module.body[0],
        Stmt::Assign { value: Expr::ListComp { .. }, .. }
    ));
    assert!(matches!(
        &module.body[1],
        Stmt::Assign { value: Expr::Lambda { .. }, .. }
    ));
    assert!(matches!(
        &module.body[2],
        Stmt::Assign { value: Expr::IfExp { .. }, .. }
    ));
}

#[test]
/// すべてのノードが有効な Span を持つことをテストする。
fn every_statement_has_a_span() {
    let src = "def f(n):\n    return n\nx = f(1)\n";
    let module = parse(src);
    for stmt in &module.body {
        let span = stmt.span();
        assert!(span.line >= 1);
        assert!(span.pos < src.len());
    }
}

/// unparse 往復律: parse ∘ unparse ∘ parse が（Span を除き）恒等になる。
fn assert_roundtrip(src: &str) {
    let first = parse(src);
    let unparsed = format!("{first}");
    let second = pylot::parser::parse_module(&unparsed, "test")
        .unwrap_or_else(|e| panic!("unparse の再解析に失敗: {e}\n---\n{unparsed}"));
    let reparsed = format!("{second}");
    assert_eq!(unparsed, reparsed, "往復で AST が変わりました");
}

#[test]
/// 代表的な構文の unparse 往復をテストする。
fn unparse_roundtrip_fixes_ast() {
    assert_roundtrip("def fib(n):\n    if n <= 1: return n\n    return fib(n - 1) + fib(n - 2)\nprint(fib(10))\n");
    assert_roundtrip("class A:\n    def hello(self):\n        return \"A\"\n");
    assert_roundtrip("async def main():\n    await sleep(0.01)\n    return 7\n");
    assert_roundtrip("xs = [i * i for i in range(10) if i % 2 == 0]\n");
    assert_roundtrip("d = {\"a\": 1, \"b\": 2}\ns = {1, 2, 3}\nt = (1,)\n");
    assert_roundtrip("try:\n    x = f()\nexcept ValueError as e:\n    x = 0\nelse:\n    y = 1\nfinally:\n    z = 2\n");
    assert_roundtrip("while x < 10:\n    x += 1\n");
    assert_roundtrip("for k, v in items:\n    print(k)\n");
    assert_roundtrip("msg = f\"count={n + 1}!\"\n");
}
