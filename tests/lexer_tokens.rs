// パス: tests/lexer_tokens.rs
// 役割: 字句解析のレイアウト・リテラル・エラー系を検証する
// 意図: インデント合成と f-string 展開が仕様どおりであることを固定する
// 関連ファイル: src/lexer.rs, tests/test_support.rs

mod test_support;

use pylot::lexer::{lex, TokenKind};
use test_support::{kinds, lex_ok};

#[test]
/// ブロックの出入りで Indent / Dedent が合成されることをテストする。
fn indentation_produces_indent_dedent() {
    let src = "def f():\n    x = 1\n    y = 2\nz = 3\n";
    let ks = kinds(src);
    let indents = ks.iter().filter(|k| **k == TokenKind::Indent).count();
    let dedents = ks.iter().filter(|k| **k == TokenKind::Dedent).count();
    assert_eq!(indents, 1);
    assert_eq!(dedents, 1);
    // Dedent は z の行頭位置で出る
    let dedent_pos = ks.iter().position(|k| *k == TokenKind::Dedent).expect("dedent");
    assert_eq!(ks[dedent_pos + 1], TokenKind::Name);
}

#[test]
/// 入れ子ブロックの EOF で開いている分だけ Dedent が閉じることをテストする。
fn eof_closes_open_blocks() {
    let src = "def f():\n    if x:\n        y = 1";
    let ks = kinds(src);
    let dedents = ks.iter().filter(|k| **k == TokenKind::Dedent).count();
    assert_eq!(dedents, 2);
}

#[test]
/// タブと空白の一貫しない混在が IndentationError になることをテストする。
fn inconsistent_tabs_and_spaces_fail() {
    let src = "def f():\n\tx = 1\n        y = 2\n";
    let err = lex(src).expect_err("混在は失敗するはず");
    assert_eq!(err.0.code, "LEX020");
    assert!(format!("{err}").contains("IndentationError"));
}

#[test]
/// どの外側ブロックとも一致しないデデントが失敗することをテストする。
fn mismatched_dedent_fails() {
    let src = "def f():\n    x = 1\n  y = 2\n";
    let err = lex(src).expect_err("不一致デデントは失敗するはず");
    assert_eq!(err.0.code, "LEX021");
}

#[test]
/// 括弧内では改行がレイアウトへ影響しないことをテストする。
fn brackets_suppress_layout() {
    let src = "x = [1,\n     2,\n     3]\n";
    let ks = kinds(src);
    let newlines = ks.iter().filter(|k| **k == TokenKind::Newline).count();
    assert_eq!(newlines, 1, "閉じ括弧の後の 1 つだけのはず");
    assert!(!ks.contains(&TokenKind::Indent));
}

#[test]
/// 行継続バックスラッシュが論理行を繋ぐことをテストする。
fn backslash_joins_lines() {
    let src = "x = 1 + \\\n    2\n";
    let ks = kinds(src);
    let newlines = ks.iter().filter(|k| **k == TokenKind::Newline).count();
    assert_eq!(newlines, 1);
}

#[test]
/// 数値リテラルの基数と桁区切りをテストする。
fn numeric_literal_forms() {
    let toks = lex_ok("1_000_000 0xff 0o17 0b1010 1.5e3 2j\n");
    assert_eq!(toks[0].kind, TokenKind::Int);
    assert_eq!(toks[0].value, "1000000");
    assert_eq!(toks[1].kind, TokenKind::Int);
    assert_eq!(toks[1].value, "0xff");
    assert_eq!(toks[2].kind, TokenKind::Int);
    assert_eq!(toks[3].kind, TokenKind::Int);
    assert_eq!(toks[4].kind, TokenKind::Float);
    assert_eq!(toks[5].kind, TokenKind::Imag);
}

#[test]
/// i64 に収まらないリテラルが多倍長へ分類されることをテストする。
fn oversized_literal_becomes_bigint() {
    let toks = lex_ok("123456789012345678901234567890\n");
    assert_eq!(toks[0].kind, TokenKind::BigInt);
    assert_eq!(toks[0].value, "123456789012345678901234567890");
}

#[test]
/// f-string が開始・本文・補間・終了のトークン列に展開されることをテストする。
fn fstring_expands_to_nested_tokens() {
    let ks = kinds("f\"a{x}b\"\n");
    assert_eq!(
        ks,
        vec![
            TokenKind::FStringStart,
            TokenKind::FStringMiddle,
            TokenKind::InterpStart,
            TokenKind::Name,
            TokenKind::InterpEnd,
            TokenKind::FStringMiddle,
            TokenKind::FStringEnd,
            TokenKind::Newline,
        ]
    );
}

#[test]
/// f-string 補間の中の式が通常のトークンとして出ることをテストする。
fn fstring_interp_contains_expression_tokens() {
    let ks = kinds("f\"{a + 1}\"\n");
    assert!(ks.contains(&TokenKind::Plus));
    assert!(ks.contains(&TokenKind::Int));
}

#[test]
/// 三重引用符の文字列が改行を跨げることをテストする。
fn triple_quoted_string_spans_lines() {
    let toks = lex_ok("x = \"\"\"a\nb\"\"\"\n");
    let s = toks.iter().find(|t| t.kind == TokenKind::Str).expect("str");
    assert!(s.value.contains('\n'));
}

#[test]
/// raw と bytes プレフィックスが分類されることをテストする。
fn string_prefixes() {
    let toks = lex_ok("r\"a\\n\" b\"bytes\"\n");
    assert_eq!(toks[0].kind, TokenKind::Str);
    assert!(toks[0].value.starts_with('r'));
    assert_eq!(toks[1].kind, TokenKind::Bytes);
}

#[test]
/// コメントと空行がトークンを生まないことをテストする。
fn comments_and_blank_lines_are_trivia() {
    let src = "# comment\n\nx = 1  # trailing\n";
    let ks = kinds(src);
    assert_eq!(
        ks,
        vec![
            TokenKind::Name,
            TokenKind::Assign,
            TokenKind::Int,
            TokenKind::Newline,
        ]
    );
}

#[test]
/// 閉じていない文字列が位置付きで失敗することをテストする。
fn unterminated_string_fails_with_position() {
    let err = lex("x = \"abc\n").expect_err("未終端は失敗するはず");
    assert_eq!(err.0.code, "LEX003");
    assert_eq!(err.0.line, Some(1));
}

#[test]
/// 複合代入トークンが演算子部分を value に残すことをテストする。
fn augmented_assign_token_keeps_operator() {
    let toks = lex_ok("x //= 2\n");
    let aug = toks
        .iter()
        .find(|t| t.kind == TokenKind::AugAssign)
        .expect("aug");
    assert_eq!(aug.value, "//");
}
