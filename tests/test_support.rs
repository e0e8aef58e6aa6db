// パス: tests/test_support.rs
// 役割: 統合テスト共通の補助関数とフィクスチャを提供する
// 意図: 解析・推論・生成の繰り返し操作を一元化しテストを簡潔に保つ
// 関連ファイル: tests/infer_types.rs, tests/emit_zig.rs, tests/lexer_tokens.rs
#![allow(dead_code)]

use pylot::ast::Module;
use pylot::emit;
use pylot::infer::{self, ModuleInfo};
use pylot::lexer::{lex, Token, TokenKind};
use pylot::parser;

/// ソースをトークン列にする。失敗はテスト失敗。
pub fn lex_ok(src: &str) -> Vec<Token> {
    lex(src).expect("lex")
}

/// トークン種別だけの列を返す（EOF は除く）。
pub fn kinds(src: &str) -> Vec<TokenKind> {
    lex_ok(src)
        .into_iter()
        .map(|t| t.kind)
        .filter(|k| *k != TokenKind::EOF)
        .collect()
}

pub fn parse(src: &str) -> Module {
    parser::parse_module(src, "test").expect("parse module")
}

pub fn parse_err(src: &str) -> pylot::ParseError {
    parser::parse_module(src, "test").expect_err("parse は失敗するはず")
}

/// 解析から推論までを一度に行うフィクスチャ。
pub struct InferFixture {
    pub info: ModuleInfo,
}

impl InferFixture {
    pub fn load(src: &str) -> Self {
        let module = parse(src);
        let info = infer::infer_module(&module).expect("infer module");
        Self { info }
    }

    pub fn load_err(src: &str) -> pylot::TypeError {
        let module = parse(src);
        infer::infer_module(&module).expect_err("infer は失敗するはず")
    }

    /// 関数の表示付きシグネチャ `params -> ret` を返す。
    pub fn sig_text(&self, key: &str) -> String {
        let f = &self.info.functions[key];
        let params: Vec<String> = f.sig.params.iter().map(|t| format!("{t}")).collect();
        format!("{} -> {}", params.join(", "), f.sig.ret)
    }
}

/// 解析・推論・生成まで通し、Zig ソース本文を返す。
pub fn emit_source(src: &str) -> String {
    let fixture = InferFixture::load(src);
    let emitted = emit::emit_module(&fixture.info, "test.py").expect("emit module");
    emitted.source
}
