// パス: src/parser/mod.rs
// 役割: トークン列から AST を生成する再帰下降パーサのエントリポイント
// 意図: 字句解析結果を型推論・コード生成に渡すためのモジュール構成を整理する
// 関連ファイル: src/parser/stmt.rs, src/parser/expr.rs, src/lexer.rs
//! 構文解析モジュール
//!
//! - 文は stmt.rs、式は expr.rs が担当する再帰下降で解析する。
//! - 最初の構文エラーを位置つきで報告し、そのファイルの解析を打ち切る。
//! - 糖衣の正規化はここで行う: 連鎖比較は `and` の連言へ、複合代入は
//!   通常代入へ（添字が左辺のときは添字式を一時変数で 1 回だけ評価する）。

use crate::ast::{Expr, Module, Span, Stmt};
use crate::errors::ParseError;
use crate::lexer::{lex, Token, TokenKind};

mod expr;
mod stmt;

pub struct Parser {
    ts: Vec<Token>,
    i: usize,
    /// 複合代入の添字退避などで使う一時変数の連番。
    temp_counter: usize,
}

impl Parser {
    /// トークン列から新しいパーサインスタンスを構築する。
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            ts: tokens,
            i: 0,
            temp_counter: 0,
        }
    }

    pub(super) fn peek(&self) -> &Token {
        &self.ts[self.i]
    }

    pub(super) fn peek_kind(&self, offset: usize) -> Option<&TokenKind> {
        self.ts.get(self.i + offset).map(|t| &t.kind)
    }

    pub(super) fn pop_any(&mut self) -> Token {
        let t = self.ts[self.i].clone();
        if self.i + 1 < self.ts.len() {
            self.i += 1;
        }
        t
    }

    pub(super) fn pop(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        let t = self.peek().clone();
        if t.kind != kind {
            return Err(ParseError::at(
                "PAR001",
                format!("{:?} を期待しましたが {:?} ({}) でした", kind, t.kind, t.value),
                Some(t.pos),
                Some(t.line),
                Some(t.col),
            ));
        }
        self.pop_any();
        Ok(t)
    }

    pub(super) fn accept(&mut self, kind: TokenKind) -> Option<Token> {
        if self.peek().kind == kind {
            Some(self.pop_any())
        } else {
            None
        }
    }

    /// 先頭トークンが指定の種別かどうか。
    pub(super) fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    /// 一時変数名を払い出す。
    pub(super) fn fresh_temp(&mut self) -> String {
        let name = format!("__aug{}", self.temp_counter);
        self.temp_counter += 1;
        name
    }

    /// 連続する Newline を読み飛ばす。
    pub(super) fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.pop_any();
        }
    }

    pub(super) fn err_here(&self, code: &'static str, msg: impl Into<String>) -> ParseError {
        let t = self.peek();
        ParseError::at(code, msg, Some(t.pos), Some(t.line), Some(t.col))
    }
}

pub(super) fn span_from_token(token: &Token) -> Span {
    Span::new(token.pos, token.line, token.col)
}

/// 文字列トークンの value（`r?<quote><body>` 形式）をデコードする。
pub(super) fn decode_string_token(value: &str) -> Result<String, ParseError> {
    let (raw, rest) = match value.strip_prefix('r') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let mut chars = rest.chars();
    let _quote = chars
        .next()
        .ok_or_else(|| ParseError::new("PAR201", "文字列リテラルが不正です", None))?;
    let body: &str = chars.as_str();
    if raw {
        return Ok(body.to_string());
    }
    let mut out = String::with_capacity(body.len());
    let mut iter = body.chars();
    while let Some(ch) = iter.next() {
        if ch == '\\' {
            let Some(esc) = iter.next() else {
                return Err(ParseError::new("PAR202", "末尾のバックスラッシュです", None));
            };
            match esc {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                '0' => out.push('\0'),
                'x' => {
                    let hi = iter.next();
                    let lo = iter.next();
                    let (Some(hi), Some(lo)) = (hi, lo) else {
                        return Err(ParseError::new("PAR203", "\\x エスケープが不完全です", None));
                    };
                    let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).map_err(|_| {
                        ParseError::new("PAR203", "\\x エスケープが不完全です", None)
                    })?;
                    out.push(byte as char);
                }
                other => out.push(other),
            }
        } else {
            out.push(ch);
        }
    }
    Ok(out)
}

/// bytes トークンの value をバイト列へデコードする。
pub(super) fn decode_bytes_token(value: &str) -> Result<Vec<u8>, ParseError> {
    let text = decode_string_token(value)?;
    Ok(text.bytes().collect())
}

/// ソース全体を解析してモジュールを返す。
pub fn parse_module(src: &str, name: &str) -> Result<Module, ParseError> {
    let ts = lex(src).map_err(|e| {
        ParseError::at(
            "PAR100",
            format!("字句解析に失敗しました: {}", e.0.msg),
            e.0.pos,
            e.0.line,
            e.0.col,
        )
    })?;
    let mut p = Parser::new(ts);
    let mut body = Vec::new();
    p.skip_newlines();
    while !p.check(TokenKind::EOF) {
        p.parse_stmt_into(&mut body)?;
        p.skip_newlines();
    }
    Ok(Module {
        name: name.to_string(),
        body,
    })
}

/// 式 1 つだけを解析する（`-c` 互換入力やテストで使う）。
pub fn parse_expr_only(src: &str) -> Result<Expr, ParseError> {
    let ts = lex(src).map_err(|e| {
        ParseError::at(
            "PAR100",
            format!("字句解析に失敗しました: {}", e.0.msg),
            e.0.pos,
            e.0.line,
            e.0.col,
        )
    })?;
    let mut p = Parser::new(ts);
    let e = p.parse_expr()?;
    p.skip_newlines();
    if !p.check(TokenKind::EOF) {
        return Err(p.err_here("PAR090", "余分なトークンが残っています"));
    }
    Ok(e)
}

/// 文の並びを解析する補助（ブロック単位の再解析で使う）。
pub fn parse_statements(src: &str) -> Result<Vec<Stmt>, ParseError> {
    Ok(parse_module(src, "<block>")?.body)
}

#[cfg(test)]
mod tests {
    use super::{decode_bytes_token, decode_string_token};

    #[test]
    /// 文字列リテラルの基本的なエスケープをテストする。
    fn decode_string_basic_escapes() {
        assert_eq!(decode_string_token("\"a\\n").unwrap(), "a\n");
        assert_eq!(decode_string_token("\"\\t\\\"").unwrap(), "\t\"");
        assert_eq!(decode_string_token("r\"a\\n").unwrap(), "a\\n");
    }

    #[test]
    /// bytes リテラルの \x エスケープをテストする。
    fn decode_bytes_hex_escape() {
        assert_eq!(decode_bytes_token("\"\\x41b").unwrap(), vec![0x41, b'b']);
    }
}
