// パス: src/parser/stmt.rs
// 役割: 文レベルの構文解析とブロック構造の組み立てを担当する
// 意図: インデントトークンをブロックへ変換し、糖衣の正規化をここで済ませる
// 関連ファイル: src/parser/mod.rs, src/parser/expr.rs, src/ast.rs

use crate::ast::{BinOpKind, ExceptHandler, Expr, Param, Span, Stmt};
use crate::errors::ParseError;
use crate::lexer::TokenKind;

use super::{span_from_token, Parser};

impl Parser {
    /// 文を 1 つ解析して `out` へ追加する。複合代入の正規化で複数文になることがある。
    pub(super) fn parse_stmt_into(&mut self, out: &mut Vec<Stmt>) -> Result<(), ParseError> {
        match self.peek().kind {
            TokenKind::KwDef => {
                let stmt = self.parse_funcdef(false)?;
                out.push(stmt);
                Ok(())
            }
            TokenKind::KwAsync => {
                let span = span_from_token(self.peek());
                self.pop_any();
                if !self.check(TokenKind::KwDef) {
                    return Err(ParseError::at(
                        "PAR010",
                        "async の後には def が必要です",
                        Some(span.pos),
                        Some(span.line),
                        Some(span.col),
                    ));
                }
                let stmt = self.parse_funcdef(true)?;
                out.push(stmt);
                Ok(())
            }
            TokenKind::KwClass => {
                let stmt = self.parse_classdef()?;
                out.push(stmt);
                Ok(())
            }
            TokenKind::KwIf => {
                let stmt = self.parse_if()?;
                out.push(stmt);
                Ok(())
            }
            TokenKind::KwWhile => {
                let stmt = self.parse_while()?;
                out.push(stmt);
                Ok(())
            }
            TokenKind::KwFor => {
                let stmt = self.parse_for()?;
                out.push(stmt);
                Ok(())
            }
            TokenKind::KwTry => {
                let stmt = self.parse_try()?;
                out.push(stmt);
                Ok(())
            }
            _ => self.parse_simple_line_into(out),
        }
    }

    /// `def name(params):` を解析する。
    fn parse_funcdef(&mut self, is_async: bool) -> Result<Stmt, ParseError> {
        let def_tok = self.pop(TokenKind::KwDef)?;
        let span = span_from_token(&def_tok);
        let name_tok = self.pop(TokenKind::Name)?;
        self.pop(TokenKind::LParen)?;
        let params = self.parse_params()?;
        self.pop(TokenKind::RParen)?;
        // 戻り値注釈 `-> expr` は受理して読み捨てる（推論が型を決める）
        if self.accept(TokenKind::Arrow).is_some() {
            let _ = self.parse_expr()?;
        }
        let body = self.parse_block()?;
        Ok(Stmt::FuncDef {
            name: name_tok.value,
            params,
            body,
            is_async,
            span,
        })
    }

    /// 仮引数の並びを解析する。デフォルト値付きを許す。
    fn parse_params(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();
        while self.check(TokenKind::Name) {
            let tok = self.pop_any();
            let span = span_from_token(&tok);
            let default = if self.accept(TokenKind::Assign).is_some() {
                Some(self.parse_ternary()?)
            } else {
                None
            };
            params.push(Param {
                name: tok.value,
                default,
                span,
            });
            if self.accept(TokenKind::Comma).is_none() {
                break;
            }
        }
        Ok(params)
    }

    /// `class name(bases):` を解析する。
    fn parse_classdef(&mut self) -> Result<Stmt, ParseError> {
        let class_tok = self.pop(TokenKind::KwClass)?;
        let span = span_from_token(&class_tok);
        let name_tok = self.pop(TokenKind::Name)?;
        let mut bases = Vec::new();
        if self.accept(TokenKind::LParen).is_some() {
            while self.check(TokenKind::Name) {
                bases.push(self.pop_any().value);
                if self.accept(TokenKind::Comma).is_none() {
                    break;
                }
            }
            self.pop(TokenKind::RParen)?;
        }
        let body = self.parse_block()?;
        Ok(Stmt::ClassDef {
            name: name_tok.value,
            bases,
            body,
            span,
        })
    }

    /// `if / elif / else` の連鎖を解析する。elif は orelse に畳み込む。
    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let if_tok = self.pop(TokenKind::KwIf)?;
        let span = span_from_token(&if_tok);
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        let orelse = self.parse_else_chain()?;
        Ok(Stmt::If {
            cond,
            body,
            orelse,
            span,
        })
    }

    /// elif / else の後続を解析する。
    fn parse_else_chain(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.skip_blank_before_dedent_keyword(&[TokenKind::KwElif, TokenKind::KwElse]);
        if self.check(TokenKind::KwElif) {
            let elif_tok = self.pop_any();
            let span = span_from_token(&elif_tok);
            let cond = self.parse_expr()?;
            let body = self.parse_block()?;
            let orelse = self.parse_else_chain()?;
            return Ok(vec![Stmt::If {
                cond,
                body,
                orelse,
                span,
            }]);
        }
        if self.check(TokenKind::KwElse) {
            self.pop_any();
            return self.parse_block();
        }
        Ok(Vec::new())
    }

    /// `while cond:` を解析する。
    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let tok = self.pop(TokenKind::KwWhile)?;
        let span = span_from_token(&tok);
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::While { cond, body, span })
    }

    /// `for target in iter:` を解析する。
    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let tok = self.pop(TokenKind::KwFor)?;
        let span = span_from_token(&tok);
        let target = self.parse_target()?;
        self.pop(TokenKind::KwIn)?;
        let iter = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::For {
            target,
            iter,
            body,
            span,
        })
    }

    /// `try / except / else / finally` を解析する。
    fn parse_try(&mut self) -> Result<Stmt, ParseError> {
        let tok = self.pop(TokenKind::KwTry)?;
        let span = span_from_token(&tok);
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        loop {
            self.skip_blank_before_dedent_keyword(&[
                TokenKind::KwExcept,
                TokenKind::KwElse,
                TokenKind::KwFinally,
            ]);
            if !self.check(TokenKind::KwExcept) {
                break;
            }
            let exc_tok = self.pop_any();
            let h_span = span_from_token(&exc_tok);
            let mut class_name = None;
            let mut bind_name = None;
            if self.check(TokenKind::Name) {
                class_name = Some(self.pop_any().value);
                if self.accept(TokenKind::KwAs).is_some() {
                    bind_name = Some(self.pop(TokenKind::Name)?.value);
                }
            }
            let h_body = self.parse_block()?;
            handlers.push(ExceptHandler {
                class_name,
                bind_name,
                body: h_body,
                span: h_span,
            });
        }
        let mut orelse = Vec::new();
        if self.check(TokenKind::KwElse) {
            self.pop_any();
            orelse = self.parse_block()?;
        }
        self.skip_blank_before_dedent_keyword(&[TokenKind::KwFinally]);
        let mut finally = Vec::new();
        if self.check(TokenKind::KwFinally) {
            self.pop_any();
            finally = self.parse_block()?;
        }
        if handlers.is_empty() && finally.is_empty() {
            return Err(ParseError::at(
                "PAR011",
                "try には except か finally が必要です",
                Some(span.pos),
                Some(span.line),
                Some(span.col),
            ));
        }
        Ok(Stmt::Try {
            body,
            handlers,
            orelse,
            finally,
            span,
        })
    }

    /// ブロック境界の直前にある空行 Newline を読み飛ばす補助。
    /// `except` などの継続キーワードが次に来る場合のみ進める。
    fn skip_blank_before_dedent_keyword(&mut self, kws: &[TokenKind]) {
        let mut j = self.i;
        while matches!(self.ts.get(j).map(|t| &t.kind), Some(TokenKind::Newline)) {
            j += 1;
        }
        if let Some(t) = self.ts.get(j) {
            if kws.contains(&t.kind) {
                self.i = j;
            }
        }
    }

    /// コロンに続くブロックを解析する。インデント形式と同一行形式の両方を受ける。
    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.pop(TokenKind::Colon)?;
        let mut body = Vec::new();
        if self.accept(TokenKind::Newline).is_some() {
            self.skip_newlines();
            self.pop(TokenKind::Indent)?;
            self.skip_newlines();
            while !self.check(TokenKind::Dedent) && !self.check(TokenKind::EOF) {
                self.parse_stmt_into(&mut body)?;
                self.skip_newlines();
            }
            self.pop(TokenKind::Dedent)?;
        } else {
            // 同一行スイート: `if n <= 1: return n`
            self.parse_simple_line_into(&mut body)?;
        }
        if body.is_empty() {
            return Err(self.err_here("PAR012", "ブロックが空です"));
        }
        Ok(body)
    }

    /// 単純文の並び（`;` 区切り、Newline 終端）を解析する。
    fn parse_simple_line_into(&mut self, out: &mut Vec<Stmt>) -> Result<(), ParseError> {
        loop {
            self.parse_small_stmt_into(out)?;
            if self.accept(TokenKind::Semi).is_some() {
                if self.check(TokenKind::Newline) || self.check(TokenKind::EOF) {
                    break;
                }
                continue;
            }
            break;
        }
        if !self.check(TokenKind::EOF) && !self.check(TokenKind::Dedent) {
            self.pop(TokenKind::Newline)?;
        }
        Ok(())
    }

    /// 単純文を 1 つ解析する。
    fn parse_small_stmt_into(&mut self, out: &mut Vec<Stmt>) -> Result<(), ParseError> {
        let span = span_from_token(self.peek());
        match self.peek().kind {
            TokenKind::KwReturn => {
                self.pop_any();
                let value = if self.check(TokenKind::Newline)
                    || self.check(TokenKind::Semi)
                    || self.check(TokenKind::EOF)
                    || self.check(TokenKind::Dedent)
                {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                out.push(Stmt::Return { value, span });
                Ok(())
            }
            TokenKind::KwRaise => {
                self.pop_any();
                let mut exc = None;
                let mut cause = None;
                if !self.check(TokenKind::Newline)
                    && !self.check(TokenKind::Semi)
                    && !self.check(TokenKind::EOF)
                    && !self.check(TokenKind::Dedent)
                {
                    exc = Some(self.parse_expr()?);
                    if self.accept(TokenKind::KwFrom).is_some() {
                        cause = Some(self.parse_expr()?);
                    }
                }
                out.push(Stmt::Raise { exc, cause, span });
                Ok(())
            }
            TokenKind::KwPass => {
                self.pop_any();
                out.push(Stmt::Pass { span });
                Ok(())
            }
            TokenKind::KwBreak => {
                self.pop_any();
                out.push(Stmt::Break { span });
                Ok(())
            }
            TokenKind::KwContinue => {
                self.pop_any();
                out.push(Stmt::Continue { span });
                Ok(())
            }
            TokenKind::KwGlobal => {
                self.pop_any();
                let mut names = vec![self.pop(TokenKind::Name)?.value];
                while self.accept(TokenKind::Comma).is_some() {
                    names.push(self.pop(TokenKind::Name)?.value);
                }
                out.push(Stmt::Global { names, span });
                Ok(())
            }
            TokenKind::KwImport => {
                self.pop_any();
                let module = self.parse_dotted_name()?;
                let alias = if self.accept(TokenKind::KwAs).is_some() {
                    Some(self.pop(TokenKind::Name)?.value)
                } else {
                    None
                };
                out.push(Stmt::Import {
                    module,
                    alias,
                    span,
                });
                Ok(())
            }
            TokenKind::KwFrom => {
                self.pop_any();
                let module = self.parse_dotted_name()?;
                self.pop(TokenKind::KwImport)?;
                let mut names = Vec::new();
                loop {
                    let name = self.pop(TokenKind::Name)?.value;
                    let alias = if self.accept(TokenKind::KwAs).is_some() {
                        Some(self.pop(TokenKind::Name)?.value)
                    } else {
                        None
                    };
                    names.push((name, alias));
                    if self.accept(TokenKind::Comma).is_none() {
                        break;
                    }
                }
                out.push(Stmt::ImportFrom {
                    module,
                    names,
                    span,
                });
                Ok(())
            }
            _ => self.parse_assign_or_expr_into(out, span),
        }
    }

    /// `a.b.c` 形式のモジュール名を読む。
    fn parse_dotted_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.pop(TokenKind::Name)?.value;
        while self.accept(TokenKind::Dot).is_some() {
            name.push('.');
            name.push_str(&self.pop(TokenKind::Name)?.value);
        }
        Ok(name)
    }

    /// 代入・複合代入・式文のいずれかを解析する。
    fn parse_assign_or_expr_into(
        &mut self,
        out: &mut Vec<Stmt>,
        span: Span,
    ) -> Result<(), ParseError> {
        let first = self.parse_expr()?;
        if self.check(TokenKind::Assign) {
            self.pop_any();
            self.validate_target(&first)?;
            let value = self.parse_expr()?;
            out.push(Stmt::Assign {
                target: first,
                value,
                span,
            });
            return Ok(());
        }
        if self.check(TokenKind::AugAssign) {
            let op_tok = self.pop_any();
            let op = aug_op_kind(&op_tok.value).ok_or_else(|| {
                ParseError::at(
                    "PAR013",
                    format!("不明な複合代入演算子です: {}", op_tok.value),
                    Some(op_tok.pos),
                    Some(op_tok.line),
                    Some(op_tok.col),
                )
            })?;
            let value = self.parse_expr()?;
            self.desugar_aug_assign(out, first, op, value, span)?;
            return Ok(());
        }
        out.push(Stmt::ExprStmt { value: first, span });
        Ok(())
    }

    /// 複合代入を通常代入へ正規化する。
    /// 左辺が添字式のときは添字を一時変数へ退避して 1 回だけ評価する。
    fn desugar_aug_assign(
        &mut self,
        out: &mut Vec<Stmt>,
        target: Expr,
        op: BinOpKind,
        value: Expr,
        span: Span,
    ) -> Result<(), ParseError> {
        self.validate_target(&target)?;
        match target {
            Expr::Subscript { obj, index, span: s_span } => {
                let needs_temp = !matches!(
                    *index,
                    Expr::Name { .. } | Expr::IntLit { .. } | Expr::StrLit { .. }
                );
                let index_expr = if needs_temp {
                    let tmp = self.fresh_temp();
                    out.push(Stmt::Assign {
                        target: Expr::Name {
                            name: tmp.clone(),
                            span: s_span,
                        },
                        value: *index,
                        span,
                    });
                    Expr::Name {
                        name: tmp,
                        span: s_span,
                    }
                } else {
                    *index
                };
                let place = Expr::Subscript {
                    obj: obj.clone(),
                    index: Box::new(index_expr.clone()),
                    span: s_span,
                };
                out.push(Stmt::Assign {
                    target: place.clone(),
                    value: Expr::BinOp {
                        op,
                        left: Box::new(place),
                        right: Box::new(value),
                        span,
                    },
                    span,
                });
                Ok(())
            }
            other => {
                out.push(Stmt::Assign {
                    target: other.clone(),
                    value: Expr::BinOp {
                        op,
                        left: Box::new(other),
                        right: Box::new(value),
                        span,
                    },
                    span,
                });
                Ok(())
            }
        }
    }

    /// for ループ・内包表記のターゲット（名前またはタプル）を解析する。
    /// 括弧付きの `(a, b)` も受ける。
    pub(super) fn parse_target(&mut self) -> Result<Expr, ParseError> {
        if self.check(TokenKind::LParen) {
            let open = self.pop_any();
            let span = span_from_token(&open);
            let mut items = Vec::new();
            while self.check(TokenKind::Name) {
                let tok = self.pop_any();
                let t_span = span_from_token(&tok);
                items.push(Expr::Name {
                    name: tok.value,
                    span: t_span,
                });
                if self.accept(TokenKind::Comma).is_none() {
                    break;
                }
            }
            self.pop(TokenKind::RParen)?;
            if items.len() == 1 {
                return Ok(items.pop().expect("1 要素は直前に確認済み"));
            }
            return Ok(Expr::TupleLit { items, span });
        }
        let first_tok = self.pop(TokenKind::Name)?;
        let span = span_from_token(&first_tok);
        let first = Expr::Name {
            name: first_tok.value,
            span,
        };
        if !self.check(TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.accept(TokenKind::Comma).is_some() {
            let tok = self.pop(TokenKind::Name)?;
            let t_span = span_from_token(&tok);
            items.push(Expr::Name {
                name: tok.value,
                span: t_span,
            });
        }
        Ok(Expr::TupleLit { items, span })
    }

    /// 代入先として許される式形か検査する。
    fn validate_target(&self, target: &Expr) -> Result<(), ParseError> {
        match target {
            Expr::Name { .. } | Expr::Attribute { .. } | Expr::Subscript { .. } => Ok(()),
            Expr::TupleLit { items, .. } if items.iter().all(|i| matches!(i, Expr::Name { .. })) => {
                Ok(())
            }
            other => {
                let s = other.span();
                Err(ParseError::at(
                    "PAR014",
                    "代入先にできない式です",
                    Some(s.pos),
                    Some(s.line),
                    Some(s.col),
                ))
            }
        }
    }
}

/// 複合代入演算子の表記から二項演算子種別を引く。
fn aug_op_kind(text: &str) -> Option<BinOpKind> {
    match text {
        "+" => Some(BinOpKind::Add),
        "-" => Some(BinOpKind::Sub),
        "*" => Some(BinOpKind::Mul),
        "/" => Some(BinOpKind::Div),
        "//" => Some(BinOpKind::FloorDiv),
        "%" => Some(BinOpKind::Mod),
        "**" => Some(BinOpKind::Pow),
        "&" => Some(BinOpKind::BitAnd),
        "|" => Some(BinOpKind::BitOr),
        "^" => Some(BinOpKind::BitXor),
        "<<" => Some(BinOpKind::Shl),
        ">>" => Some(BinOpKind::Shr),
        _ => None,
    }
}
