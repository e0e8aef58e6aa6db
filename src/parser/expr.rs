// パス: src/parser/expr.rs
// 役割: 式の優先順位付き再帰下降解析を担当する
// 意図: 演算子の結合規則と連鎖比較の正規化を一箇所で扱う
// 関連ファイル: src/parser/mod.rs, src/parser/stmt.rs, src/ast.rs

use crate::ast::{
    BinOpKind, CmpOpKind, Comprehension, Expr, FStringPart, IntBase, Param, UnaryOpKind,
};
use crate::errors::ParseError;
use crate::lexer::TokenKind;

use super::{decode_bytes_token, decode_string_token, span_from_token, Parser};

impl Parser {
    /// 式解析のエントリポイント。yield 式もここで受ける。
    pub(super) fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        if self.check(TokenKind::KwYield) {
            let tok = self.pop_any();
            let span = span_from_token(&tok);
            let value = if self.check(TokenKind::Newline)
                || self.check(TokenKind::Semi)
                || self.check(TokenKind::EOF)
                || self.check(TokenKind::Dedent)
                || self.check(TokenKind::RParen)
            {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            return Ok(Expr::Yield { expr: value, span });
        }
        if self.check(TokenKind::KwLambda) {
            return self.parse_lambda();
        }
        self.parse_ternary()
    }

    /// `lambda params: body` を解析する。
    fn parse_lambda(&mut self) -> Result<Expr, ParseError> {
        let tok = self.pop(TokenKind::KwLambda)?;
        let span = span_from_token(&tok);
        let mut params = Vec::new();
        while self.check(TokenKind::Name) {
            let p_tok = self.pop_any();
            let p_span = span_from_token(&p_tok);
            let default = if self.accept(TokenKind::Assign).is_some() {
                Some(self.parse_ternary()?)
            } else {
                None
            };
            params.push(Param {
                name: p_tok.value,
                default,
                span: p_span,
            });
            if self.accept(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.pop(TokenKind::Colon)?;
        let body = self.parse_expr()?;
        Ok(Expr::Lambda {
            params,
            body: Box::new(body),
            span,
        })
    }

    /// 三項式 `X if C else Y` を解析する。
    pub(super) fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let then_branch = self.parse_or()?;
        if self.check(TokenKind::KwIf) {
            let tok = self.pop_any();
            let span = span_from_token(&tok);
            let cond = self.parse_or()?;
            self.pop(TokenKind::KwElse)?;
            let else_branch = self.parse_expr()?;
            return Ok(Expr::IfExp {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
                span,
            });
        }
        Ok(then_branch)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.check(TokenKind::KwOr) {
            let tok = self.pop_any();
            let span = span_from_token(&tok);
            let right = self.parse_and()?;
            left = Expr::BoolOp {
                is_and: false,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.check(TokenKind::KwAnd) {
            let tok = self.pop_any();
            let span = span_from_token(&tok);
            let right = self.parse_not()?;
            left = Expr::BoolOp {
                is_and: true,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.check(TokenKind::KwNot) {
            let tok = self.pop_any();
            let span = span_from_token(&tok);
            let operand = self.parse_not()?;
            return Ok(Expr::UnaryOp {
                op: UnaryOpKind::Not,
                operand: Box::new(operand),
                span,
            });
        }
        self.parse_comparison()
    }

    /// 比較式を解析する。連鎖比較 `a < b < c` は
    /// `a < b and b < c` へ正規化する。
    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_bitor()?;
        let mut pairs: Vec<(CmpOpKind, Expr, crate::ast::Span)> = Vec::new();
        loop {
            let Some(op) = self.peek_cmp_op() else {
                break;
            };
            let tok = self.pop_any();
            let span = span_from_token(&tok);
            // `is not` / `not in` の 2 語目を消費する
            let op = match op {
                CmpOpKind::Is if self.check(TokenKind::KwNot) => {
                    self.pop_any();
                    CmpOpKind::IsNot
                }
                other => other,
            };
            let right = self.parse_bitor()?;
            pairs.push((op, right, span));
        }
        if pairs.is_empty() {
            return Ok(first);
        }
        let mut prev = first;
        let mut result: Option<Expr> = None;
        for (op, right, span) in pairs {
            let cmp = Expr::Compare {
                op,
                left: Box::new(prev.clone()),
                right: Box::new(right.clone()),
                span,
            };
            result = Some(match result {
                None => cmp,
                Some(acc) => Expr::BoolOp {
                    is_and: true,
                    left: Box::new(acc),
                    right: Box::new(cmp),
                    span,
                },
            });
            prev = right;
        }
        Ok(result.expect("pairs は空でないと確認済み"))
    }

    /// 現在位置の比較演算子を覗き見る。`not in` は 2 トークン先読みする。
    fn peek_cmp_op(&mut self) -> Option<CmpOpKind> {
        match self.peek().kind {
            TokenKind::Lt => Some(CmpOpKind::Lt),
            TokenKind::Le => Some(CmpOpKind::Le),
            TokenKind::Gt => Some(CmpOpKind::Gt),
            TokenKind::Ge => Some(CmpOpKind::Ge),
            TokenKind::EqEq => Some(CmpOpKind::Eq),
            TokenKind::Ne => Some(CmpOpKind::Ne),
            TokenKind::KwIs => Some(CmpOpKind::Is),
            TokenKind::KwIn => Some(CmpOpKind::In),
            TokenKind::KwNot if self.peek_kind(1) == Some(&TokenKind::KwIn) => {
                // `not in`: ここで not を消費し、In を残して NotIn を返す
                self.pop_any();
                Some(CmpOpKind::NotIn)
            }
            _ => None,
        }
    }

    fn parse_bitor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binop_level(&[(TokenKind::Pipe, BinOpKind::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binop_level(&[(TokenKind::Caret, BinOpKind::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> Result<Expr, ParseError> {
        self.parse_binop_level(&[(TokenKind::Amp, BinOpKind::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> Result<Expr, ParseError> {
        self.parse_binop_level(
            &[
                (TokenKind::Shl, BinOpKind::Shl),
                (TokenKind::Shr, BinOpKind::Shr),
            ],
            Self::parse_arith,
        )
    }

    fn parse_arith(&mut self) -> Result<Expr, ParseError> {
        self.parse_binop_level(
            &[
                (TokenKind::Plus, BinOpKind::Add),
                (TokenKind::Minus, BinOpKind::Sub),
            ],
            Self::parse_term,
        )
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        self.parse_binop_level(
            &[
                (TokenKind::Star, BinOpKind::Mul),
                (TokenKind::Slash, BinOpKind::Div),
                (TokenKind::DblSlash, BinOpKind::FloorDiv),
                (TokenKind::Percent, BinOpKind::Mod),
            ],
            Self::parse_unary,
        )
    }

    /// 左結合の二項演算レベルを汎用的に解析する。
    fn parse_binop_level(
        &mut self,
        table: &[(TokenKind, BinOpKind)],
        next: fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let mut left = next(self)?;
        'outer: loop {
            for (tk, op) in table {
                if self.check(tk.clone()) {
                    let tok = self.pop_any();
                    let span = span_from_token(&tok);
                    let right = next(self)?;
                    left = Expr::BinOp {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                        span,
                    };
                    continue 'outer;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOpKind::Neg),
            TokenKind::Plus => Some(UnaryOpKind::Pos),
            TokenKind::Tilde => Some(UnaryOpKind::Invert),
            TokenKind::KwAwait => {
                let tok = self.pop_any();
                let span = span_from_token(&tok);
                let operand = self.parse_unary()?;
                return Ok(Expr::Await {
                    expr: Box::new(operand),
                    span,
                });
            }
            _ => None,
        };
        if let Some(op) = op {
            let tok = self.pop_any();
            let span = span_from_token(&tok);
            let operand = self.parse_unary()?;
            return Ok(Expr::UnaryOp {
                op,
                operand: Box::new(operand),
                span,
            });
        }
        self.parse_power()
    }

    /// 冪乗 `**` は右結合。左辺は後置式まで解析済みの形を取る。
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix()?;
        if self.check(TokenKind::DblStar) {
            let tok = self.pop_any();
            let span = span_from_token(&tok);
            let right = self.parse_unary()?;
            return Ok(Expr::BinOp {
                op: BinOpKind::Pow,
                left: Box::new(base),
                right: Box::new(right),
                span,
            });
        }
        Ok(base)
    }

    /// 呼び出し・属性参照・添字を後置ループで解析する。
    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek().kind {
                TokenKind::LParen => {
                    let tok = self.pop_any();
                    let span = span_from_token(&tok);
                    let mut args = Vec::new();
                    while !self.check(TokenKind::RParen) {
                        args.push(self.parse_expr()?);
                        if self.accept(TokenKind::Comma).is_none() {
                            break;
                        }
                    }
                    self.pop(TokenKind::RParen)?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        span,
                    };
                }
                TokenKind::LBrack => {
                    let tok = self.pop_any();
                    let span = span_from_token(&tok);
                    let index = self.parse_subscript_index(span)?;
                    self.pop(TokenKind::RBrack)?;
                    expr = Expr::Subscript {
                        obj: Box::new(expr),
                        index: Box::new(index),
                        span,
                    };
                }
                TokenKind::Dot => {
                    let tok = self.pop_any();
                    let span = span_from_token(&tok);
                    let name = self.pop(TokenKind::Name)?.value;
                    expr = Expr::Attribute {
                        obj: Box::new(expr),
                        name,
                        span,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// 添字の中身（単一式またはスライス）を解析する。
    fn parse_subscript_index(&mut self, span: crate::ast::Span) -> Result<Expr, ParseError> {
        let lower = if self.check(TokenKind::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        if self.accept(TokenKind::Colon).is_none() {
            return Ok(*lower.expect("コロンなしの添字は式を持つ"));
        }
        let upper = if self.check(TokenKind::Colon) || self.check(TokenKind::RBrack) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let step = if self.accept(TokenKind::Colon).is_some() {
            if self.check(TokenKind::RBrack) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            }
        } else {
            None
        };
        Ok(Expr::Slice {
            lower,
            upper,
            step,
            span,
        })
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let tok = self.peek().clone();
        let span = span_from_token(&tok);
        match tok.kind {
            TokenKind::Name => {
                self.pop_any();
                Ok(Expr::Name {
                    name: tok.value,
                    span,
                })
            }
            TokenKind::Int => {
                self.pop_any();
                let (value, base) = parse_int_token(&tok.value).ok_or_else(|| {
                    ParseError::at(
                        "PAR020",
                        format!("整数リテラルを解釈できません: {}", tok.value),
                        Some(tok.pos),
                        Some(tok.line),
                        Some(tok.col),
                    )
                })?;
                Ok(Expr::IntLit { value, base, span })
            }
            TokenKind::BigInt => {
                self.pop_any();
                Ok(Expr::BigIntLit {
                    repr: tok.value,
                    span,
                })
            }
            TokenKind::Float => {
                self.pop_any();
                let value: f64 = tok.value.parse().map_err(|_| {
                    ParseError::at(
                        "PAR021",
                        format!("浮動小数リテラルを解釈できません: {}", tok.value),
                        Some(tok.pos),
                        Some(tok.line),
                        Some(tok.col),
                    )
                })?;
                Ok(Expr::FloatLit { value, span })
            }
            TokenKind::Imag => Err(ParseError::at(
                "PAR022",
                "複素数リテラルはコンパイル対象として未対応です",
                Some(tok.pos),
                Some(tok.line),
                Some(tok.col),
            )),
            TokenKind::Str => {
                self.pop_any();
                let value = decode_string_token(&tok.value)?;
                Ok(Expr::StrLit { value, span })
            }
            TokenKind::Bytes => {
                self.pop_any();
                let value = decode_bytes_token(&tok.value)?;
                Ok(Expr::BytesLit { value, span })
            }
            TokenKind::FStringStart => self.parse_fstring(span),
            TokenKind::KwTrue => {
                self.pop_any();
                Ok(Expr::BoolLit { value: true, span })
            }
            TokenKind::KwFalse => {
                self.pop_any();
                Ok(Expr::BoolLit { value: false, span })
            }
            TokenKind::KwNone => {
                self.pop_any();
                Ok(Expr::NoneLit { span })
            }
            TokenKind::LParen => self.parse_paren(span),
            TokenKind::LBrack => self.parse_list_display(span),
            TokenKind::LBrace => self.parse_brace_display(span),
            _ => Err(ParseError::at(
                "PAR030",
                format!("式を期待しましたが {:?} ({}) でした", tok.kind, tok.value),
                Some(tok.pos),
                Some(tok.line),
                Some(tok.col),
            )),
        }
    }

    /// f-string トークン列を AST の部品列へ組み立てる。
    fn parse_fstring(&mut self, span: crate::ast::Span) -> Result<Expr, ParseError> {
        self.pop(TokenKind::FStringStart)?;
        let mut parts = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::FStringMiddle => {
                    let t = self.pop_any();
                    parts.push(FStringPart::Text(t.value));
                }
                TokenKind::InterpStart => {
                    self.pop_any();
                    let expr = self.parse_expr()?;
                    self.pop(TokenKind::InterpEnd)?;
                    parts.push(FStringPart::Interp(expr));
                }
                TokenKind::FStringEnd => {
                    self.pop_any();
                    break;
                }
                _ => {
                    return Err(self.err_here("PAR031", "f-string の内部トークンが不正です"));
                }
            }
        }
        Ok(Expr::FString { parts, span })
    }

    /// 括弧で囲まれた式・タプルを解析する。
    fn parse_paren(&mut self, span: crate::ast::Span) -> Result<Expr, ParseError> {
        self.pop(TokenKind::LParen)?;
        if self.accept(TokenKind::RParen).is_some() {
            return Ok(Expr::TupleLit {
                items: Vec::new(),
                span,
            });
        }
        let first = self.parse_expr()?;
        if self.check(TokenKind::Comma) {
            let mut items = vec![first];
            while self.accept(TokenKind::Comma).is_some() {
                if self.check(TokenKind::RParen) {
                    break;
                }
                items.push(self.parse_expr()?);
            }
            self.pop(TokenKind::RParen)?;
            return Ok(Expr::TupleLit { items, span });
        }
        self.pop(TokenKind::RParen)?;
        Ok(first)
    }

    /// リスト表示またはリスト内包を解析する。
    fn parse_list_display(&mut self, span: crate::ast::Span) -> Result<Expr, ParseError> {
        self.pop(TokenKind::LBrack)?;
        if self.accept(TokenKind::RBrack).is_some() {
            return Ok(Expr::ListLit {
                items: Vec::new(),
                span,
            });
        }
        let first = self.parse_expr()?;
        if self.check(TokenKind::KwFor) {
            let generators = self.parse_comprehension_clauses()?;
            self.pop(TokenKind::RBrack)?;
            return Ok(Expr::ListComp {
                elt: Box::new(first),
                generators,
                span,
            });
        }
        let mut items = vec![first];
        while self.accept(TokenKind::Comma).is_some() {
            if self.check(TokenKind::RBrack) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.pop(TokenKind::RBrack)?;
        Ok(Expr::ListLit { items, span })
    }

    /// 辞書・集合の表示と内包を解析する。
    fn parse_brace_display(&mut self, span: crate::ast::Span) -> Result<Expr, ParseError> {
        self.pop(TokenKind::LBrace)?;
        if self.accept(TokenKind::RBrace).is_some() {
            return Ok(Expr::DictLit {
                keys: Vec::new(),
                values: Vec::new(),
                span,
            });
        }
        let first = self.parse_expr()?;
        if self.accept(TokenKind::Colon).is_some() {
            let first_value = self.parse_expr()?;
            if self.check(TokenKind::KwFor) {
                let generators = self.parse_comprehension_clauses()?;
                self.pop(TokenKind::RBrace)?;
                return Ok(Expr::DictComp {
                    key: Box::new(first),
                    value: Box::new(first_value),
                    generators,
                    span,
                });
            }
            let mut keys = vec![first];
            let mut values = vec![first_value];
            while self.accept(TokenKind::Comma).is_some() {
                if self.check(TokenKind::RBrace) {
                    break;
                }
                keys.push(self.parse_expr()?);
                self.pop(TokenKind::Colon)?;
                values.push(self.parse_expr()?);
            }
            self.pop(TokenKind::RBrace)?;
            return Ok(Expr::DictLit { keys, values, span });
        }
        if self.check(TokenKind::KwFor) {
            let generators = self.parse_comprehension_clauses()?;
            self.pop(TokenKind::RBrace)?;
            return Ok(Expr::SetComp {
                elt: Box::new(first),
                generators,
                span,
            });
        }
        let mut items = vec![first];
        while self.accept(TokenKind::Comma).is_some() {
            if self.check(TokenKind::RBrace) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.pop(TokenKind::RBrace)?;
        Ok(Expr::SetLit { items, span })
    }

    /// `for x in it if g` の節列を解析する。複数段の for を許す。
    fn parse_comprehension_clauses(&mut self) -> Result<Vec<Comprehension>, ParseError> {
        let mut generators = Vec::new();
        while self.check(TokenKind::KwFor) {
            self.pop_any();
            let target = self.parse_target()?;
            self.pop(TokenKind::KwIn)?;
            let iter = self.parse_or()?;
            let mut ifs = Vec::new();
            while self.check(TokenKind::KwIf) {
                self.pop_any();
                ifs.push(self.parse_or()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }
}

/// 整数トークンを値と基数へ変換する。
fn parse_int_token(text: &str) -> Option<(i64, IntBase)> {
    if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(rest, 16).ok().map(|v| (v, IntBase::Hex));
    }
    if let Some(rest) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
        return i64::from_str_radix(rest, 8).ok().map(|v| (v, IntBase::Oct));
    }
    if let Some(rest) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        return i64::from_str_radix(rest, 2).ok().map(|v| (v, IntBase::Bin));
    }
    text.parse::<i64>().ok().map(|v| (v, IntBase::Dec))
}
