// パス: src/lexer.rs
// 役割: UTF-8 対応の字句解析器とトークン定義を提供する
// 意図: インデント構造を含む位置付きトークン列を構文解析へ渡す
// 関連ファイル: src/parser/mod.rs, src/errors.rs, tests/lexer_tokens.rs
//! 字句解析モジュール
//!
//! - 有意インデントを列幅スタックで追跡し `Indent` / `Dedent` を合成する。
//! - f-string は入れ子の字句文脈として解析し、補間式を内側トークンへ展開する。
//! - 数値は 10/16/8/2 進・桁区切り `_`・指数・虚数接尾辞 `j` を受理する。
//! - すべてのトークンに行・列・バイト位置を記録し、診断情報と連携させる。

use crate::errors::LexerError;

#[derive(Debug, Clone, PartialEq, Eq)]
/// 生成されたトークンとその位置情報を保持するレコード。
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub pos: usize,
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// 字句解析で識別されるトークンの分類。
pub enum TokenKind {
    EOF,
    // レイアウトトークン
    Newline,
    Indent,
    Dedent,
    // 記号・演算子トークン
    Plus,
    Minus,
    Star,
    DblStar,
    Slash,
    DblSlash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    Assign,
    /// 複合代入 (`+=` など)。value に演算子部分を保持する。
    AugAssign,
    LParen,
    RParen,
    LBrack,
    RBrack,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semi,
    Arrow,
    // リテラル分類
    Int,
    /// i64 に収まらない整数リテラル。value は桁区切りを除去した原文。
    BigInt,
    Float,
    Imag,
    Str,
    Bytes,
    FStringStart,
    FStringMiddle,
    InterpStart,
    InterpEnd,
    FStringEnd,
    // 識別子・キーワード分類
    Name,
    KwDef,
    KwClass,
    KwReturn,
    KwRaise,
    KwIf,
    KwElif,
    KwElse,
    KwWhile,
    KwFor,
    KwIn,
    KwTry,
    KwExcept,
    KwFinally,
    KwImport,
    KwFrom,
    KwAs,
    KwPass,
    KwBreak,
    KwContinue,
    KwAnd,
    KwOr,
    KwNot,
    KwIs,
    KwNone,
    KwTrue,
    KwFalse,
    KwLambda,
    KwGlobal,
    KwAsync,
    KwAwait,
    KwYield,
}

#[derive(Debug)]
/// 行頭オフセットを事前計算し、行・列情報を素早く算出するヘルパ。
struct LineMap {
    starts: Vec<usize>,
}

impl LineMap {
    /// 入力全体を 1 度だけ走査して行頭インデックスを収集する。
    fn new(src: &str) -> Self {
        let mut starts = vec![0];
        for (idx, ch) in src.char_indices() {
            if ch == '\n' {
                let next = idx + ch.len_utf8();
                if next <= src.len() {
                    starts.push(next);
                }
            }
        }
        Self { starts }
    }

    /// 指定バイト位置の行番号と桁位置を返す。
    fn locate(&self, src: &str, pos: usize) -> (usize, usize) {
        let idx = match self.starts.binary_search(&pos) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        let line = idx + 1;
        let start = self.starts[idx];
        let col = src[start..pos].chars().count() + 1;
        (line, col)
    }

    /// 指定行に対応するテキスト断片を返す（改行は除去する）。
    fn line_text<'a>(&self, src: &'a str, line: usize) -> &'a str {
        if line == 0 {
            return "";
        }
        let idx = line - 1;
        if idx >= self.starts.len() {
            return "";
        }
        let start = self.starts[idx];
        let end = self.starts.get(idx + 1).copied().unwrap_or(src.len());
        let slice = &src[start..end];
        slice.strip_suffix('\n').unwrap_or(slice)
    }
}

/// タブを 8 桁揃えとして展開した列幅を求める。
fn indent_width(indent: &str) -> usize {
    let mut width = 0;
    for ch in indent.chars() {
        if ch == '\t' {
            width = (width / 8 + 1) * 8;
        } else {
            width += 1;
        }
    }
    width
}

/// 10 進数字かどうかを判定するユーティリティ。
fn is_digit(c: char) -> bool {
    c.is_ascii_digit()
}
/// 16 進数字かどうかを判定するユーティリティ。
fn is_hexdigit(c: char) -> bool {
    c.is_ascii_hexdigit()
}
/// 8 進数字かどうかを判定するユーティリティ。
fn is_octdigit(c: char) -> bool {
    matches!(c, '0'..='7')
}
/// 2 進数字かどうかを判定するユーティリティ。
fn is_bindigit(c: char) -> bool {
    matches!(c, '0' | '1')
}
/// 識別子の先頭に使用可能な文字かどうかを判定する。
fn is_letter(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}
/// 識別子の後続として許容される文字か判定する。
fn is_ident_rest(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// インデントスタックの 1 段分。幅と原文字列の両方を保持する。
#[derive(Debug, Clone)]
struct IndentLevel {
    width: usize,
    text: String,
}

/// 文字列リテラルの接頭辞（r/b/f の組合せ）と、その合計バイト長。
#[derive(Debug, Clone, Copy, Default)]
struct StrPrefix {
    raw: bool,
    bytes: bool,
    fstring: bool,
    len: usize,
}

struct Lexer<'a> {
    src: &'a str,
    cursor: usize,
    len: usize,
    base: usize, // f-string 再帰時の絶対位置補正
    line_map: LineMap,
    tokens: Vec<Token>,
    indents: Vec<IndentLevel>,
    bracket_depth: usize,
    at_line_start: bool,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            cursor: 0,
            len: src.len(),
            base: 0,
            line_map: LineMap::new(src),
            tokens: Vec::new(),
            indents: vec![IndentLevel {
                width: 0,
                text: String::new(),
            }],
            bracket_depth: 0,
            at_line_start: true,
        }
    }

    /// f-string 補間式の部分文字列を解析する子レキサ。位置は親側で補正する。
    fn nested(src: &'a str) -> Self {
        Self {
            src,
            cursor: 0,
            len: src.len(),
            base: 0,
            line_map: LineMap::new(src),
            tokens: Vec::new(),
            indents: vec![IndentLevel {
                width: 0,
                text: String::new(),
            }],
            // 補間式内は常に括弧内と同じ扱いでレイアウトを無効化する
            bracket_depth: 1,
            at_line_start: false,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, LexerError> {
        while self.cursor < self.len {
            if self.at_line_start && self.bracket_depth == 0 {
                self.handle_line_start()?;
                if self.cursor >= self.len {
                    break;
                }
                continue;
            }
            if self.consume_trivia()? {
                continue;
            }
            if self.cursor >= self.len {
                break;
            }
            self.lex_token()?;
        }
        self.finish_layout();
        self.push_simple(TokenKind::EOF, "", self.cursor);
        Ok(self.tokens)
    }

    /// EOF で開いたままのブロックを閉じ、末尾の Newline を補う。
    fn finish_layout(&mut self) {
        // 括弧内（f-string 補間の子レキサを含む）ではレイアウトを合成しない
        if self.bracket_depth > 0 {
            return;
        }
        let end = self.cursor;
        if !self.at_line_start {
            self.push_simple(TokenKind::Newline, "", end);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push_simple(TokenKind::Dedent, "", end);
        }
    }

    /// 行頭のインデントを測り、Indent / Dedent を合成する。
    fn handle_line_start(&mut self) -> Result<(), LexerError> {
        let line_start = self.cursor;
        let mut indent = String::new();
        while let Some(ch) = self.peek_char() {
            if ch == ' ' || ch == '\t' {
                indent.push(ch);
                self.advance_char();
            } else {
                break;
            }
        }
        // 空行・コメント行はレイアウトへ影響しない
        match self.peek_char() {
            None => return Ok(()),
            Some('\n') => {
                self.advance_char();
                return Ok(());
            }
            Some('\r') => {
                self.advance_char();
                if self.peek_char() == Some('\n') {
                    self.advance_char();
                }
                return Ok(());
            }
            Some('#') => {
                self.consume_line_comment();
                return Ok(());
            }
            _ => {}
        }

        let width = indent_width(&indent);
        let (top_width, top_text) = {
            let top = self.indents.last().expect("インデントスタックは空にならない");
            (top.width, top.text.clone())
        };
        if width > top_width {
            // 既存レベルの延長でないインデントはタブ・空白の混在とみなす
            if !indent.starts_with(top_text.as_str()) {
                return Err(self.err(
                    "LEX020",
                    "IndentationError: タブと空白の混在が一貫していません",
                    line_start,
                ));
            }
            self.indents.push(IndentLevel {
                width,
                text: indent,
            });
            self.push_simple(TokenKind::Indent, "", line_start);
        } else if width < top_width {
            while self
                .indents
                .last()
                .map(|lvl| lvl.width > width)
                .unwrap_or(false)
            {
                self.indents.pop();
                self.push_simple(TokenKind::Dedent, "", line_start);
            }
            let (lvl_width, lvl_text) = {
                let lvl = self.indents.last().expect("ルートレベルは常に残る");
                (lvl.width, lvl.text.clone())
            };
            if lvl_width != width {
                return Err(self.err(
                    "LEX021",
                    "IndentationError: どの外側ブロックとも一致しないデデントです",
                    line_start,
                ));
            }
            if lvl_text != indent {
                return Err(self.err(
                    "LEX020",
                    "IndentationError: タブと空白の混在が一貫していません",
                    line_start,
                ));
            }
        } else if top_text != indent {
            return Err(self.err(
                "LEX020",
                "IndentationError: タブと空白の混在が一貫していません",
                line_start,
            ));
        }
        self.at_line_start = false;
        Ok(())
    }

    /// 空白・コメント・行継続を読み飛ばす。改行はトークンとして合成する。
    fn consume_trivia(&mut self) -> Result<bool, LexerError> {
        let mut advanced = false;
        loop {
            match self.peek_char() {
                Some(' ') | Some('\t') => {
                    self.advance_char();
                    advanced = true;
                }
                Some('\r') => {
                    self.advance_char();
                    advanced = true;
                }
                Some('#') => {
                    self.consume_line_comment();
                    advanced = true;
                }
                Some('\\') if self.char_at(self.cursor + 1) == Some('\n') => {
                    // 行継続: バックスラッシュと改行を読み飛ばす
                    self.advance_bytes(2);
                    advanced = true;
                }
                Some('\n') => {
                    let pos = self.cursor;
                    self.advance_char();
                    advanced = true;
                    if self.bracket_depth == 0 {
                        self.push_simple(TokenKind::Newline, "", pos);
                        self.at_line_start = true;
                        return Ok(true);
                    }
                }
                _ => break,
            }
        }
        Ok(advanced)
    }

    fn consume_line_comment(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch == '\n' {
                break;
            }
            self.advance_char();
        }
    }

    fn lex_token(&mut self) -> Result<(), LexerError> {
        let start = self.cursor;
        let ch = self
            .peek_char()
            .expect("lex_token は EOF では呼び出されない");
        if let Some(prefix) = self.string_prefix() {
            return self.lex_string_with_prefix(prefix);
        }
        if ch == '"' || ch == '\'' {
            return self.lex_string_with_prefix(StrPrefix::default());
        }
        if is_digit(ch) || (ch == '.' && self.char_at(start + 1).map(is_digit).unwrap_or(false)) {
            return self.lex_number();
        }
        if is_letter(ch) {
            return self.lex_identifier_or_keyword();
        }
        if self.try_operator(ch) {
            return Ok(());
        }
        Err(self.err("LEX090", format!("解釈できない文字です: {ch:?}"), start))
    }

    /// 3 → 2 → 1 文字の順で演算子を最長一致させる。
    fn try_operator(&mut self, _first: char) -> bool {
        const THREE: &[(&str, TokenKind)] = &[
            ("**=", TokenKind::AugAssign),
            ("//=", TokenKind::AugAssign),
            ("<<=", TokenKind::AugAssign),
            (">>=", TokenKind::AugAssign),
        ];
        const TWO: &[(&str, TokenKind)] = &[
            ("**", TokenKind::DblStar),
            ("//", TokenKind::DblSlash),
            ("<<", TokenKind::Shl),
            (">>", TokenKind::Shr),
            ("<=", TokenKind::Le),
            (">=", TokenKind::Ge),
            ("==", TokenKind::EqEq),
            ("!=", TokenKind::Ne),
            ("+=", TokenKind::AugAssign),
            ("-=", TokenKind::AugAssign),
            ("*=", TokenKind::AugAssign),
            ("/=", TokenKind::AugAssign),
            ("%=", TokenKind::AugAssign),
            ("&=", TokenKind::AugAssign),
            ("|=", TokenKind::AugAssign),
            ("^=", TokenKind::AugAssign),
            ("->", TokenKind::Arrow),
        ];
        const ONE: &[(&str, TokenKind)] = &[
            ("+", TokenKind::Plus),
            ("-", TokenKind::Minus),
            ("*", TokenKind::Star),
            ("/", TokenKind::Slash),
            ("%", TokenKind::Percent),
            ("&", TokenKind::Amp),
            ("|", TokenKind::Pipe),
            ("^", TokenKind::Caret),
            ("~", TokenKind::Tilde),
            ("<", TokenKind::Lt),
            (">", TokenKind::Gt),
            ("=", TokenKind::Assign),
            ("(", TokenKind::LParen),
            (")", TokenKind::RParen),
            ("[", TokenKind::LBrack),
            ("]", TokenKind::RBrack),
            ("{", TokenKind::LBrace),
            ("}", TokenKind::RBrace),
            (",", TokenKind::Comma),
            (":", TokenKind::Colon),
            (".", TokenKind::Dot),
            (";", TokenKind::Semi),
        ];
        for table in [THREE, TWO, ONE] {
            for (text, kind) in table {
                if self.src[self.cursor..].starts_with(text) {
                    let start = self.cursor;
                    self.advance_bytes(text.len());
                    match kind {
                        TokenKind::LParen | TokenKind::LBrack | TokenKind::LBrace => {
                            self.bracket_depth += 1;
                        }
                        TokenKind::RParen | TokenKind::RBrack | TokenKind::RBrace => {
                            self.bracket_depth = self.bracket_depth.saturating_sub(1);
                        }
                        _ => {}
                    }
                    // AugAssign は末尾の '=' を除いた演算子部分を value に残す
                    let value = if *kind == TokenKind::AugAssign {
                        &text[..text.len() - 1]
                    } else {
                        text
                    };
                    self.push_simple(kind.clone(), value, start);
                    return true;
                }
            }
        }
        false
    }

    /// 現在位置が文字列プレフィックス（r/b/f とその組合せ）かどうか調べる。
    fn string_prefix(&self) -> Option<StrPrefix> {
        let rest = &self.src[self.cursor..];
        let mut prefix = StrPrefix::default();
        let mut len = 0;
        for ch in rest.chars().take(3) {
            match ch {
                'r' | 'R' if !prefix.raw => prefix.raw = true,
                'b' | 'B' if !prefix.bytes => prefix.bytes = true,
                'f' | 'F' if !prefix.fstring => prefix.fstring = true,
                '"' | '\'' if len > 0 => {
                    prefix.len = len;
                    return Some(prefix);
                }
                _ => return None,
            }
            len += 1;
        }
        None
    }

    /// 文字列リテラル本体を解析する。f-string は入れ子文脈として展開する。
    fn lex_string_with_prefix(&mut self, prefix: StrPrefix) -> Result<(), LexerError> {
        let start = self.cursor;
        self.advance_bytes(prefix.len);
        let quote = self
            .peek_char()
            .ok_or_else(|| self.err("LEX002", "文字列リテラルが閉じていません", start))?;
        let triple = self.src[self.cursor..].starts_with(&quote.to_string().repeat(3));
        let quote_len = if triple { 3 } else { 1 };
        self.advance_bytes(quote_len);

        if prefix.fstring {
            return self.lex_fstring_body(start, quote, triple, prefix.raw);
        }

        let body_start = self.cursor;
        let body_end = self.scan_string_body(start, quote, triple, prefix.raw)?;
        let kind = if prefix.bytes {
            TokenKind::Bytes
        } else {
            TokenKind::Str
        };
        // value は本体のみ。デコードは parser 側のヘルパが担当する
        let mut token_value = String::new();
        if prefix.raw {
            token_value.push('r');
        }
        token_value.push(quote);
        token_value.push_str(&self.src[body_start..body_end]);
        self.push_with_value(kind, token_value, start);
        Ok(())
    }

    /// 終端クォートまで走査し、本体の終了バイト位置を返す。
    fn scan_string_body(
        &mut self,
        start: usize,
        quote: char,
        triple: bool,
        raw: bool,
    ) -> Result<usize, LexerError> {
        loop {
            let Some(ch) = self.peek_char() else {
                return Err(self.err("LEX002", "文字列リテラルが閉じていません", start));
            };
            if !raw && ch == '\\' {
                self.advance_bytes(1);
                if self.advance_char().is_none() {
                    return Err(self.err("LEX002", "文字列リテラルが閉じていません", start));
                }
                continue;
            }
            if ch == '\n' && !triple {
                return Err(self.err("LEX003", "文字列リテラル中で行が終わりました", start));
            }
            if ch == quote {
                if triple {
                    if self.src[self.cursor..].starts_with(&quote.to_string().repeat(3)) {
                        let end = self.cursor;
                        self.advance_bytes(3);
                        return Ok(end);
                    }
                } else {
                    let end = self.cursor;
                    self.advance_bytes(1);
                    return Ok(end);
                }
            }
            self.advance_char();
        }
    }

    /// f-string 本体: テキスト片と `{expr}` 補間を交互にトークン化する。
    fn lex_fstring_body(
        &mut self,
        start: usize,
        quote: char,
        triple: bool,
        raw: bool,
    ) -> Result<(), LexerError> {
        self.push_simple(TokenKind::FStringStart, "f", start);
        let mut text = String::new();
        let mut text_start = self.cursor;
        loop {
            let Some(ch) = self.peek_char() else {
                return Err(self.err("LEX004", "f-string が閉じていません", start));
            };
            if ch == quote {
                let close_ok = if triple {
                    self.src[self.cursor..].starts_with(&quote.to_string().repeat(3))
                } else {
                    true
                };
                if close_ok {
                    if !text.is_empty() {
                        self.push_with_value(
                            TokenKind::FStringMiddle,
                            std::mem::take(&mut text),
                            text_start,
                        );
                    }
                    let end = self.cursor;
                    self.advance_bytes(if triple { 3 } else { 1 });
                    self.push_simple(TokenKind::FStringEnd, "", end);
                    return Ok(());
                }
            }
            match ch {
                '{' if self.char_at(self.cursor + 1) == Some('{') => {
                    text.push('{');
                    self.advance_bytes(2);
                }
                '}' if self.char_at(self.cursor + 1) == Some('}') => {
                    text.push('}');
                    self.advance_bytes(2);
                }
                '{' => {
                    if !text.is_empty() {
                        self.push_with_value(
                            TokenKind::FStringMiddle,
                            std::mem::take(&mut text),
                            text_start,
                        );
                    }
                    self.lex_fstring_interp(start)?;
                    text_start = self.cursor;
                }
                '}' => {
                    return Err(self.err("LEX005", "f-string 中の対応しない '}' です", self.cursor));
                }
                '\\' if !raw => {
                    self.advance_bytes(1);
                    let Some(esc) = self.advance_char() else {
                        return Err(self.err("LEX004", "f-string が閉じていません", start));
                    };
                    text.push(decode_escape_char(esc));
                }
                '\n' if !triple => {
                    return Err(self.err("LEX003", "文字列リテラル中で行が終わりました", start));
                }
                _ => {
                    text.push(ch);
                    self.advance_char();
                }
            }
        }
    }

    /// `{` の内側の式を子レキサで解析し、Interp マーカで挟んで展開する。
    fn lex_fstring_interp(&mut self, fstring_start: usize) -> Result<(), LexerError> {
        let open_pos = self.cursor;
        self.advance_bytes(1); // '{'
        let expr_start = self.cursor;
        let mut depth = 0usize;
        let mut in_quote: Option<char> = None;
        loop {
            let Some(ch) = self.peek_char() else {
                return Err(self.err("LEX004", "f-string が閉じていません", fstring_start));
            };
            match ch {
                '\'' | '"' => match in_quote {
                    Some(q) if q == ch => in_quote = None,
                    None => in_quote = Some(ch),
                    _ => {}
                },
                '(' | '[' | '{' if in_quote.is_none() => depth += 1,
                ')' | ']' if in_quote.is_none() => depth = depth.saturating_sub(1),
                '}' if in_quote.is_none() => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                '\n' => {
                    return Err(self.err("LEX004", "f-string が閉じていません", fstring_start));
                }
                _ => {}
            }
            self.advance_char();
        }
        let expr_end = self.cursor;
        if expr_start == expr_end {
            return Err(self.err("LEX006", "f-string の補間式が空です", open_pos));
        }
        self.push_simple(TokenKind::InterpStart, "{", open_pos);
        let inner = Lexer::nested(&self.src[expr_start..expr_end]);
        let mut inner_tokens = inner.run().map_err(|mut e| {
            // 子レキサの相対位置を親の絶対位置へ付け替える
            e.0.pos = e.0.pos.map(|p| self.base + expr_start + p);
            let abs = e.0.pos.unwrap_or(expr_start) - self.base;
            let (line, col) = self.line_map.locate(self.src, abs.min(self.len));
            e.0.line = Some(line);
            e.0.col = Some(col);
            e
        })?;
        inner_tokens.retain(|t| t.kind != TokenKind::EOF);
        for mut t in inner_tokens {
            let local = expr_start + t.pos;
            let (line, col) = self.line_map.locate(self.src, local.min(self.len));
            t.pos = self.base + local;
            t.line = line;
            t.col = col;
            self.tokens.push(t);
        }
        let close_pos = self.cursor;
        self.advance_bytes(1); // '}'
        self.push_simple(TokenKind::InterpEnd, "}", close_pos);
        Ok(())
    }

    fn lex_number(&mut self) -> Result<(), LexerError> {
        let start = self.cursor;
        if self.starts_with("0x") || self.starts_with("0X") {
            return self.lex_prefixed_number(
                start,
                is_hexdigit,
                "LEX010",
                "16進数の桁がありません",
            );
        }
        if self.starts_with("0o") || self.starts_with("0O") {
            return self.lex_prefixed_number(start, is_octdigit, "LEX011", "8進数の桁がありません");
        }
        if self.starts_with("0b") || self.starts_with("0B") {
            return self.lex_prefixed_number(start, is_bindigit, "LEX012", "2進数の桁がありません");
        }

        self.consume_digits();
        let mut is_float = false;
        if self.peek_char() == Some('.')
            && self
                .char_at(self.cursor + 1)
                .map(is_digit)
                .unwrap_or(false)
        {
            is_float = true;
            self.advance_char(); // '.'
            self.consume_digits();
        }
        if let Some('e') | Some('E') = self.peek_char() {
            let mut idx = self.cursor + 1;
            if let Some(sign) = self.char_at(idx) {
                if sign == '+' || sign == '-' {
                    idx += 1;
                }
            }
            let mut count = 0;
            let mut scan = idx;
            while let Some(ch) = self.char_at(scan) {
                if is_digit(ch) || ch == '_' {
                    scan += ch.len_utf8();
                    count += 1;
                } else {
                    break;
                }
            }
            if count > 0 {
                is_float = true;
                self.cursor = scan;
            }
        }

        let end = self.cursor;
        let digits: String = self.src[start..end].chars().filter(|c| *c != '_').collect();
        if self.peek_char() == Some('j') || self.peek_char() == Some('J') {
            self.advance_char();
            self.push_with_value(TokenKind::Imag, digits, start);
            return Ok(());
        }
        if is_float {
            self.push_with_value(TokenKind::Float, digits, start);
        } else if digits.parse::<i64>().is_ok() {
            self.push_with_value(TokenKind::Int, digits, start);
        } else {
            // 固定幅を超えるリテラルは多倍長整数として扱う
            self.push_with_value(TokenKind::BigInt, digits, start);
        }
        Ok(())
    }

    /// 桁区切り `_` を許しつつ 10 進数字列を読み進める。
    fn consume_digits(&mut self) {
        while let Some(ch) = self.peek_char() {
            if is_digit(ch) || (ch == '_' && self.char_at(self.cursor + 1).map(is_digit) == Some(true))
            {
                self.advance_char();
            } else {
                break;
            }
        }
    }

    fn lex_prefixed_number<F>(
        &mut self,
        start: usize,
        predicate: F,
        code: &'static str,
        msg: &str,
    ) -> Result<(), LexerError>
    where
        F: Fn(char) -> bool,
    {
        self.advance_bytes(2);
        let mut count = 0;
        while let Some(ch) = self.peek_char() {
            if predicate(ch) || (ch == '_' && self.char_at(self.cursor + 1).map(&predicate) == Some(true))
            {
                self.advance_char();
                count += 1;
            } else {
                break;
            }
        }
        if count == 0 {
            return Err(self.err(code, msg, start));
        }
        let end = self.cursor;
        let digits: String = self.src[start..end].chars().filter(|c| *c != '_').collect();
        let radix = match digits.as_bytes().get(1) {
            Some(b'x') | Some(b'X') => 16,
            Some(b'o') | Some(b'O') => 8,
            _ => 2,
        };
        if i64::from_str_radix(&digits[2..], radix).is_ok() {
            self.push_with_value(TokenKind::Int, digits, start);
        } else {
            self.push_with_value(TokenKind::BigInt, digits, start);
        }
        Ok(())
    }

    fn lex_identifier_or_keyword(&mut self) -> Result<(), LexerError> {
        let start = self.cursor;
        self.advance_char();
        while let Some(ch) = self.peek_char() {
            if is_ident_rest(ch) {
                self.advance_char();
            } else {
                break;
            }
        }
        let slice = &self.src[start..self.cursor];
        let kind = match slice {
            "def" => TokenKind::KwDef,
            "class" => TokenKind::KwClass,
            "return" => TokenKind::KwReturn,
            "raise" => TokenKind::KwRaise,
            "if" => TokenKind::KwIf,
            "elif" => TokenKind::KwElif,
            "else" => TokenKind::KwElse,
            "while" => TokenKind::KwWhile,
            "for" => TokenKind::KwFor,
            "in" => TokenKind::KwIn,
            "try" => TokenKind::KwTry,
            "except" => TokenKind::KwExcept,
            "finally" => TokenKind::KwFinally,
            "import" => TokenKind::KwImport,
            "from" => TokenKind::KwFrom,
            "as" => TokenKind::KwAs,
            "pass" => TokenKind::KwPass,
            "break" => TokenKind::KwBreak,
            "continue" => TokenKind::KwContinue,
            "and" => TokenKind::KwAnd,
            "or" => TokenKind::KwOr,
            "not" => TokenKind::KwNot,
            "is" => TokenKind::KwIs,
            "None" => TokenKind::KwNone,
            "True" => TokenKind::KwTrue,
            "False" => TokenKind::KwFalse,
            "lambda" => TokenKind::KwLambda,
            "global" => TokenKind::KwGlobal,
            "async" => TokenKind::KwAsync,
            "await" => TokenKind::KwAwait,
            "yield" => TokenKind::KwYield,
            _ => TokenKind::Name,
        };
        self.push_simple(kind, slice, start);
        Ok(())
    }

    fn push_simple(&mut self, kind: TokenKind, value: &str, start: usize) {
        let (line, col) = self.line_map.locate(self.src, start.min(self.len));
        self.tokens.push(Token {
            kind,
            value: value.into(),
            pos: self.base + start,
            line,
            col,
        });
    }

    fn push_with_value(&mut self, kind: TokenKind, value: String, start: usize) {
        let (line, col) = self.line_map.locate(self.src, start.min(self.len));
        self.tokens.push(Token {
            kind,
            value,
            pos: self.base + start,
            line,
            col,
        });
    }

    fn peek_char(&self) -> Option<char> {
        if self.cursor >= self.len {
            None
        } else {
            self.src[self.cursor..].chars().next()
        }
    }

    fn char_at(&self, idx: usize) -> Option<char> {
        if idx >= self.len {
            None
        } else {
            self.src[idx..].chars().next()
        }
    }

    fn advance_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.advance_bytes(ch.len_utf8());
        Some(ch)
    }

    fn advance_bytes(&mut self, count: usize) {
        self.cursor = (self.cursor + count).min(self.len);
    }

    fn starts_with(&self, pattern: &str) -> bool {
        self.src[self.cursor..].starts_with(pattern)
    }

    fn err(&self, code: &'static str, message: impl Into<String>, pos: usize) -> LexerError {
        let (line, col) = self.line_map.locate(self.src, pos.min(self.len));
        LexerError::at_with_snippet(
            code,
            message,
            Some(self.base + pos),
            Some(line),
            Some(col),
            self.line_map.line_text(self.src, line).to_string(),
        )
    }
}

/// 1 文字エスケープをデコードする。未知のエスケープはそのまま残す。
pub(crate) fn decode_escape_char(esc: char) -> char {
    match esc {
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        '0' => '\0',
        _ => esc,
    }
}

/// ソース全体をトークン列へ変換する。
pub fn lex(src: &str) -> Result<Vec<Token>, LexerError> {
    Lexer::new(src).run()
}
