// パス: src/errors.rs
// 役割: コンパイラ診断の共通エラー型とメッセージ整形ロジックを集約する
// 意図: 字句・構文・型検査を横断して一貫した診断を提供する
// 関連ファイル: src/lexer.rs, src/parser/mod.rs, src/infer/mod.rs
//! エラー表現モジュール
//!
//! - 共有フォーマットの `ErrorInfo` を中心にメタデータを保持する。
//! - 各レイヤー向けの軽量な新種エラー型を薄いラッパーとして公開する。
//! - `file:line:col` 形式と caret 付きスニペットの整形を一箇所で実装する。

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone)]
/// エラーコード・本文・位置メタデータを保持する基礎構造体。
pub struct ErrorInfo {
    pub code: &'static str,
    pub msg: String,
    pub file: Option<String>,    // 診断対象のソースファイル名
    pub pos: Option<usize>,      // 原文バイトオフセット
    pub line: Option<usize>,     // 1 始まりの行番号
    pub col: Option<usize>,      // 1 始まりの列番号
    pub snippet: Option<String>, // 問題行の抜粋文字列
}

/// `ErrorInfo` 生成を簡潔にするためのファクトリ群。
impl ErrorInfo {
    /// コードと本文だけでエラー情報を初期化する。
    pub fn new(code: &'static str, msg: impl Into<String>, pos: Option<usize>) -> Self {
        Self {
            code,
            msg: msg.into(),
            file: None,
            pos,
            line: None,
            col: None,
            snippet: None,
        }
    }

    /// 行・列などの位置情報を付与してエラー情報を構築する。
    pub fn at(
        code: &'static str,
        msg: impl Into<String>,
        pos: Option<usize>,
        line: Option<usize>,
        col: Option<usize>,
    ) -> Self {
        Self {
            code,
            msg: msg.into(),
            file: None,
            pos,
            line,
            col,
            snippet: None,
        }
    }

    /// エラー周辺の抜粋を追加してチェーン可能にする。
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    /// 診断対象のファイル名を追加してチェーン可能にする。
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// 既にファイル名が設定されていなければ指定値で埋める。
    pub fn fill_file_if_absent(&mut self, file: &str) {
        if self.file.is_none() {
            self.file = Some(file.to_string());
        }
    }
}

/// `ErrorInfo` の整形ルールを `Display` 経由で提供する。
impl Display for ErrorInfo {
    /// `file:line:col: [CODE] message` の形式で文字列化する。
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // 1 行目: 位置情報の有無で出力を切り替える
        if let Some(file) = &self.file {
            match (self.line, self.col) {
                (Some(l), Some(c)) => write!(f, "{file}:{l}:{c}: ")?,
                (Some(l), None) => write!(f, "{file}:{l}: ")?,
                _ => write!(f, "{file}: ")?,
            }
        } else if let (Some(l), Some(c)) = (self.line, self.col) {
            write!(f, "{l}:{c}: ")?;
        }
        write!(f, "[{}] {}", self.code, self.msg)?;
        // 2 行目以降: caret 付きスニペットを描画する
        if let (Some(s), Some(c)) = (&self.snippet, self.col) {
            let caret = if c > 1 {
                " ".repeat(c - 1) + "^"
            } else {
                "^".to_string()
            };
            write!(f, "\n{}\n{}", s, caret)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// 字句解析で報告されるエラー型。
pub struct LexerError(pub Box<ErrorInfo>);

/// `LexerError` を生成するためのラッパー関数群。
impl LexerError {
    /// コードと位置を指定して字句解析エラーを作成する。
    pub fn new(code: &'static str, msg: impl Into<String>, pos: Option<usize>) -> Self {
        Self(Box::new(ErrorInfo::new(code, msg, pos)))
    }

    /// 行・列を含めた字句解析エラーを作成する。
    pub fn at(
        code: &'static str,
        msg: impl Into<String>,
        pos: Option<usize>,
        line: Option<usize>,
        col: Option<usize>,
    ) -> Self {
        Self(Box::new(ErrorInfo::at(code, msg, pos, line, col)))
    }

    /// スニペット付きの字句解析エラーを作成する。
    pub fn at_with_snippet(
        code: &'static str,
        msg: impl Into<String>,
        pos: Option<usize>,
        line: Option<usize>,
        col: Option<usize>,
        snippet: impl Into<String>,
    ) -> Self {
        Self(Box::new(
            ErrorInfo::at(code, msg, pos, line, col).with_snippet(snippet),
        ))
    }
}

#[derive(Debug, Clone)]
/// 構文解析で用いるエラー型。
pub struct ParseError(pub Box<ErrorInfo>);

/// `ParseError` を構築するヘルパーメソッド集。
impl ParseError {
    /// コードと本文だけで構文解析エラーを作成する。
    pub fn new(code: &'static str, msg: impl Into<String>, pos: Option<usize>) -> Self {
        Self(Box::new(ErrorInfo::new(code, msg, pos)))
    }

    /// 位置情報付きの構文解析エラーを作成する。
    pub fn at(
        code: &'static str,
        msg: impl Into<String>,
        pos: Option<usize>,
        line: Option<usize>,
        col: Option<usize>,
    ) -> Self {
        Self(Box::new(ErrorInfo::at(code, msg, pos, line, col)))
    }
}

#[derive(Debug, Clone)]
/// 型推論や型検査で利用するエラー型。
pub struct TypeError(pub Box<ErrorInfo>);

/// `TypeError` 向けの生成ショートカット。
impl TypeError {
    /// コードのみを指定して型エラーを作成する。
    pub fn new(code: &'static str, msg: impl Into<String>, pos: Option<usize>) -> Self {
        Self(Box::new(ErrorInfo::new(code, msg, pos)))
    }

    /// 位置情報付きの型エラーを作成する。
    pub fn at(
        code: &'static str,
        msg: impl Into<String>,
        pos: Option<usize>,
        line: Option<usize>,
        col: Option<usize>,
    ) -> Self {
        Self(Box::new(ErrorInfo::at(code, msg, pos, line, col)))
    }

    /// 衝突した 2 つの型を本文へ埋め込んだ型エラーを作成する。
    pub fn conflict(
        code: &'static str,
        context: &str,
        expected: impl Display,
        actual: impl Display,
        pos: Option<usize>,
        line: Option<usize>,
        col: Option<usize>,
    ) -> Self {
        Self(Box::new(ErrorInfo::at(
            code,
            format!("{context}: 型 {expected} と型 {actual} が両立しません"),
            pos,
            line,
            col,
        )))
    }
}

/// `Display` 実装を `ErrorInfo` へ委譲する。
impl Display for LexerError {
    /// 内部の `ErrorInfo` をそのまま整形する。
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
impl StdError for LexerError {}

/// `ParseError` の表示実装を `ErrorInfo` に委譲する。
impl Display for ParseError {
    /// `ErrorInfo` をそのまま書式化する。
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
impl StdError for ParseError {}

/// `TypeError` の表示実装を `ErrorInfo` に委譲する。
impl Display for TypeError {
    /// `ErrorInfo` をそのまま書式化する。
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
impl StdError for TypeError {}

#[derive(Debug, Clone)]
/// 単一ファイルのコンパイルを中断させる診断の集約型。
pub enum Diagnostic {
    Lex(LexerError),
    Parse(ParseError),
    Type(TypeError),
}

impl Diagnostic {
    /// 内部の `ErrorInfo` へ可変参照でアクセスする。
    pub fn info_mut(&mut self) -> &mut ErrorInfo {
        match self {
            Diagnostic::Lex(e) => &mut e.0,
            Diagnostic::Parse(e) => &mut e.0,
            Diagnostic::Type(e) => &mut e.0,
        }
    }

    /// 診断対象のファイル名を未設定の場合のみ補完する。
    pub fn with_source_file(mut self, file: &str) -> Self {
        self.info_mut().fill_file_if_absent(file);
        self
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Lex(e) => Display::fmt(e, f),
            Diagnostic::Parse(e) => Display::fmt(e, f),
            Diagnostic::Type(e) => Display::fmt(e, f),
        }
    }
}
impl StdError for Diagnostic {}

impl From<LexerError> for Diagnostic {
    fn from(e: LexerError) -> Self {
        Diagnostic::Lex(e)
    }
}
impl From<ParseError> for Diagnostic {
    fn from(e: ParseError) -> Self {
        Diagnostic::Parse(e)
    }
}
impl From<TypeError> for Diagnostic {
    fn from(e: TypeError) -> Self {
        Diagnostic::Type(e)
    }
}
