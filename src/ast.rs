// パス: src/ast.rs
// 役割: ソース言語の抽象構文木と位置情報を定義する
// 意図: 構文解析結果を型推論・コード生成で共用できる中立的な表現に落とし込む
// 関連ファイル: src/parser/mod.rs, src/infer/mod.rs, src/emit/zig.rs
//! 抽象構文木（AST）
//!
//! 設計ノート:
//! - すべてのノードが `Span` を保持する。Span は入力の有効なバイト位置を指す。
//! - 連鎖比較や複合代入などの糖衣は parser 側で正規化済みの形を保持する。
//! - `Display` は unparse を実装し、parse ∘ unparse ∘ parse が
//!   （Span を除き）恒等になることをテストで保証する。

use std::fmt::{self, Write as _};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// ノードの原文上の位置。バイトオフセットと 1 始まりの行・列を保持する。
pub struct Span {
    pub pos: usize,
    pub line: usize,
    pub col: usize,
}

impl Span {
    /// 位置情報を指定して Span を生成する。
    pub fn new(pos: usize, line: usize, col: usize) -> Self {
        Self { pos, line, col }
    }
}

/// 1 つの入力ファイルに対応するモジュール。
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    pub name: String,
    pub body: Vec<Stmt>,
}

/// 関数仮引数。デフォルト値は省略可能。
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
    pub span: Span,
}

/// `except` 節 1 本分の情報。
#[derive(Clone, Debug, PartialEq)]
pub struct ExceptHandler {
    pub class_name: Option<String>,
    pub bind_name: Option<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// 内包表記の `for ... in ... if ...` 1 段分。
#[derive(Clone, Debug, PartialEq)]
pub struct Comprehension {
    pub target: Expr,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

// 文ノード
#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    FuncDef {
        name: String,
        params: Vec<Param>,
        body: Vec<Stmt>,
        is_async: bool,
        span: Span,
    },
    ClassDef {
        name: String,
        bases: Vec<String>,
        body: Vec<Stmt>,
        span: Span,
    },
    Assign {
        target: Expr,
        value: Expr,
        span: Span,
    },
    ExprStmt {
        value: Expr,
        span: Span,
    },
    Return {
        value: Option<Expr>,
        span: Span,
    },
    Raise {
        exc: Option<Expr>,
        cause: Option<Expr>,
        span: Span,
    },
    If {
        cond: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        span: Span,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finally: Vec<Stmt>,
        span: Span,
    },
    Import {
        module: String,
        alias: Option<String>,
        span: Span,
    },
    ImportFrom {
        module: String,
        names: Vec<(String, Option<String>)>,
        span: Span,
    },
    Global {
        names: Vec<String>,
        span: Span,
    },
    Pass {
        span: Span,
    },
    Break {
        span: Span,
    },
    Continue {
        span: Span,
    },
}

impl Stmt {
    /// 文の先頭位置を返す。
    pub fn span(&self) -> Span {
        match self {
            Stmt::FuncDef { span, .. }
            | Stmt::ClassDef { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::ExprStmt { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Raise { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Try { span, .. }
            | Stmt::Import { span, .. }
            | Stmt::ImportFrom { span, .. }
            | Stmt::Global { span, .. }
            | Stmt::Pass { span }
            | Stmt::Break { span }
            | Stmt::Continue { span } => *span,
        }
    }
}

/// 整数リテラルの基数。表示とオーバーフロー診断のために保持する。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntBase {
    Dec,
    Hex,
    Oct,
    Bin,
}

/// 二項演算子の種別。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOpKind {
    /// ソース上の表記を返す。
    pub fn as_str(self) -> &'static str {
        match self {
            BinOpKind::Add => "+",
            BinOpKind::Sub => "-",
            BinOpKind::Mul => "*",
            BinOpKind::Div => "/",
            BinOpKind::FloorDiv => "//",
            BinOpKind::Mod => "%",
            BinOpKind::Pow => "**",
            BinOpKind::BitAnd => "&",
            BinOpKind::BitOr => "|",
            BinOpKind::BitXor => "^",
            BinOpKind::Shl => "<<",
            BinOpKind::Shr => ">>",
        }
    }
}

/// 比較演算子の種別。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOpKind {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CmpOpKind {
    /// ソース上の表記を返す。
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOpKind::Eq => "==",
            CmpOpKind::Ne => "!=",
            CmpOpKind::Lt => "<",
            CmpOpKind::Le => "<=",
            CmpOpKind::Gt => ">",
            CmpOpKind::Ge => ">=",
            CmpOpKind::Is => "is",
            CmpOpKind::IsNot => "is not",
            CmpOpKind::In => "in",
            CmpOpKind::NotIn => "not in",
        }
    }
}

/// 単項演算子の種別。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOpKind {
    Neg,
    Pos,
    Not,
    Invert,
}

impl UnaryOpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOpKind::Neg => "-",
            UnaryOpKind::Pos => "+",
            UnaryOpKind::Not => "not ",
            UnaryOpKind::Invert => "~",
        }
    }
}

/// f-string の構成要素。地のテキストか補間式のどちらか。
#[derive(Clone, Debug, PartialEq)]
pub enum FStringPart {
    Text(String),
    Interp(Expr),
}

// 式ノード
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Name {
        name: String,
        span: Span,
    },
    IntLit {
        value: i64,
        base: IntBase,
        span: Span,
    },
    /// i64 に収まらないリテラル。多倍長整数型へ昇格する。
    BigIntLit {
        repr: String,
        span: Span,
    },
    FloatLit {
        value: f64,
        span: Span,
    },
    StrLit {
        value: String,
        span: Span,
    },
    BytesLit {
        value: Vec<u8>,
        span: Span,
    },
    FString {
        parts: Vec<FStringPart>,
        span: Span,
    },
    BoolLit {
        value: bool,
        span: Span,
    },
    NoneLit {
        span: Span,
    },
    ListLit {
        items: Vec<Expr>,
        span: Span,
    },
    TupleLit {
        items: Vec<Expr>,
        span: Span,
    },
    DictLit {
        keys: Vec<Expr>,
        values: Vec<Expr>,
        span: Span,
    },
    SetLit {
        items: Vec<Expr>,
        span: Span,
    },
    BinOp {
        op: BinOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Compare {
        op: CmpOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    BoolOp {
        is_and: bool,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    UnaryOp {
        op: UnaryOpKind,
        operand: Box<Expr>,
        span: Span,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },
    Attribute {
        obj: Box<Expr>,
        name: String,
        span: Span,
    },
    Subscript {
        obj: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
        span: Span,
    },
    Lambda {
        params: Vec<Param>,
        body: Box<Expr>,
        span: Span,
    },
    ListComp {
        elt: Box<Expr>,
        generators: Vec<Comprehension>,
        span: Span,
    },
    SetComp {
        elt: Box<Expr>,
        generators: Vec<Comprehension>,
        span: Span,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        generators: Vec<Comprehension>,
        span: Span,
    },
    IfExp {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
        span: Span,
    },
    Await {
        expr: Box<Expr>,
        span: Span,
    },
    Yield {
        expr: Option<Box<Expr>>,
        span: Span,
    },
}

impl Expr {
    /// 式の先頭位置を返す。
    pub fn span(&self) -> Span {
        match self {
            Expr::Name { span, .. }
            | Expr::IntLit { span, .. }
            | Expr::BigIntLit { span, .. }
            | Expr::FloatLit { span, .. }
            | Expr::StrLit { span, .. }
            | Expr::BytesLit { span, .. }
            | Expr::FString { span, .. }
            | Expr::BoolLit { span, .. }
            | Expr::NoneLit { span }
            | Expr::ListLit { span, .. }
            | Expr::TupleLit { span, .. }
            | Expr::DictLit { span, .. }
            | Expr::SetLit { span, .. }
            | Expr::BinOp { span, .. }
            | Expr::Compare { span, .. }
            | Expr::BoolOp { span, .. }
            | Expr::UnaryOp { span, .. }
            | Expr::Call { span, .. }
            | Expr::Attribute { span, .. }
            | Expr::Subscript { span, .. }
            | Expr::Slice { span, .. }
            | Expr::Lambda { span, .. }
            | Expr::ListComp { span, .. }
            | Expr::SetComp { span, .. }
            | Expr::DictComp { span, .. }
            | Expr::IfExp { span, .. }
            | Expr::Await { span, .. }
            | Expr::Yield { span, .. } => *span,
        }
    }
}

/// Span を無視した構造比較。parse ∘ unparse の往復テストで使う。
pub fn module_eq_ignore_spans(a: &Module, b: &Module) -> bool {
    // unparse は正規化済みテキストを出すため、再 unparse の一致が構造一致と同値になる
    a.name == b.name && format!("{a}") == format!("{b}")
}

// ---- unparse ----

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.body {
            write_stmt(f, stmt, 0)?;
        }
        Ok(())
    }
}

/// 文をインデント付きで書き出す。
fn write_stmt(f: &mut fmt::Formatter<'_>, stmt: &Stmt, indent: usize) -> fmt::Result {
    let pad = "    ".repeat(indent);
    match stmt {
        Stmt::FuncDef {
            name,
            params,
            body,
            is_async,
            ..
        } => {
            let kw = if *is_async { "async def" } else { "def" };
            writeln!(f, "{pad}{kw} {name}({}):", params_text(params))?;
            write_block(f, body, indent + 1)
        }
        Stmt::ClassDef {
            name, bases, body, ..
        } => {
            if bases.is_empty() {
                writeln!(f, "{pad}class {name}:")?;
            } else {
                writeln!(f, "{pad}class {name}({}):", bases.join(", "))?;
            }
            write_block(f, body, indent + 1)
        }
        Stmt::Assign { target, value, .. } => writeln!(f, "{pad}{target} = {value}"),
        Stmt::ExprStmt { value, .. } => writeln!(f, "{pad}{value}"),
        Stmt::Return { value, .. } => match value {
            Some(v) => writeln!(f, "{pad}return {v}"),
            None => writeln!(f, "{pad}return"),
        },
        Stmt::Raise { exc, cause, .. } => match (exc, cause) {
            (Some(e), Some(c)) => writeln!(f, "{pad}raise {e} from {c}"),
            (Some(e), None) => writeln!(f, "{pad}raise {e}"),
            _ => writeln!(f, "{pad}raise"),
        },
        Stmt::If {
            cond, body, orelse, ..
        } => {
            writeln!(f, "{pad}if {cond}:")?;
            write_block(f, body, indent + 1)?;
            if !orelse.is_empty() {
                writeln!(f, "{pad}else:")?;
                write_block(f, orelse, indent + 1)?;
            }
            Ok(())
        }
        Stmt::While { cond, body, .. } => {
            writeln!(f, "{pad}while {cond}:")?;
            write_block(f, body, indent + 1)
        }
        Stmt::For {
            target, iter, body, ..
        } => {
            writeln!(f, "{pad}for {target} in {iter}:")?;
            write_block(f, body, indent + 1)
        }
        Stmt::Try {
            body,
            handlers,
            orelse,
            finally,
            ..
        } => {
            writeln!(f, "{pad}try:")?;
            write_block(f, body, indent + 1)?;
            for h in handlers {
                match (&h.class_name, &h.bind_name) {
                    (Some(cls), Some(bind)) => writeln!(f, "{pad}except {cls} as {bind}:")?,
                    (Some(cls), None) => writeln!(f, "{pad}except {cls}:")?,
                    _ => writeln!(f, "{pad}except:")?,
                }
                write_block(f, &h.body, indent + 1)?;
            }
            if !orelse.is_empty() {
                writeln!(f, "{pad}else:")?;
                write_block(f, orelse, indent + 1)?;
            }
            if !finally.is_empty() {
                writeln!(f, "{pad}finally:")?;
                write_block(f, finally, indent + 1)?;
            }
            Ok(())
        }
        Stmt::Import { module, alias, .. } => match alias {
            Some(a) => writeln!(f, "{pad}import {module} as {a}"),
            None => writeln!(f, "{pad}import {module}"),
        },
        Stmt::ImportFrom { module, names, .. } => {
            let rendered: Vec<String> = names
                .iter()
                .map(|(n, a)| match a {
                    Some(a) => format!("{n} as {a}"),
                    None => n.clone(),
                })
                .collect();
            writeln!(f, "{pad}from {module} import {}", rendered.join(", "))
        }
        Stmt::Global { names, .. } => writeln!(f, "{pad}global {}", names.join(", ")),
        Stmt::Pass { .. } => writeln!(f, "{pad}pass"),
        Stmt::Break { .. } => writeln!(f, "{pad}break"),
        Stmt::Continue { .. } => writeln!(f, "{pad}continue"),
    }
}

/// ブロックを書き出す。空ブロックは `pass` で埋める。
fn write_block(f: &mut fmt::Formatter<'_>, body: &[Stmt], indent: usize) -> fmt::Result {
    if body.is_empty() {
        return writeln!(f, "{}pass", "    ".repeat(indent));
    }
    for stmt in body {
        write_stmt(f, stmt, indent)?;
    }
    Ok(())
}

/// 仮引数リストのテキストを構築する。
fn params_text(params: &[Param]) -> String {
    let mut out = String::new();
    for (idx, p) in params.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        out.push_str(&p.name);
        if let Some(d) = &p.default {
            let _ = write!(out, "={d}");
        }
    }
    out
}

/// 文字列リテラルをソース表現へエスケープする。
fn escape_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

impl fmt::Display for Expr {
    /// 括弧を保守的に補った正規形で unparse する。
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Name { name, .. } => write!(f, "{name}"),
            Expr::IntLit { value, .. } => write!(f, "{value}"),
            Expr::BigIntLit { repr, .. } => write!(f, "{repr}"),
            Expr::FloatLit { value, .. } => {
                if value.fract() == 0.0 && value.is_finite() {
                    write!(f, "{value:.1}")
                } else {
                    write!(f, "{value}")
                }
            }
            Expr::StrLit { value, .. } => write!(f, "\"{}\"", escape_str(value)),
            Expr::BytesLit { value, .. } => {
                write!(f, "b\"")?;
                for b in value {
                    if b.is_ascii_graphic() && *b != b'"' && *b != b'\\' {
                        write!(f, "{}", *b as char)?;
                    } else {
                        write!(f, "\\x{b:02x}")?;
                    }
                }
                write!(f, "\"")
            }
            Expr::FString { parts, .. } => {
                write!(f, "f\"")?;
                for part in parts {
                    match part {
                        FStringPart::Text(t) => write!(f, "{}", escape_str(t))?,
                        FStringPart::Interp(e) => write!(f, "{{{e}}}")?,
                    }
                }
                write!(f, "\"")
            }
            Expr::BoolLit { value, .. } => {
                write!(f, "{}", if *value { "True" } else { "False" })
            }
            Expr::NoneLit { .. } => write!(f, "None"),
            Expr::ListLit { items, .. } => write!(f, "[{}]", join_exprs(items)),
            Expr::TupleLit { items, .. } => {
                if items.len() == 1 {
                    write!(f, "({},)", items[0])
                } else {
                    write!(f, "({})", join_exprs(items))
                }
            }
            Expr::DictLit { keys, values, .. } => {
                write!(f, "{{")?;
                for (idx, (k, v)) in keys.iter().zip(values).enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Expr::SetLit { items, .. } => write!(f, "{{{}}}", join_exprs(items)),
            Expr::BinOp {
                op, left, right, ..
            } => write!(f, "({} {} {})", left, op.as_str(), right),
            Expr::Compare {
                op, left, right, ..
            } => write!(f, "({} {} {})", left, op.as_str(), right),
            Expr::BoolOp {
                is_and,
                left,
                right,
                ..
            } => {
                let kw = if *is_and { "and" } else { "or" };
                write!(f, "({left} {kw} {right})")
            }
            Expr::UnaryOp { op, operand, .. } => write!(f, "({}{})", op.as_str(), operand),
            Expr::Call { func, args, .. } => write!(f, "{}({})", func, join_exprs(args)),
            Expr::Attribute { obj, name, .. } => write!(f, "{obj}.{name}"),
            Expr::Subscript { obj, index, .. } => write!(f, "{obj}[{index}]"),
            Expr::Slice {
                lower, upper, step, ..
            } => {
                if let Some(l) = lower {
                    write!(f, "{l}")?;
                }
                write!(f, ":")?;
                if let Some(u) = upper {
                    write!(f, "{u}")?;
                }
                if let Some(s) = step {
                    write!(f, ":{s}")?;
                }
                Ok(())
            }
            Expr::Lambda { params, body, .. } => {
                write!(f, "(lambda {}: {})", params_text(params), body)
            }
            Expr::ListComp {
                elt, generators, ..
            } => {
                write!(f, "[{elt}")?;
                write_generators(f, generators)?;
                write!(f, "]")
            }
            Expr::SetComp {
                elt, generators, ..
            } => {
                write!(f, "{{{elt}")?;
                write_generators(f, generators)?;
                write!(f, "}}")
            }
            Expr::DictComp {
                key,
                value,
                generators,
                ..
            } => {
                write!(f, "{{{key}: {value}")?;
                write_generators(f, generators)?;
                write!(f, "}}")
            }
            Expr::IfExp {
                cond,
                then_branch,
                else_branch,
                ..
            } => write!(f, "({then_branch} if {cond} else {else_branch})"),
            Expr::Await { expr, .. } => write!(f, "(await {expr})"),
            Expr::Yield { expr, .. } => match expr {
                Some(e) => write!(f, "(yield {e})"),
                None => write!(f, "(yield)"),
            },
        }
    }
}

/// 式リストをカンマ区切りで連結する。
fn join_exprs(items: &[Expr]) -> String {
    let parts: Vec<String> = items.iter().map(|e| format!("{e}")).collect();
    parts.join(", ")
}

/// 内包表記のジェネレータ列を書き出す。
fn write_generators(f: &mut fmt::Formatter<'_>, generators: &[Comprehension]) -> fmt::Result {
    for g in generators {
        write!(f, " for {} in {}", g.target, g.iter)?;
        for cond in &g.ifs {
            write!(f, " if {cond}")?;
        }
    }
    Ok(())
}
