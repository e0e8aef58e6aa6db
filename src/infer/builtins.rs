// パス: src/infer/builtins.rs
// 役割: 組み込み関数と I/O プリミティブの宣言済みシグネチャを集約する
// 意図: 型環境と特性計算が同じプリミティブ一覧を共有できるようにする
// 関連ファイル: src/infer/flow.rs, src/infer/scope.rs, src/emit/zig.rs
//! 組み込み定義モジュール
//!
//! - 名前・シグネチャ・I/O 分類を一元管理し、推論と生成で重複列挙を防ぐ。
//! - `does_io` の判定はここにある閉じたリスト（ファイル・ソケット・タイマー・
//!   標準入出力）だけを根拠にする。

use once_cell::sync::Lazy;

use crate::typesys::{FnSig, Type};

/// I/O プリミティブの分類。閉じた列挙であることが特性計算の前提になる。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    None,
    File,
    Socket,
    Timer,
    Stdio,
}

/// 組み込み関数 1 件分の宣言。
#[derive(Clone, Debug)]
pub struct BuiltinDef {
    pub name: &'static str,
    pub sig: FnSig,
    pub io: IoKind,
    pub can_fail: bool,
    /// 戻り値がコルーチンで、await を要求する。
    pub awaitable: bool,
}

impl BuiltinDef {
    fn new(name: &'static str, params: Vec<Type>, ret: Type) -> Self {
        Self {
            name,
            sig: FnSig { params, ret },
            io: IoKind::None,
            can_fail: false,
            awaitable: false,
        }
    }

    fn io(mut self, kind: IoKind) -> Self {
        self.io = kind;
        self
    }

    fn fallible(mut self) -> Self {
        self.can_fail = true;
        self
    }

    fn awaitable(mut self) -> Self {
        self.awaitable = true;
        self
    }
}

/// 言語が標準で提供する組み込みの一覧。
pub static BUILTINS: Lazy<Vec<BuiltinDef>> = Lazy::new(|| {
    vec![
        BuiltinDef::new("print", vec![Type::Any], Type::NoneT).io(IoKind::Stdio),
        BuiltinDef::new("input", vec![], Type::Str).io(IoKind::Stdio),
        BuiltinDef::new("open", vec![Type::Str, Type::Str], Type::Any)
            .io(IoKind::File)
            .fallible(),
        BuiltinDef::new("len", vec![Type::Any], Type::Int),
        BuiltinDef::new("range", vec![Type::Int, Type::Int, Type::Int], Type::List(Box::new(Type::Int))),
        BuiltinDef::new("abs", vec![Type::Any], Type::Any),
        BuiltinDef::new("min", vec![Type::Any, Type::Any], Type::Any),
        BuiltinDef::new("max", vec![Type::Any, Type::Any], Type::Any),
        BuiltinDef::new("sum", vec![Type::Any], Type::Any),
        BuiltinDef::new("str", vec![Type::Any], Type::Str),
        BuiltinDef::new("repr", vec![Type::Any], Type::Str),
        BuiltinDef::new("int", vec![Type::Any], Type::Int).fallible(),
        BuiltinDef::new("float", vec![Type::Any], Type::Float).fallible(),
        BuiltinDef::new("bool", vec![Type::Any], Type::Bool),
        BuiltinDef::new("isinstance", vec![Type::Any, Type::Any], Type::Bool),
        BuiltinDef::new("sorted", vec![Type::Any], Type::List(Box::new(Type::Any))),
        BuiltinDef::new("enumerate", vec![Type::Any], Type::List(Box::new(Type::Tuple(vec![Type::Int, Type::Any])))),
        BuiltinDef::new("zip", vec![Type::Any, Type::Any], Type::List(Box::new(Type::Tuple(vec![Type::Any, Type::Any])))),
        // 動的属性 API。使用を観測したクラスは open レイアウトへ退化する
        BuiltinDef::new("getattr", vec![Type::Any, Type::Str], Type::Any).fallible(),
        BuiltinDef::new("setattr", vec![Type::Any, Type::Str, Type::Any], Type::NoneT),
        BuiltinDef::new("hasattr", vec![Type::Any, Type::Str], Type::Bool),
        // 非同期プリミティブ。sleep はタイマー I/O、run はイベントループ起動
        BuiltinDef::new("sleep", vec![Type::Float], Type::Coro(Box::new(Type::NoneT)))
            .io(IoKind::Timer)
            .awaitable(),
        BuiltinDef::new("run", vec![Type::Coro(Box::new(Type::Any))], Type::Any),
        BuiltinDef::new(
            "gather",
            vec![Type::Any],
            Type::Coro(Box::new(Type::List(Box::new(Type::Any)))),
        )
        .awaitable(),
        BuiltinDef::new("spawn", vec![Type::Coro(Box::new(Type::Any))], Type::Any),
        // ソケットプリミティブ（閉じた I/O リストの一部）
        BuiltinDef::new("connect", vec![Type::Str, Type::Int], Type::Any)
            .io(IoKind::Socket)
            .fallible(),
        BuiltinDef::new("listen", vec![Type::Str, Type::Int], Type::Any)
            .io(IoKind::Socket)
            .fallible(),
    ]
});

/// 名前から組み込み定義を引く。
pub fn lookup(name: &str) -> Option<&'static BuiltinDef> {
    BUILTINS.iter().find(|b| b.name == name)
}

/// 名前が I/O プリミティブかどうか。
pub fn is_io_primitive(name: &str) -> bool {
    lookup(name).map(|b| b.io != IoKind::None).unwrap_or(false)
}

/// 変更系のコンテナメソッド名。レシーバの変異として扱う。
pub const MUTATING_METHODS: &[&str] = &[
    "append", "extend", "insert", "remove", "pop", "clear", "sort", "reverse", "add", "update",
    "discard", "setdefault",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// I/O プリミティブの閉じたリストが期待通りに判定されることを確認する。
    fn io_primitive_list_is_closed() {
        assert!(is_io_primitive("print"));
        assert!(is_io_primitive("sleep"));
        assert!(is_io_primitive("open"));
        assert!(!is_io_primitive("len"));
        assert!(!is_io_primitive("run"));
    }
}
