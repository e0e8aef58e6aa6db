// パス: src/typesys.rs
// 役割: 型束縛格子・クラスレイアウトなど型システムの基盤を提供する
// 意図: 型推論とコード生成を支える join / meet と表示を一箇所に集約する
// 関連ファイル: src/infer/mod.rs, src/emit/zig.rs, tests/infer_types.rs
//! 型システム基盤モジュール
//!
//! - `Unknown < 具象型の集合 < Any` の有界格子を定義する。
//! - 制御フロー合流では join、`isinstance` による絞り込みでは meet を使う。
//! - クラスレイアウトは定義時に基底をフラット化し、動的変更で open へ退化する。

use std::collections::BTreeMap;
use std::fmt;

/// クラスレイアウト表内の添字でクラスを識別する。
pub type ClassId = usize;

/// Union が保持できる具象型の上限。超過時は `Any` へ拡大する。
pub const MAX_UNION_WIDTH: usize = 4;

/// join / meet の再帰深さ予算。型コンテナの入れ子がこれを超えると `Any` に落とす。
pub const JOIN_DEPTH_BUDGET: usize = 16;

#[derive(Clone, Debug, PartialEq)]
/// 関数値のシグネチャ。`Callable` 型の中身として保持する。
pub struct FnSig {
    pub params: Vec<Type>,
    pub ret: Type,
}

#[derive(Clone, Debug, PartialEq)]
/// 推論で扱う型項。`Unknown` は情報なし、`Any` は格子の頂点。
pub enum Type {
    Unknown,
    Int,
    BigInt,
    Float,
    Bool,
    Str,
    Bytes,
    NoneT,
    List(Box<Type>),
    Tuple(Vec<Type>),
    Dict(Box<Type>, Box<Type>),
    Set(Box<Type>),
    Object(ClassId),
    Callable(Box<FnSig>),
    Coro(Box<Type>),
    /// ジェネレータ関数の戻り値。要素型を保持する。
    Generator(Box<Type>),
    Union(Vec<Type>),
    Any,
}

impl Type {
    /// 具象型（Unknown でも Any でもない）かどうか。
    pub fn is_concrete(&self) -> bool {
        match self {
            Type::Unknown | Type::Any => false,
            Type::Union(items) => items.iter().all(Type::is_concrete),
            Type::List(t) | Type::Set(t) | Type::Coro(t) | Type::Generator(t) => t.is_concrete(),
            Type::Tuple(items) => items.iter().all(Type::is_concrete),
            Type::Dict(k, v) => k.is_concrete() && v.is_concrete(),
            Type::Callable(sig) => {
                sig.params.iter().all(Type::is_concrete) && sig.ret.is_concrete()
            }
            _ => true,
        }
    }

    /// 数値型（機械語レジスタに収まる種類）かどうか。
    pub fn is_register_sized(&self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Bool | Type::NoneT)
    }

    /// Union の構成要素として比較可能な整列キーを返す。
    fn sort_key(&self) -> String {
        format!("{self}")
    }
}

/// 2 つの型の join（最小上界）を計算する。制御フロー合流で使う。
pub fn join(a: &Type, b: &Type) -> Type {
    join_depth(a, b, 0)
}

fn join_depth(a: &Type, b: &Type, depth: usize) -> Type {
    if depth > JOIN_DEPTH_BUDGET {
        return Type::Any;
    }
    match (a, b) {
        _ if a == b => a.clone(),
        (Type::Unknown, other) | (other, Type::Unknown) => other.clone(),
        (Type::Any, _) | (_, Type::Any) => Type::Any,
        (Type::List(x), Type::List(y)) => Type::List(Box::new(join_depth(x, y, depth + 1))),
        (Type::Set(x), Type::Set(y)) => Type::Set(Box::new(join_depth(x, y, depth + 1))),
        (Type::Coro(x), Type::Coro(y)) => Type::Coro(Box::new(join_depth(x, y, depth + 1))),
        (Type::Generator(x), Type::Generator(y)) => {
            Type::Generator(Box::new(join_depth(x, y, depth + 1)))
        }
        (Type::Dict(xk, xv), Type::Dict(yk, yv)) => Type::Dict(
            Box::new(join_depth(xk, yk, depth + 1)),
            Box::new(join_depth(xv, yv, depth + 1)),
        ),
        (Type::Tuple(xs), Type::Tuple(ys)) if xs.len() == ys.len() => Type::Tuple(
            xs.iter()
                .zip(ys)
                .map(|(x, y)| join_depth(x, y, depth + 1))
                .collect(),
        ),
        // 整数リテラルの昇格: Int と BigInt の合流は BigInt
        (Type::Int, Type::BigInt) | (Type::BigInt, Type::Int) => Type::BigInt,
        _ => union_of(a, b),
    }
}

/// 2 つの型から正規化済み Union を構築する。幅予算を超えると `Any`。
pub fn union_of(a: &Type, b: &Type) -> Type {
    let mut items: Vec<Type> = Vec::new();
    let mut push = |t: &Type| match t {
        Type::Union(inner) => {
            for i in inner {
                if !items.contains(i) {
                    items.push(i.clone());
                }
            }
        }
        other => {
            if !items.contains(other) {
                items.push(other.clone());
            }
        }
    };
    push(a);
    push(b);
    if items.iter().any(|t| matches!(t, Type::Any)) || items.len() > MAX_UNION_WIDTH {
        return Type::Any;
    }
    if items.len() == 1 {
        return items.pop().expect("1 要素は直前に確認済み");
    }
    items.sort_by_key(Type::sort_key);
    Type::Union(items)
}

/// `isinstance` の真側で使う meet（`narrowed ∩ current`）。
pub fn narrow_to(current: &Type, target: &Type) -> Type {
    match current {
        // 情報が無い場合は検査対象の型そのものに絞る
        Type::Unknown | Type::Any => target.clone(),
        Type::Union(items) => {
            let kept: Vec<Type> = items
                .iter()
                .filter(|t| type_matches(t, target))
                .cloned()
                .collect();
            match kept.len() {
                0 => target.clone(),
                1 => kept.into_iter().next().expect("1 要素は直前に確認済み"),
                _ => Type::Union(kept),
            }
        }
        t if type_matches(t, target) => t.clone(),
        _ => target.clone(),
    }
}

/// `isinstance` の偽側で使う差集合（`current \ target`）。
pub fn narrow_away(current: &Type, target: &Type) -> Type {
    match current {
        Type::Union(items) => {
            let kept: Vec<Type> = items
                .iter()
                .filter(|t| !type_matches(t, target))
                .cloned()
                .collect();
            match kept.len() {
                0 => current.clone(),
                1 => kept.into_iter().next().expect("1 要素は直前に確認済み"),
                _ => Type::Union(kept),
            }
        }
        // Union 以外からは差し引ける情報が無い
        _ => current.clone(),
    }
}

/// 型 `t` が検査対象 `target` の種に属するかどうかを判定する。
fn type_matches(t: &Type, target: &Type) -> bool {
    match (t, target) {
        (Type::List(_), Type::List(_)) => true,
        (Type::Dict(_, _), Type::Dict(_, _)) => true,
        (Type::Set(_), Type::Set(_)) => true,
        (Type::Tuple(_), Type::Tuple(_)) => true,
        (Type::Object(a), Type::Object(b)) => a == b,
        // Bool は Int の部分型として扱う（isinstance(x, int) が True になるため）
        (Type::Bool, Type::Int) => true,
        (Type::BigInt, Type::Int) => true,
        _ => t == target,
    }
}

impl fmt::Display for Type {
    /// 診断メッセージ向けのソース言語風表記。
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unknown => write!(f, "<unknown>"),
            Type::Int => write!(f, "int"),
            Type::BigInt => write!(f, "bigint"),
            Type::Float => write!(f, "float"),
            Type::Bool => write!(f, "bool"),
            Type::Str => write!(f, "str"),
            Type::Bytes => write!(f, "bytes"),
            Type::NoneT => write!(f, "None"),
            Type::List(t) => write!(f, "list[{t}]"),
            Type::Tuple(items) => {
                write!(f, "tuple[")?;
                for (idx, t) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, "]")
            }
            Type::Dict(k, v) => write!(f, "dict[{k}, {v}]"),
            Type::Set(t) => write!(f, "set[{t}]"),
            Type::Object(id) => write!(f, "object<{id}>"),
            Type::Callable(sig) => {
                write!(f, "callable[(")?;
                for (idx, t) in sig.params.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, "), {}]", sig.ret)
            }
            Type::Coro(t) => write!(f, "coro[{t}]"),
            Type::Generator(t) => write!(f, "generator[{t}]"),
            Type::Union(items) => {
                for (idx, t) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{t}")?;
                }
                Ok(())
            }
            Type::Any => write!(f, "Any"),
        }
    }
}

/// 組み込み型名から型項を引く。`isinstance` の第 2 引数で使う。
pub fn builtin_type_from_name(name: &str) -> Option<Type> {
    match name {
        "int" => Some(Type::Int),
        "float" => Some(Type::Float),
        "bool" => Some(Type::Bool),
        "str" => Some(Type::Str),
        "bytes" => Some(Type::Bytes),
        "list" => Some(Type::List(Box::new(Type::Any))),
        "tuple" => Some(Type::Tuple(vec![])),
        "dict" => Some(Type::Dict(Box::new(Type::Any), Box::new(Type::Any))),
        "set" => Some(Type::Set(Box::new(Type::Any))),
        _ => None,
    }
}

// ---- クラスレイアウト ----

#[derive(Clone, Debug, PartialEq)]
/// 属性 1 件分のレイアウト情報。オフセットは定義順で確定する。
pub struct AttrSlot {
    pub name: String,
    pub ty: Type,
    pub offset: usize,
}

#[derive(Clone, Debug, PartialEq)]
/// クラス 1 つ分のフラット化済みレイアウト。
pub struct ClassLayout {
    pub name: String,
    pub base: Option<ClassId>,
    pub attrs: Vec<AttrSlot>,
    /// メソッド名 → 実装関数キー。解決順（派生優先）でフラット化済み。
    pub methods: BTreeMap<String, String>,
    /// 動的属性 API が観測されたクラスは open（ボックス表現）になる。
    pub open: bool,
}

impl ClassLayout {
    /// 属性名からスロットを引く。
    pub fn attr(&self, name: &str) -> Option<&AttrSlot> {
        self.attrs.iter().find(|a| a.name == name)
    }
}

#[derive(Clone, Debug, Default)]
/// プログラム全体のクラスレイアウト表。
pub struct ClassTable {
    layouts: Vec<ClassLayout>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// クラスを定義し、基底のレイアウトをフラット化して新しい ID を返す。
    /// 継承は新しいレイアウトを生成する。実行時の探索チェーンは作らない。
    pub fn define(&mut self, name: &str, base: Option<ClassId>) -> ClassId {
        let (attrs, methods) = match base {
            Some(b) => {
                let parent = &self.layouts[b];
                (parent.attrs.clone(), parent.methods.clone())
            }
            None => (Vec::new(), BTreeMap::new()),
        };
        let id = self.layouts.len();
        self.layouts.push(ClassLayout {
            name: name.to_string(),
            base,
            attrs,
            methods,
            open: false,
        });
        id
    }

    /// 属性を追加または型更新する。新規属性は末尾オフセットに置く。
    pub fn set_attr(&mut self, id: ClassId, name: &str, ty: Type) {
        let layout = &mut self.layouts[id];
        if let Some(slot) = layout.attrs.iter_mut().find(|a| a.name == name) {
            slot.ty = join(&slot.ty, &ty);
        } else {
            let offset = layout.attrs.len();
            layout.attrs.push(AttrSlot {
                name: name.to_string(),
                ty,
                offset,
            });
        }
    }

    /// メソッドを登録する。同名は派生側が上書きする（解決順のフラット化）。
    pub fn set_method(&mut self, id: ClassId, name: &str, func_key: &str) {
        self.layouts[id]
            .methods
            .insert(name.to_string(), func_key.to_string());
    }

    /// 動的属性 API の使用を観測したクラスを open へ退化させる。
    /// 派生クラスのレイアウトは基底のコピーを持つため、連鎖して open にする。
    pub fn mark_open(&mut self, id: ClassId) {
        self.layouts[id].open = true;
        let derived: Vec<ClassId> = self
            .layouts
            .iter()
            .enumerate()
            .filter(|(_, l)| l.base == Some(id))
            .map(|(i, _)| i)
            .collect();
        for d in derived {
            self.mark_open(d);
        }
    }

    pub fn get(&self, id: ClassId) -> &ClassLayout {
        &self.layouts[id]
    }

    /// 名前からクラス ID を逆引きする。
    pub fn id_of(&self, name: &str) -> Option<ClassId> {
        self.layouts.iter().position(|l| l.name == name)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &ClassLayout)> {
        self.layouts.iter().enumerate()
    }

    /// `a` が `b` と同一またはその派生かどうか。
    pub fn is_subclass(&self, a: ClassId, b: ClassId) -> bool {
        let mut cur = Some(a);
        while let Some(id) = cur {
            if id == b {
                return true;
            }
            cur = self.layouts[id].base;
        }
        false
    }

    /// 診断向けに Object 型をクラス名で表示する。
    pub fn display(&self, ty: &Type) -> String {
        match ty {
            Type::Object(id) => self.layouts[*id].name.clone(),
            Type::Union(items) => items
                .iter()
                .map(|t| self.display(t))
                .collect::<Vec<_>>()
                .join(" | "),
            Type::List(t) => format!("list[{}]", self.display(t)),
            other => format!("{other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// join が可換で、Unknown が単位元になることを確認する。
    fn join_commutes_and_unknown_is_identity() {
        assert_eq!(join(&Type::Int, &Type::Unknown), Type::Int);
        assert_eq!(join(&Type::Unknown, &Type::Str), Type::Str);
        assert_eq!(
            join(&Type::Int, &Type::Str),
            join(&Type::Str, &Type::Int)
        );
    }

    #[test]
    /// Union の幅が予算を超えると Any に拡大することを確認する。
    fn union_overflow_widens_to_any() {
        let mut acc = Type::Int;
        for t in [Type::Str, Type::Float, Type::Bytes, Type::NoneT, Type::Bool] {
            acc = join(&acc, &t);
        }
        assert_eq!(acc, Type::Any);
    }

    #[test]
    /// isinstance 絞り込みの真側・偽側の振る舞いを確認する。
    fn narrowing_splits_union() {
        let u = union_of(&Type::Int, &Type::Str);
        assert_eq!(narrow_to(&u, &Type::Int), Type::Int);
        assert_eq!(narrow_away(&u, &Type::Int), Type::Str);
    }

    #[test]
    /// 継承がレイアウトをフラット化し、実行時チェーンを作らないことを確認する。
    fn class_layout_flattens_inheritance() {
        let mut table = ClassTable::new();
        let a = table.define("A", None);
        table.set_attr(a, "x", Type::Int);
        table.set_method(a, "hello", "A.hello");
        let b = table.define("B", Some(a));
        table.set_method(b, "hello", "B.hello");
        assert_eq!(table.get(b).attr("x").map(|s| s.offset), Some(0));
        assert_eq!(table.get(b).methods.get("hello").map(String::as_str), Some("B.hello"));
        assert_eq!(table.get(a).methods.get("hello").map(String::as_str), Some("A.hello"));
        assert!(table.is_subclass(b, a));
        assert!(!table.is_subclass(a, b));
    }
}
