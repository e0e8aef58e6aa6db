// パス: src/infer/scope.rs
// 役割: モジュール内の宣言収集・インポート表・名前解決の前処理を行う
// 意図: 呼び出しグラフ構築に必要な静的な名前空間を不動点計算の前に確定させる
// 関連ファイル: src/infer/mod.rs, src/infer/flow.rs, src/ast.rs

use std::collections::BTreeMap;

use crate::ast::{Module, Param, Stmt};
use crate::errors::TypeError;
use crate::typesys::{ClassId, ClassTable, Type};

use super::traits::FunctionTraits;

/// 関数 1 つ分の宣言（本体と所属情報）。不動点の間は不変。
#[derive(Clone, Debug)]
pub struct FuncDecl {
    pub key: String,
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub is_async: bool,
    pub class_id: Option<ClassId>,
}

/// 関数 1 つ分の可変な推論状態。パスを跨いで単調に成長する。
#[derive(Clone, Debug)]
pub struct FuncState {
    pub param_types: Vec<Type>,
    pub ret: Type,
    pub locals: BTreeMap<String, Type>,
    pub traits: FunctionTraits,
}

impl FuncState {
    fn new(param_count: usize) -> Self {
        Self {
            param_types: vec![Type::Unknown; param_count],
            ret: Type::Unknown,
            locals: BTreeMap::new(),
            traits: FunctionTraits::with_param_count(param_count),
        }
    }
}

/// 宣言収集の結果。宣言・クラス表・インポート表・トップレベル文を持つ。
#[derive(Debug)]
pub struct Collected {
    pub decls: Vec<FuncDecl>,
    pub states: BTreeMap<String, FuncState>,
    pub classes: ClassTable,
    /// ローカル名 → モジュール名。`import m as x` は x → m。
    pub imports: BTreeMap<String, String>,
    /// def / class / import を除いたトップレベル文。
    pub main_body: Vec<Stmt>,
}

/// モジュールを走査して宣言を収集する。
/// クラスはこの時点で定義され、基底のレイアウトがフラット化される。
pub fn collect(module: &Module) -> Result<Collected, TypeError> {
    let mut decls = Vec::new();
    let mut states = BTreeMap::new();
    let mut classes = ClassTable::new();
    let mut imports = BTreeMap::new();
    let mut main_body = Vec::new();

    for stmt in &module.body {
        match stmt {
            Stmt::FuncDef {
                name,
                params,
                body,
                is_async,
                ..
            } => {
                register_func(
                    &mut decls,
                    &mut states,
                    name.clone(),
                    name.clone(),
                    params.clone(),
                    body.clone(),
                    *is_async,
                    None,
                );
            }
            Stmt::ClassDef {
                name, bases, body, ..
            } => {
                collect_class(&mut decls, &mut states, &mut classes, name, bases, body)?;
            }
            Stmt::Import { module, alias, .. } => {
                let local = alias.clone().unwrap_or_else(|| module.clone());
                imports.insert(local, module.clone());
            }
            Stmt::ImportFrom { module, names, .. } => {
                for (name, alias) in names {
                    let local = alias.clone().unwrap_or_else(|| name.clone());
                    imports.insert(local, format!("{module}.{name}"));
                }
            }
            other => main_body.push(other.clone()),
        }
    }

    Ok(Collected {
        decls,
        states,
        classes,
        imports,
        main_body,
    })
}

/// クラス定義を処理する。メソッドを `Class.name` キーで登録し、
/// クラス変数の代入を属性スロットとして予約する。
fn collect_class(
    decls: &mut Vec<FuncDecl>,
    states: &mut BTreeMap<String, FuncState>,
    classes: &mut ClassTable,
    name: &str,
    bases: &[String],
    body: &[Stmt],
) -> Result<(), TypeError> {
    let base_id = match bases.first() {
        Some(base) => Some(classes.id_of(base).ok_or_else(|| {
            TypeError::new(
                "TYPE001",
                format!("基底クラス {base} はこの時点で未定義です"),
                None,
            )
        })?),
        None => None,
    };
    if bases.len() > 1 {
        return Err(TypeError::new(
            "TYPE002",
            format!("クラス {name} の多重継承は未対応です"),
            None,
        ));
    }
    let id = classes.define(name, base_id);
    for stmt in body {
        match stmt {
            Stmt::FuncDef {
                name: m_name,
                params,
                body: m_body,
                is_async,
                ..
            } => {
                let key = format!("{name}.{m_name}");
                classes.set_method(id, m_name, &key);
                register_func(
                    decls,
                    states,
                    key,
                    m_name.clone(),
                    params.clone(),
                    m_body.clone(),
                    *is_async,
                    Some(id),
                );
            }
            Stmt::Assign {
                target: crate::ast::Expr::Name { name: attr, .. },
                ..
            } => {
                // クラス変数はスロットだけ予約し、型は不動点の中で確定する
                classes.set_attr(id, attr, Type::Unknown);
            }
            Stmt::Pass { .. } => {}
            other => {
                let s = other.span();
                return Err(TypeError::at(
                    "TYPE003",
                    format!("クラス {name} の本体に置けない文です"),
                    Some(s.pos),
                    Some(s.line),
                    Some(s.col),
                ));
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn register_func(
    decls: &mut Vec<FuncDecl>,
    states: &mut BTreeMap<String, FuncState>,
    key: String,
    name: String,
    params: Vec<Param>,
    body: Vec<Stmt>,
    is_async: bool,
    class_id: Option<ClassId>,
) {
    states.insert(key.clone(), FuncState::new(params.len()));
    decls.push(FuncDecl {
        key,
        name,
        params,
        body,
        is_async,
        class_id,
    });
}
