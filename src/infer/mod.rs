// パス: src/infer/mod.rs
// 役割: 呼び出しグラフ上の単調不動点として型と特性を推論する
// 意図: エミッタが具象型と特性だけを見てコード形状を選べる状態を作る
// 関連ファイル: src/infer/flow.rs, src/infer/scope.rs, src/typesys.rs
//! 型・特性推論モジュール
//!
//! アルゴリズム:
//! 1. 前処理で宣言・インポート表・呼び出し先の静的解決を確定する。
//! 2. 各関数に前向きデータフローを流し、戻り値型を呼び出し元へ伝播する。
//! 3. 変化が無くなるまで反復する。格子の高さが有限なので停止する。
//!    パス予算を超えた時点で残った `Unknown` は `Any` へ拡大する
//!    （性能の劣化であって正しさの欠陥ではない）。
//! 4. 同じ反復の中で関数特性（純粋性・I/O・await・引数変異・失敗可能性）を
//!    単調に計算する。`is_pure` だけは不動点確定後に決める。

mod builtins;
mod flow;
mod scope;
mod traits;

pub use builtins::{is_io_primitive, lookup as lookup_builtin, BuiltinDef, IoKind};
pub use scope::{FuncDecl, FuncState};
pub use traits::FunctionTraits;

use std::collections::BTreeMap;

use crate::ast::Module;
use crate::errors::TypeError;
use crate::typesys::{ClassTable, FnSig, Type};

/// 不動点反復の上限。超過時は残りを `Any` に拡大して打ち切る。
pub const MAX_PASSES: usize = 12;

/// トップレベル文を束ねる疑似関数のキー。
pub const MAIN_KEY: &str = "__main__";

/// 推論が確定した関数 1 つ分の情報。
#[derive(Clone, Debug)]
pub struct FuncInfo {
    pub decl: FuncDecl,
    pub sig: FnSig,
    pub locals: BTreeMap<String, Type>,
    pub traits: FunctionTraits,
}

/// モジュール 1 つ分の推論結果。
#[derive(Debug)]
pub struct ModuleInfo {
    pub name: String,
    pub classes: ClassTable,
    pub functions: BTreeMap<String, FuncInfo>,
    pub imports: BTreeMap<String, String>,
    /// トップレベル文（疑似関数 `__main__` の本体）。
    pub main_body: Vec<crate::ast::Stmt>,
    pub main_locals: BTreeMap<String, Type>,
    pub main_traits: FunctionTraits,
}

impl ModuleInfo {
    /// 公開シグネチャの安定なダイジェスト素材を返す。
    /// キャッシュキーの入力になる（内容が変わればリビルドされる）。
    pub fn exported_signature(&self) -> String {
        let mut out = String::new();
        for (key, info) in &self.functions {
            out.push_str(key);
            out.push(':');
            let params: Vec<String> = info.sig.params.iter().map(|t| format!("{t}")).collect();
            out.push_str(&params.join(","));
            out.push_str("->");
            out.push_str(&format!("{}", info.sig.ret));
            out.push(';');
        }
        for (id, layout) in self.classes.iter() {
            out.push_str(&format!("#{id}:{}", layout.name));
            for attr in &layout.attrs {
                out.push_str(&format!(",{}:{}", attr.name, attr.ty));
            }
            out.push(';');
        }
        out
    }
}

/// モジュール全体を推論する。C3 のエントリポイント。
pub fn infer_module(module: &Module) -> Result<ModuleInfo, TypeError> {
    let mut collected = scope::collect(module)?;

    // トップレベル文を疑似関数として状態表へ加える
    collected.states.insert(
        MAIN_KEY.to_string(),
        FuncState {
            param_types: Vec::new(),
            ret: Type::Unknown,
            locals: BTreeMap::new(),
            traits: FunctionTraits::with_param_count(0),
        },
    );
    let main_decl = FuncDecl {
        key: MAIN_KEY.to_string(),
        name: MAIN_KEY.to_string(),
        params: Vec::new(),
        body: collected.main_body.clone(),
        is_async: false,
        class_id: None,
    };

    let mut decls = collected.decls.clone();
    decls.push(main_decl);

    // 不動点反復: 各関数へデータフローを流し、観測を状態表に取り込む
    let mut pass = 0;
    loop {
        pass += 1;
        let mut changed = false;
        for decl in &decls {
            let outcome = flow::analyze_function(
                decl,
                &collected.states,
                &mut collected.classes,
                &collected.imports,
            )?;
            changed |= apply_outcome(&mut collected.states, &decl.key, outcome);
        }
        if !changed {
            break;
        }
        if pass >= MAX_PASSES {
            // 予算超過: 残った Unknown を Any へ拡大して終了する
            for state in collected.states.values_mut() {
                widen_state(state);
            }
            break;
        }
    }

    // Unknown は推論を生き延びない: 署名とローカルを最終確定する
    for state in collected.states.values_mut() {
        widen_state(state);
    }
    finalize_purity(&mut collected.states);

    let mut functions = BTreeMap::new();
    for decl in decls {
        if decl.key == MAIN_KEY {
            continue;
        }
        let state = collected
            .states
            .remove(&decl.key)
            .expect("宣言済み関数の状態は必ず存在する");
        functions.insert(
            decl.key.clone(),
            FuncInfo {
                sig: FnSig {
                    params: state.param_types,
                    ret: state.ret,
                },
                locals: state.locals,
                traits: state.traits,
                decl,
            },
        );
    }
    let main_state = collected
        .states
        .remove(MAIN_KEY)
        .expect("疑似 main の状態は必ず存在する");

    Ok(ModuleInfo {
        name: module.name.clone(),
        classes: collected.classes,
        functions,
        imports: collected.imports,
        main_body: collected.main_body,
        main_locals: main_state.locals,
        main_traits: main_state.traits,
    })
}

/// フロー解析 1 回分の観測を状態表へ単調に適用する。
fn apply_outcome(
    states: &mut BTreeMap<String, FuncState>,
    key: &str,
    outcome: flow::FlowOutcome,
) -> bool {
    let mut changed = false;
    {
        let state = states.get_mut(key).expect("解析対象の状態は登録済み");
        let new_ret = crate::typesys::join(&state.ret, &outcome.ret);
        if new_ret != state.ret {
            state.ret = new_ret;
            changed = true;
        }
        for (name, ty) in &outcome.locals {
            let entry = state.locals.entry(name.clone()).or_insert(Type::Unknown);
            let joined = crate::typesys::join(entry, ty);
            if joined != *entry {
                *entry = joined;
                changed = true;
            }
        }
        changed |= state.traits.absorb(&outcome.traits);
    }
    // 呼び出し仮引数への実引数型の伝播と、呼び先経由の特性伝播
    for call in &outcome.calls {
        let callee_traits = states.get(&call.callee).map(|s| s.traits.clone());
        if let Some(callee_state) = states.get_mut(&call.callee) {
            for (idx, arg_ty) in call.args.iter().enumerate() {
                if let Some(slot) = callee_state.param_types.get_mut(idx) {
                    let joined = crate::typesys::join(slot, arg_ty);
                    if joined != *slot {
                        *slot = joined;
                        changed = true;
                    }
                }
            }
        }
        if let Some(callee_traits) = callee_traits {
            let caller = states.get_mut(key).expect("解析対象の状態は登録済み");
            changed |= caller.traits.absorb_callee(&callee_traits);
            // 呼び先が引数を変異させるなら、それが自分の仮引数のとき変異が伝播する
            for (arg_idx, param_idx) in call.param_args.iter().enumerate() {
                if let (Some(p), Some(true)) =
                    (param_idx, callee_traits.mutates_param.get(arg_idx))
                {
                    if let Some(slot) = caller.traits.mutates_param.get_mut(*p) {
                        if !*slot {
                            *slot = true;
                            changed = true;
                        }
                    }
                }
            }
        }
    }
    changed
}

/// 状態の中に残った Unknown を Any へ置き換える。
fn widen_state(state: &mut FuncState) {
    for ty in state.param_types.iter_mut() {
        widen(ty);
    }
    widen(&mut state.ret);
    for ty in state.locals.values_mut() {
        widen(ty);
    }
}

fn widen(ty: &mut Type) {
    if matches!(ty, Type::Unknown) {
        *ty = Type::Any;
    }
}

/// `is_pure` を確定する。不純の観測を不動点まで伝播させる。
/// 純粋性は I/O なし・引数変更なし・失敗なし・呼び先もすべて純粋の連言。
/// await そのものは純粋性を壊さない（CPU バウンドの async は純粋になり得る）。
fn finalize_purity(states: &mut BTreeMap<String, FuncState>) {
    // 初期値: 自身の観測だけで純粋になり得るか
    let mut purity: BTreeMap<String, bool> = states
        .iter()
        .map(|(k, s)| {
            let own = !s.traits.does_io
                && !s.traits.can_fail
                && !s.traits.mutates_param.iter().any(|m| *m);
            (k.clone(), own)
        })
        .collect();
    // 呼び先の不純が伝播しなくなるまで反復する
    loop {
        let mut changed = false;
        let snapshot = purity.clone();
        for (key, state) in states.iter() {
            if !purity[key] {
                continue;
            }
            let impure_callee = state.traits.callees.iter().any(|c| {
                // 組み込みは I/O・失敗フラグで判定し、未知の外部呼び出しは不純とみなす
                match snapshot.get(c) {
                    Some(p) => !p,
                    None => match builtins::lookup(c) {
                        Some(b) => b.io != IoKind::None || b.can_fail,
                        None => true,
                    },
                }
            });
            if impure_callee {
                purity.insert(key.clone(), false);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    for (key, state) in states.iter_mut() {
        state.traits.is_pure = purity[key];
    }
}
