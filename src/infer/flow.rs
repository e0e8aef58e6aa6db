// パス: src/infer/flow.rs
// 役割: 関数本体への前向きデータフローで型と特性の観測を集める
// 意図: 代入による型の転送・isinstance の絞り込み・呼び出し記録を一箇所で行う
// 関連ファイル: src/infer/mod.rs, src/infer/scope.rs, src/typesys.rs
//! 前向きデータフロー
//!
//! - 代入は型を転送し、分岐の合流で join する。
//! - `if isinstance(x, T)` は真側で `T ∩ current`、偽側で `current \ T` に絞る。
//! - ループ本体は 2 回流して合流させる近似で単調性を保つ。
//! - 観測（呼び出し・特性・ローカル型）は FlowOutcome として親へ返す。

use std::collections::BTreeMap;

use crate::ast::{BinOpKind, CmpOpKind, Comprehension, Expr, Stmt, UnaryOpKind};
use crate::errors::TypeError;
use crate::typesys::{
    builtin_type_from_name, join, narrow_away, narrow_to, ClassTable, FnSig, Type,
};

use super::builtins::{self, IoKind, MUTATING_METHODS};
use super::scope::{FuncDecl, FuncState};
use super::traits::FunctionTraits;

/// 呼び出し 1 件分の観測。
#[derive(Clone, Debug)]
pub(super) struct CallObs {
    pub callee: String,
    pub args: Vec<Type>,
    /// 実引数が呼び出し側の仮引数そのものの場合、その添字。変異の伝播に使う。
    pub param_args: Vec<Option<usize>>,
}

/// フロー解析 1 回分の結果。
#[derive(Clone, Debug)]
pub(super) struct FlowOutcome {
    pub ret: Type,
    pub locals: BTreeMap<String, Type>,
    pub traits: FunctionTraits,
    pub calls: Vec<CallObs>,
}

/// 環境は変数名から型への写像。分岐でクローンし、合流で join する。
type Env = BTreeMap<String, Type>;

struct FlowCtx<'a> {
    decl: &'a FuncDecl,
    states: &'a BTreeMap<String, FuncState>,
    classes: &'a mut ClassTable,
    imports: &'a BTreeMap<String, String>,
    param_names: Vec<String>,
    ret: Type,
    yield_ty: Option<Type>,
    traits: FunctionTraits,
    calls: Vec<CallObs>,
}

/// 関数 1 つへデータフローを流す。
pub(super) fn analyze_function(
    decl: &FuncDecl,
    states: &BTreeMap<String, FuncState>,
    classes: &mut ClassTable,
    imports: &BTreeMap<String, String>,
) -> Result<FlowOutcome, TypeError> {
    let param_names: Vec<String> = decl.params.iter().map(|p| p.name.clone()).collect();
    let mut ctx = FlowCtx {
        decl,
        states,
        classes,
        imports,
        param_names,
        ret: Type::Unknown,
        yield_ty: None,
        traits: FunctionTraits::with_param_count(decl.params.len()),
        calls: Vec::new(),
    };

    let mut env = Env::new();
    let state = &states[&decl.key];
    for (idx, param) in decl.params.iter().enumerate() {
        let mut ty = state.param_types[idx].clone();
        // メソッドの先頭仮引数はレシーバ型で種付けする
        if idx == 0 && decl.class_id.is_some() {
            ty = join(&ty, &Type::Object(decl.class_id.expect("class_id は直前に確認済み")));
        }
        if let Some(default) = &param.default {
            let d_ty = ctx.type_of(&mut env, default, false)?;
            ty = join(&ty, &d_ty);
        }
        env.insert(param.name.clone(), ty);
    }

    ctx.exec_block(&mut env, &decl.body)?;

    // 本体を流し終えた後の確定処理
    let mut ret = ctx.ret.clone();
    if let Some(elem) = &ctx.yield_ty {
        // yield を含む関数の値はジェネレータになる
        ret = Type::Generator(Box::new(elem.clone()));
    } else if decl.is_async {
        let inner = if matches!(ret, Type::Unknown) {
            Type::NoneT
        } else {
            ret
        };
        ret = Type::Coro(Box::new(inner));
    } else if matches!(ret, Type::Unknown) {
        ret = Type::NoneT;
    }

    let mut locals = BTreeMap::new();
    for (name, ty) in env {
        locals.insert(name, ty);
    }
    Ok(FlowOutcome {
        ret,
        locals,
        traits: ctx.traits,
        calls: ctx.calls,
    })
}

impl<'a> FlowCtx<'a> {
    /// 文の並びを順に実行する。
    fn exec_block(&mut self, env: &mut Env, body: &[Stmt]) -> Result<(), TypeError> {
        for stmt in body {
            self.exec_stmt(env, stmt)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, env: &mut Env, stmt: &Stmt) -> Result<(), TypeError> {
        match stmt {
            Stmt::Assign { target, value, .. } => {
                let v_ty = self.type_of(env, value, false)?;
                self.assign_target(env, target, v_ty)
            }
            Stmt::ExprStmt { value, .. } => {
                self.type_of(env, value, false)?;
                Ok(())
            }
            Stmt::Return { value, .. } => {
                let ty = match value {
                    // 自己再帰の末尾呼び出しは末尾性を保ったまま記録する
                    Some(Expr::Call { func, args, .. })
                        if self.resolved_key(env, func) == Some(self.decl.key.clone()) =>
                    {
                        self.record_call_to(env, &self.decl.key, None, args)?;
                        self.states[&self.decl.key].ret.clone()
                    }
                    Some(v) => self.type_of(env, v, false)?,
                    None => Type::NoneT,
                };
                self.ret = join(&self.ret, &ty);
                Ok(())
            }
            Stmt::Raise { exc, cause, .. } => {
                if let Some(e) = exc {
                    self.type_of(env, e, false)?;
                }
                if let Some(c) = cause {
                    self.type_of(env, c, false)?;
                }
                self.traits.can_fail = true;
                Ok(())
            }
            Stmt::If {
                cond, body, orelse, ..
            } => {
                self.type_of(env, cond, false)?;
                let mut then_env = env.clone();
                let mut else_env = env.clone();
                self.apply_narrowing(&mut then_env, &mut else_env, cond);
                self.exec_block(&mut then_env, body)?;
                self.exec_block(&mut else_env, orelse)?;
                *env = join_envs(&then_env, &else_env);
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                // ループ本体を 2 回流す近似で不動点へ寄せる
                for _ in 0..2 {
                    self.type_of(env, cond, false)?;
                    let mut body_env = env.clone();
                    self.exec_block(&mut body_env, body)?;
                    *env = join_envs(env, &body_env);
                }
                Ok(())
            }
            Stmt::For {
                target, iter, body, ..
            } => {
                let iter_ty = self.type_of(env, iter, false)?;
                let elem = element_type(&iter_ty);
                for _ in 0..2 {
                    let mut body_env = env.clone();
                    self.assign_target(&mut body_env, target, elem.clone())?;
                    self.exec_block(&mut body_env, body)?;
                    *env = join_envs(env, &body_env);
                }
                Ok(())
            }
            Stmt::Try {
                body,
                handlers,
                orelse,
                finally,
                ..
            } => {
                let fail_before = self.traits.can_fail;
                let mut guarded_env = env.clone();
                self.exec_block(&mut guarded_env, body)?;
                // 捕捉対象なしの except があれば本体の失敗は封じ込められる
                let catch_all = handlers.iter().any(|h| h.class_name.is_none());
                if catch_all {
                    self.traits.can_fail = fail_before;
                }
                let mut merged = guarded_env.clone();
                for h in handlers {
                    let mut h_env = env.clone();
                    if let (Some(cls), Some(bind)) = (&h.class_name, &h.bind_name) {
                        let ty = self
                            .classes
                            .id_of(cls)
                            .map(Type::Object)
                            .unwrap_or(Type::Any);
                        h_env.insert(bind.clone(), ty);
                    }
                    self.exec_block(&mut h_env, &h.body)?;
                    merged = join_envs(&merged, &h_env);
                }
                if !orelse.is_empty() {
                    self.exec_block(&mut merged, orelse)?;
                }
                *env = merged;
                if !finally.is_empty() {
                    self.exec_block(env, finally)?;
                }
                Ok(())
            }
            Stmt::Global { names, .. } => {
                for name in names {
                    env.insert(name.clone(), Type::Any);
                }
                Ok(())
            }
            Stmt::FuncDef { name, .. } | Stmt::ClassDef { name, .. } => {
                let s = stmt.span();
                Err(TypeError::at(
                    "TYPE004",
                    format!("ネストした定義 {name} は未対応です"),
                    Some(s.pos),
                    Some(s.line),
                    Some(s.col),
                ))
            }
            Stmt::Import { .. } | Stmt::ImportFrom { .. } => Ok(()),
            Stmt::Pass { .. } | Stmt::Break { .. } | Stmt::Continue { .. } => Ok(()),
        }
    }

    /// 代入先へ型を転送する。属性・添字ストアは変異として観測する。
    fn assign_target(&mut self, env: &mut Env, target: &Expr, v_ty: Type) -> Result<(), TypeError> {
        match target {
            Expr::Name { name, .. } => {
                env.insert(name.clone(), v_ty);
                Ok(())
            }
            Expr::Attribute { obj, name, .. } => {
                let obj_ty = self.type_of(env, obj, false)?;
                self.mark_param_mutation(obj);
                if let Type::Object(id) = obj_ty {
                    self.classes.set_attr(id, name, v_ty);
                }
                Ok(())
            }
            Expr::Subscript { obj, index, .. } => {
                let obj_ty = self.type_of(env, obj, false)?;
                let idx_ty = self.type_of(env, index, false)?;
                self.mark_param_mutation(obj);
                // Name レシーバならコンテナ型を成長させる
                if let Expr::Name { name, .. } = obj.as_ref() {
                    let updated = match obj_ty {
                        Type::List(elem) => Type::List(Box::new(join(&elem, &v_ty))),
                        Type::Dict(k, v) => Type::Dict(
                            Box::new(join(&k, &idx_ty)),
                            Box::new(join(&v, &v_ty)),
                        ),
                        other => other,
                    };
                    env.insert(name.clone(), updated);
                }
                Ok(())
            }
            Expr::TupleLit { items, .. } => {
                let elem_tys: Vec<Type> = match &v_ty {
                    Type::Tuple(tys) if tys.len() == items.len() => tys.clone(),
                    Type::List(elem) => vec![(**elem).clone(); items.len()],
                    _ => vec![Type::Any; items.len()],
                };
                for (item, ty) in items.iter().zip(elem_tys) {
                    self.assign_target(env, item, ty)?;
                }
                Ok(())
            }
            other => {
                let s = other.span();
                Err(TypeError::at(
                    "TYPE005",
                    "代入先にできない式です",
                    Some(s.pos),
                    Some(s.line),
                    Some(s.col),
                ))
            }
        }
    }

    /// レシーバが仮引数そのものなら変異フラグを立てる。
    fn mark_param_mutation(&mut self, obj: &Expr) {
        if let Expr::Name { name, .. } = obj {
            if let Some(idx) = self.param_names.iter().position(|p| p == name) {
                self.traits.mutates_param[idx] = true;
            }
        }
    }

    /// `isinstance` 条件による分岐絞り込みを両側の環境へ適用する。
    fn apply_narrowing(&mut self, then_env: &mut Env, else_env: &mut Env, cond: &Expr) {
        if let Expr::Call { func, args, .. } = cond {
            if let Expr::Name { name, .. } = func.as_ref() {
                if name == "isinstance" && args.len() == 2 {
                    if let (Expr::Name { name: var, .. }, Expr::Name { name: ty_name, .. }) =
                        (&args[0], &args[1])
                    {
                        let target = builtin_type_from_name(ty_name)
                            .or_else(|| self.classes.id_of(ty_name).map(Type::Object));
                        if let Some(target) = target {
                            if let Some(cur) = then_env.get(var).cloned() {
                                then_env.insert(var.clone(), narrow_to(&cur, &target));
                            }
                            if let Some(cur) = else_env.get(var).cloned() {
                                else_env.insert(var.clone(), narrow_away(&cur, &target));
                            }
                        }
                    }
                }
            }
        }
        // `not isinstance(...)` は側を入れ替えて同じ規則を使う
        if let Expr::UnaryOp {
            op: UnaryOpKind::Not,
            operand,
            ..
        } = cond
        {
            self.apply_narrowing(else_env, then_env, operand);
        }
    }

    /// 名前が静的に解決される呼び出し先キーを返す。
    fn resolved_key(&self, _env: &Env, func: &Expr) -> Option<String> {
        if let Expr::Name { name, .. } = func {
            if self.states.contains_key(name) {
                return Some(name.clone());
            }
        }
        None
    }

    /// 呼び出しを観測として記録し、現時点の戻り値型を返す。
    fn record_call_to(
        &mut self,
        env: &mut Env,
        key: &str,
        recv: Option<Type>,
        args: &[Expr],
    ) -> Result<Type, TypeError> {
        let mut arg_tys = Vec::new();
        let mut param_args = Vec::new();
        if let Some(r) = recv {
            arg_tys.push(r);
            param_args.push(None);
        }
        for arg in args {
            if let Expr::Name { name, .. } = arg {
                param_args.push(self.param_names.iter().position(|p| p == name));
            } else {
                param_args.push(None);
            }
            arg_tys.push(self.type_of(env, arg, false)?);
        }
        if !self.traits.callees.contains(&key.to_string()) {
            self.traits.callees.push(key.to_string());
        }
        let ret = self.states[key].ret.clone();
        self.calls.push(CallObs {
            callee: key.to_string(),
            args: arg_tys,
            param_args,
        });
        Ok(ret)
    }

    /// 式の型を求める。`tail` は Return 直下の自己呼び出し判定で使う。
    fn type_of(&mut self, env: &mut Env, expr: &Expr, _tail: bool) -> Result<Type, TypeError> {
        match expr {
            Expr::Name { name, span } => {
                if let Some(ty) = env.get(name) {
                    return Ok(ty.clone());
                }
                if let Some(state) = self.states.get(name) {
                    return Ok(Type::Callable(Box::new(FnSig {
                        params: state.param_types.clone(),
                        ret: state.ret.clone(),
                    })));
                }
                if self.classes.id_of(name).is_some() {
                    return Ok(Type::Any);
                }
                if self.imports.contains_key(name) {
                    return Ok(Type::Any);
                }
                if let Some(b) = builtins::lookup(name) {
                    return Ok(Type::Callable(Box::new(b.sig.clone())));
                }
                Err(TypeError::at(
                    "TYPE010",
                    format!("未束縛変数です: {name}"),
                    Some(span.pos),
                    Some(span.line),
                    Some(span.col),
                ))
            }
            Expr::IntLit { .. } => Ok(Type::Int),
            Expr::BigIntLit { .. } => Ok(Type::BigInt),
            Expr::FloatLit { .. } => Ok(Type::Float),
            Expr::StrLit { .. } => Ok(Type::Str),
            Expr::BytesLit { .. } => Ok(Type::Bytes),
            Expr::BoolLit { .. } => Ok(Type::Bool),
            Expr::NoneLit { .. } => Ok(Type::NoneT),
            Expr::FString { parts, .. } => {
                self.traits.needs_allocator = true;
                for part in parts {
                    if let crate::ast::FStringPart::Interp(e) = part {
                        self.type_of(env, e, false)?;
                    }
                }
                Ok(Type::Str)
            }
            Expr::ListLit { items, .. } => {
                self.traits.needs_allocator = true;
                let mut elem = Type::Unknown;
                for item in items {
                    let ty = self.type_of(env, item, false)?;
                    elem = join(&elem, &ty);
                }
                Ok(Type::List(Box::new(elem)))
            }
            Expr::SetLit { items, .. } => {
                self.traits.needs_allocator = true;
                let mut elem = Type::Unknown;
                for item in items {
                    let ty = self.type_of(env, item, false)?;
                    elem = join(&elem, &ty);
                }
                Ok(Type::Set(Box::new(elem)))
            }
            Expr::TupleLit { items, .. } => {
                let mut tys = Vec::with_capacity(items.len());
                for item in items {
                    tys.push(self.type_of(env, item, false)?);
                }
                Ok(Type::Tuple(tys))
            }
            Expr::DictLit { keys, values, .. } => {
                self.traits.needs_allocator = true;
                let mut k_ty = Type::Unknown;
                let mut v_ty = Type::Unknown;
                for (k, v) in keys.iter().zip(values) {
                    k_ty = join(&k_ty, &self.type_of(env, k, false)?);
                    v_ty = join(&v_ty, &self.type_of(env, v, false)?);
                }
                Ok(Type::Dict(Box::new(k_ty), Box::new(v_ty)))
            }
            Expr::BinOp {
                op, left, right, span,
            } => {
                let l = self.type_of(env, left, false)?;
                let r = self.type_of(env, right, false)?;
                self.binop_type(*op, &l, &r, span)
            }
            Expr::Compare { left, right, .. } => {
                self.type_of(env, left, false)?;
                self.type_of(env, right, false)?;
                Ok(Type::Bool)
            }
            Expr::BoolOp { left, right, .. } => {
                let l = self.type_of(env, left, false)?;
                let r = self.type_of(env, right, false)?;
                Ok(join(&l, &r))
            }
            Expr::UnaryOp { op, operand, .. } => {
                let ty = self.type_of(env, operand, false)?;
                Ok(match op {
                    UnaryOpKind::Not => Type::Bool,
                    UnaryOpKind::Invert => Type::Int,
                    _ => ty,
                })
            }
            Expr::Call { func, args, span } => self.call_type(env, func, args, span),
            Expr::Attribute { obj, name, span } => {
                let obj_ty = self.type_of(env, obj, false)?;
                self.attribute_type(&obj_ty, name, span)
            }
            Expr::Subscript { obj, index, .. } => {
                let obj_ty = self.type_of(env, obj, false)?;
                let is_slice = matches!(index.as_ref(), Expr::Slice { .. });
                let idx_ty = self.type_of(env, index, false)?;
                Ok(subscript_type(&obj_ty, &idx_ty, index, is_slice))
            }
            Expr::Slice {
                lower, upper, step, ..
            } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.type_of(env, part, false)?;
                }
                Ok(Type::Any)
            }
            Expr::Lambda { params, body, .. } => {
                let mut inner = env.clone();
                for p in params {
                    inner.insert(p.name.clone(), Type::Any);
                }
                let ret = self.type_of(&mut inner, body, false)?;
                // 外側の変数の捕獲を観測する
                let mut free = Vec::new();
                collect_names(body, &mut free);
                for name in free {
                    if env.contains_key(&name) && !params.iter().any(|p| p.name == name) {
                        if !self.traits.captured_vars.contains(&name) {
                            self.traits.captured_vars.push(name);
                        }
                    }
                }
                Ok(Type::Callable(Box::new(FnSig {
                    params: vec![Type::Any; params.len()],
                    ret,
                })))
            }
            Expr::ListComp {
                elt, generators, ..
            } => {
                self.traits.needs_allocator = true;
                let elem = self.comp_elem_type(env, elt, generators)?;
                Ok(Type::List(Box::new(elem)))
            }
            Expr::SetComp {
                elt, generators, ..
            } => {
                self.traits.needs_allocator = true;
                let elem = self.comp_elem_type(env, elt, generators)?;
                Ok(Type::Set(Box::new(elem)))
            }
            Expr::DictComp {
                key,
                value,
                generators,
                ..
            } => {
                self.traits.needs_allocator = true;
                let mut inner = env.clone();
                self.bind_generators(&mut inner, generators)?;
                let k = self.type_of(&mut inner, key, false)?;
                let v = self.type_of(&mut inner, value, false)?;
                Ok(Type::Dict(Box::new(k), Box::new(v)))
            }
            Expr::IfExp {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                self.type_of(env, cond, false)?;
                let t = self.type_of(env, then_branch, false)?;
                let e = self.type_of(env, else_branch, false)?;
                Ok(join(&t, &e))
            }
            Expr::Await { expr, span } => {
                self.traits.may_await = true;
                let inner = self.type_of(env, expr, false)?;
                match inner {
                    Type::Coro(t) => Ok(*t),
                    Type::Unknown => Ok(Type::Unknown),
                    Type::Any => Ok(Type::Any),
                    other => Err(TypeError::conflict(
                        "TYPE040",
                        "await の対象",
                        "coro[_]",
                        self.classes.display(&other),
                        Some(span.pos),
                        Some(span.line),
                        Some(span.col),
                    )),
                }
            }
            Expr::Yield { expr, .. } => {
                let ty = match expr {
                    Some(e) => self.type_of(env, e, false)?,
                    None => Type::NoneT,
                };
                self.traits.is_generator = true;
                let joined = match &self.yield_ty {
                    Some(prev) => join(prev, &ty),
                    None => ty,
                };
                self.yield_ty = Some(joined);
                Ok(Type::NoneT)
            }
        }
    }

    /// 内包表記のジェネレータ束縛を内側環境へ適用する。
    fn bind_generators(
        &mut self,
        inner: &mut Env,
        generators: &[Comprehension],
    ) -> Result<(), TypeError> {
        for g in generators {
            let iter_ty = self.type_of(inner, &g.iter, false)?;
            let elem = element_type(&iter_ty);
            self.assign_target(inner, &g.target, elem)?;
            for cond in &g.ifs {
                self.type_of(inner, cond, false)?;
            }
        }
        Ok(())
    }

    /// 内包表記の要素型を求める。フィルタのガードも型検査する。
    fn comp_elem_type(
        &mut self,
        env: &mut Env,
        elt: &Expr,
        generators: &[Comprehension],
    ) -> Result<Type, TypeError> {
        let mut inner = env.clone();
        self.bind_generators(&mut inner, generators)?;
        self.type_of(&mut inner, elt, false)
    }

    /// 呼び出し式の型付け。呼び出し先の種類ごとに分岐する。
    fn call_type(
        &mut self,
        env: &mut Env,
        func: &Expr,
        args: &[Expr],
        span: &crate::ast::Span,
    ) -> Result<Type, TypeError> {
        if let Expr::Name { name, .. } = func {
            // 動的属性 API の使用はクラスレイアウトを open へ退化させる
            if name == "setattr" || name == "getattr" || name == "hasattr" {
                if let Some(first) = args.first() {
                    let ty = self.type_of(env, first, false)?;
                    if let Type::Object(id) = ty {
                        self.classes.mark_open(id);
                    }
                }
                for arg in args.iter().skip(1) {
                    self.type_of(env, arg, false)?;
                }
                let b = builtins::lookup(name).expect("動的属性 API は組み込み表にある");
                self.absorb_builtin(b);
                return Ok(b.sig.ret.clone());
            }
            if name == "isinstance" {
                for arg in args {
                    if !matches!(arg, Expr::Name { .. }) {
                        self.type_of(env, arg, false)?;
                    }
                }
                return Ok(Type::Bool);
            }
            // モジュール内関数（自己再帰を含む）
            if self.states.contains_key(name) && !env.contains_key(name) {
                if name == &self.decl.key {
                    // Return 直下以外の自己呼び出しは末尾性を壊す
                    self.traits.is_tail_recursive = false;
                }
                return self.record_call_to(env, &name.clone(), None, args);
            }
            // クラスのコンストラクタ呼び出し
            if let Some(id) = self.classes.id_of(name) {
                self.traits.needs_allocator = true;
                let init_key = format!("{name}.__init__");
                if self.states.contains_key(&init_key) {
                    self.record_call_to(env, &init_key, Some(Type::Object(id)), args)?;
                } else {
                    for arg in args {
                        self.type_of(env, arg, false)?;
                    }
                }
                return Ok(Type::Object(id));
            }
            // 組み込み
            if !env.contains_key(name) {
                if let Some(b) = builtins::lookup(name) {
                    for arg in args {
                        self.type_of(env, arg, false)?;
                    }
                    self.absorb_builtin(b);
                    return Ok(b.sig.ret.clone());
                }
            }
        }
        // メソッド呼び出し
        if let Expr::Attribute { obj, name, span } = func {
            let obj_ty = self.type_of(env, obj, false)?;
            return self.method_call_type(env, obj, &obj_ty, name, args, span);
        }
        // 第一級関数: 変数の型を通して間接的にリンクする
        let f_ty = self.type_of(env, func, false)?;
        for arg in args {
            self.type_of(env, arg, false)?;
        }
        match f_ty {
            Type::Callable(sig) => {
                // 静的に解決できない呼び出しは保守的に失敗可能とみなす
                self.traits.can_fail = true;
                Ok(sig.ret)
            }
            Type::Any | Type::Unknown => {
                self.traits.can_fail = true;
                Ok(Type::Any)
            }
            other => Err(TypeError::conflict(
                "TYPE011",
                "呼び出しの対象",
                "callable",
                self.classes.display(&other),
                Some(span.pos),
                Some(span.line),
                Some(span.col),
            )),
        }
    }

    /// 組み込み呼び出しの効果を特性へ取り込む。
    fn absorb_builtin(&mut self, b: &builtins::BuiltinDef) {
        if b.io != IoKind::None {
            self.traits.does_io = true;
        }
        if b.can_fail {
            self.traits.can_fail = true;
        }
        if !self.traits.callees.contains(&b.name.to_string()) {
            self.traits.callees.push(b.name.to_string());
        }
    }

    /// メソッド呼び出しの型付け。クラスのメソッド表かコンテナ組み込みを引く。
    fn method_call_type(
        &mut self,
        env: &mut Env,
        obj: &Expr,
        obj_ty: &Type,
        name: &str,
        args: &[Expr],
        span: &crate::ast::Span,
    ) -> Result<Type, TypeError> {
        if let Type::Object(id) = obj_ty {
            let layout = self.classes.get(*id);
            let method_key = layout.methods.get(name).cloned();
            let open = layout.open;
            let class_name = layout.name.clone();
            if let Some(key) = method_key {
                return self.record_call_to(env, &key, Some(obj_ty.clone()), args);
            }
            if open {
                for arg in args {
                    self.type_of(env, arg, false)?;
                }
                return Ok(Type::Any);
            }
            return Err(TypeError::at(
                "TYPE020",
                format!("AttributeError: クラス {class_name} に属性 {name} はありません"),
                Some(span.pos),
                Some(span.line),
                Some(span.col),
            ));
        }
        // コンテナ・文字列の組み込みメソッド
        if MUTATING_METHODS.contains(&name) {
            self.mark_param_mutation(obj);
        }
        let mut arg_tys = Vec::new();
        for arg in args {
            arg_tys.push(self.type_of(env, arg, false)?);
        }
        // append 等でコンテナ型を成長させる
        if let (Expr::Name { name: var, .. }, Some(first)) = (obj, arg_tys.first()) {
            if matches!(name, "append" | "add") {
                if let Some(cur) = env.get(var).cloned() {
                    let grown = match cur {
                        Type::List(elem) => Type::List(Box::new(join(&elem, first))),
                        Type::Set(elem) => Type::Set(Box::new(join(&elem, first))),
                        other => other,
                    };
                    env.insert(var.clone(), grown);
                }
            }
        }
        Ok(container_method_type(obj_ty, name, &arg_tys))
    }

    /// 属性参照の型付け。閉じたレイアウトでの欠落はコンパイル時エラー。
    fn attribute_type(
        &mut self,
        obj_ty: &Type,
        name: &str,
        span: &crate::ast::Span,
    ) -> Result<Type, TypeError> {
        match obj_ty {
            Type::Object(id) => {
                let layout = self.classes.get(*id);
                if let Some(slot) = layout.attr(name) {
                    return Ok(slot.ty.clone());
                }
                if let Some(key) = layout.methods.get(name) {
                    let state = &self.states[key];
                    return Ok(Type::Callable(Box::new(FnSig {
                        params: state.param_types.iter().skip(1).cloned().collect(),
                        ret: state.ret.clone(),
                    })));
                }
                if layout.open {
                    return Ok(Type::Any);
                }
                Err(TypeError::at(
                    "TYPE020",
                    format!(
                        "AttributeError: クラス {} に属性 {name} はありません",
                        layout.name
                    ),
                    Some(span.pos),
                    Some(span.line),
                    Some(span.col),
                ))
            }
            _ => Ok(Type::Any),
        }
    }

    /// 二項演算の結果型。両辺が具象で両立しない場合は衝突エラーにする。
    fn binop_type(
        &mut self,
        op: BinOpKind,
        l: &Type,
        r: &Type,
        span: &crate::ast::Span,
    ) -> Result<Type, TypeError> {
        use BinOpKind::*;
        let l = coerce_bool(l);
        let r = coerce_bool(r);
        // Unknown は「まだ情報が無い」なので広げずに伝える。Any は既に頂点
        if matches!(l, Type::Unknown) || matches!(r, Type::Unknown) {
            return Ok(Type::Unknown);
        }
        if matches!(l, Type::Any) || matches!(r, Type::Any) {
            return Ok(Type::Any);
        }
        let result = match (op, &l, &r) {
            (Add, Type::Str, Type::Str) => {
                self.traits.needs_allocator = true;
                Some(Type::Str)
            }
            (Add, Type::List(a), Type::List(b)) => {
                self.traits.needs_allocator = true;
                Some(Type::List(Box::new(join(a, b))))
            }
            (Mul, Type::Str, Type::Int) | (Mul, Type::Int, Type::Str) => {
                self.traits.needs_allocator = true;
                Some(Type::Str)
            }
            (Div, a, b) if is_numeric(a) && is_numeric(b) => Some(Type::Float),
            (Add | Sub | Mul | FloorDiv | Mod | Pow, a, b) if is_numeric(a) && is_numeric(b) => {
                Some(numeric_join(a, b))
            }
            (BitAnd | BitOr | BitXor | Shl | Shr, a, b) if is_integral(a) && is_integral(b) => {
                Some(numeric_join(a, b))
            }
            (Mod, Type::Str, _) => {
                self.traits.needs_allocator = true;
                Some(Type::Str)
            }
            _ => None,
        };
        result.ok_or_else(|| {
            TypeError::conflict(
                "TYPE030",
                &format!("演算子 {}", op.as_str()),
                self.classes.display(&l),
                self.classes.display(&r),
                Some(span.pos),
                Some(span.line),
                Some(span.col),
            )
        })
    }
}

/// Bool は数値文脈で Int として振る舞う。
fn coerce_bool(ty: &Type) -> Type {
    if matches!(ty, Type::Bool) {
        Type::Int
    } else {
        ty.clone()
    }
}

fn is_numeric(ty: &Type) -> bool {
    matches!(ty, Type::Int | Type::BigInt | Type::Float)
}

fn is_integral(ty: &Type) -> bool {
    matches!(ty, Type::Int | Type::BigInt)
}

/// 数値の昇格規則: Float > BigInt > Int。
fn numeric_join(a: &Type, b: &Type) -> Type {
    if matches!(a, Type::Float) || matches!(b, Type::Float) {
        Type::Float
    } else if matches!(a, Type::BigInt) || matches!(b, Type::BigInt) {
        Type::BigInt
    } else {
        Type::Int
    }
}

/// 反復対象から要素型を取り出す。
fn element_type(iter_ty: &Type) -> Type {
    match iter_ty {
        Type::List(t) | Type::Set(t) | Type::Generator(t) => (**t).clone(),
        Type::Dict(k, _) => (**k).clone(),
        Type::Str => Type::Str,
        Type::Bytes => Type::Int,
        Type::Tuple(items) => items
            .iter()
            .fold(Type::Unknown, |acc, t| join(&acc, t)),
        Type::Unknown => Type::Unknown,
        _ => Type::Any,
    }
}

/// 添字参照の結果型。
fn subscript_type(obj_ty: &Type, _idx_ty: &Type, index: &Expr, is_slice: bool) -> Type {
    if is_slice {
        return match obj_ty {
            Type::List(_) | Type::Str | Type::Bytes => obj_ty.clone(),
            Type::Unknown => Type::Unknown,
            _ => Type::Any,
        };
    }
    match obj_ty {
        Type::List(t) => (**t).clone(),
        Type::Dict(_, v) => (**v).clone(),
        Type::Str => Type::Str,
        Type::Bytes => Type::Int,
        Type::Tuple(items) => {
            if let Expr::IntLit { value, .. } = index {
                let idx = *value as usize;
                if idx < items.len() {
                    return items[idx].clone();
                }
            }
            items.iter().fold(Type::Unknown, |acc, t| join(&acc, t))
        }
        Type::Unknown => Type::Unknown,
        _ => Type::Any,
    }
}

/// コンテナ・文字列メソッドの戻り値型表。
fn container_method_type(obj_ty: &Type, name: &str, args: &[Type]) -> Type {
    match (obj_ty, name) {
        (Type::List(t), "pop") => (**t).clone(),
        (Type::List(_), "index" | "count") => Type::Int,
        (Type::List(_), "copy") | (Type::List(_), "sorted") => obj_ty.clone(),
        (Type::List(_), _) if MUTATING_METHODS.contains(&name) => Type::NoneT,
        (Type::Dict(k, _), "keys") => Type::List(k.clone()),
        (Type::Dict(_, v), "values") => Type::List(v.clone()),
        (Type::Dict(k, v), "items") => {
            Type::List(Box::new(Type::Tuple(vec![(**k).clone(), (**v).clone()])))
        }
        (Type::Dict(_, v), "get" | "pop" | "setdefault") => match args.get(1) {
            Some(default) => join(v, default),
            None => (**v).clone(),
        },
        (Type::Dict(_, _), _) if MUTATING_METHODS.contains(&name) => Type::NoneT,
        (Type::Set(_), _) if MUTATING_METHODS.contains(&name) => Type::NoneT,
        (Type::Str, "split" | "splitlines") => Type::List(Box::new(Type::Str)),
        (Type::Str, "encode") => Type::Bytes,
        (Type::Str, "startswith" | "endswith" | "isdigit" | "isalpha") => Type::Bool,
        (Type::Str, "find" | "count" | "index") => Type::Int,
        (Type::Str, _) => Type::Str,
        (Type::Bytes, "decode") => Type::Str,
        _ => Type::Any,
    }
}

/// 式の中に現れる名前を列挙する（ラムダの捕獲解析用）。
fn collect_names(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Name { name, .. } => out.push(name.clone()),
        Expr::BinOp { left, right, .. }
        | Expr::Compare { left, right, .. }
        | Expr::BoolOp { left, right, .. } => {
            collect_names(left, out);
            collect_names(right, out);
        }
        Expr::UnaryOp { operand, .. } => collect_names(operand, out),
        Expr::Call { func, args, .. } => {
            collect_names(func, out);
            for a in args {
                collect_names(a, out);
            }
        }
        Expr::Attribute { obj, .. } => collect_names(obj, out),
        Expr::Subscript { obj, index, .. } => {
            collect_names(obj, out);
            collect_names(index, out);
        }
        Expr::IfExp {
            cond,
            then_branch,
            else_branch,
            ..
        } => {
            collect_names(cond, out);
            collect_names(then_branch, out);
            collect_names(else_branch, out);
        }
        Expr::ListLit { items, .. } | Expr::TupleLit { items, .. } | Expr::SetLit { items, .. } => {
            for i in items {
                collect_names(i, out);
            }
        }
        _ => {}
    }
}

/// 分岐合流で環境同士を join する。片側にしか無い変数はその型を残す。
fn join_envs(a: &Env, b: &Env) -> Env {
    let mut out = a.clone();
    for (name, ty) in b {
        let entry = out.entry(name.clone()).or_insert(Type::Unknown);
        *entry = join(entry, ty);
    }
    out
}
