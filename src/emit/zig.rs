// パス: src/emit/zig.rs
// 役割: 推論済みモジュールからターゲット言語（Zig）ソースを生成する
// 意図: コード形状の選択を関数特性の純関数として実装する
// 関連ファイル: src/emit/mod.rs, src/infer/mod.rs, runtime_native/src/lib.rs
//! Zig バックエンド
//!
//! 形状の選択規則:
//! - 具象型のみ・await なし・generator なし → 素朴な型付き関数。
//!   `can_fail` なら Zig のエラーユニオンで返す。
//! - `is_generator` → `next()` を持つ状態機械構造体。
//! - `may_await ∧ does_io` → await 点ごとに中断する状態機械。再開はイベント
//!   ループが駆動する。
//! - `may_await ∧ ¬does_io` → ワーカープールへ載せる素朴な関数 + タスク包み。
//! - 閉じたクラス → レコード構造体 + self を先頭引数に取る自由関数。
//! - 開いたクラス → 動的属性辞書を持つボックス表現。
//! - −5..256 の整数リテラルのボックス化はランタイムのインターン表を参照する。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::ast::{BinOpKind, CmpOpKind, Expr, FStringPart, Stmt, UnaryOpKind};
use crate::infer::{FuncInfo, ModuleInfo, MAIN_KEY};
use crate::typesys::{ClassId, Type};

use super::{EmitError, EmitResult, EmittedModule, LineMapEntry};

/// 組み込み例外クラスのタグ。ユーザ定義クラスは 100 + ClassId を使う。
const BUILTIN_EXCEPTIONS: &[(&str, i64)] = &[
    ("Exception", 1),
    ("ValueError", 2),
    ("TypeError", 3),
    ("IndexError", 4),
    ("KeyError", 5),
    ("RuntimeError", 6),
    ("StopIteration", 7),
    ("ZeroDivisionError", 8),
    ("Cancelled", 9),
];

/// ランタイム ABI の extern 宣言と共通定義。生成ソースの先頭に置かれる。
const PRELUDE: &str = r#"const std = @import("std");
pub const PyObj = ?*anyopaque;
pub const PyErr = error{PyExc};
pub const PY_PENDING: i32 = 0;
pub const PY_READY: i32 = 1;

extern fn py_rt_init() void;
extern fn py_rt_shutdown() void;
extern fn py_alloc(size: usize) ?*anyopaque;
extern fn py_retain(v: PyObj) void;
extern fn py_release(v: PyObj) void;
extern fn py_none() PyObj;
extern fn py_small_int(v: i64) PyObj;
extern fn py_int_box(v: i64) PyObj;
extern fn py_int_unbox(v: PyObj) i64;
extern fn py_float_box(v: f64) PyObj;
extern fn py_float_unbox(v: PyObj) f64;
extern fn py_bool_box(v: bool) PyObj;
extern fn py_bool_unbox(v: PyObj) bool;
extern fn py_obj_tag(v: PyObj) i64;
extern fn py_truthy(v: PyObj) bool;
extern fn py_str_new(ptr: [*]const u8, len: usize) PyObj;
extern fn py_str_concat(a: PyObj, b: PyObj) PyObj;
extern fn py_str_repeat(s: PyObj, n: i64) PyObj;
extern fn py_str_len(s: PyObj) i64;
extern fn py_str_eq(a: PyObj, b: PyObj) bool;
extern fn py_str_index(s: PyObj, i: i64) PyObj;
extern fn py_to_str(v: PyObj) PyObj;
extern fn py_strbuf_new() PyObj;
extern fn py_strbuf_push(sb: PyObj, v: PyObj) void;
extern fn py_strbuf_finish(sb: PyObj) PyObj;
extern fn py_list_new(cap: i64) PyObj;
extern fn py_list_append(l: PyObj, v: PyObj) void;
extern fn py_list_get(l: PyObj, i: i64) PyObj;
extern fn py_list_set(l: PyObj, i: i64, v: PyObj) void;
extern fn py_list_len(l: PyObj) i64;
extern fn py_list_concat(a: PyObj, b: PyObj) PyObj;
extern fn py_list_pop(l: PyObj) PyObj;
extern fn py_list_contains(l: PyObj, v: PyObj) bool;
extern fn py_tuple_new(n: i64) PyObj;
extern fn py_tuple_set(t: PyObj, i: i64, v: PyObj) void;
extern fn py_tuple_get(t: PyObj, i: i64) PyObj;
extern fn py_dict_new() PyObj;
extern fn py_dict_set(d: PyObj, k: PyObj, v: PyObj) void;
extern fn py_dict_get(d: PyObj, k: PyObj) PyObj;
extern fn py_dict_len(d: PyObj) i64;
extern fn py_dict_contains(d: PyObj, k: PyObj) bool;
extern fn py_set_new() PyObj;
extern fn py_set_add(s: PyObj, v: PyObj) void;
extern fn py_set_len(s: PyObj) i64;
extern fn py_set_contains(s: PyObj, v: PyObj) bool;
extern fn py_obj_new_dynamic(class_tag: i64) PyObj;
extern fn py_attr_get(o: PyObj, name: [*]const u8, len: usize) PyObj;
extern fn py_attr_set(o: PyObj, name: [*]const u8, len: usize, v: PyObj) void;
extern fn py_attr_has(o: PyObj, name: [*]const u8, len: usize) bool;
extern fn py_obj_eq(a: PyObj, b: PyObj) bool;
extern fn py_bigint_from_str(ptr: [*]const u8, len: usize) PyObj;
extern fn py_bigint_add(a: PyObj, b: PyObj) PyObj;
extern fn py_bigint_sub(a: PyObj, b: PyObj) PyObj;
extern fn py_bigint_mul(a: PyObj, b: PyObj) PyObj;
extern fn py_bigint_cmp(a: PyObj, b: PyObj) i32;
extern fn py_print_obj(v: PyObj) void;
extern fn py_print_int(v: i64) void;
extern fn py_print_float(v: f64) void;
extern fn py_print_bool(v: bool) void;
extern fn py_print_none() void;
extern fn py_exc_set(class_tag: i64, msg: PyObj) void;
extern fn py_exc_set_cause(cause_tag: i64) void;
extern fn py_exc_class() i64;
extern fn py_exc_clear() void;
extern fn py_exc_reraise() void;
extern fn py_exc_print() void;
extern fn py_task_new(poll_fn: *const fn (*anyopaque) callconv(.C) i32, ctx: *anyopaque) PyObj;
extern fn py_task_result(task: PyObj) PyObj;
extern fn py_task_set_result(task: PyObj, v: PyObj) void;
extern fn py_task_wait_timer(task: PyObj, ms: i64) void;
extern fn py_task_wait_child(task: PyObj, child: PyObj) void;
extern fn py_task_cancelled(task: PyObj) bool;
extern fn py_sched_spawn(task: PyObj) void;
extern fn py_sched_block_on(task: PyObj) PyObj;
extern fn py_sched_gather(tasks: PyObj) PyObj;
extern fn py_pool_spawn(poll_fn: *const fn (*anyopaque) callconv(.C) i32, ctx: *anyopaque) PyObj;
extern fn py_task_current() PyObj;
"#;

/// 生成中の式 1 つ分。Zig のコード片と推論済みの型を対で持つ。
#[derive(Clone, Debug)]
struct Val {
    code: String,
    ty: Type,
}

impl Val {
    fn new(code: impl Into<String>, ty: Type) -> Self {
        Self {
            code: code.into(),
            ty,
        }
    }
}

/// try/except の守られた領域を表す文脈。
#[derive(Clone, Debug)]
struct GuardCtx {
    flag: String,
    label: String,
}

/// 関数 1 つ分の生成文脈。
struct FnCtx<'a> {
    key: String,
    locals: &'a BTreeMap<String, Type>,
    /// 既に宣言済みのローカル名。
    declared: BTreeSet<String>,
    /// 2 回以上代入される名前（var で宣言する）。
    reassigned: BTreeSet<String>,
    params: BTreeSet<String>,
    ret: Type,
    can_fail: bool,
    guard: Option<GuardCtx>,
    /// 状態機械のフィールドとして参照するローカル（`self.` 前置）。
    hoisted: bool,
}

struct ZigEmitter<'a> {
    info: &'a ModuleInfo,
    source_file: &'a str,
    out: String,
    line: usize,
    line_map: Vec<LineMapEntry>,
    tmp: usize,
}

/// モジュール 1 つを Zig ソースへ変換するエントリポイント。
pub fn emit(info: &ModuleInfo, source_file: &str) -> EmitResult<EmittedModule> {
    let mut e = ZigEmitter {
        info,
        source_file,
        out: String::new(),
        line: 1,
        line_map: Vec::new(),
        tmp: 0,
    };
    e.emit_module()?;
    Ok(EmittedModule {
        source: e.out,
        line_map: e.line_map,
    })
}

impl<'a> ZigEmitter<'a> {
    fn emit_module(&mut self) -> EmitResult<()> {
        self.push_raw(PRELUDE);
        self.blank();

        // 閉じたクラスのレコード構造体
        for (id, layout) in self.info.classes.iter() {
            if layout.open {
                continue;
            }
            self.push(0, &format!("const Obj_{} = extern struct {{", layout.name), None);
            self.push(1, "refcount: i64,", None);
            self.push(1, "class_tag: i64,", None);
            for attr in &layout.attrs {
                self.push(
                    1,
                    &format!("{}: {},", field_name(&attr.name), zig_ty_or_obj(&attr.ty)),
                    None,
                );
            }
            self.push(0, "};", None);
            self.blank();
        }

        // モジュール変数（トップレベル文のローカル）
        for (name, ty) in &self.info.main_locals {
            self.push(
                0,
                &format!("var g_{}: {} = undefined;", sanitize(name), zig_ty_or_obj(ty)),
                None,
            );
        }
        if !self.info.main_locals.is_empty() {
            self.blank();
        }

        // 関数本体
        let keys: Vec<String> = self.info.functions.keys().cloned().collect();
        for key in keys {
            let func = self.info.functions[&key].clone();
            self.emit_function(&key, &func)?;
            self.blank();
        }

        // トップレベル文 → py_module_main
        self.emit_main_block()?;

        // エントリポイント
        self.push(0, "pub fn main() void {", None);
        self.push(1, "py_rt_init();", None);
        self.push(1, "defer py_rt_shutdown();", None);
        self.push(1, "py_module_main() catch {", None);
        self.push(2, "py_exc_print();", None);
        self.push(2, "std.process.exit(1);", None);
        self.push(1, "};", None);
        self.push(0, "}", None);
        Ok(())
    }

    /// 特性からコード形状を選び、関数 1 つを生成する。
    fn emit_function(&mut self, key: &str, func: &FuncInfo) -> EmitResult<()> {
        if func.traits.is_generator {
            return self.emit_generator(key, func);
        }
        if func.traits.may_await && func.traits.does_io {
            return self.emit_async_state_machine(key, func);
        }
        if func.traits.may_await {
            // CPU バウンドの async はプール実行。状態機械は作らない
            self.emit_plain_function(key, func, true)?;
            return self.emit_pool_task_wrapper(key, func);
        }
        self.emit_plain_function(key, func, false)
    }

    /// 素朴な型付き関数を生成する。
    fn emit_plain_function(
        &mut self,
        key: &str,
        func: &FuncInfo,
        strip_async: bool,
    ) -> EmitResult<()> {
        let name = mangle(key);
        let mut ctx = self.fn_ctx(key, func);
        let mut sig = String::new();
        let _ = write!(sig, "fn {name}(");
        let mut shadowed: Vec<(String, String)> = Vec::new();
        for (idx, param) in func.decl.params.iter().enumerate() {
            if idx > 0 {
                sig.push_str(", ");
            }
            let ty = self.param_zig_ty(func, idx);
            // 本体で再代入される仮引数は可変なシャドウ変数で受ける
            if ctx.reassigned.contains(&param.name) {
                let _ = write!(sig, "v_{}_arg: {}", sanitize(&param.name), ty);
                shadowed.push((sanitize(&param.name), ty.clone()));
            } else {
                let _ = write!(sig, "v_{}: {}", sanitize(&param.name), ty);
            }
        }
        let ret_ty = if strip_async {
            match &func.sig.ret {
                Type::Coro(inner) => (**inner).clone(),
                other => other.clone(),
            }
        } else {
            func.sig.ret.clone()
        };
        ctx.ret = ret_ty.clone();
        let ret_text = zig_ty_or_obj(&ret_ty);
        if ctx.can_fail {
            let _ = write!(sig, ") PyErr!{ret_text} {{");
        } else {
            let _ = write!(sig, ") {ret_text} {{");
        }
        let src_line = func.decl.body.first().map(|s| s.span().line);
        self.push(0, &sig, src_line);
        for (name, ty) in &shadowed {
            self.push(1, &format!("var v_{name}: {ty} = v_{name}_arg;"), None);
        }
        let body = func.decl.body.clone();
        self.emit_block(&mut ctx, &body, 1)?;
        // void 関数は末尾到達で暗黙に戻る。それ以外は既定値を返して型を満たす
        if needs_trailing_return(&body) && !matches!(ret_ty, Type::NoneT) {
            self.push(1, &format!("return {};", default_value(&ret_ty)), None);
        }
        self.push(0, "}", None);
        Ok(())
    }

    /// CPU バウンド async のタスク包みを生成する。
    /// タスクは値としてチャネル越しにワーカーへ移動する。
    fn emit_pool_task_wrapper(&mut self, key: &str, func: &FuncInfo) -> EmitResult<()> {
        let name = mangle(key);
        let struct_name = format!("PoolCtx_{name}");
        self.blank();
        self.push(0, &format!("const {struct_name} = extern struct {{"), None);
        for (idx, param) in func.decl.params.iter().enumerate() {
            let ty = self.param_zig_ty(func, idx);
            self.push(1, &format!("v_{}: {},", sanitize(&param.name), ty), None);
        }
        self.push(0, "};", None);
        self.push(
            0,
            &format!("fn {name}_pool_poll(ctx: *anyopaque) callconv(.C) i32 {{"),
            None,
        );
        self.push(
            1,
            &format!("const c: *{struct_name} = @ptrCast(@alignCast(ctx));"),
            None,
        );
        let args: Vec<String> = func
            .decl
            .params
            .iter()
            .map(|p| format!("c.v_{}", sanitize(&p.name)))
            .collect();
        let inner_ret = match &func.sig.ret {
            Type::Coro(inner) => (**inner).clone(),
            other => other.clone(),
        };
        let call = if func.traits.can_fail {
            format!("{name}({}) catch return PY_READY", args.join(", "))
        } else {
            format!("{name}({})", args.join(", "))
        };
        let boxed = box_code(&format!("({call})"), &inner_ret);
        // 結果はワーカー上の現在タスクへ書く
        self.push(
            1,
            &format!("py_task_set_result(py_task_current(), {boxed});"),
            None,
        );
        self.push(1, "return PY_READY;", None);
        self.push(0, "}", None);
        self.push(
            0,
            &format!("fn {name}_task_new(args: *{struct_name}) PyObj {{"),
            None,
        );
        self.push(
            1,
            &format!("return py_pool_spawn({name}_pool_poll, @ptrCast(args));"),
            None,
        );
        self.push(0, "}", None);
        Ok(())
    }

    /// トップレベル文を束ねた py_module_main を生成する。
    fn emit_main_block(&mut self) -> EmitResult<()> {
        let mut ctx = FnCtx {
            key: MAIN_KEY.to_string(),
            locals: &self.info.main_locals,
            declared: self.info.main_locals.keys().cloned().collect(),
            reassigned: BTreeSet::new(),
            params: BTreeSet::new(),
            ret: Type::NoneT,
            can_fail: true,
            guard: None,
            hoisted: false,
        };
        self.push(0, "fn py_module_main() PyErr!void {", None);
        let body = self.info.main_body.clone();
        self.emit_block(&mut ctx, &body, 1)?;
        self.push(0, "}", None);
        self.blank();
        Ok(())
    }

    fn fn_ctx<'b>(&self, key: &str, func: &'b FuncInfo) -> FnCtx<'b> {
        let mut reassigned = BTreeSet::new();
        let mut seen = BTreeSet::new();
        count_assignments(&func.decl.body, &mut seen, &mut reassigned);
        // 仮引数への代入は 1 回でも「再代入」扱い（シャドウ変数が要る）
        for p in &func.decl.params {
            if seen.contains(&p.name) {
                reassigned.insert(p.name.clone());
            }
        }
        FnCtx {
            key: key.to_string(),
            locals: &func.locals,
            declared: BTreeSet::new(),
            reassigned,
            params: func
                .decl
                .params
                .iter()
                .map(|p| p.name.clone())
                .collect(),
            ret: func.sig.ret.clone(),
            can_fail: func.traits.can_fail,
            guard: None,
            hoisted: false,
        }
    }

    fn param_zig_ty(&self, func: &FuncInfo, idx: usize) -> String {
        let ty = &func.sig.params[idx];
        // メソッドのレシーバは所属クラスのレコードポインタ
        if idx == 0 && func.decl.class_id.is_some() {
            if let Type::Object(id) = ty {
                return self.object_ptr_ty(*id);
            }
        }
        zig_ty_or_obj(ty)
    }

    fn object_ptr_ty(&self, id: ClassId) -> String {
        let layout = self.info.classes.get(id);
        if layout.open {
            "PyObj".to_string()
        } else {
            format!("*Obj_{}", layout.name)
        }
    }

    // ---- 文の生成 ----

    fn emit_block(&mut self, ctx: &mut FnCtx, body: &[Stmt], indent: usize) -> EmitResult<()> {
        for stmt in body {
            self.emit_stmt(ctx, stmt, indent)?;
        }
        Ok(())
    }

    fn emit_stmt(&mut self, ctx: &mut FnCtx, stmt: &Stmt, indent: usize) -> EmitResult<()> {
        let src_line = Some(stmt.span().line);
        match stmt {
            Stmt::Assign { target, value, .. } => self.emit_assign(ctx, target, value, indent),
            Stmt::ExprStmt { value, .. } => {
                let v = self.emit_expr(ctx, value, indent)?;
                if matches!(v.ty, Type::NoneT) {
                    self.push(indent, &format!("{};", v.code), src_line);
                } else {
                    self.push(indent, &format!("_ = {};", v.code), src_line);
                }
                Ok(())
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(v) => {
                        let val = self.emit_expr(ctx, v, indent)?;
                        if matches!(ctx.ret, Type::NoneT) {
                            // 副作用だけ残して値は捨てる
                            if matches!(val.ty, Type::NoneT) {
                                self.push(indent, &format!("{};", val.code), src_line);
                            } else {
                                self.push(indent, &format!("_ = {};", val.code), src_line);
                            }
                            self.push(indent, "return;", None);
                        } else {
                            let coerced = coerce(&val, &ctx.ret);
                            self.push(indent, &format!("return {coerced};"), src_line);
                        }
                    }
                    None => {
                        if matches!(ctx.ret, Type::NoneT) {
                            self.push(indent, "return;", src_line);
                        } else {
                            self.push(
                                indent,
                                &format!("return {};", default_value(&ctx.ret)),
                                src_line,
                            );
                        }
                    }
                }
                Ok(())
            }
            Stmt::Raise { exc, cause, .. } => self.emit_raise(ctx, exc, cause, indent, src_line),
            Stmt::If {
                cond, body, orelse, ..
            } => {
                let c = self.emit_expr(ctx, cond, indent)?;
                self.push(indent, &format!("if ({}) {{", truthy(&c)), src_line);
                self.emit_block(ctx, body, indent + 1)?;
                if orelse.is_empty() {
                    self.push(indent, "}", None);
                } else {
                    self.push(indent, "} else {", None);
                    self.emit_block(ctx, orelse, indent + 1)?;
                    self.push(indent, "}", None);
                }
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                let c = self.emit_expr(ctx, cond, indent)?;
                self.push(indent, &format!("while ({}) {{", truthy(&c)), src_line);
                self.emit_block(ctx, body, indent + 1)?;
                self.push(indent, "}", None);
                Ok(())
            }
            Stmt::For {
                target, iter, body, ..
            } => self.emit_for(ctx, target, iter, body, indent, src_line),
            Stmt::Try {
                body,
                handlers,
                orelse,
                finally,
                ..
            } => self.emit_try(ctx, body, handlers, orelse, finally, indent, src_line),
            Stmt::Pass { .. } => Ok(()),
            Stmt::Break { .. } => {
                self.push(indent, "break;", src_line);
                Ok(())
            }
            Stmt::Continue { .. } => {
                self.push(indent, "continue;", src_line);
                Ok(())
            }
            Stmt::Global { .. } | Stmt::Import { .. } | Stmt::ImportFrom { .. } => Ok(()),
            Stmt::FuncDef { name, .. } | Stmt::ClassDef { name, .. } => Err(EmitError::internal(
                "EMIT001",
                format!("ネスト定義 {name} が推論を通過しました"),
            )),
        }
    }

    fn emit_assign(
        &mut self,
        ctx: &mut FnCtx,
        target: &Expr,
        value: &Expr,
        indent: usize,
    ) -> EmitResult<()> {
        let src_line = Some(target.span().line);
        match target {
            Expr::Name { name, .. } => {
                let val = self.emit_expr(ctx, value, indent)?;
                let slot_ty = self.name_type(ctx, name);
                let coerced = coerce(&val, &slot_ty);
                let var = self.name_ref(ctx, name);
                if ctx.declared.contains(name) || ctx.params.contains(name) || ctx.hoisted {
                    self.push(indent, &format!("{var} = {coerced};"), src_line);
                } else {
                    ctx.declared.insert(name.clone());
                    let kw = if ctx.reassigned.contains(name) {
                        "var"
                    } else {
                        "const"
                    };
                    self.push(
                        indent,
                        &format!("{kw} {var}: {} = {coerced};", zig_ty_or_obj(&slot_ty)),
                        src_line,
                    );
                }
                Ok(())
            }
            Expr::Attribute { obj, name, .. } => {
                let o = self.emit_expr(ctx, obj, indent)?;
                let val = self.emit_expr(ctx, value, indent)?;
                match &o.ty {
                    Type::Object(id) if !self.info.classes.get(*id).open => {
                        let slot = self
                            .info
                            .classes
                            .get(*id)
                            .attr(name)
                            .ok_or_else(|| {
                                EmitError::internal(
                                    "EMIT002",
                                    format!("閉じたクラスに無い属性 {name} への代入"),
                                )
                            })?
                            .ty
                            .clone();
                        self.push(
                            indent,
                            &format!("{}.{} = {};", o.code, field_name(name), coerce(&val, &slot)),
                            src_line,
                        );
                    }
                    _ => {
                        let boxed = box_val(&val);
                        self.push(
                            indent,
                            &format!(
                                "py_attr_set({}, \"{}\", {}, {});",
                                o.code,
                                name,
                                name.len(),
                                boxed
                            ),
                            src_line,
                        );
                    }
                }
                Ok(())
            }
            Expr::Subscript { obj, index, .. } => {
                let o = self.emit_expr(ctx, obj, indent)?;
                let i = self.emit_expr(ctx, index, indent)?;
                let val = self.emit_expr(ctx, value, indent)?;
                let boxed = box_val(&val);
                match &o.ty {
                    Type::List(_) => {
                        self.push(
                            indent,
                            &format!("py_list_set({}, {}, {});", o.code, coerce(&i, &Type::Int), boxed),
                            src_line,
                        );
                    }
                    Type::Dict(_, _) => {
                        self.push(
                            indent,
                            &format!("py_dict_set({}, {}, {});", o.code, box_val(&i), boxed),
                            src_line,
                        );
                    }
                    _ => {
                        self.push(
                            indent,
                            &format!("py_dict_set({}, {}, {});", o.code, box_val(&i), boxed),
                            src_line,
                        );
                    }
                }
                Ok(())
            }
            Expr::TupleLit { items, .. } => {
                let val = self.emit_expr(ctx, value, indent)?;
                let tmp = self.fresh_tmp();
                self.push(indent, &format!("const {tmp} = {};", box_val(&val)), src_line);
                for (idx, item) in items.iter().enumerate() {
                    let Expr::Name { name, .. } = item else {
                        return Err(EmitError::internal(
                            "EMIT004",
                            "タプル分解の要素が名前以外でした",
                        ));
                    };
                    let slot_ty = self.name_type(ctx, name);
                    let elem = Val::new(format!("py_tuple_get({tmp}, {idx})"), Type::Any);
                    let final_code = coerce(&elem, &slot_ty);
                    let var = self.name_ref(ctx, name);
                    if ctx.declared.contains(name) || ctx.hoisted {
                        self.push(indent, &format!("{var} = {final_code};"), src_line);
                    } else {
                        ctx.declared.insert(name.clone());
                        let kw = if ctx.reassigned.contains(name) {
                            "var"
                        } else {
                            "const"
                        };
                        self.push(
                            indent,
                            &format!("{kw} {var}: {} = {final_code};", zig_ty_or_obj(&slot_ty)),
                            src_line,
                        );
                    }
                }
                Ok(())
            }
            other => Err(EmitError::internal(
                "EMIT003",
                format!("代入先にできない式が推論を通過しました: {other}"),
            )),
        }
    }

    fn emit_raise(
        &mut self,
        ctx: &mut FnCtx,
        exc: &Option<Expr>,
        cause: &Option<Expr>,
        indent: usize,
        src_line: Option<usize>,
    ) -> EmitResult<()> {
        if let Some(cause_expr) = cause {
            if let Some(tag) = self.exception_tag(cause_expr) {
                self.push(indent, &format!("py_exc_set_cause({tag});"), src_line);
            }
        }
        match exc {
            Some(e) => {
                if let Some(tag) = self.exception_tag(e) {
                    let msg = match e {
                        Expr::Call { args, .. } => match args.first() {
                            Some(m) => {
                                let v = self.emit_expr(ctx, m, indent)?;
                                box_val(&v)
                            }
                            None => "py_none()".to_string(),
                        },
                        _ => "py_none()".to_string(),
                    };
                    self.push(indent, &format!("py_exc_set({tag}, {msg});"), src_line);
                } else {
                    // 束縛済みの例外値の再送出
                    self.push(indent, "py_exc_reraise();", src_line);
                }
            }
            None => self.push(indent, "py_exc_reraise();", src_line),
        }
        self.emit_fail(ctx, indent);
        Ok(())
    }

    /// 失敗を伝播させる。守られた領域内ではハンドラへ脱出する。
    fn emit_fail(&mut self, ctx: &FnCtx, indent: usize) {
        match &ctx.guard {
            Some(g) => {
                self.push(indent, &format!("{} = true;", g.flag), None);
                self.push(indent, &format!("break :{};", g.label), None);
            }
            None => self.push(indent, "return error.PyExc;", None),
        }
    }

    /// 例外クラス式からタグ定数を引く。
    fn exception_tag(&self, e: &Expr) -> Option<i64> {
        let name = match e {
            Expr::Call { func, .. } => match func.as_ref() {
                Expr::Name { name, .. } => name,
                _ => return None,
            },
            Expr::Name { name, .. } => name,
            _ => return None,
        };
        if let Some((_, tag)) = BUILTIN_EXCEPTIONS.iter().find(|(n, _)| n == name) {
            return Some(*tag);
        }
        self.info
            .classes
            .id_of(name)
            .map(|id| 100 + id as i64)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_try(
        &mut self,
        ctx: &mut FnCtx,
        body: &[Stmt],
        handlers: &[crate::ast::ExceptHandler],
        orelse: &[Stmt],
        finally: &[Stmt],
        indent: usize,
        src_line: Option<usize>,
    ) -> EmitResult<()> {
        let n = self.fresh_id();
        let flag = format!("_caught{n}");
        let label = format!("guard{n}");
        self.push(indent, &format!("var {flag} = false;"), src_line);
        self.push(indent, &format!("{label}: {{"), None);
        let saved = ctx.guard.replace(GuardCtx {
            flag: flag.clone(),
            label: label.clone(),
        });
        self.emit_block(ctx, body, indent + 1)?;
        ctx.guard = saved;
        self.push(indent, "}", None);
        self.push(indent, &format!("if ({flag}) {{", ), None);
        let cls = format!("_cls{n}");
        self.push(indent + 1, &format!("const {cls} = py_exc_class();"), None);
        let mut first = true;
        let mut has_catch_all = false;
        for h in handlers {
            let head = match &h.class_name {
                Some(name) => {
                    let tag = self.exception_tag(&Expr::Name {
                        name: name.clone(),
                        span: h.span,
                    });
                    match tag {
                        Some(tag) => {
                            // クラス ID によるマッチ。タグ一致で分岐する
                            if first {
                                format!("if ({cls} == {tag}) {{")
                            } else {
                                format!("}} else if ({cls} == {tag}) {{")
                            }
                        }
                        None => {
                            return Err(EmitError::unsupported(
                                "EMIT010",
                                format!("except 節の {name} を例外クラスに解決できません"),
                            ));
                        }
                    }
                }
                None => {
                    has_catch_all = true;
                    if first {
                        "if (true) {".to_string()
                    } else {
                        "} else {".to_string()
                    }
                }
            };
            self.push(indent + 1, &head, None);
            first = false;
            self.push(indent + 2, "py_exc_clear();", None);
            if let Some(bind) = &h.bind_name {
                // 例外値の束縛は動的表現で受ける
                let var = self.name_ref(ctx, bind);
                if !ctx.declared.contains(bind) && !ctx.hoisted {
                    ctx.declared.insert(bind.clone());
                    self.push(indent + 2, &format!("const {var}: PyObj = py_none();"), None);
                    self.push(indent + 2, &format!("_ = {var};"), None);
                }
            }
            self.emit_block(ctx, &h.body, indent + 2)?;
        }
        if !first {
            if !has_catch_all {
                // どの節にも一致しない例外は伝播する
                self.push(indent + 1, "} else {", None);
                self.emit_fail(ctx, indent + 2);
            }
            self.push(indent + 1, "}", None);
        } else {
            self.emit_fail(ctx, indent + 1);
        }
        self.push(indent, "} else {", None);
        if !orelse.is_empty() {
            self.emit_block(ctx, orelse, indent + 1)?;
        }
        self.push(indent, "}", None);
        if !finally.is_empty() {
            self.emit_block(ctx, finally, indent)?;
        }
        Ok(())
    }

    fn emit_for(
        &mut self,
        ctx: &mut FnCtx,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        indent: usize,
        src_line: Option<usize>,
    ) -> EmitResult<()> {
        // range はカウンタループへ落とす
        if let Expr::Call { func, args, .. } = iter {
            if matches!(func.as_ref(), Expr::Name { name, .. } if name == "range") {
                let (start, stop, step) = match args.len() {
                    1 => (
                        "0".to_string(),
                        coerce(&self.emit_expr(ctx, &args[0], indent)?, &Type::Int),
                        "1".to_string(),
                    ),
                    2 => (
                        coerce(&self.emit_expr(ctx, &args[0], indent)?, &Type::Int),
                        coerce(&self.emit_expr(ctx, &args[1], indent)?, &Type::Int),
                        "1".to_string(),
                    ),
                    3 => (
                        coerce(&self.emit_expr(ctx, &args[0], indent)?, &Type::Int),
                        coerce(&self.emit_expr(ctx, &args[1], indent)?, &Type::Int),
                        coerce(&self.emit_expr(ctx, &args[2], indent)?, &Type::Int),
                    ),
                    _ => {
                        return Err(EmitError::unsupported(
                            "EMIT011",
                            "range の引数は 1〜3 個です",
                        ))
                    }
                };
                let Expr::Name { name, .. } = target else {
                    return Err(EmitError::unsupported(
                        "EMIT012",
                        "range ループのターゲットは名前のみ対応です",
                    ));
                };
                let var = self.name_ref(ctx, name);
                if ctx.hoisted || ctx.declared.contains(name) {
                    self.push(indent, &format!("{var} = {start};"), src_line);
                } else {
                    ctx.declared.insert(name.clone());
                    self.push(indent, &format!("var {var}: i64 = {start};"), src_line);
                }
                self.push(
                    indent,
                    &format!("while ({var} < {stop}) : ({var} += {step}) {{"),
                    None,
                );
                self.emit_block(ctx, body, indent + 1)?;
                self.push(indent, "}", None);
                return Ok(());
            }
        }
        let it = self.emit_expr(ctx, iter, indent)?;
        match &it.ty {
            Type::List(elem) => {
                let list_tmp = self.fresh_tmp();
                let idx_tmp = self.fresh_tmp();
                self.push(indent, &format!("const {list_tmp} = {};", it.code), src_line);
                self.push(indent, &format!("var {idx_tmp}: i64 = 0;"), None);
                self.push(
                    indent,
                    &format!(
                        "while ({idx_tmp} < py_list_len({list_tmp})) : ({idx_tmp} += 1) {{"
                    ),
                    None,
                );
                let Expr::Name { name, .. } = target else {
                    return Err(EmitError::unsupported(
                        "EMIT013",
                        "リストループのタプル分解は未対応です",
                    ));
                };
                let elem_val = Val::new(
                    format!("py_list_get({list_tmp}, {idx_tmp})"),
                    Type::Any,
                );
                let coerced = coerce(&elem_val, elem);
                let var = self.name_ref(ctx, name);
                if ctx.hoisted || ctx.declared.contains(name) {
                    self.push(indent + 1, &format!("{var} = {coerced};"), None);
                } else {
                    self.push(
                        indent + 1,
                        &format!("const {var}: {} = {coerced};", zig_ty_or_obj(elem)),
                        None,
                    );
                    ctx.declared.insert(name.clone());
                }
                self.emit_block(ctx, body, indent + 1)?;
                self.push(indent, "}", None);
                Ok(())
            }
            Type::Generator(elem) => {
                let gen_tmp = self.fresh_tmp();
                self.push(indent, &format!("const {gen_tmp} = {};", it.code), src_line);
                let Expr::Name { name, .. } = target else {
                    return Err(EmitError::unsupported(
                        "EMIT014",
                        "ジェネレータループのタプル分解は未対応です",
                    ));
                };
                let var = self.name_ref(ctx, name);
                self.push(
                    indent,
                    &format!("while ({gen_tmp}.next()) |{var}| {{"),
                    None,
                );
                ctx.declared.insert(name.clone());
                let _ = elem;
                self.emit_block(ctx, body, indent + 1)?;
                self.push(indent, "}", None);
                Ok(())
            }
            _ => Err(EmitError::unsupported(
                "EMIT015",
                format!("反復対象の型 {} は未対応です", it.ty),
            )),
        }
    }

    // ---- 式の生成 ----

    fn emit_expr(&mut self, ctx: &mut FnCtx, expr: &Expr, indent: usize) -> EmitResult<Val> {
        match expr {
            Expr::Name { name, .. } => {
                let ty = self.name_type(ctx, name);
                Ok(Val::new(self.name_ref(ctx, name), ty))
            }
            Expr::IntLit { value, .. } => Ok(Val::new(format!("{value}"), Type::Int)),
            Expr::BigIntLit { repr, .. } => Ok(Val::new(
                format!("py_bigint_from_str(\"{repr}\", {})", repr.len()),
                Type::BigInt,
            )),
            Expr::FloatLit { value, .. } => {
                let mut text = format!("{value}");
                if !text.contains('.') && !text.contains('e') {
                    text.push_str(".0");
                }
                Ok(Val::new(text, Type::Float))
            }
            Expr::StrLit { value, .. } => {
                let escaped = zig_escape(value);
                Ok(Val::new(
                    format!("py_str_new(\"{escaped}\", {})", value.len()),
                    Type::Str,
                ))
            }
            Expr::BytesLit { value, .. } => {
                let escaped: String = value.iter().map(|b| format!("\\x{b:02x}")).collect();
                Ok(Val::new(
                    format!("py_str_new(\"{escaped}\", {})", value.len()),
                    Type::Bytes,
                ))
            }
            Expr::BoolLit { value, .. } => Ok(Val::new(format!("{value}"), Type::Bool)),
            Expr::NoneLit { .. } => Ok(Val::new("py_none()", Type::NoneT)),
            Expr::FString { parts, .. } => self.emit_fstring(ctx, parts, indent),
            Expr::ListLit { items, .. } => {
                let mut body = format!("blk: {{ const l = py_list_new({});", items.len());
                let mut elem = Type::Unknown;
                for item in items {
                    let v = self.emit_expr(ctx, item, indent)?;
                    elem = crate::typesys::join(&elem, &v.ty);
                    let _ = write!(body, " py_list_append(l, {});", box_val(&v));
                }
                body.push_str(" break :blk l; }");
                if matches!(elem, Type::Unknown) {
                    elem = Type::Any;
                }
                Ok(Val::new(body, Type::List(Box::new(elem))))
            }
            Expr::TupleLit { items, .. } => {
                let mut body = format!("blk: {{ const t = py_tuple_new({});", items.len());
                let mut tys = Vec::new();
                for (idx, item) in items.iter().enumerate() {
                    let v = self.emit_expr(ctx, item, indent)?;
                    tys.push(v.ty.clone());
                    let _ = write!(body, " py_tuple_set(t, {idx}, {});", box_val(&v));
                }
                body.push_str(" break :blk t; }");
                Ok(Val::new(body, Type::Tuple(tys)))
            }
            Expr::DictLit { keys, values, .. } => {
                let mut body = "blk: { const d = py_dict_new();".to_string();
                let mut k_ty = Type::Unknown;
                let mut v_ty = Type::Unknown;
                for (k, v) in keys.iter().zip(values) {
                    let kv = self.emit_expr(ctx, k, indent)?;
                    let vv = self.emit_expr(ctx, v, indent)?;
                    k_ty = crate::typesys::join(&k_ty, &kv.ty);
                    v_ty = crate::typesys::join(&v_ty, &vv.ty);
                    let _ = write!(body, " py_dict_set(d, {}, {});", box_val(&kv), box_val(&vv));
                }
                body.push_str(" break :blk d; }");
                Ok(Val::new(
                    body,
                    Type::Dict(Box::new(k_ty), Box::new(v_ty)),
                ))
            }
            Expr::SetLit { items, .. } => {
                let mut body = "blk: { const s = py_set_new();".to_string();
                let mut elem = Type::Unknown;
                for item in items {
                    let v = self.emit_expr(ctx, item, indent)?;
                    elem = crate::typesys::join(&elem, &v.ty);
                    let _ = write!(body, " py_set_add(s, {});", box_val(&v));
                }
                body.push_str(" break :blk s; }");
                Ok(Val::new(body, Type::Set(Box::new(elem))))
            }
            Expr::BinOp {
                op, left, right, ..
            } => {
                let l = self.emit_expr(ctx, left, indent)?;
                let r = self.emit_expr(ctx, right, indent)?;
                self.emit_binop(*op, &l, &r)
            }
            Expr::Compare {
                op, left, right, ..
            } => {
                let l = self.emit_expr(ctx, left, indent)?;
                let r = self.emit_expr(ctx, right, indent)?;
                self.emit_compare(*op, &l, &r)
            }
            Expr::BoolOp {
                is_and,
                left,
                right,
                ..
            } => {
                let l = self.emit_expr(ctx, left, indent)?;
                let r = self.emit_expr(ctx, right, indent)?;
                if matches!(l.ty, Type::Bool) && matches!(r.ty, Type::Bool) {
                    let op = if *is_and { "and" } else { "or" };
                    return Ok(Val::new(format!("({} {op} {})", l.code, r.code), Type::Bool));
                }
                // 値を返す論理演算はボックス表現で合流させる
                let lb = box_val(&l);
                let rb = box_val(&r);
                let code = if *is_and {
                    format!("(if (py_truthy({lb})) {rb} else {lb})")
                } else {
                    format!("(if (py_truthy({lb})) {lb} else {rb})")
                };
                Ok(Val::new(code, Type::Any))
            }
            Expr::UnaryOp { op, operand, .. } => {
                let v = self.emit_expr(ctx, operand, indent)?;
                Ok(match op {
                    UnaryOpKind::Not => Val::new(format!("(!({}))", truthy(&v)), Type::Bool),
                    UnaryOpKind::Neg => Val::new(format!("(-({}))", v.code), v.ty.clone()),
                    UnaryOpKind::Pos => v,
                    UnaryOpKind::Invert => {
                        Val::new(format!("(~({}))", coerce(&v, &Type::Int)), Type::Int)
                    }
                })
            }
            Expr::Call { func, args, .. } => self.emit_call(ctx, func, args, indent),
            Expr::Attribute { obj, name, .. } => {
                let o = self.emit_expr(ctx, obj, indent)?;
                match &o.ty {
                    Type::Object(id) if !self.info.classes.get(*id).open => {
                        let slot = self.info.classes.get(*id).attr(name).cloned();
                        match slot {
                            Some(slot) => Ok(Val::new(
                                format!("{}.{}", o.code, field_name(name)),
                                slot.ty,
                            )),
                            None => Err(EmitError::internal(
                                "EMIT016",
                                format!("閉じたクラスに無い属性 {name} の参照"),
                            )),
                        }
                    }
                    _ => Ok(Val::new(
                        format!("py_attr_get({}, \"{name}\", {})", o.code, name.len()),
                        Type::Any,
                    )),
                }
            }
            Expr::Subscript { obj, index, .. } => {
                let o = self.emit_expr(ctx, obj, indent)?;
                if matches!(index.as_ref(), Expr::Slice { .. }) {
                    return Err(EmitError::unsupported(
                        "EMIT017",
                        "スライスの生成は未対応です",
                    ));
                }
                let i = self.emit_expr(ctx, index, indent)?;
                match &o.ty {
                    Type::List(elem) => {
                        let raw = Val::new(
                            format!("py_list_get({}, {})", o.code, coerce(&i, &Type::Int)),
                            Type::Any,
                        );
                        Ok(Val::new(coerce(&raw, elem), (**elem).clone()))
                    }
                    Type::Dict(_, v) => {
                        let raw = Val::new(
                            format!("py_dict_get({}, {})", o.code, box_val(&i)),
                            Type::Any,
                        );
                        Ok(Val::new(coerce(&raw, v), (**v).clone()))
                    }
                    Type::Str => Ok(Val::new(
                        format!("py_str_index({}, {})", o.code, coerce(&i, &Type::Int)),
                        Type::Str,
                    )),
                    Type::Tuple(tys) => {
                        let idx_lit = match index.as_ref() {
                            Expr::IntLit { value, .. } => *value,
                            _ => {
                                return Err(EmitError::unsupported(
                                    "EMIT018",
                                    "タプルの添字は定数のみ対応です",
                                ))
                            }
                        };
                        let elem_ty = tys
                            .get(idx_lit as usize)
                            .cloned()
                            .unwrap_or(Type::Any);
                        let raw = Val::new(
                            format!("py_tuple_get({}, {idx_lit})", o.code),
                            Type::Any,
                        );
                        Ok(Val::new(coerce(&raw, &elem_ty), elem_ty))
                    }
                    _ => {
                        let raw = Val::new(
                            format!("py_dict_get({}, {})", o.code, box_val(&i)),
                            Type::Any,
                        );
                        Ok(raw)
                    }
                }
            }
            Expr::ListComp {
                elt, generators, ..
            } => self.emit_list_comp(ctx, elt, generators, indent),
            Expr::IfExp {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                let c = self.emit_expr(ctx, cond, indent)?;
                let t = self.emit_expr(ctx, then_branch, indent)?;
                let e = self.emit_expr(ctx, else_branch, indent)?;
                if t.ty == e.ty {
                    let ty = t.ty.clone();
                    Ok(Val::new(
                        format!("(if ({}) {} else {})", truthy(&c), t.code, e.code),
                        ty,
                    ))
                } else {
                    Ok(Val::new(
                        format!("(if ({}) {} else {})", truthy(&c), box_val(&t), box_val(&e)),
                        Type::Any,
                    ))
                }
            }
            Expr::Await { .. } | Expr::Yield { .. } => Err(EmitError::unsupported(
                "EMIT019",
                "await / yield は状態機械の文脈でのみ生成できます",
            )),
            Expr::Lambda { .. } => Err(EmitError::unsupported(
                "EMIT020",
                "lambda のネイティブ生成は未対応です",
            )),
            Expr::SetComp { .. } | Expr::DictComp { .. } => Err(EmitError::unsupported(
                "EMIT021",
                "set/dict 内包のネイティブ生成は未対応です",
            )),
            Expr::Slice { .. } => Err(EmitError::unsupported(
                "EMIT017",
                "スライスの生成は未対応です",
            )),
        }
    }

    /// f-string を文字列ビルダ呼び出し列へ落とす。
    fn emit_fstring(
        &mut self,
        ctx: &mut FnCtx,
        parts: &[FStringPart],
        indent: usize,
    ) -> EmitResult<Val> {
        let mut body = "blk: { const sb = py_strbuf_new();".to_string();
        for part in parts {
            match part {
                FStringPart::Text(text) => {
                    let _ = write!(
                        body,
                        " py_strbuf_push(sb, py_str_new(\"{}\", {}));",
                        zig_escape(text),
                        text.len()
                    );
                }
                FStringPart::Interp(expr) => {
                    let v = self.emit_expr(ctx, expr, indent)?;
                    let _ = write!(body, " py_strbuf_push(sb, py_to_str({}));", box_val(&v));
                }
            }
        }
        body.push_str(" break :blk py_strbuf_finish(sb); }");
        Ok(Val::new(body, Type::Str))
    }

    /// リスト内包を容量予約つきのループへ落とす。
    fn emit_list_comp(
        &mut self,
        ctx: &mut FnCtx,
        elt: &Expr,
        generators: &[crate::ast::Comprehension],
        indent: usize,
    ) -> EmitResult<Val> {
        if generators.len() != 1 {
            return Err(EmitError::unsupported(
                "EMIT022",
                "多段の内包表記は未対応です",
            ));
        }
        let g = &generators[0];
        let Expr::Name { name: target, .. } = &g.target else {
            return Err(EmitError::unsupported(
                "EMIT023",
                "内包表記のタプル分解は未対応です",
            ));
        };
        let it = self.emit_expr(ctx, &g.iter, indent)?;
        let Type::List(elem_ty) = it.ty.clone() else {
            return Err(EmitError::unsupported(
                "EMIT024",
                format!("内包表記の反復対象の型 {} は未対応です", it.ty),
            ));
        };
        let n = self.fresh_id();
        let acc = format!("_comp{n}");
        let src = format!("_src{n}");
        let idx = format!("_i{n}");
        let var = format!("v_{}", sanitize(target));
        ctx.declared.insert(target.clone());
        let mut body = String::new();
        // 反復対象の長さが既知なのでその分の容量を先に確保する
        let _ = write!(
            body,
            "blk: {{ const {src} = {}; const {acc} = py_list_new(py_list_len({src})); var {idx}: i64 = 0; while ({idx} < py_list_len({src})) : ({idx} += 1) {{ const {var}: {} = ",
            it.code,
            zig_ty_or_obj(&elem_ty)
        );
        let raw = Val::new(format!("py_list_get({src}, {idx})"), Type::Any);
        let _ = write!(body, "{};", coerce(&raw, &elem_ty));
        for cond in &g.ifs {
            let c = self.emit_expr(ctx, cond, indent)?;
            let _ = write!(body, " if (!({})) continue;", truthy(&c));
        }
        let v = self.emit_expr(ctx, elt, indent)?;
        let _ = write!(body, " py_list_append({acc}, {});", box_val(&v));
        let _ = write!(body, " }} break :blk {acc}; }}");
        Ok(Val::new(body, Type::List(Box::new(v.ty))))
    }

    fn emit_binop(&mut self, op: BinOpKind, l: &Val, r: &Val) -> EmitResult<Val> {
        use BinOpKind::*;
        // 多倍長整数はランタイムの演算で処理する
        if matches!(l.ty, Type::BigInt) || matches!(r.ty, Type::BigInt) {
            let helper = match op {
                Add => "py_bigint_add",
                Sub => "py_bigint_sub",
                Mul => "py_bigint_mul",
                _ => {
                    return Err(EmitError::unsupported(
                        "EMIT025",
                        format!("多倍長整数の演算子 {} は未対応です", op.as_str()),
                    ))
                }
            };
            return Ok(Val::new(
                format!("{helper}({}, {})", big_val(l), big_val(r)),
                Type::BigInt,
            ));
        }
        match (&l.ty, &r.ty) {
            (Type::Str, Type::Str) if op == Add => Ok(Val::new(
                format!("py_str_concat({}, {})", l.code, r.code),
                Type::Str,
            )),
            (Type::Str, Type::Int) if op == Mul => Ok(Val::new(
                format!("py_str_repeat({}, {})", l.code, r.code),
                Type::Str,
            )),
            (Type::List(a), Type::List(b)) if op == Add => Ok(Val::new(
                format!("py_list_concat({}, {})", l.code, r.code),
                Type::List(Box::new(crate::typesys::join(a, b))),
            )),
            _ => {
                let float_ctx = matches!(l.ty, Type::Float)
                    || matches!(r.ty, Type::Float)
                    || op == Div;
                if float_ctx {
                    let lf = coerce(l, &Type::Float);
                    let rf = coerce(r, &Type::Float);
                    let code = match op {
                        Add => format!("({lf} + {rf})"),
                        Sub => format!("({lf} - {rf})"),
                        Mul => format!("({lf} * {rf})"),
                        Div => format!("({lf} / {rf})"),
                        FloorDiv => format!("@divFloor({lf}, {rf})"),
                        Mod => format!("@mod({lf}, {rf})"),
                        Pow => format!("std.math.pow(f64, {lf}, {rf})"),
                        _ => {
                            return Err(EmitError::unsupported(
                                "EMIT026",
                                format!("浮動小数の演算子 {} は未対応です", op.as_str()),
                            ))
                        }
                    };
                    return Ok(Val::new(code, Type::Float));
                }
                let li = coerce(l, &Type::Int);
                let ri = coerce(r, &Type::Int);
                let code = match op {
                    Add => format!("({li} + {ri})"),
                    Sub => format!("({li} - {ri})"),
                    Mul => format!("({li} * {ri})"),
                    FloorDiv => format!("@divFloor({li}, {ri})"),
                    Mod => format!("@mod({li}, {ri})"),
                    Pow => format!("std.math.pow(i64, {li}, {ri})"),
                    BitAnd => format!("({li} & {ri})"),
                    BitOr => format!("({li} | {ri})"),
                    BitXor => format!("({li} ^ {ri})"),
                    Shl => format!("({li} << @intCast({ri}))"),
                    Shr => format!("({li} >> @intCast({ri}))"),
                    Div => unreachable!("Div は浮動小数文脈で処理済み"),
                };
                Ok(Val::new(code, Type::Int))
            }
        }
    }

    fn emit_compare(&mut self, op: CmpOpKind, l: &Val, r: &Val) -> EmitResult<Val> {
        use CmpOpKind::*;
        if matches!(op, In | NotIn) {
            let needle = box_val(l);
            let code = match &r.ty {
                Type::List(_) => format!("py_list_contains({}, {needle})", r.code),
                Type::Dict(_, _) => format!("py_dict_contains({}, {needle})", r.code),
                Type::Set(_) => format!("py_set_contains({}, {needle})", r.code),
                _ => {
                    return Err(EmitError::unsupported(
                        "EMIT027",
                        format!("in 演算の対象の型 {} は未対応です", r.ty),
                    ))
                }
            };
            let code = if op == NotIn {
                format!("(!{code})")
            } else {
                code
            };
            return Ok(Val::new(code, Type::Bool));
        }
        if matches!(op, Is | IsNot) {
            let code = format!("({} == {})", box_val(l), box_val(r));
            let code = if op == IsNot {
                format!("(!{code})")
            } else {
                code
            };
            return Ok(Val::new(code, Type::Bool));
        }
        if matches!(l.ty, Type::Str) && matches!(r.ty, Type::Str) {
            let eq = format!("py_str_eq({}, {})", l.code, r.code);
            let code = match op {
                Eq => eq,
                Ne => format!("(!{eq})"),
                _ => {
                    return Err(EmitError::unsupported(
                        "EMIT028",
                        "文字列の大小比較は未対応です",
                    ))
                }
            };
            return Ok(Val::new(code, Type::Bool));
        }
        if matches!(l.ty, Type::BigInt) || matches!(r.ty, Type::BigInt) {
            let cmp = format!("py_bigint_cmp({}, {})", big_val(l), big_val(r));
            let zig_op = cmp_op_text(op)?;
            return Ok(Val::new(format!("({cmp} {zig_op} 0)"), Type::Bool));
        }
        let float_ctx = matches!(l.ty, Type::Float) || matches!(r.ty, Type::Float);
        let (lc, rc) = if float_ctx {
            (coerce(l, &Type::Float), coerce(r, &Type::Float))
        } else if matches!(l.ty, Type::Any) || matches!(r.ty, Type::Any) {
            let eq = format!("py_obj_eq({}, {})", box_val(l), box_val(r));
            let code = match op {
                Eq => eq,
                Ne => format!("(!{eq})"),
                _ => {
                    return Err(EmitError::unsupported(
                        "EMIT029",
                        "ボックス値の大小比較は未対応です",
                    ))
                }
            };
            return Ok(Val::new(code, Type::Bool));
        } else {
            (coerce(l, &Type::Int), coerce(r, &Type::Int))
        };
        let zig_op = cmp_op_text(op)?;
        Ok(Val::new(format!("({lc} {zig_op} {rc})"), Type::Bool))
    }

    /// 呼び出し式の生成。
    fn emit_call(
        &mut self,
        ctx: &mut FnCtx,
        func: &Expr,
        args: &[Expr],
        indent: usize,
    ) -> EmitResult<Val> {
        if let Expr::Name { name, .. } = func {
            // 組み込み
            if let Some(v) = self.emit_builtin_call(ctx, name, args, indent)? {
                return Ok(v);
            }
            // モジュール内関数
            if let Some(callee) = self.info.functions.get(name.as_str()).cloned() {
                return self.emit_static_call(ctx, name, &callee, None, args, indent);
            }
            // クラスのコンストラクタ
            if let Some(id) = self.info.classes.id_of(name) {
                return self.emit_constructor(ctx, id, args, indent);
            }
        }
        if let Expr::Attribute { obj, name, .. } = func {
            let o = self.emit_expr(ctx, obj, indent)?;
            return self.emit_method_call(ctx, &o, name, args, indent);
        }
        Err(EmitError::unsupported(
            "EMIT030",
            "第一級関数値の呼び出し生成は未対応です",
        ))
    }

    /// 静的に解決済みの関数呼び出しを生成する。
    fn emit_static_call(
        &mut self,
        ctx: &mut FnCtx,
        key: &str,
        callee: &FuncInfo,
        recv: Option<String>,
        args: &[Expr],
        indent: usize,
    ) -> EmitResult<Val> {
        let name = mangle(key);
        // I/O バウンド async の呼び出しはイベントループ用タスクを作る
        if callee.traits.may_await && callee.traits.does_io {
            let ctor = format!("{name}_task_new");
            let skip = usize::from(recv.is_some());
            let mut parts = Vec::new();
            if let Some(r) = recv {
                parts.push(r);
            }
            for (idx, arg) in args.iter().enumerate() {
                let v = self.emit_expr(ctx, arg, indent)?;
                let want = callee.sig.params.get(idx + skip).cloned().unwrap_or(Type::Any);
                parts.push(coerce(&v, &want));
            }
            return Ok(Val::new(
                format!("{ctor}({})", parts.join(", ")),
                callee.sig.ret.clone(),
            ));
        }
        // CPU バウンド async の呼び出しはワーカープールのタスクになる
        if callee.traits.may_await {
            let struct_name = format!("PoolCtx_{name}");
            let tmp = self.fresh_tmp();
            self.push(
                indent,
                &format!(
                    "const {tmp}: *{struct_name} = @ptrCast(@alignCast(py_alloc(@sizeOf({struct_name}))));"
                ),
                None,
            );
            for (idx, arg) in args.iter().enumerate() {
                let v = self.emit_expr(ctx, arg, indent)?;
                let want = callee.sig.params.get(idx).cloned().unwrap_or(Type::Any);
                self.push(
                    indent,
                    &format!(
                        "{tmp}.v_{} = {};",
                        sanitize(&callee.decl.params[idx].name),
                        coerce(&v, &want)
                    ),
                    None,
                );
            }
            return Ok(Val::new(
                format!("{name}_task_new({tmp})"),
                callee.sig.ret.clone(),
            ));
        }
        let mut parts = Vec::new();
        let skip = usize::from(recv.is_some());
        if let Some(r) = recv {
            parts.push(r);
        }
        for (idx, arg) in args.iter().enumerate() {
            let v = self.emit_expr(ctx, arg, indent)?;
            let want = callee.sig.params.get(idx + skip).cloned().unwrap_or(Type::Any);
            parts.push(coerce(&v, &want));
        }
        let call = format!("{name}({})", parts.join(", "));
        let code = if callee.traits.can_fail {
            self.fallible_call(ctx, &call, indent)?
        } else {
            call
        };
        Ok(Val::new(code, callee.sig.ret.clone()))
    }

    /// 失敗し得る呼び出しへ try / guard 脱出を付ける。
    fn fallible_call(&mut self, ctx: &mut FnCtx, call: &str, indent: usize) -> EmitResult<String> {
        match &ctx.guard {
            Some(g) => {
                let tmp = self.fresh_tmp();
                self.push(
                    indent,
                    &format!(
                        "const {tmp} = {call} catch {{ {} = true; break :{}; }};",
                        g.flag, g.label
                    ),
                    None,
                );
                Ok(tmp)
            }
            None => {
                if ctx.can_fail {
                    Ok(format!("(try {call})"))
                } else {
                    Err(EmitError::internal(
                        "EMIT031",
                        "can_fail でない関数から失敗し得る呼び出しが出ました",
                    ))
                }
            }
        }
    }

    /// クラスのコンストラクタ呼び出し。
    fn emit_constructor(
        &mut self,
        ctx: &mut FnCtx,
        id: ClassId,
        args: &[Expr],
        indent: usize,
    ) -> EmitResult<Val> {
        let layout = self.info.classes.get(id).clone();
        if layout.open {
            let tmp = self.fresh_tmp();
            self.push(
                indent,
                &format!("const {tmp} = py_obj_new_dynamic({});", 100 + id as i64),
                None,
            );
            let init_key = format!("{}.__init__", layout.name);
            if let Some(callee) = self.info.functions.get(&init_key).cloned() {
                let v =
                    self.emit_static_call(ctx, &init_key, &callee, Some(tmp.clone()), args, indent)?;
                self.push(indent, &format!("{};", v.code), None);
            } else {
                for arg in args {
                    let v = self.emit_expr(ctx, arg, indent)?;
                    self.push(indent, &format!("_ = {};", box_val(&v)), None);
                }
            }
            return Ok(Val::new(tmp, Type::Object(id)));
        }
        let init_key = format!("{}.__init__", layout.name);
        let tmp = self.fresh_tmp();
        self.push(
            indent,
            &format!(
                "const {tmp}: *Obj_{} = @ptrCast(@alignCast(py_alloc(@sizeOf(Obj_{}))));",
                layout.name, layout.name
            ),
            None,
        );
        self.push(indent, &format!("{tmp}.refcount = 1;"), None);
        self.push(
            indent,
            &format!("{tmp}.class_tag = {};", 100 + id as i64),
            None,
        );
        if let Some(callee) = self.info.functions.get(&init_key).cloned() {
            let v = self.emit_static_call(ctx, &init_key, &callee, Some(tmp.clone()), args, indent)?;
            self.push(indent, &format!("{};", v.code), None);
        }
        Ok(Val::new(tmp, Type::Object(id)))
    }

    /// メソッド呼び出し。閉じたクラスは直接呼び出し、コンテナは組み込みへ。
    fn emit_method_call(
        &mut self,
        ctx: &mut FnCtx,
        recv: &Val,
        name: &str,
        args: &[Expr],
        indent: usize,
    ) -> EmitResult<Val> {
        if let Type::Object(id) = &recv.ty {
            let layout = self.info.classes.get(*id).clone();
            if let Some(key) = layout.methods.get(name) {
                let callee = self.info.functions[key].clone();
                // 継承メソッドは所有クラスのレコードへキャストして直接呼ぶ
                let owner = key.split('.').next().unwrap_or(&layout.name);
                let recv_code = if owner == layout.name {
                    recv.code.clone()
                } else {
                    format!("@as(*Obj_{owner}, @ptrCast({}))", recv.code)
                };
                return self.emit_static_call(ctx, key, &callee, Some(recv_code), args, indent);
            }
            return Err(EmitError::internal(
                "EMIT032",
                format!("推論を通過した未知のメソッド {name}"),
            ));
        }
        // コンテナ・文字列メソッドの対応表
        let mut arg_vals = Vec::new();
        for arg in args {
            arg_vals.push(self.emit_expr(ctx, arg, indent)?);
        }
        let code = match (&recv.ty, name) {
            (Type::List(_), "append") => format!(
                "py_list_append({}, {})",
                recv.code,
                box_val(arg_vals.first().ok_or_else(|| EmitError::unsupported(
                    "EMIT033",
                    "append には引数が必要です"
                ))?)
            ),
            (Type::List(elem), "pop") => {
                let raw = format!("py_list_pop({})", recv.code);
                let raw_val = Val::new(raw, Type::Any);
                return Ok(Val::new(coerce(&raw_val, elem), (**elem).clone()));
            }
            (Type::Set(_), "add") => format!(
                "py_set_add({}, {})",
                recv.code,
                box_val(arg_vals.first().ok_or_else(|| EmitError::unsupported(
                    "EMIT034",
                    "add には引数が必要です"
                ))?)
            ),
            _ => {
                return Err(EmitError::unsupported(
                    "EMIT035",
                    format!("メソッド {name}（レシーバ型 {}）の生成は未対応です", recv.ty),
                ))
            }
        };
        Ok(Val::new(code, Type::NoneT))
    }

    /// 組み込み呼び出しの生成。対応しない名前は None を返す。
    fn emit_builtin_call(
        &mut self,
        ctx: &mut FnCtx,
        name: &str,
        args: &[Expr],
        indent: usize,
    ) -> EmitResult<Option<Val>> {
        // 単一引数を要求する組み込みの検査
        if matches!(name, "len" | "str" | "run" | "int" | "float") && args.len() != 1 {
            return Err(EmitError::unsupported(
                "EMIT039",
                format!("{name} の引数は 1 個です"),
            ));
        }
        if name == "isinstance" && args.len() != 2 {
            return Err(EmitError::unsupported(
                "EMIT039",
                "isinstance の引数は 2 個です",
            ));
        }
        if matches!(name, "getattr" | "hasattr") && args.len() != 2 {
            return Err(EmitError::unsupported(
                "EMIT039",
                format!("{name} の引数は 2 個です"),
            ));
        }
        if name == "setattr" && args.len() != 3 {
            return Err(EmitError::unsupported(
                "EMIT039",
                "setattr の引数は 3 個です",
            ));
        }
        match name {
            "print" => {
                let mut out = String::new();
                for (idx, arg) in args.iter().enumerate() {
                    let v = self.emit_expr(ctx, arg, indent)?;
                    if idx > 0 {
                        out.push(' ');
                    }
                    let call = match &v.ty {
                        Type::Int => format!("py_print_int({})", v.code),
                        Type::Float => format!("py_print_float({})", v.code),
                        Type::Bool => format!("py_print_bool({})", v.code),
                        Type::NoneT => "py_print_none()".to_string(),
                        _ => format!("py_print_obj({})", box_val(&v)),
                    };
                    out.push_str(&call);
                }
                if args.is_empty() {
                    out.push_str("py_print_none()");
                }
                Ok(Some(Val::new(out, Type::NoneT)))
            }
            "len" => {
                let v = self.emit_expr(ctx, &args[0], indent)?;
                let code = match &v.ty {
                    Type::List(_) => format!("py_list_len({})", v.code),
                    Type::Dict(_, _) => format!("py_dict_len({})", v.code),
                    Type::Set(_) => format!("py_set_len({})", v.code),
                    Type::Str | Type::Bytes => format!("py_str_len({})", v.code),
                    _ => format!("py_list_len({})", box_val(&v)),
                };
                Ok(Some(Val::new(code, Type::Int)))
            }
            "str" => {
                let v = self.emit_expr(ctx, &args[0], indent)?;
                Ok(Some(Val::new(
                    format!("py_to_str({})", box_val(&v)),
                    Type::Str,
                )))
            }
            "run" => {
                let v = self.emit_expr(ctx, &args[0], indent)?;
                Ok(Some(Val::new(
                    format!("py_sched_block_on({})", v.code),
                    Type::Any,
                )))
            }
            "spawn" => {
                let v = self.emit_expr(ctx, &args[0], indent)?;
                Ok(Some(Val::new(
                    format!("blk: {{ const t = {}; py_sched_spawn(t); break :blk t; }}", v.code),
                    Type::Any,
                )))
            }
            "gather" => {
                let mut body = format!("blk: {{ const l = py_list_new({});", args.len());
                for arg in args {
                    let v = self.emit_expr(ctx, arg, indent)?;
                    let _ = write!(body, " py_list_append(l, {});", v.code);
                }
                body.push_str(" break :blk py_sched_gather(l); }");
                Ok(Some(Val::new(body, Type::Coro(Box::new(Type::Any)))))
            }
            "isinstance" => {
                let v = self.emit_expr(ctx, &args[0], indent)?;
                let Expr::Name { name: ty_name, .. } = &args[1] else {
                    return Err(EmitError::unsupported(
                        "EMIT036",
                        "isinstance の第 2 引数は名前のみ対応です",
                    ));
                };
                // 閉じた型なら安価なタグ比較になる
                let tag = match ty_name.as_str() {
                    "int" => 1,
                    "float" => 2,
                    "bool" => 3,
                    "str" => 4,
                    other => match self.info.classes.id_of(other) {
                        Some(id) => 100 + id as i64,
                        None => {
                            return Err(EmitError::unsupported(
                                "EMIT037",
                                format!("isinstance の型 {other} を解決できません"),
                            ))
                        }
                    },
                };
                // 静的に型が確定している場合は定数になる
                let code = match (&v.ty, ty_name.as_str()) {
                    (Type::Int, "int") | (Type::Float, "float") | (Type::Str, "str") => {
                        "true".to_string()
                    }
                    (t, _) if t.is_concrete() && !matches!(t, Type::Any | Type::Union(_)) => {
                        format!("(py_obj_tag({}) == {tag})", box_val(&v))
                    }
                    _ => format!("(py_obj_tag({}) == {tag})", box_val(&v)),
                };
                Ok(Some(Val::new(code, Type::Bool)))
            }
            "int" => {
                let v = self.emit_expr(ctx, &args[0], indent)?;
                let code = match &v.ty {
                    Type::Float => format!("@as(i64, @intFromFloat({}))", v.code),
                    Type::Bool => format!("@as(i64, @intFromBool({}))", v.code),
                    Type::Int => v.code.clone(),
                    _ => format!("py_int_unbox({})", box_val(&v)),
                };
                Ok(Some(Val::new(code, Type::Int)))
            }
            "float" => {
                let v = self.emit_expr(ctx, &args[0], indent)?;
                Ok(Some(Val::new(coerce(&v, &Type::Float), Type::Float)))
            }
            // 動的属性 API。推論がレシーバのクラスを open（ボックス表現）へ
            // 退化させているので、ここではボックス面への呼び出しになる
            "getattr" => {
                let (obj, attr) = self.emit_attr_api_operands(ctx, args, indent)?;
                Ok(Some(Val::new(
                    format!("py_attr_get({obj}, \"{}\", {})", zig_escape(&attr), attr.len()),
                    Type::Any,
                )))
            }
            "setattr" => {
                let (obj, attr) = self.emit_attr_api_operands(ctx, args, indent)?;
                let v = self.emit_expr(ctx, &args[2], indent)?;
                Ok(Some(Val::new(
                    format!(
                        "py_attr_set({obj}, \"{}\", {}, {})",
                        zig_escape(&attr),
                        attr.len(),
                        box_val(&v)
                    ),
                    Type::NoneT,
                )))
            }
            "hasattr" => {
                let (obj, attr) = self.emit_attr_api_operands(ctx, args, indent)?;
                Ok(Some(Val::new(
                    format!("py_attr_has({obj}, \"{}\", {})", zig_escape(&attr), attr.len()),
                    Type::Bool,
                )))
            }
            _ => Ok(None),
        }
    }

    /// 動的属性 API 共通のオペランド（ボックス済みレシーバと属性名）を取り出す。
    /// 属性名は ptr/len で渡すため文字列リテラルのみ受ける。
    fn emit_attr_api_operands(
        &mut self,
        ctx: &mut FnCtx,
        args: &[Expr],
        indent: usize,
    ) -> EmitResult<(String, String)> {
        let obj = self.emit_expr(ctx, &args[0], indent)?;
        let Expr::StrLit { value, .. } = &args[1] else {
            return Err(EmitError::unsupported(
                "EMIT042",
                "動的属性 API の属性名は文字列リテラルのみ対応です",
            ));
        };
        Ok((box_val(&obj), value.clone()))
    }

    // ---- ジェネレータと async の状態機械 ----

    /// ジェネレータを next() を持つ状態機械へ落とす。
    /// 対応形: 直列文のみ、または単一の range/while ループ本体に yield。
    fn emit_generator(&mut self, key: &str, func: &FuncInfo) -> EmitResult<()> {
        let name = mangle(key);
        let elem_ty = match &func.sig.ret {
            Type::Generator(e) => (**e).clone(),
            other => other.clone(),
        };
        let elem_text = zig_ty_or_obj(&elem_ty);
        let struct_name = format!("Gen_{name}");

        self.push(0, &format!("const {struct_name} = struct {{"), None);
        self.push(1, "pc: u32 = 0,", None);
        for (idx, p) in func.decl.params.iter().enumerate() {
            self.push(
                1,
                &format!(
                    "v_{}: {},",
                    sanitize(&p.name),
                    zig_ty_or_obj(&func.sig.params[idx])
                ),
                None,
            );
        }
        for (local, ty) in func.locals.iter() {
            if func.decl.params.iter().any(|p| &p.name == local) {
                continue;
            }
            self.push(
                1,
                &format!(
                    "v_{}: {} = {},",
                    sanitize(local),
                    zig_ty_or_obj(ty),
                    default_value(ty)
                ),
                None,
            );
        }
        self.push(
            1,
            &format!("fn next(self: *{struct_name}) ?{elem_text} {{"),
            None,
        );
        self.push(2, "while (true) {", None);
        self.push(3, "switch (self.pc) {", None);
        self.emit_machine_states(func, &elem_ty, MachineKind::Generator)?;
        self.push(4, "else => return null,", None);
        self.push(3, "}", None);
        self.push(2, "}", None);
        self.push(1, "}", None);
        self.push(0, "};", None);

        // 生成関数本体: 状態機械を確保して返す
        let mut params_text = String::new();
        for (idx, p) in func.decl.params.iter().enumerate() {
            if idx > 0 {
                params_text.push_str(", ");
            }
            let _ = write!(
                params_text,
                "v_{}: {}",
                sanitize(&p.name),
                zig_ty_or_obj(&func.sig.params[idx])
            );
        }
        self.push(
            0,
            &format!("fn {name}({params_text}) *{struct_name} {{"),
            None,
        );
        self.push(
            1,
            &format!(
                "const g: *{struct_name} = @ptrCast(@alignCast(py_alloc(@sizeOf({struct_name}))));"
            ),
            None,
        );
        self.push(1, "g.pc = 0;", None);
        for p in &func.decl.params {
            let v = sanitize(&p.name);
            self.push(1, &format!("g.v_{v} = v_{v};"), None);
        }
        self.push(1, "return g;", None);
        self.push(0, "}", None);
        Ok(())
    }

    /// I/O バウンド async 関数をイベントループ駆動の状態機械へ落とす。
    fn emit_async_state_machine(&mut self, key: &str, func: &FuncInfo) -> EmitResult<()> {
        let name = mangle(key);
        let struct_name = format!("Task_{name}");
        let inner_ret = match &func.sig.ret {
            Type::Coro(inner) => (**inner).clone(),
            other => other.clone(),
        };

        self.push(0, &format!("const {struct_name} = struct {{"), None);
        self.push(1, "pc: u32 = 0,", None);
        self.push(1, "task: PyObj = null,", None);
        self.push(1, "child: PyObj = null,", None);
        for (idx, p) in func.decl.params.iter().enumerate() {
            self.push(
                1,
                &format!(
                    "v_{}: {},",
                    sanitize(&p.name),
                    zig_ty_or_obj(&func.sig.params[idx])
                ),
                None,
            );
        }
        for (local, ty) in func.locals.iter() {
            if func.decl.params.iter().any(|p| &p.name == local) {
                continue;
            }
            self.push(
                1,
                &format!(
                    "v_{}: {} = {},",
                    sanitize(local),
                    zig_ty_or_obj(ty),
                    default_value(ty)
                ),
                None,
            );
        }
        self.push(
            1,
            &format!("fn poll(ctx: *anyopaque) callconv(.C) i32 {{"),
            None,
        );
        self.push(
            2,
            &format!("const self: *{struct_name} = @ptrCast(@alignCast(ctx));"),
            None,
        );
        // キャンセルは次の中断点で観測される
        self.push(2, "if (py_task_cancelled(self.task)) {", None);
        self.push(3, "py_exc_set(9, py_none());", None);
        self.push(3, "return PY_READY;", None);
        self.push(2, "}", None);
        self.push(2, "while (true) {", None);
        self.push(3, "switch (self.pc) {", None);
        self.emit_machine_states(func, &inner_ret, MachineKind::Async)?;
        self.push(4, "else => return PY_READY,", None);
        self.push(3, "}", None);
        self.push(2, "}", None);
        self.push(1, "}", None);
        self.push(0, "};", None);

        // タスク生成関数
        let mut params_text = String::new();
        for (idx, p) in func.decl.params.iter().enumerate() {
            if idx > 0 {
                params_text.push_str(", ");
            }
            let _ = write!(
                params_text,
                "v_{}: {}",
                sanitize(&p.name),
                zig_ty_or_obj(&func.sig.params[idx])
            );
        }
        self.push(
            0,
            &format!("fn {name}_task_new({params_text}) PyObj {{"),
            None,
        );
        self.push(
            1,
            &format!(
                "const m: *{struct_name} = @ptrCast(@alignCast(py_alloc(@sizeOf({struct_name}))));"
            ),
            None,
        );
        self.push(1, "m.pc = 0;", None);
        for p in &func.decl.params {
            let v = sanitize(&p.name);
            self.push(1, &format!("m.v_{v} = v_{v};"), None);
        }
        self.push(
            1,
            &format!("m.task = py_task_new({struct_name}.poll, @ptrCast(m));"),
            None,
        );
        self.push(1, "return m.task;", None);
        self.push(0, "}", None);
        Ok(())
    }

    /// 状態機械の状態列を生成する。直列文と単純な中断点の列を各状態へ割り当てる。
    fn emit_machine_states(
        &mut self,
        func: &FuncInfo,
        result_ty: &Type,
        kind: MachineKind,
    ) -> EmitResult<()> {
        let segments = split_into_segments(&func.decl.body)?;
        let mut ctx = FnCtx {
            key: func.decl.key.clone(),
            locals: &func.locals,
            declared: func.locals.keys().cloned().collect(),
            reassigned: BTreeSet::new(),
            params: func.decl.params.iter().map(|p| p.name.clone()).collect(),
            ret: result_ty.clone(),
            can_fail: func.traits.can_fail,
            guard: None,
            hoisted: true,
        };
        let total = segments.len();
        for (state, segment) in segments.into_iter().enumerate() {
            self.push(4, &format!("{state} => {{"), None);
            for stmt in &segment.stmts {
                self.emit_machine_stmt(&mut ctx, stmt, 5, result_ty, kind)?;
            }
            match &segment.suspend {
                Some(Suspend::Timer { ms_expr, resume }) => {
                    let v = self.emit_expr(&mut ctx, ms_expr, 5)?;
                    let ms = match &v.ty {
                        Type::Float => format!(
                            "@as(i64, @intFromFloat({} * 1000.0))",
                            v.code
                        ),
                        _ => format!("({}) * 1000", coerce(&v, &Type::Int)),
                    };
                    self.push(5, &format!("self.pc = {resume};"), None);
                    self.push(5, &format!("py_task_wait_timer(self.task, {ms});"), None);
                    self.push(5, "return PY_PENDING;", None);
                }
                // 束縛付きの場合、再開後の束縛は次状態の先頭で行われる
                Some(Suspend::Child {
                    coro_expr, resume, ..
                }) => {
                    let v = self.emit_expr(&mut ctx, coro_expr, 5)?;
                    self.push(5, &format!("self.child = {};", v.code), None);
                    self.push(5, &format!("self.pc = {resume};"), None);
                    self.push(
                        5,
                        "py_task_wait_child(self.task, self.child);",
                        None,
                    );
                    self.push(5, "return PY_PENDING;", None);
                }
                None => {
                    if state + 1 < total {
                        self.push(5, &format!("self.pc = {};", state + 1), None);
                    } else {
                        match kind {
                            MachineKind::Async => {
                                self.push(
                                    5,
                                    &format!(
                                        "py_task_set_result(self.task, {});",
                                        box_code(&default_value(result_ty), result_ty)
                                    ),
                                    None,
                                );
                                self.push(5, "return PY_READY;", None);
                            }
                            MachineKind::Generator => {
                                self.push(5, "self.pc = 0xffff;", None);
                                self.push(5, "return null;", None);
                            }
                        }
                    }
                }
            }
            self.push(4, "},", None);
        }
        Ok(())
    }

    /// 状態機械内の文の生成。return / yield は機械語彙へ置き換える。
    fn emit_machine_stmt(
        &mut self,
        ctx: &mut FnCtx,
        stmt: &MachineStmt,
        indent: usize,
        result_ty: &Type,
        kind: MachineKind,
    ) -> EmitResult<()> {
        match stmt {
            MachineStmt::Plain(s) => match s {
                Stmt::Return { value, .. } => {
                    let code = match value {
                        Some(v) => {
                            let val = self.emit_expr(ctx, v, indent)?;
                            box_code(&coerce(&val, result_ty), result_ty)
                        }
                        None => "py_none()".to_string(),
                    };
                    match kind {
                        MachineKind::Async => {
                            self.push(
                                indent,
                                &format!("py_task_set_result(self.task, {code});"),
                                None,
                            );
                            self.push(indent, "return PY_READY;", None);
                        }
                        MachineKind::Generator => {
                            self.push(indent, "self.pc = 0xffff;", None);
                            self.push(indent, "return null;", None);
                        }
                    }
                    Ok(())
                }
                other => self.emit_stmt(ctx, other, indent),
            },
            MachineStmt::Yield { value, resume } => {
                let v = match value {
                    Some(v) => {
                        let val = self.emit_expr(ctx, v, indent)?;
                        coerce(&val, result_ty)
                    }
                    None => default_value(result_ty),
                };
                self.push(indent, &format!("self.pc = {resume};"), None);
                self.push(indent, &format!("return {v};"), None);
                Ok(())
            }
            MachineStmt::BindChildResult { name, .. } => {
                // 束縛先の型は推論済みローカル表から引く
                let ty = ctx.locals.get(name).cloned().unwrap_or(Type::Any);
                let raw = Val::new("py_task_result(self.child)".to_string(), Type::Any);
                let coerced = coerce(&raw, &ty);
                self.push(
                    indent,
                    &format!("self.v_{} = {};", sanitize(name), coerced),
                    None,
                );
                Ok(())
            }
        }
    }

    // ---- 低レベルの出力補助 ----

    fn name_type(&self, ctx: &FnCtx, name: &str) -> Type {
        if let Some(ty) = ctx.locals.get(name) {
            return ty.clone();
        }
        if let Some(ty) = self.info.main_locals.get(name) {
            return ty.clone();
        }
        Type::Any
    }

    fn name_ref(&self, ctx: &FnCtx, name: &str) -> String {
        let base = sanitize(name);
        // トップレベル文のローカルはモジュール変数 g_* として生成される
        if ctx.key == MAIN_KEY && self.info.main_locals.contains_key(name) {
            return format!("g_{base}");
        }
        if ctx.params.contains(name) || ctx.locals.contains_key(name) || ctx.declared.contains(name)
        {
            if ctx.hoisted {
                return format!("self.v_{base}");
            }
            return format!("v_{base}");
        }
        if self.info.main_locals.contains_key(name) {
            return format!("g_{base}");
        }
        format!("v_{base}")
    }

    fn fresh_tmp(&mut self) -> String {
        self.tmp += 1;
        format!("_t{}", self.tmp)
    }

    fn fresh_id(&mut self) -> usize {
        self.tmp += 1;
        self.tmp
    }

    fn push(&mut self, indent: usize, text: &str, src_line: Option<usize>) {
        for _ in 0..indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
        if let Some(src) = src_line {
            self.line_map.push(LineMapEntry {
                generated_line: self.line,
                source_file: self.source_file.to_string(),
                source_line: src,
            });
        }
        self.line += 1;
    }

    fn push_raw(&mut self, text: &str) {
        self.out.push_str(text);
        self.line += text.lines().count();
    }

    fn blank(&mut self) {
        self.out.push('\n');
        self.line += 1;
    }
}

/// 状態機械の種別。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MachineKind {
    Generator,
    Async,
}

/// 状態機械用に変換済みの文。
#[derive(Clone, Debug)]
enum MachineStmt {
    Plain(Stmt),
    Yield {
        value: Option<Expr>,
        resume: usize,
    },
    BindChildResult {
        name: String,
    },
}

/// 中断点の種別。
#[derive(Clone, Debug)]
enum Suspend {
    Timer {
        ms_expr: Expr,
        resume: usize,
    },
    Child {
        coro_expr: Expr,
        resume: usize,
    },
}

/// 状態 1 つ分: 直列文の並びと、状態末尾の中断点。
#[derive(Clone, Debug)]
struct Segment {
    stmts: Vec<MachineStmt>,
    suspend: Option<Suspend>,
}

/// 本体を状態機械の状態列へ分割する。
/// 対応形: 文のトップレベルに現れる await / yield。
/// それ以外の位置の中断点は未対応エラーになる。
fn split_into_segments(body: &[Stmt]) -> EmitResult<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut current = Segment {
        stmts: Vec::new(),
        suspend: None,
    };
    for stmt in body {
        match stmt {
            // `await sleep(x)` / `await coro` を文として
            Stmt::ExprStmt {
                value: Expr::Await { expr, .. },
                ..
            } => {
                let resume = segments.len() + 1;
                current.suspend = Some(classify_await(expr, false, resume)?);
                segments.push(current);
                current = Segment {
                    stmts: Vec::new(),
                    suspend: None,
                };
            }
            // `x = await coro`
            Stmt::Assign {
                target: Expr::Name { name, .. },
                value: Expr::Await { expr, .. },
                ..
            } => {
                let resume = segments.len() + 1;
                current.suspend = Some(classify_await(expr, true, resume)?);
                segments.push(current);
                current = Segment {
                    stmts: vec![MachineStmt::BindChildResult { name: name.clone() }],
                    suspend: None,
                };
            }
            // `yield e`
            Stmt::ExprStmt {
                value: Expr::Yield { expr, .. },
                ..
            } => {
                let resume = segments.len() + 1;
                current.stmts.push(MachineStmt::Yield {
                    value: expr.as_deref().cloned(),
                    resume,
                });
                segments.push(current);
                current = Segment {
                    stmts: Vec::new(),
                    suspend: None,
                };
            }
            other => {
                if contains_suspension(other) {
                    return Err(EmitError::unsupported(
                        "EMIT040",
                        "この位置の await / yield は状態機械へ変換できません",
                    ));
                }
                current.stmts.push(MachineStmt::Plain(other.clone()));
            }
        }
    }
    segments.push(current);
    Ok(segments)
}

/// await の対象を中断点の種別へ分類する。
fn classify_await(expr: &Expr, has_bind: bool, resume: usize) -> EmitResult<Suspend> {
    if let Expr::Call { func, args, .. } = expr {
        if let Expr::Name { name, .. } = func.as_ref() {
            if name == "sleep" {
                let ms_expr = args.first().cloned().ok_or_else(|| {
                    EmitError::unsupported("EMIT041", "sleep には待ち時間が必要です")
                })?;
                // 束縛付きの sleep は None を返すだけなので子待ちに落とす必要はない
                if !has_bind {
                    return Ok(Suspend::Timer { ms_expr, resume });
                }
            }
        }
    }
    Ok(Suspend::Child {
        coro_expr: expr.clone(),
        resume,
    })
}

/// 文の内部に中断点が含まれるかどうか。
fn contains_suspension(stmt: &Stmt) -> bool {
    fn expr_has(e: &Expr) -> bool {
        match e {
            Expr::Await { .. } | Expr::Yield { .. } => true,
            Expr::BinOp { left, right, .. }
            | Expr::Compare { left, right, .. }
            | Expr::BoolOp { left, right, .. } => expr_has(left) || expr_has(right),
            Expr::UnaryOp { operand, .. } => expr_has(operand),
            Expr::Call { func, args, .. } => expr_has(func) || args.iter().any(expr_has),
            Expr::Attribute { obj, .. } => expr_has(obj),
            Expr::Subscript { obj, index, .. } => expr_has(obj) || expr_has(index),
            Expr::IfExp {
                cond,
                then_branch,
                else_branch,
                ..
            } => expr_has(cond) || expr_has(then_branch) || expr_has(else_branch),
            Expr::ListLit { items, .. }
            | Expr::TupleLit { items, .. }
            | Expr::SetLit { items, .. } => items.iter().any(expr_has),
            _ => false,
        }
    }
    fn stmt_has(s: &Stmt) -> bool {
        match s {
            Stmt::Assign { value, .. } | Stmt::ExprStmt { value, .. } => expr_has(value),
            Stmt::Return { value, .. } => value.as_ref().map(expr_has).unwrap_or(false),
            Stmt::If { cond, body, orelse, .. } => {
                expr_has(cond) || body.iter().any(stmt_has) || orelse.iter().any(stmt_has)
            }
            Stmt::While { cond, body, .. } => expr_has(cond) || body.iter().any(stmt_has),
            Stmt::For { iter, body, .. } => expr_has(iter) || body.iter().any(stmt_has),
            Stmt::Try {
                body,
                handlers,
                orelse,
                finally,
                ..
            } => {
                body.iter().any(stmt_has)
                    || handlers.iter().any(|h| h.body.iter().any(stmt_has))
                    || orelse.iter().any(stmt_has)
                    || finally.iter().any(stmt_has)
            }
            _ => false,
        }
    }
    stmt_has(stmt)
}

// ---- 型・コード片の補助 ----

/// 推論型を Zig の型表記へ写す。レジスタに収まらない型はボックス表現になる。
fn zig_ty_or_obj(ty: &Type) -> String {
    match ty {
        Type::Int => "i64".to_string(),
        Type::Float => "f64".to_string(),
        Type::Bool => "bool".to_string(),
        Type::NoneT => "void".to_string(),
        Type::Generator(_) => "*anyopaque".to_string(),
        _ => "PyObj".to_string(),
    }
}

/// 型ごとの初期値。状態機械のフィールド初期化で使う。
fn default_value(ty: &Type) -> String {
    match ty {
        Type::Int => "0".to_string(),
        Type::Float => "0.0".to_string(),
        Type::Bool => "false".to_string(),
        Type::NoneT => "{}".to_string(),
        Type::Generator(_) => "undefined".to_string(),
        _ => "null".to_string(),
    }
}

/// 値を要求型へ合わせるキャスト・ボックス・アンボックスを生成する。
fn coerce(val: &Val, want: &Type) -> String {
    if val.ty == *want {
        return val.code.clone();
    }
    match (&val.ty, want) {
        (Type::Int, Type::Float) => format!("@as(f64, @floatFromInt({}))", val.code),
        (Type::Bool, Type::Int) => format!("@as(i64, @intFromBool({}))", val.code),
        (Type::Bool, Type::Float) => {
            format!("@as(f64, @floatFromInt(@intFromBool({})))", val.code)
        }
        // ボックス表現からの取り出し
        (Type::Any | Type::Union(_) | Type::Unknown, Type::Int) => {
            format!("py_int_unbox({})", val.code)
        }
        (Type::Any | Type::Union(_) | Type::Unknown, Type::Float) => {
            format!("py_float_unbox({})", val.code)
        }
        (Type::Any | Type::Union(_) | Type::Unknown, Type::Bool) => {
            format!("py_bool_unbox({})", val.code)
        }
        (Type::Any | Type::Union(_) | Type::Unknown, Type::NoneT) => {
            format!("{{ _ = {}; }}", val.code)
        }
        // ボックス表現への持ち上げ
        (_, Type::Any) | (_, Type::Union(_)) => box_val(val),
        (Type::Any | Type::Unknown, _) => val.code.clone(),
        _ => val.code.clone(),
    }
}

/// 値をボックス表現へ持ち上げる。
fn box_val(val: &Val) -> String {
    box_code(&val.code, &val.ty)
}

fn box_code(code: &str, ty: &Type) -> String {
    match ty {
        Type::Int => {
            // 小整数リテラルはランタイムのインターン表を参照する
            if let Ok(v) = code.trim_matches(|c| c == '(' || c == ')').parse::<i64>() {
                if (-5..=256).contains(&v) {
                    return format!("py_small_int({v})");
                }
            }
            format!("py_int_box({code})")
        }
        Type::Float => format!("py_float_box({code})"),
        Type::Bool => format!("py_bool_box({code})"),
        Type::NoneT => "py_none()".to_string(),
        _ => code.to_string(),
    }
}

/// 多倍長演算のオペランドへ持ち上げる。
fn big_val(val: &Val) -> String {
    match &val.ty {
        Type::BigInt => val.code.clone(),
        Type::Int => format!("py_int_box({})", val.code),
        _ => val.code.clone(),
    }
}

/// 真偽文脈への変換。
fn truthy(val: &Val) -> String {
    match &val.ty {
        Type::Bool => val.code.clone(),
        Type::Int => format!("({} != 0)", val.code),
        Type::Float => format!("({} != 0.0)", val.code),
        Type::Str | Type::Bytes => format!("(py_str_len({}) != 0)", val.code),
        Type::List(_) => format!("(py_list_len({}) != 0)", val.code),
        Type::Dict(_, _) => format!("(py_dict_len({}) != 0)", val.code),
        Type::NoneT => "false".to_string(),
        _ => format!("py_truthy({})", box_val(val)),
    }
}

fn cmp_op_text(op: CmpOpKind) -> EmitResult<&'static str> {
    use CmpOpKind::*;
    Ok(match op {
        Eq => "==",
        Ne => "!=",
        Lt => "<",
        Le => "<=",
        Gt => ">",
        Ge => ">=",
        _ => {
            return Err(EmitError::internal(
                "EMIT038",
                "is / in はここへ到達しません",
            ))
        }
    })
}

/// 関数キーを Zig の識別子へマングルする。
fn mangle(key: &str) -> String {
    format!("py_{}", key.replace('.', "_"))
}

/// 予約語・衝突を避けたフィールド名。
fn field_name(name: &str) -> String {
    format!("f_{}", sanitize(name))
}

fn sanitize(name: &str) -> String {
    name.replace(|c: char| !c.is_ascii_alphanumeric() && c != '_', "_")
}

/// Zig 文字列リテラル向けのエスケープ。
fn zig_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// 末尾に明示 return が無い関数かどうか（void 以外なら既定値を返す）。
fn needs_trailing_return(body: &[Stmt]) -> bool {
    !matches!(body.last(), Some(Stmt::Return { .. }) | Some(Stmt::Raise { .. }))
}

/// 代入回数を数え、2 回以上の名前を reassigned へ集める。
fn count_assignments(body: &[Stmt], seen: &mut BTreeSet<String>, reassigned: &mut BTreeSet<String>) {
    for stmt in body {
        match stmt {
            Stmt::Assign {
                target: Expr::Name { name, .. },
                ..
            } => {
                if !seen.insert(name.clone()) {
                    reassigned.insert(name.clone());
                }
            }
            Stmt::If { body, orelse, .. } => {
                count_assignments(body, seen, reassigned);
                count_assignments(orelse, seen, reassigned);
            }
            Stmt::While { body, .. } => {
                // ループ内の代入は再代入として扱う
                let mut inner = BTreeSet::new();
                count_assignments(body, &mut inner, reassigned);
                for name in inner {
                    if !seen.insert(name.clone()) {
                        reassigned.insert(name.clone());
                    }
                    reassigned.insert(name);
                }
            }
            Stmt::For { target, body, .. } => {
                if let Expr::Name { name, .. } = target {
                    seen.insert(name.clone());
                    reassigned.insert(name.clone());
                }
                let mut inner = BTreeSet::new();
                count_assignments(body, &mut inner, reassigned);
                for name in inner {
                    reassigned.insert(name);
                }
            }
            Stmt::Try {
                body,
                handlers,
                orelse,
                finally,
                ..
            } => {
                count_assignments(body, seen, reassigned);
                for h in handlers {
                    count_assignments(&h.body, seen, reassigned);
                }
                count_assignments(orelse, seen, reassigned);
                count_assignments(finally, seen, reassigned);
            }
            _ => {}
        }
    }
}
