// パス: runtime_native/src/error.rs
// 役割: スレッドローカルの例外セルと送出系 extern 面を提供する
// 意図: 生成コードのエラー戻り値と例外メタデータの受け渡しを仲介する
// 関連ファイル: runtime_native/src/value.rs, runtime_native/src/sched.rs
//! 例外状態モジュール
//!
//! - 送出はエラー戻り値として伝播し、例外の実体（クラスタグ・メッセージ・
//!   原因チェーン）はスレッドローカルのセルに置かれる。
//! - `raise X from Y` の原因は cause タグの連鎖として保持される。

use std::cell::RefCell;

use crate::value::{display_value, PyValue};

// 組み込み例外のタグ。生成コード側の表と一致させること。
pub const EXC_EXCEPTION: i64 = 1;
pub const EXC_VALUE_ERROR: i64 = 2;
pub const EXC_TYPE_ERROR: i64 = 3;
pub const EXC_INDEX_ERROR: i64 = 4;
pub const EXC_KEY_ERROR: i64 = 5;
pub const EXC_RUNTIME_ERROR: i64 = 6;
pub const EXC_STOP_ITERATION: i64 = 7;
pub const EXC_ZERO_DIVISION: i64 = 8;
pub const EXC_CANCELLED: i64 = 9;

/// 現在の例外。クラスタグ・メッセージ・原因チェーン。
#[derive(Clone, Debug, Default)]
struct ExcState {
    class_tag: i64,
    message: String,
    causes: Vec<i64>,
}

thread_local! {
    static CURRENT: RefCell<ExcState> = RefCell::new(ExcState::default());
}

fn tag_name(tag: i64) -> String {
    match tag {
        EXC_EXCEPTION => "Exception".to_string(),
        EXC_VALUE_ERROR => "ValueError".to_string(),
        EXC_TYPE_ERROR => "TypeError".to_string(),
        EXC_INDEX_ERROR => "IndexError".to_string(),
        EXC_KEY_ERROR => "KeyError".to_string(),
        EXC_RUNTIME_ERROR => "RuntimeError".to_string(),
        EXC_STOP_ITERATION => "StopIteration".to_string(),
        EXC_ZERO_DIVISION => "ZeroDivisionError".to_string(),
        EXC_CANCELLED => "Cancelled".to_string(),
        other => format!("<class {other}>"),
    }
}

/// 例外を設定する。msg は任意の値で、表示文字列化して保持する。
#[no_mangle]
pub extern "C" fn py_exc_set(class_tag: i64, msg: PyValue) {
    CURRENT.with(|cell| {
        let mut state = cell.borrow_mut();
        state.class_tag = class_tag;
        state.message = if msg.is_null() {
            String::new()
        } else {
            display_value(msg)
        };
    });
}

/// `raise X from Y` の原因タグを積む。
#[no_mangle]
pub extern "C" fn py_exc_set_cause(cause_tag: i64) {
    CURRENT.with(|cell| cell.borrow_mut().causes.push(cause_tag));
}

/// 現在の例外クラスタグ。未設定は 0。
#[no_mangle]
pub extern "C" fn py_exc_class() -> i64 {
    CURRENT.with(|cell| cell.borrow().class_tag)
}

/// ハンドラ一致後に状態を消す。原因チェーンも消える。
#[no_mangle]
pub extern "C" fn py_exc_clear() {
    CURRENT.with(|cell| *cell.borrow_mut() = ExcState::default());
}

/// 束縛済み例外の再送出。状態はそのまま残す。
#[no_mangle]
pub extern "C" fn py_exc_reraise() {
    CURRENT.with(|cell| {
        let mut state = cell.borrow_mut();
        if state.class_tag == 0 {
            state.class_tag = EXC_RUNTIME_ERROR;
            state.message = "再送出すべき例外がありません".to_string();
        }
    });
}

/// 未捕捉例外の表示。原因チェーンも並べる。
#[no_mangle]
pub extern "C" fn py_exc_print() {
    CURRENT.with(|cell| {
        let state = cell.borrow();
        if state.message.is_empty() {
            eprintln!("{}", tag_name(state.class_tag));
        } else {
            eprintln!("{}: {}", tag_name(state.class_tag), state.message);
        }
        for cause in state.causes.iter().rev() {
            eprintln!("  caused by: {}", tag_name(*cause));
        }
    });
}

/// ランタイム内部からの IndexError 送出。
pub fn raise_index_error() {
    CURRENT.with(|cell| {
        let mut state = cell.borrow_mut();
        state.class_tag = EXC_INDEX_ERROR;
        state.message = "添字が範囲外です".to_string();
    });
}

/// ランタイム内部からの KeyError 送出。
pub fn raise_key_error() {
    CURRENT.with(|cell| {
        let mut state = cell.borrow_mut();
        state.class_tag = EXC_KEY_ERROR;
        state.message = "キーがありません".to_string();
    });
}

/// ランタイム内部からの AttributeError 相当（TypeError タグで報告する）。
pub fn raise_attribute_error(name: &str) {
    CURRENT.with(|cell| {
        let mut state = cell.borrow_mut();
        state.class_tag = EXC_TYPE_ERROR;
        state.message = format!("属性 {name} がありません");
    });
}
