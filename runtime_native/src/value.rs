// パス: runtime_native/src/value.rs
// 役割: PyBox / PyValue の内部表現と値操作の extern 面を提供する
// 意図: 生成コードが任意の値をボックス化して FFI 経由で安全に受け渡せるようにする
// 関連ファイル: runtime_native/src/error.rs, runtime_native/src/bigint.rs, runtime_native/src/sched.rs

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::c_void;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::bigint::BigInt;
use crate::sched::TaskCell;

const PY_BOX_MAGIC: u64 = 0x50594C4F545F3031; // "PYLOT_01"

// 型タグ。生成コードの isinstance タグ比較と一致させること。
pub const TAG_INT: i64 = 1;
pub const TAG_FLOAT: i64 = 2;
pub const TAG_BOOL: i64 = 3;
pub const TAG_STR: i64 = 4;
pub const TAG_BYTES: i64 = 5;
pub const TAG_LIST: i64 = 6;
pub const TAG_TUPLE: i64 = 7;
pub const TAG_DICT: i64 = 8;
pub const TAG_SET: i64 = 9;
pub const TAG_NONE: i64 = 10;
pub const TAG_BIGINT: i64 = 11;
pub const TAG_STRBUF: i64 = 12;
pub const TAG_TASK: i64 = 13;

/// 辞書・集合のキー表現。浮動小数はビットパターンで比較する。
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DictKey {
    Bool(bool),
    Int(i64),
    FloatBits(u64),
    Str(String),
}

/// ボックスの中身。外部からは不透明で、タグ経由でのみ観測される。
pub enum PyData {
    None,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    List(Mutex<Vec<PyValue>>),
    Tuple(Mutex<Vec<PyValue>>),
    Dict(Mutex<BTreeMap<DictKey, PyValue>>),
    Set(Mutex<BTreeSet<DictKey>>),
    StrBuf(Mutex<String>),
    Big(BigInt),
    DynObj {
        class_tag: i64,
        attrs: Mutex<BTreeMap<String, PyValue>>,
    },
    Task(TaskCell),
}

/// ヒープ上のボックス 1 つ分。参照カウントはアトミックに増減する。
pub struct PyBox {
    magic: u64,
    pub tag: i64,
    rc: AtomicI64,
    pub data: PyData,
}

/// FFI 境界で受け渡す値ハンドル。null は「値なし」。
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PyValue(pub *mut PyBox);

// ボックスの共有は参照カウントで統制するため、ハンドル自体はスレッドを跨げる
unsafe impl Send for PyValue {}
unsafe impl Sync for PyValue {}

impl PyValue {
    pub const fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// 有効なボックスへの共有参照を得る。magic 不一致は None。
    pub fn get(self) -> Option<&'static PyBox> {
        if self.0.is_null() {
            return None;
        }
        let b = unsafe { &*self.0 };
        if b.magic != PY_BOX_MAGIC {
            return None;
        }
        Some(b)
    }
}

/// 新しいボックスを確保する。参照カウントは 1 から始まる。
pub fn alloc_value(tag: i64, data: PyData) -> PyValue {
    let boxed = Box::new(PyBox {
        magic: PY_BOX_MAGIC,
        tag,
        rc: AtomicI64::new(1),
        data,
    });
    PyValue(Box::into_raw(boxed))
}

/// インターン済みの値（解放されない）を確保する。
fn alloc_interned(tag: i64, data: PyData) -> PyValue {
    let v = alloc_value(tag, data);
    if let Some(b) = v.get() {
        // 参照カウントを実質無限にして解放対象から外す
        b.rc.store(i64::MAX / 2, Ordering::SeqCst);
    }
    v
}

/// None のシングルトン。
static NONE_VALUE: Lazy<PyValue> = Lazy::new(|| alloc_interned(TAG_NONE, PyData::None));

/// 小整数 −5..=256 のインターン表。リテラルの共有参照になる。
pub const SMALL_INT_MIN: i64 = -5;
pub const SMALL_INT_MAX: i64 = 256;
static SMALL_INTS: Lazy<Vec<PyValue>> = Lazy::new(|| {
    (SMALL_INT_MIN..=SMALL_INT_MAX)
        .map(|n| alloc_interned(TAG_INT, PyData::Int(n)))
        .collect()
});

/// 値の中身から辞書キーを作る。キーにできない型は None。
pub fn dict_key_of(v: PyValue) -> Option<DictKey> {
    let b = v.get()?;
    match &b.data {
        PyData::Int(n) => Some(DictKey::Int(*n)),
        PyData::Bool(x) => Some(DictKey::Bool(*x)),
        PyData::Float(f) => Some(DictKey::FloatBits(f.to_bits())),
        PyData::Str(s) => Some(DictKey::Str(s.clone())),
        _ => None,
    }
}

/// 値の表示文字列（`str()` 相当）。
pub fn display_value(v: PyValue) -> String {
    let Some(b) = v.get() else {
        return "None".to_string();
    };
    match &b.data {
        PyData::None => "None".to_string(),
        PyData::Int(n) => n.to_string(),
        PyData::Float(f) => format_float(*f),
        PyData::Bool(x) => if *x { "True" } else { "False" }.to_string(),
        PyData::Str(s) => s.clone(),
        PyData::Bytes(bytes) => format!("b'{}'", String::from_utf8_lossy(bytes)),
        PyData::List(items) => {
            let items = items.lock().expect("list ロックは毒化しない");
            let parts: Vec<String> = items.iter().map(|i| repr_value(*i)).collect();
            format!("[{}]", parts.join(", "))
        }
        PyData::Tuple(items) => {
            let items = items.lock().expect("tuple ロックは毒化しない");
            let parts: Vec<String> = items.iter().map(|i| repr_value(*i)).collect();
            if parts.len() == 1 {
                format!("({},)", parts[0])
            } else {
                format!("({})", parts.join(", "))
            }
        }
        PyData::Dict(map) => {
            let map = map.lock().expect("dict ロックは毒化しない");
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", display_key(k), repr_value(*v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        PyData::Set(items) => {
            let items = items.lock().expect("set ロックは毒化しない");
            if items.is_empty() {
                return "set()".to_string();
            }
            let parts: Vec<String> = items.iter().map(display_key).collect();
            format!("{{{}}}", parts.join(", "))
        }
        PyData::StrBuf(buf) => buf.lock().expect("strbuf ロックは毒化しない").clone(),
        PyData::Big(big) => big.to_string(),
        PyData::DynObj { class_tag, .. } => format!("<object class={class_tag}>"),
        PyData::Task(_) => "<task>".to_string(),
    }
}

/// `repr()` 相当。文字列は引用符付きになる。
fn repr_value(v: PyValue) -> String {
    if let Some(b) = v.get() {
        if let PyData::Str(s) = &b.data {
            return format!("'{s}'");
        }
    }
    display_value(v)
}

fn display_key(k: &DictKey) -> String {
    match k {
        DictKey::Int(n) => n.to_string(),
        DictKey::Bool(x) => if *x { "True" } else { "False" }.to_string(),
        DictKey::FloatBits(bits) => format_float(f64::from_bits(*bits)),
        DictKey::Str(s) => format!("'{s}'"),
    }
}

/// 参照実装と同じく、整数値の浮動小数にも小数点を残す。
fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

// ---- extern 面 ----

/// ランタイム初期化。インターン表・アロケータ・スケジューラを立ち上げる。
#[no_mangle]
pub extern "C" fn py_rt_init() {
    Lazy::force(&NONE_VALUE);
    Lazy::force(&SMALL_INTS);
    crate::arena::init();
    crate::sched::init();
}

/// ランタイム終了処理。
#[no_mangle]
pub extern "C" fn py_rt_shutdown() {
    crate::pool::shutdown();
    crate::sched::shutdown();
    crate::arena::reset();
}

/// ゼロ初期化の生メモリ確保。生成コードのレコード・状態機械用。
#[no_mangle]
pub extern "C" fn py_alloc(size: usize) -> *mut c_void {
    crate::arena::alloc_zeroed(size)
}

#[no_mangle]
pub extern "C" fn py_retain(v: PyValue) {
    if let Some(b) = v.get() {
        b.rc.fetch_add(1, Ordering::SeqCst);
    }
}

#[no_mangle]
pub extern "C" fn py_release(v: PyValue) {
    let Some(b) = v.get() else {
        return;
    };
    if b.rc.fetch_sub(1, Ordering::SeqCst) == 1 {
        let boxed = unsafe { Box::from_raw(v.0) };
        release_children(&boxed.data);
        drop(boxed);
    }
}

fn release_children(data: &PyData) {
    match data {
        PyData::List(items) | PyData::Tuple(items) => {
            let items = items.lock().expect("container ロックは毒化しない");
            for item in items.iter() {
                py_release(*item);
            }
        }
        PyData::Dict(map) => {
            let map = map.lock().expect("dict ロックは毒化しない");
            for value in map.values() {
                py_release(*value);
            }
        }
        PyData::DynObj { attrs, .. } => {
            let attrs = attrs.lock().expect("attrs ロックは毒化しない");
            for value in attrs.values() {
                py_release(*value);
            }
        }
        _ => {}
    }
}

#[no_mangle]
pub extern "C" fn py_none() -> PyValue {
    *NONE_VALUE
}

/// 小整数のインターン参照。範囲外は通常のボックスにフォールバックする。
#[no_mangle]
pub extern "C" fn py_small_int(v: i64) -> PyValue {
    if (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&v) {
        SMALL_INTS[(v - SMALL_INT_MIN) as usize]
    } else {
        alloc_value(TAG_INT, PyData::Int(v))
    }
}

#[no_mangle]
pub extern "C" fn py_int_box(v: i64) -> PyValue {
    py_small_int(v)
}

#[no_mangle]
pub extern "C" fn py_int_unbox(v: PyValue) -> i64 {
    match v.get().map(|b| &b.data) {
        Some(PyData::Int(n)) => *n,
        Some(PyData::Bool(x)) => i64::from(*x),
        Some(PyData::Float(f)) => *f as i64,
        _ => 0,
    }
}

#[no_mangle]
pub extern "C" fn py_float_box(v: f64) -> PyValue {
    alloc_value(TAG_FLOAT, PyData::Float(v))
}

#[no_mangle]
pub extern "C" fn py_float_unbox(v: PyValue) -> f64 {
    match v.get().map(|b| &b.data) {
        Some(PyData::Float(f)) => *f,
        Some(PyData::Int(n)) => *n as f64,
        _ => 0.0,
    }
}

#[no_mangle]
pub extern "C" fn py_bool_box(v: bool) -> PyValue {
    alloc_value(TAG_BOOL, PyData::Bool(v))
}

#[no_mangle]
pub extern "C" fn py_bool_unbox(v: PyValue) -> bool {
    py_truthy(v)
}

#[no_mangle]
pub extern "C" fn py_obj_tag(v: PyValue) -> i64 {
    match v.get() {
        Some(b) => match &b.data {
            // 動的オブジェクトはクラスタグで答える
            PyData::DynObj { class_tag, .. } => *class_tag,
            _ => b.tag,
        },
        None => TAG_NONE,
    }
}

/// 真偽値化。空コンテナ・0・None は偽。
#[no_mangle]
pub extern "C" fn py_truthy(v: PyValue) -> bool {
    let Some(b) = v.get() else {
        return false;
    };
    match &b.data {
        PyData::None => false,
        PyData::Int(n) => *n != 0,
        PyData::Float(f) => *f != 0.0,
        PyData::Bool(x) => *x,
        PyData::Str(s) => !s.is_empty(),
        PyData::Bytes(bytes) => !bytes.is_empty(),
        PyData::List(items) | PyData::Tuple(items) => {
            !items.lock().expect("container ロックは毒化しない").is_empty()
        }
        PyData::Dict(map) => !map.lock().expect("dict ロックは毒化しない").is_empty(),
        PyData::Set(items) => !items.lock().expect("set ロックは毒化しない").is_empty(),
        PyData::Big(big) => !big.is_zero(),
        _ => true,
    }
}

/// 構造的等価。型が異なる数値同士は数値として比較する。
#[no_mangle]
pub extern "C" fn py_obj_eq(a: PyValue, b: PyValue) -> bool {
    if a.0 == b.0 {
        return true;
    }
    let (Some(ba), Some(bb)) = (a.get(), b.get()) else {
        return a.is_null() && b.is_null();
    };
    match (&ba.data, &bb.data) {
        (PyData::Int(x), PyData::Int(y)) => x == y,
        (PyData::Float(x), PyData::Float(y)) => x == y,
        (PyData::Int(x), PyData::Float(y)) | (PyData::Float(y), PyData::Int(x)) => {
            *x as f64 == *y
        }
        (PyData::Bool(x), PyData::Bool(y)) => x == y,
        (PyData::Str(x), PyData::Str(y)) => x == y,
        (PyData::Bytes(x), PyData::Bytes(y)) => x == y,
        (PyData::None, PyData::None) => true,
        (PyData::List(x), PyData::List(y)) | (PyData::Tuple(x), PyData::Tuple(y)) => {
            let x = x.lock().expect("container ロックは毒化しない");
            let y = y.lock().expect("container ロックは毒化しない");
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| py_obj_eq(*a, *b))
        }
        (PyData::Big(x), PyData::Big(y)) => x.cmp_big(y) == std::cmp::Ordering::Equal,
        _ => false,
    }
}

// ---- 文字列 ----

#[no_mangle]
pub extern "C" fn py_str_new(ptr: *const u8, len: usize) -> PyValue {
    let body = if ptr.is_null() || len == 0 {
        String::new()
    } else {
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        String::from_utf8_lossy(bytes).into_owned()
    };
    alloc_value(TAG_STR, PyData::Str(body))
}

#[no_mangle]
pub extern "C" fn py_str_concat(a: PyValue, b: PyValue) -> PyValue {
    let mut out = String::new();
    if let Some(PyData::Str(s)) = a.get().map(|x| &x.data) {
        out.push_str(s);
    }
    if let Some(PyData::Str(s)) = b.get().map(|x| &x.data) {
        out.push_str(s);
    }
    alloc_value(TAG_STR, PyData::Str(out))
}

#[no_mangle]
pub extern "C" fn py_str_repeat(s: PyValue, n: i64) -> PyValue {
    let body = match s.get().map(|x| &x.data) {
        Some(PyData::Str(s)) if n > 0 => s.repeat(n as usize),
        _ => String::new(),
    };
    alloc_value(TAG_STR, PyData::Str(body))
}

/// 文字数（バイト数ではない）。bytes はバイト数。
#[no_mangle]
pub extern "C" fn py_str_len(s: PyValue) -> i64 {
    match s.get().map(|x| &x.data) {
        Some(PyData::Str(s)) => s.chars().count() as i64,
        Some(PyData::Bytes(bytes)) => bytes.len() as i64,
        Some(PyData::StrBuf(buf)) => {
            buf.lock().expect("strbuf ロックは毒化しない").chars().count() as i64
        }
        _ => 0,
    }
}

#[no_mangle]
pub extern "C" fn py_str_eq(a: PyValue, b: PyValue) -> bool {
    match (a.get().map(|x| &x.data), b.get().map(|x| &x.data)) {
        (Some(PyData::Str(x)), Some(PyData::Str(y))) => x == y,
        _ => false,
    }
}

/// 添字アクセス。負の添字は末尾からの位置。
#[no_mangle]
pub extern "C" fn py_str_index(s: PyValue, i: i64) -> PyValue {
    let body = match s.get().map(|x| &x.data) {
        Some(PyData::Str(s)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = if i < 0 { chars.len() as i64 + i } else { i };
            if idx >= 0 && (idx as usize) < chars.len() {
                chars[idx as usize].to_string()
            } else {
                crate::error::raise_index_error();
                String::new()
            }
        }
        _ => String::new(),
    };
    alloc_value(TAG_STR, PyData::Str(body))
}

#[no_mangle]
pub extern "C" fn py_to_str(v: PyValue) -> PyValue {
    alloc_value(TAG_STR, PyData::Str(display_value(v)))
}

// ---- 文字列ビルダ（f-string 用） ----

#[no_mangle]
pub extern "C" fn py_strbuf_new() -> PyValue {
    alloc_value(TAG_STRBUF, PyData::StrBuf(Mutex::new(String::new())))
}

#[no_mangle]
pub extern "C" fn py_strbuf_push(sb: PyValue, v: PyValue) {
    if let Some(PyData::StrBuf(buf)) = sb.get().map(|x| &x.data) {
        buf.lock()
            .expect("strbuf ロックは毒化しない")
            .push_str(&display_value(v));
    }
}

#[no_mangle]
pub extern "C" fn py_strbuf_finish(sb: PyValue) -> PyValue {
    let body = match sb.get().map(|x| &x.data) {
        Some(PyData::StrBuf(buf)) => buf.lock().expect("strbuf ロックは毒化しない").clone(),
        _ => String::new(),
    };
    py_release(sb);
    alloc_value(TAG_STR, PyData::Str(body))
}

// ---- 出力 ----

#[no_mangle]
pub extern "C" fn py_print_obj(v: PyValue) {
    println!("{}", display_value(v));
}

#[no_mangle]
pub extern "C" fn py_print_int(v: i64) {
    println!("{v}");
}

#[no_mangle]
pub extern "C" fn py_print_float(v: f64) {
    println!("{}", format_float(v));
}

#[no_mangle]
pub extern "C" fn py_print_bool(v: bool) {
    println!("{}", if v { "True" } else { "False" });
}

#[no_mangle]
pub extern "C" fn py_print_none() {
    println!("None");
}

// ---- 動的属性オブジェクト（open レイアウト） ----

#[no_mangle]
pub extern "C" fn py_obj_new_dynamic(class_tag: i64) -> PyValue {
    alloc_value(
        class_tag,
        PyData::DynObj {
            class_tag,
            attrs: Mutex::new(BTreeMap::new()),
        },
    )
}

#[no_mangle]
pub extern "C" fn py_attr_get(o: PyValue, name: *const u8, len: usize) -> PyValue {
    let key = name_str(name, len);
    if let Some(PyData::DynObj { attrs, .. }) = o.get().map(|x| &x.data) {
        if let Some(v) = attrs.lock().expect("attrs ロックは毒化しない").get(&key) {
            py_retain(*v);
            return *v;
        }
    }
    crate::error::raise_attribute_error(&key);
    py_none()
}

#[no_mangle]
pub extern "C" fn py_attr_set(o: PyValue, name: *const u8, len: usize, v: PyValue) {
    let key = name_str(name, len);
    if let Some(PyData::DynObj { attrs, .. }) = o.get().map(|x| &x.data) {
        py_retain(v);
        if let Some(old) = attrs
            .lock()
            .expect("attrs ロックは毒化しない")
            .insert(key, v)
        {
            py_release(old);
        }
    }
}

/// 属性の存在検査。動的オブジェクト以外は常に偽。
#[no_mangle]
pub extern "C" fn py_attr_has(o: PyValue, name: *const u8, len: usize) -> bool {
    let key = name_str(name, len);
    if let Some(PyData::DynObj { attrs, .. }) = o.get().map(|x| &x.data) {
        return attrs
            .lock()
            .expect("attrs ロックは毒化しない")
            .contains_key(&key);
    }
    false
}

fn name_str(name: *const u8, len: usize) -> String {
    if name.is_null() || len == 0 {
        return String::new();
    }
    let bytes = unsafe { std::slice::from_raw_parts(name, len) };
    String::from_utf8_lossy(bytes).into_owned()
}
