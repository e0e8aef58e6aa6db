// パス: runtime_native/src/containers.rs
// 役割: リスト・タプル・辞書・集合のコンテナ操作 extern 面を提供する
// 意図: 生成コードのコンテナ語彙をロック付きの安全な実装に閉じ込める
// 関連ファイル: runtime_native/src/value.rs, runtime_native/src/error.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::error::{raise_index_error, raise_key_error};
use crate::value::{
    alloc_value, dict_key_of, py_obj_eq, py_release, py_retain, PyData, PyValue, TAG_DICT,
    TAG_LIST, TAG_SET, TAG_TUPLE,
};

/// 容量ヒント付きでリストを確保する。内包表記は既知長をここへ渡す。
#[no_mangle]
pub extern "C" fn py_list_new(cap: i64) -> PyValue {
    let cap = cap.max(0) as usize;
    alloc_value(TAG_LIST, PyData::List(Mutex::new(Vec::with_capacity(cap))))
}

#[no_mangle]
pub extern "C" fn py_list_append(l: PyValue, v: PyValue) {
    if let Some(PyData::List(items)) = l.get().map(|x| &x.data) {
        py_retain(v);
        items.lock().expect("list ロックは毒化しない").push(v);
    }
}

#[no_mangle]
pub extern "C" fn py_list_len(l: PyValue) -> i64 {
    match l.get().map(|x| &x.data) {
        Some(PyData::List(items)) => items.lock().expect("list ロックは毒化しない").len() as i64,
        Some(PyData::Tuple(items)) => items.lock().expect("tuple ロックは毒化しない").len() as i64,
        _ => 0,
    }
}

#[no_mangle]
pub extern "C" fn py_list_get(l: PyValue, i: i64) -> PyValue {
    if let Some(PyData::List(items)) = l.get().map(|x| &x.data) {
        let items = items.lock().expect("list ロックは毒化しない");
        let idx = if i < 0 { items.len() as i64 + i } else { i };
        if idx >= 0 && (idx as usize) < items.len() {
            let v = items[idx as usize];
            py_retain(v);
            return v;
        }
        raise_index_error();
    }
    crate::value::py_none()
}

#[no_mangle]
pub extern "C" fn py_list_set(l: PyValue, i: i64, v: PyValue) {
    if let Some(PyData::List(items)) = l.get().map(|x| &x.data) {
        let mut items = items.lock().expect("list ロックは毒化しない");
        let idx = if i < 0 { items.len() as i64 + i } else { i };
        if idx >= 0 && (idx as usize) < items.len() {
            py_retain(v);
            let old = std::mem::replace(&mut items[idx as usize], v);
            py_release(old);
            return;
        }
    }
    raise_index_error();
}

#[no_mangle]
pub extern "C" fn py_list_pop(l: PyValue) -> PyValue {
    if let Some(PyData::List(items)) = l.get().map(|x| &x.data) {
        if let Some(v) = items.lock().expect("list ロックは毒化しない").pop() {
            return v;
        }
        raise_index_error();
    }
    crate::value::py_none()
}

#[no_mangle]
pub extern "C" fn py_list_concat(a: PyValue, b: PyValue) -> PyValue {
    let out = py_list_new(py_list_len(a) + py_list_len(b));
    for src in [a, b] {
        if let Some(PyData::List(items)) = src.get().map(|x| &x.data) {
            let items = items.lock().expect("list ロックは毒化しない");
            for item in items.iter() {
                py_list_append(out, *item);
            }
        }
    }
    out
}

#[no_mangle]
pub extern "C" fn py_list_contains(l: PyValue, v: PyValue) -> bool {
    if let Some(PyData::List(items)) = l.get().map(|x| &x.data) {
        let items = items.lock().expect("list ロックは毒化しない");
        return items.iter().any(|item| py_obj_eq(*item, v));
    }
    false
}

// ---- タプル ----

#[no_mangle]
pub extern "C" fn py_tuple_new(n: i64) -> PyValue {
    let n = n.max(0) as usize;
    let items = vec![crate::value::py_none(); n];
    alloc_value(TAG_TUPLE, PyData::Tuple(Mutex::new(items)))
}

#[no_mangle]
pub extern "C" fn py_tuple_set(t: PyValue, i: i64, v: PyValue) {
    if let Some(PyData::Tuple(items)) = t.get().map(|x| &x.data) {
        let mut items = items.lock().expect("tuple ロックは毒化しない");
        if i >= 0 && (i as usize) < items.len() {
            py_retain(v);
            items[i as usize] = v;
        }
    }
}

#[no_mangle]
pub extern "C" fn py_tuple_get(t: PyValue, i: i64) -> PyValue {
    if let Some(PyData::Tuple(items)) = t.get().map(|x| &x.data) {
        let items = items.lock().expect("tuple ロックは毒化しない");
        if i >= 0 && (i as usize) < items.len() {
            let v = items[i as usize];
            py_retain(v);
            return v;
        }
        raise_index_error();
    }
    crate::value::py_none()
}

// ---- 辞書 ----

#[no_mangle]
pub extern "C" fn py_dict_new() -> PyValue {
    alloc_value(TAG_DICT, PyData::Dict(Mutex::new(BTreeMap::new())))
}

#[no_mangle]
pub extern "C" fn py_dict_set(d: PyValue, k: PyValue, v: PyValue) {
    let Some(key) = dict_key_of(k) else {
        return;
    };
    if let Some(PyData::Dict(map)) = d.get().map(|x| &x.data) {
        py_retain(v);
        if let Some(old) = map.lock().expect("dict ロックは毒化しない").insert(key, v) {
            py_release(old);
        }
    }
}

#[no_mangle]
pub extern "C" fn py_dict_get(d: PyValue, k: PyValue) -> PyValue {
    if let (Some(key), Some(PyData::Dict(map))) = (dict_key_of(k), d.get().map(|x| &x.data)) {
        if let Some(v) = map.lock().expect("dict ロックは毒化しない").get(&key) {
            py_retain(*v);
            return *v;
        }
        raise_key_error();
    }
    crate::value::py_none()
}

#[no_mangle]
pub extern "C" fn py_dict_len(d: PyValue) -> i64 {
    match d.get().map(|x| &x.data) {
        Some(PyData::Dict(map)) => map.lock().expect("dict ロックは毒化しない").len() as i64,
        _ => 0,
    }
}

#[no_mangle]
pub extern "C" fn py_dict_contains(d: PyValue, k: PyValue) -> bool {
    if let (Some(key), Some(PyData::Dict(map))) = (dict_key_of(k), d.get().map(|x| &x.data)) {
        return map
            .lock()
            .expect("dict ロックは毒化しない")
            .contains_key(&key);
    }
    false
}

// ---- 集合 ----

#[no_mangle]
pub extern "C" fn py_set_new() -> PyValue {
    alloc_value(TAG_SET, PyData::Set(Mutex::new(BTreeSet::new())))
}

#[no_mangle]
pub extern "C" fn py_set_add(s: PyValue, v: PyValue) {
    if let (Some(key), Some(PyData::Set(items))) = (dict_key_of(v), s.get().map(|x| &x.data)) {
        items.lock().expect("set ロックは毒化しない").insert(key);
    }
}

#[no_mangle]
pub extern "C" fn py_set_len(s: PyValue) -> i64 {
    match s.get().map(|x| &x.data) {
        Some(PyData::Set(items)) => items.lock().expect("set ロックは毒化しない").len() as i64,
        _ => 0,
    }
}

#[no_mangle]
pub extern "C" fn py_set_contains(s: PyValue, v: PyValue) -> bool {
    if let (Some(key), Some(PyData::Set(items))) = (dict_key_of(v), s.get().map(|x| &x.data)) {
        return items.lock().expect("set ロックは毒化しない").contains(&key);
    }
    false
}
