// パス: runtime_native/src/arena.rs
// 役割: バンプポインタ式アリーナと生成コード向けのゼロ初期化確保を提供する
// 意図: 一時構造の確保をフェーズ間リセットできる単純な割り当てに寄せる
// 関連ファイル: runtime_native/src/value.rs, runtime_native/src/lib.rs
//! アリーナアロケータ
//!
//! - チャンク単位で確保し、ポインタを進めるだけで払い出す。
//! - `reset` はチャンクを捨てて空へ戻す。リセット後の確保は常に
//!   ゼロ初期化済みの新しいメモリから切り出される。
//! - レコード・状態機械など生成コードの確保（`py_alloc`）もここを通る。

use std::ffi::c_void;
use std::sync::Mutex;

use once_cell::sync::Lazy;

const CHUNK_SIZE: usize = 1 << 20;
const ALIGN: usize = 16;

struct Arena {
    chunks: Vec<Box<[u8]>>,
    offset: usize,
}

impl Arena {
    const fn new() -> Self {
        Self {
            chunks: Vec::new(),
            offset: 0,
        }
    }

    fn alloc(&mut self, size: usize) -> *mut u8 {
        let size = (size.max(1) + ALIGN - 1) & !(ALIGN - 1);
        if size > CHUNK_SIZE {
            // 大きな要求は専用チャンクにする
            let chunk = vec![0u8; size].into_boxed_slice();
            let ptr = chunk.as_ptr() as *mut u8;
            self.chunks.push(chunk);
            return ptr;
        }
        let need_new = match self.chunks.last() {
            Some(chunk) => self.offset + size > chunk.len(),
            None => true,
        };
        if need_new {
            self.chunks.push(vec![0u8; CHUNK_SIZE].into_boxed_slice());
            self.offset = 0;
        }
        let chunk = self.chunks.last().expect("直前に確保済み");
        let ptr = unsafe { chunk.as_ptr().add(self.offset) as *mut u8 };
        self.offset += size;
        ptr
    }

    fn reset(&mut self) {
        self.chunks.clear();
        self.offset = 0;
    }
}

static ARENA: Lazy<Mutex<Arena>> = Lazy::new(|| Mutex::new(Arena::new()));

pub fn init() {
    Lazy::force(&ARENA);
}

/// ゼロ初期化済みメモリを払い出す。
pub fn alloc_zeroed(size: usize) -> *mut c_void {
    ARENA
        .lock()
        .expect("arena ロックは毒化しない")
        .alloc(size) as *mut c_void
}

/// フェーズ境界でのリセット。払い出し済みポインタは無効になる。
pub fn reset() {
    ARENA.lock().expect("arena ロックは毒化しない").reset();
}

/// extern 面: 一時構造向けの明示アリーナ確保。
#[no_mangle]
pub extern "C" fn py_arena_alloc(size: usize) -> *mut c_void {
    alloc_zeroed(size)
}

/// extern 面: フェーズ間リセット。
#[no_mangle]
pub extern "C" fn py_arena_reset() {
    reset();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// 払い出しが整列済みでゼロ初期化されていることを確認する。
    fn allocations_are_aligned_and_zeroed() {
        let p = alloc_zeroed(40) as usize;
        assert_eq!(p % ALIGN, 0);
        let bytes = unsafe { std::slice::from_raw_parts(p as *const u8, 40) };
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
