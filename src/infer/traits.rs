// パス: src/infer/traits.rs
// 役割: 関数ごとに推論される特性レコードを定義する
// 意図: コード生成の形状選択を特性の純関数として成立させる
// 関連ファイル: src/infer/mod.rs, src/infer/flow.rs, src/emit/zig.rs
//! 関数特性モジュール
//!
//! - 特性は呼び出しグラフ上の単調な不動点として計算される。
//! - いったん true になったフラグが false へ戻ることはない。
//! - `is_pure` だけは他フラグの否定を含むため、不動点の最後に確定する。

/// 関数 1 つ分の推論済み特性。エミッタの形状選択はこのレコードの純関数になる。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FunctionTraits {
    /// 本体に `await` を含むか、`may_await` な呼び先を持つ。
    pub may_await: bool,
    /// I/O プリミティブ（ファイル・ソケット・タイマー・標準入出力）へ到達する。
    pub does_io: bool,
    /// 仮引数 i がストア先（属性・添字・変更系メソッド）に到達する。
    pub mutates_param: Vec<bool>,
    /// 到達可能な `raise` があるか、`can_fail` な呼び先を持つ。
    pub can_fail: bool,
    /// ヒープ構造（リスト・辞書・文字列連結など）を構築する。
    pub needs_allocator: bool,
    /// I/O なし・引数変更なし・失敗なし・呼び先もすべて純粋。
    pub is_pure: bool,
    /// すべての自己再帰呼び出しが末尾位置にある。
    pub is_tail_recursive: bool,
    /// 本体に `yield` を含む。
    pub is_generator: bool,
    /// 外側スコープから捕獲した変数名。
    pub captured_vars: Vec<String>,
    /// 静的に解決された呼び先キーの一覧。
    pub callees: Vec<String>,
}

impl FunctionTraits {
    /// 仮引数の本数に合わせて初期化する。
    pub fn with_param_count(count: usize) -> Self {
        Self {
            mutates_param: vec![false; count],
            is_tail_recursive: true,
            ..Self::default()
        }
    }

    /// 別の観測結果を単調に取り込む。戻り値は変化があったかどうか。
    pub fn absorb(&mut self, other: &FunctionTraits) -> bool {
        let mut changed = false;
        changed |= rise(&mut self.may_await, other.may_await);
        changed |= rise(&mut self.does_io, other.does_io);
        changed |= rise(&mut self.can_fail, other.can_fail);
        changed |= rise(&mut self.needs_allocator, other.needs_allocator);
        changed |= rise(&mut self.is_generator, other.is_generator);
        if !other.is_tail_recursive && self.is_tail_recursive {
            self.is_tail_recursive = false;
            changed = true;
        }
        for (slot, v) in self.mutates_param.iter_mut().zip(&other.mutates_param) {
            changed |= rise(slot, *v);
        }
        for callee in &other.callees {
            if !self.callees.contains(callee) {
                self.callees.push(callee.clone());
                changed = true;
            }
        }
        for var in &other.captured_vars {
            if !self.captured_vars.contains(var) {
                self.captured_vars.push(var.clone());
                changed = true;
            }
        }
        changed
    }

    /// 呼び先の特性を呼び出し側へ伝播させる。戻り値は変化があったかどうか。
    pub fn absorb_callee(&mut self, callee: &FunctionTraits) -> bool {
        let mut changed = false;
        changed |= rise(&mut self.may_await, callee.may_await);
        changed |= rise(&mut self.does_io, callee.does_io);
        changed |= rise(&mut self.can_fail, callee.can_fail);
        changed
    }
}

/// false → true の単調遷移だけを許すヘルパ。
fn rise(slot: &mut bool, value: bool) -> bool {
    if value && !*slot {
        *slot = true;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// absorb が単調（true が false に戻らない）であることを確認する。
    fn absorb_is_monotone() {
        let mut a = FunctionTraits::with_param_count(1);
        let mut b = FunctionTraits::with_param_count(1);
        b.does_io = true;
        assert!(a.absorb(&b));
        assert!(!a.absorb(&b));
        assert!(a.does_io);
        let clean = FunctionTraits::with_param_count(1);
        assert!(!a.absorb(&clean));
        assert!(a.does_io);
    }
}
