// パス: runtime_native/src/bigint.rs
// 役割: 固定幅を超えた整数リテラルを支える最小の多倍長整数を提供する
// 意図: 昇格後も算術が多倍長型のまま閉じるようにする
// 関連ファイル: runtime_native/src/value.rs, tests/runtime.rs
//! 多倍長整数モジュール
//!
//! - 符号 + 32bit リム列（下位から）の素朴な表現。
//! - 加減乗と比較と 10 進表示だけを実装する。固定幅を超えるリテラルの
//!   昇格先として十分な範囲に絞る。

use std::cmp::Ordering;

use crate::value::{alloc_value, PyData, PyValue, TAG_BIGINT};

const BASE: u64 = 1 << 32;

/// 符号と絶対値のリム列。リムは下位桁から並ぶ。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BigInt {
    negative: bool,
    limbs: Vec<u32>,
}

impl BigInt {
    pub fn zero() -> Self {
        Self {
            negative: false,
            limbs: Vec::new(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    pub fn from_i64(v: i64) -> Self {
        let negative = v < 0;
        let mut mag = v.unsigned_abs();
        let mut limbs = Vec::new();
        while mag > 0 {
            limbs.push((mag & 0xffff_ffff) as u32);
            mag >>= 32;
        }
        Self { negative, limbs }
    }

    /// 10 進・16 進（0x）・8 進（0o）・2 進（0b）の文字列から解析する。
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (negative, rest) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (radix, digits) = if let Some(d) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
            (16u32, d)
        } else if let Some(d) = rest.strip_prefix("0o").or_else(|| rest.strip_prefix("0O")) {
            (8, d)
        } else if let Some(d) = rest.strip_prefix("0b").or_else(|| rest.strip_prefix("0B")) {
            (2, d)
        } else {
            (10, rest)
        };
        if digits.is_empty() {
            return None;
        }
        let mut out = Self::zero();
        for ch in digits.chars() {
            if ch == '_' {
                continue;
            }
            let digit = ch.to_digit(radix)?;
            out = out.mul_small(radix as u64);
            out = out.add_small(digit as u64);
        }
        out.negative = negative && !out.is_zero();
        Some(out)
    }

    fn trim(mut self) -> Self {
        while self.limbs.last() == Some(&0) {
            self.limbs.pop();
        }
        if self.limbs.is_empty() {
            self.negative = false;
        }
        self
    }

    fn mul_small(&self, factor: u64) -> Self {
        let mut limbs = Vec::with_capacity(self.limbs.len() + 1);
        let mut carry = 0u64;
        for limb in &self.limbs {
            let cur = *limb as u64 * factor + carry;
            limbs.push((cur % BASE) as u32);
            carry = cur / BASE;
        }
        while carry > 0 {
            limbs.push((carry % BASE) as u32);
            carry /= BASE;
        }
        Self {
            negative: self.negative,
            limbs,
        }
        .trim()
    }

    fn add_small(&self, addend: u64) -> Self {
        let mut limbs = self.limbs.clone();
        let mut carry = addend;
        let mut i = 0;
        while carry > 0 {
            if i == limbs.len() {
                limbs.push(0);
            }
            let cur = limbs[i] as u64 + (carry % BASE);
            limbs[i] = (cur % BASE) as u32;
            carry = carry / BASE + cur / BASE;
            i += 1;
        }
        Self {
            negative: self.negative,
            limbs,
        }
        .trim()
    }

    /// 絶対値の比較。
    fn cmp_mag(&self, other: &Self) -> Ordering {
        if self.limbs.len() != other.limbs.len() {
            return self.limbs.len().cmp(&other.limbs.len());
        }
        for (a, b) in self.limbs.iter().rev().zip(other.limbs.iter().rev()) {
            if a != b {
                return a.cmp(b);
            }
        }
        Ordering::Equal
    }

    /// 符号付きの比較。
    pub fn cmp_big(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => self.cmp_mag(other),
            (true, true) => other.cmp_mag(self),
        }
    }

    fn add_mag(a: &[u32], b: &[u32]) -> Vec<u32> {
        let mut out = Vec::with_capacity(a.len().max(b.len()) + 1);
        let mut carry = 0u64;
        for i in 0..a.len().max(b.len()) {
            let x = a.get(i).copied().unwrap_or(0) as u64;
            let y = b.get(i).copied().unwrap_or(0) as u64;
            let cur = x + y + carry;
            out.push((cur % BASE) as u32);
            carry = cur / BASE;
        }
        if carry > 0 {
            out.push(carry as u32);
        }
        out
    }

    /// 前提: |a| >= |b|。
    fn sub_mag(a: &[u32], b: &[u32]) -> Vec<u32> {
        let mut out = Vec::with_capacity(a.len());
        let mut borrow = 0i64;
        for i in 0..a.len() {
            let x = a[i] as i64;
            let y = b.get(i).copied().unwrap_or(0) as i64;
            let mut cur = x - y - borrow;
            if cur < 0 {
                cur += BASE as i64;
                borrow = 1;
            } else {
                borrow = 0;
            }
            out.push(cur as u32);
        }
        out
    }

    pub fn add_big(&self, other: &Self) -> Self {
        if self.negative == other.negative {
            return Self {
                negative: self.negative,
                limbs: Self::add_mag(&self.limbs, &other.limbs),
            }
            .trim();
        }
        match self.cmp_mag(other) {
            Ordering::Equal => Self::zero(),
            Ordering::Greater => Self {
                negative: self.negative,
                limbs: Self::sub_mag(&self.limbs, &other.limbs),
            }
            .trim(),
            Ordering::Less => Self {
                negative: other.negative,
                limbs: Self::sub_mag(&other.limbs, &self.limbs),
            }
            .trim(),
        }
    }

    pub fn sub_big(&self, other: &Self) -> Self {
        let negated = Self {
            negative: !other.negative,
            limbs: other.limbs.clone(),
        };
        self.add_big(&negated)
    }

    pub fn mul_big(&self, other: &Self) -> Self {
        if self.is_zero() || other.is_zero() {
            return Self::zero();
        }
        let mut limbs = vec![0u32; self.limbs.len() + other.limbs.len()];
        for (i, a) in self.limbs.iter().enumerate() {
            let mut carry = 0u64;
            for (j, b) in other.limbs.iter().enumerate() {
                let cur = limbs[i + j] as u64 + *a as u64 * *b as u64 + carry;
                limbs[i + j] = (cur % BASE) as u32;
                carry = cur / BASE;
            }
            let mut k = i + other.limbs.len();
            while carry > 0 {
                let cur = limbs[k] as u64 + carry;
                limbs[k] = (cur % BASE) as u32;
                carry = cur / BASE;
                k += 1;
            }
        }
        Self {
            negative: self.negative != other.negative,
            limbs,
        }
        .trim()
    }
}

impl std::fmt::Display for BigInt {
    /// 10 進表示。リム列を繰り返し 10^9 で割って桁を作る。
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_zero() {
            return write!(f, "0");
        }
        const CHUNK: u64 = 1_000_000_000;
        let mut limbs = self.limbs.clone();
        let mut chunks = Vec::new();
        while !limbs.is_empty() {
            let mut rem = 0u64;
            let mut next = Vec::with_capacity(limbs.len());
            for limb in limbs.iter().rev() {
                let cur = rem * BASE + *limb as u64;
                next.push((cur / CHUNK) as u32);
                rem = cur % CHUNK;
            }
            next.reverse();
            while next.last() == Some(&0) {
                next.pop();
            }
            chunks.push(rem);
            limbs = next;
        }
        if self.negative {
            write!(f, "-")?;
        }
        write!(f, "{}", chunks.last().expect("0 は早期処理済み"))?;
        for chunk in chunks.iter().rev().skip(1) {
            write!(f, "{chunk:09}")?;
        }
        Ok(())
    }
}

// ---- extern 面 ----

fn big_of(v: PyValue) -> BigInt {
    match v.get().map(|b| &b.data) {
        Some(PyData::Big(big)) => big.clone(),
        Some(PyData::Int(n)) => BigInt::from_i64(*n),
        _ => BigInt::zero(),
    }
}

#[no_mangle]
pub extern "C" fn py_bigint_from_str(ptr: *const u8, len: usize) -> PyValue {
    let text = if ptr.is_null() || len == 0 {
        String::new()
    } else {
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        String::from_utf8_lossy(bytes).into_owned()
    };
    let big = BigInt::parse(&text).unwrap_or_else(BigInt::zero);
    alloc_value(TAG_BIGINT, PyData::Big(big))
}

#[no_mangle]
pub extern "C" fn py_bigint_add(a: PyValue, b: PyValue) -> PyValue {
    alloc_value(TAG_BIGINT, PyData::Big(big_of(a).add_big(&big_of(b))))
}

#[no_mangle]
pub extern "C" fn py_bigint_sub(a: PyValue, b: PyValue) -> PyValue {
    alloc_value(TAG_BIGINT, PyData::Big(big_of(a).sub_big(&big_of(b))))
}

#[no_mangle]
pub extern "C" fn py_bigint_mul(a: PyValue, b: PyValue) -> PyValue {
    alloc_value(TAG_BIGINT, PyData::Big(big_of(a).mul_big(&big_of(b))))
}

#[no_mangle]
pub extern "C" fn py_bigint_cmp(a: PyValue, b: PyValue) -> i32 {
    match big_of(a).cmp_big(&big_of(b)) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// 固定幅を超えるリテラルの解析と表示の往復を確認する。
    fn parse_display_roundtrip_beyond_i64() {
        let text = "123456789012345678901234567890";
        let big = BigInt::parse(text).expect("parse");
        assert_eq!(big.to_string(), text);
    }

    #[test]
    /// 加減乗が符号を含めて一貫することを確認する。
    fn arithmetic_preserves_sign() {
        let a = BigInt::parse("99999999999999999999").expect("parse");
        let b = BigInt::from_i64(1);
        assert_eq!(a.add_big(&b).to_string(), "100000000000000000000");
        assert_eq!(b.sub_big(&a).to_string(), "-99999999999999999998");
        let sq = a.mul_big(&a);
        assert_eq!(sq.to_string(), "9999999999999999999800000000000000000001");
        assert_eq!(a.cmp_big(&b), Ordering::Greater);
    }

    #[test]
    /// 16 進の解析を確認する。
    fn hex_parse() {
        let big = BigInt::parse("0xffffffffffffffffff").expect("parse");
        assert_eq!(big.to_string(), "4722366482869645213695");
    }
}
