// パス: src/pkg/version.rs
// 役割: 版識別子の解析・全順序比較・制約判定を実装する
// 意図: 依存解決が公開仕様どおりの順序と一致判定に依拠できるようにする
// 関連ファイル: src/pkg/resolve.rs, src/pkg/mod.rs, tests/version_pkg.rs
//! 版代数モジュール
//!
//! - 版は `(epoch, release[], pre?, post?, dev?, local?)` の順序付きタプル。
//! - 受理した文字列の集合の上で全順序になる。任意の 2 つの版について
//!   `<` `=` `>` のちょうど 1 つが成り立つ。
//! - `1.0` と `1.0.0` は等しい。`1.0a1 < 1.0`。`1.0.dev1 < 1.0a1`。
//! - ローカルラベル（`+` 以降）はセグメント単位で比較し、`==` では
//!   無視されない（`===` のみ厳密一致）。
//! - 互換リリース演算子 `~=` は範囲へ脱糖する。

use std::cmp::Ordering;
use std::fmt;

use super::PkgError;

/// プレリリースの種別。`a < b < rc < release` の順。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreKind {
    Alpha,
    Beta,
    Rc,
}

impl PreKind {
    fn label(self) -> &'static str {
        match self {
            PreKind::Alpha => "a",
            PreKind::Beta => "b",
            PreKind::Rc => "rc",
        }
    }
}

/// ローカルラベルのセグメント。数値は英字より大きい。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalSeg {
    Alpha(String),
    Num(u64),
}

impl PartialOrd for LocalSeg {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LocalSeg {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (LocalSeg::Num(a), LocalSeg::Num(b)) => a.cmp(b),
            (LocalSeg::Alpha(a), LocalSeg::Alpha(b)) => a.cmp(b),
            (LocalSeg::Num(_), LocalSeg::Alpha(_)) => Ordering::Greater,
            (LocalSeg::Alpha(_), LocalSeg::Num(_)) => Ordering::Less,
        }
    }
}

/// 解析済みの版識別子。
#[derive(Clone, Debug, Eq)]
pub struct Version {
    pub epoch: u64,
    pub release: Vec<u64>,
    pub pre: Option<(PreKind, u64)>,
    pub post: Option<u64>,
    pub dev: Option<u64>,
    pub local: Vec<LocalSeg>,
    /// 厳密一致（`===`）で使う元表記。
    pub raw: String,
}

impl Version {
    /// 版文字列を解析する。
    pub fn parse(text: &str) -> Result<Self, PkgError> {
        let raw = text.trim().to_string();
        let mut rest = raw.to_ascii_lowercase();
        if let Some(stripped) = rest.strip_prefix('v') {
            rest = stripped.to_string();
        }
        if rest.is_empty() {
            return Err(PkgError::BadVersion(raw));
        }

        // ローカルラベル
        let mut local = Vec::new();
        if let Some(idx) = rest.find('+') {
            let label = rest[idx + 1..].to_string();
            rest.truncate(idx);
            if label.is_empty() {
                return Err(PkgError::BadVersion(raw));
            }
            for seg in label.split(['-', '_', '.']) {
                if seg.is_empty() {
                    return Err(PkgError::BadVersion(raw));
                }
                match seg.parse::<u64>() {
                    Ok(n) => local.push(LocalSeg::Num(n)),
                    Err(_) => local.push(LocalSeg::Alpha(seg.to_string())),
                }
            }
        }

        // エポック
        let mut epoch = 0;
        if let Some(idx) = rest.find('!') {
            epoch = rest[..idx]
                .parse::<u64>()
                .map_err(|_| PkgError::BadVersion(raw.clone()))?;
            rest = rest[idx + 1..].to_string();
        }

        let mut cursor = Cursor::new(&rest);
        let release = cursor.parse_release(&raw)?;
        let pre = cursor.parse_pre(&raw)?;
        let post = cursor.parse_post(&raw)?;
        let dev = cursor.parse_dev(&raw)?;
        if !cursor.at_end() {
            return Err(PkgError::BadVersion(raw));
        }

        Ok(Self {
            epoch,
            release,
            pre,
            post,
            dev,
            local,
            raw,
        })
    }

    /// プレリリース（pre または dev）かどうか。
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    /// 末尾のゼロを除いたリリース列。`1.0` と `1.0.0` を同値にする。
    fn normalized_release(&self) -> &[u64] {
        let mut len = self.release.len();
        while len > 1 && self.release[len - 1] == 0 {
            len -= 1;
        }
        &self.release[..len]
    }

    /// 比較キー。公開仕様の順序規則をそのまま写す。
    fn cmp_key(&self) -> (u64, &[u64], PreRank, PostRank, DevRank, &[LocalSeg]) {
        let pre_rank = match (&self.pre, self.post, self.dev) {
            (Some((kind, n)), _, _) => PreRank::Pre(*kind, *n),
            // pre も post も無いのに dev がある版はそのリリースより下に沈む
            (None, None, Some(_)) => PreRank::Bottom,
            (None, _, _) => PreRank::Release,
        };
        let post_rank = match self.post {
            Some(n) => PostRank::Post(n),
            None => PostRank::Bottom,
        };
        let dev_rank = match self.dev {
            Some(n) => DevRank::Dev(n),
            None => DevRank::Release,
        };
        (
            self.epoch,
            self.normalized_release(),
            pre_rank,
            post_rank,
            dev_rank,
            &self.local,
        )
    }
}

/// pre の順序位置。`Bottom < Pre < Release`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum PreRank {
    Bottom,
    Pre(PreKind, u64),
    Release,
}

/// post の順序位置。`Bottom < Post`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum PostRank {
    Bottom,
    Post(u64),
}

/// dev の順序位置。`Dev < Release`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum DevRank {
    Dev(u64),
    Release,
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key() == other.cmp_key()
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key().cmp(&other.cmp_key())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}!", self.epoch)?;
        }
        let parts: Vec<String> = self.release.iter().map(|n| n.to_string()).collect();
        write!(f, "{}", parts.join("."))?;
        if let Some((kind, n)) = &self.pre {
            write!(f, "{}{}", kind.label(), n)?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{n}")?;
        }
        if let Some(n) = self.dev {
            write!(f, ".dev{n}")?;
        }
        if !self.local.is_empty() {
            let segs: Vec<String> = self
                .local
                .iter()
                .map(|s| match s {
                    LocalSeg::Num(n) => n.to_string(),
                    LocalSeg::Alpha(a) => a.clone(),
                })
                .collect();
            write!(f, "+{}", segs.join("."))?;
        }
        Ok(())
    }
}

/// 版文字列の残り部分を食べ進める小さなカーソル。
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn eat_separator(&mut self) {
        if let Some(ch) = self.rest().chars().next() {
            if ch == '.' || ch == '-' || ch == '_' {
                self.pos += 1;
            }
        }
    }

    fn eat_number(&mut self) -> Option<u64> {
        let rest = self.rest();
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return None;
        }
        self.pos += digits.len();
        digits.parse().ok()
    }

    fn eat_word(&mut self, words: &[&str]) -> Option<&'a str> {
        for word in words {
            if self.rest().starts_with(word) {
                let matched = &self.rest()[..word.len()];
                self.pos += word.len();
                return Some(matched);
            }
        }
        None
    }

    fn parse_release(&mut self, raw: &str) -> Result<Vec<u64>, PkgError> {
        let mut release = Vec::new();
        loop {
            let Some(n) = self.eat_number() else {
                if release.is_empty() {
                    return Err(PkgError::BadVersion(raw.to_string()));
                }
                break;
            };
            release.push(n);
            if self.rest().starts_with('.')
                && self.text[self.pos + 1..]
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_digit())
                    .unwrap_or(false)
            {
                self.pos += 1;
                continue;
            }
            break;
        }
        Ok(release)
    }

    fn parse_pre(&mut self, _raw: &str) -> Result<Option<(PreKind, u64)>, PkgError> {
        let save = self.pos;
        self.eat_separator();
        let Some(word) = self.eat_word(&["alpha", "beta", "preview", "pre", "rc", "a", "b", "c"])
        else {
            self.pos = save;
            return Ok(None);
        };
        let kind = match word {
            "a" | "alpha" => PreKind::Alpha,
            "b" | "beta" => PreKind::Beta,
            _ => PreKind::Rc,
        };
        self.eat_separator();
        let n = self.eat_number().unwrap_or(0);
        Ok(Some((kind, n)))
    }

    fn parse_post(&mut self, _raw: &str) -> Result<Option<u64>, PkgError> {
        let save = self.pos;
        // `-N` の暗黙 post 形式
        if self.rest().starts_with('-') {
            self.pos += 1;
            if let Some(n) = self.eat_number() {
                return Ok(Some(n));
            }
            self.pos = save;
        }
        self.eat_separator();
        if self.eat_word(&["post", "rev", "r"]).is_none() {
            self.pos = save;
            return Ok(None);
        }
        self.eat_separator();
        Ok(Some(self.eat_number().unwrap_or(0)))
    }

    fn parse_dev(&mut self, _raw: &str) -> Result<Option<u64>, PkgError> {
        let save = self.pos;
        self.eat_separator();
        if self.eat_word(&["dev"]).is_none() {
            self.pos = save;
            return Ok(None);
        }
        self.eat_separator();
        Ok(Some(self.eat_number().unwrap_or(0)))
    }
}

/// 比較演算子。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Compatible,
    ArbitraryEq,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Compatible => "~=",
            CmpOp::ArbitraryEq => "===",
        }
    }
}

/// 制約 1 本分（演算子と右辺）。
#[derive(Clone, Debug, PartialEq)]
pub struct Constraint {
    pub op: CmpOp,
    pub version_text: String,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version_text)
    }
}

impl Constraint {
    /// `>=1.2` のような 1 本の制約を解析する。
    pub fn parse(text: &str) -> Result<Self, PkgError> {
        let text = text.trim();
        // 長い演算子から順に照合する
        const OPS: &[(&str, CmpOp)] = &[
            ("===", CmpOp::ArbitraryEq),
            ("==", CmpOp::Eq),
            ("!=", CmpOp::Ne),
            ("~=", CmpOp::Compatible),
            ("<=", CmpOp::Le),
            (">=", CmpOp::Ge),
            ("<", CmpOp::Lt),
            (">", CmpOp::Gt),
        ];
        for (symbol, op) in OPS {
            if let Some(rest) = text.strip_prefix(symbol) {
                let version_text = rest.trim().to_string();
                if version_text.is_empty() {
                    return Err(PkgError::BadConstraint(text.to_string()));
                }
                if *op == CmpOp::Compatible {
                    let v = Version::parse(&version_text)?;
                    if v.release.len() < 2 {
                        // `~=1` は下位セグメントが無く脱糖できない
                        return Err(PkgError::BadConstraint(text.to_string()));
                    }
                }
                if *op != CmpOp::ArbitraryEq {
                    Version::parse(&version_text)?;
                }
                return Ok(Self {
                    op: *op,
                    version_text,
                })
            }
        }
        Err(PkgError::BadConstraint(text.to_string()))
    }

    /// 版が制約を満たすかどうか。
    pub fn matches(&self, candidate: &Version) -> Result<bool, PkgError> {
        match self.op {
            CmpOp::ArbitraryEq => Ok(candidate.raw.trim() == self.version_text),
            CmpOp::Compatible => {
                // `~=X.Y` は `>=X.Y, <X+1.0`、`~=X.Y.Z` は `>=X.Y.Z, <X.Y+1.0` と同値
                let floor = Version::parse(&self.version_text)?;
                let mut ceiling_release = floor.release.clone();
                ceiling_release.pop();
                let last = ceiling_release
                    .last_mut()
                    .expect("~= は 2 セグメント以上で検査済み");
                *last += 1;
                let ceiling = Version {
                    epoch: floor.epoch,
                    release: ceiling_release,
                    pre: None,
                    post: None,
                    dev: None,
                    local: Vec::new(),
                    raw: String::new(),
                };
                Ok(*candidate >= floor && *candidate < ceiling)
            }
            CmpOp::Eq => {
                let spec = Version::parse(&self.version_text)?;
                if spec.local.is_empty() && !candidate.local.is_empty() {
                    // ローカルラベル付きは厳密一致（===）でしか掴めない
                    return Ok(false);
                }
                Ok(candidate == &spec)
            }
            CmpOp::Ne => {
                let spec = Version::parse(&self.version_text)?;
                Ok(candidate != &spec)
            }
            CmpOp::Lt => Ok(candidate < &Version::parse(&self.version_text)?),
            CmpOp::Le => Ok(candidate <= &Version::parse(&self.version_text)?),
            CmpOp::Gt => Ok(candidate > &Version::parse(&self.version_text)?),
            CmpOp::Ge => Ok(candidate >= &Version::parse(&self.version_text)?),
        }
    }
}

/// 制約集合（連言）。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstraintSet {
    pub constraints: Vec<Constraint>,
}

impl ConstraintSet {
    /// `>=1.2,<2.0` のようなカンマ区切りを解析する。空文字列は無制約。
    pub fn parse(text: &str) -> Result<Self, PkgError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::default());
        }
        let mut constraints = Vec::new();
        for part in text.split(',') {
            constraints.push(Constraint::parse(part)?);
        }
        Ok(Self { constraints })
    }

    /// すべての制約を満たすかどうか。
    pub fn matches(&self, candidate: &Version) -> Result<bool, PkgError> {
        for c in &self.constraints {
            if !c.matches(candidate)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

impl fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(text: &str) -> Version {
        Version::parse(text).expect("version parse")
    }

    #[test]
    /// `1.0` と `1.0.0` が等しいことを確認する。
    fn trailing_zero_releases_compare_equal() {
        assert_eq!(v("1.0"), v("1.0.0"));
        assert_eq!(v("1"), v("1.0.0.0"));
        assert!(v("1.0.1") > v("1.0"));
    }

    #[test]
    /// プレリリースがリリースより下に沈むことを確認する。
    fn prereleases_sort_below_release() {
        assert!(v("1.0a1") < v("1.0"));
        assert!(v("1.0a1") < v("1.0b1"));
        assert!(v("1.0b1") < v("1.0rc1"));
        assert!(v("1.0rc1") < v("1.0"));
        assert!(v("1.0.dev1") < v("1.0a1"));
        assert!(v("1.0") < v("1.0.post1"));
    }

    #[test]
    /// エポックがリリース列より優先されることを確認する。
    fn epoch_dominates() {
        assert!(v("1!0.5") > v("99.99"));
    }

    #[test]
    /// ローカルラベルのセグメント比較を確認する。
    fn local_labels_compare_segmentwise() {
        assert!(v("1.0+abc") > v("1.0"));
        assert!(v("1.0+2") > v("1.0+abc"));
        assert!(v("1.0+abc.2") > v("1.0+abc.1"));
    }

    #[test]
    /// 受理する文字列の上で三分律が成り立つことを確認する。
    fn total_order_trichotomy() {
        let samples = [
            "0.1", "1.0.dev1", "1.0a1", "1.0b2", "1.0rc1", "1.0", "1.0+l", "1.0.post1", "1.1",
            "2!0.1",
        ];
        for a in &samples {
            for b in &samples {
                let (va, vb) = (v(a), v(b));
                let relations = [va < vb, va == vb, va > vb];
                assert_eq!(
                    relations.iter().filter(|r| **r).count(),
                    1,
                    "{a} vs {b} で三分律が破れました"
                );
            }
        }
    }

    #[test]
    /// `~=` の脱糖どおりの範囲判定を確認する。
    fn compatible_release_ranges() {
        let c = Constraint::parse("~=1.2").expect("parse");
        assert!(c.matches(&v("1.2")).unwrap());
        assert!(c.matches(&v("1.9")).unwrap());
        assert!(!c.matches(&v("2.0")).unwrap());
        let c = Constraint::parse("~=1.2.3").expect("parse");
        assert!(c.matches(&v("1.2.3")).unwrap());
        assert!(c.matches(&v("1.2.9")).unwrap());
        assert!(!c.matches(&v("1.3.0")).unwrap());
        assert!(Constraint::parse("~=1").is_err());
    }

    #[test]
    /// ローカルラベルと `==` / `===` の関係を確認する。
    fn local_needs_arbitrary_equality() {
        let eq = Constraint::parse("==1.0").expect("parse");
        assert!(eq.matches(&v("1.0")).unwrap());
        assert!(!eq.matches(&v("1.0+local")).unwrap());
        let strict = Constraint::parse("===1.0+local").expect("parse");
        assert!(strict.matches(&v("1.0+local")).unwrap());
        assert!(!strict.matches(&v("1.0")).unwrap());
    }

    #[test]
    /// 制約集合が連言として働くことを確認する。
    fn constraint_set_is_conjunction() {
        let set = ConstraintSet::parse(">=1.2,<2.0,!=1.5").expect("parse");
        assert!(set.matches(&v("1.4")).unwrap());
        assert!(!set.matches(&v("1.5")).unwrap());
        assert!(!set.matches(&v("2.0")).unwrap());
    }
}
