// パス: src/pkg/mod.rs
// 役割: パッケージ管理側の共有型・エラー・要求解析を束ねる
// 意図: 版代数・解決器・インストーラが同じ語彙で会話できるようにする
// 関連ファイル: src/pkg/version.rs, src/pkg/resolve.rs, src/pkg/install.rs

pub mod index;
pub mod install;
pub mod resolve;
pub mod version;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use self::version::ConstraintSet;

/// パッケージ管理側のエラー種別。
#[derive(Debug, Error)]
pub enum PkgError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("版識別子を解析できません: {0}")]
    BadVersion(String),
    #[error("制約式を解析できません: {0}")]
    BadConstraint(String),
    #[error("要求を解析できません: {0}")]
    BadRequirement(String),
    #[error("依存解決に失敗しました:\n{chain}")]
    Resolution { chain: String },
    #[error("ダウンロードに失敗しました: {url} (HTTP {status})")]
    Download { url: String, status: u16 },
    #[error("ネットワークエラー: {0}")]
    Network(String),
    #[error("パッケージ {0} がインデックスに見つかりません")]
    NotFound(String),
    #[error("ハッシュ不一致: {path} (期待 {expected}, 実際 {actual})")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("パッケージ {0} はインストールされていません")]
    NotInstalled(String),
    #[error("マニフェストに載っているファイルがありません: {0}")]
    ManifestEntryMissing(PathBuf),
    #[error("wheel の展開に失敗しました: {0}")]
    Wheel(String),
    #[error("インストールルートを決定できません: HOME が未設定です")]
    NoHome,
}

impl From<tempfile::PersistError> for PkgError {
    fn from(err: tempfile::PersistError) -> Self {
        PkgError::Io(err.error)
    }
}

/// 名前の正準形。小文字化し、`-_.` の並びを `-` 1 つへ潰す。
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_dash = false;
    for ch in name.chars() {
        let mapped = match ch {
            '-' | '_' | '.' => '-',
            c => c.to_ascii_lowercase(),
        };
        if mapped == '-' {
            if prev_dash {
                continue;
            }
            prev_dash = true;
        } else {
            prev_dash = false;
        }
        out.push(mapped);
    }
    out.trim_matches('-').to_string()
}

/// 要求 1 件。`name[extras] 制約 ; マーカー` の形。
#[derive(Clone, Debug, PartialEq)]
pub struct Requirement {
    pub name: String,
    pub constraints: ConstraintSet,
    pub extras: Vec<String>,
    pub marker: Option<String>,
}

impl Requirement {
    /// `requests[socks]>=2.0,<3 ; python_version >= "3.8"` を解析する。
    pub fn parse(text: &str) -> Result<Self, PkgError> {
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            return Err(PkgError::BadRequirement(text.to_string()));
        }
        // マーカーを切り離す
        let (spec, marker) = match text.split_once(';') {
            Some((spec, marker)) => (spec.trim(), Some(marker.trim().to_string())),
            None => (text, None),
        };
        // 名前部分は英数と -_. のみ
        let name_end = spec
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
            .unwrap_or(spec.len());
        let name = &spec[..name_end];
        if name.is_empty() {
            return Err(PkgError::BadRequirement(text.to_string()));
        }
        let mut rest = spec[name_end..].trim();
        // extras
        let mut extras = Vec::new();
        if let Some(stripped) = rest.strip_prefix('[') {
            let Some(close) = stripped.find(']') else {
                return Err(PkgError::BadRequirement(text.to_string()));
            };
            extras = stripped[..close]
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            rest = stripped[close + 1..].trim();
        }
        // 括弧付き制約 `(>=1.0)` も受ける
        let rest = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .unwrap_or(rest);
        let constraints = ConstraintSet::parse(rest)?;
        Ok(Self {
            name: canonical_name(name),
            constraints,
            extras,
            marker,
        })
    }

    /// 表示用の要求文字列。
    pub fn display_text(&self) -> String {
        if self.constraints.is_empty() {
            self.name.clone()
        } else {
            format!("{}{}", self.name, self.constraints)
        }
    }
}

/// 解決済みパッケージ 1 件。
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedPackage {
    pub canonical_name: String,
    pub version: version::Version,
    pub wheel_url: String,
    pub sha256: Option<String>,
    pub dependencies: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// 名前の正準化規則を確認する。
    fn canonical_name_collapses_separators() {
        assert_eq!(canonical_name("Flask"), "flask");
        assert_eq!(canonical_name("zope.interface"), "zope-interface");
        assert_eq!(canonical_name("foo__bar..baz"), "foo-bar-baz");
    }

    #[test]
    /// 要求解析が名前・制約・extras・マーカーを分離することを確認する。
    fn requirement_parse_splits_fields() {
        let r = Requirement::parse("Requests[socks,security]>=2.0,<3 ; os_name == \"posix\"")
            .expect("parse");
        assert_eq!(r.name, "requests");
        assert_eq!(r.extras, vec!["socks", "security"]);
        assert_eq!(r.constraints.constraints.len(), 2);
        assert!(r.marker.is_some());
        let bare = Requirement::parse("flask").expect("parse");
        assert!(bare.constraints.is_empty());
    }
}
