// パス: src/cache.rs
// 役割: 内容アドレスのビルドキャッシュとハッシュサイドカーを管理する
// 意図: 同一フィンガープリントの成果物を高々 1 回だけビルドさせる
// 関連ファイル: src/build.rs, src/emit/mod.rs, tests/cache_build.rs
//! ビルドキャッシュモジュール
//!
//! - キーはソースバイト・公開シグネチャ・エミッタ版・ターゲット・最適化
//!   フラグの SHA-256。暗号学的ハッシュ以外は衝突が致命傷になるため不可。
//! - 成果物ごとに `<hash>.hash` サイドカーを持ち、照合一致のみをヒットとする。
//! - 書き込みは一時ファイル + rename で原子化する。読み手はロック不要。
//! - 壊れたサイドカーはミスとして扱う（回復不能な場合のみ致命的）。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// キャッシュ操作のエラー種別。
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("キャッシュルートを決定できません: HOME が未設定です")]
    NoHome,
}

impl From<tempfile::PersistError> for CacheError {
    fn from(err: tempfile::PersistError) -> Self {
        CacheError::Io(err.error)
    }
}

/// 成果物の種別。拡張子がそのままディスク上のレイアウトになる。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    /// 生成されたターゲット言語ソース。
    EmittedSource,
    /// 外部ツールチェインが出したオブジェクト。
    Object,
    /// リンク済みバイナリ。
    Binary,
    /// 空ソースの印。ゼロバイトの成果物は作らない。
    EmptyMarker,
}

impl ArtifactKind {
    fn ext(self) -> &'static str {
        match self {
            ArtifactKind::EmittedSource => "zig",
            ArtifactKind::Object => "o",
            ArtifactKind::Binary => "bin",
            ArtifactKind::EmptyMarker => "empty",
        }
    }
}

/// キャッシュキー。16 進の SHA-256 ダイジェスト。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// ビルド成果物へ影響する全入力からキーを計算する。
    pub fn compute(
        source: &[u8],
        exported_signature: &str,
        emitter_version: &str,
        target: &str,
        opt_flags: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((source.len() as u64).to_le_bytes());
        hasher.update(source);
        hasher.update(exported_signature.as_bytes());
        hasher.update(emitter_version.as_bytes());
        hasher.update(target.as_bytes());
        hasher.update(opt_flags.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// バイト列の SHA-256 を 16 進で返す汎用ヘルパ。
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// キャッシュディレクトリ 1 つ分のハンドル。
#[derive(Clone, Debug)]
pub struct BuildCache {
    root: PathBuf,
}

impl BuildCache {
    /// 既定のキャッシュルート（`$PYLOT_HOME/cache` または `$HOME/.pylot/cache`）。
    pub fn default_root() -> Result<PathBuf, CacheError> {
        if let Ok(home) = std::env::var("PYLOT_HOME") {
            return Ok(PathBuf::from(home).join("cache"));
        }
        let home = std::env::var("HOME").map_err(|_| CacheError::NoHome)?;
        Ok(PathBuf::from(home).join(".pylot").join("cache"))
    }

    /// ルートを指定して開く。ディレクトリは無ければ作る。
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// 既定のルートで開く。
    pub fn open_default() -> Result<Self, CacheError> {
        Self::open(Self::default_root()?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 成果物のパス。パスはキーのハッシュそのものなので書き手同士は衝突しない。
    pub fn artifact_path(&self, key: &CacheKey, kind: ArtifactKind) -> PathBuf {
        self.root.join(format!("{}.{}", key.0, kind.ext()))
    }

    fn sidecar_path(&self, key: &CacheKey, kind: ArtifactKind) -> PathBuf {
        self.root.join(format!("{}.{}.hash", key.0, kind.ext()))
    }

    /// キャッシュ照会。成果物とサイドカーの両方が揃い、サイドカーの中身が
    /// キーと一致する場合だけヒットになる。壊れたサイドカーはミス。
    pub fn lookup(&self, key: &CacheKey, kind: ArtifactKind) -> Option<PathBuf> {
        let artifact = self.artifact_path(key, kind);
        if !artifact.exists() {
            return None;
        }
        let sidecar = self.sidecar_path(key, kind);
        match fs::read_to_string(&sidecar) {
            Ok(content) if content.trim() == key.0 => {
                debug!(key = %key.0, kind = ?kind, "キャッシュヒット");
                Some(artifact)
            }
            Ok(_) | Err(_) => {
                debug!(key = %key.0, kind = ?kind, "サイドカー不一致によりミス扱い");
                None
            }
        }
    }

    /// 成果物を格納する。一時ファイルへ書いてから rename するので、
    /// 部分書き込みが他プロセスから見えることはない。
    pub fn store(
        &self,
        key: &CacheKey,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<PathBuf, CacheError> {
        let artifact = self.artifact_path(key, kind);
        let tmp = NamedTempFile::new_in(&self.root)?;
        fs::write(tmp.path(), bytes)?;
        tmp.persist(&artifact)?;
        self.write_sidecar(key, kind)?;
        debug!(key = %key.0, kind = ?kind, path = %artifact.display(), "キャッシュ格納");
        Ok(artifact)
    }

    /// 既存ファイルを成果物としてコピー格納する（ツールチェイン出力向け）。
    pub fn store_file(
        &self,
        key: &CacheKey,
        kind: ArtifactKind,
        src: &Path,
    ) -> Result<PathBuf, CacheError> {
        let artifact = self.artifact_path(key, kind);
        let tmp = NamedTempFile::new_in(&self.root)?;
        fs::copy(src, tmp.path())?;
        // 実行ビットはバイナリ種別のみ引き継ぐ
        #[cfg(unix)]
        if kind == ArtifactKind::Binary {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = fs::metadata(tmp.path())?.permissions();
            perm.set_mode(0o755);
            fs::set_permissions(tmp.path(), perm)?;
        }
        tmp.persist(&artifact)?;
        self.write_sidecar(key, kind)?;
        Ok(artifact)
    }

    fn write_sidecar(&self, key: &CacheKey, kind: ArtifactKind) -> Result<(), CacheError> {
        let sidecar = self.sidecar_path(key, kind);
        let tmp = NamedTempFile::new_in(&self.root)?;
        fs::write(tmp.path(), &key.0)?;
        tmp.persist(sidecar)?;
        Ok(())
    }

    /// キャッシュを空にする。明示パージ以外でエントリが消えることはない。
    pub fn purge(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    /// 1 バイトの違いがキーを変えることを確認する。
    fn one_byte_change_invalidates_key() {
        let a = CacheKey::compute(b"x = 1", "sig", "v1", "native", "O2");
        let b = CacheKey::compute(b"x = 2", "sig", "v1", "native", "O2");
        let c = CacheKey::compute(b"x = 1", "sig", "v1", "native", "O2");
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    /// 格納 → 照会がヒットし、サイドカー破損でミスになることを確認する。
    fn lookup_hits_only_with_matching_sidecar() {
        let dir = tempdir().expect("tempdir");
        let cache = BuildCache::open(dir.path()).expect("open");
        let key = CacheKey::compute(b"src", "sig", "v1", "native", "O2");
        assert!(cache.lookup(&key, ArtifactKind::EmittedSource).is_none());
        cache
            .store(&key, ArtifactKind::EmittedSource, b"emitted")
            .expect("store");
        assert!(cache.lookup(&key, ArtifactKind::EmittedSource).is_some());
        // サイドカーを壊すとミスへ戻る
        let sidecar = dir.path().join(format!("{}.zig.hash", key.as_str()));
        std::fs::write(&sidecar, "broken").expect("write sidecar");
        assert!(cache.lookup(&key, ArtifactKind::EmittedSource).is_none());
    }
}
