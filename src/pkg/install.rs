// パス: src/pkg/install.rs
// 役割: wheel の取得・検証・展開とマニフェスト駆動のアンインストールを行う
// 意図: インストール済み状態の正はメタデータであり、ファイル走査に依存しない
// 関連ファイル: src/pkg/resolve.rs, src/pkg/index.rs, tests/installer.rs
//! パッケージインストーラ
//!
//! - wheel は規定レイアウトの ZIP。`*.dist-info` ディレクトリにメタデータと
//!   レコードを持ち、ペイロードはインストールルートへ複写される。
//! - インデックスが SHA-256 を添えていれば検証する。不一致は致命的で、
//!   部分ファイルは取り除く。
//! - パッケージごとにマニフェスト（展開した全パスとハッシュ・サイズ）を書き、
//!   アンインストールはその一覧だけを根拠に逆再生する。一覧に載った
//!   ファイルの欠落は警告ではなく硬いエラー。
//! - list / freeze / show はメタデータだけを読む。ペイロードは走査しない。
//! - マニフェスト未書き込みのまま失敗したインストールは、その時点までに
//!   展開したファイルを取り除いて巻き戻す。

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::version::Version;
use super::{canonical_name, PkgError, ResolvedPackage};

/// マニフェストのファイル名。dist-info の中に置く。
const RECORD_FILE: &str = "RECORD";
/// メタデータのファイル名。
const METADATA_FILE: &str = "METADATA";

/// インストール済みパッケージ 1 件の表示情報。
#[derive(Clone, Debug, PartialEq)]
pub struct InstalledInfo {
    pub name: String,
    pub version: String,
    pub requires: Vec<String>,
    pub location: PathBuf,
}

/// インストールルートのハンドル。同時書き込みは単一プロセスを前提とする。
pub struct Installer {
    root: PathBuf,
    client: Option<reqwest::blocking::Client>,
}

impl Installer {
    /// 既定のルート（`$PYLOT_HOME/packages` または `$HOME/.pylot/packages`）。
    pub fn default_root() -> Result<PathBuf, PkgError> {
        if let Ok(home) = std::env::var("PYLOT_HOME") {
            return Ok(PathBuf::from(home).join("packages"));
        }
        let home = std::env::var("HOME").map_err(|_| PkgError::NoHome)?;
        Ok(PathBuf::from(home).join(".pylot").join("packages"))
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PkgError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, client: None })
    }

    pub fn open_default() -> Result<Self, PkgError> {
        Self::open(Self::default_root()?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn client(&mut self) -> Result<&reqwest::blocking::Client, PkgError> {
        if self.client.is_none() {
            self.client = Some(
                reqwest::blocking::Client::builder()
                    .user_agent("pylot")
                    .build()
                    .map_err(|e| PkgError::Network(e.to_string()))?,
            );
        }
        Ok(self.client.as_ref().expect("直前に構築済み"))
    }

    /// 解決済みパッケージをダウンロードして展開する。
    pub fn install(&mut self, pkg: &ResolvedPackage) -> Result<InstalledInfo, PkgError> {
        info!(name = %pkg.canonical_name, version = %pkg.version, "インストール開始");
        let bytes = self.download_wheel(&pkg.wheel_url)?;
        if let Some(expected) = &pkg.sha256 {
            let actual = hex::encode(Sha256::digest(&bytes));
            if &actual != expected {
                // 不一致は致命的。部分ファイルは残さない
                return Err(PkgError::HashMismatch {
                    path: pkg.wheel_url.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        self.install_wheel_bytes(
            &pkg.canonical_name,
            &pkg.version.to_string(),
            &pkg.dependencies,
            &bytes,
        )
    }

    /// wheel のバイト列を展開する（ローカル wheel とテストの入口）。
    pub fn install_wheel_bytes(
        &self,
        name: &str,
        version: &str,
        requires: &[String],
        bytes: &[u8],
    ) -> Result<InstalledInfo, PkgError> {
        let canonical = canonical_name(name);
        let reader = std::io::Cursor::new(bytes);
        let mut archive =
            zip::ZipArchive::new(reader).map_err(|e| PkgError::Wheel(e.to_string()))?;

        // 展開済みパスの記録。マニフェスト書き込み前の失敗はこの一覧で巻き戻す
        let mut extracted: Vec<(PathBuf, String, u64)> = Vec::new();
        let result = self.extract_payload(&mut archive, &mut extracted);
        if let Err(e) = result {
            self.rollback(&extracted);
            return Err(e);
        }

        // マニフェストとメタデータは最後に書く
        let dist_info = self.dist_info_dir(&canonical, version);
        if let Err(e) = fs::create_dir_all(&dist_info) {
            self.rollback(&extracted);
            return Err(PkgError::Io(e));
        }
        let metadata_body = render_metadata(&canonical, version, requires);
        let record_body = render_record(&self.root, &extracted);
        if let Err(e) = fs::write(dist_info.join(METADATA_FILE), metadata_body)
            .and_then(|_| fs::write(dist_info.join(RECORD_FILE), record_body))
        {
            self.rollback(&extracted);
            let _ = fs::remove_dir_all(&dist_info);
            return Err(PkgError::Io(e));
        }
        info!(name = %canonical, version, files = extracted.len(), "インストール完了");
        Ok(InstalledInfo {
            name: canonical,
            version: version.to_string(),
            requires: requires.to_vec(),
            location: self.root.clone(),
        })
    }

    /// ZIP のペイロードをルートへ複写する。dist-info 内のレコードは
    /// 自前で計算し直すため読み飛ばす。
    fn extract_payload(
        &self,
        archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
        extracted: &mut Vec<(PathBuf, String, u64)>,
    ) -> Result<(), PkgError> {
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| PkgError::Wheel(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            let Some(rel) = entry.enclosed_name() else {
                return Err(PkgError::Wheel(format!(
                    "不正なパスを含む wheel です: {}",
                    entry.name()
                )));
            };
            let rel = rel.to_path_buf();
            // wheel 側の dist-info はインストール後に作り直す
            if rel
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().ends_with(".dist-info"))
                .unwrap_or(false)
            {
                continue;
            }
            let dest = self.root.join(&rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut body = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut body)
                .map_err(|e| PkgError::Wheel(e.to_string()))?;
            fs::write(&dest, &body)?;
            let digest = hex::encode(Sha256::digest(&body));
            debug!(path = %dest.display(), size = body.len(), "展開");
            extracted.push((dest, digest, body.len() as u64));
        }
        Ok(())
    }

    /// マニフェスト書き込み前に失敗した展開を巻き戻す。
    fn rollback(&self, extracted: &[(PathBuf, String, u64)]) {
        warn!(files = extracted.len(), "インストール失敗のため巻き戻し");
        for (path, _, _) in extracted {
            let _ = fs::remove_file(path);
        }
        for (path, _, _) in extracted {
            self.remove_empty_parents(path);
        }
    }

    /// wheel をダウンロードする。5xx は小さな上限で再試行する。
    fn download_wheel(&mut self, url: &str) -> Result<Vec<u8>, PkgError> {
        const MAX_ATTEMPTS: usize = 3;
        let client = self.client()?.clone();
        let mut last_status = 0;
        for attempt in 0..MAX_ATTEMPTS {
            let response = client
                .get(url)
                .send()
                .map_err(|e| PkgError::Network(e.to_string()))?;
            let status = response.status().as_u16();
            if response.status().is_success() {
                let mut bytes = Vec::new();
                response
                    .take(512 * 1024 * 1024)
                    .read_to_end(&mut bytes)
                    .map_err(|e| PkgError::Network(e.to_string()))?;
                return Ok(bytes);
            }
            last_status = status;
            if status >= 500 && attempt + 1 < MAX_ATTEMPTS {
                std::thread::sleep(Duration::from_millis(200 * (attempt as u64 + 1)));
                continue;
            }
            break;
        }
        Err(PkgError::Download {
            url: url.to_string(),
            status: last_status,
        })
    }

    fn dist_info_dir(&self, canonical: &str, version: &str) -> PathBuf {
        self.root.join(format!("{canonical}-{version}.dist-info"))
    }

    /// 名前から dist-info ディレクトリを探す。
    fn find_dist_info(&self, name: &str) -> Result<PathBuf, PkgError> {
        let canonical = canonical_name(name);
        let prefix = format!("{canonical}-");
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with(&prefix) && file_name.ends_with(".dist-info") {
                return Ok(entry.path());
            }
        }
        Err(PkgError::NotInstalled(canonical))
    }

    /// マニフェストを逆再生してアンインストールする。
    /// 一覧のファイルがすべて存在することを確かめてから消し始める。
    pub fn uninstall(&self, name: &str) -> Result<usize, PkgError> {
        let dist_info = self.find_dist_info(name)?;
        let record_body = fs::read_to_string(dist_info.join(RECORD_FILE))?;
        let mut paths = Vec::new();
        for line in record_body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((rel, _rest)) = line.split_once(',') else {
                continue;
            };
            let path = self.root.join(rel);
            if !path.exists() {
                // 欠落は硬いエラー。何も消さずに戻る
                return Err(PkgError::ManifestEntryMissing(path));
            }
            paths.push(path);
        }
        for path in &paths {
            fs::remove_file(path)?;
        }
        for path in &paths {
            self.remove_empty_parents(path);
        }
        fs::remove_dir_all(&dist_info)?;
        info!(name, files = paths.len(), "アンインストール完了");
        Ok(paths.len())
    }

    /// 空になった親ディレクトリをルートまで取り除く。
    fn remove_empty_parents(&self, path: &Path) {
        let mut cur = path.parent();
        while let Some(dir) = cur {
            if dir == self.root {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            cur = dir.parent();
        }
    }

    /// インストール済みの一覧。メタデータだけを読む。
    pub fn list(&self) -> Result<Vec<InstalledInfo>, PkgError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.ends_with(".dist-info") {
                continue;
            }
            let metadata = fs::read_to_string(entry.path().join(METADATA_FILE))?;
            out.push(parse_metadata(&metadata, self.root.clone()));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// `name==version` 形式の凍結出力。
    pub fn freeze(&self) -> Result<Vec<String>, PkgError> {
        Ok(self
            .list()?
            .into_iter()
            .map(|info| format!("{}=={}", info.name, info.version))
            .collect())
    }

    /// 1 パッケージの詳細表示。
    pub fn show(&self, name: &str) -> Result<InstalledInfo, PkgError> {
        let dist_info = self.find_dist_info(name)?;
        let metadata = fs::read_to_string(dist_info.join(METADATA_FILE))?;
        Ok(parse_metadata(&metadata, self.root.clone()))
    }
}

/// METADATA 本文を組み立てる。
fn render_metadata(name: &str, version: &str, requires: &[String]) -> String {
    let mut out = String::new();
    out.push_str("Metadata-Version: 2.1\n");
    out.push_str(&format!("Name: {name}\n"));
    out.push_str(&format!("Version: {version}\n"));
    for req in requires {
        out.push_str(&format!("Requires-Dist: {req}\n"));
    }
    out
}

/// RECORD 本文を組み立てる。`パス,sha256=<hex>,<size>` の行形式。
fn render_record(root: &Path, extracted: &[(PathBuf, String, u64)]) -> String {
    let mut out = String::new();
    for (path, digest, size) in extracted {
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        out.push_str(&format!("{rel},sha256={digest},{size}\n"));
    }
    out
}

/// METADATA 本文から表示情報を読み出す。
fn parse_metadata(body: &str, location: PathBuf) -> InstalledInfo {
    let mut name = String::new();
    let mut version = String::new();
    let mut requires = Vec::new();
    for line in body.lines() {
        if let Some(v) = line.strip_prefix("Name: ") {
            name = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("Version: ") {
            version = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("Requires-Dist: ") {
            requires.push(v.trim().to_string());
        }
    }
    InstalledInfo {
        name,
        version,
        requires,
        location,
    }
}

/// `requirements.txt` 形式を読み、コメントと空行を除いた要求一覧を返す。
pub fn read_requirements_file(path: &Path) -> Result<Vec<super::Requirement>, PkgError> {
    let body = fs::read_to_string(path)?;
    let mut out = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        out.push(super::Requirement::parse(line)?);
    }
    Ok(out)
}

/// ロック済み集合を依存の浅い順にインストールする入口。
pub fn install_all(
    installer: &mut Installer,
    locked: &[ResolvedPackage],
) -> Result<Vec<InstalledInfo>, PkgError> {
    let mut done = Vec::new();
    for pkg in locked {
        done.push(installer.install(pkg)?);
    }
    Ok(done)
}

/// 版表記の妥当性だけを検査する補助（CLI 入力の早期検査用）。
pub fn parse_version_text(text: &str) -> Result<Version, PkgError> {
    Version::parse(text)
}
