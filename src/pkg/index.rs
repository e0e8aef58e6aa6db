// パス: src/pkg/index.rs
// 役割: リモートパッケージインデックスへの問い合わせとディスクキャッシュを担う
// 意図: 解決器がインデックスの形だけに依存し、HTTP の詳細から独立できるようにする
// 関連ファイル: src/pkg/resolve.rs, src/pkg/install.rs, tests/resolver.rs
//! インデックスクライアント
//!
//! - インデックスはパッケージごとの JSON メタデータ文書と版ごとの wheel URL を
//!   公開する。ここでは「版一覧」と「版 1 つ分のリリース情報」だけを抽象化する。
//! - 応答はディスクへ TTL 付き（既定 1 日）でキャッシュする。
//! - テストや凍結スナップショットにはメモリ内実装を使う。解決の決定性は
//!   この抽象の上で検証される。

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::version::Version;
use super::{canonical_name, PkgError};

/// インデックスキャッシュの既定 TTL（1 日）。
pub const DEFAULT_INDEX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// 版 1 つ分のリリース情報。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    pub wheel_url: String,
    pub sha256: Option<String>,
    /// 宣言された依存（要求文字列のまま保持する）。
    pub requires: Vec<String>,
}

/// 解決器が要求するインデックスの形。
pub trait PackageIndex {
    /// パッケージの版一覧（文字列のまま）。存在しなければ NotFound。
    fn releases(&self, name: &str) -> Result<Vec<String>, PkgError>;
    /// 特定の版のリリース情報。
    fn release(&self, name: &str, version: &str) -> Result<ReleaseInfo, PkgError>;
}

/// メモリ内インデックス。テストと凍結スナップショットに使う。
#[derive(Clone, Debug, Default)]
pub struct InMemoryIndex {
    packages: BTreeMap<String, BTreeMap<String, ReleaseInfo>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// リリースを登録する。
    pub fn add_release(&mut self, name: &str, info: ReleaseInfo) {
        self.packages
            .entry(canonical_name(name))
            .or_default()
            .insert(info.version.clone(), info);
    }

    /// 依存だけ指定する簡易登録。wheel URL はダミーになる。
    pub fn add(&mut self, name: &str, version: &str, requires: &[&str]) {
        let canonical = canonical_name(name);
        self.add_release(
            name,
            ReleaseInfo {
                version: version.to_string(),
                wheel_url: format!("https://index.invalid/{canonical}/{version}.whl"),
                sha256: None,
                requires: requires.iter().map(|s| s.to_string()).collect(),
            },
        );
    }
}

impl PackageIndex for InMemoryIndex {
    fn releases(&self, name: &str) -> Result<Vec<String>, PkgError> {
        self.packages
            .get(&canonical_name(name))
            .map(|versions| versions.keys().cloned().collect())
            .ok_or_else(|| PkgError::NotFound(name.to_string()))
    }

    fn release(&self, name: &str, version: &str) -> Result<ReleaseInfo, PkgError> {
        self.packages
            .get(&canonical_name(name))
            .and_then(|versions| versions.get(version))
            .cloned()
            .ok_or_else(|| PkgError::NotFound(format!("{name}=={version}")))
    }
}

/// ディスクキャッシュのエントリ。取得時刻を一緒に保存する。
#[derive(Serialize, Deserialize)]
struct CachedDoc {
    fetched_unix: u64,
    releases: BTreeMap<String, ReleaseInfo>,
}

/// HTTPS で話す本物のインデックスクライアント。
pub struct HttpIndex {
    base_url: String,
    cache_dir: PathBuf,
    ttl: Duration,
    client: reqwest::blocking::Client,
}

impl HttpIndex {
    /// 既定のインデックス URL とキャッシュディレクトリで開く。
    pub fn open_default() -> Result<Self, PkgError> {
        let home = std::env::var("PYLOT_HOME")
            .map(PathBuf::from)
            .or_else(|_| {
                std::env::var("HOME").map(|h| PathBuf::from(h).join(".pylot"))
            })
            .map_err(|_| PkgError::NoHome)?;
        Self::open("https://pypi.org/pypi", home.join("index-cache"), DEFAULT_INDEX_TTL)
    }

    pub fn open(
        base_url: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        ttl: Duration,
    ) -> Result<Self, PkgError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            base_url: base_url.into(),
            cache_dir,
            ttl,
            client: reqwest::blocking::Client::builder()
                .user_agent("pylot")
                .build()
                .map_err(|e| PkgError::Network(e.to_string()))?,
        })
    }

    fn cache_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", canonical_name(name)))
    }

    /// キャッシュから読み、TTL 内なら使う。
    fn load_cached(&self, name: &str) -> Option<BTreeMap<String, ReleaseInfo>> {
        let path = self.cache_path(name);
        let body = fs::read_to_string(&path).ok()?;
        let doc: CachedDoc = serde_json::from_str(&body).ok()?;
        let fetched = SystemTime::UNIX_EPOCH + Duration::from_secs(doc.fetched_unix);
        let age = SystemTime::now().duration_since(fetched).ok()?;
        if age > self.ttl {
            return None;
        }
        debug!(name, "インデックス応答をディスクキャッシュから再利用");
        Some(doc.releases)
    }

    fn store_cached(&self, name: &str, releases: &BTreeMap<String, ReleaseInfo>) {
        let doc = CachedDoc {
            fetched_unix: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            releases: releases.clone(),
        };
        if let Ok(body) = serde_json::to_string(&doc) {
            let _ = fs::write(self.cache_path(name), body);
        }
    }

    /// パッケージのメタデータ文書を取得し、版→リリース情報の表へ整形する。
    fn fetch_package(&self, name: &str) -> Result<BTreeMap<String, ReleaseInfo>, PkgError> {
        if let Some(cached) = self.load_cached(name) {
            return Ok(cached);
        }
        let url = format!("{}/{}/json", self.base_url, canonical_name(name));
        let body = self.get_with_retry(&url)?;
        let doc: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| PkgError::Network(e.to_string()))?;
        let mut releases = BTreeMap::new();
        let Some(release_map) = doc.get("releases").and_then(|r| r.as_object()) else {
            return Err(PkgError::NotFound(name.to_string()));
        };
        for (version, files) in release_map {
            if Version::parse(version).is_err() {
                continue;
            }
            let Some(files) = files.as_array() else {
                continue;
            };
            // wheel 形式のファイルだけを候補にする
            let wheel = files.iter().find(|f| {
                f.get("packagetype").and_then(|t| t.as_str()) == Some("bdist_wheel")
            });
            if let Some(wheel) = wheel {
                let wheel_url = wheel
                    .get("url")
                    .and_then(|u| u.as_str())
                    .unwrap_or_default()
                    .to_string();
                if wheel_url.is_empty() {
                    continue;
                }
                let sha256 = wheel
                    .get("digests")
                    .and_then(|d| d.get("sha256"))
                    .and_then(|s| s.as_str())
                    .map(|s| s.to_string());
                let requires = wheel
                    .get("requires_dist")
                    .and_then(|r| r.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                releases.insert(
                    version.clone(),
                    ReleaseInfo {
                        version: version.clone(),
                        wheel_url,
                        sha256,
                        requires,
                    },
                );
            }
        }
        // 依存はトップレベルの info.requires_dist が最新版の分を持つ
        if let (Some(info), Some(latest)) = (doc.get("info"), doc.get("info").and_then(|i| i.get("version")).and_then(|v| v.as_str())) {
            if let Some(entry) = releases.get_mut(latest) {
                if entry.requires.is_empty() {
                    if let Some(arr) = info.get("requires_dist").and_then(|r| r.as_array()) {
                        entry.requires = arr
                            .iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect();
                    }
                }
            }
        }
        self.store_cached(name, &releases);
        Ok(releases)
    }

    /// 一時的な失敗（5xx）を小さな上限つきで再試行する GET。
    fn get_with_retry(&self, url: &str) -> Result<String, PkgError> {
        const MAX_ATTEMPTS: usize = 3;
        let mut last_status = 0;
        for attempt in 0..MAX_ATTEMPTS {
            let response = self
                .client
                .get(url)
                .send()
                .map_err(|e| PkgError::Network(e.to_string()))?;
            let status = response.status().as_u16();
            if response.status().is_success() {
                return response
                    .text()
                    .map_err(|e| PkgError::Network(e.to_string()));
            }
            last_status = status;
            if status >= 500 && attempt + 1 < MAX_ATTEMPTS {
                debug!(url, status, attempt, "一時エラーのため再試行");
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
}

impl PackageIndex for HttpIndex {
    fn releases(&self, name: &str) -> Result<Vec<String>, PkgError> {
        let releases = self.fetch_package(name)?;
        if releases.is_empty() {
            return Err(PkgError::NotFound(name.to_string()));
        }
        Ok(releases.keys().cloned().collect())
    }

    fn release(&self, name: &str, version: &str) -> Result<ReleaseInfo, PkgError> {
        let releases = self.fetch_package(name)?;
        releases
            .get(version)
            .cloned()
            .ok_or_else(|| PkgError::NotFound(format!("{name}=={version}")))
    }
}
