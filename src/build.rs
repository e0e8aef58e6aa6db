// パス: src/build.rs
// 役割: ソース発見・並列ビルド・外部ツールチェイン起動・テスト実行を統括する
// 意図: C1〜C5 を束ね、ファイル単位の失敗がバッチ全体を止めないようにする
// 関連ファイル: src/cache.rs, src/emit/mod.rs, src/bin/pylot.rs
//! ビルドオーケストレータ
//!
//! - ファイルまたはディレクトリを受け取り、`.py` をワーカープールで処理する。
//! - ファイルごとに: ハッシュ → キャッシュ照会 → ミス時のみ C1〜C4 と
//!   外部ツールチェイン起動。ツールチェインには専用キャッシュディレクトリを
//!   渡し、そちらの増分キャッシュも効かせる。
//! - テストモードは `test_*.py` を発見し、タイムアウト付きで実行して集計する。
//! - 診断はそのファイルだけを中断し、残りは処理を続ける。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{ArtifactKind, BuildCache, CacheError, CacheKey};
use crate::emit::{self, EmitError, EMITTER_VERSION};
use crate::errors::Diagnostic;
use crate::infer;
use crate::parser;

/// テスト 1 件あたりの既定タイムアウト（10 分）。
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(600);

/// ビルド全体のエラー種別。
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0}")]
    Diagnostic(#[from] Diagnostic),
    #[error("{0}")]
    Emit(#[from] EmitError),
    #[error("{0}")]
    Cache(#[from] CacheError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("ツールチェイン zig が PATH にありません")]
    ToolchainMissing,
    #[error("ツールチェインが失敗しました:\n{stderr}")]
    Toolchain { stderr: String },
    #[error("ソースが見つかりません: {0}")]
    NoSources(PathBuf),
}

/// ビルドの指定。
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// キャッシュを無視して再ビルドする（`--force`）。
    pub force: bool,
    /// 行マップサイドカーを出力する（`--debug`）。
    pub debug: bool,
    /// ターゲットトリプル。`native` はホスト。
    pub target: String,
    /// 最適化フラグ。ツールチェインへそのまま渡る。
    pub opt_flags: String,
    /// 自己完結バイナリ（静的リンク）を作る（`-b`）。
    pub static_binary: bool,
    /// ワーカー数。0 はハードウェア並列度。
    pub jobs: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            force: false,
            debug: false,
            target: "native".to_string(),
            opt_flags: "ReleaseSafe".to_string(),
            static_binary: false,
            jobs: 0,
        }
    }
}

/// サポートするクロスターゲットの一覧。
pub const SUPPORTED_TARGETS: &[&str] = &[
    "native",
    "wasm32-wasi",
    "wasm32-freestanding",
    "x86_64-linux-gnu",
    "aarch64-linux-gnu",
    "x86_64-macos",
    "aarch64-macos",
    "x86_64-windows",
];

/// ファイル 1 つ分のビルド結果。
#[derive(Clone, Debug)]
pub struct CompiledFile {
    pub source: PathBuf,
    pub binary: PathBuf,
    pub from_cache: bool,
    /// 空ソースだったため成果物を作らなかった。
    pub empty: bool,
}

/// バッチ全体の集計。
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub compiled: Vec<CompiledFile>,
    pub failures: Vec<(PathBuf, String)>,
}

impl BatchSummary {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// テスト実行の集計。
#[derive(Debug, Default)]
pub struct TestSummary {
    pub passed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub timed_out: Vec<PathBuf>,
}

impl TestSummary {
    pub fn ok(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// 入力パスからソースファイル一覧を作る。
pub fn discover_sources(path: &Path) -> Result<Vec<PathBuf>, BuildError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut sources: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|x| x == "py").unwrap_or(false))
        .collect();
    sources.sort();
    if sources.is_empty() {
        return Err(BuildError::NoSources(path.to_path_buf()));
    }
    Ok(sources)
}

/// テストファイル（`test_*.py`）の一覧を作る。
pub fn discover_tests(dir: &Path) -> Result<Vec<PathBuf>, BuildError> {
    let sources = discover_sources(dir)?;
    let tests: Vec<PathBuf> = sources
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("test_"))
                .unwrap_or(false)
        })
        .collect();
    if tests.is_empty() {
        return Err(BuildError::NoSources(dir.to_path_buf()));
    }
    Ok(tests)
}

/// 複数ファイルをワーカープールでビルドする。
/// 1 ファイルの失敗は記録して続行し、ユーザへ失敗の全量を見せる。
pub fn build_batch(
    sources: &[PathBuf],
    cache: &BuildCache,
    opts: &BuildOptions,
) -> BatchSummary {
    let jobs = if opts.jobs == 0 {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
        opts.jobs
    };
    info!(files = sources.len(), jobs, "バッチビルド開始");
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .expect("ワーカープールの構築に失敗することはない");
    let results: Vec<Result<CompiledFile, (PathBuf, String)>> = pool.install(|| {
        sources
            .par_iter()
            .map(|src| {
                compile_file(src, cache, opts).map_err(|e| (src.clone(), format!("{e}")))
            })
            .collect()
    });
    let mut summary = BatchSummary::default();
    for result in results {
        match result {
            Ok(c) => summary.compiled.push(c),
            Err(f) => summary.failures.push(f),
        }
    }
    summary
}

/// 1 ファイルをビルドする。キャッシュヒット時はツールチェインを起動しない。
pub fn compile_file(
    source: &Path,
    cache: &BuildCache,
    opts: &BuildOptions,
) -> Result<CompiledFile, BuildError> {
    let source_bytes = fs::read(source)?;
    let source_text = String::from_utf8_lossy(&source_bytes).into_owned();
    let file_name = source.display().to_string();
    let module_name = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module")
        .to_string();

    // 空ソース: ゼロバイト成果物の代わりに印だけをキャッシュする
    if source_text.trim().is_empty() {
        let key = CacheKey::compute(
            &source_bytes,
            "",
            EMITTER_VERSION,
            &opts.target,
            &opts.opt_flags,
        );
        let from_cache = cache.lookup(&key, ArtifactKind::EmptyMarker).is_some();
        if !from_cache {
            cache.store(&key, ArtifactKind::EmptyMarker, b"empty")?;
        }
        return Ok(CompiledFile {
            source: source.to_path_buf(),
            binary: PathBuf::new(),
            from_cache,
            empty: true,
        });
    }

    // C1 + C2
    let module = parser::parse_module(&source_text, &module_name)
        .map_err(|e| Diagnostic::from(e).with_source_file(&file_name))?;
    // C3
    let info = infer::infer_module(&module)
        .map_err(|e| Diagnostic::from(e).with_source_file(&file_name))?;

    let key = CacheKey::compute(
        &source_bytes,
        &info.exported_signature(),
        EMITTER_VERSION,
        &opts.target,
        &opts.opt_flags,
    );

    if !opts.force {
        if let Some(binary) = cache.lookup(&key, ArtifactKind::Binary) {
            debug!(source = %file_name, "キャッシュヒットのため再利用");
            return Ok(CompiledFile {
                source: source.to_path_buf(),
                binary,
                from_cache: true,
                empty: false,
            });
        }
    }

    // C4
    let emitted = emit::emit_module(&info, &file_name)?;
    let emitted_path = cache.store(&key, ArtifactKind::EmittedSource, emitted.source.as_bytes())?;
    if opts.debug {
        emit::write_sidecar(&emitted_path, &emitted.line_map)?;
    }

    // 外部ツールチェイン起動
    let binary_tmp = cache
        .root()
        .join(format!("{}.bin.partial", key.as_str()));
    invoke_toolchain(&emitted_path, &binary_tmp, cache, opts)?;
    let binary = cache.store_file(&key, ArtifactKind::Binary, &binary_tmp)?;
    let _ = fs::remove_file(&binary_tmp);

    Ok(CompiledFile {
        source: source.to_path_buf(),
        binary,
        from_cache: false,
        empty: false,
    })
}

/// 外部ツールチェイン（zig）を起動する。
/// ツールチェイン自身の増分キャッシュが効くようにキャッシュディレクトリを渡す。
fn invoke_toolchain(
    emitted_src: &Path,
    out: &Path,
    cache: &BuildCache,
    opts: &BuildOptions,
) -> Result<(), BuildError> {
    let runtime_lib = locate_runtime_library()?;
    let zig_cache = cache.root().join("zig-cache");
    fs::create_dir_all(&zig_cache)?;

    let mut cmd = Command::new("zig");
    cmd.arg("build-exe")
        .arg(emitted_src)
        .arg(&runtime_lib)
        .arg("-lc")
        .arg("-O")
        .arg(&opts.opt_flags)
        .arg("--cache-dir")
        .arg(&zig_cache)
        .arg(format!("-femit-bin={}", out.display()));
    if opts.target != "native" {
        cmd.arg("-target").arg(&opts.target);
    }
    if opts.static_binary {
        cmd.arg("-static");
    }
    debug!(cmd = ?cmd, "ツールチェイン起動");
    let output = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                BuildError::ToolchainMissing
            } else {
                BuildError::Io(e)
            }
        })?;
    if !output.status.success() {
        return Err(BuildError::Toolchain {
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// ランタイム静的ライブラリの場所を求める。
/// `PYLOT_RUNTIME_LIB` 優先。無ければワークスペースのビルド済み成果物を探す。
fn locate_runtime_library() -> Result<PathBuf, BuildError> {
    if let Ok(path) = std::env::var("PYLOT_RUNTIME_LIB") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }
    for profile in ["release", "debug"] {
        let candidate = PathBuf::from("target")
            .join(profile)
            .join("libruntime_native.a");
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    // 最後の手段としてその場でビルドする
    let status = Command::new("cargo")
        .args(["build", "-p", "runtime_native", "--release"])
        .status();
    match status {
        Ok(s) if s.success() => {
            let built = PathBuf::from("target/release/libruntime_native.a");
            if built.exists() {
                return Ok(built);
            }
            Err(BuildError::Toolchain {
                stderr: "ランタイムライブラリの成果物が見つかりません".to_string(),
            })
        }
        _ => Err(BuildError::Toolchain {
            stderr: "ランタイムライブラリをビルドできません".to_string(),
        }),
    }
}

/// コンパイル済みバイナリを実行する（`pylot <file>` の実行パス）。
pub fn run_binary(binary: &Path) -> Result<i32, BuildError> {
    let status = Command::new(binary).status()?;
    Ok(status.code().unwrap_or(1))
}

/// タイムアウト付きでバイナリを 1 つ実行する。
/// 看取りスレッドはタイムアウトまで眠り、done フラグが立っていなければ
/// 子プロセスを停止する。フラグは seq-cst で読み書きする。
/// 停止は std の `Child::kill` なのでターゲットを問わず同じ経路になる。
pub fn run_with_timeout(binary: &Path, timeout: Duration) -> Result<TestOutcome, BuildError> {
    let child = Command::new(binary)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let pid = child.id();
    let child = Arc::new(Mutex::new(child));
    let done = Arc::new(AtomicBool::new(false));
    let killed = Arc::new(AtomicBool::new(false));
    let killer_done = Arc::clone(&done);
    let killer_killed = Arc::clone(&killed);
    let killer_child = Arc::clone(&child);
    let killer = thread::spawn(move || {
        thread::sleep(timeout);
        if !killer_done.load(Ordering::SeqCst) {
            warn!(pid, "タイムアウトにより子プロセスを停止します");
            killer_killed.store(true, Ordering::SeqCst);
            if let Ok(mut c) = killer_child.lock() {
                let _ = c.kill();
            }
        }
    });
    // 本体はポーリングで終了を待つ。ロックは検査の間だけ持つ
    let status = loop {
        {
            let mut c = child.lock().expect("child ロックは毒化しない");
            if let Some(status) = c.try_wait()? {
                break status;
            }
        }
        thread::sleep(Duration::from_millis(20));
    };
    done.store(true, Ordering::SeqCst);
    // 看取りスレッドは切り離したまま残す。done を見て何もせず退出する
    drop(killer);
    let mut stderr_text = String::new();
    {
        let mut c = child.lock().expect("child ロックは毒化しない");
        if let Some(mut stderr) = c.stderr.take() {
            use std::io::Read;
            let _ = stderr.read_to_string(&mut stderr_text);
        }
    }
    // 看取りスレッドが停止させた場合は終了コードの形によらずタイムアウト。
    // シグナル終了（終了コードなし）も同様に扱う
    if killed.load(Ordering::SeqCst) || status.code().is_none() {
        Ok(TestOutcome::TimedOut)
    } else if status.success() {
        Ok(TestOutcome::Passed)
    } else {
        Ok(TestOutcome::Failed(stderr_text))
    }
}

/// テスト 1 件分の結果。
#[derive(Debug)]
pub enum TestOutcome {
    Passed,
    Failed(String),
    TimedOut,
}

/// テストモード: 発見 → ビルド → タイムアウト付き実行 → 集計。
pub fn run_tests(
    dir: &Path,
    cache: &BuildCache,
    opts: &BuildOptions,
    timeout: Duration,
) -> Result<TestSummary, BuildError> {
    let tests = discover_tests(dir)?;
    let batch = build_batch(&tests, cache, opts);
    let mut summary = TestSummary::default();
    for (path, err) in &batch.failures {
        summary.failed.push((path.clone(), err.clone()));
    }
    for compiled in &batch.compiled {
        if compiled.empty {
            summary.passed.push(compiled.source.clone());
            continue;
        }
        match run_with_timeout(&compiled.binary, timeout)? {
            TestOutcome::Passed => summary.passed.push(compiled.source.clone()),
            TestOutcome::Failed(stderr) => {
                summary.failed.push((compiled.source.clone(), stderr));
            }
            TestOutcome::TimedOut => summary.timed_out.push(compiled.source.clone()),
        }
    }
    info!(
        passed = summary.passed.len(),
        failed = summary.failed.len(),
        timed_out = summary.timed_out.len(),
        "テスト集計"
    );
    Ok(summary)
}
