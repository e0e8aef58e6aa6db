// パス: src/bin/pylot.rs
// 役割: CLI エントリポイント。サブコマンドを各サブシステムへ配線する
// 意図: コンパイル系とパッケージ系を 1 つの実行ファイルから提供する
// 関連ファイル: src/build.rs, src/pkg/mod.rs, src/cache.rs
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use pylot::build::{self, BuildOptions, DEFAULT_TEST_TIMEOUT, SUPPORTED_TARGETS};
use pylot::cache::BuildCache;
use pylot::pkg::{self, index::HttpIndex, install::Installer, Requirement};

/// pylot CLI
#[derive(Parser)]
#[command(author, version, about = "スクリプト言語の AOT コンパイラ / パッケージマネージャ")]
struct Cli {
    /// インラインコードを実行する（互換ショートカット）
    #[arg(short = 'c', value_name = "CODE", conflicts_with = "module")]
    code: Option<String>,
    /// モジュール名で実行する（互換ショートカット）
    #[arg(short = 'm', value_name = "MODULE")]
    module: Option<String>,
    /// キャッシュを無視して再ビルドする
    #[arg(long, global = true)]
    force: bool,
    /// 生成行→原文行のサイドカーを出力する
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// ファイルをコンパイルして実行する
    Run {
        /// 入力ファイルパス（`-` で標準入力）
        input: String,
    },
    /// ファイルをコンパイルだけする
    Build {
        /// 入力ファイルまたはディレクトリ
        input: PathBuf,
        /// 自己完結バイナリを作る
        #[arg(short = 'b', default_value_t = false)]
        binary: bool,
        /// クロスコンパイルのターゲットトリプル
        #[arg(long, default_value = "native")]
        target: String,
        /// 成功時に出力情報を JSON で表示
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// `test_*` ファイルを発見してタイムアウト付きで実行する
    Test {
        /// 探索ディレクトリ（既定はカレント）
        dir: Option<PathBuf>,
        /// テスト 1 件のタイムアウト秒
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// 要求を解決してインストールする
    Install {
        /// 要求（`name>=1.0` 形式）。無指定なら requirements.txt を読む
        requirements: Vec<String>,
        /// 要求ファイルから読む
        #[arg(short = 'r', value_name = "FILE")]
        requirements_file: Option<PathBuf>,
    },
    /// パッケージを取り除く
    Uninstall {
        names: Vec<String>,
    },
    /// インストール済みパッケージの一覧
    List,
    /// `name==version` の凍結出力
    Freeze,
    /// 1 パッケージの詳細表示
    Show {
        name: String,
    },
    /// ビルドキャッシュの管理
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// キャッシュディレクトリのパスを表示する
    Dir,
    /// キャッシュを空にする
    Purge,
}

/// `pylot file.py` を `pylot run file.py` として扱う前処理。
fn normalize_args() -> Vec<String> {
    const KNOWN: &[&str] = &[
        "run", "build", "test", "install", "uninstall", "list", "freeze", "show", "cache",
        "help",
    ];
    let mut args: Vec<String> = std::env::args().collect();
    if let Some(first) = args.get(1) {
        let is_flag = first.starts_with('-') && first != "-";
        if !is_flag && !KNOWN.contains(&first.as_str()) {
            args.insert(1, "run".to_string());
        } else if first == "-" {
            args[1] = "run".to_string();
            args.insert(2, "-".to_string());
        }
    }
    args
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PYLOT_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse_from(normalize_args());
    match dispatch(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("エラー: {err}");
            process::exit(1);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let opts = BuildOptions {
        force: cli.force,
        debug: cli.debug,
        ..BuildOptions::default()
    };

    // 互換ショートカット: -c / -m
    if let Some(code) = &cli.code {
        return run_inline_code(code, &opts);
    }
    if let Some(module) = &cli.module {
        let path = PathBuf::from(format!("{module}.py"));
        if !path.exists() {
            return Err(format!("モジュール {module} が見つかりません").into());
        }
        return run_file(&path, &opts);
    }

    match cli.command {
        None => {
            eprintln!("入力ファイルかサブコマンドを指定してください（--help 参照）");
            Ok(2)
        }
        Some(Command::Run { input }) => {
            if input == "-" {
                let mut code = String::new();
                std::io::stdin().read_to_string(&mut code)?;
                return run_inline_code(&code, &opts);
            }
            run_file(Path::new(&input), &opts)
        }
        Some(Command::Build {
            input,
            binary,
            target,
            json,
        }) => {
            if !SUPPORTED_TARGETS.contains(&target.as_str()) {
                return Err(format!(
                    "ターゲット {target} は未対応です（対応: {}）",
                    SUPPORTED_TARGETS.join(", ")
                )
                .into());
            }
            let opts = BuildOptions {
                target,
                static_binary: binary,
                ..opts
            };
            let cache = BuildCache::open_default()?;
            let sources = build::discover_sources(&input)?;
            let summary = build::build_batch(&sources, &cache, &opts);
            for (path, err) in &summary.failures {
                eprintln!("{}: {err}", path.display());
            }
            if json {
                print_build_json(&summary)?;
            } else {
                for compiled in &summary.compiled {
                    if compiled.empty {
                        println!(
                            "スキップ（空ソース）: {}",
                            compiled.source.display()
                        );
                    } else {
                        println!(
                            "ビルド成功: {} -> {}{}",
                            compiled.source.display(),
                            compiled.binary.display(),
                            if compiled.from_cache {
                                "（キャッシュ）"
                            } else {
                                ""
                            }
                        );
                    }
                }
            }
            Ok(if summary.ok() { 0 } else { 1 })
        }
        Some(Command::Test { dir, timeout }) => {
            let dir = dir.unwrap_or_else(|| PathBuf::from("."));
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TEST_TIMEOUT);
            let cache = BuildCache::open_default()?;
            let summary = build::run_tests(&dir, &cache, &opts, timeout)?;
            for path in &summary.passed {
                println!("ok      {}", path.display());
            }
            for (path, err) in &summary.failed {
                println!("FAILED  {}", path.display());
                if !err.trim().is_empty() {
                    println!("        {}", err.trim().replace('\n', "\n        "));
                }
            }
            for path in &summary.timed_out {
                println!("TIMEOUT {}", path.display());
            }
            println!(
                "結果: {} passed / {} failed / {} timed out",
                summary.passed.len(),
                summary.failed.len(),
                summary.timed_out.len()
            );
            Ok(if summary.ok() { 0 } else { 1 })
        }
        Some(Command::Install {
            requirements,
            requirements_file,
        }) => {
            let roots = gather_requirements(&requirements, requirements_file.as_deref())?;
            if roots.is_empty() {
                return Err("インストールする要求がありません".into());
            }
            let index = HttpIndex::open_default()?;
            let locked = pkg::resolve::resolve(&roots, &index)?;
            println!("解決: {} パッケージ", locked.len());
            for p in &locked {
                println!("  {}=={}", p.canonical_name, p.version);
            }
            let mut installer = Installer::open_default()?;
            let installed = pkg::install::install_all(&mut installer, &locked)?;
            println!("インストール完了: {} パッケージ", installed.len());
            Ok(0)
        }
        Some(Command::Uninstall { names }) => {
            if names.is_empty() {
                return Err("取り除くパッケージ名を指定してください".into());
            }
            let installer = Installer::open_default()?;
            for name in &names {
                let removed = installer.uninstall(name)?;
                println!("削除: {name}（{removed} ファイル）");
            }
            Ok(0)
        }
        Some(Command::List) => {
            let installer = Installer::open_default()?;
            for info in installer.list()? {
                println!("{} {}", info.name, info.version);
            }
            Ok(0)
        }
        Some(Command::Freeze) => {
            let installer = Installer::open_default()?;
            for line in installer.freeze()? {
                println!("{line}");
            }
            Ok(0)
        }
        Some(Command::Show { name }) => {
            let installer = Installer::open_default()?;
            let info = installer.show(&name)?;
            println!("Name: {}", info.name);
            println!("Version: {}", info.version);
            println!("Location: {}", info.location.display());
            for req in &info.requires {
                println!("Requires: {req}");
            }
            Ok(0)
        }
        Some(Command::Cache { action }) => match action {
            CacheAction::Dir => {
                println!("{}", BuildCache::default_root()?.display());
                Ok(0)
            }
            CacheAction::Purge => {
                let cache = BuildCache::open_default()?;
                let removed = cache.purge()?;
                println!("パージ完了: {removed} ファイル");
                Ok(0)
            }
        },
    }
}

/// 1 ファイルをビルドして実行する。
fn run_file(path: &Path, opts: &BuildOptions) -> Result<i32, Box<dyn std::error::Error>> {
    let cache = BuildCache::open_default()?;
    let compiled = build::compile_file(path, &cache, opts)?;
    if compiled.empty {
        return Ok(0);
    }
    Ok(build::run_binary(&compiled.binary)?)
}

/// インラインコードを一時ファイル経由で実行する。
fn run_inline_code(code: &str, opts: &BuildOptions) -> Result<i32, Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("inline.py");
    fs::write(&path, code)?;
    run_file(&path, opts)
}

/// 要求の入力元をまとめる。引数 → -r ファイル → requirements.txt の順。
fn gather_requirements(
    args: &[String],
    file: Option<&Path>,
) -> Result<Vec<Requirement>, Box<dyn std::error::Error>> {
    if !args.is_empty() {
        let mut out = Vec::new();
        for text in args {
            out.push(Requirement::parse(text)?);
        }
        return Ok(out);
    }
    if let Some(file) = file {
        return Ok(pkg::install::read_requirements_file(file)?);
    }
    let default = Path::new("requirements.txt");
    if default.exists() {
        return Ok(pkg::install::read_requirements_file(default)?);
    }
    Ok(Vec::new())
}

#[derive(Serialize)]
struct BuildJsonEntry {
    status: &'static str,
    input: String,
    output: String,
    from_cache: bool,
}

/// `--json` 向けのビルド結果ビュー。
fn print_build_json(summary: &build::BatchSummary) -> Result<(), Box<dyn std::error::Error>> {
    let mut entries = Vec::new();
    for compiled in &summary.compiled {
        entries.push(BuildJsonEntry {
            status: if compiled.empty { "empty" } else { "ok" },
            input: compiled.source.display().to_string(),
            output: compiled.binary.display().to_string(),
            from_cache: compiled.from_cache,
        });
    }
    for (path, err) in &summary.failures {
        entries.push(BuildJsonEntry {
            status: "error",
            input: path.display().to_string(),
            output: err.clone(),
            from_cache: false,
        });
    }
    println!("{}", serde_json::to_string(&entries)?);
    Ok(())
}
