// パス: src/emit/mod.rs
// 役割: コード生成共通のエラー型・オプション・サイドカー出力を束ねる
// 意図: バックエンド本体（zig.rs）から周辺関心事を分離する
// 関連ファイル: src/emit/zig.rs, src/build.rs, runtime_native/src/lib.rs

pub mod zig;

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use serde::Serialize;
use thiserror::Error;

use crate::infer::ModuleInfo;

/// エミッタの版タグ。出力形式が変わるたびに上げる。キャッシュキーの入力になる。
pub const EMITTER_VERSION: &str = "pylot-emit-3";

/// コード生成で発生しうるエラー種別。
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("未対応の構文です [{code}]: {message}")]
    Unsupported { code: &'static str, message: String },
    #[error("内部エラー [{code}]: {message}")]
    Internal { code: &'static str, message: String },
    #[error("外部コマンド実行に失敗しました: {command} (status: {status:?})")]
    CommandFailure {
        command: String,
        status: Option<ExitStatus>,
        stderr: String,
    },
}

impl EmitError {
    pub fn unsupported(code: &'static str, message: impl Into<String>) -> Self {
        Self::Unsupported {
            code,
            message: message.into(),
        }
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::Internal {
            code,
            message: message.into(),
        }
    }

    pub fn command_failure(
        command: impl Into<String>,
        status: Option<ExitStatus>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailure {
            command: command.into(),
            status,
            stderr: stderr.into(),
        }
    }
}

impl From<tempfile::PersistError> for EmitError {
    fn from(err: tempfile::PersistError) -> Self {
        EmitError::Io(err.error)
    }
}

/// コード生成の結果を表す型。
pub type EmitResult<T> = Result<T, EmitError>;

/// エミッタへ渡すオプション。
#[derive(Clone, Debug)]
pub struct EmitOptions {
    /// 生成行→原文行の対応サイドカーを書き出す（`--debug`）。
    pub debug: bool,
    /// ターゲットトリプル。キャッシュキーにも入る。
    pub target: String,
    /// 最適化フラグ文字列（そのまま外部ツールチェインへ渡す）。
    pub opt_flags: String,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            debug: false,
            target: "native".to_string(),
            opt_flags: "ReleaseSafe".to_string(),
        }
    }
}

/// 生成されたモジュール 1 つ分の成果物。
#[derive(Debug)]
pub struct EmittedModule {
    /// ターゲット言語（Zig）ソース本文。
    pub source: String,
    /// 生成行 → (原文ファイル, 原文行) の対応表。
    pub line_map: Vec<LineMapEntry>,
}

/// サイドカー 1 行分の対応。プロファイラが読む形式。
#[derive(Clone, Debug, Serialize)]
pub struct LineMapEntry {
    pub generated_line: usize,
    pub source_file: String,
    pub source_line: usize,
}

/// 推論済みモジュールからターゲットソースを生成する。
pub fn emit_module(info: &ModuleInfo, source_file: &str) -> EmitResult<EmittedModule> {
    zig::emit(info, source_file)
}

/// デバッグサイドカーのパス（生成ソースの隣に `.map.json`）。
pub fn sidecar_path(emitted_src: &Path) -> PathBuf {
    let mut p = emitted_src.as_os_str().to_owned();
    p.push(".map.json");
    PathBuf::from(p)
}

/// 行マップサイドカーを JSON で書き出す。
pub fn write_sidecar(emitted_src: &Path, entries: &[LineMapEntry]) -> EmitResult<()> {
    let path = sidecar_path(emitted_src);
    let body = serde_json::to_string_pretty(entries)
        .map_err(|e| EmitError::internal("EMIT090", format!("サイドカーの整形に失敗: {e}")))?;
    std::fs::write(&path, body)?;
    Ok(())
}
