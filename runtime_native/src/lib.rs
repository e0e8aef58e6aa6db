//! pylot native runtime crate
//!
//! この crate はネイティブバックエンドからリンクされる実行時機能を提供する。
//! 値・コンテナ・例外・多倍長整数・アリーナ・スケジューラ・ワーカープールを
//! 個別モジュールに分割し、生成コードが依存する extern "C" の面を明確化している。
//!
//! 面の概要:
//! - 値セル: 参照カウント付きボックスと小整数インターン表
//! - アリーナ: バンプポインタ確保とフェーズ間リセット
//! - スケジューラ: spawn / タイマー・fd 待ち / gather / キャンセル
//! - 準備通知: epoll / kqueue による fd 監視
//! - プール: ワークスティーリングの CPU ワーカー

#![allow(clippy::missing_safety_doc)]

mod arena;
mod bigint;
mod containers;
mod error;
mod pool;
mod readiness;
mod sched;
mod value;

pub use arena::*;
pub use bigint::*;
pub use containers::*;
pub use error::*;
pub use pool::*;
pub use readiness::*;
pub use sched::*;
pub use value::*;
