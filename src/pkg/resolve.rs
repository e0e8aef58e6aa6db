// パス: src/pkg/resolve.rs
// 役割: 版制約のバックトラッキング解決器を実装する
// 意図: ルート要求からフラットなロック済み集合を決定的に導く
// 関連ファイル: src/pkg/index.rs, src/pkg/version.rs, tests/resolver.rs
//! 依存解決モジュール
//!
//! - 状態は `名前 → 版` の部分写像。各ステップで残り候補が最少の未割り当て
//!   要求を選ぶ（fail-first）。候補は新しい版から順に試す。
//! - 選んだ版の宣言依存をワークリストへ積んで再帰し、制約衝突で後戻りする。
//! - ループは「割り当て済みの名前には制約だけ足す」ことで自然に止まる。
//! - 凍結されたインデックスに対して決定的: 同じ入力は同じロック集合を生む。
//!   失敗時は衝突した要求の連鎖を表示する。

use std::collections::BTreeMap;

use tracing::debug;

use super::index::{PackageIndex, ReleaseInfo};
use super::version::{ConstraintSet, Version};
use super::{canonical_name, PkgError, Requirement, ResolvedPackage};

/// 制約 1 本と、その出所（ルートか、どのパッケージの依存か）。
#[derive(Clone, Debug)]
struct Tracked {
    constraints: ConstraintSet,
    provenance: String,
}

type ConstraintMap = BTreeMap<String, Vec<Tracked>>;
type Assignment = BTreeMap<String, (Version, ReleaseInfo)>;

/// ルート要求からロック済み集合を解決する。
pub fn resolve(
    roots: &[Requirement],
    index: &dyn PackageIndex,
) -> Result<Vec<ResolvedPackage>, PkgError> {
    let mut constraints: ConstraintMap = BTreeMap::new();
    for req in roots {
        if !marker_applies(req) {
            continue;
        }
        constraints.entry(req.name.clone()).or_default().push(Tracked {
            constraints: req.constraints.clone(),
            provenance: "ルート要求".to_string(),
        });
    }
    let assignment = solve(Assignment::new(), constraints, index)?;
    let mut locked: Vec<ResolvedPackage> = assignment
        .into_iter()
        .map(|(name, (version, info))| ResolvedPackage {
            canonical_name: name,
            version,
            wheel_url: info.wheel_url,
            sha256: info.sha256,
            dependencies: info.requires,
        })
        .collect();
    locked.sort_by(|a, b| a.canonical_name.cmp(&b.canonical_name));
    Ok(locked)
}

/// 再帰本体。状態のクローンを持ち込み、失敗したら捨てることで後戻りする。
fn solve(
    assignment: Assignment,
    constraints: ConstraintMap,
    index: &dyn PackageIndex,
) -> Result<Assignment, PkgError> {
    // 未割り当ての名前と、その残り候補を数える
    let mut best: Option<(String, Vec<Version>)> = None;
    for (name, tracked) in &constraints {
        if assignment.contains_key(name) {
            continue;
        }
        let candidates = candidates_for(name, tracked, index)?;
        if candidates.is_empty() {
            return Err(conflict_error(name, tracked));
        }
        let replace = match &best {
            None => true,
            Some((_, current)) => candidates.len() < current.len(),
        };
        if replace {
            best = Some((name.clone(), candidates));
        }
    }
    let Some((name, candidates)) = best else {
        // すべて割り当て済み
        return Ok(assignment);
    };

    let mut last_err: Option<PkgError> = None;
    for candidate in candidates {
        debug!(package = %name, version = %candidate, "候補を試行");
        let info = index.release(&name, &candidate.raw)?;
        let mut next_assignment = assignment.clone();
        next_assignment.insert(name.clone(), (candidate.clone(), info.clone()));
        let mut next_constraints = constraints.clone();
        let mut dep_conflict = None;
        for dep_text in &info.requires {
            let Ok(dep) = Requirement::parse(dep_text) else {
                // 解釈できない宣言依存は無視する（extras 用の行など）
                continue;
            };
            if !marker_applies(&dep) {
                continue;
            }
            let provenance = format!("{name}=={candidate} の依存");
            // 既に割り当て済みの名前は制約だけ検査する
            if let Some((assigned, _)) = next_assignment.get(&dep.name) {
                if !dep.constraints.matches(assigned)? {
                    let mut chain = format!(
                        "{} {} ({provenance}) が割り当て済みの {}=={assigned} と衝突します",
                        dep.name, dep.constraints, dep.name
                    );
                    // 既知の要求連鎖も添えて、どこから来た制約かを追えるようにする
                    if let Some(tracked) = constraints.get(&dep.name) {
                        for t in tracked {
                            chain.push_str(&format!(
                                "\n  {}{}（出所: {}）",
                                dep.name, t.constraints, t.provenance
                            ));
                        }
                    }
                    dep_conflict = Some(PkgError::Resolution { chain });
                    break;
                }
            }
            next_constraints
                .entry(dep.name.clone())
                .or_default()
                .push(Tracked {
                    constraints: dep.constraints.clone(),
                    provenance,
                });
        }
        if let Some(conflict) = dep_conflict {
            last_err = Some(conflict);
            continue;
        }
        match solve(next_assignment, next_constraints, index) {
            Ok(done) => return Ok(done),
            Err(e) => {
                // 後戻りして次の候補へ
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| PkgError::Resolution {
        chain: format!("{name} の候補をすべて使い切りました"),
    }))
}

/// 名前 1 つ分の残り候補（制約をすべて満たす版、新しい順）。
fn candidates_for(
    name: &str,
    tracked: &[Tracked],
    index: &dyn PackageIndex,
) -> Result<Vec<Version>, PkgError> {
    let mut versions: Vec<Version> = Vec::new();
    for text in index.releases(name)? {
        let Ok(version) = Version::parse(&text) else {
            continue;
        };
        let mut ok = true;
        for t in tracked {
            if !t.constraints.matches(&version)? {
                ok = false;
                break;
            }
        }
        // プレリリースは、制約側が明示的にプレリリース版へ触れた場合のみ候補になる
        if ok && version.is_prerelease() {
            ok = tracked.iter().any(|t| {
                t.constraints.constraints.iter().any(|c| {
                    Version::parse(&c.version_text)
                        .map(|v| v.is_prerelease())
                        .unwrap_or(false)
                })
            });
        }
        if ok {
            versions.push(version);
        }
    }
    versions.sort();
    versions.reverse();
    Ok(versions)
}

/// 衝突時のエラー: 要求の連鎖を人間が追える形で並べる。
fn conflict_error(name: &str, tracked: &[Tracked]) -> PkgError {
    let mut chain = format!("{name} を満たす版がありません:");
    for t in tracked {
        let text = if t.constraints.is_empty() {
            format!("\n  {name} (任意の版)（出所: {}）", t.provenance)
        } else {
            format!("\n  {name}{}（出所: {}）", t.constraints, t.provenance)
        };
        chain.push_str(&text);
    }
    PkgError::Resolution { chain }
}

/// 環境マーカーの保守的な評価。
/// extra 条件付きの依存は外し、それ以外のマーカーは成立扱いにする。
fn marker_applies(req: &Requirement) -> bool {
    match &req.marker {
        Some(marker) => !marker.contains("extra"),
        None => true,
    }
}

/// 便宜ヘルパ: 正準化した名前で要求を作る。
pub fn root_requirement(text: &str) -> Result<Requirement, PkgError> {
    let req = Requirement::parse(text)?;
    Ok(Requirement {
        name: canonical_name(&req.name),
        ..req
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::index::InMemoryIndex;

    /// 仕様のシード事例: `A>=1`, `B` と、`B==1.0 requires A<1.1` のインデックス。
    fn seed_index() -> InMemoryIndex {
        let mut index = InMemoryIndex::new();
        index.add("A", "1.0", &[]);
        index.add("A", "1.1", &[]);
        index.add("B", "1.0", &["A<1.1"]);
        index
    }

    #[test]
    /// 解決器が A==1.0, B==1.0 を選ぶことを確認する。
    fn seed_scenario_picks_compatible_pair() {
        let index = seed_index();
        let roots = vec![
            Requirement::parse("A>=1").expect("parse"),
            Requirement::parse("B").expect("parse"),
        ];
        let locked = resolve(&roots, &index).expect("resolve");
        let summary: Vec<String> = locked
            .iter()
            .map(|p| format!("{}=={}", p.canonical_name, p.version))
            .collect();
        assert_eq!(summary, vec!["a==1.0", "b==1.0"]);
    }

    #[test]
    /// 要求の順序を入れ替えても結果が変わらないことを確認する。
    fn resolution_is_order_independent() {
        let index = seed_index();
        let forward = resolve(
            &[
                Requirement::parse("A>=1").expect("parse"),
                Requirement::parse("B").expect("parse"),
            ],
            &index,
        )
        .expect("resolve");
        let backward = resolve(
            &[
                Requirement::parse("B").expect("parse"),
                Requirement::parse("A>=1").expect("parse"),
            ],
            &index,
        )
        .expect("resolve");
        assert_eq!(forward, backward);
    }

    #[test]
    /// 衝突時に要求の連鎖が報告されることを確認する。
    fn conflict_reports_requirement_chain() {
        let mut index = InMemoryIndex::new();
        index.add("A", "1.0", &[]);
        index.add("B", "1.0", &["A>=2"]);
        let err = resolve(
            &[
                Requirement::parse("A<2").expect("parse"),
                Requirement::parse("B").expect("parse"),
            ],
            &index,
        )
        .expect_err("conflict");
        let text = format!("{err}");
        assert!(text.contains("a"), "連鎖に衝突対象が含まれません: {text}");
    }
}
