// パス: tests/resolver.rs
// 役割: バックトラッキング解決器の決定性と後戻りを検証する
// 意図: 凍結インデックスに対して同じ入力が同じロック集合を生むことを固定する
// 関連ファイル: src/pkg/resolve.rs, src/pkg/index.rs

use pylot::pkg::index::InMemoryIndex;
use pylot::pkg::resolve::resolve;
use pylot::pkg::Requirement;

fn req(text: &str) -> Requirement {
    Requirement::parse(text).expect("requirement parse")
}

fn lock_summary(locked: &[pylot::pkg::ResolvedPackage]) -> Vec<String> {
    locked
        .iter()
        .map(|p| format!("{}=={}", p.canonical_name, p.version))
        .collect()
}

#[test]
/// 最新版から順に試し、制約が無ければ最新が選ばれることをテストする。
fn newest_version_wins_without_constraints() {
    let mut index = InMemoryIndex::new();
    index.add("pkg", "1.0", &[]);
    index.add("pkg", "1.5", &[]);
    index.add("pkg", "1.10", &[]);
    let locked = resolve(&[req("pkg")], &index).expect("resolve");
    // 1.10 は 1.5 より新しい（数値比較であって辞書順ではない）
    assert_eq!(lock_summary(&locked), vec!["pkg==1.10"]);
}

#[test]
/// 候補の失敗で後戻りして古い版に落ち着くことをテストする。
fn backtracking_falls_back_to_older_candidate() {
    let mut index = InMemoryIndex::new();
    index.add("A", "1.0", &["C>=1"]);
    index.add("A", "2.0", &["C>=2"]);
    index.add("B", "1.0", &["C<2"]);
    index.add("C", "1.0", &[]);
    index.add("C", "2.0", &[]);
    let locked = resolve(&[req("A"), req("B")], &index).expect("resolve");
    let summary = lock_summary(&locked);
    // A==2.0 は C>=2 を要求し B の C<2 と衝突するため A==1.0 へ後戻りする
    assert_eq!(summary, vec!["a==1.0", "b==1.0", "c==1.0"]);
}

#[test]
/// 推移的依存がワークリストへ積まれることをテストする。
fn transitive_dependencies_are_pulled() {
    let mut index = InMemoryIndex::new();
    index.add("top", "1.0", &["mid>=1"]);
    index.add("mid", "1.0", &["leaf"]);
    index.add("leaf", "0.5", &[]);
    let locked = resolve(&[req("top")], &index).expect("resolve");
    assert_eq!(
        lock_summary(&locked),
        vec!["leaf==0.5", "mid==1.0", "top==1.0"]
    );
}

#[test]
/// 循環依存がスタック検出で停止し、両方が 1 度ずつ割り当てられることをテストする。
fn dependency_cycles_terminate() {
    let mut index = InMemoryIndex::new();
    index.add("x", "1.0", &["y"]);
    index.add("y", "1.0", &["x"]);
    let locked = resolve(&[req("x")], &index).expect("resolve");
    assert_eq!(lock_summary(&locked), vec!["x==1.0", "y==1.0"]);
}

#[test]
/// プレリリースが明示要求なしでは選ばれないことをテストする。
fn prereleases_require_explicit_opt_in() {
    let mut index = InMemoryIndex::new();
    index.add("pkg", "1.0", &[]);
    index.add("pkg", "2.0a1", &[]);
    let locked = resolve(&[req("pkg")], &index).expect("resolve");
    assert_eq!(lock_summary(&locked), vec!["pkg==1.0"]);
    // 明示的にプレリリースへ触れた制約なら選べる
    let locked = resolve(&[req("pkg==2.0a1")], &index).expect("resolve pre");
    assert_eq!(lock_summary(&locked), vec!["pkg==2.0a1"]);
}

#[test]
/// 存在しないパッケージが NotFound で失敗することをテストする。
fn unknown_package_fails() {
    let index = InMemoryIndex::new();
    let err = resolve(&[req("ghost")], &index).expect_err("missing");
    assert!(format!("{err}").contains("ghost"));
}

#[test]
/// 失敗時のエラーに要求の連鎖（出所）が含まれることをテストする。
fn conflict_error_names_provenance() {
    let mut index = InMemoryIndex::new();
    index.add("A", "1.0", &[]);
    index.add("B", "1.0", &["A>=2"]);
    let err = resolve(&[req("A<2"), req("B")], &index).expect_err("conflict");
    let text = format!("{err}");
    assert!(text.contains("b==1.0"), "依存元が表示される: {text}");
    assert!(text.contains("ルート要求"), "ルート由来も表示される: {text}");
}

#[test]
/// extra マーカー付きの宣言依存が既定では外れることをテストする。
fn extra_gated_dependencies_are_skipped() {
    let mut index = InMemoryIndex::new();
    index.add("pkg", "1.0", &["optional ; extra == \"fast\"", "base"]);
    index.add("base", "1.0", &[]);
    let locked = resolve(&[req("pkg")], &index).expect("resolve");
    assert_eq!(lock_summary(&locked), vec!["base==1.0", "pkg==1.0"]);
}
