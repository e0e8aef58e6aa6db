// パス: tests/cache_build.rs
// 役割: ビルドキャッシュの増分性とオーケストレータの発見・集計を検証する
// 意図: ハッシュ照合だけが失効条件であることと原子的更新を固定する
// 関連ファイル: src/cache.rs, src/build.rs

mod test_support;

use std::fs;

use pylot::build::{self, BuildOptions};
use pylot::cache::{ArtifactKind, BuildCache, CacheKey};
use pylot::emit::EMITTER_VERSION;
use tempfile::tempdir;

#[test]
/// 同一入力のキーが安定で、1 バイトの変更だけが失効させることをテストする。
fn cache_key_is_content_addressed() {
    let base = CacheKey::compute(b"x = 1\n", "sig", EMITTER_VERSION, "native", "ReleaseSafe");
    let same = CacheKey::compute(b"x = 1\n", "sig", EMITTER_VERSION, "native", "ReleaseSafe");
    assert_eq!(base, same);
    let byte_changed = CacheKey::compute(b"x = 2\n", "sig", EMITTER_VERSION, "native", "ReleaseSafe");
    assert_ne!(base, byte_changed);
    // シグネチャ・ターゲット・最適化・エミッタ版もキー入力になる
    assert_ne!(
        base,
        CacheKey::compute(b"x = 1\n", "sig2", EMITTER_VERSION, "native", "ReleaseSafe")
    );
    assert_ne!(
        base,
        CacheKey::compute(b"x = 1\n", "sig", EMITTER_VERSION, "wasm32-wasi", "ReleaseSafe")
    );
    assert_ne!(
        base,
        CacheKey::compute(b"x = 1\n", "sig", EMITTER_VERSION, "native", "Debug")
    );
}

#[test]
/// 格納された成果物に必ずサイドカーが付くことをテストする。
fn every_artifact_has_matching_sidecar() {
    let dir = tempdir().expect("tempdir");
    let cache = BuildCache::open(dir.path()).expect("open");
    let key = CacheKey::compute(b"src", "", EMITTER_VERSION, "native", "O");
    let artifact = cache
        .store(&key, ArtifactKind::EmittedSource, b"body")
        .expect("store");
    let sidecar = dir.path().join(format!("{}.zig.hash", key.as_str()));
    assert!(artifact.exists());
    assert!(sidecar.exists());
    assert_eq!(
        fs::read_to_string(&sidecar).expect("read").trim(),
        key.as_str()
    );
}

#[test]
/// パージがエントリを消し、再格納で復活することをテストする。
fn purge_then_store_recovers() {
    let dir = tempdir().expect("tempdir");
    let cache = BuildCache::open(dir.path()).expect("open");
    let key = CacheKey::compute(b"src", "", EMITTER_VERSION, "native", "O");
    cache
        .store(&key, ArtifactKind::Binary, b"bin")
        .expect("store");
    assert!(cache.lookup(&key, ArtifactKind::Binary).is_some());
    let removed = cache.purge().expect("purge");
    assert!(removed >= 2, "成果物とサイドカーが消えるはず");
    assert!(cache.lookup(&key, ArtifactKind::Binary).is_none());
    cache
        .store(&key, ArtifactKind::Binary, b"bin")
        .expect("store again");
    assert!(cache.lookup(&key, ArtifactKind::Binary).is_some());
}

#[test]
/// 空ソースがゼロバイト成果物ではなく印をキャッシュすることをテストする。
fn empty_source_caches_marker() {
    let dir = tempdir().expect("tempdir");
    let cache = BuildCache::open(dir.path().join("cache")).expect("open");
    let src_path = dir.path().join("empty.py");
    fs::write(&src_path, "   \n\n").expect("write");
    let opts = BuildOptions::default();
    let first = build::compile_file(&src_path, &cache, &opts).expect("compile empty");
    assert!(first.empty);
    assert!(!first.from_cache);
    // 2 回目は印がヒットする
    let second = build::compile_file(&src_path, &cache, &opts).expect("compile empty again");
    assert!(second.empty);
    assert!(second.from_cache);
    // ゼロバイトのバイナリは存在しない
    let has_bin = fs::read_dir(cache.root())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().ends_with(".bin"));
    assert!(!has_bin);
}

#[test]
/// タイムスタンプだけの変更が再ビルドを起こさないことをテストする。
fn timestamp_touch_does_not_invalidate() {
    let dir = tempdir().expect("tempdir");
    let cache = BuildCache::open(dir.path().join("cache")).expect("open");
    let src_path = dir.path().join("empty.py");
    fs::write(&src_path, "").expect("write");
    let opts = BuildOptions::default();
    build::compile_file(&src_path, &cache, &opts).expect("compile");
    // 内容を変えずに書き直す（mtime 更新に相当）
    fs::write(&src_path, "").expect("rewrite");
    let again = build::compile_file(&src_path, &cache, &opts).expect("recompile");
    assert!(again.from_cache, "内容が同じならキャッシュが効く");
}

#[test]
/// ソース発見が .py だけを拾い、決定的な順序で返すことをテストする。
fn discover_sources_filters_and_sorts() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("b.py"), "x = 1\n").expect("write");
    fs::write(dir.path().join("a.py"), "x = 1\n").expect("write");
    fs::write(dir.path().join("note.txt"), "not source").expect("write");
    fs::create_dir(dir.path().join("sub")).expect("mkdir");
    fs::write(dir.path().join("sub/c.py"), "x = 1\n").expect("write");
    let sources = build::discover_sources(dir.path()).expect("discover");
    let names: Vec<String> = sources
        .iter()
        .map(|p| {
            p.strip_prefix(dir.path())
                .expect("prefix")
                .display()
                .to_string()
        })
        .collect();
    assert_eq!(names, vec!["a.py", "b.py", "sub/c.py"]);
}

#[test]
/// テスト発見が test_* だけを拾うことをテストする。
fn discover_tests_filters_prefix() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("test_a.py"), "x = 1\n").expect("write");
    fs::write(dir.path().join("helper.py"), "x = 1\n").expect("write");
    let tests = build::discover_tests(dir.path()).expect("discover");
    assert_eq!(tests.len(), 1);
    assert!(tests[0].ends_with("test_a.py"));
}

#[test]
/// 診断のあるファイルが失敗として集計され、他のファイルは続行されることをテストする。
fn batch_continues_past_failures() {
    let dir = tempdir().expect("tempdir");
    let cache = BuildCache::open(dir.path().join("cache")).expect("open");
    fs::write(dir.path().join("bad.py"), "def broken(:\n").expect("write");
    fs::write(dir.path().join("empty.py"), "").expect("write");
    let sources = build::discover_sources(dir.path()).expect("discover");
    let summary = build::build_batch(&sources, &cache, &BuildOptions::default());
    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].0.ends_with("bad.py"));
    // 構文エラーの診断が file:line:col 付きで残る
    assert!(summary.failures[0].1.contains("bad.py"));
    assert_eq!(summary.compiled.len(), 1);
}

#[test]
/// 壊れたサイドカーが致命傷ではなくミスとして扱われることをテストする。
fn corrupt_sidecar_is_recoverable_miss() {
    let dir = tempdir().expect("tempdir");
    let cache = BuildCache::open(dir.path()).expect("open");
    let key = CacheKey::compute(b"src", "", EMITTER_VERSION, "native", "O");
    cache
        .store(&key, ArtifactKind::Object, b"obj")
        .expect("store");
    let sidecar = dir.path().join(format!("{}.o.hash", key.as_str()));
    fs::write(&sidecar, "garbage").expect("corrupt");
    assert!(cache.lookup(&key, ArtifactKind::Object).is_none());
    // 再格納すれば回復する
    cache
        .store(&key, ArtifactKind::Object, b"obj")
        .expect("restore");
    assert!(cache.lookup(&key, ArtifactKind::Object).is_some());
}
