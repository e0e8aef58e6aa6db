// パス: tests/installer.rs
// 役割: wheel の展開・マニフェスト・アンインストールの往復を検証する
// 意図: インストール前後でディレクトリツリーが往復する法則を固定する
// 関連ファイル: src/pkg/install.rs, src/pkg/mod.rs

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use pylot::pkg::install::Installer;
use pylot::pkg::PkgError;
use tempfile::tempdir;
use zip::write::SimpleFileOptions;

/// テスト用の wheel（規定レイアウトの ZIP）をメモリ上で組み立てる。
fn make_wheel(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (path, body) in files {
            writer.start_file(*path, options).expect("start file");
            writer.write_all(body).expect("write body");
        }
        // wheel 側の dist-info（インストーラは自前で作り直す）
        writer
            .start_file("demo-1.0.dist-info/METADATA", options)
            .expect("start metadata");
        writer
            .write_all(b"Metadata-Version: 2.1\nName: demo\nVersion: 1.0\n")
            .expect("write metadata");
        writer.finish().expect("finish");
    }
    cursor.into_inner()
}

/// ディレクトリツリーのスナップショット（相対パス → 内容）。
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    for entry in walk(root) {
        let rel = entry
            .strip_prefix(root)
            .expect("prefix")
            .display()
            .to_string();
        out.insert(rel, fs::read(&entry).expect("read"));
    }
    out
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

#[test]
/// 展開された全ファイルがマニフェストに列挙されることをテストする。
fn install_writes_manifest_for_every_file() {
    let dir = tempdir().expect("tempdir");
    let installer = Installer::open(dir.path()).expect("open");
    let wheel = make_wheel(&[
        ("demo/__init__.py", b"x = 1\n"),
        ("demo/util.py", b"y = 2\n"),
        ("demo/sub/deep.py", b"z = 3\n"),
    ]);
    let info = installer
        .install_wheel_bytes("demo", "1.0", &[], &wheel)
        .expect("install");
    assert_eq!(info.name, "demo");
    assert!(dir.path().join("demo/__init__.py").exists());
    assert!(dir.path().join("demo/sub/deep.py").exists());
    let record = fs::read_to_string(dir.path().join("demo-1.0.dist-info/RECORD")).expect("record");
    assert_eq!(record.lines().count(), 3);
    for line in record.lines() {
        assert!(line.contains(",sha256="), "{line}");
        let size: u64 = line.rsplit(',').next().expect("size").parse().expect("数値");
        assert!(size > 0);
    }
}

#[test]
/// シードシナリオ 6: インストール前後でツリーが byte 単位で往復する。
fn install_then_uninstall_restores_tree() {
    let dir = tempdir().expect("tempdir");
    let installer = Installer::open(dir.path()).expect("open");
    // 既存の無関係なファイルを置いた状態から始める
    fs::write(dir.path().join("keep.txt"), b"keep me").expect("write");
    let before = snapshot(dir.path());
    let files: Vec<(String, Vec<u8>)> = (0..42)
        .map(|i| (format!("demo/f{i}.py"), format!("v = {i}\n").into_bytes()))
        .collect();
    let file_refs: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(p, b)| (p.as_str(), b.as_slice()))
        .collect();
    let wheel = make_wheel(&file_refs);
    installer
        .install_wheel_bytes("demo", "1.0", &[], &wheel)
        .expect("install");
    let removed = installer.uninstall("demo").expect("uninstall");
    assert_eq!(removed, 42);
    let after = snapshot(dir.path());
    assert_eq!(before, after, "ツリーが往復していません");
}

#[test]
/// マニフェストに載ったファイルの欠落が硬いエラーになることをテストする。
fn missing_manifest_entry_is_hard_error() {
    let dir = tempdir().expect("tempdir");
    let installer = Installer::open(dir.path()).expect("open");
    let wheel = make_wheel(&[("demo/__init__.py", b"x = 1\n"), ("demo/util.py", b"y\n")]);
    installer
        .install_wheel_bytes("demo", "1.0", &[], &wheel)
        .expect("install");
    fs::remove_file(dir.path().join("demo/util.py")).expect("remove");
    let err = installer.uninstall("demo").expect_err("欠落は失敗するはず");
    assert!(matches!(err, PkgError::ManifestEntryMissing(_)));
    // 何も消さずに戻る: もう片方のファイルは残っている
    assert!(dir.path().join("demo/__init__.py").exists());
}

#[test]
/// list / freeze / show がメタデータだけから答えることをテストする。
fn list_freeze_show_read_metadata() {
    let dir = tempdir().expect("tempdir");
    let installer = Installer::open(dir.path()).expect("open");
    let wheel = make_wheel(&[("demo/__init__.py", b"x = 1\n")]);
    installer
        .install_wheel_bytes("demo", "1.0", &["base>=1".to_string()], &wheel)
        .expect("install");
    // ペイロードを書き換えてもメタデータの答えは変わらない
    fs::write(dir.path().join("demo/__init__.py"), b"tampered").expect("tamper");
    let listed = installer.list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].version, "1.0");
    assert_eq!(installer.freeze().expect("freeze"), vec!["demo==1.0"]);
    let shown = installer.show("demo").expect("show");
    assert_eq!(shown.requires, vec!["base>=1"]);
}

#[test]
/// 未インストールのパッケージの操作が NotInstalled になることをテストする。
fn operations_on_missing_package_fail() {
    let dir = tempdir().expect("tempdir");
    let installer = Installer::open(dir.path()).expect("open");
    assert!(matches!(
        installer.uninstall("ghost"),
        Err(PkgError::NotInstalled(_))
    ));
    assert!(matches!(
        installer.show("ghost"),
        Err(PkgError::NotInstalled(_))
    ));
}

#[test]
/// 不正なパスを含む wheel が拒否され、巻き戻されることをテストする。
fn wheel_with_traversal_path_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let installer = Installer::open(dir.path()).expect("open");
    let wheel = make_wheel(&[("demo/ok.py", b"x = 1\n"), ("../escape.py", b"bad")]);
    let err = installer
        .install_wheel_bytes("demo", "1.0", &[], &wheel)
        .expect_err("拒否されるはず");
    assert!(matches!(err, PkgError::Wheel(_)));
    // 途中まで展開したファイルは巻き戻される
    assert!(!dir.path().join("demo/ok.py").exists());
    assert!(!dir.path().join("demo-1.0.dist-info").exists());
}
