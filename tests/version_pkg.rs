// パス: tests/version_pkg.rs
// 役割: 版代数の境界挙動と要求解析を外側から検証する
// 意図: 公開仕様の順序規則と制約判定の境界表を固定する
// 関連ファイル: src/pkg/version.rs, src/pkg/mod.rs

use pylot::pkg::version::{Constraint, ConstraintSet, Version};
use pylot::pkg::Requirement;

fn v(text: &str) -> Version {
    Version::parse(text).expect("version parse")
}

#[test]
/// 表示が解析の正規形と往復することをテストする。
fn display_roundtrips_canonical_form() {
    for text in ["1.0", "2!1.0", "1.0a1", "1.0.post1", "1.0.dev2", "1.0+abc.2"] {
        let parsed = v(text);
        let redisplayed = v(&parsed.to_string());
        assert_eq!(parsed, redisplayed, "{text}");
    }
}

#[test]
/// 別表記のプレリリースが同値に正規化されることをテストする。
fn prerelease_spellings_normalize() {
    assert_eq!(v("1.0alpha1"), v("1.0a1"));
    assert_eq!(v("1.0-beta.2"), v("1.0b2"));
    assert_eq!(v("1.0pre1"), v("1.0rc1"));
    assert_eq!(v("1.0-rev3"), v("1.0.post3"));
}

#[test]
/// 順序の代表例: dev < alpha < beta < rc < release < post。
fn ordering_ladder() {
    let ladder = ["1.0.dev1", "1.0a1", "1.0b1", "1.0rc1", "1.0", "1.0.post1", "1.1"];
    for pair in ladder.windows(2) {
        assert!(v(pair[0]) < v(pair[1]), "{} < {}", pair[0], pair[1]);
    }
}

#[test]
/// 境界表: `~=1.2` は 1.2 と 1.9 に一致し 2.0 に一致しない。
fn compatible_release_boundary_table() {
    let c = Constraint::parse("~=1.2").expect("parse");
    assert!(c.matches(&v("1.2")).unwrap());
    assert!(c.matches(&v("1.9")).unwrap());
    assert!(!c.matches(&v("2.0")).unwrap());
    let c = Constraint::parse("~=1.2.3").expect("parse");
    for ok in ["1.2.3", "1.2.4", "1.2.99"] {
        assert!(c.matches(&v(ok)).unwrap(), "{ok}");
    }
    assert!(!c.matches(&v("1.3.0")).unwrap());
    assert!(!c.matches(&v("1.2.2")).unwrap());
}

#[test]
/// `==1.0` がローカルラベル付きに一致しないことをテストする。
fn equality_excludes_local_labels() {
    let eq = Constraint::parse("==1.0").expect("parse");
    assert!(eq.matches(&v("1.0.0")).unwrap(), "1.0 == 1.0.0");
    assert!(!eq.matches(&v("1.0+local")).unwrap());
    let strict = Constraint::parse("===1.0+local").expect("parse");
    assert!(strict.matches(&v("1.0+local")).unwrap());
}

#[test]
/// 不正な版と制約が解析エラーになることをテストする。
fn invalid_inputs_are_rejected() {
    assert!(Version::parse("").is_err());
    assert!(Version::parse("abc").is_err());
    assert!(Version::parse("1.0+").is_err());
    assert!(Constraint::parse("1.0").is_err(), "演算子がない");
    assert!(Constraint::parse(">=").is_err());
    assert!(Constraint::parse("~=1").is_err());
}

#[test]
/// 制約集合のカンマ区切り解析と表示をテストする。
fn constraint_set_parse_display() {
    let set = ConstraintSet::parse(">=1.2, <2.0").expect("parse");
    assert_eq!(set.constraints.len(), 2);
    assert_eq!(format!("{set}"), ">=1.2,<2.0");
}

#[test]
/// 要求行の全要素（名前正準化・制約・extras・マーカー）をテストする。
fn requirement_line_full_form() {
    let r = Requirement::parse("My_Package[fast]~=2.1 ; python_version >= \"3.9\"")
        .expect("parse");
    assert_eq!(r.name, "my-package");
    assert_eq!(r.extras, vec!["fast"]);
    assert_eq!(format!("{}", r.constraints), "~=2.1");
    assert!(r.marker.as_deref().unwrap_or("").contains("python_version"));
}
