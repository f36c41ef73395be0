use mkvdup_core::path_safety::{validate_path, PathPolicy};
use mkvdup_core::Error;
use std::path::Path;

#[test]
fn plain_relative_paths_resolve_under_root() {
    let root = Path::new("/media/disc");
    let rel = Path::new("BDMV/STREAM/00001.m2ts");
    let p = validate_path(root, rel, PathPolicy::default()).unwrap();
    assert_eq!(p, root.join("BDMV/STREAM/00001.m2ts"));
}

#[test]
fn traversal_absolute_and_empty_are_rejected() {
    let root = Path::new("/media/disc");
    for bad in ["../escape.vob", "VIDEO_TS/../../etc/passwd", "", "/etc/passwd"] {
        let res = validate_path(root, Path::new(bad), PathPolicy::default());
        assert!(matches!(res, Err(Error::UnsafePath(_))), "{bad:?} was accepted");
    }
}

#[cfg(unix)]
#[test]
fn symlink_components_follow_policy() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("root");
    let real = td.path().join("library").join("VIDEO_TS");
    std::fs::create_dir_all(&real).unwrap();
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(real.join("VTS_01_1.VOB"), b"vob").unwrap();
    std::os::unix::fs::symlink(&real, root.join("VIDEO_TS")).unwrap();

    let rel = Path::new("VIDEO_TS/VTS_01_1.VOB");
    let ok = validate_path(&root, rel, PathPolicy::default()).unwrap();
    assert_eq!(std::fs::read(ok).unwrap(), b"vob");

    let strict = PathPolicy { allow_symlinks: false };
    match validate_path(&root, rel, strict) {
        Err(Error::UnsafePath(msg)) => assert!(msg.contains("symlink"), "{msg}"),
        other => panic!("expected symlink rejection, got {other:?}"),
    }
}
