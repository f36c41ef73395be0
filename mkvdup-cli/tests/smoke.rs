use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use predicates::prelude::*;
use std::path::Path;
use std::process::Command;

fn random_payload(rng: &mut fastrand::Rng, len: usize) -> Vec<u8> {
    // Never forms a start code.
    (0..len).map(|_| rng.u8(0x10..0xF0)).collect()
}

/// Writes a one-VOB DVD tree, a container reusing its frames, and the
/// packet list describing that container.
fn write_fixture(dir: &Path) {
    let mut rng = fastrand::Rng::with_seed(42);
    let frames: Vec<Vec<u8>> = (0..16)
        .map(|_| {
            let mut f = vec![0x00, 0x00, 0x01, 0x00];
            f.extend(random_payload(&mut rng, 2044));
            f
        })
        .collect();
    std::fs::create_dir_all(dir.join("disc/VIDEO_TS")).unwrap();
    std::fs::write(dir.join("disc/VIDEO_TS/VTS_01_1.VOB"), frames.concat()).unwrap();

    let mut mkv = random_payload(&mut rng, 300);
    let mut packets = Vec::new();
    for f in &frames {
        mkv.push(0x05);
        mkv.extend(random_payload(&mut rng, 6));
        mkv.push(0x05);
        packets.push(serde_json::json!({ "offset": mkv.len(), "size": f.len(), "track": 1 }));
        mkv.extend_from_slice(f);
    }
    mkv.extend(random_payload(&mut rng, 100));
    std::fs::write(dir.join("movie.mkv"), &mkv).unwrap();

    let list = serde_json::json!({
        "tracks": [{ "number": 1, "type": "video", "codec_id": "V_MPEG2" }],
        "packets": packets,
    });
    std::fs::write(dir.join("packets.json"), serde_json::to_vec(&list).unwrap()).unwrap();
}

fn mkvdup() -> Command {
    Command::cargo_bin("mkvdup").unwrap()
}

#[test]
fn create_info_check_extract() {
    let td = assert_fs::TempDir::new().unwrap();
    write_fixture(td.path());

    mkvdup()
        .current_dir(td.path())
        .args(["create", "movie.mkv", "disc", "--packets", "packets.json"])
        .args(["-o", "movie.mkvdup", "--workers", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("32768 of"));
    td.child("movie.mkvdup").assert(predicate::path::is_file());

    let out = mkvdup()
        .current_dir(td.path())
        .args(["info", "movie.mkvdup", "--json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let info: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(info["layout"], "Dvd");
    assert_eq!(info["matched_bytes"], 16 * 2048);
    assert_eq!(info["source_files"][0]["rel_path"], "VIDEO_TS/VTS_01_1.VOB");

    mkvdup()
        .current_dir(td.path())
        .args(["check", "movie.mkvdup", "--source", "disc", "--full"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("OK"));

    mkvdup()
        .current_dir(td.path())
        .args(["extract", "movie.mkvdup", "--source", "disc", "-o", "rebuilt.mkv"])
        .assert()
        .success();
    td.child("rebuilt.mkv").assert(predicate::path::eq_file(td.child("movie.mkv").path()));
}

#[test]
fn check_fails_after_source_changes() {
    let td = assert_fs::TempDir::new().unwrap();
    write_fixture(td.path());
    mkvdup()
        .current_dir(td.path())
        .args(["create", "movie.mkv", "disc", "--packets", "packets.json", "-o", "movie.mkvdup"])
        .assert()
        .success();

    let vob = td.child("disc/VIDEO_TS/VTS_01_1.VOB");
    let mut bytes = std::fs::read(vob.path()).unwrap();
    bytes[10] ^= 0xFF;
    vob.write_binary(&bytes).unwrap();

    // Sizes still agree; only the content check notices.
    mkvdup()
        .current_dir(td.path())
        .args(["check", "movie.mkvdup", "--source", "disc"])
        .assert()
        .success();
    mkvdup()
        .current_dir(td.path())
        .args(["check", "movie.mkvdup", "--source", "disc", "--full"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("source mismatch"));
}

#[test]
fn classify_and_bad_inputs() {
    let td = assert_fs::TempDir::new().unwrap();
    write_fixture(td.path());
    mkvdup()
        .current_dir(td.path())
        .args(["classify", "disc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dvd"));

    td.child("empty").create_dir_all().unwrap();
    mkvdup()
        .current_dir(td.path())
        .args(["classify", "empty"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no BDMV/STREAM"));

    td.child("junk.mkvdup").write_binary(&[0u8; 500]).unwrap();
    mkvdup()
        .current_dir(td.path())
        .args(["info", "junk.mkvdup"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("corrupt dedup artifact"));
}
