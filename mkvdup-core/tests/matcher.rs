mod common;

use common::{
    bluray_source, dvd_source, payload, track, video_es, ContainerBuilder, TsWriter, AC3_PID,
    VIDEO_PID,
};
use mkvdup_core::container::{Packet, PacketList, TrackType};
use mkvdup_core::entry::check_partition;
use mkvdup_core::matcher::{
    build_entries, match_bytes, merge_regions, CoverageBitmap, DeltaSpool, MatchedRegion,
    MatcherConfig,
};
use mkvdup_core::rangemap::RangeMap;
use mkvdup_core::source::{Indexer, IndexerConfig};
use mkvdup_core::Error;
use proptest::prelude::*;

fn region(mkv_start: u64, mkv_end: u64, file: u32, src_offset: u64) -> MatchedRegion {
    MatchedRegion { mkv_start, mkv_end, file, src_offset, is_video: false, substream: 0 }
}

#[test]
fn consistent_overlap_merges() {
    let a = region(0, 100, 0, 500);
    let b = region(80, 150, 0, 580);
    assert_eq!(merge_regions(vec![b, a]), vec![region(0, 150, 0, 500)]);
}

#[test]
fn inconsistent_overlap_clips_later_region() {
    let a = region(0, 100, 0, 500);
    let b = region(80, 150, 1, 10);
    assert_eq!(merge_regions(vec![a, b]), vec![a, region(100, 150, 1, 30)]);
}

#[test]
fn fully_shadowed_region_is_dropped() {
    let a = region(0, 100, 0, 500);
    let b = region(10, 90, 2, 0);
    assert_eq!(merge_regions(vec![b, a]), vec![a]);
}

#[test]
fn longer_region_wins_on_equal_start() {
    let short = region(0, 10, 1, 0);
    let long = region(0, 100, 0, 0);
    assert_eq!(merge_regions(vec![short, long]), vec![long]);
}

#[test]
fn adjacent_consistent_regions_coalesce() {
    let a = region(0, 50, 0, 1000);
    let b = region(50, 80, 0, 1050);
    let c = region(80, 90, 0, 7);
    assert_eq!(merge_regions(vec![c, b, a]), vec![region(0, 80, 0, 1000), c]);
}

#[test]
fn coverage_marks_only_contained_chunks() {
    let cov = CoverageBitmap::new(1 << 20);
    cov.mark(8192, 16384);
    assert!(cov.is_covered(8192, 12288));
    assert!(cov.is_covered(12288, 16384));
    assert!(!cov.is_covered(4096, 8192));
    assert!(!cov.is_covered(16384, 20480));
    assert!(!cov.is_covered(8000, 9000));

    let cov = CoverageBitmap::new(1 << 20);
    cov.mark(5000, 7000);
    assert_eq!(cov.covered_chunks(), 0);
    assert!(!cov.is_covered(5000, 7000));
}

#[test]
fn coverage_tail_chunk_counts_at_container_end() {
    let cov = CoverageBitmap::new(10_000);
    cov.mark(8192, 10_000);
    assert!(cov.is_covered(9000, 10_000));
    assert_eq!(cov.covered_chunks(), 1);
}

#[test]
fn single_modified_run_becomes_one_delta() {
    let td = tempfile::tempdir().unwrap();
    let mut rng = fastrand::Rng::with_seed(7);
    let mut src = payload(&mut rng, 1024);
    src[0..4].copy_from_slice(&[0x00, 0x00, 0x01, 0xB3]);
    src[600..604].copy_from_slice(&[0x00, 0x00, 0x01, 0x00]);
    let root = dvd_source(td.path(), &src);

    let mut mkv = src.clone();
    for b in &mut mkv[500..505] {
        *b += 1;
    }
    let list = PacketList {
        tracks: vec![track(1, TrackType::Video, "V_MPEG2")],
        packets: vec![Packet { offset: 0, size: 1024, track: 1, timestamp: 0, keyframe: true }],
    };
    let idx = Indexer::build(&root, &IndexerConfig::default(), &mut |_, _| {}).unwrap();
    let cfg = MatcherConfig { workers: 2, ..MatcherConfig::default() };
    let mut res = match_bytes(&mkv, &list, &idx, &cfg, None).unwrap();

    assert_eq!(res.unmatched_bytes(), 5);
    assert_eq!(res.matched_bytes(), 1019);
    let deltas: Vec<_> = res.entries.iter().filter(|e| e.is_delta()).collect();
    assert_eq!(deltas.len(), 1);
    assert_eq!((deltas[0].mkv_offset, deltas[0].length), (500, 5));
    assert_eq!(res.entries.len(), 3);
    let first = &res.entries[0];
    assert_eq!((first.mkv_offset, first.length, first.source), (0, 500, 1));
    assert_eq!((res.entries[2].mkv_offset, res.entries[2].source_offset), (505, 505));
    assert_eq!(res.delta.to_vec().unwrap(), mkv[500..505].to_vec());
    assert_eq!(res.original_checksum, xxhash_rust::xxh64::xxh64(&mkv, 0));
}

#[test]
fn unmatchable_container_is_all_delta() {
    let td = tempfile::tempdir().unwrap();
    let mut rng = fastrand::Rng::with_seed(11);
    let mut src = payload(&mut rng, 4096);
    src[0..3].copy_from_slice(&[0, 0, 1]);
    let root = dvd_source(td.path(), &src);

    let mut mkv = payload(&mut rng, 3000);
    mkv[100..103].copy_from_slice(&[0, 0, 1]);
    let list = PacketList {
        tracks: vec![
            track(1, TrackType::Video, "V_MPEG2"),
            track(2, TrackType::Subtitle, "S_TEXT/UTF8"),
        ],
        packets: vec![
            Packet { offset: 100, size: 2000, track: 1, timestamp: 0, keyframe: true },
            Packet { offset: 2100, size: 20, track: 2, timestamp: 0, keyframe: false },
        ],
    };
    let idx = Indexer::build(&root, &IndexerConfig::default(), &mut |_, _| {}).unwrap();
    let res = match_bytes(&mkv, &list, &idx, &MatcherConfig::default(), None).unwrap();
    assert_eq!(res.unmatched_bytes(), 3000);
    assert_eq!(res.entries.len(), 1);
    assert!(res.entries[0].is_delta());
}

#[test]
fn repeated_frames_use_locality_hint() {
    let td = tempfile::tempdir().unwrap();
    let mut rng = fastrand::Rng::with_seed(3);
    let frames = video_es(&mut rng, 40, 3000);
    let src: Vec<u8> = frames.concat();
    let root = dvd_source(td.path(), &src);

    let mut cb = ContainerBuilder::new(5, vec![track(1, TrackType::Video, "V_MPEG2")]);
    for f in &frames {
        cb.frame(1, f);
    }
    cb.trailer(64);
    let idx = Indexer::build(&root, &IndexerConfig::default(), &mut |_, _| {}).unwrap();
    let cfg = MatcherConfig { workers: 1, ..MatcherConfig::default() };
    let res = match_bytes(&cb.bytes, &cb.list, &idx, &cfg, None).unwrap();
    assert_eq!(res.matched_bytes(), (40 * 3000) as u64);
    assert_eq!(res.stats.packets_matched, 40);
    assert!(res.stats.phase1_accepts > 0);
    check_partition(&res.entries, cb.bytes.len() as u64).unwrap();
}

/// `base` with its first byte changed, so a match running into it stops there.
fn diverging(base: &[u8]) -> Vec<u8> {
    let mut v = base.to_vec();
    v[0] ^= 0x01;
    v
}

#[test]
fn es_windows_only_verify_against_their_own_stream_type() {
    let td = tempfile::tempdir().unwrap();
    let mut rng = fastrand::Rng::with_seed(17);
    let (x, w) = (payload(&mut rng, 200), payload(&mut rng, 200));
    let (y, v) = (payload(&mut rng, 300), payload(&mut rng, 300));
    let ac3_sync = [0x0B, 0x77];

    // Each video unit carries an AC-3 sync word right after its start code, so
    // its windows hash the same as the audio frame that shares its opening bytes.
    let video_a = [&[0x00, 0x00, 0x01][..], &ac3_sync, &x, &diverging(&y)].concat();
    let video_b = [&[0x00, 0x00, 0x01][..], &ac3_sync, &w, &v].concat();
    let audio_a = [&ac3_sync[..], &x, &y].concat();
    let audio_b = [&ac3_sync[..], &w, &diverging(&v)].concat();
    let mut ts = TsWriter::new();
    ts.tables(&[(0x02, VIDEO_PID), (0x81, AC3_PID)]);
    ts.pes(VIDEO_PID, 0xE0, &[], &video_a);
    ts.pes(VIDEO_PID, 0xE0, &[], &video_b);
    ts.pes(AC3_PID, 0xBD, &[], &audio_a);
    ts.pes(AC3_PID, 0xBD, &[], &audio_b);
    let root = bluray_source(td.path(), &ts.finish());

    // The video packet continues like the audio stream, the audio packet like the video stream.
    let mut cb = ContainerBuilder::new(
        18,
        vec![track(1, TrackType::Video, "V_MPEG2"), track(2, TrackType::Audio, "A_AC3")],
    );
    cb.frame(1, &[&[0x00, 0x00, 0x01][..], &ac3_sync, &x, &y].concat());
    cb.frame(2, &[&ac3_sync[..], &w, &v].concat());
    cb.trailer(40);

    let idx = Indexer::build(&root, &IndexerConfig::default(), &mut |_, _| {}).unwrap();
    assert!(idx.uses_es_offsets());
    let res = match_bytes(&cb.bytes, &cb.list, &idx, &MatcherConfig::default(), None).unwrap();
    // Start code, sync word and shared body only; the longer cross-type matches are refused.
    assert_eq!(res.matched_bytes(), 205 + 202);
    let (video_pkt, audio_pkt) = (cb.list.packets[0], cb.list.packets[1]);
    for e in res.entries.iter().filter(|e| !e.is_delta()) {
        if e.mkv_offset < video_pkt.end() {
            assert!(e.is_video);
            assert_eq!((e.mkv_offset, e.length), (video_pkt.offset, 205));
        } else {
            assert!(!e.is_video);
            assert_eq!((e.mkv_offset, e.length), (audio_pkt.offset, 202));
        }
    }
}

#[test]
fn source_read_failure_aborts_matching() {
    let td = tempfile::tempdir().unwrap();
    let mut rng = fastrand::Rng::with_seed(23);
    let frames = video_es(&mut rng, 4, 1500);
    let mut ts = TsWriter::new();
    ts.tables(&[(0x02, VIDEO_PID)]);
    for f in &frames {
        ts.pes(VIDEO_PID, 0xE0, &[], f);
    }
    let root = bluray_source(td.path(), &ts.finish());
    let mut cb = ContainerBuilder::new(24, vec![track(1, TrackType::Video, "V_MPEG2")]);
    for f in &frames {
        cb.frame(1, f);
    }

    let mut idx = Indexer::build(&root, &IndexerConfig::default(), &mut |_, _| {}).unwrap();
    // Point the video stream's ES bytes far past the end of the file.
    let video = &mut idx.range_maps.as_mut().unwrap()[0].streams[0];
    assert!(video.is_video);
    let mut moved = RangeMap::new();
    moved.push(1 << 40, video.ranges.es_len() as u32);
    video.ranges = moved;

    let got = match_bytes(&cb.bytes, &cb.list, &idx, &MatcherConfig::default(), None);
    assert!(matches!(got, Err(Error::CorruptFormat(_))));
}

#[test]
fn overflowing_packet_is_rejected() {
    let td = tempfile::tempdir().unwrap();
    let mut rng = fastrand::Rng::with_seed(29);
    let frames = video_es(&mut rng, 2, 500);
    let root = dvd_source(td.path(), &frames.concat());
    let idx = Indexer::build(&root, &IndexerConfig::default(), &mut |_, _| {}).unwrap();
    let list = PacketList {
        tracks: vec![track(1, TrackType::Video, "V_MPEG2")],
        packets: vec![Packet {
            offset: u64::MAX - 10,
            size: 100,
            track: 1,
            timestamp: 0,
            keyframe: false,
        }],
    };
    let got = match_bytes(&frames.concat(), &list, &idx, &MatcherConfig::default(), None);
    assert!(matches!(got, Err(Error::InvalidInput(_))));
}

fn arb_regions() -> impl Strategy<Value = Vec<MatchedRegion>> {
    prop::collection::vec((0u64..5_000, 1u64..800, 0u32..3, 0u64..10_000), 0..40)
        .prop_map(|v| v.into_iter().map(|(s, l, f, o)| region(s, s + l, f, o)).collect())
}

proptest! {
    #[test]
    fn merged_regions_are_disjoint_and_ordered(regions in arb_regions()) {
        let merged = merge_regions(regions.clone());
        for w in merged.windows(2) {
            prop_assert!(w[0].mkv_end <= w[1].mkv_start);
        }
        // Every merged byte lies inside some input region.
        for m in &merged {
            prop_assert!(!m.is_empty());
            let inside = |r: &MatchedRegion| r.mkv_start <= m.mkv_start && m.mkv_start < r.mkv_end;
            prop_assert!(regions.iter().any(inside));
        }
    }

    #[test]
    fn entries_partition_the_container(regions in arb_regions(), extra in 0u64..1000) {
        let merged = merge_regions(regions);
        let total = merged.last().map(|r| r.mkv_end).unwrap_or(0) + extra;
        let mkv: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let mut spool = DeltaSpool::new(1 << 10);
        let entries = build_entries(&merged, &mkv, &|_| None, &mut spool).unwrap();

        let delta_len = check_partition(&entries, total).unwrap();
        prop_assert_eq!(delta_len, spool.len());
        prop_assert_eq!(entries.iter().map(|e| e.length).sum::<u64>(), total);
        let gaps: Vec<u8> = entries
            .iter()
            .filter(|e| e.is_delta())
            .flat_map(|e| mkv[e.mkv_offset as usize..e.mkv_end() as usize].to_vec())
            .collect();
        prop_assert_eq!(spool.to_vec().unwrap(), gaps);
    }
}
